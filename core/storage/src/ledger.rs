//! Per-zone record ledger shared by the bundled remote stores.
//!
//! Every write bumps a zone-wide sequence number. Change tags and change
//! tokens are derived from that sequence; tokens additionally carry an epoch
//! so the whole zone history can be invalidated at once.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use cadence_common::{ChangeToken, RecordId, RecordType, ZoneId};

use crate::record::RemoteRecord;
use crate::remote::{RemoteError, ZoneChanges};

const TOKEN_LEN: usize = 16;

/// Deletions kept before the ledger starts a new token epoch.
pub const TOMBSTONE_LIMIT: usize = 4096;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRecord {
    seq: u64,
    record: RemoteRecord,
}

/// Records and change history of one zone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneLedger {
    zone: ZoneId,
    epoch: u64,
    seq: u64,
    records: BTreeMap<String, StoredRecord>,
    /// Record name to the sequence number of its deletion.
    tombstones: BTreeMap<String, u64>,
}

enum Change<'a> {
    Saved(&'a RemoteRecord),
    Deleted(&'a str),
}

impl ZoneLedger {
    /// Create an empty ledger for a zone.
    pub fn new(zone: ZoneId) -> Self {
        Self {
            zone,
            epoch: 0,
            seq: 0,
            records: BTreeMap::new(),
            tombstones: BTreeMap::new(),
        }
    }

    pub fn zone(&self) -> &ZoneId {
        &self.zone
    }

    fn encode_token(&self, seq: u64) -> ChangeToken {
        let mut bytes = Vec::with_capacity(TOKEN_LEN);
        bytes.extend_from_slice(&self.epoch.to_be_bytes());
        bytes.extend_from_slice(&seq.to_be_bytes());
        ChangeToken::new(bytes)
    }

    fn decode_token(&self, token: &ChangeToken) -> Result<u64, RemoteError> {
        let bytes = token.as_bytes();
        if bytes.len() != TOKEN_LEN {
            return Err(RemoteError::TokenExpired);
        }
        let mut epoch = [0u8; 8];
        let mut seq = [0u8; 8];
        epoch.copy_from_slice(&bytes[..8]);
        seq.copy_from_slice(&bytes[8..]);
        let (epoch, seq) = (u64::from_be_bytes(epoch), u64::from_be_bytes(seq));
        if epoch != self.epoch || seq > self.seq {
            return Err(RemoteError::TokenExpired);
        }
        Ok(seq)
    }

    fn check_zone(&self, record_id: &RecordId) -> Result<(), RemoteError> {
        if record_id.zone != self.zone {
            return Err(RemoteError::Fatal(format!(
                "Record {} does not belong to zone {}",
                record_id, self.zone
            )));
        }
        Ok(())
    }

    /// Save a record, rejecting stale revisions.
    ///
    /// A record is stale when it exists on the server with a different
    /// change tag than the one the client sent.
    pub fn save(&mut self, record: RemoteRecord) -> Result<RemoteRecord, RemoteError> {
        self.check_zone(&record.record_id)?;
        if let Some(existing) = self.records.get(&record.record_id.name) {
            if existing.record.change_tag != record.change_tag {
                return Err(RemoteError::Conflict(Box::new(existing.record.clone())));
            }
        }
        Ok(self.put(record))
    }

    /// Store a record unconditionally, as another writer would.
    pub fn put(&mut self, mut record: RemoteRecord) -> RemoteRecord {
        self.seq += 1;
        record.change_tag = Some(format!("{}-{}", self.epoch, self.seq));
        record.modified_at = Some(Utc::now());
        let name = record.record_id.name.clone();
        self.tombstones.remove(&name);
        self.records.insert(
            name,
            StoredRecord {
                seq: self.seq,
                record: record.clone(),
            },
        );
        record
    }

    /// Delete a record. Returns false when it did not exist.
    ///
    /// Past `TOMBSTONE_LIMIT` deletions the tokens expire and the tombstones
    /// are dropped; token holders fall back to a full fetch.
    pub fn delete(&mut self, name: &str) -> bool {
        if self.records.remove(name).is_none() {
            return false;
        }
        self.seq += 1;
        self.tombstones.insert(name.to_string(), self.seq);
        if self.tombstones.len() > TOMBSTONE_LIMIT {
            self.expire_tokens();
        }
        true
    }

    /// Get a record by name.
    pub fn get(&self, name: &str) -> Option<&RemoteRecord> {
        self.records.get(name).map(|s| &s.record)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.records.contains_key(name)
    }

    /// All records of one type.
    pub fn query(&self, record_type: RecordType) -> Vec<RemoteRecord> {
        self.records
            .values()
            .filter(|s| s.record.record_type == record_type)
            .map(|s| s.record.clone())
            .collect()
    }

    /// Token covering the current state.
    pub fn current_token(&self) -> ChangeToken {
        self.encode_token(self.seq)
    }

    /// Invalidate every token issued so far.
    ///
    /// Tombstones only serve tokens from earlier sequence numbers, so they
    /// are dropped with the old epoch.
    pub fn expire_tokens(&mut self) {
        self.epoch += 1;
        self.tombstones.clear();
    }

    /// Number of deletions still reported to change-token holders.
    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    /// Changes after `token`, oldest first, at most `limit` per page.
    pub fn changes_since(
        &self,
        token: &ChangeToken,
        limit: Option<usize>,
    ) -> Result<ZoneChanges, RemoteError> {
        let since = self.decode_token(token)?;

        let mut pending: Vec<(u64, Change<'_>)> = self
            .records
            .values()
            .filter(|s| s.seq > since)
            .map(|s| (s.seq, Change::Saved(&s.record)))
            .chain(
                self.tombstones
                    .iter()
                    .filter(|(_, seq)| **seq > since)
                    .map(|(name, seq)| (*seq, Change::Deleted(name.as_str()))),
            )
            .collect();
        pending.sort_by_key(|(seq, _)| *seq);

        let limit = limit.unwrap_or(usize::MAX).max(1);
        let more_coming = pending.len() > limit;
        pending.truncate(limit);

        let last_seq = if more_coming {
            pending.last().map(|(seq, _)| *seq).unwrap_or(since)
        } else {
            self.seq
        };

        let mut changes = ZoneChanges {
            changed: Vec::new(),
            deleted: Vec::new(),
            new_token: self.encode_token(last_seq),
            more_coming,
        };
        for (_, change) in pending {
            match change {
                Change::Saved(record) => changes.changed.push(record.clone()),
                Change::Deleted(name) => changes.deleted.push(RecordId {
                    zone: self.zone.clone(),
                    name: name.to_string(),
                }),
            }
        }
        Ok(changes)
    }
}
