//! Incremental fetch of zone changes since the stored change token.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use cadence_common::ZoneId;
use cadence_storage::{RemoteRecord, RemoteStore};

use crate::applier::RecordApplier;
use crate::error::{Result, SyncError};
use crate::retry::RetryPolicy;
use crate::token::TokenStore;

/// Result of a delta fetch for one zone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeltaOutcome {
    /// All pages were applied and the token advanced.
    Applied {
        changed: usize,
        deleted: usize,
        skipped: usize,
        pages: usize,
    },
    /// The token expired and was cleared. The zone needs a full fetch.
    NeedsFullFetch,
}

/// Apply one changed record, skipping records that cannot be mapped.
///
/// Returns whether the record was applied.
pub(crate) fn apply_or_skip(applier: &RecordApplier, record: &RemoteRecord) -> Result<bool> {
    match applier.upsert(record) {
        Ok(_) => Ok(true),
        Err(SyncError::InvalidRecord(reason)) => {
            warn!("Skipping record {}: {}", record.record_id, reason);
            Ok(false)
        }
        Err(err) => Err(err),
    }
}

/// Pulls changes since the last applied cursor.
pub struct DeltaFetcher {
    remote: Arc<dyn RemoteStore>,
    tokens: Arc<dyn TokenStore>,
    applier: Arc<RecordApplier>,
    retry: RetryPolicy,
}

impl DeltaFetcher {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        tokens: Arc<dyn TokenStore>,
        applier: Arc<RecordApplier>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            remote,
            tokens,
            applier,
            retry,
        }
    }

    /// Fetch and apply every change in `zone` since its stored token.
    ///
    /// The token is replaced only after a page has been fully applied, so
    /// an interrupted fetch resumes from the last complete page. An expired
    /// token is cleared and reported as `NeedsFullFetch`.
    ///
    /// # Errors
    /// - `MissingToken` when the zone has no stored token
    pub async fn run(&self, zone: &ZoneId) -> Result<DeltaOutcome> {
        match self.apply_pages(zone).await {
            Err(SyncError::TokenExpired(expired)) => {
                warn!("Change token for zone {} expired, full fetch next attempt", expired);
                self.tokens
                    .clear(&expired)
                    .await
                    .map_err(|e| SyncError::TokenStore(e.to_string()))?;
                Ok(DeltaOutcome::NeedsFullFetch)
            }
            other => other,
        }
    }

    async fn apply_pages(&self, zone: &ZoneId) -> Result<DeltaOutcome> {
        let mut token = self
            .tokens
            .get(zone)
            .await
            .map_err(|e| SyncError::TokenStore(e.to_string()))?
            .ok_or_else(|| SyncError::MissingToken(zone.clone()))?;

        let (mut changed, mut deleted, mut skipped, mut pages) = (0, 0, 0, 0);

        loop {
            let page = self
                .retry
                .execute(|| self.remote.fetch_zone_changes(zone, &token))
                .await
                .map_err(|e| SyncError::in_zone(e, zone))?;

            for record in &page.changed {
                if apply_or_skip(&self.applier, record)? {
                    changed += 1;
                } else {
                    skipped += 1;
                }
            }
            for record_id in &page.deleted {
                if self.applier.delete(record_id)? {
                    deleted += 1;
                }
            }

            if page.new_token != token {
                self.tokens
                    .set(zone, page.new_token.clone())
                    .await
                    .map_err(|e| SyncError::TokenStore(e.to_string()))?;
                token = page.new_token;
            }
            pages += 1;

            debug!(
                "Applied page {} of zone {} ({} changed, {} deleted)",
                pages,
                zone,
                page.changed.len(),
                page.deleted.len()
            );
            if !page.more_coming {
                break;
            }
        }

        info!(
            "Delta fetch of zone {}: {} changed, {} deleted, {} skipped",
            zone, changed, deleted, skipped
        );
        Ok(DeltaOutcome::Applied {
            changed,
            deleted,
            skipped,
            pages,
        })
    }
}
