//! In-memory remote store for testing.
//!
//! Behaves like a real record service (change tags, conflicts, change
//! tokens) and lets tests inject failures, simulate other devices and
//! inspect how often each operation was called.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use cadence_common::{ChangeToken, RecordId, RecordType, ZoneId};

use crate::ledger::ZoneLedger;
use crate::record::RemoteRecord;
use crate::remote::{AccountStatus, RemoteError, RemoteStore, ZoneChanges};

/// Remote operations, for failure injection and call counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteOp {
    AccountStatus,
    EnsureZone,
    Save,
    QueryAll,
    FetchZoneChanges,
    CurrentToken,
}

#[derive(Debug, Clone)]
struct FailurePlan {
    error: RemoteError,
    /// `None` fails forever.
    remaining: Option<usize>,
}

#[derive(Default)]
struct Settings {
    page_size: Option<usize>,
    latency: Option<Duration>,
    assigned_name_prefix: Option<String>,
    baseline_tokens: bool,
}

/// In-memory remote store.
pub struct MemoryRemoteStore {
    zones: Mutex<HashMap<ZoneId, ZoneLedger>>,
    account: Mutex<AccountStatus>,
    failures: Mutex<HashMap<RemoteOp, FailurePlan>>,
    calls: Mutex<HashMap<RemoteOp, usize>>,
    assigned: Mutex<u64>,
    settings: Mutex<Settings>,
}

impl MemoryRemoteStore {
    /// Create an empty store with an available account.
    pub fn new() -> Self {
        Self {
            zones: Mutex::new(HashMap::new()),
            account: Mutex::new(AccountStatus::Available),
            failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            assigned: Mutex::new(0),
            settings: Mutex::new(Settings {
                baseline_tokens: true,
                ..Settings::default()
            }),
        }
    }

    /// Limit the number of changes returned per `fetch_zone_changes` page.
    pub fn with_page_size(self, page_size: usize) -> Self {
        self.settings.lock().page_size = Some(page_size);
        self
    }

    /// Delay every call by `latency`.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.settings.lock().latency = Some(latency);
        self
    }

    /// Let the server name new records `<prefix>1`, `<prefix>2`, ...
    /// instead of keeping the client-chosen name.
    pub fn with_server_assigned_names(self, prefix: impl Into<String>) -> Self {
        self.settings.lock().assigned_name_prefix = Some(prefix.into());
        self
    }

    /// Whether `current_token` hands out baseline cursors.
    pub fn with_baseline_tokens(self, enabled: bool) -> Self {
        self.settings.lock().baseline_tokens = enabled;
        self
    }

    pub fn set_account_status(&self, status: AccountStatus) {
        *self.account.lock() = status;
    }

    /// Fail the next `times` calls of `op` with `error`.
    pub fn fail_next(&self, op: RemoteOp, error: RemoteError, times: usize) {
        self.failures.lock().insert(
            op,
            FailurePlan {
                error,
                remaining: Some(times),
            },
        );
    }

    /// Fail every call of `op` with `error` until cleared.
    pub fn fail_always(&self, op: RemoteOp, error: RemoteError) {
        self.failures.lock().insert(
            op,
            FailurePlan {
                error,
                remaining: None,
            },
        );
    }

    pub fn clear_failures(&self) {
        self.failures.lock().clear();
    }

    /// Number of calls made to `op` so far.
    pub fn calls(&self, op: RemoteOp) -> usize {
        self.calls.lock().get(&op).copied().unwrap_or(0)
    }

    /// Total number of calls across all operations.
    pub fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }

    /// Write a record as another device would, ignoring change tags.
    /// Creates the zone if needed.
    pub fn server_put(&self, record: RemoteRecord) -> RemoteRecord {
        let zone = record.record_id.zone.clone();
        self.zones
            .lock()
            .entry(zone.clone())
            .or_insert_with(|| ZoneLedger::new(zone))
            .put(record)
    }

    /// Delete a record as another device would.
    pub fn server_delete(&self, record_id: &RecordId) -> bool {
        self.zones
            .lock()
            .get_mut(&record_id.zone)
            .map(|ledger| ledger.delete(&record_id.name))
            .unwrap_or(false)
    }

    /// Current server copy of a record.
    pub fn record(&self, record_id: &RecordId) -> Option<RemoteRecord> {
        self.zones
            .lock()
            .get(&record_id.zone)
            .and_then(|ledger| ledger.get(&record_id.name).cloned())
    }

    /// Number of records in a zone.
    pub fn record_count(&self, zone: &ZoneId) -> usize {
        self.zones
            .lock()
            .get(zone)
            .map(|ledger| RecordType::ALL.iter().map(|t| ledger.query(*t).len()).sum())
            .unwrap_or(0)
    }

    /// Invalidate every change token issued for a zone.
    pub fn expire_tokens(&self, zone: &ZoneId) {
        if let Some(ledger) = self.zones.lock().get_mut(zone) {
            ledger.expire_tokens();
        }
    }

    pub fn zone_exists(&self, zone: &ZoneId) -> bool {
        self.zones.lock().contains_key(zone)
    }

    /// Count the call, apply latency and any injected failure.
    async fn enter(&self, op: RemoteOp) -> Result<(), RemoteError> {
        *self.calls.lock().entry(op).or_insert(0) += 1;

        let latency = self.settings.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut failures = self.failures.lock();
        if let Some(plan) = failures.get_mut(&op) {
            let error = plan.error.clone();
            match plan.remaining {
                Some(0) => {
                    failures.remove(&op);
                }
                Some(ref mut n) => {
                    *n -= 1;
                    if *n == 0 {
                        failures.remove(&op);
                    }
                    debug!("Injected failure for {:?}: {}", op, error);
                    return Err(error);
                }
                None => {
                    debug!("Injected failure for {:?}: {}", op, error);
                    return Err(error);
                }
            }
        }
        Ok(())
    }

    fn with_zone<T>(
        &self,
        zone: &ZoneId,
        f: impl FnOnce(&mut ZoneLedger) -> Result<T, RemoteError>,
    ) -> Result<T, RemoteError> {
        let mut zones = self.zones.lock();
        let ledger = zones
            .get_mut(zone)
            .ok_or_else(|| RemoteError::ZoneNotFound(zone.clone()))?;
        f(ledger)
    }
}

impl Default for MemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn account_status(&self) -> Result<AccountStatus, RemoteError> {
        self.enter(RemoteOp::AccountStatus).await?;
        Ok(*self.account.lock())
    }

    async fn ensure_zone(&self, zone: &ZoneId) -> Result<(), RemoteError> {
        self.enter(RemoteOp::EnsureZone).await?;
        self.zones
            .lock()
            .entry(zone.clone())
            .or_insert_with(|| ZoneLedger::new(zone.clone()));
        Ok(())
    }

    async fn save(&self, mut record: RemoteRecord) -> Result<RemoteRecord, RemoteError> {
        self.enter(RemoteOp::Save).await?;
        let prefix = self.settings.lock().assigned_name_prefix.clone();
        let zone = record.record_id.zone.clone();
        self.with_zone(&zone, |ledger| {
            if let Some(prefix) = prefix {
                if record.change_tag.is_none() && !ledger.contains(&record.record_id.name) {
                    let mut assigned = self.assigned.lock();
                    *assigned += 1;
                    record.record_id.name = format!("{}{}", prefix, *assigned);
                }
            }
            ledger.save(record)
        })
    }

    async fn query_all(
        &self,
        record_type: RecordType,
        zone: &ZoneId,
    ) -> Result<Vec<RemoteRecord>, RemoteError> {
        self.enter(RemoteOp::QueryAll).await?;
        self.with_zone(zone, |ledger| Ok(ledger.query(record_type)))
    }

    async fn fetch_zone_changes(
        &self,
        zone: &ZoneId,
        token: &ChangeToken,
    ) -> Result<ZoneChanges, RemoteError> {
        self.enter(RemoteOp::FetchZoneChanges).await?;
        let page_size = self.settings.lock().page_size;
        self.with_zone(zone, |ledger| ledger.changes_since(token, page_size))
    }

    async fn current_token(&self, zone: &ZoneId) -> Result<Option<ChangeToken>, RemoteError> {
        self.enter(RemoteOp::CurrentToken).await?;
        if !self.settings.lock().baseline_tokens {
            return Ok(None);
        }
        self.with_zone(zone, |ledger| Ok(Some(ledger.current_token())))
    }
}
