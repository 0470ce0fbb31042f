//! Core sync engine that orchestrates all sync operations.

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use cadence_common::{ChangeToken, ZoneId};
use cadence_storage::{AccountStatus, LocalStore, RemoteStore};

use crate::applier::RecordApplier;
use crate::delta::DeltaFetcher;
use crate::error::{Result, SyncError};
use crate::full::FullFetcher;
use crate::locks::EntityLocks;
use crate::retry::{RetryConfig, RetryPolicy};
use crate::scheduler::{Scheduler, SyncTrigger};
use crate::state::{AttemptReport, SyncSnapshot, SyncStatus, ZoneFetch};
use crate::token::TokenStore;
use crate::tracker::ChangeTracker;
use crate::upload::UploadPipeline;

/// Configuration for the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Zones fetched on every attempt, in order.
    pub zones: Vec<ZoneId>,
    /// Zone new records are written to. Always fetched.
    pub default_zone: ZoneId,
    /// Retry behavior for remote calls.
    pub retry: RetryConfig,
    /// Limit for a single remote call. `None` waits indefinitely.
    pub call_timeout: Option<Duration>,
    /// Automatic sync interval. `None` disables the timer.
    pub auto_interval: Option<Duration>,
    /// Quiet period after a local change before syncing.
    pub debounce: Duration,
    /// Saves in flight within one upload phase.
    pub upload_concurrency: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            zones: Vec::new(),
            default_zone: ZoneId::default(),
            retry: RetryConfig::default(),
            call_timeout: Some(Duration::from_secs(30)),
            auto_interval: None,
            debounce: Duration::from_secs(2),
            upload_concurrency: 4,
        }
    }
}

impl SyncConfig {
    /// Also fetch `zone` on every attempt.
    pub fn with_zone(mut self, zone: ZoneId) -> Self {
        self.zones.push(zone);
        self
    }

    pub fn with_default_zone(mut self, zone: ZoneId) -> Self {
        self.default_zone = zone;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_auto_interval(mut self, interval: Option<Duration>) -> Self {
        self.auto_interval = interval;
        self
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn with_upload_concurrency(mut self, concurrency: usize) -> Self {
        self.upload_concurrency = concurrency.max(1);
        self
    }

    /// The default zone followed by the other configured zones, without
    /// duplicates.
    pub fn known_zones(&self) -> Vec<ZoneId> {
        let mut zones = vec![self.default_zone.clone()];
        for zone in &self.zones {
            if !zones.contains(zone) {
                zones.push(zone.clone());
            }
        }
        zones
    }
}

/// Result of calling `SyncEngine::start`.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    /// Another attempt was in flight. Nothing was done.
    AlreadyRunning,
    Completed(AttemptReport),
    Failed(SyncError),
}

impl AttemptOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, AttemptOutcome::Completed(_))
    }
}

/// Marks the attempt cancelled if its future is dropped mid-flight.
struct InFlight<'a> {
    state: &'a watch::Sender<SyncSnapshot>,
    finished: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.finished {
            warn!("Sync attempt dropped before finishing");
            self.state.send_modify(|s| s.fail(SyncError::Cancelled));
        }
    }
}

/// Main sync engine coordinating uploads and fetches for one local store.
///
/// At most one attempt runs at a time. Observers follow progress through
/// `subscribe`.
pub struct SyncEngine {
    config: SyncConfig,
    local: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteStore>,
    tokens: Arc<dyn TokenStore>,
    locks: Arc<EntityLocks>,
    retry: RetryPolicy,
    upload: UploadPipeline,
    delta: DeltaFetcher,
    full: FullFetcher,
    state: watch::Sender<SyncSnapshot>,
    ensured_zones: Mutex<HashSet<ZoneId>>,
    triggers: mpsc::UnboundedSender<SyncTrigger>,
    trigger_rx: Mutex<Option<mpsc::UnboundedReceiver<SyncTrigger>>>,
    interval: watch::Sender<Option<Duration>>,
    shutdown: watch::Sender<bool>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl SyncEngine {
    /// Create a new sync engine.
    pub fn new(
        local: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteStore>,
        tokens: Arc<dyn TokenStore>,
        config: SyncConfig,
    ) -> Arc<Self> {
        let locks = Arc::new(EntityLocks::new());
        let applier = Arc::new(RecordApplier::new(local.clone(), locks.clone()));
        let retry = RetryPolicy::new(config.retry.clone(), config.call_timeout);

        let upload = UploadPipeline::new(
            local.clone(),
            remote.clone(),
            applier.clone(),
            retry.clone(),
            config.default_zone.clone(),
        )
        .with_concurrency(config.upload_concurrency);
        let delta = DeltaFetcher::new(remote.clone(), tokens.clone(), applier.clone(), retry.clone());
        let full = FullFetcher::new(remote.clone(), applier, retry.clone());

        let (triggers, trigger_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(SyncSnapshot::new());
        let (interval, _) = watch::channel(config.auto_interval);
        let (shutdown, _) = watch::channel(false);

        Arc::new(Self {
            config,
            local,
            remote,
            tokens,
            locks,
            retry,
            upload,
            delta,
            full,
            state,
            ensured_zones: Mutex::new(HashSet::new()),
            triggers,
            trigger_rx: Mutex::new(Some(trigger_rx)),
            interval,
            shutdown,
            scheduler: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Lock table shared by every writer of sync bookkeeping.
    pub fn locks(&self) -> Arc<EntityLocks> {
        self.locks.clone()
    }

    /// Create and attach a change tracker wired to this engine's scheduler.
    ///
    /// Starts the scheduler if it is not running, so tracked local changes
    /// lead to a debounced attempt.
    pub fn change_tracker(self: &Arc<Self>) -> Arc<ChangeTracker> {
        self.spawn_scheduler();
        let tracker = Arc::new(
            ChangeTracker::new(self.local.clone(), self.locks.clone())
                .with_signal(self.triggers.clone()),
        );
        tracker.attach();
        tracker
    }

    /// Run one sync attempt.
    ///
    /// Returns `AlreadyRunning` without side effects when an attempt is in
    /// flight. Otherwise the status moves to `Syncing`, the last error is
    /// cleared and the attempt runs to `Completed` or `Failed`.
    pub async fn start(&self) -> AttemptOutcome {
        if !self.state.send_if_modified(SyncSnapshot::begin) {
            debug!("Sync already in progress");
            return AttemptOutcome::AlreadyRunning;
        }
        let mut guard = InFlight {
            state: &self.state,
            finished: false,
        };

        info!("Sync attempt started");
        let result = self.run_attempt().await;
        guard.finished = true;

        match result {
            Ok(report) => {
                info!(
                    "Sync completed: {} uploaded, {} conflicts, {} zones fetched",
                    report.upload.uploaded,
                    report.upload.conflicts_resolved,
                    report.zones.len()
                );
                self.state.send_modify(|s| s.complete(report.clone()));
                AttemptOutcome::Completed(report)
            }
            Err(err) => {
                error!("Sync failed: {}", err);
                self.state.send_modify(|s| s.fail(err.clone()));
                AttemptOutcome::Failed(err)
            }
        }
    }

    async fn run_attempt(&self) -> Result<AttemptReport> {
        let started_at = Utc::now();

        let account = self
            .retry
            .execute(|| self.remote.account_status())
            .await?;
        if account != AccountStatus::Available {
            warn!("Remote account unavailable: {:?}", account);
            return Err(SyncError::AccountUnavailable(account));
        }

        self.ensure_zones().await?;

        let upload = self.upload.run().await?;

        let mut zones = Vec::new();
        for zone in self.config.known_zones() {
            let fetch = self.fetch_zone(&zone).await?;
            zones.push((zone, fetch));
        }

        Ok(AttemptReport {
            upload,
            zones,
            started_at,
            finished_at: Utc::now(),
        })
    }

    /// Create each known zone once per engine lifetime.
    async fn ensure_zones(&self) -> Result<()> {
        for zone in self.config.known_zones() {
            if self.ensured_zones.lock().contains(&zone) {
                continue;
            }
            self.retry
                .execute(|| self.remote.ensure_zone(&zone))
                .await?;
            debug!("Ensured zone {}", zone);
            self.ensured_zones.lock().insert(zone);
        }
        Ok(())
    }

    async fn fetch_zone(&self, zone: &ZoneId) -> Result<ZoneFetch> {
        let token = self
            .tokens
            .get(zone)
            .await
            .map_err(|e| SyncError::TokenStore(e.to_string()))?;
        if token.is_some() {
            return Ok(ZoneFetch::Delta(self.delta.run(zone).await?));
        }

        // Taken before the query so changes racing the full fetch are
        // delivered again by the next delta fetch.
        let baseline = self.baseline_token(zone).await;
        let report = self.full.run(zone).await?;

        let stored = match baseline {
            Some(token) => {
                self.tokens
                    .set(zone, token)
                    .await
                    .map_err(|e| SyncError::TokenStore(e.to_string()))?;
                true
            }
            None => false,
        };
        Ok(ZoneFetch::Full {
            report,
            baseline: stored,
        })
    }

    async fn baseline_token(&self, zone: &ZoneId) -> Option<ChangeToken> {
        match self
            .retry
            .execute(|| self.remote.current_token(zone))
            .await
        {
            Ok(token) => token,
            Err(err) => {
                warn!("No baseline token for zone {}: {}", zone, err);
                None
            }
        }
    }

    pub fn status(&self) -> SyncStatus {
        self.state.borrow().status
    }

    pub fn last_error(&self) -> Option<SyncError> {
        self.state.borrow().last_error.clone()
    }

    pub fn last_synced_at(&self) -> Option<chrono::DateTime<Utc>> {
        self.state.borrow().last_synced_at
    }

    pub fn snapshot(&self) -> SyncSnapshot {
        self.state.borrow().clone()
    }

    /// Follow status changes.
    pub fn subscribe(&self) -> watch::Receiver<SyncSnapshot> {
        self.state.subscribe()
    }

    /// Sync every `interval`. Starts the scheduler if it is not running.
    pub fn enable_automatic(self: &Arc<Self>, interval: Duration) {
        info!("Automatic sync every {:?}", interval);
        self.interval.send_replace(Some(interval));
        self.spawn_scheduler();
    }

    /// Stop automatic sync. A running attempt is not interrupted.
    pub fn disable(&self) {
        info!("Automatic sync disabled");
        self.interval.send_replace(None);
    }

    /// Request an attempt because the remote account changed.
    ///
    /// Starts the scheduler if it is not running.
    pub fn notify_account_changed(self: &Arc<Self>) {
        self.spawn_scheduler();
        let _ = self.triggers.send(SyncTrigger::AccountChanged);
    }

    /// Start the background scheduler.
    ///
    /// Calling it again, or after `shutdown`, is a no-op. Must be called
    /// from within a Tokio runtime.
    pub fn spawn_scheduler(self: &Arc<Self>) {
        if tokio::runtime::Handle::try_current().is_err() {
            warn!("No Tokio runtime, sync scheduler not started");
            return;
        }
        let Some(trigger_rx) = self.trigger_rx.lock().take() else {
            return;
        };

        let scheduler = Scheduler::new(
            trigger_rx,
            self.interval.subscribe(),
            self.shutdown.subscribe(),
            self.config.debounce,
        );
        let engine = Arc::downgrade(self);
        let handle = tokio::spawn(scheduler.run(move |trigger| {
            let Some(engine) = engine.upgrade() else {
                return false;
            };
            debug!("Sync triggered by {:?}", trigger);
            tokio::spawn(async move {
                engine.start().await;
            });
            true
        }));
        *self.scheduler.lock() = Some(handle);
    }

    /// Stop the scheduler and wait for it to exit.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let handle = self.scheduler.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Scheduler task ended abnormally: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::MemoryTokenStore;
    use cadence_storage::{MemoryLocalStore, MemoryRemoteStore, RemoteOp};

    fn engine(remote: Arc<MemoryRemoteStore>, config: SyncConfig) -> Arc<SyncEngine> {
        SyncEngine::new(
            Arc::new(MemoryLocalStore::new()),
            remote,
            Arc::new(MemoryTokenStore::new()),
            config,
        )
    }

    #[test]
    fn test_known_zones_start_with_default() {
        let other = ZoneId::new("Other").unwrap();
        let config = SyncConfig::default()
            .with_zone(other.clone())
            .with_zone(ZoneId::default());
        assert_eq!(config.known_zones(), vec![ZoneId::default(), other]);
    }

    #[test]
    fn test_config_serialization() {
        let config = SyncConfig::default().with_auto_interval(Some(Duration::from_secs(300)));
        let json = serde_json::to_string(&config).unwrap();
        let restored: SyncConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, config);
    }

    #[tokio::test]
    async fn test_zones_ensured_once() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let engine = engine(remote.clone(), SyncConfig::default());

        assert!(engine.start().await.is_completed());
        assert!(engine.start().await.is_completed());
        assert_eq!(remote.calls(RemoteOp::EnsureZone), 1);
        assert_eq!(engine.status(), SyncStatus::Completed);
        assert!(engine.last_synced_at().is_some());
    }

    #[tokio::test]
    async fn test_dropped_attempt_is_marked_cancelled() {
        let remote = Arc::new(MemoryRemoteStore::new().with_latency(Duration::from_secs(60)));
        let engine = engine(remote, SyncConfig::default());

        let attempt = engine.start();
        let _ = tokio::time::timeout(Duration::from_millis(10), attempt).await;

        assert_eq!(engine.status(), SyncStatus::Failed);
        assert_eq!(engine.last_error(), Some(SyncError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_enable_automatic_runs_attempts() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let engine = engine(remote.clone(), SyncConfig::default());

        engine.enable_automatic(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(remote.calls(RemoteOp::AccountStatus) >= 2);
        assert_eq!(engine.status(), SyncStatus::Completed);

        engine.disable();
        engine.shutdown().await;
        let calls = remote.calls(RemoteOp::AccountStatus);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(remote.calls(RemoteOp::AccountStatus), calls);
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_tracker_alone_triggers_sync() {
        use cadence_storage::{Activity, ActivityKind, LocalEntity, WriteOrigin};

        let local = Arc::new(MemoryLocalStore::new());
        let remote = Arc::new(MemoryRemoteStore::new());
        let engine = SyncEngine::new(
            local.clone(),
            remote.clone(),
            Arc::new(MemoryTokenStore::new()),
            SyncConfig::default().with_debounce(Duration::from_millis(50)),
        );
        let _tracker = engine.change_tracker();

        let activity = Activity::new("Tracked", ActivityKind::Check, "#abcdef");
        local.upsert(&LocalEntity::from(activity.clone()), WriteOrigin::Local).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(remote.calls(RemoteOp::AccountStatus), 1);
        assert!(!local.get(&activity.id).unwrap().unwrap().is_dirty());
        engine.shutdown().await;
    }
}
