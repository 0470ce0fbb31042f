//! Engine status and attempt reports published to observers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cadence_common::ZoneId;

use crate::delta::DeltaOutcome;
use crate::error::SyncError;
use crate::full::FullFetchReport;
use crate::upload::UploadReport;

/// Lifecycle of the engine's sync attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncStatus {
    /// No attempt has run yet.
    Idle,
    /// An attempt is in flight.
    Syncing,
    /// The last attempt finished without an unhandled error.
    Completed,
    /// The last attempt failed. See `SyncSnapshot::last_error`.
    Failed,
}

/// What happened to one zone during the fetch step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ZoneFetch {
    /// Incremental fetch from the stored token.
    Delta(DeltaOutcome),
    /// Full fetch; `baseline` tells whether a token was stored afterwards.
    Full {
        report: FullFetchReport,
        baseline: bool,
    },
}

/// Summary of one successful attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptReport {
    pub upload: UploadReport,
    pub zones: Vec<(ZoneId, ZoneFetch)>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl AttemptReport {
    /// Zones whose token expired and will be fully fetched next time.
    pub fn zones_needing_full_fetch(&self) -> Vec<&ZoneId> {
        self.zones
            .iter()
            .filter(|(_, fetch)| matches!(fetch, ZoneFetch::Delta(DeltaOutcome::NeedsFullFetch)))
            .map(|(zone, _)| zone)
            .collect()
    }
}

/// Observable engine state.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncSnapshot {
    pub status: SyncStatus,
    pub last_error: Option<SyncError>,
    /// Finish time of the last completed attempt.
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_report: Option<AttemptReport>,
}

impl SyncSnapshot {
    pub fn new() -> Self {
        Self {
            status: SyncStatus::Idle,
            last_error: None,
            last_synced_at: None,
            last_report: None,
        }
    }

    /// Claim the snapshot for a new attempt.
    ///
    /// Returns false, leaving the snapshot untouched, when an attempt is
    /// already in flight.
    pub fn begin(&mut self) -> bool {
        if self.status == SyncStatus::Syncing {
            return false;
        }
        self.status = SyncStatus::Syncing;
        self.last_error = None;
        true
    }

    /// Mark the attempt as completed.
    pub fn complete(&mut self, report: AttemptReport) {
        self.status = SyncStatus::Completed;
        self.last_synced_at = Some(report.finished_at);
        self.last_report = Some(report);
    }

    /// Mark the attempt as failed.
    pub fn fail(&mut self, error: SyncError) {
        self.status = SyncStatus::Failed;
        self.last_error = Some(error);
    }

    pub fn is_syncing(&self) -> bool {
        self.status == SyncStatus::Syncing
    }
}

impl Default for SyncSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> AttemptReport {
        let now = Utc::now();
        AttemptReport {
            upload: UploadReport::default(),
            zones: vec![
                (ZoneId::default(), ZoneFetch::Delta(DeltaOutcome::NeedsFullFetch)),
                (
                    ZoneId::new("Other").unwrap(),
                    ZoneFetch::Full {
                        report: FullFetchReport::default(),
                        baseline: true,
                    },
                ),
            ],
            started_at: now,
            finished_at: now,
        }
    }

    #[test]
    fn test_begin_is_exclusive() {
        let mut snapshot = SyncSnapshot::new();
        snapshot.fail(SyncError::Timeout);

        assert!(snapshot.begin());
        assert!(snapshot.last_error.is_none());
        assert!(!snapshot.begin());
        assert!(snapshot.is_syncing());
    }

    #[test]
    fn test_complete_records_time() {
        let mut snapshot = SyncSnapshot::new();
        snapshot.begin();
        let report = report();
        let finished = report.finished_at;
        snapshot.complete(report);

        assert_eq!(snapshot.status, SyncStatus::Completed);
        assert_eq!(snapshot.last_synced_at, Some(finished));
        assert_eq!(
            snapshot.last_report.unwrap().zones_needing_full_fetch(),
            vec![&ZoneId::default()]
        );
    }
}
