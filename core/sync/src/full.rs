//! Full re-read of a zone, used when no change token is stored.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use cadence_common::{RecordType, ZoneId};
use cadence_storage::RemoteStore;

use crate::applier::RecordApplier;
use crate::delta::apply_or_skip;
use crate::error::Result;
use crate::retry::RetryPolicy;

/// Counts from one full fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullFetchReport {
    pub applied: usize,
    pub skipped: usize,
}

/// Queries every record of every type in a zone and applies it.
///
/// Never reads or writes change tokens and never deletes local entities.
pub struct FullFetcher {
    remote: Arc<dyn RemoteStore>,
    applier: Arc<RecordApplier>,
    retry: RetryPolicy,
}

impl FullFetcher {
    pub fn new(remote: Arc<dyn RemoteStore>, applier: Arc<RecordApplier>, retry: RetryPolicy) -> Self {
        Self {
            remote,
            applier,
            retry,
        }
    }

    /// Apply all records of `zone`, parents first.
    pub async fn run(&self, zone: &ZoneId) -> Result<FullFetchReport> {
        let mut report = FullFetchReport::default();

        for record_type in RecordType::ALL {
            let records = self
                .retry
                .execute(|| self.remote.query_all(record_type, zone))
                .await?;
            for record in &records {
                if apply_or_skip(&self.applier, record)? {
                    report.applied += 1;
                } else {
                    report.skipped += 1;
                }
            }
        }

        info!(
            "Full fetch of zone {}: {} applied, {} skipped",
            zone, report.applied, report.skipped
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locks::EntityLocks;
    use cadence_common::RecordId;
    use cadence_storage::{
        fields, Activity, ActivityKind, LocalEntity, LocalStore, MemoryLocalStore,
        MemoryRemoteStore, Session, WriteOrigin,
    };
    use chrono::Utc;

    #[tokio::test]
    async fn test_full_fetch_applies_all_and_keeps_local_only() {
        let zone = ZoneId::default();
        let local = Arc::new(MemoryLocalStore::new());
        let remote = Arc::new(MemoryRemoteStore::new());
        remote.ensure_zone(&zone).await.unwrap();

        let activity = Activity::new("Draw", ActivityKind::Check, "#505050");
        let activity_ref = RecordId::for_entity(zone.clone(), RecordType::Activity, &activity.id);
        remote.server_put(LocalEntity::from(activity.clone()).to_record(activity_ref.clone(), None));
        let session = Session::new(activity.id, Utc::now(), 1.0, true);
        let session_ref = RecordId::for_entity(zone.clone(), RecordType::Session, &session.id);
        remote.server_put(
            LocalEntity::from(session.clone()).to_record(session_ref, Some(&activity_ref)),
        );

        let local_only = Activity::new("Offline", ActivityKind::Count, "#606060");
        local.upsert(&local_only.clone().into(), WriteOrigin::Local).unwrap();

        let applier = Arc::new(RecordApplier::new(local.clone(), Arc::new(EntityLocks::new())));
        let fetcher = FullFetcher::new(remote.clone(), applier, RetryPolicy::default());
        let report = fetcher.run(&zone).await.unwrap();

        assert_eq!(report.applied, 2);
        assert_eq!(local.len(), 3);
        assert!(local.get(&local_only.id).unwrap().unwrap().is_dirty());
        assert!(!local.get(&session.id).unwrap().unwrap().is_dirty());
    }

    #[tokio::test]
    async fn test_unparseable_records_skipped() {
        let zone = ZoneId::default();
        let local = Arc::new(MemoryLocalStore::new());
        let remote = Arc::new(MemoryRemoteStore::new());
        remote.ensure_zone(&zone).await.unwrap();

        let good = Activity::new("Good", ActivityKind::Check, "#707070");
        let good_ref = RecordId::for_entity(zone.clone(), RecordType::Activity, &good.id);
        remote.server_put(LocalEntity::from(good.clone()).to_record(good_ref, None));

        let weekly = Activity::new("Weekly", ActivityKind::Count, "#808080");
        let weekly_ref = RecordId::for_entity(zone.clone(), RecordType::Activity, &weekly.id);
        let mut record = LocalEntity::from(weekly).to_record(weekly_ref, None);
        record.set_string(fields::KIND, "weekly");
        remote.server_put(record);

        let applier = Arc::new(RecordApplier::new(local.clone(), Arc::new(EntityLocks::new())));
        let fetcher = FullFetcher::new(remote.clone(), applier, RetryPolicy::default());
        let report = fetcher.run(&zone).await.unwrap();

        assert_eq!(report, FullFetchReport { applied: 1, skipped: 1 });
        assert_eq!(local.len(), 1);
    }
}
