//! Uploads dirty local entities, parents before children.

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use cadence_common::{RecordId, RecordType, ZoneId};
use cadence_storage::{LocalEntity, LocalStore, RemoteError, RemoteStore};

use crate::applier::RecordApplier;
use crate::error::{Result, SyncError};
use crate::retry::RetryPolicy;

/// Counts from one upload run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadReport {
    /// Entities saved and confirmed.
    pub uploaded: usize,
    /// Entities replaced by the server copy after a conflict.
    pub conflicts_resolved: usize,
    /// Children held back because their parent has no remote record yet.
    pub skipped: usize,
    /// Entities whose save failed. They stay dirty.
    pub failed: usize,
}

enum EntityResult {
    Uploaded,
    ConflictResolved,
    Skipped,
    Failed(SyncError),
}

/// Pushes dirty entities to the remote store.
pub struct UploadPipeline {
    local: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteStore>,
    applier: Arc<RecordApplier>,
    retry: RetryPolicy,
    zone: ZoneId,
    concurrency: usize,
}

impl UploadPipeline {
    /// Create a pipeline writing new records into `zone`.
    pub fn new(
        local: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteStore>,
        applier: Arc<RecordApplier>,
        retry: RetryPolicy,
        zone: ZoneId,
    ) -> Self {
        Self {
            local,
            remote,
            applier,
            retry,
            zone,
            concurrency: 1,
        }
    }

    /// Number of saves in flight within one phase.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Upload every dirty activity, then every dirty session.
    ///
    /// A failed entity does not stop its siblings. After both phases the
    /// first failure, if any, is returned.
    pub async fn run(&self) -> Result<UploadReport> {
        let mut report = UploadReport::default();
        let mut first_error = None;

        for kind in RecordType::ALL {
            let dirty = self.local.fetch_dirty(kind)?;
            if dirty.is_empty() {
                continue;
            }
            debug!("Uploading {} dirty {} entities", dirty.len(), kind);

            let results: Vec<EntityResult> = stream::iter(dirty)
                .map(|entity| self.upload_one(entity))
                .buffer_unordered(self.concurrency)
                .collect()
                .await;

            for result in results {
                match result {
                    EntityResult::Uploaded => report.uploaded += 1,
                    EntityResult::ConflictResolved => report.conflicts_resolved += 1,
                    EntityResult::Skipped => report.skipped += 1,
                    EntityResult::Failed(err) => {
                        report.failed += 1;
                        first_error.get_or_insert(err);
                    }
                }
            }
        }

        info!(
            "Upload finished: {} uploaded, {} conflicts, {} skipped, {} failed",
            report.uploaded, report.conflicts_resolved, report.skipped, report.failed
        );

        match first_error {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }

    async fn upload_one(&self, entity: LocalEntity) -> EntityResult {
        let id = entity.id();

        let parent_ref = match self.parent_ref(&entity) {
            Ok(Some(parent_ref)) => Some(parent_ref),
            Ok(None) if entity.parent_id().is_some() => {
                debug!("Skipping {} {}: parent not uploaded yet", entity.kind(), id);
                return EntityResult::Skipped;
            }
            Ok(None) => None,
            Err(err) => return EntityResult::Failed(err),
        };

        let record_id = entity
            .remote_ref()
            .cloned()
            .unwrap_or_else(|| RecordId::for_entity(self.zone.clone(), entity.kind(), &id));
        let record = entity.to_record(record_id, parent_ref.as_ref());

        let saved = self
            .retry
            .execute(|| self.remote.save(record.clone()))
            .await;

        match saved {
            Ok(saved) => match self.applier.confirm_upload(&entity, &saved) {
                Ok(_) => EntityResult::Uploaded,
                Err(err) => EntityResult::Failed(err),
            },
            Err(RemoteError::Conflict(server)) => {
                info!(
                    "Conflict on {}, applying server copy {:?}",
                    server.record_id, server.change_tag
                );
                match self.applier.upsert(&server) {
                    Ok(_) => EntityResult::ConflictResolved,
                    Err(err) => {
                        warn!("Could not apply server copy of {}: {}", server.record_id, err);
                        EntityResult::Failed(err)
                    }
                }
            }
            Err(err) => {
                warn!("Upload of {} {} failed: {}", entity.kind(), id, err);
                EntityResult::Failed(err.into())
            }
        }
    }

    /// Remote record of the entity's parent. `None` for parents and for
    /// children whose parent has not been uploaded.
    fn parent_ref(&self, entity: &LocalEntity) -> Result<Option<RecordId>> {
        let Some(parent_id) = entity.parent_id() else {
            return Ok(None);
        };
        Ok(self
            .local
            .get(&parent_id)?
            .and_then(|parent| parent.remote_ref().cloned()))
    }
}
