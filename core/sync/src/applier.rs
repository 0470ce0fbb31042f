//! Applies remote records and upload confirmations to the local store.

use std::sync::Arc;
use tracing::{debug, warn};

use cadence_common::RecordId;
use cadence_storage::{LocalEntity, LocalStore, RemoteRecord, WriteOrigin};

use crate::error::{Result, SyncError};
use crate::locks::EntityLocks;

/// Effect of applying one remote record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// A new local entity was created.
    Created,
    /// An existing entity was overwritten.
    Updated,
    /// The local entity already matched the record.
    Unchanged,
}

/// Effect of confirming an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmOutcome {
    /// The entity is clean.
    Clean,
    /// The entity was edited while the upload was in flight and stays dirty.
    StillDirty,
    /// The entity no longer exists locally.
    Missing,
}

/// Single writer of sync-originated changes to local entities.
pub struct RecordApplier {
    local: Arc<dyn LocalStore>,
    locks: Arc<EntityLocks>,
}

impl RecordApplier {
    pub fn new(local: Arc<dyn LocalStore>, locks: Arc<EntityLocks>) -> Self {
        Self { local, locks }
    }

    /// Make the local store mirror a remote record. Server copy wins.
    ///
    /// Applying the same record twice leaves the same state as applying it
    /// once. A record without a server modification time keeps the local
    /// entity's `last_modified_at`.
    ///
    /// # Errors
    /// - `InvalidRecord` when the record cannot be mapped to an entity
    /// - `LocalStore` when the write fails
    pub fn upsert(&self, record: &RemoteRecord) -> Result<ApplyOutcome> {
        let mut incoming = LocalEntity::from_record(record)?;
        let id = incoming.id();

        self.locks.with_lock(id, || -> Result<ApplyOutcome> {
            let existing = self.local.get(&id)?;

            if let Some(existing) = &existing {
                if existing.kind() != incoming.kind() {
                    return Err(SyncError::InvalidRecord(format!(
                        "Record {} is a {} but local entity {} is a {}",
                        record.record_id,
                        incoming.kind(),
                        id,
                        existing.kind()
                    )));
                }
                if let Some(current_ref) = existing.remote_ref() {
                    if current_ref != &record.record_id {
                        warn!(
                            "Entity {} already maps to {}, keeping it over {}",
                            id, current_ref, record.record_id
                        );
                        incoming.sync_mut().remote_ref = Some(current_ref.clone());
                    }
                }
                if record.modified_at.is_none() {
                    incoming.sync_mut().last_modified_at = existing.sync().last_modified_at;
                }
                // Echo of the revision a pending local edit is based on.
                if existing.is_dirty()
                    && existing.sync().change_tag.is_some()
                    && existing.sync().change_tag == record.change_tag
                {
                    debug!("Keeping local edit of {} over echo of {}", id, record.record_id);
                    return Ok(ApplyOutcome::Unchanged);
                }
                if *existing == incoming {
                    return Ok(ApplyOutcome::Unchanged);
                }
            }

            self.local.upsert(&incoming, WriteOrigin::Sync)?;
            debug!("Applied {} to entity {}", record.record_id, id);
            Ok(if existing.is_some() {
                ApplyOutcome::Updated
            } else {
                ApplyOutcome::Created
            })
        })
    }

    /// Remove the entity mirroring a deleted remote record.
    ///
    /// Returns false when no local entity maps to the record.
    pub fn delete(&self, record_id: &RecordId) -> Result<bool> {
        let Some(entity) = self.local.find_by_remote_ref(record_id)? else {
            debug!("No local entity for deleted record {}", record_id);
            return Ok(false);
        };
        let id = entity.id();

        self.locks.with_lock(id, || -> Result<bool> {
            let removed = self.local.hard_delete(&id, WriteOrigin::Sync)?;
            if removed {
                debug!("Deleted entity {} for record {}", id, record_id);
            }
            Ok(removed)
        })
    }

    /// Record a successful save of `snapshot` as `saved`.
    ///
    /// Sets the remote reference if the entity has none, stores the new
    /// change tag and clears dirty unless the entity changed locally after
    /// `snapshot` was taken.
    pub fn confirm_upload(
        &self,
        snapshot: &LocalEntity,
        saved: &RemoteRecord,
    ) -> Result<ConfirmOutcome> {
        let id = snapshot.id();

        self.locks.with_lock(id, || -> Result<ConfirmOutcome> {
            let Some(mut current) = self.local.get(&id)? else {
                warn!("Entity {} disappeared during upload of {}", id, saved.record_id);
                return Ok(ConfirmOutcome::Missing);
            };

            let edited = current.sync().last_modified_at > snapshot.sync().last_modified_at;
            let meta = current.sync_mut();
            if meta.remote_ref.is_none() {
                meta.remote_ref = Some(saved.record_id.clone());
            }
            meta.change_tag = saved.change_tag.clone();
            meta.dirty = edited;

            self.local.upsert(&current, WriteOrigin::Sync)?;
            if edited {
                debug!("Entity {} changed during upload, keeping it dirty", id);
                Ok(ConfirmOutcome::StillDirty)
            } else {
                Ok(ConfirmOutcome::Clean)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_common::{RecordType, ZoneId};
    use cadence_storage::{fields, Activity, ActivityKind, FieldValue, MemoryLocalStore};
    use chrono::{Duration, Utc};

    fn applier() -> (Arc<MemoryLocalStore>, RecordApplier) {
        let local = Arc::new(MemoryLocalStore::new());
        let applier = RecordApplier::new(local.clone(), Arc::new(EntityLocks::new()));
        (local, applier)
    }

    fn server_copy(activity: &Activity, name: &str, tag: &str) -> RemoteRecord {
        let entity = LocalEntity::from(activity.clone());
        let mut record = entity.to_record(
            RecordId::new(ZoneId::default(), name).unwrap(),
            None,
        );
        record.change_tag = Some(tag.to_string());
        record.modified_at = Some(Utc::now());
        record
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let (local, applier) = applier();
        let activity = Activity::new("Stretch", ActivityKind::Check, "#aa00aa");
        let record = server_copy(&activity, "R1", "t1");

        assert_eq!(applier.upsert(&record).unwrap(), ApplyOutcome::Created);
        let first = local.get(&activity.id).unwrap().unwrap();
        assert_eq!(applier.upsert(&record).unwrap(), ApplyOutcome::Unchanged);
        let second = local.get(&activity.id).unwrap().unwrap();

        assert_eq!(first, second);
        assert!(!second.is_dirty());
        assert_eq!(second.remote_ref().unwrap().name, "R1");
        assert_eq!(local.len(), 1);
    }

    #[test]
    fn test_upsert_overwrites_local_edits() {
        let (local, applier) = applier();
        let mut activity = Activity::new("Local name", ActivityKind::Count, "#000000");
        local
            .upsert(&activity.clone().into(), WriteOrigin::Local)
            .unwrap();

        activity.name = "Server name".to_string();
        assert_eq!(
            applier.upsert(&server_copy(&activity, "R1", "t2")).unwrap(),
            ApplyOutcome::Updated
        );

        match local.get(&activity.id).unwrap().unwrap() {
            LocalEntity::Activity(a) => {
                assert_eq!(a.name, "Server name");
                assert!(!a.sync.dirty);
                assert_eq!(a.sync.change_tag.as_deref(), Some("t2"));
            }
            other => panic!("unexpected entity {:?}", other),
        }
    }

    #[test]
    fn test_upsert_keeps_existing_remote_ref() {
        let (local, applier) = applier();
        let activity = Activity::new("Walk", ActivityKind::Duration, "#123456");
        applier.upsert(&server_copy(&activity, "R1", "t1")).unwrap();
        applier.upsert(&server_copy(&activity, "R2", "t2")).unwrap();

        let entity = local.get(&activity.id).unwrap().unwrap();
        assert_eq!(entity.remote_ref().unwrap().name, "R1");
    }

    #[test]
    fn test_upsert_rejects_malformed_record() {
        let (local, applier) = applier();
        let record = RemoteRecord::new(
            RecordType::Activity,
            RecordId::new(ZoneId::default(), "R1").unwrap(),
        )
        .with_field(fields::NAME, FieldValue::String("no id".into()));

        assert!(matches!(applier.upsert(&record), Err(SyncError::InvalidRecord(_))));
        assert!(local.is_empty());
    }

    #[test]
    fn test_delete_unknown_record_is_noop() {
        let (_, applier) = applier();
        let id = RecordId::new(ZoneId::default(), "R9").unwrap();
        assert!(!applier.delete(&id).unwrap());
    }

    #[test]
    fn test_confirm_keeps_dirty_after_concurrent_edit() {
        let (local, applier) = applier();
        let activity = Activity::new("Yoga", ActivityKind::Duration, "#ffffff");
        let snapshot = LocalEntity::from(activity.clone());
        local.upsert(&snapshot, WriteOrigin::Local).unwrap();

        let mut edited = snapshot.clone();
        edited.sync_mut().last_modified_at = snapshot.sync().last_modified_at + Duration::seconds(1);
        local.upsert(&edited, WriteOrigin::Sync).unwrap();

        let saved = server_copy(&activity, "R1", "t1");
        assert_eq!(
            applier.confirm_upload(&snapshot, &saved).unwrap(),
            ConfirmOutcome::StillDirty
        );

        let entity = local.get(&activity.id).unwrap().unwrap();
        assert!(entity.is_dirty());
        assert_eq!(entity.remote_ref().unwrap().name, "R1");
        assert_eq!(entity.sync().change_tag.as_deref(), Some("t1"));
    }

    #[test]
    fn test_echo_of_base_revision_keeps_local_edit() {
        let (local, applier) = applier();
        let activity = Activity::new("Read", ActivityKind::Check, "#0f0f0f");
        let echo = server_copy(&activity, "R1", "t1");
        applier.upsert(&echo).unwrap();

        let mut edited = local.get(&activity.id).unwrap().unwrap();
        if let LocalEntity::Activity(a) = &mut edited {
            a.name = "Read more".to_string();
        }
        edited.sync_mut().dirty = true;
        local.upsert(&edited, WriteOrigin::Local).unwrap();

        assert_eq!(applier.upsert(&echo).unwrap(), ApplyOutcome::Unchanged);
        assert_eq!(local.get(&activity.id).unwrap().unwrap(), edited);

        let mut newer = echo.clone();
        newer.change_tag = Some("t2".to_string());
        assert_eq!(applier.upsert(&newer).unwrap(), ApplyOutcome::Updated);
        assert!(!local.get(&activity.id).unwrap().unwrap().is_dirty());
    }

    #[test]
    fn test_upsert_without_server_time_is_idempotent() {
        let (local, applier) = applier();
        let activity = Activity::new("Sketch", ActivityKind::Count, "#1a1a1a");
        let mut record = server_copy(&activity, "R1", "t1");
        record.modified_at = None;

        assert_eq!(applier.upsert(&record).unwrap(), ApplyOutcome::Created);
        let first = local.get(&activity.id).unwrap().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(applier.upsert(&record).unwrap(), ApplyOutcome::Unchanged);
        assert_eq!(local.get(&activity.id).unwrap().unwrap(), first);
    }
}
