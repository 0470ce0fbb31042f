//! Marks locally edited entities dirty.

use chrono::Utc;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use cadence_common::EntityId;
use cadence_storage::{
    LocalEntity, LocalStore, MutationEvent, MutationKind, SubscriptionId, WriteOrigin,
};

use crate::locks::EntityLocks;
use crate::scheduler::SyncTrigger;

/// Observes local commits and flags the changed entities for upload.
///
/// Only commits with `WriteOrigin::Local` are considered; the tracker writes
/// back with `WriteOrigin::Sync`, so it never reacts to its own updates or
/// to remote applies. Local hard deletes are not propagated.
pub struct ChangeTracker {
    local: Arc<dyn LocalStore>,
    locks: Arc<EntityLocks>,
    signal: Option<mpsc::UnboundedSender<SyncTrigger>>,
    subscription: Mutex<Option<SubscriptionId>>,
}

impl ChangeTracker {
    pub fn new(local: Arc<dyn LocalStore>, locks: Arc<EntityLocks>) -> Self {
        Self {
            local,
            locks,
            signal: None,
            subscription: Mutex::new(None),
        }
    }

    /// Send a `LocalChange` trigger after each handled commit.
    pub fn with_signal(mut self, signal: mpsc::UnboundedSender<SyncTrigger>) -> Self {
        self.signal = Some(signal);
        self
    }

    /// Subscribe to the local store. Attaching twice is a no-op.
    pub fn attach(self: &Arc<Self>) {
        let mut subscription = self.subscription.lock();
        if subscription.is_some() {
            return;
        }
        let tracker: Weak<Self> = Arc::downgrade(self);
        let id = self.local.subscribe_to_mutations(Arc::new(move |event| {
            if let Some(tracker) = tracker.upgrade() {
                tracker.handle(event);
            }
        }));
        *subscription = Some(id);
        debug!("Change tracker attached");
    }

    /// Stop observing the local store.
    pub fn detach(&self) {
        if let Some(id) = self.subscription.lock().take() {
            self.local.unsubscribe(id);
            debug!("Change tracker detached");
        }
    }

    pub fn is_attached(&self) -> bool {
        self.subscription.lock().is_some()
    }

    /// Apply a presentation-layer edit to an existing entity.
    ///
    /// The read, `f` and the write run under the entity's lock, so the edit
    /// cannot interleave with an upload confirmation or a remote apply. The
    /// entity is marked dirty and written with `WriteOrigin::Local`. Returns
    /// false when the entity does not exist.
    pub fn edit(
        &self,
        id: EntityId,
        f: impl FnOnce(&mut LocalEntity),
    ) -> cadence_common::Result<bool> {
        self.locks.with_lock(id, || -> cadence_common::Result<bool> {
            let Some(mut entity) = self.local.get(&id)? else {
                return Ok(false);
            };
            f(&mut entity);
            let meta = entity.sync_mut();
            meta.dirty = true;
            meta.last_modified_at = Utc::now();
            self.local.upsert(&entity, WriteOrigin::Local)?;
            Ok(true)
        })
    }

    /// Process one commit. Returns the number of entities marked dirty.
    pub fn handle(&self, event: &MutationEvent) -> usize {
        if event.origin == WriteOrigin::Sync {
            return 0;
        }

        let mut marked = 0;
        for mutation in &event.mutations {
            if mutation.change == MutationKind::Deleted {
                continue;
            }
            let result = self.locks.with_lock(mutation.id, || -> cadence_common::Result<bool> {
                let Some(mut entity) = self.local.get(&mutation.id)? else {
                    return Ok(false);
                };
                let meta = entity.sync_mut();
                meta.dirty = true;
                meta.last_modified_at = Utc::now();
                self.local.upsert(&entity, WriteOrigin::Sync)?;
                Ok(true)
            });

            match result {
                Ok(true) => marked += 1,
                Ok(false) => debug!("Entity {} vanished before it could be marked", mutation.id),
                Err(err) => warn!("Failed to mark entity {} dirty: {}", mutation.id, err),
            }
        }

        if marked > 0 {
            if let Some(signal) = &self.signal {
                // The receiver is gone once the scheduler stops.
                let _ = signal.send(SyncTrigger::LocalChange);
            }
        }
        marked
    }
}

impl Drop for ChangeTracker {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_common::RecordType;
    use cadence_storage::{Activity, ActivityKind, MemoryLocalStore};

    fn tracked() -> (
        Arc<MemoryLocalStore>,
        Arc<ChangeTracker>,
        mpsc::UnboundedReceiver<SyncTrigger>,
    ) {
        let local = Arc::new(MemoryLocalStore::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let tracker = Arc::new(
            ChangeTracker::new(local.clone(), Arc::new(EntityLocks::new())).with_signal(tx),
        );
        tracker.attach();
        (local, tracker, rx)
    }

    fn clean(activity: &Activity) -> LocalEntity {
        let mut entity = LocalEntity::from(activity.clone());
        entity.sync_mut().dirty = false;
        entity
    }

    #[test]
    fn test_local_edit_marks_dirty_and_signals() {
        let (local, _tracker, mut rx) = tracked();
        let activity = Activity::new("Run", ActivityKind::Duration, "#000");
        local.upsert(&clean(&activity), WriteOrigin::Sync).unwrap();
        assert!(local.fetch_dirty(RecordType::Activity).unwrap().is_empty());

        let before = local.get(&activity.id).unwrap().unwrap().sync().last_modified_at;
        local.upsert(&clean(&activity), WriteOrigin::Local).unwrap();

        let entity = local.get(&activity.id).unwrap().unwrap();
        assert!(entity.is_dirty());
        assert!(entity.sync().last_modified_at >= before);
        assert_eq!(rx.try_recv().unwrap(), SyncTrigger::LocalChange);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_sync_origin_writes_ignored() {
        let (local, _tracker, mut rx) = tracked();
        let activity = Activity::new("Swim", ActivityKind::Count, "#111");
        local.upsert(&clean(&activity), WriteOrigin::Sync).unwrap();

        assert!(!local.get(&activity.id).unwrap().unwrap().is_dirty());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_detach_stops_tracking() {
        let (local, tracker, _rx) = tracked();
        tracker.detach();
        assert!(!tracker.is_attached());

        let activity = Activity::new("Row", ActivityKind::Count, "#222");
        local.upsert(&clean(&activity), WriteOrigin::Local).unwrap();
        assert!(!local.get(&activity.id).unwrap().unwrap().is_dirty());
    }

    /// Local store that hands control to another thread right after the
    /// next armed read.
    struct InterleavingStore {
        inner: MemoryLocalStore,
        armed: std::sync::atomic::AtomicBool,
        interloper: Mutex<Option<Box<dyn FnOnce() + Send>>>,
        running: Mutex<Option<std::thread::JoinHandle<()>>>,
    }

    impl LocalStore for InterleavingStore {
        fn fetch_dirty(&self, kind: RecordType) -> cadence_common::Result<Vec<LocalEntity>> {
            self.inner.fetch_dirty(kind)
        }

        fn all(&self, kind: RecordType) -> cadence_common::Result<Vec<LocalEntity>> {
            self.inner.all(kind)
        }

        fn get(&self, id: &EntityId) -> cadence_common::Result<Option<LocalEntity>> {
            let entity = self.inner.get(id)?;
            if self.armed.swap(false, std::sync::atomic::Ordering::SeqCst) {
                if let Some(interloper) = self.interloper.lock().take() {
                    *self.running.lock() = Some(std::thread::spawn(interloper));
                    std::thread::sleep(std::time::Duration::from_millis(50));
                }
            }
            Ok(entity)
        }

        fn find_by_remote_ref(
            &self,
            record_id: &cadence_common::RecordId,
        ) -> cadence_common::Result<Option<LocalEntity>> {
            self.inner.find_by_remote_ref(record_id)
        }

        fn upsert(&self, entity: &LocalEntity, origin: WriteOrigin) -> cadence_common::Result<()> {
            self.inner.upsert(entity, origin)
        }

        fn hard_delete(&self, id: &EntityId, origin: WriteOrigin) -> cadence_common::Result<bool> {
            self.inner.hard_delete(id, origin)
        }

        fn subscribe_to_mutations(
            &self,
            callback: cadence_storage::MutationCallback,
        ) -> SubscriptionId {
            self.inner.subscribe_to_mutations(callback)
        }

        fn unsubscribe(&self, id: SubscriptionId) {
            self.inner.unsubscribe(id)
        }
    }

    #[test]
    fn test_edit_during_confirmation_is_kept() {
        use crate::applier::{ConfirmOutcome, RecordApplier};
        use cadence_common::{RecordId, ZoneId};

        let store = Arc::new(InterleavingStore {
            inner: MemoryLocalStore::new(),
            armed: std::sync::atomic::AtomicBool::new(false),
            interloper: Mutex::new(None),
            running: Mutex::new(None),
        });
        let locks = Arc::new(EntityLocks::new());
        let tracker = Arc::new(ChangeTracker::new(store.clone(), locks.clone()));
        tracker.attach();
        let applier = RecordApplier::new(store.clone(), locks);

        let activity = Activity::new("old", ActivityKind::Count, "#333");
        store.upsert(&activity.clone().into(), WriteOrigin::Local).unwrap();
        let snapshot = store.get(&activity.id).unwrap().unwrap();
        let mut saved = snapshot.to_record(
            RecordId::for_entity(ZoneId::default(), RecordType::Activity, &activity.id),
            None,
        );
        saved.change_tag = Some("t1".to_string());

        let editor = tracker.clone();
        let id = activity.id;
        *store.interloper.lock() = Some(Box::new(move || {
            let found = editor
                .edit(id, |entity| {
                    if let LocalEntity::Activity(a) = entity {
                        a.name = "user edit".to_string();
                    }
                })
                .unwrap();
            assert!(found);
        }));
        store.armed.store(true, std::sync::atomic::Ordering::SeqCst);

        assert_eq!(
            applier.confirm_upload(&snapshot, &saved).unwrap(),
            ConfirmOutcome::Clean
        );
        let running = store.running.lock().take().unwrap();
        running.join().unwrap();

        match store.get(&activity.id).unwrap().unwrap() {
            LocalEntity::Activity(a) => {
                assert_eq!(a.name, "user edit");
                assert!(a.sync.dirty);
                assert_eq!(a.sync.change_tag.as_deref(), Some("t1"));
                assert!(a.sync.remote_ref.is_some());
            }
            other => panic!("unexpected entity {:?}", other),
        }
    }

    #[test]
    fn test_edit_missing_entity() {
        let (_, tracker, mut rx) = tracked();
        assert!(!tracker.edit(EntityId::new(), |_| {}).unwrap());
        assert!(rx.try_recv().is_err());
    }
}
