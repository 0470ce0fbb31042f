//! In-memory local store for testing.

use parking_lot::RwLock;
use std::collections::BTreeMap;

use cadence_common::{EntityId, RecordId, RecordType, Result};

use crate::local::{LocalStore, MutationCallback, MutationKind, Subscribers, SubscriptionId, WriteOrigin};
use crate::model::LocalEntity;

/// In-memory local store.
///
/// Useful for testing and development. All data is stored in memory
/// and lost on drop.
pub struct MemoryLocalStore {
    entities: RwLock<BTreeMap<EntityId, LocalEntity>>,
    subscribers: Subscribers,
}

impl MemoryLocalStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self {
            entities: RwLock::new(BTreeMap::new()),
            subscribers: Subscribers::new(),
        }
    }

    /// Number of stored entities of all kinds.
    pub fn len(&self) -> usize {
        self.entities.read().len()
    }

    /// Check if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entities.read().is_empty()
    }
}

impl Default for MemoryLocalStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalStore for MemoryLocalStore {
    fn fetch_dirty(&self, kind: RecordType) -> Result<Vec<LocalEntity>> {
        let mut dirty: Vec<LocalEntity> = self
            .entities
            .read()
            .values()
            .filter(|e| e.kind() == kind && e.is_dirty())
            .cloned()
            .collect();
        dirty.sort_by_key(|e| e.sync().last_modified_at);
        Ok(dirty)
    }

    fn all(&self, kind: RecordType) -> Result<Vec<LocalEntity>> {
        Ok(self
            .entities
            .read()
            .values()
            .filter(|e| e.kind() == kind)
            .cloned()
            .collect())
    }

    fn get(&self, id: &EntityId) -> Result<Option<LocalEntity>> {
        Ok(self.entities.read().get(id).cloned())
    }

    fn find_by_remote_ref(&self, record_id: &RecordId) -> Result<Option<LocalEntity>> {
        Ok(self
            .entities
            .read()
            .values()
            .find(|e| e.remote_ref() == Some(record_id))
            .cloned())
    }

    fn upsert(&self, entity: &LocalEntity, origin: WriteOrigin) -> Result<()> {
        let previous = self.entities.write().insert(entity.id(), entity.clone());
        let change = if previous.is_some() {
            MutationKind::Updated
        } else {
            MutationKind::Inserted
        };
        self.subscribers
            .notify_one(origin, entity.kind(), entity.id(), change);
        Ok(())
    }

    fn hard_delete(&self, id: &EntityId, origin: WriteOrigin) -> Result<bool> {
        let removed = self.entities.write().remove(id);
        match removed {
            Some(entity) => {
                self.subscribers
                    .notify_one(origin, entity.kind(), *id, MutationKind::Deleted);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn subscribe_to_mutations(&self, callback: MutationCallback) -> SubscriptionId {
        self.subscribers.subscribe(callback)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.unsubscribe(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::MutationEvent;
    use crate::model::{Activity, ActivityKind};
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn test_upsert_reports_insert_then_update() {
        let store = MemoryLocalStore::new();
        let events = Arc::new(Mutex::new(Vec::<MutationEvent>::new()));
        let events_clone = events.clone();
        store.subscribe_to_mutations(Arc::new(move |event| events_clone.lock().push(event.clone())));

        let activity = LocalEntity::from(Activity::new("Read", ActivityKind::Count, "#fff"));
        store.upsert(&activity, WriteOrigin::Local).unwrap();
        store.upsert(&activity, WriteOrigin::Sync).unwrap();

        let events = events.lock();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].mutations[0].change, MutationKind::Inserted);
        assert_eq!(events[1].mutations[0].change, MutationKind::Updated);
        assert_eq!(events[1].origin, WriteOrigin::Sync);
    }

    #[test]
    fn test_fetch_dirty_filters_kind_and_flag() {
        let store = MemoryLocalStore::new();
        let dirty = Activity::new("A", ActivityKind::Count, "#000");
        let mut clean = Activity::new("B", ActivityKind::Count, "#000");
        clean.sync.dirty = false;

        store.upsert(&dirty.clone().into(), WriteOrigin::Local).unwrap();
        store.upsert(&clean.into(), WriteOrigin::Local).unwrap();

        let found = store.fetch_dirty(RecordType::Activity).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id(), dirty.id);
        assert!(store.fetch_dirty(RecordType::Session).unwrap().is_empty());
    }

    #[test]
    fn test_hard_delete_missing_is_false() {
        let store = MemoryLocalStore::new();
        assert!(!store.hard_delete(&EntityId::new(), WriteOrigin::Sync).unwrap());
    }
}
