//! Local store abstraction and mutation notifications.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use cadence_common::{EntityId, RecordId, RecordType, Result};

use crate::model::LocalEntity;

/// Who performed a local write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOrigin {
    /// The presentation or business layer.
    Local,
    /// The sync engine's own bookkeeping and remote applies.
    Sync,
}

/// What happened to one entity in a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    Inserted,
    Updated,
    Deleted,
}

/// A single entity change inside a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    pub id: EntityId,
    pub kind: RecordType,
    pub change: MutationKind,
}

/// Notification delivered to subscribers after every commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationEvent {
    pub origin: WriteOrigin,
    pub mutations: Vec<Mutation>,
}

/// Callback invoked after each commit.
pub type MutationCallback = Arc<dyn Fn(&MutationEvent) + Send + Sync>;

/// Handle returned by `subscribe_to_mutations`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// The device-resident datastore of domain entities.
///
/// Implementations notify subscribers synchronously after a write has been
/// committed and without holding internal locks, so callbacks may write back
/// into the store.
pub trait LocalStore: Send + Sync {
    /// All dirty entities of one kind, oldest modification first.
    fn fetch_dirty(&self, kind: RecordType) -> Result<Vec<LocalEntity>>;

    /// All entities of one kind.
    fn all(&self, kind: RecordType) -> Result<Vec<LocalEntity>>;

    /// Look up an entity by local id.
    fn get(&self, id: &EntityId) -> Result<Option<LocalEntity>>;

    /// Look up the entity mirroring a remote record.
    fn find_by_remote_ref(&self, record_id: &RecordId) -> Result<Option<LocalEntity>>;

    /// Insert or replace an entity.
    ///
    /// # Postconditions
    /// - The entity is durable in the store
    /// - Subscribers receive one event with the given origin
    fn upsert(&self, entity: &LocalEntity, origin: WriteOrigin) -> Result<()>;

    /// Remove an entity entirely. Returns false when it did not exist.
    fn hard_delete(&self, id: &EntityId, origin: WriteOrigin) -> Result<bool>;

    /// Register a commit observer.
    fn subscribe_to_mutations(&self, callback: MutationCallback) -> SubscriptionId;

    /// Remove a commit observer. Unknown ids are ignored.
    fn unsubscribe(&self, id: SubscriptionId);
}

/// Subscriber list shared by the store implementations.
#[derive(Default)]
pub struct Subscribers {
    next_id: AtomicU64,
    callbacks: Mutex<Vec<(SubscriptionId, MutationCallback)>>,
}

impl Subscribers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, callback: MutationCallback) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.callbacks.lock().push((id, callback));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.callbacks.lock().retain(|(sub, _)| *sub != id);
    }

    /// Deliver an event to every subscriber.
    ///
    /// The list is snapshotted first so callbacks can subscribe, unsubscribe
    /// or write to the store.
    pub fn notify(&self, event: &MutationEvent) {
        let callbacks: Vec<MutationCallback> = self
            .callbacks
            .lock()
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for callback in callbacks {
            callback(event);
        }
    }

    /// Convenience for single-entity commits.
    pub fn notify_one(&self, origin: WriteOrigin, entity_kind: RecordType, id: EntityId, change: MutationKind) {
        self.notify(&MutationEvent {
            origin,
            mutations: vec![Mutation {
                id,
                kind: entity_kind,
                change,
            }],
        });
    }
}
