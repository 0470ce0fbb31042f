//! Per-entity write serialization.

use parking_lot::{Mutex, ReentrantMutex};
use std::collections::HashMap;
use std::sync::Arc;

use cadence_common::EntityId;

/// Keyed lock table shared by every writer of sync bookkeeping.
///
/// Read-modify-write cycles on one entity run under its lock so a remote
/// apply, an upload confirmation and a local edit never interleave.
/// Locks are reentrant on the holding thread, since a locked local write
/// notifies the change tracker synchronously. Locks are never held across
/// an await point.
#[derive(Default)]
pub struct EntityLocks {
    slots: Mutex<HashMap<EntityId, Arc<ReentrantMutex<()>>>>,
}

impl EntityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` while holding the lock for `id`.
    pub fn with_lock<R>(&self, id: EntityId, f: impl FnOnce() -> R) -> R {
        let slot = self.slots.lock().entry(id).or_default().clone();
        let result = {
            let _guard = slot.lock();
            f()
        };

        // Drop the slot once nobody else holds or waits on it.
        let mut slots = self.slots.lock();
        if Arc::strong_count(&slot) == 2 {
            slots.remove(&id);
        }
        result
    }

    /// Number of entities with a live lock slot.
    pub fn active(&self) -> usize {
        self.slots.lock().len()
    }
}
