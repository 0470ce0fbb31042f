//! Storage layer for Cadence.
//!
//! This module provides the two collaborators the sync engine works
//! between:
//! - the local store of domain entities (in-memory and SQLite backends)
//! - the remote record store (in-memory and directory backends)
//!
//! # Design Principles
//! - Trait seams: the engine only sees `LocalStore` and `RemoteStore`
//! - Local writes are synchronous and publish commit events
//! - Remote calls are async and report failures through `RemoteError`

pub mod dir_remote;
pub mod ledger;
pub mod local;
pub mod memory;
pub mod memory_remote;
pub mod model;
pub mod record;
pub mod remote;
pub mod sqlite;

pub use dir_remote::DirRemoteStore;
pub use ledger::ZoneLedger;
pub use local::{
    LocalStore, Mutation, MutationCallback, MutationEvent, MutationKind, SubscriptionId,
    WriteOrigin,
};
pub use memory::MemoryLocalStore;
pub use memory_remote::{MemoryRemoteStore, RemoteOp};
pub use model::{Activity, ActivityKind, LocalEntity, Session, SyncMeta};
pub use record::{fields, FieldValue, RemoteRecord};
pub use remote::{AccountStatus, RemoteError, RemoteStore, ZoneChanges};
pub use sqlite::SqliteLocalStore;
