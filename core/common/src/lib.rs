//! Common utilities and types shared across the Cadence crates.
//!
//! This module provides the identifier newtypes and the local persistence
//! error type used by the storage backends and the sync engine.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{ChangeToken, EntityId, RecordId, RecordType, ZoneId, DEFAULT_ZONE};
