//! Cadence Sync Engine
//!
//! This module keeps a local store of activities and sessions consistent with
//! a remote record store, including:
//! - Two-phase upload of dirty entities (parents, then children)
//! - Incremental fetch through per-zone change tokens, full fetch otherwise
//! - Server-wins conflict resolution
//! - Retry strategy with exponential backoff and per-call timeouts
//! - Change tracking and background scheduling

pub mod applier;
pub mod delta;
pub mod engine;
pub mod error;
pub mod full;
pub mod locks;
pub mod retry;
pub mod scheduler;
pub mod state;
pub mod token;
pub mod tracker;
pub mod upload;

// Re-export main types
pub use applier::{ApplyOutcome, ConfirmOutcome, RecordApplier};
pub use delta::{DeltaFetcher, DeltaOutcome};
pub use engine::{AttemptOutcome, SyncConfig, SyncEngine};
pub use error::{Result, SyncError};
pub use full::{FullFetchReport, FullFetcher};
pub use locks::EntityLocks;
pub use retry::{RetryConfig, RetryPolicy, Retryable};
pub use scheduler::SyncTrigger;
pub use state::{AttemptReport, SyncSnapshot, SyncStatus, ZoneFetch};
pub use token::{FileTokenStore, MemoryTokenStore, TokenStore};
pub use tracker::ChangeTracker;
pub use upload::{UploadPipeline, UploadReport};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_exports() {
        let _config = SyncConfig::default();
        let _retry = RetryPolicy::default();
        let _snapshot = SyncSnapshot::new();
        let _locks = EntityLocks::new();
    }
}
