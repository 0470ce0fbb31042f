//! Remote record store trait definition.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use cadence_common::{ChangeToken, RecordId, RecordType, ZoneId};

use crate::record::RemoteRecord;

/// Availability of the remote account on this device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountStatus {
    /// Signed in and reachable.
    Available,
    /// No account configured.
    NoAccount,
    /// Access blocked by policy.
    Restricted,
    /// Account exists but cannot be used right now.
    TemporarilyUnavailable,
    /// The status could not be determined.
    Unknown,
}

/// Errors returned by a remote store.
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    /// The device has no usable network path.
    #[error("Network unavailable: {0}")]
    NetworkUnavailable(String),

    /// The service is reachable but refusing work.
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Another writer holds the zone.
    #[error("Zone busy: {0}")]
    ZoneBusy(String),

    /// The call did not complete in time.
    #[error("Request timed out")]
    Timeout,

    /// The record changed on the server since the client last observed it.
    /// Carries the server's current copy.
    #[error("Record changed on server: {}", .0.record_id)]
    Conflict(Box<RemoteRecord>),

    /// The change token is no longer valid for its zone.
    #[error("Change token expired")]
    TokenExpired,

    /// The zone does not exist.
    #[error("Zone not found: {0}")]
    ZoneNotFound(ZoneId),

    /// Any other non-retryable failure.
    #[error("Remote failure: {0}")]
    Fatal(String),
}

impl RemoteError {
    /// Whether repeating the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RemoteError::NetworkUnavailable(_)
                | RemoteError::ServiceUnavailable(_)
                | RemoteError::ZoneBusy(_)
                | RemoteError::Timeout
        )
    }
}

/// One page of changes for a zone since a change token.
#[derive(Debug, Clone)]
pub struct ZoneChanges {
    /// Records created or modified since the token.
    pub changed: Vec<RemoteRecord>,
    /// Records removed since the token.
    pub deleted: Vec<RecordId>,
    /// Cursor covering everything in this page.
    pub new_token: ChangeToken,
    /// More changes are available after `new_token`.
    pub more_coming: bool,
}

/// Remote, multi-device record store.
///
/// All calls may suspend. Implementations report conflicts, expired tokens
/// and transient failures through `RemoteError` and never retry internally.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Get the store name (e.g., "memory", "dir").
    fn name(&self) -> &str;

    /// Whether the remote account is usable.
    async fn account_status(&self) -> Result<AccountStatus, RemoteError>;

    /// Create a zone if it does not exist yet.
    ///
    /// # Postconditions
    /// - The zone exists; calling again is a no-op
    async fn ensure_zone(&self, zone: &ZoneId) -> Result<(), RemoteError>;

    /// Save a record.
    ///
    /// # Preconditions
    /// - `record.change_tag` is the last revision the client observed, or
    ///   `None` for a record it believes is new
    ///
    /// # Postconditions
    /// - Returns the stored record with a fresh change tag and server time
    ///
    /// # Errors
    /// - `Conflict` with the server copy when the revision does not match
    async fn save(&self, record: RemoteRecord) -> Result<RemoteRecord, RemoteError>;

    /// All records of one type in a zone.
    async fn query_all(
        &self,
        record_type: RecordType,
        zone: &ZoneId,
    ) -> Result<Vec<RemoteRecord>, RemoteError>;

    /// Changes in a zone since `token`.
    ///
    /// # Errors
    /// - `TokenExpired` when the token can no longer be honored
    async fn fetch_zone_changes(
        &self,
        zone: &ZoneId,
        token: &ChangeToken,
    ) -> Result<ZoneChanges, RemoteError>;

    /// Cursor for the zone's current state, if the store can supply one
    /// outside an incremental fetch.
    async fn current_token(&self, _zone: &ZoneId) -> Result<Option<ChangeToken>, RemoteError> {
        Ok(None)
    }
}
