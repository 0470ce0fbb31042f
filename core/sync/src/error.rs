//! Attempt-level error taxonomy.

use thiserror::Error;

use cadence_common::{RecordId, ZoneId};
use cadence_storage::{AccountStatus, RemoteError};

/// Why a sync attempt, or one step of it, failed.
///
/// Cloneable so the last error can be published to status observers.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SyncError {
    /// The remote account cannot be used. No remote calls were made past
    /// the availability check.
    #[error("Remote account unavailable: {0:?}")]
    AccountUnavailable(AccountStatus),

    /// A transient remote failure outlasted the retry budget.
    #[error("Remote temporarily unavailable: {0}")]
    RemoteTransient(String),

    /// The server holds a newer revision. Resolved in-line, never an
    /// attempt failure.
    #[error("Remote conflict on {0}")]
    RemoteConflict(RecordId),

    /// The zone's change token is no longer valid.
    #[error("Change token expired for zone {0}")]
    TokenExpired(ZoneId),

    /// A non-retryable remote failure.
    #[error("Remote error: {0}")]
    Remote(String),

    /// A remote call exceeded the per-call timeout on every attempt.
    #[error("Remote call timed out")]
    Timeout,

    /// Reading or writing the local store failed.
    #[error("Local store error: {0}")]
    LocalStore(String),

    /// Reading or writing durable change tokens failed.
    #[error("Token store error: {0}")]
    TokenStore(String),

    /// A remote record could not be mapped onto a local entity.
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// An incremental fetch was requested for a zone without a token.
    #[error("No change token for zone {0}")]
    MissingToken(ZoneId),

    /// The attempt was dropped before it finished.
    #[error("Sync attempt cancelled")]
    Cancelled,
}

impl SyncError {
    /// Whether a later attempt may succeed without outside intervention.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::RemoteTransient(_) | SyncError::Timeout)
    }

    /// Convert a remote error raised while working on `zone`.
    pub fn in_zone(err: RemoteError, zone: &ZoneId) -> Self {
        match err {
            RemoteError::TokenExpired => SyncError::TokenExpired(zone.clone()),
            other => other.into(),
        }
    }
}

impl From<RemoteError> for SyncError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Timeout => SyncError::Timeout,
            RemoteError::Conflict(server) => SyncError::RemoteConflict(server.record_id),
            RemoteError::ZoneNotFound(zone) => {
                SyncError::Remote(format!("Zone not found: {}", zone))
            }
            RemoteError::TokenExpired => SyncError::Remote("Change token expired".to_string()),
            RemoteError::Fatal(msg) => SyncError::Remote(msg),
            other if other.is_transient() => SyncError::RemoteTransient(other.to_string()),
            other => SyncError::Remote(other.to_string()),
        }
    }
}

impl From<cadence_common::Error> for SyncError {
    fn from(err: cadence_common::Error) -> Self {
        match err {
            cadence_common::Error::InvalidRecord(msg) => SyncError::InvalidRecord(msg),
            other => SyncError::LocalStore(other.to_string()),
        }
    }
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_mapping() {
        assert_eq!(SyncError::from(RemoteError::Timeout), SyncError::Timeout);
        assert!(SyncError::from(RemoteError::NetworkUnavailable("offline".into())).is_transient());
        assert!(matches!(
            SyncError::from(RemoteError::Fatal("quota".into())),
            SyncError::Remote(_)
        ));
    }

    #[test]
    fn test_expired_token_names_zone() {
        let zone = ZoneId::new("Archive").unwrap();
        assert_eq!(
            SyncError::in_zone(RemoteError::TokenExpired, &zone),
            SyncError::TokenExpired(zone.clone())
        );
        assert_eq!(
            SyncError::in_zone(RemoteError::Timeout, &zone),
            SyncError::Timeout
        );
    }

    #[test]
    fn test_local_error_mapping() {
        let err: SyncError = cadence_common::Error::InvalidRecord("missing name".into()).into();
        assert!(matches!(err, SyncError::InvalidRecord(_)));

        let err: SyncError = cadence_common::Error::Database("locked".into()).into();
        assert!(matches!(err, SyncError::LocalStore(_)));
        assert!(!err.is_transient());
    }
}
