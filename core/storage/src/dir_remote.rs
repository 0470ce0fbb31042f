//! Directory-backed remote store.
//!
//! Keeps one JSON ledger per zone inside a shared directory, so several
//! local databases on one machine (or on a synced folder) can exchange
//! records through it.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

use cadence_common::{ChangeToken, RecordType, ZoneId};

use crate::ledger::ZoneLedger;
use crate::record::RemoteRecord;
use crate::remote::{AccountStatus, RemoteError, RemoteStore, ZoneChanges};

fn io_err(err: std::io::Error) -> RemoteError {
    RemoteError::ServiceUnavailable(err.to_string())
}

/// Remote store rooted at a directory.
///
/// The directory plays the role of the account: when it is missing the
/// account is reported as unavailable.
pub struct DirRemoteStore {
    root: PathBuf,
    /// Serializes read-modify-write cycles within this process.
    lock: Mutex<()>,
}

impl DirRemoteStore {
    /// Create a store rooted at `root`. The directory is not created.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn zone_path(&self, zone: &ZoneId) -> PathBuf {
        self.root.join(format!("{}.zone.json", zone))
    }

    async fn load(&self, zone: &ZoneId) -> Result<ZoneLedger, RemoteError> {
        let path = self.zone_path(zone);
        if !fs::try_exists(&path).await.map_err(io_err)? {
            return Err(RemoteError::ZoneNotFound(zone.clone()));
        }
        let content = fs::read_to_string(&path).await.map_err(io_err)?;
        serde_json::from_str(&content)
            .map_err(|e| RemoteError::Fatal(format!("Corrupt zone file {}: {}", path.display(), e)))
    }

    async fn store(&self, ledger: &ZoneLedger) -> Result<(), RemoteError> {
        let path = self.zone_path(ledger.zone());
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(ledger)
            .map_err(|e| RemoteError::Fatal(e.to_string()))?;
        fs::write(&tmp, json).await.map_err(io_err)?;
        fs::rename(&tmp, &path).await.map_err(io_err)?;
        debug!("Wrote zone ledger {}", path.display());
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for DirRemoteStore {
    fn name(&self) -> &str {
        "dir"
    }

    async fn account_status(&self) -> Result<AccountStatus, RemoteError> {
        match fs::metadata(&self.root).await {
            Ok(meta) if meta.is_dir() => Ok(AccountStatus::Available),
            Ok(_) => Ok(AccountStatus::Restricted),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AccountStatus::NoAccount),
            Err(e) => Err(io_err(e)),
        }
    }

    async fn ensure_zone(&self, zone: &ZoneId) -> Result<(), RemoteError> {
        let _guard = self.lock.lock().await;
        match self.load(zone).await {
            Ok(_) => Ok(()),
            Err(RemoteError::ZoneNotFound(_)) => self.store(&ZoneLedger::new(zone.clone())).await,
            Err(e) => Err(e),
        }
    }

    async fn save(&self, record: RemoteRecord) -> Result<RemoteRecord, RemoteError> {
        let _guard = self.lock.lock().await;
        let mut ledger = self.load(&record.record_id.zone).await?;
        let saved = ledger.save(record)?;
        self.store(&ledger).await?;
        Ok(saved)
    }

    async fn query_all(
        &self,
        record_type: RecordType,
        zone: &ZoneId,
    ) -> Result<Vec<RemoteRecord>, RemoteError> {
        let _guard = self.lock.lock().await;
        Ok(self.load(zone).await?.query(record_type))
    }

    async fn fetch_zone_changes(
        &self,
        zone: &ZoneId,
        token: &ChangeToken,
    ) -> Result<ZoneChanges, RemoteError> {
        let _guard = self.lock.lock().await;
        self.load(zone).await?.changes_since(token, None)
    }

    async fn current_token(&self, zone: &ZoneId) -> Result<Option<ChangeToken>, RemoteError> {
        let _guard = self.lock.lock().await;
        Ok(Some(self.load(zone).await?.current_token()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{fields, FieldValue};
    use cadence_common::RecordId;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_root_is_no_account() {
        let temp = TempDir::new().unwrap();
        let store = DirRemoteStore::new(temp.path().join("absent"));
        assert_eq!(store.account_status().await.unwrap(), AccountStatus::NoAccount);
    }

    #[tokio::test]
    async fn test_records_persist_across_instances() {
        let temp = TempDir::new().unwrap();
        let zone = ZoneId::new("shared").unwrap();
        let record = RemoteRecord::new(
            RecordType::Activity,
            RecordId::new(zone.clone(), "Activity-1").unwrap(),
        )
        .with_field(fields::NAME, FieldValue::String("Swim".into()));

        let token = {
            let store = DirRemoteStore::new(temp.path());
            store.ensure_zone(&zone).await.unwrap();
            let token = store.current_token(&zone).await.unwrap().unwrap();
            store.save(record).await.unwrap();
            token
        };

        let store = DirRemoteStore::new(temp.path());
        let changes = store.fetch_zone_changes(&zone, &token).await.unwrap();
        assert_eq!(changes.changed.len(), 1);
        assert_eq!(store.query_all(RecordType::Activity, &zone).await.unwrap().len(), 1);
    }
}
