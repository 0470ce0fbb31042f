//! Durable per-zone change token storage.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use cadence_common::{ChangeToken, Error, Result, ZoneId};

/// Persistent map from zone to the most recent change token.
///
/// A stored token is always the latest cursor the engine fully applied;
/// `clear` removes it so the next attempt falls back to a full fetch.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn get(&self, zone: &ZoneId) -> Result<Option<ChangeToken>>;

    /// Replace the zone's token.
    ///
    /// # Postconditions
    /// - The token is durable before this returns
    async fn set(&self, zone: &ZoneId, token: ChangeToken) -> Result<()>;

    async fn clear(&self, zone: &ZoneId) -> Result<()>;
}

/// Token store backed by a JSON file of zone name to base64 token.
pub struct FileTokenStore {
    path: PathBuf,
    tokens: tokio::sync::Mutex<BTreeMap<String, ChangeToken>>,
}

impl FileTokenStore {
    /// Open the store at `path`, loading any tokens already written there.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let tokens = if fs::try_exists(&path).await? {
            let content = fs::read_to_string(&path).await?;
            serde_json::from_str(&content)?
        } else {
            BTreeMap::new()
        };
        debug!("Loaded {} change tokens from {}", tokens.len(), path.display());

        Ok(Self {
            path,
            tokens: tokio::sync::Mutex::new(tokens),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, tokens: &BTreeMap<String, ChangeToken>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let json = serde_json::to_string_pretty(tokens)?;
        let tmp = self.path.with_extension("tmp");
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl TokenStore for FileTokenStore {
    async fn get(&self, zone: &ZoneId) -> Result<Option<ChangeToken>> {
        Ok(self.tokens.lock().await.get(zone.as_str()).cloned())
    }

    async fn set(&self, zone: &ZoneId, token: ChangeToken) -> Result<()> {
        let mut tokens = self.tokens.lock().await;
        let mut updated = tokens.clone();
        updated.insert(zone.to_string(), token);
        self.persist(&updated).await?;
        *tokens = updated;
        Ok(())
    }

    async fn clear(&self, zone: &ZoneId) -> Result<()> {
        let mut tokens = self.tokens.lock().await;
        if !tokens.contains_key(zone.as_str()) {
            return Ok(());
        }
        let mut updated = tokens.clone();
        updated.remove(zone.as_str());
        self.persist(&updated).await?;
        *tokens = updated;
        Ok(())
    }
}

/// In-memory token store for tests.
///
/// Keeps every value ever written so tests can check token history.
#[derive(Default)]
pub struct MemoryTokenStore {
    tokens: Mutex<HashMap<ZoneId, ChangeToken>>,
    history: Mutex<Vec<(ZoneId, Option<ChangeToken>)>>,
    fail_writes: Mutex<bool>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `set` and `clear` in order; `None` marks a clear.
    pub fn history(&self, zone: &ZoneId) -> Vec<Option<ChangeToken>> {
        self.history
            .lock()
            .iter()
            .filter(|(z, _)| z == zone)
            .map(|(_, token)| token.clone())
            .collect()
    }

    /// Make every subsequent write fail.
    pub fn set_fail_writes(&self, fail: bool) {
        *self.fail_writes.lock() = fail;
    }

    fn check_writable(&self) -> Result<()> {
        if *self.fail_writes.lock() {
            return Err(Error::Io(std::io::Error::other("token store is read-only")));
        }
        Ok(())
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn get(&self, zone: &ZoneId) -> Result<Option<ChangeToken>> {
        Ok(self.tokens.lock().get(zone).cloned())
    }

    async fn set(&self, zone: &ZoneId, token: ChangeToken) -> Result<()> {
        self.check_writable()?;
        self.history.lock().push((zone.clone(), Some(token.clone())));
        self.tokens.lock().insert(zone.clone(), token);
        Ok(())
    }

    async fn clear(&self, zone: &ZoneId) -> Result<()> {
        self.check_writable()?;
        self.history.lock().push((zone.clone(), None));
        self.tokens.lock().remove(zone);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_file_tokens_survive_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("state").join("tokens.json");
        let zone = ZoneId::default();
        let other = ZoneId::new("Other").unwrap();

        {
            let store = FileTokenStore::open(&path).await.unwrap();
            assert!(store.get(&zone).await.unwrap().is_none());
            store.set(&zone, ChangeToken::new(vec![1, 2, 3])).await.unwrap();
            store.set(&other, ChangeToken::new(vec![9])).await.unwrap();
            store.clear(&other).await.unwrap();
        }

        let store = FileTokenStore::open(&path).await.unwrap();
        assert_eq!(
            store.get(&zone).await.unwrap(),
            Some(ChangeToken::new(vec![1, 2, 3]))
        );
        assert!(store.get(&other).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_is_json_with_base64_tokens() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("tokens.json");
        let store = FileTokenStore::open(&path).await.unwrap();
        store
            .set(&ZoneId::default(), ChangeToken::new(b"cursor".to_vec()))
            .await
            .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(value["CadenceZone"], "Y3Vyc29y");
    }

    #[tokio::test]
    async fn test_set_leaves_no_temp_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("tokens.json");
        let store = FileTokenStore::open(&path).await.unwrap();
        for n in 0..3u8 {
            store.set(&ZoneId::default(), ChangeToken::new(vec![n])).await.unwrap();
        }

        let names: Vec<_> = std::fs::read_dir(temp.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("tokens.json")]);
        assert_eq!(
            FileTokenStore::open(&path).await.unwrap().get(&ZoneId::default()).await.unwrap(),
            Some(ChangeToken::new(vec![2]))
        );
    }

    #[tokio::test]
    async fn test_memory_history_and_failures() {
        let store = MemoryTokenStore::new();
        let zone = ZoneId::default();
        store.set(&zone, ChangeToken::new(vec![1])).await.unwrap();
        store.clear(&zone).await.unwrap();
        assert_eq!(store.history(&zone), vec![Some(ChangeToken::new(vec![1])), None]);

        store.set_fail_writes(true);
        assert!(store.set(&zone, ChangeToken::new(vec![2])).await.is_err());
        assert!(store.get(&zone).await.unwrap().is_none());
    }
}
