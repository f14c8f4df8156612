//! File-backed session store. One JSON document per token, named by the
//! blake3 hash of the token so arbitrary token strings are path-safe.

use crate::model::SessionRecord;
use crate::traits::SessionStore;
use crate::{StoreError, StoreResult};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use recipe_types::PauseToken;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

pub struct FileSessionStore {
    root: PathBuf,
}

impl FileSessionStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        tracing::debug!(root = %root.display(), "Opened file session store");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, token: &PauseToken) -> PathBuf {
        let digest = blake3::hash(token.as_str().as_bytes());
        self.root.join(format!("{}.json", digest.to_hex()))
    }

    async fn read_path(path: &Path) -> StoreResult<Option<SessionRecord>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
            Err(error) => Err(StoreError::Io(error)),
        }
    }

    async fn write_record(&self, record: &SessionRecord) -> StoreResult<()> {
        let path = self.path_for(&record.token);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(record)?;
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn get(&self, token: &PauseToken) -> StoreResult<Option<SessionRecord>> {
        Self::read_path(&self.path_for(token)).await
    }

    async fn set(&self, record: SessionRecord) -> StoreResult<()> {
        self.write_record(&record).await
    }

    async fn delete(&self, token: &PauseToken) -> StoreResult<bool> {
        match tokio::fs::remove_file(self.path_for(token)).await {
            Ok(()) => Ok(true),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(false),
            Err(error) => Err(StoreError::Io(error)),
        }
    }

    async fn exists(&self, token: &PauseToken) -> StoreResult<bool> {
        Ok(tokio::fs::try_exists(self.path_for(token)).await?)
    }

    async fn touch(&self, token: &PauseToken) -> StoreResult<bool> {
        let Some(mut record) = self.get(token).await? else {
            return Ok(false);
        };
        record.last_accessed_at = Utc::now();
        self.write_record(&record).await?;
        Ok(true)
    }

    async fn sweep(&self, max_age: Duration) -> StoreResult<usize> {
        let now = Utc::now();
        let mut removed = 0;
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let record = match Self::read_path(&path).await {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(error) => {
                    tracing::warn!(path = %path.display(), error = %error, "Skipping unreadable session file");
                    continue;
                }
            };
            if record.is_stale(now, max_age) {
                tokio::fs::remove_file(&path).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::debug!(removed, "Swept stale file sessions");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(token: &str) -> SessionRecord {
        SessionRecord::new(PauseToken::new(token), "hitl-gate", "approval", json!({"state": {"x": 1}}))
    }

    #[tokio::test]
    async fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileSessionStore::open(dir.path()).await.unwrap();
            store.set(record("tok/with:odd chars")).await.unwrap();
        }
        let store = FileSessionStore::open(dir.path()).await.unwrap();
        let token = PauseToken::new("tok/with:odd chars");
        let loaded = store.get(&token).await.unwrap().unwrap();
        assert_eq!(loaded.snapshot["state"]["x"], 1);
        assert!(store.exists(&token).await.unwrap());
        assert!(store.delete(&token).await.unwrap());
        assert!(store.get(&token).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_tokens_answer_absence() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::open(dir.path()).await.unwrap();
        let token = PauseToken::new("never-paused");

        assert!(store.get(&token).await.unwrap().is_none());
        assert!(!store.exists(&token).await.unwrap());
        assert!(!store.delete(&token).await.unwrap());
        assert!(!store.touch(&token).await.unwrap());
    }

    #[tokio::test]
    async fn sweep_removes_stale_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::open(dir.path()).await.unwrap();
        let mut old = record("old");
        old.last_accessed_at = Utc::now() - Duration::days(2);
        store.set(old).await.unwrap();
        store.set(record("fresh")).await.unwrap();

        assert_eq!(store.sweep(Duration::days(1)).await.unwrap(), 1);
        assert!(store.exists(&PauseToken::new("fresh")).await.unwrap());
        assert!(!store.exists(&PauseToken::new("old")).await.unwrap());
    }
}
