//! In-memory session store.
//!
//! Deterministic and test-friendly. Sessions do not survive a restart; use
//! [`crate::FileSessionStore`] (or another durable backend) for that.

use crate::model::SessionRecord;
use crate::traits::SessionStore;
use crate::{StoreError, StoreResult};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use recipe_types::PauseToken;
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<PauseToken, SessionRecord>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().map(|guard| guard.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> StoreError {
    StoreError::Backend("sessions lock poisoned".to_string())
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, token: &PauseToken) -> StoreResult<Option<SessionRecord>> {
        let guard = self.sessions.read().map_err(|_| poisoned())?;
        Ok(guard.get(token).cloned())
    }

    async fn set(&self, record: SessionRecord) -> StoreResult<()> {
        let mut guard = self.sessions.write().map_err(|_| poisoned())?;
        guard.insert(record.token.clone(), record);
        Ok(())
    }

    async fn delete(&self, token: &PauseToken) -> StoreResult<bool> {
        let mut guard = self.sessions.write().map_err(|_| poisoned())?;
        Ok(guard.remove(token).is_some())
    }

    async fn exists(&self, token: &PauseToken) -> StoreResult<bool> {
        let guard = self.sessions.read().map_err(|_| poisoned())?;
        Ok(guard.contains_key(token))
    }

    async fn touch(&self, token: &PauseToken) -> StoreResult<bool> {
        let mut guard = self.sessions.write().map_err(|_| poisoned())?;
        match guard.get_mut(token) {
            Some(record) => {
                record.last_accessed_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn sweep(&self, max_age: Duration) -> StoreResult<usize> {
        let now = Utc::now();
        let mut guard = self.sessions.write().map_err(|_| poisoned())?;
        let before = guard.len();
        guard.retain(|_, record| !record.is_stale(now, max_age));
        let removed = before - guard.len();
        if removed > 0 {
            tracing::debug!(removed, "Swept stale in-memory sessions");
        }
        Ok(removed)
    }
}
