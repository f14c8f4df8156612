use crate::model::SessionRecord;
use crate::StoreResult;
use async_trait::async_trait;
use chrono::Duration;
use recipe_types::PauseToken;

/// Durable storage for paused recipe runs, keyed by opaque token.
///
/// Implementations must tolerate concurrent calls for distinct tokens.
/// No operation spans more than one token.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, token: &PauseToken) -> StoreResult<Option<SessionRecord>>;

    /// Insert or replace the record for `record.token`.
    async fn set(&self, record: SessionRecord) -> StoreResult<()>;

    /// Returns whether a record was removed.
    async fn delete(&self, token: &PauseToken) -> StoreResult<bool>;

    /// Cheap existence check used to fail fast on stale tokens.
    async fn exists(&self, token: &PauseToken) -> StoreResult<bool> {
        Ok(self.get(token).await?.is_some())
    }

    /// Refresh `last_accessed_at`. Returns whether the token exists.
    async fn touch(&self, _token: &PauseToken) -> StoreResult<bool> {
        Ok(false)
    }

    /// Remove records not accessed within `max_age`. Returns how many were removed.
    async fn sweep(&self, _max_age: Duration) -> StoreResult<usize> {
        Ok(0)
    }
}
