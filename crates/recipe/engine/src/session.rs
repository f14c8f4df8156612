//! Pause-session registry
//!
//! The only mutable shared state of a runtime. Live sessions hold the
//! suspended producer itself; each token has its own async lock so that
//! concurrent resumes of distinct tokens never contend, and two resumes of
//! the same token run one after the other. An optional [`SessionStore`]
//! keeps a durable snapshot of every pause for resumption after a restart.

use crate::adapter::AdapterBundle;
use crate::driver::Producer;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use recipe_storage::{SessionRecord, SessionStore, StoreResult};
use recipe_types::PauseToken;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Bookkeeping kept alongside a live producer.
#[derive(Debug, Clone)]
pub struct SessionMeta {
    pub recipe: String,
    pub pause_kind: String,
    pub created_at: DateTime<Utc>,
    /// Adapters the run resolved; handed to the resume adapter
    pub adapters: AdapterBundle,
}

impl SessionMeta {
    pub fn new(recipe: impl Into<String>, pause_kind: impl Into<String>, adapters: AdapterBundle) -> Self {
        Self {
            recipe: recipe.into(),
            pause_kind: pause_kind.into(),
            created_at: Utc::now(),
            adapters,
        }
    }
}

/// A suspended run held in memory.
pub struct LiveSession {
    pub producer: Box<dyn Producer>,
    pub meta: SessionMeta,
}

impl fmt::Debug for LiveSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveSession").field("meta", &self.meta).finish()
    }
}

type SessionSlot = Arc<Mutex<Option<LiveSession>>>;

/// Table of active pause sessions.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    live: Arc<DashMap<PauseToken, SessionSlot>>,
    store: Option<Arc<dyn SessionStore>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_store(store: Arc<dyn SessionStore>) -> Self {
        Self {
            live: Arc::new(DashMap::new()),
            store: Some(store),
        }
    }

    pub fn store(&self) -> Option<&Arc<dyn SessionStore>> {
        self.store.as_ref()
    }

    /// Register a live session, replacing any session under the same token.
    pub fn register(&self, token: PauseToken, session: LiveSession) {
        tracing::debug!(token = %token, recipe = %session.meta.recipe, "Pause session registered");
        self.live.insert(token, Arc::new(Mutex::new(Some(session))));
    }

    /// Write a durable snapshot. A registry without a store accepts and drops it.
    pub async fn persist(&self, record: SessionRecord) -> StoreResult<()> {
        match &self.store {
            Some(store) => store.set(record).await,
            None => Ok(()),
        }
    }

    /// True when a live session exists for `token`.
    pub fn contains(&self, token: &PauseToken) -> bool {
        self.live.contains_key(token)
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Take exclusive hold of a live session.
    ///
    /// Waits while another caller holds the same token. Returns `None` when
    /// the token is unknown or its session was consumed in the meantime.
    pub async fn checkout(&self, token: &PauseToken) -> Option<SessionLease> {
        let slot = self.live.get(token).map(|entry| Arc::clone(entry.value()))?;
        let mut guard = slot.lock_owned().await;
        let session = guard.take()?;
        Some(SessionLease {
            token: token.clone(),
            meta: session.meta,
            producer: Some(session.producer),
            guard: Some(guard),
        })
    }

    /// Remove `token` from the live table and the store.
    pub async fn delete(&self, token: &PauseToken) -> StoreResult<bool> {
        let live = self.live.remove(token).is_some();
        let stored = match &self.store {
            Some(store) => store.delete(token).await?,
            None => false,
        };
        tracing::debug!(token = %token, live, stored, "Pause session deleted");
        Ok(live || stored)
    }

    /// Load the durable record of `token`, refreshing its access time.
    pub async fn stored(&self, token: &PauseToken) -> StoreResult<Option<SessionRecord>> {
        let Some(store) = &self.store else {
            return Ok(None);
        };
        let record = store.get(token).await?;
        if record.is_some() {
            store.touch(token).await?;
        }
        Ok(record)
    }

    /// Cheap existence check against the store.
    pub async fn exists_in_store(&self, token: &PauseToken) -> StoreResult<bool> {
        match &self.store {
            Some(store) => store.exists(token).await,
            None => Ok(false),
        }
    }

    /// Drop sessions older than `max_age`. Live sessions currently checked
    /// out are skipped. Returns the number of sessions removed.
    pub async fn sweep(&self, max_age: chrono::Duration) -> StoreResult<usize> {
        let now = Utc::now();
        let stale: Vec<PauseToken> = self
            .live
            .iter()
            .filter(|entry| match entry.value().try_lock() {
                Ok(slot) => slot.as_ref().map_or(true, |s| now - s.meta.created_at > max_age),
                Err(_) => false,
            })
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for token in stale {
            if self.live.remove(&token).is_some() {
                removed += 1;
            }
        }
        if let Some(store) = &self.store {
            removed += store.sweep(max_age).await?;
        }
        if removed > 0 {
            tracing::info!(removed, "Swept stale pause sessions");
        }
        Ok(removed)
    }
}

impl fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("live", &self.live.len())
            .field("store", &self.store.is_some())
            .finish()
    }
}

/// Exclusive hold of one live session.
///
/// Dropping a lease that still holds its producer puts the session back,
/// so any path that does not explicitly consume it leaves it resumable.
pub struct SessionLease {
    token: PauseToken,
    meta: SessionMeta,
    producer: Option<Box<dyn Producer>>,
    guard: Option<OwnedMutexGuard<Option<LiveSession>>>,
}

impl SessionLease {
    pub fn token(&self) -> &PauseToken {
        &self.token
    }

    pub fn meta(&self) -> &SessionMeta {
        &self.meta
    }

    pub fn producer(&self) -> Option<&dyn Producer> {
        self.producer.as_deref()
    }

    pub fn take_producer(&mut self) -> Option<Box<dyn Producer>> {
        self.producer.take()
    }

    /// Hand a producer back; it is restored under this token on drop.
    pub fn restore(&mut self, producer: Box<dyn Producer>) {
        self.producer = Some(producer);
    }
}

impl fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionLease")
            .field("token", &self.token)
            .field("holding", &self.producer.is_some())
            .finish()
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if let (Some(mut guard), Some(producer)) = (self.guard.take(), self.producer.take()) {
            *guard = Some(LiveSession {
                producer,
                meta: self.meta.clone(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::Step;
    use async_trait::async_trait;
    use recipe_storage::InMemorySessionStore;
    use recipe_types::{Artefact, Diagnostic, Trace};

    struct Idle;

    #[async_trait]
    impl Producer for Idle {
        async fn step(&mut self, _input: Option<serde_json::Value>) -> Step {
            Step::Done(Ok(Artefact::new()))
        }
        fn snapshot(&self) -> Option<serde_json::Value> {
            None
        }
        fn diagnostics(&self) -> Vec<Diagnostic> {
            Vec::new()
        }
        fn partial_artefact(&self) -> Artefact {
            Artefact::new()
        }
        fn drain_trace(&mut self) -> Trace {
            Trace::new()
        }
        fn is_resumable(&self) -> bool {
            true
        }
    }

    fn live() -> LiveSession {
        LiveSession {
            producer: Box::new(Idle),
            meta: SessionMeta::new("gate", "approval", AdapterBundle::new()),
        }
    }

    #[tokio::test]
    async fn dropped_lease_restores_session() {
        let registry = SessionRegistry::new();
        let token = PauseToken::new("T");
        registry.register(token.clone(), live());

        let mut lease = registry.checkout(&token).await.unwrap();
        assert!(lease.take_producer().is_some());
        lease.restore(Box::new(Idle));
        drop(lease);

        let mut again = registry.checkout(&token).await.unwrap();
        assert_eq!(again.meta().pause_kind, "approval");
        assert!(again.take_producer().is_some());
    }

    #[tokio::test]
    async fn consumed_lease_leaves_nothing_to_resume() {
        let registry = SessionRegistry::new();
        let token = PauseToken::new("T");
        registry.register(token.clone(), live());

        let mut lease = registry.checkout(&token).await.unwrap();
        let _ = lease.take_producer();
        assert!(registry.delete(&token).await.unwrap());
        drop(lease);

        assert!(registry.checkout(&token).await.is_none());
        assert!(!registry.contains(&token));
    }

    #[tokio::test]
    async fn delete_reaches_the_store() {
        let store = Arc::new(InMemorySessionStore::new());
        let registry = SessionRegistry::with_store(store.clone());
        let token = PauseToken::new("T");
        registry
            .persist(SessionRecord::new(token.clone(), "gate", "approval", serde_json::json!({})))
            .await
            .unwrap();

        assert!(registry.exists_in_store(&token).await.unwrap());
        assert!(registry.stored(&token).await.unwrap().is_some());
        assert!(registry.delete(&token).await.unwrap());
        assert!(!registry.exists_in_store(&token).await.unwrap());
    }

    #[tokio::test]
    async fn sweep_skips_fresh_and_checked_out_sessions() {
        let registry = SessionRegistry::new();
        registry.register(PauseToken::new("old"), {
            let mut session = live();
            session.meta.created_at = Utc::now() - chrono::Duration::hours(2);
            session
        });
        registry.register(PauseToken::new("fresh"), live());
        let busy = PauseToken::new("busy");
        registry.register(busy.clone(), {
            let mut session = live();
            session.meta.created_at = Utc::now() - chrono::Duration::hours(2);
            session
        });
        let _lease = registry.checkout(&busy).await.unwrap();

        let removed = registry.sweep(chrono::Duration::hours(1)).await.unwrap();
        assert_eq!(removed, 1);
        assert!(registry.contains(&PauseToken::new("fresh")));
        assert!(registry.contains(&busy));
    }
}
