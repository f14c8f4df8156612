//! Per-run context and user state

use crate::adapter::AdapterBundle;
use crate::retry::{AdapterCallContext, RetryExecutor};
use crate::Reporter;
use recipe_types::{Artefact, CapabilityKey, RunId};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// What every helper of a run can see.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub recipe: String,
    pub run_id: RunId,
    pub adapters: AdapterBundle,
    pub retry: RetryExecutor,
}

impl RunContext {
    pub fn new(recipe: impl Into<String>, run_id: RunId, adapters: AdapterBundle, retry: RetryExecutor) -> Self {
        Self {
            recipe: recipe.into(),
            run_id,
            adapters,
            retry,
        }
    }

    /// Call context for one adapter method, reporting into `reporter` and
    /// carrying the adapter's own retry metadata.
    pub fn call_context(&self, adapter: &CapabilityKey, method: &str, reporter: &Reporter) -> AdapterCallContext {
        let metadata = self
            .adapters
            .get(adapter)
            .and_then(|instance| instance.retry_metadata())
            .cloned();
        AdapterCallContext::new(adapter.as_str(), method)
            .with_reporter(reporter.clone())
            .with_metadata(metadata)
    }
}

/// Mutable JSON state threaded through every stage of a run.
///
/// Cloning shares the underlying map.
#[derive(Debug, Clone, Default)]
pub struct UserState {
    inner: Arc<Mutex<Artefact>>,
}

impl UserState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: Artefact) -> Self {
        Self {
            inner: Arc::new(Mutex::new(map)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Artefact> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.lock().get(key).cloned()
    }

    /// Set `key`, returning the previous value.
    pub fn set(&self, key: impl Into<String>, value: serde_json::Value) -> Option<serde_json::Value> {
        self.lock().insert(key.into(), value)
    }

    pub fn remove(&self, key: &str) -> Option<serde_json::Value> {
        self.lock().remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut Artefact) -> R) -> R {
        f(&mut self.lock())
    }

    pub fn snapshot(&self) -> Artefact {
        self.lock().clone()
    }
}
