//! Helpers: the units of stage logic
//!
//! A helper receives [`HelperArgs`] and a [`Next`] continuation. It may
//! return immediately or asynchronously, may call `next.run()` to wrap the
//! rest of its chain (decorator-style middleware), and may hand back a
//! rollback or a pause request through [`HelperEffect`].

use crate::context::{RunContext, UserState};
use crate::pipeline::Next;
use crate::plugin::CompositionMode;
use crate::retry::AdapterCallContext;
use crate::Reporter;
use recipe_types::{CapabilityKey, MaybeAsync, PauseToken, RetryPauseSignal, StageError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Eventual result of [`Helper::apply`].
pub type HelperResult = MaybeAsync<'static, Result<HelperEffect, StageError>>;

pub trait Helper: Send + Sync {
    fn apply(&self, args: HelperArgs, next: Next) -> HelperResult;
}

/// Adapts a closure into a [`Helper`].
pub struct HelperFn<F>(pub F);

impl<F> Helper for HelperFn<F>
where
    F: Fn(HelperArgs, Next) -> HelperResult + Send + Sync,
{
    fn apply(&self, args: HelperArgs, next: Next) -> HelperResult {
        (self.0)(args, next)
    }
}

pub fn helper_fn<F>(f: F) -> Arc<dyn Helper>
where
    F: Fn(HelperArgs, Next) -> HelperResult + Send + Sync + 'static,
{
    Arc::new(HelperFn(f))
}

/// Arguments handed to every helper invocation.
#[derive(Debug, Clone)]
pub struct HelperArgs {
    pub context: Arc<RunContext>,
    pub input: Arc<serde_json::Value>,
    /// Shared user state; finalize projects it onto the artefact
    pub output: UserState,
    pub reporter: Reporter,
    /// Set only for the helper that paused, when the run is resumed
    pub resume_input: Option<serde_json::Value>,
    /// Set only for the helper a retry pause deferred, when the run is resumed
    pub retry: Option<RetryPauseSignal>,
    pub stage: String,
    pub helper: String,
}

impl HelperArgs {
    pub fn is_resuming(&self) -> bool {
        self.resume_input.is_some()
    }

    /// Call context for `adapter.method`. A call that was deferred by a
    /// retry pause continues from the attempts it already spent.
    pub fn call_context(&self, adapter: &CapabilityKey, method: &str) -> AdapterCallContext {
        let ctx = self.context.call_context(adapter, method, &self.reporter);
        match &self.retry {
            Some(signal) if signal.adapter_kind == adapter.as_str() && signal.method == method => {
                ctx.with_prior_attempts(signal.attempt)
            }
            _ => ctx,
        }
    }
}

/// Undo handler for a completed helper.
#[derive(Clone)]
pub struct Rollback(Arc<dyn Fn() -> MaybeAsync<'static, Result<(), StageError>> + Send + Sync>);

impl Rollback {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn() -> MaybeAsync<'static, Result<(), StageError>> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// A rollback that completes synchronously.
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn() -> Result<(), StageError> + Send + Sync + 'static,
    {
        Self::new(move || MaybeAsync::ready(f()))
    }

    pub fn run(&self) -> MaybeAsync<'static, Result<(), StageError>> {
        (self.0)()
    }
}

impl fmt::Debug for Rollback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Rollback")
    }
}

/// Request to suspend the run at the current helper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PauseRequest {
    pub token: PauseToken,
    pub pause_kind: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
}

impl PauseRequest {
    pub fn new(token: impl Into<PauseToken>, pause_kind: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            pause_kind: pause_kind.into(),
            data: serde_json::Value::Null,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

/// What a helper hands back besides success.
#[derive(Debug, Clone, Default)]
pub struct HelperEffect {
    pub rollback: Option<Rollback>,
    pub pause: Option<PauseRequest>,
}

impl HelperEffect {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_rollback(rollback: Rollback) -> Self {
        Self {
            rollback: Some(rollback),
            pause: None,
        }
    }

    pub fn pause(request: PauseRequest) -> Self {
        Self {
            rollback: None,
            pause: Some(request),
        }
    }
}

/// A helper as registered by a plugin.
#[derive(Clone)]
pub struct HelperSpec {
    pub key: String,
    pub kind: String,
    pub mode: CompositionMode,
    pub priority: i32,
    pub depends_on: Vec<String>,
    pub helper: Arc<dyn Helper>,
}

impl HelperSpec {
    pub fn new(key: impl Into<String>, kind: impl Into<String>, helper: Arc<dyn Helper>) -> Self {
        Self {
            key: key.into(),
            kind: kind.into(),
            mode: CompositionMode::Extend,
            priority: 0,
            depends_on: Vec::new(),
            helper,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn depends_on(mut self, key: impl Into<String>) -> Self {
        self.depends_on.push(key.into());
        self
    }

    /// Replace an earlier helper registered under the same key.
    pub fn overriding(mut self) -> Self {
        self.mode = CompositionMode::Override;
        self
    }
}

impl fmt::Debug for HelperSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HelperSpec")
            .field("key", &self.key)
            .field("kind", &self.kind)
            .field("mode", &self.mode)
            .field("priority", &self.priority)
            .field("depends_on", &self.depends_on)
            .finish()
    }
}

/// A hook bound to a named lifecycle point.
#[derive(Clone)]
pub struct LifecycleHook {
    pub name: String,
    pub hook: Arc<dyn Helper>,
}

impl fmt::Debug for LifecycleHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleHook").field("name", &self.name).finish()
    }
}
