//! Retry policy engine
//!
//! Wraps adapter calls with bounded retry and exponential backoff. The
//! effective policy is, in order: an explicit per-call policy; the
//! adapter's own `metadata.retry` policy (unless the adapter opts out),
//! narrowed to the intersection of both `retry_on` lists; the configured
//! default. With no policy the call passes through untouched.
//!
//! Under [`RetryMode::Pause`] the engine never sleeps. It returns a
//! [`RetryError::Pause`] signal and leaves the wait to the orchestrator.

use crate::Reporter;
use chrono::{DateTime, Utc};
use recipe_types::{
    names, AdapterError, Diagnostic, DiagnosticKind, RetryError, RetryMetadata, RetryMode,
    RetryPauseSignal, RetryPolicy, RetryReason,
};
use serde_json::json;
use std::future::Future;
use std::time::Duration;

/// Trailing side channel of every wrapped adapter call.
#[derive(Debug, Clone, Default)]
pub struct AdapterCallContext {
    pub adapter_kind: String,
    pub method: String,
    /// Explicit per-call policy; wins over everything else
    pub policy: Option<RetryPolicy>,
    pub metadata: Option<RetryMetadata>,
    pub reporter: Option<Reporter>,
    /// 1-based attempt number of the call in flight
    pub attempt: u32,
    /// Attempts already spent before a retry pause; counts toward `max_attempts`
    pub prior_attempts: u32,
}

impl AdapterCallContext {
    pub fn new(adapter_kind: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            adapter_kind: adapter_kind.into(),
            method: method.into(),
            ..Self::default()
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn with_metadata(mut self, metadata: Option<RetryMetadata>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_reporter(mut self, reporter: Reporter) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Continue the attempt count of a call that paused earlier.
    pub fn with_prior_attempts(mut self, attempts: u32) -> Self {
        self.prior_attempts = attempts;
        self
    }

    fn trace(&self, name: &str, data: serde_json::Value) {
        if let Some(reporter) = &self.reporter {
            reporter.event(name, data);
        }
    }
}

fn intersect(a: Option<&Vec<RetryReason>>, b: Option<&Vec<RetryReason>>) -> Option<Vec<RetryReason>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.iter().filter(|r| b.contains(r)).copied().collect()),
        (Some(only), None) | (None, Some(only)) => Some(only.clone()),
        (None, None) => None,
    }
}

/// Wall-clock time `delay_ms` from now, saturating at the latest representable instant.
fn retry_at(delay_ms: u64) -> DateTime<Utc> {
    i64::try_from(delay_ms)
        .ok()
        .and_then(chrono::Duration::try_milliseconds)
        .and_then(|delay| Utc::now().checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Executes adapter calls under a retry policy.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    default_policy: Option<RetryPolicy>,
}

impl RetryExecutor {
    pub fn new(default_policy: Option<RetryPolicy>) -> Self {
        Self { default_policy }
    }

    pub fn effective_policy(&self, ctx: &AdapterCallContext) -> Option<RetryPolicy> {
        if let Some(policy) = &ctx.policy {
            return Some(policy.clone());
        }
        match &ctx.metadata {
            Some(metadata) if !metadata.allowed => None,
            Some(RetryMetadata {
                policy: Some(policy),
                retry_on,
                ..
            }) => {
                let mut policy = policy.clone();
                policy.retry_on = intersect(policy.retry_on.as_ref(), retry_on.as_ref());
                Some(policy)
            }
            _ => self.default_policy.clone(),
        }
    }

    /// Run `op` under the effective policy. `op` receives the call context
    /// with `attempt` set and is invoked once per attempt.
    pub async fn call<T, F, Fut>(&self, ctx: &AdapterCallContext, mut op: F) -> Result<T, RetryError>
    where
        F: FnMut(AdapterCallContext) -> Fut,
        Fut: Future<Output = Result<T, AdapterError>>,
    {
        let Some(policy) = self.effective_policy(ctx) else {
            let mut call_ctx = ctx.clone();
            call_ctx.attempt = 1;
            return op(call_ctx).await.map_err(RetryError::Failed);
        };

        let max_attempts = policy.effective_max_attempts();
        let mut attempt: u32 = ctx.prior_attempts;
        loop {
            let mut call_ctx = ctx.clone();
            call_ctx.attempt = attempt + 1;
            let result = match policy.timeout_ms {
                Some(timeout_ms) => {
                    match tokio::time::timeout(Duration::from_millis(timeout_ms), op(call_ctx)).await {
                        Ok(result) => result,
                        Err(_) => Err(AdapterError::timeout(format!(
                            "{}.{} timed out after {}ms",
                            ctx.adapter_kind, ctx.method, timeout_ms
                        ))),
                    }
                }
                None => op(call_ctx).await,
            };

            let error = match result {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            attempt += 1;
            let reason = error.reason();
            if !policy.permits(reason) || attempt >= max_attempts {
                self.exhausted(ctx, attempt, max_attempts, reason, &error);
                return Err(RetryError::Failed(error));
            }

            let delay_ms = policy.delay_for(attempt);
            ctx.trace(
                names::RETRY_ATTEMPT,
                json!({
                    "adapter": ctx.adapter_kind,
                    "method": ctx.method,
                    "attempt": attempt,
                    "maxAttempts": max_attempts,
                    "delayMs": delay_ms,
                    "reason": reason,
                    "error": error.to_string(),
                }),
            );
            tracing::debug!(
                adapter = %ctx.adapter_kind,
                method = %ctx.method,
                attempt,
                delay_ms,
                "Retrying adapter call"
            );

            if policy.mode == RetryMode::Pause && delay_ms > 0 {
                let signal = RetryPauseSignal {
                    adapter_kind: ctx.adapter_kind.clone(),
                    method: ctx.method.clone(),
                    attempt,
                    max_attempts,
                    delay_ms,
                    retry_at: retry_at(delay_ms),
                    reason,
                    resume_token: None,
                };
                ctx.trace(names::RETRY_PAUSE, json!(signal));
                tracing::info!(adapter = %ctx.adapter_kind, method = %ctx.method, %signal, "Adapter retry paused");
                return Err(RetryError::Pause(Box::new(signal)));
            }
            if delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
        }
    }

    fn exhausted(
        &self,
        ctx: &AdapterCallContext,
        attempts: u32,
        max_attempts: u32,
        reason: RetryReason,
        error: &AdapterError,
    ) {
        let data = json!({
            "adapter": ctx.adapter_kind,
            "method": ctx.method,
            "attempts": attempts,
            "maxAttempts": max_attempts,
            "reason": reason,
            "error": error.to_string(),
        });
        ctx.trace(names::RETRY_EXHAUSTED, data.clone());
        if let Some(reporter) = &ctx.reporter {
            reporter.report(
                Diagnostic::warn(
                    DiagnosticKind::Adapter,
                    format!(
                        "{}.{} failed after {} attempt(s): {}",
                        ctx.adapter_kind, ctx.method, attempts, error
                    ),
                )
                .with_code(names::RETRY_EXHAUSTED)
                .with_subject(ctx.adapter_kind.as_str())
                .with_data(data),
            );
        }
        tracing::warn!(
            adapter = %ctx.adapter_kind,
            method = %ctx.method,
            attempts,
            error = %error,
            "Adapter retries exhausted"
        );
    }

    /// Wrap an adapter method so it can be called with up to three
    /// arguments plus the trailing call context.
    pub fn wrap<F>(&self, op: F) -> RetryWrapped<F> {
        RetryWrapped {
            executor: self.clone(),
            op,
        }
    }
}

/// A retry-decorated adapter method. See [`RetryExecutor::wrap`].
#[derive(Debug, Clone)]
pub struct RetryWrapped<F> {
    executor: RetryExecutor,
    op: F,
}

impl<F> RetryWrapped<F> {
    pub async fn call0<T, Fut>(&self, ctx: &AdapterCallContext) -> Result<T, RetryError>
    where
        F: Fn(AdapterCallContext) -> Fut,
        Fut: Future<Output = Result<T, AdapterError>>,
    {
        self.executor.call(ctx, |call_ctx| (self.op)(call_ctx)).await
    }

    pub async fn call1<A, T, Fut>(&self, a: A, ctx: &AdapterCallContext) -> Result<T, RetryError>
    where
        A: Clone,
        F: Fn(A, AdapterCallContext) -> Fut,
        Fut: Future<Output = Result<T, AdapterError>>,
    {
        self.executor
            .call(ctx, |call_ctx| (self.op)(a.clone(), call_ctx))
            .await
    }

    pub async fn call2<A, B, T, Fut>(&self, a: A, b: B, ctx: &AdapterCallContext) -> Result<T, RetryError>
    where
        A: Clone,
        B: Clone,
        F: Fn(A, B, AdapterCallContext) -> Fut,
        Fut: Future<Output = Result<T, AdapterError>>,
    {
        self.executor
            .call(ctx, |call_ctx| (self.op)(a.clone(), b.clone(), call_ctx))
            .await
    }

    pub async fn call3<A, B, C, T, Fut>(
        &self,
        a: A,
        b: B,
        c: C,
        ctx: &AdapterCallContext,
    ) -> Result<T, RetryError>
    where
        A: Clone,
        B: Clone,
        C: Clone,
        F: Fn(A, B, C, AdapterCallContext) -> Fut,
        Fut: Future<Output = Result<T, AdapterError>>,
    {
        self.executor
            .call(ctx, |call_ctx| (self.op)(a.clone(), b.clone(), c.clone(), call_ctx))
            .await
    }
}
