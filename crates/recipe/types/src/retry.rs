//! Retry policy vocabulary

use crate::{AdapterError, PauseToken};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why an adapter call failed, as far as retry filtering is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryReason {
    Timeout,
    RateLimit,
    Network,
    Server,
    Unknown,
}

impl fmt::Display for RetryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RetryReason::Timeout => "timeout",
            RetryReason::RateLimit => "rate_limit",
            RetryReason::Network => "network",
            RetryReason::Server => "server",
            RetryReason::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Jitter {
    #[default]
    None,
    Full,
}

/// Whether the engine waits itself or hands the wait to the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryMode {
    #[default]
    Internal,
    Pause,
}

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first. Values below 1 are treated as 1.
    pub max_attempts: u32,
    pub backoff_ms: u64,
    #[serde(default)]
    pub max_backoff_ms: Option<u64>,
    #[serde(default)]
    pub jitter: Jitter,
    #[serde(default)]
    pub mode: RetryMode,
    #[serde(default)]
    pub retry_on: Option<Vec<RetryReason>>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_ms,
            max_backoff_ms: None,
            jitter: Jitter::None,
            mode: RetryMode::Internal,
            retry_on: None,
            timeout_ms: None,
        }
    }

    pub fn with_max_backoff(mut self, max_backoff_ms: u64) -> Self {
        self.max_backoff_ms = Some(max_backoff_ms);
        self
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_mode(mut self, mode: RetryMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_retry_on(mut self, reasons: Vec<RetryReason>) -> Self {
        self.retry_on = Some(reasons);
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn effective_max_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay before the attempt that follows failure number `attempt` (1-based).
    ///
    /// `min(backoff · 2^(attempt-1), max_backoff)`, halved under full jitter.
    pub fn delay_for(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1);
        let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
        let mut delay = self.backoff_ms.saturating_mul(factor);
        if let Some(cap) = self.max_backoff_ms {
            delay = delay.min(cap);
        }
        match self.jitter {
            Jitter::None => delay,
            Jitter::Full => delay / 2,
        }
    }

    /// Whether a failure with `reason` may be retried under this policy.
    ///
    /// An unclassified failure is never filtered out.
    pub fn permits(&self, reason: RetryReason) -> bool {
        match (&self.retry_on, reason) {
            (None, _) | (_, RetryReason::Unknown) => true,
            (Some(reasons), reason) => reasons.contains(&reason),
        }
    }
}

/// Retry declaration carried in adapter metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryMetadata {
    #[serde(default = "default_allowed")]
    pub allowed: bool,
    #[serde(default)]
    pub policy: Option<RetryPolicy>,
    #[serde(default)]
    pub retry_on: Option<Vec<RetryReason>>,
}

fn default_allowed() -> bool {
    true
}

impl Default for RetryMetadata {
    fn default() -> Self {
        Self {
            allowed: true,
            policy: None,
            retry_on: None,
        }
    }
}

/// Signal raised instead of sleeping when a pause-mode policy wants to wait.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPauseSignal {
    pub adapter_kind: String,
    pub method: String,
    pub attempt: u32,
    pub max_attempts: u32,
    pub delay_ms: u64,
    pub retry_at: DateTime<Utc>,
    pub reason: RetryReason,
    /// Session the deferred run waits under, once the pipeline has registered one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<PauseToken>,
}

impl fmt::Display for RetryPauseSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{} attempt {}/{} retries at {} ({}ms, {})",
            self.adapter_kind,
            self.method,
            self.attempt,
            self.max_attempts,
            self.retry_at.to_rfc3339(),
            self.delay_ms,
            self.reason
        )
    }
}

/// Result of a retry-wrapped call that did not succeed.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RetryError {
    /// The original adapter error, unchanged.
    #[error(transparent)]
    Failed(AdapterError),

    /// The policy asked the orchestrator to wait instead of sleeping.
    #[error("retry.pause: {0}")]
    Pause(Box<RetryPauseSignal>),
}

impl RetryError {
    pub fn is_pause(&self) -> bool {
        matches!(self, RetryError::Pause(_))
    }

    pub fn into_adapter_error(self) -> Option<AdapterError> {
        match self {
            RetryError::Failed(error) => Some(error),
            RetryError::Pause(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_per_attempt() {
        let policy = RetryPolicy::new(3, 100);
        assert_eq!(policy.delay_for(1), 100);
        assert_eq!(policy.delay_for(2), 200);
        assert_eq!(policy.delay_for(3), 400);
    }

    #[test]
    fn delays_respect_cap_and_jitter() {
        let policy = RetryPolicy::new(5, 100)
            .with_max_backoff(250)
            .with_jitter(Jitter::Full);
        assert_eq!(policy.delay_for(1), 50);
        assert_eq!(policy.delay_for(3), 125);
    }

    #[test]
    fn huge_attempt_numbers_saturate() {
        let policy = RetryPolicy::new(100, 10);
        assert_eq!(policy.delay_for(80), u64::MAX);
    }

    #[test]
    fn zero_attempts_are_clamped() {
        assert_eq!(RetryPolicy::new(0, 1).effective_max_attempts(), 1);
        let raw: RetryPolicy =
            serde_json::from_value(serde_json::json!({"max_attempts": 0, "backoff_ms": 5})).unwrap();
        assert_eq!(raw.effective_max_attempts(), 1);
    }

    #[test]
    fn unknown_reasons_are_never_filtered() {
        let policy = RetryPolicy::new(3, 10).with_retry_on(vec![RetryReason::Timeout]);
        assert!(policy.permits(RetryReason::Unknown));
        assert!(policy.permits(RetryReason::Timeout));
        assert!(!policy.permits(RetryReason::RateLimit));
    }
}
