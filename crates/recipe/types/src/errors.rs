//! Error types for the recipe runtime

use crate::{PauseToken, RetryError, RetryPauseSignal, RetryReason, STRICT_DIAGNOSTICS_MESSAGE};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Coarse classification of an adapter failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterErrorKind {
    Timeout,
    RateLimited,
    Network,
    Server,
    #[default]
    Other,
}

impl AdapterErrorKind {
    pub fn retry_reason(self) -> RetryReason {
        match self {
            AdapterErrorKind::Timeout => RetryReason::Timeout,
            AdapterErrorKind::RateLimited => RetryReason::RateLimit,
            AdapterErrorKind::Network => RetryReason::Network,
            AdapterErrorKind::Server => RetryReason::Server,
            AdapterErrorKind::Other => RetryReason::Unknown,
        }
    }
}

/// Failure of a capability-shaped collaborator.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct AdapterError {
    pub kind: AdapterErrorKind,
    pub message: String,
    #[source]
    pub source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl AdapterError {
    pub fn new(kind: AdapterErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::Other, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::Timeout, message)
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    pub fn reason(&self) -> RetryReason {
        self.kind.retry_reason()
    }
}

/// Failure raised by a stage helper, hook or rollback.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StageError {
    #[error("{0}")]
    Message(String),

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error("retry.pause: {0}")]
    RetryPause(Box<RetryPauseSignal>),

    /// An inner helper paused the chain. Returned by `Next::run` so that
    /// wrapping helpers unwind with `?`.
    #[error("execution suspended")]
    Suspended,
}

impl StageError {
    pub fn message(message: impl Into<String>) -> Self {
        StageError::Message(message.into())
    }
}

impl From<RetryError> for StageError {
    fn from(error: RetryError) -> Self {
        match error {
            RetryError::Failed(error) => StageError::Adapter(error),
            RetryError::Pause(signal) => StageError::RetryPause(signal),
        }
    }
}

/// The error carried by an `error` outcome.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RecipeError {
    #[error("stage '{stage}' failed in '{helper}': {source}")]
    Stage {
        stage: String,
        helper: String,
        #[source]
        source: StageError,
    },

    #[error("adapter call paused for retry: {0}")]
    RetryPaused(Box<RetryPauseSignal>),

    #[error("resume token '{0}' is not valid")]
    InvalidToken(PauseToken),

    #[error("no resume adapter is configured")]
    MissingResumeAdapter,

    #[error("resume adapter failed: {0}")]
    ResumeAdapter(#[source] AdapterError),

    #[error("producer yielded a non-pause intermediate value: {0}")]
    InvalidYield(String),

    #[error("{}", STRICT_DIAGNOSTICS_MESSAGE)]
    StrictDiagnostics,

    #[error("session store error: {0}")]
    SessionStore(String),

    #[error("recipe not found: {0}")]
    RecipeNotFound(String),

    #[error("recipe conflict: {0}")]
    Conflict(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl RecipeError {
    /// Stable dotted code for callers that branch on the failure class.
    pub fn code(&self) -> &'static str {
        match self {
            RecipeError::Stage {
                source: StageError::Adapter(_),
                ..
            } => "adapter.failed",
            RecipeError::Stage { .. } => "stage.failed",
            RecipeError::RetryPaused(_) => "retry.pause",
            RecipeError::InvalidToken(_) => "resume.invalidToken",
            RecipeError::MissingResumeAdapter => "resume.missingAdapter",
            RecipeError::ResumeAdapter(_) => "resume.adapterFailed",
            RecipeError::InvalidYield(_) => "pipeline.invalidYield",
            RecipeError::StrictDiagnostics => "diagnostics.strict",
            RecipeError::SessionStore(_) => "session.store",
            RecipeError::RecipeNotFound(_) => "recipe.notFound",
            RecipeError::Conflict(_) => "recipe.conflict",
            RecipeError::Internal(_) => "internal",
        }
    }
}

pub type RecipeResult<T> = Result<T, RecipeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adapter_kind_drives_reason() {
        assert_eq!(AdapterError::timeout("slow").reason(), RetryReason::Timeout);
        assert_eq!(AdapterError::other("boom").reason(), RetryReason::Unknown);
    }

    #[test]
    fn codes_distinguish_adapter_from_stage_failures() {
        let adapter = RecipeError::Stage {
            stage: "helper:generate".into(),
            helper: "call-model".into(),
            source: StageError::Adapter(AdapterError::other("down")),
        };
        let stage = RecipeError::Stage {
            stage: "helper:generate".into(),
            helper: "call-model".into(),
            source: StageError::message("bad input"),
        };
        assert_eq!(adapter.code(), "adapter.failed");
        assert_eq!(stage.code(), "stage.failed");
        assert_eq!(
            RecipeError::InvalidToken(PauseToken::new("T")).code(),
            "resume.invalidToken"
        );
    }

    #[test]
    fn retry_errors_convert_into_stage_errors() {
        let failed: StageError = RetryError::Failed(AdapterError::other("x")).into();
        assert!(matches!(failed, StageError::Adapter(_)));
    }
}
