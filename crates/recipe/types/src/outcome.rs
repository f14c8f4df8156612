//! Outcome: the terminal result of a `run` or `resume` call

use crate::{Diagnostic, PauseToken, RecipeError, Trace};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The (possibly partial) product of a run.
pub type Artefact = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Ok,
    Paused,
    Error,
}

impl OutcomeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OutcomeStatus::Ok => "ok",
            OutcomeStatus::Paused => "paused",
            OutcomeStatus::Error => "error",
        }
    }
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal result of one `run` / `resume` call.
#[derive(Debug)]
pub enum Outcome {
    Ok {
        artefact: Artefact,
        trace: Trace,
        diagnostics: Vec<Diagnostic>,
    },
    Paused {
        token: PauseToken,
        artefact: Artefact,
        trace: Trace,
        diagnostics: Vec<Diagnostic>,
    },
    Error {
        error: RecipeError,
        trace: Trace,
        diagnostics: Vec<Diagnostic>,
    },
}

impl Outcome {
    pub fn status(&self) -> OutcomeStatus {
        match self {
            Outcome::Ok { .. } => OutcomeStatus::Ok,
            Outcome::Paused { .. } => OutcomeStatus::Paused,
            Outcome::Error { .. } => OutcomeStatus::Error,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status() == OutcomeStatus::Ok
    }

    pub fn is_paused(&self) -> bool {
        self.status() == OutcomeStatus::Paused
    }

    pub fn is_error(&self) -> bool {
        self.status() == OutcomeStatus::Error
    }

    pub fn trace(&self) -> &Trace {
        match self {
            Outcome::Ok { trace, .. } | Outcome::Paused { trace, .. } | Outcome::Error { trace, .. } => {
                trace
            }
        }
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        match self {
            Outcome::Ok { diagnostics, .. }
            | Outcome::Paused { diagnostics, .. }
            | Outcome::Error { diagnostics, .. } => diagnostics,
        }
    }

    /// Full artefact for `ok`, partial artefact for `paused`.
    pub fn artefact(&self) -> Option<&Artefact> {
        match self {
            Outcome::Ok { artefact, .. } | Outcome::Paused { artefact, .. } => Some(artefact),
            Outcome::Error { .. } => None,
        }
    }

    /// Token to resume with: the pause token of a paused outcome, or the
    /// session a `retry.pause` error left behind.
    pub fn token(&self) -> Option<&PauseToken> {
        match self {
            Outcome::Paused { token, .. } => Some(token),
            Outcome::Error {
                error: RecipeError::RetryPaused(signal),
                ..
            } => signal.resume_token.as_ref(),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&RecipeError> {
        match self {
            Outcome::Error { error, .. } => Some(error),
            _ => None,
        }
    }
}
