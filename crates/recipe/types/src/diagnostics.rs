//! Diagnostics: structured, non-throwing reports shared by every layer
//!
//! A diagnostic never aborts anything by itself. It accumulates onto the
//! outcome of a run. Under [`DiagnosticsMode::Strict`] the contract-shaped
//! kinds are promoted to errors, and an error diagnostic vetoes an
//! otherwise successful run.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Message used when strict diagnostics turn a run into an error outcome.
pub const STRICT_DIAGNOSTICS_MESSAGE: &str =
    "Recipe diagnostics contain errors and diagnostics mode is strict";

/// Which layer raised a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    Pipeline,
    Workflow,
    Requirement,
    Contract,
    Resume,
    Adapter,
    Recipe,
}

impl DiagnosticKind {
    /// Kinds that strict mode promotes to errors.
    pub fn is_promotable(self) -> bool {
        matches!(
            self,
            DiagnosticKind::Requirement | DiagnosticKind::Contract | DiagnosticKind::Recipe
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DiagnosticKind::Pipeline => "pipeline",
            DiagnosticKind::Workflow => "workflow",
            DiagnosticKind::Requirement => "requirement",
            DiagnosticKind::Contract => "contract",
            DiagnosticKind::Resume => "resume",
            DiagnosticKind::Adapter => "adapter",
            DiagnosticKind::Recipe => "recipe",
        }
    }
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticLevel {
    Warn,
    Error,
}

/// How diagnostics affect a run's outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticsMode {
    #[default]
    Default,
    Strict,
}

/// A single diagnostic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub level: DiagnosticLevel,
    pub message: String,
    /// Stable machine-readable code, e.g. `construct_provider_missing`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// What the diagnostic is about (plugin key, helper key, construct name)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
}

impl Diagnostic {
    pub fn new(kind: DiagnosticKind, level: DiagnosticLevel, message: impl Into<String>) -> Self {
        Self {
            kind,
            level,
            message: message.into(),
            code: None,
            subject: None,
            data: serde_json::Value::Null,
        }
    }

    pub fn warn(kind: DiagnosticKind, message: impl Into<String>) -> Self {
        Self::new(kind, DiagnosticLevel::Warn, message)
    }

    pub fn error(kind: DiagnosticKind, message: impl Into<String>) -> Self {
        Self::new(kind, DiagnosticLevel::Error, message)
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn is_error(&self) -> bool {
        self.level == DiagnosticLevel::Error
    }

    pub fn has_code(&self, code: &str) -> bool {
        self.code.as_deref() == Some(code)
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.level {
            DiagnosticLevel::Warn => "warn",
            DiagnosticLevel::Error => "error",
        };
        write!(f, "[{}:{}] {}", self.kind, level, self.message)
    }
}

/// Apply a diagnostics mode. Strict promotes requirement, contract and
/// recipe diagnostics to errors; every other kind keeps its declared level.
pub fn apply_diagnostics_mode(diagnostics: Vec<Diagnostic>, mode: DiagnosticsMode) -> Vec<Diagnostic> {
    match mode {
        DiagnosticsMode::Default => diagnostics,
        DiagnosticsMode::Strict => diagnostics
            .into_iter()
            .map(|mut diagnostic| {
                if diagnostic.kind.is_promotable() {
                    diagnostic.level = DiagnosticLevel::Error;
                }
                diagnostic
            })
            .collect(),
    }
}

pub fn has_error_diagnostics(diagnostics: &[Diagnostic]) -> bool {
    diagnostics.iter().any(Diagnostic::is_error)
}
