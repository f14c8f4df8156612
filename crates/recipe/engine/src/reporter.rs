//! Reporter: the shared trace and diagnostics sink of one run
//!
//! Stages, helpers and the retry engine all write through a cloned
//! [`Reporter`]; the driver drains it when it assembles an outcome.

use recipe_types::{Diagnostic, DiagnosticKind, Trace, TraceEvent};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct ReporterState {
    trace: Trace,
    diagnostics: Vec<Diagnostic>,
}

/// Cheaply cloneable handle to a run's trace and diagnostics.
#[derive(Debug, Clone, Default)]
pub struct Reporter {
    state: Arc<Mutex<ReporterState>>,
}

impl Reporter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ReporterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record(&self, event: TraceEvent) {
        tracing::trace!(event = %event.name, data = %event.data, "trace");
        self.lock().trace.push(event);
    }

    /// Append a trace event with JSON data.
    pub fn event(&self, name: &str, data: serde_json::Value) {
        self.record(TraceEvent::new(name).with_data(data));
    }

    pub fn report(&self, diagnostic: Diagnostic) {
        tracing::debug!(
            kind = %diagnostic.kind,
            code = diagnostic.code.as_deref().unwrap_or(""),
            "{}",
            diagnostic.message
        );
        self.lock().diagnostics.push(diagnostic);
    }

    pub fn report_all(&self, diagnostics: impl IntoIterator<Item = Diagnostic>) {
        for diagnostic in diagnostics {
            self.report(diagnostic);
        }
    }

    pub fn warn(&self, kind: DiagnosticKind, message: impl Into<String>) {
        self.report(Diagnostic::warn(kind, message));
    }

    /// Every diagnostic reported so far. Diagnostics accumulate for the
    /// whole lifetime of a run, across pauses.
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.lock().diagnostics.clone()
    }

    /// Take the trace events recorded since the last drain.
    pub fn drain_trace(&self) -> Trace {
        std::mem::take(&mut self.lock().trace)
    }

    pub fn trace_len(&self) -> usize {
        self.lock().trace.len()
    }
}
