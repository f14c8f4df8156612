//! Trace: the append-only, ordered log attached to every outcome

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Well-known trace event names.
pub mod names {
    pub const RUN_START: &str = "run.start";
    pub const RUN_OK: &str = "run.ok";
    pub const RUN_PAUSED: &str = "run.paused";
    pub const RUN_ERROR: &str = "run.error";
    pub const RUN_END: &str = "run.end";
    pub const RESUME_START: &str = "resume.start";
    pub const STAGE_START: &str = "stage.start";
    pub const STAGE_END: &str = "stage.end";
    pub const HELPER_APPLY: &str = "helper.apply";
    pub const HELPER_ROLLBACK: &str = "helper.rollback";
    pub const HELPER_PAUSE: &str = "helper.pause";
    pub const RETRY_ATTEMPT: &str = "adapter.retry.attempt";
    pub const RETRY_EXHAUSTED: &str = "adapter.retry.exhausted";
    pub const RETRY_PAUSE: &str = "adapter.retry.pause";
}

/// One entry of a trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub name: String,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
}

impl TraceEvent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            at: Utc::now(),
            data: serde_json::Value::Null,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

/// Append-only ordered log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Trace {
    events: Vec<TraceEvent>,
}

impl Trace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: TraceEvent) {
        tracing::trace!(event = %event.name, "Trace appended");
        self.events.push(event);
    }

    pub fn extend(&mut self, events: impl IntoIterator<Item = TraceEvent>) {
        for event in events {
            self.push(event);
        }
    }

    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    pub fn into_events(self) -> Vec<TraceEvent> {
        self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn last(&self) -> Option<&TraceEvent> {
        self.events.last()
    }

    /// Event names in order.
    pub fn names(&self) -> Vec<&str> {
        self.events.iter().map(|e| e.name.as_str()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.events.iter().any(|e| e.name == name)
    }

    pub fn count(&self, name: &str) -> usize {
        self.events.iter().filter(|e| e.name == name).count()
    }
}
