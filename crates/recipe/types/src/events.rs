//! Event stream boundary
//!
//! Trace entries, diagnostics and collaborator events (model deltas,
//! subagent progress) can be externalized through an [`EventStream`].
//! Every envelope carries a sequence number minted by the
//! [`InteractionSequencer`] of the interaction that issued the run. Each
//! interaction owns its own counter; two interactions never share one.

use crate::{InteractionId, MaybeAsync};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

/// Category of an externalized event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Trace,
    Diagnostic,
    Model,
    Subagent,
    Custom(String),
}

/// An event as it leaves the runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub source_id: String,
    pub interaction_id: InteractionId,
    pub correlation_id: String,
    pub kind: EventKind,
    pub payload: serde_json::Value,
}

/// Mints envelopes with monotonically increasing sequence numbers for one interaction.
#[derive(Debug)]
pub struct InteractionSequencer {
    interaction_id: InteractionId,
    source_id: String,
    counter: AtomicU64,
}

impl InteractionSequencer {
    pub fn new(interaction_id: InteractionId, source_id: impl Into<String>) -> Self {
        Self {
            interaction_id,
            source_id: source_id.into(),
            counter: AtomicU64::new(0),
        }
    }

    pub fn interaction_id(&self) -> &InteractionId {
        &self.interaction_id
    }

    /// Sequence number of the last minted envelope (0 when none yet).
    pub fn current(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }

    pub fn envelope(
        &self,
        kind: EventKind,
        correlation_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> EventEnvelope {
        let sequence = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        EventEnvelope {
            sequence,
            timestamp: Utc::now(),
            source_id: self.source_id.clone(),
            interaction_id: self.interaction_id.clone(),
            correlation_id: correlation_id.into(),
            kind,
            payload,
        }
    }
}

/// Sink for externalized events.
///
/// `emit` answers `Some(true)` when the event was accepted, `Some(false)`
/// when it was rejected and `None` when the stream does not report.
pub trait EventStream: Send + Sync {
    fn emit(&self, event: EventEnvelope) -> MaybeAsync<'_, Option<bool>>;

    /// Emit a batch in order. Streams with a native batch path override this.
    fn emit_many(&self, events: Vec<EventEnvelope>) -> MaybeAsync<'_, Option<bool>> {
        let emitted: Vec<_> = events.into_iter().map(|event| self.emit(event)).collect();
        MaybeAsync::all(emitted).map(|results| {
            results
                .into_iter()
                .fold(None, |acc: Option<bool>, r| match (acc, r) {
                    (Some(false), _) | (_, Some(false)) => Some(false),
                    (Some(true), _) | (_, Some(true)) => Some(true),
                    _ => None,
                })
        })
    }
}

/// In-process stream that keeps every event it receives.
#[derive(Debug, Default)]
pub struct CollectingEventStream {
    events: Mutex<Vec<EventEnvelope>>,
}

impl CollectingEventStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EventEnvelope> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl EventStream for CollectingEventStream {
    fn emit(&self, event: EventEnvelope) -> MaybeAsync<'_, Option<bool>> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
        MaybeAsync::ready(Some(true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sequences_are_monotonic_per_interaction() {
        let a = InteractionSequencer::new(InteractionId::new("a"), "runtime");
        let b = InteractionSequencer::new(InteractionId::new("b"), "runtime");

        let a1 = a.envelope(EventKind::Trace, "c1", json!({}));
        let b1 = b.envelope(EventKind::Trace, "c2", json!({}));
        let a2 = a.envelope(EventKind::Diagnostic, "c1", json!({}));

        assert_eq!((a1.sequence, a2.sequence), (1, 2));
        assert_eq!(b1.sequence, 1);
        assert_eq!(a.current(), 2);
    }

    #[tokio::test]
    async fn emit_many_keeps_order() {
        let stream = CollectingEventStream::new();
        let sequencer = InteractionSequencer::new(InteractionId::new("i"), "runtime");
        let batch = (0..3)
            .map(|n| sequencer.envelope(EventKind::Model, "c", json!({ "n": n })))
            .collect();

        assert_eq!(stream.emit_many(batch).await, Some(true));
        let sequences: Vec<_> = stream.events().iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
    }
}
