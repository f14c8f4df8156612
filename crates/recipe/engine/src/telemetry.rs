//! Logging setup and event externalization

use crate::config::TelemetryConfig;
use recipe_types::{EventEnvelope, EventKind, EventStream, InteractionSequencer, Outcome};
use serde_json::json;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global log subscriber.
///
/// `RUST_LOG` wins over `log_filter`. Returns false when telemetry is
/// disabled or a subscriber is already installed.
pub fn init_tracing(config: &TelemetryConfig) -> bool {
    if !config.enabled {
        return false;
    }
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_filter));
    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .is_ok()
}

/// Envelopes for an outcome: every trace event, then every diagnostic.
pub fn envelopes(sequencer: &InteractionSequencer, correlation_id: &str, outcome: &Outcome) -> Vec<EventEnvelope> {
    let trace = outcome.trace().events().iter().map(|event| {
        sequencer.envelope(
            EventKind::Trace,
            correlation_id,
            json!({ "name": event.name, "at": event.at, "data": event.data }),
        )
    });
    let diagnostics = outcome.diagnostics().iter().map(|diagnostic| {
        sequencer.envelope(
            EventKind::Diagnostic,
            correlation_id,
            serde_json::to_value(diagnostic).unwrap_or_else(|_| json!({ "message": diagnostic.message })),
        )
    });
    trace.chain(diagnostics).collect()
}

/// Emit an outcome's trace and diagnostics through `stream`.
pub async fn externalize(
    stream: &dyn EventStream,
    sequencer: &InteractionSequencer,
    correlation_id: &str,
    outcome: &Outcome,
) -> Option<bool> {
    let batch = envelopes(sequencer, correlation_id, outcome);
    let count = batch.len();
    let accepted = stream.emit_many(batch).await;
    if accepted == Some(false) {
        tracing::warn!(
            interaction = %sequencer.interaction_id(),
            correlation = correlation_id,
            count,
            "Event stream rejected outcome events"
        );
    }
    accepted
}

#[cfg(test)]
mod tests {
    use super::*;
    use recipe_types::{
        names, Artefact, CollectingEventStream, Diagnostic, DiagnosticKind, InteractionId, Trace, TraceEvent,
    };

    fn outcome() -> Outcome {
        let mut trace = Trace::new();
        trace.push(TraceEvent::new(names::RUN_START));
        trace.push(TraceEvent::new(names::RUN_OK));
        trace.push(TraceEvent::new(names::RUN_END));
        Outcome::Ok {
            artefact: Artefact::new(),
            trace,
            diagnostics: vec![Diagnostic::warn(DiagnosticKind::Contract, "missing")],
        }
    }

    #[tokio::test]
    async fn externalize_sequences_trace_before_diagnostics() {
        let stream = CollectingEventStream::new();
        let sequencer = InteractionSequencer::new(InteractionId::new("chat-1"), "recipe-runtime");

        assert_eq!(externalize(&stream, &sequencer, "run-1", &outcome()).await, Some(true));

        let events = stream.events();
        let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, [1, 2, 3, 4]);
        assert_eq!(events[0].payload["name"], names::RUN_START);
        assert_eq!(events[3].kind, EventKind::Diagnostic);
        assert!(events.iter().all(|e| e.correlation_id == "run-1"));
    }

    #[test]
    fn disabled_telemetry_installs_nothing() {
        let config = TelemetryConfig {
            enabled: false,
            ..Default::default()
        };
        assert!(!init_tracing(&config));
    }
}
