//! Driver: the pause/resume state machine
//!
//! The driver pulls one step from a [`Producer`] and turns it into a
//! terminal [`Outcome`]. A paused step registers a resumable session under
//! the pause token; a finished step settles the session it came from. A
//! `retry.pause` error registers the run under the token in its signal.
//!
//! ```text
//! running ──▶ done
//!    │
//!    └──▶ paused ──▶ resumed ──▶ running
//!             └────▶ abandoned (swept)
//! ```

use crate::adapter::AdapterBundle;
use crate::helper::PauseRequest;
use crate::pipeline::RETRY_PAUSE_KIND;
use crate::session::{LiveSession, SessionLease, SessionMeta, SessionRegistry};
use async_trait::async_trait;
use recipe_storage::SessionRecord;
use recipe_types::{
    apply_diagnostics_mode, has_error_diagnostics, names, Artefact, Diagnostic, DiagnosticKind,
    DiagnosticsMode, Outcome, OutcomeStatus, PauseToken, RecipeError, Trace, TraceEvent,
};
use serde_json::json;
use std::fmt;
use std::sync::Arc;

/// An intermediate value yielded by a producer.
#[derive(Debug, Clone)]
pub enum Yielded {
    Paused(PauseRequest),
    /// Anything other than a pause; always invalid
    Value(serde_json::Value),
}

/// One step of a producer.
#[derive(Debug)]
pub enum Step {
    Yield(Yielded),
    Done(Result<Artefact, RecipeError>),
}

/// A stage-producing iterator the driver can step through.
#[async_trait]
pub trait Producer: Send {
    async fn step(&mut self, input: Option<serde_json::Value>) -> Step;

    /// Serializable state for durable resumption, when supported.
    fn snapshot(&self) -> Option<serde_json::Value>;

    fn diagnostics(&self) -> Vec<Diagnostic>;

    fn partial_artefact(&self) -> Artefact;

    /// Trace recorded since the last drain.
    fn drain_trace(&mut self) -> Trace;

    fn is_resumable(&self) -> bool;
}

/// Where the producer being driven came from.
#[derive(Debug)]
pub enum SessionOrigin {
    /// A new run
    Fresh,
    /// A live session checked out of the registry
    Live(SessionLease),
    /// Rebuilt from a durable snapshot
    Stored(PauseToken),
}

impl SessionOrigin {
    fn token(&self) -> Option<&PauseToken> {
        match self {
            SessionOrigin::Fresh => None,
            SessionOrigin::Live(lease) => Some(lease.token()),
            SessionOrigin::Stored(token) => Some(token),
        }
    }
}

/// Per-call inputs of [`Driver::drive`].
#[derive(Debug, Clone)]
pub struct DriveContext {
    pub recipe: String,
    pub mode: DiagnosticsMode,
    pub adapters: AdapterBundle,
    /// Whether the contract declares a paused outcome
    pub pause_supported: bool,
    /// Trace events recorded before the producer was stepped
    pub lead: Trace,
}

pub type ErrorHandler = Arc<dyn Fn(RecipeError) -> RecipeError + Send + Sync>;
pub type InvalidYieldHandler = Arc<dyn Fn(serde_json::Value) -> RecipeError + Send + Sync>;

enum Settled {
    Ok(Artefact),
    Paused(PauseRequest),
    Error(RecipeError),
}

impl Settled {
    fn status(&self) -> OutcomeStatus {
        match self {
            Settled::Ok(_) => OutcomeStatus::Ok,
            Settled::Paused(_) => OutcomeStatus::Paused,
            Settled::Error(_) => OutcomeStatus::Error,
        }
    }
}

/// Steps producers and keeps the session table consistent with outcomes.
#[derive(Clone)]
pub struct Driver {
    sessions: SessionRegistry,
    on_error: ErrorHandler,
    on_invalid_yield: InvalidYieldHandler,
}

impl Driver {
    pub fn new(sessions: SessionRegistry) -> Self {
        Self {
            sessions,
            on_error: Arc::new(|error| error),
            on_invalid_yield: Arc::new(|value| RecipeError::InvalidYield(value.to_string())),
        }
    }

    /// Map every stage error before it reaches the outcome.
    pub fn with_error_handler(mut self, handler: ErrorHandler) -> Self {
        self.on_error = handler;
        self
    }

    /// Map a non-pause intermediate yield to an error.
    pub fn with_invalid_yield_handler(mut self, handler: InvalidYieldHandler) -> Self {
        self.on_invalid_yield = handler;
        self
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Step `producer` once and settle the result into an outcome.
    pub async fn drive(
        &self,
        mut producer: Box<dyn Producer>,
        input: Option<serde_json::Value>,
        ctx: DriveContext,
        origin: SessionOrigin,
    ) -> Outcome {
        // A strict resume whose diagnostics already fail is refused before
        // the producer advances, so the session stays as it was.
        let held = ctx.mode == DiagnosticsMode::Strict
            && origin.token().is_some()
            && has_error_diagnostics(&apply_diagnostics_mode(producer.diagnostics(), ctx.mode));
        let step = if held {
            tracing::warn!(recipe = %ctx.recipe, "Strict diagnostics vetoed the resume before it ran");
            None
        } else {
            Some(producer.step(input).await)
        };
        let mut trace = ctx.lead;
        trace.extend(producer.drain_trace().into_events());
        let mut extra = Vec::new();

        let mut settled = match step {
            None => Settled::Error(RecipeError::StrictDiagnostics),
            Some(Step::Done(Ok(artefact))) => Settled::Ok(artefact),
            Some(Step::Done(Err(error))) => Settled::Error((self.on_error)(error)),
            Some(Step::Yield(Yielded::Paused(request))) => Settled::Paused(request),
            Some(Step::Yield(Yielded::Value(value))) => {
                tracing::error!(recipe = %ctx.recipe, "Producer yielded a non-pause value");
                extra.push(
                    Diagnostic::error(
                        DiagnosticKind::Pipeline,
                        "Producer yielded an intermediate value that is not a pause.",
                    )
                    .with_code("invalid_yield")
                    .with_data(value.clone()),
                );
                Settled::Error((self.on_invalid_yield)(value))
            }
        };

        if let Settled::Paused(request) = &settled {
            if !ctx.pause_supported {
                extra.push(
                    Diagnostic::warn(
                        DiagnosticKind::Contract,
                        format!("Recipe \"{}\" paused but does not declare a paused outcome.", ctx.recipe),
                    )
                    .with_code("recipe_pause_undeclared")
                    .with_subject(request.token.as_str()),
                );
            }
        }

        let mut diagnostics = producer.diagnostics();
        diagnostics.append(&mut extra);
        let diagnostics = apply_diagnostics_mode(diagnostics, ctx.mode);
        if ctx.mode == DiagnosticsMode::Strict
            && has_error_diagnostics(&diagnostics)
            && !matches!(settled, Settled::Error(_))
        {
            tracing::warn!(recipe = %ctx.recipe, "Strict diagnostics vetoed the run");
            settled = Settled::Error(RecipeError::StrictDiagnostics);
        }

        let partial = match settled {
            Settled::Paused(_) => producer.partial_artefact(),
            _ => Artefact::new(),
        };
        let mut settle_diagnostics = Vec::new();
        self.settle(&settled, producer, &ctx.recipe, ctx.adapters, origin, &mut settle_diagnostics)
            .await;
        let mut diagnostics = diagnostics;
        diagnostics.extend(apply_diagnostics_mode(settle_diagnostics, ctx.mode));

        let status = settled.status();
        let terminal = match status {
            OutcomeStatus::Ok => names::RUN_OK,
            OutcomeStatus::Paused => names::RUN_PAUSED,
            OutcomeStatus::Error => names::RUN_ERROR,
        };
        let terminal_data = match &settled {
            Settled::Ok(_) => serde_json::Value::Null,
            Settled::Paused(request) => json!({ "token": request.token, "pauseKind": request.pause_kind }),
            Settled::Error(error) => json!({ "code": error.code(), "message": error.to_string() }),
        };
        trace.push(TraceEvent::new(terminal).with_data(terminal_data));
        trace.push(TraceEvent::new(names::RUN_END).with_data(json!({ "status": status })));
        tracing::info!(recipe = %ctx.recipe, status = %status, "Run settled");

        match settled {
            Settled::Ok(artefact) => Outcome::Ok {
                artefact,
                trace,
                diagnostics,
            },
            Settled::Paused(request) => Outcome::Paused {
                token: request.token,
                artefact: partial,
                trace,
                diagnostics,
            },
            Settled::Error(error) => Outcome::Error {
                error,
                trace,
                diagnostics,
            },
        }
    }

    /// Apply the session rules for one settled step.
    ///
    /// Success deletes the session the step came from. A pause, or a retry
    /// pause, deletes it and registers the new token. Errors keep it while
    /// the producer can still continue, so resume can be retried; a producer
    /// that has finished closes it.
    async fn settle(
        &self,
        settled: &Settled,
        producer: Box<dyn Producer>,
        recipe: &str,
        adapters: AdapterBundle,
        origin: SessionOrigin,
        diagnostics: &mut Vec<Diagnostic>,
    ) {
        let resumable = producer.is_resumable();
        let retry_token = match settled {
            Settled::Error(RecipeError::RetryPaused(signal)) if resumable => signal.resume_token.clone(),
            _ => None,
        };

        if let Settled::Error(error) = settled {
            if retry_token.is_none() {
                if resumable {
                    if let SessionOrigin::Live(mut lease) = origin {
                        lease.restore(producer);
                    }
                    return;
                }
                if let Some(token) = origin.token() {
                    tracing::info!(token = %token, code = error.code(), "Pause session closed by a finished run");
                    diagnostics.push(
                        Diagnostic::warn(
                            DiagnosticKind::Resume,
                            format!("Pause session \"{}\" cannot continue and was closed.", token),
                        )
                        .with_code("session_closed")
                        .with_subject(token.as_str()),
                    );
                }
            }
        }

        if let Some(token) = origin.token() {
            if let Err(error) = self.sessions.delete(token).await {
                tracing::warn!(token = %token, error = %error, "Failed to delete pause session");
                diagnostics.push(
                    Diagnostic::warn(DiagnosticKind::Resume, format!("Failed to delete pause session: {}", error))
                        .with_code("session_delete_failed")
                        .with_subject(token.as_str()),
                );
            }
        }
        // The lease must release its slot before a paused-again run is
        // registered under the same token.
        drop(origin);

        let (token, pause_kind) = match (settled, retry_token) {
            (Settled::Paused(request), _) => (request.token.clone(), request.pause_kind.clone()),
            (_, Some(token)) => (token, RETRY_PAUSE_KIND.to_string()),
            _ => return,
        };
        if let Some(snapshot) = producer.snapshot() {
            let record = SessionRecord::new(token.clone(), recipe, pause_kind.clone(), snapshot);
            if let Err(error) = self.sessions.persist(record).await {
                tracing::warn!(token = %token, error = %error, "Failed to persist pause session");
                diagnostics.push(
                    Diagnostic::warn(DiagnosticKind::Resume, format!("Failed to persist pause session: {}", error))
                        .with_code("session_persist_failed")
                        .with_subject(token.as_str()),
                );
            }
        }
        self.sessions.register(
            token,
            LiveSession {
                producer,
                meta: SessionMeta::new(recipe, pause_kind, adapters),
            },
        );
    }
}

impl fmt::Debug for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Driver").field("sessions", &self.sessions).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recipe_types::{RetryPauseSignal, RetryReason, StageError};
    use std::collections::VecDeque;

    /// Replays scripted steps and records the inputs it was given.
    struct Scripted {
        steps: VecDeque<Step>,
        diagnostics: Vec<Diagnostic>,
        inputs: Arc<std::sync::Mutex<Vec<Option<serde_json::Value>>>>,
    }

    impl Scripted {
        fn new(steps: Vec<Step>) -> Self {
            Self {
                steps: steps.into(),
                diagnostics: Vec::new(),
                inputs: Arc::default(),
            }
        }
    }

    #[async_trait]
    impl Producer for Scripted {
        async fn step(&mut self, input: Option<serde_json::Value>) -> Step {
            self.inputs.lock().unwrap().push(input);
            self.steps
                .pop_front()
                .unwrap_or_else(|| Step::Done(Err(RecipeError::Internal("exhausted".into()))))
        }
        fn snapshot(&self) -> Option<serde_json::Value> {
            Some(json!({ "remaining": self.steps.len() }))
        }
        fn diagnostics(&self) -> Vec<Diagnostic> {
            self.diagnostics.clone()
        }
        fn partial_artefact(&self) -> Artefact {
            let mut partial = Artefact::new();
            partial.insert("draft".into(), json!("half"));
            partial
        }
        fn drain_trace(&mut self) -> Trace {
            Trace::new()
        }
        fn is_resumable(&self) -> bool {
            !self.steps.is_empty()
        }
    }

    fn ctx(mode: DiagnosticsMode) -> DriveContext {
        DriveContext {
            recipe: "gate".into(),
            mode,
            adapters: AdapterBundle::new(),
            pause_supported: true,
            lead: Trace::new(),
        }
    }

    fn paused(token: &str) -> Step {
        Step::Yield(Yielded::Paused(PauseRequest::new(token, "approval")))
    }

    #[tokio::test]
    async fn pause_registers_session_with_partial_artefact() {
        let driver = Driver::new(SessionRegistry::new());
        let producer = Scripted::new(vec![paused("T"), Step::Done(Ok(Artefact::new()))]);

        let outcome = driver
            .drive(Box::new(producer), None, ctx(DiagnosticsMode::Default), SessionOrigin::Fresh)
            .await;

        assert_eq!(outcome.token(), Some(&PauseToken::new("T")));
        assert_eq!(outcome.artefact().unwrap()["draft"], json!("half"));
        assert_eq!(outcome.trace().names(), [names::RUN_PAUSED, names::RUN_END]);
        assert!(driver.sessions().contains(&PauseToken::new("T")));
    }

    #[tokio::test]
    async fn resumed_success_deletes_session_and_error_keeps_it() {
        let driver = Driver::new(SessionRegistry::new());
        let token = PauseToken::new("T");
        let failing = Step::Done(Err(RecipeError::Stage {
            stage: "helpers:approve".into(),
            helper: "gate".into(),
            source: StageError::message("not yet"),
        }));
        let producer = Scripted::new(vec![paused("T"), failing, Step::Done(Ok(Artefact::new()))]);
        let inputs = Arc::clone(&producer.inputs);
        driver
            .drive(Box::new(producer), None, ctx(DiagnosticsMode::Default), SessionOrigin::Fresh)
            .await;

        let lease = driver.sessions().checkout(&token).await.unwrap();
        let mut lease = lease;
        let producer = lease.take_producer().unwrap();
        let outcome = driver
            .drive(producer, Some(json!(1)), ctx(DiagnosticsMode::Default), SessionOrigin::Live(lease))
            .await;
        assert_eq!(outcome.error().unwrap().code(), "stage.failed");
        assert!(driver.sessions().contains(&token));

        let mut lease = driver.sessions().checkout(&token).await.unwrap();
        let producer = lease.take_producer().unwrap();
        let outcome = driver
            .drive(producer, Some(json!(2)), ctx(DiagnosticsMode::Default), SessionOrigin::Live(lease))
            .await;
        assert!(outcome.is_ok());
        assert!(!driver.sessions().contains(&token));
        assert_eq!(*inputs.lock().unwrap(), [None, Some(json!(1)), Some(json!(2))]);
    }

    async fn resume_live(driver: &Driver, token: &PauseToken, input: serde_json::Value, mode: DiagnosticsMode) -> Outcome {
        let mut lease = driver.sessions().checkout(token).await.unwrap();
        let producer = lease.take_producer().unwrap();
        driver
            .drive(producer, Some(input), ctx(mode), SessionOrigin::Live(lease))
            .await
    }

    #[tokio::test]
    async fn error_from_a_finished_producer_closes_the_session() {
        let driver = Driver::new(SessionRegistry::new());
        let token = PauseToken::new("T");
        let failing = Step::Done(Err(RecipeError::Stage {
            stage: "helpers:approve".into(),
            helper: "gate".into(),
            source: StageError::message("rejected"),
        }));
        let producer = Scripted::new(vec![paused("T"), failing]);
        driver
            .drive(Box::new(producer), None, ctx(DiagnosticsMode::Default), SessionOrigin::Fresh)
            .await;

        let outcome = resume_live(&driver, &token, json!("no"), DiagnosticsMode::Default).await;

        assert_eq!(outcome.error().unwrap().code(), "stage.failed");
        assert!(outcome.diagnostics().iter().any(|d| d.has_code("session_closed")));
        assert!(!driver.sessions().contains(&token));
        assert!(driver.sessions().checkout(&token).await.is_none());
    }

    #[tokio::test]
    async fn strict_resume_with_failing_diagnostics_is_not_stepped() {
        let driver = Driver::new(SessionRegistry::new());
        let token = PauseToken::new("T");
        let mut producer = Scripted::new(vec![paused("T"), Step::Done(Ok(Artefact::new()))]);
        producer.diagnostics = vec![Diagnostic::warn(DiagnosticKind::Requirement, "missing retriever")];
        let inputs = Arc::clone(&producer.inputs);
        driver
            .drive(Box::new(producer), None, ctx(DiagnosticsMode::Default), SessionOrigin::Fresh)
            .await;

        let vetoed = resume_live(&driver, &token, json!(1), DiagnosticsMode::Strict).await;
        assert_eq!(vetoed.error().unwrap().code(), "diagnostics.strict");
        assert!(driver.sessions().contains(&token));
        assert_eq!(*inputs.lock().unwrap(), [None]);

        let resumed = resume_live(&driver, &token, json!(2), DiagnosticsMode::Default).await;
        assert!(resumed.is_ok());
        assert_eq!(*inputs.lock().unwrap(), [None, Some(json!(2))]);
    }

    #[tokio::test]
    async fn retry_pause_registers_under_the_signal_token() {
        let driver = Driver::new(SessionRegistry::new());
        let token = PauseToken::new("retry:run-1");
        let signal = RetryPauseSignal {
            adapter_kind: "model".into(),
            method: "generate".into(),
            attempt: 1,
            max_attempts: 3,
            delay_ms: 100,
            retry_at: chrono::Utc::now(),
            reason: RetryReason::RateLimit,
            resume_token: Some(token.clone()),
        };
        let deferred = Step::Done(Err(RecipeError::RetryPaused(Box::new(signal))));
        let producer = Scripted::new(vec![deferred, Step::Done(Ok(Artefact::new()))]);

        let outcome = driver
            .drive(Box::new(producer), None, ctx(DiagnosticsMode::Default), SessionOrigin::Fresh)
            .await;

        assert_eq!(outcome.error().unwrap().code(), "retry.pause");
        assert_eq!(outcome.token(), Some(&token));
        let lease = driver.sessions().checkout(&token).await.unwrap();
        assert_eq!(lease.meta().pause_kind, RETRY_PAUSE_KIND);
        drop(lease);

        let resumed = resume_live(&driver, &token, serde_json::Value::Null, DiagnosticsMode::Default).await;
        assert!(resumed.is_ok());
        assert!(driver.sessions().is_empty());
    }

    #[tokio::test]
    async fn invalid_yield_uses_its_own_handler() {
        let driver = Driver::new(SessionRegistry::new())
            .with_invalid_yield_handler(Arc::new(|_| RecipeError::InvalidYield("custom".into())))
            .with_error_handler(Arc::new(|_| RecipeError::Internal("unexpected".into())));
        let producer = Scripted::new(vec![Step::Yield(Yielded::Value(json!(42)))]);

        let outcome = driver
            .drive(Box::new(producer), None, ctx(DiagnosticsMode::Default), SessionOrigin::Fresh)
            .await;

        let error = outcome.error().unwrap();
        assert_eq!(error.code(), "pipeline.invalidYield");
        assert!(outcome.diagnostics().iter().any(|d| d.has_code("invalid_yield")));
    }

    #[tokio::test]
    async fn strict_mode_vetoes_success_and_pause() {
        let driver = Driver::new(SessionRegistry::new());
        for step in [Step::Done(Ok(Artefact::new())), paused("T")] {
            let mut producer = Scripted::new(vec![step]);
            producer.diagnostics = vec![Diagnostic::warn(DiagnosticKind::Contract, "missing")];

            let outcome = driver
                .drive(Box::new(producer), None, ctx(DiagnosticsMode::Strict), SessionOrigin::Fresh)
                .await;

            assert_eq!(outcome.error().unwrap().code(), "diagnostics.strict");
            assert!(outcome.diagnostics()[0].is_error());
            assert_eq!(outcome.trace().last().unwrap().data["status"], json!("error"));
        }
        assert!(driver.sessions().is_empty());
    }
}
