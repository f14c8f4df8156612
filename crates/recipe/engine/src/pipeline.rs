//! Pipeline executor
//!
//! [`PipelineRun`] is the explicit continuation of one run. Each call to
//! [`PipelineRun::step`] executes stages from the cursor until the run
//! finishes, fails or a helper asks to pause. The cursor, the user state
//! and the accumulated diagnostics serialize into a [`PipelineSnapshot`]
//! so a paused run can be rebuilt in another process.
//!
//! Within a stage, helpers form a chain. A helper may call [`Next::run`]
//! to execute the rest of the chain inside its own logic; if it does not,
//! the executor continues with the remaining helpers once it returns.
//!
//! A pause-mode adapter retry defers the failing helper instead of failing
//! the stage. The run stays resumable under [`retry_token`] and the helper
//! is re-entered with the attempts it has already spent.

use crate::context::{RunContext, UserState};
use crate::driver::{Producer, Step, Yielded};
use crate::helper::{HelperArgs, PauseRequest, Rollback};
use crate::stage_builder::{Stage, StageKind, StagePlan};
use crate::Reporter;
use async_trait::async_trait;
use recipe_types::{
    names, Artefact, Diagnostic, DiagnosticKind, MaybeAsync, PauseToken, RecipeError, RecipeResult,
    RetryPauseSignal, RunId, StageError, Trace,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Pause kind of the session a deferred adapter retry waits under.
pub const RETRY_PAUSE_KIND: &str = "retry";

/// Token a run waits under after a pause-mode adapter retry.
pub fn retry_token(run_id: RunId) -> PauseToken {
    PauseToken::new(format!("retry:{}", run_id))
}

/// Position of a run: stage index and helper index within that stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub stage: usize,
    pub helper: usize,
}

/// Serializable state of a paused run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSnapshot {
    pub recipe: String,
    pub run_id: RunId,
    pub cursor: Cursor,
    pub input: serde_json::Value,
    pub state: Artefact,
    pub visited: Vec<String>,
    pub diagnostics: Vec<Diagnostic>,
    pub pause: Option<PauseRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPauseSignal>,
}

/// A helper that completed with a rollback registered.
#[derive(Debug, Clone)]
struct CompletedHelper {
    key: String,
    stage: String,
    rollback: Rollback,
}

/// Failure of one helper chain.
#[derive(Debug, Clone)]
struct ChainFailure {
    index: usize,
    helper: String,
    error: StageError,
}

/// State shared by every link of one chain execution.
#[derive(Default)]
struct ChainShared {
    completed: Mutex<Vec<CompletedHelper>>,
    visited: Mutex<Vec<String>>,
    pause: Mutex<Option<(usize, PauseRequest)>>,
    inner_failure: Mutex<Option<ChainFailure>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ChainShared {
    fn is_paused(&self) -> bool {
        lock(&self.pause).is_some()
    }
}

/// Template for the links of one chain.
#[derive(Clone)]
struct ChainCursor {
    stage: Arc<Stage>,
    index: usize,
    args: HelperArgs,
    shared: Arc<ChainShared>,
}

impl ChainCursor {
    fn advanced(&self) -> Self {
        Self {
            index: self.index + 1,
            ..self.clone()
        }
    }
}

/// Continuation handed to a helper: the rest of its chain.
pub struct Next {
    rest: Option<ChainCursor>,
    called: Arc<AtomicBool>,
}

impl Next {
    /// A continuation with nothing behind it.
    pub fn end() -> Self {
        Self {
            rest: None,
            called: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Run the remaining helpers. Fails with [`StageError::Suspended`] when
    /// one of them paused, so wrapping helpers unwind with `?`.
    pub fn run(self) -> MaybeAsync<'static, Result<(), StageError>> {
        self.called.store(true, Ordering::SeqCst);
        let Some(rest) = self.rest else {
            return MaybeAsync::ok(());
        };
        let shared = Arc::clone(&rest.shared);
        run_chain(rest, None, None).map(move |result| match result {
            Ok(()) if shared.is_paused() => Err(StageError::Suspended),
            Ok(()) => Ok(()),
            Err(failure) => {
                let error = failure.error.clone();
                *lock(&shared.inner_failure) = Some(failure);
                Err(error)
            }
        })
    }
}

impl std::fmt::Debug for Next {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Next")
            .field("remaining", &self.rest.as_ref().map(|r| r.stage.helpers.len().saturating_sub(r.index)))
            .finish()
    }
}

fn run_chain(
    cursor: ChainCursor,
    resume_input: Option<serde_json::Value>,
    retry: Option<RetryPauseSignal>,
) -> MaybeAsync<'static, Result<(), ChainFailure>> {
    let shared = Arc::clone(&cursor.shared);
    if shared.is_paused() {
        return MaybeAsync::ok(());
    }
    let Some(scheduled) = cursor.stage.helpers.get(cursor.index).cloned() else {
        return MaybeAsync::ok(());
    };

    let index = cursor.index;
    lock(&shared.visited).push(scheduled.key.clone());
    cursor.args.reporter.event(
        names::HELPER_APPLY,
        json!({
            "stage": cursor.stage.name,
            "helper": scheduled.key,
            "plugin": scheduled.plugin,
            "resumed": resume_input.is_some() || retry.is_some(),
        }),
    );

    let mut args = cursor.args.clone();
    args.helper = scheduled.key.clone();
    args.resume_input = resume_input;
    args.retry = retry;
    let called = Arc::new(AtomicBool::new(false));
    let next = Next {
        rest: Some(cursor.advanced()),
        called: Arc::clone(&called),
    };

    let stage_name = cursor.stage.name.clone();
    scheduled.helper.apply(args, next).and_then(move |result| {
        if shared.is_paused() {
            return MaybeAsync::ok(());
        }
        match result {
            Ok(effect) => {
                lock(&shared.inner_failure).take();
                if let Some(rollback) = effect.rollback {
                    lock(&shared.completed).push(CompletedHelper {
                        key: scheduled.key.clone(),
                        stage: stage_name,
                        rollback,
                    });
                }
                if let Some(request) = effect.pause {
                    *lock(&shared.pause) = Some((index, request));
                    return MaybeAsync::ok(());
                }
                if called.load(Ordering::SeqCst) {
                    MaybeAsync::ok(())
                } else {
                    run_chain(cursor.advanced(), None, None)
                }
            }
            Err(error) => {
                let failure = lock(&shared.inner_failure).take().unwrap_or(ChainFailure {
                    index,
                    helper: scheduled.key.clone(),
                    error,
                });
                MaybeAsync::err(failure)
            }
        }
    })
}

/// One run of a recipe pipeline.
pub struct PipelineRun {
    plan: Arc<StagePlan>,
    stages: Vec<Arc<Stage>>,
    context: Arc<RunContext>,
    input: Arc<serde_json::Value>,
    state: UserState,
    reporter: Reporter,
    cursor: Cursor,
    completed: Vec<CompletedHelper>,
    visited: BTreeSet<String>,
    pause: Option<PauseRequest>,
    retry: Option<RetryPauseSignal>,
    artefact: Option<Artefact>,
    finished: bool,
}

impl PipelineRun {
    pub fn new(plan: Arc<StagePlan>, context: Arc<RunContext>, input: serde_json::Value, reporter: Reporter) -> Self {
        let stages = plan.stages.iter().cloned().map(Arc::new).collect();
        Self {
            plan,
            stages,
            context,
            input: Arc::new(input),
            state: UserState::new(),
            reporter,
            cursor: Cursor::default(),
            completed: Vec::new(),
            visited: BTreeSet::new(),
            pause: None,
            retry: None,
            artefact: None,
            finished: false,
        }
    }

    /// Rebuild a paused run from its snapshot. Rollbacks registered before
    /// the pause do not survive serialization.
    pub fn restore(
        snapshot: PipelineSnapshot,
        plan: Arc<StagePlan>,
        context: Arc<RunContext>,
        reporter: Reporter,
    ) -> RecipeResult<Self> {
        if snapshot.recipe != plan.recipe {
            return Err(RecipeError::Internal(format!(
                "snapshot belongs to recipe \"{}\", not \"{}\"",
                snapshot.recipe, plan.recipe
            )));
        }
        if snapshot.cursor.stage >= plan.stages.len() {
            return Err(RecipeError::Internal(format!(
                "snapshot cursor stage {} is out of range",
                snapshot.cursor.stage
            )));
        }
        reporter.report_all(snapshot.diagnostics);
        let mut run = Self::new(plan, context, snapshot.input, reporter);
        run.state = UserState::from_map(snapshot.state);
        run.cursor = snapshot.cursor;
        run.visited = snapshot.visited.into_iter().collect();
        run.pause = snapshot.pause;
        run.retry = snapshot.retry;
        Ok(run)
    }

    pub fn snapshot(&self) -> PipelineSnapshot {
        PipelineSnapshot {
            recipe: self.plan.recipe.clone(),
            run_id: self.context.run_id,
            cursor: self.cursor,
            input: self.input.as_ref().clone(),
            state: self.state.snapshot(),
            visited: self.visited.iter().cloned().collect(),
            diagnostics: self.reporter.diagnostics(),
            pause: self.pause.clone(),
            retry: self.retry.clone(),
        }
    }

    pub fn run_id(&self) -> RunId {
        self.context.run_id
    }

    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    pub fn state(&self) -> &UserState {
        &self.state
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn base_args(&self, stage: &Stage) -> HelperArgs {
        HelperArgs {
            context: Arc::clone(&self.context),
            input: Arc::clone(&self.input),
            output: self.state.clone(),
            reporter: self.reporter.clone(),
            resume_input: None,
            retry: None,
            stage: stage.name.clone(),
            helper: String::new(),
        }
    }

    /// Project the user state onto the contract's artefact keys.
    fn project(&self, report_missing: bool) -> Artefact {
        let state = self.state.snapshot();
        if self.plan.artefact_keys.is_empty() {
            return state;
        }
        let mut artefact = Artefact::new();
        for key in &self.plan.artefact_keys {
            match state.get(key) {
                Some(value) => {
                    artefact.insert(key.clone(), value.clone());
                }
                None if report_missing => self.reporter.report(
                    Diagnostic::warn(
                        DiagnosticKind::Recipe,
                        format!("Recipe \"{}\" did not produce artefact \"{}\".", self.plan.recipe, key),
                    )
                    .with_code("artefact_missing")
                    .with_subject(key.as_str()),
                ),
                None => {}
            }
        }
        artefact
    }

    fn report_unused_helpers(&self) {
        for helper in &self.plan.registered {
            if self.visited.contains(&helper.key) {
                continue;
            }
            self.reporter.report(
                Diagnostic::warn(
                    DiagnosticKind::Pipeline,
                    format!(
                        "Helper \"{}\" ({}) was registered but never ran; dependsOn: [{}].",
                        helper.key,
                        helper.kind,
                        helper.depends_on.join(", ")
                    ),
                )
                .with_code("helper_unused")
                .with_subject(helper.key.as_str())
                .with_data(json!({
                    "kind": helper.kind,
                    "plugin": helper.plugin,
                    "dependsOn": helper.depends_on,
                })),
            );
        }
    }

    /// Undo completed helpers in reverse completion order.
    async fn rollback(&mut self) {
        while let Some(completed) = self.completed.pop() {
            self.reporter.event(
                names::HELPER_ROLLBACK,
                json!({ "stage": completed.stage, "helper": completed.key }),
            );
            if let Err(error) = completed.rollback.run().await {
                tracing::warn!(helper = %completed.key, error = %error, "Rollback failed");
                self.reporter.report(
                    Diagnostic::warn(
                        DiagnosticKind::Pipeline,
                        format!("Rollback of helper \"{}\" failed: {}", completed.key, error),
                    )
                    .with_code("rollback_failed")
                    .with_subject(completed.key.as_str()),
                );
            }
        }
    }

    /// Advance the run until it finishes, fails or pauses.
    ///
    /// `resume_input` reaches only the helper that paused.
    pub async fn step(&mut self, resume_input: Option<serde_json::Value>) -> Step {
        if self.finished {
            return Step::Done(Err(RecipeError::Internal("run has already finished".to_string())));
        }
        // Only the helper that paused may see resume input.
        let mut resume_input = self.pause.as_ref().and(resume_input);
        let mut retry = self.retry.take();

        while let Some(stage) = self.stages.get(self.cursor.stage).cloned() {
            if self.cursor.helper == 0 && resume_input.is_none() && retry.is_none() {
                self.reporter.event(names::STAGE_START, json!({ "stage": stage.name }));
            }

            if stage.kind == StageKind::Finalize {
                self.artefact = Some(self.project(true));
            } else {
                let shared = Arc::new(ChainShared::default());
                let chain = ChainCursor {
                    stage: Arc::clone(&stage),
                    index: self.cursor.helper,
                    args: self.base_args(&stage),
                    shared: Arc::clone(&shared),
                };
                let result = run_chain(chain, resume_input.take(), retry.take()).await;

                self.completed.append(&mut lock(&shared.completed));
                self.visited.extend(lock(&shared.visited).drain(..));

                if let Some((index, request)) = lock(&shared.pause).take() {
                    self.cursor.helper = index;
                    self.reporter.event(
                        names::HELPER_PAUSE,
                        json!({
                            "stage": stage.name,
                            "helper": stage.helpers.get(index).map(|h| h.key.clone()),
                            "token": request.token,
                            "pauseKind": request.pause_kind,
                        }),
                    );
                    self.pause = Some(request.clone());
                    return Step::Yield(Yielded::Paused(request));
                }

                if let Err(failure) = result {
                    return self.fail(&stage, failure).await;
                }
                self.pause = None;
            }

            self.reporter.event(names::STAGE_END, json!({ "stage": stage.name }));
            self.cursor = Cursor {
                stage: self.cursor.stage + 1,
                helper: 0,
            };
        }

        self.finished = true;
        self.report_unused_helpers();
        Step::Done(Ok(self.artefact.take().unwrap_or_else(|| self.project(true))))
    }

    async fn fail(&mut self, stage: &Stage, failure: ChainFailure) -> Step {
        match failure.error {
            StageError::RetryPause(mut signal) => {
                // The failing helper runs again if the run is resumed.
                self.cursor.helper = failure.index;
                signal.resume_token = Some(retry_token(self.context.run_id));
                tracing::info!(
                    stage = %stage.name,
                    helper = %failure.helper,
                    attempt = signal.attempt,
                    "Stage deferred by retry pause"
                );
                self.retry = Some(signal.as_ref().clone());
                Step::Done(Err(RecipeError::RetryPaused(signal)))
            }
            error => {
                tracing::warn!(stage = %stage.name, helper = %failure.helper, error = %error, "Stage failed");
                self.rollback().await;
                self.finished = true;
                Step::Done(Err(RecipeError::Stage {
                    stage: stage.name.clone(),
                    helper: failure.helper,
                    source: error,
                }))
            }
        }
    }
}

#[async_trait]
impl Producer for PipelineRun {
    async fn step(&mut self, input: Option<serde_json::Value>) -> Step {
        PipelineRun::step(self, input).await
    }

    fn snapshot(&self) -> Option<serde_json::Value> {
        serde_json::to_value(PipelineRun::snapshot(self)).ok()
    }

    fn diagnostics(&self) -> Vec<Diagnostic> {
        self.reporter.diagnostics()
    }

    fn partial_artefact(&self) -> Artefact {
        self.project(false)
    }

    fn drain_trace(&mut self) -> Trace {
        self.reporter.drain_trace()
    }

    fn is_resumable(&self) -> bool {
        !self.finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::AdapterBundle;
    use crate::contract::RecipeContract;
    use crate::helper::{helper_fn, HelperEffect, HelperSpec};
    use crate::plugin::{collect_registrations, Plugin};
    use crate::retry::RetryExecutor;
    use crate::stage_builder::build_stages;
    use recipe_types::RetryReason;

    fn run_for(contract: RecipeContract, plugins: Vec<Plugin>, input: serde_json::Value) -> PipelineRun {
        let plan = Arc::new(build_stages(&contract, &collect_registrations(&plugins)));
        let context = Arc::new(RunContext::new(
            contract.name.clone(),
            RunId::generate(),
            AdapterBundle::new(),
            RetryExecutor::default(),
        ));
        PipelineRun::new(plan, context, input, Reporter::new())
    }

    fn push_log(tag: &'static str) -> Arc<dyn crate::Helper> {
        helper_fn(move |args, _| {
            args.output.update(|state| {
                let log = state.entry("log").or_insert_with(|| json!([]));
                if let Some(items) = log.as_array_mut() {
                    items.push(json!(tag));
                }
            });
            MaybeAsync::ok(HelperEffect::none())
        })
    }

    fn log_of(artefact: &Artefact) -> Vec<String> {
        artefact["log"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect()
    }

    #[tokio::test]
    async fn runs_helpers_in_order_and_projects_artefact() {
        let contract = RecipeContract::new("etl")
            .with_helper_kind("extract")
            .with_helper_kind("load")
            .with_artefact_key("log");
        let plugins = vec![Plugin::new("p")
            .with_helper(HelperSpec::new("write", "load", push_log("write")))
            .with_helper(HelperSpec::new("read", "extract", push_log("read")))];
        let mut run = run_for(contract, plugins, json!({}));

        let Step::Done(Ok(artefact)) = run.step(None).await else {
            panic!("expected completion");
        };
        assert_eq!(log_of(&artefact), ["read", "write"]);
        assert!(run.is_finished());
    }

    #[tokio::test]
    async fn middleware_wraps_the_rest_of_the_chain() {
        let contract = RecipeContract::new("etl").with_helper_kind("load").with_artefact_key("log");
        let around = helper_fn(|args, next| {
            let state = args.output.clone();
            MaybeAsync::from_future(async move {
                state.update(|s| s.insert("log".into(), json!(["before"])));
                next.run().await?;
                state.update(|s| {
                    if let Some(items) = s.get_mut("log").and_then(|l| l.as_array_mut()) {
                        items.push(json!("after"));
                    }
                });
                Ok(HelperEffect::none())
            })
        });
        let plugins = vec![Plugin::new("p")
            .with_helper(HelperSpec::new("around", "load", around).with_priority(10))
            .with_helper(HelperSpec::new("inner", "load", push_log("inner")))];
        let mut run = run_for(contract, plugins, json!({}));

        let Step::Done(Ok(artefact)) = run.step(None).await else {
            panic!("expected completion");
        };
        assert_eq!(log_of(&artefact), ["before", "inner", "after"]);
    }

    #[tokio::test]
    async fn failure_rolls_back_in_reverse_completion_order() {
        let undone = Arc::new(Mutex::new(Vec::new()));
        let with_rollback = |tag: &'static str| {
            let undone = Arc::clone(&undone);
            helper_fn(move |_, _| {
                let undone = Arc::clone(&undone);
                MaybeAsync::ok(HelperEffect::with_rollback(Rollback::sync(move || {
                    undone.lock().unwrap().push(tag);
                    Ok(())
                })))
            })
        };
        let failing = helper_fn(|_, _| MaybeAsync::err(StageError::message("disk full")));
        let contract = RecipeContract::new("etl").with_helper_kind("extract").with_helper_kind("load");
        let plugins = vec![Plugin::new("p")
            .with_helper(HelperSpec::new("a", "extract", with_rollback("a")))
            .with_helper(HelperSpec::new("b", "extract", with_rollback("b")))
            .with_helper(HelperSpec::new("c", "load", with_rollback("c")))
            .with_helper(HelperSpec::new("boom", "load", failing))];
        let mut run = run_for(contract, plugins, json!({}));

        let Step::Done(Err(error)) = run.step(None).await else {
            panic!("expected failure");
        };
        assert_eq!(error.code(), "stage.failed");
        assert!(matches!(&error, RecipeError::Stage { helper, .. } if helper == "boom"));
        assert_eq!(*undone.lock().unwrap(), ["c", "b", "a"]);
        assert_eq!(run.reporter.drain_trace().count(names::HELPER_ROLLBACK), 3);
    }

    #[tokio::test]
    async fn pause_snapshot_restore_and_resume() {
        let gate = helper_fn(|args, _| {
            let Some(decision) = args.resume_input.clone() else {
                return MaybeAsync::ok(HelperEffect::pause(PauseRequest::new("T", "approval")));
            };
            args.output.set("decision", decision);
            MaybeAsync::ok(HelperEffect::none())
        });
        let contract = RecipeContract::new("gate")
            .with_helper_kind("approve")
            .with_artefact_key("decision")
            .with_artefact_key("log");
        let plugins = vec![Plugin::new("p")
            .with_helper(HelperSpec::new("prepare", "approve", push_log("prepare")).with_priority(1))
            .with_helper(HelperSpec::new("gate", "approve", gate))
            .with_helper(HelperSpec::new("after", "approve", push_log("after")).depends_on("gate"))];
        let mut run = run_for(contract.clone(), plugins.clone(), json!({"doc": 1}));

        let Step::Yield(Yielded::Paused(request)) = run.step(None).await else {
            panic!("expected pause");
        };
        assert_eq!(request.token, PauseToken::new("T"));
        assert_eq!(run.cursor(), Cursor { stage: 0, helper: 1 });
        assert_eq!(log_of(&run.project(false)), ["prepare"]);

        let snapshot = run.snapshot();
        let encoded = serde_json::to_value(&snapshot).unwrap();
        let decoded: PipelineSnapshot = serde_json::from_value(encoded).unwrap();
        let plan = Arc::new(build_stages(&contract, &collect_registrations(&plugins)));
        let context = Arc::new(RunContext::new("gate", decoded.run_id, AdapterBundle::new(), RetryExecutor::default()));
        let mut restored = PipelineRun::restore(decoded, plan, context, Reporter::new()).unwrap();

        let Step::Done(Ok(artefact)) = restored.step(Some(json!("approved"))).await else {
            panic!("expected completion");
        };
        assert_eq!(artefact["decision"], json!("approved"));
        assert_eq!(log_of(&artefact), ["prepare", "after"]);
        assert!(restored.diagnostics().iter().all(|d| !d.has_code("helper_unused")));
    }

    #[tokio::test]
    async fn retry_pause_defers_the_helper_across_a_snapshot() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let calls = Arc::clone(&seen);
        let call_model = helper_fn(move |args, _| {
            calls.lock().unwrap().push(args.retry.as_ref().map(|signal| signal.attempt));
            if args.retry.is_some() {
                args.output.set("answer", json!("done"));
                return MaybeAsync::ok(HelperEffect::none());
            }
            MaybeAsync::err(StageError::RetryPause(Box::new(RetryPauseSignal {
                adapter_kind: "model".into(),
                method: "generate".into(),
                attempt: 1,
                max_attempts: 3,
                delay_ms: 500,
                retry_at: chrono::Utc::now(),
                reason: RetryReason::RateLimit,
                resume_token: None,
            })))
        });
        let contract = RecipeContract::new("rag")
            .with_helper_kind("retrieve")
            .with_helper_kind("generate")
            .with_artefact_key("answer")
            .with_artefact_key("log");
        let plugins = vec![Plugin::new("p")
            .with_helper(HelperSpec::new("search", "retrieve", push_log("search")))
            .with_helper(HelperSpec::new("call-model", "generate", call_model))];
        let mut run = run_for(contract.clone(), plugins.clone(), json!({}));

        let Step::Done(Err(RecipeError::RetryPaused(signal))) = run.step(None).await else {
            panic!("expected retry pause");
        };
        assert_eq!(signal.resume_token, Some(retry_token(run.run_id())));
        assert_eq!(run.cursor(), Cursor { stage: 1, helper: 0 });
        assert!(!run.is_finished());

        let encoded = serde_json::to_value(run.snapshot()).unwrap();
        let decoded: PipelineSnapshot = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded.retry.as_ref().map(|signal| signal.attempt), Some(1));
        let plan = Arc::new(build_stages(&contract, &collect_registrations(&plugins)));
        let context = Arc::new(RunContext::new("rag", decoded.run_id, AdapterBundle::new(), RetryExecutor::default()));
        let mut restored = PipelineRun::restore(decoded, plan, context, Reporter::new()).unwrap();

        let Step::Done(Ok(artefact)) = restored.step(None).await else {
            panic!("expected completion");
        };
        assert_eq!(artefact["answer"], json!("done"));
        assert_eq!(log_of(&artefact), ["search"]);
        assert_eq!(*seen.lock().unwrap(), [None, Some(1)]);
    }

    #[tokio::test]
    async fn unused_helpers_are_reported_with_dependencies() {
        let contract = RecipeContract::new("etl").with_helper_kind("load");
        let plugins = vec![Plugin::new("p")
            .with_helper(HelperSpec::new("write", "load", push_log("write")).depends_on("connect"))];
        let mut run = run_for(contract, plugins, json!({}));

        assert!(matches!(run.step(None).await, Step::Done(Ok(_))));
        let unused: Vec<Diagnostic> = run
            .reporter
            .diagnostics()
            .into_iter()
            .filter(|d| d.has_code("helper_unused"))
            .collect();
        assert_eq!(unused.len(), 1);
        assert_eq!(unused[0].data["dependsOn"], json!(["connect"]));
    }

    #[tokio::test]
    async fn missing_artefact_keys_warn() {
        let contract = RecipeContract::new("rag").with_artefact_key("answer");
        let mut run = run_for(contract, Vec::new(), json!({}));
        assert!(matches!(run.step(None).await, Step::Done(Ok(_))));
        assert!(run.reporter.diagnostics()[0].has_code("artefact_missing"));
    }
}
