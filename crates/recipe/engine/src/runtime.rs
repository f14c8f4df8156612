//! Recipe runtime: the facade callers construct once per contract
//!
//! Building a runtime composes the plugins, collects their registrations
//! and fixes the stage plan. Each `run` then resolves adapters, checks the
//! contract against what was resolved, executes the pipeline and settles
//! the outcome. `resume` re-enters a paused run, either from the live
//! session table or from a durable snapshot.

use crate::adapter::AdapterBundle;
use crate::config::RuntimeConfig;
use crate::context::RunContext;
use crate::contract::RecipeContract;
use crate::driver::{DriveContext, Driver, ErrorHandler, SessionOrigin};
use crate::pipeline::{PipelineRun, PipelineSnapshot, RETRY_PAUSE_KIND};
use crate::plugin::{
    build_capabilities, collect_registrations, compose_plugins, merge_adapters, missing_requirements, Plugin,
    PluginComposition, PluginRef,
};
use crate::provider::{resolve, ProviderRegistration, ProviderRegistry, Resolution, ResolveRequest};
use crate::registry::RecipeRegistry;
use crate::resume::{resume_adapter_from_bundle, ResumeAdapter, ResumeRequest};
use crate::retry::RetryExecutor;
use crate::session::{SessionLease, SessionRegistry};
use crate::stage_builder::{build_stages, StagePlan};
use crate::telemetry;
use crate::Reporter;
use recipe_types::{
    apply_diagnostics_mode, names, CapabilityKey, CapabilitySet, ConstructRequirement, Diagnostic,
    DiagnosticsMode, EventStream, InteractionSequencer, Outcome, OutcomeStatus, PauseToken, RecipeError,
    RecipeResult, RunId, Trace, TraceEvent,
};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

// ── Options ─────────────────────────────────────────────────────────────

/// Construction-time options of a [`RecipeRuntime`].
#[derive(Clone, Default)]
pub struct RuntimeOptions {
    pub config: RuntimeConfig,
    pub providers: ProviderRegistry,
    /// Constructs every run resolves, besides the contract's minimum capabilities
    pub constructs: Vec<ConstructRequirement>,
    pub session_registry: SessionRegistry,
    /// Wins over any resume adapter found in the resolved bundle
    pub resume_adapter: Option<Arc<dyn ResumeAdapter>>,
    pub event_stream: Option<Arc<dyn EventStream>>,
}

impl RuntimeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_provider(mut self, registration: ProviderRegistration) -> Self {
        self.providers.register(registration);
        self
    }

    pub fn with_construct(mut self, requirement: ConstructRequirement) -> Self {
        self.constructs.push(requirement);
        self
    }

    pub fn with_session_registry(mut self, registry: SessionRegistry) -> Self {
        self.session_registry = registry;
        self
    }

    pub fn with_resume_adapter(mut self, adapter: Arc<dyn ResumeAdapter>) -> Self {
        self.resume_adapter = Some(adapter);
        self
    }

    pub fn with_event_stream(mut self, stream: Arc<dyn EventStream>) -> Self {
        self.event_stream = Some(stream);
        self
    }
}

impl fmt::Debug for RuntimeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeOptions")
            .field("config", &self.config)
            .field("providers", &self.providers.len())
            .field("constructs", &self.constructs)
            .field("session_registry", &self.session_registry)
            .field("resume_adapter", &self.resume_adapter.is_some())
            .field("event_stream", &self.event_stream.is_some())
            .finish()
    }
}

/// Per-call options of `run` and `resume`.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Overrides the configured diagnostics mode
    pub diagnostics: Option<DiagnosticsMode>,
    /// Explicit provider id per construct
    pub provider_overrides: BTreeMap<CapabilityKey, String>,
    /// Sequencer of the interaction issuing the call
    pub interaction: Option<Arc<InteractionSequencer>>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn strict() -> Self {
        Self::new().with_diagnostics(DiagnosticsMode::Strict)
    }

    pub fn with_diagnostics(mut self, mode: DiagnosticsMode) -> Self {
        self.diagnostics = Some(mode);
        self
    }

    pub fn with_provider_override(mut self, construct: impl Into<CapabilityKey>, provider_id: impl Into<String>) -> Self {
        self.provider_overrides.insert(construct.into(), provider_id.into());
        self
    }

    pub fn with_interaction(mut self, sequencer: Arc<InteractionSequencer>) -> Self {
        self.interaction = Some(sequencer);
        self
    }
}

/// What a runtime was built from, for inspection.
#[derive(Debug, Clone, Serialize)]
pub struct Explanation {
    pub recipe: String,
    pub effective_plugins: Vec<String>,
    pub overridden: Vec<PluginRef>,
    pub unused: Vec<PluginRef>,
    pub missing_requirements: Vec<Diagnostic>,
    pub stages: Vec<String>,
    pub diagnostics: Vec<Diagnostic>,
}

// ── Runtime ─────────────────────────────────────────────────────────────

/// Runs one recipe contract with a fixed set of plugins.
pub struct RecipeRuntime {
    contract: Arc<RecipeContract>,
    composition: PluginComposition,
    providers: ProviderRegistry,
    constructs: Vec<ConstructRequirement>,
    defaults: AdapterBundle,
    declared: CapabilitySet,
    plan: Arc<StagePlan>,
    build_diagnostics: Vec<Diagnostic>,
    config: RuntimeConfig,
    driver: Driver,
    resume_adapter: Option<Arc<dyn ResumeAdapter>>,
    event_stream: Option<Arc<dyn EventStream>>,
}

impl RecipeRuntime {
    pub fn new(contract: Arc<RecipeContract>, plugins: Vec<Plugin>, options: RuntimeOptions) -> Self {
        telemetry::init_tracing(&options.config.telemetry);

        let mut all = contract.default_plugins.clone();
        all.extend(plugins);
        let composition = compose_plugins(&all);
        let registrations = collect_registrations(&composition.effective);

        let mut providers = options.providers;
        providers.extend(&registrations.providers);

        let mut constructs = options.constructs;
        for key in &contract.minimum_capabilities {
            if !constructs.iter().any(|c| &c.name == key) {
                constructs.push(ConstructRequirement::optional(key.clone()));
            }
        }

        let plan = build_stages(&contract, &registrations);
        let mut build_diagnostics = plan.diagnostics.clone();
        build_diagnostics.extend(composition.diagnostics());

        tracing::info!(
            recipe = %contract.name,
            plugins = composition.effective.len(),
            stages = plan.stages.len(),
            diagnostics = build_diagnostics.len(),
            "Recipe runtime built"
        );

        Self {
            defaults: merge_adapters(&composition.effective),
            declared: build_capabilities(&composition.effective),
            contract,
            composition,
            providers,
            constructs,
            plan: Arc::new(plan),
            build_diagnostics,
            driver: Driver::new(options.session_registry),
            config: options.config,
            resume_adapter: options.resume_adapter,
            event_stream: options.event_stream,
        }
    }

    /// Build a runtime for a contract looked up by name.
    pub fn from_registry(
        registry: &RecipeRegistry,
        recipe: &str,
        plugins: Vec<Plugin>,
        options: RuntimeOptions,
    ) -> RecipeResult<Self> {
        Ok(Self::new(registry.get(recipe)?, plugins, options))
    }

    /// Map every error before it reaches an outcome.
    pub fn with_error_handler(mut self, handler: ErrorHandler) -> Self {
        self.driver = self.driver.with_error_handler(handler);
        self
    }

    pub fn contract(&self) -> &RecipeContract {
        &self.contract
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn sessions(&self) -> &SessionRegistry {
        self.driver.sessions()
    }

    /// Capabilities declared by the effective plugins.
    pub fn capabilities(&self) -> CapabilitySet {
        self.declared.clone()
    }

    pub fn explain(&self) -> Explanation {
        let available = self.available_capabilities(&self.defaults);
        let mut diagnostics = self.build_diagnostics.clone();
        diagnostics.extend(self.contract.check_minimum_capabilities(&available));
        Explanation {
            recipe: self.contract.name.clone(),
            effective_plugins: self.composition.effective.iter().map(|p| p.key.clone()).collect(),
            overridden: self.composition.overridden.clone(),
            unused: self.composition.unused.clone(),
            missing_requirements: missing_requirements(&self.composition.effective, &available),
            stages: self.plan.stage_names(),
            diagnostics,
        }
    }

    /// Drop pause sessions older than the configured TTL.
    pub async fn sweep_sessions(&self) -> RecipeResult<usize> {
        self.sessions()
            .sweep(self.config.sessions.ttl())
            .await
            .map_err(|e| RecipeError::SessionStore(e.to_string()))
    }

    fn mode(&self, options: &RunOptions) -> DiagnosticsMode {
        options.diagnostics.unwrap_or(self.config.diagnostics)
    }

    fn retry_executor(&self) -> RetryExecutor {
        RetryExecutor::new(self.config.retry.policy.clone())
    }

    async fn resolve(&self, overrides: &BTreeMap<CapabilityKey, String>) -> Resolution {
        resolve(ResolveRequest {
            constructs: &self.constructs,
            providers: &self.providers,
            defaults: &self.defaults,
            overrides,
            declared: &self.declared,
        })
        .await
    }

    /// Declared capabilities plus every key that has an adapter.
    fn available_capabilities(&self, adapters: &AdapterBundle) -> CapabilitySet {
        let mut capabilities = self.declared.clone();
        for key in adapters.keys() {
            if !capabilities.has(key) {
                capabilities.set(key.clone(), true);
            }
        }
        capabilities
    }

    fn drive_context(&self, mode: DiagnosticsMode, adapters: AdapterBundle, lead: Trace) -> DriveContext {
        DriveContext {
            recipe: self.contract.name.clone(),
            mode,
            adapters,
            pause_supported: self.contract.can_pause(),
            lead,
        }
    }

    // ── Run ─────────────────────────────────────────────────────────────

    /// Execute the recipe once.
    pub async fn run(&self, input: serde_json::Value, options: RunOptions) -> Outcome {
        let mode = self.mode(&options);
        let run_id = RunId::generate();
        let recipe = self.contract.name.as_str();
        tracing::info!(recipe = %recipe, run_id = %run_id, mode = ?mode, "Recipe run started");

        let reporter = Reporter::new();
        reporter.event(names::RUN_START, json!({ "recipe": recipe, "runId": run_id }));
        reporter.report_all(self.build_diagnostics.iter().cloned());

        let resolution = self.resolve(&options.provider_overrides).await;
        reporter.report_all(resolution.diagnostics);
        let available = self.available_capabilities(&resolution.adapters);
        reporter.report_all(self.contract.check_minimum_capabilities(&available));
        reporter.report_all(missing_requirements(&self.composition.effective, &available));

        let context = Arc::new(RunContext::new(
            recipe,
            run_id,
            resolution.adapters.clone(),
            self.retry_executor(),
        ));
        let run = PipelineRun::new(Arc::clone(&self.plan), context, input, reporter);
        let ctx = self.drive_context(mode, resolution.adapters, Trace::new());

        let outcome = self.driver.drive(Box::new(run), None, ctx, SessionOrigin::Fresh).await;
        self.publish(&options, &run_id.to_string(), &outcome).await;
        outcome
    }

    // ── Resume ──────────────────────────────────────────────────────────

    /// Re-enter the run paused under `token` with `input`.
    ///
    /// Live sessions are tried first; a configured store is consulted
    /// only when no live session exists. Failures never delete a session.
    pub async fn resume(&self, token: impl Into<PauseToken>, input: serde_json::Value, options: RunOptions) -> Outcome {
        let token = token.into();
        let mode = self.mode(&options);
        tracing::info!(recipe = %self.contract.name, token = %token, "Resume requested");

        let mut lead = Trace::new();
        lead.push(TraceEvent::new(names::RESUME_START).with_data(json!({
            "recipe": self.contract.name,
            "token": token,
        })));

        let outcome = if let Some(lease) = self.sessions().checkout(&token).await {
            self.resume_live(lease, input, mode, lead).await
        } else if self.sessions().store().is_some() {
            self.resume_stored(token.clone(), input, mode, lead, &options).await
        } else {
            self.failed(RecipeError::InvalidToken(token.clone()), mode, lead, Vec::new())
        };
        self.publish(&options, token.as_str(), &outcome).await;
        outcome
    }

    async fn resume_live(
        &self,
        mut lease: SessionLease,
        input: serde_json::Value,
        mode: DiagnosticsMode,
        lead: Trace,
    ) -> Outcome {
        let prior = lease.producer().map(|p| p.diagnostics()).unwrap_or_default();
        let adapters = lease.meta().adapters.clone();

        let request = ResumeRequest {
            token: lease.token().clone(),
            resume_input: input,
            pause_kind: lease.meta().pause_kind.clone(),
            resume_snapshot: None,
            adapters: adapters.clone(),
            providers: self.providers.clone(),
        };
        let resolved = match self.resume_input(request).await {
            Ok(value) => value,
            Err(error) => return self.failed(error, mode, lead, prior),
        };

        let Some(producer) = lease.take_producer() else {
            return self.failed(
                RecipeError::Internal("pause session has no producer".to_string()),
                mode,
                lead,
                prior,
            );
        };
        let ctx = self.drive_context(mode, adapters, lead);
        self.driver
            .drive(producer, Some(resolved), ctx, SessionOrigin::Live(lease))
            .await
    }

    async fn resume_stored(
        &self,
        token: PauseToken,
        input: serde_json::Value,
        mode: DiagnosticsMode,
        lead: Trace,
        options: &RunOptions,
    ) -> Outcome {
        let sessions = self.sessions();
        let store_error = |error: recipe_storage::StoreError| RecipeError::SessionStore(error.to_string());

        // Stale tokens fail here, before adapters are resolved.
        if self.config.sessions.fail_fast_store_check {
            match sessions.exists_in_store(&token).await {
                Ok(true) => {}
                Ok(false) => return self.failed(RecipeError::InvalidToken(token), mode, lead, Vec::new()),
                Err(error) => return self.failed(store_error(error), mode, lead, Vec::new()),
            }
        }

        let resolution = self.resolve(&options.provider_overrides).await;

        let record = match sessions.stored(&token).await {
            Ok(Some(record)) => record,
            Ok(None) => return self.failed(RecipeError::InvalidToken(token), mode, lead, Vec::new()),
            Err(error) => return self.failed(store_error(error), mode, lead, Vec::new()),
        };
        let snapshot: PipelineSnapshot = match serde_json::from_value(record.snapshot.clone()) {
            Ok(snapshot) => snapshot,
            Err(error) => {
                let error = RecipeError::SessionStore(format!("unreadable snapshot for '{}': {}", token, error));
                return self.failed(error, mode, lead, Vec::new());
            }
        };
        let prior = snapshot.diagnostics.clone();

        let request = ResumeRequest {
            token: token.clone(),
            resume_input: input,
            pause_kind: record.pause_kind.clone(),
            resume_snapshot: Some(record.snapshot),
            adapters: resolution.adapters.clone(),
            providers: self.providers.clone(),
        };
        let resolved = match self.resume_input(request).await {
            Ok(value) => value,
            Err(error) => return self.failed(error, mode, lead, prior),
        };

        let reporter = Reporter::new();
        let context = Arc::new(RunContext::new(
            self.contract.name.as_str(),
            snapshot.run_id,
            resolution.adapters.clone(),
            self.retry_executor(),
        ));
        let run = match PipelineRun::restore(snapshot, Arc::clone(&self.plan), context, reporter.clone()) {
            Ok(run) => run,
            Err(error) => return self.failed(error, mode, lead, prior),
        };
        // Provider configuration may have changed since the pause.
        let fresh: Vec<Diagnostic> = resolution
            .diagnostics
            .into_iter()
            .filter(|d| !prior.contains(d))
            .collect();
        reporter.report_all(fresh);
        tracing::debug!(token = %token, cursor = ?run.cursor(), "Pipeline restored from snapshot");

        let ctx = self.drive_context(mode, resolution.adapters, lead);
        self.driver
            .drive(Box::new(run), Some(resolved), ctx, SessionOrigin::Stored(token))
            .await
    }

    /// Turn caller input into the value the paused helper sees. Retry
    /// sessions wait on time, not on a person, so their input passes
    /// through without a resume adapter.
    async fn resume_input(&self, request: ResumeRequest) -> RecipeResult<serde_json::Value> {
        if request.pause_kind == RETRY_PAUSE_KIND {
            return Ok(request.resume_input);
        }
        let adapter = self
            .resume_adapter
            .clone()
            .or_else(|| resume_adapter_from_bundle(&request.adapters))
            .ok_or(RecipeError::MissingResumeAdapter)?;
        let token = request.token.clone();
        adapter.resolve(request).await.map_err(|error| {
            tracing::warn!(token = %token, error = %error, "Resume adapter failed");
            RecipeError::ResumeAdapter(error)
        })
    }

    /// Error outcome for a call that never reached the pipeline.
    fn failed(&self, error: RecipeError, mode: DiagnosticsMode, mut trace: Trace, prior: Vec<Diagnostic>) -> Outcome {
        tracing::warn!(recipe = %self.contract.name, code = error.code(), error = %error, "Resume failed");
        trace.push(TraceEvent::new(names::RUN_ERROR).with_data(json!({
            "code": error.code(),
            "message": error.to_string(),
        })));
        trace.push(TraceEvent::new(names::RUN_END).with_data(json!({ "status": OutcomeStatus::Error })));
        Outcome::Error {
            error,
            trace,
            diagnostics: apply_diagnostics_mode(prior, mode),
        }
    }

    async fn publish(&self, options: &RunOptions, correlation_id: &str, outcome: &Outcome) {
        if !self.config.telemetry.emit_events {
            return;
        }
        if let (Some(stream), Some(sequencer)) = (&self.event_stream, &options.interaction) {
            telemetry::externalize(stream.as_ref(), sequencer, correlation_id, outcome).await;
        }
    }
}

impl fmt::Debug for RecipeRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecipeRuntime")
            .field("recipe", &self.contract.name)
            .field("plugins", &self.composition.effective.len())
            .field("stages", &self.plan.stage_names())
            .field("sessions", self.driver.sessions())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::helper::{helper_fn, HelperEffect, HelperSpec, PauseRequest};
    use crate::recipes;
    use recipe_types::{DiagnosticKind, MaybeAsync};

    fn answer_plugin() -> Plugin {
        Plugin::new("answer")
            .with_adapter(CapabilityKey::Model, crate::adapter::AdapterInstance::single("echo"))
            .with_helper(HelperSpec::new(
                "generate",
                "generate",
                helper_fn(|args, _| {
                    args.output.set("documents", json!([]));
                    args.output.set("answer", json!("42"));
                    MaybeAsync::ok(HelperEffect::none())
                }),
            ))
    }

    #[test]
    fn test_explain_lists_stages_and_missing_minimums() {
        let runtime = RecipeRuntime::new(Arc::new(recipes::rag()), vec![answer_plugin()], RuntimeOptions::new());
        let explanation = runtime.explain();

        assert_eq!(explanation.effective_plugins, ["answer"]);
        assert_eq!(explanation.stages, ["helpers:retrieve", "helpers:generate", "finalize"]);
        assert!(explanation
            .diagnostics
            .iter()
            .any(|d| d.kind == DiagnosticKind::Contract && d.message == "Recipe \"rag\" requires capability \"retriever\"."));
        assert!(runtime.capabilities().has(&CapabilityKey::Model));
    }

    #[tokio::test]
    async fn test_run_reports_missing_capability_and_succeeds() {
        let runtime = RecipeRuntime::new(Arc::new(recipes::rag()), vec![answer_plugin()], RuntimeOptions::new());
        let outcome = runtime.run(json!({"question": "?"}), RunOptions::new()).await;

        assert!(outcome.is_ok());
        assert_eq!(outcome.artefact().unwrap()["answer"], json!("42"));
        let names = outcome.trace().names();
        assert_eq!(names.first(), Some(&names::RUN_START));
        assert_eq!(&names[names.len() - 2..], [names::RUN_OK, names::RUN_END]);
    }

    #[tokio::test]
    async fn test_resume_without_session_is_invalid_token() {
        let runtime = RecipeRuntime::new(Arc::new(recipes::hitl_gate()), Vec::new(), RuntimeOptions::new());
        let outcome = runtime.resume("missing", json!(true), RunOptions::new()).await;

        assert_eq!(outcome.error().unwrap().code(), "resume.invalidToken");
        assert_eq!(outcome.trace().names(), [names::RESUME_START, names::RUN_ERROR, names::RUN_END]);
    }

    #[tokio::test]
    async fn test_pause_in_non_resumable_recipe_warns() {
        let pausing = Plugin::new("pauser").with_helper(HelperSpec::new(
            "retrieve",
            "retrieve",
            helper_fn(|_, _| MaybeAsync::ok(HelperEffect::pause(PauseRequest::new("T", "review")))),
        ));
        let runtime = RecipeRuntime::new(Arc::new(recipes::rag()), vec![pausing], RuntimeOptions::new());
        let outcome = runtime.run(json!({}), RunOptions::new()).await;

        assert!(outcome.is_paused());
        assert!(outcome.diagnostics().iter().any(|d| d.has_code("recipe_pause_undeclared")));
    }
}
