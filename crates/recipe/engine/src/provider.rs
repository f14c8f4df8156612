//! Provider registry and capability-driven adapter resolution
//!
//! Providers are registered per construct (`model`, `retriever`, ...).
//! Resolution walks the construct requirements of a run, picks the
//! highest-priority provider for each (or the explicitly overridden one),
//! instantiates it through its factory and checks the instance's declared
//! dependencies. Nothing here is fatal: every problem becomes a diagnostic
//! and the caller decides what the diagnostics mean.

use crate::adapter::{AdapterBundle, AdapterInstance};
use recipe_types::{
    AdapterError, AdapterRequirement, CapabilityKey, CapabilitySet, ConstructRequirement,
    Diagnostic, DiagnosticKind, DiagnosticLevel, MaybeAsync,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

pub const CONSTRUCT_PROVIDER_NOT_FOUND: &str = "construct_provider_not_found";
pub const CONSTRUCT_PROVIDER_CONFLICT: &str = "construct_provider_conflict";
pub const CONSTRUCT_CAPABILITY_MISSING: &str = "construct_capability_missing";
pub const CONSTRUCT_DEPENDENCY_MISSING: &str = "construct_dependency_missing";
pub const CONSTRUCT_PROVIDER_MISSING: &str = "construct_provider_missing";
pub const CONSTRUCT_FACTORY_FAILED: &str = "construct_factory_failed";

/// Builds a fresh adapter instance. Called once per resolution; never cached.
pub type ProviderFactory = Arc<
    dyn Fn(&ConstructRequirement) -> MaybeAsync<'static, Result<AdapterInstance, AdapterError>>
        + Send
        + Sync,
>;

/// One provider able to satisfy a construct.
#[derive(Clone)]
pub struct ProviderRegistration {
    pub construct: CapabilityKey,
    pub provider_key: String,
    pub id: String,
    pub priority: i32,
    pub capabilities: Vec<String>,
    pub factory: ProviderFactory,
}

impl ProviderRegistration {
    pub fn new<F>(construct: impl Into<CapabilityKey>, id: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&ConstructRequirement) -> MaybeAsync<'static, Result<AdapterInstance, AdapterError>>
            + Send
            + Sync
            + 'static,
    {
        let id = id.into();
        Self {
            construct: construct.into(),
            provider_key: id.clone(),
            id,
            priority: 0,
            capabilities: Vec::new(),
            factory: Arc::new(factory),
        }
    }

    /// A provider whose factory hands out clones of a prepared instance.
    pub fn instance(
        construct: impl Into<CapabilityKey>,
        id: impl Into<String>,
        instance: AdapterInstance,
    ) -> Self {
        Self::new(construct, id, move |_| MaybeAsync::ok(instance.clone()))
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_provider_key(mut self, provider_key: impl Into<String>) -> Self {
        self.provider_key = provider_key.into();
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.push(capability.into());
        self
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }
}

impl fmt::Debug for ProviderRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistration")
            .field("construct", &self.construct)
            .field("provider_key", &self.provider_key)
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

/// Registered providers, in registration order.
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    providers: Vec<ProviderRegistration>,
    duplicates: Vec<ProviderRegistration>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, registration: ProviderRegistration) -> Self {
        self.register(registration);
        self
    }

    /// Register a provider. A second registration under an existing id is
    /// kept aside and reported as a conflict; the first one stays active.
    pub fn register(&mut self, registration: ProviderRegistration) {
        if self.providers.iter().any(|p| p.id == registration.id) {
            tracing::debug!(id = %registration.id, "Duplicate provider registration");
            self.duplicates.push(registration);
            return;
        }
        self.providers.push(registration);
    }

    pub fn extend(&mut self, other: &ProviderRegistry) {
        for registration in other.providers.iter().chain(other.duplicates.iter()) {
            self.register(registration.clone());
        }
    }

    pub fn providers_for(&self, construct: &CapabilityKey) -> Vec<&ProviderRegistration> {
        self.providers
            .iter()
            .filter(|p| &p.construct == construct)
            .collect()
    }

    pub fn find(&self, id: &str) -> Option<&ProviderRegistration> {
        self.providers.iter().find(|p| p.id == id)
    }

    pub fn duplicates(&self) -> &[ProviderRegistration] {
        &self.duplicates
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProviderRegistration> {
        self.providers.iter()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

/// Input to [`resolve`].
#[derive(Debug, Clone, Copy)]
pub struct ResolveRequest<'r> {
    pub constructs: &'r [ConstructRequirement],
    pub providers: &'r ProviderRegistry,
    /// Adapters contributed directly (by plugins). Providers override them.
    pub defaults: &'r AdapterBundle,
    /// Explicit provider id per construct for this run
    pub overrides: &'r BTreeMap<CapabilityKey, String>,
    /// Capabilities declared by the effective plugins
    pub declared: &'r CapabilitySet,
}

/// Where a construct's adapter came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    Provider,
    Default,
    Missing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedConstruct {
    pub name: CapabilityKey,
    pub provider_id: Option<String>,
    pub source: ResolutionSource,
}

/// Result of adapter resolution.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub adapters: AdapterBundle,
    pub diagnostics: Vec<Diagnostic>,
    pub constructs: Vec<ResolvedConstruct>,
}

struct Selection {
    requirement: ConstructRequirement,
    provider: Option<ProviderRegistration>,
}

fn requirement_diagnostic(
    level: DiagnosticLevel,
    code: &str,
    subject: &CapabilityKey,
    message: String,
) -> Diagnostic {
    Diagnostic::new(DiagnosticKind::Requirement, level, message)
        .with_code(code)
        .with_subject(subject.as_str())
}

fn level_for(requirement: &ConstructRequirement) -> DiagnosticLevel {
    if requirement.required {
        DiagnosticLevel::Error
    } else {
        DiagnosticLevel::Warn
    }
}

/// Pick the provider for one construct, reporting override misses and ties.
fn select(
    requirement: &ConstructRequirement,
    request: &ResolveRequest<'_>,
    diagnostics: &mut Vec<Diagnostic>,
) -> Option<ProviderRegistration> {
    let name = &requirement.name;
    if let Some(id) = request.overrides.get(name) {
        match request.providers.find(id).filter(|p| &p.construct == name) {
            Some(provider) => return Some(provider.clone()),
            None => diagnostics.push(requirement_diagnostic(
                DiagnosticLevel::Warn,
                CONSTRUCT_PROVIDER_NOT_FOUND,
                name,
                format!("Provider \"{}\" for construct \"{}\" is not registered.", id, name),
            )),
        }
    }

    let candidates = request.providers.providers_for(name);
    let best = candidates.iter().copied().fold(None, |best: Option<&ProviderRegistration>, p| {
        match best {
            Some(current) if current.priority >= p.priority => Some(current),
            _ => Some(p),
        }
    })?;

    let tied: Vec<&str> = candidates
        .iter()
        .filter(|p| p.priority == best.priority)
        .map(|p| p.id.as_str())
        .collect();
    if tied.len() > 1 {
        diagnostics.push(
            requirement_diagnostic(
                DiagnosticLevel::Warn,
                CONSTRUCT_PROVIDER_CONFLICT,
                name,
                format!(
                    "Providers {} tie at priority {} for construct \"{}\"; using \"{}\".",
                    tied.iter().map(|id| format!("\"{}\"", id)).collect::<Vec<_>>().join(", "),
                    best.priority,
                    name,
                    best.id
                ),
            )
            .with_data(serde_json::json!({ "providers": tied })),
        );
    }
    Some(best.clone())
}

/// Resolve construct requirements into an adapter bundle.
///
/// Stays immediate when every selected factory answers immediately.
pub fn resolve(request: ResolveRequest<'_>) -> MaybeAsync<'static, Resolution> {
    let mut diagnostics = Vec::new();

    for duplicate in request.providers.duplicates() {
        diagnostics.push(
            requirement_diagnostic(
                DiagnosticLevel::Warn,
                CONSTRUCT_PROVIDER_CONFLICT,
                &duplicate.construct,
                format!("Provider id \"{}\" is registered more than once.", duplicate.id),
            )
            .with_data(serde_json::json!({ "id": duplicate.id })),
        );
    }

    let mut selections = Vec::with_capacity(request.constructs.len());
    let mut pending = Vec::new();
    for requirement in request.constructs {
        let provider = select(requirement, &request, &mut diagnostics);
        if let Some(provider) = &provider {
            let missing: Vec<&String> = requirement
                .capabilities
                .iter()
                .filter(|c| !provider.has_capability(c))
                .collect();
            for capability in missing {
                diagnostics.push(requirement_diagnostic(
                    level_for(requirement),
                    CONSTRUCT_CAPABILITY_MISSING,
                    &requirement.name,
                    format!(
                        "Provider \"{}\" for construct \"{}\" lacks capability \"{}\".",
                        provider.id, requirement.name, capability
                    ),
                ));
            }
            pending.push((provider.factory)(requirement));
        }
        selections.push(Selection {
            requirement: requirement.clone(),
            provider,
        });
    }

    let defaults = request.defaults.clone();
    let declared = request.declared.clone();
    MaybeAsync::all(pending).map(move |instances| {
        finish(selections, instances, defaults, &declared, diagnostics)
    })
}

fn finish(
    selections: Vec<Selection>,
    instances: Vec<Result<AdapterInstance, AdapterError>>,
    defaults: AdapterBundle,
    declared: &CapabilitySet,
    mut diagnostics: Vec<Diagnostic>,
) -> Resolution {
    let mut adapters = defaults;
    let mut constructs = Vec::with_capacity(selections.len());
    let mut provider_capabilities: BTreeSet<String> = BTreeSet::new();
    let mut instances = instances.into_iter();

    for selection in &selections {
        let name = selection.requirement.name.clone();
        let resolved = match &selection.provider {
            Some(provider) => match instances.next() {
                Some(Ok(instance)) => {
                    provider_capabilities.extend(provider.capabilities.iter().cloned());
                    adapters.insert(name.clone(), instance);
                    ResolvedConstruct {
                        name,
                        provider_id: Some(provider.id.clone()),
                        source: ResolutionSource::Provider,
                    }
                }
                Some(Err(error)) => {
                    tracing::warn!(construct = %name, provider = %provider.id, error = %error, "Provider factory failed");
                    diagnostics.push(
                        Diagnostic::new(
                            DiagnosticKind::Adapter,
                            level_for(&selection.requirement),
                            format!("Provider \"{}\" failed to build construct \"{}\": {}", provider.id, name, error),
                        )
                        .with_code(CONSTRUCT_FACTORY_FAILED)
                        .with_subject(name.as_str()),
                    );
                    ResolvedConstruct {
                        name,
                        provider_id: Some(provider.id.clone()),
                        source: ResolutionSource::Missing,
                    }
                }
                None => ResolvedConstruct {
                    name,
                    provider_id: None,
                    source: ResolutionSource::Missing,
                },
            },
            None if adapters.has(&name) => ResolvedConstruct {
                name,
                provider_id: None,
                source: ResolutionSource::Default,
            },
            None => {
                if selection.requirement.required {
                    diagnostics.push(requirement_diagnostic(
                        DiagnosticLevel::Error,
                        CONSTRUCT_PROVIDER_MISSING,
                        &name,
                        format!("No provider is registered for required construct \"{}\".", name),
                    ));
                }
                ResolvedConstruct {
                    name,
                    provider_id: None,
                    source: ResolutionSource::Missing,
                }
            }
        };
        constructs.push(resolved);
    }

    for selection in &selections {
        let requirement = &selection.requirement;
        if !adapters.has(&requirement.name) {
            continue;
        }
        for dependency in &requirement.depends_on {
            if !adapters.has(dependency) {
                diagnostics.push(dependency_missing(
                    requirement,
                    &AdapterRequirement::Construct(dependency.clone()),
                ));
            }
        }
        let Some(instance) = adapters.get(&requirement.name) else {
            continue;
        };
        for handle in instance.handles() {
            for needed in &handle.metadata().requires {
                let satisfied = match needed {
                    AdapterRequirement::Construct(key) => adapters.has(key),
                    AdapterRequirement::Capability(capability) => {
                        provider_capabilities.contains(capability)
                            || declared.has(&CapabilityKey::from(capability.as_str()))
                    }
                };
                if !satisfied {
                    diagnostics.push(dependency_missing(requirement, needed));
                }
            }
        }
    }

    Resolution {
        adapters,
        diagnostics,
        constructs,
    }
}

fn dependency_missing(requirement: &ConstructRequirement, needed: &AdapterRequirement) -> Diagnostic {
    requirement_diagnostic(
        level_for(requirement),
        CONSTRUCT_DEPENDENCY_MISSING,
        &requirement.name,
        format!("Construct \"{}\" depends on missing {}.", requirement.name, needed),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{AdapterHandle, AdapterMetadata};

    fn tagged(construct: &str, id: &str) -> ProviderRegistration {
        let tag = id.to_string();
        ProviderRegistration::new(construct, id, move |_| {
            MaybeAsync::ok(AdapterInstance::single(tag.clone()))
        })
    }

    fn run(
        constructs: &[ConstructRequirement],
        providers: &ProviderRegistry,
        overrides: &BTreeMap<CapabilityKey, String>,
    ) -> Resolution {
        let defaults = AdapterBundle::new();
        let declared = CapabilitySet::new();
        resolve(ResolveRequest {
            constructs,
            providers,
            defaults: &defaults,
            overrides,
            declared: &declared,
        })
        .into_ready()
        .unwrap()
    }

    fn picked(resolution: &Resolution, key: CapabilityKey) -> String {
        resolution.adapters.get_as::<String>(&key).unwrap().as_ref().clone()
    }

    #[test]
    fn highest_priority_provider_wins() {
        let providers = ProviderRegistry::new()
            .with(tagged("model", "small").with_priority(1))
            .with(tagged("model", "large").with_priority(5));
        let resolution = run(&[ConstructRequirement::required("model")], &providers, &BTreeMap::new());

        assert_eq!(picked(&resolution, CapabilityKey::Model), "large");
        assert!(resolution.diagnostics.is_empty());
        assert_eq!(resolution.constructs[0].provider_id.as_deref(), Some("large"));
    }

    #[test]
    fn ties_pick_first_registered_and_warn() {
        let providers = ProviderRegistry::new()
            .with(tagged("model", "a"))
            .with(tagged("model", "b"));
        let resolution = run(&[ConstructRequirement::required("model")], &providers, &BTreeMap::new());

        assert_eq!(picked(&resolution, CapabilityKey::Model), "a");
        assert!(resolution.diagnostics.iter().any(|d| d.has_code(CONSTRUCT_PROVIDER_CONFLICT)));
    }

    #[test]
    fn unknown_override_warns_and_falls_back() {
        let providers = ProviderRegistry::new().with(tagged("model", "a"));
        let overrides = BTreeMap::from([(CapabilityKey::Model, "ghost".to_string())]);
        let resolution = run(&[ConstructRequirement::required("model")], &providers, &overrides);

        let diagnostic = &resolution.diagnostics[0];
        assert!(diagnostic.has_code(CONSTRUCT_PROVIDER_NOT_FOUND));
        assert_eq!(diagnostic.level, DiagnosticLevel::Warn);
        assert_eq!(picked(&resolution, CapabilityKey::Model), "a");
    }

    #[test]
    fn override_beats_priority() {
        let providers = ProviderRegistry::new()
            .with(tagged("model", "a").with_priority(10))
            .with(tagged("model", "b"));
        let overrides = BTreeMap::from([(CapabilityKey::Model, "b".to_string())]);
        let resolution = run(&[ConstructRequirement::required("model")], &providers, &overrides);
        assert_eq!(picked(&resolution, CapabilityKey::Model), "b");
    }

    #[test]
    fn missing_capability_level_follows_required_flag() {
        let providers = ProviderRegistry::new().with(tagged("model", "plain"));
        let required = run(
            &[ConstructRequirement::required("model").with_capability("stream")],
            &providers,
            &BTreeMap::new(),
        );
        let optional = run(
            &[ConstructRequirement::optional("model").with_capability("stream")],
            &providers,
            &BTreeMap::new(),
        );

        assert!(required.diagnostics[0].has_code(CONSTRUCT_CAPABILITY_MISSING));
        assert!(required.diagnostics[0].is_error());
        assert!(!optional.diagnostics[0].is_error());
    }

    #[test]
    fn missing_required_construct_is_an_error_and_optional_is_silent() {
        let providers = ProviderRegistry::new();
        let resolution = run(
            &[
                ConstructRequirement::required("model"),
                ConstructRequirement::optional("cache"),
            ],
            &providers,
            &BTreeMap::new(),
        );

        assert_eq!(resolution.diagnostics.len(), 1);
        assert!(resolution.diagnostics[0].has_code(CONSTRUCT_PROVIDER_MISSING));
        assert!(resolution.adapters.is_empty());
    }

    #[test]
    fn metadata_requires_are_checked_for_lists() {
        let tool = AdapterHandle::new("search")
            .with_metadata(AdapterMetadata::new().requires(AdapterRequirement::Construct(CapabilityKey::Retriever)));
        let providers = ProviderRegistry::new().with(ProviderRegistration::instance(
            "tools",
            "toolbox",
            AdapterInstance::List(vec![tool]),
        ));
        let resolution = run(&[ConstructRequirement::required("tools")], &providers, &BTreeMap::new());

        assert!(resolution.diagnostics.iter().any(|d| d.has_code(CONSTRUCT_DEPENDENCY_MISSING)));
    }

    #[test]
    fn depends_on_checks_other_constructs() {
        let providers = ProviderRegistry::new().with(tagged("retriever", "vector"));
        let resolution = run(
            &[ConstructRequirement::optional("retriever").depends_on("embedder")],
            &providers,
            &BTreeMap::new(),
        );
        let diagnostic = &resolution.diagnostics[0];
        assert!(diagnostic.has_code(CONSTRUCT_DEPENDENCY_MISSING));
        assert_eq!(diagnostic.level, DiagnosticLevel::Warn);
    }

    #[test]
    fn duplicate_ids_are_reported_even_when_unused() {
        let providers = ProviderRegistry::new()
            .with(tagged("cache", "dup"))
            .with(tagged("cache", "dup"));
        let resolution = run(&[], &providers, &BTreeMap::new());

        assert_eq!(providers.len(), 1);
        assert!(resolution.diagnostics[0].has_code(CONSTRUCT_PROVIDER_CONFLICT));
    }

    #[test]
    fn factory_failure_leaves_construct_absent() {
        let providers = ProviderRegistry::new().with(ProviderRegistration::new("model", "broken", |_| {
            MaybeAsync::err(AdapterError::other("no credentials"))
        }));
        let resolution = run(&[ConstructRequirement::required("model")], &providers, &BTreeMap::new());

        assert!(!resolution.adapters.has(&CapabilityKey::Model));
        assert!(resolution.diagnostics[0].has_code(CONSTRUCT_FACTORY_FAILED));
        assert_eq!(resolution.constructs[0].source, ResolutionSource::Missing);
    }

    #[tokio::test]
    async fn async_factories_resolve() {
        let providers = ProviderRegistry::new().with(ProviderRegistration::new("model", "remote", |_| {
            MaybeAsync::from_future(async {
                tokio::task::yield_now().await;
                Ok(AdapterInstance::single("remote".to_string()))
            })
        }));
        let constructs = [ConstructRequirement::required("model")];
        let defaults = AdapterBundle::new();
        let declared = CapabilitySet::new();
        let overrides = BTreeMap::new();
        let pending = resolve(ResolveRequest {
            constructs: &constructs,
            providers: &providers,
            defaults: &defaults,
            overrides: &overrides,
            declared: &declared,
        });
        assert!(!pending.is_ready());
        let resolution = pending.await;
        assert_eq!(picked(&resolution, CapabilityKey::Model), "remote");
    }
}
