//! Plugin composition
//!
//! Plugins are walked in declaration order and keyed by their override key.
//! The first plugin for a key is kept unless a later one for the same key
//! is declared with [`CompositionMode::Override`], in which case it takes
//! the earlier plugin's position. Later `extend` duplicates are unused.

use crate::adapter::{AdapterBundle, AdapterInstance};
use crate::helper::{Helper, HelperSpec, LifecycleHook};
use crate::provider::{ProviderRegistration, ProviderRegistry};
use recipe_types::{CapabilityKey, CapabilitySet, CapabilityValue, Diagnostic, DiagnosticKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// How a plugin or helper relates to an earlier one with the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompositionMode {
    #[default]
    Extend,
    Override,
}

/// Imperative registration hook of a plugin.
pub type RegisterFn = Arc<dyn Fn(&mut PluginRegistrar) + Send + Sync>;

/// A unit of composition contributing capabilities, adapters or stage logic.
#[derive(Clone)]
pub struct Plugin {
    pub key: String,
    pub mode: CompositionMode,
    pub override_key: Option<String>,
    pub capabilities: CapabilitySet,
    pub adapters: AdapterBundle,
    pub helper_kinds: Vec<String>,
    pub lifecycle: Option<LifecycleHook>,
    pub helpers: Vec<HelperSpec>,
    pub register: Option<RegisterFn>,
    pub requires: Vec<CapabilityKey>,
}

impl Plugin {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            mode: CompositionMode::Extend,
            override_key: None,
            capabilities: CapabilitySet::new(),
            adapters: AdapterBundle::new(),
            helper_kinds: Vec::new(),
            lifecycle: None,
            helpers: Vec::new(),
            register: None,
            requires: Vec::new(),
        }
    }

    /// Key used for de-duplication.
    pub fn effective_key(&self) -> &str {
        self.override_key.as_deref().unwrap_or(&self.key)
    }

    pub fn overriding(mut self) -> Self {
        self.mode = CompositionMode::Override;
        self
    }

    pub fn with_override_key(mut self, key: impl Into<String>) -> Self {
        self.override_key = Some(key.into());
        self
    }

    pub fn with_capability(mut self, key: impl Into<CapabilityKey>, value: impl Into<CapabilityValue>) -> Self {
        self.capabilities.set(key, value);
        self
    }

    /// Contribute an adapter; also declares the matching capability.
    pub fn with_adapter(mut self, key: impl Into<CapabilityKey>, instance: impl Into<AdapterInstance>) -> Self {
        let key = key.into();
        if self.capabilities.get(&key).is_none() {
            self.capabilities.set(key.clone(), true);
        }
        self.adapters.insert(key, instance);
        self
    }

    pub fn with_helper_kind(mut self, kind: impl Into<String>) -> Self {
        self.helper_kinds.push(kind.into());
        self
    }

    pub fn with_lifecycle(mut self, name: impl Into<String>, hook: Arc<dyn Helper>) -> Self {
        self.lifecycle = Some(LifecycleHook {
            name: name.into(),
            hook,
        });
        self
    }

    pub fn with_helper(mut self, spec: HelperSpec) -> Self {
        self.helpers.push(spec);
        self
    }

    pub fn with_register<F>(mut self, register: F) -> Self
    where
        F: Fn(&mut PluginRegistrar) + Send + Sync + 'static,
    {
        self.register = Some(Arc::new(register));
        self
    }

    pub fn requires(mut self, key: impl Into<CapabilityKey>) -> Self {
        self.requires.push(key.into());
        self
    }
}

impl fmt::Debug for Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plugin")
            .field("key", &self.key)
            .field("mode", &self.mode)
            .field("override_key", &self.override_key)
            .field("capabilities", &self.capabilities)
            .field("helper_kinds", &self.helper_kinds)
            .field("helpers", &self.helpers)
            .field("requires", &self.requires)
            .finish()
    }
}

/// Reference to a plugin by key and declaration position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginRef {
    pub key: String,
    pub effective_key: String,
    pub position: usize,
}

impl PluginRef {
    fn of(plugin: &Plugin, position: usize) -> Self {
        Self {
            key: plugin.key.clone(),
            effective_key: plugin.effective_key().to_string(),
            position,
        }
    }
}

/// Effective plugins plus what composition discarded.
#[derive(Debug, Clone, Default)]
pub struct PluginComposition {
    pub effective: Vec<Plugin>,
    /// Plugins replaced by a later `override`
    pub overridden: Vec<PluginRef>,
    /// Later `extend` duplicates that never took effect
    pub unused: Vec<PluginRef>,
}

impl PluginComposition {
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.unused
            .iter()
            .map(|plugin| {
                Diagnostic::warn(
                    DiagnosticKind::Pipeline,
                    format!(
                        "Plugin \"{}\" duplicates \"{}\" without override and is unused.",
                        plugin.key, plugin.effective_key
                    ),
                )
                .with_code("plugin_unused")
                .with_subject(plugin.key.as_str())
            })
            .collect()
    }
}

pub fn compose_plugins(plugins: &[Plugin]) -> PluginComposition {
    let mut composition = PluginComposition::default();
    let mut slots: HashMap<String, (usize, usize)> = HashMap::new();

    for (position, plugin) in plugins.iter().enumerate() {
        let key = plugin.effective_key().to_string();
        match slots.get(&key).copied() {
            None => {
                slots.insert(key, (composition.effective.len(), position));
                composition.effective.push(plugin.clone());
            }
            Some((slot, previous)) if plugin.mode == CompositionMode::Override => {
                let replaced = std::mem::replace(&mut composition.effective[slot], plugin.clone());
                tracing::debug!(key = %key, replaced = %replaced.key, by = %plugin.key, "Plugin overridden");
                composition.overridden.push(PluginRef::of(&replaced, previous));
                slots.insert(key, (slot, position));
            }
            Some(_) => composition.unused.push(PluginRef::of(plugin, position)),
        }
    }
    composition
}

pub fn get_effective_plugins(plugins: &[Plugin]) -> Vec<Plugin> {
    compose_plugins(plugins).effective
}

/// Merge declared capabilities of the effective plugins, in order.
pub fn build_capabilities(effective: &[Plugin]) -> CapabilitySet {
    let mut capabilities = CapabilitySet::new();
    for plugin in effective {
        capabilities.merge_record(&plugin.capabilities);
    }
    capabilities
}

/// Overlay the adapters of the effective plugins. Later plugins win.
pub fn merge_adapters(effective: &[Plugin]) -> AdapterBundle {
    let mut bundle = AdapterBundle::new();
    for plugin in effective {
        bundle.overlay(&plugin.adapters);
    }
    bundle
}

/// Declared `requires` of the effective plugins not met by `resolved`.
pub fn missing_requirements(effective: &[Plugin], resolved: &CapabilitySet) -> Vec<Diagnostic> {
    effective
        .iter()
        .flat_map(|plugin| {
            plugin
                .requires
                .iter()
                .filter(|key| !resolved.has(key))
                .map(move |key| {
                    Diagnostic::warn(
                        DiagnosticKind::Requirement,
                        format!("Plugin \"{}\" requires capability \"{}\".", plugin.key, key),
                    )
                    .with_code("plugin_requirement_missing")
                    .with_subject(plugin.key.as_str())
                })
        })
        .collect()
}

/// Collects what plugins register imperatively.
#[derive(Default)]
pub struct PluginRegistrar {
    current: String,
    helpers: Vec<RegisteredHelper>,
    lifecycle: Vec<RegisteredHook>,
    helper_kinds: Vec<String>,
    providers: ProviderRegistry,
}

impl PluginRegistrar {
    pub fn plugin(&self) -> &str {
        &self.current
    }

    pub fn helper(&mut self, spec: HelperSpec) -> &mut Self {
        self.helpers.push(RegisteredHelper {
            plugin: self.current.clone(),
            spec,
        });
        self
    }

    pub fn lifecycle(&mut self, name: impl Into<String>, hook: Arc<dyn Helper>) -> &mut Self {
        self.lifecycle.push(RegisteredHook {
            plugin: self.current.clone(),
            hook: LifecycleHook {
                name: name.into(),
                hook,
            },
        });
        self
    }

    pub fn helper_kind(&mut self, kind: impl Into<String>) -> &mut Self {
        self.helper_kinds.push(kind.into());
        self
    }

    pub fn provider(&mut self, registration: ProviderRegistration) -> &mut Self {
        self.providers.register(registration);
        self
    }
}

#[derive(Debug, Clone)]
pub struct RegisteredHelper {
    pub plugin: String,
    pub spec: HelperSpec,
}

#[derive(Debug, Clone)]
pub struct RegisteredHook {
    pub plugin: String,
    pub hook: LifecycleHook,
}

/// Everything the effective plugins contribute to stage building.
#[derive(Debug, Clone, Default)]
pub struct Registrations {
    pub helpers: Vec<RegisteredHelper>,
    pub lifecycle: Vec<RegisteredHook>,
    pub helper_kinds: Vec<String>,
    pub providers: ProviderRegistry,
}

/// Gather declarative and imperative registrations, in plugin order.
pub fn collect_registrations(effective: &[Plugin]) -> Registrations {
    let mut registrar = PluginRegistrar::default();
    for plugin in effective {
        registrar.current = plugin.key.clone();
        registrar.helper_kinds.extend(plugin.helper_kinds.iter().cloned());
        if let Some(hook) = &plugin.lifecycle {
            registrar.lifecycle(hook.name.clone(), Arc::clone(&hook.hook));
        }
        for spec in &plugin.helpers {
            registrar.helper(spec.clone());
        }
        if let Some(register) = &plugin.register {
            register(&mut registrar);
        }
    }
    Registrations {
        helpers: registrar.helpers,
        lifecycle: registrar.lifecycle,
        helper_kinds: registrar.helper_kinds,
        providers: registrar.providers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn first_occurrence_wins_without_override() {
        let plugins = vec![
            Plugin::new("model").with_capability("model", "a"),
            Plugin::new("model").with_capability("model", "b"),
        ];
        let composition = compose_plugins(&plugins);

        assert_eq!(composition.effective.len(), 1);
        assert_eq!(
            composition.effective[0].capabilities.get(&CapabilityKey::Model),
            Some(&CapabilityValue::scalar("a"))
        );
        assert_eq!(composition.unused[0].position, 1);
        assert_eq!(composition.diagnostics().len(), 1);
    }

    #[test]
    fn override_replaces_in_place() {
        let plugins = vec![
            Plugin::new("first"),
            Plugin::new("model-a").with_override_key("model"),
            Plugin::new("last"),
            Plugin::new("model-b").with_override_key("model").overriding(),
        ];
        let composition = compose_plugins(&plugins);
        let keys: Vec<&str> = composition.effective.iter().map(|p| p.key.as_str()).collect();

        assert_eq!(keys, ["first", "model-b", "last"]);
        assert_eq!(composition.overridden[0].key, "model-a");
        assert!(composition.unused.is_empty());
    }

    #[test]
    fn capabilities_merge_scalar_then_list() {
        let plugins = vec![
            Plugin::new("a").with_capability("tools", "search"),
            Plugin::new("b").with_capability("tools", "calc"),
            Plugin::new("c").with_capability("tools", json!(["sql", "http"])),
        ];
        let capabilities = build_capabilities(&plugins);

        assert_eq!(
            capabilities.get(&CapabilityKey::Tools),
            Some(&CapabilityValue::List(vec![
                json!("search"),
                json!("calc"),
                json!("sql"),
                json!("http")
            ]))
        );
    }

    #[test]
    fn requirements_check_the_resolved_set() {
        let plugins = vec![Plugin::new("rag").requires("retriever")];
        let mut resolved = CapabilitySet::new().with("model", true);
        let missing = missing_requirements(&plugins, &resolved);
        assert_eq!(missing[0].message, "Plugin \"rag\" requires capability \"retriever\".");
        assert_eq!(missing[0].kind, DiagnosticKind::Requirement);

        resolved.set("retriever", true);
        assert!(missing_requirements(&plugins, &resolved).is_empty());
    }

    #[test]
    fn registrations_keep_plugin_order() {
        use crate::helper::helper_fn;
        use recipe_types::MaybeAsync;

        let noop = helper_fn(|_, _| MaybeAsync::ok(crate::HelperEffect::none()));
        let plugins = vec![
            Plugin::new("a").with_helper(HelperSpec::new("load", "etl", Arc::clone(&noop))),
            Plugin::new("b").with_register(move |registrar| {
                registrar
                    .helper_kind("audit")
                    .helper(HelperSpec::new("log", "audit", Arc::clone(&noop)));
            }),
        ];
        let registrations = collect_registrations(&plugins);

        let owners: Vec<&str> = registrations.helpers.iter().map(|h| h.plugin.as_str()).collect();
        assert_eq!(owners, ["a", "b"]);
        assert_eq!(registrations.helper_kinds, ["audit"]);
    }
}
