//! Recipe contracts

use crate::plugin::Plugin;
use recipe_types::{CapabilityKey, CapabilitySet, Diagnostic, DiagnosticKind, OutcomeStatus};

/// A named workflow contract. Immutable once registered.
#[derive(Debug, Clone)]
pub struct RecipeContract {
    pub name: String,
    /// Keys finalize projects the user state onto. Empty means "everything".
    pub artefact_keys: Vec<String>,
    pub outcomes: Vec<OutcomeStatus>,
    pub extension_points: Vec<String>,
    pub helper_kinds: Vec<String>,
    pub minimum_capabilities: Vec<CapabilityKey>,
    pub supports_resume: bool,
    pub default_plugins: Vec<Plugin>,
}

impl RecipeContract {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            artefact_keys: Vec::new(),
            outcomes: vec![OutcomeStatus::Ok, OutcomeStatus::Error],
            extension_points: Vec::new(),
            helper_kinds: Vec::new(),
            minimum_capabilities: Vec::new(),
            supports_resume: false,
            default_plugins: Vec::new(),
        }
    }

    pub fn with_artefact_key(mut self, key: impl Into<String>) -> Self {
        self.artefact_keys.push(key.into());
        self
    }

    pub fn with_extension_point(mut self, name: impl Into<String>) -> Self {
        self.extension_points.push(name.into());
        self
    }

    pub fn with_helper_kind(mut self, kind: impl Into<String>) -> Self {
        self.helper_kinds.push(kind.into());
        self
    }

    pub fn with_minimum_capability(mut self, key: impl Into<CapabilityKey>) -> Self {
        self.minimum_capabilities.push(key.into());
        self
    }

    pub fn with_default_plugin(mut self, plugin: Plugin) -> Self {
        self.default_plugins.push(plugin);
        self
    }

    /// Declare resume support; adds `paused` to the possible outcomes.
    pub fn resumable(mut self) -> Self {
        self.supports_resume = true;
        if !self.outcomes.contains(&OutcomeStatus::Paused) {
            self.outcomes.push(OutcomeStatus::Paused);
        }
        self
    }

    pub fn can_pause(&self) -> bool {
        self.supports_resume && self.outcomes.contains(&OutcomeStatus::Paused)
    }

    /// One `contract` warning per minimum capability absent from `resolved`.
    pub fn check_minimum_capabilities(&self, resolved: &CapabilitySet) -> Vec<Diagnostic> {
        self.minimum_capabilities
            .iter()
            .filter(|key| !resolved.has(key))
            .map(|key| {
                Diagnostic::warn(
                    DiagnosticKind::Contract,
                    format!("Recipe \"{}\" requires capability \"{}\".", self.name, key),
                )
                .with_code("recipe_capability_missing")
                .with_subject(key.as_str())
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimum_capability_message() {
        let contract = RecipeContract::new("rag")
            .with_minimum_capability("retriever")
            .with_minimum_capability("model");
        let resolved = CapabilitySet::new().with("model", true);

        let diagnostics = contract.check_minimum_capabilities(&resolved);
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].message, "Recipe \"rag\" requires capability \"retriever\".");
        assert_eq!(diagnostics[0].kind, DiagnosticKind::Contract);
        assert!(!diagnostics[0].is_error());
    }

    #[test]
    fn resumable_adds_paused_outcome() {
        let contract = RecipeContract::new("gate");
        assert!(!contract.can_pause());
        assert!(contract.resumable().can_pause());
    }
}
