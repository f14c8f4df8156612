//! Recipe registry: stores and retrieves recipe contracts
//!
//! Contracts are immutable once registered. An override registered under
//! the same name shadows the base contract until it is removed.

use crate::contract::RecipeContract;
use recipe_types::{RecipeError, RecipeResult};
use std::collections::HashMap;
use std::sync::Arc;

/// Registry of recipe contracts
#[derive(Clone, Debug, Default)]
pub struct RecipeRegistry {
    /// Base contracts, keyed by name
    contracts: HashMap<String, Arc<RecipeContract>>,
    /// Overrides, keyed by the name they replace
    overrides: HashMap<String, Arc<RecipeContract>>,
}

impl RecipeRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-loaded with the built-in `agent`, `rag` and `hitl-gate` contracts
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for contract in crate::recipes::builtin_contracts() {
            registry
                .contracts
                .insert(contract.name.clone(), Arc::new(contract));
        }
        registry
    }

    /// Register a contract. Fails if the name is taken.
    pub fn register(&mut self, contract: RecipeContract) -> RecipeResult<Arc<RecipeContract>> {
        if self.contracts.contains_key(&contract.name) {
            return Err(RecipeError::Conflict(format!(
                "recipe \"{}\" is already registered",
                contract.name
            )));
        }
        let name = contract.name.clone();
        let contract = Arc::new(contract);
        self.contracts.insert(name.clone(), Arc::clone(&contract));
        tracing::info!(recipe = %name, "Recipe contract registered");
        Ok(contract)
    }

    /// Replace a contract by name without touching the base registration.
    pub fn register_override(&mut self, contract: RecipeContract) -> Option<Arc<RecipeContract>> {
        let name = contract.name.clone();
        tracing::info!(recipe = %name, "Recipe contract override registered");
        self.overrides.insert(name, Arc::new(contract))
    }

    /// Drop an override, exposing the base contract again
    pub fn remove_override(&mut self, name: &str) -> Option<Arc<RecipeContract>> {
        self.overrides.remove(name)
    }

    /// Get a contract by name. Overrides win.
    pub fn get(&self, name: &str) -> RecipeResult<Arc<RecipeContract>> {
        self.overrides
            .get(name)
            .or_else(|| self.contracts.get(name))
            .cloned()
            .ok_or_else(|| RecipeError::RecipeNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.overrides.contains_key(name) || self.contracts.contains_key(name)
    }

    /// Names of every resolvable contract, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .contracts
            .keys()
            .chain(self.overrides.keys())
            .map(String::as_str)
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }

    pub fn count(&self) -> usize {
        self.names().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_get() {
        let mut registry = RecipeRegistry::new();
        registry.register(RecipeContract::new("etl")).unwrap();

        assert_eq!(registry.get("etl").unwrap().name, "etl");
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_duplicate_register_conflicts() {
        let mut registry = RecipeRegistry::new();
        registry.register(RecipeContract::new("etl")).unwrap();
        let result = registry.register(RecipeContract::new("etl"));
        assert!(matches!(result, Err(RecipeError::Conflict(_))));
    }

    #[test]
    fn test_override_wins_until_removed() {
        let mut registry = RecipeRegistry::with_builtins();
        registry.register_override(RecipeContract::new("rag").with_helper_kind("rerank"));

        assert_eq!(registry.get("rag").unwrap().helper_kinds, ["rerank"]);
        registry.remove_override("rag");
        assert_eq!(registry.get("rag").unwrap().helper_kinds, ["retrieve", "generate"]);
    }

    #[test]
    fn test_get_missing() {
        let registry = RecipeRegistry::new();
        let result = registry.get("nonexistent");
        assert!(matches!(result, Err(RecipeError::RecipeNotFound(_))));
        assert_eq!(result.unwrap_err().code(), "recipe.notFound");
    }
}
