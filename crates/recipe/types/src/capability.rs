//! Capabilities: declared facts merged across plugins
//!
//! Capability keys are a closed set of well-known adapter families plus an
//! open extension space. Values are scalar-or-list: the first declaration
//! is kept as a scalar, and every further declaration for the same key
//! turns the accumulated value into a list.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Capability / construct key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CapabilityKey {
    Model,
    Retriever,
    Tools,
    Embedder,
    Cache,
    EventStream,
    Resume,
    Custom(String),
}

impl CapabilityKey {
    pub fn as_str(&self) -> &str {
        match self {
            CapabilityKey::Model => "model",
            CapabilityKey::Retriever => "retriever",
            CapabilityKey::Tools => "tools",
            CapabilityKey::Embedder => "embedder",
            CapabilityKey::Cache => "cache",
            CapabilityKey::EventStream => "eventStream",
            CapabilityKey::Resume => "resume",
            CapabilityKey::Custom(name) => name,
        }
    }

    pub fn is_custom(&self) -> bool {
        matches!(self, CapabilityKey::Custom(_))
    }
}

impl From<&str> for CapabilityKey {
    fn from(value: &str) -> Self {
        match value {
            "model" => CapabilityKey::Model,
            "retriever" => CapabilityKey::Retriever,
            "tools" => CapabilityKey::Tools,
            "embedder" => CapabilityKey::Embedder,
            "cache" => CapabilityKey::Cache,
            "eventStream" => CapabilityKey::EventStream,
            "resume" => CapabilityKey::Resume,
            other => CapabilityKey::Custom(other.to_string()),
        }
    }
}

impl From<String> for CapabilityKey {
    fn from(value: String) -> Self {
        CapabilityKey::from(value.as_str())
    }
}

impl From<CapabilityKey> for String {
    fn from(value: CapabilityKey) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for CapabilityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scalar-or-list capability value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CapabilityValue {
    List(Vec<serde_json::Value>),
    Scalar(serde_json::Value),
}

impl CapabilityValue {
    pub fn scalar(value: impl Into<serde_json::Value>) -> Self {
        let value: serde_json::Value = value.into();
        CapabilityValue::from(value)
    }

    /// Declared as available (`true`).
    pub fn enabled() -> Self {
        CapabilityValue::Scalar(serde_json::Value::Bool(true))
    }

    /// Combine an accumulated value with a newly declared one.
    ///
    /// scalar + scalar becomes `[a, b]`, a list grows by appending, and an
    /// incoming list is flattened into the accumulated one.
    pub fn merge(self, incoming: CapabilityValue) -> CapabilityValue {
        let mut values = self.into_values();
        values.extend(incoming.into_values());
        CapabilityValue::List(values)
    }

    pub fn into_values(self) -> Vec<serde_json::Value> {
        match self {
            CapabilityValue::Scalar(value) => vec![value],
            CapabilityValue::List(values) => values,
        }
    }

    /// A capability counts as present unless it is `null`, `false` or an empty list.
    pub fn is_present(&self) -> bool {
        match self {
            CapabilityValue::Scalar(serde_json::Value::Null)
            | CapabilityValue::Scalar(serde_json::Value::Bool(false)) => false,
            CapabilityValue::Scalar(_) => true,
            CapabilityValue::List(values) => !values.is_empty(),
        }
    }
}

impl From<serde_json::Value> for CapabilityValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Array(values) => CapabilityValue::List(values),
            other => CapabilityValue::Scalar(other),
        }
    }
}

impl From<bool> for CapabilityValue {
    fn from(value: bool) -> Self {
        CapabilityValue::Scalar(serde_json::Value::Bool(value))
    }
}

impl From<&str> for CapabilityValue {
    fn from(value: &str) -> Self {
        CapabilityValue::Scalar(serde_json::Value::String(value.to_string()))
    }
}

/// An ordered record of capabilities.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet {
    entries: BTreeMap<CapabilityKey, CapabilityValue>,
}

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert that overwrites.
    pub fn with(mut self, key: impl Into<CapabilityKey>, value: impl Into<CapabilityValue>) -> Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    pub fn set(&mut self, key: impl Into<CapabilityKey>, value: impl Into<CapabilityValue>) {
        self.entries.insert(key.into(), value.into());
    }

    /// Insert, merging with any value already declared for the key.
    pub fn merge_value(&mut self, key: CapabilityKey, value: CapabilityValue) {
        let merged = match self.entries.remove(&key) {
            Some(existing) => existing.merge(value),
            None => value,
        };
        self.entries.insert(key, merged);
    }

    /// Merge every entry of another record, key by key.
    pub fn merge_record(&mut self, record: &CapabilitySet) {
        for (key, value) in &record.entries {
            self.merge_value(key.clone(), value.clone());
        }
    }

    pub fn get(&self, key: &CapabilityKey) -> Option<&CapabilityValue> {
        self.entries.get(key)
    }

    /// Present (declared and not disabled).
    pub fn has(&self, key: &CapabilityKey) -> bool {
        self.entries.get(key).is_some_and(CapabilityValue::is_present)
    }

    pub fn present_keys(&self) -> Vec<&CapabilityKey> {
        self.entries
            .iter()
            .filter(|(_, v)| v.is_present())
            .map(|(k, _)| k)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&CapabilityKey, &CapabilityValue)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<CapabilityKey>, V: Into<CapabilityValue>> FromIterator<(K, V)> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut set = CapabilitySet::new();
        for (key, value) in iter {
            set.merge_value(key.into(), value.into());
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_round_trip_through_strings() {
        assert_eq!(CapabilityKey::from("eventStream"), CapabilityKey::EventStream);
        assert_eq!(
            CapabilityKey::from("reranker"),
            CapabilityKey::Custom("reranker".to_string())
        );
        let json = serde_json::to_value(CapabilityKey::Retriever).unwrap();
        assert_eq!(json, json!("retriever"));
    }

    #[test]
    fn scalar_then_scalar_becomes_list() {
        let merged = CapabilityValue::from("a").merge(CapabilityValue::from("b"));
        assert_eq!(merged, CapabilityValue::List(vec![json!("a"), json!("b")]));
    }

    #[test]
    fn list_grows_and_flattens() {
        let merged = CapabilityValue::from(json!(["a", "b"]))
            .merge(CapabilityValue::from("c"))
            .merge(CapabilityValue::from(json!(["d"])));
        assert_eq!(merged.into_values(), vec![json!("a"), json!("b"), json!("c"), json!("d")]);
    }

    #[test]
    fn first_declaration_stays_scalar() {
        let mut set = CapabilitySet::new();
        set.merge_value(CapabilityKey::Model, CapabilityValue::from("gpt"));
        assert_eq!(set.get(&CapabilityKey::Model), Some(&CapabilityValue::from("gpt")));

        set.merge_value(CapabilityKey::Model, CapabilityValue::from("claude"));
        assert!(matches!(set.get(&CapabilityKey::Model), Some(CapabilityValue::List(v)) if v.len() == 2));
    }

    #[test]
    fn disabled_values_are_not_present() {
        let set = CapabilitySet::new()
            .with("model", true)
            .with("retriever", false)
            .with("tools", json!([]));
        assert!(set.has(&CapabilityKey::Model));
        assert!(!set.has(&CapabilityKey::Retriever));
        assert!(!set.has(&CapabilityKey::Tools));
        assert_eq!(set.present_keys(), vec![&CapabilityKey::Model]);
    }
}
