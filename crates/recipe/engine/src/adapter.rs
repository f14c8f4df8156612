//! Adapter handles and bundles
//!
//! The runtime never calls a model, retriever or tool itself. It only moves
//! caller-supplied collaborators around, checks their presence and reads
//! their metadata. An [`AdapterHandle`] is therefore an opaque, shareable
//! value plus the metadata the core inspects (`requires`, `retry`).

use recipe_types::{AdapterRequirement, CapabilityKey, RetryMetadata};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Metadata the core reads from an adapter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdapterMetadata {
    /// Constructs or capabilities this adapter needs to function
    pub requires: Vec<AdapterRequirement>,
    pub retry: Option<RetryMetadata>,
}

impl AdapterMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requires(mut self, requirement: AdapterRequirement) -> Self {
        self.requires.push(requirement);
        self
    }

    pub fn with_retry(mut self, retry: RetryMetadata) -> Self {
        self.retry = Some(retry);
        self
    }
}

/// An opaque, cheaply cloneable adapter value.
#[derive(Clone)]
pub struct AdapterHandle {
    value: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
    metadata: AdapterMetadata,
}

impl AdapterHandle {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            value: Arc::new(value),
            type_name: std::any::type_name::<T>(),
            metadata: AdapterMetadata::default(),
        }
    }

    pub fn with_metadata(mut self, metadata: AdapterMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn metadata(&self) -> &AdapterMetadata {
        &self.metadata
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.value).downcast::<T>().ok()
    }
}

impl fmt::Debug for AdapterHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterHandle")
            .field("type", &self.type_name)
            .field("metadata", &self.metadata)
            .finish()
    }
}

/// What a provider factory or plugin contributes for one construct.
#[derive(Debug, Clone)]
pub enum AdapterInstance {
    Single(AdapterHandle),
    /// Several adapters for one construct (e.g. a tool list)
    List(Vec<AdapterHandle>),
    /// Plain document-like data. Not scanned for `metadata.requires`.
    Documents(Vec<serde_json::Value>),
}

impl AdapterInstance {
    pub fn single<T: Any + Send + Sync>(value: T) -> Self {
        AdapterInstance::Single(AdapterHandle::new(value))
    }

    /// Handles whose metadata participates in dependency checks.
    pub fn handles(&self) -> Vec<&AdapterHandle> {
        match self {
            AdapterInstance::Single(handle) => vec![handle],
            AdapterInstance::List(handles) => handles.iter().collect(),
            AdapterInstance::Documents(_) => Vec::new(),
        }
    }

    pub fn as_single(&self) -> Option<&AdapterHandle> {
        match self {
            AdapterInstance::Single(handle) => Some(handle),
            _ => None,
        }
    }

    /// Retry metadata of a single adapter.
    pub fn retry_metadata(&self) -> Option<&RetryMetadata> {
        self.as_single().and_then(|handle| handle.metadata.retry.as_ref())
    }
}

impl From<AdapterHandle> for AdapterInstance {
    fn from(handle: AdapterHandle) -> Self {
        AdapterInstance::Single(handle)
    }
}

/// Named adapters available to one run.
#[derive(Debug, Clone, Default)]
pub struct AdapterBundle {
    entries: BTreeMap<CapabilityKey, AdapterInstance>,
}

impl AdapterBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<CapabilityKey>, instance: impl Into<AdapterInstance>) -> Self {
        self.insert(key, instance);
        self
    }

    pub fn insert(&mut self, key: impl Into<CapabilityKey>, instance: impl Into<AdapterInstance>) {
        self.entries.insert(key.into(), instance.into());
    }

    /// Overlay `other` onto this bundle. Entries in `other` win.
    pub fn overlay(&mut self, other: &AdapterBundle) {
        for (key, instance) in &other.entries {
            self.entries.insert(key.clone(), instance.clone());
        }
    }

    pub fn get(&self, key: &CapabilityKey) -> Option<&AdapterInstance> {
        self.entries.get(key)
    }

    pub fn has(&self, key: &CapabilityKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Downcast a single adapter stored under `key`.
    pub fn get_as<T: Any + Send + Sync>(&self, key: &CapabilityKey) -> Option<Arc<T>> {
        self.get(key)
            .and_then(AdapterInstance::as_single)
            .and_then(AdapterHandle::downcast::<T>)
    }

    pub fn keys(&self) -> impl Iterator<Item = &CapabilityKey> {
        self.entries.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&CapabilityKey, &AdapterInstance)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
