//! Construct requirements: runtime needs for one adapter family

use crate::CapabilityKey;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A runtime need for one named adapter family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstructRequirement {
    pub name: CapabilityKey,
    pub required: bool,
    /// Provider capabilities the selected provider must declare
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Constructs that must be satisfied before this one
    #[serde(default)]
    pub depends_on: Vec<CapabilityKey>,
}

impl ConstructRequirement {
    pub fn required(name: impl Into<CapabilityKey>) -> Self {
        Self {
            name: name.into(),
            required: true,
            capabilities: Vec::new(),
            depends_on: Vec::new(),
        }
    }

    pub fn optional(name: impl Into<CapabilityKey>) -> Self {
        Self {
            required: false,
            ..Self::required(name)
        }
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.push(capability.into());
        self
    }

    pub fn depends_on(mut self, construct: impl Into<CapabilityKey>) -> Self {
        self.depends_on.push(construct.into());
        self
    }
}

/// A dependency an adapter instance declares in its metadata.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "name", rename_all = "snake_case")]
pub enum AdapterRequirement {
    /// Another construct must be present in the resolved bundle
    Construct(CapabilityKey),
    /// Some resolved provider must declare this capability
    Capability(String),
}

impl fmt::Display for AdapterRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdapterRequirement::Construct(key) => write!(f, "construct \"{}\"", key),
            AdapterRequirement::Capability(cap) => write!(f, "capability \"{}\"", cap),
        }
    }
}
