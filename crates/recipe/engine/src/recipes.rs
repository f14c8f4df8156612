//! Built-in recipe contracts

use crate::contract::RecipeContract;
use crate::plugin::Plugin;
use crate::resume::{resume_adapter_instance, PassthroughResumeAdapter};
use recipe_types::CapabilityKey;
use std::sync::Arc;

pub const AGENT: &str = "agent";
pub const RAG: &str = "rag";
pub const HITL_GATE: &str = "hitl-gate";

/// Agent loop: lifecycle hooks around a model call.
pub fn agent() -> RecipeContract {
    RecipeContract::new(AGENT)
        .with_extension_point("init")
        .with_extension_point("before_model")
        .with_extension_point("after_model")
        .with_extension_point("finalize")
        .with_artefact_key("messages")
        .with_artefact_key("response")
        .with_minimum_capability(CapabilityKey::Model)
}

/// Retrieval-augmented answering.
pub fn rag() -> RecipeContract {
    RecipeContract::new(RAG)
        .with_helper_kind("retrieve")
        .with_helper_kind("generate")
        .with_artefact_key("documents")
        .with_artefact_key("answer")
        .with_minimum_capability(CapabilityKey::Retriever)
        .with_minimum_capability(CapabilityKey::Model)
}

/// Human-in-the-loop gate. Ships a passthrough resume adapter so approval
/// input reaches the gate unchanged unless a plugin overrides it.
pub fn hitl_gate() -> RecipeContract {
    RecipeContract::new(HITL_GATE)
        .with_extension_point("gate")
        .with_helper_kind("approve")
        .with_artefact_key("decision")
        .with_minimum_capability(CapabilityKey::Resume)
        .with_default_plugin(
            Plugin::new("hitl-gate.resume")
                .with_override_key("resume")
                .with_adapter(
                    CapabilityKey::Resume,
                    resume_adapter_instance(Arc::new(PassthroughResumeAdapter)),
                ),
        )
        .resumable()
}

pub fn builtin_contracts() -> Vec<RecipeContract> {
    vec![agent(), rag(), hitl_gate()]
}
