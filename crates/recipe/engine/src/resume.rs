//! Resume adapters
//!
//! When a paused run is resumed, a resume adapter turns the caller's
//! resume input (an approval, an edited draft, a scheduler tick) into the
//! value the pausing helper receives as `resume_input`.

use crate::adapter::{AdapterBundle, AdapterHandle, AdapterInstance};
use crate::provider::ProviderRegistry;
use recipe_types::{AdapterError, CapabilityKey, MaybeAsync, PauseToken};
use std::sync::Arc;

/// Everything a resume adapter may look at.
#[derive(Debug, Clone)]
pub struct ResumeRequest {
    pub token: PauseToken,
    pub resume_input: serde_json::Value,
    pub pause_kind: String,
    /// Durable snapshot, present only on the store-backed path
    pub resume_snapshot: Option<serde_json::Value>,
    pub adapters: AdapterBundle,
    pub providers: ProviderRegistry,
}

pub trait ResumeAdapter: Send + Sync {
    fn resolve(&self, request: ResumeRequest) -> MaybeAsync<'static, Result<serde_json::Value, AdapterError>>;
}

/// Hands the resume input through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughResumeAdapter;

impl ResumeAdapter for PassthroughResumeAdapter {
    fn resolve(&self, request: ResumeRequest) -> MaybeAsync<'static, Result<serde_json::Value, AdapterError>> {
        MaybeAsync::ok(request.resume_input)
    }
}

/// Store a resume adapter so it can travel in an [`AdapterBundle`] under `resume`.
pub fn resume_adapter_instance(adapter: Arc<dyn ResumeAdapter>) -> AdapterInstance {
    AdapterInstance::Single(AdapterHandle::new(adapter))
}

/// The resume adapter carried by a bundle, if any.
pub fn resume_adapter_from_bundle(bundle: &AdapterBundle) -> Option<Arc<dyn ResumeAdapter>> {
    bundle
        .get(&CapabilityKey::Resume)
        .and_then(AdapterInstance::as_single)
        .and_then(|handle| handle.downcast_ref::<Arc<dyn ResumeAdapter>>())
        .cloned()
}
