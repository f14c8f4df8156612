//! Recipe Runtime Engine
//!
//! A recipe is a named workflow contract. Plugins contribute capabilities,
//! adapters and stage logic; the runtime composes them, resolves adapters
//! for the constructs a run needs, executes the staged pipeline with
//! rollback and retry, and lets any helper suspend the run until a caller
//! resumes it with an opaque pause token.
//!
//! # Key Principle
//!
//! **The runtime never calls a model or a retriever itself.** It invokes
//! capability-shaped adapters supplied by plugins and providers, and
//! reports what it could not satisfy as diagnostics instead of failing.
//!
//! # Architecture
//!
//! The [`RecipeRuntime`] composes specialized components:
//!
//! - [`plugin`]: plugin composition, capability merging, registrations
//! - [`provider`]: the provider registry and adapter resolution
//! - [`stage_builder`]: ordering helpers into lifecycle and helper stages
//! - [`pipeline`]: the resumable stage executor
//! - [`retry`]: bounded retry around adapter calls
//! - [`driver`] and [`session`]: the pause/resume state machine and the
//!   pause-session table
//!
//! # Example
//!
//! ```rust,no_run
//! use recipe_engine::helper::{helper_fn, HelperEffect, HelperSpec};
//! use recipe_engine::{recipes, Plugin, RecipeRuntime, RunOptions, RuntimeOptions};
//! use recipe_types::MaybeAsync;
//! use std::sync::Arc;
//!
//! # async fn demo() {
//! let answer = Plugin::new("answer").with_helper(HelperSpec::new(
//!     "generate",
//!     "generate",
//!     helper_fn(|args, _next| {
//!         args.output.set("answer", serde_json::json!("42"));
//!         MaybeAsync::ok(HelperEffect::none())
//!     }),
//! ));
//!
//! let runtime = RecipeRuntime::new(Arc::new(recipes::rag()), vec![answer], RuntimeOptions::new());
//! let outcome = runtime.run(serde_json::json!({"question": "?"}), RunOptions::new()).await;
//! assert!(outcome.is_ok());
//! # }
//! ```

#![deny(unsafe_code)]

pub mod adapter;
pub mod config;
pub mod context;
pub mod contract;
pub mod driver;
pub mod helper;
pub mod pipeline;
pub mod plugin;
pub mod provider;
pub mod recipes;
pub mod registry;
pub mod reporter;
pub mod resume;
pub mod retry;
pub mod runtime;
pub mod session;
pub mod stage_builder;
pub mod telemetry;

// Re-export main types
pub use adapter::{AdapterBundle, AdapterHandle, AdapterInstance, AdapterMetadata};
pub use config::RuntimeConfig;
pub use context::{RunContext, UserState};
pub use contract::RecipeContract;
pub use driver::{Driver, Producer, Step, Yielded};
pub use helper::{Helper, HelperArgs, HelperEffect, HelperSpec, PauseRequest, Rollback};
pub use pipeline::{Next, PipelineRun, PipelineSnapshot};
pub use plugin::{CompositionMode, Plugin};
pub use provider::{ProviderRegistration, ProviderRegistry};
pub use registry::RecipeRegistry;
pub use reporter::Reporter;
pub use resume::{PassthroughResumeAdapter, ResumeAdapter};
pub use retry::{AdapterCallContext, RetryExecutor};
pub use runtime::{Explanation, RecipeRuntime, RunOptions, RuntimeOptions};
pub use session::SessionRegistry;
