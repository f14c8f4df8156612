//! Recipe Runtime Domain Types
//!
//! Shared vocabulary of the recipe runtime: everything the plugin
//! composer, adapter resolver, pipeline executor, retry engine and
//! pause/resume driver exchange with each other and with callers.
//!
//! # Key Concepts
//!
//! - **Diagnostic**: a structured, non-throwing report with a kind and a
//!   level. Strict mode promotes contract-shaped kinds to errors.
//! - **Outcome**: the terminal result of a run, `ok`, `paused` or
//!   `error`, always carrying the trace and the diagnostics.
//! - **Capability**: a declared fact merged across plugins with
//!   scalar-or-list semantics.
//! - **ConstructRequirement**: a runtime need for one adapter family.
//! - **RetryPolicy**: bounded exponential backoff with an optional
//!   pause mode that hands the wait to the orchestrator.
//! - **MaybeAsync**: a value that is either immediate or a future.

#![deny(unsafe_code)]

mod capability;
mod construct;
mod diagnostics;
mod errors;
mod events;
mod ids;
mod maybe;
mod outcome;
mod retry;
mod trace;

pub use capability::*;
pub use construct::*;
pub use diagnostics::*;
pub use errors::*;
pub use events::*;
pub use ids::*;
pub use maybe::*;
pub use outcome::*;
pub use retry::*;
pub use trace::*;
