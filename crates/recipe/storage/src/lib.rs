//! Session storage for paused recipe runs.
//!
//! The engine treats a store as the durable half of its session registry:
//! live sessions stay in memory, snapshots land here so a run can be resumed
//! after the live half is gone.

#![deny(unsafe_code)]

mod error;
mod file;
mod memory;
mod model;
mod traits;

pub use error::{StoreError, StoreResult};
pub use file::FileSessionStore;
pub use memory::InMemorySessionStore;
pub use model::SessionRecord;
pub use traits::SessionStore;
