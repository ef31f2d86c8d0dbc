//! Domain types and pure policy functions for the pullsync engine.
//!
//! - [`types`]: [`Task`], [`TaskStatus`] and the collection aliases.
//! - [`progress`]: tolerant percent extraction from provider payloads.
//! - [`merge`]: authoritative and peer merges of task maps.

pub mod error;
pub mod merge;
pub mod progress;
pub mod types;

pub use error::CoreError;
pub use types::{DismissedSet, StatusUpdate, Task, TaskId, TaskMap, TaskStatus, Timestamp};
