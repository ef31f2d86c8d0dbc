//! Task synchronization engine.
//!
//! One [`TaskEngine`] per tab keeps a local, observable, persisted view of
//! the remote job service's tasks:
//!
//! - [`service`]: the [`JobService`] seam and its HTTP client.
//! - [`store`]: the observable [`TaskView`] and its persistence.
//! - [`channels`]: one live status channel per active task.
//! - [`throttle`]: per-task rate limiting of progress updates.
//! - [`reconcile`]: periodic merge with the authoritative task list.
//! - [`dismissal`]: permanent local hiding of tasks.
//! - [`config`]: environment-driven [`EngineConfig`].

pub mod channels;
pub mod config;
pub mod dismissal;
pub mod engine;
pub mod reconcile;
pub mod service;
pub mod store;
pub mod throttle;

pub use channels::TaskChannelManager;
pub use config::{ConfigError, EngineConfig};
pub use dismissal::Dismissal;
pub use engine::TaskEngine;
pub use reconcile::{ReconcileReport, Reconciler};
pub use service::{HttpJobService, JobService, ServiceError, StatusStream};
pub use store::{TaskStore, TaskView};
pub use throttle::{ThrottleConfig, ThrottlePolicy};
