//! Task records as reported by the remote job service and mutated locally
//! by channel frames.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Opaque task identifier assigned by the remote job service.
pub type TaskId = String;

/// Tasks keyed by id. Ordered so snapshots compare and serialize
/// deterministically.
pub type TaskMap = BTreeMap<TaskId, Task>;

/// Ids the user has hidden locally. Never sent to the remote service.
pub type DismissedSet = BTreeSet<TaskId>;

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

/// Lifecycle state of a background job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Error,
    Cancelled,
}

impl TaskStatus {
    /// Every known status, in lifecycle order.
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Error,
        TaskStatus::Cancelled,
    ];

    /// Wire name of the status.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Error => "error",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// `completed`, `error` and `cancelled` end the task; no channel may
    /// stay open for a task in one of these states.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Error | TaskStatus::Cancelled
        )
    }

    /// `pending` and `running` tasks get a live channel.
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| CoreError::Validation(format!("Unknown task status: '{s}'")))
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// One tracked background job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Filled from the map key when the service omits it from the record.
    #[serde(default)]
    pub id: TaskId,
    /// Human-readable name of the thing being produced (e.g. a model tag).
    #[serde(alias = "name", alias = "model", default)]
    pub subject_name: String,
    pub status: TaskStatus,
    /// Provider-specific progress payload. See [`crate::progress`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<serde_json::Value>,
    /// Only meaningful while `status` is [`TaskStatus::Error`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<Timestamp>,
    /// Local bookkeeping: last time this process changed the record's
    /// content. Excluded from [`Task::same_content`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<Timestamp>,
}

impl Task {
    /// A freshly started, still pending task.
    pub fn new(id: impl Into<TaskId>, subject_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            subject_name: subject_name.into(),
            status: TaskStatus::Pending,
            progress: None,
            error: None,
            created_at: None,
            started_at: None,
            completed_at: None,
            updated_at: None,
        }
    }

    /// Set the status (builder style, mostly for tests and speculative inserts).
    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }

    /// Set the progress payload.
    pub fn with_progress(mut self, progress: serde_json::Value) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Set the creation timestamp.
    pub fn with_created_at(mut self, created_at: Timestamp) -> Self {
        self.created_at = Some(created_at);
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Most recent of the record's timestamps, used to decide which copy of
    /// a task is fresher when two tabs disagree.
    pub fn last_touched(&self) -> Option<Timestamp> {
        [
            self.updated_at,
            self.completed_at,
            self.started_at,
            self.created_at,
        ]
        .into_iter()
        .flatten()
        .max()
    }

    /// Compare everything except the local `updated_at` stamp.
    pub fn same_content(&self, other: &Task) -> bool {
        self.id == other.id
            && self.subject_name == other.subject_name
            && self.status == other.status
            && self.progress == other.progress
            && self.error == other.error
            && self.created_at == other.created_at
            && self.started_at == other.started_at
            && self.completed_at == other.completed_at
    }

    /// Apply a status frame. Status is always taken; optional fields only
    /// replace what the frame actually carries. `error` is cleared whenever
    /// the new status is not [`TaskStatus::Error`].
    pub fn apply_status(&mut self, update: &StatusUpdate) {
        self.status = update.status;
        if let Some(progress) = &update.progress {
            self.progress = Some(progress.clone());
        }
        self.error = if update.status == TaskStatus::Error {
            update.error.clone().or_else(|| self.error.take())
        } else {
            None
        };
        if update.started_at.is_some() {
            self.started_at = update.started_at;
        }
        if update.completed_at.is_some() {
            self.completed_at = update.completed_at;
        }
    }
}

/// Payload of a `status` frame on a task channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<Timestamp>,
}

impl StatusUpdate {
    /// A bare status change with no optional fields.
    pub fn new(status: TaskStatus) -> Self {
        Self {
            status,
            progress: None,
            error: None,
            started_at: None,
            completed_at: None,
        }
    }
}
