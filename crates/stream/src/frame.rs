//! Frames delivered on a per-task status channel.
//!
//! The service sends two kinds of frame: `progress` frames carrying a
//! provider-specific payload and `status` frames carrying a
//! [`StatusUpdate`]. Frames may name their kind explicitly with a `"type"`
//! field; untagged frames are classified by shape:
//!
//! | Shape                                   | Frame                        |
//! |-----------------------------------------|------------------------------|
//! | `{"type": "status", "status": ...}`      | status                       |
//! | `{"type": "progress", "progress": {..}}` | progress (`progress` field)  |
//! | `{"status": "<known status>", ...}`      | status                       |
//! | `{"progress": {..}}`                     | progress                     |
//! | `{"status": "<provider phase>", ...}`    | progress (whole object)      |

use pullsync_core::{StatusUpdate, TaskStatus};
use serde::Deserialize;
use serde_json::{Map, Value};

/// One decoded channel frame.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "Value")]
pub enum TaskFrame {
    /// Progress payload, subject to throttling.
    Progress(Value),
    /// Status change, never throttled.
    Status(StatusUpdate),
}

impl TaskFrame {
    /// The status carried by a status frame.
    pub fn status(&self) -> Option<TaskStatus> {
        match self {
            TaskFrame::Status(update) => Some(update.status),
            TaskFrame::Progress(_) => None,
        }
    }

    /// True for a status frame whose status ends the task.
    pub fn is_terminal(&self) -> bool {
        self.status().is_some_and(TaskStatus::is_terminal)
    }
}

/// A JSON value that is not a recognisable channel frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("Frame is not a JSON object")]
    NotAnObject,

    #[error("Unknown frame type '{0}'")]
    UnknownKind(String),

    #[error("Invalid status frame: {0}")]
    InvalidStatus(#[source] serde_json::Error),

    #[error("Frame carries neither status nor progress")]
    Unrecognised,
}

impl TryFrom<Value> for TaskFrame {
    type Error = FrameError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let Value::Object(mut object) = value else {
            return Err(FrameError::NotAnObject);
        };

        let kind = match object.remove("type") {
            Some(Value::String(kind)) => Some(kind),
            Some(other) => return Err(FrameError::UnknownKind(other.to_string())),
            None => None,
        };

        match kind.as_deref() {
            Some("status") => status_frame(object),
            Some("progress") => Ok(progress_frame(object)),
            Some(other) => Err(FrameError::UnknownKind(other.to_string())),
            None if has_known_status(&object) => status_frame(object),
            None if object.get("progress").is_some_and(|p| !p.is_null()) => {
                Ok(progress_frame(object))
            }
            None if object.contains_key("status") => Ok(TaskFrame::Progress(Value::Object(object))),
            None => Err(FrameError::Unrecognised),
        }
    }
}

fn has_known_status(object: &Map<String, Value>) -> bool {
    object
        .get("status")
        .and_then(Value::as_str)
        .is_some_and(|s| s.parse::<TaskStatus>().is_ok())
}

fn status_frame(object: Map<String, Value>) -> Result<TaskFrame, FrameError> {
    serde_json::from_value(Value::Object(object))
        .map(TaskFrame::Status)
        .map_err(FrameError::InvalidStatus)
}

/// Prefer the nested `progress` payload; fall back to the whole object.
fn progress_frame(mut object: Map<String, Value>) -> TaskFrame {
    match object.remove("progress") {
        Some(payload) if !payload.is_null() => TaskFrame::Progress(payload),
        _ => TaskFrame::Progress(Value::Object(object)),
    }
}
