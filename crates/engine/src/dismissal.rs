//! Permanent local hiding of tasks.
//!
//! Dismissal is purely local and synchronous: the id is added to the
//! persisted dismissed set, the record is dropped and the task's channel
//! is closed. Later listings and sibling tabs cannot bring it back.

use std::sync::Arc;

use pullsync_core::{TaskId, TaskStatus};

use crate::channels::TaskChannelManager;
use crate::store::TaskStore;

pub struct Dismissal {
    store: Arc<TaskStore>,
    channels: Arc<TaskChannelManager>,
}

impl Dismissal {
    pub fn new(store: Arc<TaskStore>, channels: Arc<TaskChannelManager>) -> Self {
        Self { store, channels }
    }

    /// Dismiss one task. Idempotent; returns whether anything changed.
    pub fn dismiss(&self, task_id: &str) -> bool {
        let changed = self.store.dismiss(task_id);
        self.channels.close(task_id);
        if changed {
            tracing::info!(task_id, "Task dismissed");
        }
        changed
    }

    /// Dismiss every known task for `subject_name`. Returns the ids newly
    /// dismissed.
    pub fn dismiss_by_name(&self, subject_name: &str) -> Vec<TaskId> {
        let ids = self.store.snapshot().ids_for_subject(subject_name);
        self.dismiss_ids(&ids)
    }

    /// Dismiss every task currently in `error`. Returns the ids newly
    /// dismissed.
    pub fn dismiss_all_errors(&self) -> Vec<TaskId> {
        let ids = self.store.snapshot().ids_with_status(TaskStatus::Error);
        self.dismiss_ids(&ids)
    }

    fn dismiss_ids(&self, ids: &[TaskId]) -> Vec<TaskId> {
        if ids.is_empty() {
            return Vec::new();
        }
        let newly = self.store.dismiss_many(ids);
        for id in ids {
            self.channels.close(id);
        }
        tracing::info!(count = newly.len(), "Tasks dismissed");
        newly
    }
}
