//! Observable task state for one tab.
//!
//! [`TaskStore`] owns the task map and the dismissed set, publishes every
//! change as a [`TaskView`] on a `watch` channel, and mirrors both
//! collections into the [`PersistentCache`] after each local mutation.
//! A sibling tab's task map is applied without being written back, so two
//! tabs never echo the same value at each other. Its dismissed set is
//! unioned with ours and only written back when ours held more.
//!
//! Invariant: an id in the dismissed set is never a key of the task map.

use chrono::Utc;
use pullsync_cache::PersistentCache;
use pullsync_core::merge::{merge_authoritative, merge_peer, MergeOutcome};
use pullsync_core::{DismissedSet, StatusUpdate, Task, TaskId, TaskMap, TaskStatus, Timestamp};
use serde_json::Value;
use tokio::sync::watch;

/// Everything a consumer can observe about the tab's tasks.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TaskView {
    pub tasks: TaskMap,
    pub dismissed: DismissedSet,
    /// Last reconciliation failure, cleared by the next success.
    pub sync_error: Option<String>,
    pub last_synced_at: Option<Timestamp>,
}

impl TaskView {
    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    /// Tasks that still expect progress.
    pub fn active(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values().filter(|t| t.status.is_active())
    }

    /// Ids of tasks producing `subject_name`.
    pub fn ids_for_subject(&self, subject_name: &str) -> Vec<TaskId> {
        self.tasks
            .values()
            .filter(|t| t.subject_name == subject_name)
            .map(|t| t.id.clone())
            .collect()
    }

    pub fn ids_with_status(&self, status: TaskStatus) -> Vec<TaskId> {
        self.tasks
            .values()
            .filter(|t| t.status == status)
            .map(|t| t.id.clone())
            .collect()
    }
}

/// Which collections a mutation touched and must be persisted.
#[derive(Debug, Default, Clone, Copy)]
struct Dirty {
    tasks: bool,
    dismissed: bool,
}

impl Dirty {
    fn any(self) -> bool {
        self.tasks || self.dismissed
    }
}

pub struct TaskStore {
    view: watch::Sender<TaskView>,
    cache: PersistentCache,
}

impl TaskStore {
    /// Start from whatever the cache holds. Tasks that are also in the
    /// dismissed set are dropped.
    pub fn new(cache: PersistentCache) -> Self {
        let snapshot = cache.load();
        let mut tasks = snapshot.tasks;
        tasks.retain(|id, _| !snapshot.dismissed.contains(id));

        let (view, _) = watch::channel(TaskView {
            tasks,
            dismissed: snapshot.dismissed,
            ..TaskView::default()
        });
        Self { view, cache }
    }

    pub fn snapshot(&self) -> TaskView {
        self.view.borrow().clone()
    }

    /// Receive every future view. The current view is marked as seen.
    pub fn subscribe(&self) -> watch::Receiver<TaskView> {
        self.view.subscribe()
    }

    pub fn get(&self, task_id: &str) -> Option<Task> {
        self.view.borrow().tasks.get(task_id).cloned()
    }

    pub fn is_dismissed(&self, task_id: &str) -> bool {
        self.view.borrow().dismissed.contains(task_id)
    }

    // ---- channel updates ----

    /// Replace the progress payload of a known task. Unknown and dismissed
    /// tasks are ignored. Returns whether anything changed.
    pub fn apply_progress(&self, task_id: &str, progress: Value) -> bool {
        self.mutate(|view| {
            let Some(task) = view.tasks.get_mut(task_id) else {
                return Dirty::default();
            };
            if task.progress.as_ref() == Some(&progress) {
                return Dirty::default();
            }
            task.progress = Some(progress);
            task.updated_at = Some(Utc::now());
            Dirty {
                tasks: true,
                dismissed: false,
            }
        })
    }

    /// Apply a status frame to a known task. Unknown and dismissed tasks
    /// are ignored. Returns whether anything changed.
    pub fn apply_status(&self, task_id: &str, update: &StatusUpdate) -> bool {
        self.mutate(|view| {
            let Some(task) = view.tasks.get_mut(task_id) else {
                return Dirty::default();
            };
            let before = task.clone();
            task.apply_status(update);
            if task.same_content(&before) {
                return Dirty::default();
            }
            task.updated_at = Some(Utc::now());
            Dirty {
                tasks: true,
                dismissed: false,
            }
        })
    }

    /// Insert a task this tab just started, unless it is already known or
    /// dismissed.
    pub fn insert_speculative(&self, mut task: Task) -> bool {
        self.mutate(|view| {
            if view.tasks.contains_key(&task.id) || view.dismissed.contains(&task.id) {
                return Dirty::default();
            }
            let now = Utc::now();
            task.created_at.get_or_insert(now);
            task.updated_at = Some(now);
            view.tasks.insert(task.id.clone(), task);
            Dirty {
                tasks: true,
                dismissed: false,
            }
        })
    }

    // ---- reconciliation ----

    /// Merge an authoritative listing, clear any sync error and stamp the
    /// sync time.
    pub fn merge_remote(&self, listing: &TaskMap) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();

        self.view.send_modify(|view| {
            let now = Utc::now();
            outcome = merge_authoritative(&mut view.tasks, listing, &view.dismissed, now);
            view.sync_error = None;
            view.last_synced_at = Some(now);
            if !outcome.is_noop() {
                self.cache.save(&view.tasks);
            }
        });

        outcome
    }

    /// Record a failed reconciliation. Task data is left alone.
    pub fn set_sync_error(&self, message: impl Into<String>) {
        let message = message.into();
        self.view.send_if_modified(|view| {
            if view.sync_error.as_deref() == Some(message.as_str()) {
                return false;
            }
            view.sync_error = Some(message);
            true
        });
    }

    // ---- dismissal ----

    /// Hide `task_id` permanently: record it as dismissed and drop its
    /// record. Idempotent; returns whether anything changed.
    pub fn dismiss(&self, task_id: &str) -> bool {
        self.mutate(|view| Dirty {
            dismissed: view.dismissed.insert(task_id.to_string()),
            tasks: view.tasks.remove(task_id).is_some(),
        })
    }

    /// Dismiss several tasks in one mutation. Returns the ids that were not
    /// dismissed before.
    pub fn dismiss_many(&self, task_ids: &[TaskId]) -> Vec<TaskId> {
        let mut newly = Vec::new();
        self.mutate(|view| {
            let mut dirty = Dirty::default();
            for id in task_ids {
                if view.dismissed.insert(id.clone()) {
                    dirty.dismissed = true;
                    newly.push(id.clone());
                }
                dirty.tasks |= view.tasks.remove(id).is_some();
            }
            dirty
        });
        newly
    }

    // ---- sibling tabs ----

    /// Merge a sibling tab's task map. Not written back.
    pub fn apply_peer_tasks(&self, incoming: &TaskMap) -> Vec<TaskId> {
        let mut changed = Vec::new();
        self.view.send_if_modified(|view| {
            changed = merge_peer(&mut view.tasks, incoming, &view.dismissed);
            !changed.is_empty()
        });
        changed
    }

    /// Fold a sibling tab's dismissed set into ours and drop the records it
    /// now hides. Returns the ids newly dismissed here.
    ///
    /// Dismissals are permanent, so a set is merged as a union. When ours
    /// held ids the sibling's lacked, the union is written back so every tab
    /// converges on it. `None` means the cache was cleared; the local set is
    /// emptied to match and nothing is written.
    pub fn merge_dismissed(&self, incoming: Option<DismissedSet>) -> Vec<TaskId> {
        let mut newly = Vec::new();
        self.view.send_if_modified(|view| {
            let Some(incoming) = incoming else {
                if view.dismissed.is_empty() {
                    return false;
                }
                view.dismissed.clear();
                return true;
            };

            newly = incoming.difference(&view.dismissed).cloned().collect();
            let write_back = !view.dismissed.is_subset(&incoming);
            if newly.is_empty() {
                if write_back {
                    self.cache.save_dismissed(&view.dismissed);
                }
                return false;
            }

            view.tasks.retain(|id, _| !incoming.contains(id));
            view.dismissed.extend(incoming);
            if write_back {
                self.cache.save_dismissed(&view.dismissed);
            }
            true
        });
        newly
    }

    /// Apply `f`, publish the new view if it reports a change and persist
    /// the collections it touched.
    fn mutate(&self, f: impl FnOnce(&mut TaskView) -> Dirty) -> bool {
        self.view.send_if_modified(|view| {
            let dirty = f(view);
            if dirty.tasks {
                self.cache.save(&view.tasks);
            }
            if dirty.dismissed {
                self.cache.save_dismissed(&view.dismissed);
            }
            dirty.any()
        })
    }
}
