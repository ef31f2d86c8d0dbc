//! The per-tab engine.
//!
//! [`TaskEngine`] wires the store, channel manager, reconciler, dismissal
//! and the sibling-tab listener together behind one handle. It owns the
//! master cancellation token; [`TaskEngine::shutdown`] tears everything
//! down and is safe to call more than once.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use pullsync_cache::{CacheChange, CacheSubscription, PersistentCache, TabStorage};
use pullsync_core::{Task, TaskId};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::channels::TaskChannelManager;
use crate::config::EngineConfig;
use crate::dismissal::Dismissal;
use crate::reconcile::{ReconcileReport, Reconciler};
use crate::service::{JobService, ServiceError};
use crate::store::{TaskStore, TaskView};

/// How long shutdown waits for each background task.
const BACKGROUND_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Task synchronization for one tab.
///
/// Created with [`TaskEngine::start`], which spawns the reconciliation loop
/// and the sibling-tab listener onto the current Tokio runtime.
pub struct TaskEngine {
    store: Arc<TaskStore>,
    channels: Arc<TaskChannelManager>,
    reconciler: Arc<Reconciler>,
    dismissal: Dismissal,
    service: Arc<dyn JobService>,
    /// Master cancellation token, cancelled during shutdown.
    cancel: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskEngine {
    /// Load the cache, then start reconciling and listening to sibling
    /// tabs. Must be called inside a Tokio runtime.
    pub fn start(config: &EngineConfig, service: Arc<dyn JobService>, storage: TabStorage) -> Self {
        let cache = PersistentCache::new(storage, config.cache_keys());
        let peer_changes = cache.subscribe();
        let store = Arc::new(TaskStore::new(cache));
        let cancel = CancellationToken::new();

        let channels = TaskChannelManager::new(
            Arc::clone(&service),
            Arc::clone(&store),
            config.throttle_policy(),
            cancel.child_token(),
        );
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&service),
            Arc::clone(&store),
            Arc::clone(&channels),
            config.reconcile_interval,
        ));
        let dismissal = Dismissal::new(Arc::clone(&store), Arc::clone(&channels));

        let reconcile_task = {
            let reconciler = Arc::clone(&reconciler);
            let cancel = cancel.child_token();
            tokio::spawn(async move { reconciler.run(cancel).await })
        };
        let peer_task = tokio::spawn(follow_sibling_tabs(
            peer_changes,
            Arc::clone(&store),
            Arc::clone(&channels),
            cancel.child_token(),
        ));

        let view = store.snapshot();
        tracing::info!(
            tasks = view.tasks.len(),
            dismissed = view.dismissed.len(),
            service_url = %config.service_url,
            "Task engine started",
        );

        Self {
            store,
            channels,
            reconciler,
            dismissal,
            service,
            cancel,
            background: Mutex::new(vec![reconcile_task, peer_task]),
        }
    }

    /// Current observable view.
    pub fn snapshot(&self) -> TaskView {
        self.store.snapshot()
    }

    /// Receive every future view.
    pub fn subscribe(&self) -> watch::Receiver<TaskView> {
        self.store.subscribe()
    }

    pub fn channels(&self) -> &Arc<TaskChannelManager> {
        &self.channels
    }

    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Start a job remotely, record it locally as pending and open its
    /// channel right away.
    pub async fn start_job(&self, subject_name: &str) -> Result<TaskId, ServiceError> {
        let task_id = self.service.start_job(subject_name).await?;
        self.store.insert_speculative(Task::new(task_id.clone(), subject_name));
        self.channels.open(&task_id);
        Ok(task_id)
    }

    /// Ask the service to cancel a task. Local state changes only when the
    /// cancellation is confirmed by a frame or a later listing.
    pub async fn cancel_job(&self, task_id: &str) -> Result<(), ServiceError> {
        self.service.cancel_job(task_id).await.inspect_err(|e| {
            tracing::warn!(task_id, error = %e, "Cancel request failed");
        })
    }

    /// Hide a task permanently in this tab and its siblings.
    pub fn dismiss(&self, task_id: &str) -> bool {
        self.dismissal.dismiss(task_id)
    }

    pub fn dismiss_by_name(&self, subject_name: &str) -> Vec<TaskId> {
        self.dismissal.dismiss_by_name(subject_name)
    }

    pub fn dismiss_all_errors(&self) -> Vec<TaskId> {
        self.dismissal.dismiss_all_errors()
    }

    /// Dismiss locally, then ask the service to forget the task. A remote
    /// failure is logged only; the local dismissal stands.
    pub async fn dismiss_remote(&self, task_id: &str) -> bool {
        let changed = self.dismissal.dismiss(task_id);
        if let Err(e) = self.service.dismiss_job(task_id).await {
            tracing::warn!(task_id, error = %e, "Remote dismiss failed, kept local dismissal");
        }
        changed
    }

    /// Run one reconciliation pass now, outside the regular schedule.
    pub async fn reconcile_now(&self) -> Result<ReconcileReport, ServiceError> {
        self.reconciler.reconcile_once().await
    }

    /// Stop reconciliation, close every channel and wait for background
    /// tasks. Later calls are no-ops.
    pub async fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> = self
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        if handles.is_empty() && self.cancel.is_cancelled() {
            return;
        }

        tracing::info!("Shutting down task engine");
        self.cancel.cancel();
        self.channels.shutdown().await;

        for handle in handles {
            if tokio::time::timeout(BACKGROUND_SHUTDOWN_TIMEOUT, handle)
                .await
                .is_err()
            {
                tracing::warn!("Background task did not stop in time");
            }
        }

        tracing::info!("Task engine shut down complete");
    }
}

impl Drop for TaskEngine {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Apply sibling tabs' cache writes until cancelled.
async fn follow_sibling_tabs(
    mut changes: CacheSubscription,
    store: Arc<TaskStore>,
    channels: Arc<TaskChannelManager>,
    cancel: CancellationToken,
) {
    loop {
        let change = tokio::select! {
            _ = cancel.cancelled() => break,
            change = changes.recv() => change,
        };

        match change {
            Some(CacheChange::Tasks(tasks)) => {
                let changed = store.apply_peer_tasks(&tasks);
                for id in &changed {
                    if store.get(id).is_some_and(|task| task.is_terminal()) {
                        channels.close(id);
                    }
                }
                if !changed.is_empty() {
                    tracing::debug!(count = changed.len(), "Merged tasks from sibling tab");
                }
            }
            Some(CacheChange::Dismissed(dismissed)) => {
                let newly = store.merge_dismissed(dismissed);
                for id in &newly {
                    channels.close(id);
                }
                if !newly.is_empty() {
                    tracing::debug!(count = newly.len(), "Applied dismissals from sibling tab");
                }
            }
            None => break,
        }
    }
}
