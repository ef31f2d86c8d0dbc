//! Live status channels, at most one per task.
//!
//! [`TaskChannelManager`] opens a streaming connection for each active
//! task and routes its frames into the [`TaskStore`]: progress frames pass
//! through the [`ThrottlePolicy`], status frames are applied directly and a
//! terminal status closes the channel right after it is applied. A channel
//! whose transport fails is logged and closed; reconciliation reopens it
//! if the task is still active.
//!
//! Every channel owns a child of the manager's cancellation token. Once a
//! channel is closed its token is cancelled and no further frame reaches
//! the store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use pullsync_core::TaskId;
use pullsync_stream::{decode_stream, DecodeOutcome, TaskFrame};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::service::JobService;
use crate::store::TaskStore;
use crate::throttle::ThrottlePolicy;

/// How long shutdown waits for each channel task to exit.
const CHANNEL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Bookkeeping for one open channel.
struct OpenChannel {
    /// Distinguishes this channel from a later one for the same task.
    generation: u64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Open channels keyed by task id.
#[derive(Default)]
struct ChannelRegistry {
    open: HashMap<TaskId, OpenChannel>,
    next_generation: u64,
}

impl ChannelRegistry {
    fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    /// Remove the entry only if it still belongs to `generation`.
    fn remove_generation(&mut self, task_id: &str, generation: u64) -> Option<OpenChannel> {
        match self.open.get(task_id) {
            Some(channel) if channel.generation == generation => self.open.remove(task_id),
            _ => None,
        }
    }
}

pub struct TaskChannelManager {
    registry: Mutex<ChannelRegistry>,
    throttle: Mutex<ThrottlePolicy>,
    service: Arc<dyn JobService>,
    store: Arc<TaskStore>,
    /// Master token; every channel token is a child of it.
    cancel: CancellationToken,
}

impl TaskChannelManager {
    pub fn new(
        service: Arc<dyn JobService>,
        store: Arc<TaskStore>,
        throttle: ThrottlePolicy,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry: Mutex::new(ChannelRegistry::default()),
            throttle: Mutex::new(throttle),
            service,
            store,
            cancel,
        })
    }

    /// Open a channel for `task_id` unless one is already open, the task
    /// is dismissed or the manager is shutting down. Returns whether a new
    /// channel was spawned. Must be called inside a Tokio runtime.
    pub fn open(self: &Arc<Self>, task_id: &str) -> bool {
        if self.cancel.is_cancelled() || self.store.is_dismissed(task_id) {
            return false;
        }

        let mut registry = self.registry();
        if registry.open.contains_key(task_id) {
            return false;
        }

        let generation = registry.next_generation();
        let cancel = self.cancel.child_token();
        // The registry lock is held until the entry is inserted, so the
        // spawned task cannot observe a missing entry.
        let handle = tokio::spawn(Arc::clone(self).run_channel(
            task_id.to_string(),
            generation,
            cancel.clone(),
        ));
        registry.open.insert(
            task_id.to_string(),
            OpenChannel {
                generation,
                cancel,
                handle,
            },
        );

        tracing::info!(task_id, generation, "Task channel opened");
        true
    }

    /// Close the channel for `task_id`. Safe to call when none is open.
    pub fn close(&self, task_id: &str) -> bool {
        let removed = self.registry().open.remove(task_id);
        self.throttle().forget(task_id);
        match removed {
            Some(channel) => {
                channel.cancel.cancel();
                tracing::info!(task_id, generation = channel.generation, "Task channel closed");
                true
            }
            None => false,
        }
    }

    /// Close every open channel without waiting for their tasks.
    pub fn close_all(&self) -> usize {
        let drained: Vec<(TaskId, OpenChannel)> = self.registry().open.drain().collect();
        let mut throttle = self.throttle();
        for (task_id, channel) in &drained {
            channel.cancel.cancel();
            throttle.forget(task_id);
        }
        drained.len()
    }

    /// Cancel the master token, close every channel and wait for their
    /// tasks to exit.
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        let drained: Vec<(TaskId, OpenChannel)> = self.registry().open.drain().collect();
        for (task_id, channel) in drained {
            channel.cancel.cancel();
            self.throttle().forget(&task_id);
            if tokio::time::timeout(CHANNEL_SHUTDOWN_TIMEOUT, channel.handle)
                .await
                .is_err()
            {
                tracing::warn!(task_id = %task_id, "Task channel did not stop in time");
            }
        }
    }

    pub fn is_open(&self, task_id: &str) -> bool {
        self.registry().open.contains_key(task_id)
    }

    pub fn open_ids(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self.registry().open.keys().cloned().collect();
        ids.sort();
        ids
    }

    // ---- private helpers ----

    fn registry(&self) -> MutexGuard<'_, ChannelRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn throttle(&self) -> MutexGuard<'_, ThrottlePolicy> {
        self.throttle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop the registry entry of a channel that ended on its own.
    fn release(&self, task_id: &str, generation: u64) {
        let released = self.registry().remove_generation(task_id, generation);
        if let Some(channel) = released {
            channel.cancel.cancel();
            self.throttle().forget(task_id);
        }
    }

    /// Body of one channel task: open the stream, feed frames to the store
    /// until the stream ends, fails or is cancelled.
    async fn run_channel(self: Arc<Self>, task_id: TaskId, generation: u64, cancel: CancellationToken) {
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(task_id = %task_id, "Task channel cancelled before connecting");
                return;
            }
            opened = self.service.open_status_stream(&task_id) => opened,
        };

        let reader = match opened {
            Ok(reader) => reader,
            Err(e) => {
                tracing::warn!(task_id = %task_id, error = %e, "Failed to open task channel");
                self.release(&task_id, generation);
                return;
            }
        };

        let outcome = decode_stream(reader, &cancel, |frame: TaskFrame| {
            self.handle_frame(&task_id, generation, &cancel, frame);
        })
        .await;

        match outcome {
            Ok(DecodeOutcome::Cancelled(stats)) => {
                tracing::debug!(
                    task_id = %task_id,
                    delivered = stats.delivered,
                    malformed = stats.malformed,
                    "Task channel stopped",
                );
            }
            Ok(DecodeOutcome::Finished(stats)) => {
                tracing::info!(
                    task_id = %task_id,
                    delivered = stats.delivered,
                    malformed = stats.malformed,
                    "Task channel ended by server",
                );
            }
            Err(e) => {
                tracing::warn!(task_id = %task_id, error = %e, "Task channel transport error");
            }
        }

        self.release(&task_id, generation);
    }

    fn handle_frame(&self, task_id: &str, generation: u64, cancel: &CancellationToken, frame: TaskFrame) {
        match frame {
            TaskFrame::Progress(progress) => {
                if self.throttle().should_emit(task_id, &progress) {
                    self.store.apply_progress(task_id, progress);
                } else {
                    tracing::trace!(task_id, "Progress update throttled");
                }
            }
            TaskFrame::Status(update) => {
                tracing::debug!(task_id, status = %update.status, "Status frame");
                self.store.apply_status(task_id, &update);
                if update.status.is_terminal() {
                    cancel.cancel();
                    self.release(task_id, generation);
                    tracing::info!(task_id, status = %update.status, "Task finished, channel closed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generations_increase() {
        let mut registry = ChannelRegistry::default();
        let first = registry.next_generation();
        assert!(registry.next_generation() > first);
    }

    #[tokio::test]
    async fn stale_generation_does_not_remove_newer_channel() {
        let mut registry = ChannelRegistry::default();
        let old = registry.next_generation();
        let new = registry.next_generation();
        registry.open.insert(
            "t1".into(),
            OpenChannel {
                generation: new,
                cancel: CancellationToken::new(),
                handle: tokio::spawn(async {}),
            },
        );

        assert!(registry.remove_generation("t1", old).is_none());
        assert!(registry.open.contains_key("t1"));
        assert!(registry.remove_generation("t1", new).is_some());
        assert!(registry.open.is_empty());
    }
}
