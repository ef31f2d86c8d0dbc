//! Periodic reconciliation against the authoritative task list.
//!
//! Live channels can miss updates (dropped connections, tasks started in
//! another tab or process). Every `interval` the [`Reconciler`] fetches the
//! full list, merges it with the server winning, and repairs channels:
//! active tasks without a channel get one, terminal tasks with a channel
//! lose it. A failed fetch only sets [`TaskView::sync_error`] and the loop
//! keeps going.
//!
//! [`TaskView::sync_error`]: crate::store::TaskView::sync_error

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::channels::TaskChannelManager;
use crate::service::{JobService, ServiceError};
use crate::store::TaskStore;

/// Default reconciliation interval.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(5);

/// What one reconciliation pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Tasks inserted or replaced from the listing.
    pub merged: usize,
    /// Listed tasks hidden because they are dismissed.
    pub suppressed: usize,
    /// Channels opened for active tasks.
    pub opened: usize,
    /// Channels closed for terminal or dismissed tasks.
    pub closed: usize,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.merged == 0 && self.opened == 0 && self.closed == 0
    }
}

pub struct Reconciler {
    service: Arc<dyn JobService>,
    store: Arc<TaskStore>,
    channels: Arc<TaskChannelManager>,
    interval: Duration,
}

impl Reconciler {
    pub fn new(
        service: Arc<dyn JobService>,
        store: Arc<TaskStore>,
        channels: Arc<TaskChannelManager>,
        interval: Duration,
    ) -> Self {
        Self {
            service,
            store,
            channels,
            interval,
        }
    }

    /// Run until `cancel` fires. The first pass happens immediately.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            interval_ms = self.interval.as_millis() as u64,
            "Reconciler started",
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            // A pass in flight is abandoned on cancellation; its result is
            // never applied.
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.reconcile_once() => match result {
                    Ok(report) if report.is_noop() => {
                        tracing::debug!(suppressed = report.suppressed, "Reconcile pass, no changes");
                    }
                    Ok(report) => {
                        tracing::info!(
                            merged = report.merged,
                            suppressed = report.suppressed,
                            opened = report.opened,
                            closed = report.closed,
                            "Reconciled task list",
                        );
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to fetch task list");
                    }
                },
            }
        }

        tracing::info!("Reconciler stopped");
    }

    /// One pass: fetch, merge, repair channels.
    pub async fn reconcile_once(&self) -> Result<ReconcileReport, ServiceError> {
        let listing = match self.service.list_jobs().await {
            Ok(listing) => listing,
            Err(e) => {
                self.store.set_sync_error(e.to_string());
                return Err(e);
            }
        };

        let outcome = self.store.merge_remote(&listing);
        let mut report = ReconcileReport {
            merged: outcome.changed.len(),
            suppressed: outcome.suppressed.len(),
            ..ReconcileReport::default()
        };

        for id in &outcome.suppressed {
            if self.channels.close(id) {
                report.closed += 1;
            }
        }
        for id in self.channels.open_ids() {
            if self.store.is_dismissed(&id) && self.channels.close(&id) {
                report.closed += 1;
            }
        }

        let view = self.store.snapshot();
        for id in listing.keys() {
            let Some(task) = view.tasks.get(id) else {
                continue;
            };
            let open = self.channels.is_open(id);
            if task.status.is_active() && !open {
                if self.channels.open(id) {
                    report.opened += 1;
                }
            } else if task.is_terminal() && open && self.channels.close(id) {
                report.closed += 1;
            }
        }

        Ok(report)
    }
}
