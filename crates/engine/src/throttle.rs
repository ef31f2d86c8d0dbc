//! Per-task rate limiting of progress updates.
//!
//! A progress frame is let through when any of these holds, checked in
//! order:
//!
//! 1. nothing has been emitted for the task yet;
//! 2. at least [`ThrottleConfig::interval`] has passed since the last emit;
//! 3. the percent moved by at least [`ThrottleConfig::min_delta`] points;
//! 4. a percent is available now and the last emitted update had none.
//!
//! Status frames never go through the throttle. When the percent cannot be
//! extracted the frame is let through: dropping updates is the only thing
//! the throttle may do wrong.

use std::collections::HashMap;
use std::time::Duration;

use pullsync_core::progress::PercentExtractor;
use pullsync_core::TaskId;
use serde_json::Value;
use tokio::time::Instant;

/// Default maximum staleness of a task's observable progress.
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(400);

/// Default percent-point change that bypasses the interval.
pub const DEFAULT_MIN_DELTA: f64 = 2.0;

#[derive(Debug, Clone, PartialEq)]
pub struct ThrottleConfig {
    pub interval: Duration,
    pub min_delta: f64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            min_delta: DEFAULT_MIN_DELTA,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct LastEmit {
    at: Instant,
    percent: Option<f64>,
}

/// Throttle state for every task with an open channel.
#[derive(Debug)]
pub struct ThrottlePolicy {
    config: ThrottleConfig,
    extractor: PercentExtractor,
    last: HashMap<TaskId, LastEmit>,
}

impl Default for ThrottlePolicy {
    fn default() -> Self {
        Self::new(ThrottleConfig::default(), PercentExtractor::default())
    }
}

impl ThrottlePolicy {
    pub fn new(config: ThrottleConfig, extractor: PercentExtractor) -> Self {
        Self {
            config,
            extractor,
            last: HashMap::new(),
        }
    }

    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    /// Decide whether `progress` for `task_id` should reach observable
    /// state now. Records the emit when it returns `true`.
    pub fn should_emit(&mut self, task_id: &str, progress: &Value) -> bool {
        self.should_emit_at(task_id, progress, Instant::now())
    }

    /// [`ThrottlePolicy::should_emit`] with an explicit clock reading.
    pub fn should_emit_at(&mut self, task_id: &str, progress: &Value, now: Instant) -> bool {
        let percent = match self.extractor.extract(progress) {
            Ok(percent) => percent,
            Err(e) => {
                tracing::debug!(task_id, error = %e, "Percent extraction failed, emitting anyway");
                self.record(task_id, now, None);
                return true;
            }
        };

        let emit = match self.last.get(task_id) {
            None => true,
            Some(last) => {
                now.saturating_duration_since(last.at) >= self.config.interval
                    || matches!(
                        (percent, last.percent),
                        (Some(p), Some(q)) if (p - q).abs() >= self.config.min_delta
                    )
                    || (percent.is_some() && last.percent.is_none())
            }
        };

        if emit {
            self.record(task_id, now, percent);
        }
        emit
    }

    /// Drop the state for a task whose channel is gone.
    pub fn forget(&mut self, task_id: &str) {
        self.last.remove(task_id);
    }

    /// Number of tasks with throttle state.
    pub fn tracked(&self) -> usize {
        self.last.len()
    }

    fn record(&mut self, task_id: &str, at: Instant, percent: Option<f64>) {
        self.last.insert(task_id.to_string(), LastEmit { at, percent });
    }
}
