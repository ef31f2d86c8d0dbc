use std::path::PathBuf;
use std::time::Duration;

use pullsync_cache::CacheKeys;
use pullsync_core::progress::{PercentExtractor, DEFAULT_PERCENT_FIELDS, DEFAULT_RATIO_FIELDS};
use pullsync_core::CoreError;

use crate::throttle::{ThrottleConfig, ThrottlePolicy};

/// Errors raised while reading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} must be {expected}, got '{value}'")]
    Invalid {
        var: &'static str,
        expected: &'static str,
        value: String,
    },

    #[error("{var} contains an invalid field spec: {source}")]
    FieldSpec {
        var: &'static str,
        #[source]
        source: CoreError,
    },
}

/// Engine configuration loaded from environment variables.
///
/// All fields have defaults suitable for a local job service.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Base URL of the remote job service.
    pub service_url: String,
    /// Delay between reconciliation passes (default: 5s).
    pub reconcile_interval: Duration,
    /// Progress throttle tuning.
    pub throttle: ThrottleConfig,
    /// Directory backing the file store.
    pub cache_dir: PathBuf,
    /// Prefix of the two storage keys.
    pub cache_namespace: String,
    /// Ordered percent-extraction strategies.
    pub percent: PercentExtractor,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            service_url: "http://localhost:11434".into(),
            reconcile_interval: Duration::from_millis(5000),
            throttle: ThrottleConfig::default(),
            cache_dir: PathBuf::from(".pullsync"),
            cache_namespace: pullsync_cache::cache::DEFAULT_NAMESPACE.into(),
            percent: PercentExtractor::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                          | Default                            |
    /// |----------------------------------|------------------------------------|
    /// | `PULLSYNC_SERVICE_URL`           | `http://localhost:11434`           |
    /// | `PULLSYNC_RECONCILE_INTERVAL_MS` | `5000`                             |
    /// | `PULLSYNC_THROTTLE_INTERVAL_MS`  | `400`                              |
    /// | `PULLSYNC_THROTTLE_MIN_DELTA`    | `2.0`                              |
    /// | `PULLSYNC_CACHE_DIR`             | `.pullsync`                        |
    /// | `PULLSYNC_CACHE_NAMESPACE`       | `pullsync`                         |
    /// | `PULLSYNC_PERCENT_FIELDS`        | `percent,progress,percentage,pct`  |
    /// | `PULLSYNC_RATIO_FIELDS`          | `completed/total,...,value/max`    |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`EngineConfig::from_env`] with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let service_url = lookup("PULLSYNC_SERVICE_URL").unwrap_or(defaults.service_url);

        let reconcile_interval = match lookup("PULLSYNC_RECONCILE_INTERVAL_MS") {
            Some(raw) => positive_millis("PULLSYNC_RECONCILE_INTERVAL_MS", &raw)?,
            None => defaults.reconcile_interval,
        };

        let interval = match lookup("PULLSYNC_THROTTLE_INTERVAL_MS") {
            Some(raw) => positive_millis("PULLSYNC_THROTTLE_INTERVAL_MS", &raw)?,
            None => defaults.throttle.interval,
        };

        let min_delta = match lookup("PULLSYNC_THROTTLE_MIN_DELTA") {
            Some(raw) => raw
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|d| d.is_finite() && *d >= 0.0)
                .ok_or(ConfigError::Invalid {
                    var: "PULLSYNC_THROTTLE_MIN_DELTA",
                    expected: "a non-negative number",
                    value: raw,
                })?,
            None => defaults.throttle.min_delta,
        };

        let cache_dir = lookup("PULLSYNC_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.cache_dir);

        let cache_namespace = match lookup("PULLSYNC_CACHE_NAMESPACE") {
            Some(ns) if ns.trim().is_empty() => {
                return Err(ConfigError::Invalid {
                    var: "PULLSYNC_CACHE_NAMESPACE",
                    expected: "a non-empty string",
                    value: ns,
                })
            }
            Some(ns) => ns.trim().to_string(),
            None => defaults.cache_namespace,
        };

        let percent_fields = lookup("PULLSYNC_PERCENT_FIELDS")
            .map(|raw| split_list(&raw))
            .unwrap_or_else(|| DEFAULT_PERCENT_FIELDS.iter().map(|f| f.to_string()).collect());
        let ratio_fields = lookup("PULLSYNC_RATIO_FIELDS")
            .map(|raw| split_list(&raw))
            .unwrap_or_else(|| {
                DEFAULT_RATIO_FIELDS
                    .iter()
                    .map(|(done, total)| format!("{done}/{total}"))
                    .collect()
            });

        for spec in &ratio_fields {
            if !spec.contains('/') {
                return Err(ConfigError::Invalid {
                    var: "PULLSYNC_RATIO_FIELDS",
                    expected: "a list of done/total pairs",
                    value: spec.clone(),
                });
            }
        }

        let percent = PercentExtractor::from_specs(percent_fields.iter().chain(&ratio_fields))
            .map_err(|source| ConfigError::FieldSpec {
                var: "PULLSYNC_PERCENT_FIELDS/PULLSYNC_RATIO_FIELDS",
                source,
            })?;

        Ok(Self {
            service_url,
            reconcile_interval,
            throttle: ThrottleConfig {
                interval,
                min_delta,
            },
            cache_dir,
            cache_namespace,
            percent,
        })
    }

    /// A fresh throttle using this configuration.
    pub fn throttle_policy(&self) -> ThrottlePolicy {
        ThrottlePolicy::new(self.throttle.clone(), self.percent.clone())
    }

    pub fn cache_keys(&self) -> CacheKeys {
        CacheKeys::new(&self.cache_namespace)
    }
}

fn positive_millis(var: &'static str, raw: &str) -> Result<Duration, ConfigError> {
    raw.trim()
        .parse::<u64>()
        .ok()
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
        .ok_or_else(|| ConfigError::Invalid {
            var,
            expected: "a positive integer of milliseconds",
            value: raw.to_string(),
        })
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
