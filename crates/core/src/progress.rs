//! Tolerant percent extraction from provider progress payloads.
//!
//! Producers report progress in different shapes: an explicit percent
//! (`{"percent": 42}`), a fraction (`{"progress": 0.42}`), or a pair of
//! byte counters (`{"completed": 420, "total": 1000}`). A
//! [`PercentExtractor`] tries an ordered list of [`PercentStrategy`]s and
//! returns the first percent it can resolve. The recognised field names are
//! a compatibility surface with the remote service, so they are data rather
//! than code: see [`PercentExtractor::from_specs`].

use serde_json::Value;

use crate::error::CoreError;

/// Field names tried first, in order.
pub const DEFAULT_PERCENT_FIELDS: &[&str] = &["percent", "progress", "percentage", "pct"];

/// Counter pairs tried after the percent fields, as `(done, total)`.
pub const DEFAULT_RATIO_FIELDS: &[(&str, &str)] = &[
    ("completed", "total"),
    ("downloaded", "total"),
    ("downloadedBytes", "totalBytes"),
    ("bytes_downloaded", "bytes_total"),
    ("current", "total"),
    ("value", "max"),
];

/// Nested payloads are followed at most this deep.
const MAX_DEPTH: usize = 4;

/// One way of turning a payload into a percent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PercentStrategy {
    /// A single numeric (or numeric string) field holding a percent or a
    /// fraction.
    Field(String),
    /// A `done / total` pair of counters.
    Ratio { done: String, total: String },
}

impl PercentStrategy {
    /// Parse `"field"` or `"done/total"`.
    pub fn parse(spec: &str) -> Result<Self, CoreError> {
        let spec = spec.trim();
        match spec.split_once('/') {
            Some((done, total)) => {
                let (done, total) = (done.trim(), total.trim());
                if done.is_empty() || total.is_empty() || total.contains('/') {
                    return Err(CoreError::Validation(format!(
                        "Invalid ratio strategy '{spec}', expected 'done/total'"
                    )));
                }
                Ok(PercentStrategy::Ratio {
                    done: done.to_string(),
                    total: total.to_string(),
                })
            }
            None if spec.is_empty() => Err(CoreError::Validation(
                "Percent strategy must not be empty".to_string(),
            )),
            None => Ok(PercentStrategy::Field(spec.to_string())),
        }
    }
}

/// Ordered list of extraction strategies. First match wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PercentExtractor {
    strategies: Vec<PercentStrategy>,
}

impl Default for PercentExtractor {
    fn default() -> Self {
        let fields = DEFAULT_PERCENT_FIELDS
            .iter()
            .map(|f| PercentStrategy::Field((*f).to_string()));
        let ratios = DEFAULT_RATIO_FIELDS
            .iter()
            .map(|(done, total)| PercentStrategy::Ratio {
                done: (*done).to_string(),
                total: (*total).to_string(),
            });
        Self::new(fields.chain(ratios).collect())
    }
}

impl PercentExtractor {
    pub fn new(strategies: Vec<PercentStrategy>) -> Self {
        Self { strategies }
    }

    /// Build from textual specs such as `["percent", "completed/total"]`.
    pub fn from_specs<I, S>(specs: I) -> Result<Self, CoreError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let strategies = specs
            .into_iter()
            .map(|s| PercentStrategy::parse(s.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(strategies))
    }

    pub fn strategies(&self) -> &[PercentStrategy] {
        &self.strategies
    }

    /// Resolve `payload` to a percent in `[0, 100]`.
    ///
    /// Returns `Ok(None)` when no strategy applies. A bare number or
    /// numeric string is taken as the percent itself. Values in `[0, 1]`
    /// are fractions and rescaled. A field that is present but holds an
    /// unparseable string is an error.
    pub fn extract(&self, payload: &Value) -> Result<Option<f64>, CoreError> {
        self.extract_at(payload, 0)
    }

    fn extract_at(&self, payload: &Value, depth: usize) -> Result<Option<f64>, CoreError> {
        match payload {
            // A bare string that is not a number is a phase label, not progress.
            Value::Number(_) | Value::String(_) => match number_of("<payload>", payload) {
                Ok(Some(raw)) => normalize(raw).map(Some),
                Ok(None) | Err(_) => Ok(None),
            },
            Value::Object(map) => {
                for strategy in &self.strategies {
                    match strategy {
                        PercentStrategy::Field(name) => match map.get(name) {
                            Some(nested @ Value::Object(_)) if depth < MAX_DEPTH => {
                                if let Some(percent) = self.extract_at(nested, depth + 1)? {
                                    return Ok(Some(percent));
                                }
                            }
                            Some(value) => {
                                if let Some(raw) = number_of(name, value)? {
                                    return normalize(raw).map(Some);
                                }
                            }
                            None => {}
                        },
                        PercentStrategy::Ratio { done, total } => {
                            let (Some(done_value), Some(total_value)) = (map.get(done), map.get(total))
                            else {
                                continue;
                            };
                            let (Some(done_raw), Some(total_raw)) =
                                (number_of(done, done_value)?, number_of(total, total_value)?)
                            else {
                                continue;
                            };
                            if total_raw > 0.0 {
                                return Ok(Some(clamp(done_raw / total_raw * 100.0)));
                            }
                        }
                    }
                }
                Ok(None)
            }
            _ => Ok(None),
        }
    }
}

/// Read a number from a JSON value. `null`, booleans, arrays and objects
/// are "absent"; strings must parse (a trailing `%` is allowed).
fn number_of(field: &str, value: &Value) -> Result<Option<f64>, CoreError> {
    match value {
        Value::Number(n) => Ok(n.as_f64()),
        Value::String(s) => {
            let trimmed = s.trim().trim_end_matches('%').trim();
            trimmed
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .map(Some)
                .ok_or_else(|| CoreError::Progress {
                    field: field.to_string(),
                    value: s.clone(),
                })
        }
        _ => Ok(None),
    }
}

/// Fractions in `[0, 1]` become percents; everything is clamped to `[0, 100]`.
fn normalize(raw: f64) -> Result<f64, CoreError> {
    if !raw.is_finite() {
        return Err(CoreError::Progress {
            field: "<number>".to_string(),
            value: raw.to_string(),
        });
    }
    if (0.0..=1.0).contains(&raw) {
        Ok(raw * 100.0)
    } else {
        Ok(clamp(raw))
    }
}

fn clamp(percent: f64) -> f64 {
    percent.clamp(0.0, 100.0)
}
