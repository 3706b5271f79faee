//! Metric definitions, the registry and the [`Sample`] value type.
//!
//! A [`Sample`] is the smallest unit the pipeline moves: one timestamped
//! measurement of one [`Metric`], labelled with a [`TagSet`]. Samples are
//! produced by VUs and by instrumentation code, and folded into aggregates by
//! the [`MetricsEngine`](crate::engine::MetricsEngine).

use std::{collections::BTreeMap, fmt, sync::Arc, time::SystemTime};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::{error::ConfigError, tags::TagSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Cumulative sum.
    Counter,
    /// Last observed value.
    Gauge,
    /// Ratio of non-zero samples.
    Rate,
    /// Distribution of observed values.
    Trend,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::Rate => "rate",
            Self::Trend => "trend",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    #[default]
    Default,
    /// Milliseconds.
    Time,
    /// Bytes.
    Data,
}

#[derive(Debug, PartialEq, Eq)]
pub struct Metric {
    pub name: String,
    pub kind: MetricKind,
    pub contains: ValueType,
}

const MAX_METRIC_NAME_LEN: usize = 128;

fn validate_name(name: &str) -> Result<(), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidMetric {
        name: name.to_string(),
        reason: reason.to_string(),
    };
    let mut chars = name.chars();
    match chars.next() {
        None => return Err(invalid("name is empty")),
        Some(c) if !(c.is_ascii_alphabetic() || c == '_') => {
            return Err(invalid("name must start with a letter or underscore"));
        }
        _ => {}
    }
    if name.len() > MAX_METRIC_NAME_LEN {
        return Err(invalid("name is longer than 128 characters"));
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(invalid("name may only contain letters, digits and underscores"));
    }
    Ok(())
}

/// All metrics known to a run. Thresholds are validated against it before the
/// run starts, so custom metrics must be registered up front.
#[derive(Debug, Default)]
pub struct Registry {
    metrics: RwLock<BTreeMap<String, Arc<Metric>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a metric, or returns the existing one when the definition is
    /// identical.
    pub fn new_metric(
        &self,
        name: &str,
        kind: MetricKind,
        contains: ValueType,
    ) -> Result<Arc<Metric>, ConfigError> {
        validate_name(name)?;
        let mut metrics = self.metrics.write();
        if let Some(existing) = metrics.get(name) {
            if existing.kind != kind || existing.contains != contains {
                return Err(ConfigError::InvalidMetric {
                    name: name.to_string(),
                    reason: format!(
                        "already registered as a {} with {:?} values",
                        existing.kind, existing.contains
                    ),
                });
            }
            return Ok(Arc::clone(existing));
        }
        let metric = Arc::new(Metric {
            name: name.to_string(),
            kind,
            contains,
        });
        metrics.insert(name.to_string(), Arc::clone(&metric));
        Ok(metric)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Metric>> {
        self.metrics.read().get(name).cloned()
    }

    pub fn all(&self) -> Vec<Arc<Metric>> {
        self.metrics.read().values().cloned().collect()
    }
}

/// Handles to the metrics every run emits.
#[derive(Debug, Clone)]
pub struct BuiltinMetrics {
    pub vus: Arc<Metric>,
    pub vus_max: Arc<Metric>,
    pub iterations: Arc<Metric>,
    pub iteration_duration: Arc<Metric>,
    pub dropped_iterations: Arc<Metric>,
    pub data_sent: Arc<Metric>,
    pub data_received: Arc<Metric>,
    pub http_reqs: Arc<Metric>,
    pub http_req_duration: Arc<Metric>,
    pub http_req_failed: Arc<Metric>,
    pub checks: Arc<Metric>,
}

impl BuiltinMetrics {
    pub fn register(registry: &Registry) -> Result<Self, ConfigError> {
        use MetricKind::*;
        Ok(Self {
            vus: registry.new_metric("vus", Gauge, ValueType::Default)?,
            vus_max: registry.new_metric("vus_max", Gauge, ValueType::Default)?,
            iterations: registry.new_metric("iterations", Counter, ValueType::Default)?,
            iteration_duration: registry.new_metric("iteration_duration", Trend, ValueType::Time)?,
            dropped_iterations: registry.new_metric("dropped_iterations", Counter, ValueType::Default)?,
            data_sent: registry.new_metric("data_sent", Counter, ValueType::Data)?,
            data_received: registry.new_metric("data_received", Counter, ValueType::Data)?,
            http_reqs: registry.new_metric("http_reqs", Counter, ValueType::Default)?,
            http_req_duration: registry.new_metric("http_req_duration", Trend, ValueType::Time)?,
            http_req_failed: registry.new_metric("http_req_failed", Rate, ValueType::Default)?,
            checks: registry.new_metric("checks", Rate, ValueType::Default)?,
        })
    }
}

/// One measurement. Immutable once created.
#[derive(Debug, Clone, Serialize)]
pub struct Sample {
    #[serde(serialize_with = "serialize_metric_name")]
    pub metric: Arc<Metric>,
    pub value: f64,
    pub tags: TagSet,
    pub time: SystemTime,
}

impl Sample {
    pub fn new(metric: &Arc<Metric>, value: f64, tags: TagSet) -> Self {
        Self {
            metric: Arc::clone(metric),
            value,
            tags,
            time: SystemTime::now(),
        }
    }

    pub fn name(&self) -> &str {
        &self.metric.name
    }
}

fn serialize_metric_name<S: serde::Serializer>(
    metric: &Arc<Metric>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&metric.name)
}
