//! Test options, in the shape of a k6 options object.
//!
//! ```json
//! {
//!   "scenarios": {
//!     "api": { "executor": "ramping-vus", "stages": [{ "duration": "10s", "target": 10 }] }
//!   },
//!   "thresholds": { "http_req_failed": [{ "threshold": "rate<0.01", "abortOnFail": true }] }
//! }
//! ```

use std::{collections::BTreeMap, path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{
    error::ConfigError,
    pipeline,
    scenario::Scenario,
    segment::{ExecutionSegment, ExecutionSegmentSequence},
    threshold::ThresholdSpec,
};

pub const DEFAULT_VU_ALLOCATION_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[serde(rename_all = "camelCase", default)]
pub struct Limits {
    #[serde(rename = "maxVUs")]
    #[builder(default, setter(strip_option))]
    pub max_vus: Option<u64>,
    #[serde(with = "duration::option")]
    #[builder(default, setter(strip_option))]
    pub max_duration: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[serde(rename_all = "camelCase", default)]
pub struct MetricsOptions {
    /// Sample pipeline capacity, in batches.
    #[builder(default = pipeline::DEFAULT_CAPACITY)]
    pub pipeline_capacity: usize,
    /// Maximum number of batches folded per engine lock.
    #[builder(default = 512)]
    pub batch_size: usize,
    #[serde(with = "duration")]
    #[builder(default = Duration::from_secs(2))]
    pub threshold_eval_period: Duration,
    #[serde(with = "duration")]
    #[builder(default = Duration::from_secs(1))]
    pub vus_sample_period: Duration,
}

impl Default for MetricsOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[serde(rename_all = "camelCase", default)]
pub struct TestOptions {
    #[builder(default)]
    pub scenarios: BTreeMap<String, Scenario>,
    #[builder(default)]
    pub thresholds: BTreeMap<String, ThresholdSpec>,
    /// Skip threshold parsing and evaluation entirely.
    #[builder(default)]
    pub no_thresholds: bool,
    #[builder(default, setter(strip_option))]
    pub execution_segment: Option<ExecutionSegment>,
    #[builder(default, setter(strip_option))]
    pub execution_segment_sequence: Option<ExecutionSegmentSequence>,
    #[builder(default)]
    pub limits: Limits,
    #[serde(with = "duration")]
    #[builder(default = DEFAULT_VU_ALLOCATION_TIMEOUT)]
    pub vu_allocation_timeout: Duration,
    /// Tags added to every sample of the run.
    #[builder(default)]
    pub tags: BTreeMap<String, String>,
    #[builder(default)]
    pub metrics: MetricsOptions,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl TestOptions {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    /// Adds a scenario under its own name.
    pub fn with_scenario(mut self, scenario: Scenario) -> Self {
        self.scenarios.insert(scenario.name.clone(), scenario);
        self
    }

    /// Scenarios with their map key copied into [`Scenario::name`].
    pub fn named_scenarios(&self) -> Vec<Scenario> {
        self.scenarios
            .iter()
            .map(|(name, scenario)| Scenario {
                name: name.clone(),
                ..scenario.clone()
            })
            .collect()
    }

    pub fn segment(&self) -> ExecutionSegment {
        self.execution_segment.clone().unwrap_or_default()
    }
}

/// Serde adapters for durations written as `"1m30s"` or as a number of
/// seconds.
pub mod duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Secs(f64),
    }

    fn convert<E: Error>(raw: Raw) -> Result<Duration, E> {
        match raw {
            Raw::Text(s) => humantime::parse_duration(s.trim()).map_err(E::custom),
            Raw::Secs(secs) if secs.is_finite() && secs >= 0.0 => Ok(Duration::from_secs_f64(secs)),
            Raw::Secs(secs) => Err(E::custom(format!("invalid duration {secs}"))),
        }
    }

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        convert(Raw::deserialize(deserializer)?)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(
            d: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match d {
                Some(d) => super::serialize(d, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            Option::<Raw>::deserialize(deserializer)?
                .map(convert)
                .transpose()
        }
    }
}
