use std::{collections::BTreeMap, time::Duration};

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{
    config::duration,
    error::ConfigError,
    executor::{Executor, ExecutorConfig},
    segment::ExecutionSegment,
};

fn thirty_seconds() -> Duration {
    Duration::from_secs(30)
}

fn yes() -> bool {
    true
}

/// A named unit of load: one executor plus the options every executor shares.
///
/// ```rust, ignore
/// let scenario = Scenario::builder()
///     .name("api")
///     .executor(ExecutorConfig::ConstantVus(ConstantVus { vus: 10, duration: Duration::from_secs(30) }))
///     .build();
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
pub struct Scenario {
    /// Filled in from the scenario map key.
    #[serde(skip)]
    #[builder(setter(into))]
    pub name: String,
    #[serde(flatten)]
    pub executor: ExecutorConfig,
    /// Active time to wait after the run starts.
    #[serde(with = "duration", default)]
    #[builder(default)]
    pub start_time: Duration,
    /// Time in-flight iterations get once the schedule is over.
    #[serde(with = "duration", default = "thirty_seconds")]
    #[builder(default = thirty_seconds())]
    pub graceful_stop: Duration,
    #[serde(default)]
    #[builder(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default = "yes")]
    #[builder(default = true)]
    pub pausable: bool,
}

impl Scenario {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::scenario("<unnamed>", "scenario name must not be empty"));
        }
        if self.tags.contains_key("scenario") {
            return Err(ConfigError::scenario(
                &self.name,
                "the `scenario` tag is reserved",
            ));
        }
        self.executor
            .validate()
            .map_err(|reason| ConfigError::scenario(&self.name, reason))
    }

    /// Wall-clock budget of the scenario when it is never paused.
    pub fn total_duration(&self) -> Duration {
        self.start_time + self.executor.max_duration() + self.graceful_stop
    }

    pub fn max_vus(&self, segment: &ExecutionSegment) -> u64 {
        self.executor.max_vus(segment)
    }

    pub fn is_pausable(&self) -> bool {
        self.pausable && self.executor.is_pausable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ConstantVus;

    fn constant(vus: u64) -> Scenario {
        Scenario::builder()
            .name("steady")
            .executor(ExecutorConfig::ConstantVus(ConstantVus {
                vus,
                duration: Duration::from_secs(10),
            }))
            .build()
    }

    #[test]
    fn builder_defaults_match_serde_defaults() {
        let built = constant(2);
        let parsed: Scenario =
            serde_json::from_str(r#"{"executor": "constant-vus", "vus": 2, "duration": "10s"}"#)
                .unwrap();
        assert_eq!(Scenario { name: "steady".into(), ..parsed }, built);
        assert_eq!(built.total_duration(), Duration::from_secs(40));
    }

    #[test]
    fn executor_errors_name_the_scenario() {
        let err = constant(0).validate().unwrap_err();
        assert!(err.to_string().contains("steady"), "{err}");
    }

    #[test]
    fn scenario_tag_is_reserved() {
        let mut s = constant(1);
        s.tags.insert("scenario".into(), "other".into());
        assert!(s.validate().is_err());
    }
}
