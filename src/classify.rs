//! Response classification for network instrumentation.
//!
//! Instrumentation code (an HTTP client wrapper, for instance) reports each
//! exchange through [`emit_http_response`]. Whether the outcome is tagged as
//! expected or failed is decided by an optional [`ResponseClassifier`]: without
//! one, no `expected_response` tag is attached and no `http_req_failed` sample
//! is produced.

use std::{ops::RangeInclusive, sync::Arc, time::Duration};

use crate::{
    error::ConfigError,
    metric::{BuiltinMetrics, Sample},
    tags::TagSet,
};

pub trait ResponseClassifier: Send + Sync {
    fn is_expected(&self, status: u16) -> bool;
}

impl<F> ResponseClassifier for F
where
    F: Fn(u16) -> bool + Send + Sync,
{
    fn is_expected(&self, status: u16) -> bool {
        self(status)
    }
}

/// Set of status codes considered successful.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedStatuses {
    exact: Vec<u16>,
    ranges: Vec<RangeInclusive<u16>>,
}

impl ExpectedStatuses {
    pub fn new(
        exact: impl IntoIterator<Item = u16>,
        ranges: impl IntoIterator<Item = (u16, u16)>,
    ) -> Result<Self, ConfigError> {
        let exact: Vec<u16> = exact.into_iter().collect();
        let mut parsed = Vec::new();
        for (i, (min, max)) in ranges.into_iter().enumerate() {
            if min > max {
                return Err(ConfigError::InvalidStatuses(format!(
                    "range number {} has min {min} greater than max {max}",
                    i + 1
                )));
            }
            parsed.push(min..=max);
        }
        if exact.is_empty() && parsed.is_empty() {
            return Err(ConfigError::InvalidStatuses("no statuses given".into()));
        }
        Ok(Self {
            exact,
            ranges: parsed,
        })
    }

    pub fn matches(&self, status: u16) -> bool {
        self.exact.contains(&status) || self.ranges.iter().any(|r| r.contains(&status))
    }
}

impl Default for ExpectedStatuses {
    fn default() -> Self {
        Self {
            exact: Vec::new(),
            ranges: vec![200..=399],
        }
    }
}

impl ResponseClassifier for ExpectedStatuses {
    fn is_expected(&self, status: u16) -> bool {
        self.matches(status)
    }
}

/// Outcome of one HTTP exchange, as measured by the client.
#[derive(Debug, Clone)]
pub struct HttpExchange {
    pub status: u16,
    pub duration: Duration,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Builds the samples for one exchange.
///
/// `status` is always added to the tags; `expected_response` only when a
/// classifier is supplied.
pub fn emit_http_response(
    builtins: &BuiltinMetrics,
    tags: &TagSet,
    exchange: &HttpExchange,
    classifier: Option<&Arc<dyn ResponseClassifier>>,
) -> Vec<Sample> {
    let mut tags = tags.with("status", exchange.status.to_string());
    let failed = match classifier {
        Some(c) => {
            let expected = c.is_expected(exchange.status);
            tags = tags.with("expected_response", expected.to_string());
            Some(!expected)
        }
        None => None,
    };

    let mut samples = vec![
        Sample::new(&builtins.http_reqs, 1.0, tags.clone()),
        Sample::new(
            &builtins.http_req_duration,
            exchange.duration.as_secs_f64() * 1000.0,
            tags.clone(),
        ),
    ];
    if exchange.bytes_sent > 0 {
        samples.push(Sample::new(
            &builtins.data_sent,
            exchange.bytes_sent as f64,
            tags.clone(),
        ));
    }
    if exchange.bytes_received > 0 {
        samples.push(Sample::new(
            &builtins.data_received,
            exchange.bytes_received as f64,
            tags.clone(),
        ));
    }
    if let Some(failed) = failed {
        samples.push(Sample::new(
            &builtins.http_req_failed,
            if failed { 1.0 } else { 0.0 },
            tags,
        ));
    }
    samples
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::Registry;

    fn exchange(status: u16) -> HttpExchange {
        HttpExchange {
            status,
            duration: Duration::from_millis(12),
            bytes_sent: 0,
            bytes_received: 512,
        }
    }

    #[test]
    fn default_statuses_accept_2xx_and_3xx() {
        let statuses = ExpectedStatuses::default();
        assert!(statuses.matches(200));
        assert!(statuses.matches(399));
        assert!(!statuses.matches(199));
        assert!(!statuses.matches(404));
    }

    #[test]
    fn exact_and_ranges_are_combined() {
        let statuses = ExpectedStatuses::new([404], [(200, 204)]).unwrap();
        assert!(statuses.matches(404));
        assert!(statuses.matches(201));
        assert!(!statuses.matches(301));
    }

    #[test]
    fn inverted_range_is_rejected() {
        assert!(ExpectedStatuses::new([], [(300, 200)]).is_err());
        assert!(ExpectedStatuses::new([], []).is_err());
    }

    #[test]
    fn no_classifier_means_no_failure_tagging() {
        let builtins = BuiltinMetrics::register(&Registry::new()).unwrap();
        let samples = emit_http_response(&builtins, &TagSet::new(), &exchange(500), None);

        assert!(samples.iter().all(|s| s.name() != "http_req_failed"));
        assert!(samples.iter().all(|s| s.tags.get("expected_response").is_none()));
        assert_eq!(samples.len(), 3);
    }

    #[test]
    fn classifier_tags_and_emits_failure_rate() {
        let builtins = BuiltinMetrics::register(&Registry::new()).unwrap();
        let classifier: Arc<dyn ResponseClassifier> = Arc::new(ExpectedStatuses::default());
        let samples =
            emit_http_response(&builtins, &TagSet::new(), &exchange(503), Some(&classifier));

        let failed = samples
            .iter()
            .find(|s| s.name() == "http_req_failed")
            .unwrap();
        assert_eq!(failed.value, 1.0);
        assert_eq!(failed.tags.get("expected_response"), Some("false"));
        assert_eq!(failed.tags.get("status"), Some("503"));
    }

    #[test]
    fn closures_can_classify() {
        let builtins = BuiltinMetrics::register(&Registry::new()).unwrap();
        let classifier: Arc<dyn ResponseClassifier> = Arc::new(|status: u16| status == 418);
        let samples =
            emit_http_response(&builtins, &TagSet::new(), &exchange(418), Some(&classifier));
        let failed = samples
            .iter()
            .find(|s| s.name() == "http_req_failed")
            .unwrap();
        assert_eq!(failed.value, 0.0);
    }
}
