use std::{collections::BTreeMap, time::Duration};

use serde::Serialize;

use crate::{metric::MetricKind, threshold::AggregationMethod};

/// The `Aggregate` trait defines how raw sample values are folded into an
/// intermediate, mergeable representation.
///
/// **Important:** aggregates store raw material (counts, sums, observed values),
/// not final statistics. Derived values such as averages and percentiles are
/// computed on demand by [`Aggregate::stat`], so a single aggregate can answer
/// any threshold expression and any summary format.
///
/// # Role
///
/// - Consume the value of every [`Sample`](crate::metric::Sample) addressed to one
///   metric (or one submetric).
/// - Be cheaply mergeable, so partial aggregates built by different consumers can
///   be combined into a global view.
///
/// # Implementor notes
/// - `merge` must be **associative** and **commutative**.
/// - `stat` returns `None` for methods the aggregate does not support or when
///   there is no data to derive the statistic from.
pub trait Aggregate
where
    Self: Send + Sync + std::fmt::Debug + Clone,
{
    fn new() -> Self;

    /// Fold many values into the aggregate.
    ///
    /// This default implementation calls [`consume`](Aggregate::consume) for each value.
    fn aggregate(&mut self, values: &[f64]) {
        values.iter().for_each(|v| self.consume(*v));
    }

    /// Incorporate a single value.
    fn consume(&mut self, value: f64);

    /// Combine two aggregates into one.
    fn merge(&mut self, other: Self);

    /// Derive one statistic. `elapsed` is the active run time, used by
    /// per-second rates.
    fn stat(&mut self, method: &AggregationMethod, elapsed: Duration) -> Option<f64>;

    /// The statistics shown in the end-of-test summary.
    fn summary(&mut self, elapsed: Duration) -> BTreeMap<String, f64>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CounterSink {
    pub sum: f64,
    pub seen: bool,
}

impl Aggregate for CounterSink {
    fn new() -> Self {
        Self::default()
    }

    fn consume(&mut self, value: f64) {
        self.sum += value;
        self.seen = true;
    }

    fn merge(&mut self, other: Self) {
        self.sum += other.sum;
        self.seen |= other.seen;
    }

    fn stat(&mut self, method: &AggregationMethod, elapsed: Duration) -> Option<f64> {
        match method {
            AggregationMethod::Count => Some(self.sum),
            AggregationMethod::Rate => {
                let secs = elapsed.as_secs_f64();
                Some(if secs > 0.0 { self.sum / secs } else { 0.0 })
            }
            _ => None,
        }
    }

    fn summary(&mut self, elapsed: Duration) -> BTreeMap<String, f64> {
        let mut out = BTreeMap::new();
        out.insert("count".into(), self.sum);
        if let Some(rate) = self.stat(&AggregationMethod::Rate, elapsed) {
            out.insert("rate".into(), rate);
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GaugeSink {
    pub value: f64,
    pub min: f64,
    pub max: f64,
    pub seen: bool,
}

impl Aggregate for GaugeSink {
    fn new() -> Self {
        Self {
            value: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            seen: false,
        }
    }

    fn consume(&mut self, value: f64) {
        self.value = value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.seen = true;
    }

    // there is no global "last" across sinks, keep the other value when we have none
    fn merge(&mut self, other: Self) {
        if !other.seen {
            return;
        }
        if !self.seen {
            self.value = other.value;
        }
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.seen = true;
    }

    fn stat(&mut self, method: &AggregationMethod, _: Duration) -> Option<f64> {
        if !self.seen {
            return match method {
                AggregationMethod::Value => Some(0.0),
                _ => None,
            };
        }
        match method {
            AggregationMethod::Value => Some(self.value),
            AggregationMethod::Min => Some(self.min),
            AggregationMethod::Max => Some(self.max),
            _ => None,
        }
    }

    fn summary(&mut self, elapsed: Duration) -> BTreeMap<String, f64> {
        [
            ("value", AggregationMethod::Value),
            ("min", AggregationMethod::Min),
            ("max", AggregationMethod::Max),
        ]
        .into_iter()
        .filter_map(|(k, m)| self.stat(&m, elapsed).map(|v| (k.to_string(), v)))
        .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateSink {
    pub trues: u64,
    pub total: u64,
}

impl Aggregate for RateSink {
    fn new() -> Self {
        Self::default()
    }

    fn consume(&mut self, value: f64) {
        self.total += 1;
        if value != 0.0 {
            self.trues += 1;
        }
    }

    fn merge(&mut self, other: Self) {
        self.trues += other.trues;
        self.total += other.total;
    }

    fn stat(&mut self, method: &AggregationMethod, _: Duration) -> Option<f64> {
        match method {
            AggregationMethod::Rate if self.total == 0 => Some(0.0),
            AggregationMethod::Rate => Some(self.trues as f64 / self.total as f64),
            _ => None,
        }
    }

    fn summary(&mut self, elapsed: Duration) -> BTreeMap<String, f64> {
        let mut out = BTreeMap::new();
        if let Some(rate) = self.stat(&AggregationMethod::Rate, elapsed) {
            out.insert("rate".into(), rate);
        }
        out.insert("passes".into(), self.trues as f64);
        out.insert("fails".into(), (self.total - self.trues) as f64);
        out
    }
}

/// Keeps every observed value; sorting happens lazily when a percentile is
/// requested.
#[derive(Debug, Clone, PartialEq)]
pub struct TrendSink {
    values: Vec<f64>,
    sorted: bool,
    sum: f64,
    min: f64,
    max: f64,
}

impl TrendSink {
    pub fn count(&self) -> usize {
        self.values.len()
    }

    /// Linear interpolation between closest ranks, `pct` in `[0, 100]`.
    pub fn percentile(&mut self, pct: f64) -> Option<f64> {
        if self.values.is_empty() {
            return None;
        }
        if !self.sorted {
            self.values.sort_by(f64::total_cmp);
            self.sorted = true;
        }
        let last = self.values.len() - 1;
        let rank = (pct.clamp(0.0, 100.0) / 100.0) * last as f64;
        let lower = rank.floor() as usize;
        let upper = rank.ceil() as usize;
        let weight = rank - lower as f64;
        Some(self.values[lower] + (self.values[upper] - self.values[lower]) * weight)
    }
}

impl Aggregate for TrendSink {
    fn new() -> Self {
        Self {
            values: Vec::new(),
            sorted: true,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    fn consume(&mut self, value: f64) {
        self.values.push(value);
        self.sorted = self.values.len() == 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    fn merge(&mut self, other: Self) {
        if other.values.is_empty() {
            return;
        }
        self.values.extend(other.values);
        self.sorted = false;
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    fn stat(&mut self, method: &AggregationMethod, _: Duration) -> Option<f64> {
        if self.values.is_empty() {
            return None;
        }
        match method {
            AggregationMethod::Avg => Some(self.sum / self.values.len() as f64),
            AggregationMethod::Min => Some(self.min),
            AggregationMethod::Max => Some(self.max),
            AggregationMethod::Med => self.percentile(50.0),
            AggregationMethod::Percentile(p) => self.percentile(*p),
            AggregationMethod::Count => Some(self.values.len() as f64),
            _ => None,
        }
    }

    fn summary(&mut self, elapsed: Duration) -> BTreeMap<String, f64> {
        [
            ("avg", AggregationMethod::Avg),
            ("min", AggregationMethod::Min),
            ("med", AggregationMethod::Med),
            ("max", AggregationMethod::Max),
            ("p(90)", AggregationMethod::Percentile(90.0)),
            ("p(95)", AggregationMethod::Percentile(95.0)),
        ]
        .into_iter()
        .filter_map(|(k, m)| self.stat(&m, elapsed).map(|v| (k.to_string(), v)))
        .collect()
    }
}

/// The aggregate for one metric, chosen by its [`MetricKind`].
#[derive(Debug, Clone, PartialEq)]
pub enum Sink {
    Counter(CounterSink),
    Gauge(GaugeSink),
    Rate(RateSink),
    Trend(TrendSink),
}

impl Sink {
    pub fn for_kind(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Counter => Self::Counter(CounterSink::new()),
            MetricKind::Gauge => Self::Gauge(GaugeSink::new()),
            MetricKind::Rate => Self::Rate(RateSink::new()),
            MetricKind::Trend => Self::Trend(TrendSink::new()),
        }
    }

    pub fn consume(&mut self, value: f64) {
        match self {
            Self::Counter(s) => s.consume(value),
            Self::Gauge(s) => s.consume(value),
            Self::Rate(s) => s.consume(value),
            Self::Trend(s) => s.consume(value),
        }
    }

    pub fn stat(&mut self, method: &AggregationMethod, elapsed: Duration) -> Option<f64> {
        match self {
            Self::Counter(s) => s.stat(method, elapsed),
            Self::Gauge(s) => s.stat(method, elapsed),
            Self::Rate(s) => s.stat(method, elapsed),
            Self::Trend(s) => s.stat(method, elapsed),
        }
    }

    pub fn summary(&mut self, elapsed: Duration) -> BTreeMap<String, f64> {
        match self {
            Self::Counter(s) => s.summary(elapsed),
            Self::Gauge(s) => s.summary(elapsed),
            Self::Rate(s) => s.summary(elapsed),
            Self::Trend(s) => s.summary(elapsed),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Counter(s) => !s.seen,
            Self::Gauge(s) => !s.seen,
            Self::Rate(s) => s.total == 0,
            Self::Trend(s) => s.count() == 0,
        }
    }
}

/// Formatted statistics of one metric or submetric.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SinkSnapshot {
    pub kind: MetricKind,
    pub values: BTreeMap<String, f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: Duration = Duration::from_secs(1);

    #[test]
    fn counter_count_and_rate() {
        let mut c = CounterSink::new();
        c.aggregate(&[1.0, 2.0, 3.0]);
        assert_eq!(c.stat(&AggregationMethod::Count, SEC), Some(6.0));
        assert_eq!(
            c.stat(&AggregationMethod::Rate, Duration::from_secs(2)),
            Some(3.0)
        );
        assert_eq!(c.stat(&AggregationMethod::Avg, SEC), None);
    }

    #[test]
    fn gauge_keeps_last_value() {
        let mut g = GaugeSink::new();
        assert_eq!(g.stat(&AggregationMethod::Value, SEC), Some(0.0));
        g.aggregate(&[5.0, 1.0, 3.0]);
        assert_eq!(g.stat(&AggregationMethod::Value, SEC), Some(3.0));
        assert_eq!(g.stat(&AggregationMethod::Min, SEC), Some(1.0));
        assert_eq!(g.stat(&AggregationMethod::Max, SEC), Some(5.0));
    }

    #[test]
    fn rate_counts_non_zero_values() {
        let mut r = RateSink::new();
        assert_eq!(r.stat(&AggregationMethod::Rate, SEC), Some(0.0));
        let values: Vec<f64> = (0..100).map(|i| if i < 2 { 1.0 } else { 0.0 }).collect();
        r.aggregate(&values);
        assert_eq!(r.stat(&AggregationMethod::Rate, SEC), Some(0.02));
    }

    #[test]
    fn trend_percentiles_interpolate() {
        let mut t = TrendSink::new();
        t.aggregate(&[4.0, 1.0, 3.0, 2.0, 5.0]);
        assert_eq!(t.stat(&AggregationMethod::Med, SEC), Some(3.0));
        assert_eq!(t.stat(&AggregationMethod::Avg, SEC), Some(3.0));
        assert_eq!(t.stat(&AggregationMethod::Percentile(0.0), SEC), Some(1.0));
        assert_eq!(t.stat(&AggregationMethod::Percentile(100.0), SEC), Some(5.0));
        assert_eq!(t.stat(&AggregationMethod::Percentile(75.0), SEC), Some(4.0));
        let p90 = t.stat(&AggregationMethod::Percentile(90.0), SEC).unwrap();
        assert!((p90 - 4.6).abs() < 1e-9, "p(90) = {p90}");
    }

    #[test]
    fn empty_trend_has_no_stats() {
        let mut t = TrendSink::new();
        assert_eq!(t.stat(&AggregationMethod::Avg, SEC), None);
        assert!(t.summary(SEC).is_empty());
    }

    #[test]
    fn merge_is_order_independent() {
        let mut a = RateSink::new();
        a.aggregate(&[1.0, 0.0]);
        let mut b = RateSink::new();
        b.aggregate(&[1.0, 1.0, 0.0]);

        let mut ab = a.clone();
        ab.merge(b.clone());
        let mut ba = b;
        ba.merge(a);
        assert_eq!(ab, ba);

        let mut t1 = TrendSink::new();
        t1.aggregate(&[3.0, 1.0]);
        let mut t2 = TrendSink::new();
        t2.aggregate(&[2.0]);
        t1.merge(t2);
        assert_eq!(t1.stat(&AggregationMethod::Med, SEC), Some(2.0));
        assert_eq!(t1.stat(&AggregationMethod::Max, SEC), Some(3.0));
    }
}
