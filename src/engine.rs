//! The metrics engine: folds samples into sinks and evaluates thresholds.
//!
//! All aggregate state sits behind one lock. Ingestion takes it once per batch
//! and threshold evaluation takes it for a whole pass, so evaluation always sees
//! every sample of a batch or none of them.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::{
    aggregate::{Sink, SinkSnapshot},
    metric::{Metric, Sample},
    pipeline::SampleReceiver,
    tags::{TagSelector, TagSet},
    threshold::MetricThresholds,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThresholdResult {
    pub source: String,
    pub passed: bool,
    /// The statistic the expression was checked against, when there was data.
    pub observed: Option<f64>,
    pub abort_on_fail: bool,
}

/// Outcome of one evaluation pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evaluation {
    /// `metric_key: expression` of every failing threshold.
    pub failed: Vec<String>,
    /// Set on the first pass where an abort-on-fail threshold fails.
    pub abort: Option<Vec<String>>,
}

struct Submetric {
    key: String,
    selector: TagSelector,
    sink: Sink,
}

#[derive(Default)]
struct EngineState {
    sinks: HashMap<String, (Arc<Metric>, Sink)>,
    /// Submetrics indexed by parent metric name.
    submetrics: HashMap<String, Vec<Submetric>>,
    results: BTreeMap<String, Vec<ThresholdResult>>,
}

impl EngineState {
    fn sink_for(&mut self, key: &str, metric: &Metric, selector: Option<&TagSet>) -> Option<&mut Sink> {
        match selector {
            None => self.sinks.get_mut(&metric.name).map(|(_, s)| s),
            Some(_) => self
                .submetrics
                .get_mut(&metric.name)?
                .iter_mut()
                .find(|sub| sub.key == key)
                .map(|sub| &mut sub.sink),
        }
    }
}

pub struct MetricsEngine {
    thresholds: Vec<MetricThresholds>,
    state: Mutex<EngineState>,
    aborted: AtomicBool,
}

impl std::fmt::Debug for MetricsEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsEngine")
            .field("thresholds", &self.thresholds.len())
            .field("aborted", &self.aborted.load(Ordering::Relaxed))
            .finish()
    }
}

fn describe(key: &str, source: &str) -> String {
    format!("{key}: {source}")
}

impl MetricsEngine {
    pub fn new(thresholds: Vec<MetricThresholds>) -> Self {
        let mut state = EngineState::default();
        for t in &thresholds {
            if let Some(selector) = &t.selector {
                state
                    .submetrics
                    .entry(t.metric.name.clone())
                    .or_default()
                    .push(Submetric {
                        key: t.key.clone(),
                        selector: TagSelector::from(selector),
                        sink: Sink::for_kind(t.metric.kind),
                    });
            }
            // thresholds on metrics that never receive samples still report
            state
                .sinks
                .entry(t.metric.name.clone())
                .or_insert_with(|| (Arc::clone(&t.metric), Sink::for_kind(t.metric.kind)));
        }
        Self {
            thresholds,
            state: Mutex::new(state),
            aborted: AtomicBool::new(false),
        }
    }

    pub fn has_thresholds(&self) -> bool {
        !self.thresholds.is_empty()
    }

    pub fn ingest(&self, samples: &[Sample]) {
        if samples.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        let EngineState {
            sinks, submetrics, ..
        } = &mut *state;
        for sample in samples {
            match sinks.get_mut(sample.name()) {
                Some((_, sink)) => sink.consume(sample.value),
                None => {
                    let mut sink = Sink::for_kind(sample.metric.kind);
                    sink.consume(sample.value);
                    sinks.insert(sample.name().to_string(), (Arc::clone(&sample.metric), sink));
                }
            }
            if let Some(subs) = submetrics.get_mut(sample.name()) {
                for sub in subs.iter_mut().filter(|s| sample.tags.matches(&s.selector)) {
                    sub.sink.consume(sample.value);
                }
            }
        }
    }

    /// Drains the pipeline until every sender is gone.
    pub async fn run_ingester(self: Arc<Self>, mut rx: SampleReceiver, batch_size: usize) {
        let mut buf = Vec::new();
        while rx.recv_many(batch_size.max(1), &mut buf).await {
            self.ingest(&buf);
            buf.clear();
        }
        tracing::debug!("sample pipeline drained");
    }

    /// Evaluates every threshold against the current aggregates.
    ///
    /// `elapsed` is the active run time; it drives per-second rates and
    /// `delayAbortEval`. The abort signal is only ever returned once.
    pub fn evaluate_thresholds(&self, elapsed: Duration) -> Evaluation {
        let mut evaluation = Evaluation::default();
        let mut breached = Vec::new();
        let mut state = self.state.lock();
        let mut results = BTreeMap::new();

        for mt in &self.thresholds {
            let sink = state.sink_for(&mt.key, &mt.metric, mt.selector.as_ref());
            let mut entries = Vec::with_capacity(mt.thresholds.len());
            match sink {
                Some(sink) => {
                    for t in &mt.thresholds {
                        let observed = sink.stat(&t.expression.method, elapsed);
                        let passed = observed.is_none_or(|v| t.expression.passes(v));
                        if !passed {
                            evaluation.failed.push(describe(&mt.key, &t.source));
                            let delay_over = t.delay_abort_eval.is_none_or(|d| elapsed >= d);
                            if t.abort_on_fail && delay_over {
                                breached.push(describe(&mt.key, &t.source));
                            }
                        }
                        entries.push(ThresholdResult {
                            source: t.source.clone(),
                            passed,
                            observed,
                            abort_on_fail: t.abort_on_fail,
                        });
                    }
                }
                None => entries.extend(mt.thresholds.iter().map(|t| ThresholdResult {
                    source: t.source.clone(),
                    passed: true,
                    observed: None,
                    abort_on_fail: t.abort_on_fail,
                })),
            }
            results.insert(mt.key.clone(), entries);
        }
        state.results = results;
        drop(state);

        if !breached.is_empty() && !self.aborted.swap(true, Ordering::AcqRel) {
            tracing::error!(thresholds = ?breached, "thresholds crossed, aborting run");
            evaluation.abort = Some(breached);
        } else if !evaluation.failed.is_empty() {
            tracing::debug!(thresholds = ?evaluation.failed, "thresholds failing");
        }
        evaluation
    }

    /// Periodic evaluation until `cancel` fires. `on_abort` runs at most once.
    pub async fn run_threshold_loop<C, A>(
        self: Arc<Self>,
        period: Duration,
        elapsed: C,
        cancel: CancellationToken,
        on_abort: A,
    ) where
        C: Fn() -> Duration + Send,
        A: Fn(Vec<String>) + Send,
    {
        if !self.has_thresholds() {
            return;
        }
        let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        interval.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Some(breached) = self.evaluate_thresholds(elapsed()).abort {
                        on_abort(breached);
                    }
                }
            }
        }
    }

    pub fn aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Failing thresholds as of the last evaluation.
    pub fn failed_thresholds(&self) -> Vec<String> {
        self.state
            .lock()
            .results
            .iter()
            .flat_map(|(key, results)| {
                results
                    .iter()
                    .filter(|r| !r.passed)
                    .map(move |r| describe(key, &r.source))
            })
            .collect()
    }

    pub fn threshold_results(&self) -> BTreeMap<String, Vec<ThresholdResult>> {
        self.state.lock().results.clone()
    }

    /// Formatted statistics of every metric that has data, and of every
    /// threshold submetric.
    pub fn snapshot(&self, elapsed: Duration) -> BTreeMap<String, SinkSnapshot> {
        let mut state = self.state.lock();
        let EngineState {
            sinks, submetrics, ..
        } = &mut *state;
        let mut out = BTreeMap::new();
        for (name, (metric, sink)) in sinks.iter_mut() {
            if sink.is_empty() {
                continue;
            }
            out.insert(
                name.clone(),
                SinkSnapshot {
                    kind: metric.kind,
                    values: sink.summary(elapsed),
                },
            );
        }
        for (name, subs) in submetrics.iter_mut() {
            let Some((metric, _)) = sinks.get(name) else {
                continue;
            };
            for sub in subs.iter_mut() {
                out.insert(
                    sub.key.clone(),
                    SinkSnapshot {
                        kind: metric.kind,
                        values: sub.sink.summary(elapsed),
                    },
                );
            }
        }
        out
    }
}
