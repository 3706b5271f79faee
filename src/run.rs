//! One complete test run: configuration, the sample pipeline, the metrics
//! engine and the scheduler, wired together.
//!
//! ```rust, ignore
//! let run = TestRun::new(options, Arc::new(Registry::new()), factory)?;
//! let control = run.control_surface();
//! let outcome = run.run().await;
//! std::process::exit(outcome.exit_code().code().into());
//! ```
use std::{fmt, sync::Arc};

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::{
    config::{MetricsOptions, TestOptions},
    control::ControlSurface,
    engine::MetricsEngine,
    error::{ConfigError, ExitCode},
    event::{Event, EventBus},
    metric::{BuiltinMetrics, Registry},
    pipeline::{self, SampleReceiver, SampleSender},
    report::Summary,
    scheduler::{AbortReason, RunPhase, Scheduler},
    threshold,
    vu::VuFactory,
};

/// How a finished run is judged.
#[derive(Debug, Clone)]
pub enum Verdict {
    Passed,
    /// The run completed but these thresholds failed.
    ThresholdsFailed(Vec<String>),
    /// Stopped through the control surface before the schedule was over.
    Stopped,
    Aborted(AbortReason),
}

impl Verdict {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Self::Passed => ExitCode::Success,
            Self::ThresholdsFailed(_) => ExitCode::ThresholdsHaveFailed,
            Self::Stopped => ExitCode::ExternalAbort,
            Self::Aborted(reason) => reason.exit_code(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::ThresholdsFailed(_) => "thresholds-failed",
            Self::Stopped => "stopped",
            Self::Aborted(_) => "aborted",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ThresholdsFailed(failed) => {
                write!(f, "thresholds failed: {}", failed.join(", "))
            }
            Self::Aborted(reason) => write!(f, "aborted: {reason}"),
            other => f.write_str(other.as_str()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub verdict: Verdict,
    pub summary: Summary,
}

impl RunOutcome {
    pub fn exit_code(&self) -> ExitCode {
        self.verdict.exit_code()
    }
}

pub struct TestRun {
    metrics: MetricsOptions,
    registry: Arc<Registry>,
    builtins: Arc<BuiltinMetrics>,
    engine: Arc<MetricsEngine>,
    scheduler: Arc<Scheduler>,
    events: EventBus,
    tx: SampleSender,
    rx: SampleReceiver,
}

impl fmt::Debug for TestRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestRun")
            .field("scheduler", &self.scheduler)
            .field("engine", &self.engine)
            .finish()
    }
}

impl TestRun {
    /// Validates everything that can be validated before the first VU
    /// exists. Custom metrics referenced by thresholds must already be in
    /// `registry`.
    pub fn new(
        options: TestOptions,
        registry: Arc<Registry>,
        factory: Arc<dyn VuFactory>,
    ) -> Result<Self, ConfigError> {
        let builtins = Arc::new(BuiltinMetrics::register(&registry)?);
        let thresholds = if options.no_thresholds {
            if !options.thresholds.is_empty() {
                tracing::warn!(count = options.thresholds.len(), "thresholds disabled, ignoring them");
            }
            Vec::new()
        } else {
            threshold::build(&registry, &options.thresholds)?
        };
        let engine = Arc::new(MetricsEngine::new(thresholds));
        let (tx, rx) = pipeline::channel(options.metrics.pipeline_capacity);
        let events = EventBus::default();
        let scheduler = Scheduler::new(
            &options,
            factory,
            Arc::clone(&builtins),
            tx.clone(),
            events.clone(),
        )?;

        Ok(Self {
            metrics: options.metrics,
            registry,
            builtins,
            engine,
            scheduler: Arc::new(scheduler),
            events,
            tx,
            rx,
        })
    }

    pub fn control_surface(&self) -> ControlSurface {
        ControlSurface::new(
            Arc::clone(&self.scheduler),
            Arc::clone(&self.engine),
            self.tx.monitor(),
        )
    }

    /// Subscribes to run lifecycle events. Subscribe before [`run`](Self::run)
    /// to see [`Event::TestStart`].
    pub fn events(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn builtins(&self) -> &Arc<BuiltinMetrics> {
        &self.builtins
    }

    /// Drives the run to its end, drains every sample and judges the result.
    pub async fn run(self) -> RunOutcome {
        let Self {
            metrics,
            engine,
            scheduler,
            tx,
            rx,
            ..
        } = self;

        let ingester = tokio::spawn(Arc::clone(&engine).run_ingester(rx, metrics.batch_size));
        let helpers = CancellationToken::new();

        let sampler = {
            let scheduler = Arc::clone(&scheduler);
            let cancel = helpers.clone();
            let tx = tx.clone();
            let period = metrics.vus_sample_period;
            tokio::spawn(async move { scheduler.run_vus_sampler(tx, period, cancel).await })
        };
        let evaluator = {
            let elapsed = {
                let scheduler = Arc::clone(&scheduler);
                move || scheduler.elapsed()
            };
            let on_abort = {
                let scheduler = Arc::clone(&scheduler);
                move |breached| {
                    scheduler.abort(AbortReason::ThresholdsBreached(breached));
                }
            };
            tokio::spawn(Arc::clone(&engine).run_threshold_loop(
                metrics.threshold_eval_period,
                elapsed,
                helpers.clone(),
                on_abort,
            ))
        };
        drop(tx);

        let phase = scheduler.run().await;

        helpers.cancel();
        for (name, task) in [("vus sampler", sampler), ("threshold evaluator", evaluator)] {
            if let Err(err) = task.await {
                tracing::error!(task = name, %err, "helper task failed");
            }
        }
        if let Err(err) = ingester.await {
            tracing::error!(%err, "sample ingester failed");
        }

        let elapsed = scheduler.elapsed();
        let evaluation = engine.evaluate_thresholds(elapsed);
        let verdict = match scheduler.abort_reason() {
            Some(reason) => Verdict::Aborted(reason),
            None if scheduler.stopped_externally() => Verdict::Stopped,
            None if !evaluation.failed.is_empty() => Verdict::ThresholdsFailed(evaluation.failed),
            None => Verdict::Passed,
        };
        debug_assert!(phase.is_terminal());
        if matches!(verdict, Verdict::Aborted(_)) != (phase == RunPhase::Aborted) {
            tracing::warn!(%phase, %verdict, "verdict does not match the final phase");
        }

        let summary = Summary {
            phase,
            verdict: verdict.as_str(),
            exit_code: verdict.exit_code().code(),
            abort_reason: match &verdict {
                Verdict::Aborted(reason) => Some(reason.to_string()),
                _ => None,
            },
            duration: elapsed,
            metrics: engine.snapshot(elapsed),
            thresholds: engine.threshold_results(),
            scenarios: scheduler.status().scenarios,
        };
        tracing::info!(%verdict, exit_code = summary.exit_code, "run judged");
        RunOutcome { verdict, summary }
    }
}
