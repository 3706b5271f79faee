//! Runs every scenario of a test against one shared clock and owns the run
//! lifecycle:
//!
//! ```text
//! Initialized → Running ⇄ Paused → Stopping → Stopped
//!                  └────────┴─────────┴──────→ Aborted
//! ```
//!
//! Executors pace themselves. The scheduler only starts them at their
//! `startTime`, fans out pause and stop requests, and records whether the run
//! ended normally or was aborted.
use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU8, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::{
    sync::watch,
    task::{self, JoinError, JoinSet},
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::TestOptions,
    error::{ConfigError, ControlError, ExecutorError, ExitCode},
    event::{Event, EventBus},
    executor::{
        Executor, ExecutorConfig, ExecutorContext, IterationCounts, PerVuIterations, RunControl,
        ScenarioProgress, Stopwatch,
    },
    metric::{BuiltinMetrics, Sample},
    pipeline::SampleSender,
    pool::{VuIds, VuPool},
    scenario::Scenario,
    segment::ExecutionSegment,
    tags::TagSet,
    vu::VuFactory,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunPhase {
    Initialized,
    Running,
    Paused,
    Stopping,
    Stopped,
    Aborted,
}

impl RunPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Aborted)
    }

    fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initialized => "initialized",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Why a run ended in [`RunPhase::Aborted`].
#[derive(Debug, Clone)]
pub enum AbortReason {
    /// Failures of abort-on-fail thresholds, as `metric: expression`.
    ThresholdsBreached(Vec<String>),
    ExecutorFailed(Arc<ExecutorError>),
}

impl AbortReason {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Self::ThresholdsBreached(_) => ExitCode::ThresholdsHaveFailed,
            Self::ExecutorFailed(err) => err.exit_code(),
        }
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ThresholdsBreached(failed) => {
                write!(f, "thresholds crossed: {}", failed.join(", "))
            }
            Self::ExecutorFailed(err) => err.fmt(f),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScenarioStage {
    Waiting,
    Running,
    Finished,
}

#[derive(Debug)]
struct ScenarioState {
    name: Arc<str>,
    scenario: Scenario,
    pool: Arc<VuPool>,
    progress: Arc<ScenarioProgress>,
    planned: Option<u64>,
    stage: AtomicU8,
}

impl ScenarioState {
    fn stage(&self) -> ScenarioStage {
        match self.stage.load(Ordering::Acquire) {
            0 => ScenarioStage::Waiting,
            1 => ScenarioStage::Running,
            _ => ScenarioStage::Finished,
        }
    }

    fn set_stage(&self, stage: ScenarioStage) {
        self.stage.store(stage as u8, Ordering::Release);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioStatus {
    pub name: String,
    pub executor: &'static str,
    pub stage: ScenarioStage,
    #[serde(rename = "activeVUs")]
    pub active_vus: usize,
    #[serde(rename = "maxVUs")]
    pub max_vus: usize,
    pub planned_iterations: Option<u64>,
    #[serde(flatten)]
    pub iterations: IterationCounts,
}

/// Derived view of the scheduler, computed on demand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    pub phase: RunPhase,
    pub paused: bool,
    #[serde(rename = "activeVUs")]
    pub active_vus: usize,
    #[serde(rename = "vusMax")]
    pub vus_max: usize,
    #[serde(with = "crate::config::duration")]
    pub elapsed: Duration,
    pub scenarios: Vec<ScenarioStatus>,
}

#[derive(Debug, Default)]
struct RunClock {
    stopwatch: Option<Stopwatch>,
    total: Option<Duration>,
}

pub struct Scheduler {
    phase: watch::Sender<RunPhase>,
    abort: Mutex<Option<AbortReason>>,
    control: RunControl,
    external_stop: AtomicBool,
    scenarios: Vec<Arc<ScenarioState>>,
    segment: ExecutionSegment,
    emitter: Mutex<Option<SampleSender>>,
    builtins: Arc<BuiltinMetrics>,
    events: EventBus,
    tags: TagSet,
    vu_timeout: Duration,
    clock: Mutex<RunClock>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("phase", &self.phase())
            .field("segment", &self.segment)
            .field("scenarios", &self.scenarios.len())
            .finish()
    }
}

/// The scenario used when none is configured: one VU, one iteration.
fn default_scenario() -> Scenario {
    Scenario::builder()
        .name("default")
        .executor(ExecutorConfig::PerVuIterations(PerVuIterations {
            vus: 1,
            iterations: 1,
            max_duration: Duration::from_secs(600),
        }))
        .build()
}

impl Scheduler {
    /// Validates the plan of every scenario against the run limits and
    /// creates the VU pools.
    pub fn new(
        options: &TestOptions,
        factory: Arc<dyn VuFactory>,
        builtins: Arc<BuiltinMetrics>,
        emitter: SampleSender,
        events: EventBus,
    ) -> Result<Self, ConfigError> {
        let segment = options.segment();
        if let Some(sequence) = &options.execution_segment_sequence {
            if !sequence.contains(&segment) {
                return Err(ConfigError::InvalidSegment(format!(
                    "segment {segment} is not part of sequence {sequence}"
                )));
            }
        }

        let mut scenarios = options.named_scenarios();
        if scenarios.is_empty() {
            scenarios.push(default_scenario());
        }

        let mut total_vus = 0u64;
        for scenario in &scenarios {
            scenario.validate()?;
            total_vus = total_vus.saturating_add(scenario.max_vus(&segment));
            if let Some(max) = options.limits.max_duration {
                if scenario.total_duration() > max {
                    return Err(ConfigError::LimitExceeded(format!(
                        "scenario `{}` may run for {} which exceeds maxDuration {}",
                        scenario.name,
                        humantime::format_duration(scenario.total_duration()),
                        humantime::format_duration(max),
                    )));
                }
            }
        }
        if let Some(max) = options.limits.max_vus {
            if total_vus > max {
                return Err(ConfigError::LimitExceeded(format!(
                    "scenarios need up to {total_vus} VUs, limit is {max}"
                )));
            }
        }

        let tags: TagSet = options
            .tags
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let ids = VuIds::default();
        let scenarios = scenarios
            .into_iter()
            .map(|scenario| {
                let name: Arc<str> = Arc::from(scenario.name.as_str());
                let max_vus = usize::try_from(scenario.max_vus(&segment)).unwrap_or(usize::MAX);
                let pool = VuPool::new(
                    Arc::clone(&name),
                    Arc::clone(&factory),
                    ids.clone(),
                    events.clone(),
                    max_vus,
                );
                Arc::new(ScenarioState {
                    name,
                    planned: scenario.executor.planned_iterations(&segment),
                    scenario,
                    pool: Arc::new(pool),
                    progress: Arc::new(ScenarioProgress::default()),
                    stage: AtomicU8::new(ScenarioStage::Waiting as u8),
                })
            })
            .collect();

        let (phase, _) = watch::channel(RunPhase::Initialized);
        Ok(Self {
            phase,
            abort: Mutex::new(None),
            control: RunControl::new(),
            external_stop: AtomicBool::new(false),
            scenarios,
            segment,
            emitter: Mutex::new(Some(emitter)),
            builtins,
            events,
            tags,
            vu_timeout: options.vu_allocation_timeout,
            clock: Mutex::new(RunClock::default()),
        })
    }

    pub fn phase(&self) -> RunPhase {
        *self.phase.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<RunPhase> {
        self.phase.subscribe()
    }

    pub fn abort_reason(&self) -> Option<AbortReason> {
        self.abort.lock().clone()
    }

    /// Whether a stop was requested from outside the run.
    pub fn stopped_externally(&self) -> bool {
        self.external_stop.load(Ordering::Acquire)
    }

    /// Active run time: excludes pauses, frozen once the run is over.
    pub fn elapsed(&self) -> Duration {
        let clock = self.clock.lock();
        match (&clock.total, &clock.stopwatch) {
            (Some(total), _) => *total,
            (None, Some(sw)) => sw.elapsed(),
            (None, None) => Duration::ZERO,
        }
    }

    /// Applies `f` to the current phase. Returns the phase before the call.
    fn transition(&self, f: impl FnOnce(RunPhase) -> Option<RunPhase>) -> RunPhase {
        let mut before = RunPhase::Initialized;
        self.phase.send_if_modified(|phase| {
            before = *phase;
            match f(*phase) {
                Some(next) if next != *phase => {
                    tracing::debug!(from = %phase, to = %next, "run phase changed");
                    *phase = next;
                    true
                }
                _ => false,
            }
        });
        before
    }

    /// Runs every scenario to completion and returns the terminal phase.
    pub async fn run(&self) -> RunPhase {
        let before = self.transition(|p| (p == RunPhase::Initialized).then_some(RunPhase::Running));
        if before != RunPhase::Initialized {
            tracing::warn!(phase = %before, "run was already started or stopped");
            // a run stopped before it started must still close the pipeline
            drop(self.emitter.lock().take());
            return self.wait_terminal().await;
        }
        let Some(emitter) = self.emitter.lock().take() else {
            return self.wait_terminal().await;
        };

        self.clock.lock().stopwatch = Some(self.control.pause.stopwatch());
        self.events.emit(Event::TestStart);
        tracing::info!(scenarios = self.scenarios.len(), segment = %self.segment, "test run started");

        let mut running = JoinSet::new();
        let mut names = HashMap::new();
        for (i, state) in self.scenarios.iter().enumerate() {
            let ctx = self.executor_context(state, emitter.clone());
            let state = Arc::clone(state);
            let sw = self.control.pause.stopwatch();
            let name = Arc::clone(&state.name);
            let handle = running.spawn(async move {
                let start_time = state.scenario.start_time;
                tokio::select! {
                    _ = ctx.control.soft.cancelled() => return Ok(()),
                    _ = sw.wait_until(start_time) => {}
                }
                tracing::info!(scenario = %state.name, executor = state.scenario.executor.kind(), "scenario started");
                state.set_stage(ScenarioStage::Running);
                let res = state.scenario.executor.run(ctx).await;
                state.set_stage(ScenarioStage::Finished);
                tracing::info!(scenario = %state.name, iterations = ?state.progress.counts(), "scenario finished");
                res
            });
            names.insert(handle.id(), name);
            tracing::trace!(scenario = i, "scenario scheduled");
        }
        drop(emitter);

        while let Some(res) = running.join_next().await {
            let err = match res {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => err,
                Err(err) => scenario_task_failure(&names, err),
            };
            self.abort(AbortReason::ExecutorFailed(Arc::new(err)));
        }

        self.transition(|p| p.is_active().then_some(RunPhase::Stopping));
        for state in &self.scenarios {
            state.pool.close();
        }
        {
            let mut clock = self.clock.lock();
            clock.total = clock.stopwatch.as_ref().map(Stopwatch::elapsed);
        }

        let reason = self.abort_reason();
        let last = if reason.is_some() {
            RunPhase::Aborted
        } else {
            RunPhase::Stopped
        };
        self.transition(|_| Some(last));
        self.events.emit(Event::TestEnd);
        self.events.emit(Event::Exit {
            error: reason.as_ref().map(ToString::to_string),
        });
        tracing::info!(phase = %last, elapsed = ?self.elapsed(), "test run finished");
        last
    }

    fn executor_context(&self, state: &ScenarioState, emitter: SampleSender) -> ExecutorContext {
        ExecutorContext {
            scenario: Arc::clone(&state.name),
            segment: self.segment.clone(),
            pool: Arc::clone(&state.pool),
            emitter,
            builtins: Arc::clone(&self.builtins),
            tags: self
                .tags
                .with_all(state.scenario.tags.iter().map(|(k, v)| (k.as_str(), v.as_str())))
                .with("scenario", Arc::clone(&state.name)),
            control: self.control.clone(),
            progress: Arc::clone(&state.progress),
            vu_timeout: self.vu_timeout,
            graceful_stop: state.scenario.graceful_stop,
        }
    }

    async fn wait_terminal(&self) -> RunPhase {
        let mut rx = self.phase.subscribe();
        match rx.wait_for(|p| p.is_terminal()).await {
            Ok(phase) => *phase,
            Err(_) => self.phase(),
        }
    }

    /// Stops scheduling new iterations in every scenario.
    pub fn pause(&self) -> Result<(), ControlError> {
        let phase = self.phase();
        match phase {
            RunPhase::Paused => return Ok(()),
            RunPhase::Running => {}
            p if p.is_terminal() => return Err(ControlError::AlreadyStopped(p)),
            p => return Err(ControlError::NotActive(p)),
        }
        let unpausable: Vec<String> = self
            .scenarios
            .iter()
            .filter(|s| s.stage() != ScenarioStage::Finished && !s.scenario.is_pausable())
            .map(|s| s.name.to_string())
            .collect();
        if !unpausable.is_empty() {
            return Err(ControlError::PauseNotSupported(unpausable));
        }

        let before = self.transition(|p| (p == RunPhase::Running).then_some(RunPhase::Paused));
        match before {
            RunPhase::Running | RunPhase::Paused => {
                self.control.pause.set_paused(true);
                tracing::info!("test run paused");
                Ok(())
            }
            p if p.is_terminal() => Err(ControlError::AlreadyStopped(p)),
            p => Err(ControlError::NotActive(p)),
        }
    }

    pub fn resume(&self) -> Result<(), ControlError> {
        let before = self.transition(|p| (p == RunPhase::Paused).then_some(RunPhase::Running));
        match before {
            RunPhase::Paused => {
                self.control.pause.set_paused(false);
                tracing::info!("test run resumed");
                Ok(())
            }
            RunPhase::Running => Ok(()),
            p if p.is_terminal() => Err(ControlError::AlreadyStopped(p)),
            p => Err(ControlError::NotActive(p)),
        }
    }

    /// Starts an orderly shutdown. A graceful stop lets in-flight iterations
    /// finish within each scenario's `gracefulStop`; otherwise they are
    /// cancelled right away. Repeated requests are no-ops, except that a hard
    /// stop may still follow a graceful one.
    pub fn request_stop(&self, graceful: bool) {
        if self.phase().is_terminal() {
            return;
        }
        if !self.external_stop.swap(true, Ordering::AcqRel) {
            tracing::info!(graceful, "stop requested");
        }
        self.begin_stopping();
        if !graceful && !self.control.hard.is_cancelled() {
            tracing::debug!("cancelling in-flight iterations");
            self.control.hard.cancel();
        }
    }

    /// Requests a stop and waits for the run to end.
    pub async fn stop(&self, graceful: bool) -> RunPhase {
        self.request_stop(graceful);
        self.wait_terminal().await
    }

    /// Marks the run as aborted and stops it gracefully. Only the first reason
    /// is kept; returns whether this call was the first.
    pub fn abort(&self, reason: AbortReason) -> bool {
        {
            let mut slot = self.abort.lock();
            if slot.is_some() || self.phase().is_terminal() {
                return false;
            }
            tracing::error!(%reason, "aborting test run");
            *slot = Some(reason);
        }
        self.begin_stopping();
        true
    }

    fn begin_stopping(&self) {
        self.control.soft.cancel();
        self.control.pause.set_paused(false);
        let before = self.transition(|p| match p {
            RunPhase::Running | RunPhase::Paused => Some(RunPhase::Stopping),
            RunPhase::Initialized => Some(RunPhase::Stopped),
            _ => None,
        });
        if before == RunPhase::Initialized {
            tracing::debug!("stopped before start");
        }
    }

    pub fn status(&self) -> SchedulerStatus {
        let scenarios: Vec<ScenarioStatus> = self
            .scenarios
            .iter()
            .map(|s| {
                let pool = s.pool.stats();
                ScenarioStatus {
                    name: s.name.to_string(),
                    executor: s.scenario.executor.kind(),
                    stage: s.stage(),
                    active_vus: pool.held,
                    max_vus: s.pool.max(),
                    planned_iterations: s.planned,
                    iterations: s.progress.counts(),
                }
            })
            .collect();
        SchedulerStatus {
            phase: self.phase(),
            paused: self.control.pause.is_paused(),
            active_vus: scenarios.iter().map(|s| s.active_vus).sum(),
            vus_max: self.scenarios.iter().map(|s| s.pool.stats().alive).sum(),
            elapsed: self.elapsed(),
            scenarios,
        }
    }

    /// Periodically emits the `vus` and `vus_max` gauges until `cancel` fires.
    pub async fn run_vus_sampler(
        &self,
        emitter: SampleSender,
        period: Duration,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let status = self.status();
            let samples = vec![
                Sample::new(&self.builtins.vus, status.active_vus as f64, self.tags.clone()),
                Sample::new(&self.builtins.vus_max, status.vus_max as f64, self.tags.clone()),
            ];
            if emitter.send(samples).await.is_err() {
                break;
            }
        }
    }
}

fn scenario_task_failure(names: &HashMap<task::Id, Arc<str>>, err: JoinError) -> ExecutorError {
    let scenario = names
        .get(&err.id())
        .map_or_else(|| "<unknown>".to_string(), ToString::to_string);
    ExecutorError::Panicked {
        scenario,
        message: err.to_string(),
    }
}
