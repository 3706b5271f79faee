//! Executors: the load shapes a scenario can run.
//!
//! An [`Executor`] decides how many iterations run concurrently and when. It
//! borrows VUs from the scenario's [`VuPool`], runs iterations on them and
//! forwards the resulting samples. Six shapes exist, selected by the
//! `executor` field of a scenario:
//!
//! | executor                | drives                                      |
//! |-------------------------|---------------------------------------------|
//! | `constant-vus`          | a fixed number of looping VUs               |
//! | `ramping-vus`           | looping VUs following stages                |
//! | `constant-arrival-rate` | a fixed iteration start rate                |
//! | `ramping-arrival-rate`  | an iteration start rate following stages    |
//! | `shared-iterations`     | a fixed iteration count shared by all VUs   |
//! | `per-vu-iterations`     | a fixed iteration count for every VU        |
//!
//! Every executor observes two cancellation levels: the *soft* token stops
//! new iterations from starting, the *hard* token interrupts the ones in
//! flight. After its schedule ends an executor waits up to the scenario's
//! `gracefulStop` for in-flight iterations before cancelling them.
pub mod arrival_rate;
pub mod clock;
pub mod constant_vus;
pub mod iterations;
pub mod ramping_vus;

pub use arrival_rate::{ConstantArrivalRate, RampingArrivalRate};
pub use clock::{PauseGate, Stopwatch};
pub use constant_vus::ConstantVus;
pub use iterations::{PerVuIterations, SharedIterations};
pub use ramping_vus::RampingVus;

#[cfg(feature = "internals")]
pub use arrival_rate::internals::*;
#[cfg(feature = "internals")]
pub use ramping_vus::internals::*;

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::{task::JoinSet, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    config::duration,
    error::{ExecutorError, IterationError, PoolError},
    event::Event,
    metric::{BuiltinMetrics, Sample},
    pipeline::SampleSender,
    pool::{PooledVu, VuPool},
    segment::ExecutionSegment,
    tags::TagSet,
    vu::IterationContext,
};

/// One leg of a ramp: reach `target` over `duration`.
///
/// Use `Stage::new(Duration::from_secs(10), 100)` to ramp to 100 over 10s. A
/// stage with `Duration::ZERO` jumps to `target` instantly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    #[serde(with = "duration")]
    pub duration: Duration,
    pub target: u64,
}

impl Stage {
    pub fn new(duration: Duration, target: u64) -> Self {
        Self { duration, target }
    }
}

/// The load-shape contract.
pub trait Executor
where
    Self: Send + Sync,
{
    /// Checks the configuration on its own, before any segment is applied.
    fn validate(&self) -> Result<(), String>;

    /// Iterations this executor will run for `segment`, when known upfront.
    fn planned_iterations(&self, segment: &ExecutionSegment) -> Option<u64>;

    /// Upper bound of VUs held at once.
    fn max_vus(&self, segment: &ExecutionSegment) -> u64;

    /// Length of the schedule, excluding the graceful stop period.
    fn max_duration(&self) -> Duration;

    fn is_pausable(&self) -> bool {
        true
    }

    /// Drives iterations until the schedule is exhausted or `ctx` is
    /// cancelled.
    fn run(&self, ctx: ExecutorContext) -> impl Future<Output = Result<(), ExecutorError>> + Send;
}

/// The closed set of executors, tagged by the `executor` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "executor", rename_all = "kebab-case")]
pub enum ExecutorConfig {
    ConstantVus(ConstantVus),
    RampingVus(RampingVus),
    ConstantArrivalRate(ConstantArrivalRate),
    RampingArrivalRate(RampingArrivalRate),
    SharedIterations(SharedIterations),
    PerVuIterations(PerVuIterations),
}

impl ExecutorConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConstantVus(_) => "constant-vus",
            Self::RampingVus(_) => "ramping-vus",
            Self::ConstantArrivalRate(_) => "constant-arrival-rate",
            Self::RampingArrivalRate(_) => "ramping-arrival-rate",
            Self::SharedIterations(_) => "shared-iterations",
            Self::PerVuIterations(_) => "per-vu-iterations",
        }
    }

    fn inner(&self) -> &dyn ExecutorInfo {
        match self {
            Self::ConstantVus(e) => e,
            Self::RampingVus(e) => e,
            Self::ConstantArrivalRate(e) => e,
            Self::RampingArrivalRate(e) => e,
            Self::SharedIterations(e) => e,
            Self::PerVuIterations(e) => e,
        }
    }
}

/// Object-safe subset of [`Executor`], used for dispatch.
trait ExecutorInfo {
    fn check(&self) -> Result<(), String>;
    fn planned(&self, segment: &ExecutionSegment) -> Option<u64>;
    fn vus_needed(&self, segment: &ExecutionSegment) -> u64;
    fn total_duration(&self) -> Duration;
    fn pausable(&self) -> bool;
}

impl<E: Executor> ExecutorInfo for E {
    fn check(&self) -> Result<(), String> {
        self.validate()
    }
    fn planned(&self, segment: &ExecutionSegment) -> Option<u64> {
        self.planned_iterations(segment)
    }
    fn vus_needed(&self, segment: &ExecutionSegment) -> u64 {
        self.max_vus(segment)
    }
    fn total_duration(&self) -> Duration {
        self.max_duration()
    }
    fn pausable(&self) -> bool {
        self.is_pausable()
    }
}

impl Executor for ExecutorConfig {
    fn validate(&self) -> Result<(), String> {
        self.inner().check()
    }

    fn planned_iterations(&self, segment: &ExecutionSegment) -> Option<u64> {
        self.inner().planned(segment)
    }

    fn max_vus(&self, segment: &ExecutionSegment) -> u64 {
        self.inner().vus_needed(segment)
    }

    fn max_duration(&self) -> Duration {
        self.inner().total_duration()
    }

    fn is_pausable(&self) -> bool {
        self.inner().pausable()
    }

    async fn run(&self, ctx: ExecutorContext) -> Result<(), ExecutorError> {
        match self {
            Self::ConstantVus(e) => e.run(ctx).await,
            Self::RampingVus(e) => e.run(ctx).await,
            Self::ConstantArrivalRate(e) => e.run(ctx).await,
            Self::RampingArrivalRate(e) => e.run(ctx).await,
            Self::SharedIterations(e) => e.run(ctx).await,
            Self::PerVuIterations(e) => e.run(ctx).await,
        }
    }
}

/// Run-wide signals shared by every executor.
#[derive(Debug, Clone, Default)]
pub struct RunControl {
    /// Stop starting iterations.
    pub soft: CancellationToken,
    /// Interrupt in-flight iterations.
    pub hard: CancellationToken,
    pub pause: PauseGate,
}

impl RunControl {
    /// Soft is a child of hard, so a hard stop implies a soft one.
    pub fn new() -> Self {
        let hard = CancellationToken::new();
        Self {
            soft: hard.child_token(),
            hard,
            pause: PauseGate::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationCounts {
    pub completed: u64,
    pub failed: u64,
    pub interrupted: u64,
    pub dropped: u64,
}

#[derive(Debug, Default)]
pub struct ScenarioProgress {
    completed: AtomicU64,
    failed: AtomicU64,
    interrupted: AtomicU64,
    dropped: AtomicU64,
}

impl ScenarioProgress {
    pub fn counts(&self) -> IterationCounts {
        IterationCounts {
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            interrupted: self.interrupted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn add_dropped(&self, n: u64) {
        self.dropped.fetch_add(n, Ordering::Relaxed);
    }
}

/// What an executor is given to run one scenario.
#[derive(Debug, Clone)]
pub struct ExecutorContext {
    pub scenario: Arc<str>,
    pub segment: ExecutionSegment,
    pub pool: Arc<VuPool>,
    pub emitter: SampleSender,
    pub builtins: Arc<BuiltinMetrics>,
    /// Run tags, scenario tags and `scenario=<name>`.
    pub tags: TagSet,
    pub control: RunControl,
    pub progress: Arc<ScenarioProgress>,
    pub vu_timeout: Duration,
    pub graceful_stop: Duration,
}

impl ExecutorContext {
    fn pool_error(&self, err: PoolError) -> ExecutorError {
        ExecutorError::from_pool(&self.scenario, err)
    }
}

type Workers = JoinSet<Result<(), ExecutorError>>;

/// Runs one iteration on `vu` and records its outcome.
///
/// Returns the non-fatal iteration error, if any, so the caller can decide
/// whether the VU may be reused. A fatal error ends the executor.
pub(crate) async fn run_iteration(
    ctx: &ExecutorContext,
    vu: &mut PooledVu,
    hard: &CancellationToken,
    scenario_iteration: u64,
) -> Result<Option<IterationError>, ExecutorError> {
    let iteration = vu.next_iteration();
    let vu_id = vu.id();
    let iter_ctx = IterationContext::new(
        vu_id,
        iteration,
        Arc::clone(&ctx.scenario),
        scenario_iteration,
        ctx.tags.clone(),
        hard.child_token(),
        Arc::clone(&ctx.builtins),
        ctx.emitter.clone(),
    );
    vu.events().local.emit(Event::IterationStart {
        vu_id,
        iteration,
        scenario: ctx.scenario.to_string(),
    });

    let start = Instant::now();
    let result = tokio::select! {
        biased;
        _ = hard.cancelled() => Err(IterationError::Interrupted),
        res = vu.vu_mut().run_iteration(&iter_ctx) => res,
    };
    let took = start.elapsed();

    vu.events().local.emit(Event::IterationEnd {
        vu_id,
        iteration,
        scenario: ctx.scenario.to_string(),
        error: result.as_ref().err().map(ToString::to_string),
    });

    match &result {
        Ok(()) => {}
        Err(IterationError::Interrupted) => {
            ctx.progress.interrupted.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(IterationError::Interrupted));
        }
        Err(IterationError::Fatal(message)) => {
            tracing::error!(scenario = %ctx.scenario, vu = vu_id, %message, "workload aborted the test");
            return Err(ExecutorError::Aborted {
                scenario: ctx.scenario.to_string(),
                message: message.clone(),
            });
        }
        Err(err) => {
            tracing::warn!(scenario = %ctx.scenario, vu = vu_id, iteration, error = %err, "iteration failed");
            ctx.progress.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    ctx.progress.completed.fetch_add(1, Ordering::Relaxed);
    let samples = vec![
        Sample::new(&ctx.builtins.iterations, 1.0, ctx.tags.clone()),
        Sample::new(
            &ctx.builtins.iteration_duration,
            took.as_secs_f64() * 1000.0,
            ctx.tags.clone(),
        ),
    ];
    if ctx.emitter.send(samples).await.is_err() {
        tracing::trace!(scenario = %ctx.scenario, "sample pipeline closed");
    }
    Ok(result.err())
}

/// Body of one long-lived VU: keeps a VU and runs iterations on it while
/// `next` hands out scenario iteration numbers.
pub(crate) async fn vu_loop<N>(
    ctx: ExecutorContext,
    soft: CancellationToken,
    hard: CancellationToken,
    mut next: N,
) -> Result<(), ExecutorError>
where
    N: FnMut() -> Option<u64> + Send,
{
    let mut held: Option<PooledVu> = None;
    loop {
        if soft.is_cancelled() {
            break;
        }
        if ctx.control.pause.is_paused() {
            tokio::select! {
                _ = soft.cancelled() => break,
                _ = ctx.control.pause.wait_resumed() => continue,
            }
        }

        let mut vu = match held.take() {
            Some(vu) => vu,
            None => match ctx.pool.acquire(&soft, ctx.vu_timeout).await {
                Ok(vu) => vu,
                Err(PoolError::Cancelled) => break,
                Err(err) => return Err(ctx.pool_error(err)),
            },
        };
        let Some(n) = next() else {
            vu.release(None);
            break;
        };
        match run_iteration(&ctx, &mut vu, &hard, n).await? {
            Some(err) if err.discards_vu() => vu.release(Some(&err)),
            _ => held = Some(vu),
        }
    }
    if let Some(vu) = held {
        vu.release(None);
    }
    Ok(())
}

fn join_result(
    scenario: &str,
    res: Result<Result<(), ExecutorError>, tokio::task::JoinError>,
) -> Result<(), ExecutorError> {
    match res {
        Ok(res) => res,
        Err(err) => Err(ExecutorError::Panicked {
            scenario: scenario.to_string(),
            message: err.to_string(),
        }),
    }
}

/// Waits until `deadline` completes, `soft` fires, every worker is done, or a
/// worker fails.
pub(crate) async fn supervise<D>(
    ctx: &ExecutorContext,
    workers: &mut Workers,
    deadline: D,
    soft: &CancellationToken,
) -> Result<(), ExecutorError>
where
    D: Future<Output = ()>,
{
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => return Ok(()),
            _ = soft.cancelled() => return Ok(()),
            res = workers.join_next() => match res {
                None => return Ok(()),
                Some(res) => join_result(&ctx.scenario, res)?,
            },
        }
    }
}

/// Ends the schedule: no new iterations, `grace` for the in-flight ones, then
/// interruption. A failure skips the grace period.
pub(crate) async fn finish(
    ctx: &ExecutorContext,
    workers: &mut Workers,
    outcome: Result<(), ExecutorError>,
    soft: &CancellationToken,
    hard: &CancellationToken,
) -> Result<(), ExecutorError> {
    soft.cancel();
    let grace = match outcome {
        Ok(()) => ctx.graceful_stop,
        Err(_) => Duration::ZERO,
    };
    if !workers.is_empty() {
        tracing::debug!(scenario = %ctx.scenario, in_flight = workers.len(), ?grace, "draining");
    }

    let mut first_err = outcome.err();
    let deadline = tokio::time::sleep(grace);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            res = workers.join_next() => match res {
                None => break,
                Some(res) => {
                    if let Err(err) = join_result(&ctx.scenario, res) {
                        first_err.get_or_insert(err);
                    }
                }
            },
            _ = &mut deadline, if !hard.is_cancelled() => {
                tracing::debug!(scenario = %ctx.scenario, "graceful stop period over, interrupting iterations");
                hard.cancel();
            }
        }
    }
    hard.cancel();
    first_err.map_or(Ok(()), Err)
}

/// Scenario iteration numbers for executors without an iteration limit.
pub(crate) fn unbounded(counter: Arc<AtomicU64>) -> impl FnMut() -> Option<u64> + Send {
    move || Some(counter.fetch_add(1, Ordering::Relaxed))
}


#[cfg(test)]
mod tests {
    use super::testing::harness;
    use super::*;
    use crate::mock::MockVuFactory;

    #[test]
    fn executor_is_selected_by_tag() {
        let cfg: ExecutorConfig = serde_json::from_str(
            r#"{"executor": "shared-iterations", "vus": 2, "iterations": 10}"#,
        )
        .unwrap();
        assert_eq!(cfg.kind(), "shared-iterations");
        assert_eq!(cfg.planned_iterations(&ExecutionSegment::full()), Some(10));
        assert_eq!(cfg.max_vus(&ExecutionSegment::full()), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_iterations_are_counted_and_recorded() {
        let factory = MockVuFactory::builder()
            .script(vec![
                Ok(()),
                Err(IterationError::Failed("boom".into())),
                Ok(()),
            ])
            .build()
            .unwrap();
        let mut h = harness(Arc::new(factory), 1);
        let mut vu = h
            .ctx
            .pool
            .acquire(&CancellationToken::new(), Duration::from_secs(1))
            .await
            .unwrap();
        let hard = CancellationToken::new();

        for n in 0..3 {
            let outcome = run_iteration(&h.ctx, &mut vu, &hard, n).await.unwrap();
            assert_eq!(outcome.is_some(), n == 1);
        }
        let counts = h.ctx.progress.counts();
        assert_eq!(counts.completed, 3);
        assert_eq!(counts.failed, 1);

        let mut buf = Vec::new();
        while buf.len() < 6 {
            assert!(h.rx.recv_many(16, &mut buf).await);
        }
        let iterations = buf.iter().filter(|s| s.name() == "iterations").count();
        assert_eq!(iterations, 3);
        assert!(buf.iter().all(|s| s.tags.get("scenario") == Some("test")));
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_errors_end_the_executor() {
        let factory = MockVuFactory::builder()
            .outcome(Err(IterationError::Fatal("test.abort()".into())))
            .build()
            .unwrap();
        let h = harness(Arc::new(factory), 1);
        let mut vu = h
            .ctx
            .pool
            .acquire(&CancellationToken::new(), Duration::from_secs(1))
            .await
            .unwrap();
        let err = run_iteration(&h.ctx, &mut vu, &CancellationToken::new(), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Aborted { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn hard_cancel_interrupts_and_discards() {
        let factory = MockVuFactory::builder()
            .iteration_duration(Duration::from_secs(60))
            .build()
            .unwrap();
        let h = harness(Arc::new(factory), 1);
        let hard = CancellationToken::new();
        let mut vu = h
            .ctx
            .pool
            .acquire(&CancellationToken::new(), Duration::from_secs(1))
            .await
            .unwrap();

        let canceller = tokio::spawn({
            let hard = hard.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                hard.cancel();
            }
        });
        let outcome = run_iteration(&h.ctx, &mut vu, &hard, 0).await.unwrap();
        canceller.await.unwrap();

        assert_eq!(outcome, Some(IterationError::Interrupted));
        vu.release(outcome.as_ref());
        assert_eq!(h.ctx.pool.stats().discarded, 1);
        assert_eq!(h.ctx.progress.counts().interrupted, 1);
        assert_eq!(h.ctx.progress.counts().completed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn finish_interrupts_after_grace() {
        let factory = MockVuFactory::builder()
            .iteration_duration(Duration::from_secs(600))
            .build()
            .unwrap();
        let mut h = harness(Arc::new(factory), 2);
        h.ctx.graceful_stop = Duration::from_secs(5);
        let soft = CancellationToken::new();
        let hard = CancellationToken::new();
        let counter = Arc::new(AtomicU64::new(0));

        let mut workers = JoinSet::new();
        for _ in 0..2 {
            workers.spawn(vu_loop(
                h.ctx.clone(),
                soft.clone(),
                hard.clone(),
                unbounded(Arc::clone(&counter)),
            ));
        }
        tokio::time::sleep(Duration::from_secs(1)).await;

        let start = Instant::now();
        finish(&h.ctx, &mut workers, Ok(()), &soft, &hard)
            .await
            .unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(5));
        assert_eq!(h.ctx.progress.counts().interrupted, 2);
        assert_eq!(h.ctx.pool.stats().held, 0);
    }
}
