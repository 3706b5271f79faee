//! Arrival-rate executors: iterations start at a configured rate, whether or
//! not previous ones have finished.
//!
//! Pacing is done by a token governor driven by rate legs. Each leg ramps
//! linearly from a start rate to an end rate over its duration. At every `tick`
//! the governor interpolates the instantaneous rate and turns it into a whole
//! number of iteration starts:
//!
//! ```text
//! t = elapsed / duration
//! r(t) = start_rate + (end_rate - start_rate) * t
//! add_f = r(t) * tick_seconds
//! add_total = floor(add_f + fractional)
//! fractional = (add_f + fractional) - add_total
//! ```
//!
//! The fractional carry keeps the long-term average exact. Each token needs a
//! free VU slot right away: when the pool is exhausted the iteration is
//! counted in `dropped_iterations` instead of being queued.
use std::{
    sync::{Arc, atomic::{AtomicU64, Ordering}},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::{
    Executor, ExecutorContext, Stage, Workers, finish, join_result, run_iteration,
};
use crate::{
    config::duration,
    error::{ExecutorError, PoolError},
    metric::Sample,
    pool::VuReservation,
    segment::ExecutionSegment,
};
use internals::*;

/// Governor granularity.
pub const TICK: Duration = Duration::from_millis(10);

fn one_second() -> Duration {
    Duration::from_secs(1)
}

/// A fixed number of iteration starts per `timeUnit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConstantArrivalRate {
    pub rate: u64,
    #[serde(with = "duration", default = "one_second")]
    pub time_unit: Duration,
    #[serde(with = "duration")]
    pub duration: Duration,
    #[serde(rename = "preAllocatedVUs")]
    pub pre_allocated_vus: u64,
    /// Defaults to `preAllocatedVUs`.
    #[serde(rename = "maxVUs", default)]
    pub max_vus: Option<u64>,
}

/// Iteration starts per `timeUnit` following a list of stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RampingArrivalRate {
    #[serde(default)]
    pub start_rate: u64,
    #[serde(with = "duration", default = "one_second")]
    pub time_unit: Duration,
    pub stages: Vec<Stage>,
    #[serde(rename = "preAllocatedVUs")]
    pub pre_allocated_vus: u64,
    #[serde(rename = "maxVUs", default)]
    pub max_vus: Option<u64>,
}

fn check_vus(pre_allocated: u64, max: Option<u64>, time_unit: Duration) -> Result<(), String> {
    if time_unit.is_zero() {
        return Err("timeUnit must be greater than 0".into());
    }
    if max.is_some_and(|max| max < pre_allocated) {
        return Err("maxVUs must not be lower than preAllocatedVUs".into());
    }
    if max.unwrap_or(pre_allocated) == 0 {
        return Err("at least one VU must be allowed".into());
    }
    Ok(())
}

fn pool_size(pre_allocated: u64, max: Option<u64>, segment: &ExecutionSegment) -> u64 {
    segment.scale(max.unwrap_or(pre_allocated).max(pre_allocated))
}

/// Iterations started by a leg, as a fraction `numerator / (2 * unit_ns)`.
fn leg_area(start: u64, end: u64, duration: Duration) -> u128 {
    (u128::from(start) + u128::from(end)) * duration.as_nanos()
}

impl Executor for ConstantArrivalRate {
    fn validate(&self) -> Result<(), String> {
        check_vus(self.pre_allocated_vus, self.max_vus, self.time_unit)?;
        if self.duration.is_zero() {
            return Err("duration must be greater than 0".into());
        }
        Ok(())
    }

    fn planned_iterations(&self, segment: &ExecutionSegment) -> Option<u64> {
        let total = u128::from(self.rate) * self.duration.as_nanos() / self.time_unit.as_nanos();
        Some(segment.scale(u64::try_from(total).unwrap_or(u64::MAX)))
    }

    fn max_vus(&self, segment: &ExecutionSegment) -> u64 {
        pool_size(self.pre_allocated_vus, self.max_vus, segment)
    }

    fn max_duration(&self) -> Duration {
        self.duration
    }

    async fn run(&self, ctx: ExecutorContext) -> Result<(), ExecutorError> {
        let rate = per_second(self.rate, self.time_unit, &ctx.segment);
        let legs = vec![Leg {
            duration: self.duration,
            start_rate: rate,
            end_rate: rate,
        }];
        run_governed(&ctx, legs, self.pre_allocated_vus).await
    }
}

impl Executor for RampingArrivalRate {
    fn validate(&self) -> Result<(), String> {
        check_vus(self.pre_allocated_vus, self.max_vus, self.time_unit)?;
        if self.stages.is_empty() {
            return Err("at least one stage is required".into());
        }
        if self.max_duration().is_zero() {
            return Err("total stage duration must be greater than 0".into());
        }
        Ok(())
    }

    fn planned_iterations(&self, segment: &ExecutionSegment) -> Option<u64> {
        let mut rate = self.start_rate;
        let mut area = 0u128;
        for stage in &self.stages {
            area += leg_area(rate, stage.target, stage.duration);
            rate = stage.target;
        }
        let total = area / (2 * self.time_unit.as_nanos());
        Some(segment.scale(u64::try_from(total).unwrap_or(u64::MAX)))
    }

    fn max_vus(&self, segment: &ExecutionSegment) -> u64 {
        pool_size(self.pre_allocated_vus, self.max_vus, segment)
    }

    fn max_duration(&self) -> Duration {
        self.stages.iter().map(|s| s.duration).sum()
    }

    async fn run(&self, ctx: ExecutorContext) -> Result<(), ExecutorError> {
        let mut legs = Vec::with_capacity(self.stages.len());
        let mut rate = per_second(self.start_rate, self.time_unit, &ctx.segment);
        for stage in &self.stages {
            let target = per_second(stage.target, self.time_unit, &ctx.segment);
            // zero-length stages only move the rate the next leg starts from
            if !stage.duration.is_zero() {
                legs.push(Leg {
                    duration: stage.duration,
                    start_rate: rate,
                    end_rate: target,
                });
            }
            rate = target;
        }
        run_governed(&ctx, legs, self.pre_allocated_vus).await
    }
}

fn per_second(rate: u64, time_unit: Duration, segment: &ExecutionSegment) -> f64 {
    segment.scale_rate(rate as f64 / time_unit.as_secs_f64())
}

async fn run_governed(
    ctx: &ExecutorContext,
    legs: Vec<Leg>,
    pre_allocated: u64,
) -> Result<(), ExecutorError> {
    let soft = ctx.control.soft.child_token();
    let hard = ctx.control.hard.child_token();
    ctx.pool
        .preallocate(ctx.segment.scale(pre_allocated) as usize)
        .await
        .map_err(|e| ctx.pool_error(e))?;

    tracing::info!(scenario = %ctx.scenario, legs = legs.len(), max_vus = ctx.pool.max(), "starting arrival-rate governor");
    let mut workers = JoinSet::new();
    let outcome = govern(ctx, legs, &soft, &hard, &mut workers).await;
    finish(ctx, &mut workers, outcome, &soft, &hard).await
}

async fn govern(
    ctx: &ExecutorContext,
    legs: Vec<Leg>,
    soft: &CancellationToken,
    hard: &CancellationToken,
    workers: &mut Workers,
) -> Result<(), ExecutorError> {
    let sw = ctx.control.pause.stopwatch();
    let started = AtomicU64::new(0);
    let mut fractional = 0.0;
    let mut leg_start = Duration::ZERO;

    for (i, leg) in legs.iter().enumerate() {
        tracing::debug!(scenario = %ctx.scenario, leg = i, from = leg.start_rate, to = leg.end_rate, "starting leg");
        let mut elapsed = Duration::ZERO;
        while elapsed < leg.duration {
            let (tokens, f) = calc_token_limit(
                elapsed,
                leg.duration,
                leg.start_rate,
                leg.end_rate,
                fractional,
                TICK,
            );
            fractional = f;

            let mut dropped = 0;
            for n in 0..tokens {
                match ctx.pool.try_acquire() {
                    Ok(Some(slot)) => {
                        let id = started.fetch_add(1, Ordering::Relaxed);
                        workers.spawn(one_shot(ctx.clone(), slot, hard.clone(), id));
                    }
                    Ok(None) => {
                        dropped = (tokens - n) as u64;
                        break;
                    }
                    Err(err) => return Err(ctx.pool_error(err)),
                }
            }
            if dropped > 0 {
                record_dropped(ctx, dropped).await;
            }

            elapsed += TICK;
            let deadline = sw.wait_until(leg_start + elapsed);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    _ = &mut deadline => break,
                    _ = soft.cancelled() => return Ok(()),
                    Some(res) = workers.join_next() => join_result(&ctx.scenario, res)?,
                }
            }
        }
        leg_start += leg.duration;
    }
    Ok(())
}

/// Runs a single iteration on a VU taken from a reserved slot.
async fn one_shot(
    ctx: ExecutorContext,
    slot: VuReservation,
    hard: CancellationToken,
    scenario_iteration: u64,
) -> Result<(), ExecutorError> {
    let mut vu = match tokio::time::timeout(ctx.vu_timeout, slot.checkout()).await {
        Ok(Ok(vu)) => vu,
        Ok(Err(err)) => return Err(ctx.pool_error(err)),
        Err(_) => return Err(ctx.pool_error(PoolError::AllocationTimeout(ctx.vu_timeout))),
    };
    let outcome = run_iteration(&ctx, &mut vu, &hard, scenario_iteration).await?;
    vu.release(outcome.as_ref());
    Ok(())
}

async fn record_dropped(ctx: &ExecutorContext, dropped: u64) {
    tracing::debug!(scenario = %ctx.scenario, dropped, "insufficient VUs, dropping iterations");
    ctx.progress.add_dropped(dropped);
    let sample = Sample::new(
        &ctx.builtins.dropped_iterations,
        dropped as f64,
        ctx.tags.clone(),
    );
    if ctx.emitter.send_one(sample).await.is_err() {
        tracing::trace!(scenario = %ctx.scenario, "sample pipeline closed");
    }
}

#[cfg(feature = "internals")]
pub use internals::*;

pub(super) mod internals {
    use super::*;

    /// The semaphore implementation uses 3 bits of usize for flags.
    /// Token counts are capped to this so a huge rate cannot overflow it.
    pub const MAX_TOKENS: usize = usize::MAX >> 3;

    /// A linear rate ramp, in iterations per second.
    #[derive(Debug, Clone, Copy, PartialEq)]
    pub struct Leg {
        pub duration: Duration,
        pub start_rate: f64,
        pub end_rate: f64,
    }

    /// Pure function to calculate the number of iterations to start this
    /// tick.
    ///
    /// Returns `(tokens_to_add, next_fractional_part)`.
    pub fn calc_token_limit(
        elapsed: Duration,
        leg_duration: Duration,
        start_rate: f64,
        end_rate: f64,
        fractional: f64,
        tick: Duration,
    ) -> (usize, f64) {
        let t = (elapsed.as_secs_f64() / leg_duration.as_secs_f64()).min(1.0);
        let tick_rate = start_rate + (end_rate - start_rate) * t;
        let add_f = tick_rate * tick.as_secs_f64() + fractional;

        let whole = add_f.floor();
        let fractional = add_f - whole;
        let tokens = if whole >= MAX_TOKENS as f64 {
            MAX_TOKENS
        } else if whole < 0.0 {
            0
        } else {
            whole as usize
        };
        (tokens, fractional)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{executor::testing::harness, mock::MockVuFactory};

    const TICK_100MS: Duration = Duration::from_millis(100);

    mod calc_token_limit {
        use super::*;

        fn at(elapsed_s: u64, start: f64, end: f64) -> (usize, f64) {
            calc_token_limit(
                Duration::from_secs(elapsed_s),
                Duration::from_secs(10),
                start,
                end,
                0.0,
                TICK_100MS,
            )
        }

        #[test]
        fn interpolates_linearly() {
            let cases = [
                // (elapsed, start, end, tokens)
                (0, 0.0, 100.0, 0),
                (5, 0.0, 100.0, 5),
                (9, 0.0, 100.0, 9),
                (0, 100.0, 0.0, 10),
                (3, 100.0, 0.0, 7),
                (4, 50.0, 50.0, 5),
                (1, 0.0, 1000.0, 10),
            ];
            for (elapsed, start, end, tokens) in cases {
                assert_eq!(
                    at(elapsed, start, end),
                    (tokens, 0.0),
                    "elapsed={elapsed} {start}->{end}"
                );
            }
        }

        #[test]
        fn carries_fractions() {
            // 2.5 per second at 100ms ticks: one token every fourth tick
            let mut carry = 0.0;
            let mut total = 0;
            for _ in 0..40 {
                let (t, f) = calc_token_limit(
                    Duration::ZERO,
                    Duration::from_secs(10),
                    2.5,
                    2.5,
                    carry,
                    TICK_100MS,
                );
                assert!(t <= 1);
                assert!((0.0..1.0).contains(&f));
                carry = f;
                total += t;
            }
            assert_eq!(total, 10);
        }

        #[test]
        fn past_the_end_holds_the_end_rate() {
            assert_eq!(at(25, 0.0, 100.0), (10, 0.0));
        }

        #[test]
        fn clamps_out_of_range_counts() {
            assert_eq!(at(1, -100.0, -100.0), (0, 0.0));
            let (t, _) = calc_token_limit(
                Duration::from_secs(1),
                Duration::from_secs(1),
                f64::MAX,
                f64::MAX,
                0.0,
                Duration::from_secs(1),
            );
            assert_eq!(t, MAX_TOKENS);
        }
    }

    #[test]
    fn planned_iterations_follow_the_rate_area() {
        let constant = ConstantArrivalRate {
            rate: 30,
            time_unit: Duration::from_secs(60),
            duration: Duration::from_secs(120),
            pre_allocated_vus: 5,
            max_vus: None,
        };
        assert_eq!(constant.planned_iterations(&ExecutionSegment::full()), Some(60));

        let ramping = RampingArrivalRate {
            start_rate: 0,
            time_unit: Duration::from_secs(1),
            stages: vec![
                Stage::new(Duration::from_secs(10), 10),
                Stage::new(Duration::from_secs(10), 10),
            ],
            pre_allocated_vus: 5,
            max_vus: Some(10),
        };
        let full = ramping.planned_iterations(&ExecutionSegment::full());
        assert_eq!(full, Some(150));
        let a = ramping.planned_iterations(&"0:1/3".parse().unwrap()).unwrap();
        let b = ramping.planned_iterations(&"1/3:1".parse().unwrap()).unwrap();
        assert_eq!(a + b, 150);
        assert_eq!(ramping.max_vus(&ExecutionSegment::full()), 10);
    }

    #[test]
    fn validation() {
        let ok = ConstantArrivalRate {
            rate: 1,
            time_unit: Duration::from_secs(1),
            duration: Duration::from_secs(1),
            pre_allocated_vus: 2,
            max_vus: None,
        };
        assert!(ok.validate().is_ok());
        let lower_max = ConstantArrivalRate {
            max_vus: Some(1),
            ..ok.clone()
        };
        assert!(lower_max.validate().is_err());
        let no_unit = ConstantArrivalRate {
            time_unit: Duration::ZERO,
            ..ok
        };
        assert!(no_unit.validate().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn starts_iterations_at_the_configured_rate() {
        let factory = Arc::new(
            MockVuFactory::builder()
                .iteration_duration(Duration::from_millis(5))
                .build()
                .unwrap(),
        );
        let h = harness(factory.clone(), 5);
        let cfg = ConstantArrivalRate {
            rate: 50,
            time_unit: Duration::from_secs(1),
            duration: Duration::from_secs(1),
            pre_allocated_vus: 5,
            max_vus: None,
        };
        cfg.run(h.ctx.clone()).await.unwrap();

        let counts = h.ctx.progress.counts();
        assert_eq!(counts.completed, 50);
        assert_eq!(counts.dropped, 0);
        assert!(factory.stats().created <= 5);
    }

    #[tokio::test(start_paused = true)]
    async fn drops_iterations_instead_of_queueing() {
        let factory = Arc::new(
            MockVuFactory::builder()
                .iteration_duration(Duration::from_secs(10))
                .build()
                .unwrap(),
        );
        let mut h = harness(factory.clone(), 2);
        let cfg = ConstantArrivalRate {
            rate: 50,
            time_unit: Duration::from_secs(1),
            duration: Duration::from_secs(1),
            pre_allocated_vus: 2,
            max_vus: None,
        };
        cfg.run(h.ctx.clone()).await.unwrap();

        let counts = h.ctx.progress.counts();
        assert_eq!(counts.completed, 2);
        assert_eq!(counts.dropped, 48);
        assert_eq!(factory.stats().peak, 2);

        drop(h.ctx);
        let mut dropped = 0.0;
        let mut buf = Vec::new();
        while h.rx.recv_many(64, &mut buf).await {
            dropped += buf
                .drain(..)
                .filter(|s| s.name() == "dropped_iterations")
                .map(|s| s.value)
                .sum::<f64>();
        }
        assert_eq!(dropped, 48.0);
    }
}
