//! Looping VUs whose number follows a list of stages.
//!
//! The ideal VU count is a piecewise linear function of active time. It is
//! approximated by integer steps placed at the exact instants the ideal line
//! crosses an integer: while ramping up a VU starts once the line reaches it
//! (floor), while ramping down a VU is retired once the line drops below the
//! one above it (ceil). The running count therefore never differs from the
//! ideal by a full VU, and the plan only depends on the configuration and the
//! execution segment.
use std::{
    sync::{Arc, atomic::AtomicU64},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::{
    Executor, ExecutorContext, Stage, Workers, finish, join_result, unbounded, vu_loop,
};
use crate::{config::duration, error::ExecutorError, segment::ExecutionSegment};
use internals::*;

fn default_graceful_ramp_down() -> Duration {
    Duration::from_secs(30)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RampingVus {
    #[serde(rename = "startVUs", default)]
    pub start_vus: u64,
    pub stages: Vec<Stage>,
    /// How long a retired VU may keep running its current iteration.
    #[serde(with = "duration", default = "default_graceful_ramp_down")]
    pub graceful_ramp_down: Duration,
}

impl RampingVus {
    fn scaled(&self, segment: &ExecutionSegment) -> (u64, Vec<Stage>) {
        let stages = self
            .stages
            .iter()
            .map(|s| Stage::new(s.duration, segment.scale(s.target)))
            .collect();
        (segment.scale(self.start_vus), stages)
    }
}

impl Executor for RampingVus {
    fn validate(&self) -> Result<(), String> {
        if self.stages.is_empty() {
            return Err("at least one stage is required".into());
        }
        if self.max_duration().is_zero() {
            return Err("total stage duration must be greater than 0".into());
        }
        Ok(())
    }

    fn planned_iterations(&self, _: &ExecutionSegment) -> Option<u64> {
        None
    }

    /// Retired VUs keep their slot while they finish, so the pool must also
    /// fit every VU still inside its `gracefulRampDown` window.
    fn max_vus(&self, segment: &ExecutionSegment) -> u64 {
        let (start, stages) = self.scaled(segment);
        peak_vus(&ramp_steps(start, &stages), self.graceful_ramp_down)
    }

    fn max_duration(&self) -> Duration {
        self.stages.iter().map(|s| s.duration).sum()
    }

    async fn run(&self, ctx: ExecutorContext) -> Result<(), ExecutorError> {
        let (start, stages) = self.scaled(&ctx.segment);
        let plan = ramp_steps(start, &stages);
        let end = self.max_duration();
        let soft = ctx.control.soft.child_token();
        let hard = ctx.control.hard.child_token();
        ctx.pool
            .preallocate(start as usize)
            .await
            .map_err(|e| ctx.pool_error(e))?;

        tracing::info!(scenario = %ctx.scenario, steps = plan.len(), max_vus = self.max_vus(&ctx.segment), "starting ramping VUs");
        let sw = ctx.control.pause.stopwatch();
        let mut ramp = Ramp {
            ctx: &ctx,
            soft: &soft,
            hard: &hard,
            grace: self.graceful_ramp_down,
            counter: Arc::new(AtomicU64::new(0)),
            workers: JoinSet::new(),
            retire: Vec::new(),
        };

        let mut plan = plan.into_iter().peekable();
        let outcome = loop {
            let next_at = plan.peek().map_or(end, |s| s.offset);
            tokio::select! {
                _ = soft.cancelled() => break Ok(()),
                Some(res) = ramp.workers.join_next() => {
                    if let Err(err) = join_result(&ctx.scenario, res) {
                        break Err(err);
                    }
                }
                _ = sw.wait_until(next_at) => match plan.next() {
                    Some(step) => ramp.scale_to(step.vus),
                    None => break Ok(()),
                },
            }
        };

        finish(&ctx, &mut ramp.workers, outcome, &soft, &hard).await
    }
}

struct Ramp<'a> {
    ctx: &'a ExecutorContext,
    soft: &'a CancellationToken,
    hard: &'a CancellationToken,
    grace: Duration,
    counter: Arc<AtomicU64>,
    workers: Workers,
    /// One token per running VU, most recent last.
    retire: Vec<CancellationToken>,
}

impl Ramp<'_> {
    fn scale_to(&mut self, vus: u64) {
        let current = self.retire.len() as u64;
        tracing::debug!(scenario = %self.ctx.scenario, from = current, to = vus, "ramping");
        for _ in current..vus {
            self.spawn();
        }
        for _ in vus..current {
            if let Some(token) = self.retire.pop() {
                token.cancel();
            }
        }
    }

    fn spawn(&mut self) {
        let retire = CancellationToken::new();
        let soft = self.soft.child_token();
        let hard = self.hard.child_token();
        let ctx = self.ctx.clone();
        let next = unbounded(Arc::clone(&self.counter));
        let grace = self.grace;
        let token = retire.clone();
        self.workers.spawn(async move {
            // A retired VU stops starting iterations and gets `grace` to finish
            // the current one.
            let retirement = async {
                retire.cancelled().await;
                soft.cancel();
                tokio::time::sleep(grace).await;
                hard.cancel();
                std::future::pending::<()>().await
            };
            tokio::select! {
                res = vu_loop(ctx, soft.clone(), hard.clone(), next) => res,
                () = retirement => Ok(()),
            }
        });
        self.retire.push(token);
    }
}

#[cfg(feature = "internals")]
pub use internals::*;

pub(super) mod internals {
    use super::*;

    /// A point of the ramp plan: from `offset` of active time on, `vus` VUs
    /// should be running.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RampStep {
        pub offset: Duration,
        pub vus: u64,
    }

    /// Pure function turning stages into the integer steps of the ramp.
    ///
    /// The first step is always `start` at offset zero. Steps falling on the
    /// same instant collapse into the last one.
    pub fn ramp_steps(start: u64, stages: &[Stage]) -> Vec<RampStep> {
        let mut steps = vec![RampStep {
            offset: Duration::ZERO,
            vus: start,
        }];
        let mut push = |offset: Duration, vus: u64| {
            let Some(last) = steps.last_mut() else {
                return;
            };
            if last.offset == offset {
                last.vus = vus;
            } else if last.vus != vus {
                steps.push(RampStep { offset, vus });
            }
        };

        let mut offset = Duration::ZERO;
        let mut from = start;
        for stage in stages {
            let to = stage.target;
            let span = u128::from(from.abs_diff(to));
            let d = stage.duration.as_nanos();
            if d == 0 || span == 0 {
                push(offset, to);
            } else {
                for i in 1..=span {
                    // first instant at which the line reaches `from ± i`
                    let at = (d * i).div_ceil(span);
                    let vus = if to > from {
                        from + i as u64
                    } else {
                        from - i as u64
                    };
                    push(offset + nanos(at), vus);
                }
            }
            offset += stage.duration;
            from = to;
        }
        steps
    }

    /// Most VUs held at once over `steps`, counting each retired VU until
    /// `grace` has passed since its retirement.
    pub fn peak_vus(steps: &[RampStep], grace: Duration) -> u64 {
        let mut retired: Vec<(Duration, u64)> = Vec::new();
        let mut running = 0;
        let mut peak = 0;
        for step in steps {
            if step.vus < running {
                retired.push((step.offset, running - step.vus));
            }
            running = step.vus;
            let draining: u64 = retired
                .iter()
                .filter(|(at, _)| step.offset.saturating_sub(*at) <= grace)
                .map(|(_, n)| n)
                .sum();
            peak = peak.max(running + draining);
        }
        peak
    }

    fn nanos(n: u128) -> Duration {
        Duration::from_nanos(u64::try_from(n).unwrap_or(u64::MAX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{executor::testing::harness, mock::MockVuFactory};
    use proptest::prelude::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn step(offset_ms: u64, vus: u64) -> RampStep {
        RampStep {
            offset: Duration::from_millis(offset_ms),
            vus,
        }
    }

    mod ramp_steps {
        use super::*;

        #[test]
        fn linear_ramp_up_and_down() {
            let steps = ramp_steps(0, &[Stage::new(secs(4), 4), Stage::new(secs(2), 0)]);
            assert_eq!(
                steps,
                vec![
                    step(0, 0),
                    step(1000, 1),
                    step(2000, 2),
                    step(3000, 3),
                    step(4000, 4),
                    step(4500, 3),
                    step(5000, 2),
                    step(5500, 1),
                    step(6000, 0),
                ]
            );
        }

        #[test]
        fn zero_duration_stage_jumps() {
            let steps = ramp_steps(2, &[Stage::new(Duration::ZERO, 5), Stage::new(secs(1), 5)]);
            assert_eq!(steps, vec![step(0, 5)]);
        }

        #[test]
        fn hold_adds_no_steps() {
            let steps = ramp_steps(3, &[Stage::new(secs(10), 3)]);
            assert_eq!(steps, vec![step(0, 3)]);
        }

        #[test]
        fn fast_ramps_collapse_same_instant_steps() {
            // 3 VUs over 1ns: every step lands on 1ns
            let steps = ramp_steps(0, &[Stage::new(Duration::from_nanos(1), 3)]);
            assert_eq!(
                steps,
                vec![
                    step(0, 0),
                    RampStep {
                        offset: Duration::from_nanos(1),
                        vus: 3
                    }
                ]
            );
        }
    }

    fn active_at(steps: &[RampStep], t: Duration) -> u64 {
        steps
            .iter()
            .take_while(|s| s.offset <= t)
            .last()
            .map_or(0, |s| s.vus)
    }

    proptest! {
        #[test]
        fn stays_within_one_vu_of_the_ideal_line(
            start in 0u64..50,
            stages in prop::collection::vec((1u64..20_000, 0u64..50), 1..5),
            pick in any::<prop::sample::Index>(),
            frac in 0.001f64..0.999,
        ) {
            let stages: Vec<Stage> = stages
                .into_iter()
                .map(|(ms, target)| Stage::new(Duration::from_millis(ms), target))
                .collect();
            let steps = ramp_steps(start, &stages);

            let i = pick.index(stages.len());
            let offset: Duration = stages[..i].iter().map(|s| s.duration).sum();
            let from = if i == 0 { start } else { stages[i - 1].target } as f64;
            let to = stages[i].target as f64;
            let t = offset + stages[i].duration.mul_f64(frac);
            let progress = (t - offset).as_secs_f64() / stages[i].duration.as_secs_f64();
            let ideal = from + (to - from) * progress;

            let vus = active_at(&steps, t) as f64;
            prop_assert!((vus - ideal).abs() < 1.0 + 1e-6, "t={t:?} vus={vus} ideal={ideal}");
            if to >= from {
                prop_assert!(vus <= ideal + 1e-6);
            }
        }
    }

    #[test]
    fn retired_vus_count_until_their_grace_ends() {
        // down at 3s and 4s, back up at 5s and 6s
        let steps = ramp_steps(
            0,
            &[Stage::new(secs(2), 2), Stage::new(secs(2), 0), Stage::new(secs(2), 2)],
        );
        assert_eq!(peak_vus(&steps, Duration::ZERO), 2);
        assert_eq!(peak_vus(&steps, secs(1)), 2);
        assert_eq!(peak_vus(&steps, secs(2)), 3);
        assert_eq!(peak_vus(&steps, secs(30)), 4);
    }

    #[test]
    fn max_vus_and_duration() {
        let cfg = RampingVus {
            start_vus: 2,
            stages: vec![Stage::new(secs(10), 10), Stage::new(secs(5), 4)],
            graceful_ramp_down: secs(30),
        };
        assert_eq!(cfg.max_vus(&ExecutionSegment::full()), 10);
        assert_eq!(cfg.max_vus(&"0:1/2".parse().unwrap()), 5);
        let down_only = RampingVus {
            graceful_ramp_down: Duration::ZERO,
            ..cfg.clone()
        };
        assert_eq!(down_only.max_vus(&ExecutionSegment::full()), 10);
        assert_eq!(cfg.max_duration(), secs(15));
        assert!(cfg.validate().is_ok());
        let empty = RampingVus {
            stages: vec![],
            ..cfg
        };
        assert!(empty.validate().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn ramps_back_up_while_retired_vus_drain() {
        let factory = Arc::new(
            MockVuFactory::builder()
                .iteration_duration(secs(5))
                .build()
                .unwrap(),
        );
        let cfg = RampingVus {
            start_vus: 0,
            stages: vec![
                Stage::new(secs(1), 2),
                Stage::new(Duration::from_millis(100), 0),
                Stage::new(Duration::from_millis(100), 2),
                Stage::new(secs(8), 2),
            ],
            graceful_ramp_down: secs(30),
        };
        let max_vus = cfg.max_vus(&ExecutionSegment::full());
        assert_eq!(max_vus, 4);
        let mut h = harness(factory.clone(), max_vus as usize);
        h.ctx.vu_timeout = secs(2);

        cfg.run(h.ctx.clone()).await.unwrap();

        let stats = factory.stats();
        assert_eq!(stats.peak, 4, "retired and new VUs run side by side");
        assert!(stats.iterations > 2, "{} iterations", stats.iterations);
        assert_eq!(h.ctx.pool.stats().held, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn follows_the_ramp() {
        let factory = Arc::new(
            MockVuFactory::builder()
                .iteration_duration(Duration::from_millis(100))
                .build()
                .unwrap(),
        );
        let h = harness(factory.clone(), 10);
        let cfg = RampingVus {
            start_vus: 0,
            stages: vec![Stage::new(secs(10), 10), Stage::new(secs(10), 0)],
            graceful_ramp_down: secs(1),
        };

        let pool = Arc::clone(&h.ctx.pool);
        let observer = tokio::spawn(async move {
            let mut seen = Vec::new();
            for _ in 0..20 {
                tokio::time::sleep(Duration::from_millis(1050)).await;
                seen.push(pool.stats().held as u64);
            }
            seen
        });
        cfg.run(h.ctx.clone()).await.unwrap();
        let seen = observer.await.unwrap();

        for (i, held) in seen.into_iter().enumerate() {
            let t = 1.05 * (i + 1) as f64;
            let ideal = if t <= 10.0 { t } else { (20.0 - t).max(0.0) };
            assert!(
                (held as f64 - ideal).abs() <= 1.0,
                "at {t}s: {held} VUs, ideal {ideal}"
            );
        }
        assert_eq!(factory.stats().peak, 10);
        assert_eq!(h.ctx.pool.stats().held, 0);
    }
}
