use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;

use super::{Executor, ExecutorContext, finish, supervise, vu_loop};
use crate::{config::duration, error::ExecutorError, segment::ExecutionSegment};

fn one() -> u64 {
    1
}

fn ten_minutes() -> Duration {
    Duration::from_secs(600)
}

/// A fixed number of iterations shared by a fixed number of VUs. Faster VUs
/// run more of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedIterations {
    #[serde(default = "one")]
    pub vus: u64,
    #[serde(default = "one")]
    pub iterations: u64,
    #[serde(with = "duration", default = "ten_minutes")]
    pub max_duration: Duration,
}

/// Every VU runs exactly `iterations` iterations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerVuIterations {
    #[serde(default = "one")]
    pub vus: u64,
    #[serde(default = "one")]
    pub iterations: u64,
    #[serde(with = "duration", default = "ten_minutes")]
    pub max_duration: Duration,
}

fn check(vus: u64, max_duration: Duration) -> Result<(), String> {
    if vus == 0 {
        return Err("vus must be greater than 0".into());
    }
    if max_duration.is_zero() {
        return Err("maxDuration must be greater than 0".into());
    }
    Ok(())
}

impl Executor for SharedIterations {
    fn validate(&self) -> Result<(), String> {
        check(self.vus, self.max_duration)?;
        if self.iterations < self.vus {
            return Err(format!(
                "iterations ({}) must be at least the number of VUs ({})",
                self.iterations, self.vus
            ));
        }
        Ok(())
    }

    fn planned_iterations(&self, segment: &ExecutionSegment) -> Option<u64> {
        Some(segment.scale(self.iterations))
    }

    fn max_vus(&self, segment: &ExecutionSegment) -> u64 {
        segment.scale(self.vus).min(segment.scale(self.iterations))
    }

    fn max_duration(&self) -> Duration {
        self.max_duration
    }

    async fn run(&self, ctx: ExecutorContext) -> Result<(), ExecutorError> {
        let total = ctx.segment.scale(self.iterations);
        let vus = self.max_vus(&ctx.segment);
        let soft = ctx.control.soft.child_token();
        let hard = ctx.control.hard.child_token();
        ctx.pool
            .preallocate(vus as usize)
            .await
            .map_err(|e| ctx.pool_error(e))?;

        tracing::info!(scenario = %ctx.scenario, vus, iterations = total, "starting shared iterations");
        let sw = ctx.control.pause.stopwatch();
        let claimed = Arc::new(AtomicU64::new(0));
        let mut workers = JoinSet::new();
        for _ in 0..vus {
            let claimed = Arc::clone(&claimed);
            let next = move || {
                let n = claimed.fetch_add(1, Ordering::Relaxed);
                (n < total).then_some(n)
            };
            workers.spawn(vu_loop(ctx.clone(), soft.clone(), hard.clone(), next));
        }

        let outcome = supervise(&ctx, &mut workers, sw.wait_until(self.max_duration), &soft).await;
        if sw.elapsed() >= self.max_duration {
            tracing::warn!(scenario = %ctx.scenario, max_duration = ?self.max_duration, "maxDuration reached before all iterations ran");
        }
        finish(&ctx, &mut workers, outcome, &soft, &hard).await
    }
}

impl Executor for PerVuIterations {
    fn validate(&self) -> Result<(), String> {
        check(self.vus, self.max_duration)
    }

    fn planned_iterations(&self, segment: &ExecutionSegment) -> Option<u64> {
        Some(segment.scale(self.vus).saturating_mul(self.iterations))
    }

    fn max_vus(&self, segment: &ExecutionSegment) -> u64 {
        segment.scale(self.vus)
    }

    fn max_duration(&self) -> Duration {
        self.max_duration
    }

    async fn run(&self, ctx: ExecutorContext) -> Result<(), ExecutorError> {
        let vus = self.max_vus(&ctx.segment);
        let soft = ctx.control.soft.child_token();
        let hard = ctx.control.hard.child_token();
        ctx.pool
            .preallocate(vus as usize)
            .await
            .map_err(|e| ctx.pool_error(e))?;

        tracing::info!(scenario = %ctx.scenario, vus, iterations = self.iterations, "starting per-VU iterations");
        let sw = ctx.control.pause.stopwatch();
        let numbering = Arc::new(AtomicU64::new(0));
        let mut workers = JoinSet::new();
        for _ in 0..vus {
            let numbering = Arc::clone(&numbering);
            let mut left = self.iterations;
            let next = move || {
                if left == 0 {
                    return None;
                }
                left -= 1;
                Some(numbering.fetch_add(1, Ordering::Relaxed))
            };
            workers.spawn(vu_loop(ctx.clone(), soft.clone(), hard.clone(), next));
        }

        let outcome = supervise(&ctx, &mut workers, sw.wait_until(self.max_duration), &soft).await;
        finish(&ctx, &mut workers, outcome, &soft, &hard).await
    }
}
