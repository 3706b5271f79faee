use std::{
    sync::{Arc, atomic::AtomicU64},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;

use super::{Executor, ExecutorContext, finish, supervise, unbounded, vu_loop};
use crate::{config::duration, error::ExecutorError, segment::ExecutionSegment};

/// A fixed number of VUs looping for a fixed amount of time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConstantVus {
    #[serde(default = "one")]
    pub vus: u64,
    #[serde(with = "duration")]
    pub duration: Duration,
}

fn one() -> u64 {
    1
}

impl Executor for ConstantVus {
    fn validate(&self) -> Result<(), String> {
        if self.vus == 0 {
            return Err("vus must be greater than 0".into());
        }
        if self.duration.is_zero() {
            return Err("duration must be greater than 0".into());
        }
        Ok(())
    }

    fn planned_iterations(&self, _: &ExecutionSegment) -> Option<u64> {
        None
    }

    fn max_vus(&self, segment: &ExecutionSegment) -> u64 {
        segment.scale(self.vus)
    }

    fn max_duration(&self) -> Duration {
        self.duration
    }

    async fn run(&self, ctx: ExecutorContext) -> Result<(), ExecutorError> {
        let vus = ctx.segment.scale(self.vus);
        let soft = ctx.control.soft.child_token();
        let hard = ctx.control.hard.child_token();
        ctx.pool
            .preallocate(vus as usize)
            .await
            .map_err(|e| ctx.pool_error(e))?;

        tracing::info!(scenario = %ctx.scenario, vus, duration = ?self.duration, "starting constant VUs");
        let sw = ctx.control.pause.stopwatch();
        let counter = Arc::new(AtomicU64::new(0));
        let mut workers = JoinSet::new();
        for _ in 0..vus {
            workers.spawn(vu_loop(
                ctx.clone(),
                soft.clone(),
                hard.clone(),
                unbounded(Arc::clone(&counter)),
            ));
        }

        let outcome = supervise(&ctx, &mut workers, sw.wait_until(self.duration), &soft).await;
        finish(&ctx, &mut workers, outcome, &soft, &hard).await
    }
}
