//! The VU execution contract.
//!
//! The engine never looks inside a VU: it hands one an [`IterationContext`],
//! awaits [`Vu::run_iteration`] and classifies the result. Everything the
//! workload runtime needs (script state, connections, cookie jars) lives behind
//! the trait object.

use std::{future::Future, sync::Arc};

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::{
    error::IterationError,
    event::Events,
    metric::{BuiltinMetrics, Metric, Sample},
    pipeline::{PipelineClosed, SampleSender},
    tags::TagSet,
};

/// Everything an iteration may use while it runs.
#[derive(Debug, Clone)]
pub struct IterationContext {
    pub vu_id: u64,
    /// Iteration number of this VU, starting at 0.
    pub iteration: u64,
    pub scenario: Arc<str>,
    /// Iteration number within the scenario, unique across its VUs.
    pub scenario_iteration: u64,
    pub tags: TagSet,
    /// Cancelled when the iteration must stop right away.
    pub cancel: CancellationToken,
    pub builtins: Arc<BuiltinMetrics>,
    emitter: SampleSender,
}

impl IterationContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        vu_id: u64,
        iteration: u64,
        scenario: Arc<str>,
        scenario_iteration: u64,
        tags: TagSet,
        cancel: CancellationToken,
        builtins: Arc<BuiltinMetrics>,
        emitter: SampleSender,
    ) -> Self {
        Self {
            vu_id,
            iteration,
            scenario,
            scenario_iteration,
            tags,
            cancel,
            builtins,
            emitter,
        }
    }

    /// A sample carrying this iteration's tags.
    pub fn sample(&self, metric: &Arc<Metric>, value: f64) -> Sample {
        Sample::new(metric, value, self.tags.clone())
    }

    /// Sends samples in program order; waits when the pipeline is full.
    pub async fn emit(&self, samples: Vec<Sample>) -> Result<(), PipelineClosed> {
        self.emitter.send(samples).await
    }
}

#[async_trait]
pub trait Vu: Send {
    /// Unique for the whole run.
    fn id(&self) -> u64;

    fn events(&self) -> &Events;

    /// Runs exactly one iteration of the workload.
    async fn run_iteration(&mut self, ctx: &IterationContext) -> Result<(), IterationError>;
}

#[async_trait]
pub trait VuFactory: Send + Sync {
    async fn new_vu(&self, id: u64, events: Events) -> Result<Box<dyn Vu>, IterationError>;
}

type Action =
    Arc<dyn Fn(IterationContext) -> BoxFuture<'static, Result<(), IterationError>> + Send + Sync>;

/// Builds VUs out of a plain async closure.
///
/// ```rust, ignore
/// let factory = ActionVuFactory::new(|ctx: IterationContext| async move {
///     let sample = ctx.sample(&ctx.builtins.checks, 1.0);
///     ctx.emit(vec![sample]).await.ok();
///     Ok(())
/// });
/// ```
#[derive(Clone)]
pub struct ActionVuFactory {
    action: Action,
}

impl ActionVuFactory {
    pub fn new<F, Fut>(action: F) -> Self
    where
        F: Fn(IterationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), IterationError>> + Send + 'static,
    {
        Self {
            action: Arc::new(
                move |ctx: IterationContext| -> BoxFuture<'static, Result<(), IterationError>> {
                    Box::pin(action(ctx))
                },
            ),
        }
    }
}

struct ActionVu {
    id: u64,
    events: Events,
    action: Action,
}

#[async_trait]
impl Vu for ActionVu {
    fn id(&self) -> u64 {
        self.id
    }

    fn events(&self) -> &Events {
        &self.events
    }

    async fn run_iteration(&mut self, ctx: &IterationContext) -> Result<(), IterationError> {
        (self.action)(ctx.clone()).await
    }
}

#[async_trait]
impl VuFactory for ActionVuFactory {
    async fn new_vu(&self, id: u64, events: Events) -> Result<Box<dyn Vu>, IterationError> {
        Ok(Box::new(ActionVu {
            id,
            events,
            action: Arc::clone(&self.action),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{metric::Registry, pipeline};

    #[tokio::test]
    async fn action_vus_run_the_closure() {
        let registry = Registry::new();
        let builtins = Arc::new(BuiltinMetrics::register(&registry).unwrap());
        let (tx, mut rx) = pipeline::channel(8);

        let factory = ActionVuFactory::new(|ctx: IterationContext| async move {
            if ctx.iteration == 1 {
                return Err(IterationError::Failed("second".into()));
            }
            let sample = ctx.sample(&ctx.builtins.checks, 1.0);
            ctx.emit(vec![sample]).await.map_err(|e| IterationError::Failed(e.to_string()))
        });
        let mut vu = factory.new_vu(7, Events::default()).await.unwrap();
        assert_eq!(vu.id(), 7);

        let ctx = |iteration| {
            IterationContext::new(
                7,
                iteration,
                Arc::from("default"),
                iteration,
                TagSet::new().with("scenario", "default"),
                CancellationToken::new(),
                Arc::clone(&builtins),
                tx.clone(),
            )
        };
        assert_eq!(vu.run_iteration(&ctx(0)).await, Ok(()));
        assert!(vu.run_iteration(&ctx(1)).await.is_err());

        let mut buf = Vec::new();
        assert!(rx.recv_many(4, &mut buf).await);
        assert_eq!(buf.len(), 1);
        assert_eq!(buf[0].tags.get("scenario"), Some("default"));
    }
}
