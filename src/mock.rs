//! A configurable [`VuFactory`] for tests and dry runs.
//!
//! ```rust, ignore
//! let factory = MockVuFactory::builder()
//!     .iteration_duration(Duration::from_millis(50))
//!     .on_iteration(|ctx| vec![ctx.sample(&ctx.builtins.http_req_failed, 0.0)])
//!     .build()?;
//! ```
use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;

use crate::{
    error::{ConfigError, IterationError},
    event::Events,
    metric::Sample,
    vu::{IterationContext, Vu, VuFactory},
};

type OnIteration = Arc<dyn Fn(&IterationContext) -> Vec<Sample> + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MockStats {
    pub created: u64,
    /// Iterations started.
    pub iterations: u64,
    /// Iterations in flight right now.
    pub active: u64,
    /// Highest number of iterations in flight at once.
    pub peak: u64,
}

#[derive(Default)]
struct Counters {
    created: AtomicU64,
    iterations: AtomicU64,
    active: AtomicU64,
    peak: AtomicU64,
}

enum Outcomes {
    /// Indexed by the factory-wide iteration number. Iterations past the end
    /// succeed.
    Script(Vec<Result<(), IterationError>>),
    Constant(Result<(), IterationError>),
}

impl Outcomes {
    fn get(&self, n: u64) -> Result<(), IterationError> {
        match self {
            Self::Script(script) => usize::try_from(n)
                .ok()
                .and_then(|n| script.get(n))
                .cloned()
                .unwrap_or(Ok(())),
            Self::Constant(outcome) => outcome.clone(),
        }
    }
}

struct Inner {
    outcomes: Outcomes,
    iteration_duration: Duration,
    on_iteration: Option<OnIteration>,
    init_error: Option<IterationError>,
    counters: Counters,
}

#[derive(Clone)]
pub struct MockVuFactory {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for MockVuFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockVuFactory")
            .field("iteration_duration", &self.inner.iteration_duration)
            .field("stats", &self.stats())
            .finish()
    }
}

impl MockVuFactory {
    pub fn builder() -> MockVuFactoryBuilder {
        MockVuFactoryBuilder::default()
    }

    pub fn stats(&self) -> MockStats {
        let c = &self.inner.counters;
        MockStats {
            created: c.created.load(Ordering::Relaxed),
            iterations: c.iterations.load(Ordering::Relaxed),
            active: c.active.load(Ordering::Relaxed),
            peak: c.peak.load(Ordering::Relaxed),
        }
    }
}

/// Builder for [`MockVuFactory`]; invalid combinations are reported by
/// [`build`](Self::build).
#[derive(Default)]
pub struct MockVuFactoryBuilder {
    script: Option<Vec<Result<(), IterationError>>>,
    outcome: Option<Result<(), IterationError>>,
    iteration_duration: Duration,
    on_iteration: Option<OnIteration>,
    init_error: Option<IterationError>,
}

impl MockVuFactoryBuilder {
    /// Outcomes of successive iterations across all VUs.
    pub fn script(mut self, script: Vec<Result<(), IterationError>>) -> Self {
        self.script = Some(script);
        self
    }

    /// Outcome of every iteration.
    pub fn outcome(mut self, outcome: Result<(), IterationError>) -> Self {
        self.outcome = Some(outcome);
        self
    }

    pub fn iteration_duration(mut self, duration: Duration) -> Self {
        self.iteration_duration = duration;
        self
    }

    /// Samples emitted at the end of each iteration.
    pub fn on_iteration<F>(mut self, f: F) -> Self
    where
        F: Fn(&IterationContext) -> Vec<Sample> + Send + Sync + 'static,
    {
        self.on_iteration = Some(Arc::new(f));
        self
    }

    /// Makes every VU creation fail.
    pub fn init_error(mut self, err: IterationError) -> Self {
        self.init_error = Some(err);
        self
    }

    pub fn build(self) -> Result<MockVuFactory, ConfigError> {
        let outcomes = match (self.script, self.outcome) {
            (Some(_), Some(_)) => {
                return Err(ConfigError::InvalidMock(
                    "script and outcome are mutually exclusive".into(),
                ));
            }
            (Some(script), None) if script.is_empty() => {
                return Err(ConfigError::InvalidMock("script must not be empty".into()));
            }
            (Some(script), None) => Outcomes::Script(script),
            (None, outcome) => Outcomes::Constant(outcome.unwrap_or(Ok(()))),
        };
        Ok(MockVuFactory {
            inner: Arc::new(Inner {
                outcomes,
                iteration_duration: self.iteration_duration,
                on_iteration: self.on_iteration,
                init_error: self.init_error,
                counters: Counters::default(),
            }),
        })
    }
}

struct MockVu {
    id: u64,
    events: Events,
    inner: Arc<Inner>,
}

/// Decrements the in-flight count, also when the iteration is dropped.
struct Active<'a>(&'a Counters);

impl<'a> Active<'a> {
    fn enter(counters: &'a Counters) -> Self {
        let now = counters.active.fetch_add(1, Ordering::AcqRel) + 1;
        counters.peak.fetch_max(now, Ordering::AcqRel);
        Self(counters)
    }
}

impl Drop for Active<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::AcqRel);
    }
}

#[async_trait]
impl Vu for MockVu {
    fn id(&self) -> u64 {
        self.id
    }

    fn events(&self) -> &Events {
        &self.events
    }

    async fn run_iteration(&mut self, ctx: &IterationContext) -> Result<(), IterationError> {
        let counters = &self.inner.counters;
        let n = counters.iterations.fetch_add(1, Ordering::AcqRel);
        let _active = Active::enter(counters);

        if !self.inner.iteration_duration.is_zero() {
            tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(IterationError::Interrupted),
                _ = tokio::time::sleep(self.inner.iteration_duration) => {}
            }
        }
        if let Some(on_iteration) = &self.inner.on_iteration {
            let samples = on_iteration(ctx);
            ctx.emit(samples)
                .await
                .map_err(|e| IterationError::Failed(e.to_string()))?;
        }
        self.inner.outcomes.get(n)
    }
}

#[async_trait]
impl VuFactory for MockVuFactory {
    async fn new_vu(&self, id: u64, events: Events) -> Result<Box<dyn Vu>, IterationError> {
        if let Some(err) = &self.inner.init_error {
            return Err(err.clone());
        }
        self.inner.counters.created.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MockVu {
            id,
            events,
            inner: Arc::clone(&self.inner),
        }))
    }
}
