//! Stampede: a load-generation engine.
//!
//! A test is a set of named scenarios. Each scenario drives virtual users (VUs)
//! with one executor, a strategy that decides how concurrency or arrival rate
//! changes over time. Every iteration emits tagged samples into a bounded
//! pipeline; the metrics engine folds them into aggregates and checks
//! thresholds, which may abort the run.
//!
//! # Architecture
//!
//! - [`TestRun`]: validates [`TestOptions`] and wires everything together.
//! - [`Scheduler`]: owns the run lifecycle (`Initialized → Running ⇄ Paused →
//!   Stopping → Stopped | Aborted`) and starts each scenario at its start time.
//! - [`Executor`]: the load shapes. See [`executor`] for the available ones.
//! - [`VuPool`]: bounded set of VUs shared by one scenario's workers.
//! - [`Vu`] and [`VuFactory`]: the contract a workload runtime implements.
//! - [`MetricsEngine`]: sinks, submetrics and threshold evaluation.
//! - [`ControlSurface`]: status, pause, resume and stop, also exposed over
//!   HTTP by [`api`].
//! - [`Reporter`]: publishes the end-of-test [`Summary`].
//!
//! # Feature flags
//! - `api` (default): the axum control API.
//! - `internals`: pacing helpers (token governor math, ramp planning) used by
//!   the executors.
//!
//! # Example
//!
//! ```rust, ignore
//! let options = TestOptions::from_json(r#"{
//!     "scenarios": {"smoke": {"executor": "constant-vus", "vus": 5, "duration": "30s"}},
//!     "thresholds": {"iteration_duration": ["p(95)<500"]}
//! }"#)?;
//! let factory = ActionVuFactory::new(|ctx: IterationContext| async move {
//!     // one iteration of the workload
//!     Ok(())
//! });
//! let outcome = TestRun::new(options, Arc::new(Registry::new()), Arc::new(factory))?
//!     .run()
//!     .await;
//! StdoutReporter.report(&outcome.summary).await?;
//! ```

/// Metric sinks
pub mod aggregate;
/// HTTP control API
#[cfg(feature = "api")]
pub mod api;
/// Response classification for network instrumentation
pub mod classify;
/// Test options
pub mod config;
/// Status, pause and stop
pub mod control;
/// Sample ingestion and threshold evaluation
pub mod engine;
pub mod error;
/// Lifecycle event buses
pub mod event;
/// Load shapes
pub mod executor;
pub mod logging;
/// Metric definitions and samples
pub mod metric;
/// Test double for VUs
pub mod mock;
/// Bounded sample channel
pub mod pipeline;
/// Per-scenario VU pool
pub mod pool;
/// End-of-test summary and reporters
pub mod report;
/// A complete test run
pub mod run;
pub mod scenario;
pub mod scheduler;
/// Execution segments
pub mod segment;
/// Immutable tag sets
pub mod tags;
/// Threshold expressions
pub mod threshold;
/// The VU execution contract
pub mod vu;

pub use config::TestOptions;
pub use control::{ControlSurface, Status, StatusUpdate};
pub use engine::MetricsEngine;
pub use error::{ConfigError, ControlError, ExecutorError, ExitCode, IterationError, RunError};
pub use executor::{Executor, ExecutorConfig, Stage};
pub use metric::{BuiltinMetrics, Metric, MetricKind, Registry, Sample};
pub use pool::VuPool;
pub use report::{JsonReporter, Reporter, StdoutReporter, Summary};
pub use run::{RunOutcome, TestRun, Verdict};
pub use scenario::Scenario;
pub use scheduler::{RunPhase, Scheduler};
pub use segment::ExecutionSegment;
pub use tags::TagSet;
pub use vu::{ActionVuFactory, IterationContext, Vu, VuFactory};
