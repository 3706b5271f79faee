//! The synchronous control surface of a running test.
//!
//! Every call returns immediately with the current [`Status`]; failures are
//! reported as [`ControlError`] and never affect the run itself.
use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    engine::MetricsEngine,
    error::ControlError,
    pipeline::{PipelineMonitor, PipelineStatus},
    scheduler::{RunPhase, ScenarioStatus, Scheduler},
};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub phase: RunPhase,
    pub paused: bool,
    #[serde(rename = "activeVUs")]
    pub active_vus: usize,
    #[serde(rename = "vusMax")]
    pub vus_max: usize,
    #[serde(with = "crate::config::duration")]
    pub elapsed: Duration,
    /// As of the last threshold evaluation.
    pub thresholds_failed: Vec<String>,
    pub scenarios: Vec<ScenarioStatus>,
    pub pipeline: PipelineStatus,
}

/// Requested changes; absent fields are left alone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    #[serde(default)]
    pub paused: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct ControlSurface {
    scheduler: Arc<Scheduler>,
    engine: Arc<MetricsEngine>,
    pipeline: PipelineMonitor,
}

impl ControlSurface {
    pub(crate) fn new(
        scheduler: Arc<Scheduler>,
        engine: Arc<MetricsEngine>,
        pipeline: PipelineMonitor,
    ) -> Self {
        Self {
            scheduler,
            engine,
            pipeline,
        }
    }

    pub fn get_status(&self) -> Status {
        let s = self.scheduler.status();
        Status {
            phase: s.phase,
            paused: s.paused,
            active_vus: s.active_vus,
            vus_max: s.vus_max,
            elapsed: s.elapsed,
            thresholds_failed: self.engine.failed_thresholds(),
            scenarios: s.scenarios,
            pipeline: self.pipeline.status(),
        }
    }

    pub fn set_status(&self, update: StatusUpdate) -> Result<Status, ControlError> {
        match update.paused {
            Some(true) => self.scheduler.pause()?,
            Some(false) => self.scheduler.resume()?,
            None => {}
        }
        Ok(self.get_status())
    }

    /// Requests a stop without waiting for it.
    pub fn request_stop(&self, graceful: bool) -> Status {
        self.scheduler.request_stop(graceful);
        self.get_status()
    }

    /// Stops the run and waits until it is over.
    pub async fn stop(&self, graceful: bool) -> Status {
        self.scheduler.stop(graceful).await;
        self.get_status()
    }

    /// Resolves once the run reaches `phase`, or a terminal phase.
    pub async fn wait_for(&self, phase: RunPhase) -> RunPhase {
        let mut rx = self.scheduler.subscribe();
        match rx.wait_for(|p| *p == phase || p.is_terminal()).await {
            Ok(p) => *p,
            Err(_) => self.scheduler.phase(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::TestOptions,
        executor::{ConstantVus, ExecutorConfig},
        metric::Registry,
        mock::MockVuFactory,
        run::TestRun,
        scenario::Scenario,
    };

    fn run(pausable: bool) -> (TestRun, MockVuFactory) {
        let options = TestOptions::default().with_scenario(
            Scenario::builder()
                .name("steady")
                .executor(ExecutorConfig::ConstantVus(ConstantVus {
                    vus: 3,
                    duration: Duration::from_secs(10),
                }))
                .pausable(pausable)
                .build(),
        );
        let factory = MockVuFactory::builder()
            .iteration_duration(Duration::from_millis(300))
            .build()
            .unwrap();
        let run = TestRun::new(options, Arc::new(Registry::new()), Arc::new(factory.clone())).unwrap();
        (run, factory)
    }

    #[tokio::test(start_paused = true)]
    async fn status_before_start() {
        let control = run(true).0.control_surface();
        let status = control.get_status();
        assert_eq!(status.phase, RunPhase::Initialized);
        assert_eq!(status.active_vus, 0);
        assert!(status.thresholds_failed.is_empty());
        assert_eq!(
            control.set_status(StatusUpdate { paused: Some(true) }),
            Err(ControlError::NotActive(RunPhase::Initialized))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn pause_resume_and_stop() {
        let (run, factory) = run(true);
        let control = run.control_surface();
        let handle = tokio::spawn(run.run());
        assert_eq!(control.wait_for(RunPhase::Running).await, RunPhase::Running);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(control.get_status().active_vus, 3);

        let status = control.set_status(StatusUpdate { paused: Some(true) }).unwrap();
        assert!(status.paused);
        assert_eq!(status.phase, RunPhase::Paused);
        tokio::time::sleep(Duration::from_secs(5)).await;
        // in-flight iterations finished and no new ones started, the VUs
        // themselves stay checked out
        let paused = factory.stats();
        assert_eq!(paused.active, 0);
        assert_eq!(control.get_status().active_vus, 3);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(factory.stats().iterations, paused.iterations);

        let status = control.set_status(StatusUpdate { paused: Some(false) }).unwrap();
        assert_eq!(status.phase, RunPhase::Running);

        let first = control.stop(true).await;
        let second = control.stop(true).await;
        assert_eq!(first.phase, RunPhase::Stopped);
        assert_eq!(second.phase, first.phase);
        assert_eq!(second.scenarios, first.scenarios);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unpausable_runs_reject_pause() {
        let (run, _) = run(false);
        let control = run.control_surface();
        let handle = tokio::spawn(run.run());
        control.wait_for(RunPhase::Running).await;

        let err = control
            .set_status(StatusUpdate { paused: Some(true) })
            .unwrap_err();
        assert_eq!(err, ControlError::PauseNotSupported(vec!["steady".into()]));
        assert_eq!(control.get_status().phase, RunPhase::Running);

        control.request_stop(false);
        let outcome = handle.await.unwrap();
        assert_eq!(outcome.summary.phase, RunPhase::Stopped);
    }
}
