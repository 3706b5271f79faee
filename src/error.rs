use std::time::Duration;

use thiserror::Error;

use crate::scheduler::RunPhase;

/// Problems detected while validating a test before it starts.
///
/// A configuration error means the run never reaches
/// [`RunPhase::Running`](crate::scheduler::RunPhase::Running).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid threshold `{expression}` on `{metric}`: {reason}")]
    InvalidThreshold {
        metric: String,
        expression: String,
        reason: String,
    },

    #[error("threshold references undefined metric `{0}`")]
    UnknownMetric(String),

    #[error("threshold `{expression}` uses `{method}` which is not supported by {kind} metric `{metric}`")]
    UnsupportedAggregation {
        metric: String,
        expression: String,
        method: String,
        kind: String,
    },

    #[error("invalid metric key `{key}`: {reason}")]
    InvalidMetricKey { key: String, reason: String },

    #[error("invalid metric `{name}`: {reason}")]
    InvalidMetric { name: String, reason: String },

    #[error("invalid execution segment: {0}")]
    InvalidSegment(String),

    #[error("scenario `{scenario}`: {reason}")]
    InvalidScenario { scenario: String, reason: String },

    #[error("global limit exceeded: {0}")]
    LimitExceeded(String),

    #[error("invalid expected statuses: {0}")]
    InvalidStatuses(String),

    #[error("invalid mock configuration: {0}")]
    InvalidMock(String),

    #[error("could not parse options: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("could not read options: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    pub fn scenario(scenario: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidScenario {
            scenario: scenario.into(),
            reason: reason.into(),
        }
    }
}

/// Failure returned by a single VU iteration.
///
/// Only [`IterationError::Fatal`] escapes the executor; the other variants are
/// turned into log events and metrics.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IterationError {
    #[error("iteration interrupted")]
    Interrupted,

    #[error("iteration failed: {0}")]
    Failed(String),

    /// The VU can no longer be trusted and must not be reused.
    #[error("VU state corrupted: {0}")]
    Corrupted(String),

    /// Setup failure or explicit abort requested by the workload.
    #[error("fatal workload error: {0}")]
    Fatal(String),
}

impl IterationError {
    pub fn discards_vu(&self) -> bool {
        matches!(self, Self::Corrupted(_) | Self::Interrupted)
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("VU acquisition cancelled")]
    Cancelled,

    #[error("could not allocate a VU within {0:?}")]
    AllocationTimeout(Duration),

    #[error("VU initialization failed: {0}")]
    Init(IterationError),

    #[error("VU pool closed")]
    Closed,
}

/// Non-recoverable executor condition. Any of these aborts the whole run.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("scenario `{scenario}` could not allocate VUs fast enough ({timeout:?})")]
    VuAllocationTimeout { scenario: String, timeout: Duration },

    #[error("scenario `{scenario}` VU initialization failed: {source}")]
    VuInit {
        scenario: String,
        source: IterationError,
    },

    #[error("scenario `{scenario}` aborted by workload: {message}")]
    Aborted { scenario: String, message: String },

    #[error("scenario `{scenario}` lost its VU pool: {source}")]
    PoolUnavailable { scenario: String, source: PoolError },

    #[error("scenario `{scenario}` task panicked: {message}")]
    Panicked { scenario: String, message: String },
}

impl ExecutorError {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Self::Aborted { .. } => ExitCode::ScriptAborted,
            _ => ExitCode::GenericEngine,
        }
    }

    pub(crate) fn from_pool(scenario: &str, err: PoolError) -> Self {
        match err {
            PoolError::AllocationTimeout(timeout) => Self::VuAllocationTimeout {
                scenario: scenario.to_string(),
                timeout,
            },
            PoolError::Init(source) => Self::VuInit {
                scenario: scenario.to_string(),
                source,
            },
            source @ (PoolError::Cancelled | PoolError::Closed) => Self::PoolUnavailable {
                scenario: scenario.to_string(),
                source,
            },
        }
    }
}

/// Errors returned synchronously to control surface callers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ControlError {
    #[error("pause is not supported by scenarios: {}", .0.join(", "))]
    PauseNotSupported(Vec<String>),

    #[error("run is not active (phase: {0})")]
    NotActive(RunPhase),

    #[error("run has already finished (phase: {0})")]
    AlreadyStopped(RunPhase),
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("could not serialize summary: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("could not write summary: {0}")]
    Io(#[from] std::io::Error),
}

/// Top level error of a test run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Report(#[from] ReportError),
}

impl RunError {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Self::Config(_) => ExitCode::InvalidConfig,
            Self::Report(_) => ExitCode::GenericEngine,
        }
    }
}

/// Process exit conditions, numerically compatible with k6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ExitCode {
    Success = 0,
    ThresholdsHaveFailed = 99,
    GenericEngine = 103,
    InvalidConfig = 104,
    ExternalAbort = 105,
    ScriptAborted = 108,
}

impl ExitCode {
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl From<ExitCode> for std::process::ExitCode {
    fn from(value: ExitCode) -> Self {
        std::process::ExitCode::from(value.code())
    }
}
