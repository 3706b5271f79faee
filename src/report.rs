//! End-of-test summary and the reporters that publish it.
//!
//! A [`Summary`] is pure data computed once the run is over: final metric
//! statistics, threshold results and per-scenario progress. A [`Reporter`] is
//! the I/O boundary and decides where the summary goes.
use std::{collections::BTreeMap, fmt::Write as _, path::PathBuf, time::Duration};

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::AsyncWriteExt;

use crate::{
    aggregate::SinkSnapshot,
    engine::ThresholdResult,
    error::ReportError,
    scheduler::{RunPhase, ScenarioStatus},
};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub phase: RunPhase,
    /// One of `passed`, `thresholds-failed`, `stopped` or `aborted`.
    pub verdict: &'static str,
    pub exit_code: u8,
    pub abort_reason: Option<String>,
    #[serde(with = "crate::config::duration")]
    pub duration: Duration,
    pub metrics: BTreeMap<String, SinkSnapshot>,
    pub thresholds: BTreeMap<String, Vec<ThresholdResult>>,
    pub scenarios: Vec<ScenarioStatus>,
}

const NAME_WIDTH: usize = 32;

impl Summary {
    pub fn thresholds_passed(&self) -> bool {
        self.thresholds.values().flatten().all(|r| r.passed)
    }

    /// Human readable rendering, in the spirit of the k6 end-of-test summary.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "  run {} after {} (exit code {})",
            self.verdict,
            humantime::format_duration(self.duration),
            self.exit_code
        );
        if let Some(reason) = &self.abort_reason {
            let _ = writeln!(out, "  reason: {reason}");
        }

        if !self.thresholds.is_empty() {
            let _ = writeln!(out, "\n  thresholds");
            for (key, results) in &self.thresholds {
                for r in results {
                    let mark = if r.passed { '✓' } else { '✗' };
                    let observed = r
                        .observed
                        .map_or_else(|| "no data".to_string(), |v| format!("{v:.2}"));
                    let _ = writeln!(out, "    {mark} {key}: {} ({observed})", r.source);
                }
            }
        }

        let _ = writeln!(out, "\n  metrics");
        for (name, snapshot) in &self.metrics {
            let dots = ".".repeat(NAME_WIDTH.saturating_sub(name.len()).max(1));
            let values: Vec<String> = snapshot
                .values
                .iter()
                .map(|(k, v)| format!("{k}={v:.2}"))
                .collect();
            let _ = writeln!(out, "    {name}{dots}: {}", values.join(" "));
        }

        let _ = writeln!(out, "\n  scenarios");
        for s in &self.scenarios {
            let it = &s.iterations;
            let _ = writeln!(
                out,
                "    {} [{}]: {} complete, {} failed, {} interrupted, {} dropped",
                s.name, s.executor, it.completed, it.failed, it.interrupted, it.dropped
            );
        }
        out
    }
}

#[async_trait]
pub trait Reporter: Send + Sync {
    async fn report(&self, summary: &Summary) -> Result<(), ReportError>;
}

/// Prints [`Summary::render_text`] to stdout.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdoutReporter;

#[async_trait]
impl Reporter for StdoutReporter {
    async fn report(&self, summary: &Summary) -> Result<(), ReportError> {
        let mut stdout = tokio::io::stdout();
        stdout.write_all(summary.render_text().as_bytes()).await?;
        stdout.flush().await?;
        Ok(())
    }
}

/// Writes the summary as pretty printed JSON.
#[derive(Debug, Clone)]
pub struct JsonReporter {
    pub path: PathBuf,
}

impl JsonReporter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Reporter for JsonReporter {
    async fn report(&self, summary: &Summary) -> Result<(), ReportError> {
        let json = serde_json::to_vec_pretty(summary)?;
        tokio::fs::write(&self.path, json).await?;
        tracing::info!(path = %self.path.display(), "summary written");
        Ok(())
    }
}
