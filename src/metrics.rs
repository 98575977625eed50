use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Why a run stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    Answered,
    ExitTool(String),
    MaxTurns,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub duration: Duration,
    pub turns: usize,
    pub tool_calls: usize,
    pub tool_failures: usize,
    pub exit: ExitReason,
}

impl RunReport {
    pub fn success_rate(reports: &[Self]) -> f32 {
        if reports.is_empty() {
            return 0.0;
        }
        let successes = reports
            .iter()
            .filter(|r| r.exit != ExitReason::Failed)
            .count();
        successes as f32 / reports.len() as f32
    }
}

#[derive(Default, Clone)]
pub struct MetricsTracker {
    reports: Arc<Mutex<Vec<RunReport>>>,
}

impl MetricsTracker {
    pub fn start_run(&self) -> RunGuard {
        RunGuard {
            start: Instant::now(),
            turns: 0,
            tool_calls: 0,
            tool_failures: 0,
            metrics: Some(self.clone()),
        }
    }

    pub fn reports(&self) -> Vec<RunReport> {
        self.reports
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// Counts one run. Dropping it without `finish` records a failed run.
pub struct RunGuard {
    start: Instant,
    turns: usize,
    tool_calls: usize,
    tool_failures: usize,
    metrics: Option<MetricsTracker>,
}

impl RunGuard {
    /// A guard that reports to nobody.
    pub fn detached() -> Self {
        Self {
            start: Instant::now(),
            turns: 0,
            tool_calls: 0,
            tool_failures: 0,
            metrics: None,
        }
    }

    pub fn record_turn(&mut self) {
        self.turns += 1;
    }

    pub fn record_tool_call(&mut self) {
        self.tool_calls += 1;
    }

    pub fn record_failure(&mut self) {
        self.tool_failures += 1;
    }

    pub fn turns(&self) -> usize {
        self.turns
    }

    pub fn finish(mut self, exit: ExitReason) -> RunReport {
        self.report(exit)
    }

    fn report(&mut self, exit: ExitReason) -> RunReport {
        let report = RunReport {
            duration: self.start.elapsed(),
            turns: self.turns,
            tool_calls: self.tool_calls,
            tool_failures: self.tool_failures,
            exit,
        };
        if let Some(metrics) = self.metrics.take() {
            metrics
                .reports
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(report.clone());
        }
        report
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if self.metrics.is_some() {
            self.report(ExitReason::Failed);
        }
    }
}
