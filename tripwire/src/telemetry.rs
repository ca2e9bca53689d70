//! Telemetry for guardrail execution using the `tracing` ecosystem.
//!
//! The runner never talks to a tracing backend directly. It goes through an
//! injectable [`GuardrailTracer`]:
//!
//! - [`NoopTracer`] is the default and emits nothing.
//! - [`LogTracer`] opens a `tracing` span per guardrail execution and
//!   records each outcome as an event, so any subscriber (fmt, OTLP, ...)
//!   picks it up.
//!
//! # Usage
//!
//! ```rust,ignore
//! tracing_subscriber::fmt::init();
//!
//! let runner = GuardrailRunner::new(RunnerConfig::default())
//!     .with_tracer(LogTracer);
//! ```
//!
//! Independently of the tracer, the runner accumulates [`RunnerMetrics`].

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{Span, debug, debug_span, info, warn};

use crate::runner::{ExecutionResult, ExecutionStatus, ExecutionSummary};

/// Injectable instrumentation for guardrail execution.
///
/// All methods have no-op defaults.
pub trait GuardrailTracer: Send + Sync {
    /// Span entered while guardrail `name` (at input position `index`) runs.
    fn span(&self, name: &str, index: usize) -> Span {
        let _ = (name, index);
        Span::none()
    }

    /// Called once per guardrail result, including skipped placeholders.
    fn on_result(&self, result: &ExecutionResult) {
        let _ = result;
    }

    /// Called once per completed `run`.
    fn on_summary(&self, summary: &ExecutionSummary) {
        let _ = summary;
    }
}

/// Tracer that records nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

impl GuardrailTracer for NoopTracer {}

/// Tracer backed by `tracing` spans and events.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogTracer;

impl GuardrailTracer for LogTracer {
    fn span(&self, name: &str, index: usize) -> Span {
        debug_span!("guardrail", guardrail = %name, index)
    }

    fn on_result(&self, result: &ExecutionResult) {
        let elapsed_ms = result.elapsed.as_millis();
        match result.status {
            ExecutionStatus::Completed if result.is_blocked() => warn!(
                guardrail = %result.guardrail_name,
                severity = %result.severity(),
                elapsed_ms,
                "guardrail_blocked"
            ),
            ExecutionStatus::Completed => debug!(
                guardrail = %result.guardrail_name,
                elapsed_ms,
                "guardrail_passed"
            ),
            ExecutionStatus::Failed | ExecutionStatus::TimedOut => warn!(
                guardrail = %result.guardrail_name,
                status = ?result.status,
                message = result.output.message.as_deref().unwrap_or_default(),
                "guardrail_failed"
            ),
            ExecutionStatus::Skipped => debug!(guardrail = %result.guardrail_name, "guardrail_skipped"),
        }
    }

    fn on_summary(&self, summary: &ExecutionSummary) {
        info!(
            passed = summary.passed(),
            blocked = summary.blocked(),
            failed = summary.failed(),
            total_ms = summary.total_time().as_millis(),
            "guardrails_completed"
        );
    }
}

/// Counters accumulated by a runner across all of its runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerMetrics {
    /// Completed `run` calls.
    pub runs: usize,
    /// Guardrails actually invoked.
    pub executed: usize,
    /// Results that blocked (including failures).
    pub blocked: usize,
    /// Checks that errored or panicked.
    pub failed: usize,
    /// Checks that hit their deadline.
    pub timed_out: usize,
    /// Guardrails skipped after an earlier block.
    pub skipped: usize,
    /// Wall time across all runs.
    pub total_duration: Duration,
}

impl RunnerMetrics {
    /// Fold one run's summary into the counters.
    pub fn record(&mut self, summary: &ExecutionSummary) {
        self.runs += 1;
        for result in summary.all_results() {
            match result.status {
                ExecutionStatus::Skipped => self.skipped += 1,
                ExecutionStatus::Failed => self.failed += 1,
                ExecutionStatus::TimedOut => self.timed_out += 1,
                ExecutionStatus::Completed => {}
            }
            if result.status != ExecutionStatus::Skipped {
                self.executed += 1;
            }
            if result.is_blocked() {
                self.blocked += 1;
            }
        }
        self.total_duration += summary.total_time();
    }

    /// Share of executed guardrails that blocked, in `[0, 1]`.
    #[must_use]
    pub fn block_rate(&self) -> f64 {
        if self.executed == 0 {
            0.0
        } else {
            self.blocked as f64 / self.executed as f64
        }
    }
}

impl std::fmt::Display for RunnerMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Guardrail Runner Metrics")?;
        writeln!(f, "  Runs:      {}", self.runs)?;
        writeln!(
            f,
            "  Executed:  {} (blocked: {}, {:.1}%)",
            self.executed,
            self.blocked,
            self.block_rate() * 100.0
        )?;
        writeln!(f, "  Failed:    {} (timed out: {})", self.failed + self.timed_out, self.timed_out)?;
        writeln!(f, "  Skipped:   {}", self.skipped)?;
        writeln!(f, "  Duration:  {:.2}s", self.total_duration.as_secs_f64())?;
        Ok(())
    }
}
