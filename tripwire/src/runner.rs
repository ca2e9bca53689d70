//! Guardrail runner: executes a set of guardrails against one context.
//!
//! # Execution modes
//!
//! - **Parallel** (default): every enabled guardrail runs concurrently under
//!   one shared deadline. Guardrails still pending when it elapses become
//!   timeout results; the ones that already finished keep their verdicts.
//! - **Sequential**: guardrails run one at a time in descending priority
//!   order (stable), each under its own deadline. With
//!   `continue_on_failure = false` the run halts at the first block and the
//!   remaining guardrails are reported as [`ExecutionStatus::Skipped`].
//!
//! In both modes the returned results line up 1:1 with the enabled
//! guardrails in input order.
//!
//! # Failure handling
//!
//! A check that returns an error, panics or misses its deadline yields a
//! blocking `critical` result with `execution_failed` set. The runner only
//! returns `Err` for invalid configuration and for caller cancellation.

use std::any::Any;
use std::cmp::Reverse;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

use crate::abort::{AbortPool, AbortScope, Interrupt};
use crate::config::{LogLevel, RunnerConfig, duration_ms};
use crate::error::{BlockedGuardrail, Error, Result};
use crate::guardrail::{Guardrail, GuardrailOutput, Severity};
use crate::telemetry::{GuardrailTracer, NoopTracer, RunnerMetrics};

/// How a guardrail execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionStatus {
    /// The check returned a verdict.
    Completed,
    /// The check returned an error or panicked.
    Failed,
    /// The check missed its deadline.
    TimedOut,
    /// The check was never invoked because an earlier one blocked.
    Skipped,
}

/// The outcome of one guardrail within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    /// Name of the guardrail.
    pub guardrail_name: String,
    /// Version tag of the guardrail, if set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guardrail_version: Option<String>,
    /// Position of the guardrail in the slice passed to the runner.
    pub index: usize,
    /// Execution priority of the guardrail.
    pub priority: Severity,
    /// How the execution ended.
    pub status: ExecutionStatus,
    /// The verdict (synthetic for failures, timeouts and skips).
    pub output: GuardrailOutput,
    /// Wall time spent in the check.
    #[serde(rename = "elapsedMs", with = "duration_ms")]
    pub elapsed: Duration,
}

impl ExecutionResult {
    /// Placeholder for a guardrail that was never invoked.
    #[must_use]
    pub fn skipped(
        name: impl Into<String>,
        version: Option<String>,
        index: usize,
        priority: Severity,
    ) -> Self {
        Self {
            guardrail_name: name.into(),
            guardrail_version: version,
            index,
            priority,
            status: ExecutionStatus::Skipped,
            output: GuardrailOutput::pass(),
            elapsed: Duration::ZERO,
        }
    }

    /// Returns `true` if this result blocks.
    #[must_use]
    pub const fn is_blocked(&self) -> bool {
        self.output.tripwire_triggered
    }

    /// Severity used for ranking (`medium` when the check set none).
    #[must_use]
    pub fn severity(&self) -> Severity {
        self.output.effective_severity()
    }

    /// Returns `true` if the check could not reach a verdict.
    #[must_use]
    pub const fn is_execution_failure(&self) -> bool {
        matches!(self.status, ExecutionStatus::Failed | ExecutionStatus::TimedOut)
    }
}

/// Aggregate view over one run's results.
///
/// Derived once from the result list and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    results: Vec<ExecutionResult>,
    #[serde(rename = "totalTimeMs", with = "duration_ms")]
    total_time: Duration,
}

impl ExecutionSummary {
    /// Build a summary from results in input order.
    #[must_use]
    pub const fn new(results: Vec<ExecutionResult>, total_time: Duration) -> Self {
        Self {
            results,
            total_time,
        }
    }

    /// Summary of a run over no enabled guardrails.
    #[must_use]
    pub const fn empty() -> Self {
        Self::new(Vec::new(), Duration::ZERO)
    }

    /// Every result, in input order.
    #[must_use]
    pub fn all_results(&self) -> &[ExecutionResult] {
        &self.results
    }

    /// Consume the summary, returning the results.
    #[must_use]
    pub fn into_results(self) -> Vec<ExecutionResult> {
        self.results
    }

    /// Results whose tripwire triggered, in input order.
    pub fn blocked_results(&self) -> impl Iterator<Item = &ExecutionResult> {
        self.results.iter().filter(|r| r.is_blocked())
    }

    /// Returns `true` if any result blocks.
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        self.results.iter().any(ExecutionResult::is_blocked)
    }

    /// Number of executed guardrails that did not block.
    #[must_use]
    pub fn passed(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.status == ExecutionStatus::Completed && !r.is_blocked())
            .count()
    }

    /// Number of blocking results, execution failures included.
    #[must_use]
    pub fn blocked(&self) -> usize {
        self.blocked_results().count()
    }

    /// Number of checks that errored, panicked or timed out.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.is_execution_failure())
            .count()
    }

    /// Number of guardrails skipped after an earlier block.
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.status == ExecutionStatus::Skipped)
            .count()
    }

    /// Wall time of the whole run.
    #[must_use]
    pub const fn total_time(&self) -> Duration {
        self.total_time
    }

    /// Mean time per invoked guardrail.
    #[must_use]
    pub fn average_time(&self) -> Duration {
        let (count, sum) = self
            .results
            .iter()
            .filter(|r| r.status != ExecutionStatus::Skipped)
            .fold((0u32, Duration::ZERO), |(n, sum), r| (n + 1, sum + r.elapsed));
        sum.checked_div(count).unwrap_or_default()
    }

    /// Highest severity among blocking results.
    #[must_use]
    pub fn highest_severity(&self) -> Option<Severity> {
        self.blocked_results().map(ExecutionResult::severity).max()
    }

    /// The blocking guardrails, as reported in strict-mode errors.
    #[must_use]
    pub fn blocked_guardrails(&self) -> Vec<BlockedGuardrail> {
        self.blocked_results()
            .map(|r| BlockedGuardrail {
                name: r.guardrail_name.clone(),
                severity: r.severity(),
                message: r.output.message.clone(),
                execution_failed: r.output.execution_failed,
            })
            .collect()
    }
}

/// Executes guardrails with deadlines, cancellation and failure containment.
///
/// Cheap to clone; clones share the tracer, abort pool and metrics.
#[derive(Clone)]
pub struct GuardrailRunner {
    config: RunnerConfig,
    tracer: Arc<dyn GuardrailTracer>,
    pool: Arc<AbortPool>,
    metrics: Arc<Mutex<RunnerMetrics>>,
}

impl Default for GuardrailRunner {
    fn default() -> Self {
        Self::new(RunnerConfig::default())
    }
}

impl fmt::Debug for GuardrailRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuardrailRunner")
            .field("config", &self.config)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl GuardrailRunner {
    /// Create a runner with its own abort pool and a no-op tracer.
    #[must_use]
    pub fn new(config: RunnerConfig) -> Self {
        Self {
            config,
            tracer: Arc::new(NoopTracer),
            pool: Arc::new(AbortPool::default()),
            metrics: Arc::new(Mutex::new(RunnerMetrics::default())),
        }
    }

    /// Use a custom tracer.
    #[must_use]
    pub fn with_tracer(mut self, tracer: impl GuardrailTracer + 'static) -> Self {
        self.tracer = Arc::new(tracer);
        self
    }

    /// Share an abort pool with other runners.
    #[must_use]
    pub fn with_pool(mut self, pool: Arc<AbortPool>) -> Self {
        self.pool = pool;
        self
    }

    /// The runner configuration.
    #[must_use]
    pub const fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Whether events at `level` are emitted under this runner's log level.
    pub(crate) fn logs(&self, level: LogLevel) -> bool {
        self.config.log_level.allows(level)
    }

    /// The abort pool backing this runner's deadlines.
    #[must_use]
    pub fn pool(&self) -> &AbortPool {
        &self.pool
    }

    /// Snapshot of the metrics accumulated so far.
    #[must_use]
    pub fn metrics(&self) -> RunnerMetrics {
        *self.metrics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `guardrails` against `context` and return one result per enabled
    /// guardrail, in input order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for an unusable configuration and
    /// [`Error::Cancelled`] if `cancel` fires before the run completes.
    pub async fn run<C: Sync>(
        &self,
        guardrails: &[Guardrail<C>],
        context: &C,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<ExecutionResult>> {
        Ok(self
            .evaluate(guardrails, context, cancel)
            .await?
            .into_results())
    }

    /// Like [`run`](Self::run), but returns the aggregated summary.
    ///
    /// # Errors
    ///
    /// Same as [`run`](Self::run).
    pub async fn evaluate<C: Sync>(
        &self,
        guardrails: &[Guardrail<C>],
        context: &C,
        cancel: Option<&CancellationToken>,
    ) -> Result<ExecutionSummary> {
        self.config.validate()?;
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return Err(Error::Cancelled);
        }

        let enabled: Vec<(usize, &Guardrail<C>)> = guardrails
            .iter()
            .enumerate()
            .filter(|(_, g)| g.is_enabled())
            .collect();
        if enabled.is_empty() {
            return Ok(ExecutionSummary::empty());
        }

        let started = Instant::now();
        let results = if self.config.parallel {
            self.run_parallel(&enabled, context, cancel).await?
        } else {
            self.run_sequential(&enabled, context, cancel).await?
        };
        let summary = ExecutionSummary::new(results, started.elapsed());

        self.tracer.on_summary(&summary);
        self.metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(&summary);
        self.log_summary(&summary);

        Ok(summary)
    }

    async fn run_parallel<C: Sync>(
        &self,
        enabled: &[(usize, &Guardrail<C>)],
        context: &C,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<ExecutionResult>> {
        let scope = self.pool.acquire(self.config.timeout, cancel);
        let outcomes = join_all(
            enabled
                .iter()
                .map(|&(index, guardrail)| self.execute_one(index, guardrail, context, &scope)),
        )
        .await;
        self.pool.release(scope);

        outcomes.into_iter().collect()
    }

    async fn run_sequential<C: Sync>(
        &self,
        enabled: &[(usize, &Guardrail<C>)],
        context: &C,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<ExecutionResult>> {
        let mut order: Vec<usize> = (0..enabled.len()).collect();
        order.sort_by_key(|&pos| Reverse(enabled[pos].1.get_priority()));

        let mut slots: Vec<Option<ExecutionResult>> = enabled.iter().map(|_| None).collect();
        let mut halted = false;

        for pos in order {
            let (index, guardrail) = enabled[pos];
            if halted {
                let skipped = ExecutionResult::skipped(
                    guardrail.name(),
                    guardrail.get_version().map(str::to_owned),
                    index,
                    guardrail.get_priority(),
                );
                self.tracer.on_result(&skipped);
                slots[pos] = Some(skipped);
                continue;
            }

            let scope = self.pool.acquire(self.config.timeout, cancel);
            let outcome = self.execute_one(index, guardrail, context, &scope).await;
            self.pool.release(scope);

            let result = outcome?;
            if result.is_blocked() && !self.config.continue_on_failure {
                halted = true;
            }
            slots[pos] = Some(result);
        }

        Ok(slots.into_iter().flatten().collect())
    }

    /// Execute one guardrail inside `scope`, normalizing every failure mode
    /// except cancellation into a result.
    async fn execute_one<C: Sync>(
        &self,
        index: usize,
        guardrail: &Guardrail<C>,
        context: &C,
        scope: &AbortScope,
    ) -> Result<ExecutionResult> {
        let started = Instant::now();
        let span = self.tracer.span(guardrail.name(), index);

        let outcome = scope
            .run(|token| {
                async move {
                    AssertUnwindSafe(guardrail.invoke(context, &token))
                        .catch_unwind()
                        .await
                }
                .instrument(span)
            })
            .await;

        let (status, output) = match outcome {
            Err(Interrupt::Cancelled) => {
                if self.config.log_level.allows(LogLevel::Debug) {
                    debug!(guardrail = guardrail.name(), "guardrail cancelled");
                }
                return Err(Error::Cancelled);
            }
            Err(Interrupt::Elapsed(timeout)) => {
                let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                (
                    ExecutionStatus::TimedOut,
                    GuardrailOutput::execution_failure(
                        format!("Guardrail timed out after {timeout_ms}ms"),
                        json!({ "timeoutMs": timeout_ms, "timedOut": true }),
                    ),
                )
            }
            Ok(Err(panic)) => {
                let reason = panic_message(panic.as_ref());
                (
                    ExecutionStatus::Failed,
                    GuardrailOutput::execution_failure(
                        format!("Guardrail panicked: {reason}"),
                        json!({ "error": reason, "panicked": true }),
                    ),
                )
            }
            Ok(Ok(Err(err))) => (
                ExecutionStatus::Failed,
                GuardrailOutput::execution_failure(
                    format!("Guardrail execution failed: {err}"),
                    json!({ "error": err.to_string() }),
                ),
            ),
            Ok(Ok(Ok(output))) => (ExecutionStatus::Completed, output),
        };

        let result = ExecutionResult {
            guardrail_name: guardrail.name().to_owned(),
            guardrail_version: guardrail.get_version().map(str::to_owned),
            index,
            priority: guardrail.get_priority(),
            status,
            output,
            elapsed: started.elapsed(),
        };
        self.log_result(&result);
        self.tracer.on_result(&result);
        Ok(result)
    }

    fn log_result(&self, result: &ExecutionResult) {
        let level = self.config.log_level;
        if result.is_execution_failure() {
            if level.allows(LogLevel::Error) {
                error!(
                    guardrail = %result.guardrail_name,
                    status = ?result.status,
                    message = result.output.message.as_deref().unwrap_or_default(),
                    "guardrail execution failed"
                );
            }
        } else if level.allows(LogLevel::Debug) {
            debug!(
                guardrail = %result.guardrail_name,
                blocked = result.is_blocked(),
                elapsed_ms = result.elapsed.as_millis(),
                "guardrail executed"
            );
        }
    }

    fn log_summary(&self, summary: &ExecutionSummary) {
        let level = self.config.log_level;
        if summary.is_blocked() && level.allows(LogLevel::Warn) {
            let names: Vec<&str> = summary
                .blocked_results()
                .map(|r| r.guardrail_name.as_str())
                .collect();
            warn!(
                blocked = ?names,
                severity = ?summary.highest_severity(),
                "guardrails blocked"
            );
        }
        if level.allows(LogLevel::Info) {
            info!(
                passed = summary.passed(),
                blocked = summary.blocked(),
                failed = summary.failed(),
                skipped = summary.skipped(),
                total_ms = summary.total_time().as_millis(),
                "guardrail run completed"
            );
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::error::GuardrailError;
    use crate::guardrail::GuardrailCheck;

    /// Sleeps, logs its name, then returns a fixed verdict.
    struct Scripted {
        name: &'static str,
        delay: Duration,
        verdict: GuardrailOutput,
        calls: Arc<AtomicUsize>,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl GuardrailCheck<String> for Scripted {
        type Metadata = serde_json::Value;

        async fn check(
            &self,
            _context: &String,
            _cancel: &CancellationToken,
        ) -> std::result::Result<GuardrailOutput, GuardrailError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.log.lock().unwrap().push(self.name);
            tokio::time::sleep(self.delay).await;
            Ok(self.verdict.clone())
        }
    }

    struct Fixture {
        calls: Arc<AtomicUsize>,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                calls: Arc::new(AtomicUsize::new(0)),
                log: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn guardrail(
            &self,
            name: &'static str,
            delay_ms: u64,
            verdict: GuardrailOutput,
        ) -> Guardrail<String> {
            Guardrail::new(
                name,
                Scripted {
                    name,
                    delay: Duration::from_millis(delay_ms),
                    verdict,
                    calls: Arc::clone(&self.calls),
                    log: Arc::clone(&self.log),
                },
            )
        }

        fn log(&self) -> Vec<&'static str> {
            self.log.lock().unwrap().clone()
        }
    }

    fn names(results: &[ExecutionResult]) -> Vec<&str> {
        results.iter().map(|r| r.guardrail_name.as_str()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_preserves_input_order() {
        let fx = Fixture::new();
        let guardrails = vec![
            fx.guardrail("slow", 30, GuardrailOutput::pass()),
            fx.guardrail("fast", 1, GuardrailOutput::tripwire("bad")),
            fx.guardrail("off", 1, GuardrailOutput::pass()).enabled(false),
            fx.guardrail("mid", 10, GuardrailOutput::pass()),
        ];

        let results = GuardrailRunner::default()
            .run(&guardrails, &"ctx".to_owned(), None)
            .await
            .unwrap();

        assert_eq!(names(&results), ["slow", "fast", "mid"]);
        assert_eq!(
            results.iter().map(|r| r.index).collect::<Vec<_>>(),
            [0, 1, 3]
        );
        assert!(results[1].is_blocked());
        assert_eq!(fx.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_and_panicking_checks_fail_closed() {
        let guardrails = vec![
            Guardrail::new("errors", {
                struct Broken;
                #[async_trait]
                impl GuardrailCheck<String> for Broken {
                    type Metadata = ();
                    async fn check(
                        &self,
                        _: &String,
                        _: &CancellationToken,
                    ) -> std::result::Result<GuardrailOutput<()>, GuardrailError> {
                        Err(GuardrailError::new("classifier offline"))
                    }
                }
                Broken
            }),
            Guardrail::from_fn("panics", |_: &String| -> GuardrailOutput {
                panic!("detector bug")
            }),
        ];

        for parallel in [true, false] {
            let runner = GuardrailRunner::new(RunnerConfig::default().parallel(parallel));
            let summary = runner
                .evaluate(&guardrails, &String::new(), None)
                .await
                .unwrap();

            for result in summary.all_results() {
                assert_eq!(result.status, ExecutionStatus::Failed);
                assert!(result.output.tripwire_triggered);
                assert!(result.output.execution_failed);
                assert_eq!(result.output.severity, Some(Severity::Critical));
            }
            let message = summary.all_results()[1].output.message.clone().unwrap();
            assert!(message.contains("detector bug"));
            assert_eq!(summary.failed(), 2);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_timeout_keeps_finished_results() {
        let fx = Fixture::new();
        let guardrails = vec![
            fx.guardrail("quick", 10, GuardrailOutput::pass()),
            fx.guardrail("stuck", 10_000, GuardrailOutput::pass()),
        ];
        let runner = GuardrailRunner::new(RunnerConfig::default().timeout(Duration::from_millis(100)));

        let started = Instant::now();
        let results = runner.run(&guardrails, &String::new(), None).await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(results[0].status, ExecutionStatus::Completed);
        assert!(!results[0].is_blocked());
        assert_eq!(results[1].status, ExecutionStatus::TimedOut);
        assert_eq!(results[1].severity(), Severity::Critical);
        let metadata = results[1].output.metadata.clone().unwrap();
        assert_eq!(metadata["timeoutMs"], 100);
        assert_eq!(metadata["timedOut"], true);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_timeout_is_per_guardrail() {
        let fx = Fixture::new();
        let guardrails = vec![
            fx.guardrail("a", 80, GuardrailOutput::pass()),
            fx.guardrail("b", 80, GuardrailOutput::pass()),
        ];
        let config = RunnerConfig::default()
            .parallel(false)
            .timeout(Duration::from_millis(100));

        let summary = GuardrailRunner::new(config)
            .evaluate(&guardrails, &String::new(), None)
            .await
            .unwrap();

        assert_eq!(summary.passed(), 2);
        assert!(summary.total_time() >= Duration::from_millis(160));
        assert!(summary.average_time() >= Duration::from_millis(80));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_runs_by_priority_and_returns_input_order() {
        let fx = Fixture::new();
        let guardrails = vec![
            fx.guardrail("low", 0, GuardrailOutput::pass())
                .priority(Severity::Low),
            fx.guardrail("medium-1", 0, GuardrailOutput::pass()),
            fx.guardrail("critical", 0, GuardrailOutput::pass())
                .priority(Severity::Critical),
            fx.guardrail("medium-2", 0, GuardrailOutput::pass()),
        ];

        let results = GuardrailRunner::new(RunnerConfig::default().parallel(false))
            .run(&guardrails, &String::new(), None)
            .await
            .unwrap();

        assert_eq!(fx.log(), ["critical", "medium-1", "medium-2", "low"]);
        assert_eq!(names(&results), ["low", "medium-1", "critical", "medium-2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_at_first_block_skips_remaining() {
        let fx = Fixture::new();
        let guardrails = vec![
            fx.guardrail("after", 0, GuardrailOutput::pass()),
            fx.guardrail("blocker", 0, GuardrailOutput::tripwire("stop"))
                .priority(Severity::High),
            fx.guardrail("also-after", 0, GuardrailOutput::pass())
                .priority(Severity::Low),
        ];
        let config = RunnerConfig::default()
            .parallel(false)
            .continue_on_failure(false);

        let summary = GuardrailRunner::new(config)
            .evaluate(&guardrails, &String::new(), None)
            .await
            .unwrap();

        assert_eq!(fx.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fx.log(), ["blocker"]);
        assert_eq!(summary.all_results().len(), 3);
        assert_eq!(summary.all_results()[0].status, ExecutionStatus::Skipped);
        assert_eq!(summary.all_results()[2].status, ExecutionStatus::Skipped);
        assert_eq!(summary.skipped(), 2);
        assert_eq!(summary.blocked(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_cancellation_is_an_error_not_a_result() {
        let fx = Fixture::new();
        let guardrails = vec![fx.guardrail("slow", 20_000, GuardrailOutput::pass())];
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = GuardrailRunner::default()
            .run(&guardrails, &String::new(), Some(&cancel))
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_zero_timeout_is_rejected() {
        let runner = GuardrailRunner::new(RunnerConfig::default().timeout(Duration::ZERO));
        let guardrails: Vec<Guardrail<String>> = Vec::new();
        let err = runner.run(&guardrails, &String::new(), None).await.unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_timeout_runs_both_modes() {
        let fx = Fixture::new();
        let guardrails = vec![
            fx.guardrail("a", 5, GuardrailOutput::pass()),
            fx.guardrail("b", 5, GuardrailOutput::tripwire("bad")),
        ];
        for parallel in [true, false] {
            let runner = GuardrailRunner::new(
                RunnerConfig::default().timeout(Duration::MAX).parallel(parallel),
            );
            let results = runner.run(&guardrails, &"ctx".to_owned(), None).await.unwrap();
            assert_eq!(names(&results), ["a", "b"]);
            assert!(!results[0].is_blocked());
            assert!(results[1].is_blocked());
        }
        assert_eq!(fx.calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_log_level_gates_events() {
        let quiet = GuardrailRunner::new(RunnerConfig::default().log_level(LogLevel::None));
        assert!(!quiet.logs(LogLevel::Error));
        let runner = GuardrailRunner::default();
        assert!(runner.logs(LogLevel::Warn));
        assert!(!runner.logs(LogLevel::Info));
    }

    #[tokio::test(start_paused = true)]
    async fn test_summary_and_metrics() {
        let fx = Fixture::new();
        let guardrails = vec![
            fx.guardrail("a", 0, GuardrailOutput::pass()),
            fx.guardrail("b", 0, GuardrailOutput::tripwire("meh")),
            fx.guardrail("c", 0, GuardrailOutput::tripwire("bad").with_severity(Severity::High)),
        ];
        let runner = GuardrailRunner::default();

        let summary = runner
            .evaluate(&guardrails, &String::new(), None)
            .await
            .unwrap();
        assert_eq!(summary.passed(), 1);
        assert_eq!(summary.blocked(), 2);
        assert_eq!(summary.highest_severity(), Some(Severity::High));
        let blocked = summary.blocked_guardrails();
        assert_eq!(blocked[0].severity, Severity::Medium);
        assert_eq!(blocked[1].name, "c");

        let _ = runner.evaluate(&guardrails, &String::new(), None).await.unwrap();
        let metrics = runner.metrics();
        assert_eq!(metrics.runs, 2);
        assert_eq!(metrics.blocked, 4);
        assert_eq!(runner.pool().reused(), 1);
    }

    #[tokio::test]
    async fn test_no_enabled_guardrails() {
        let guardrails =
            vec![Guardrail::from_fn("off", |_: &String| GuardrailOutput::pass()).enabled(false)];
        let summary = GuardrailRunner::default()
            .evaluate(&guardrails, &String::new(), None)
            .await
            .unwrap();
        assert!(summary.all_results().is_empty());
        assert!(!summary.is_blocked());
        assert_eq!(summary.average_time(), Duration::ZERO);
    }
}
