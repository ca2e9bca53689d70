//! Bounded retry of blocked generations.
//!
//! The [`RetryOrchestrator`] calls the generator, runs the output
//! guardrails over the result and, while the result is blocked and retries
//! remain, rewrites the parameters with a remediation instruction and tries
//! again. Attempts are strictly sequential and the loop stops at the first
//! unblocked result, so a call never makes more than `1 + max_retries`
//! generation calls.
//!
//! Exhausting the retries is not an error: the orchestrator returns the
//! last (still blocked) attempt and leaves the disposition to the caller.

mod config;
mod params;

pub use config::{Backoff, DEFAULT_TEMPERATURE, MultipleBlockedStrategy, RetryConfig};
pub use params::{
    RetryBuildRequest, RetryParamsBuilder, apply_remediation, combine_remediations,
    default_instruction, select_blocked,
};

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::abort::{cancellable, cancellable_sleep};
use crate::config::{LogLevel, duration_ms};
use crate::error::{Error, Result};
use crate::generate::Generator;
use crate::guardrail::{
    InputContext, OutputContext, OutputGuardrail, Remediation, RetryInstructionRequest,
};
use crate::runner::{ExecutionSummary, GuardrailRunner};
use crate::types::{GenerationParams, GenerationResult};

/// One generation call and its guardrail verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryAttempt {
    /// 1 for the initial call, 2 for the first retry, and so on.
    pub attempt_number: u32,
    /// Parameters the generator was called with.
    pub params: GenerationParams,
    /// What the generator returned.
    pub result: GenerationResult,
    /// Output guardrail summary for `result`.
    pub summary: ExecutionSummary,
    /// Whether any output guardrail blocked.
    pub blocked: bool,
    /// Backoff waited before this attempt.
    #[serde(rename = "waitMs", with = "duration_ms")]
    pub wait: Duration,
}

impl RetryAttempt {
    /// Record an attempt.
    #[must_use]
    pub fn new(
        attempt_number: u32,
        params: GenerationParams,
        result: GenerationResult,
        summary: ExecutionSummary,
        wait: Duration,
    ) -> Self {
        Self {
            attempt_number,
            blocked: summary.is_blocked(),
            params,
            result,
            summary,
            wait,
        }
    }
}

/// The attempts made for one call, ending with the one returned.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryOutcome {
    history: Vec<RetryAttempt>,
    last: RetryAttempt,
}

impl RetryOutcome {
    fn new(history: Vec<RetryAttempt>, last: RetryAttempt) -> Self {
        Self { history, last }
    }

    /// The final attempt.
    #[must_use]
    pub const fn last(&self) -> &RetryAttempt {
        &self.last
    }

    /// The final generation result.
    #[must_use]
    pub const fn result(&self) -> &GenerationResult {
        &self.last.result
    }

    /// Guardrail summary of the final attempt.
    #[must_use]
    pub const fn summary(&self) -> &ExecutionSummary {
        &self.last.summary
    }

    /// Whether the final attempt is still blocked.
    #[must_use]
    pub const fn is_blocked(&self) -> bool {
        self.last.blocked
    }

    /// Total generation calls made.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.last.attempt_number
    }

    /// Attempts before the final one, oldest first.
    #[must_use]
    pub fn history(&self) -> &[RetryAttempt] {
        &self.history
    }

    /// Every attempt, oldest first.
    pub fn attempts(&self) -> impl Iterator<Item = &RetryAttempt> {
        self.history.iter().chain(std::iter::once(&self.last))
    }

    /// Consume the outcome, returning the final attempt.
    #[must_use]
    pub fn into_last(self) -> RetryAttempt {
        self.last
    }
}

/// Drives the generate, check, remediate loop.
#[derive(Debug, Clone, Default)]
pub struct RetryOrchestrator {
    runner: GuardrailRunner,
    config: RetryConfig,
}

impl RetryOrchestrator {
    /// Create an orchestrator.
    #[must_use]
    pub const fn new(runner: GuardrailRunner, config: RetryConfig) -> Self {
        Self { runner, config }
    }

    /// The retry configuration.
    #[must_use]
    pub const fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// The runner used for output checks.
    #[must_use]
    pub const fn runner(&self) -> &GuardrailRunner {
        &self.runner
    }

    /// Generate with `params` and retry while output guardrails block.
    ///
    /// # Errors
    ///
    /// Returns generator errors unchanged, [`Error::Cancelled`] if `cancel`
    /// fires, and [`Error::InvalidConfig`] for an unusable configuration.
    pub async fn execute<G: Generator + ?Sized>(
        &self,
        params: GenerationParams,
        generator: &G,
        guardrails: &[OutputGuardrail],
        cancel: &CancellationToken,
    ) -> Result<RetryOutcome> {
        self.config.validate()?;
        let input = InputContext::from_params(&params);
        let first = self
            .attempt(1, params.clone(), Duration::ZERO, generator, guardrails, &input, cancel)
            .await?;
        self.recover(&params, first, generator, guardrails, cancel).await
    }

    /// Continue from an already-checked first attempt.
    ///
    /// Used when the first result did not come from [`execute`](Self::execute),
    /// e.g. text buffered from a stream.
    ///
    /// # Errors
    ///
    /// Same as [`execute`](Self::execute).
    pub async fn recover<G: Generator + ?Sized>(
        &self,
        original: &GenerationParams,
        first: RetryAttempt,
        generator: &G,
        guardrails: &[OutputGuardrail],
        cancel: &CancellationToken,
    ) -> Result<RetryOutcome> {
        self.config.validate()?;
        let mut history = Vec::new();
        let mut last = first;
        if !last.blocked {
            return Ok(RetryOutcome::new(history, last));
        }

        let input = InputContext::from_params(original);
        for retry in 1..=self.config.max_retries {
            if !self.config.allows_retry(&last.summary) {
                if self.runner.logs(LogLevel::Debug) {
                    debug!(attempt = last.attempt_number, "retry declined by predicate");
                }
                return Ok(RetryOutcome::new(history, last));
            }

            let Some(remediation) = self.remediation(&last.summary, guardrails, retry) else {
                break;
            };
            let params = self.next_params(original, &last, &remediation, retry);
            let wait = self.config.backoff.delay_for(retry);
            if self.runner.logs(LogLevel::Debug) {
                debug!(
                    retry,
                    max_retries = self.config.max_retries,
                    wait_ms = wait.as_millis(),
                    "retrying blocked output"
                );
            }
            cancellable_sleep(wait, cancel)
                .await
                .map_err(|_| Error::Cancelled)?;

            let attempt = self
                .attempt(last.attempt_number + 1, params, wait, generator, guardrails, &input, cancel)
                .await?;
            history.push(std::mem::replace(&mut last, attempt));

            if !last.blocked {
                if self.runner.logs(LogLevel::Info) {
                    info!(attempts = last.attempt_number, "output passed after retry");
                }
                return Ok(RetryOutcome::new(history, last));
            }
        }

        if self.config.max_retries > 0 && self.runner.logs(LogLevel::Warn) {
            warn!(
                attempts = last.attempt_number,
                blocked = last.summary.blocked(),
                "retries exhausted, output still blocked"
            );
        }
        Ok(RetryOutcome::new(history, last))
    }

    #[allow(clippy::too_many_arguments)]
    async fn attempt<G: Generator + ?Sized>(
        &self,
        attempt_number: u32,
        params: GenerationParams,
        wait: Duration,
        generator: &G,
        guardrails: &[OutputGuardrail],
        input: &InputContext,
        cancel: &CancellationToken,
    ) -> Result<RetryAttempt> {
        let result = cancellable(generator.generate(&params, cancel), cancel)
            .await
            .map_err(|_| Error::Cancelled)??;
        let context = OutputContext::new(input.clone(), result.clone());
        let summary = self
            .runner
            .evaluate(guardrails, &context, Some(cancel))
            .await?;
        Ok(RetryAttempt::new(attempt_number, params, result, summary, wait))
    }

    fn remediation(
        &self,
        summary: &ExecutionSummary,
        guardrails: &[OutputGuardrail],
        retry: u32,
    ) -> Option<Remediation> {
        let remediations = select_blocked(summary, self.config.strategy)
            .into_iter()
            .map(|result| {
                let request = RetryInstructionRequest {
                    result,
                    attempt: retry,
                    max_retries: self.config.max_retries,
                };
                guardrails
                    .get(result.index)
                    .and_then(|g| g.custom_retry_instruction(&request))
                    .unwrap_or_else(|| Remediation::new(default_instruction(result)))
            })
            .collect();
        combine_remediations(remediations)
    }

    fn next_params(
        &self,
        original: &GenerationParams,
        last: &RetryAttempt,
        remediation: &Remediation,
        retry: u32,
    ) -> GenerationParams {
        match &self.config.params_builder {
            Some(builder) => builder.build(&RetryBuildRequest {
                summary: &last.summary,
                original_params: original,
                last_params: &last.params,
                last_result: &last.result,
                remediation,
                attempt: retry,
            }),
            None => apply_remediation(&last.params, remediation, &self.config),
        }
    }
}
