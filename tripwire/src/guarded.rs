//! One-stop guarded generation.
//!
//! [`GuardedGenerator`] ties the pieces together for the common case:
//!
//! 1. input guardrails run before the generator is touched;
//! 2. one-shot calls go through the [`RetryOrchestrator`];
//! 3. streaming calls go through the optional [`TokenBudgetGate`] and then
//!    the [`StreamEvaluator`].
//!
//! Blocked content is surfaced according to [`BlockMode`]: strict mode
//! returns [`Error::InputBlocked`] / [`Error::OutputBlocked`], lenient mode
//! logs and substitutes a placeholder.
//!
//! ```rust,ignore
//! let guarded = GuardedGenerator::new(my_model)
//!     .input_guardrail(InputGuardrail::from_fn("no-secrets", |ctx| { ... }))
//!     .output_guardrail(OutputGuardrail::from_fn("no-pii", |ctx| { ... }))
//!     .retry(RetryConfig::new(2));
//!
//! let output = guarded.generate(&GenerationParams::from_prompt("hi"), &cancel).await?;
//! ```

use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::abort::cancellable;
use crate::budget::TokenBudgetGate;
use crate::config::{BlockMode, GuardConfig, LogLevel};
use crate::error::{Error, Result};
use crate::generate::Generator;
use crate::guardrail::{InputContext, InputGuardrail, OutputContext, OutputGuardrail};
use crate::hooks::{GuardrailHooks, NoopHooks};
use crate::retry::{RetryConfig, RetryOrchestrator, RetryOutcome};
use crate::runner::{ExecutionSummary, GuardrailRunner};
use crate::stream::{StreamConfig, StreamEvaluator};
use crate::types::{ChunkStream, FinishReason, GenerationParams, GenerationResult, StreamChunk};

/// Result of a guarded one-shot call.
#[derive(Debug, Clone, PartialEq)]
pub struct GuardedOutput {
    /// The text handed to the caller (the placeholder when replaced).
    pub result: GenerationResult,
    /// Input guardrail verdicts.
    pub input_summary: ExecutionSummary,
    /// Attempt history, absent when input was blocked.
    pub outcome: Option<RetryOutcome>,
    /// Whether any stage blocked.
    pub blocked: bool,
    /// Whether `result` is a lenient-mode placeholder.
    pub replaced: bool,
}

/// A [`Generator`] wrapped with input and output guardrails.
#[derive(Clone)]
pub struct GuardedGenerator {
    generator: Arc<dyn Generator>,
    input_guardrails: Arc<[InputGuardrail]>,
    output_guardrails: Arc<[OutputGuardrail]>,
    runner: GuardrailRunner,
    retry: RetryConfig,
    stream: StreamConfig,
    block_mode: BlockMode,
    token_budget: Option<usize>,
    hooks: Arc<dyn GuardrailHooks>,
}

impl fmt::Debug for GuardedGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuardedGenerator")
            .field("input_guardrails", &self.input_guardrails.len())
            .field("output_guardrails", &self.output_guardrails.len())
            .field("runner", &self.runner)
            .field("retry", &self.retry)
            .field("stream", &self.stream)
            .field("block_mode", &self.block_mode)
            .field("token_budget", &self.token_budget)
            .finish_non_exhaustive()
    }
}

impl GuardedGenerator {
    /// Wrap `generator` with default settings and no guardrails.
    #[must_use]
    pub fn new(generator: impl Generator + 'static) -> Self {
        Self::from_config(generator, GuardConfig::default())
    }

    /// Wrap `generator` using a loaded configuration.
    #[must_use]
    pub fn from_config(generator: impl Generator + 'static, config: GuardConfig) -> Self {
        Self {
            generator: Arc::new(generator),
            input_guardrails: Arc::from(Vec::new()),
            output_guardrails: Arc::from(Vec::new()),
            runner: GuardrailRunner::new(config.runner),
            retry: config.retry.into(),
            stream: config.stream,
            block_mode: config.block_mode,
            token_budget: config.token_budget,
            hooks: Arc::new(NoopHooks),
        }
    }

    /// Add an input guardrail.
    #[must_use]
    pub fn input_guardrail(mut self, guardrail: InputGuardrail) -> Self {
        let mut all = self.input_guardrails.to_vec();
        all.push(guardrail);
        self.input_guardrails = all.into();
        self
    }

    /// Replace the input guardrails.
    #[must_use]
    pub fn input_guardrails(mut self, guardrails: Vec<InputGuardrail>) -> Self {
        self.input_guardrails = guardrails.into();
        self
    }

    /// Add an output guardrail.
    #[must_use]
    pub fn output_guardrail(mut self, guardrail: OutputGuardrail) -> Self {
        let mut all = self.output_guardrails.to_vec();
        all.push(guardrail);
        self.output_guardrails = all.into();
        self
    }

    /// Replace the output guardrails.
    #[must_use]
    pub fn output_guardrails(mut self, guardrails: Vec<OutputGuardrail>) -> Self {
        self.output_guardrails = guardrails.into();
        self
    }

    /// Use a preconfigured runner (custom tracer, shared pool).
    #[must_use]
    pub fn runner(mut self, runner: GuardrailRunner) -> Self {
        self.runner = runner;
        self
    }

    /// Set the output retry policy.
    #[must_use]
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Set the stream evaluation options.
    #[must_use]
    pub fn stream_config(mut self, stream: StreamConfig) -> Self {
        self.stream = stream;
        self
    }

    /// Set strict or lenient disposition.
    #[must_use]
    pub fn block_mode(mut self, mode: BlockMode) -> Self {
        self.block_mode = mode;
        self
    }

    /// Cap streamed output at `max_tokens` estimated tokens.
    #[must_use]
    pub const fn token_budget(mut self, max_tokens: usize) -> Self {
        self.token_budget = Some(max_tokens);
        self
    }

    /// Set the lifecycle hooks.
    #[must_use]
    pub fn hooks(mut self, hooks: impl GuardrailHooks + 'static) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    /// The shared runner.
    #[must_use]
    pub const fn get_runner(&self) -> &GuardrailRunner {
        &self.runner
    }

    /// Run only the input guardrails.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] or [`Error::InvalidConfig`]; blocks are
    /// reported in the summary, not as errors.
    pub async fn check_input(
        &self,
        params: &GenerationParams,
        cancel: &CancellationToken,
    ) -> Result<ExecutionSummary> {
        let context = InputContext::from_params(params);
        self.runner
            .evaluate(&self.input_guardrails[..], &context, Some(cancel))
            .await
    }

    /// Guarded one-shot generation.
    ///
    /// # Errors
    ///
    /// Strict mode returns [`Error::InputBlocked`] or
    /// [`Error::OutputBlocked`]. Generator failures, cancellation and
    /// invalid configuration are returned in either mode.
    pub async fn generate(
        &self,
        params: &GenerationParams,
        cancel: &CancellationToken,
    ) -> Result<GuardedOutput> {
        let input = InputContext::from_params(params);
        let input_summary = self
            .runner
            .evaluate(&self.input_guardrails[..], &input, Some(cancel))
            .await?;

        if input_summary.is_blocked() {
            if self.runner.logs(LogLevel::Warn) {
                warn!(blocked = input_summary.blocked(), "input blocked by guardrails");
            }
            self.hooks.on_input_blocked(&input_summary, &input).await;
            let placeholder = self.placeholder_or_else(|| Error::input_blocked(&input_summary))?;
            return Ok(GuardedOutput {
                result: placeholder_result(placeholder),
                input_summary,
                outcome: None,
                blocked: true,
                replaced: true,
            });
        }

        let orchestrator = RetryOrchestrator::new(self.runner.clone(), self.retry.clone());
        let outcome = orchestrator
            .execute(
                params.clone(),
                self.generator.as_ref(),
                &self.output_guardrails[..],
                cancel,
            )
            .await?;

        if !outcome.is_blocked() {
            return Ok(GuardedOutput {
                result: outcome.result().clone(),
                input_summary,
                outcome: Some(outcome),
                blocked: false,
                replaced: false,
            });
        }

        if self.runner.logs(LogLevel::Warn) {
            warn!(
                attempts = outcome.attempt_count(),
                blocked = outcome.summary().blocked(),
                "output blocked by guardrails"
            );
        }
        let context = OutputContext::new(input, outcome.result().clone());
        self.hooks
            .on_output_blocked(outcome.summary(), &context, outcome.result())
            .await;
        let placeholder = self.placeholder_or_else(|| {
            Error::output_blocked(outcome.summary(), outcome.attempt_count())
        })?;
        Ok(GuardedOutput {
            result: placeholder_result(placeholder),
            input_summary,
            outcome: Some(outcome),
            blocked: true,
            replaced: true,
        })
    }

    /// Guarded streaming generation.
    ///
    /// Input guardrails run before the upstream stream is opened. Output
    /// violations are handled in-stream by the [`StreamEvaluator`]; when
    /// retries are configured, blocked buffer-mode output is repaired.
    ///
    /// # Errors
    ///
    /// Strict mode returns [`Error::InputBlocked`]. Errors opening the
    /// upstream stream and cancellation are returned in either mode; later
    /// failures arrive as stream items.
    pub async fn stream(
        &self,
        params: &GenerationParams,
        cancel: &CancellationToken,
    ) -> Result<ChunkStream> {
        let input = InputContext::from_params(params);
        let input_summary = self
            .runner
            .evaluate(&self.input_guardrails[..], &input, Some(cancel))
            .await?;

        if input_summary.is_blocked() {
            if self.runner.logs(LogLevel::Warn) {
                warn!(blocked = input_summary.blocked(), "input blocked by guardrails");
            }
            self.hooks.on_input_blocked(&input_summary, &input).await;
            let placeholder = self.placeholder_or_else(|| Error::input_blocked(&input_summary))?;
            let chunks = vec![
                Ok(StreamChunk::text(placeholder)),
                Ok(StreamChunk::finish(FinishReason::GuardrailBlocked)),
            ];
            return Ok(Box::pin(futures::stream::iter(chunks)));
        }

        let mut upstream = cancellable(self.generator.stream(params, cancel), cancel)
            .await
            .map_err(|_| Error::Cancelled)??;

        if let Some(max_tokens) = self.token_budget {
            upstream = TokenBudgetGate::new(max_tokens)
                .with_hooks(Arc::clone(&self.hooks))
                .wrap(upstream);
        }
        if self.output_guardrails.is_empty() {
            return Ok(upstream);
        }

        let mut evaluator = StreamEvaluator::new(
            self.runner.clone(),
            Arc::clone(&self.output_guardrails),
            self.stream.clone(),
        )
        .hooks(Arc::clone(&self.hooks));
        if self.retry.max_retries > 0 {
            let orchestrator = RetryOrchestrator::new(self.runner.clone(), self.retry.clone());
            evaluator = evaluator.repair_with(orchestrator, Arc::clone(&self.generator));
        }
        if self.runner.logs(LogLevel::Info) {
            info!(mode = ?self.stream.mode, "streaming with output guardrails");
        }
        Ok(evaluator.wrap(upstream, params, cancel.clone()))
    }

    fn placeholder_or_else(&self, strict: impl FnOnce() -> Error) -> Result<String> {
        match &self.block_mode {
            BlockMode::Strict => Err(strict()),
            BlockMode::Lenient { placeholder } => Ok(placeholder.clone()),
        }
    }
}

fn placeholder_result(text: String) -> GenerationResult {
    GenerationResult {
        text,
        finish_reason: FinishReason::GuardrailBlocked,
        ..GenerationResult::default()
    }
}
