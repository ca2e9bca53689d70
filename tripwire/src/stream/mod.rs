//! Output guardrails over a live chunk stream.
//!
//! A [`StreamEvaluator`] wraps an upstream [`ChunkStream`] and re-exposes a
//! guarded one. Chunks are delivered in upstream order; only text deltas
//! feed checks, every other chunk passes through untouched.
//!
//! # Buffer mode
//!
//! Every chunk is forwarded as it arrives while the text accumulates. The
//! upstream finish chunk is held back until one check has run over the
//! full text. On a block, the evaluator either repairs the output through
//! the retry path (if configured) and emits the repaired text as one final
//! chunk, or emits the replacement marker and a `guardrail-blocked` finish.
//!
//! # Progressive mode
//!
//! Text is checked every [`CheckInterval`]. A check runs before the chunk
//! that made it due is forwarded, so upstream is not polled while a check is
//! pending. Each blocking check is recorded as a [`Violation`]. The stream
//! is cut off when the current check meets `stop_on_severity`, or when the
//! stop condition (by default [`default_stop_policy`]) holds over the
//! violation history. Text that arrived after the last check is checked once
//! more before the stream ends.

mod config;

pub use config::{CheckInterval, StreamConfig, StreamMode};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::LogLevel;
use crate::error::Result;
use crate::generate::Generator;
use crate::guardrail::{InputContext, OutputContext, OutputGuardrail, Severity};
use crate::hooks::{GuardrailHooks, NoopHooks};
use crate::retry::{RetryAttempt, RetryOrchestrator};
use crate::runner::{ExecutionSummary, GuardrailRunner};
use crate::types::{ChunkStream, FinishReason, GenerationParams, GenerationResult, StreamChunk};

/// A blocking check observed while streaming.
#[derive(Debug, Clone, PartialEq)]
pub struct Violation {
    /// Number of text chunks seen when the check ran.
    pub chunk_index: usize,
    /// The blocking summary.
    pub summary: ExecutionSummary,
}

/// Stop after two violations, or after any critical one.
#[must_use]
pub fn default_stop_policy(violations: &[Violation]) -> bool {
    violations.len() >= 2
        || violations
            .iter()
            .any(|v| v.summary.highest_severity() == Some(Severity::Critical))
}

type StopConditionFn = dyn Fn(&[Violation]) -> bool + Send + Sync;

#[derive(Clone)]
struct StreamRepair {
    orchestrator: RetryOrchestrator,
    generator: Arc<dyn Generator>,
}

/// Applies output guardrails to a chunk stream.
#[derive(Clone)]
pub struct StreamEvaluator {
    runner: GuardrailRunner,
    guardrails: Arc<[OutputGuardrail]>,
    config: StreamConfig,
    stop_condition: Option<Arc<StopConditionFn>>,
    hooks: Arc<dyn GuardrailHooks>,
    repair: Option<StreamRepair>,
}

impl fmt::Debug for StreamEvaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamEvaluator")
            .field("guardrails", &self.guardrails.len())
            .field("config", &self.config)
            .field("stop_condition", &self.stop_condition.is_some())
            .field("repair", &self.repair.is_some())
            .finish_non_exhaustive()
    }
}

/// What the progressive loop does after a check.
enum Decision {
    Continue,
    Stop(ExecutionSummary),
}

impl StreamEvaluator {
    /// Create an evaluator.
    #[must_use]
    pub fn new(
        runner: GuardrailRunner,
        guardrails: impl Into<Arc<[OutputGuardrail]>>,
        config: StreamConfig,
    ) -> Self {
        Self {
            runner,
            guardrails: guardrails.into(),
            config,
            stop_condition: None,
            hooks: Arc::new(NoopHooks),
            repair: None,
        }
    }

    /// Replace the default stop policy.
    #[must_use]
    pub fn stop_condition(
        mut self,
        condition: impl Fn(&[Violation]) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.stop_condition = Some(Arc::new(condition));
        self
    }

    /// Set the hooks notified of violations.
    #[must_use]
    pub fn hooks(mut self, hooks: Arc<dyn GuardrailHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Repair blocked buffer-mode output by regenerating through `orchestrator`.
    #[must_use]
    pub fn repair_with(mut self, orchestrator: RetryOrchestrator, generator: Arc<dyn Generator>) -> Self {
        self.repair = Some(StreamRepair {
            orchestrator,
            generator,
        });
        self
    }

    /// The stream configuration.
    #[must_use]
    pub const fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Wrap `upstream`, which was produced from `params`.
    ///
    /// Errors (upstream failures, cancellation, invalid configuration) are
    /// yielded as the last item of the returned stream.
    #[must_use]
    pub fn wrap(
        &self,
        upstream: ChunkStream,
        params: &GenerationParams,
        cancel: CancellationToken,
    ) -> ChunkStream {
        match self.config.mode {
            StreamMode::Buffer => Box::pin(self.clone().buffered(upstream, params.clone(), cancel)),
            StreamMode::Progressive => {
                Box::pin(self.clone().progressive(upstream, InputContext::from_params(params), cancel))
            }
        }
    }

    fn buffered(
        self,
        mut upstream: ChunkStream,
        params: GenerationParams,
        cancel: CancellationToken,
    ) -> impl Stream<Item = Result<StreamChunk>> + Send {
        async_stream::stream! {
            let mut text = String::new();
            let mut chunk_index = 0usize;
            let mut finish = None;

            while let Some(item) = upstream.next().await {
                match item {
                    Err(err) => {
                        yield Err(err);
                        return;
                    }
                    Ok(chunk @ StreamChunk::Finish { .. }) => finish = Some(chunk),
                    Ok(chunk) => {
                        if let Some(delta) = chunk.as_text() {
                            text.push_str(delta);
                            chunk_index += 1;
                        }
                        yield Ok(chunk);
                    }
                }
            }

            let input = InputContext::from_params(&params);
            let summary = match self.check(&input, &text, chunk_index, &cancel).await {
                Ok(summary) => summary,
                Err(err) => {
                    yield Err(err);
                    return;
                }
            };
            if !summary.is_blocked() {
                if let Some(chunk) = finish {
                    yield Ok(chunk);
                }
                return;
            }

            if self.runner.logs(LogLevel::Warn) {
                warn!(chunks = chunk_index, blocked = summary.blocked(), "buffered stream blocked");
            }
            self.hooks.on_violation(&summary).await;

            if let Some(repair) = &self.repair {
                let first = RetryAttempt::new(
                    1,
                    params.clone(),
                    GenerationResult::from_text(text),
                    summary,
                    Duration::ZERO,
                );
                match repair
                    .orchestrator
                    .recover(&params, first, repair.generator.as_ref(), &self.guardrails[..], &cancel)
                    .await
                {
                    Ok(outcome) if !outcome.is_blocked() => {
                        if self.runner.logs(LogLevel::Debug) {
                            debug!(attempts = outcome.attempt_count(), "buffered stream repaired");
                        }
                        let result = outcome.into_last().result;
                        yield Ok(StreamChunk::text(result.text));
                        yield Ok(StreamChunk::Finish {
                            reason: result.finish_reason,
                            usage: result.usage,
                        });
                        return;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        yield Err(err);
                        return;
                    }
                }
            }

            if self.config.replace_on_block {
                for chunk in self.termination_chunks() {
                    yield Ok(chunk);
                }
            } else if let Some(chunk) = finish {
                yield Ok(chunk);
            }
        }
    }

    fn progressive(
        self,
        mut upstream: ChunkStream,
        input: InputContext,
        cancel: CancellationToken,
    ) -> impl Stream<Item = Result<StreamChunk>> + Send {
        async_stream::stream! {
            if let Err(err) = self.config.validate() {
                yield Err(err);
                return;
            }

            let interval = self.config.check_interval;
            let mut text = String::new();
            let mut chunk_index = 0usize;
            let mut last_check = 0usize;
            let mut pending = false;
            let mut violations: Vec<Violation> = Vec::new();

            loop {
                let (forward, due) = match upstream.next().await {
                    None => (None, pending),
                    Some(Err(err)) => {
                        yield Err(err);
                        return;
                    }
                    Some(Ok(chunk)) => {
                        let due = match &chunk {
                            StreamChunk::TextDelta { delta } => {
                                text.push_str(delta);
                                chunk_index += 1;
                                pending = true;
                                interval.is_due(interval.position(chunk_index, &text), last_check)
                            }
                            StreamChunk::Finish { .. } => pending,
                            _ => false,
                        };
                        (Some(chunk), due)
                    }
                };

                if due {
                    last_check = interval.position(chunk_index, &text);
                    pending = false;
                    let decision = match self.check(&input, &text, chunk_index, &cancel).await {
                        Ok(summary) => self.decide(summary, chunk_index, &mut violations),
                        Err(err) => {
                            yield Err(err);
                            return;
                        }
                    };
                    if let Decision::Stop(summary) = decision {
                        if self.runner.logs(LogLevel::Warn) {
                            warn!(
                                chunk_index,
                                violations = violations.len(),
                                severity = ?summary.highest_severity(),
                                "stream terminated by guardrails"
                            );
                        }
                        self.hooks.on_violation(&summary).await;
                        for chunk in self.termination_chunks() {
                            yield Ok(chunk);
                        }
                        return;
                    }
                }

                match forward {
                    Some(chunk) => yield Ok(chunk),
                    None => return,
                }
            }
        }
    }

    async fn check(
        &self,
        input: &InputContext,
        text: &str,
        chunk_index: usize,
        cancel: &CancellationToken,
    ) -> Result<ExecutionSummary> {
        let context = OutputContext::streaming(input.clone(), text.to_owned(), chunk_index);
        self.runner
            .evaluate(&self.guardrails[..], &context, Some(cancel))
            .await
    }

    fn decide(
        &self,
        summary: ExecutionSummary,
        chunk_index: usize,
        violations: &mut Vec<Violation>,
    ) -> Decision {
        if !summary.is_blocked() {
            return Decision::Continue;
        }

        let over_threshold = self
            .config
            .stop_on_severity
            .zip(summary.highest_severity())
            .is_some_and(|(threshold, severity)| severity >= threshold);
        violations.push(Violation {
            chunk_index,
            summary: summary.clone(),
        });
        let history: &[Violation] = violations;
        let stop = over_threshold
            || self
                .stop_condition
                .as_ref()
                .map_or_else(|| default_stop_policy(history), |f| f(history));

        if stop {
            Decision::Stop(summary)
        } else {
            if self.runner.logs(LogLevel::Debug) {
                debug!(chunk_index, violations = violations.len(), "stream violation recorded");
            }
            Decision::Continue
        }
    }

    fn termination_chunks(&self) -> Vec<StreamChunk> {
        let mut chunks = Vec::with_capacity(2);
        if self.config.replace_on_block {
            chunks.push(StreamChunk::text(self.config.replacement_text.clone()));
        }
        chunks.push(StreamChunk::finish(FinishReason::GuardrailBlocked));
        chunks
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::generate::{generator_fn, text_stream};
    use crate::guardrail::{Guardrail, GuardrailOutput};
    use crate::retry::RetryConfig;

    fn counting(
        calls: &Arc<AtomicUsize>,
        verdict: impl Fn(&str) -> GuardrailOutput + Send + Sync + 'static,
    ) -> OutputGuardrail {
        let calls = Arc::clone(calls);
        OutputGuardrail::from_fn("scan", move |ctx: &OutputContext| {
            calls.fetch_add(1, Ordering::SeqCst);
            verdict(ctx.text())
        })
    }

    fn evaluator(guardrail: OutputGuardrail, config: StreamConfig) -> StreamEvaluator {
        StreamEvaluator::new(GuardrailRunner::default(), vec![guardrail], config)
    }

    async fn drain(stream: ChunkStream) -> Vec<StreamChunk> {
        stream.map(Result::unwrap).collect().await
    }

    fn texts(chunks: &[StreamChunk]) -> Vec<&str> {
        chunks.iter().filter_map(StreamChunk::as_text).collect()
    }

    #[derive(Default)]
    struct Recorder {
        violations: Mutex<Vec<ExecutionSummary>>,
    }

    #[async_trait]
    impl GuardrailHooks for Recorder {
        async fn on_violation(&self, summary: &ExecutionSummary) {
            self.violations.lock().unwrap().push(summary.clone());
        }
    }

    #[tokio::test]
    async fn test_progressive_checks_on_interval() {
        let calls = Arc::new(AtomicUsize::new(0));
        let eval = evaluator(
            counting(&calls, |_| GuardrailOutput::pass()),
            StreamConfig::progressive().check_interval(CheckInterval::Chunks(2)),
        );

        let out = drain(eval.wrap(
            text_stream(["a", "b", "c", "d"]),
            &GenerationParams::new(),
            CancellationToken::new(),
        ))
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(texts(&out), ["a", "b", "c", "d"]);
        assert_eq!(out.last(), Some(&StreamChunk::finish(FinishReason::Stop)));
    }

    #[tokio::test]
    async fn test_progressive_token_interval_measures_whole_text() {
        let letters: Vec<String> = ('a'..='p').map(String::from).collect();
        let calls = Arc::new(AtomicUsize::new(0));
        let eval = evaluator(
            counting(&calls, |_| GuardrailOutput::pass()),
            StreamConfig::progressive().check_interval(CheckInterval::Tokens(6)),
        );
        let out = drain(eval.wrap(
            text_stream(letters),
            &GenerationParams::new(),
            CancellationToken::new(),
        ))
        .await;

        // 16 characters in one word estimate to 5 tokens: only the final flush runs.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(texts(&out).len(), 16);

        let letters: Vec<String> = ('a'..='t').map(String::from).collect();
        let calls = Arc::new(AtomicUsize::new(0));
        let eval = evaluator(
            counting(&calls, |_| GuardrailOutput::pass()),
            StreamConfig::progressive().check_interval(CheckInterval::Tokens(6)),
        );
        let _ = drain(eval.wrap(
            text_stream(letters),
            &GenerationParams::new(),
            CancellationToken::new(),
        ))
        .await;

        // Due once at the 17th character, then the trailing text is flushed.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_progressive_final_flush_checks_trailing_text() {
        let calls = Arc::new(AtomicUsize::new(0));
        let eval = evaluator(
            counting(&calls, |_| GuardrailOutput::pass()),
            StreamConfig::progressive().check_interval(CheckInterval::Chunks(2)),
        );
        let _ = drain(eval.wrap(
            text_stream(["a", "b", "c"]),
            &GenerationParams::new(),
            CancellationToken::new(),
        ))
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_critical_violation_stops_stream_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let recorder = Arc::new(Recorder::default());
        let eval = evaluator(
            counting(&calls, |text| {
                if text.contains("secret") {
                    GuardrailOutput::tripwire("leak").with_severity(Severity::Critical)
                } else {
                    GuardrailOutput::pass()
                }
            }),
            StreamConfig::progressive(),
        )
        .hooks(Arc::clone(&recorder) as Arc<dyn GuardrailHooks>);

        let out = drain(eval.wrap(
            text_stream(["hello ", "the secret ", "is ", "42"]),
            &GenerationParams::new(),
            CancellationToken::new(),
        ))
        .await;

        assert_eq!(
            out,
            [
                StreamChunk::text("hello "),
                StreamChunk::text("[Content blocked by guardrails]"),
                StreamChunk::finish(FinishReason::GuardrailBlocked),
            ]
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let violations = recorder.violations.lock().unwrap();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].highest_severity(), Some(Severity::Critical));
    }

    #[tokio::test]
    async fn test_default_policy_tolerates_one_minor_violation() {
        let calls = Arc::new(AtomicUsize::new(0));
        let eval = evaluator(
            counting(&calls, |text| {
                if text.contains("darn") {
                    GuardrailOutput::tripwire("mild language").with_severity(Severity::Low)
                } else {
                    GuardrailOutput::pass()
                }
            }),
            StreamConfig::progressive().replace_on_block(false),
        );

        let out = drain(eval.wrap(
            text_stream(["oh ", "darn", " it", " again"]),
            &GenerationParams::new(),
            CancellationToken::new(),
        ))
        .await;

        // First violation at "darn" is recorded, second at " it" stops the stream.
        assert_eq!(texts(&out), ["oh ", "darn"]);
        assert_eq!(out.last(), Some(&StreamChunk::finish(FinishReason::GuardrailBlocked)));
    }

    #[tokio::test]
    async fn test_severity_threshold_and_custom_condition() {
        let calls = Arc::new(AtomicUsize::new(0));
        let eval = evaluator(
            counting(&calls, |text| {
                if text.contains('!') {
                    GuardrailOutput::tripwire("shouting").with_severity(Severity::High)
                } else {
                    GuardrailOutput::pass()
                }
            }),
            StreamConfig::progressive().stop_on_severity(Severity::High),
        )
        .stop_condition(|_| false);

        let out = drain(eval.wrap(
            text_stream(["calm", " loud!", " more"]),
            &GenerationParams::new(),
            CancellationToken::new(),
        ))
        .await;
        assert_eq!(texts(&out)[0], "calm");
        assert_eq!(out.len(), 3);

        let never = evaluator(
            counting(&calls, |_| GuardrailOutput::tripwire("always").with_severity(Severity::Critical)),
            StreamConfig::progressive(),
        )
        .stop_condition(|_| false);
        let out = drain(never.wrap(
            text_stream(["x", "y"]),
            &GenerationParams::new(),
            CancellationToken::new(),
        ))
        .await;
        assert_eq!(texts(&out), ["x", "y"]);
    }

    #[tokio::test]
    async fn test_non_text_chunks_pass_without_checks() {
        let calls = Arc::new(AtomicUsize::new(0));
        let eval = evaluator(
            counting(&calls, |_| GuardrailOutput::pass()),
            StreamConfig::progressive(),
        );
        let upstream: ChunkStream = Box::pin(futures::stream::iter(vec![
            Ok(StreamChunk::Metadata {
                data: serde_json::json!({ "id": "resp_1" }),
            }),
            Ok(StreamChunk::ToolCall {
                id: "call_1".into(),
                name: "lookup".into(),
                arguments: serde_json::json!({}),
            }),
        ]));

        let out = drain(eval.wrap(upstream, &GenerationParams::new(), CancellationToken::new())).await;
        assert_eq!(out.len(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_buffer_mode_replaces_after_full_text() {
        let calls = Arc::new(AtomicUsize::new(0));
        let recorder = Arc::new(Recorder::default());
        let eval = evaluator(
            counting(&calls, |text| {
                if text.contains("bad word") {
                    GuardrailOutput::tripwire("profanity")
                } else {
                    GuardrailOutput::pass()
                }
            }),
            StreamConfig::buffer(),
        )
        .hooks(Arc::clone(&recorder) as Arc<dyn GuardrailHooks>);

        let out = drain(eval.wrap(
            text_stream(["a bad", " word"]),
            &GenerationParams::new(),
            CancellationToken::new(),
        ))
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            out,
            [
                StreamChunk::text("a bad"),
                StreamChunk::text(" word"),
                StreamChunk::text("[Content blocked by guardrails]"),
                StreamChunk::finish(FinishReason::GuardrailBlocked),
            ]
        );
        assert_eq!(recorder.violations.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_buffer_mode_without_replacement_keeps_finish() {
        let calls = Arc::new(AtomicUsize::new(0));
        let eval = evaluator(
            counting(&calls, |_| GuardrailOutput::tripwire("nope")),
            StreamConfig::buffer().replace_on_block(false),
        );
        let out = drain(eval.wrap(
            text_stream(["text"]),
            &GenerationParams::new(),
            CancellationToken::new(),
        ))
        .await;
        assert_eq!(
            out,
            [StreamChunk::text("text"), StreamChunk::finish(FinishReason::Stop)]
        );
    }

    #[tokio::test]
    async fn test_buffer_mode_repairs_through_retry() {
        let calls = Arc::new(AtomicUsize::new(0));
        let guardrail = counting(&calls, |text| {
            if text.contains("bad") {
                GuardrailOutput::tripwire("bad content")
            } else {
                GuardrailOutput::pass()
            }
        });
        let generator: Arc<dyn Generator> = Arc::new(generator_fn(|_, _| async {
            Ok::<_, crate::error::Error>(GenerationResult::from_text("all good now"))
        }));
        let orchestrator =
            RetryOrchestrator::new(GuardrailRunner::default(), RetryConfig::new(1));
        let eval = evaluator(guardrail, StreamConfig::buffer()).repair_with(orchestrator, generator);

        let out = drain(eval.wrap(
            text_stream(["so bad"]),
            &GenerationParams::from_prompt("hi"),
            CancellationToken::new(),
        ))
        .await;

        assert_eq!(texts(&out), ["so bad", "all good now"]);
        assert_eq!(out.last(), Some(&StreamChunk::finish(FinishReason::Stop)));
    }

    #[tokio::test]
    async fn test_buffer_repair_with_invalid_retry_config_yields_error() {
        let guardrail = Guardrail::from_fn("scan", |ctx: &OutputContext| {
            if ctx.text().contains("bad") {
                GuardrailOutput::tripwire("bad content")
            } else {
                GuardrailOutput::pass()
            }
        })
        .retry_instruction(|_| {
            Some(crate::guardrail::Remediation::new("fix it").with_temperature_adjustment(-0.1))
        });
        let generator: Arc<dyn Generator> = Arc::new(generator_fn(|_, _| async {
            Ok::<_, crate::error::Error>(GenerationResult::from_text("fine"))
        }));
        let orchestrator = RetryOrchestrator::new(
            GuardrailRunner::default(),
            RetryConfig::new(1).temperature_range(1.0, 0.5),
        );
        let eval = evaluator(guardrail, StreamConfig::buffer()).repair_with(orchestrator, generator);

        let items: Vec<_> = eval
            .wrap(
                text_stream(["so bad"]),
                &GenerationParams::from_prompt("hi").temperature(0.7),
                CancellationToken::new(),
            )
            .collect()
            .await;

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), &StreamChunk::text("so bad"));
        assert!(matches!(items[1], Err(crate::error::Error::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_upstream_error_is_forwarded_and_ends_stream() {
        let eval = evaluator(
            Guardrail::from_fn("pass", |_: &OutputContext| GuardrailOutput::pass()),
            StreamConfig::progressive(),
        );
        let upstream: ChunkStream = Box::pin(futures::stream::iter(vec![
            Ok(StreamChunk::text("a")),
            Err(crate::error::Error::stream("connection reset")),
            Ok(StreamChunk::text("never")),
        ]));

        let items: Vec<_> = eval
            .wrap(upstream, &GenerationParams::new(), CancellationToken::new())
            .collect()
            .await;
        assert_eq!(items.len(), 2);
        assert!(items[1].is_err());
    }
}
