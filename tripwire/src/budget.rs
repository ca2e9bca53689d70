//! Token ceiling for streamed output.
//!
//! [`TokenBudgetGate`] cuts a stream off once the estimated token count of
//! the text seen so far passes a fixed budget. It looks at volume only,
//! never content, and composes with [`StreamEvaluator`](crate::stream::StreamEvaluator)
//! in either order.

use std::fmt;
use std::sync::Arc;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::hooks::{GuardrailHooks, NoopHooks};
use crate::types::{ChunkStream, StreamChunk};

/// Rough token count: a quarter of the characters plus half the words.
#[must_use]
pub fn estimate_tokens(text: &str) -> usize {
    let chars = text.chars().count();
    let words = text.split_whitespace().count();
    chars.div_ceil(4) + words.div_ceil(2)
}

/// Passed to [`GuardrailHooks::on_budget_exceeded`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetExceeded {
    /// Estimated tokens in the text seen so far.
    pub consumed: usize,
    /// The configured ceiling.
    pub budget: usize,
}

impl fmt::Display for BudgetExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "token budget exceeded: {} estimated tokens, budget {}",
            self.consumed, self.budget
        )
    }
}

type Estimator = dyn Fn(&str) -> usize + Send + Sync;

/// Stops a stream once its estimated token count exceeds `max_tokens`.
///
/// The chunk that crosses the ceiling is not forwarded. In its place the
/// gate emits one [`StreamChunk::Error`] and stops polling upstream.
#[derive(Clone)]
pub struct TokenBudgetGate {
    max_tokens: usize,
    estimator: Arc<Estimator>,
    hooks: Arc<dyn GuardrailHooks>,
}

impl fmt::Debug for TokenBudgetGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenBudgetGate")
            .field("max_tokens", &self.max_tokens)
            .finish_non_exhaustive()
    }
}

impl TokenBudgetGate {
    /// Create a gate using [`estimate_tokens`].
    #[must_use]
    pub fn new(max_tokens: usize) -> Self {
        Self {
            max_tokens,
            estimator: Arc::new(estimate_tokens),
            hooks: Arc::new(NoopHooks),
        }
    }

    /// Use a custom estimator over the accumulated text.
    #[must_use]
    pub fn with_estimator(mut self, estimator: impl Fn(&str) -> usize + Send + Sync + 'static) -> Self {
        self.estimator = Arc::new(estimator);
        self
    }

    /// Set the hooks notified when the budget is exceeded.
    #[must_use]
    pub fn with_hooks(mut self, hooks: Arc<dyn GuardrailHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// The token ceiling.
    #[must_use]
    pub const fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    /// Wrap `upstream`.
    #[must_use]
    pub fn wrap(&self, mut upstream: ChunkStream) -> ChunkStream {
        let gate = self.clone();
        Box::pin(async_stream::stream! {
            let mut text = String::new();
            while let Some(item) = upstream.next().await {
                if let Ok(StreamChunk::TextDelta { delta }) = &item {
                    text.push_str(delta);
                    let consumed = (gate.estimator)(&text);
                    if consumed > gate.max_tokens {
                        let exceeded = BudgetExceeded {
                            consumed,
                            budget: gate.max_tokens,
                        };
                        warn!(consumed, budget = gate.max_tokens, "token budget exceeded");
                        gate.hooks.on_budget_exceeded(&exceeded).await;
                        yield Ok(StreamChunk::error(exceeded.to_string()));
                        return;
                    }
                }
                let failed = item.is_err();
                yield item;
                if failed {
                    return;
                }
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::generate::text_stream;
    use crate::types::FinishReason;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<BudgetExceeded>>);

    #[async_trait]
    impl GuardrailHooks for Recorder {
        async fn on_budget_exceeded(&self, exceeded: &BudgetExceeded) {
            self.0.lock().unwrap().push(*exceeded);
        }
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        // 11 chars -> 3, 2 words -> 1
        assert_eq!(estimate_tokens("hello world"), 4);
        // 1 char -> 1, 1 word -> 1
        assert_eq!(estimate_tokens("a"), 2);
    }

    #[tokio::test]
    async fn test_under_budget_passes_through() {
        let gate = TokenBudgetGate::new(100);
        let out: Vec<_> = gate
            .wrap(text_stream(["short ", "reply"]))
            .map(Result::unwrap)
            .collect()
            .await;
        assert_eq!(
            out,
            [
                StreamChunk::text("short "),
                StreamChunk::text("reply"),
                StreamChunk::finish(FinishReason::Stop),
            ]
        );
    }

    #[tokio::test]
    async fn test_exceeding_budget_stops_stream() {
        let recorder = Arc::new(Recorder::default());
        let gate = TokenBudgetGate::new(5)
            .with_hooks(Arc::clone(&recorder) as Arc<dyn GuardrailHooks>);

        let out: Vec<_> = gate
            .wrap(text_stream(["one two ", "three four five six ", "seven"]))
            .map(Result::unwrap)
            .collect()
            .await;

        assert_eq!(out.len(), 2);
        assert_eq!(out[0], StreamChunk::text("one two "));
        assert!(matches!(&out[1], StreamChunk::Error { message } if message.contains("budget 5")));

        let calls = recorder.0.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].consumed > calls[0].budget);
        assert_eq!(calls[0].budget, 5);
    }

    #[tokio::test]
    async fn test_custom_estimator_counts_words() {
        let gate = TokenBudgetGate::new(3).with_estimator(|text| text.split_whitespace().count());
        let out: Vec<_> = gate
            .wrap(text_stream(["a b ", "c ", "d"]))
            .map(Result::unwrap)
            .collect()
            .await;
        assert_eq!(out.len(), 3);
        assert!(matches!(out[2], StreamChunk::Error { .. }));
    }
}
