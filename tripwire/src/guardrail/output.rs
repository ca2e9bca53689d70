//! Output guardrail context.
//!
//! Output guardrails validate a generation result. In streaming mode they
//! run repeatedly against the text accumulated so far, so the context
//! carries both the (possibly partial) result and stream position.

use serde::{Deserialize, Serialize};

use crate::types::GenerationResult;

use super::{Guardrail, InputContext};

/// A guardrail over a generation result.
pub type OutputGuardrail = Guardrail<OutputContext>;

/// What output guardrails see.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputContext {
    /// The request that produced this output.
    pub input: InputContext,
    /// The generation result. While streaming, its text is the accumulated text.
    pub result: GenerationResult,
    /// Set while streaming: text accumulated so far.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accumulated_text: Option<String>,
    /// Set while streaming: number of text chunks seen so far.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<usize>,
}

impl OutputContext {
    /// Context for a completed, non-streamed result.
    #[must_use]
    pub fn new(input: InputContext, result: GenerationResult) -> Self {
        Self {
            input,
            result,
            accumulated_text: None,
            chunk_index: None,
        }
    }

    /// Context for a stream in progress.
    #[must_use]
    pub fn streaming(input: InputContext, accumulated: String, chunk_index: usize) -> Self {
        Self {
            input,
            result: GenerationResult::from_text(accumulated.clone()),
            accumulated_text: Some(accumulated),
            chunk_index: Some(chunk_index),
        }
    }

    /// The text to validate: accumulated text while streaming, else the result text.
    #[must_use]
    pub fn text(&self) -> &str {
        self.accumulated_text
            .as_deref()
            .unwrap_or(self.result.text.as_str())
    }

    /// Returns `true` when built from a stream in progress.
    #[must_use]
    pub const fn is_streaming(&self) -> bool {
        self.accumulated_text.is_some()
    }
}
