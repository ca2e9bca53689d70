//! Core types for generation requests, results and stream chunks.
//!
//! The engine treats the model call as opaque, so these types are the
//! smallest vocabulary it needs: the parameters it may mutate between
//! retries, the result it hands to output guardrails, and the chunks it
//! inspects while a response streams.

use std::pin::Pin;

use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;

/// The author of a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions.
    System,
    /// End-user input.
    User,
    /// Model output.
    Assistant,
    /// Tool output fed back to the model.
    Tool,
}

/// A single conversation message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Author of the message.
    pub role: Role,
    /// Text content.
    pub content: String,
}

impl Message {
    /// Create a message with an explicit role.
    #[must_use]
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    /// Create a system message.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Create a user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Create an assistant message.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Parameters for one generation call.
///
/// Either `prompt` or `messages` (or both) carry the request. The retry
/// path appends remediation instructions to `messages` and may nudge
/// `temperature`; everything else is passed through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    /// Model identifier, if the generator needs one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// System prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    /// Single-shot prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    /// Conversation messages.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<Message>,
    /// Sampling temperature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Output token limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Provider-specific options, passed through verbatim.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl GenerationParams {
    /// Create empty parameters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create parameters from a single prompt.
    #[must_use]
    pub fn from_prompt(prompt: impl Into<String>) -> Self {
        Self {
            prompt: Some(prompt.into()),
            ..Self::default()
        }
    }

    /// Create parameters from a message list.
    #[must_use]
    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    /// Set the model identifier.
    #[must_use]
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Set the system prompt.
    #[must_use]
    pub fn system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Set the sampling temperature.
    #[must_use]
    pub const fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Set the output token limit.
    #[must_use]
    pub const fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Append a message.
    #[must_use]
    pub fn message(mut self, message: Message) -> Self {
        self.messages.push(message);
        self
    }

    /// Set a provider-specific option.
    #[must_use]
    pub fn extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// Why a generation (or stream) ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FinishReason {
    /// Natural end of output.
    #[default]
    Stop,
    /// Output token limit reached.
    Length,
    /// The model requested tool calls.
    ToolCalls,
    /// The provider filtered the content.
    ContentFilter,
    /// A guardrail stopped the output.
    GuardrailBlocked,
    /// Generation failed.
    Error,
    /// Anything else the provider reports.
    Other,
}

/// Token usage information from a generation call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    /// Number of tokens in the input/prompt.
    pub input_tokens: u32,
    /// Number of tokens in the output/completion.
    pub output_tokens: u32,
}

impl TokenUsage {
    /// Create new token usage with specified counts.
    #[must_use]
    pub const fn new(input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    /// Get total token count.
    #[must_use]
    pub const fn total(&self) -> u32 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

/// Result of one generation call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    /// Generated text.
    pub text: String,
    /// Structured output, for object generation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<Value>,
    /// Why generation stopped.
    #[serde(default)]
    pub finish_reason: FinishReason,
    /// Token usage, if reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    /// Raw provider response, for debugging.
    #[serde(skip)]
    pub raw: Option<Value>,
}

impl GenerationResult {
    /// Create a result holding plain text.
    #[must_use]
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    /// Create a result holding a structured object.
    #[must_use]
    pub fn from_object(object: Value) -> Self {
        Self {
            text: object.to_string(),
            object: Some(object),
            ..Self::default()
        }
    }

    /// Set the finish reason.
    #[must_use]
    pub const fn with_finish_reason(mut self, reason: FinishReason) -> Self {
        self.finish_reason = reason;
        self
    }

    /// Set token usage.
    #[must_use]
    pub const fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Set the raw provider response.
    #[must_use]
    pub fn with_raw(mut self, raw: Value) -> Self {
        self.raw = Some(raw);
        self
    }
}

/// One element of a streamed response.
///
/// Only [`StreamChunk::TextDelta`] feeds guardrail checks; every other
/// variant passes through evaluators untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamChunk {
    /// Incremental output text.
    TextDelta {
        /// The appended text.
        delta: String,
    },
    /// A tool invocation requested by the model.
    ToolCall {
        /// Provider call identifier.
        id: String,
        /// Tool name.
        name: String,
        /// Tool arguments.
        arguments: Value,
    },
    /// Provider metadata (response ids, warnings, ...).
    Metadata {
        /// Arbitrary payload.
        data: Value,
    },
    /// Terminal event.
    Finish {
        /// Why the stream ended.
        reason: FinishReason,
        /// Token usage, if reported.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<TokenUsage>,
    },
    /// In-band error notice.
    Error {
        /// Human-readable description.
        message: String,
    },
}

impl StreamChunk {
    /// Create a text delta chunk.
    #[must_use]
    pub fn text(delta: impl Into<String>) -> Self {
        Self::TextDelta {
            delta: delta.into(),
        }
    }

    /// Create a finish chunk without usage.
    #[must_use]
    pub const fn finish(reason: FinishReason) -> Self {
        Self::Finish {
            reason,
            usage: None,
        }
    }

    /// Create an in-band error chunk.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// The delta text, if this is a text chunk.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::TextDelta { delta } => Some(delta),
            _ => None,
        }
    }

    /// Returns `true` for the terminal finish event.
    #[must_use]
    pub const fn is_finish(&self) -> bool {
        matches!(self, Self::Finish { .. })
    }
}

/// Stream of response chunks.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;
