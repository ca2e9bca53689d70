//! Unified error types for the tripwire engine.
//!
//! This module separates two very different kinds of failure:
//! - [`GuardrailError`] is what a single check returns when it cannot
//!   produce a verdict. The runner always converts it into a fail-closed
//!   result; it never reaches the caller.
//! - [`Error`] is what the engine itself returns: cancellation, generator
//!   failures, strict-mode blocks and invalid configuration.

use serde::{Deserialize, Serialize};

use crate::guardrail::Severity;
use crate::runner::ExecutionSummary;

/// Result type alias for tripwire operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for the tripwire engine.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The caller's cancellation token fired.
    ///
    /// This is never produced by a guardrail verdict: it means the caller
    /// gave up, not that the content is unsafe.
    #[error("Operation was cancelled")]
    Cancelled,

    /// Input guardrails blocked the request (strict mode).
    #[error("Input blocked by guardrails: {}", describe_blocked(.guardrails))]
    InputBlocked {
        /// The guardrails that triggered.
        guardrails: Vec<BlockedGuardrail>,
    },

    /// Output guardrails blocked the response after all retries (strict mode).
    #[error(
        "Output blocked by guardrails after {attempts} attempt(s): {}",
        describe_blocked(.guardrails)
    )]
    OutputBlocked {
        /// The guardrails that triggered on the final attempt.
        guardrails: Vec<BlockedGuardrail>,
        /// Number of generation calls made.
        attempts: u32,
    },

    /// The underlying generator failed.
    #[error("Generation failed: {0}")]
    Generation(String),

    /// The upstream chunk source failed.
    #[error("Stream error: {0}")]
    Stream(String),

    /// The engine was configured with values it cannot honor.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create a generation error with a message.
    #[must_use]
    pub fn generation(msg: impl Into<String>) -> Self {
        Self::Generation(msg.into())
    }

    /// Create a stream error with a message.
    #[must_use]
    pub fn stream(msg: impl Into<String>) -> Self {
        Self::Stream(msg.into())
    }

    /// Create an invalid configuration error.
    #[must_use]
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create an input-blocked error from a blocking summary.
    #[must_use]
    pub fn input_blocked(summary: &ExecutionSummary) -> Self {
        Self::InputBlocked {
            guardrails: summary.blocked_guardrails(),
        }
    }

    /// Create an output-blocked error from the final attempt's summary.
    #[must_use]
    pub fn output_blocked(summary: &ExecutionSummary, attempts: u32) -> Self {
        Self::OutputBlocked {
            guardrails: summary.blocked_guardrails(),
            attempts,
        }
    }

    /// Returns `true` if this error represents caller cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns `true` if this error is a strict-mode guardrail block.
    #[must_use]
    pub const fn is_blocked(&self) -> bool {
        matches!(self, Self::InputBlocked { .. } | Self::OutputBlocked { .. })
    }

    /// The offending guardrails, if this is a block error.
    #[must_use]
    pub fn blocked_guardrails(&self) -> &[BlockedGuardrail] {
        match self {
            Self::InputBlocked { guardrails } | Self::OutputBlocked { guardrails, .. } => {
                guardrails
            }
            _ => &[],
        }
    }
}

/// A guardrail that blocked, as reported in strict-mode errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedGuardrail {
    /// Name of the guardrail.
    pub name: String,
    /// Effective severity of the block.
    pub severity: Severity,
    /// Message reported by the guardrail, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Whether the block came from the guardrail failing to execute.
    pub execution_failed: bool,
}

impl std::fmt::Display for BlockedGuardrail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{}]", self.name, self.severity)?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        Ok(())
    }
}

fn describe_blocked(guardrails: &[BlockedGuardrail]) -> String {
    if guardrails.is_empty() {
        return "no details".to_owned();
    }
    guardrails
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Failure reported by a guardrail check that could not reach a verdict.
///
/// Returned from [`GuardrailCheck::check`](crate::guardrail::GuardrailCheck::check).
/// The runner converts it into a critical, blocking result.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct GuardrailError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl GuardrailError {
    /// Create a guardrail error with a message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Attach an underlying cause.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// The error message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for GuardrailError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for GuardrailError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<serde_json::Error> for GuardrailError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(format!("JSON error: {err}")).with_source(err)
    }
}
