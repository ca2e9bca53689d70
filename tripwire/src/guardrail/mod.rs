//! Guardrails: validation checks for generation inputs and outputs.
//!
//! A guardrail is a named, versioned check that inspects a context snapshot
//! and returns a [`GuardrailOutput`]. Two context types exist:
//!
//! - **[`InputGuardrail`]**: receives an [`InputContext`], the normalized
//!   request, before the generator is called.
//! - **[`OutputGuardrail`]**: receives an [`OutputContext`], which adds the
//!   generation result and, while streaming, the text accumulated so far.
//!
//! # Tripwire Mechanism
//!
//! Each check returns a `tripwire_triggered` flag. Only a triggered result
//! blocks; severity on a passing result is informational. A check that
//! fails to reach a verdict (returns an error, panics or times out) is
//! converted by the [`GuardrailRunner`](crate::runner::GuardrailRunner) into
//! a triggered `critical` result with `execution_failed` set.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use tripwire::prelude::*;
//!
//! struct NoSecrets;
//!
//! #[async_trait::async_trait]
//! impl GuardrailCheck<OutputContext> for NoSecrets {
//!     type Metadata = serde_json::Value;
//!
//!     async fn check(
//!         &self,
//!         context: &OutputContext,
//!         _cancel: &CancellationToken,
//!     ) -> Result<GuardrailOutput, GuardrailError> {
//!         if context.text().contains("sk-") {
//!             Ok(GuardrailOutput::tripwire("API key in output")
//!                 .with_severity(Severity::Critical))
//!         } else {
//!             Ok(GuardrailOutput::pass())
//!         }
//!     }
//! }
//!
//! let guardrail = OutputGuardrail::new("no-secrets", NoSecrets)
//!     .priority(Severity::Critical);
//! ```

mod check;
mod input;
mod output;

pub use check::{Guardrail, GuardrailCheck};
pub use input::{InputContext, InputGuardrail};
pub use output::{OutputContext, OutputGuardrail};

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::runner::ExecutionResult;

/// Ordinal rank of a guardrail or of one of its verdicts.
///
/// Ordered `Low < Medium < High < Critical`. Used both as a guardrail's
/// execution priority and as the severity of a blocking result.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational.
    Low,
    /// The default rank.
    #[default]
    Medium,
    /// Serious.
    High,
    /// Must never pass.
    Critical,
}

impl Severity {
    /// Numeric weight used for remediation selection (`low=1 .. critical=4`).
    #[must_use]
    pub const fn weight(self) -> u8 {
        match self {
            Self::Low => 1,
            Self::Medium => 2,
            Self::High => 3,
            Self::Critical => 4,
        }
    }

    /// Lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(format!("unknown severity '{other}'")),
        }
    }
}

/// The verdict of one guardrail check.
///
/// `M` is the guardrail's own metadata type (see
/// [`GuardrailCheck::Metadata`]). The runner erases it to a JSON value so
/// heterogeneous guardrails can share one result list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardrailOutput<M = Value> {
    /// Whether the check wants to block.
    pub tripwire_triggered: bool,

    /// How serious the finding is.
    ///
    /// A blocking result without a severity is ranked as [`Severity::Medium`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,

    /// Human-readable description of the finding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// How the generator could fix the finding; fed into retry instructions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,

    /// Structured details specific to the guardrail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<M>,

    /// Set when the guardrail could not run to completion.
    #[serde(default)]
    pub execution_failed: bool,
}

impl<M> GuardrailOutput<M> {
    /// Create a passing output (tripwire not triggered).
    #[must_use]
    pub const fn pass() -> Self {
        Self {
            tripwire_triggered: false,
            severity: None,
            message: None,
            suggestion: None,
            metadata: None,
            execution_failed: false,
        }
    }

    /// Create a blocking output with a message.
    #[must_use]
    pub fn tripwire(message: impl Into<String>) -> Self {
        Self {
            tripwire_triggered: true,
            message: Some(message.into()),
            ..Self::pass()
        }
    }

    /// Set the severity.
    #[must_use]
    pub const fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    /// Set the message.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Set the remediation suggestion.
    #[must_use]
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    /// Attach typed metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: M) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Returns `true` if the tripwire was triggered.
    #[must_use]
    pub const fn is_triggered(&self) -> bool {
        self.tripwire_triggered
    }

    /// Severity used for ranking, defaulting to `medium` when unset.
    #[must_use]
    pub fn effective_severity(&self) -> Severity {
        self.severity.unwrap_or_default()
    }
}

impl<M: Serialize> GuardrailOutput<M> {
    /// Erase the metadata type into a JSON value.
    ///
    /// Metadata that fails to serialize is replaced by a description of the
    /// serialization error; the verdict itself is never altered.
    #[must_use]
    pub fn into_erased(self) -> GuardrailOutput {
        let metadata = self.metadata.map(|m| {
            serde_json::to_value(m)
                .unwrap_or_else(|err| json!({ "metadataError": err.to_string() }))
        });
        GuardrailOutput {
            tripwire_triggered: self.tripwire_triggered,
            severity: self.severity,
            message: self.message,
            suggestion: self.suggestion,
            metadata,
            execution_failed: self.execution_failed,
        }
    }
}

impl GuardrailOutput {
    /// Fail-closed verdict for a guardrail that could not determine safety.
    #[must_use]
    pub(crate) fn execution_failure(message: impl Into<String>, metadata: Value) -> Self {
        Self {
            tripwire_triggered: true,
            severity: Some(Severity::Critical),
            message: Some(message.into()),
            suggestion: None,
            metadata: Some(metadata),
            execution_failed: true,
        }
    }
}

impl<M> Default for GuardrailOutput<M> {
    fn default() -> Self {
        Self::pass()
    }
}

/// Convenience conversion: a string becomes a tripwire output.
impl From<&str> for GuardrailOutput {
    fn from(reason: &str) -> Self {
        Self::tripwire(reason)
    }
}

/// A retry instruction produced for one blocked guardrail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Remediation {
    /// Instruction appended to the next attempt's messages.
    pub message: String,
    /// Requested change to the sampling temperature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature_adjustment: Option<f32>,
}

impl Remediation {
    /// Create an instruction without a temperature hint.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            temperature_adjustment: None,
        }
    }

    /// Request a temperature change for the next attempt.
    #[must_use]
    pub const fn with_temperature_adjustment(mut self, delta: f32) -> Self {
        self.temperature_adjustment = Some(delta);
        self
    }
}

impl From<String> for Remediation {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for Remediation {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Input to a guardrail's custom retry-instruction generator.
#[derive(Debug, Clone, Copy)]
pub struct RetryInstructionRequest<'a> {
    /// The blocked result being remediated.
    pub result: &'a ExecutionResult,
    /// 1-based retry number about to be attempted.
    pub attempt: u32,
    /// Configured retry ceiling.
    pub max_retries: u32,
}
