//! The guardrail check trait and the [`Guardrail`] wrapper the runner executes.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::GuardrailError;

use super::{GuardrailOutput, Remediation, RetryInstructionRequest, Severity};

/// Trait for implementing guardrail check logic over a context type `C`.
///
/// Implementations must be safe to call more than once per logical request:
/// the retry path re-runs every output guardrail on each attempt. Any state
/// a check keeps across calls (rate-limit counters, caches) is its own.
#[async_trait]
pub trait GuardrailCheck<C>: Send + Sync {
    /// Guardrail-specific metadata attached to results.
    type Metadata: Serialize + Send;

    /// Inspect the context and return a verdict.
    ///
    /// `cancel` fires when the runner's deadline for this check elapses or
    /// the caller aborts; long-running checks should observe it.
    ///
    /// # Errors
    ///
    /// Return a [`GuardrailError`] when no verdict can be reached. The
    /// runner treats this as a critical block.
    async fn check(
        &self,
        context: &C,
        cancel: &CancellationToken,
    ) -> Result<GuardrailOutput<Self::Metadata>, GuardrailError>;
}

/// Object-safe form of [`GuardrailCheck`] with metadata erased to JSON.
#[async_trait]
trait ErasedCheck<C>: Send + Sync {
    async fn check_erased(
        &self,
        context: &C,
        cancel: &CancellationToken,
    ) -> Result<GuardrailOutput, GuardrailError>;
}

#[async_trait]
impl<C, T> ErasedCheck<C> for T
where
    C: Sync,
    T: GuardrailCheck<C>,
{
    async fn check_erased(
        &self,
        context: &C,
        cancel: &CancellationToken,
    ) -> Result<GuardrailOutput, GuardrailError> {
        self.check(context, cancel)
            .await
            .map(GuardrailOutput::into_erased)
    }
}

/// Adapter running a synchronous closure as a check.
struct FnCheck<F>(F);

#[async_trait]
impl<C, F> GuardrailCheck<C> for FnCheck<F>
where
    C: Sync,
    F: Fn(&C) -> GuardrailOutput + Send + Sync,
{
    type Metadata = serde_json::Value;

    async fn check(
        &self,
        context: &C,
        _cancel: &CancellationToken,
    ) -> Result<GuardrailOutput, GuardrailError> {
        Ok((self.0)(context))
    }
}

type RetryInstructionFn =
    dyn Fn(&RetryInstructionRequest<'_>) -> Option<Remediation> + Send + Sync;

/// A named, versioned, prioritized guardrail over context type `C`.
///
/// Constructed once and reused across many executions; the runner only
/// borrows it.
pub struct Guardrail<C> {
    /// Name of this guardrail (used in tracing, results and errors).
    name: String,

    /// Optional version tag.
    version: Option<String>,

    /// Optional human-readable description.
    description: Option<String>,

    /// Execution priority for sequential runs.
    priority: Severity,

    /// Disabled guardrails are skipped entirely.
    enabled: bool,

    /// The check implementation.
    check: Arc<dyn ErasedCheck<C>>,

    /// Custom retry-instruction generator.
    retry_instruction: Option<Arc<RetryInstructionFn>>,
}

impl<C: Sync> Guardrail<C> {
    /// Create a new guardrail with the given name and check logic.
    ///
    /// Defaults to enabled with `medium` priority.
    #[must_use]
    pub fn new(name: impl Into<String>, check: impl GuardrailCheck<C> + 'static) -> Self {
        Self {
            name: name.into(),
            version: None,
            description: None,
            priority: Severity::Medium,
            enabled: true,
            check: Arc::new(check),
            retry_instruction: None,
        }
    }

    /// Create a guardrail from a synchronous check function.
    #[must_use]
    pub fn from_fn<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&C) -> GuardrailOutput + Send + Sync + 'static,
    {
        Self::new(name, FnCheck(f))
    }

    /// Set the version tag.
    #[must_use]
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Set the description.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Set the execution priority.
    #[must_use]
    pub const fn priority(mut self, priority: Severity) -> Self {
        self.priority = priority;
        self
    }

    /// Enable or disable this guardrail.
    #[must_use]
    pub const fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Supply a custom retry-instruction generator.
    ///
    /// Returning `None` falls back to the default instruction built from the
    /// result's message and suggestion.
    #[must_use]
    pub fn retry_instruction<F>(mut self, f: F) -> Self
    where
        F: Fn(&RetryInstructionRequest<'_>) -> Option<Remediation> + Send + Sync + 'static,
    {
        self.retry_instruction = Some(Arc::new(f));
        self
    }

    /// Execute the check once.
    ///
    /// # Errors
    ///
    /// Propagates the check's own [`GuardrailError`].
    pub async fn invoke(
        &self,
        context: &C,
        cancel: &CancellationToken,
    ) -> Result<GuardrailOutput, GuardrailError> {
        self.check.check_erased(context, cancel).await
    }

    /// Ask the custom generator, if any, for a retry instruction.
    #[must_use]
    pub fn custom_retry_instruction(
        &self,
        request: &RetryInstructionRequest<'_>,
    ) -> Option<Remediation> {
        self.retry_instruction.as_ref().and_then(|f| f(request))
    }
}

impl<C> Guardrail<C> {
    /// Returns the name of this guardrail.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the version tag, if set.
    #[must_use]
    pub fn get_version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Returns the description, if set.
    #[must_use]
    pub fn get_description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Returns the execution priority.
    #[must_use]
    pub const fn get_priority(&self) -> Severity {
        self.priority
    }

    /// Returns whether this guardrail runs.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }
}

impl<C> Clone for Guardrail<C> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            version: self.version.clone(),
            description: self.description.clone(),
            priority: self.priority,
            enabled: self.enabled,
            check: Arc::clone(&self.check),
            retry_instruction: self.retry_instruction.clone(),
        }
    }
}

impl<C> fmt::Debug for Guardrail<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Guardrail")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("priority", &self.priority)
            .field("enabled", &self.enabled)
            .field("custom_retry_instruction", &self.retry_instruction.is_some())
            .finish_non_exhaustive()
    }
}
