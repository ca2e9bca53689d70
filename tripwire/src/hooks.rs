//! Lifecycle callbacks fired when content is blocked.
//!
//! Implement [`GuardrailHooks`] to observe blocks (for auditing, alerting,
//! user feedback). Every method has a no-op default, so implementors only
//! override the events they care about. Hooks observe; they cannot change
//! the disposition of the content.

use async_trait::async_trait;

use crate::budget::BudgetExceeded;
use crate::guardrail::{InputContext, OutputContext};
use crate::runner::ExecutionSummary;
use crate::types::GenerationResult;

/// Callbacks for guardrail block events.
#[async_trait]
pub trait GuardrailHooks: Send + Sync {
    /// Input guardrails blocked a request; the generator was not called.
    async fn on_input_blocked(&self, summary: &ExecutionSummary, context: &InputContext) {
        let _ = (summary, context);
    }

    /// Output guardrails still block after all retries.
    async fn on_output_blocked(
        &self,
        summary: &ExecutionSummary,
        context: &OutputContext,
        result: &GenerationResult,
    ) {
        let _ = (summary, context, result);
    }

    /// A stream check blocked. Fires once per stream in progressive mode
    /// (on termination) and once at end of stream in buffer mode.
    async fn on_violation(&self, summary: &ExecutionSummary) {
        let _ = summary;
    }

    /// A token budget gate cut a stream off.
    async fn on_budget_exceeded(&self, exceeded: &BudgetExceeded) {
        let _ = exceeded;
    }
}

/// Hooks that do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

#[async_trait]
impl GuardrailHooks for NoopHooks {}
