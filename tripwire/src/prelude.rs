//! Common imports.

pub use crate::abort::{AbortPool, AbortScope};
pub use crate::budget::{BudgetExceeded, TokenBudgetGate, estimate_tokens};
pub use crate::config::{BlockMode, GuardConfig, LogLevel, RunnerConfig};
pub use crate::error::{Error, GuardrailError, Result};
pub use crate::generate::{Generator, generator_fn, stream_generator_fn};
pub use crate::guarded::{GuardedGenerator, GuardedOutput};
pub use crate::guardrail::{
    Guardrail, GuardrailCheck, GuardrailOutput, InputContext, InputGuardrail, OutputContext,
    OutputGuardrail, Remediation, Severity,
};
pub use crate::hooks::GuardrailHooks;
pub use crate::retry::{Backoff, MultipleBlockedStrategy, RetryConfig, RetryOrchestrator};
pub use crate::runner::{ExecutionResult, ExecutionStatus, ExecutionSummary, GuardrailRunner};
pub use crate::stream::{CheckInterval, StreamConfig, StreamEvaluator, StreamMode};
pub use crate::telemetry::{GuardrailTracer, LogTracer};
pub use crate::types::{
    ChunkStream, FinishReason, GenerationParams, GenerationResult, Message, StreamChunk,
};
