#![cfg_attr(docsrs, feature(doc_cfg))]
//! Tripwire runs guardrails around LLM generation calls.
//!
//! The engine has four cooperating parts:
//!
//! - [`GuardrailRunner`](runner::GuardrailRunner) executes a set of
//!   guardrails against one context, in parallel or by priority, under a
//!   deadline, and fails closed on errors, panics and timeouts.
//! - [`RetryOrchestrator`](retry::RetryOrchestrator) regenerates blocked
//!   output with remediation instructions folded into the next request.
//! - [`StreamEvaluator`](stream::StreamEvaluator) applies output guardrails
//!   to a chunk stream, either once at the end or progressively.
//! - [`TokenBudgetGate`](budget::TokenBudgetGate) stops a stream on an
//!   estimated token ceiling.
//!
//! [`GuardedGenerator`](guarded::GuardedGenerator) wires them together
//! around any [`Generator`](generate::Generator).
//!
//! ```rust,ignore
//! use tripwire::prelude::*;
//!
//! let guarded = GuardedGenerator::new(my_model)
//!     .output_guardrail(OutputGuardrail::from_fn("no-pii", |ctx: &OutputContext| {
//!         if ctx.text().contains('@') {
//!             GuardrailOutput::tripwire("email address").with_severity(Severity::High)
//!         } else {
//!             GuardrailOutput::pass()
//!         }
//!     }))
//!     .retry(RetryConfig::new(2));
//! ```

pub mod abort;
pub mod budget;
pub mod config;
pub mod error;
pub mod generate;
pub mod guarded;
pub mod guardrail;
pub mod hooks;
pub mod prelude;
pub mod retry;
pub mod runner;
pub mod stream;
pub mod telemetry;
pub mod types;

pub use error::{Error, Result};
pub use guarded::{GuardedGenerator, GuardedOutput};
pub use guardrail::{Guardrail, GuardrailCheck, GuardrailOutput, Severity};
pub use runner::{ExecutionResult, ExecutionSummary, GuardrailRunner};
