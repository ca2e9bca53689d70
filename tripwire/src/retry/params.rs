//! Remediation selection and next-attempt parameter construction.

use crate::guardrail::Remediation;
use crate::runner::{ExecutionResult, ExecutionSummary};
use crate::types::{GenerationParams, GenerationResult, Message};

use super::config::{MultipleBlockedStrategy, RetryConfig};

/// Everything a custom parameter builder may need.
#[derive(Debug, Clone, Copy)]
pub struct RetryBuildRequest<'a> {
    /// Guardrail summary of the last attempt.
    pub summary: &'a ExecutionSummary,
    /// Parameters of the initial attempt.
    pub original_params: &'a GenerationParams,
    /// Parameters of the last attempt.
    pub last_params: &'a GenerationParams,
    /// Result of the last attempt.
    pub last_result: &'a GenerationResult,
    /// Combined remediation for the blocked results.
    pub remediation: &'a Remediation,
    /// 1-based retry number about to be attempted.
    pub attempt: u32,
}

/// Produces the parameters for the next attempt.
///
/// Implemented for any `Fn(&RetryBuildRequest<'_>) -> GenerationParams`.
pub trait RetryParamsBuilder: Send + Sync {
    /// Build the next attempt's parameters.
    fn build(&self, request: &RetryBuildRequest<'_>) -> GenerationParams;
}

impl<F> RetryParamsBuilder for F
where
    F: Fn(&RetryBuildRequest<'_>) -> GenerationParams + Send + Sync,
{
    fn build(&self, request: &RetryBuildRequest<'_>) -> GenerationParams {
        self(request)
    }
}

/// Pick the blocked results that drive remediation.
#[must_use]
pub fn select_blocked(
    summary: &ExecutionSummary,
    strategy: MultipleBlockedStrategy,
) -> Vec<&ExecutionResult> {
    let mut blocked = summary.blocked_results();
    match strategy {
        MultipleBlockedStrategy::All => blocked.collect(),
        MultipleBlockedStrategy::First => blocked.next().into_iter().collect(),
        MultipleBlockedStrategy::HighestSeverity => {
            let mut best: Option<&ExecutionResult> = None;
            for result in blocked {
                if best.is_none_or(|b| result.severity().weight() > b.severity().weight()) {
                    best = Some(result);
                }
            }
            best.into_iter().collect()
        }
    }
}

/// Fallback instruction built from a result's message and suggestion.
#[must_use]
pub fn default_instruction(result: &ExecutionResult) -> String {
    let message = result
        .output
        .message
        .as_deref()
        .map_or_else(
            || format!("the output was blocked by {}", result.guardrail_name),
            |m| m.trim_end_matches('.').to_owned(),
        );
    match result.output.suggestion.as_deref() {
        Some(suggestion) => format!("Retry and address: {message}. {suggestion}"),
        None => format!("Retry and address: {message}."),
    }
}

/// Merge several instructions into one.
///
/// A single instruction is returned as-is. Several are numbered in order,
/// one per line, and their temperature hints (where present) are averaged.
#[must_use]
pub fn combine_remediations(mut remediations: Vec<Remediation>) -> Option<Remediation> {
    if remediations.len() <= 1 {
        return remediations.pop();
    }

    let message = remediations
        .iter()
        .enumerate()
        .map(|(i, r)| format!("{}. {}", i + 1, r.message))
        .collect::<Vec<_>>()
        .join("\n");

    let hints: Vec<f32> = remediations
        .iter()
        .filter_map(|r| r.temperature_adjustment)
        .collect();
    let temperature_adjustment =
        (!hints.is_empty()).then(|| hints.iter().sum::<f32>() / hints.len() as f32);

    Some(Remediation {
        message,
        temperature_adjustment,
    })
}

/// Default rewrite: append the instruction as a trailing user message and
/// nudge the temperature by the remediation's hint.
///
/// A bare prompt is first moved into the message list so the instruction
/// follows it.
#[must_use]
pub fn apply_remediation(
    last: &GenerationParams,
    remediation: &Remediation,
    config: &RetryConfig,
) -> GenerationParams {
    let mut params = last.clone();
    if params.messages.is_empty()
        && let Some(prompt) = params.prompt.take()
    {
        params.messages.push(Message::user(prompt));
    }
    params.messages.push(Message::user(remediation.message.clone()));

    if let Some(delta) = remediation.temperature_adjustment {
        let (min, max) = config.temperature_range;
        let current = params.temperature.unwrap_or(config.default_temperature);
        let next = current + delta;
        // An inverted range is rejected by `RetryConfig::validate`; leave it unclamped here.
        params.temperature = Some(if min <= max { next.clamp(min, max) } else { next });
    }
    params
}
