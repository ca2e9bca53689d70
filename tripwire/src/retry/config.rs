//! Retry policy: attempt bound, backoff and parameter shaping.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::runner::ExecutionSummary;

use super::params::RetryParamsBuilder;

/// Sampling temperature assumed when the parameters do not set one.
pub const DEFAULT_TEMPERATURE: f32 = 0.7;

/// Which blocked results drive the remediation instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MultipleBlockedStrategy {
    /// The single most severe result; ties go to the earliest.
    #[default]
    HighestSeverity,
    /// The earliest blocked result.
    First,
    /// Every blocked result.
    All,
}

type DelayFn = dyn Fn(u32) -> Duration + Send + Sync;

/// Wait inserted before each retry.
#[derive(Clone, Default)]
pub enum Backoff {
    /// Retry immediately.
    #[default]
    None,
    /// Same delay before every retry.
    Fixed(Duration),
    /// `base * factor^(retry - 1)`, capped at `max`.
    Exponential {
        /// Delay before the first retry.
        base: Duration,
        /// Growth per retry.
        factor: f64,
        /// Upper bound.
        max: Duration,
    },
    /// Delay computed from the 1-based retry number.
    Custom(Arc<DelayFn>),
}

impl Backoff {
    /// Build a custom backoff from a function of the retry number.
    #[must_use]
    pub fn custom(f: impl Fn(u32) -> Duration + Send + Sync + 'static) -> Self {
        Self::Custom(Arc::new(f))
    }

    /// Delay before the `retry`-th retry (1-based).
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn delay_for(&self, retry: u32) -> Duration {
        match self {
            Self::None => Duration::ZERO,
            Self::Fixed(delay) => *delay,
            Self::Exponential { base, factor, max } => {
                let exp = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
                let nanos = (base.as_nanos() as f64 * factor.powi(exp)).round();
                if !nanos.is_finite() || nanos >= max.as_nanos() as f64 {
                    *max
                } else {
                    Duration::from_nanos(nanos.max(0.0) as u64)
                }
            }
            Self::Custom(f) => f(retry),
        }
    }
}

impl fmt::Debug for Backoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Fixed(delay) => f.debug_tuple("Fixed").field(delay).finish(),
            Self::Exponential { base, factor, max } => f
                .debug_struct("Exponential")
                .field("base", base)
                .field("factor", factor)
                .field("max", max)
                .finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

type OnlyWhenFn = dyn Fn(&ExecutionSummary) -> bool + Send + Sync;

/// Options for the output retry loop.
#[derive(Clone)]
pub struct RetryConfig {
    /// Retries after the initial attempt. Default: 0.
    pub max_retries: u32,
    /// Wait before each retry. Default: none.
    pub backoff: Backoff,
    /// Which blocked results drive remediation. Default: highest severity.
    pub strategy: MultipleBlockedStrategy,
    /// Retry only while this returns `true` for the latest summary.
    pub only_when: Option<Arc<OnlyWhenFn>>,
    /// Replaces the default parameter rewrite.
    pub params_builder: Option<Arc<dyn RetryParamsBuilder>>,
    /// Clamp range for nudged temperatures. Default: `0.0..=2.0`.
    pub temperature_range: (f32, f32),
    /// Temperature assumed when unset. Default: 0.7.
    pub default_temperature: f32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            backoff: Backoff::None,
            strategy: MultipleBlockedStrategy::HighestSeverity,
            only_when: None,
            params_builder: None,
            temperature_range: (0.0, 2.0),
            default_temperature: DEFAULT_TEMPERATURE,
        }
    }
}

impl fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryConfig")
            .field("max_retries", &self.max_retries)
            .field("backoff", &self.backoff)
            .field("strategy", &self.strategy)
            .field("only_when", &self.only_when.is_some())
            .field("params_builder", &self.params_builder.is_some())
            .field("temperature_range", &self.temperature_range)
            .finish_non_exhaustive()
    }
}

impl RetryConfig {
    /// Create a config allowing `max_retries` retries.
    #[must_use]
    pub fn new(max_retries: u32) -> Self {
        Self::default().max_retries(max_retries)
    }

    /// Set the retry ceiling.
    #[must_use]
    pub const fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the backoff policy.
    #[must_use]
    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set the multiple-blocked strategy.
    #[must_use]
    pub const fn strategy(mut self, strategy: MultipleBlockedStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Retry only while `predicate` holds for the latest summary.
    #[must_use]
    pub fn only_when(
        mut self,
        predicate: impl Fn(&ExecutionSummary) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.only_when = Some(Arc::new(predicate));
        self
    }

    /// Replace the default parameter rewrite.
    #[must_use]
    pub fn build_retry_params(mut self, builder: impl RetryParamsBuilder + 'static) -> Self {
        self.params_builder = Some(Arc::new(builder));
        self
    }

    /// Set the temperature clamp range.
    #[must_use]
    pub const fn temperature_range(mut self, min: f32, max: f32) -> Self {
        self.temperature_range = (min, max);
        self
    }

    /// Whether a blocked summary qualifies for another attempt.
    #[must_use]
    pub fn allows_retry(&self, summary: &ExecutionSummary) -> bool {
        self.only_when.as_ref().is_none_or(|f| f(summary))
    }

    /// Check that the configuration can be honored.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for an empty or non-finite
    /// temperature range.
    pub fn validate(&self) -> Result<()> {
        let (min, max) = self.temperature_range;
        if !(min.is_finite() && max.is_finite()) || min > max {
            return Err(Error::invalid_config(format!(
                "invalid temperature range {min}..={max}"
            )));
        }
        Ok(())
    }
}
