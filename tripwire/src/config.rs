//! Configuration types for the runner, retry loop and stream evaluation.
//!
//! Every knob has a documented default and nothing is read from the process
//! environment: behavior is fully determined by the structs passed in at
//! construction time. [`GuardConfig`] aggregates all settings and can be
//! deserialized from JSON.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::retry::{Backoff, MultipleBlockedStrategy, RetryConfig};
use crate::stream::StreamConfig;

/// Default per-guardrail (sequential) or per-batch (parallel) timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Verbosity of the runner's own log events.
///
/// Ordered `None < Error < Warn < Info < Debug`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Emit nothing.
    None,
    /// Only execution failures.
    Error,
    /// Failures and blocks.
    #[default]
    Warn,
    /// Plus per-run summaries.
    Info,
    /// Plus per-guardrail detail.
    Debug,
}

impl LogLevel {
    /// Whether an event at `level` should be emitted under this setting.
    #[must_use]
    pub fn allows(self, level: Self) -> bool {
        level != Self::None && level <= self
    }
}

/// Options for one [`GuardrailRunner`](crate::runner::GuardrailRunner).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RunnerConfig {
    /// Run guardrails concurrently under one shared timeout. Default: `true`.
    pub parallel: bool,
    /// Timeout budget. Default: 30s.
    #[serde(rename = "timeoutMs", with = "duration_ms")]
    pub timeout: Duration,
    /// In sequential mode, keep going after a block. Default: `true`.
    pub continue_on_failure: bool,
    /// Runner log verbosity. Default: `warn`.
    pub log_level: LogLevel,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            parallel: true,
            timeout: DEFAULT_TIMEOUT,
            continue_on_failure: true,
            log_level: LogLevel::Warn,
        }
    }
}

impl RunnerConfig {
    /// Create the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set parallel execution.
    #[must_use]
    pub const fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Set the timeout budget.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set whether sequential runs continue after a block.
    #[must_use]
    pub const fn continue_on_failure(mut self, continue_on_failure: bool) -> Self {
        self.continue_on_failure = continue_on_failure;
        self
    }

    /// Set the log verbosity.
    #[must_use]
    pub const fn log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    /// Check that the configuration can be honored.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for a zero timeout.
    pub fn validate(&self) -> Result<()> {
        if self.timeout.is_zero() {
            return Err(Error::invalid_config("runner timeout must be greater than zero"));
        }
        Ok(())
    }
}

/// Serializable subset of [`RetryConfig`].
///
/// Closures (`only_when`, custom parameter builders, custom backoff) can
/// only be attached in code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetrySettings {
    /// Retry ceiling. Default: 0 (no retries).
    pub max_retries: u32,
    /// Fixed wait between attempts in milliseconds. Default: 0.
    pub backoff_ms: u64,
    /// Which blocked guardrails drive remediation. Default: highest severity.
    pub multiple_blocked_strategy: MultipleBlockedStrategy,
}

impl From<RetrySettings> for RetryConfig {
    fn from(settings: RetrySettings) -> Self {
        let backoff = if settings.backoff_ms == 0 {
            Backoff::None
        } else {
            Backoff::Fixed(Duration::from_millis(settings.backoff_ms))
        };
        Self::default()
            .max_retries(settings.max_retries)
            .backoff(backoff)
            .strategy(settings.multiple_blocked_strategy)
    }
}

/// How blocked content is surfaced to callers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum BlockMode {
    /// Return a typed blocked error.
    #[default]
    Strict,
    /// Log and substitute a placeholder.
    Lenient {
        /// Replacement text for blocked content.
        placeholder: String,
    },
}

/// Placeholder substituted for blocked content in lenient mode.
pub const DEFAULT_PLACEHOLDER: &str = "[Content blocked by guardrails]";

impl BlockMode {
    /// Lenient mode with the default placeholder.
    #[must_use]
    pub fn lenient() -> Self {
        Self::Lenient {
            placeholder: DEFAULT_PLACEHOLDER.to_owned(),
        }
    }
}

/// All engine settings in one serializable document.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GuardConfig {
    /// Runner options, shared by input and output checks.
    pub runner: RunnerConfig,
    /// Output retry options.
    pub retry: RetrySettings,
    /// Stream evaluation options.
    pub stream: StreamConfig,
    /// Strict or lenient disposition.
    pub block_mode: BlockMode,
    /// Optional token ceiling for streamed output.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_budget: Option<usize>,
}

impl GuardConfig {
    /// Parse a JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] for malformed input, or
    /// [`Error::InvalidConfig`] if the values fail validation.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every section.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] describing the first bad value.
    pub fn validate(&self) -> Result<()> {
        self.runner.validate()?;
        self.stream.validate()?;
        if self.token_budget == Some(0) {
            return Err(Error::invalid_config("token budget must be greater than zero"));
        }
        Ok(())
    }
}

/// Serialize a [`Duration`] as whole milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
