//! Stream evaluation settings.

use serde::{Deserialize, Serialize};

use crate::budget::estimate_tokens;
use crate::config::DEFAULT_PLACEHOLDER;
use crate::error::{Error, Result};
use crate::guardrail::Severity;

/// When stream checks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    /// Forward everything, check once at end of stream.
    #[default]
    Buffer,
    /// Check incrementally and stop the stream early on violations.
    Progressive,
}

/// How often progressive checks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckInterval {
    /// Every `n` text chunks.
    Chunks(usize),
    /// Every `n` estimated tokens of new text.
    Tokens(usize),
}

impl Default for CheckInterval {
    fn default() -> Self {
        Self::Chunks(1)
    }
}

impl CheckInterval {
    /// Position of the stream in this interval's units, given the number of
    /// text chunks seen and the text accumulated so far.
    ///
    /// Token positions are estimated over the whole text, so splitting the
    /// same text into more deltas never makes checks more frequent.
    #[must_use]
    pub fn position(self, chunks: usize, text: &str) -> usize {
        match self {
            Self::Chunks(_) => chunks,
            Self::Tokens(_) => estimate_tokens(text),
        }
    }

    /// Whether a check is due at `position` when the last one ran at `last`.
    #[must_use]
    pub const fn is_due(self, position: usize, last: usize) -> bool {
        position.saturating_sub(last) >= self.size()
    }

    /// Units between checks.
    #[must_use]
    pub const fn size(self) -> usize {
        match self {
            Self::Chunks(n) | Self::Tokens(n) => n,
        }
    }
}

/// Options for a [`StreamEvaluator`](super::StreamEvaluator).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StreamConfig {
    /// Evaluation mode. Default: buffer.
    pub mode: StreamMode,
    /// Progressive check cadence. Default: every chunk.
    pub check_interval: CheckInterval,
    /// Stop as soon as a check blocks at or above this severity.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_on_severity: Option<Severity>,
    /// Emit `replacement_text` when blocking. Default: `true`.
    pub replace_on_block: bool,
    /// Marker emitted in place of blocked content.
    pub replacement_text: String,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            mode: StreamMode::Buffer,
            check_interval: CheckInterval::default(),
            stop_on_severity: None,
            replace_on_block: true,
            replacement_text: DEFAULT_PLACEHOLDER.to_owned(),
        }
    }
}

impl StreamConfig {
    /// Buffer-mode defaults.
    #[must_use]
    pub fn buffer() -> Self {
        Self::default()
    }

    /// Progressive-mode defaults.
    #[must_use]
    pub fn progressive() -> Self {
        Self {
            mode: StreamMode::Progressive,
            ..Self::default()
        }
    }

    /// Set the check cadence.
    #[must_use]
    pub const fn check_interval(mut self, interval: CheckInterval) -> Self {
        self.check_interval = interval;
        self
    }

    /// Stop on any block at or above `severity`.
    #[must_use]
    pub const fn stop_on_severity(mut self, severity: Severity) -> Self {
        self.stop_on_severity = Some(severity);
        self
    }

    /// Enable or disable the replacement marker.
    #[must_use]
    pub const fn replace_on_block(mut self, replace: bool) -> Self {
        self.replace_on_block = replace;
        self
    }

    /// Set the replacement marker.
    #[must_use]
    pub fn replacement_text(mut self, text: impl Into<String>) -> Self {
        self.replacement_text = text.into();
        self
    }

    /// Check that the configuration can be honored.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for a zero check interval.
    pub fn validate(&self) -> Result<()> {
        if self.check_interval.size() == 0 {
            return Err(Error::invalid_config("stream check interval must be greater than zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_position() {
        assert_eq!(CheckInterval::Chunks(3).position(5, "hello world"), 5);
        assert_eq!(
            CheckInterval::Tokens(10).position(5, "hello world"),
            estimate_tokens("hello world")
        );
        assert_eq!(CheckInterval::default(), CheckInterval::Chunks(1));
    }

    #[test]
    fn test_token_position_ignores_delta_split() {
        let interval = CheckInterval::Tokens(6);
        let whole = interval.position(1, "abcdefghijklmnop");
        let split = interval.position(16, "abcdefghijklmnop");
        assert_eq!(whole, split);
        assert_eq!(whole, 5);
        assert!(!interval.is_due(whole, 0));
        assert!(interval.is_due(interval.position(17, "abcdefghijklmnopq"), 0));
        assert!(!interval.is_due(8, 6));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let config = StreamConfig::progressive().check_interval(CheckInterval::Tokens(0));
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
        assert!(StreamConfig::default().validate().is_ok());
    }
}
