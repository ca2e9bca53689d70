//! Input guardrail context.
//!
//! Input guardrails see the request before the generator is called, so a
//! blocked request never incurs model cost or latency.

use serde::{Deserialize, Serialize};

use crate::types::{GenerationParams, Message, Role};

use super::Guardrail;

/// A guardrail over the normalized request.
pub type InputGuardrail = Guardrail<InputContext>;

/// The normalized request seen by input guardrails.
///
/// Built from [`GenerationParams`] so checks do not need to care whether
/// the caller used a single prompt or a message list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputContext {
    /// Model identifier, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// System prompt, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    /// Single-shot prompt, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    /// Conversation messages.
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl InputContext {
    /// Normalize request parameters.
    #[must_use]
    pub fn from_params(params: &GenerationParams) -> Self {
        Self {
            model: params.model.clone(),
            system: params.system.clone(),
            prompt: params.prompt.clone(),
            messages: params.messages.clone(),
        }
    }

    /// All user-authored text, prompt first, joined by newlines.
    #[must_use]
    pub fn user_text(&self) -> String {
        self.prompt
            .iter()
            .map(String::as_str)
            .chain(
                self.messages
                    .iter()
                    .filter(|m| m.role == Role::User)
                    .map(|m| m.content.as_str()),
            )
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// The most recent user message, falling back to the prompt.
    #[must_use]
    pub fn last_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .or(self.prompt.as_deref())
    }
}

impl From<&GenerationParams> for InputContext {
    fn from(params: &GenerationParams) -> Self {
        Self::from_params(params)
    }
}
