//! LLM request and event types
//!
//! An invocation produces a finite sequence of events. The state delta on an
//! event is the sole side-channel plugins use to communicate within one call.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Well-known error codes carried on events
pub mod error_codes {
    pub const BUDGET_EXCEEDED: &str = "BUDGET_EXCEEDED";
    pub const TOKEN_LIMIT_EXCEEDED: &str = "TOKEN_LIMIT_EXCEEDED";
    pub const CIRCUIT_BREAKER_OPEN: &str = "CIRCUIT_BREAKER_OPEN";
    pub const RATE_LIMITED: &str = "RATE_LIMITED";

    /// Codes that must never trigger a same-model retry
    pub fn is_retryable(code: &str) -> bool {
        !matches!(code, BUDGET_EXCEEDED | TOKEN_LIMIT_EXCEEDED | CIRCUIT_BREAKER_OPEN)
    }
}

/// Message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A message in the conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    /// Create a user message
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: text.into(),
        }
    }

    /// Create an assistant message
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: text.into(),
        }
    }
}

/// Everything needed for one LLM invocation
#[derive(Debug, Clone)]
pub struct LlmRequest {
    /// Model name (resolved through the alias resolver for proxy backends)
    pub model: String,

    /// System instruction built from the task
    pub system_instruction: String,

    /// Conversation so far; plugins may prepend synthetic messages
    pub messages: Vec<Message>,

    /// Max tokens for the response
    pub max_tokens: u32,

    /// Per-invocation deadline (derived from task complexity)
    pub timeout: Duration,
}

impl LlmRequest {
    /// Create a request with default limits
    pub fn new(model: impl Into<String>, system_instruction: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            system_instruction: system_instruction.into(),
            messages,
            max_tokens: 16384,
            timeout: Duration::from_secs(300),
        }
    }
}

/// One part of an event's content
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    FunctionCall { name: String, args: serde_json::Value },
}

impl ContentPart {
    /// Create a text part
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }
}

/// Token usage attached to a final event
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageMetadata {
    pub prompt_token_count: u64,
    pub candidates_token_count: u64,
    pub total_token_count: u64,
}

/// The smallest unit emitted by an LLM backend
///
/// `state_delta` is merged into the session's state between model calls and
/// is the only channel through which plugins communicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmEvent {
    /// Agent name that produced the event
    pub author: String,

    #[serde(default)]
    pub content: Vec<ContentPart>,

    #[serde(default)]
    pub state_delta: HashMap<String, serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageMetadata>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    #[serde(default)]
    pub partial: bool,

    #[serde(default)]
    pub custom_metadata: HashMap<String, serde_json::Value>,
}

impl LlmEvent {
    /// Create a final text event
    pub fn text(author: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            author: author.into(),
            content: vec![ContentPart::text(text)],
            state_delta: HashMap::new(),
            usage: None,
            error_code: None,
            error_message: None,
            partial: false,
            custom_metadata: HashMap::new(),
        }
    }

    /// Create an error event
    pub fn error(author: impl Into<String>, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            author: author.into(),
            content: Vec::new(),
            state_delta: HashMap::new(),
            usage: None,
            error_code: Some(code.into()),
            error_message: Some(message.into()),
            partial: false,
            custom_metadata: HashMap::new(),
        }
    }

    /// Attach usage metadata
    pub fn with_usage(mut self, prompt: u64, candidates: u64) -> Self {
        self.usage = Some(UsageMetadata {
            prompt_token_count: prompt,
            candidates_token_count: candidates,
            total_token_count: prompt + candidates,
        });
        self
    }

    /// Whether the event carries an error code
    pub fn is_error(&self) -> bool {
        self.error_code.is_some()
    }

    /// Whether the event has at least one non-empty text part or a function call
    pub fn has_content(&self) -> bool {
        self.content.iter().any(|part| match part {
            ContentPart::Text { text } => !text.trim().is_empty(),
            ContentPart::FunctionCall { .. } => true,
        })
    }

    /// First text part, if any
    pub fn first_text(&self) -> Option<&str> {
        self.content.iter().find_map(|part| match part {
            ContentPart::Text { text } => Some(text.as_str()),
            _ => None,
        })
    }
}
