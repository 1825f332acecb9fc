//! LLM error taxonomy

use std::time::Duration;
use thiserror::Error;

/// How a failure should be handled by the cascade
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry the same model up to the attempt limit
    Transient,
    /// Escalate to the next model on the routing cascade
    Capability,
    /// Surface and stop
    Fatal,
}

/// Errors that can occur during LLM operations
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Provider error {status}: {message}")]
    ProviderError { status: u16, message: String },

    #[error("Context limit exceeded: {0}")]
    ContextLimit(String),

    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("No provider available: {0}")]
    NoProviderAvailable(String),

    #[error("Streaming connection not supported by this backend")]
    StreamingNotSupported,

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl LlmError {
    /// Check if this is a rate limit error
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, LlmError::RateLimited { .. })
    }

    /// Check if this error is retryable on the same model
    pub fn is_retryable(&self) -> bool {
        matches!(self.classify(), ErrorClass::Transient)
    }

    /// Classify the error for cascade handling
    ///
    /// Overloaded providers (529) and context-limit failures escalate;
    /// transient transport failures retry; everything else is fatal for the
    /// current attempt.
    pub fn classify(&self) -> ErrorClass {
        match self {
            LlmError::RateLimited { .. } => ErrorClass::Transient,
            LlmError::Network(_) => ErrorClass::Transient,
            LlmError::ProviderError { status, .. } if *status == 529 => ErrorClass::Capability,
            LlmError::ProviderError { status, .. } if *status >= 500 => ErrorClass::Transient,
            LlmError::Timeout(_) => ErrorClass::Capability,
            LlmError::ContextLimit(_) => ErrorClass::Capability,
            LlmError::ProviderUnavailable(_) => ErrorClass::Fatal,
            LlmError::NoProviderAvailable(_) => ErrorClass::Fatal,
            LlmError::StreamingNotSupported => ErrorClass::Fatal,
            LlmError::ProviderError { .. } => ErrorClass::Fatal,
            LlmError::Json(_) => ErrorClass::Fatal,
            LlmError::InvalidResponse(_) => ErrorClass::Fatal,
        }
    }

    /// Get the retry duration if this is a rate limit error
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            LlmError::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    /// Short machine-readable code for embedding into events
    pub fn code(&self) -> &'static str {
        match self {
            LlmError::ProviderUnavailable(_) => "PROVIDER_UNAVAILABLE",
            LlmError::Timeout(_) => "TIMEOUT",
            LlmError::ProviderError { .. } => "PROVIDER_ERROR",
            LlmError::ContextLimit(_) => "CONTEXT_LIMIT",
            LlmError::RateLimited { .. } => "RATE_LIMITED",
            LlmError::NoProviderAvailable(_) => "NO_PROVIDER_AVAILABLE",
            LlmError::StreamingNotSupported => "STREAMING_NOT_SUPPORTED",
            LlmError::Network(_) => "NETWORK",
            LlmError::Json(_) => "INVALID_JSON",
            LlmError::InvalidResponse(_) => "INVALID_RESPONSE",
        }
    }
}
