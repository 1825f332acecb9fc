//! Proxy backend
//!
//! API semantics against an OpenAI-compatible local gateway. Model ids may
//! be short aliases; they are resolved to canonical ids through the
//! AliasResolver before the request is sent.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use super::resolver::AliasResolver;
use super::{EventStream, LlmClient, LlmError, LlmEvent, LlmRequest, Role};
use crate::config::LlmConfig;

/// OpenAI-compatible proxy client
#[derive(Debug)]
pub struct ProxyClient {
    provider: String,
    base_url: String,
    api_key: Option<String>,
    http: Client,
    max_tokens: u32,
    resolver: Arc<AliasResolver>,
}

impl ProxyClient {
    /// Create a client from configuration
    ///
    /// The API key env var is optional for local gateways.
    pub fn from_config(config: &LlmConfig, resolver: Arc<AliasResolver>) -> Result<Self, LlmError> {
        let api_key = std::env::var(&config.api_key_env).ok();

        let http = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(LlmError::Network)?;

        Ok(Self {
            provider: config.provider.clone(),
            base_url: config.base_url.clone(),
            api_key,
            http,
            max_tokens: config.max_tokens,
            resolver,
        })
    }

    /// Build the chat-completions request body
    fn build_request_body(&self, request: &LlmRequest, canonical_model: &str) -> serde_json::Value {
        let mut messages = vec![serde_json::json!({
            "role": "system",
            "content": request.system_instruction,
        })];

        for msg in &request.messages {
            let role = match msg.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            messages.push(serde_json::json!({"role": role, "content": msg.content}));
        }

        serde_json::json!({
            "model": canonical_model,
            "messages": messages,
            "max_tokens": request.max_tokens.min(self.max_tokens),
        })
    }

    fn parse_response(&self, author: &str, api_response: ChatResponse) -> LlmEvent {
        let text = api_response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        let usage = api_response.usage.unwrap_or_default();
        LlmEvent::text(author, text).with_usage(usage.prompt_tokens, usage.completion_tokens)
    }
}

#[async_trait]
impl LlmClient for ProxyClient {
    async fn generate(&self, request: LlmRequest) -> Result<EventStream, LlmError> {
        let canonical = self.resolver.resolve(&request.model);
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = self.build_request_body(&request, &canonical);
        debug!(alias = %request.model, model = %canonical, %url, "ProxyClient::generate");

        let mut http_request = self.http.post(url).json(&body);
        if let Some(key) = &self.api_key {
            http_request = http_request.bearer_auth(key);
        }

        let deadline = request.timeout;
        let response = tokio::time::timeout(deadline, http_request.send())
            .await
            .map_err(|_| LlmError::Timeout(deadline))?
            .map_err(|e| {
                if e.is_connect() {
                    LlmError::ProviderUnavailable(e.to_string())
                } else {
                    LlmError::Network(e)
                }
            })?;

        if response.status().as_u16() == 429 {
            return Err(LlmError::RateLimited {
                retry_after: Duration::from_secs(60),
            });
        }

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            if text.contains("context length") || text.contains("maximum context") {
                return Err(LlmError::ContextLimit(text));
            }
            return Err(LlmError::ProviderError { status, message: text });
        }

        let api_response: ChatResponse = response.json().await?;
        let event = self.parse_response("model", api_response);
        Ok(EventStream::from_events(vec![event]))
    }

    fn provider(&self) -> &str {
        &self.provider
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize, Default)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}
