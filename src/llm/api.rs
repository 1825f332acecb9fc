//! HTTP API backend
//!
//! One POST per invocation against an Anthropic-style messages endpoint; the
//! full reply is emitted as a single synthetic event carrying usage metadata.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::{EventStream, LlmClient, LlmError, LlmEvent, LlmRequest, Role};
use crate::config::LlmConfig;

/// HTTP API client
#[derive(Debug)]
pub struct ApiClient {
    provider: String,
    api_key: String,
    base_url: String,
    http: Client,
    max_tokens: u32,
}

impl ApiClient {
    /// Create a client from configuration
    ///
    /// Reads the API key from the environment variable specified in config.
    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        let api_key = std::env::var(&config.api_key_env)
            .map_err(|_| LlmError::InvalidResponse(format!("Environment variable {} not set", config.api_key_env)))?;

        let http = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(LlmError::Network)?;

        Ok(Self {
            provider: config.provider.clone(),
            api_key,
            base_url: config.base_url.clone(),
            http,
            max_tokens: config.max_tokens,
        })
    }

    /// Build the request body for the messages API
    fn build_request_body(&self, request: &LlmRequest) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .map(|msg| {
                let role = match msg.role {
                    Role::User => "user",
                    Role::Assistant => "assistant",
                };
                serde_json::json!({"role": role, "content": msg.content})
            })
            .collect();

        serde_json::json!({
            "model": request.model,
            "max_tokens": request.max_tokens.min(self.max_tokens),
            "system": request.system_instruction,
            "messages": messages,
        })
    }

    fn parse_response(&self, author: &str, api_response: ApiResponse) -> LlmEvent {
        let text = api_response
            .content
            .into_iter()
            .filter_map(|block| block.text)
            .collect::<Vec<_>>()
            .join("");

        LlmEvent::text(author, text).with_usage(api_response.usage.input_tokens, api_response.usage.output_tokens)
    }
}

#[async_trait]
impl LlmClient for ApiClient {
    async fn generate(&self, request: LlmRequest) -> Result<EventStream, LlmError> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = self.build_request_body(&request);
        debug!(model = %request.model, %url, "ApiClient::generate");

        let deadline = request.timeout;
        let response = tokio::time::timeout(
            deadline,
            self.http
                .post(url)
                .header("x-api-key", self.api_key.clone())
                .header("anthropic-version", "2023-06-01")
                .header("content-type", "application/json")
                .json(&body)
                .send(),
        )
        .await
        .map_err(|_| LlmError::Timeout(deadline))?
        .map_err(|e| {
            if e.is_connect() {
                LlmError::ProviderUnavailable(e.to_string())
            } else if e.is_timeout() {
                LlmError::Timeout(deadline)
            } else {
                LlmError::Network(e)
            }
        })?;

        if response.status().as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(60);

            return Err(LlmError::RateLimited {
                retry_after: Duration::from_secs(retry_after),
            });
        }

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            if text.contains("prompt is too long") || text.contains("context length") {
                return Err(LlmError::ContextLimit(text));
            }
            return Err(LlmError::ProviderError { status, message: text });
        }

        let api_response: ApiResponse = response.json().await?;
        let event = self.parse_response("model", api_response);
        Ok(EventStream::from_events(vec![event]))
    }

    fn provider(&self) -> &str {
        &self.provider
    }
}

#[derive(Deserialize)]
struct ApiResponse {
    content: Vec<ApiContentBlock>,
    usage: ApiUsage,
}

#[derive(Deserialize)]
struct ApiContentBlock {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct ApiUsage {
    input_tokens: u64,
    output_tokens: u64,
}
