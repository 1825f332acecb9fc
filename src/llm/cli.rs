//! CLI subprocess backend
//!
//! Spawns a coding-agent CLI per invocation, writes the request to stdin as
//! JSON, and streams JSON-line events from stdout. The per-invocation
//! deadline comes from the request (derived from task complexity); on
//! timeout the child is killed and a terminal TIMEOUT event is emitted.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{EventStream, LlmClient, LlmError, LlmEvent, LlmRequest};
use crate::config::LlmConfig;
use crate::signal::ChildRegistry;

/// CLI-wrapper client
#[derive(Debug)]
pub struct CliClient {
    provider: String,
    command: String,
    args: Vec<String>,
    children: Option<Arc<ChildRegistry>>,
}

/// One stdout line from the CLI process
#[derive(Debug, Deserialize)]
struct CliLine {
    #[serde(default)]
    text: Option<String>,

    #[serde(default)]
    partial: bool,

    #[serde(default)]
    input_tokens: Option<u64>,

    #[serde(default)]
    output_tokens: Option<u64>,

    #[serde(default)]
    error: Option<String>,
}

impl CliClient {
    /// Create a client from configuration
    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        if config.command.trim().is_empty() {
            return Err(LlmError::InvalidResponse("CLI backend requires a command".to_string()));
        }

        Ok(Self {
            provider: config.provider.clone(),
            command: config.command.clone(),
            args: config.args.clone(),
            children: None,
        })
    }

    /// Register spawned children so the signal handler can force-kill them
    pub fn with_child_registry(mut self, children: Arc<ChildRegistry>) -> Self {
        self.children = Some(children);
        self
    }

    fn map_line(author: &str, line: CliLine) -> LlmEvent {
        if let Some(error) = line.error {
            return LlmEvent::error(author, "PROVIDER_ERROR", error);
        }

        let mut event = LlmEvent::text(author, line.text.unwrap_or_default());
        event.partial = line.partial;
        if let (Some(input), Some(output)) = (line.input_tokens, line.output_tokens) {
            event = event.with_usage(input, output);
        }
        event
    }
}

#[async_trait]
impl LlmClient for CliClient {
    async fn generate(&self, request: LlmRequest) -> Result<EventStream, LlmError> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .arg("--model")
            .arg(&request.model)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| LlmError::ProviderUnavailable(format!("{}: {}", self.command, e)))?;

        let pid = child.id().map(|p| p as i32);
        if let (Some(registry), Some(pid)) = (&self.children, pid) {
            registry.register(pid);
        }

        debug!(command = %self.command, model = %request.model, ?pid, "CliClient::generate: spawned");

        // Write the request and close stdin so the child starts working
        let payload = serde_json::json!({
            "model": request.model,
            "system": request.system_instruction,
            "messages": request.messages,
            "max_tokens": request.max_tokens,
        });
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(payload.to_string().as_bytes())
                .await
                .map_err(|e| LlmError::ProviderUnavailable(format!("write to {} failed: {}", self.command, e)))?;
            drop(stdin);
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LlmError::InvalidResponse("child stdout not captured".to_string()))?;

        let (tx, rx) = mpsc::channel(64);
        let deadline = request.timeout;
        let registry = self.children.clone();

        tokio::spawn(async move {
            let drain = async {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<CliLine>(&line) {
                        Ok(parsed) => {
                            if tx.send(CliClient::map_line("model", parsed)).await.is_err() {
                                // Receiver dropped - caller cancelled the stream
                                break;
                            }
                        }
                        Err(e) => warn!(error = %e, "CliClient: skipping unparseable stdout line"),
                    }
                }
            };

            if tokio::time::timeout(deadline, drain).await.is_err() {
                warn!(?deadline, "CliClient: invocation deadline exceeded, killing child");
                let _ = child.kill().await;
                let _ = tx
                    .send(LlmEvent::error(
                        "model",
                        "TIMEOUT",
                        format!("CLI invocation exceeded {:?}", deadline),
                    ))
                    .await;
            } else {
                let _ = child.wait().await;
            }

            if let (Some(registry), Some(pid)) = (&registry, pid) {
                registry.unregister(pid);
            }
        });

        Ok(EventStream::new(rx))
    }

    fn provider(&self) -> &str {
        &self.provider
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Message;
    use std::time::Duration;

    fn client_for(command: &str, args: &[&str]) -> CliClient {
        CliClient {
            provider: "cli".to_string(),
            command: command.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            children: None,
        }
    }

    #[test]
    fn test_map_line_text() {
        let line = CliLine {
            text: Some("hello".to_string()),
            partial: false,
            input_tokens: Some(10),
            output_tokens: Some(5),
            error: None,
        };

        let event = CliClient::map_line("model", line);
        assert_eq!(event.first_text(), Some("hello"));
        assert_eq!(event.usage.unwrap().total_token_count, 15);
    }

    #[test]
    fn test_map_line_error() {
        let line = CliLine {
            text: None,
            partial: false,
            input_tokens: None,
            output_tokens: None,
            error: Some("boom".to_string()),
        };

        let event = CliClient::map_line("model", line);
        assert!(event.is_error());
        assert_eq!(event.error_message.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_missing_command_is_provider_unavailable() {
        let client = client_for("definitely-not-a-real-binary-xyz", &[]);
        let request = LlmRequest::new("claude-sonnet", "sys", vec![Message::user("hi")]);

        let err = client.generate(request).await.unwrap_err();
        assert!(matches!(err, LlmError::ProviderUnavailable(_)));
    }

    #[tokio::test]
    async fn test_streams_json_lines_from_stdout() {
        // `cat` echoes our JSON payload back; it is not valid CliLine JSON,
        // so use sh to emit scripted lines instead.
        let client = client_for(
            "sh",
            &[
                "-c",
                r#"cat > /dev/null; echo '{"text":"first","partial":true}'; echo '{"text":"done","input_tokens":7,"output_tokens":3}'"#,
            ],
        );

        // sh ignores the trailing --model flag argument
        let mut request = LlmRequest::new("claude-sonnet", "sys", vec![Message::user("hi")]);
        request.timeout = Duration::from_secs(10);

        let events = client.generate(request).await.unwrap().collect().await;
        assert_eq!(events.len(), 2);
        assert!(events[0].partial);
        assert_eq!(events[1].first_text(), Some("done"));
        assert!(!events[1].partial);
    }

    #[tokio::test]
    async fn test_deadline_kills_child_and_emits_timeout() {
        let client = client_for("sh", &["-c", "cat > /dev/null; sleep 30"]);

        let mut request = LlmRequest::new("claude-sonnet", "sys", vec![Message::user("hi")]);
        request.timeout = Duration::from_millis(200);

        let events = client.generate(request).await.unwrap().collect().await;
        let last = events.last().expect("expected a terminal event");
        assert_eq!(last.error_code.as_deref(), Some("TIMEOUT"));
    }
}
