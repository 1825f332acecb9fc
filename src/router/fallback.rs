//! Fallback router
//!
//! Wraps model selection with liveness probing and per-provider failover
//! ordering: the primary is probed first, then fallbacks on the same
//! backend, then providers on other backends.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::{BackendKind, LlmConfig};
use crate::llm::{self, LlmClient, LlmError};

/// Default deadline for a liveness probe
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// A provider a request could be routed to
#[derive(Debug, Clone)]
pub struct ProviderEndpoint {
    pub provider: String,
    pub backend: BackendKind,
    pub config: LlmConfig,
}

/// Liveness oracle for provider endpoints
#[async_trait]
pub trait HealthMonitor: Send + Sync {
    /// Whether the endpoint currently responds at all
    async fn probe(&self, endpoint: &ProviderEndpoint) -> bool;
}

/// Probes HTTP endpoints with a short deadline
///
/// Any HTTP response, including 4xx, counts as alive; only connect
/// failures and timeouts mark an endpoint dead. CLI backends are probed
/// by checking the command resolves on PATH.
pub struct HttpHealthMonitor {
    http: reqwest::Client,
    timeout: Duration,
}

impl HttpHealthMonitor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            timeout,
        }
    }
}

impl Default for HttpHealthMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_TIMEOUT)
    }
}

#[async_trait]
impl HealthMonitor for HttpHealthMonitor {
    async fn probe(&self, endpoint: &ProviderEndpoint) -> bool {
        match endpoint.backend {
            BackendKind::Cli => {
                let command = endpoint.config.command.clone();
                tokio::task::spawn_blocking(move || which(&command))
                    .await
                    .unwrap_or(false)
            }
            BackendKind::Api | BackendKind::Proxy => {
                let request = self.http.get(&endpoint.config.base_url).timeout(self.timeout).send();
                match tokio::time::timeout(self.timeout, request).await {
                    Ok(Ok(_)) => true,
                    Ok(Err(e)) => !e.is_connect(),
                    Err(_) => false,
                }
            }
        }
    }
}

/// Resolve a command on PATH
fn which(command: &str) -> bool {
    if command.contains('/') {
        return std::path::Path::new(command).exists();
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(command).exists()))
        .unwrap_or(false)
}

/// Wraps client construction with liveness probing and failover
pub struct FallbackRouter {
    monitor: Arc<dyn HealthMonitor>,
    fallbacks: Vec<ProviderEndpoint>,
    children: Option<Arc<crate::signal::ChildRegistry>>,
}

impl FallbackRouter {
    /// Create a router over an ordered fallback list
    pub fn new(monitor: Arc<dyn HealthMonitor>, fallbacks: Vec<ProviderEndpoint>) -> Self {
        Self {
            monitor,
            fallbacks,
            children: None,
        }
    }

    /// Register CLI-backend children with the signal handler's registry
    pub fn with_child_registry(mut self, children: Arc<crate::signal::ChildRegistry>) -> Self {
        self.children = Some(children);
        self
    }

    /// Get an LLM client for the model, failing over across providers
    ///
    /// Probes the primary first; if dead, walks fallbacks ordered same
    /// backend first, then other backends.
    pub async fn llm_with_fallback(
        &self,
        model: &str,
        primary: &ProviderEndpoint,
    ) -> Result<Arc<dyn LlmClient>, LlmError> {
        if self.monitor.probe(primary).await {
            debug!(provider = %primary.provider, %model, "llm_with_fallback: primary alive");
            return llm::create_client(primary.backend, &primary.config, self.children.clone());
        }

        warn!(provider = %primary.provider, "llm_with_fallback: primary dead, trying fallbacks");

        let mut ordered: Vec<&ProviderEndpoint> = self
            .fallbacks
            .iter()
            .filter(|e| e.provider != primary.provider && e.backend == primary.backend)
            .collect();
        ordered.extend(
            self.fallbacks
                .iter()
                .filter(|e| e.provider != primary.provider && e.backend != primary.backend),
        );

        for endpoint in ordered {
            if self.monitor.probe(endpoint).await {
                info!(provider = %endpoint.provider, backend = ?endpoint.backend, "llm_with_fallback: failing over");
                return llm::create_client(endpoint.backend, &endpoint.config, self.children.clone());
            }
            debug!(provider = %endpoint.provider, "llm_with_fallback: fallback dead");
        }

        Err(LlmError::NoProviderAvailable(format!(
            "no live provider for model '{}'",
            model
        )))
    }
}
