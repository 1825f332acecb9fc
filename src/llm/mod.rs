//! LLM Port
//!
//! Narrow interface producing a lazy sequence of events from a request,
//! with CLI-wrapper, HTTP-API, and proxy backends.

use std::sync::Arc;

use tracing::debug;

mod api;
mod cli;
pub mod client;
mod error;
mod proxy;
pub mod resolver;
mod types;

pub use api::ApiClient;
pub use cli::CliClient;
pub use client::{EventStream, LlmClient};
pub use error::{ErrorClass, LlmError};
pub use proxy::ProxyClient;
pub use resolver::AliasResolver;
pub use types::{ContentPart, LlmEvent, LlmRequest, Message, Role, UsageMetadata, error_codes};

use crate::config::{BackendKind, LlmConfig};
use crate::signal::ChildRegistry;

/// Create an LLM client for the configured backend
///
/// CLI-backend children are registered with `children` so the signal
/// handler can force-terminate them.
pub fn create_client(
    backend: BackendKind,
    config: &LlmConfig,
    children: Option<Arc<ChildRegistry>>,
) -> Result<Arc<dyn LlmClient>, LlmError> {
    debug!(?backend, provider = %config.provider, model = %config.model, "create_client: called");
    match backend {
        BackendKind::Api => Ok(Arc::new(ApiClient::from_config(config)?)),
        BackendKind::Cli => {
            let mut client = CliClient::from_config(config)?;
            if let Some(children) = children {
                client = client.with_child_registry(children);
            }
            Ok(Arc::new(client))
        }
        BackendKind::Proxy => {
            let resolver = Arc::new(AliasResolver::with_defaults());
            Ok(Arc::new(ProxyClient::from_config(config, resolver)?))
        }
    }
}
