//! Context plugin
//!
//! Gathers compact project context (schema model names, route summaries,
//! memories matching the agent) once per agent within a cache TTL, wraps it
//! in XML-like delimiters, and prepends it as a synthetic user message.
//! The sources are external collaborators; the core consumes only strings.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::llm::{LlmEvent, LlmRequest, Message};
use crate::util::truncate_chars;

use super::{InvocationContext, Plugin, keys};

/// Memories injected per agent are capped at this many entries
const MAX_MEMORIES: usize = 5;

/// External provider of project context strings
#[async_trait]
pub trait ContextSource: Send + Sync {
    /// Compact schema summary (model names), if available
    async fn schema_summary(&self) -> Option<String>;

    /// Route summaries, if available
    async fn route_summaries(&self) -> Option<String>;

    /// Memories relevant to the agent, most relevant first
    async fn memories_for(&self, agent_name: &str) -> Vec<String>;
}

/// Context injection policy
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Character budget per section
    pub section_char_budget: usize,
    pub cache_ttl_ms: u64,
    /// When false the memories section is never gathered or injected
    pub include_memories: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            section_char_budget: 2000,
            cache_ttl_ms: 60_000,
            include_memories: true,
        }
    }
}

/// Published under `__context` after injection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextDelta {
    pub injected: bool,
    pub has_schema: bool,
    pub has_routes: bool,
    pub has_memories: bool,
}

struct CachedBlock {
    block: String,
    delta: ContextDelta,
    built_at: Instant,
}

/// Context source over fixed strings
///
/// Used when the host wires context in from files or flags rather than a
/// live collaborator.
#[derive(Debug, Clone, Default)]
pub struct StaticContextSource {
    pub schema: Option<String>,
    pub routes: Option<String>,
    pub memories: Vec<String>,
}

#[async_trait]
impl ContextSource for StaticContextSource {
    async fn schema_summary(&self) -> Option<String> {
        self.schema.clone()
    }

    async fn route_summaries(&self) -> Option<String> {
        self.routes.clone()
    }

    async fn memories_for(&self, _agent_name: &str) -> Vec<String> {
        self.memories.clone()
    }
}

/// Injects compact project context ahead of the first user message
pub struct ContextPlugin {
    source: Arc<dyn ContextSource>,
    config: ContextConfig,
    cache: Mutex<HashMap<String, CachedBlock>>,
}

impl ContextPlugin {
    pub fn new(source: Arc<dyn ContextSource>, config: ContextConfig) -> Self {
        Self {
            source,
            config,
            cache: Mutex::new(HashMap::new()),
        }
    }

    async fn build_block(&self, agent_name: &str) -> (String, ContextDelta) {
        let budget = self.config.section_char_budget;
        let mut sections = Vec::new();

        let schema = self.source.schema_summary().await;
        if let Some(schema) = &schema {
            sections.push(format!("<schema>\n{}\n</schema>", truncate_chars(schema, budget)));
        }

        let routes = self.source.route_summaries().await;
        if let Some(routes) = &routes {
            sections.push(format!("<routes>\n{}\n</routes>", truncate_chars(routes, budget)));
        }

        let memories = if self.config.include_memories {
            self.source.memories_for(agent_name).await
        } else {
            Vec::new()
        };
        let memories: Vec<&String> = memories.iter().take(MAX_MEMORIES).collect();
        if !memories.is_empty() {
            let joined = memories.iter().map(|m| format!("- {}", m)).collect::<Vec<_>>().join("\n");
            sections.push(format!("<memories>\n{}\n</memories>", truncate_chars(&joined, budget)));
        }

        let delta = ContextDelta {
            injected: !sections.is_empty(),
            has_schema: schema.is_some(),
            has_routes: routes.is_some(),
            has_memories: !memories.is_empty(),
        };

        let block = if sections.is_empty() {
            String::new()
        } else {
            format!("<project-context>\n{}\n</project-context>", sections.join("\n"))
        };

        (block, delta)
    }
}

#[async_trait]
impl Plugin for ContextPlugin {
    fn name(&self) -> &'static str {
        "context"
    }

    async fn before_model(&self, ctx: &mut InvocationContext, request: &mut LlmRequest) -> Option<LlmEvent> {
        let ttl = Duration::from_millis(self.config.cache_ttl_ms);

        let mut cache = self.cache.lock().await;
        let hit = cache
            .get(&ctx.agent_name)
            .filter(|c| c.built_at.elapsed() < ttl)
            .map(|c| (c.block.clone(), c.delta.clone()));

        let (block, delta) = match hit {
            Some(pair) => pair,
            None => {
                debug!(agent = %ctx.agent_name, "ContextPlugin: building context block");
                let (block, delta) = self.build_block(&ctx.agent_name).await;
                cache.insert(
                    ctx.agent_name.clone(),
                    CachedBlock {
                        block: block.clone(),
                        delta: delta.clone(),
                        built_at: Instant::now(),
                    },
                );
                (block, delta)
            }
        };
        drop(cache);

        if delta.injected {
            request.messages.insert(0, Message::user(block));
        }
        ctx.publish(keys::CONTEXT, &delta);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubSource {
        schema: Option<String>,
        routes: Option<String>,
        memories: Vec<String>,
        calls: AtomicUsize,
    }

    impl StubSource {
        fn full() -> Self {
            Self {
                schema: Some("User, Post, Comment".to_string()),
                routes: Some("GET /users, POST /posts".to_string()),
                memories: vec!["prefers small PRs".to_string(), "uses pnpm".to_string()],
                calls: AtomicUsize::new(0),
            }
        }

        fn empty() -> Self {
            Self {
                schema: None,
                routes: None,
                memories: vec![],
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ContextSource for StubSource {
        async fn schema_summary(&self) -> Option<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.schema.clone()
        }

        async fn route_summaries(&self) -> Option<String> {
            self.routes.clone()
        }

        async fn memories_for(&self, _agent_name: &str) -> Vec<String> {
            self.memories.clone()
        }
    }

    #[tokio::test]
    async fn test_injects_wrapped_context_message() {
        let source = Arc::new(StubSource::full());
        let plugin = ContextPlugin::new(source, ContextConfig::default());

        let mut ctx = InvocationContext::new("agent", "t1", "s1");
        let mut request = LlmRequest::new("claude-sonnet", "sys", vec![Message::user("do the task")]);

        assert!(plugin.before_model(&mut ctx, &mut request).await.is_none());

        assert_eq!(request.messages.len(), 2);
        let injected = &request.messages[0].content;
        assert!(injected.starts_with("<project-context>"));
        assert!(injected.contains("<schema>"));
        assert!(injected.contains("<routes>"));
        assert!(injected.contains("<memories>"));
        assert!(injected.contains("prefers small PRs"));

        let delta: ContextDelta = ctx.read(keys::CONTEXT).unwrap();
        assert!(delta.injected && delta.has_schema && delta.has_routes && delta.has_memories);
    }

    #[tokio::test]
    async fn test_empty_sources_inject_nothing() {
        let source = Arc::new(StubSource::empty());
        let plugin = ContextPlugin::new(source, ContextConfig::default());

        let mut ctx = InvocationContext::new("agent", "t1", "s1");
        let mut request = LlmRequest::new("claude-sonnet", "sys", vec![Message::user("do the task")]);

        plugin.before_model(&mut ctx, &mut request).await;

        assert_eq!(request.messages.len(), 1);
        let delta: ContextDelta = ctx.read(keys::CONTEXT).unwrap();
        assert!(!delta.injected);
    }

    #[tokio::test]
    async fn test_cache_hits_within_ttl() {
        let source = Arc::new(StubSource::full());
        let plugin = ContextPlugin::new(source.clone(), ContextConfig::default());

        for _ in 0..3 {
            let mut ctx = InvocationContext::new("agent", "t1", "s1");
            let mut request = LlmRequest::new("claude-sonnet", "sys", vec![]);
            plugin.before_model(&mut ctx, &mut request).await;
        }

        // Sources were consulted once; later calls hit the cache
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_sections_are_truncated_to_budget() {
        let source = Arc::new(StubSource {
            schema: Some("x".repeat(10_000)),
            routes: None,
            memories: vec![],
            calls: AtomicUsize::new(0),
        });
        let plugin = ContextPlugin::new(
            source,
            ContextConfig {
                section_char_budget: 100,
                ..ContextConfig::default()
            },
        );

        let mut ctx = InvocationContext::new("agent", "t1", "s1");
        let mut request = LlmRequest::new("claude-sonnet", "sys", vec![]);
        plugin.before_model(&mut ctx, &mut request).await;

        let injected = &request.messages[0].content;
        assert!(injected.len() < 500);
        assert!(injected.contains("[truncated]"));
    }

    #[tokio::test]
    async fn test_memories_disabled() {
        let source = Arc::new(StubSource::full());
        let plugin = ContextPlugin::new(
            source,
            ContextConfig {
                include_memories: false,
                ..ContextConfig::default()
            },
        );

        let mut ctx = InvocationContext::new("agent", "t1", "s1");
        let mut request = LlmRequest::new("claude-sonnet", "sys", vec![]);
        plugin.before_model(&mut ctx, &mut request).await;

        let injected = &request.messages[0].content;
        assert!(injected.contains("<schema>"));
        assert!(!injected.contains("<memories>"));

        let delta: ContextDelta = ctx.read(keys::CONTEXT).unwrap();
        assert!(!delta.has_memories);
    }

    #[tokio::test]
    async fn test_memories_capped_at_five() {
        let source = Arc::new(StubSource {
            schema: None,
            routes: None,
            memories: (0..10).map(|i| format!("memory {}", i)).collect(),
            calls: AtomicUsize::new(0),
        });
        let plugin = ContextPlugin::new(source, ContextConfig::default());

        let mut ctx = InvocationContext::new("agent", "t1", "s1");
        let mut request = LlmRequest::new("claude-sonnet", "sys", vec![]);
        plugin.before_model(&mut ctx, &mut request).await;

        let injected = &request.messages[0].content;
        assert!(injected.contains("memory 4"));
        assert!(!injected.contains("memory 5"));
    }
}
