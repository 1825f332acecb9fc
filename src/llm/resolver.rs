//! Model alias resolution
//!
//! Proxy gateways expose short aliases for upstream model ids. The resolver
//! is asked for a canonical id explicitly; resolutions are cached with a TTL
//! so alias-table changes are picked up without restart.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;

/// Default time a cached resolution stays valid
pub const DEFAULT_RESOLVE_TTL: Duration = Duration::from_secs(300);

/// Resolves model aliases to canonical model ids
#[derive(Debug)]
pub struct AliasResolver {
    aliases: HashMap<String, String>,
    cache: Mutex<HashMap<String, (String, Instant)>>,
    ttl: Duration,
}

impl AliasResolver {
    /// Create a resolver over an alias table
    pub fn new(aliases: HashMap<String, String>, ttl: Duration) -> Self {
        Self {
            aliases,
            cache: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Resolver with the built-in alias table and default TTL
    pub fn with_defaults() -> Self {
        let aliases = [
            ("haiku", "claude-haiku"),
            ("sonnet", "claude-sonnet"),
            ("opus", "claude-opus"),
            ("flash", "gemini-flash"),
            ("pro", "gemini-pro"),
        ]
        .into_iter()
        .map(|(a, c)| (a.to_string(), c.to_string()))
        .collect();

        Self::new(aliases, DEFAULT_RESOLVE_TTL)
    }

    /// Resolve a model name to its canonical id
    ///
    /// Unknown names pass through unchanged (they may already be canonical).
    pub fn resolve(&self, model: &str) -> String {
        let mut cache = self.cache.lock().unwrap();

        if let Some((canonical, cached_at)) = cache.get(model)
            && cached_at.elapsed() < self.ttl
        {
            return canonical.clone();
        }

        let canonical = self.aliases.get(model).cloned().unwrap_or_else(|| model.to_string());
        debug!(%model, %canonical, "AliasResolver::resolve");
        cache.insert(model.to_string(), (canonical.clone(), Instant::now()));
        canonical
    }

    /// Drop every cached resolution
    pub fn invalidate(&self) {
        self.cache.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolves_known_alias() {
        let resolver = AliasResolver::with_defaults();
        assert_eq!(resolver.resolve("sonnet"), "claude-sonnet");
        assert_eq!(resolver.resolve("pro"), "gemini-pro");
    }

    #[test]
    fn test_canonical_passes_through() {
        let resolver = AliasResolver::with_defaults();
        assert_eq!(resolver.resolve("claude-opus"), "claude-opus");
    }

    #[test]
    fn test_cache_hit_after_first_resolve() {
        let resolver = AliasResolver::with_defaults();
        resolver.resolve("haiku");
        // Second resolve hits the cache; result is identical
        assert_eq!(resolver.resolve("haiku"), "claude-haiku");
    }

    #[test]
    fn test_expired_entries_are_rederived() {
        let aliases = [("fast".to_string(), "model-v1".to_string())].into_iter().collect();
        let resolver = AliasResolver::new(aliases, Duration::from_millis(0));

        assert_eq!(resolver.resolve("fast"), "model-v1");
        // TTL of zero means every lookup re-derives from the table
        assert_eq!(resolver.resolve("fast"), "model-v1");
    }

    #[test]
    fn test_invalidate_clears_cache() {
        let resolver = AliasResolver::with_defaults();
        resolver.resolve("opus");
        resolver.invalidate();
        assert_eq!(resolver.resolve("opus"), "claude-opus");
    }
}
