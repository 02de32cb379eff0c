//! RuleEngine - Per-Channel Detection Rules
//!
//! ## Responsibilities
//!
//! - Fetch enabled rules for one detection config
//! - TTL cache so the store is not queried per frame
//! - Serve the last known-good set when a refresh fails
//! - Index rules by normalised object class
//!
//! A cache that was never populated yields an empty set: no rules, no
//! notifications.

pub mod template;

use crate::collaborators::{DetectionConfigStore, DetectionRule};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

pub const DEFAULT_RULES_TTL: Duration = Duration::from_secs(60);

/// Object class as used for matching: trimmed, lowercase
pub fn normalize_class(class: &str) -> String {
    class.trim().to_lowercase()
}

/// Enabled rules keyed by normalised object class
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    by_class: HashMap<String, DetectionRule>,
}

impl RuleSet {
    /// Build from store rules. Disabled rules are skipped; when two enabled
    /// rules target the same class the one with the lowest id is kept.
    pub fn from_rules(rules: Vec<DetectionRule>) -> Self {
        let mut by_class: HashMap<String, DetectionRule> = HashMap::new();

        for rule in rules.into_iter().filter(|r| r.enabled) {
            let class = normalize_class(&rule.object_class);
            if class.is_empty() {
                continue;
            }
            match by_class.get(&class) {
                Some(existing) if existing.id <= rule.id => {
                    tracing::warn!(
                        object_class = %class,
                        kept = %existing.id,
                        ignored = %rule.id,
                        "Duplicate rule for object class"
                    );
                }
                _ => {
                    by_class.insert(class, rule);
                }
            }
        }

        Self { by_class }
    }

    /// Exact match on an already-normalised class
    pub fn lookup(&self, class: &str) -> Option<&DetectionRule> {
        self.by_class.get(class)
    }

    pub fn len(&self) -> usize {
        self.by_class.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_class.is_empty()
    }
}

#[derive(Default)]
struct RuleCache {
    rules: Option<Arc<RuleSet>>,
    fetched_at: Option<Instant>,
}

/// RuleEngine instance (one per pipeline)
pub struct RuleEngine {
    store: Arc<dyn DetectionConfigStore>,
    config_id: String,
    ttl: Duration,
    cache: RwLock<RuleCache>,
}

impl RuleEngine {
    pub fn new(store: Arc<dyn DetectionConfigStore>, config_id: impl Into<String>) -> Self {
        Self::with_ttl(store, config_id, DEFAULT_RULES_TTL)
    }

    pub fn with_ttl(
        store: Arc<dyn DetectionConfigStore>,
        config_id: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            config_id: config_id.into(),
            ttl,
            cache: RwLock::new(RuleCache::default()),
        }
    }

    /// Current rule set, refreshed when the TTL has expired
    pub async fn rules(&self) -> Arc<RuleSet> {
        {
            let cache = self.cache.read().await;
            if let (Some(rules), Some(fetched_at)) = (&cache.rules, cache.fetched_at) {
                if fetched_at.elapsed() < self.ttl {
                    return rules.clone();
                }
            }
        }

        match self.store.get_enabled_rules(&self.config_id).await {
            Ok(rules) => {
                let set = Arc::new(RuleSet::from_rules(rules));
                tracing::debug!(
                    config_id = %self.config_id,
                    rules = set.len(),
                    "Rule cache refreshed"
                );
                let mut cache = self.cache.write().await;
                cache.rules = Some(set.clone());
                cache.fetched_at = Some(Instant::now());
                set
            }
            Err(e) => {
                let cache = self.cache.read().await;
                match &cache.rules {
                    Some(stale) => {
                        tracing::warn!(
                            config_id = %self.config_id,
                            error = %e,
                            "Rule refresh failed, serving last known rules"
                        );
                        stale.clone()
                    }
                    None => {
                        tracing::warn!(
                            config_id = %self.config_id,
                            error = %e,
                            "Rule refresh failed and no rules cached"
                        );
                        Arc::new(RuleSet::default())
                    }
                }
            }
        }
    }

    /// Force the next `rules()` call to refetch. The current set is kept as
    /// the fallback.
    pub async fn invalidate(&self) {
        self.cache.write().await.fetched_at = None;
    }

    pub fn config_id(&self) -> &str {
        &self.config_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{rule, FlakyConfigStore};

    #[test]
    fn test_ruleset_normalises_and_skips_disabled() {
        let mut disabled = rule("r2", "Dog", 0.5);
        disabled.enabled = false;
        let set = RuleSet::from_rules(vec![rule("r1", "  Cat ", 0.5), disabled]);

        assert_eq!(set.len(), 1);
        assert!(set.lookup("cat").is_some());
        assert!(set.lookup("dog").is_none());
        // exact match only
        assert!(set.lookup("ca").is_none());
    }

    #[test]
    fn test_duplicate_class_keeps_lowest_id() {
        let set = RuleSet::from_rules(vec![rule("r9", "cat", 0.9), rule("r1", "CAT", 0.1)]);
        assert_eq!(set.lookup("cat").unwrap().id, "r1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_respects_ttl_and_invalidate() {
        let store = Arc::new(FlakyConfigStore::new());
        store.set_rules("cfg-1", vec![rule("r1", "cat", 0.5)]).await;
        let engine = RuleEngine::with_ttl(store.clone(), "cfg-1", Duration::from_secs(60));

        assert_eq!(engine.rules().await.len(), 1);
        store
            .set_rules("cfg-1", vec![rule("r1", "cat", 0.5), rule("r2", "dog", 0.5)])
            .await;

        // Still cached
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(engine.rules().await.len(), 1);
        assert_eq!(store.rule_fetches(), 1);

        engine.invalidate().await;
        assert_eq!(engine.rules().await.len(), 2);
        assert_eq!(store.rule_fetches(), 2);

        tokio::time::advance(Duration::from_secs(61)).await;
        engine.rules().await;
        assert_eq!(store.rule_fetches(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_failure_serves_last_known_good() {
        let store = Arc::new(FlakyConfigStore::new());
        store.set_rules("cfg-1", vec![rule("r1", "cat", 0.5)]).await;
        let engine = RuleEngine::with_ttl(store.clone(), "cfg-1", Duration::from_secs(60));

        assert_eq!(engine.rules().await.len(), 1);

        store.fail_rules(true);
        tokio::time::advance(Duration::from_secs(61)).await;
        let rules = engine.rules().await;
        assert!(rules.lookup("cat").is_some());
    }

    #[tokio::test]
    async fn test_never_populated_cache_fails_closed() {
        let store = Arc::new(FlakyConfigStore::new());
        store.fail_rules(true);
        let engine = RuleEngine::new(store, "cfg-1");

        assert!(engine.rules().await.is_empty());
    }
}
