//! MemoryStore - In-Memory Channel/Config Store
//!
//! ## Responsibilities
//!
//! - Channels, detection configs and rules, seeded from a JSON file
//! - Config updates (enable/disable survive for the process lifetime)
//! - Detection log in a ring buffer

use super::{
    Channel, ChannelStore, ConfigPatch, DetectionConfig, DetectionConfigStore, DetectionLogEntry,
    DetectionRule,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use tokio::sync::RwLock;

const DEFAULT_LOG_CAPACITY: usize = 2000;

/// Seed file layout
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSeed {
    #[serde(default)]
    pub channels: Vec<Channel>,
    #[serde(default)]
    pub configs: Vec<SeedConfig>,
}

/// Config with its rules inline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedConfig {
    #[serde(flatten)]
    pub config: DetectionConfig,
    #[serde(default)]
    pub rules: Vec<DetectionRule>,
}

/// Logged detection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionLogRecord {
    pub log_id: u64,
    pub config_id: String,
    pub rule_id: String,
    pub object_class: String,
    pub confidence: f64,
    pub message: String,
    pub logged_at: DateTime<Utc>,
}

struct DetectionLogBuffer {
    records: VecDeque<DetectionLogRecord>,
    capacity: usize,
    next_id: u64,
}

impl DetectionLogBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity.min(DEFAULT_LOG_CAPACITY)),
            capacity: capacity.max(1),
            next_id: 1,
        }
    }

    fn push(&mut self, config_id: &str, rule_id: &str, entry: DetectionLogEntry) -> u64 {
        let log_id = self.next_id;
        self.next_id += 1;

        if self.records.len() >= self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(DetectionLogRecord {
            log_id,
            config_id: config_id.to_string(),
            rule_id: rule_id.to_string(),
            object_class: entry.object_class,
            confidence: entry.confidence,
            message: entry.message,
            logged_at: Utc::now(),
        });
        log_id
    }

    fn get_latest(&self, count: usize) -> Vec<DetectionLogRecord> {
        self.records.iter().rev().take(count).cloned().collect()
    }
}

/// MemoryStore instance
pub struct MemoryStore {
    channels: RwLock<HashMap<String, Channel>>,
    /// config id -> config
    configs: RwLock<HashMap<String, DetectionConfig>>,
    /// config id -> rules
    rules: RwLock<HashMap<String, Vec<DetectionRule>>>,
    log: RwLock<DetectionLogBuffer>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_log_capacity(DEFAULT_LOG_CAPACITY)
    }

    pub fn with_log_capacity(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            configs: RwLock::new(HashMap::new()),
            rules: RwLock::new(HashMap::new()),
            log: RwLock::new(DetectionLogBuffer::new(capacity)),
        }
    }

    pub fn from_seed(seed: StoreSeed) -> Self {
        let channels = seed
            .channels
            .into_iter()
            .map(|c| (c.id.clone(), c))
            .collect();

        let mut configs = HashMap::new();
        let mut rules = HashMap::new();
        for SeedConfig {
            config,
            rules: config_rules,
        } in seed.configs
        {
            rules.insert(config.id.clone(), config_rules);
            configs.insert(config.id.clone(), config);
        }

        Self {
            channels: RwLock::new(channels),
            configs: RwLock::new(configs),
            rules: RwLock::new(rules),
            log: RwLock::new(DetectionLogBuffer::new(DEFAULT_LOG_CAPACITY)),
        }
    }

    /// Load a seed file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await?;
        let seed: StoreSeed = serde_json::from_str(&raw)?;

        tracing::info!(
            path = %path.display(),
            channels = seed.channels.len(),
            configs = seed.configs.len(),
            "Store seed loaded"
        );
        Ok(Self::from_seed(seed))
    }

    pub async fn insert_channel(&self, channel: Channel) {
        self.channels
            .write()
            .await
            .insert(channel.id.clone(), channel);
    }

    pub async fn insert_config(&self, config: DetectionConfig) {
        self.configs.write().await.insert(config.id.clone(), config);
    }

    pub async fn set_rules(&self, config_id: &str, rules: Vec<DetectionRule>) {
        self.rules
            .write()
            .await
            .insert(config_id.to_string(), rules);
    }

    /// Latest logged detections, newest first
    pub async fn recent_detections(&self, count: usize) -> Vec<DetectionLogRecord> {
        self.log.read().await.get_latest(count)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChannelStore for MemoryStore {
    async fn find_by_id(&self, id: &str) -> Result<Option<Channel>> {
        Ok(self.channels.read().await.get(id).cloned())
    }
}

#[async_trait]
impl DetectionConfigStore for MemoryStore {
    async fn get_config(&self, channel_id: &str) -> Result<Option<DetectionConfig>> {
        let configs = self.configs.read().await;
        Ok(configs
            .values()
            .find(|c| c.channel_id == channel_id)
            .cloned())
    }

    async fn get_enabled_rules(&self, config_id: &str) -> Result<Vec<DetectionRule>> {
        let rules = self.rules.read().await;
        Ok(rules
            .get(config_id)
            .map(|rules| rules.iter().filter(|r| r.enabled).cloned().collect())
            .unwrap_or_default())
    }

    async fn update_config(&self, config_id: &str, patch: ConfigPatch) -> Result<()> {
        let mut configs = self.configs.write().await;
        let config = configs
            .get_mut(config_id)
            .ok_or_else(|| Error::NotFound(format!("detection config {}", config_id)))?;
        patch.apply(config);
        tracing::debug!(config_id = %config_id, patch = ?patch, "Detection config updated");
        Ok(())
    }

    async fn log_detection(
        &self,
        config_id: &str,
        rule_id: &str,
        entry: DetectionLogEntry,
    ) -> Result<()> {
        let log_id = self.log.write().await.push(config_id, rule_id, entry);
        tracing::debug!(log_id = log_id, config_id = %config_id, "Detection logged");
        Ok(())
    }

    async fn list_enabled_configs(&self) -> Result<Vec<DetectionConfig>> {
        let configs = self.configs.read().await;
        let mut enabled: Vec<DetectionConfig> =
            configs.values().filter(|c| c.is_enabled).cloned().collect();
        enabled.sort_by(|a, b| a.channel_id.cmp(&b.channel_id));
        Ok(enabled)
    }
}
