//! Collaborators - External Contracts
//!
//! Everything the detection core consumes but does not own: channel and
//! detection-config persistence, stream liveness, chat delivery.
//!
//! ## Provided adapters
//!
//! - `MemoryStore`: channels, configs and rules seeded from JSON, detection
//!   log kept in a ring buffer
//! - `FfprobeLivenessChecker`: ffprobe probe with timeout
//! - `WebhookNotifier` / `LogNotifier`: chat delivery

mod liveness;
mod memory_store;
mod notifier;

pub use liveness::FfprobeLivenessChecker;
pub use memory_store::{DetectionLogRecord, MemoryStore, SeedConfig, StoreSeed};
pub use notifier::{LogNotifier, WebhookNotifier};

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Chat channel a stream belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    pub username: String,
}

/// Per-channel detection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionConfig {
    pub id: String,
    pub channel_id: String,
    #[serde(default)]
    pub stream_url: Option<String>,
    /// Fallback cooldown for rules without their own
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: u64,
    #[serde(default)]
    pub is_enabled: bool,
}

fn default_cooldown_seconds() -> u64 {
    30
}

/// Per-object-class detection policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRule {
    pub id: String,
    pub object_class: String,
    pub min_confidence: f64,
    #[serde(default)]
    pub cooldown_seconds: Option<u64>,
    #[serde(default)]
    pub message_template: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Partial config update
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_seconds: Option<u64>,
}

impl ConfigPatch {
    pub fn enabled(is_enabled: bool) -> Self {
        Self {
            is_enabled: Some(is_enabled),
            ..Default::default()
        }
    }

    pub fn apply(&self, config: &mut DetectionConfig) {
        if let Some(enabled) = self.is_enabled {
            config.is_enabled = enabled;
        }
        if let Some(url) = &self.stream_url {
            config.stream_url = Some(url.clone());
        }
        if let Some(cooldown) = self.cooldown_seconds {
            config.cooldown_seconds = cooldown;
        }
    }
}

/// Payload of a fired detection, as persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionLogEntry {
    pub object_class: String,
    pub confidence: f64,
    pub message: String,
}

/// Result of a liveness probe. `error` set means the probe itself could not
/// answer, not that the stream is offline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LivenessReport {
    pub is_live: bool,
    pub error: Option<String>,
}

impl LivenessReport {
    pub fn live() -> Self {
        Self {
            is_live: true,
            error: None,
        }
    }

    pub fn offline() -> Self {
        Self {
            is_live: false,
            error: None,
        }
    }

    pub fn unavailable(error: impl Into<String>) -> Self {
        Self {
            is_live: false,
            error: Some(error.into()),
        }
    }
}

#[async_trait]
pub trait ChannelStore: Send + Sync {
    async fn find_by_id(&self, id: &str) -> Result<Option<Channel>>;
}

#[async_trait]
pub trait DetectionConfigStore: Send + Sync {
    async fn get_config(&self, channel_id: &str) -> Result<Option<DetectionConfig>>;

    async fn get_enabled_rules(&self, config_id: &str) -> Result<Vec<DetectionRule>>;

    async fn update_config(&self, config_id: &str, patch: ConfigPatch) -> Result<()>;

    async fn log_detection(
        &self,
        config_id: &str,
        rule_id: &str,
        entry: DetectionLogEntry,
    ) -> Result<()>;

    /// Configs with `is_enabled`, used to restore monitoring at boot
    async fn list_enabled_configs(&self) -> Result<Vec<DetectionConfig>>;
}

#[async_trait]
pub trait LivenessChecker: Send + Sync {
    async fn is_live(&self, stream_url: &str) -> LivenessReport;
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn say(&self, channel_username: &str, message: &str) -> Result<()>;
}
