//! Application configuration (environment variables with defaults)

use crate::detection_pipeline::PipelineSettings;
use crate::error::{Error, Result};
use crate::frame_source::{CaptureSettings, ReconnectPolicy, SourcePolicy};
use crate::orchestrator::OrchestratorSettings;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// JSON seed for the in-memory store
    pub store_path: PathBuf,
    pub inference_url: String,
    /// None: notifications go to the log
    pub notify_webhook_url: Option<String>,
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    pub frame_interval_ms: u64,
    pub frame_quality: u8,
    /// None keeps the source width
    pub frame_width: Option<u32>,
    pub max_frame_bytes: usize,
    pub frame_buffer_capacity: usize,
    pub reconnect_attempts: u32,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub connect_timeout_sec: u64,
    pub stop_grace_ms: u64,
    pub rules_ttl_sec: u64,
    pub poll_interval_sec: u64,
    pub liveness_timeout_sec: u64,
    /// Empty: any host
    pub allowed_stream_hosts: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }
}

impl AppConfig {
    /// Build from an arbitrary key lookup (the environment in production)
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let num = |key: &str, default: u64| parse_or(&lookup, key, default);

        Self {
            store_path: lookup("STREAMWATCH_STORE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("streamwatch.json")),
            inference_url: lookup("INFERENCE_URL")
                .unwrap_or_else(|| "http://127.0.0.1:9000".to_string()),
            notify_webhook_url: lookup("NOTIFY_WEBHOOK_URL").filter(|u| !u.trim().is_empty()),
            ffmpeg_path: lookup("FFMPEG_PATH").unwrap_or_else(|| "ffmpeg".to_string()),
            ffprobe_path: lookup("FFPROBE_PATH").unwrap_or_else(|| "ffprobe".to_string()),
            frame_interval_ms: num("FRAME_INTERVAL_MS", 2000),
            frame_quality: parse_or(&lookup, "FRAME_QUALITY", 5),
            frame_width: match parse_or::<u32, _>(&lookup, "FRAME_WIDTH", 640) {
                0 => None,
                width => Some(width),
            },
            max_frame_bytes: parse_or(&lookup, "MAX_FRAME_BYTES", 2 * 1024 * 1024),
            frame_buffer_capacity: parse_or(&lookup, "FRAME_BUFFER_CAPACITY", 5),
            reconnect_attempts: parse_or(&lookup, "RECONNECT_ATTEMPTS", 5),
            reconnect_base_ms: num("RECONNECT_BASE_MS", 1000),
            reconnect_max_ms: num("RECONNECT_MAX_MS", 30_000),
            connect_timeout_sec: num("CONNECT_TIMEOUT_SEC", 15),
            stop_grace_ms: num("STOP_GRACE_MS", 3000),
            rules_ttl_sec: num("RULES_TTL_SEC", 60),
            poll_interval_sec: num("POLL_INTERVAL_SEC", 60),
            liveness_timeout_sec: num("LIVENESS_TIMEOUT_SEC", 10),
            allowed_stream_hosts: lookup("ALLOWED_STREAM_HOSTS")
                .map(|hosts| {
                    hosts
                        .split(',')
                        .map(|h| h.trim().to_string())
                        .filter(|h| !h.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
        }
    }

    /// Reject settings that cannot work
    pub fn validate(&self) -> Result<()> {
        if self.frame_interval_ms == 0 {
            return Err(Error::Config("FRAME_INTERVAL_MS must be > 0".to_string()));
        }
        if !(2..=31).contains(&self.frame_quality) {
            return Err(Error::Config("FRAME_QUALITY must be 2..=31".to_string()));
        }
        if self.max_frame_bytes < crate::frame_source::MIN_FRAME_BYTES {
            return Err(Error::Config("MAX_FRAME_BYTES too small".to_string()));
        }
        if self.reconnect_base_ms > self.reconnect_max_ms {
            return Err(Error::Config(
                "RECONNECT_BASE_MS must not exceed RECONNECT_MAX_MS".to_string(),
            ));
        }
        if self.poll_interval_sec == 0 {
            return Err(Error::Config("POLL_INTERVAL_SEC must be > 0".to_string()));
        }
        Ok(())
    }

    pub fn capture_settings(&self) -> CaptureSettings {
        CaptureSettings {
            frame_interval_ms: self.frame_interval_ms,
            quality: self.frame_quality,
            width: self.frame_width,
            max_frame_bytes: self.max_frame_bytes,
            buffer_capacity: self.frame_buffer_capacity,
            reconnect: ReconnectPolicy {
                max_attempts: self.reconnect_attempts,
                base_delay: Duration::from_millis(self.reconnect_base_ms),
                max_delay: Duration::from_millis(self.reconnect_max_ms),
            },
            connect_timeout: Duration::from_secs(self.connect_timeout_sec),
            stop_grace: Duration::from_millis(self.stop_grace_ms),
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            rules_ttl: Duration::from_secs(self.rules_ttl_sec),
            ..PipelineSettings::default()
        }
    }

    pub fn source_policy(&self) -> SourcePolicy {
        if self.allowed_stream_hosts.is_empty() {
            SourcePolicy::default()
        } else {
            SourcePolicy::with_hosts(self.allowed_stream_hosts.clone())
        }
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            poll_interval: Duration::from_secs(self.poll_interval_sec),
            capture: self.capture_settings(),
            pipeline: self.pipeline_settings(),
            source_policy: self.source_policy(),
        }
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_sec)
    }
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> T
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key = key, value = %raw, "Invalid config value, using default");
            default
        }),
        None => default,
    }
}
