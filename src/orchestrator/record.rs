//! Registry records and status views

use crate::collaborators::{Channel, DetectionConfig};
use crate::detection_pipeline::{DetectionPipeline, PipelineStats};
use crate::frame_source::CaptureStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Monitoring state of one channel. `Disabled` channels are not in the
/// registry; the variant exists for status views.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorState {
    Disabled,
    /// Enabled, stream offline (or start failed transiently)
    Pending,
    Monitoring,
    /// Pipeline failed at runtime; retried by the poll like Pending
    PausedError,
}

impl MonitorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MonitorState::Disabled => "disabled",
            MonitorState::Pending => "pending",
            MonitorState::Monitoring => "monitoring",
            MonitorState::PausedError => "paused_error",
        }
    }

    /// States the poll tries to promote to Monitoring
    pub fn is_waiting(&self) -> bool {
        matches!(self, MonitorState::Pending | MonitorState::PausedError)
    }
}

/// One channel inside the orchestrator registry
pub struct PipelineRecord {
    pub channel: Channel,
    pub config: DetectionConfig,
    pub stream_url: String,
    pub state: MonitorState,
    /// Set only while Monitoring
    pub pipeline: Option<Arc<DetectionPipeline>>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
    /// Forwards runtime pipeline errors back to the orchestrator
    pub(crate) watcher: Option<JoinHandle<()>>,
}

impl PipelineRecord {
    pub fn pending(
        channel: Channel,
        config: DetectionConfig,
        stream_url: String,
        last_error: Option<String>,
    ) -> Self {
        Self {
            channel,
            config,
            stream_url,
            state: MonitorState::Pending,
            pipeline: None,
            last_error,
            updated_at: Utc::now(),
            watcher: None,
        }
    }

    /// Leave Monitoring: detach the pipeline and set `state`. The watcher
    /// handle is dropped, not aborted, since the watcher may be the caller.
    pub(crate) fn demote(
        &mut self,
        state: MonitorState,
        last_error: Option<String>,
    ) -> Option<Arc<DetectionPipeline>> {
        self.watcher.take();
        self.state = state;
        self.last_error = last_error;
        self.updated_at = Utc::now();
        self.pipeline.take()
    }

    pub(crate) fn abort_watcher(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }

    pub fn status(&self) -> ChannelStatus {
        ChannelStatus {
            channel_id: self.channel.id.clone(),
            channel_name: Some(self.channel.username.clone()),
            state: self.state,
            last_error: self.last_error.clone(),
            capture: self.pipeline.as_ref().map(|p| p.capture_status()),
            stats: self.pipeline.as_ref().map(|p| p.stats()),
            updated_at: Some(self.updated_at),
        }
    }
}

/// Status view of one channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelStatus {
    pub channel_id: String,
    pub channel_name: Option<String>,
    pub state: MonitorState,
    pub last_error: Option<String>,
    pub capture: Option<CaptureStatus>,
    pub stats: Option<PipelineStats>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl ChannelStatus {
    pub fn disabled(channel_id: &str) -> Self {
        Self {
            channel_id: channel_id.to_string(),
            channel_name: None,
            state: MonitorState::Disabled,
            last_error: None,
            capture: None,
            stats: None,
            updated_at: None,
        }
    }
}
