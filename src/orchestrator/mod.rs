//! Orchestrator - Multi-Channel Supervision
//!
//! ## Responsibilities
//!
//! - Single registry of monitored channels (`channel_id -> PipelineRecord`)
//! - Start/stop monitoring on request, restore enabled channels at boot
//! - Liveness poll: promote Pending channels whose stream came online,
//!   pause Monitoring channels whose stream went offline
//! - Demote channels whose pipeline fails at runtime to PausedError
//! - Isolate failures per channel
//!
//! ## Locking
//!
//! Every transition for a channel runs under that channel's lock (same
//! keyed-mutex scheme as per-camera RTSP access), so the public API and the
//! poll loop never interleave on one channel. The registry lock itself is
//! never held across a pipeline start or stop.

mod record;

pub use record::{ChannelStatus, MonitorState, PipelineRecord};

use crate::collaborators::{
    Channel, ChannelStore, ConfigPatch, DetectionConfig, DetectionConfigStore, LivenessChecker,
    Notifier,
};
use crate::detection_pipeline::{
    DetectionPipeline, PipelineDeps, PipelineEvent, PipelineFailure, PipelineSettings,
};
use crate::error::{Error, Result};
use crate::frame_source::{CaptureSettings, CaptureStatus, FrameDecoder, FrameSource, SourcePolicy};
use crate::inference::InferenceEngine;
use chrono::Utc;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Orchestrator tuning
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub poll_interval: Duration,
    pub capture: CaptureSettings,
    pub pipeline: PipelineSettings,
    pub source_policy: SourcePolicy,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            capture: CaptureSettings::default(),
            pipeline: PipelineSettings::default(),
            source_policy: SourcePolicy::default(),
        }
    }
}

/// Collaborators the orchestrator wires into every pipeline
#[derive(Clone)]
pub struct OrchestratorDeps {
    pub channels: Arc<dyn ChannelStore>,
    pub configs: Arc<dyn DetectionConfigStore>,
    /// None: every stream is assumed live
    pub liveness: Option<Arc<dyn LivenessChecker>>,
    pub notifier: Arc<dyn Notifier>,
    pub engine: Arc<dyn InferenceEngine>,
    pub decoder: Arc<dyn FrameDecoder>,
}

/// Liveness as the orchestrator acts on it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Probe {
    Live,
    Offline,
    /// No checker, or the checker could not answer
    Unknown,
}

struct PollHandle {
    task: JoinHandle<()>,
    stop_tx: watch::Sender<bool>,
}

/// Orchestrator instance
pub struct Orchestrator {
    deps: OrchestratorDeps,
    settings: OrchestratorSettings,
    registry: RwLock<HashMap<String, PipelineRecord>>,
    /// Per-channel transition locks, kept only while a channel is
    /// registered or a transition is in flight
    locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
    running: AtomicBool,
    shutting_down: AtomicBool,
    poll: Mutex<Option<PollHandle>>,
}

impl Orchestrator {
    pub fn new(deps: OrchestratorDeps, settings: OrchestratorSettings) -> Arc<Self> {
        Arc::new(Self {
            deps,
            settings,
            registry: RwLock::new(HashMap::new()),
            locks: RwLock::new(HashMap::new()),
            running: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            poll: Mutex::new(None),
        })
    }

    /// Initialize the inference engine and start the liveness poll loop.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::warn!("Orchestrator already running");
            return Ok(());
        }
        if let Err(e) = self.deps.engine.initialize().await {
            self.running.store(false, Ordering::SeqCst);
            return Err(e);
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let weak = Arc::downgrade(self);
        let period = self.settings.poll_interval;

        let task = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stop_rx.changed() => break,
                }
                let Some(this) = weak.upgrade() else {
                    break;
                };
                this.poll_once().await;
            }
            tracing::info!("Liveness poll stopped");
        });

        *self.poll.lock().await = Some(PollHandle { task, stop_tx });
        tracing::info!(
            poll_interval_sec = period.as_secs(),
            liveness = self.deps.liveness.is_some(),
            "Orchestrator started"
        );
        Ok(())
    }

    /// Start monitoring a channel.
    ///
    /// Configuration errors (unknown channel, no config, no or rejected
    /// stream URL) fail the call. Transient start failures leave the
    /// channel Pending with the error recorded.
    pub async fn start_monitoring(self: &Arc<Self>, channel_id: &str) -> Result<MonitorState> {
        let lock = self.channel_lock(channel_id).await;
        let result = {
            let _guard = lock.lock().await;
            self.start_locked(channel_id).await
        };
        drop(lock);
        self.prune_lock(channel_id).await;
        result
    }

    async fn start_locked(self: &Arc<Self>, channel_id: &str) -> Result<MonitorState> {
        self.ensure_accepting()?;

        if let Some(MonitorState::Monitoring) = self.state_of(channel_id).await {
            tracing::debug!(channel_id = %channel_id, "Already monitoring");
            return Ok(MonitorState::Monitoring);
        }

        let (channel, mut config, stream_url) = self.resolve(channel_id).await?;
        if !config.is_enabled {
            self.deps
                .configs
                .update_config(&config.id, ConfigPatch::enabled(true))
                .await?;
            config.is_enabled = true;
        }

        match self.probe(&stream_url).await {
            Probe::Offline => {
                tracing::info!(channel_id = %channel_id, "Stream offline, channel pending");
                self.commit(PipelineRecord::pending(channel, config, stream_url, None))
                    .await?;
                return Ok(MonitorState::Pending);
            }
            Probe::Live | Probe::Unknown => {}
        }

        match self.launch(&channel, &config, &stream_url).await {
            Ok(pipeline) => {
                let watcher = self.spawn_watcher(channel_id, &pipeline);
                let record = PipelineRecord {
                    state: MonitorState::Monitoring,
                    pipeline: Some(pipeline),
                    watcher: Some(watcher),
                    ..PipelineRecord::pending(channel, config, stream_url, None)
                };
                self.commit(record).await?;
                tracing::info!(channel_id = %channel_id, "Monitoring started");
                Ok(MonitorState::Monitoring)
            }
            Err(e) if e.is_transient() => {
                tracing::warn!(
                    channel_id = %channel_id,
                    error = %e,
                    "Pipeline start failed, channel pending"
                );
                self.commit(PipelineRecord::pending(
                    channel,
                    config,
                    stream_url,
                    Some(e.to_string()),
                ))
                .await?;
                Ok(MonitorState::Pending)
            }
            Err(e) => Err(e),
        }
    }

    /// Stop monitoring a channel from any state and persist the disabled
    /// flag. Idempotent.
    pub async fn stop_monitoring(&self, channel_id: &str) -> Result<()> {
        let lock = self.channel_lock(channel_id).await;
        let result = {
            let _guard = lock.lock().await;
            self.stop_locked(channel_id).await
        };
        drop(lock);
        self.prune_lock(channel_id).await;
        result
    }

    async fn stop_locked(&self, channel_id: &str) -> Result<()> {
        let record = self.registry.write().await.remove(channel_id);
        let config_id = match record {
            Some(mut record) => {
                record.abort_watcher();
                if let Some(pipeline) = record.pipeline.take() {
                    if let Err(e) = pipeline.stop().await {
                        tracing::warn!(channel_id = %channel_id, error = %e, "Pipeline stop failed");
                    }
                }
                tracing::info!(channel_id = %channel_id, "Monitoring stopped");
                record.config.id
            }
            None => match self.deps.configs.get_config(channel_id).await? {
                Some(config) => config.id,
                None => return Ok(()),
            },
        };

        self.deps
            .configs
            .update_config(&config_id, ConfigPatch::enabled(false))
            .await
    }

    /// Start monitoring every enabled config. Failures are logged per
    /// channel; returns how many channels were restored.
    pub async fn restore_enabled(self: &Arc<Self>) -> Result<usize> {
        let configs = self.deps.configs.list_enabled_configs().await?;
        tracing::info!(count = configs.len(), "Restoring enabled channels");

        let results = join_all(configs.iter().map(|config| {
            let this = self.clone();
            let channel_id = config.channel_id.clone();
            async move {
                let result = this.start_monitoring(&channel_id).await;
                (channel_id, result)
            }
        }))
        .await;

        let mut restored = 0;
        for (channel_id, result) in results {
            match result {
                Ok(state) => {
                    restored += 1;
                    tracing::info!(channel_id = %channel_id, state = state.as_str(), "Channel restored");
                }
                Err(e) => {
                    tracing::error!(channel_id = %channel_id, error = %e, "Channel restore failed");
                }
            }
        }
        Ok(restored)
    }

    /// One liveness pass over every registered channel, each in its own task.
    pub async fn poll_once(self: &Arc<Self>) {
        let ids: Vec<String> = self.registry.read().await.keys().cloned().collect();
        if ids.is_empty() {
            return;
        }

        let tasks = ids.into_iter().map(|channel_id| {
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.poll_channel(&channel_id).await {
                    tracing::error!(channel_id = %channel_id, error = %e, "Channel poll failed");
                    this.record_error(&channel_id, &e).await;
                }
                // Channel may have been stopped while the poll waited for its lock
                this.prune_lock(&channel_id).await;
            })
        });

        for result in join_all(tasks).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Channel poll task panicked");
            }
        }
    }

    async fn poll_channel(self: &Arc<Self>, channel_id: &str) -> Result<()> {
        let lock = self.channel_lock(channel_id).await;
        let _guard = lock.lock().await;
        if self.shutting_down.load(Ordering::SeqCst) {
            return Ok(());
        }

        let snapshot = {
            let registry = self.registry.read().await;
            registry.get(channel_id).map(|r| {
                (
                    r.state,
                    r.channel.clone(),
                    r.config.clone(),
                    r.stream_url.clone(),
                    r.pipeline.clone(),
                )
            })
        };
        let Some((state, channel, config, stream_url, pipeline)) = snapshot else {
            return Ok(());
        };

        match state {
            MonitorState::Pending | MonitorState::PausedError => {
                if self.probe(&stream_url).await == Probe::Offline {
                    return Ok(());
                }

                let pipeline = self.launch(&channel, &config, &stream_url).await?;
                let watcher = self.spawn_watcher(channel_id, &pipeline);

                let mut registry = self.registry.write().await;
                if let Some(record) = registry.get_mut(channel_id) {
                    record.state = MonitorState::Monitoring;
                    record.pipeline = Some(pipeline);
                    record.watcher = Some(watcher);
                    record.last_error = None;
                    record.updated_at = Utc::now();
                    tracing::info!(channel_id = %channel_id, "Stream live, monitoring resumed");
                } else {
                    drop(registry);
                    watcher.abort();
                    pipeline.stop().await?;
                }
            }
            MonitorState::Monitoring => {
                let capture_failed = pipeline
                    .as_ref()
                    .is_some_and(|p| p.capture_status() == CaptureStatus::Error);

                let (next, reason) = if capture_failed {
                    (MonitorState::PausedError, Some("capture session failed".to_string()))
                } else if self.probe(&stream_url).await == Probe::Offline {
                    (MonitorState::Pending, None)
                } else {
                    return Ok(());
                };

                let detached = {
                    let mut registry = self.registry.write().await;
                    registry.get_mut(channel_id).and_then(|record| {
                        record.abort_watcher();
                        record.demote(next, reason)
                    })
                };
                tracing::info!(channel_id = %channel_id, state = next.as_str(), "Monitoring paused");
                if let Some(pipeline) = detached {
                    pipeline.stop().await?;
                }
            }
            MonitorState::Disabled => {}
        }
        Ok(())
    }

    /// Stop the poll loop, stop every pipeline, release the engine.
    pub async fn shutdown(self: &Arc<Self>) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.running.store(false, Ordering::SeqCst);
        tracing::info!("Orchestrator shutting down");

        let poll = self.poll.lock().await.take();
        if let Some(PollHandle { task, stop_tx }) = poll {
            let _ = stop_tx.send(true);
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Liveness poll task failed");
            }
        }

        let ids: Vec<String> = self.registry.read().await.keys().cloned().collect();
        let tasks = ids.into_iter().map(|channel_id| {
            let this = self.clone();
            tokio::spawn(async move {
                let lock = this.channel_lock(&channel_id).await;
                let _guard = lock.lock().await;
                let record = this.registry.write().await.remove(&channel_id);
                if let Some(record) = record {
                    this.release(channel_id, record).await;
                }
            })
        });
        for result in join_all(tasks).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Pipeline stop task panicked");
            }
        }

        // Anything that slipped in while the per-channel stops ran
        let leftovers: Vec<(String, PipelineRecord)> =
            self.registry.write().await.drain().collect();
        for (channel_id, record) in leftovers {
            self.release(channel_id, record).await;
        }

        self.locks.write().await.clear();

        self.deps.engine.dispose().await;
        tracing::info!("Orchestrator shut down");
    }

    async fn release(&self, channel_id: String, mut record: PipelineRecord) {
        record.abort_watcher();
        if let Some(pipeline) = record.pipeline.take() {
            if let Err(e) = pipeline.stop().await {
                tracing::warn!(channel_id = %channel_id, error = %e, "Pipeline stop failed");
            }
        }
    }

    /// Status of every registered channel, by channel id
    pub async fn status(&self) -> Vec<ChannelStatus> {
        let registry = self.registry.read().await;
        let mut statuses: Vec<ChannelStatus> = registry.values().map(|r| r.status()).collect();
        statuses.sort_by(|a, b| a.channel_id.cmp(&b.channel_id));
        statuses
    }

    pub async fn channel_status(&self, channel_id: &str) -> ChannelStatus {
        self.registry
            .read()
            .await
            .get(channel_id)
            .map(|r| r.status())
            .unwrap_or_else(|| ChannelStatus::disabled(channel_id))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // ---- internals ----

    async fn channel_lock(&self, channel_id: &str) -> Arc<Mutex<()>> {
        {
            let locks = self.locks.read().await;
            if let Some(lock) = locks.get(channel_id) {
                return lock.clone();
            }
        }

        let mut locks = self.locks.write().await;
        locks
            .entry(channel_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Forget a channel's lock once nobody holds it and the channel is
    /// no longer registered.
    async fn prune_lock(&self, channel_id: &str) {
        let mut locks = self.locks.write().await;
        let idle = locks
            .get(channel_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1);
        if idle && !self.registry.read().await.contains_key(channel_id) {
            locks.remove(channel_id);
        }
    }

    fn ensure_accepting(&self) -> Result<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(Error::Validation("orchestrator is shutting down".to_string()));
        }
        Ok(())
    }

    async fn state_of(&self, channel_id: &str) -> Option<MonitorState> {
        self.registry.read().await.get(channel_id).map(|r| r.state)
    }

    async fn resolve(&self, channel_id: &str) -> Result<(Channel, DetectionConfig, String)> {
        let channel = self
            .deps
            .channels
            .find_by_id(channel_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("channel {}", channel_id)))?;

        let config = self
            .deps
            .configs
            .get_config(channel_id)
            .await?
            .ok_or_else(|| {
                Error::NotFound(format!("detection config for channel {}", channel_id))
            })?;

        let stream_url = config
            .stream_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(String::from)
            .ok_or_else(|| Error::Config(format!("channel {} has no stream url", channel_id)))?;

        self.settings.source_policy.validate(&stream_url)?;
        Ok((channel, config, stream_url))
    }

    async fn probe(&self, stream_url: &str) -> Probe {
        let Some(checker) = &self.deps.liveness else {
            return Probe::Unknown;
        };

        let report = checker.is_live(stream_url).await;
        if report.is_live {
            return Probe::Live;
        }
        match report.error {
            Some(error) => {
                tracing::warn!(error = %error, "Liveness check unavailable, treating stream as live");
                Probe::Unknown
            }
            None => Probe::Offline,
        }
    }

    async fn launch(
        &self,
        channel: &Channel,
        config: &DetectionConfig,
        stream_url: &str,
    ) -> Result<Arc<DetectionPipeline>> {
        let source = FrameSource::new(
            stream_url,
            self.settings.capture.clone(),
            &self.settings.source_policy,
            self.deps.decoder.clone(),
        )?;

        let deps = PipelineDeps {
            engine: self.deps.engine.clone(),
            notifier: self.deps.notifier.clone(),
            store: self.deps.configs.clone(),
        };
        let pipeline = DetectionPipeline::new(
            channel.clone(),
            config.clone(),
            source,
            deps,
            self.settings.pipeline.clone(),
        );
        pipeline.start().await?;
        Ok(pipeline)
    }

    /// Insert a record. Refused once shutdown has begun; the record's
    /// pipeline is stopped in that case.
    async fn commit(&self, record: PipelineRecord) -> Result<()> {
        let channel_id = record.channel.id.clone();
        let (rejected, replaced) = {
            let mut registry = self.registry.write().await;
            if self.shutting_down.load(Ordering::SeqCst) {
                (Some(record), None)
            } else {
                (None, registry.insert(channel_id.clone(), record))
            }
        };

        if let Some(old) = replaced {
            self.release(channel_id.clone(), old).await;
        }
        if let Some(record) = rejected {
            self.release(channel_id, record).await;
            return Err(Error::Validation("orchestrator is shutting down".to_string()));
        }
        Ok(())
    }

    async fn record_error(&self, channel_id: &str, error: &Error) {
        if let Some(record) = self.registry.write().await.get_mut(channel_id) {
            record.last_error = Some(error.to_string());
            record.updated_at = Utc::now();
        }
    }

    /// Forward the pipeline's runtime failure back into the registry.
    fn spawn_watcher(self: &Arc<Self>, channel_id: &str, pipeline: &Arc<DetectionPipeline>) -> JoinHandle<()> {
        let mut events = pipeline.subscribe();
        let orchestrator = Arc::downgrade(self);
        let watched = Arc::downgrade(pipeline);
        let channel_id = channel_id.to_string();

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(PipelineEvent::Error(failure)) => {
                        if let Some(this) = orchestrator.upgrade() {
                            this.handle_pipeline_failure(&channel_id, &watched, failure)
                                .await;
                            this.prune_lock(&channel_id).await;
                        }
                        return;
                    }
                    Ok(PipelineEvent::Detection(_)) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(channel_id = %channel_id, skipped = skipped, "Pipeline watcher lagged");
                    }
                    Err(RecvError::Closed) => return,
                }
            }
        })
    }

    async fn handle_pipeline_failure(
        &self,
        channel_id: &str,
        watched: &Weak<DetectionPipeline>,
        failure: PipelineFailure,
    ) {
        let lock = self.channel_lock(channel_id).await;
        let _guard = lock.lock().await;

        let detached = {
            let mut registry = self.registry.write().await;
            match registry.get_mut(channel_id) {
                Some(record)
                    if record.state == MonitorState::Monitoring
                        && record
                            .pipeline
                            .as_ref()
                            .is_some_and(|p| std::ptr::eq(Arc::as_ptr(p), watched.as_ptr())) =>
                {
                    record.demote(MonitorState::PausedError, Some(failure.message.clone()))
                }
                _ => None,
            }
        };

        if let Some(pipeline) = detached {
            tracing::warn!(
                channel_id = %channel_id,
                code = %failure.code,
                error = %failure.message,
                "Pipeline failed, channel paused"
            );
            if let Err(e) = pipeline.stop().await {
                tracing::warn!(channel_id = %channel_id, error = %e, "Pipeline stop failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::LivenessReport;
    use crate::frame_source::ReconnectPolicy;
    use crate::testing::{
        jpeg_frame, DecoderStep, FakeEngine, FlakyConfigStore, RecordingNotifier,
        ScriptedDecoder, ScriptedLiveness,
    };

    struct Fixture {
        orchestrator: Arc<Orchestrator>,
        store: Arc<FlakyConfigStore>,
        liveness: Arc<ScriptedLiveness>,
        decoder: Arc<ScriptedDecoder>,
        engine: Arc<FakeEngine>,
    }

    fn settings() -> OrchestratorSettings {
        OrchestratorSettings {
            poll_interval: Duration::from_secs(60),
            capture: CaptureSettings {
                frame_interval_ms: 1000,
                quality: 5,
                width: None,
                max_frame_bytes: 4096,
                buffer_capacity: 3,
                reconnect: ReconnectPolicy {
                    max_attempts: 1,
                    base_delay: Duration::from_millis(100),
                    max_delay: Duration::from_millis(1000),
                },
                connect_timeout: Duration::from_secs(5),
                stop_grace: Duration::from_millis(100),
            },
            pipeline: PipelineSettings::default(),
            source_policy: SourcePolicy::default(),
        }
    }

    fn url(channel_id: &str) -> String {
        format!("rtsp://cam.local/{}", channel_id)
    }

    async fn fixture(decoder: ScriptedDecoder, default_liveness: LivenessReport) -> Fixture {
        let store = Arc::new(FlakyConfigStore::new());
        for id in ["ch-1", "ch-2"] {
            store
                .add_channel(id, &format!("user-{}", id), Some(url(id).as_str()))
                .await;
        }
        store.add_channel("ch-nourl", "nourl", None).await;

        let liveness = Arc::new(ScriptedLiveness::new(default_liveness));
        let decoder = Arc::new(decoder);
        let engine = Arc::new(FakeEngine::new());

        let deps = OrchestratorDeps {
            channels: store.clone(),
            configs: store.clone(),
            liveness: Some(liveness.clone()),
            notifier: Arc::new(RecordingNotifier::new()),
            engine: engine.clone(),
            decoder: decoder.clone(),
        };

        Fixture {
            orchestrator: Orchestrator::new(deps, settings()),
            store,
            liveness,
            decoder,
            engine,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_start_is_pending_then_poll_promotes_once() {
        let f = fixture(ScriptedDecoder::holding(), LivenessReport::offline()).await;

        let state = f.orchestrator.start_monitoring("ch-1").await.unwrap();
        assert_eq!(state, MonitorState::Pending);
        assert_eq!(f.decoder.spawn_count(), 0);
        assert!(f.store.is_enabled("ch-1").await);

        f.liveness.set(&url("ch-1"), LivenessReport::live());
        f.orchestrator.poll_once().await;

        let status = f.orchestrator.channel_status("ch-1").await;
        assert_eq!(status.state, MonitorState::Monitoring);
        assert_eq!(status.capture, Some(CaptureStatus::Connected));
        assert_eq!(f.decoder.spawn_count(), 1);

        // Still live: no second pipeline
        f.orchestrator.poll_once().await;
        assert_eq!(f.decoder.spawn_count(), 1);
        assert_eq!(f.orchestrator.status().await.len(), 1);

        f.orchestrator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_leaves_no_process_and_empty_registry() {
        let f = fixture(ScriptedDecoder::holding(), LivenessReport::live()).await;

        for id in ["ch-1", "ch-2"] {
            let state = f.orchestrator.start_monitoring(id).await.unwrap();
            assert_eq!(state, MonitorState::Monitoring);
        }
        assert_eq!(f.decoder.open_streams(), 2);

        f.orchestrator.shutdown().await;

        assert!(f.orchestrator.status().await.is_empty());
        assert_eq!(f.decoder.open_streams(), 0);
        assert!(f.engine.is_disposed());

        let refused = f.orchestrator.start_monitoring("ch-1").await;
        assert!(matches!(refused, Err(Error::Validation(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_completes_when_a_pipeline_stop_fails() {
        let f = fixture(ScriptedDecoder::holding(), LivenessReport::live()).await;
        for id in ["ch-1", "ch-2"] {
            let state = f.orchestrator.start_monitoring(id).await.unwrap();
            assert_eq!(state, MonitorState::Monitoring);
        }

        let crashed = f
            .orchestrator
            .registry
            .read()
            .await
            .get("ch-1")
            .and_then(|record| record.pipeline.clone())
            .unwrap();
        crashed.abort_worker().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        // A dead worker makes this pipeline's stop() fail
        assert_eq!(f.orchestrator.status().await.len(), 2);

        f.orchestrator.shutdown().await;

        assert!(f.orchestrator.status().await.is_empty());
        assert!(!crashed.has_process());
        assert_eq!(f.decoder.open_streams(), 0);
        assert!(f.engine.is_disposed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_failure_does_not_block_other_channels() {
        let f = fixture(ScriptedDecoder::holding(), LivenessReport::offline()).await;
        for id in ["ch-1", "ch-2"] {
            let state = f.orchestrator.start_monitoring(id).await.unwrap();
            assert_eq!(state, MonitorState::Pending);
        }

        f.decoder.fail_url(&url("ch-1"));
        f.liveness.set(&url("ch-1"), LivenessReport::live());
        f.liveness.set(&url("ch-2"), LivenessReport::live());
        f.orchestrator.poll_once().await;

        let failed = f.orchestrator.channel_status("ch-1").await;
        assert_eq!(failed.state, MonitorState::Pending);
        assert!(failed.last_error.is_some());

        let promoted = f.orchestrator.channel_status("ch-2").await;
        assert_eq!(promoted.state, MonitorState::Monitoring);
        assert_eq!(promoted.capture, Some(CaptureStatus::Connected));
        assert!(promoted.last_error.is_none());
        assert_eq!(f.decoder.open_streams(), 1);

        f.orchestrator.shutdown().await;
        assert_eq!(f.decoder.open_streams(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_locks_are_released() {
        let f = fixture(ScriptedDecoder::holding(), LivenessReport::live()).await;

        assert!(f.orchestrator.start_monitoring("ghost").await.is_err());
        f.orchestrator.stop_monitoring("ghost").await.unwrap();
        assert!(f.orchestrator.locks.read().await.is_empty());

        f.orchestrator.start_monitoring("ch-1").await.unwrap();
        assert!(f.orchestrator.locks.read().await.contains_key("ch-1"));

        f.orchestrator.stop_monitoring("ch-1").await.unwrap();
        assert!(f.orchestrator.locks.read().await.is_empty());

        f.orchestrator.start_monitoring("ch-2").await.unwrap();
        f.orchestrator.shutdown().await;
        assert!(f.orchestrator.locks.read().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_start_failure_is_pending_with_error() {
        let f = fixture(ScriptedDecoder::failing(), LivenessReport::live()).await;

        let state = f.orchestrator.start_monitoring("ch-1").await.unwrap();
        assert_eq!(state, MonitorState::Pending);

        let status = f.orchestrator.channel_status("ch-1").await;
        assert_eq!(status.state, MonitorState::Pending);
        assert!(status.last_error.unwrap().contains("Reconnect attempts exhausted"));
        assert_eq!(f.decoder.open_streams(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_configuration_errors_fail_the_call() {
        let f = fixture(ScriptedDecoder::holding(), LivenessReport::live()).await;

        let missing = f.orchestrator.start_monitoring("ch-unknown").await;
        assert!(matches!(missing, Err(Error::NotFound(_))));

        let no_url = f.orchestrator.start_monitoring("ch-nourl").await;
        assert!(matches!(no_url, Err(Error::Config(_))));

        assert!(f.orchestrator.status().await.is_empty());
        assert_eq!(f.decoder.spawn_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_unavailable_starts_anyway() {
        let f = fixture(
            ScriptedDecoder::holding(),
            LivenessReport::unavailable("ffprobe missing"),
        )
        .await;

        let state = f.orchestrator.start_monitoring("ch-1").await.unwrap();
        assert_eq!(state, MonitorState::Monitoring);
        f.orchestrator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_poll_pauses_and_keeps_enabled() {
        let f = fixture(ScriptedDecoder::holding(), LivenessReport::live()).await;
        f.orchestrator.start_monitoring("ch-1").await.unwrap();
        assert_eq!(f.decoder.open_streams(), 1);

        f.liveness.set(&url("ch-1"), LivenessReport::offline());
        f.orchestrator.poll_once().await;

        let status = f.orchestrator.channel_status("ch-1").await;
        assert_eq!(status.state, MonitorState::Pending);
        assert!(status.capture.is_none());
        assert_eq!(f.decoder.open_streams(), 0);
        assert!(f.store.is_enabled("ch-1").await);

        // Back online: resumes on its own
        f.liveness.set(&url("ch-1"), LivenessReport::live());
        f.orchestrator.poll_once().await;
        assert_eq!(
            f.orchestrator.channel_status("ch-1").await.state,
            MonitorState::Monitoring
        );
        f.orchestrator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_monitoring_is_idempotent_and_persists_disabled() {
        let f = fixture(ScriptedDecoder::holding(), LivenessReport::live()).await;
        f.orchestrator.start_monitoring("ch-1").await.unwrap();
        assert_eq!(
            f.orchestrator.start_monitoring("ch-1").await.unwrap(),
            MonitorState::Monitoring
        );
        assert_eq!(f.decoder.spawn_count(), 1);

        f.orchestrator.stop_monitoring("ch-1").await.unwrap();
        f.orchestrator.stop_monitoring("ch-1").await.unwrap();

        assert_eq!(
            f.orchestrator.channel_status("ch-1").await.state,
            MonitorState::Disabled
        );
        assert!(!f.store.is_enabled("ch-1").await);
        assert_eq!(f.decoder.open_streams(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_runtime_failure_demotes_to_paused_error_and_poll_retries() {
        let decoder = ScriptedDecoder::failing();
        // Connects once, then the stream drops and reconnects fail
        decoder.push(DecoderStep::End(vec![jpeg_frame(200, 1)]));
        let f = fixture(decoder, LivenessReport::live()).await;

        let state = f.orchestrator.start_monitoring("ch-1").await.unwrap();
        assert_eq!(state, MonitorState::Monitoring);

        tokio::time::sleep(Duration::from_secs(5)).await;
        let status = f.orchestrator.channel_status("ch-1").await;
        assert_eq!(status.state, MonitorState::PausedError);
        assert!(status.last_error.is_some());
        assert_eq!(f.decoder.open_streams(), 0);

        f.decoder.push(DecoderStep::Hold(vec![jpeg_frame(200, 2)]));
        f.orchestrator.poll_once().await;
        let status = f.orchestrator.channel_status("ch-1").await;
        assert_eq!(status.state, MonitorState::Monitoring);
        assert!(status.last_error.is_none());

        f.orchestrator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_enabled_and_poll_loop() {
        let f = fixture(ScriptedDecoder::holding(), LivenessReport::offline()).await;
        for id in ["ch-1", "ch-2"] {
            f.store
                .update_config(&format!("cfg-{}", id), ConfigPatch::enabled(true))
                .await
                .unwrap();
        }

        f.orchestrator.start().await.unwrap();
        assert!(f.engine.is_initialized());
        assert_eq!(f.orchestrator.restore_enabled().await.unwrap(), 2);
        assert!(f
            .orchestrator
            .status()
            .await
            .iter()
            .all(|s| s.state == MonitorState::Pending));

        f.liveness.set(&url("ch-2"), LivenessReport::live());
        tokio::time::sleep(Duration::from_secs(61)).await;

        assert_eq!(
            f.orchestrator.channel_status("ch-2").await.state,
            MonitorState::Monitoring
        );
        assert_eq!(
            f.orchestrator.channel_status("ch-1").await.state,
            MonitorState::Pending
        );
        assert!(f.liveness.calls() >= 4);

        f.orchestrator.shutdown().await;
        assert!(!f.orchestrator.is_running());
        assert_eq!(f.decoder.open_streams(), 0);
    }
}
