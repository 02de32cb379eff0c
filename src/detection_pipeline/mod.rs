//! DetectionPipeline - One Channel, Frames to Notifications
//!
//! ## Responsibilities
//!
//! - Own the channel's FrameSource and RuleEngine
//! - Hand frames to a single detection worker through a bounded queue
//!   (full queue: frame dropped and counted, capture never blocks)
//! - Per frame: detect, match rules, threshold, cooldown, render, notify,
//!   persist, broadcast
//! - Surface FrameSource failures as `PipelineEvent::Error`
//!
//! ## Failure semantics
//!
//! Inference, rule lookup, template and notifier failures are logged per
//! frame and never stop the pipeline. A panic while processing a frame is
//! caught and counted in `frames_failed`; the worker moves on to the next
//! frame. A failed notification does not arm
//! the cooldown, so the next qualifying frame retries. Persistence failures
//! are logged only.

mod stats;

pub use stats::PipelineStats;

use crate::collaborators::{Channel, DetectionConfig, DetectionConfigStore, DetectionLogEntry, Notifier};
use crate::error::{Error, Result};
use crate::frame_source::{CaptureStatus, Frame, FrameSource};
use crate::inference::InferenceEngine;
use crate::rule_engine::template::{self, TemplateContext};
use crate::rule_engine::{normalize_class, RuleEngine, DEFAULT_RULES_TTL};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use stats::StatsCounters;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

/// Pipeline tuning
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Frames waiting for the detection worker
    pub frame_queue_depth: usize,
    /// Broadcast buffer for pipeline events
    pub event_capacity: usize,
    pub rules_ttl: Duration,
    /// How long `stop()` waits for an in-flight frame
    pub stop_timeout: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            frame_queue_depth: 2,
            event_capacity: 64,
            rules_ttl: DEFAULT_RULES_TTL,
            stop_timeout: Duration::from_secs(10),
        }
    }
}

/// Collaborators shared by every pipeline
#[derive(Clone)]
pub struct PipelineDeps {
    pub engine: Arc<dyn InferenceEngine>,
    pub notifier: Arc<dyn Notifier>,
    pub store: Arc<dyn DetectionConfigStore>,
}

/// A fired notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionEvent {
    pub id: Uuid,
    pub channel_id: String,
    pub config_id: String,
    pub rule_id: String,
    pub object_class: String,
    pub confidence: f64,
    pub message: String,
    pub detected_at: DateTime<Utc>,
}

/// Capture-level failure reported by a running pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineFailure {
    pub channel_id: String,
    pub code: String,
    pub message: String,
    pub transient: bool,
}

#[derive(Debug, Clone)]
pub enum PipelineEvent {
    Detection(DetectionEvent),
    Error(PipelineFailure),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Starting,
    Running,
    Stopped,
}

/// Point-in-time view of a pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStatus {
    pub channel_id: String,
    pub state: PipelineState,
    pub capture: CaptureStatus,
    pub reconnect_count: u32,
    pub stats: PipelineStats,
}

/// State reachable from FrameSource callbacks
struct PipelineShared {
    channel_id: String,
    stats: StatsCounters,
    shutting_down: AtomicBool,
    /// Set once a dead worker has been reported
    worker_lost: AtomicBool,
    frame_tx: Mutex<Option<mpsc::Sender<Frame>>>,
    events: broadcast::Sender<PipelineEvent>,
}

impl PipelineShared {
    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    fn enqueue(&self, frame: &Frame) {
        if self.is_shutting_down() {
            return;
        }
        let guard = self.frame_tx.lock().unwrap_or_else(|p| p.into_inner());
        let Some(tx) = guard.as_ref() else {
            return;
        };

        match tx.try_send(frame.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let dropped = self.stats.frame_dropped();
                if dropped == 1 || dropped % 100 == 0 {
                    tracing::debug!(
                        channel_id = %self.channel_id,
                        frames_dropped = dropped,
                        "Detection worker busy, dropping frame"
                    );
                }
            }
            Err(TrySendError::Closed(_)) => {
                drop(guard);
                if !self.is_shutting_down() && !self.worker_lost.swap(true, Ordering::SeqCst) {
                    self.report_failure(&Error::Internal(
                        "detection worker stopped unexpectedly".to_string(),
                    ));
                }
            }
        }
    }

    fn report_failure(&self, error: &Error) {
        if self.is_shutting_down() {
            return;
        }
        tracing::error!(channel_id = %self.channel_id, error = %error, "Frame source failed");
        let _ = self.events.send(PipelineEvent::Error(PipelineFailure {
            channel_id: self.channel_id.clone(),
            code: error.code().to_string(),
            message: error.to_string(),
            transient: error.is_transient(),
        }));
    }
}

/// DetectionPipeline instance
pub struct DetectionPipeline {
    channel: Channel,
    config: DetectionConfig,
    source: FrameSource,
    rules: RuleEngine,
    deps: PipelineDeps,
    settings: PipelineSettings,
    shared: Arc<PipelineShared>,
    /// normalised class -> last notification
    cooldowns: Mutex<HashMap<String, Instant>>,
    state: Mutex<PipelineState>,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl DetectionPipeline {
    pub fn new(
        channel: Channel,
        config: DetectionConfig,
        source: FrameSource,
        deps: PipelineDeps,
        settings: PipelineSettings,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(settings.event_capacity.max(1));
        let shared = Arc::new(PipelineShared {
            channel_id: channel.id.clone(),
            stats: StatsCounters::default(),
            shutting_down: AtomicBool::new(false),
            worker_lost: AtomicBool::new(false),
            frame_tx: Mutex::new(None),
            events,
        });

        let on_frame = shared.clone();
        source.on_frame(move |frame| on_frame.enqueue(frame));
        let on_error = shared.clone();
        source.on_error(move |error| on_error.report_failure(error));

        let rules = RuleEngine::with_ttl(deps.store.clone(), config.id.clone(), settings.rules_ttl);

        Arc::new(Self {
            channel,
            config,
            source,
            rules,
            deps,
            settings,
            shared,
            cooldowns: Mutex::new(HashMap::new()),
            state: Mutex::new(PipelineState::Idle),
            worker: tokio::sync::Mutex::new(None),
        })
    }

    /// Start the worker and the capture session. Resolves once the first
    /// frame has been decoded; on failure everything is torn down again.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut worker = self.worker.lock().await;
            if worker.is_some() {
                return Ok(());
            }

            self.shared.shutting_down.store(false, Ordering::SeqCst);
            self.shared.worker_lost.store(false, Ordering::SeqCst);
            let (tx, rx) = mpsc::channel(self.settings.frame_queue_depth.max(1));
            *self.shared.frame_tx.lock().unwrap_or_else(|p| p.into_inner()) = Some(tx);
            self.set_state(PipelineState::Starting);

            let this = self.clone();
            *worker = Some(tokio::spawn(async move { this.run_worker(rx).await }));
        }

        match self.source.start().await {
            Ok(()) => {
                self.shared.stats.mark_started(Utc::now());
                self.set_state(PipelineState::Running);
                tracing::info!(
                    channel_id = %self.channel.id,
                    channel = %self.channel.username,
                    "Detection pipeline started"
                );
                Ok(())
            }
            Err(e) => {
                tracing::warn!(channel_id = %self.channel.id, error = %e, "Detection pipeline failed to start");
                if let Err(stop_err) = self.stop().await {
                    tracing::warn!(channel_id = %self.channel.id, error = %stop_err, "Cleanup after failed start");
                }
                Err(e)
            }
        }
    }

    /// Stop capture and the worker. Idempotent. Nothing is notified or
    /// broadcast after this returns.
    pub async fn stop(&self) -> Result<()> {
        self.shared.shutting_down.store(true, Ordering::SeqCst);
        // Closing the queue lets the worker drain and exit
        self.shared
            .frame_tx
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();

        self.source.stop().await;

        let handle = self.worker.lock().await.take();
        let result = match handle {
            None => Ok(()),
            Some(mut handle) => match tokio::time::timeout(self.settings.stop_timeout, &mut handle).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(Error::Internal(format!("detection worker failed: {}", e))),
                Err(_) => {
                    tracing::warn!(
                        channel_id = %self.channel.id,
                        timeout_sec = self.settings.stop_timeout.as_secs(),
                        "Detection worker did not finish, aborting"
                    );
                    handle.abort();
                    Ok(())
                }
            },
        };

        if self.state() != PipelineState::Idle {
            self.set_state(PipelineState::Stopped);
            tracing::info!(channel_id = %self.channel.id, "Detection pipeline stopped");
        }
        result
    }

    async fn run_worker(self: Arc<Self>, mut rx: mpsc::Receiver<Frame>) {
        while let Some(frame) = rx.recv().await {
            if self.shared.is_shutting_down() {
                break;
            }
            let processed = AssertUnwindSafe(self.process_frame(&frame))
                .catch_unwind()
                .await;
            if processed.is_err() {
                let failed = self.shared.stats.frame_failed();
                tracing::error!(
                    channel_id = %self.channel.id,
                    sequence = frame.sequence,
                    frames_failed = failed,
                    "Frame processing panicked, frame skipped"
                );
            }
        }
        tracing::debug!(channel_id = %self.channel.id, "Detection worker exited");
    }

    /// Run one frame through detection and rules.
    pub async fn process_frame(&self, frame: &Frame) {
        if self.shared.is_shutting_down() {
            return;
        }
        self.shared.stats.frame_processed();

        let detections = match self.deps.engine.detect(&frame.data).await {
            Ok(detections) => detections,
            Err(e) => {
                tracing::warn!(
                    channel_id = %self.channel.id,
                    sequence = frame.sequence,
                    error = %e,
                    "Inference failed"
                );
                return;
            }
        };
        if detections.is_empty() || self.shared.is_shutting_down() {
            return;
        }
        self.shared.stats.detections(detections.len());

        let rules = self.rules.rules().await;
        if rules.is_empty() {
            tracing::debug!(channel_id = %self.channel.id, "No detection rules, skipping frame");
            return;
        }

        for detection in detections {
            if self.shared.is_shutting_down() {
                return;
            }

            let class = normalize_class(&detection.class);
            let Some(rule) = rules.lookup(&class) else {
                continue;
            };
            if detection.confidence < rule.min_confidence {
                continue;
            }

            let cooldown = Duration::from_secs(
                rule.cooldown_seconds
                    .unwrap_or(self.config.cooldown_seconds),
            );
            if self.in_cooldown(&class, cooldown) {
                tracing::debug!(
                    channel_id = %self.channel.id,
                    object_class = %class,
                    "Within cooldown, suppressed"
                );
                continue;
            }

            let ctx = TemplateContext {
                object: &class,
                confidence: detection.confidence,
                channel: &self.channel.username,
            };
            let message = match template::render(&rule.message_template, &ctx) {
                Ok(message) => message,
                Err(e) => {
                    tracing::warn!(
                        channel_id = %self.channel.id,
                        rule_id = %rule.id,
                        error = %e,
                        "Message template failed"
                    );
                    continue;
                }
            };

            if let Err(e) = self.deps.notifier.say(&self.channel.username, &message).await {
                self.shared.stats.notify_failed();
                tracing::warn!(
                    channel_id = %self.channel.id,
                    object_class = %class,
                    error = %e,
                    "Notification failed"
                );
                continue;
            }

            self.cooldowns
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .insert(class.clone(), Instant::now());
            let detected_at = Utc::now();
            self.shared.stats.message_sent(detected_at);

            let event = DetectionEvent {
                id: Uuid::new_v4(),
                channel_id: self.channel.id.clone(),
                config_id: self.config.id.clone(),
                rule_id: rule.id.clone(),
                object_class: class,
                confidence: detection.confidence,
                message,
                detected_at,
            };
            tracing::info!(
                channel_id = %event.channel_id,
                object_class = %event.object_class,
                confidence = event.confidence,
                "Detection notified"
            );

            let entry = DetectionLogEntry {
                object_class: event.object_class.clone(),
                confidence: event.confidence,
                message: event.message.clone(),
            };
            if let Err(e) = self
                .deps
                .store
                .log_detection(&self.config.id, &rule.id, entry)
                .await
            {
                tracing::warn!(channel_id = %self.channel.id, error = %e, "Failed to log detection");
            }

            let _ = self.shared.events.send(PipelineEvent::Detection(event));
        }
    }

    fn in_cooldown(&self, class: &str, cooldown: Duration) -> bool {
        let cooldowns = self.cooldowns.lock().unwrap_or_else(|p| p.into_inner());
        cooldowns
            .get(class)
            .is_some_and(|last| last.elapsed() < cooldown)
    }

    fn set_state(&self, state: PipelineState) {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = state;
    }

    pub fn state(&self) -> PipelineState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn capture_status(&self) -> CaptureStatus {
        self.source.status()
    }

    pub fn has_process(&self) -> bool {
        self.source.has_process()
    }

    pub fn stats(&self) -> PipelineStats {
        self.shared.stats.snapshot()
    }

    pub fn status(&self) -> PipelineStatus {
        PipelineStatus {
            channel_id: self.channel.id.clone(),
            state: self.state(),
            capture: self.source.status(),
            reconnect_count: self.source.reconnect_count(),
            stats: self.stats(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.shared.events.subscribe()
    }

    /// Drop cached rules so the next frame refetches them
    pub async fn reload_rules(&self) {
        self.rules.invalidate().await;
    }

    /// Kill the detection worker as a crash would
    #[cfg(test)]
    pub(crate) async fn abort_worker(&self) {
        if let Some(worker) = self.worker.lock().await.as_ref() {
            worker.abort();
        }
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }
}
