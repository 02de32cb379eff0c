//! Test doubles shared by the unit tests

use crate::collaborators::{
    Channel, ChannelStore, ConfigPatch, DetectionConfig, DetectionConfigStore, DetectionLogEntry,
    DetectionLogRecord, DetectionRule, LivenessChecker, LivenessReport, MemoryStore, Notifier,
};
use crate::error::{Error, Result};
use crate::frame_source::{DecodeHandle, FrameDecoder, StreamSource};
use crate::inference::{Detection, InferenceEngine};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::time::Instant;

/// A well-formed JPEG-looking frame of exactly `len` bytes (len >= 4).
/// Filler bytes never contain 0xFF, so the only EOI is the trailing one.
pub fn jpeg_frame(len: usize, seed: usize) -> Vec<u8> {
    let mut data = Vec::with_capacity(len);
    data.extend_from_slice(&[0xFF, 0xD8]);
    for i in 0..len.saturating_sub(4) {
        data.push(((seed + i) % 200) as u8);
    }
    data.extend_from_slice(&[0xFF, 0xD9]);
    data
}

pub fn rule(id: &str, object_class: &str, min_confidence: f64) -> DetectionRule {
    DetectionRule {
        id: id.to_string(),
        object_class: object_class.to_string(),
        min_confidence,
        cooldown_seconds: None,
        message_template: String::new(),
        enabled: true,
    }
}

// ---- Decoder ----

/// What the next decoder spawn does
#[derive(Debug, Clone)]
pub enum DecoderStep {
    /// Spawn fails
    Fail,
    /// Emit frames, then end the stream
    End(Vec<Vec<u8>>),
    /// Emit frames, then keep the stream open
    Hold(Vec<Vec<u8>>),
}

/// In-memory decoder driven by a queue of steps
pub struct ScriptedDecoder {
    steps: Mutex<VecDeque<DecoderStep>>,
    default_step: DecoderStep,
    spawns: Mutex<Vec<Instant>>,
    open: Arc<AtomicUsize>,
    held: Mutex<Vec<DuplexStream>>,
    /// Urls whose spawns always fail, whatever is scripted
    failing_urls: Mutex<HashSet<String>>,
}

impl ScriptedDecoder {
    fn with_default(default_step: DecoderStep) -> Self {
        Self {
            steps: Mutex::new(VecDeque::new()),
            default_step,
            spawns: Mutex::new(Vec::new()),
            open: Arc::new(AtomicUsize::new(0)),
            held: Mutex::new(Vec::new()),
            failing_urls: Mutex::new(HashSet::new()),
        }
    }

    /// Unscripted spawns deliver one frame and stay open
    pub fn holding() -> Self {
        Self::with_default(DecoderStep::Hold(vec![jpeg_frame(200, 0)]))
    }

    /// Unscripted spawns fail
    pub fn failing() -> Self {
        Self::with_default(DecoderStep::Fail)
    }

    pub fn push(&self, step: DecoderStep) {
        self.steps.lock().unwrap().push_back(step);
    }

    pub fn fail_url(&self, url: &str) {
        self.failing_urls.lock().unwrap().insert(url.to_string());
    }

    pub fn spawn_count(&self) -> usize {
        self.spawns.lock().unwrap().len()
    }

    /// Streams handed out and not yet dropped
    pub fn open_streams(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    /// Milliseconds between consecutive spawns
    pub fn spawn_gaps_ms(&self) -> Vec<u64> {
        let spawns = self.spawns.lock().unwrap();
        spawns
            .windows(2)
            .map(|w| (w[1] - w[0]).as_millis() as u64)
            .collect()
    }
}

#[async_trait]
impl FrameDecoder for ScriptedDecoder {
    async fn spawn(&self, source: &StreamSource) -> Result<DecodeHandle> {
        self.spawns.lock().unwrap().push(Instant::now());
        if self.failing_urls.lock().unwrap().contains(&source.url) {
            return Err(Error::Decoder(format!("cannot open {}", source.url)));
        }
        let step = self
            .steps
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default_step.clone());

        let (frames, hold) = match step {
            DecoderStep::Fail => return Err(Error::Decoder("scripted spawn failure".to_string())),
            DecoderStep::End(frames) => (frames, false),
            DecoderStep::Hold(frames) => (frames, true),
        };

        let (reader, mut writer) = tokio::io::duplex(1 << 20);
        for frame in &frames {
            writer.write_all(frame).await?;
        }
        if hold {
            self.held.lock().unwrap().push(writer);
        }

        self.open.fetch_add(1, Ordering::SeqCst);
        Ok(DecodeHandle::from_reader(TrackedReader {
            inner: reader,
            open: self.open.clone(),
        }))
    }
}

struct TrackedReader {
    inner: DuplexStream,
    open: Arc<AtomicUsize>,
}

impl AsyncRead for TrackedReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl Drop for TrackedReader {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

// ---- Inference ----

pub struct FakeEngine {
    script: Mutex<VecDeque<Result<Vec<Detection>>>>,
    default: Mutex<Vec<Detection>>,
    delay: Mutex<Duration>,
    /// Upcoming detect calls that panic
    panics: AtomicUsize,
    calls: AtomicUsize,
    disposed: AtomicBool,
    initialized: AtomicBool,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default: Mutex::new(Vec::new()),
            delay: Mutex::new(Duration::ZERO),
            panics: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            disposed: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
        }
    }

    /// Detections returned when nothing is scripted
    pub fn always(&self, detections: Vec<Detection>) {
        *self.default.lock().unwrap() = detections;
    }

    pub fn push_ok(&self, detections: Vec<Detection>) {
        self.script.lock().unwrap().push_back(Ok(detections));
    }

    pub fn push_err(&self, message: &str) {
        self.script
            .lock()
            .unwrap()
            .push_back(Err(Error::Inference(message.to_string())));
    }

    /// Next detect call panics
    pub fn push_panic(&self) {
        self.panics.fetch_add(1, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceEngine for FakeEngine {
    async fn initialize(&self) -> Result<()> {
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn detect(&self, _frame: &[u8]) -> Result<Vec<Detection>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self
            .panics
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            panic!("inference backend crashed");
        }
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let scripted = self.script.lock().unwrap().pop_front();
        match scripted {
            Some(result) => result,
            None => Ok(self.default.lock().unwrap().clone()),
        }
    }

    async fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }
}

// ---- Notifier ----

pub struct RecordingNotifier {
    sent: Mutex<Vec<(String, String)>>,
    failing: AtomicBool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn messages(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(_, message)| message.clone())
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn say(&self, channel_username: &str, message: &str) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Notifier("chat unavailable".to_string()));
        }
        self.sent
            .lock()
            .unwrap()
            .push((channel_username.to_string(), message.to_string()));
        Ok(())
    }
}

// ---- Liveness ----

pub struct ScriptedLiveness {
    reports: Mutex<HashMap<String, LivenessReport>>,
    default: LivenessReport,
    calls: AtomicUsize,
}

impl ScriptedLiveness {
    pub fn new(default: LivenessReport) -> Self {
        Self {
            reports: Mutex::new(HashMap::new()),
            default,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set(&self, stream_url: &str, report: LivenessReport) {
        self.reports
            .lock()
            .unwrap()
            .insert(stream_url.to_string(), report);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LivenessChecker for ScriptedLiveness {
    async fn is_live(&self, stream_url: &str) -> LivenessReport {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.reports
            .lock()
            .unwrap()
            .get(stream_url)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}

// ---- Store ----

/// MemoryStore with switchable failures and call counters
pub struct FlakyConfigStore {
    inner: MemoryStore,
    fail_rules: AtomicBool,
    fail_logging: AtomicBool,
    rule_fetches: AtomicUsize,
}

impl FlakyConfigStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            fail_rules: AtomicBool::new(false),
            fail_logging: AtomicBool::new(false),
            rule_fetches: AtomicUsize::new(0),
        }
    }

    /// Channel plus a disabled config with id `cfg-<channel_id>`
    pub async fn add_channel(
        &self,
        channel_id: &str,
        username: &str,
        stream_url: Option<&str>,
    ) -> (Channel, DetectionConfig) {
        let channel = Channel {
            id: channel_id.to_string(),
            username: username.to_string(),
        };
        let config = DetectionConfig {
            id: format!("cfg-{}", channel_id),
            channel_id: channel_id.to_string(),
            stream_url: stream_url.map(String::from),
            cooldown_seconds: 30,
            is_enabled: false,
        };
        self.inner.insert_channel(channel.clone()).await;
        self.inner.insert_config(config.clone()).await;
        (channel, config)
    }

    pub async fn set_rules(&self, config_id: &str, rules: Vec<DetectionRule>) {
        self.inner.set_rules(config_id, rules).await;
    }

    pub fn fail_rules(&self, fail: bool) {
        self.fail_rules.store(fail, Ordering::SeqCst);
    }

    pub fn fail_logging(&self, fail: bool) {
        self.fail_logging.store(fail, Ordering::SeqCst);
    }

    pub fn rule_fetches(&self) -> usize {
        self.rule_fetches.load(Ordering::SeqCst)
    }

    pub async fn recent_detections(&self, count: usize) -> Vec<DetectionLogRecord> {
        self.inner.recent_detections(count).await
    }

    pub async fn is_enabled(&self, channel_id: &str) -> bool {
        self.inner
            .get_config(channel_id)
            .await
            .ok()
            .flatten()
            .is_some_and(|c| c.is_enabled)
    }
}

#[async_trait]
impl ChannelStore for FlakyConfigStore {
    async fn find_by_id(&self, id: &str) -> Result<Option<Channel>> {
        self.inner.find_by_id(id).await
    }
}

#[async_trait]
impl DetectionConfigStore for FlakyConfigStore {
    async fn get_config(&self, channel_id: &str) -> Result<Option<DetectionConfig>> {
        self.inner.get_config(channel_id).await
    }

    async fn get_enabled_rules(&self, config_id: &str) -> Result<Vec<DetectionRule>> {
        self.rule_fetches.fetch_add(1, Ordering::SeqCst);
        if self.fail_rules.load(Ordering::SeqCst) {
            return Err(Error::Store("rules unavailable".to_string()));
        }
        self.inner.get_enabled_rules(config_id).await
    }

    async fn update_config(&self, config_id: &str, patch: ConfigPatch) -> Result<()> {
        self.inner.update_config(config_id, patch).await
    }

    async fn log_detection(
        &self,
        config_id: &str,
        rule_id: &str,
        entry: DetectionLogEntry,
    ) -> Result<()> {
        if self.fail_logging.load(Ordering::SeqCst) {
            return Err(Error::Store("detection log unavailable".to_string()));
        }
        self.inner.log_detection(config_id, rule_id, entry).await
    }

    async fn list_enabled_configs(&self) -> Result<Vec<DetectionConfig>> {
        self.inner.list_enabled_configs().await
    }
}
