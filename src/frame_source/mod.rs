//! FrameSource - Frame Capture from a Live Stream
//!
//! ## Responsibilities
//!
//! - Validate the stream URL before anything is spawned
//! - Own exactly one decode process per session (see `decoder`)
//! - Reassemble JPEG frames from the decoder byte stream
//! - Keep a bounded window of recent frames
//! - Fan frames and errors out to registered callbacks
//! - Reconnect with capped exponential backoff; `Error` once exhausted
//!
//! ## Lifecycle
//!
//! `Stopped -> Connecting -> Connected`, then `Reconnecting` on every
//! unexpected disconnect, `Error` when the reconnect budget is used up.
//! `stop()` returns only after the session task (and with it the decoder
//! process) is gone, so no callback fires after it.

mod assembler;
mod decoder;
mod frame;
mod reconnect;
mod ring_buffer;
mod source_policy;

pub use assembler::FrameAssembler;
pub use decoder::{DecodeHandle, FfmpegDecoder, FrameDecoder};
pub use frame::{validate_frame, Frame, FrameRejection, JPEG_EOI, JPEG_SOI, MIN_FRAME_BYTES};
pub use reconnect::{ReconnectDecision, ReconnectPolicy};
pub use ring_buffer::FrameRingBuffer;
pub use source_policy::SourcePolicy;

use crate::error::{Error, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

const READ_CHUNK_BYTES: usize = 64 * 1024;

/// One external frame feed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSource {
    pub url: String,
    pub frame_interval_ms: u64,
    /// ffmpeg `-q:v` (2 best .. 31 worst)
    pub quality: u8,
    /// Output width, height keeps aspect ratio
    pub width: Option<u32>,
    pub max_frame_bytes: usize,
    pub buffer_capacity: usize,
}

/// Capture settings shared by every FrameSource
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub frame_interval_ms: u64,
    pub quality: u8,
    pub width: Option<u32>,
    pub max_frame_bytes: usize,
    pub buffer_capacity: usize,
    pub reconnect: ReconnectPolicy,
    /// How long `start()` waits for the first valid frame
    pub connect_timeout: Duration,
    /// How long the decoder gets to quit before SIGKILL
    pub stop_grace: Duration,
}

impl CaptureSettings {
    pub fn source_for(&self, url: &str) -> StreamSource {
        StreamSource {
            url: url.to_string(),
            frame_interval_ms: self.frame_interval_ms,
            quality: self.quality,
            width: self.width,
            max_frame_bytes: self.max_frame_bytes,
            buffer_capacity: self.buffer_capacity,
        }
    }
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            frame_interval_ms: 2000,
            quality: 5,
            width: Some(640),
            max_frame_bytes: 2 * 1024 * 1024,
            buffer_capacity: 5,
            reconnect: ReconnectPolicy::default(),
            connect_timeout: Duration::from_secs(15),
            stop_grace: Duration::from_secs(3),
        }
    }
}

/// Capture session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureStatus {
    Stopped,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl CaptureStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureStatus::Stopped => "stopped",
            CaptureStatus::Connecting => "connecting",
            CaptureStatus::Connected => "connected",
            CaptureStatus::Reconnecting => "reconnecting",
            CaptureStatus::Error => "error",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => CaptureStatus::Connecting,
            2 => CaptureStatus::Connected,
            3 => CaptureStatus::Reconnecting,
            4 => CaptureStatus::Error,
            _ => CaptureStatus::Stopped,
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            CaptureStatus::Stopped => 0,
            CaptureStatus::Connecting => 1,
            CaptureStatus::Connected => 2,
            CaptureStatus::Reconnecting => 3,
            CaptureStatus::Error => 4,
        }
    }
}

type FrameCallback = Arc<dyn Fn(&Frame) + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(&Error) + Send + Sync>;

/// State shared between the FrameSource handle and its session task
struct SessionShared {
    label: String,
    status: AtomicU8,
    reconnect_count: AtomicU32,
    shutting_down: AtomicBool,
    process_alive: AtomicBool,
    sequence: AtomicU64,
    frames_rejected: AtomicU64,
    frames: Mutex<FrameRingBuffer>,
    frame_callbacks: RwLock<Vec<FrameCallback>>,
    error_callbacks: RwLock<Vec<ErrorCallback>>,
}

impl SessionShared {
    fn status(&self) -> CaptureStatus {
        CaptureStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    fn set_status(&self, status: CaptureStatus) {
        let prev = CaptureStatus::from_u8(self.status.swap(status.to_u8(), Ordering::SeqCst));
        if prev != status {
            tracing::debug!(
                source = %self.label,
                from = prev.as_str(),
                to = status.as_str(),
                "Capture status changed"
            );
        }
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Validate, buffer and fan out one reassembled frame.
    fn accept_frame(&self, raw: Vec<u8>, max_frame_bytes: usize) -> bool {
        if self.is_shutting_down() {
            return false;
        }

        if let Err(rejection) = validate_frame(&raw, max_frame_bytes) {
            self.frames_rejected.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(source = %self.label, reason = %rejection, "Dropping malformed frame");
            return false;
        }

        let frame = Frame {
            data: raw.into(),
            captured_at: Utc::now(),
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
        };

        lock(&self.frames).push(frame.clone());

        let callbacks: Vec<FrameCallback> = read(&self.frame_callbacks).clone();
        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(&frame))).is_err() {
                tracing::error!(source = %self.label, "Frame callback panicked");
            }
        }
        true
    }

    fn emit_error(&self, error: &Error) {
        let callbacks: Vec<ErrorCallback> = read(&self.error_callbacks).clone();
        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(error))).is_err() {
                tracing::error!(source = %self.label, "Error callback panicked");
            }
        }
    }
}

/// Running session: task plus its shutdown signal
struct SessionHandle {
    task: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// FrameSource instance
pub struct FrameSource {
    source: StreamSource,
    settings: CaptureSettings,
    decoder: Arc<dyn FrameDecoder>,
    shared: Arc<SessionShared>,
    session: tokio::sync::Mutex<Option<SessionHandle>>,
}

impl FrameSource {
    /// Create a FrameSource. Fails on a URL the policy rejects; nothing is
    /// spawned until `start()`.
    pub fn new(
        url: &str,
        settings: CaptureSettings,
        policy: &SourcePolicy,
        decoder: Arc<dyn FrameDecoder>,
    ) -> Result<Self> {
        let parsed = policy.validate(url)?;
        let source = settings.source_for(url);
        let label = parsed.host_str().unwrap_or("unknown").to_string();

        let shared = Arc::new(SessionShared {
            label,
            status: AtomicU8::new(CaptureStatus::Stopped.to_u8()),
            reconnect_count: AtomicU32::new(0),
            shutting_down: AtomicBool::new(false),
            process_alive: AtomicBool::new(false),
            sequence: AtomicU64::new(0),
            frames_rejected: AtomicU64::new(0),
            frames: Mutex::new(FrameRingBuffer::new(source.buffer_capacity)),
            frame_callbacks: RwLock::new(Vec::new()),
            error_callbacks: RwLock::new(Vec::new()),
        });

        Ok(Self {
            source,
            settings,
            decoder,
            shared,
            session: tokio::sync::Mutex::new(None),
        })
    }

    /// Register a frame observer. Callbacks run on the capture task in
    /// capture order; a panicking callback does not affect the others.
    pub fn on_frame<F>(&self, callback: F)
    where
        F: Fn(&Frame) + Send + Sync + 'static,
    {
        write(&self.shared.frame_callbacks).push(Arc::new(callback));
    }

    /// Register an error observer (reconnect exhaustion).
    pub fn on_error<F>(&self, callback: F)
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        write(&self.shared.error_callbacks).push(Arc::new(callback));
    }

    /// Start capturing. Resolves once the first valid frame arrives.
    pub async fn start(&self) -> Result<()> {
        let ready_rx = {
            let mut session = self.session.lock().await;
            if let Some(existing) = session.as_ref() {
                if !existing.task.is_finished() {
                    return match self.shared.status() {
                        CaptureStatus::Connected => Ok(()),
                        status => Err(Error::Validation(format!(
                            "capture session already running ({})",
                            status.as_str()
                        ))),
                    };
                }
            }
            // Previous session ended on its own (Error); clear it
            session.take();

            self.shared.shutting_down.store(false, Ordering::SeqCst);
            self.shared.reconnect_count.store(0, Ordering::SeqCst);
            self.shared.set_status(CaptureStatus::Connecting);

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let (ready_tx, ready_rx) = oneshot::channel();

            let task = tokio::spawn(run_session(
                self.source.clone(),
                self.settings.clone(),
                self.decoder.clone(),
                self.shared.clone(),
                shutdown_rx,
                ready_tx,
            ));

            *session = Some(SessionHandle { task, shutdown_tx });
            ready_rx
        };

        // Session lock is released so stop() can run while we wait
        self.await_first_frame(ready_rx).await
    }

    async fn await_first_frame(&self, ready_rx: oneshot::Receiver<Result<()>>) -> Result<()> {
        let timeout_secs = self.settings.connect_timeout.as_secs();

        let outcome = match tokio::time::timeout(self.settings.connect_timeout, ready_rx).await {
            Ok(Ok(Ok(()))) => {
                tracing::info!(source = %self.shared.label, "Frame source connected");
                return Ok(());
            }
            Ok(Ok(Err(e))) => e,
            Ok(Err(_)) => Error::Internal("capture stopped before first frame".to_string()),
            Err(_) => {
                tracing::warn!(
                    source = %self.shared.label,
                    timeout_sec = timeout_secs,
                    "No frame before connect timeout"
                );
                Error::ConnectTimeout(timeout_secs)
            }
        };

        self.stop().await;
        self.shared.set_status(CaptureStatus::Error);
        Err(outcome)
    }

    /// Stop capturing. Idempotent; safe from any state.
    ///
    /// Returns after the decode process is gone (graceful quit, SIGKILL after
    /// the grace period, task abort as last resort).
    pub async fn stop(&self) {
        self.shared.shutting_down.store(true, Ordering::SeqCst);

        let session = self.session.lock().await.take();
        if let Some(SessionHandle {
            mut task,
            shutdown_tx,
        }) = session
        {
            let _ = shutdown_tx.send(true);

            let deadline = self.settings.stop_grace * 3;
            match tokio::time::timeout(deadline, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(source = %self.shared.label, error = %e, "Capture task failed");
                }
                Err(_) => {
                    tracing::warn!(
                        source = %self.shared.label,
                        "Capture task did not finish in time, aborting"
                    );
                    task.abort();
                    let _ = task.await;
                }
            }
            tracing::info!(source = %self.shared.label, "Frame source stopped");
        }

        self.shared.process_alive.store(false, Ordering::SeqCst);
        self.shared.set_status(CaptureStatus::Stopped);
    }

    pub fn status(&self) -> CaptureStatus {
        self.shared.status()
    }

    pub fn reconnect_count(&self) -> u32 {
        self.shared.reconnect_count.load(Ordering::SeqCst)
    }

    /// Whether a decode process is currently owned
    pub fn has_process(&self) -> bool {
        self.shared.process_alive.load(Ordering::SeqCst)
    }

    pub fn latest_frame(&self) -> Option<Frame> {
        lock(&self.shared.frames).latest().cloned()
    }

    /// Recent frames, newest first
    pub fn recent_frames(&self, count: usize) -> Vec<Frame> {
        lock(&self.shared.frames).get_latest(count)
    }

    pub fn frames_rejected(&self) -> u64 {
        self.shared.frames_rejected.load(Ordering::Relaxed)
    }

    pub fn source(&self) -> &StreamSource {
        &self.source
    }
}

/// Session task: spawn, read, disconnect, back off, repeat.
async fn run_session(
    source: StreamSource,
    settings: CaptureSettings,
    decoder: Arc<dyn FrameDecoder>,
    shared: Arc<SessionShared>,
    mut shutdown_rx: watch::Receiver<bool>,
    ready_tx: oneshot::Sender<Result<()>>,
) {
    let mut ready = Some(ready_tx);
    let mut assembler = FrameAssembler::new(source.max_frame_bytes);

    loop {
        if shutdown_requested(&shared, &shutdown_rx) {
            break;
        }

        let reason = match decoder.spawn(&source).await {
            Ok(mut handle) => {
                shared.process_alive.store(true, Ordering::SeqCst);
                assembler.reset();

                let reason = read_frames(
                    &mut handle,
                    &mut assembler,
                    &shared,
                    source.max_frame_bytes,
                    &mut shutdown_rx,
                    &mut ready,
                )
                .await;

                handle.terminate(settings.stop_grace).await;
                shared.process_alive.store(false, Ordering::SeqCst);
                reason
            }
            Err(e) => e.to_string(),
        };

        if shutdown_requested(&shared, &shutdown_rx) {
            break;
        }

        // Unexpected disconnect
        let reconnects = shared.reconnect_count.load(Ordering::SeqCst);
        match settings.reconnect.next(reconnects) {
            ReconnectDecision::GiveUp => {
                shared.set_status(CaptureStatus::Error);
                let error = Error::ReconnectExhausted {
                    attempts: settings.reconnect.max_attempts,
                };
                tracing::error!(
                    source = %shared.label,
                    attempts = settings.reconnect.max_attempts,
                    last_reason = %reason,
                    "Reconnect attempts exhausted"
                );
                shared.emit_error(&error);
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Err(error));
                }
                break;
            }
            ReconnectDecision::RetryAfter { attempt, delay } => {
                shared.reconnect_count.store(attempt, Ordering::SeqCst);
                shared.set_status(CaptureStatus::Reconnecting);
                tracing::warn!(
                    source = %shared.label,
                    attempt = attempt,
                    max_attempts = settings.reconnect.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    reason = %reason,
                    "Decoder disconnected, scheduling reconnect"
                );

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = wait_for_shutdown(&mut shutdown_rx) => break,
                }
            }
        }
    }

    if shared.is_shutting_down() {
        shared.set_status(CaptureStatus::Stopped);
    }
}

/// Read until the stream ends or shutdown; returns the disconnect reason.
async fn read_frames(
    handle: &mut DecodeHandle,
    assembler: &mut FrameAssembler,
    shared: &SessionShared,
    max_frame_bytes: usize,
    shutdown_rx: &mut watch::Receiver<bool>,
    ready: &mut Option<oneshot::Sender<Result<()>>>,
) -> String {
    let mut chunk = vec![0u8; READ_CHUNK_BYTES];

    loop {
        tokio::select! {
            biased;
            _ = wait_for_shutdown(shutdown_rx) => return "shutdown requested".to_string(),
            read = handle.reader().read(&mut chunk) => match read {
                Ok(0) => return "decode stream ended".to_string(),
                Ok(n) => {
                    for raw in assembler.push(&chunk[..n]) {
                        if shared.accept_frame(raw, max_frame_bytes)
                            && shared.status() != CaptureStatus::Connected
                        {
                            shared.reconnect_count.store(0, Ordering::SeqCst);
                            shared.set_status(CaptureStatus::Connected);
                            if let Some(tx) = ready.take() {
                                let _ = tx.send(Ok(()));
                            }
                        }
                    }
                }
                Err(e) => return format!("decode stream read error: {}", e),
            }
        }
    }
}

fn shutdown_requested(shared: &SessionShared, rx: &watch::Receiver<bool>) -> bool {
    // A dropped sender means the FrameSource itself is gone
    shared.is_shutting_down() || *rx.borrow() || rx.has_changed().is_err()
}

async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}
