//! Decode subprocess
//!
//! ## Responsibilities
//!
//! - Spawn ffmpeg reading the stream URL and writing MJPEG to stdout
//! - Own the child process as a scoped handle (`DecodeHandle`)
//! - Graceful quit (`q` on stdin), then SIGKILL after the grace period
//!
//! `kill_on_drop(true)` stays set as a backstop: if a handle is dropped
//! without `terminate` (task aborted), tokio still kills the child.

use super::StreamSource;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};

/// Something that can start a decode process for a stream
#[async_trait]
pub trait FrameDecoder: Send + Sync {
    async fn spawn(&self, source: &StreamSource) -> Result<DecodeHandle>;
}

/// A running decode process and its frame byte stream
pub struct DecodeHandle {
    stdout: Box<dyn AsyncRead + Send + Unpin>,
    process: Option<DecodeProcess>,
}

struct DecodeProcess {
    child: Child,
    stdin: Option<ChildStdin>,
}

impl DecodeHandle {
    /// Wrap a spawned child. stdout must be piped.
    pub fn from_child(mut child: Child) -> Result<Self> {
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Decoder("decoder stdout not captured".to_string()))?;
        let stdin = child.stdin.take();

        Ok(Self {
            stdout: Box::new(stdout),
            process: Some(DecodeProcess { child, stdin }),
        })
    }

    /// Byte stream without a backing process (in-process sources)
    pub fn from_reader(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self {
            stdout: Box::new(reader),
            process: None,
        }
    }

    pub fn reader(&mut self) -> &mut (dyn AsyncRead + Send + Unpin) {
        &mut *self.stdout
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(|p| p.child.id())
    }

    /// Stop the process: ask politely, wait `grace`, then kill.
    pub async fn terminate(self, grace: Duration) {
        let DecodeHandle { stdout, process } = self;
        drop(stdout);

        let Some(DecodeProcess { mut child, stdin }) = process else {
            return;
        };
        let pid = child.id();

        if let Some(mut stdin) = stdin {
            let _ = stdin.write_all(b"q\n").await;
            let _ = stdin.flush().await;
        }

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(pid = ?pid, status = %status, "Decoder exited");
                return;
            }
            Ok(Err(e)) => {
                tracing::warn!(pid = ?pid, error = %e, "Decoder wait failed, killing");
            }
            Err(_) => {
                tracing::warn!(
                    pid = ?pid,
                    grace_ms = grace.as_millis() as u64,
                    "Decoder did not exit within grace period, killing"
                );
            }
        }

        if let Err(e) = child.start_kill() {
            tracing::debug!(pid = ?pid, error = %e, "Decoder kill failed (already exited?)");
        }
        if tokio::time::timeout(grace, child.wait()).await.is_err() {
            tracing::error!(pid = ?pid, "Decoder still running after SIGKILL");
        }
    }
}

/// ffmpeg-backed decoder
pub struct FfmpegDecoder {
    ffmpeg_path: String,
}

impl FfmpegDecoder {
    pub fn new(ffmpeg_path: impl Into<String>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
        }
    }

    /// ffmpeg arguments for a source
    ///
    /// - `-an`: no audio
    /// - `-vf fps=1000/<interval>`: one frame per interval
    /// - `-f image2pipe -vcodec mjpeg`: back-to-back JPEGs on stdout
    pub fn build_args(source: &StreamSource) -> Vec<String> {
        let mut args: Vec<&str> = vec!["-hide_banner", "-loglevel", "error"];

        if source.url.starts_with("rtsp://") || source.url.starts_with("rtsps://") {
            args.extend(["-rtsp_transport", "tcp"]);
        }
        args.extend(["-i", source.url.as_str(), "-an"]);

        let mut filter = format!("fps=1000/{}", source.frame_interval_ms.max(1));
        if let Some(width) = source.width {
            filter.push_str(&format!(",scale={}:-2", width));
        }
        let quality = source.quality.clamp(2, 31).to_string();

        args.extend(["-vf", filter.as_str(), "-q:v", quality.as_str()]);
        args.extend(["-f", "image2pipe", "-vcodec", "mjpeg", "-"]);

        args.into_iter().map(String::from).collect()
    }

    /// Check if ffmpeg is available
    pub async fn check_available(&self) -> Result<String> {
        let output = Command::new(&self.ffmpeg_path)
            .arg("-version")
            .output()
            .await
            .map_err(|e| Error::Decoder(format!("ffmpeg not found: {}", e)))?;

        if !output.status.success() {
            return Err(Error::Decoder("ffmpeg version check failed".to_string()));
        }

        let version = String::from_utf8_lossy(&output.stdout);
        Ok(version.lines().next().unwrap_or("unknown").to_string())
    }
}

#[async_trait]
impl FrameDecoder for FfmpegDecoder {
    async fn spawn(&self, source: &StreamSource) -> Result<DecodeHandle> {
        let mut child = Command::new(&self.ffmpeg_path)
            .args(Self::build_args(source))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Decoder(format!("ffmpeg spawn failed: {}", e)))?;

        let pid = child.id();

        // stderr must be drained or ffmpeg blocks once the pipe fills
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::warn!(pid = ?pid, line = %line, "ffmpeg");
                }
            });
        }

        tracing::debug!(pid = ?pid, "ffmpeg decoder spawned");
        DecodeHandle::from_child(child)
    }
}
