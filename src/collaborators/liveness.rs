//! Stream liveness via ffprobe
//!
//! A stream is live when ffprobe reports at least one video stream. A
//! non-zero exit is "offline"; spawn failures and timeouts are reported as
//! probe errors so the caller can tell "offline" from "don't know".

use super::{LivenessChecker, LivenessReport};
use async_trait::async_trait;
use serde::Deserialize;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    #[serde(default)]
    codec_type: Option<String>,
}

pub struct FfprobeLivenessChecker {
    ffprobe_path: String,
    timeout: Duration,
}

impl FfprobeLivenessChecker {
    pub fn new(ffprobe_path: impl Into<String>, timeout: Duration) -> Self {
        Self {
            ffprobe_path: ffprobe_path.into(),
            timeout,
        }
    }

    fn build_args(stream_url: &str) -> Vec<&str> {
        let mut args = vec!["-v", "error"];
        if stream_url.starts_with("rtsp://") || stream_url.starts_with("rtsps://") {
            args.extend(["-rtsp_transport", "tcp"]);
        }
        args.extend([
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=codec_type",
            "-of",
            "json",
            stream_url,
        ]);
        args
    }

    fn has_video_stream(stdout: &[u8]) -> bool {
        serde_json::from_slice::<ProbeOutput>(stdout)
            .map(|probe| {
                probe
                    .streams
                    .iter()
                    .any(|s| s.codec_type.as_deref() == Some("video"))
            })
            .unwrap_or(false)
    }
}

#[async_trait]
impl LivenessChecker for FfprobeLivenessChecker {
    async fn is_live(&self, stream_url: &str) -> LivenessReport {
        let child = match Command::new(&self.ffprobe_path)
            .args(Self::build_args(stream_url))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => return LivenessReport::unavailable(format!("ffprobe spawn failed: {}", e)),
        };

        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) if output.status.success() => {
                if Self::has_video_stream(&output.stdout) {
                    LivenessReport::live()
                } else {
                    LivenessReport::offline()
                }
            }
            Ok(Ok(output)) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                tracing::debug!(stderr = %stderr.trim(), "ffprobe reports stream offline");
                LivenessReport::offline()
            }
            Ok(Err(e)) => LivenessReport::unavailable(format!("ffprobe execution failed: {}", e)),
            Err(_) => {
                tracing::warn!(
                    timeout_sec = self.timeout.as_secs(),
                    "ffprobe timeout, process killed via kill_on_drop"
                );
                LivenessReport::unavailable(format!("ffprobe timeout ({}s)", self.timeout.as_secs()))
            }
        }
    }
}
