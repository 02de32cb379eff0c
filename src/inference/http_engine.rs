//! HttpInferenceEngine - detection server adapter
//!
//! ## Responsibilities
//!
//! - Health check on initialize
//! - POST each frame as multipart JPEG, parse detections

use super::{Detection, InferenceEngine};
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Detection server response
#[derive(Debug, Deserialize)]
struct DetectResponse {
    #[serde(default)]
    detections: Vec<Detection>,
}

pub struct HttpInferenceEngine {
    client: reqwest::Client,
    base_url: String,
    ready: AtomicBool,
}

impl HttpInferenceEngine {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Self::with_timeout(base_url, Duration::from_secs(30))
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            ready: AtomicBool::new(false),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn parse_response(body: &str) -> Result<Vec<Detection>> {
        let response: DetectResponse = serde_json::from_str(body)?;
        Ok(response.detections)
    }
}

#[async_trait]
impl InferenceEngine for HttpInferenceEngine {
    async fn initialize(&self) -> Result<()> {
        let url = format!("{}/healthz", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Inference(format!("health check failed: {}", e)))?;

        if !resp.status().is_success() {
            return Err(Error::Inference(format!(
                "health check returned {}",
                resp.status()
            )));
        }

        self.ready.store(true, Ordering::SeqCst);
        tracing::info!(base_url = %self.base_url, "Inference engine ready");
        Ok(())
    }

    async fn detect(&self, frame: &[u8]) -> Result<Vec<Detection>> {
        if !self.ready.load(Ordering::SeqCst) {
            return Err(Error::Inference("engine not initialized".to_string()));
        }

        let url = format!("{}/v1/detect", self.base_url);
        let form = Form::new().part(
            "image",
            Part::bytes(frame.to_vec())
                .file_name("frame.jpg")
                .mime_str("image/jpeg")?,
        );

        let resp = self.client.post(&url).multipart(form).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Inference(format!(
                "detect failed: {} - {}",
                status,
                body.chars().take(200).collect::<String>()
            )));
        }

        let body = resp.text().await?;
        Self::parse_response(&body)
    }

    async fn dispose(&self) {
        self.ready.store(false, Ordering::SeqCst);
        tracing::info!(base_url = %self.base_url, "Inference engine disposed");
    }
}
