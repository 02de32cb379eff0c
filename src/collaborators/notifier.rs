//! Chat delivery adapters

use super::Notifier;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    channel: &'a str,
    message: &'a str,
}

/// POSTs `{channel, message}` JSON to a chat bridge
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn say(&self, channel_username: &str, message: &str) -> Result<()> {
        let payload = WebhookPayload {
            channel: channel_username,
            message,
        };

        let resp = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| Error::Notifier(format!("webhook request failed: {}", e)))?;

        if !resp.status().is_success() {
            return Err(Error::Notifier(format!(
                "webhook returned {}",
                resp.status()
            )));
        }
        Ok(())
    }
}

/// Writes notifications to the log (no chat bridge configured)
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn say(&self, channel_username: &str, message: &str) -> Result<()> {
        tracing::info!(channel = %channel_username, message = %message, "Notification");
        Ok(())
    }
}
