//! Stream URL allow-list
//!
//! The URL ends up as an ffmpeg argument, so it is checked before any
//! process is spawned.

use crate::error::{Error, Result};
use reqwest::Url;

const MAX_URL_LEN: usize = 2048;

/// Schemes ffmpeg is allowed to open
pub const DEFAULT_SCHEMES: &[&str] = &["rtsp", "rtsps", "rtmp", "rtmps", "http", "https"];

#[derive(Debug, Clone)]
pub struct SourcePolicy {
    allowed_schemes: Vec<String>,
    /// Empty = any host. Entries match the host itself and its subdomains.
    allowed_hosts: Vec<String>,
}

impl SourcePolicy {
    pub fn new(allowed_schemes: Vec<String>, allowed_hosts: Vec<String>) -> Self {
        Self {
            allowed_schemes: allowed_schemes
                .into_iter()
                .map(|s| s.to_ascii_lowercase())
                .collect(),
            allowed_hosts: allowed_hosts
                .into_iter()
                .map(|h| h.trim().trim_start_matches("*.").to_ascii_lowercase())
                .filter(|h| !h.is_empty())
                .collect(),
        }
    }

    /// Restrict to the given hosts with the default schemes
    pub fn with_hosts(hosts: Vec<String>) -> Self {
        Self::new(
            DEFAULT_SCHEMES.iter().map(|s| s.to_string()).collect(),
            hosts,
        )
    }

    pub fn validate(&self, url: &str) -> Result<Url> {
        if url.is_empty() {
            return Err(Error::InvalidSource("empty stream URL".to_string()));
        }
        if url.len() > MAX_URL_LEN {
            return Err(Error::InvalidSource(format!(
                "stream URL longer than {} characters",
                MAX_URL_LEN
            )));
        }
        if url.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(Error::InvalidSource(
                "stream URL contains whitespace or control characters".to_string(),
            ));
        }

        let parsed = Url::parse(url)
            .map_err(|e| Error::InvalidSource(format!("unparseable stream URL: {}", e)))?;

        let scheme = parsed.scheme();
        if !self.allowed_schemes.iter().any(|s| s == scheme) {
            return Err(Error::InvalidSource(format!("scheme '{}' not allowed", scheme)));
        }

        let host = parsed
            .host_str()
            .ok_or_else(|| Error::InvalidSource("stream URL has no host".to_string()))?
            .to_ascii_lowercase();

        if !self.allowed_hosts.is_empty() && !self.host_allowed(&host) {
            return Err(Error::InvalidSource(format!("host '{}' not allowed", host)));
        }

        Ok(parsed)
    }

    fn host_allowed(&self, host: &str) -> bool {
        self.allowed_hosts.iter().any(|allowed| {
            host == allowed
                || host
                    .strip_suffix(allowed.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }
}

impl Default for SourcePolicy {
    fn default() -> Self {
        Self::with_hosts(Vec::new())
    }
}
