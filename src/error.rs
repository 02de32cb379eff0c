//! Error handling for streamwatch

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Not found (channel, config)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Config error (missing stream URL, bad settings)
    #[error("Config error: {0}")]
    Config(String),

    /// Stream URL rejected by the source policy
    #[error("Invalid stream source: {0}")]
    InvalidSource(String),

    /// No frame decoded before the connect timeout
    #[error("Connection timeout after {0}s")]
    ConnectTimeout(u64),

    /// Reconnect budget used up
    #[error("Reconnect attempts exhausted ({attempts})")]
    ReconnectExhausted { attempts: u32 },

    /// Decode subprocess error (spawn failure, broken pipe)
    #[error("Decoder error: {0}")]
    Decoder(String),

    /// Inference engine error
    #[error("Inference error: {0}")]
    Inference(String),

    /// Notifier dispatch error
    #[error("Notifier error: {0}")]
    Notifier(String),

    /// Store (collaborator) error
    #[error("Store error: {0}")]
    Store(String),

    /// Message template error
    #[error("Template error: {0}")]
    Template(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stream-level failures that the orchestrator retries through the
    /// liveness poll instead of failing the caller.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::ConnectTimeout(_) | Error::ReconnectExhausted { .. } | Error::Decoder(_)
        )
    }

    /// Short machine-readable code for status views.
    pub fn code(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "NOT_FOUND",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::Config(_) => "CONFIG_ERROR",
            Error::InvalidSource(_) => "INVALID_SOURCE",
            Error::ConnectTimeout(_) => "CONNECT_TIMEOUT",
            Error::ReconnectExhausted { .. } => "RECONNECT_EXHAUSTED",
            Error::Decoder(_) => "DECODER_ERROR",
            Error::Inference(_) => "INFERENCE_ERROR",
            Error::Notifier(_) => "NOTIFIER_ERROR",
            Error::Store(_) => "STORE_ERROR",
            Error::Template(_) => "TEMPLATE_ERROR",
            Error::Serialization(_) => "SERIALIZATION_ERROR",
            Error::Http(_) => "HTTP_ERROR",
            Error::Io(_) => "IO_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::ConnectTimeout(15).is_transient());
        assert!(Error::ReconnectExhausted { attempts: 5 }.is_transient());
        assert!(Error::Decoder("ffmpeg exited".to_string()).is_transient());
        assert!(!Error::Config("no stream url".to_string()).is_transient());
        assert!(!Error::InvalidSource("ftp://x".to_string()).is_transient());
    }

    #[test]
    fn test_display_includes_code_context() {
        let e = Error::ReconnectExhausted { attempts: 3 };
        assert_eq!(e.to_string(), "Reconnect attempts exhausted (3)");
        assert_eq!(e.code(), "RECONNECT_EXHAUSTED");
    }
}
