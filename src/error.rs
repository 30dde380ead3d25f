use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Bind failed on port {port}: {reason}")]
    Bind { port: u16, reason: String },

    #[error("Video error: {0}")]
    VideoError(String),

    #[error("Video device lost [{device}]: {reason}")]
    VideoDeviceLost { device: String, reason: String },

    #[error("Wire error: {0}")]
    Wire(#[from] crate::wire::WireError),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias used across the crate
pub type Result<T> = std::result::Result<T, AppError>;

impl From<crate::transport::TransportError> for AppError {
    fn from(err: crate::transport::TransportError) -> Self {
        use crate::transport::TransportError;
        match err {
            TransportError::Bind { addr, source } => AppError::Bind {
                port: addr.port(),
                reason: source.to_string(),
            },
            TransportError::Malformed(e) | TransportError::Framing(e) => AppError::Wire(e),
            other => AppError::Internal(other.to_string()),
        }
    }
}
