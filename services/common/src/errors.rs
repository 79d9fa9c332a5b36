//! Common error types for services

use thiserror::Error;

/// Startup configuration failures. These abort the process.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("required environment variable '{0}' is not set")]
    Missing(String),

    #[error("invalid value for '{key}': {reason}")]
    Invalid { key: String, reason: String },
}

/// Bus wire-format failures.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("empty payload")]
    Empty,

    #[error("unsupported wire version {0}")]
    UnsupportedVersion(u8),

    #[error("payload decode failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Feed transport failures surfaced to the supervisor loop.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("authentication failed: {0}")]
    AuthExpired(String),

    #[error("server disconnect, reason code {0}")]
    ServerDisconnect(i32),

    #[error("reconnect attempts exhausted after {0} tries")]
    ReconnectExhausted(u32),
}
