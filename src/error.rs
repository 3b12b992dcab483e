//! Crate-wide error type

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for server and client operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error (bind, accept, socket configuration)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// WebSocket transport error on an outbound connection
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// WebSocket transport error on an inbound connection
    #[error("WebSocket error: {0}")]
    Axum(#[from] axum::Error),

    /// Publish registry backend error
    #[error("Publish registry error: {0}")]
    Registry(#[from] redis::RedisError),

    /// Token signing failure
    #[error("Token error: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// Protocol violation by the peer
    #[error("Protocol error: {0}")]
    Protocol(String),
}
