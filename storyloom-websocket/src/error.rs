//! Error types for the sync transport.

use storyloom_collab::{CollabError, DocumentKey};
use storyloom_config::ConfigError;
use thiserror::Error;

/// Sync server error type.
#[derive(Error, Debug)]
pub enum SyncServerError {
    /// WebSocket protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] tungstenite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Failure reported by the sync engine
    #[error("Sync error: {0}")]
    Collab(#[from] CollabError),

    /// Bad server configuration
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Request path is not `/sync/{branch_id}/{chapter_id}`
    #[error("Invalid sync path: {0}")]
    InvalidPath(String),

    /// No chapter document exists under the requested key
    #[error("Unknown document: {0}")]
    UnknownDocument(DocumentKey),

    /// Invalid bind address
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Connection closed
    #[error("Connection closed")]
    ConnectionClosed,
}

/// Result type for sync transport operations.
pub type SyncServerResult<T> = Result<T, SyncServerError>;
