//! Error types for the sync engine

use crate::{BranchId, DocumentKey, ItemId, SessionId};
use serde::{Deserialize, Serialize};
use storyloom_config::ConfigError;
use thiserror::Error;

/// Why a remote operation could not be integrated.
///
/// Both variants leave the document untouched. `UnknownDependency` is
/// recoverable: the caller buffers the operation and fetches the missing delta.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    #[error("operation {op} depends on {missing}, which has not been integrated")]
    UnknownDependency { op: ItemId, missing: ItemId },

    #[error("malformed operation {op}: {detail}")]
    Malformed { op: ItemId, detail: String },
}

/// Session-level failures. The client reconnects and resyncs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("session is not attached to a document")]
    NotAttached,

    #[error("unknown session {0}")]
    UnknownSession(SessionId),

    #[error("session superseded by a newer connection for the same replica")]
    Superseded,

    #[error("heartbeat window elapsed")]
    HeartbeatExpired,

    #[error("server assigned a different replica than the one resumed")]
    ReplicaConflict,

    #[error("session closed")]
    Closed,

    #[error("protocol violation: {0}")]
    Protocol(String),
}

/// The target branch no longer accepts writes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BranchStateError {
    #[error("branch {0} has been merged and is read-only")]
    Retired(BranchId),
}

/// Sync engine error
#[derive(Error, Debug)]
pub enum CollabError {
    #[error("causality: {0}")]
    Causality(#[from] RejectReason),

    #[error("session: {0}")]
    Session(#[from] SessionError),

    #[error("branch state: {0}")]
    BranchState(#[from] BranchStateError),

    /// A merge produced an inconsistent state. Always a bug.
    #[error("internal merge conflict: {0}")]
    MergeConflictInternal(String),

    #[error("persistence: {0}")]
    Persistence(String),

    #[error("serialization: {0}")]
    Serialization(String),

    #[error("edit out of bounds: index {index}, length {len}")]
    OutOfBounds { index: usize, len: usize },

    #[error("document actor for {0} is unavailable")]
    ActorUnavailable(DocumentKey),

    #[error("operation timed out")]
    Timeout,

    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
}

impl CollabError {
    /// Errors a caller can recover from by resyncing or reconnecting.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CollabError::Causality(RejectReason::UnknownDependency { .. })
                | CollabError::Session(_)
                | CollabError::ActorUnavailable(_)
                | CollabError::Timeout
        )
    }
}

impl From<serde_json::Error> for CollabError {
    fn from(err: serde_json::Error) -> Self {
        CollabError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for CollabError {
    fn from(err: std::io::Error) -> Self {
        CollabError::Persistence(err.to_string())
    }
}

/// Result type for sync engine operations
pub type CollabResult<T> = Result<T, CollabError>;
