//! Top-level error type.

use storyloom_branch::{BranchError, MergeError};
use storyloom_collab::CollabError;
use storyloom_config::ConfigError;
use thiserror::Error;

/// Any failure surfaced by [`Engine`](crate::Engine).
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Collab(#[from] CollabError),

    #[error(transparent)]
    Branch(#[from] BranchError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[cfg(feature = "websocket")]
    #[error(transparent)]
    Sync(#[from] storyloom_websocket::SyncServerError),
}

pub type Result<T> = std::result::Result<T, Error>;
