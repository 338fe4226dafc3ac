//! # Storyloom WebSocket
//!
//! Persistent per-chapter sync connections over WebSocket using tokio-tungstenite.
//!
//! A client opens `/sync/{branch_id}/{chapter_id}` and speaks the
//! [`SyncMessage`](storyloom_collab::SyncMessage) protocol as JSON text frames.
//! Each connection owns one [`ServerSession`](storyloom_collab::ServerSession);
//! direct replies and the actor's broadcasts share a bounded outbox that a
//! writer task drains to the socket.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use storyloom_collab::{DocumentRegistry, EngineConfig, InMemoryPersistence};
//! use storyloom_websocket::{SyncServer, SyncServerConfig};
//!
//! # async fn run() -> storyloom_websocket::SyncServerResult<()> {
//! let registry = DocumentRegistry::new(Arc::new(InMemoryPersistence::new()), EngineConfig::default());
//! let config = SyncServer::builder().bind("127.0.0.1:9001")?.build()?;
//! SyncServer::new(config, registry).run().await
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

mod config;
mod connection;
mod error;
mod resolver;
mod route;
mod server;

pub use config::{SyncServerBuilder, SyncServerConfig};
pub use error::{SyncServerError, SyncServerResult};
pub use resolver::{AcceptAll, DocumentResolver, RegistryResolver};
pub use route::{SYNC_PATH_PREFIX, parse_sync_path, sync_path};
pub use server::SyncServer;

// Re-export commonly used types from tungstenite
pub use tungstenite::Message as RawMessage;
pub use tungstenite::protocol::CloseFrame;
