//! Sync server.

use crate::config::{SyncServerBuilder, SyncServerConfig};
use crate::connection::{ConnectionWriter, SyncConnection};
use crate::error::{SyncServerError, SyncServerResult};
use crate::resolver::{DocumentResolver, RegistryResolver};
use crate::route::parse_sync_path;
use futures_util::{SinkExt, StreamExt};
use http::StatusCode;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use storyloom_collab::{DocumentKey, DocumentRegistry, ServerSession, SyncErrorCode, SyncMessage};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::accept_hdr_async;
use tungstenite::Message;
use tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tungstenite::protocol::CloseFrame;
use tungstenite::protocol::frame::coding::CloseCode;

/// Serves `/sync/{branch_id}/{chapter_id}` connections, one
/// [`ServerSession`] each.
#[derive(Clone)]
pub struct SyncServer {
    config: SyncServerConfig,
    registry: DocumentRegistry,
    resolver: Arc<dyn DocumentResolver>,
}

impl SyncServer {
    /// Create a server that only accepts documents known to `registry`.
    pub fn new(config: SyncServerConfig, registry: DocumentRegistry) -> Self {
        let resolver = Arc::new(RegistryResolver::new(registry.clone()));
        Self {
            config,
            registry,
            resolver,
        }
    }

    /// Create a builder for the server configuration.
    pub fn builder() -> SyncServerBuilder {
        SyncServerBuilder::new()
    }

    /// Replace the document resolver.
    pub fn with_resolver(mut self, resolver: impl DocumentResolver) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    /// Get the server configuration.
    pub fn config(&self) -> &SyncServerConfig {
        &self.config
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> SyncServerResult<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> SyncServerResult<()> {
        self.serve_with_shutdown(listener, std::future::pending()).await
    }

    /// Serve until `shutdown` resolves. Connections already open keep running.
    pub async fn serve_with_shutdown(
        &self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> SyncServerResult<()> {
        let local = listener.local_addr()?;
        tracing::info!(addr = %local, "Sync server listening");
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!(addr = %local, "Sync server stopping");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let server = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = server.handle_connection(stream, addr).await {
                                tracing::warn!(addr = %addr, error = %e, "Sync connection error");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to accept connection");
                    }
                },
            }
        }
    }

    /// Handle a single connection.
    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> SyncServerResult<()> {
        let mut route: Option<SyncServerResult<DocumentKey>> = None;
        let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            let parsed = parse_sync_path(request.uri().path());
            let rejected = parsed.is_err();
            route = Some(parsed);
            if rejected {
                let mut error = ErrorResponse::new(Some("expected /sync/{branch_id}/{chapter_id}".to_string()));
                *error.status_mut() = StatusCode::NOT_FOUND;
                return Err(error);
            }
            Ok(response)
        };

        let handshake = accept_hdr_async(stream, callback).await;
        let key = match route {
            Some(Err(e)) => return Err(e),
            Some(Ok(key)) => key,
            None => return Err(SyncServerError::ConnectionClosed),
        };
        let ws_stream = handshake?;

        let (mut write, read) = ws_stream.split();

        if !self.resolver.exists(&key).await? {
            tracing::debug!(addr = %addr, key = %key, "Rejecting unknown document");
            let err = SyncServerError::UnknownDocument(key);
            let refusal = SyncMessage::Error {
                code: SyncErrorCode::ProtocolViolation,
                message: err.to_string(),
            };
            write.send(Message::text(refusal.encode()?)).await?;
            let frame = CloseFrame {
                code: CloseCode::Policy,
                reason: "unknown document".to_string().into(),
            };
            let _ = write.send(Message::Close(Some(frame))).await;
            let _ = write.close().await;
            return Err(err);
        }

        let (tx, rx) = mpsc::channel(self.config.session_buffer);
        let session = ServerSession::new(self.registry.clone(), key, tx.clone());
        tracing::debug!(
            session_id = %session.id(),
            addr = %addr,
            key = %key,
            "Sync connection established"
        );

        let (close_tx, close_rx) = oneshot::channel();
        let writer = ConnectionWriter::new(write, rx, close_rx);
        SyncConnection::new(session, tx, addr, self.config.clone())
            .run(read, writer, close_tx)
            .await
    }
}

impl std::fmt::Debug for SyncServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncServer")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}
