//! One sync connection: a reader loop feeding the session and a writer task
//! draining its outbox.

use crate::config::SyncServerConfig;
use crate::error::{SyncServerError, SyncServerResult};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use storyloom_collab::{ServerSession, ServerSessionState, SyncErrorCode, SyncMessage};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::WebSocketStream;
use tungstenite::Message;
use tungstenite::protocol::CloseFrame;
use tungstenite::protocol::frame::coding::CloseCode;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsStream = SplitStream<WebSocketStream<TcpStream>>;

fn close_frame(code: CloseCode, reason: &str) -> CloseFrame {
    CloseFrame {
        code,
        reason: reason.to_string().into(),
    }
}

/// Messages after which the server ends the connection.
fn terminal_close(message: &SyncMessage) -> Option<CloseFrame> {
    match message {
        SyncMessage::Retired => Some(close_frame(CloseCode::Normal, "branch merged")),
        SyncMessage::Error {
            code: SyncErrorCode::Superseded,
            ..
        } => Some(close_frame(CloseCode::Policy, "superseded")),
        SyncMessage::Error {
            code: SyncErrorCode::HeartbeatExpired,
            ..
        } => Some(close_frame(CloseCode::Away, "heartbeat expired")),
        _ => None,
    }
}

/// Writes the session outbox to the socket as JSON text frames.
pub(crate) struct ConnectionWriter {
    sink: WsSink,
    rx: mpsc::Receiver<SyncMessage>,
    shutdown: oneshot::Receiver<CloseFrame>,
}

impl ConnectionWriter {
    pub fn new(sink: WsSink, rx: mpsc::Receiver<SyncMessage>, shutdown: oneshot::Receiver<CloseFrame>) -> Self {
        Self { sink, rx, shutdown }
    }

    async fn write(&mut self, message: SyncMessage) -> SyncServerResult<Option<CloseFrame>> {
        let close = terminal_close(&message);
        let text = message.encode()?;
        self.sink.send(Message::text(text)).await?;
        Ok(close)
    }

    /// Run until the reader asks to close, a terminal message was written, or
    /// every outbox sender is gone.
    pub async fn run(mut self) -> SyncServerResult<()> {
        let close = loop {
            tokio::select! {
                frame = &mut self.shutdown => {
                    // Flush what is already queued (direct replies) before closing.
                    let mut close = frame.ok();
                    while let Ok(message) = self.rx.try_recv() {
                        if let Some(terminal) = self.write(message).await? {
                            close = Some(terminal);
                            break;
                        }
                    }
                    break close;
                }
                message = self.rx.recv() => match message {
                    Some(message) => {
                        if let Some(close) = self.write(message).await? {
                            break Some(close);
                        }
                    }
                    None => break None,
                },
            }
        };

        let _ = self.sink.send(Message::Close(close)).await;
        let _ = self.sink.close().await;
        Ok(())
    }
}

/// Why the reader loop ended.
enum Exit {
    ClientClosed,
    Idle,
    Writer,
    Session,
    Fatal(SyncServerError),
}

/// Reader side of one connection.
pub(crate) struct SyncConnection {
    session: ServerSession,
    outbox: mpsc::Sender<SyncMessage>,
    addr: SocketAddr,
    config: SyncServerConfig,
}

impl SyncConnection {
    pub fn new(
        session: ServerSession,
        outbox: mpsc::Sender<SyncMessage>,
        addr: SocketAddr,
        config: SyncServerConfig,
    ) -> Self {
        Self {
            session,
            outbox,
            addr,
            config,
        }
    }

    /// Drive the connection to completion. The session is detached on every exit path.
    pub async fn run(mut self, mut read: WsStream, writer: ConnectionWriter, close_tx: oneshot::Sender<CloseFrame>) -> SyncServerResult<()> {
        let session_id = self.session.id();
        let mut writer: JoinHandle<SyncServerResult<()>> = tokio::spawn(writer.run());
        let mut writer_done = false;

        let exit = loop {
            tokio::select! {
                result = &mut writer, if !writer_done => {
                    writer_done = true;
                    match result {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => tracing::debug!(session_id = %session_id, error = %e, "Writer failed"),
                        Err(e) => tracing::error!(session_id = %session_id, error = %e, "Writer task panicked"),
                    }
                    break Exit::Writer;
                }
                frame = tokio::time::timeout(self.config.read_idle_timeout, read.next()) => {
                    let frame = match frame {
                        Err(_) => break Exit::Idle,
                        Ok(None) => break Exit::ClientClosed,
                        Ok(Some(Err(e))) => break Exit::Fatal(e.into()),
                        Ok(Some(Ok(frame))) => frame,
                    };
                    match self.on_frame(frame).await {
                        Ok(None) => {}
                        Ok(Some(exit)) => break exit,
                        Err(e) => break Exit::Fatal(e),
                    }
                }
            }
        };

        self.session.close().await;

        let (close, result) = match exit {
            Exit::ClientClosed => (close_frame(CloseCode::Normal, ""), Ok(())),
            Exit::Idle => {
                tracing::debug!(session_id = %session_id, addr = %self.addr, "Read idle timeout");
                (close_frame(CloseCode::Away, "idle"), Ok(()))
            }
            Exit::Writer | Exit::Session => (close_frame(CloseCode::Normal, ""), Ok(())),
            Exit::Fatal(e) => (close_frame(CloseCode::Error, "internal error"), Err(e)),
        };

        drop(self.outbox);
        if !writer_done {
            let _ = close_tx.send(close);
            let _ = writer.await;
        }

        tracing::debug!(session_id = %session_id, addr = %self.addr, "Sync connection closed");
        result
    }

    async fn reply(&self, messages: Vec<SyncMessage>) -> SyncServerResult<()> {
        for message in messages {
            self.outbox
                .send(message)
                .await
                .map_err(|_| SyncServerError::ConnectionClosed)?;
        }
        Ok(())
    }

    async fn on_frame(&mut self, frame: Message) -> SyncServerResult<Option<Exit>> {
        let text = match frame {
            Message::Text(text) => text,
            Message::Close(_) => return Ok(Some(Exit::ClientClosed)),
            Message::Binary(_) => {
                self.reply(vec![SyncMessage::Error {
                    code: SyncErrorCode::ProtocolViolation,
                    message: "binary frames are not supported".to_string(),
                }])
                .await?;
                return Ok(None);
            }
            // Pings are answered by tungstenite.
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => return Ok(None),
        };

        if text.len() > self.config.max_message_size {
            tracing::warn!(
                session_id = %self.session.id(),
                size = text.len(),
                limit = self.config.max_message_size,
                "Frame too large"
            );
            self.reply(vec![SyncMessage::Error {
                code: SyncErrorCode::ProtocolViolation,
                message: format!("frame exceeds {} bytes", self.config.max_message_size),
            }])
            .await?;
            return Ok(Some(Exit::Session));
        }

        let message = match SyncMessage::decode(text.as_str()) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(session_id = %self.session.id(), error = %e, "Undecodable frame");
                self.reply(vec![SyncMessage::error(&e)]).await?;
                return Ok(None);
            }
        };

        tracing::trace!(session_id = %self.session.id(), kind = message.kind(), "Frame received");
        match self.session.handle(message).await {
            Ok(replies) => {
                self.reply(replies).await?;
                if self.session.state() == ServerSessionState::Closed {
                    return Ok(Some(Exit::Session));
                }
                Ok(None)
            }
            Err(e) => {
                tracing::warn!(session_id = %self.session.id(), error = %e, "Session failed");
                self.reply(vec![SyncMessage::error(&e)]).await?;
                Ok(Some(Exit::Session))
            }
        }
    }
}
