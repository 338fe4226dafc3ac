//! Server side of one client connection.
//!
//! A [`ServerSession`] turns incoming [`SyncMessage`]s into calls on the
//! chapter's [`ActorHandle`] and returns the direct replies. Messages pushed by
//! the actor (other replicas' operations, awareness, retirement) arrive on the
//! outbox the session was created with; the transport writes both streams to
//! the same connection.

use crate::actor::ActorHandle;
use crate::registry::DocumentRegistry;
use crate::sync::SyncMessage;
use crate::{CollabError, CollabResult, DocumentKey, Operation, ReplicaId, SessionError, SessionId};
use serde::{Deserialize, Serialize};
use storyloom_log::{debug, info, warn};
use tokio::sync::mpsc;

/// Handshake progress of a server session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerSessionState {
    AwaitingHello,
    /// Attached; waiting for the client's state vector
    AwaitingVector,
    Live,
    Closed,
}

pub struct ServerSession {
    id: SessionId,
    key: DocumentKey,
    registry: DocumentRegistry,
    outbox: mpsc::Sender<SyncMessage>,
    actor: Option<ActorHandle>,
    replica: Option<ReplicaId>,
    state: ServerSessionState,
}

impl ServerSession {
    pub fn new(registry: DocumentRegistry, key: DocumentKey, outbox: mpsc::Sender<SyncMessage>) -> Self {
        Self {
            id: SessionId::new(),
            key,
            registry,
            outbox,
            actor: None,
            replica: None,
            state: ServerSessionState::AwaitingHello,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn key(&self) -> DocumentKey {
        self.key
    }

    /// Replica assigned at attach
    pub fn replica_id(&self) -> Option<ReplicaId> {
        self.replica
    }

    pub fn state(&self) -> ServerSessionState {
        self.state
    }

    /// Process one client message. Recoverable failures come back as
    /// [`SyncMessage::Error`] replies; an `Err` means the connection should close.
    pub async fn handle(&mut self, msg: SyncMessage) -> CollabResult<Vec<SyncMessage>> {
        if self.state == ServerSessionState::Closed {
            return Err(SessionError::Closed.into());
        }

        match self.dispatch(msg).await {
            Ok(replies) => Ok(replies),
            Err(err) => self.on_error(err),
        }
    }

    async fn dispatch(&mut self, msg: SyncMessage) -> CollabResult<Vec<SyncMessage>> {
        match msg {
            SyncMessage::Hello { replica_id } => self.hello(replica_id).await,
            _ if self.state == ServerSessionState::AwaitingHello => {
                Err(SessionError::NotAttached.into())
            }
            SyncMessage::StateVector { vector } => {
                let ops = self.actor()?.diff(vector).await?;
                self.state = ServerSessionState::Live;
                Ok(vec![SyncMessage::Delta { ops }])
            }
            SyncMessage::Delta { ops } => self.integrate_all(ops).await,
            SyncMessage::Op { op } => self.integrate_all(vec![op]).await,
            SyncMessage::Heartbeat => {
                self.actor()?.heartbeat(self.id).await?;
                Ok(vec![SyncMessage::Heartbeat])
            }
            SyncMessage::Awareness { presence } => {
                self.actor()?.awareness(self.id, presence).await?;
                Ok(Vec::new())
            }
            other => {
                debug!("session {}: ignoring client {} message", self.id, other.kind());
                Ok(Vec::new())
            }
        }
    }

    fn actor(&self) -> CollabResult<ActorHandle> {
        self.actor
            .clone()
            .ok_or_else(|| SessionError::NotAttached.into())
    }

    async fn hello(&mut self, requested: Option<ReplicaId>) -> CollabResult<Vec<SyncMessage>> {
        if self.state != ServerSessionState::AwaitingHello {
            return Err(SessionError::Protocol("hello after attach".to_string()).into());
        }

        let mut actor = self.registry.get_or_spawn(self.key).await?;
        let info = match actor.attach(self.id, requested, self.outbox.clone()).await {
            Err(CollabError::ActorUnavailable(_)) => {
                actor = self.registry.get_or_spawn(self.key).await?;
                actor.attach(self.id, requested, self.outbox.clone()).await?
            }
            other => other?,
        };

        info!(
            "session {} on {} attached as replica {}",
            self.id, self.key, info.replica_id
        );
        self.actor = Some(actor);
        self.replica = Some(info.replica_id);
        self.state = ServerSessionState::AwaitingVector;

        Ok(vec![
            SyncMessage::Hello {
                replica_id: Some(info.replica_id),
            },
            SyncMessage::StateVector {
                vector: info.vector,
            },
        ])
    }

    /// Integrate in order, acking the client's own operations. Stops at the
    /// first failure; operations after it are re-sent by the client's resync.
    async fn integrate_all(&mut self, ops: Vec<Operation>) -> CollabResult<Vec<SyncMessage>> {
        let actor = self.actor()?;
        let mut replies = Vec::new();
        for op in ops {
            let (replica, clock) = (op.replica_id, op.clock);
            match actor.integrate(self.id, op).await {
                Ok(_) => {
                    if Some(replica) == self.replica {
                        replies.push(SyncMessage::Ack { clock });
                    }
                }
                Err(err) => {
                    replies.extend(self.on_error(err)?);
                    break;
                }
            }
        }
        Ok(replies)
    }

    fn on_error(&mut self, err: CollabError) -> CollabResult<Vec<SyncMessage>> {
        match &err {
            CollabError::BranchState(_) => {
                self.state = ServerSessionState::Closed;
                Ok(vec![SyncMessage::Retired])
            }
            CollabError::Causality(_) | CollabError::OutOfBounds { .. } => {
                debug!("session {}: {}", self.id, err);
                Ok(vec![SyncMessage::error(&err)])
            }
            CollabError::Session(SessionError::NotAttached | SessionError::UnknownSession(_))
            | CollabError::ActorUnavailable(_)
            | CollabError::Timeout => {
                warn!("session {} lost its attachment: {}", self.id, err);
                self.actor = None;
                self.state = ServerSessionState::AwaitingHello;
                Ok(vec![SyncMessage::error(&err)])
            }
            _ => Err(err),
        }
    }

    /// Detach from the actor. Further messages are refused.
    pub async fn close(&mut self) {
        if let Some(actor) = self.actor.take()
            && let Err(err) = actor.detach(self.id).await
        {
            debug!("session {}: detach failed: {}", self.id, err);
        }
        self.state = ServerSessionState::Closed;
    }
}

impl std::fmt::Debug for ServerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSession")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("replica", &self.replica)
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryPersistence;
    use crate::sync::{SyncClient, SyncState};
    use crate::{BranchId, ChapterId, EngineConfig};
    use std::sync::Arc;

    struct Peer {
        client: SyncClient,
        session: ServerSession,
        rx: mpsc::Receiver<SyncMessage>,
    }

    impl Peer {
        async fn connect(registry: &DocumentRegistry, key: DocumentKey) -> Self {
            let (tx, rx) = mpsc::channel(64);
            let mut peer = Self {
                client: SyncClient::new(),
                session: ServerSession::new(registry.clone(), key, tx),
                rx,
            };
            let hello = peer.client.connect().unwrap();
            peer.send(vec![hello]).await;
            peer
        }

        /// Deliver client messages to the server and feed replies back until quiet.
        async fn send(&mut self, mut outgoing: Vec<SyncMessage>) {
            while !outgoing.is_empty() {
                let mut replies = Vec::new();
                for msg in outgoing {
                    replies.extend(self.session.handle(msg).await.unwrap());
                }
                outgoing = Vec::new();
                for reply in replies {
                    outgoing.extend(self.client.handle(reply).unwrap());
                }
            }
        }

        /// Drain broadcasts pushed by the actor.
        async fn pump(&mut self) {
            while let Ok(msg) = self.rx.try_recv() {
                let out = self.client.handle(msg).unwrap();
                self.send(out).await;
            }
        }
    }

    fn registry() -> DocumentRegistry {
        DocumentRegistry::new(Arc::new(InMemoryPersistence::new()), EngineConfig::default())
    }

    #[tokio::test]
    async fn test_handshake_over_session() {
        let registry = registry();
        let key = DocumentKey::new(BranchId::new(), ChapterId::new());
        registry.create_document(key, "Hello").await.unwrap();

        let peer = Peer::connect(&registry, key).await;
        assert_eq!(peer.session.state(), ServerSessionState::Live);
        assert_eq!(peer.client.state(), SyncState::Live);
        assert_eq!(peer.client.text(), "Hello");
        assert_eq!(peer.session.replica_id(), peer.client.replica_id());
    }

    #[tokio::test]
    async fn test_two_clients_converge() {
        let registry = registry();
        let key = DocumentKey::new(BranchId::new(), ChapterId::new());
        registry.create_document(key, "Hello").await.unwrap();

        let mut a = Peer::connect(&registry, key).await;
        let mut b = Peer::connect(&registry, key).await;

        let out = a.client.insert(5, "!").unwrap();
        a.send(out).await;
        let out = b.client.insert(5, " world").unwrap();
        b.send(out).await;

        a.pump().await;
        b.pump().await;

        assert_eq!(a.client.text(), b.client.text());
        assert_eq!(a.client.unacked(), 0);
        assert_eq!(b.client.unacked(), 0);
        let server = registry.get(&key).unwrap().view().await.unwrap();
        assert_eq!(server.text, a.client.text());
        assert_eq!(server.sessions, 2);
    }

    #[tokio::test]
    async fn test_messages_before_hello_are_refused() {
        let registry = registry();
        let key = DocumentKey::new(BranchId::new(), ChapterId::new());
        let (tx, _rx) = mpsc::channel(8);
        let mut session = ServerSession::new(registry, key, tx);

        let replies = session.handle(SyncMessage::Heartbeat).await.unwrap();
        assert!(matches!(
            replies.as_slice(),
            [SyncMessage::Error { code: crate::SyncErrorCode::NotAttached, .. }]
        ));
        assert_eq!(session.state(), ServerSessionState::AwaitingHello);
    }

    #[tokio::test]
    async fn test_unknown_dependency_reported_not_fatal() {
        let registry = registry();
        let key = DocumentKey::new(BranchId::new(), ChapterId::new());
        let mut peer = Peer::connect(&registry, key).await;

        let stranger = ReplicaId::new();
        let op = Operation {
            replica_id: stranger,
            clock: 2,
            kind: crate::OpKind::Insert {
                origin_left: None,
                origin_right: None,
                ch: 'x',
            },
        };
        let replies = peer.session.handle(SyncMessage::Op { op }).await.unwrap();
        assert!(matches!(
            replies.as_slice(),
            [SyncMessage::Error { code: crate::SyncErrorCode::UnknownDependency, .. }]
        ));
        assert_eq!(peer.session.state(), ServerSessionState::Live);
    }

    #[tokio::test]
    async fn test_retired_branch_closes_session() {
        let registry = registry();
        let branch = BranchId::new();
        let key = DocumentKey::new(branch, ChapterId::new());
        let mut peer = Peer::connect(&registry, key).await;

        registry.retire_branch(branch).await.unwrap();
        assert_eq!(peer.rx.recv().await, Some(SyncMessage::Retired));

        let out = SyncMessage::Op {
            op: Operation {
                replica_id: peer.client.replica_id().unwrap(),
                clock: 1,
                kind: crate::OpKind::Insert {
                    origin_left: None,
                    origin_right: None,
                    ch: 'z',
                },
            },
        };
        let replies = peer.session.handle(out).await.unwrap();
        assert_eq!(replies, vec![SyncMessage::Retired]);
        assert_eq!(peer.session.state(), ServerSessionState::Closed);
        assert!(peer.session.handle(SyncMessage::Heartbeat).await.is_err());
    }

    #[tokio::test]
    async fn test_close_detaches() {
        let registry = registry();
        let key = DocumentKey::new(BranchId::new(), ChapterId::new());
        let mut a = Peer::connect(&registry, key).await;
        let mut b = Peer::connect(&registry, key).await;

        a.session.close().await;
        assert_eq!(a.session.state(), ServerSessionState::Closed);
        let removed = b.rx.recv().await.unwrap();
        assert_eq!(
            removed,
            SyncMessage::AwarenessRemoved {
                replica_id: a.client.replica_id().unwrap()
            }
        );
        assert_eq!(registry.get(&key).unwrap().view().await.unwrap().sessions, 1);
    }
}
