//! Synchronization protocol for chapter documents
//!
//! Message types, the client-side session state machine and the buffer for
//! remote operations that arrive before their dependencies.
//!
//! Handshake, as seen from the client:
//!
//! ```text
//! client                                   server
//!   │ Hello{replica_id?}                     │
//!   │───────────────────────────────────────▶│  attach, assign/resume replica
//!   │              Hello{replica_id}, StateVector{server}
//!   │◀───────────────────────────────────────│
//!   │ StateVector{client}, Delta{offline ops}│
//!   │───────────────────────────────────────▶│  integrate, Ack each
//!   │                    Delta{missing ops}  │
//!   │◀───────────────────────────────────────│  client is Live
//!   │ Op / Ack / Awareness / Heartbeat  ...  │
//! ```

use crate::{
    CollabError, CollabResult, Integration, Operation, PresenceTable, RejectReason, ReplicaId,
    SessionError, StateVector, TextDocument, UserPresence,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use storyloom_log::{debug, warn};

/// Sync message types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncMessage {
    /// Client: request to attach, optionally resuming a replica.
    /// Server: the replica the client must use.
    Hello { replica_id: Option<ReplicaId> },
    StateVector { vector: StateVector },
    /// Operations the receiver is missing, in causal order
    Delta { ops: Vec<Operation> },
    Op { op: Operation },
    /// Every operation of the receiving replica up to `clock` is integrated
    Ack { clock: u64 },
    Heartbeat,
    Awareness { presence: UserPresence },
    AwarenessRemoved { replica_id: ReplicaId },
    Error { code: SyncErrorCode, message: String },
    /// The chapter's branch was merged; the document is read-only
    Retired,
}

impl SyncMessage {
    pub fn encode(&self) -> CollabResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> CollabResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn error(err: &CollabError) -> Self {
        SyncMessage::Error {
            code: SyncErrorCode::from_error(err),
            message: err.to_string(),
        }
    }

    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            SyncMessage::Hello { .. } => "hello",
            SyncMessage::StateVector { .. } => "state_vector",
            SyncMessage::Delta { .. } => "delta",
            SyncMessage::Op { .. } => "op",
            SyncMessage::Ack { .. } => "ack",
            SyncMessage::Heartbeat => "heartbeat",
            SyncMessage::Awareness { .. } => "awareness",
            SyncMessage::AwarenessRemoved { .. } => "awareness_removed",
            SyncMessage::Error { .. } => "error",
            SyncMessage::Retired => "retired",
        }
    }
}

/// Sync error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncErrorCode {
    /// Resync: an operation referenced something the server has not seen
    UnknownDependency,
    MalformedOperation,
    NotAttached,
    UnknownSession,
    Superseded,
    HeartbeatExpired,
    BranchMerged,
    ProtocolViolation,
    Unavailable,
    Internal,
}

impl SyncErrorCode {
    pub fn from_error(err: &CollabError) -> Self {
        match err {
            CollabError::Causality(RejectReason::UnknownDependency { .. }) => {
                SyncErrorCode::UnknownDependency
            }
            CollabError::Causality(RejectReason::Malformed { .. })
            | CollabError::OutOfBounds { .. } => SyncErrorCode::MalformedOperation,
            CollabError::Session(SessionError::NotAttached) => SyncErrorCode::NotAttached,
            CollabError::Session(SessionError::UnknownSession(_)) => SyncErrorCode::UnknownSession,
            CollabError::Session(SessionError::Superseded) => SyncErrorCode::Superseded,
            CollabError::Session(SessionError::HeartbeatExpired) => SyncErrorCode::HeartbeatExpired,
            CollabError::Session(_) | CollabError::Serialization(_) => {
                SyncErrorCode::ProtocolViolation
            }
            CollabError::BranchState(_) => SyncErrorCode::BranchMerged,
            CollabError::ActorUnavailable(_) | CollabError::Timeout => SyncErrorCode::Unavailable,
            CollabError::MergeConflictInternal(_)
            | CollabError::Persistence(_)
            | CollabError::Config(_) => SyncErrorCode::Internal,
        }
    }
}

/// Client session state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncState {
    /// No replica yet; waiting for the server's Hello
    Connecting,
    /// Exchanging state vectors and deltas
    Syncing,
    /// Handshake done; operations flow both ways
    Live,
    /// Connection lost; local edits continue offline
    Reconnecting,
    /// The document became read-only
    Closed,
}

/// A remote operation waiting for its dependencies
#[derive(Debug, Clone)]
pub struct PendingOp {
    pub op: Operation,
    pub received_at: DateTime<Utc>,
}

/// Operation buffer for handling out-of-order operations
#[derive(Debug)]
pub struct OperationBuffer {
    pending: BTreeMap<crate::ItemId, PendingOp>,
    max_size: usize,
}

impl Default for OperationBuffer {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl OperationBuffer {
    pub fn new(max_size: usize) -> Self {
        Self {
            pending: BTreeMap::new(),
            max_size,
        }
    }

    /// Hold an operation. Returns false when it is already held or the buffer
    /// is full; either way the caller should resync.
    pub fn add(&mut self, op: Operation) -> bool {
        if self.pending.len() >= self.max_size || self.pending.contains_key(&op.id()) {
            return false;
        }
        self.pending.insert(
            op.id(),
            PendingOp {
                op,
                received_at: Utc::now(),
            },
        );
        true
    }

    /// Integrate every held operation whose dependencies are now present.
    pub fn drain_ready(&mut self, doc: &mut TextDocument) -> Vec<Operation> {
        if self.pending.is_empty() {
            return Vec::new();
        }
        let held: Vec<Operation> = std::mem::take(&mut self.pending)
            .into_values()
            .map(|p| p.op)
            .collect();
        let absorbed = doc.absorb(&held);
        for op in absorbed.unresolved {
            self.add(op);
        }
        absorbed.applied
    }

    /// Drop held operations that `vector` already covers.
    pub fn gc(&mut self, vector: &StateVector) {
        self.pending.retain(|id, _| !vector.contains(id));
    }

    pub fn oldest(&self) -> Option<DateTime<Utc>> {
        self.pending.values().map(|p| p.received_at).min()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

/// Sync statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncStats {
    pub messages_received: u64,
    pub messages_sent: u64,
    /// Remote operations integrated
    pub operations_synced: u64,
    /// Local operations produced
    pub local_operations: u64,
    /// Handshakes completed, including the first
    pub syncs: u64,
    /// Resyncs triggered by missing dependencies
    pub resyncs: u64,
    pub last_sync: Option<DateTime<Utc>>,
}

/// Client side of one chapter sync session.
///
/// Transport-agnostic: feed it every message from the server through
/// [`handle`](Self::handle) and send whatever it returns.
pub struct SyncClient {
    state: SyncState,
    resume: Option<ReplicaId>,
    doc: Option<TextDocument>,
    /// Local operations not yet acknowledged, in clock order
    outbox: VecDeque<Operation>,
    /// Highest local clock handed to the transport since the last handshake
    sent_through: u64,
    buffer: OperationBuffer,
    peers: PresenceTable,
    presence: Option<UserPresence>,
    stats: SyncStats,
}

impl Default for SyncClient {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncClient {
    pub fn new() -> Self {
        Self {
            state: SyncState::Connecting,
            resume: None,
            doc: None,
            outbox: VecDeque::new(),
            sent_through: 0,
            buffer: OperationBuffer::default(),
            peers: PresenceTable::new(),
            presence: None,
            stats: SyncStats::default(),
        }
    }

    /// A client that asks to resume `replica` on its first Hello.
    pub fn resume(replica: ReplicaId) -> Self {
        Self {
            resume: Some(replica),
            ..Self::new()
        }
    }

    pub fn with_buffer_limit(mut self, max_pending: usize) -> Self {
        self.buffer = OperationBuffer::new(max_pending);
        self
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn replica_id(&self) -> Option<ReplicaId> {
        self.doc.as_ref().map(TextDocument::replica_id).or(self.resume)
    }

    pub fn document(&self) -> Option<&TextDocument> {
        self.doc.as_ref()
    }

    pub fn text(&self) -> String {
        self.doc.as_ref().map(TextDocument::text).unwrap_or_default()
    }

    /// Local operations the server has not acknowledged.
    pub fn unacked(&self) -> usize {
        self.outbox.len()
    }

    /// Remote operations waiting for dependencies.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn peers(&self) -> &PresenceTable {
        &self.peers
    }

    pub fn stats(&self) -> &SyncStats {
        &self.stats
    }

    /// Opening message for a new connection. Re-entering after a drop keeps
    /// the document and outbox; the handshake resends whatever the server lacks.
    pub fn connect(&mut self) -> CollabResult<SyncMessage> {
        if self.state == SyncState::Closed {
            return Err(SessionError::Closed.into());
        }
        if self.doc.is_none() {
            self.state = SyncState::Connecting;
        }
        self.stats.messages_sent += 1;
        Ok(SyncMessage::Hello {
            replica_id: self.replica_id(),
        })
    }

    /// The transport dropped.
    pub fn disconnected(&mut self) {
        self.peers.clear();
        self.state = match (self.state, &self.doc) {
            (SyncState::Closed, _) => SyncState::Closed,
            (_, Some(_)) => SyncState::Reconnecting,
            (_, None) => SyncState::Connecting,
        };
    }

    pub fn heartbeat(&mut self) -> Option<SyncMessage> {
        match self.state {
            SyncState::Syncing | SyncState::Live => {
                self.stats.messages_sent += 1;
                Some(SyncMessage::Heartbeat)
            }
            _ => None,
        }
    }

    /// Publish this client's presence. Sent immediately when live, otherwise
    /// once the handshake completes.
    pub fn set_presence(&mut self, presence: UserPresence) -> Option<SyncMessage> {
        self.presence = Some(presence.clone());
        (self.state == SyncState::Live).then_some(SyncMessage::Awareness { presence })
    }

    fn doc_mut(&mut self) -> CollabResult<&mut TextDocument> {
        match (self.state, self.doc.as_mut()) {
            (SyncState::Closed, _) => Err(SessionError::Closed.into()),
            (SyncState::Connecting, _) | (_, None) => Err(SessionError::NotAttached.into()),
            (_, Some(doc)) => Ok(doc),
        }
    }

    /// Insert text locally. Returns the messages to send now; while not live
    /// the operations wait in the outbox for the next handshake.
    pub fn insert(&mut self, index: usize, text: &str) -> CollabResult<Vec<SyncMessage>> {
        let ops = self.doc_mut()?.insert(index, text)?;
        Ok(self.queue_local(ops))
    }

    pub fn delete(&mut self, index: usize, count: usize) -> CollabResult<Vec<SyncMessage>> {
        let ops = self.doc_mut()?.delete(index, count)?;
        Ok(self.queue_local(ops))
    }

    pub fn replace_text(&mut self, text: &str) -> CollabResult<Vec<SyncMessage>> {
        let ops = self.doc_mut()?.replace_text(text)?;
        Ok(self.queue_local(ops))
    }

    fn queue_local(&mut self, ops: Vec<Operation>) -> Vec<SyncMessage> {
        self.stats.local_operations += ops.len() as u64;
        self.outbox.extend(ops.iter().cloned());
        if self.state != SyncState::Live {
            return Vec::new();
        }
        if let Some(last) = ops.last() {
            self.sent_through = last.clock;
        }
        self.stats.messages_sent += ops.len() as u64;
        ops.into_iter().map(|op| SyncMessage::Op { op }).collect()
    }

    /// Process one message from the server and return the replies.
    pub fn handle(&mut self, msg: SyncMessage) -> CollabResult<Vec<SyncMessage>> {
        self.stats.messages_received += 1;
        let replies = match msg {
            SyncMessage::Hello {
                replica_id: Some(assigned),
            } => self.on_hello(assigned)?,
            SyncMessage::Hello { replica_id: None } => {
                return Err(SessionError::Protocol("server hello without replica".into()).into());
            }
            SyncMessage::StateVector { vector } => self.on_server_vector(&vector)?,
            SyncMessage::Delta { ops } => self.on_remote(ops, true)?,
            SyncMessage::Op { op } => self.on_remote(vec![op], false)?,
            SyncMessage::Ack { clock } => {
                self.outbox.retain(|op| op.clock > clock);
                Vec::new()
            }
            SyncMessage::Heartbeat => Vec::new(),
            SyncMessage::Awareness { presence } => {
                if Some(presence.replica_id) != self.replica_id() {
                    self.peers.update(presence);
                }
                Vec::new()
            }
            SyncMessage::AwarenessRemoved { replica_id } => {
                self.peers.remove(&replica_id);
                Vec::new()
            }
            SyncMessage::Error { code, message } => self.on_error(code, message)?,
            SyncMessage::Retired => {
                debug!("document retired; closing session");
                self.state = SyncState::Closed;
                self.peers.clear();
                Vec::new()
            }
        };
        self.stats.messages_sent += replies.len() as u64;
        Ok(replies)
    }

    fn on_hello(&mut self, assigned: ReplicaId) -> CollabResult<Vec<SyncMessage>> {
        if !matches!(self.state, SyncState::Connecting | SyncState::Reconnecting) {
            return Err(SessionError::Protocol("unexpected hello".into()).into());
        }

        match &self.doc {
            Some(doc) if doc.replica_id() == assigned => {}
            Some(doc) => {
                warn!(
                    "server did not resume replica {} (assigned {}); discarding {} unsynced operations",
                    doc.replica_id(),
                    assigned,
                    self.outbox.len()
                );
                self.outbox.clear();
                self.buffer.clear();
                self.doc = Some(TextDocument::new(assigned));
            }
            None => self.doc = Some(TextDocument::new(assigned)),
        }

        self.resume = Some(assigned);
        self.state = SyncState::Syncing;
        Ok(Vec::new())
    }

    fn on_server_vector(&mut self, server: &StateVector) -> CollabResult<Vec<SyncMessage>> {
        let Some(doc) = self.doc.as_ref() else {
            return Err(SessionError::NotAttached.into());
        };

        // Anything the server already has was integrated before the drop.
        self.outbox.retain(|op| !server.contains(&op.id()));
        let missing = doc.diff(server);
        self.sent_through = doc.vector().get(&doc.replica_id());

        let mut replies = vec![SyncMessage::StateVector {
            vector: doc.vector().clone(),
        }];
        if !missing.is_empty() {
            replies.push(SyncMessage::Delta { ops: missing });
        }
        Ok(replies)
    }

    fn on_remote(&mut self, ops: Vec<Operation>, is_delta: bool) -> CollabResult<Vec<SyncMessage>> {
        match self.state {
            SyncState::Closed => return Err(SessionError::NotAttached.into()),
            // Broadcasts can overtake the hello; the handshake delta covers them.
            SyncState::Connecting | SyncState::Reconnecting => {
                debug!("dropping {} operations received before hello", ops.len());
                return Ok(Vec::new());
            }
            SyncState::Syncing | SyncState::Live => {}
        }
        let Some(doc) = self.doc.as_mut() else {
            return Err(SessionError::NotAttached.into());
        };

        let mut blocked = false;
        for op in ops {
            match doc.apply_remote(&op) {
                Ok(Integration::Applied) => self.stats.operations_synced += 1,
                Ok(Integration::Duplicate) => {}
                Err(RejectReason::UnknownDependency { op: id, missing }) => {
                    debug!("holding {} until {} arrives", id, missing);
                    self.buffer.add(op);
                    blocked = true;
                }
                Err(reason) => warn!("ignoring remote operation: {}", reason),
            }
        }
        self.stats.operations_synced += self.buffer.drain_ready(doc).len() as u64;
        self.buffer.gc(doc.vector());

        let mut replies = Vec::new();
        if is_delta && self.state != SyncState::Live {
            self.state = SyncState::Live;
            self.stats.syncs += 1;
            self.stats.last_sync = Some(Utc::now());

            let sent_through = self.sent_through;
            replies.extend(
                self.outbox
                    .iter()
                    .filter(|op| op.clock > sent_through)
                    .cloned()
                    .map(|op| SyncMessage::Op { op }),
            );
            if let Some(last) = self.outbox.back() {
                self.sent_through = self.sent_through.max(last.clock);
            }
            if let Some(presence) = &self.presence {
                replies.push(SyncMessage::Awareness {
                    presence: presence.clone(),
                });
            }
        } else if blocked && self.state == SyncState::Live && !self.buffer.is_empty() {
            self.stats.resyncs += 1;
            replies.push(SyncMessage::StateVector {
                vector: doc.vector().clone(),
            });
        }
        Ok(replies)
    }

    fn on_error(&mut self, code: SyncErrorCode, message: String) -> CollabResult<Vec<SyncMessage>> {
        warn!("server error {:?}: {}", code, message);
        match code {
            SyncErrorCode::UnknownDependency => {
                let Some(doc) = self.doc.as_ref() else {
                    return Err(SessionError::NotAttached.into());
                };
                self.stats.resyncs += 1;
                Ok(vec![SyncMessage::StateVector {
                    vector: doc.vector().clone(),
                }])
            }
            SyncErrorCode::BranchMerged => {
                self.state = SyncState::Closed;
                Ok(Vec::new())
            }
            SyncErrorCode::NotAttached
            | SyncErrorCode::UnknownSession
            | SyncErrorCode::Superseded
            | SyncErrorCode::HeartbeatExpired
            | SyncErrorCode::Unavailable => {
                self.disconnected();
                let err = match code {
                    SyncErrorCode::Superseded => SessionError::Superseded,
                    SyncErrorCode::HeartbeatExpired => SessionError::HeartbeatExpired,
                    _ => SessionError::NotAttached,
                };
                Err(err.into())
            }
            _ => Err(SessionError::Protocol(message).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::OpKind;

    fn r(n: u128) -> ReplicaId {
        ReplicaId::from_u128(n)
    }

    /// Drive a client through the handshake against a server document.
    fn attach(client: &mut SyncClient, server: &mut TextDocument, replica: ReplicaId) {
        client.connect().unwrap();
        client
            .handle(SyncMessage::Hello {
                replica_id: Some(replica),
            })
            .unwrap();
        let replies = client
            .handle(SyncMessage::StateVector {
                vector: server.vector().clone(),
            })
            .unwrap();
        let mut client_vector = StateVector::new();
        for reply in replies {
            match reply {
                SyncMessage::StateVector { vector } => client_vector = vector,
                SyncMessage::Delta { ops } => {
                    server.absorb(&ops);
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        client
            .handle(SyncMessage::Delta {
                ops: server.diff(&client_vector),
            })
            .unwrap();
    }

    #[test]
    fn test_message_wire_format() {
        let msg = SyncMessage::Ack { clock: 4 };
        let json = msg.encode().unwrap();
        assert_eq!(json, r#"{"type":"ack","clock":4}"#);
        assert_eq!(SyncMessage::decode(&json).unwrap(), msg);

        let hello = SyncMessage::decode(r#"{"type":"hello","replica_id":null}"#).unwrap();
        assert_eq!(hello, SyncMessage::Hello { replica_id: None });
        assert!(SyncMessage::decode(r#"{"type":"bogus"}"#).is_err());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            SyncErrorCode::from_error(&SessionError::Superseded.into()),
            SyncErrorCode::Superseded
        );
        assert_eq!(
            SyncErrorCode::from_error(&CollabError::Timeout),
            SyncErrorCode::Unavailable
        );
    }

    #[test]
    fn test_edits_before_attach_fail() {
        let mut client = SyncClient::new();
        assert_eq!(client.state(), SyncState::Connecting);
        assert!(matches!(
            client.insert(0, "x"),
            Err(CollabError::Session(SessionError::NotAttached))
        ));
    }

    #[test]
    fn test_handshake_reaches_live() {
        let mut server = TextDocument::with_text(r(9), "Once").unwrap();
        let mut client = SyncClient::new();
        attach(&mut client, &mut server, r(1));

        assert_eq!(client.state(), SyncState::Live);
        assert_eq!(client.text(), "Once");
        assert_eq!(client.replica_id(), Some(r(1)));
        assert_eq!(client.stats().syncs, 1);
    }

    #[test]
    fn test_broadcast_before_hello_is_covered_by_delta() {
        let mut server = TextDocument::with_text(r(9), "Once").unwrap();
        let mut client = SyncClient::new();
        client.connect().unwrap();

        // Another session's edit reaches this connection ahead of its hello.
        let early = server.insert(4, "!").unwrap().remove(0);
        assert!(client.handle(SyncMessage::Op { op: early }).unwrap().is_empty());
        assert_eq!(client.state(), SyncState::Connecting);

        client
            .handle(SyncMessage::Hello {
                replica_id: Some(r(1)),
            })
            .unwrap();
        client
            .handle(SyncMessage::StateVector {
                vector: server.vector().clone(),
            })
            .unwrap();
        client
            .handle(SyncMessage::Delta {
                ops: server.diff(&StateVector::new()),
            })
            .unwrap();
        assert_eq!(client.state(), SyncState::Live);
        assert_eq!(client.text(), "Once!");
    }

    #[test]
    fn test_live_edit_and_ack() {
        let mut server = TextDocument::new(r(9));
        let mut client = SyncClient::new();
        attach(&mut client, &mut server, r(1));

        let msgs = client.insert(0, "hi").unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(client.unacked(), 2);

        client.handle(SyncMessage::Ack { clock: 1 }).unwrap();
        assert_eq!(client.unacked(), 1);
        client.handle(SyncMessage::Ack { clock: 2 }).unwrap();
        assert_eq!(client.unacked(), 0);
    }

    #[test]
    fn test_offline_edits_resent_on_reconnect() {
        let mut server = TextDocument::with_text(r(9), "ab").unwrap();
        let mut client = SyncClient::new();
        attach(&mut client, &mut server, r(1));

        client.disconnected();
        assert_eq!(client.state(), SyncState::Reconnecting);
        assert!(client.insert(2, "c").unwrap().is_empty());
        assert_eq!(client.unacked(), 1);

        // resume the same replica
        match client.connect().unwrap() {
            SyncMessage::Hello { replica_id } => assert_eq!(replica_id, Some(r(1))),
            other => panic!("unexpected {:?}", other),
        }
        attach_resumed(&mut client, &mut server);
        assert_eq!(server.text(), "abc");
        assert_eq!(client.state(), SyncState::Live);

        // a second resync is idempotent
        client.disconnected();
        client.connect().unwrap();
        attach_resumed(&mut client, &mut server);
        assert_eq!(server.text(), "abc");
        assert_eq!(server.operations().len(), 3);
    }

    fn attach_resumed(client: &mut SyncClient, server: &mut TextDocument) {
        let replica = client.replica_id().unwrap();
        client
            .handle(SyncMessage::Hello {
                replica_id: Some(replica),
            })
            .unwrap();
        let replies = client
            .handle(SyncMessage::StateVector {
                vector: server.vector().clone(),
            })
            .unwrap();
        let mut client_vector = StateVector::new();
        for reply in replies {
            match reply {
                SyncMessage::StateVector { vector } => client_vector = vector,
                SyncMessage::Delta { ops } => {
                    assert!(server.absorb(&ops).unresolved.is_empty());
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        client
            .handle(SyncMessage::Delta {
                ops: server.diff(&client_vector),
            })
            .unwrap();
    }

    #[test]
    fn test_edits_during_handshake_flushed_when_live() {
        let mut server = TextDocument::new(r(9));
        let mut client = SyncClient::new();
        client.connect().unwrap();
        client
            .handle(SyncMessage::Hello {
                replica_id: Some(r(1)),
            })
            .unwrap();
        client
            .handle(SyncMessage::StateVector {
                vector: server.vector().clone(),
            })
            .unwrap();
        assert_eq!(client.state(), SyncState::Syncing);

        assert!(client.insert(0, "x").unwrap().is_empty());
        let replies = client.handle(SyncMessage::Delta { ops: vec![] }).unwrap();
        assert_eq!(client.state(), SyncState::Live);
        assert_eq!(replies.len(), 1);
        let SyncMessage::Op { op } = &replies[0] else {
            panic!("expected op");
        };
        server.apply_remote(op).unwrap();
        assert_eq!(server.text(), "x");
    }

    #[test]
    fn test_unknown_dependency_buffers_and_resyncs() {
        let mut server = TextDocument::new(r(9));
        let mut client = SyncClient::new();
        attach(&mut client, &mut server, r(1));

        let mut other = TextDocument::new(r(2));
        let ops = other.insert(0, "xy").unwrap();

        let replies = client.handle(SyncMessage::Op { op: ops[1].clone() }).unwrap();
        assert_eq!(client.buffered(), 1);
        assert!(matches!(replies.as_slice(), [SyncMessage::StateVector { .. }]));
        assert_eq!(client.stats().resyncs, 1);

        client.handle(SyncMessage::Delta { ops: ops.clone() }).unwrap();
        assert_eq!(client.buffered(), 0);
        assert_eq!(client.text(), "xy");
    }

    #[test]
    fn test_refused_resume_discards_local_state() {
        let mut client = SyncClient::resume(r(5));
        client.connect().unwrap();
        client
            .handle(SyncMessage::Hello {
                replica_id: Some(r(6)),
            })
            .unwrap();
        assert_eq!(client.replica_id(), Some(r(6)));
        assert_eq!(client.state(), SyncState::Syncing);
    }

    #[test]
    fn test_retired_closes_session() {
        let mut server = TextDocument::new(r(9));
        let mut client = SyncClient::new();
        attach(&mut client, &mut server, r(1));

        client.handle(SyncMessage::Retired).unwrap();
        assert_eq!(client.state(), SyncState::Closed);
        assert!(matches!(
            client.insert(0, "x"),
            Err(CollabError::Session(SessionError::Closed))
        ));
        assert!(client.connect().is_err());
    }

    #[test]
    fn test_session_errors_move_to_reconnecting() {
        let mut server = TextDocument::new(r(9));
        let mut client = SyncClient::new();
        attach(&mut client, &mut server, r(1));

        let result = client.handle(SyncMessage::Error {
            code: SyncErrorCode::HeartbeatExpired,
            message: "late".into(),
        });
        assert!(matches!(
            result,
            Err(CollabError::Session(SessionError::HeartbeatExpired))
        ));
        assert_eq!(client.state(), SyncState::Reconnecting);
    }

    #[test]
    fn test_awareness_tracks_peers() {
        let mut server = TextDocument::new(r(9));
        let mut client = SyncClient::new();
        attach(&mut client, &mut server, r(1));

        let peer = UserPresence::new(r(2), "u2", "Grace");
        client
            .handle(SyncMessage::Awareness {
                presence: peer.clone(),
            })
            .unwrap();
        client
            .handle(SyncMessage::Awareness {
                presence: UserPresence::new(r(1), "u1", "Me"),
            })
            .unwrap();
        assert_eq!(client.peers().len(), 1);

        client
            .handle(SyncMessage::AwarenessRemoved { replica_id: r(2) })
            .unwrap();
        assert!(client.peers().is_empty());
    }

    #[test]
    fn test_operation_buffer() {
        let mut source = TextDocument::new(r(2));
        let ops = source.insert(0, "abc").unwrap();
        let mut doc = TextDocument::new(r(1));
        let mut buffer = OperationBuffer::new(2);

        assert!(buffer.add(ops[2].clone()));
        assert!(!buffer.add(ops[2].clone()));
        assert!(buffer.add(ops[1].clone()));
        assert!(!buffer.add(ops[0].clone()), "buffer is full");
        assert!(buffer.oldest().is_some());

        assert!(buffer.drain_ready(&mut doc).is_empty());
        doc.apply_remote(&ops[0]).unwrap();
        assert_eq!(buffer.drain_ready(&mut doc).len(), 2);
        assert!(buffer.is_empty());
        assert_eq!(doc.text(), "abc");
    }

    #[test]
    fn test_buffer_gc() {
        let op = Operation {
            replica_id: r(3),
            clock: 1,
            kind: OpKind::Insert {
                origin_left: None,
                origin_right: None,
                ch: 'z',
            },
        };
        let mut buffer = OperationBuffer::new(10);
        buffer.add(op);
        let mut vector = StateVector::new();
        vector.observe(r(3), 1);
        buffer.gc(&vector);
        assert!(buffer.is_empty());
    }
}
