//! Document actor: the single owner of one chapter's live state.
//!
//! Every mutating call for a chapter goes through the actor's mailbox and is
//! processed one at a time, in arrival order. Accepted operations are
//! appended to the persistence log and pushed to every other attached
//! session. Snapshots are written every `snapshot_every_ops` operations, on
//! the housekeeping tick when older than `snapshot_interval`, on last detach
//! and before the actor stops. Routine snapshots are written by a spawned
//! task so persistence retries never hold up the mailbox; until a write is
//! acknowledged the actor keeps the operations it covers and will not evict.

use crate::persistence::{DocumentSnapshot, PersistedDocument, PersistenceAdapter};
use crate::sync::SyncMessage;
use crate::text::{Absorbed, Integration, TextDocument};
use crate::{
    BranchStateError, CollabError, CollabResult, DocumentKey, EngineConfig, Operation, ReplicaId,
    SessionError, SessionId, StateVector, UserPresence,
};
use bytes::Bytes;
use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use storyloom_log::{debug, error, info, trace, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Returned to a session on attach.
#[derive(Debug, Clone)]
pub struct AttachInfo {
    pub session_id: SessionId,
    /// Replica the session must use; differs from the requested one when
    /// resumption was refused.
    pub replica_id: ReplicaId,
    /// Current document state, for callers that bootstrap without a delta
    pub snapshot: Bytes,
    pub vector: StateVector,
}

/// Read-only view of a live document.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentView {
    pub text: String,
    pub word_count: usize,
    pub vector: StateVector,
    pub sessions: usize,
    pub retired: bool,
}

enum Command {
    Attach {
        session_id: SessionId,
        requested: Option<ReplicaId>,
        outbox: mpsc::Sender<SyncMessage>,
        reply: oneshot::Sender<CollabResult<AttachInfo>>,
    },
    Detach {
        session_id: SessionId,
        reply: oneshot::Sender<()>,
    },
    Integrate {
        session_id: SessionId,
        op: Operation,
        reply: oneshot::Sender<CollabResult<Integration>>,
    },
    Diff {
        vector: StateVector,
        reply: oneshot::Sender<Vec<Operation>>,
    },
    Snapshot {
        reply: oneshot::Sender<CollabResult<DocumentSnapshot>>,
    },
    View {
        reply: oneshot::Sender<DocumentView>,
    },
    Absorb {
        ops: Vec<Operation>,
        reply: oneshot::Sender<CollabResult<Absorbed>>,
    },
    ReplaceText {
        text: String,
        reply: oneshot::Sender<CollabResult<DocumentView>>,
    },
    Awareness {
        session_id: SessionId,
        presence: UserPresence,
    },
    Heartbeat {
        session_id: SessionId,
        reply: oneshot::Sender<CollabResult<()>>,
    },
    Retire {
        reply: oneshot::Sender<()>,
    },
    Reopen {
        reply: oneshot::Sender<()>,
    },
    Flush {
        reply: oneshot::Sender<CollabResult<()>>,
    },
    Shutdown {
        flush: bool,
        reply: oneshot::Sender<CollabResult<()>>,
    },
}

/// Cloneable address of a running [`DocumentActor`].
#[derive(Clone)]
pub struct ActorHandle {
    key: DocumentKey,
    tx: mpsc::Sender<Command>,
    timeout: Duration,
}

impl std::fmt::Debug for ActorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorHandle")
            .field("key", &self.key)
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl ActorHandle {
    pub fn key(&self) -> DocumentKey {
        self.key
    }

    /// The actor has stopped accepting commands.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Same actor, different per-call deadline.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            timeout,
            ..self.clone()
        }
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> CollabResult<T> {
        let (reply, rx) = oneshot::channel();
        let key = self.key;
        let exchange = async {
            self.tx
                .send(make(reply))
                .await
                .map_err(|_| CollabError::ActorUnavailable(key))?;
            rx.await.map_err(|_| CollabError::ActorUnavailable(key))
        };
        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| CollabError::Timeout)?
    }

    pub async fn attach(
        &self,
        session_id: SessionId,
        requested: Option<ReplicaId>,
        outbox: mpsc::Sender<SyncMessage>,
    ) -> CollabResult<AttachInfo> {
        self.call(|reply| Command::Attach {
            session_id,
            requested,
            outbox,
            reply,
        })
        .await?
    }

    pub async fn detach(&self, session_id: SessionId) -> CollabResult<()> {
        self.call(|reply| Command::Detach { session_id, reply }).await
    }

    pub async fn integrate(&self, session_id: SessionId, op: Operation) -> CollabResult<Integration> {
        self.call(|reply| Command::Integrate {
            session_id,
            op,
            reply,
        })
        .await?
    }

    /// Operations a peer at `vector` is missing.
    pub async fn diff(&self, vector: StateVector) -> CollabResult<Vec<Operation>> {
        self.call(|reply| Command::Diff { vector, reply }).await
    }

    pub async fn snapshot(&self) -> CollabResult<DocumentSnapshot> {
        self.call(|reply| Command::Snapshot { reply }).await?
    }

    pub async fn view(&self) -> CollabResult<DocumentView> {
        self.call(|reply| Command::View { reply }).await
    }

    /// Integrate a batch from another branch and push it to every session.
    pub async fn absorb(&self, ops: Vec<Operation>) -> CollabResult<Absorbed> {
        self.call(|reply| Command::Absorb { ops, reply }).await?
    }

    /// Turn the document into `text`, authored by the actor's own replica.
    pub async fn replace_text(&self, text: impl Into<String>) -> CollabResult<DocumentView> {
        let text = text.into();
        self.call(|reply| Command::ReplaceText { text, reply }).await?
    }

    /// Relay a presence update. Fire and forget.
    pub async fn awareness(&self, session_id: SessionId, presence: UserPresence) -> CollabResult<()> {
        self.tx
            .send(Command::Awareness {
                session_id,
                presence,
            })
            .await
            .map_err(|_| CollabError::ActorUnavailable(self.key))
    }

    pub async fn heartbeat(&self, session_id: SessionId) -> CollabResult<()> {
        self.call(|reply| Command::Heartbeat { session_id, reply })
            .await?
    }

    /// Make the document read-only and detach every session.
    pub async fn retire(&self) -> CollabResult<()> {
        self.call(|reply| Command::Retire { reply }).await
    }

    /// Accept writes again after [`retire`](Self::retire).
    pub async fn reopen(&self) -> CollabResult<()> {
        self.call(|reply| Command::Reopen { reply }).await
    }

    /// Persist a snapshot now.
    pub async fn flush(&self) -> CollabResult<()> {
        self.call(|reply| Command::Flush { reply }).await?
    }

    /// Stop the actor. Without `flush` nothing more is written, which is what
    /// deleting a chapter needs. With `flush` the actor keeps running if the
    /// final snapshot cannot be saved.
    pub async fn shutdown(&self, flush: bool) -> CollabResult<()> {
        self.call(|reply| Command::Shutdown { flush, reply }).await?
    }
}

struct AttachedSession {
    replica: ReplicaId,
    outbox: mpsc::Sender<SyncMessage>,
    last_seen: Instant,
    presence: Option<UserPresence>,
}

enum Next {
    Continue,
    Stop { flush: bool },
}

enum Event {
    Command(Option<Command>),
    Tick,
    Written(CollabResult<()>),
}

/// Snapshot write running off the actor task.
struct PendingWrite {
    done: oneshot::Receiver<CollabResult<()>>,
    /// `since_snapshot` when the snapshot was taken
    ops: u64,
    /// Leading entries of `unlogged` the snapshot covers
    unlogged: usize,
    replicas: bool,
}

async fn pending_write(writing: &mut Option<PendingWrite>) -> CollabResult<()> {
    match writing {
        Some(write) => (&mut write.done)
            .await
            .unwrap_or_else(|_| Err(CollabError::Persistence("snapshot writer stopped".into()))),
        None => std::future::pending().await,
    }
}

/// Authoritative state of one chapter document.
pub struct DocumentActor {
    key: DocumentKey,
    doc: TextDocument,
    sessions: HashMap<SessionId, AttachedSession>,
    /// Replicas handed out for this document; only these may be resumed
    issued: BTreeSet<ReplicaId>,
    retired: bool,
    persistence: Arc<dyn PersistenceAdapter>,
    config: EngineConfig,
    /// Integrated but not yet in the persistence log; covered by the next snapshot
    unlogged: Vec<Operation>,
    since_snapshot: u64,
    /// Issued replicas not yet in a saved snapshot
    replicas_dirty: bool,
    writing: Option<PendingWrite>,
    /// Another snapshot was asked for while one was being written
    snapshot_due: bool,
    last_snapshot: Instant,
    idle_since: Option<Instant>,
}

impl DocumentActor {
    /// Rebuild from persisted state: snapshot first, then the logged operations.
    pub fn restore(
        key: DocumentKey,
        persisted: PersistedDocument,
        persistence: Arc<dyn PersistenceAdapter>,
        config: EngineConfig,
        retired: bool,
    ) -> CollabResult<Self> {
        let replica = ReplicaId::new();
        let (mut doc, issued) = match &persisted.snapshot {
            Some(snapshot) => (
                TextDocument::from_snapshot(replica, &snapshot.crdt_bytes)?,
                snapshot.replicas.iter().copied().collect(),
            ),
            None => (TextDocument::new(replica), BTreeSet::new()),
        };

        let replayed = doc.absorb(&persisted.ops);
        if !replayed.unresolved.is_empty() {
            error!(
                "document {}: {} logged operations could not be replayed",
                key,
                replayed.unresolved.len()
            );
        }

        let now = Instant::now();
        Ok(Self {
            key,
            doc,
            sessions: HashMap::new(),
            issued,
            retired,
            persistence,
            config,
            unlogged: Vec::new(),
            since_snapshot: replayed.applied.len() as u64,
            replicas_dirty: false,
            writing: None,
            snapshot_due: false,
            last_snapshot: now,
            idle_since: Some(now),
        })
    }

    /// Start the actor task.
    pub fn spawn(self) -> (ActorHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(self.config.command_queue);
        let handle = ActorHandle {
            key: self.key,
            tx,
            timeout: self.config.call_timeout,
        };
        let join = tokio::spawn(self.run(rx));
        (handle, join)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        info!(
            "document actor {} started ({} chars, {} ops)",
            self.key,
            self.doc.len(),
            self.doc.operations().len()
        );

        let mut tick = tokio::time::interval(self.config.actor_tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick.tick().await;

        let flush = loop {
            let event = tokio::select! {
                cmd = rx.recv() => Event::Command(cmd),
                _ = tick.tick() => Event::Tick,
                result = pending_write(&mut self.writing) => Event::Written(result),
            };
            let next = match event {
                Event::Command(Some(cmd)) => self.handle(cmd).await,
                Event::Command(None) => Next::Stop { flush: true },
                Event::Tick => self.on_tick().await,
                Event::Written(result) => {
                    let _ = self.finish_write(result);
                    if self.snapshot_due {
                        self.request_snapshot();
                    }
                    Next::Continue
                }
            };
            if let Next::Stop { flush } = next {
                break flush;
            }
        };

        // Persist before closing the mailbox so a replacement actor loads
        // complete state; commands still queued are dropped and their callers
        // see ActorUnavailable.
        if flush && let Err(err) = self.flush_now().await {
            error!(
                "document {}: final snapshot failed, {} operations not persisted: {}",
                self.key,
                self.since_snapshot,
                err
            );
        }
        rx.close();
        while rx.try_recv().is_ok() {}

        info!("document actor {} stopped", self.key);
    }

    async fn handle(&mut self, cmd: Command) -> Next {
        match cmd {
            Command::Attach {
                session_id,
                requested,
                outbox,
                reply,
            } => {
                let result = self.attach(session_id, requested, outbox).await;
                let _ = reply.send(result);
            }
            Command::Detach { session_id, reply } => {
                self.detach(session_id).await;
                let _ = reply.send(());
            }
            Command::Integrate {
                session_id,
                op,
                reply,
            } => {
                let result = self.integrate(session_id, op).await;
                let _ = reply.send(result);
            }
            Command::Diff { vector, reply } => {
                let _ = reply.send(self.doc.diff(&vector));
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.build_snapshot());
            }
            Command::View { reply } => {
                let _ = reply.send(self.view());
            }
            Command::Absorb { ops, reply } => {
                let result = self.absorb(ops).await;
                let _ = reply.send(result);
            }
            Command::ReplaceText { text, reply } => {
                let result = self.replace_text(&text).await;
                let _ = reply.send(result);
            }
            Command::Awareness {
                session_id,
                presence,
            } => self.relay_awareness(session_id, presence),
            Command::Heartbeat { session_id, reply } => {
                let result = match self.sessions.get_mut(&session_id) {
                    Some(session) => {
                        session.last_seen = Instant::now();
                        Ok(())
                    }
                    None => Err(SessionError::UnknownSession(session_id).into()),
                };
                let _ = reply.send(result);
            }
            Command::Retire { reply } => {
                self.retire().await;
                let _ = reply.send(());
            }
            Command::Reopen { reply } => {
                if self.retired {
                    info!("document {} reopened", self.key);
                }
                self.retired = false;
                let _ = reply.send(());
            }
            Command::Flush { reply } => {
                let _ = reply.send(self.flush_now().await);
            }
            Command::Shutdown { flush, reply } => {
                if flush && let Err(err) = self.flush_now().await {
                    warn!("document {}: not stopping with unsaved state: {}", self.key, err);
                    let _ = reply.send(Err(err));
                    return Next::Continue;
                }
                // A write still running must not land after the caller deletes the document.
                self.settle().await;
                self.close_sessions(SyncMessage::Retired);
                let _ = reply.send(Ok(()));
                return Next::Stop { flush: false };
            }
        }
        Next::Continue
    }

    fn retired_error(&self) -> CollabError {
        BranchStateError::Retired(self.key.branch_id).into()
    }

    fn issue_replica(&mut self) -> ReplicaId {
        loop {
            let replica = ReplicaId::new();
            if self.doc.vector().get(&replica) == 0 && self.issued.insert(replica) {
                self.replicas_dirty = true;
                return replica;
            }
        }
    }

    async fn attach(
        &mut self,
        session_id: SessionId,
        requested: Option<ReplicaId>,
        outbox: mpsc::Sender<SyncMessage>,
    ) -> CollabResult<AttachInfo> {
        if self.retired {
            return Err(self.retired_error());
        }

        let (replica, fresh) = match requested {
            Some(replica) if self.issued.contains(&replica) => (replica, false),
            Some(replica) => {
                debug!(
                    "document {}: replica {} was not issued here; assigning a new one",
                    self.key, replica
                );
                (self.issue_replica(), true)
            }
            None => (self.issue_replica(), true),
        };

        let superseded: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.replica == replica)
            .map(|(id, _)| *id)
            .collect();
        for id in superseded {
            if let Some(old) = self.sessions.remove(&id) {
                debug!("document {}: session {} superseded", self.key, id);
                let _ = old
                    .outbox
                    .try_send(SyncMessage::error(&SessionError::Superseded.into()));
            }
        }

        for presence in self.sessions.values().filter_map(|s| s.presence.clone()) {
            let _ = outbox.try_send(SyncMessage::Awareness { presence });
        }

        self.sessions.insert(
            session_id,
            AttachedSession {
                replica,
                outbox,
                last_seen: Instant::now(),
                presence: None,
            },
        );
        self.idle_since = None;

        if fresh {
            // The issued set must survive a restart or the replica could not resume.
            if let Err(err) = self.flush_now().await {
                warn!("document {}: could not persist issued replica: {}", self.key, err);
            }
        }

        info!(
            "document {}: session {} attached as {} ({} sessions)",
            self.key,
            session_id,
            replica,
            self.sessions.len()
        );

        Ok(AttachInfo {
            session_id,
            replica_id: replica,
            snapshot: self.doc.snapshot()?,
            vector: self.doc.vector().clone(),
        })
    }

    async fn detach(&mut self, session_id: SessionId) {
        let Some(session) = self.sessions.remove(&session_id) else {
            return;
        };
        debug!("document {}: session {} detached", self.key, session_id);
        self.broadcast(
            SyncMessage::AwarenessRemoved {
                replica_id: session.replica,
            },
            None,
        );
        self.became_idle().await;
    }

    async fn became_idle(&mut self) {
        if !self.sessions.is_empty() {
            return;
        }
        self.idle_since = Some(Instant::now());
        self.request_snapshot();
    }

    async fn integrate(&mut self, session_id: SessionId, op: Operation) -> CollabResult<Integration> {
        if self.retired {
            return Err(self.retired_error());
        }
        let Some(session) = self.sessions.get_mut(&session_id) else {
            return Err(SessionError::UnknownSession(session_id).into());
        };
        session.last_seen = Instant::now();

        match self.doc.apply_remote(&op) {
            Ok(Integration::Applied) => {
                trace!("document {}: integrated {}", self.key, op.id());
                self.accepted(vec![op], Some(session_id)).await;
                Ok(Integration::Applied)
            }
            Ok(Integration::Duplicate) => Ok(Integration::Duplicate),
            Err(reason) => {
                debug!("document {}: rejected {}: {}", self.key, op.id(), reason);
                Err(reason.into())
            }
        }
    }

    async fn absorb(&mut self, ops: Vec<Operation>) -> CollabResult<Absorbed> {
        if self.retired {
            return Err(self.retired_error());
        }
        let absorbed = self.doc.absorb(&ops);
        if !absorbed.unresolved.is_empty() {
            error!(
                "document {}: {} merged operations have missing dependencies",
                self.key,
                absorbed.unresolved.len()
            );
        }
        if !absorbed.applied.is_empty() {
            self.accepted(absorbed.applied.clone(), None).await;
            self.request_snapshot();
        }
        Ok(absorbed)
    }

    async fn replace_text(&mut self, text: &str) -> CollabResult<DocumentView> {
        if self.retired {
            return Err(self.retired_error());
        }
        let ops = self.doc.replace_text(text)?;
        if !ops.is_empty() {
            self.accepted(ops, None).await;
        }
        Ok(self.view())
    }

    /// Log, broadcast and count newly integrated operations.
    async fn accepted(&mut self, ops: Vec<Operation>, origin: Option<SessionId>) {
        for op in &ops {
            self.log_op(op).await;
        }
        self.since_snapshot += ops.len() as u64;

        let message = match <[Operation; 1]>::try_from(ops) {
            Ok([op]) => SyncMessage::Op { op },
            Err(ops) => SyncMessage::Delta { ops },
        };
        self.broadcast(message, origin);

        if self.since_snapshot >= self.config.snapshot_every_ops {
            self.request_snapshot();
        }
    }

    async fn log_op(&mut self, op: &Operation) {
        // Once an append failed, later ones wait for the next snapshot to keep the log gap-free.
        if !self.unlogged.is_empty() {
            self.unlogged.push(op.clone());
            return;
        }
        if let Err(err) = self.persistence.append_op(&self.key, op).await {
            warn!("document {}: op log append failed: {}", self.key, err);
            self.unlogged.push(op.clone());
        }
    }

    /// Send to every session except `except`. Sessions whose buffer is full or
    /// whose transport is gone are detached; they resync on reconnect.
    fn broadcast(&mut self, message: SyncMessage, except: Option<SessionId>) {
        let mut dropped = Vec::new();
        for (id, session) in &self.sessions {
            if Some(*id) == except {
                continue;
            }
            match session.outbox.try_send(message.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("document {}: session {} is lagging; detaching", self.key, id);
                    dropped.push(*id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dropped.push(*id),
            }
        }
        for id in dropped {
            self.sessions.remove(&id);
        }
    }

    fn relay_awareness(&mut self, session_id: SessionId, mut presence: UserPresence) {
        if self.retired {
            return;
        }
        let Some(session) = self.sessions.get_mut(&session_id) else {
            return;
        };
        presence.replica_id = session.replica;
        presence.touch();
        session.last_seen = Instant::now();
        session.presence = Some(presence.clone());
        self.broadcast(SyncMessage::Awareness { presence }, Some(session_id));
    }

    fn close_sessions(&mut self, farewell: SyncMessage) {
        for (_, session) in self.sessions.drain() {
            let _ = session.outbox.try_send(farewell.clone());
        }
        self.idle_since = Some(Instant::now());
    }

    async fn retire(&mut self) {
        if self.retired {
            return;
        }
        self.retired = true;
        info!("document {} retired", self.key);
        self.close_sessions(SyncMessage::Retired);
        self.request_snapshot();
    }

    async fn on_tick(&mut self) -> Next {
        let now = Instant::now();

        let expired: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, s)| now.duration_since(s.last_seen) > self.config.heartbeat_window)
            .map(|(id, _)| *id)
            .collect();
        if !expired.is_empty() {
            for id in expired {
                if let Some(session) = self.sessions.remove(&id) {
                    warn!("document {}: session {} missed its heartbeat", self.key, id);
                    let _ = session
                        .outbox
                        .try_send(SyncMessage::error(&SessionError::HeartbeatExpired.into()));
                    self.broadcast(
                        SyncMessage::AwarenessRemoved {
                            replica_id: session.replica,
                        },
                        None,
                    );
                }
            }
            self.became_idle().await;
        }

        if self.dirty()
            && self.writing.is_none()
            && now.duration_since(self.last_snapshot) >= self.config.snapshot_interval
        {
            self.request_snapshot();
        }

        match self.idle_since {
            Some(since) if self.sessions.is_empty() && now.duration_since(since) >= self.config.idle_grace => {
                match self.flush_now().await {
                    Ok(()) => {
                        info!("document {} idle; evicting", self.key);
                        Next::Stop { flush: false }
                    }
                    Err(err) => {
                        warn!(
                            "document {}: idle but {} operations unsaved; staying resident: {}",
                            self.key, self.since_snapshot, err
                        );
                        Next::Continue
                    }
                }
            }
            _ => Next::Continue,
        }
    }

    fn build_snapshot(&self) -> CollabResult<DocumentSnapshot> {
        Ok(DocumentSnapshot {
            branch_id: self.key.branch_id,
            chapter_id: self.key.chapter_id,
            crdt_bytes: self.doc.snapshot()?,
            state_vector: self.doc.vector().clone(),
            replicas: self.issued.iter().copied().collect(),
            saved_at: Utc::now(),
        })
    }

    fn dirty(&self) -> bool {
        self.since_snapshot > 0 || !self.unlogged.is_empty() || self.replicas_dirty
    }

    /// Start a background snapshot, or queue one behind the write in progress.
    fn request_snapshot(&mut self) {
        if self.writing.is_some() {
            self.snapshot_due = true;
            return;
        }
        if let Err(err) = self.start_write() {
            error!("document {}: could not encode snapshot: {}", self.key, err);
        }
    }

    fn start_write(&mut self) -> CollabResult<()> {
        let snapshot = self.build_snapshot()?;
        let persistence = Arc::clone(&self.persistence);
        let retry = self.config.retry.clone();
        let (tx, done) = oneshot::channel();
        tokio::spawn(async move {
            let result = retry
                .run("snapshot", move || {
                    let persistence = Arc::clone(&persistence);
                    let snapshot = snapshot.clone();
                    async move { persistence.save_snapshot(&snapshot).await }
                })
                .await;
            let _ = tx.send(result);
        });

        self.writing = Some(PendingWrite {
            done,
            ops: self.since_snapshot,
            unlogged: self.unlogged.len(),
            replicas: std::mem::take(&mut self.replicas_dirty),
        });
        self.snapshot_due = false;
        Ok(())
    }

    /// Account for a finished write. Nothing is forgotten unless it was saved.
    fn finish_write(&mut self, result: CollabResult<()>) -> CollabResult<()> {
        let Some(write) = self.writing.take() else {
            return result;
        };
        match &result {
            Ok(()) => {
                self.since_snapshot = self.since_snapshot.saturating_sub(write.ops);
                let covered = write.unlogged.min(self.unlogged.len());
                self.unlogged.drain(..covered);
                self.last_snapshot = Instant::now();
                debug!("document {}: snapshot saved", self.key);
            }
            Err(err) => {
                self.replicas_dirty |= write.replicas;
                warn!(
                    "document {}: snapshot failed, keeping {} operations in memory: {}",
                    self.key, self.since_snapshot, err
                );
            }
        }
        result
    }

    /// Wait for the write in progress, if any.
    async fn settle(&mut self) {
        if self.writing.is_some() {
            let result = pending_write(&mut self.writing).await;
            let _ = self.finish_write(result);
        }
    }

    /// Write a snapshot of the current state and wait for it.
    async fn flush_now(&mut self) -> CollabResult<()> {
        self.settle().await;
        self.start_write()?;
        let result = pending_write(&mut self.writing).await;
        self.finish_write(result)
    }

    fn view(&self) -> DocumentView {
        DocumentView {
            text: self.doc.text(),
            word_count: self.doc.word_count(),
            vector: self.doc.vector().clone(),
            sessions: self.sessions.len(),
            retired: self.retired,
        }
    }
}
