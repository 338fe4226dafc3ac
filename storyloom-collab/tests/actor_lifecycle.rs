//! Document actor behaviour against persistence and session churn.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use storyloom_collab::{
    BranchId, ChapterId, CollabError, CollabResult, DocumentKey, DocumentRegistry, DocumentSnapshot,
    EngineConfig, InMemoryPersistence, OpKind, Operation, PersistedDocument, PersistenceAdapter,
    ReplicaId, RetryPolicy, SessionError, SessionId, SyncErrorCode, SyncMessage, UserPresence,
};
use tokio::sync::mpsc;

fn key() -> DocumentKey {
    DocumentKey::new(BranchId::new(), ChapterId::new())
}

fn insert(replica: ReplicaId, clock: u64, ch: char) -> Operation {
    Operation {
        replica_id: replica,
        clock,
        kind: OpKind::Insert {
            origin_left: (clock > 1).then(|| storyloom_collab::ItemId::new(replica, clock - 1)),
            origin_right: None,
            ch,
        },
    }
}

#[tokio::test]
async fn restart_replays_snapshot_and_log() {
    let store = InMemoryPersistence::new();
    let key = key();
    let config = EngineConfig {
        snapshot_every_ops: 1_000,
        ..EngineConfig::default()
    };

    let first = DocumentRegistry::new(Arc::new(store.clone()), config.clone());
    let actor = first.get_or_spawn(key).await.unwrap();
    let (tx, _rx) = mpsc::channel(16);
    let session = SessionId::new();
    let info = actor.attach(session, None, tx).await.unwrap();

    for (i, ch) in "draft".chars().enumerate() {
        actor
            .integrate(session, insert(info.replica_id, i as u64 + 1, ch))
            .await
            .unwrap();
    }
    assert_eq!(store.log_len(&key), 5);

    // A second process sharing the store sees snapshot + log.
    let second = DocumentRegistry::new(Arc::new(store.clone()), config);
    let restored = second.get_or_spawn(key).await.unwrap();
    let view = restored.view().await.unwrap();
    assert_eq!(view.text, "draft");
    assert_eq!(view.vector.get(&info.replica_id), 5);
}

#[tokio::test]
async fn issued_replica_resumes_unknown_one_does_not() {
    let store = InMemoryPersistence::new();
    let registry = DocumentRegistry::new(Arc::new(store.clone()), EngineConfig::default());
    let key = key();
    let actor = registry.get_or_spawn(key).await.unwrap();

    let (tx, _rx) = mpsc::channel(16);
    let first = actor.attach(SessionId::new(), None, tx).await.unwrap();
    assert!(store.snapshot_of(&key).unwrap().replicas.contains(&first.replica_id));

    let (tx, _rx2) = mpsc::channel(16);
    let resumed = actor
        .attach(SessionId::new(), Some(first.replica_id), tx)
        .await
        .unwrap();
    assert_eq!(resumed.replica_id, first.replica_id);

    let stranger = ReplicaId::new();
    let (tx, _rx3) = mpsc::channel(16);
    let fresh = actor.attach(SessionId::new(), Some(stranger), tx).await.unwrap();
    assert_ne!(fresh.replica_id, stranger);
}

#[tokio::test]
async fn newer_attach_supersedes_older_session() {
    let registry = DocumentRegistry::new(Arc::new(InMemoryPersistence::new()), EngineConfig::default());
    let actor = registry.get_or_spawn(key()).await.unwrap();

    let (old_tx, mut old_rx) = mpsc::channel(16);
    let old = SessionId::new();
    let info = actor.attach(old, None, old_tx).await.unwrap();

    let (new_tx, _new_rx) = mpsc::channel(16);
    actor
        .attach(SessionId::new(), Some(info.replica_id), new_tx)
        .await
        .unwrap();

    match old_rx.recv().await {
        Some(SyncMessage::Error { code, .. }) => assert_eq!(code, SyncErrorCode::Superseded),
        other => panic!("expected superseded error, got {other:?}"),
    }
    let err = actor
        .integrate(old, insert(info.replica_id, 1, 'x'))
        .await
        .unwrap_err();
    assert!(matches!(err, CollabError::Session(SessionError::UnknownSession(_))));
}

#[tokio::test]
async fn operations_fan_out_to_other_sessions_only() {
    let registry = DocumentRegistry::new(Arc::new(InMemoryPersistence::new()), EngineConfig::default());
    let actor = registry.get_or_spawn(key()).await.unwrap();

    let (a_tx, mut a_rx) = mpsc::channel(16);
    let (b_tx, mut b_rx) = mpsc::channel(16);
    let a = SessionId::new();
    let b = SessionId::new();
    let a_info = actor.attach(a, None, a_tx).await.unwrap();
    actor.attach(b, None, b_tx).await.unwrap();

    let op = insert(a_info.replica_id, 1, 'h');
    actor.integrate(a, op.clone()).await.unwrap();

    assert_eq!(b_rx.recv().await, Some(SyncMessage::Op { op }));
    assert!(a_rx.try_recv().is_err());

    let presence = UserPresence::new(ReplicaId::new(), "u-1", "Ada");
    actor.awareness(a, presence).await.unwrap();
    match b_rx.recv().await {
        Some(SyncMessage::Awareness { presence }) => {
            assert_eq!(presence.replica_id, a_info.replica_id);
            assert_eq!(presence.name, "Ada");
        }
        other => panic!("expected awareness, got {other:?}"),
    }
}

#[tokio::test]
async fn lagging_session_is_detached() {
    let registry = DocumentRegistry::new(Arc::new(InMemoryPersistence::new()), EngineConfig::default());
    let actor = registry.get_or_spawn(key()).await.unwrap();

    let (writer_tx, _writer_rx) = mpsc::channel(16);
    let (slow_tx, _slow_rx) = mpsc::channel(1);
    let writer = SessionId::new();
    let slow = SessionId::new();
    let info = actor.attach(writer, None, writer_tx).await.unwrap();
    actor.attach(slow, None, slow_tx).await.unwrap();

    actor.integrate(writer, insert(info.replica_id, 1, 'a')).await.unwrap();
    actor.integrate(writer, insert(info.replica_id, 2, 'b')).await.unwrap();

    assert_eq!(actor.view().await.unwrap().sessions, 1);
    assert!(matches!(
        actor.heartbeat(slow).await,
        Err(CollabError::Session(SessionError::UnknownSession(_)))
    ));
}

#[tokio::test(start_paused = true)]
async fn silent_session_is_reaped() {
    let registry = DocumentRegistry::new(Arc::new(InMemoryPersistence::new()), EngineConfig::default());
    let actor = registry.get_or_spawn(key()).await.unwrap();

    let (quiet_tx, mut quiet_rx) = mpsc::channel(16);
    let (chatty_tx, _chatty_rx) = mpsc::channel(16);
    let quiet = SessionId::new();
    let chatty = SessionId::new();
    actor.attach(quiet, None, quiet_tx).await.unwrap();
    actor.attach(chatty, None, chatty_tx).await.unwrap();

    for _ in 0..5 {
        tokio::time::sleep(Duration::from_secs(10)).await;
        actor.heartbeat(chatty).await.unwrap();
    }

    match quiet_rx.recv().await {
        Some(SyncMessage::Error { code, .. }) => assert_eq!(code, SyncErrorCode::HeartbeatExpired),
        other => panic!("expected heartbeat expiry, got {other:?}"),
    }
    assert_eq!(actor.view().await.unwrap().sessions, 1);
}

/// Store whose op log and snapshots can be switched off or slowed down.
#[derive(Clone, Default)]
struct FlakyStore {
    inner: InMemoryPersistence,
    log_down: Arc<AtomicBool>,
    snapshots_down: Arc<AtomicBool>,
    slow_snapshots: Arc<AtomicBool>,
}

impl FlakyStore {
    fn outage(&self, down: bool) {
        self.log_down.store(down, Ordering::SeqCst);
        self.snapshots_down.store(down, Ordering::SeqCst);
    }
}

#[async_trait]
impl PersistenceAdapter for FlakyStore {
    async fn load(&self, key: &DocumentKey) -> CollabResult<PersistedDocument> {
        self.inner.load(key).await
    }

    async fn append_op(&self, key: &DocumentKey, op: &Operation) -> CollabResult<()> {
        if self.log_down.load(Ordering::SeqCst) {
            return Err(CollabError::Persistence("log unavailable".into()));
        }
        self.inner.append_op(key, op).await
    }

    async fn save_snapshot(&self, snapshot: &DocumentSnapshot) -> CollabResult<()> {
        if self.slow_snapshots.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(10)).await;
        }
        if self.snapshots_down.load(Ordering::SeqCst) {
            return Err(CollabError::Persistence("snapshots unavailable".into()));
        }
        self.inner.save_snapshot(snapshot).await
    }

    async fn delete(&self, key: &DocumentKey) -> CollabResult<()> {
        self.inner.delete(key).await
    }
}

#[tokio::test]
async fn failed_appends_are_covered_by_next_snapshot() {
    let store = FlakyStore::default();
    let config = EngineConfig {
        retry: RetryPolicy::none(),
        ..EngineConfig::default()
    };
    let registry = DocumentRegistry::new(Arc::new(store.clone()), config.clone());
    let key = key();
    let actor = registry.get_or_spawn(key).await.unwrap();

    store.log_down.store(true, Ordering::SeqCst);
    actor.replace_text("unlogged").await.unwrap();
    assert_eq!(store.inner.log_len(&key), 0);
    assert_eq!(actor.view().await.unwrap().text, "unlogged");

    store.log_down.store(false, Ordering::SeqCst);
    actor.flush().await.unwrap();

    let other = DocumentRegistry::new(Arc::new(store.inner.clone()), config);
    let restored = other.get_or_spawn(key).await.unwrap();
    assert_eq!(restored.view().await.unwrap().text, "unlogged");
}

#[tokio::test(start_paused = true)]
async fn unsaved_actor_is_not_evicted_until_a_snapshot_lands() {
    let store = FlakyStore::default();
    let config = EngineConfig {
        idle_grace: Duration::from_secs(5),
        retry: RetryPolicy::none(),
        ..EngineConfig::default()
    };
    let registry = DocumentRegistry::new(Arc::new(store.clone()), config.clone());
    let key = key();
    let actor = registry.get_or_spawn(key).await.unwrap();

    store.outage(true);
    actor.replace_text("precious").await.unwrap();
    tokio::time::sleep(Duration::from_secs(20)).await;

    assert!(!actor.is_closed());
    assert_eq!(registry.live_count(), 1);
    assert!(matches!(actor.shutdown(true).await, Err(CollabError::Persistence(_))));
    assert_eq!(actor.view().await.unwrap().text, "precious");

    store.outage(false);
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(actor.is_closed());

    let other = DocumentRegistry::new(Arc::new(store.inner.clone()), config);
    let restored = other.get_or_spawn(key).await.unwrap();
    assert_eq!(restored.view().await.unwrap().text, "precious");
}

#[tokio::test(start_paused = true)]
async fn slow_snapshot_does_not_block_the_mailbox() {
    let store = FlakyStore::default();
    let config = EngineConfig {
        snapshot_every_ops: 1,
        ..EngineConfig::default()
    };
    let registry = DocumentRegistry::new(Arc::new(store.clone()), config.clone());
    let key = key();
    let actor = registry.get_or_spawn(key).await.unwrap();

    store.slow_snapshots.store(true, Ordering::SeqCst);
    let started = tokio::time::Instant::now();
    actor.replace_text("slow disk").await.unwrap();
    actor.replace_text("slow disk, fast edits").await.unwrap();
    assert_eq!(actor.view().await.unwrap().text, "slow disk, fast edits");
    assert!(started.elapsed() < Duration::from_secs(1));

    store.slow_snapshots.store(false, Ordering::SeqCst);
    actor
        .with_timeout(Duration::from_secs(60))
        .flush()
        .await
        .unwrap();
    let other = DocumentRegistry::new(Arc::new(store.inner.clone()), config);
    let restored = other.get_or_spawn(key).await.unwrap();
    assert_eq!(restored.view().await.unwrap().text, "slow disk, fast edits");
}
