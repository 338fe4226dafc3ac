//! Durable storage for chapter documents.
//!
//! A document is persisted as its latest snapshot plus the operations
//! integrated after it. Restoring replays the log on top of the snapshot;
//! operations already inside the snapshot are dropped as duplicates, so a
//! log that was not truncated after a snapshot is harmless.

use crate::{BranchId, ChapterId, CollabResult, DocumentKey, Operation, ReplicaId, StateVector};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Persisted form of one chapter document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    pub branch_id: BranchId,
    pub chapter_id: ChapterId,
    /// [`TextDocument::snapshot`](crate::TextDocument::snapshot) bytes
    pub crdt_bytes: Bytes,
    pub state_vector: StateVector,
    /// Replica ids issued for this document; only these may resume a session.
    #[serde(default)]
    pub replicas: Vec<ReplicaId>,
    pub saved_at: DateTime<Utc>,
}

impl DocumentSnapshot {
    pub fn key(&self) -> DocumentKey {
        DocumentKey::new(self.branch_id, self.chapter_id)
    }
}

/// Everything stored for a document.
#[derive(Debug, Clone, Default)]
pub struct PersistedDocument {
    pub snapshot: Option<DocumentSnapshot>,
    /// Operations integrated after the snapshot, in integration order
    pub ops: Vec<Operation>,
}

impl PersistedDocument {
    pub fn is_empty(&self) -> bool {
        self.snapshot.is_none() && self.ops.is_empty()
    }
}

/// Storage backend for document state.
///
/// Implement this for a real database. [`InMemoryPersistence`] is used by
/// tests and single-process deployments.
#[async_trait]
pub trait PersistenceAdapter: Send + Sync {
    async fn load(&self, key: &DocumentKey) -> CollabResult<PersistedDocument>;

    /// Append one integrated operation to the document's log.
    async fn append_op(&self, key: &DocumentKey, op: &Operation) -> CollabResult<()>;

    /// Store a snapshot and drop logged operations it covers.
    async fn save_snapshot(&self, snapshot: &DocumentSnapshot) -> CollabResult<()>;

    async fn delete(&self, key: &DocumentKey) -> CollabResult<()>;
}

/// In-memory persistence (for testing/development)
#[derive(Clone, Default)]
pub struct InMemoryPersistence {
    snapshots: Arc<DashMap<DocumentKey, DocumentSnapshot>>,
    logs: Arc<DashMap<DocumentKey, Vec<Operation>>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot_of(&self, key: &DocumentKey) -> Option<DocumentSnapshot> {
        self.snapshots.get(key).map(|s| s.clone())
    }

    pub fn log_len(&self, key: &DocumentKey) -> usize {
        self.logs.get(key).map_or(0, |log| log.len())
    }

    pub fn document_count(&self) -> usize {
        self.snapshots.len()
    }
}

#[async_trait]
impl PersistenceAdapter for InMemoryPersistence {
    async fn load(&self, key: &DocumentKey) -> CollabResult<PersistedDocument> {
        Ok(PersistedDocument {
            snapshot: self.snapshots.get(key).map(|s| s.clone()),
            ops: self.logs.get(key).map(|log| log.clone()).unwrap_or_default(),
        })
    }

    async fn append_op(&self, key: &DocumentKey, op: &Operation) -> CollabResult<()> {
        self.logs.entry(*key).or_default().push(op.clone());
        Ok(())
    }

    async fn save_snapshot(&self, snapshot: &DocumentSnapshot) -> CollabResult<()> {
        let key = snapshot.key();
        if let Some(mut log) = self.logs.get_mut(&key) {
            log.retain(|op| op.clock > snapshot.state_vector.get(&op.replica_id));
        }
        self.snapshots.insert(key, snapshot.clone());
        Ok(())
    }

    async fn delete(&self, key: &DocumentKey) -> CollabResult<()> {
        self.snapshots.remove(key);
        self.logs.remove(key);
        Ok(())
    }
}

/// Exponential backoff for persistence calls.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no waiting.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }

    /// Run `call` until it succeeds or attempts run out; returns the last error.
    pub async fn run<T, F, Fut>(&self, what: &str, mut call: F) -> CollabResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CollabResult<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt + 1 >= attempts => {
                    storyloom_log::error!("{} failed after {} attempts: {}", what, attempts, err);
                    return Err(err);
                }
                Err(err) => {
                    let delay = self.delay_for_attempt(attempt);
                    storyloom_log::warn!(
                        "{} failed (attempt {}/{}), retrying in {:?}: {}",
                        what,
                        attempt + 1,
                        attempts,
                        delay,
                        err
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CollabError, TextDocument};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn snapshot_of(doc: &TextDocument, key: DocumentKey) -> DocumentSnapshot {
        DocumentSnapshot {
            branch_id: key.branch_id,
            chapter_id: key.chapter_id,
            crdt_bytes: doc.snapshot().unwrap(),
            state_vector: doc.vector().clone(),
            replicas: vec![doc.replica_id()],
            saved_at: Utc::now(),
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
            multiplier: 2.0,
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(300));
        assert_eq!(policy.delay_for_attempt(6), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = RetryPolicy::default()
            .run("flaky", || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(CollabError::Persistence("down".into()))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: CollabResult<()> = RetryPolicy::default()
            .run("broken", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(CollabError::Persistence("down".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_snapshot_truncates_covered_log() {
        let store = InMemoryPersistence::new();
        let key = DocumentKey::new(BranchId::new(), ChapterId::new());
        let mut doc = TextDocument::new(ReplicaId::from_u128(1));

        for op in doc.insert(0, "ab").unwrap() {
            store.append_op(&key, &op).await.unwrap();
        }
        store.save_snapshot(&snapshot_of(&doc, key)).await.unwrap();
        assert_eq!(store.log_len(&key), 0);

        for op in doc.insert(2, "c").unwrap() {
            store.append_op(&key, &op).await.unwrap();
        }
        let loaded = store.load(&key).await.unwrap();
        assert_eq!(loaded.ops.len(), 1);

        let snapshot = loaded.snapshot.unwrap();
        let mut restored = TextDocument::from_snapshot(ReplicaId::new(), &snapshot.crdt_bytes).unwrap();
        restored.absorb(&loaded.ops);
        assert_eq!(restored.text(), "abc");
    }

    #[tokio::test]
    async fn test_delete() {
        let store = InMemoryPersistence::new();
        let key = DocumentKey::new(BranchId::new(), ChapterId::new());
        let doc = TextDocument::with_text(ReplicaId::new(), "x").unwrap();
        store.save_snapshot(&snapshot_of(&doc, key)).await.unwrap();
        assert_eq!(store.document_count(), 1);

        store.delete(&key).await.unwrap();
        assert!(store.load(&key).await.unwrap().is_empty());
    }
}
