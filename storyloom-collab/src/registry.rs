//! Process-wide map from chapter to its live document actor.
//!
//! Actors are created on first use, restored from persistence, and removed
//! when they stop (idle eviction, shutdown or a panic). A stopped actor is
//! transparently replaced on the next lookup.

use crate::actor::{ActorHandle, DocumentActor};
use crate::persistence::{DocumentSnapshot, PersistenceAdapter};
use crate::text::TextDocument;
use crate::{BranchId, CollabError, CollabResult, DocumentKey, EngineConfig, ReplicaId};
use chrono::Utc;
use dashmap::{DashMap, DashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use storyloom_log::{debug, error, info, warn};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

struct ActorEntry {
    handle: ActorHandle,
    generation: u64,
}

struct RegistryInner {
    actors: DashMap<DocumentKey, ActorEntry>,
    spawning: DashMap<DocumentKey, Arc<Mutex<()>>>,
    retired: DashSet<BranchId>,
    persistence: Arc<dyn PersistenceAdapter>,
    config: EngineConfig,
    generation: AtomicU64,
}

/// Shared, cloneable registry of document actors.
#[derive(Clone)]
pub struct DocumentRegistry {
    inner: Arc<RegistryInner>,
}

impl DocumentRegistry {
    pub fn new(persistence: Arc<dyn PersistenceAdapter>, config: EngineConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                actors: DashMap::new(),
                spawning: DashMap::new(),
                retired: DashSet::new(),
                persistence,
                config,
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn persistence(&self) -> Arc<dyn PersistenceAdapter> {
        Arc::clone(&self.inner.persistence)
    }

    /// Running actor for `key`, if any.
    pub fn get(&self, key: &DocumentKey) -> Option<ActorHandle> {
        self.inner
            .actors
            .get(key)
            .filter(|entry| !entry.handle.is_closed())
            .map(|entry| entry.handle.clone())
    }

    /// Running actor for `key`, restoring it from persistence when needed.
    pub async fn get_or_spawn(&self, key: DocumentKey) -> CollabResult<ActorHandle> {
        if let Some(handle) = self.get(&key) {
            return Ok(handle);
        }

        let lock = Arc::clone(self.inner.spawning.entry(key).or_default().value());
        let _guard = lock.lock().await;
        if let Some(handle) = self.get(&key) {
            return Ok(handle);
        }

        let persistence = self.persistence();
        let persisted = self
            .inner
            .config
            .retry
            .run("load document", move || {
                let persistence = Arc::clone(&persistence);
                async move { persistence.load(&key).await }
            })
            .await?;

        let retired = self.is_retired(&key.branch_id);
        let actor = DocumentActor::restore(
            key,
            persisted,
            self.persistence(),
            self.inner.config.clone(),
            retired,
        )?;
        let (handle, join) = actor.spawn();
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        self.inner.actors.insert(
            key,
            ActorEntry {
                handle: handle.clone(),
                generation,
            },
        );
        self.supervise(key, generation, join);
        debug!("spawned actor for {} (generation {})", key, generation);
        Ok(handle)
    }

    fn supervise(&self, key: DocumentKey, generation: u64, join: JoinHandle<()>) {
        let inner: Weak<RegistryInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            match join.await {
                Ok(()) => {}
                Err(err) if err.is_panic() => {
                    error!("actor for {} panicked; it will be restored on next use", key)
                }
                Err(err) => warn!("actor for {} ended abnormally: {}", key, err),
            }
            if let Some(inner) = inner.upgrade() {
                inner
                    .actors
                    .remove_if(&key, |_, entry| entry.generation == generation);
            }
        });
    }

    /// Run `f` against the actor for `key`, retrying once on a fresh actor if
    /// the first one stopped underneath the call.
    pub async fn with_actor<T, F, Fut>(&self, key: DocumentKey, f: F) -> CollabResult<T>
    where
        F: Fn(ActorHandle) -> Fut,
        Fut: Future<Output = CollabResult<T>>,
    {
        let handle = self.get_or_spawn(key).await?;
        match f(handle).await {
            Err(CollabError::ActorUnavailable(_)) => {
                debug!("actor for {} went away; retrying", key);
                let handle = self.get_or_spawn(key).await?;
                f(handle).await
            }
            other => other,
        }
    }

    /// Write `snapshot` as the starting state of a document that is not live.
    pub async fn seed(&self, snapshot: DocumentSnapshot) -> CollabResult<()> {
        let key = snapshot.key();
        if self.get(&key).is_some() {
            return Err(CollabError::Persistence(format!(
                "cannot seed {key}: document is live"
            )));
        }
        let persistence = self.persistence();
        self.inner
            .config
            .retry
            .run("seed document", move || {
                let persistence = Arc::clone(&persistence);
                let snapshot = snapshot.clone();
                async move { persistence.save_snapshot(&snapshot).await }
            })
            .await
    }

    /// Create a document holding `text` and persist it as a snapshot.
    pub async fn create_document(&self, key: DocumentKey, text: &str) -> CollabResult<DocumentSnapshot> {
        let doc = TextDocument::with_text(ReplicaId::new(), text)?;
        let snapshot = DocumentSnapshot {
            branch_id: key.branch_id,
            chapter_id: key.chapter_id,
            crdt_bytes: doc.snapshot()?,
            state_vector: doc.vector().clone(),
            replicas: Vec::new(),
            saved_at: Utc::now(),
        };
        self.seed(snapshot.clone()).await?;
        Ok(snapshot)
    }

    /// Current snapshot of `key`, from the live actor or persisted state.
    pub async fn snapshot(&self, key: DocumentKey) -> CollabResult<DocumentSnapshot> {
        self.with_actor(key, |actor| async move { actor.snapshot().await })
            .await
    }

    /// Stop the actor for `key` without flushing and delete its persisted state.
    pub async fn delete_document(&self, key: DocumentKey) -> CollabResult<()> {
        if let Some(handle) = self.get(&key) {
            match handle.shutdown(false).await {
                Ok(()) | Err(CollabError::ActorUnavailable(_)) => {}
                Err(err) => return Err(err),
            }
        }
        self.inner.actors.remove(&key);
        self.inner.persistence.delete(&key).await?;
        info!("deleted document {}", key);
        Ok(())
    }

    /// Mark a branch read-only and retire its live actors. Returns how many
    /// live documents were retired.
    pub async fn retire_branch(&self, branch_id: BranchId) -> CollabResult<usize> {
        self.inner.retired.insert(branch_id);
        let handles: Vec<ActorHandle> = self
            .inner
            .actors
            .iter()
            .filter(|entry| entry.key().branch_id == branch_id)
            .map(|entry| entry.handle.clone())
            .collect();

        let mut retired = 0;
        for handle in handles {
            match handle.retire().await {
                Ok(()) => retired += 1,
                Err(CollabError::ActorUnavailable(_)) => {}
                Err(err) => return Err(err),
            }
        }
        info!("branch {} retired ({} live documents)", branch_id, retired);
        Ok(retired)
    }

    /// Undo [`retire_branch`](Self::retire_branch), for a merge that did not complete.
    pub async fn reopen_branch(&self, branch_id: BranchId) -> CollabResult<()> {
        self.inner.retired.remove(&branch_id);
        let handles: Vec<ActorHandle> = self
            .inner
            .actors
            .iter()
            .filter(|entry| entry.key().branch_id == branch_id)
            .map(|entry| entry.handle.clone())
            .collect();
        for handle in handles {
            match handle.reopen().await {
                Ok(()) | Err(CollabError::ActorUnavailable(_)) => {}
                Err(err) => return Err(err),
            }
        }
        info!("branch {} reopened", branch_id);
        Ok(())
    }

    pub fn is_retired(&self, branch_id: &BranchId) -> bool {
        self.inner.retired.contains(branch_id)
    }

    /// Re-register retired branches after a restart.
    pub fn restore_retired(&self, branches: impl IntoIterator<Item = BranchId>) {
        for branch in branches {
            self.inner.retired.insert(branch);
        }
    }

    /// Snapshot every live document.
    pub async fn flush_all(&self) -> CollabResult<()> {
        for handle in self.live_handles() {
            match handle.flush().await {
                Ok(()) | Err(CollabError::ActorUnavailable(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Flush and stop every live actor. Actors whose final snapshot fails
    /// stay registered and keep their state in memory.
    pub async fn shutdown(&self) {
        for handle in self.live_handles() {
            match handle.shutdown(true).await {
                Ok(()) | Err(CollabError::ActorUnavailable(_)) => {
                    self.inner.actors.remove(&handle.key());
                }
                Err(err) => warn!("actor for {} kept running: {}", handle.key(), err),
            }
        }
        self.inner.actors.retain(|_, entry| !entry.handle.is_closed());
    }

    pub fn live_count(&self) -> usize {
        self.inner
            .actors
            .iter()
            .filter(|entry| !entry.handle.is_closed())
            .count()
    }

    fn live_handles(&self) -> Vec<ActorHandle> {
        self.inner
            .actors
            .iter()
            .filter(|entry| !entry.handle.is_closed())
            .map(|entry| entry.handle.clone())
            .collect()
    }
}

impl std::fmt::Debug for DocumentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentRegistry")
            .field("live", &self.live_count())
            .field("retired", &self.inner.retired.len())
            .finish()
    }
}
