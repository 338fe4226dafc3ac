//! Branch lifecycle: stories, forks and merges.
//!
//! All branch metadata for a story is mutated under that story's lock. Chapter
//! documents are reached only through the [`DocumentRegistry`], so a fork reads
//! the parent's live state and a merge writes through the target's actors.

use crate::error::{BranchError, BranchResult, MergeError, MergeResult};
use crate::graph::BranchGraph;
use crate::merge::{ChapterMerge, DocumentMerge, MergeKind, MergeReport, merge_documents};
use crate::model::{Branch, BranchStatus, BranchUpdate, Chapter, CreateStory, Story};
use crate::store::MetadataStore;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use storyloom_collab::{
    ActorHandle, BranchId, ChapterId, CollabError, DocumentRegistry, DocumentSnapshot, ReplicaId,
    StoryId, TextDocument,
};
use storyloom_log::{debug, error, info, warn};
use tokio::sync::{Mutex, OwnedMutexGuard};

struct ManagerInner {
    store: Arc<dyn MetadataStore>,
    registry: DocumentRegistry,
    locks: DashMap<StoryId, Arc<Mutex<()>>>,
}

/// Owner of every story's branch graph.
#[derive(Clone)]
pub struct BranchGraphManager {
    inner: Arc<ManagerInner>,
}

impl BranchGraphManager {
    pub fn new(store: Arc<dyn MetadataStore>, registry: DocumentRegistry) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                store,
                registry,
                locks: DashMap::new(),
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.inner.store
    }

    pub fn registry(&self) -> &DocumentRegistry {
        &self.inner.registry
    }

    /// Exclusive access to one story's branch metadata.
    pub async fn lock_story(&self, story_id: StoryId) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(self.inner.locks.entry(story_id).or_default().value());
        lock.lock_owned().await
    }

    /// Re-register merged branches as retired. Call once at startup.
    pub async fn restore(&self) -> BranchResult<usize> {
        let merged = self.inner.store.merged_branches().await?;
        let count = merged.len();
        self.inner.registry.restore_retired(merged.into_iter().map(|b| b.id));
        info!("restored {} merged branches as retired", count);
        Ok(count)
    }

    /// Create a story and its root branch.
    pub async fn create_story(&self, request: CreateStory) -> BranchResult<(Story, Branch)> {
        if request.title.trim().is_empty() {
            return Err(BranchError::Invalid("story title must not be empty".into()));
        }
        let story = Story {
            id: StoryId::new(),
            owner: request.owner,
            title: request.title,
            genre: request.genre,
            description: request.description,
            metadata: request.metadata,
            created_at: Utc::now(),
            updated_at: None,
        };
        let _guard = self.lock_story(story.id).await;

        let root_name = request.root_branch_name.unwrap_or_else(|| "main".to_string());
        let root = Branch::new(story.id, None, root_name);
        self.inner.store.put_story(&story).await?;
        self.inner.store.put_branch(&root).await?;
        info!("created story {} with root branch {}", story.id, root.id);
        Ok((story, root))
    }

    pub async fn get_story(&self, story_id: StoryId) -> BranchResult<Story> {
        self.inner
            .store
            .get_story(&story_id)
            .await?
            .ok_or(BranchError::StoryNotFound(story_id))
    }

    /// Every branch of a story, oldest first.
    pub async fn get_branches(&self, story_id: StoryId) -> BranchResult<Vec<Branch>> {
        self.get_story(story_id).await?;
        self.inner.store.list_branches(&story_id).await
    }

    pub async fn get_branch(&self, branch_id: BranchId) -> BranchResult<Branch> {
        self.inner
            .store
            .get_branch(&branch_id)
            .await?
            .ok_or(BranchError::BranchNotFound(branch_id))
    }

    /// Active branch, or [`BranchError::Immutable`] if it was merged.
    pub async fn active_branch(&self, branch_id: BranchId) -> BranchResult<Branch> {
        let branch = self.get_branch(branch_id).await?;
        if !branch.is_active() {
            return Err(BranchError::Immutable(branch_id));
        }
        Ok(branch)
    }

    pub async fn graph(&self, story_id: StoryId) -> BranchResult<BranchGraph> {
        let branches = self.get_branches(story_id).await?;
        BranchGraph::from_branches(&branches)
    }

    /// Fork `parent_branch_id`: every chapter is copied by value into a new
    /// chapter whose document starts from the parent's current state.
    pub async fn create_branch(
        &self,
        story_id: StoryId,
        parent_branch_id: BranchId,
        name: impl Into<String>,
    ) -> BranchResult<Branch> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(BranchError::Invalid("branch name must not be empty".into()));
        }
        let _guard = self.lock_story(story_id).await;
        self.get_story(story_id).await?;

        let invalid = |reason: &str| BranchError::InvalidParent {
            parent: parent_branch_id,
            reason: reason.to_string(),
        };
        let parent = self
            .inner
            .store
            .get_branch(&parent_branch_id)
            .await?
            .ok_or_else(|| invalid("does not exist"))?;
        if parent.story_id != story_id {
            return Err(invalid("belongs to another story"));
        }
        if !parent.is_active() {
            return Err(invalid("is merged"));
        }

        let mut graph = self.graph(story_id).await?;
        let branch = Branch::new(story_id, Some(parent.id), name);
        graph.add_node(branch.id);
        graph.add_edge(parent.id, branch.id)?;

        let parent_chapters = self.inner.store.list_chapters(&parent.id).await?;
        let mut forked = Vec::with_capacity(parent_chapters.len());
        for chapter in &parent_chapters {
            match self.fork_chapter(chapter, &branch).await {
                Ok(copy) => forked.push(copy),
                Err(err) => {
                    warn!("fork of branch {} failed on chapter {}: {}", parent.id, chapter.id, err);
                    self.discard_chapters(&forked).await;
                    return Err(err);
                }
            }
        }

        self.inner.store.put_branch(&branch).await?;
        info!(
            "created branch {} ({}) from {} with {} chapters",
            branch.id,
            branch.name,
            parent.id,
            forked.len()
        );
        Ok(branch)
    }

    async fn fork_chapter(&self, chapter: &Chapter, branch: &Branch) -> BranchResult<Chapter> {
        let snapshot = self.inner.registry.snapshot(chapter.key()).await?;
        let now = Utc::now();
        let copy = Chapter {
            id: ChapterId::new(),
            story_id: chapter.story_id,
            branch_id: branch.id,
            title: chapter.title.clone(),
            position: chapter.position,
            word_count: chapter.word_count,
            metadata: chapter.metadata.clone(),
            forked_from: Some(chapter.id),
            fork_point: Some(snapshot.state_vector.clone()),
            merged_from: None,
            created_at: now,
            updated_at: None,
        };

        // The fork starts with no issued replicas: clients of the parent
        // cannot resume into it and reuse their clocks.
        self.inner
            .registry
            .seed(DocumentSnapshot {
                branch_id: branch.id,
                chapter_id: copy.id,
                crdt_bytes: snapshot.crdt_bytes,
                state_vector: snapshot.state_vector,
                replicas: Vec::new(),
                saved_at: now,
            })
            .await?;
        self.inner.store.put_chapter(&copy).await?;
        debug!("forked chapter {} -> {}", chapter.id, copy.id);
        Ok(copy)
    }

    async fn discard_chapters(&self, chapters: &[Chapter]) {
        for chapter in chapters {
            if let Err(err) = self.inner.registry.delete_document(chapter.key()).await {
                warn!("could not discard document {}: {}", chapter.key(), err);
            }
            if let Err(err) = self.inner.store.delete_chapter(&chapter.id).await {
                warn!("could not discard chapter {}: {}", chapter.id, err);
            }
        }
    }

    /// Rename or re-describe an active branch.
    pub async fn update_branch(&self, branch_id: BranchId, update: BranchUpdate) -> BranchResult<Branch> {
        let story_id = self.get_branch(branch_id).await?.story_id;
        let _guard = self.lock_story(story_id).await;
        let mut branch = self.active_branch(branch_id).await?;

        if let Some(name) = update.name {
            if name.trim().is_empty() {
                return Err(BranchError::Invalid("branch name must not be empty".into()));
            }
            branch.name = name;
        }
        if let Some(description) = update.description {
            branch.description = Some(description);
        }
        if let Some(metadata) = update.metadata {
            branch.metadata = metadata;
        }
        branch.updated_at = Some(Utc::now());
        self.inner.store.put_branch(&branch).await?;
        Ok(branch)
    }

    /// Delete an active, non-root branch without children, with its chapters.
    pub async fn delete_branch(&self, branch_id: BranchId) -> BranchResult<()> {
        let story_id = self.get_branch(branch_id).await?.story_id;
        let _guard = self.lock_story(story_id).await;
        let branch = self.active_branch(branch_id).await?;
        if branch.is_root {
            return Err(BranchError::Invalid("the root branch cannot be deleted".into()));
        }
        let mut graph = self.graph(story_id).await?;
        graph.remove_leaf(&branch_id)?;

        self.inner.registry.retire_branch(branch_id).await?;
        let chapters = self.inner.store.list_chapters(&branch_id).await?;
        for chapter in &chapters {
            self.inner.registry.delete_document(chapter.key()).await?;
            self.inner.store.delete_chapter(&chapter.id).await?;
        }
        self.inner.store.delete_branch(&branch_id).await?;
        info!("deleted branch {} and {} chapters", branch_id, chapters.len());
        Ok(())
    }

    /// Merge a branch into its parent.
    pub async fn merge(&self, story_id: StoryId, branch_id: BranchId) -> MergeResult<MergeReport> {
        let source = self.story_branch(story_id, branch_id).await?;
        let target = source
            .parent_branch_id
            .ok_or(MergeError::NoParent(branch_id))?;
        self.merge_into(story_id, branch_id, target).await
    }

    /// Merge `source_id` into `target_id`, which must be its direct parent.
    ///
    /// Chapters merge independently. When some of them time out or fail the
    /// others stay merged, the source branch is reopened for writing and the
    /// returned report is not `complete`; merging again picks up where this
    /// run stopped.
    pub async fn merge_into(
        &self,
        story_id: StoryId,
        source_id: BranchId,
        target_id: BranchId,
    ) -> MergeResult<MergeReport> {
        let _guard = self.lock_story(story_id).await;

        let source = self.story_branch(story_id, source_id).await?;
        if source.status != BranchStatus::Active {
            return Err(MergeError::AlreadyMerged(source_id));
        }
        match source.parent_branch_id {
            None => return Err(MergeError::NoParent(source_id)),
            Some(parent) if parent != target_id => {
                return Err(MergeError::NotDirectParent {
                    source_branch: source_id,
                    target: target_id,
                });
            }
            Some(_) => {}
        }
        let target = self.story_branch(story_id, target_id).await?;
        if !target.is_active() {
            return Err(MergeError::TargetNotActive(target_id));
        }

        info!("merging branch {} into {}", source_id, target_id);
        // Freeze the source so the merged state is final.
        self.inner
            .registry
            .retire_branch(source_id)
            .await
            .map_err(BranchError::from)?;

        let report = match self.merge_chapters(&source, &target).await {
            Ok(chapters) => MergeReport::new(source_id, target_id, chapters),
            Err(err) => {
                warn!("merge of {} into {} aborted: {}", source_id, target_id, err);
                self.reopen(source_id).await;
                return Err(err);
            }
        };

        if !report.complete {
            let unmerged = report
                .chapters
                .iter()
                .filter(|c| !c.outcome.is_success())
                .count();
            warn!(
                "merge of {} into {} incomplete: {} of {} chapters not merged",
                source_id,
                target_id,
                unmerged,
                report.chapters.len()
            );
            self.reopen(source_id).await;
            return Ok(report);
        }

        let mut merged = source;
        merged.status = BranchStatus::Merged;
        merged.merged_into_id = Some(target_id);
        merged.merged_at = Some(report.merged_at);
        merged.updated_at = Some(report.merged_at);
        self.inner.store.put_branch(&merged).await?;

        info!(
            "merged branch {} into {}: {} chapters, {} changed",
            source_id,
            target_id,
            report.chapters.len(),
            report.chapters_changed_count
        );
        Ok(report)
    }

    async fn reopen(&self, branch_id: BranchId) {
        if let Err(err) = self.inner.registry.reopen_branch(branch_id).await {
            error!("could not reopen branch {}: {}", branch_id, err);
        }
    }

    async fn story_branch(&self, story_id: StoryId, branch_id: BranchId) -> MergeResult<Branch> {
        self.inner
            .store
            .get_branch(&branch_id)
            .await?
            .filter(|b| b.story_id == story_id)
            .ok_or(MergeError::NotFound(branch_id))
    }

    /// One report line per source chapter. Only reading the chapter lists
    /// can fail the whole merge.
    async fn merge_chapters(&self, source: &Branch, target: &Branch) -> MergeResult<Vec<ChapterMerge>> {
        let source_chapters = self.inner.store.list_chapters(&source.id).await?;
        let target_chapters = self.inner.store.list_chapters(&target.id).await?;
        let mut next_position = target_chapters
            .iter()
            .map(|c| c.position)
            .max()
            .unwrap_or(0)
            + 1;
        let budget = self.inner.registry.config().merge_chapter_timeout;

        let mut lines = Vec::with_capacity(source_chapters.len());
        for chapter in &source_chapters {
            let counterpart = target_chapters
                .iter()
                .find(|t| chapter.forked_from == Some(t.id) || t.merged_from == Some(chapter.id))
                .cloned();

            // Planning only reads, so giving up on it leaves nothing half written.
            let planned = tokio::time::timeout(
                budget,
                self.plan_chapter(chapter, counterpart, target, next_position),
            )
            .await;
            let line = match planned {
                Err(_) => {
                    warn!("chapter {} exceeded the merge budget of {:?}", chapter.id, budget);
                    ChapterMerge::timed_out(chapter.id)
                }
                Ok(Err(err)) => {
                    error!("chapter {} failed to merge: {}", chapter.id, err);
                    ChapterMerge::failed(chapter.id, &err)
                }
                Ok(Ok(plan)) => {
                    if matches!(plan, ChapterPlan::Add { .. }) {
                        next_position += 1;
                    }
                    match self.commit_chapter(plan).await {
                        Ok(line) => line,
                        Err(MergeError::Chapter {
                            source: CollabError::Timeout,
                            ..
                        }) => {
                            warn!("chapter {} timed out while committing", chapter.id);
                            ChapterMerge::timed_out(chapter.id)
                        }
                        Err(err) => {
                            error!("chapter {} failed to merge: {}", chapter.id, err);
                            ChapterMerge::failed(chapter.id, &err)
                        }
                    }
                }
            };
            lines.push(line);
        }
        Ok(lines)
    }

    /// Work out what merging `chapter` would write, without writing it.
    async fn plan_chapter(
        &self,
        chapter: &Chapter,
        counterpart: Option<Chapter>,
        target: &Branch,
        position: i64,
    ) -> MergeResult<ChapterPlan> {
        let failed = chapter_error(chapter.id);
        let registry = &self.inner.registry;

        let source_snapshot = registry.snapshot(chapter.key()).await.map_err(failed)?;
        let source_doc =
            TextDocument::from_snapshot(ReplicaId::new(), &source_snapshot.crdt_bytes).map_err(failed)?;

        let Some(existing) = counterpart else {
            let added = Chapter {
                id: ChapterId::new(),
                story_id: target.story_id,
                branch_id: target.id,
                title: chapter.title.clone(),
                position,
                word_count: source_doc.word_count(),
                metadata: chapter.metadata.clone(),
                forked_from: None,
                fork_point: None,
                merged_from: Some(chapter.id),
                created_at: Utc::now(),
                updated_at: None,
            };
            let snapshot = DocumentSnapshot {
                branch_id: target.id,
                chapter_id: added.id,
                crdt_bytes: source_snapshot.crdt_bytes,
                state_vector: source_snapshot.state_vector,
                replicas: Vec::new(),
                saved_at: Utc::now(),
            };
            return Ok(ChapterPlan::Add {
                source: chapter.id,
                added,
                snapshot,
                operations: source_doc.operations().len(),
            });
        };

        let actor = registry
            .get_or_spawn(existing.key())
            .await
            .map_err(failed)?;
        let target_snapshot = actor.snapshot().await.map_err(failed)?;
        let target_doc =
            TextDocument::from_snapshot(ReplicaId::new(), &target_snapshot.crdt_bytes).map_err(failed)?;
        let fork_point = if chapter.forked_from == Some(existing.id) {
            chapter.fork_point.as_ref()
        } else {
            None
        };
        let merge = merge_documents(&target_doc, &source_doc, fork_point).map_err(failed)?;

        Ok(ChapterPlan::Absorb {
            source: chapter.clone(),
            existing,
            actor,
            before: target_doc.text(),
            merge,
        })
    }

    /// Write a planned chapter merge: document state first, then its row.
    async fn commit_chapter(&self, plan: ChapterPlan) -> MergeResult<ChapterMerge> {
        let registry = &self.inner.registry;
        match plan {
            ChapterPlan::Add {
                source,
                added,
                snapshot,
                operations,
            } => {
                let failed = chapter_error(source);
                registry.seed(snapshot).await.map_err(failed)?;
                if let Err(err) = self.inner.store.put_chapter(&added).await {
                    if let Err(cleanup) = registry.delete_document(added.key()).await {
                        warn!("could not remove unlisted document {}: {}", added.key(), cleanup);
                    }
                    return Err(err.into());
                }
                debug!("chapter {} added to {} as {}", source, added.branch_id, added.id);
                Ok(ChapterMerge {
                    source_chapter_id: source,
                    target_chapter_id: Some(added.id),
                    outcome: MergeKind::Added.into(),
                    changed: true,
                    operations_applied: operations,
                })
            }
            ChapterPlan::Absorb {
                source,
                mut existing,
                actor,
                before,
                merge,
            } => {
                let failed = chapter_error(source.id);
                let absorbed = actor.absorb(merge.applied).await.map_err(failed)?;
                if !absorbed.unresolved.is_empty() {
                    return Err(failed(CollabError::MergeConflictInternal(format!(
                        "{} operations unresolved in target chapter {}",
                        absorbed.unresolved.len(),
                        existing.id
                    ))));
                }
                let view = actor.view().await.map_err(failed)?;

                if merge.kind == MergeKind::FastForward {
                    existing.title = source.title.clone();
                    existing.metadata = source.metadata.clone();
                }
                existing.word_count = view.word_count;
                existing.updated_at = Some(Utc::now());
                self.inner.store.put_chapter(&existing).await?;

                Ok(ChapterMerge {
                    source_chapter_id: source.id,
                    target_chapter_id: Some(existing.id),
                    outcome: merge.kind.into(),
                    changed: view.text != before,
                    operations_applied: absorbed.applied.len(),
                })
            }
        }
    }
}

/// A chapter merge that has been computed but not yet written.
enum ChapterPlan {
    Add {
        source: ChapterId,
        added: Chapter,
        snapshot: DocumentSnapshot,
        operations: usize,
    },
    Absorb {
        source: Chapter,
        existing: Chapter,
        actor: ActorHandle,
        before: String,
        merge: DocumentMerge,
    },
}

fn chapter_error(chapter_id: ChapterId) -> impl Fn(CollabError) -> MergeError + Copy {
    move |source| MergeError::Chapter { chapter_id, source }
}

impl std::fmt::Debug for BranchGraphManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BranchGraphManager")
            .field("registry", &self.inner.registry)
            .finish()
    }
}
