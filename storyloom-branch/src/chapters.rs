//! Chapter CRUD on top of branch metadata and chapter documents.
//!
//! Chapter text lives only in the chapter's document; content updates become
//! CRDT operations through the document actor so live sessions see them.

use crate::error::{BranchError, BranchResult};
use crate::manager::BranchGraphManager;
use crate::model::{Chapter, ChapterUpdate, NewChapter, word_count};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use storyloom_collab::{BranchId, ChapterId};
use storyloom_log::{debug, info};

/// A chapter row with its current text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterDetail {
    #[serde(flatten)]
    pub chapter: Chapter,
    pub content: String,
}

#[derive(Clone, Debug)]
pub struct ChapterService {
    manager: BranchGraphManager,
}

impl ChapterService {
    pub fn new(manager: BranchGraphManager) -> Self {
        Self { manager }
    }

    async fn chapter_row(&self, chapter_id: ChapterId) -> BranchResult<Chapter> {
        self.manager
            .store()
            .get_chapter(&chapter_id)
            .await?
            .ok_or(BranchError::ChapterNotFound(chapter_id))
    }

    /// Create a chapter on an active branch. Without an explicit position the
    /// chapter goes after the last one.
    pub async fn create(&self, branch_id: BranchId, request: NewChapter) -> BranchResult<ChapterDetail> {
        if request.title.trim().is_empty() {
            return Err(BranchError::Invalid("chapter title must not be empty".into()));
        }
        let story_id = self.manager.get_branch(branch_id).await?.story_id;
        let _guard = self.manager.lock_story(story_id).await;
        self.manager.active_branch(branch_id).await?;

        let existing = self.manager.store().list_chapters(&branch_id).await?;
        let position = match request.position {
            Some(position) if existing.iter().any(|c| c.position == position) => {
                return Err(BranchError::Invalid(format!("position {position} is taken")));
            }
            Some(position) => position,
            None => existing.iter().map(|c| c.position).max().unwrap_or(0) + 1,
        };

        let chapter = Chapter {
            id: ChapterId::new(),
            story_id,
            branch_id,
            title: request.title,
            position,
            word_count: word_count(&request.content),
            metadata: request.metadata,
            forked_from: None,
            fork_point: None,
            merged_from: None,
            created_at: Utc::now(),
            updated_at: None,
        };
        self.manager
            .registry()
            .create_document(chapter.key(), &request.content)
            .await?;
        self.manager.store().put_chapter(&chapter).await?;
        info!("created chapter {} at position {} on {}", chapter.id, position, branch_id);

        Ok(ChapterDetail {
            chapter,
            content: request.content,
        })
    }

    /// Chapter row and its current text; the stored word count is refreshed
    /// when live edits have changed it.
    pub async fn get(&self, chapter_id: ChapterId) -> BranchResult<ChapterDetail> {
        let mut chapter = self.chapter_row(chapter_id).await?;
        let view = self
            .manager
            .registry()
            .with_actor(chapter.key(), |actor| async move { actor.view().await })
            .await?;

        if view.word_count != chapter.word_count {
            debug!("refreshing word count of {}: {}", chapter.id, view.word_count);
            chapter.word_count = view.word_count;
            self.manager.store().put_chapter(&chapter).await?;
        }
        Ok(ChapterDetail {
            chapter,
            content: view.text,
        })
    }

    /// Chapters of a branch in reading order (position, then id).
    pub async fn list(&self, branch_id: BranchId) -> BranchResult<Vec<Chapter>> {
        self.manager.get_branch(branch_id).await?;
        let mut chapters = self.manager.store().list_chapters(&branch_id).await?;
        chapters.sort_by(|a, b| a.position.cmp(&b.position).then(a.id.cmp(&b.id)));
        Ok(chapters)
    }

    pub async fn update(&self, chapter_id: ChapterId, update: ChapterUpdate) -> BranchResult<ChapterDetail> {
        let mut chapter = self.chapter_row(chapter_id).await?;
        let _guard = self.manager.lock_story(chapter.story_id).await;
        self.manager.active_branch(chapter.branch_id).await?;

        if let Some(title) = update.title {
            if title.trim().is_empty() {
                return Err(BranchError::Invalid("chapter title must not be empty".into()));
            }
            chapter.title = title;
        }
        if let Some(position) = update.position {
            let siblings = self.manager.store().list_chapters(&chapter.branch_id).await?;
            if siblings
                .iter()
                .any(|c| c.id != chapter.id && c.position == position)
            {
                return Err(BranchError::Invalid(format!("position {position} is taken")));
            }
            chapter.position = position;
        }
        if let Some(metadata) = update.metadata {
            chapter.metadata = metadata;
        }

        let registry = self.manager.registry();
        let view = match update.content {
            Some(content) => {
                registry
                    .with_actor(chapter.key(), |actor| {
                        let content = content.clone();
                        async move { actor.replace_text(content).await }
                    })
                    .await?
            }
            None => {
                registry
                    .with_actor(chapter.key(), |actor| async move { actor.view().await })
                    .await?
            }
        };

        chapter.word_count = view.word_count;
        chapter.updated_at = Some(Utc::now());
        self.manager.store().put_chapter(&chapter).await?;
        Ok(ChapterDetail {
            chapter,
            content: view.text,
        })
    }

    /// Delete a chapter and its document.
    pub async fn delete(&self, chapter_id: ChapterId) -> BranchResult<()> {
        let chapter = self.chapter_row(chapter_id).await?;
        let _guard = self.manager.lock_story(chapter.story_id).await;
        self.manager.active_branch(chapter.branch_id).await?;

        self.manager.registry().delete_document(chapter.key()).await?;
        self.manager.store().delete_chapter(&chapter_id).await?;
        info!("deleted chapter {}", chapter_id);
        Ok(())
    }

    /// Assign new positions. Every id must be a chapter of `branch_id`, and
    /// the resulting positions must stay unique.
    pub async fn reorder(&self, branch_id: BranchId, positions: &[(ChapterId, i64)]) -> BranchResult<Vec<Chapter>> {
        let story_id = self.manager.get_branch(branch_id).await?.story_id;
        let _guard = self.manager.lock_story(story_id).await;
        self.manager.active_branch(branch_id).await?;

        let mut chapters: HashMap<ChapterId, Chapter> = self
            .manager
            .store()
            .list_chapters(&branch_id)
            .await?
            .into_iter()
            .map(|c| (c.id, c))
            .collect();

        for (id, position) in positions {
            let chapter = chapters.get_mut(id).ok_or(BranchError::ChapterNotFound(*id))?;
            chapter.position = *position;
        }
        let mut seen = HashSet::new();
        if !chapters.values().all(|c| seen.insert(c.position)) {
            return Err(BranchError::Invalid("reordering would duplicate positions".into()));
        }

        let now = Utc::now();
        for (id, _) in positions {
            if let Some(chapter) = chapters.get_mut(id) {
                chapter.updated_at = Some(now);
                self.manager.store().put_chapter(chapter).await?;
            }
        }

        let mut ordered: Vec<Chapter> = chapters.into_values().collect();
        ordered.sort_by(|a, b| a.position.cmp(&b.position).then(a.id.cmp(&b.id)));
        Ok(ordered)
    }
}
