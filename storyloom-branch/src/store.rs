//! Branch metadata storage

use crate::error::BranchResult;
use crate::model::{Branch, BranchStatus, Chapter, Story};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use storyloom_collab::{BranchId, ChapterId, StoryId};

/// Durable rows for stories, branches and chapters.
///
/// Implement this for a real database; [`InMemoryMetadataStore`] backs tests
/// and single-process deployments. Writes are upserts.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn put_story(&self, story: &Story) -> BranchResult<()>;

    async fn get_story(&self, id: &StoryId) -> BranchResult<Option<Story>>;

    async fn put_branch(&self, branch: &Branch) -> BranchResult<()>;

    async fn get_branch(&self, id: &BranchId) -> BranchResult<Option<Branch>>;

    async fn list_branches(&self, story_id: &StoryId) -> BranchResult<Vec<Branch>>;

    async fn delete_branch(&self, id: &BranchId) -> BranchResult<()>;

    /// Every merged branch across all stories
    async fn merged_branches(&self) -> BranchResult<Vec<Branch>>;

    async fn put_chapter(&self, chapter: &Chapter) -> BranchResult<()>;

    async fn get_chapter(&self, id: &ChapterId) -> BranchResult<Option<Chapter>>;

    async fn list_chapters(&self, branch_id: &BranchId) -> BranchResult<Vec<Chapter>>;

    async fn delete_chapter(&self, id: &ChapterId) -> BranchResult<()>;
}

#[derive(Clone, Default)]
pub struct InMemoryMetadataStore {
    stories: Arc<DashMap<StoryId, Story>>,
    branches: Arc<DashMap<BranchId, Branch>>,
    chapters: Arc<DashMap<ChapterId, Chapter>>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn story_count(&self) -> usize {
        self.stories.len()
    }

    pub fn chapter_count(&self) -> usize {
        self.chapters.len()
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn put_story(&self, story: &Story) -> BranchResult<()> {
        self.stories.insert(story.id, story.clone());
        Ok(())
    }

    async fn get_story(&self, id: &StoryId) -> BranchResult<Option<Story>> {
        Ok(self.stories.get(id).map(|s| s.clone()))
    }

    async fn put_branch(&self, branch: &Branch) -> BranchResult<()> {
        self.branches.insert(branch.id, branch.clone());
        Ok(())
    }

    async fn get_branch(&self, id: &BranchId) -> BranchResult<Option<Branch>> {
        Ok(self.branches.get(id).map(|b| b.clone()))
    }

    async fn list_branches(&self, story_id: &StoryId) -> BranchResult<Vec<Branch>> {
        let mut branches: Vec<Branch> = self
            .branches
            .iter()
            .filter(|b| b.story_id == *story_id)
            .map(|b| b.clone())
            .collect();
        branches.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(branches)
    }

    async fn delete_branch(&self, id: &BranchId) -> BranchResult<()> {
        self.branches.remove(id);
        Ok(())
    }

    async fn merged_branches(&self) -> BranchResult<Vec<Branch>> {
        Ok(self
            .branches
            .iter()
            .filter(|b| b.status == BranchStatus::Merged)
            .map(|b| b.clone())
            .collect())
    }

    async fn put_chapter(&self, chapter: &Chapter) -> BranchResult<()> {
        self.chapters.insert(chapter.id, chapter.clone());
        Ok(())
    }

    async fn get_chapter(&self, id: &ChapterId) -> BranchResult<Option<Chapter>> {
        Ok(self.chapters.get(id).map(|c| c.clone()))
    }

    async fn list_chapters(&self, branch_id: &BranchId) -> BranchResult<Vec<Chapter>> {
        let mut chapters: Vec<Chapter> = self
            .chapters
            .iter()
            .filter(|c| c.branch_id == *branch_id)
            .map(|c| c.clone())
            .collect();
        chapters.sort_by(|a, b| a.position.cmp(&b.position).then(a.id.cmp(&b.id)));
        Ok(chapters)
    }

    async fn delete_chapter(&self, id: &ChapterId) -> BranchResult<()> {
        self.chapters.remove(id);
        Ok(())
    }
}
