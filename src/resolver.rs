use async_trait::async_trait;
use std::sync::Arc;
use storyloom_branch::MetadataStore;
use storyloom_collab::{CollabError, DocumentKey};
use storyloom_websocket::{DocumentResolver, SyncServerResult};

/// Accepts a sync connection only for a chapter row on the named branch.
pub struct ChapterResolver {
    store: Arc<dyn MetadataStore>,
}

impl ChapterResolver {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl DocumentResolver for ChapterResolver {
    async fn exists(&self, key: &DocumentKey) -> SyncServerResult<bool> {
        let chapter = self
            .store
            .get_chapter(&key.chapter_id)
            .await
            .map_err(|e| CollabError::Persistence(e.to_string()))?;
        Ok(chapter.is_some_and(|c| c.branch_id == key.branch_id))
    }
}
