//! Stories, branches and chapters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use storyloom_collab::{BranchId, ChapterId, DocumentKey, StateVector, StoryId};

/// Free-form JSON attributes attached to stories, branches and chapters
pub type Metadata = Map<String, Value>;

/// Branch lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BranchStatus {
    #[default]
    Active,
    /// Merged into its parent; read-only from then on
    Merged,
}

impl std::fmt::Display for BranchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Merged => write!(f, "merged"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Story {
    pub id: StoryId,
    pub owner: String,
    pub title: String,
    pub genre: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Request to create a story together with its root branch.
#[derive(Debug, Clone, Default)]
pub struct CreateStory {
    pub owner: String,
    pub title: String,
    pub genre: Option<String>,
    pub description: Option<String>,
    pub metadata: Metadata,
    /// Name of the root branch; `main` when unset
    pub root_branch_name: Option<String>,
}

impl CreateStory {
    pub fn new(owner: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            title: title.into(),
            ..Self::default()
        }
    }

    pub fn with_genre(mut self, genre: impl Into<String>) -> Self {
        self.genre = Some(genre.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_root_branch_name(mut self, name: impl Into<String>) -> Self {
        self.root_branch_name = Some(name.into());
        self
    }
}

/// A node of a story's branch graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub id: BranchId,
    pub story_id: StoryId,
    pub parent_branch_id: Option<BranchId>,
    pub name: String,
    pub description: Option<String>,
    pub status: BranchStatus,
    pub is_root: bool,
    #[serde(default)]
    pub metadata: Metadata,
    pub merged_into_id: Option<BranchId>,
    pub merged_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Branch {
    pub(crate) fn new(story_id: StoryId, parent: Option<BranchId>, name: impl Into<String>) -> Self {
        Self {
            id: BranchId::new(),
            story_id,
            parent_branch_id: parent,
            name: name.into(),
            description: None,
            status: BranchStatus::Active,
            is_root: parent.is_none(),
            metadata: Metadata::new(),
            merged_into_id: None,
            merged_at: None,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == BranchStatus::Active
    }
}

/// Partial update of a branch. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BranchUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub metadata: Option<Metadata>,
}

/// One chapter as it exists on one branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chapter {
    pub id: ChapterId,
    pub story_id: StoryId,
    pub branch_id: BranchId,
    pub title: String,
    pub position: i64,
    pub word_count: usize,
    #[serde(default)]
    pub metadata: Metadata,
    /// Parent-branch chapter this one was forked from
    pub forked_from: Option<ChapterId>,
    /// Document state vector at the moment of the fork
    pub fork_point: Option<StateVector>,
    /// Child-branch chapter a merge copied into this branch
    #[serde(default)]
    pub merged_from: Option<ChapterId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Chapter {
    pub fn key(&self) -> DocumentKey {
        DocumentKey::new(self.branch_id, self.id)
    }
}

/// Chapter creation request. Position defaults to after the last chapter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewChapter {
    pub title: String,
    pub content: String,
    pub position: Option<i64>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl NewChapter {
    pub fn new(title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn at(mut self, position: i64) -> Self {
        self.position = Some(position);
        self
    }
}

/// Partial chapter update. New content goes through the chapter's document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChapterUpdate {
    pub title: Option<String>,
    pub content: Option<String>,
    pub position: Option<i64>,
    pub metadata: Option<Metadata>,
}

/// Whitespace-separated token count.
pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_count() {
        assert_eq!(word_count(""), 0);
        assert_eq!(word_count("  Once upon\n a\ttime  "), 4);
    }

    #[test]
    fn test_branch_status_serde() {
        assert_eq!(serde_json::to_string(&BranchStatus::Merged).unwrap(), r#""merged""#);
        assert_eq!(BranchStatus::default(), BranchStatus::Active);
    }

    #[test]
    fn test_root_branch_flag() {
        let story = StoryId::new();
        let root = Branch::new(story, None, "main");
        let child = Branch::new(story, Some(root.id), "what-if");
        assert!(root.is_root);
        assert!(!child.is_root);
        assert!(child.is_active());
    }
}
