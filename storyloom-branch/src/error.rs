//! Branch and merge errors

use storyloom_collab::{BranchId, ChapterId, CollabError, StoryId};
use thiserror::Error;

/// Errors from story, branch and chapter management.
#[derive(Error, Debug)]
pub enum BranchError {
    #[error("story not found: {0}")]
    StoryNotFound(StoryId),

    #[error("branch not found: {0}")]
    BranchNotFound(BranchId),

    #[error("chapter not found: {0}")]
    ChapterNotFound(ChapterId),

    #[error("invalid parent {parent}: {reason}")]
    InvalidParent { parent: BranchId, reason: String },

    #[error("branch {0} is merged and read-only")]
    Immutable(BranchId),

    #[error("edge {parent} -> {child} would create a cycle")]
    Cycle { parent: BranchId, child: BranchId },

    #[error("invalid input: {0}")]
    Invalid(String),

    #[error("metadata store error: {0}")]
    Store(String),

    #[error(transparent)]
    Collab(#[from] CollabError),
}

/// Errors from merging a branch into its parent.
#[derive(Error, Debug)]
pub enum MergeError {
    #[error("branch {0} is already merged")]
    AlreadyMerged(BranchId),

    #[error("branch {0} not found in this story")]
    NotFound(BranchId),

    #[error("branch {0} has no parent to merge into")]
    NoParent(BranchId),

    #[error("{target} is not the direct parent of {source_branch}")]
    NotDirectParent {
        source_branch: BranchId,
        target: BranchId,
    },

    #[error("target branch {0} is not active")]
    TargetNotActive(BranchId),

    #[error("merge of branch {branch_id} timed out on {} chapter(s)", chapters.len())]
    ChapterTimeout {
        branch_id: BranchId,
        chapters: Vec<ChapterId>,
    },

    #[error("chapter {chapter_id} failed to merge: {source}")]
    Chapter {
        chapter_id: ChapterId,
        #[source]
        source: CollabError,
    },

    #[error(transparent)]
    Branch(#[from] BranchError),
}

pub type BranchResult<T> = std::result::Result<T, BranchError>;
pub type MergeResult<T> = std::result::Result<T, MergeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        let branch = BranchId::new();
        let err = MergeError::ChapterTimeout {
            branch_id: branch,
            chapters: vec![ChapterId::new(), ChapterId::new()],
        };
        assert!(err.to_string().ends_with("timed out on 2 chapter(s)"));

        let err: MergeError = BranchError::Immutable(branch).into();
        assert!(err.to_string().contains("read-only"));
    }
}
