//! Merging one branch's chapter documents into its parent's.
//!
//! Both merge kinds reduce to the same step: the target absorbs every source
//! operation it has not seen. When the target is untouched since the fork the
//! result is exactly the source state (fast-forward); otherwise the sequence
//! CRDT interleaves both histories deterministically.

use crate::error::MergeError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use storyloom_collab::{
    BranchId, ChapterId, CollabError, CollabResult, Operation, StateVector, TextDocument,
};

/// How a chapter document was combined with the target's
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeKind {
    /// Target unchanged since the fork; source state taken as is
    FastForward,
    /// Both sides edited; histories combined
    Merged,
    /// Chapter only existed on the source branch
    Added,
}

/// What happened to one source chapter during a merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChapterOutcome {
    FastForward,
    Merged,
    Added,
    /// Exceeded the per-chapter budget; the target chapter was left as it was
    TimedOut,
    Failed { reason: String },
}

impl ChapterOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::TimedOut | Self::Failed { .. })
    }
}

impl From<MergeKind> for ChapterOutcome {
    fn from(kind: MergeKind) -> Self {
        match kind {
            MergeKind::FastForward => Self::FastForward,
            MergeKind::Merged => Self::Merged,
            MergeKind::Added => Self::Added,
        }
    }
}

/// Per-chapter line of a [`MergeReport`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterMerge {
    pub source_chapter_id: ChapterId,
    /// `None` when nothing was written to the target
    pub target_chapter_id: Option<ChapterId>,
    pub outcome: ChapterOutcome,
    /// Target text differs from before the merge
    pub changed: bool,
    pub operations_applied: usize,
}

impl ChapterMerge {
    pub fn timed_out(source_chapter_id: ChapterId) -> Self {
        Self::unmerged(source_chapter_id, ChapterOutcome::TimedOut)
    }

    pub fn failed(source_chapter_id: ChapterId, reason: impl ToString) -> Self {
        Self::unmerged(
            source_chapter_id,
            ChapterOutcome::Failed {
                reason: reason.to_string(),
            },
        )
    }

    fn unmerged(source_chapter_id: ChapterId, outcome: ChapterOutcome) -> Self {
        Self {
            source_chapter_id,
            target_chapter_id: None,
            outcome,
            changed: false,
            operations_applied: 0,
        }
    }
}

/// Outcome of merging a branch. Chapters succeed or fail independently; the
/// source branch only becomes read-only when the report is `complete`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeReport {
    pub source_branch_id: BranchId,
    pub target_branch_id: BranchId,
    pub chapters: Vec<ChapterMerge>,
    pub chapters_changed_count: usize,
    /// Every chapter merged and the source branch is retired
    pub complete: bool,
    pub merged_at: DateTime<Utc>,
}

impl MergeReport {
    pub fn new(source: BranchId, target: BranchId, chapters: Vec<ChapterMerge>) -> Self {
        let chapters_changed_count = chapters.iter().filter(|c| c.changed).count();
        let complete = chapters.iter().all(|c| c.outcome.is_success());
        Self {
            source_branch_id: source,
            target_branch_id: target,
            chapters,
            chapters_changed_count,
            complete,
            merged_at: Utc::now(),
        }
    }

    /// Every chapter merged without combining divergent edits.
    pub fn is_fast_forward(&self) -> bool {
        self.complete
            && self
                .chapters
                .iter()
                .all(|c| matches!(c.outcome, ChapterOutcome::FastForward | ChapterOutcome::Added))
    }

    /// Outcome for one source chapter.
    pub fn chapter(&self, source_chapter_id: ChapterId) -> Option<&ChapterMerge> {
        self.chapters
            .iter()
            .find(|c| c.source_chapter_id == source_chapter_id)
    }

    pub fn timed_out(&self) -> Vec<ChapterId> {
        self.chapters
            .iter()
            .filter(|c| c.outcome == ChapterOutcome::TimedOut)
            .map(|c| c.source_chapter_id)
            .collect()
    }

    /// The timed-out chapters as [`MergeError::ChapterTimeout`], if any.
    pub fn timeout_error(&self) -> Option<MergeError> {
        let chapters = self.timed_out();
        (!chapters.is_empty()).then(|| MergeError::ChapterTimeout {
            branch_id: self.source_branch_id,
            chapters,
        })
    }
}

/// Result of [`merge_documents`].
#[derive(Debug, Clone)]
pub struct DocumentMerge {
    pub document: TextDocument,
    pub kind: MergeKind,
    /// Source operations the target was missing, in integration order
    pub applied: Vec<Operation>,
    pub changed: bool,
}

/// Merge `source` into `target` without touching either.
///
/// `fork_point` is the target's state vector when the source branched off;
/// without one the merge is always reported as [`MergeKind::Merged`]. The
/// outcome depends only on the two operation sets.
pub fn merge_documents(
    target: &TextDocument,
    source: &TextDocument,
    fork_point: Option<&StateVector>,
) -> CollabResult<DocumentMerge> {
    merge_operations(target, &source.diff(target.vector()), fork_point)
}

/// Apply `missing` to a copy of `target`. Every operation must resolve
/// against the target's history.
pub fn merge_operations(
    target: &TextDocument,
    missing: &[Operation],
    fork_point: Option<&StateVector>,
) -> CollabResult<DocumentMerge> {
    let kind = match fork_point {
        Some(point) if target.vector() == point => MergeKind::FastForward,
        _ => MergeKind::Merged,
    };

    let mut document = target.clone();
    let absorbed = document.absorb(missing);
    if !absorbed.unresolved.is_empty() {
        return Err(CollabError::MergeConflictInternal(format!(
            "{} source operations reference history the target lacks",
            absorbed.unresolved.len()
        )));
    }

    let changed = document.text() != target.text();
    Ok(DocumentMerge {
        document,
        kind,
        applied: absorbed.applied,
        changed,
    })
}
