//! Merges where some chapters cannot be read in time or at all.

use async_trait::async_trait;
use dashmap::DashSet;
use std::sync::Arc;
use std::time::Duration;
use storyloom_branch::{
    BranchGraphManager, BranchStatus, ChapterOutcome, ChapterService, ChapterUpdate, CreateStory,
    InMemoryMetadataStore, MergeError, NewChapter,
};
use storyloom_collab::{
    ChapterId, CollabError, CollabResult, DocumentKey, DocumentRegistry, DocumentSnapshot, EngineConfig,
    InMemoryPersistence, Operation, PersistedDocument, PersistenceAdapter, RetryPolicy,
};

/// Document store where chosen chapters load slowly or not at all.
#[derive(Clone, Default)]
struct StallingStore {
    inner: InMemoryPersistence,
    slow: Arc<DashSet<ChapterId>>,
    broken: Arc<DashSet<ChapterId>>,
}

#[async_trait]
impl PersistenceAdapter for StallingStore {
    async fn load(&self, key: &DocumentKey) -> CollabResult<PersistedDocument> {
        if self.slow.contains(&key.chapter_id) {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        if self.broken.contains(&key.chapter_id) {
            return Err(CollabError::Persistence(format!("{key} is unreadable")));
        }
        self.inner.load(key).await
    }

    async fn append_op(&self, key: &DocumentKey, op: &Operation) -> CollabResult<()> {
        self.inner.append_op(key, op).await
    }

    async fn save_snapshot(&self, snapshot: &DocumentSnapshot) -> CollabResult<()> {
        self.inner.save_snapshot(snapshot).await
    }

    async fn delete(&self, key: &DocumentKey) -> CollabResult<()> {
        self.inner.delete(key).await
    }
}

struct Fixture {
    store: StallingStore,
    manager: BranchGraphManager,
    chapters: ChapterService,
}

fn fixture(budget: Duration) -> Fixture {
    let store = StallingStore::default();
    let config = EngineConfig {
        merge_chapter_timeout: budget,
        retry: RetryPolicy::none(),
        ..EngineConfig::default()
    };
    let registry = DocumentRegistry::new(Arc::new(store.clone()), config);
    let manager = BranchGraphManager::new(Arc::new(InMemoryMetadataStore::new()), registry);
    let chapters = ChapterService::new(manager.clone());
    Fixture {
        store,
        manager,
        chapters,
    }
}

async fn set_content(chapters: &ChapterService, chapter: ChapterId, content: &str) {
    chapters
        .update(
            chapter,
            ChapterUpdate {
                content: Some(content.into()),
                ..ChapterUpdate::default()
            },
        )
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn slow_chapter_times_out_without_undoing_the_others() {
    let f = fixture(Duration::from_secs(2));
    let (story, root) = f.manager.create_story(CreateStory::new("ada", "Loom")).await.unwrap();
    let one = f.chapters.create(root.id, NewChapter::new("One", "first")).await.unwrap();
    let two = f.chapters.create(root.id, NewChapter::new("Two", "second")).await.unwrap();

    let branch = f.manager.create_branch(story.id, root.id, "draft").await.unwrap();
    let forked = f.chapters.list(branch.id).await.unwrap();
    set_content(&f.chapters, forked[0].id, "first draft").await;
    f.store.slow.insert(forked[1].id);

    let report = f.manager.merge(story.id, branch.id).await.unwrap();
    assert!(!report.complete);
    assert!(!report.is_fast_forward());
    let merged = report.chapter(forked[0].id).unwrap();
    assert_eq!(merged.outcome, ChapterOutcome::FastForward);
    assert_eq!(merged.target_chapter_id, Some(one.chapter.id));
    assert!(merged.changed);
    let stalled = report.chapter(forked[1].id).unwrap();
    assert_eq!(stalled.outcome, ChapterOutcome::TimedOut);
    assert_eq!(stalled.target_chapter_id, None);
    match report.timeout_error() {
        Some(MergeError::ChapterTimeout { branch_id, chapters }) => {
            assert_eq!(branch_id, branch.id);
            assert_eq!(chapters, vec![forked[1].id]);
        }
        other => panic!("expected a chapter timeout, got {other:?}"),
    }

    // The finished chapter stays merged and the source is still editable.
    assert_eq!(f.chapters.get(one.chapter.id).await.unwrap().content, "first draft");
    assert_eq!(f.chapters.get(two.chapter.id).await.unwrap().content, "second");
    let source = f.manager.get_branch(branch.id).await.unwrap();
    assert_eq!(source.status, BranchStatus::Active);
    assert_eq!(source.merged_into_id, None);
    set_content(&f.chapters, forked[0].id, "first draft, revised").await;

    f.store.slow.remove(&forked[1].id);
    let report = f.manager.merge(story.id, branch.id).await.unwrap();
    assert!(report.complete);
    assert!(report.timeout_error().is_none());
    assert_eq!(report.chapter(forked[1].id).unwrap().outcome, ChapterOutcome::FastForward);
    assert!(report.chapter(forked[0].id).unwrap().outcome.is_success());
    assert_eq!(
        f.chapters.get(one.chapter.id).await.unwrap().content,
        "first draft, revised"
    );
    let source = f.manager.get_branch(branch.id).await.unwrap();
    assert_eq!(source.status, BranchStatus::Merged);
    assert_eq!(source.merged_into_id, Some(root.id));
}

#[tokio::test]
async fn unreadable_chapter_fails_alone() {
    let f = fixture(Duration::from_secs(10));
    let (story, root) = f.manager.create_story(CreateStory::new("ada", "Loom")).await.unwrap();
    let one = f.chapters.create(root.id, NewChapter::new("One", "first")).await.unwrap();
    f.chapters.create(root.id, NewChapter::new("Two", "second")).await.unwrap();

    let branch = f.manager.create_branch(story.id, root.id, "draft").await.unwrap();
    let forked = f.chapters.list(branch.id).await.unwrap();
    set_content(&f.chapters, forked[0].id, "first, again").await;
    let added = f
        .chapters
        .create(branch.id, NewChapter::new("Three", "third"))
        .await
        .unwrap();
    f.store.broken.insert(forked[1].id);

    let report = f.manager.merge(story.id, branch.id).await.unwrap();
    assert!(!report.complete);
    assert!(report.timeout_error().is_none());
    assert_eq!(report.chapters.len(), 3);
    assert_eq!(report.chapter(forked[0].id).unwrap().outcome, ChapterOutcome::FastForward);
    assert_eq!(report.chapter(added.chapter.id).unwrap().outcome, ChapterOutcome::Added);
    match &report.chapter(forked[1].id).unwrap().outcome {
        ChapterOutcome::Failed { reason } => assert!(reason.contains("unreadable"), "{reason}"),
        other => panic!("expected a failure, got {other:?}"),
    }
    assert_eq!(f.chapters.get(one.chapter.id).await.unwrap().content, "first, again");
    assert_eq!(
        f.manager.get_branch(branch.id).await.unwrap().status,
        BranchStatus::Active
    );

    // A second run does not add the new chapter twice.
    f.store.broken.remove(&forked[1].id);
    let report = f.manager.merge(story.id, branch.id).await.unwrap();
    assert!(report.complete);
    let root_chapters = f.chapters.list(root.id).await.unwrap();
    assert_eq!(root_chapters.len(), 3);
    assert_eq!(
        root_chapters
            .iter()
            .filter(|c| c.merged_from == Some(added.chapter.id))
            .count(),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn every_chapter_can_time_out() {
    let f = fixture(Duration::from_secs(1));
    let (story, root) = f.manager.create_story(CreateStory::new("ada", "Loom")).await.unwrap();
    f.chapters.create(root.id, NewChapter::new("One", "first")).await.unwrap();
    f.chapters.create(root.id, NewChapter::new("Two", "second")).await.unwrap();
    let branch = f.manager.create_branch(story.id, root.id, "draft").await.unwrap();
    let forked = f.chapters.list(branch.id).await.unwrap();
    for chapter in &forked {
        f.store.slow.insert(chapter.id);
    }

    let report = f.manager.merge(story.id, branch.id).await.unwrap();
    assert!(!report.complete);
    assert_eq!(report.chapters_changed_count, 0);
    assert_eq!(report.timed_out(), forked.iter().map(|c| c.id).collect::<Vec<_>>());
    assert_eq!(
        f.manager.get_branch(branch.id).await.unwrap().status,
        BranchStatus::Active
    );
}
