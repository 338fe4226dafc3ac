//! Stories as graphs of branches, each holding its own copy of every chapter.
//!
//! A branch forks all chapters of its parent by value: each chapter gets a new
//! id and a document seeded from the parent's current state. Merging a branch
//! back into its direct parent combines the chapter documents and retires the
//! branch, which is read-only from then on.
//!
//! ```rust,ignore
//! use storyloom_branch::{BranchGraphManager, ChapterService, CreateStory, InMemoryMetadataStore, NewChapter};
//!
//! let manager = BranchGraphManager::new(Arc::new(InMemoryMetadataStore::new()), registry);
//! let chapters = ChapterService::new(manager.clone());
//!
//! let (story, main) = manager.create_story(CreateStory::new("ada", "The Loom")).await?;
//! chapters.create(main.id, NewChapter::new("One", "Hello")).await?;
//!
//! let what_if = manager.create_branch(story.id, main.id, "what-if").await?;
//! // ... edit chapters on `what_if` ...
//! let report = manager.merge(story.id, what_if.id).await?;
//! println!("{} chapters changed", report.chapters_changed_count);
//! ```

pub mod chapters;
pub mod error;
pub mod graph;
pub mod manager;
pub mod merge;
pub mod model;
pub mod store;

pub use chapters::{ChapterDetail, ChapterService};
pub use error::{BranchError, BranchResult, MergeError, MergeResult};
pub use graph::BranchGraph;
pub use manager::BranchGraphManager;
pub use merge::{
    ChapterMerge, ChapterOutcome, DocumentMerge, MergeKind, MergeReport, merge_documents, merge_operations,
};
pub use model::{
    Branch, BranchStatus, BranchUpdate, Chapter, ChapterUpdate, CreateStory, Metadata, NewChapter, Story,
    word_count,
};
pub use store::{InMemoryMetadataStore, MetadataStore};
