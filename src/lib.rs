//! Storyloom: real-time collaborative chapter editing with story branches.
//!
//! Each chapter of each branch is a CRDT document owned by a document actor;
//! clients sync with it over a per-chapter connection. Branches fork every
//! chapter of their parent and merge back into it. This crate re-exports the
//! member crates and wires them together in [`Engine`].
//!
//! ```rust,no_run
//! use storyloom::prelude::*;
//!
//! # async fn run() -> storyloom::Result<()> {
//! let engine = Engine::in_memory(EngineConfig::default());
//! let (story, main) = engine.branches().create_story(CreateStory::new("ada", "The Loom")).await?;
//! engine.chapters().create(main.id, NewChapter::new("One", "Hello")).await?;
//!
//! let draft = engine.branches().create_branch(story.id, main.id, "draft").await?;
//! let report = engine.branches().merge(story.id, draft.id).await?;
//! assert!(report.is_fast_forward());
//! # Ok(())
//! # }
//! ```

mod engine;
mod error;
#[cfg(feature = "websocket")]
mod resolver;

pub use engine::Engine;
pub use error::{Error, Result};
#[cfg(feature = "websocket")]
pub use resolver::ChapterResolver;

pub use storyloom_branch;
pub use storyloom_collab;
pub use storyloom_config;
pub use storyloom_log;
#[cfg(feature = "websocket")]
pub use storyloom_websocket;

// Prelude for common imports
pub mod prelude {
    pub use crate::{Engine, Error, Result};
    pub use storyloom_branch::{
        Branch, BranchGraphManager, BranchStatus, Chapter, ChapterService, ChapterUpdate, CreateStory,
        MergeReport, NewChapter, Story,
    };
    pub use storyloom_collab::{
        BranchId, ChapterId, DocumentKey, EngineConfig, StoryId, SyncClient, SyncMessage,
    };
    pub use storyloom_config::ConfigService;
    #[cfg(feature = "websocket")]
    pub use storyloom_websocket::{SyncServer, SyncServerConfig};
}
