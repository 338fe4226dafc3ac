//! Wiring of the document registry, branch manager and chapter service.

use crate::error::Result;
use std::sync::Arc;
use storyloom_branch::{BranchGraphManager, ChapterService, InMemoryMetadataStore, MetadataStore};
use storyloom_collab::{DocumentRegistry, EngineConfig, InMemoryPersistence, PersistenceAdapter};
use storyloom_config::ConfigService;
use storyloom_log::info;

/// One process's view of Storyloom: live chapter documents plus the branch
/// metadata that ties them into stories.
#[derive(Clone)]
pub struct Engine {
    registry: DocumentRegistry,
    branches: BranchGraphManager,
    chapters: ChapterService,
}

impl Engine {
    pub fn new(
        persistence: Arc<dyn PersistenceAdapter>,
        store: Arc<dyn MetadataStore>,
        config: EngineConfig,
    ) -> Self {
        storyloom_log::init();
        let registry = DocumentRegistry::new(persistence, config);
        let branches = BranchGraphManager::new(store, registry.clone());
        let chapters = ChapterService::new(branches.clone());
        Self {
            registry,
            branches,
            chapters,
        }
    }

    /// Everything in memory. Nothing survives the process.
    pub fn in_memory(config: EngineConfig) -> Self {
        Self::new(
            Arc::new(InMemoryPersistence::new()),
            Arc::new(InMemoryMetadataStore::new()),
            config,
        )
    }

    /// Build with tuning read from `config` (see [`EngineConfig::from_service`]).
    pub fn from_service(
        config: &ConfigService,
        persistence: Arc<dyn PersistenceAdapter>,
        store: Arc<dyn MetadataStore>,
    ) -> Result<Self> {
        let engine = EngineConfig::from_service(config)?;
        Ok(Self::new(persistence, store, engine))
    }

    /// Re-register merged branches as read-only. Call once after construction
    /// when the stores already hold data.
    pub async fn restore(&self) -> Result<usize> {
        let retired = self.branches.restore().await?;
        info!(
            "engine restored: {} merged branches, {} live documents",
            retired,
            self.registry.live_count()
        );
        Ok(retired)
    }

    pub fn config(&self) -> &EngineConfig {
        self.registry.config()
    }

    pub fn registry(&self) -> &DocumentRegistry {
        &self.registry
    }

    pub fn branches(&self) -> &BranchGraphManager {
        &self.branches
    }

    pub fn chapters(&self) -> &ChapterService {
        &self.chapters
    }

    /// Snapshot every live document without stopping it.
    pub async fn flush(&self) -> Result<()> {
        self.registry.flush_all().await?;
        Ok(())
    }

    /// Snapshot and stop every live document.
    pub async fn shutdown(&self) {
        info!("engine shutting down with {} live documents", self.registry.live_count());
        self.registry.shutdown().await;
    }

    /// A sync server whose connections must name a chapter that exists on
    /// the branch in the path.
    #[cfg(feature = "websocket")]
    pub fn sync_server(
        &self,
        config: storyloom_websocket::SyncServerConfig,
    ) -> storyloom_websocket::SyncServer {
        storyloom_websocket::SyncServer::new(config, self.registry.clone())
            .with_resolver(crate::resolver::ChapterResolver::new(self.branches.store().clone()))
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}
