//! Deciding whether a connection's document exists.

use crate::error::SyncServerResult;
use async_trait::async_trait;
use storyloom_collab::{DocumentKey, DocumentRegistry};

/// Checked once per connection, right after the upgrade.
///
/// The registry would happily spawn an empty document for any key, so the
/// transport asks a resolver first.
#[async_trait]
pub trait DocumentResolver: Send + Sync + 'static {
    /// Whether a chapter document exists under `key`.
    async fn exists(&self, key: &DocumentKey) -> SyncServerResult<bool>;
}

/// Accepts a key when its actor is live or anything is persisted for it.
#[derive(Clone)]
pub struct RegistryResolver {
    registry: DocumentRegistry,
}

impl RegistryResolver {
    /// Create a resolver backed by `registry`.
    pub fn new(registry: DocumentRegistry) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl DocumentResolver for RegistryResolver {
    async fn exists(&self, key: &DocumentKey) -> SyncServerResult<bool> {
        if self.registry.get(key).is_some() {
            return Ok(true);
        }
        let persisted = self.registry.persistence().load(key).await?;
        Ok(!persisted.is_empty())
    }
}

/// Accepts every key. Documents are created on first attach.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

#[async_trait]
impl DocumentResolver for AcceptAll {
    async fn exists(&self, _key: &DocumentKey) -> SyncServerResult<bool> {
        Ok(true)
    }
}
