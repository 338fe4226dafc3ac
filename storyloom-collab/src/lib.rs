//! Real-time chapter synchronization for Storyloom.
//!
//! Every chapter of every branch is a [`TextDocument`], a sequence CRDT owned
//! by exactly one [`DocumentActor`] while it is live. Clients keep their own
//! replica of the document and exchange operations with the actor through a
//! [`ServerSession`] speaking the [`SyncMessage`] protocol.
//!
//! ## Overview
//!
//! ```text
//! ┌──────────┐  SyncMessage  ┌───────────────┐  Command  ┌───────────────┐
//! │SyncClient│──────────────▶│ ServerSession │──────────▶│ DocumentActor │
//! └──────────┘◀──────────────└───────────────┘◀──────────└───────────────┘
//!       ▲          broadcast (Op / Delta / Awareness)            │
//!       └────────────────────────────────────────────────────────┤
//!                                                                 ▼
//!                                                     ┌─────────────────────┐
//!                                                     │ PersistenceAdapter  │
//!                                                     └─────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use storyloom_collab::{ReplicaId, TextDocument};
//!
//! let mut alice = TextDocument::new(ReplicaId::from_u128(1));
//! let mut bob = TextDocument::new(ReplicaId::from_u128(2));
//!
//! for op in alice.insert(0, "Hello").unwrap() {
//!     bob.apply_remote(&op).unwrap();
//! }
//! let ops = bob.insert(5, "!").unwrap();
//! for op in &ops {
//!     alice.apply_remote(op).unwrap();
//! }
//! assert_eq!(alice.text(), "Hello!");
//! assert_eq!(alice.text(), bob.text());
//! ```

pub mod actor;
pub mod config;
pub mod crdt;
pub mod error;
pub mod persistence;
pub mod presence;
pub mod registry;
pub mod session;
pub mod sync;
pub mod text;
pub mod vector;

pub use actor::{ActorHandle, AttachInfo, DocumentActor, DocumentView};
pub use config::EngineConfig;
pub use crdt::{BroadcastOp, Crdt, ItemId, OpKind, Operation};
pub use error::{BranchStateError, CollabError, CollabResult, RejectReason, SessionError};
pub use persistence::{
    DocumentSnapshot, InMemoryPersistence, PersistedDocument, PersistenceAdapter, RetryPolicy,
};
pub use presence::{CursorPosition, PresenceStatus, PresenceTable, SelectionRange, UserPresence};
pub use registry::DocumentRegistry;
pub use session::{ServerSession, ServerSessionState};
pub use sync::{OperationBuffer, SyncClient, SyncErrorCode, SyncMessage, SyncState, SyncStats};
pub use text::{Absorbed, Integration, LocalEdit, TextDocument};
pub use vector::StateVector;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a replica (one editing client of one document)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicaId(pub Uuid);

impl ReplicaId {
    /// Create a new random replica ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Deterministic id, mostly useful in tests where tie-breaks must be predictable.
    pub fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }
}

impl Default for ReplicaId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

uuid_id!(
    /// Story identifier
    StoryId
);
uuid_id!(
    /// Branch identifier
    BranchId
);
uuid_id!(
    /// Chapter identifier. A forked chapter gets a new id.
    ChapterId
);
uuid_id!(
    /// One attached connection to a document actor
    SessionId
);

/// Addresses one chapter document: the chapter as it exists on one branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocumentKey {
    pub branch_id: BranchId,
    pub chapter_id: ChapterId,
}

impl DocumentKey {
    pub fn new(branch_id: BranchId, chapter_id: ChapterId) -> Self {
        Self {
            branch_id,
            chapter_id,
        }
    }
}

impl std::fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.branch_id, self.chapter_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replica_ordering_follows_uuid() {
        assert!(ReplicaId::from_u128(1) < ReplicaId::from_u128(2));
        assert_ne!(ReplicaId::new(), ReplicaId::new());
    }

    #[test]
    fn test_id_parse_and_display() {
        let id = BranchId::new();
        let parsed: BranchId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<ChapterId>().is_err());
    }

    #[test]
    fn test_document_key_serializes_as_object() {
        let key = DocumentKey::new(BranchId::new(), ChapterId::new());
        let json = serde_json::to_value(key).unwrap();
        assert!(json.get("branch_id").is_some());
        assert!(json.get("chapter_id").is_some());
    }
}
