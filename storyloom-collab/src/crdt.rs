//! Operation types shared by the sequence CRDT and the sync protocol.

use crate::ReplicaId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Trait for replicated state that can absorb another replica's state.
pub trait Crdt: Clone {
    /// Merge with another replica. Idempotent, commutative and associative.
    fn merge(&mut self, other: &Self);
}

/// Identity of one operation, and of the item an insert creates.
///
/// Ordering is `(replica, clock)` ascending. Concurrent inserts at the same
/// position are placed in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ItemId {
    pub replica: ReplicaId,
    pub clock: u64,
}

impl ItemId {
    pub fn new(replica: ReplicaId, clock: u64) -> Self {
        Self { replica, clock }
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.replica, self.clock)
    }
}

/// What an operation does. The position reference is always CRDT identity,
/// never a raw index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op_type", rename_all = "snake_case")]
pub enum OpKind {
    /// Insert one character between two neighbours as they were seen by the author.
    Insert {
        origin_left: Option<ItemId>,
        origin_right: Option<ItemId>,
        ch: char,
    },
    /// Tombstone an inserted item.
    Delete { target: ItemId },
}

/// One replicated edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub replica_id: ReplicaId,
    pub clock: u64,
    #[serde(flatten)]
    pub kind: OpKind,
}

/// An operation produced locally, ready to send to peers.
pub type BroadcastOp = Operation;

impl Operation {
    pub fn id(&self) -> ItemId {
        ItemId::new(self.replica_id, self.clock)
    }

    pub fn is_insert(&self) -> bool {
        matches!(self.kind, OpKind::Insert { .. })
    }

    /// Items this operation references and therefore must be integrated first.
    pub fn references(&self) -> impl Iterator<Item = ItemId> {
        let (a, b) = match self.kind {
            OpKind::Insert {
                origin_left,
                origin_right,
                ..
            } => (origin_left, origin_right),
            OpKind::Delete { target } => (Some(target), None),
        };
        a.into_iter().chain(b)
    }
}
