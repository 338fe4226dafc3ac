//! Collaborative chapter text.
//!
//! A YATA-style sequence CRDT. Every character is an item carrying the ids of
//! its left and right neighbours at the time it was typed; deletes tombstone
//! items instead of removing them. Remote inserts are placed by scanning the
//! items between the two origins, which makes the final order independent of
//! arrival order. Concurrent inserts with the same origins are ordered by
//! [`ItemId`] ascending.

use crate::vector::{self, StateVector};
use crate::{CollabError, CollabResult, Crdt, ItemId, OpKind, Operation, RejectReason, ReplicaId};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Item {
    id: ItemId,
    origin_left: Option<ItemId>,
    origin_right: Option<ItemId>,
    ch: char,
    deleted: bool,
}

/// A local, index-based edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalEdit {
    Insert { index: usize, ch: char },
    Delete { index: usize },
}

/// Outcome of a successful [`TextDocument::apply_remote`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Integration {
    /// The operation changed the document and was appended to the log.
    Applied,
    /// Already reflected in the state vector; dropped.
    Duplicate,
}

/// Result of integrating a batch in any order.
#[derive(Debug, Clone, Default)]
pub struct Absorbed {
    /// Newly integrated operations, in integration order
    pub applied: Vec<Operation>,
    /// Operations whose dependencies are still missing
    pub unresolved: Vec<Operation>,
}

#[derive(Serialize)]
struct SnapshotRef<'a> {
    version: u32,
    ops: &'a [Operation],
}

#[derive(Deserialize)]
struct SnapshotOwned {
    version: u32,
    ops: Vec<Operation>,
}

/// One chapter's text as seen by one replica.
#[derive(Debug, Clone)]
pub struct TextDocument {
    replica: ReplicaId,
    items: Vec<Item>,
    vector: StateVector,
    log: Vec<Operation>,
}

impl TextDocument {
    pub fn new(replica: ReplicaId) -> Self {
        Self {
            replica,
            items: Vec::new(),
            vector: StateVector::new(),
            log: Vec::new(),
        }
    }

    /// A document whose initial content was typed by `replica`.
    pub fn with_text(replica: ReplicaId, text: &str) -> CollabResult<Self> {
        let mut doc = Self::new(replica);
        doc.insert(0, text)?;
        Ok(doc)
    }

    /// Same state, different local replica. Used when a fork or restored
    /// document continues under a new identity.
    pub fn with_replica(&self, replica: ReplicaId) -> Self {
        Self {
            replica,
            ..self.clone()
        }
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.replica
    }

    pub fn text(&self) -> String {
        self.items
            .iter()
            .filter(|item| !item.deleted)
            .map(|item| item.ch)
            .collect()
    }

    /// Visible character count.
    pub fn len(&self) -> usize {
        self.items.iter().filter(|item| !item.deleted).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn word_count(&self) -> usize {
        self.text().split_whitespace().count()
    }

    pub fn tombstones(&self) -> usize {
        self.items.iter().filter(|item| item.deleted).count()
    }

    pub fn vector(&self) -> &StateVector {
        &self.vector
    }

    /// Every integrated operation, in integration order.
    pub fn operations(&self) -> &[Operation] {
        &self.log
    }

    /// Operations a peer at `remote` is missing.
    pub fn diff(&self, remote: &StateVector) -> Vec<Operation> {
        vector::diff(&self.log, remote)
    }

    fn next_clock(&self) -> u64 {
        self.vector.get(&self.replica) + 1
    }

    fn position_of(&self, id: ItemId) -> Option<usize> {
        self.items.iter().position(|item| item.id == id)
    }

    /// Index into `items` of the `index`th visible character.
    fn visible_position(&self, index: usize) -> Option<usize> {
        self.items
            .iter()
            .enumerate()
            .filter(|(_, item)| !item.deleted)
            .nth(index)
            .map(|(pos, _)| pos)
    }

    fn commit(&mut self, op: Operation) {
        self.vector.observe(op.replica_id, op.clock);
        self.log.push(op);
    }

    /// Apply an edit made on this replica and return the operation to broadcast.
    pub fn apply_local(&mut self, edit: LocalEdit) -> CollabResult<Operation> {
        let len = self.len();
        let clock = self.next_clock();

        let kind = match edit {
            LocalEdit::Insert { index, ch } => {
                if index > len {
                    return Err(CollabError::OutOfBounds { index, len });
                }
                let (origin_left, insert_at) = match index {
                    0 => (None, 0),
                    _ => {
                        let pos = self
                            .visible_position(index - 1)
                            .ok_or(CollabError::OutOfBounds { index, len })?;
                        (Some(self.items[pos].id), pos + 1)
                    }
                };
                let origin_right = self.items.get(insert_at).map(|item| item.id);
                self.items.insert(
                    insert_at,
                    Item {
                        id: ItemId::new(self.replica, clock),
                        origin_left,
                        origin_right,
                        ch,
                        deleted: false,
                    },
                );
                OpKind::Insert {
                    origin_left,
                    origin_right,
                    ch,
                }
            }
            LocalEdit::Delete { index } => {
                let pos = self
                    .visible_position(index)
                    .ok_or(CollabError::OutOfBounds { index, len })?;
                self.items[pos].deleted = true;
                OpKind::Delete {
                    target: self.items[pos].id,
                }
            }
        };

        let op = Operation {
            replica_id: self.replica,
            clock,
            kind,
        };
        self.commit(op.clone());
        Ok(op)
    }

    /// Insert `text` at visible index `index`, one operation per character.
    pub fn insert(&mut self, index: usize, text: &str) -> CollabResult<Vec<Operation>> {
        let len = self.len();
        if index > len {
            return Err(CollabError::OutOfBounds { index, len });
        }
        text.chars()
            .enumerate()
            .map(|(offset, ch)| {
                self.apply_local(LocalEdit::Insert {
                    index: index + offset,
                    ch,
                })
            })
            .collect()
    }

    /// Delete `count` visible characters starting at `index`.
    pub fn delete(&mut self, index: usize, count: usize) -> CollabResult<Vec<Operation>> {
        let len = self.len();
        if index + count > len {
            return Err(CollabError::OutOfBounds {
                index: index + count,
                len,
            });
        }
        (0..count)
            .map(|_| self.apply_local(LocalEdit::Delete { index }))
            .collect()
    }

    /// Turn the current text into `new_text` with the smallest prefix/suffix
    /// preserving edit, authored by this replica.
    pub fn replace_text(&mut self, new_text: &str) -> CollabResult<Vec<Operation>> {
        let old: Vec<char> = self.text().chars().collect();
        let new: Vec<char> = new_text.chars().collect();

        let prefix = old.iter().zip(&new).take_while(|(a, b)| a == b).count();
        let suffix = old[prefix..]
            .iter()
            .rev()
            .zip(new[prefix..].iter().rev())
            .take_while(|(a, b)| a == b)
            .count();

        let mut ops = self.delete(prefix, old.len() - prefix - suffix)?;
        let inserted: String = new[prefix..new.len() - suffix].iter().collect();
        ops.extend(self.insert(prefix, &inserted)?);
        Ok(ops)
    }

    fn require(&self, op: ItemId, dependency: ItemId) -> Result<usize, RejectReason> {
        if let Some(pos) = self.position_of(dependency) {
            return Ok(pos);
        }
        if self.vector.contains(&dependency) {
            return Err(RejectReason::Malformed {
                op,
                detail: format!("{} is not an inserted item", dependency),
            });
        }
        Err(RejectReason::UnknownDependency {
            op,
            missing: dependency,
        })
    }

    /// Integrate an operation from another replica.
    ///
    /// Operations already covered by the state vector are dropped. An operation
    /// is rejected with [`RejectReason::UnknownDependency`] when its replica's
    /// previous clock or any item it references has not been integrated.
    pub fn apply_remote(&mut self, op: &Operation) -> Result<Integration, RejectReason> {
        let id = op.id();
        if op.clock == 0 {
            return Err(RejectReason::Malformed {
                op: id,
                detail: "clocks start at 1".to_string(),
            });
        }

        let seen = self.vector.get(&op.replica_id);
        if op.clock <= seen {
            return Ok(Integration::Duplicate);
        }
        if op.clock != seen + 1 {
            return Err(RejectReason::UnknownDependency {
                op: id,
                missing: ItemId::new(op.replica_id, seen + 1),
            });
        }

        match op.kind {
            OpKind::Insert {
                origin_left,
                origin_right,
                ch,
            } => {
                let left = origin_left
                    .map(|origin| self.require(id, origin))
                    .transpose()?;
                let right = match origin_right {
                    Some(origin) => self.require(id, origin)?,
                    None => self.items.len(),
                };
                if left.is_some_and(|left| left >= right) {
                    return Err(RejectReason::Malformed {
                        op: id,
                        detail: "left origin is not before right origin".to_string(),
                    });
                }
                self.integrate(
                    Item {
                        id,
                        origin_left,
                        origin_right,
                        ch,
                        deleted: false,
                    },
                    left,
                    right,
                );
            }
            OpKind::Delete { target } => {
                let pos = self.require(id, target)?;
                self.items[pos].deleted = true;
            }
        }

        self.commit(op.clone());
        Ok(Integration::Applied)
    }

    fn integrate(&mut self, item: Item, left: Option<usize>, right: usize) {
        let start = left.map_or(0, |left| left + 1);
        let mut insert_at = start;
        let mut before_origin = HashSet::new();
        let mut conflicting = HashSet::new();

        for (offset, other) in self.items[start..right].iter().enumerate() {
            before_origin.insert(other.id);
            conflicting.insert(other.id);

            if other.origin_left == item.origin_left {
                if other.id < item.id {
                    insert_at = start + offset + 1;
                    conflicting.clear();
                } else if other.origin_right == item.origin_right {
                    break;
                }
            } else if let Some(origin) = other
                .origin_left
                .filter(|origin| before_origin.contains(origin))
            {
                if !conflicting.contains(&origin) {
                    insert_at = start + offset + 1;
                    conflicting.clear();
                }
            } else {
                break;
            }
        }

        self.items.insert(insert_at, item);
    }

    /// Integrate a batch whose operations may arrive in any order.
    pub fn absorb(&mut self, ops: &[Operation]) -> Absorbed {
        let mut absorbed = Absorbed::default();
        let mut pending: Vec<&Operation> = ops.iter().collect();

        loop {
            let mut waiting = Vec::new();
            let mut progressed = false;

            for op in pending {
                match self.apply_remote(op) {
                    Ok(Integration::Applied) => {
                        absorbed.applied.push(op.clone());
                        progressed = true;
                    }
                    Ok(Integration::Duplicate) => {}
                    Err(RejectReason::UnknownDependency { .. }) => waiting.push(op),
                    Err(reason) => {
                        storyloom_log::warn!("dropping operation from batch: {}", reason);
                    }
                }
            }

            if waiting.is_empty() || !progressed {
                absorbed.unresolved = waiting.into_iter().cloned().collect();
                return absorbed;
            }
            pending = waiting;
        }
    }

    /// Id of the visible character left of `index`, for cursor anchoring.
    pub fn anchor_at(&self, index: usize) -> Option<ItemId> {
        index
            .checked_sub(1)
            .and_then(|left| self.visible_position(left))
            .map(|pos| self.items[pos].id)
    }

    /// Current visible index right of `anchor`. A deleted anchor resolves to
    /// where its text used to be; an unknown one to the end of the document.
    pub fn index_of_anchor(&self, anchor: Option<ItemId>) -> usize {
        let Some(anchor) = anchor else {
            return 0;
        };
        match self.position_of(anchor) {
            Some(pos) => self.items[..=pos].iter().filter(|item| !item.deleted).count(),
            None => self.len(),
        }
    }

    /// Serialized operation log. Replaying it reproduces the document exactly.
    pub fn snapshot(&self) -> CollabResult<Bytes> {
        let body = SnapshotRef {
            version: SNAPSHOT_VERSION,
            ops: &self.log,
        };
        Ok(Bytes::from(serde_json::to_vec(&body)?))
    }

    /// Rebuild a document from [`snapshot`](Self::snapshot) bytes, continuing as `replica`.
    pub fn from_snapshot(replica: ReplicaId, bytes: &[u8]) -> CollabResult<Self> {
        let body: SnapshotOwned = serde_json::from_slice(bytes)?;
        if body.version != SNAPSHOT_VERSION {
            return Err(CollabError::Serialization(format!(
                "unsupported snapshot version {}",
                body.version
            )));
        }

        let mut doc = Self::new(replica);
        for op in &body.ops {
            doc.apply_remote(op)?;
        }
        Ok(doc)
    }
}

impl Crdt for TextDocument {
    fn merge(&mut self, other: &Self) {
        let missing = other.diff(&self.vector);
        let absorbed = self.absorb(&missing);
        if !absorbed.unresolved.is_empty() {
            storyloom_log::error!(
                "merge left {} operations unresolved",
                absorbed.unresolved.len()
            );
        }
    }
}
