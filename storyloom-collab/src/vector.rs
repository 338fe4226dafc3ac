//! State vectors: per replica, the highest clock integrated.
//!
//! Clocks are dense per replica, so a vector entry `r -> n` means every
//! operation `(r, 1..=n)` has been integrated. That makes "has this op been
//! seen" a single comparison and makes delta computation a filter over the
//! operation log.

use crate::{ItemId, Operation, ReplicaId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateVector {
    clocks: BTreeMap<ReplicaId, u64>,
}

impl StateVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, replica: &ReplicaId) -> u64 {
        self.clocks.get(replica).copied().unwrap_or(0)
    }

    /// Record that `replica` has reached `clock`. Never moves backwards.
    pub fn observe(&mut self, replica: ReplicaId, clock: u64) {
        let entry = self.clocks.entry(replica).or_insert(0);
        *entry = (*entry).max(clock);
    }

    pub fn contains(&self, id: &ItemId) -> bool {
        id.clock > 0 && id.clock <= self.get(&id.replica)
    }

    /// Pointwise maximum.
    pub fn merge_vector(&mut self, remote: &StateVector) {
        for (replica, clock) in &remote.clocks {
            self.observe(*replica, *clock);
        }
    }

    /// Every entry of `other` is covered by `self`.
    pub fn dominates(&self, other: &StateVector) -> bool {
        other
            .clocks
            .iter()
            .all(|(replica, clock)| self.get(replica) >= *clock)
    }

    pub fn is_concurrent(&self, other: &StateVector) -> bool {
        !self.dominates(other) && !other.dominates(self)
    }

    /// Per replica, the clock range `remote` lacks: `(replica, first_missing, last)`.
    pub fn missing_from(&self, remote: &StateVector) -> Vec<(ReplicaId, u64, u64)> {
        self.clocks
            .iter()
            .filter_map(|(replica, &clock)| {
                let have = remote.get(replica);
                (clock > have).then_some((*replica, have + 1, clock))
            })
            .collect()
    }

    /// Total number of operations summarized.
    pub fn total(&self) -> u64 {
        self.clocks.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.clocks.values().all(|c| *c == 0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ReplicaId, &u64)> {
        self.clocks.iter()
    }
}

/// Operations in `log` that a peer at `remote` has not integrated, in log order.
///
/// `log` must be in integration order, which is causal order; the result is
/// therefore causally ordered per replica and across replicas.
pub fn diff(log: &[Operation], remote: &StateVector) -> Vec<Operation> {
    log.iter()
        .filter(|op| op.clock > remote.get(&op.replica_id))
        .cloned()
        .collect()
}
