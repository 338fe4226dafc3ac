//! Parent/child graph of one story's branches.

use crate::error::{BranchError, BranchResult};
use crate::model::Branch;
use std::collections::{BTreeSet, HashMap, HashSet};
use storyloom_collab::BranchId;

/// Branch DAG. Every branch has at most one parent, so in practice it is a
/// tree rooted at the story's root branch.
#[derive(Debug, Clone, Default)]
pub struct BranchGraph {
    nodes: BTreeSet<BranchId>,
    parents: HashMap<BranchId, BranchId>,
    children: HashMap<BranchId, BTreeSet<BranchId>>,
}

impl BranchGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from stored rows; rejects a parent link that would close a cycle.
    pub fn from_branches(branches: &[Branch]) -> BranchResult<Self> {
        let mut graph = Self::new();
        for branch in branches {
            graph.add_node(branch.id);
        }
        for branch in branches {
            if let Some(parent) = branch.parent_branch_id {
                graph.add_edge(parent, branch.id)?;
            }
        }
        Ok(graph)
    }

    pub fn add_node(&mut self, id: BranchId) {
        self.nodes.insert(id);
    }

    pub fn contains(&self, id: &BranchId) -> bool {
        self.nodes.contains(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Link `child` under `parent`.
    pub fn add_edge(&mut self, parent: BranchId, child: BranchId) -> BranchResult<()> {
        if !self.contains(&parent) {
            return Err(BranchError::InvalidParent {
                parent,
                reason: "not part of this story".into(),
            });
        }
        match self.parents.get(&child) {
            Some(existing) if *existing == parent => return Ok(()),
            Some(existing) => {
                return Err(BranchError::InvalidParent {
                    parent,
                    reason: format!("{child} already has parent {existing}"),
                });
            }
            None => {}
        }
        if self.would_create_cycle(parent, child) {
            return Err(BranchError::Cycle { parent, child });
        }

        self.nodes.insert(child);
        self.parents.insert(child, parent);
        self.children.entry(parent).or_default().insert(child);
        Ok(())
    }

    /// Adding `parent -> child` closes a cycle when `parent` is already
    /// reachable from `child`.
    fn would_create_cycle(&self, parent: BranchId, child: BranchId) -> bool {
        let mut visited = HashSet::new();
        let mut stack = vec![child];
        while let Some(current) = stack.pop() {
            if current == parent {
                return true;
            }
            if !visited.insert(current) {
                continue;
            }
            if let Some(children) = self.children.get(&current) {
                stack.extend(children.iter().copied());
            }
        }
        false
    }

    pub fn parent(&self, id: &BranchId) -> Option<BranchId> {
        self.parents.get(id).copied()
    }

    pub fn children(&self, id: &BranchId) -> Vec<BranchId> {
        self.children
            .get(id)
            .map(|c| c.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Parent chain, nearest first.
    pub fn ancestors(&self, id: &BranchId) -> Vec<BranchId> {
        let mut chain = Vec::new();
        let mut current = *id;
        while let Some(parent) = self.parent(&current) {
            chain.push(parent);
            current = parent;
        }
        chain
    }

    pub fn is_ancestor(&self, ancestor: &BranchId, of: &BranchId) -> bool {
        self.ancestors(of).contains(ancestor)
    }

    /// All branches below `id`, breadth first.
    pub fn descendants(&self, id: &BranchId) -> Vec<BranchId> {
        let mut out = Vec::new();
        let mut queue = std::collections::VecDeque::from(self.children(id));
        while let Some(next) = queue.pop_front() {
            out.push(next);
            queue.extend(self.children(&next));
        }
        out
    }

    pub fn depth(&self, id: &BranchId) -> usize {
        self.ancestors(id).len()
    }

    /// Remove a branch with no children.
    pub fn remove_leaf(&mut self, id: &BranchId) -> BranchResult<()> {
        if self.children.get(id).is_some_and(|c| !c.is_empty()) {
            return Err(BranchError::Invalid(format!("branch {id} still has child branches")));
        }
        if let Some(parent) = self.parents.remove(id)
            && let Some(siblings) = self.children.get_mut(&parent)
        {
            siblings.remove(id);
        }
        self.children.remove(id);
        self.nodes.remove(id);
        Ok(())
    }
}
