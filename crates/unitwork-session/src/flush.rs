//! Flush planning.
//!
//! Change sets computed for one flush are grouped by kind and by entity
//! root. The orchestrator walks the groups in the fixed phase order:
//!
//! - early deletes, reverse commit order
//! - early updates, commit order
//! - creates, commit order
//! - updates, commit order
//! - extra updates, then collection synchronizations
//! - deletes, reverse commit order

use std::collections::HashMap;

use serde::Serialize;

use crate::change_set::{ChangeSet, ChangeSetKind};

/// Change sets of one flush, grouped for execution.
#[derive(Debug, Default)]
pub struct FlushPlan {
    order: Vec<&'static str>,
    groups: HashMap<(ChangeSetKind, &'static str), Vec<ChangeSet>>,
    len: usize,
}

impl FlushPlan {
    /// Group `change_sets` under the given commit order.
    ///
    /// Roots missing from `order` are appended in first-seen order.
    pub fn new(change_sets: Vec<ChangeSet>, order: Vec<&'static str>) -> Self {
        let mut plan = Self {
            order,
            groups: HashMap::new(),
            len: change_sets.len(),
        };
        for cs in change_sets {
            let root = cs.root();
            if !plan.order.contains(&root) {
                plan.order.push(root);
            }
            plan.groups.entry((cs.kind, root)).or_default().push(cs);
        }
        plan
    }

    /// Entity roots in commit order.
    pub fn order(&self) -> &[&'static str] {
        &self.order
    }

    /// Roots in the order a phase of `kind` visits them.
    pub fn phase_order(&self, kind: ChangeSetKind) -> Vec<&'static str> {
        let mut roots: Vec<&'static str> = self
            .order
            .iter()
            .copied()
            .filter(|root| self.groups.contains_key(&(kind, *root)))
            .collect();
        if kind.is_delete() {
            roots.reverse();
        }
        roots
    }

    pub fn group_mut(&mut self, kind: ChangeSetKind, root: &'static str) -> Option<&mut Vec<ChangeSet>> {
        self.groups.get_mut(&(kind, root))
    }

    pub fn group(&self, kind: ChangeSetKind, root: &'static str) -> &[ChangeSet] {
        self.groups.get(&(kind, root)).map_or(&[], Vec::as_slice)
    }

    /// Every change set, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &ChangeSet> {
        self.groups.values().flatten()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ChangeSet> {
        self.groups.values_mut().flatten()
    }

    pub fn count(&self, kind: ChangeSetKind) -> usize {
        self.groups
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .map(|(_, group)| group.len())
            .sum()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Result of a flush operation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FlushResult {
    /// Number of rows inserted.
    pub inserted: usize,
    /// Number of rows updated, early updates included.
    pub updated: usize,
    /// Number of rows deleted, early deletes included.
    pub deleted: usize,
    /// Number of extra updates written.
    pub extra_updates: usize,
    /// Number of collections synchronized.
    pub collections: usize,
}

impl FlushResult {
    /// Create a new empty result.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of operations performed.
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted + self.extra_updates + self.collections
    }
}
