//! Commit order calculation.
//!
//! Entity types form a graph where an edge `dependency -> dependent` means the
//! dependency's rows must be inserted first (and deleted last). The sort is a
//! depth-first topological sort that tolerates cycles: when it meets a node
//! that is still on the stack, edge weights decide which side gets cut.
//!
//! Weights: `1` for a required foreign key, `0` for a nullable, non-persisted
//! or self-referencing one. Nodes and edges live in flat vectors and refer to
//! each other by index.

use std::collections::HashMap;

use unitwork_core::{EntityMeta, MetadataStorage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VisitState {
    NotVisited,
    InProgress,
    Visited,
}

#[derive(Debug, Clone, Copy)]
struct Edge {
    to: usize,
    weight: u8,
}

#[derive(Debug)]
struct Node {
    name: &'static str,
    state: VisitState,
    /// Outgoing edges in insertion order
    edges: Vec<Edge>,
}

impl Node {
    fn edge_to(&self, target: usize) -> Option<Edge> {
        self.edges.iter().copied().find(|e| e.to == target)
    }
}

/// Topological sorter for entity types.
#[derive(Debug, Default)]
pub struct CommitOrderCalculator {
    nodes: Vec<Node>,
    index: HashMap<&'static str, usize>,
    sorted: Vec<usize>,
}

impl CommitOrderCalculator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a calculator over every registered entity root.
    pub fn from_metadata(storage: &MetadataStorage) -> Self {
        let mut calc = Self::new();
        for meta in storage.iter() {
            calc.add_node(meta.root);
        }
        for meta in storage.iter() {
            calc.discover_properties(meta, storage);
        }
        calc
    }

    /// Add a node, returning its index. Adding an existing name is a no-op.
    pub fn add_node(&mut self, name: &'static str) -> usize {
        if let Some(&idx) = self.index.get(name) {
            return idx;
        }
        let idx = self.nodes.len();
        self.nodes.push(Node {
            name,
            state: VisitState::NotVisited,
            edges: Vec::new(),
        });
        self.index.insert(name, idx);
        idx
    }

    pub fn has_node(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// `from` must be committed before `to`. A repeated edge replaces the weight.
    pub fn add_dependency(&mut self, from: &'static str, to: &'static str, weight: u8) {
        let from = self.add_node(from);
        let to = self.add_node(to);
        let node = &mut self.nodes[from];
        match node.edges.iter_mut().find(|e| e.to == to) {
            Some(edge) => edge.weight = weight,
            None => node.edges.push(Edge { to, weight }),
        }
    }

    /// Add edges for the relations of one entity type.
    ///
    /// Only owning to-one relations and inline many-to-many collections carry
    /// a foreign key on this entity's row; pivot collections are synchronized
    /// after all inserts and never constrain the order.
    pub fn discover_properties(&mut self, meta: &EntityMeta, storage: &MetadataStorage) {
        for rel in &meta.relations {
            if !rel.is_to_one_owner() && !rel.is_inline_collection() {
                continue;
            }
            let target_root = storage.find(rel.target).map_or(rel.target, |t| t.root);
            if !self.has_node(target_root) {
                continue;
            }
            let weight = if target_root == meta.root || rel.nullable || !rel.persist {
                0
            } else {
                1
            };
            self.add_dependency(target_root, meta.root, weight);
        }
    }

    /// Entity roots in commit order. Deletes use the reverse.
    pub fn sort(&mut self) -> Vec<&'static str> {
        self.sorted.clear();
        for node in &mut self.nodes {
            node.state = VisitState::NotVisited;
        }
        for idx in 0..self.nodes.len() {
            if self.nodes[idx].state == VisitState::NotVisited {
                self.visit(idx);
            }
        }
        self.sorted
            .iter()
            .rev()
            .map(|&idx| self.nodes[idx].name)
            .collect()
    }

    fn visit(&mut self, idx: usize) {
        self.nodes[idx].state = VisitState::InProgress;
        let edges = self.nodes[idx].edges.clone();
        for edge in edges {
            match self.nodes[edge.to].state {
                VisitState::Visited => {}
                VisitState::InProgress => self.visit_open_node(idx, edge.to, edge),
                VisitState::NotVisited => self.visit(edge.to),
            }
        }
        if self.nodes[idx].state != VisitState::Visited {
            self.nodes[idx].state = VisitState::Visited;
            self.sorted.push(idx);
        }
    }

    /// `node -> target` closed a cycle. Cut it unless the reverse edge is at
    /// least as strong.
    fn visit_open_node(&mut self, node: usize, target: usize, edge: Edge) {
        let Some(back) = self.nodes[target].edge_to(node) else {
            return;
        };
        if back.weight >= edge.weight {
            return;
        }
        tracing::warn!(
            from = self.nodes[node].name,
            to = self.nodes[target].name,
            weight = edge.weight,
            reverse_weight = back.weight,
            "Breaking commit order cycle"
        );
        let edges = self.nodes[target].edges.clone();
        for e in edges {
            if self.nodes[e.to].state == VisitState::NotVisited {
                self.visit(e.to);
            }
        }
        if self.nodes[target].state != VisitState::Visited {
            self.nodes[target].state = VisitState::Visited;
            self.sorted.push(target);
        }
    }
}
