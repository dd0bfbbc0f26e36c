//! Cross-reference graph between chunks
//!
//! Edges come from explicit references (imports, links, paths, symbol
//! mentions) resolved against the chunks of the same snapshot.

use lodestar_common::text::ReferenceKind;
use std::collections::{HashSet, VecDeque};

/// Directed edge to another chunk (arena index)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ReferenceEdge {
    pub target: usize,
    pub kind: ReferenceKind,
}

/// Chunk reached by a traversal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reached {
    pub chunk: usize,
    pub depth: usize,
    pub kind: ReferenceKind,
}

#[derive(Debug, Clone, Default)]
pub struct ReferenceGraph {
    /// Adjacency list indexed by chunk: sorted, de-duplicated outgoing edges
    outgoing: Vec<Vec<ReferenceEdge>>,
    edge_count: usize,
}

impl ReferenceGraph {
    pub fn with_nodes(nodes: usize) -> Self {
        Self {
            outgoing: vec![Vec::new(); nodes],
            edge_count: 0,
        }
    }

    /// Add an edge; self-loops and duplicates are ignored
    pub fn add_edge(&mut self, source: usize, target: usize, kind: ReferenceKind) {
        if source == target || source >= self.outgoing.len() || target >= self.outgoing.len() {
            return;
        }
        let edges = &mut self.outgoing[source];
        if edges.iter().any(|e| e.target == target) {
            return;
        }
        edges.push(ReferenceEdge { target, kind });
        edges.sort();
        self.edge_count += 1;
    }

    /// Chunks referenced by this chunk
    pub fn references(&self, chunk: usize) -> &[ReferenceEdge] {
        self.outgoing.get(chunk).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn edge_count(&self) -> usize {
        self.edge_count
    }

    /// Breadth-first traversal up to `max_depth` hops
    ///
    /// Each chunk is reported once, at its shallowest depth, in a
    /// deterministic order (depth, then edge order). The start is excluded.
    pub fn traverse(&self, start: usize, max_depth: usize) -> Vec<Reached> {
        let mut visited = HashSet::from([start]);
        let mut result = Vec::new();
        let mut queue = VecDeque::from([(start, 0usize)]);

        while let Some((current, depth)) = queue.pop_front() {
            if depth >= max_depth {
                continue;
            }
            for edge in self.references(current) {
                if visited.insert(edge.target) {
                    result.push(Reached {
                        chunk: edge.target,
                        depth: depth + 1,
                        kind: edge.kind,
                    });
                    queue.push_back((edge.target, depth + 1));
                }
            }
        }

        result
    }
}
