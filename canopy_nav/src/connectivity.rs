// Connectivity areas (flood fill) over the whole graph set.
//
// Every walkable node gets an area id such that two nodes share an id iff
// they are connected, ignoring connection direction, through walkable nodes.
// Components span graphs through off-mesh link connections. Unwalkable nodes
// get area 0, as do nodes that were created after the last recompute.
//
// Implemented as union-find over a dense numbering of live walkable nodes.
// Area ids are assigned in graph/node order, so the same graph set always
// produces the same ids.
//
// See also: `pathfinding.rs` which uses areas for an early "no path",
// `coordinator.rs` which recomputes after every batch and scan.

use crate::graph_set::GraphSet;
use crate::types::NodeRef;
use rustc_hash::FxHashMap;
use tracing::debug;

/// Summary of one recompute.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConnectivityReport {
    /// Number of distinct areas.
    pub areas: u32,
    /// Walkable nodes that were labelled.
    pub nodes: usize,
}

struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }
}

/// Recompute `NavNode::area` for every node of every graph.
pub fn recompute_areas(graphs: &mut GraphSet) -> ConnectivityReport {
    // Dense numbering of walkable nodes.
    let mut dense: FxHashMap<NodeRef, usize> = FxHashMap::default();
    let mut order: Vec<NodeRef> = Vec::new();
    for graph in graphs.iter() {
        for (i, node) in graph.nav.nodes() {
            if node.walkable {
                let r = graph.node_ref(i);
                dense.insert(r, order.len());
                order.push(r);
            }
        }
    }

    let mut uf = UnionFind::new(order.len());
    for graph in graphs.iter() {
        for (i, node) in graph.nav.nodes() {
            let Some(&from) = dense.get(&graph.node_ref(i)) else {
                continue;
            };
            for connection in &node.connections {
                // Stale or unwalkable targets are simply absent from `dense`.
                if let Some(&to) = dense.get(&graph.resolve(connection.to)) {
                    uf.union(from, to);
                }
            }
        }
    }

    let mut area_of_root: FxHashMap<usize, u32> = FxHashMap::default();
    let mut areas = Vec::with_capacity(order.len());
    for i in 0..order.len() {
        let root = uf.find(i);
        let next = area_of_root.len() as u32 + 1;
        areas.push(*area_of_root.entry(root).or_insert(next));
    }

    for graph in graphs.iter_mut() {
        for (_, node) in graph.nav.nodes_mut() {
            node.area = 0;
        }
    }
    for (r, area) in order.iter().zip(&areas) {
        if let Some(node) = graphs.node_mut(*r) {
            node.area = *area;
        }
    }

    let report = ConnectivityReport {
        areas: area_of_root.len() as u32,
        nodes: order.len(),
    };
    debug!(areas = report.areas, nodes = report.nodes, "nav.connectivity.recomputed");
    report
}

/// Whether two nodes are in the same area. False if either is stale,
/// unwalkable, or was created after the last recompute.
pub fn same_area(graphs: &GraphSet, a: NodeRef, b: NodeRef) -> bool {
    match (graphs.node(a), graphs.node(b)) {
        (Some(na), Some(nb)) => na.area != 0 && na.area == nb.area,
        _ => false,
    }
}
