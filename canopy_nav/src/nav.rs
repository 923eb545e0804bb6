// Navigation graph storage for a single graph partition.
//
// A `NavGraph` is a set of `NavNode`s (positions with walkability, a tag and
// a connectivity area) each carrying a small adjacency list of
// `Connection`s. Connections inside the graph are stored as local node
// indices; connections that leave the graph (off-mesh links) store a full
// `NodeRef`, so a rescan of the far graph makes them stale instead of
// dangling.
//
// Node slots are stable for the lifetime of a graph epoch. Removing a node
// (only the link graph does this) clears it and puts the slot on a free
// list for reuse.
//
// See also: `graph_set.rs` which owns one `NavGraph` per graph slot,
// `generators.rs` which builds fresh graphs during scans, `pathfinding.rs`
// for A* over the whole `GraphSet`.

use crate::types::{Aabb, NodeRef, VoxelCoord};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// The kind of connection between two nodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EdgeKind {
    /// Regular surface movement generated by a graph scan.
    Surface,
    /// Connection inserted by an off-mesh link.
    OffMeshLink,
}

/// Where a connection leads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionTarget {
    /// Another node of the same graph, by index.
    Local(u32),
    /// A node in another graph. May be stale (see `GraphSet::node`).
    Remote(NodeRef),
}

/// A directed, weighted connection.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub to: ConnectionTarget,
    pub cost: f32,
    pub kind: EdgeKind,
}

/// A node in the navigation graph — a position an agent can stand on.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NavNode {
    pub position: VoxelCoord,
    pub walkable: bool,
    pub tag: u32,
    /// Connectivity area; nodes with different areas cannot reach each
    /// other. 0 means "not computed yet" (see `connectivity.rs`).
    pub area: u32,
    pub connections: SmallVec<[Connection; 4]>,
    alive: bool,
}

impl NavNode {
    fn new(position: VoxelCoord, walkable: bool, tag: u32) -> Self {
        Self {
            position,
            walkable,
            tag,
            area: 0,
            connections: SmallVec::new(),
            alive: true,
        }
    }
}

/// The navigation graph container for one partition.
#[derive(Clone, Debug, Default)]
pub struct NavGraph {
    nodes: Vec<NavNode>,
    free: Vec<u32>,
    live: usize,
}

impl NavGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a walkable node with tag 0. Returns its index.
    pub fn add_node(&mut self, position: VoxelCoord) -> u32 {
        self.add_node_with(position, true, 0)
    }

    /// Add a node, reusing a freed slot if one exists.
    pub fn add_node_with(&mut self, position: VoxelCoord, walkable: bool, tag: u32) -> u32 {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            self.nodes[index as usize] = NavNode::new(position, walkable, tag);
            index
        } else {
            self.nodes.push(NavNode::new(position, walkable, tag));
            (self.nodes.len() - 1) as u32
        }
    }

    /// Remove a node and all of its outgoing connections. Incoming local
    /// connections are removed too; incoming remote connections are the
    /// caller's responsibility.
    pub fn remove_node(&mut self, index: u32) {
        let Some(node) = self.nodes.get_mut(index as usize) else {
            return;
        };
        if !node.alive {
            return;
        }
        node.alive = false;
        node.connections.clear();
        self.live -= 1;
        self.free.push(index);
        for other in self.nodes.iter_mut().filter(|n| n.alive) {
            other
                .connections
                .retain(|c| c.to != ConnectionTarget::Local(index));
        }
    }

    /// Add a bidirectional surface connection between two local nodes.
    pub fn add_edge(&mut self, a: u32, b: u32, cost: f32) {
        self.add_connection(
            a,
            Connection {
                to: ConnectionTarget::Local(b),
                cost,
                kind: EdgeKind::Surface,
            },
        );
        self.add_connection(
            b,
            Connection {
                to: ConnectionTarget::Local(a),
                cost,
                kind: EdgeKind::Surface,
            },
        );
    }

    /// Add a single directed connection. Ignored if `from` is not alive.
    pub fn add_connection(&mut self, from: u32, connection: Connection) {
        if let Some(node) = self.node_mut(from) {
            node.connections.push(connection);
        }
    }

    /// Remove every connection from `from` that points at `to`. Returns how
    /// many were removed.
    pub fn remove_connection(&mut self, from: u32, to: ConnectionTarget) -> usize {
        let Some(node) = self.node_mut(from) else {
            return 0;
        };
        let before = node.connections.len();
        node.connections.retain(|c| c.to != to);
        before - node.connections.len()
    }

    /// Remove every remote connection (from any node) matching `pred`.
    /// Returns how many were removed.
    pub fn remove_remote_connections(&mut self, mut pred: impl FnMut(NodeRef) -> bool) -> usize {
        let mut removed = 0;
        for node in self.nodes.iter_mut().filter(|n| n.alive) {
            let before = node.connections.len();
            node.connections.retain(|c| match c.to {
                ConnectionTarget::Remote(r) => !pred(r),
                ConnectionTarget::Local(_) => true,
            });
            removed += before - node.connections.len();
        }
        removed
    }

    /// Get a live node by index.
    pub fn node(&self, index: u32) -> Option<&NavNode> {
        self.nodes.get(index as usize).filter(|n| n.alive)
    }

    pub fn node_mut(&mut self, index: u32) -> Option<&mut NavNode> {
        self.nodes.get_mut(index as usize).filter(|n| n.alive)
    }

    /// Iterate over live nodes with their indices.
    pub fn nodes(&self) -> impl Iterator<Item = (u32, &NavNode)> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.alive)
            .map(|(i, n)| (i as u32, n))
    }

    pub fn nodes_mut(&mut self) -> impl Iterator<Item = (u32, &mut NavNode)> {
        self.nodes
            .iter_mut()
            .enumerate()
            .filter(|(_, n)| n.alive)
            .map(|(i, n)| (i as u32, n))
    }

    /// Number of live nodes.
    pub fn node_count(&self) -> usize {
        self.live
    }

    /// Number of node slots, live or free. Node indices are below this.
    pub fn capacity(&self) -> usize {
        self.nodes.len()
    }

    /// Find the nearest node accepted by `filter`, by Euclidean distance.
    /// Returns the index and squared distance, or `None` if nothing passes.
    pub fn find_nearest_node(
        &self,
        pos: VoxelCoord,
        mut filter: impl FnMut(&NavNode) -> bool,
    ) -> Option<(u32, i64)> {
        self.nodes()
            .filter(|(_, n)| filter(n))
            .map(|(i, n)| (i, n.position.distance_squared(pos)))
            .min_by_key(|&(i, d)| (d, i))
    }

    /// Bounding box of all live nodes.
    pub fn bounds(&self) -> Option<Aabb> {
        Aabb::enclosing(self.nodes().map(|(_, n)| n.position))
    }

    /// Destroy every node.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.free.clear();
        self.live = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GraphIndex;

    #[test]
    fn add_node_assigns_sequential_indices() {
        let mut graph = NavGraph::new();
        let a = graph.add_node(VoxelCoord::new(0, 0, 0));
        let b = graph.add_node(VoxelCoord::new(1, 0, 0));
        let c = graph.add_node(VoxelCoord::new(2, 0, 0));
        assert_eq!((a, b, c), (0, 1, 2));
        assert_eq!(graph.node_count(), 3);
    }

    #[test]
    fn add_edge_creates_bidirectional() {
        let mut graph = NavGraph::new();
        let a = graph.add_node(VoxelCoord::new(0, 0, 0));
        let b = graph.add_node(VoxelCoord::new(5, 0, 0));
        graph.add_edge(a, b, 5.0);

        let a_to: Vec<_> = graph.node(a).unwrap().connections.iter().map(|c| c.to).collect();
        assert_eq!(a_to, vec![ConnectionTarget::Local(b)]);
        let b_to: Vec<_> = graph.node(b).unwrap().connections.iter().map(|c| c.to).collect();
        assert_eq!(b_to, vec![ConnectionTarget::Local(a)]);
    }

    #[test]
    fn remove_node_strips_incoming_local_connections_and_reuses_slot() {
        let mut graph = NavGraph::new();
        let a = graph.add_node(VoxelCoord::new(0, 0, 0));
        let b = graph.add_node(VoxelCoord::new(1, 0, 0));
        graph.add_edge(a, b, 1.0);

        graph.remove_node(b);
        assert!(graph.node(b).is_none());
        assert!(graph.node(a).unwrap().connections.is_empty());
        assert_eq!(graph.node_count(), 1);

        let c = graph.add_node(VoxelCoord::new(7, 0, 0));
        assert_eq!(c, b);
        assert_eq!(graph.node_count(), 2);
    }

    #[test]
    fn remove_remote_connections_by_predicate() {
        let mut graph = NavGraph::new();
        let a = graph.add_node(VoxelCoord::new(0, 0, 0));
        let far = NodeRef {
            graph: GraphIndex(3),
            epoch: 1,
            index: 0,
        };
        graph.add_connection(
            a,
            Connection {
                to: ConnectionTarget::Remote(far),
                cost: 2.0,
                kind: EdgeKind::OffMeshLink,
            },
        );
        assert_eq!(graph.remove_remote_connections(|r| r.graph == GraphIndex(4)), 0);
        assert_eq!(graph.remove_remote_connections(|r| r.graph == GraphIndex(3)), 1);
        assert!(graph.node(a).unwrap().connections.is_empty());
    }

    #[test]
    fn find_nearest_node_respects_filter() {
        let mut graph = NavGraph::new();
        graph.add_node(VoxelCoord::new(0, 0, 0));
        graph.add_node_with(VoxelCoord::new(5, 5, 0), false, 0);
        graph.add_node(VoxelCoord::new(10, 0, 0));

        let nearest = graph.find_nearest_node(VoxelCoord::new(4, 4, 0), |_| true);
        assert_eq!(nearest.map(|(i, _)| i), Some(1));
        let walkable = graph.find_nearest_node(VoxelCoord::new(4, 4, 0), |n| n.walkable);
        assert_eq!(walkable, Some((0, 32)));
    }

    #[test]
    fn find_nearest_node_empty_graph() {
        let graph = NavGraph::new();
        assert_eq!(graph.find_nearest_node(VoxelCoord::new(0, 0, 0), |_| true), None);
        assert_eq!(graph.bounds(), None);
    }
}
