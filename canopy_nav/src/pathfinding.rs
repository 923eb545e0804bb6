// A* pathfinding over the whole graph set.
//
// This is the unit of work a search worker performs (see `search_pool.rs`).
// It reads graph memory only; the pause protocol guarantees no mutation is
// in flight while it runs.
//
// Implements standard A* using a `BinaryHeap` (min-heap via reversed
// ordering). Nodes are addressed by `NodeRef` so a path can cross graphs
// through off-mesh link connections; scores live in `FxHashMap`s keyed by
// `NodeRef`. Stale connection targets (graph rescanned since the connection
// was made) and unwalkable nodes are skipped.
//
// The heuristic is Euclidean distance scaled by `heuristic_scale`, which is
// admissible for scale <= 1 as long as no connection is cheaper than the
// distance it covers.
//
// Connectivity areas (`connectivity.rs`) give an early "no path" answer when
// start and goal are known to be in different components.

use crate::graph_set::GraphSet;
use crate::types::{GraphMask, NodeRef, VoxelCoord};
use rustc_hash::{FxHashMap, FxHashSet};
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// The result of a successful A* search.
#[derive(Clone, Debug, PartialEq)]
pub struct PathResult {
    /// Sequence of nodes from start to goal (inclusive).
    pub nodes: Vec<NodeRef>,
    /// Position of each node in `nodes`.
    pub positions: Vec<VoxelCoord>,
    /// Total traversal cost.
    pub total_cost: f32,
}

/// What a search worker hands back for one request.
#[derive(Clone, Debug, PartialEq)]
pub enum PathOutcome {
    Found(PathResult),
    /// Both endpoints snapped, but no route connects them.
    NoPath,
    /// No walkable node exists on the selected graphs near the start.
    NoStartNode,
    NoGoalNode,
}

impl PathOutcome {
    pub fn path(&self) -> Option<&PathResult> {
        match self {
            PathOutcome::Found(p) => Some(p),
            _ => None,
        }
    }
}

/// Entry in the A* open set (min-heap via reversed ordering).
struct OpenEntry {
    node: NodeRef,
    f_score: f32,
}

impl PartialEq for OpenEntry {
    fn eq(&self, other: &Self) -> bool {
        self.f_score.total_cmp(&other.f_score) == Ordering::Equal && self.node == other.node
    }
}

impl Eq for OpenEntry {}

impl PartialOrd for OpenEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OpenEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for min-heap: smallest f_score is "greatest".
        other
            .f_score
            .total_cmp(&self.f_score)
            .then_with(|| other.node.cmp(&self.node))
    }
}

/// Snap both endpoints to the nearest walkable node on the graphs selected by
/// `mask`, then run A*.
pub fn find_path(
    graphs: &GraphSet,
    start: VoxelCoord,
    goal: VoxelCoord,
    mask: GraphMask,
) -> PathOutcome {
    let Some((start_node, _)) = graphs.find_nearest_walkable(start, mask) else {
        return PathOutcome::NoStartNode;
    };
    let Some((goal_node, _)) = graphs.find_nearest_walkable(goal, mask) else {
        return PathOutcome::NoGoalNode;
    };
    match astar(graphs, start_node, goal_node, 1.0) {
        Some(path) => PathOutcome::Found(path),
        None => PathOutcome::NoPath,
    }
}

/// Find the cheapest path from `start` to `goal` using A*.
///
/// Returns `None` if either endpoint does not resolve, if the areas of the
/// endpoints differ, or if no path exists.
pub fn astar(
    graphs: &GraphSet,
    start: NodeRef,
    goal: NodeRef,
    heuristic_scale: f32,
) -> Option<PathResult> {
    let start_node = graphs.node(start)?;
    let goal_node = graphs.node(goal)?;
    if start == goal {
        return Some(PathResult {
            nodes: vec![start],
            positions: vec![start_node.position],
            total_cost: 0.0,
        });
    }
    if start_node.area != 0 && goal_node.area != 0 && start_node.area != goal_node.area {
        return None;
    }
    let goal_pos = goal_node.position;

    // g_score[node] = cost of cheapest known path from start to node.
    let mut g_score: FxHashMap<NodeRef, f32> = FxHashMap::default();
    let mut came_from: FxHashMap<NodeRef, NodeRef> = FxHashMap::default();
    let mut closed: FxHashSet<NodeRef> = FxHashSet::default();

    g_score.insert(start, 0.0);

    let mut open = BinaryHeap::new();
    open.push(OpenEntry {
        node: start,
        f_score: start_node.position.distance(goal_pos) * heuristic_scale,
    });

    while let Some(current) = open.pop() {
        let current_id = current.node;
        if current_id == goal {
            return Some(reconstruct_path(graphs, &came_from, start, goal, g_score[&goal]));
        }
        if !closed.insert(current_id) {
            continue;
        }

        let current_g = g_score[&current_id];
        let Some(graph) = graphs.get(current_id.graph) else {
            continue;
        };
        let Some(node) = graph.nav.node(current_id.index) else {
            continue;
        };

        for connection in &node.connections {
            let neighbor = graph.resolve(connection.to);
            if closed.contains(&neighbor) {
                continue;
            }
            // Stale or unwalkable targets are skipped.
            let Some(neighbor_node) = graphs.node(neighbor) else {
                continue;
            };
            if !neighbor_node.walkable {
                continue;
            }

            let tentative_g = current_g + connection.cost;
            if tentative_g < g_score.get(&neighbor).copied().unwrap_or(f32::INFINITY) {
                g_score.insert(neighbor, tentative_g);
                came_from.insert(neighbor, current_id);
                let h = neighbor_node.position.distance(goal_pos) * heuristic_scale;
                open.push(OpenEntry {
                    node: neighbor,
                    f_score: tentative_g + h,
                });
            }
        }
    }

    None // No path found.
}

/// Reconstruct the path from came_from data.
fn reconstruct_path(
    graphs: &GraphSet,
    came_from: &FxHashMap<NodeRef, NodeRef>,
    start: NodeRef,
    goal: NodeRef,
    total_cost: f32,
) -> PathResult {
    let mut nodes = vec![goal];
    let mut current = goal;
    while current != start {
        match came_from.get(&current) {
            Some(&prev) => {
                nodes.push(prev);
                current = prev;
            }
            None => break,
        }
    }
    nodes.reverse();
    let positions = nodes
        .iter()
        .filter_map(|&r| graphs.node(r).map(|n| n.position))
        .collect();
    PathResult {
        nodes,
        positions,
        total_cost,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generators::GridGraphSettings;
    use crate::graph_set::GraphKind;
    use crate::nav::{Connection, ConnectionTarget, EdgeKind};
    use crate::types::GraphIndex;

    fn chain(set: &mut GraphSet) -> (GraphIndex, [NodeRef; 3]) {
        let kind = GraphKind::Grid(GridGraphSettings::new(VoxelCoord::new(0, 0, 0), 1, 1));
        let g = set.add(kind, "chain").unwrap();
        let graph = set.get_mut(g).unwrap();
        let a = graph.nav.add_node(VoxelCoord::new(0, 0, 0));
        let b = graph.nav.add_node(VoxelCoord::new(5, 0, 0));
        let c = graph.nav.add_node(VoxelCoord::new(10, 0, 0));
        graph.nav.add_edge(a, b, 5.0);
        graph.nav.add_edge(b, c, 5.0);
        (g, [graph.node_ref(a), graph.node_ref(b), graph.node_ref(c)])
    }

    #[test]
    fn astar_trivial_path() {
        let mut set = GraphSet::new(4);
        let (_, [a, _, _]) = chain(&mut set);
        let path = astar(&set, a, a, 1.0).unwrap();
        assert_eq!(path.nodes, vec![a]);
        assert_eq!(path.total_cost, 0.0);
    }

    #[test]
    fn astar_simple_chain() {
        let mut set = GraphSet::new(4);
        let (_, [a, b, c]) = chain(&mut set);
        let path = astar(&set, a, c, 1.0).unwrap();
        assert_eq!(path.nodes, vec![a, b, c]);
        assert_eq!(path.total_cost, 10.0);
        assert_eq!(path.positions[2], VoxelCoord::new(10, 0, 0));
    }

    #[test]
    fn astar_chooses_shortest() {
        let mut set = GraphSet::new(4);
        let (g, [a, _, c]) = chain(&mut set);
        // Expensive shortcut a -> c is ignored in favour of the 10.0 route.
        set.get_mut(g).unwrap().nav.add_edge(a.index, c.index, 20.0);
        let path = astar(&set, a, c, 1.0).unwrap();
        assert_eq!(path.total_cost, 10.0);
    }

    #[test]
    fn astar_skips_unwalkable_nodes() {
        let mut set = GraphSet::new(4);
        let (_, [a, b, c]) = chain(&mut set);
        set.node_mut(b).unwrap().walkable = false;
        assert!(astar(&set, a, c, 1.0).is_none());
    }

    #[test]
    fn astar_crosses_graphs_through_remote_connections() {
        let mut set = GraphSet::new(4);
        let (g, [_, _, c]) = chain(&mut set);
        let kind = GraphKind::Grid(GridGraphSettings::new(VoxelCoord::new(0, 0, 0), 1, 1));
        let h = set.add(kind, "far").unwrap();
        let far_graph = set.get_mut(h).unwrap();
        let far = far_graph.nav.add_node(VoxelCoord::new(10, 5, 0));
        let far_ref = far_graph.node_ref(far);
        far_graph.nav.add_connection(
            far,
            Connection {
                to: ConnectionTarget::Remote(c),
                cost: 5.0,
                kind: EdgeKind::OffMeshLink,
            },
        );
        set.get_mut(g).unwrap().nav.add_connection(
            c.index,
            Connection {
                to: ConnectionTarget::Remote(far_ref),
                cost: 5.0,
                kind: EdgeKind::OffMeshLink,
            },
        );

        let outcome = find_path(
            &set,
            VoxelCoord::new(0, 0, 0),
            VoxelCoord::new(10, 6, 0),
            GraphMask::ALL,
        );
        let path = outcome.path().unwrap();
        assert_eq!(path.nodes.last(), Some(&far_ref));
        assert_eq!(path.total_cost, 15.0);
    }

    #[test]
    fn stale_start_does_not_resolve() {
        let mut set = GraphSet::new(4);
        let (g, [a, _, c]) = chain(&mut set);
        set.clear(g).unwrap();
        assert!(astar(&set, a, c, 1.0).is_none());
    }

    #[test]
    fn different_areas_fail_fast() {
        let mut set = GraphSet::new(4);
        let (_, [a, _, c]) = chain(&mut set);
        set.node_mut(a).unwrap().area = 1;
        set.node_mut(c).unwrap().area = 2;
        assert!(astar(&set, a, c, 1.0).is_none());
    }

    #[test]
    fn find_path_without_graphs() {
        let set = GraphSet::new(4);
        assert_eq!(
            find_path(&set, VoxelCoord::new(0, 0, 0), VoxelCoord::new(1, 0, 0), GraphMask::ALL),
            PathOutcome::NoStartNode
        );
    }
}
