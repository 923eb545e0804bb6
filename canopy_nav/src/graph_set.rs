// Graph registry: the set of structural partitions.
//
// `GraphSet` holds one `Graph` per slot, indexed by `GraphIndex`. Removed
// slots become holes and are reused by the next `add`. The number of graphs
// is capped (`NavConfig::graph_limit`); exceeding it is a recoverable
// `NavError::TooManyGraphs` that leaves the set untouched.
//
// Graph variants form a closed sum type, `GraphKind`, with a fixed
// capability table (`GraphKind::capabilities`) instead of runtime type
// checks: the scan pipeline asks "is this scannable", incremental updates
// ask "is this updatable", link snapping asks "can links anchor here".
//
// Each `Graph` carries an epoch that advances whenever its nodes are
// destroyed. `GraphSet::node()` resolves a `NodeRef` only if the epoch still
// matches, which is how stale link concretes and stale path results are
// detected. A graph added into a reused slot starts past the last epoch the
// slot's previous occupant reached, so references into a removed graph never
// resolve into its replacement.
//
// This module performs no locking or structure-guard checks itself; callers
// (`coordinator.rs`, `work_item.rs`) check the guard before calling `add` or
// `remove`.
//
// See also: `nav.rs` for per-graph storage, `generators.rs` for the settings
// carried by `GraphKind`, `structure_guard.rs` for the guard.

use crate::error::{NavError, Result};
use crate::generators::{GridGraphSettings, PointGraphSettings};
use crate::nav::{ConnectionTarget, NavGraph, NavNode};
use crate::types::{Aabb, GraphIndex, GraphMask, NodeRef, VoxelCoord};
use serde::{Deserialize, Serialize};

/// The closed set of graph variants.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum GraphKind {
    Grid(GridGraphSettings),
    Point(PointGraphSettings),
    /// Holds the nodes inserted by off-mesh links. Created on demand.
    Link,
}

/// What a graph kind supports.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Capabilities {
    /// Can be rebuilt by the scan pipeline.
    pub scannable: bool,
    /// Accepts incremental `GraphUpdate`s.
    pub updatable: bool,
    /// Off-mesh link endpoints may snap to its nodes.
    pub link_anchor: bool,
}

impl GraphKind {
    pub fn name(&self) -> &'static str {
        match self {
            GraphKind::Grid(_) => "grid",
            GraphKind::Point(_) => "point",
            GraphKind::Link => "link",
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        match self {
            GraphKind::Grid(_) | GraphKind::Point(_) => Capabilities {
                scannable: true,
                updatable: true,
                link_anchor: true,
            },
            GraphKind::Link => Capabilities {
                scannable: false,
                updatable: false,
                link_anchor: false,
            },
        }
    }
}

/// One structural partition.
#[derive(Clone, Debug)]
pub struct Graph {
    pub index: GraphIndex,
    pub name: String,
    pub kind: GraphKind,
    pub nav: NavGraph,
    epoch: u32,
}

impl Graph {
    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    /// `NodeRef` for a node index in the current epoch.
    pub fn node_ref(&self, index: u32) -> NodeRef {
        NodeRef {
            graph: self.index,
            epoch: self.epoch,
            index,
        }
    }

    /// Resolve a connection target leaving this graph.
    pub fn resolve(&self, target: ConnectionTarget) -> NodeRef {
        match target {
            ConnectionTarget::Local(i) => self.node_ref(i),
            ConnectionTarget::Remote(r) => r,
        }
    }

    /// Destroy every node. References taken before this call become stale.
    pub fn destroy_all_nodes(&mut self) {
        self.nav.clear();
        self.epoch = self.epoch.wrapping_add(1);
    }

    /// Swap in a freshly built node set (the commit half of a scan).
    pub fn replace_nodes(&mut self, nav: NavGraph) {
        self.nav = nav;
        self.epoch = self.epoch.wrapping_add(1);
    }

    pub fn bounds(&self) -> Option<Aabb> {
        self.nav.bounds()
    }
}

/// Registry of all graphs, indexed by slot.
#[derive(Clone, Debug)]
pub struct GraphSet {
    slots: Vec<Option<Graph>>,
    /// First epoch a new graph in each slot may use. Not trimmed with
    /// `slots`.
    epoch_floor: Vec<u32>,
    limit: usize,
    link_graph: Option<GraphIndex>,
}

impl GraphSet {
    pub fn new(limit: usize) -> Self {
        Self {
            slots: Vec::new(),
            epoch_floor: Vec::new(),
            limit,
            link_graph: None,
        }
    }

    /// Add a graph in the first free slot.
    pub fn add(&mut self, kind: GraphKind, name: impl Into<String>) -> Result<GraphIndex> {
        if let (GraphKind::Link, Some(existing)) = (&kind, self.link_graph) {
            return Err(NavError::LinkGraphExists(existing));
        }
        let slot = match self.slots.iter().position(Option::is_none) {
            Some(hole) => hole,
            None if self.slots.len() < self.limit => {
                self.slots.push(None);
                self.slots.len() - 1
            }
            None => return Err(NavError::TooManyGraphs { limit: self.limit }),
        };
        let index = GraphIndex(slot as u32);
        if matches!(kind, GraphKind::Link) {
            self.link_graph = Some(index);
        }
        self.slots[slot] = Some(Graph {
            index,
            name: name.into(),
            kind,
            nav: NavGraph::new(),
            epoch: self.epoch_floor.get(slot).copied().unwrap_or(0),
        });
        Ok(index)
    }

    /// Remove a graph, destroying its nodes and stripping every connection
    /// from other graphs into it.
    pub fn remove(&mut self, index: GraphIndex) -> Result<Graph> {
        let slot = self
            .slots
            .get_mut(index.0 as usize)
            .and_then(Option::take)
            .ok_or(NavError::NoSuchGraph(index))?;
        if self.link_graph == Some(index) {
            self.link_graph = None;
        }
        let slot_index = index.0 as usize;
        if self.epoch_floor.len() <= slot_index {
            self.epoch_floor.resize(slot_index + 1, 0);
        }
        self.epoch_floor[slot_index] = slot.epoch.wrapping_add(1);
        self.strip_connections_into(index);
        while matches!(self.slots.last(), Some(None)) {
            self.slots.pop();
        }
        Ok(slot)
    }

    /// Destroy a graph's nodes without removing the slot.
    pub fn clear(&mut self, index: GraphIndex) -> Result<()> {
        self.get_mut(index)
            .ok_or(NavError::NoSuchGraph(index))?
            .destroy_all_nodes();
        self.strip_connections_into(index);
        Ok(())
    }

    /// Remove remote connections in every other graph that point into
    /// `index`.
    pub fn strip_connections_into(&mut self, index: GraphIndex) -> usize {
        self.slots
            .iter_mut()
            .flatten()
            .filter(|g| g.index != index)
            .map(|g| g.nav.remove_remote_connections(|r| r.graph == index))
            .sum()
    }

    pub fn get(&self, index: GraphIndex) -> Option<&Graph> {
        self.slots.get(index.0 as usize).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, index: GraphIndex) -> Option<&mut Graph> {
        self.slots.get_mut(index.0 as usize).and_then(Option::as_mut)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Graph> {
        self.slots.iter().flatten()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Graph> {
        self.slots.iter_mut().flatten()
    }

    pub fn indices(&self) -> Vec<GraphIndex> {
        self.iter().map(|g| g.index).collect()
    }

    /// Number of graphs.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn link_graph(&self) -> Option<GraphIndex> {
        self.link_graph
    }

    /// Resolve a node reference. Returns `None` if the graph is gone, the
    /// epoch is stale, or the node slot is free.
    pub fn node(&self, r: NodeRef) -> Option<&NavNode> {
        self.get(r.graph)
            .filter(|g| g.epoch == r.epoch)
            .and_then(|g| g.nav.node(r.index))
    }

    pub fn node_mut(&mut self, r: NodeRef) -> Option<&mut NavNode> {
        self.get_mut(r.graph)
            .filter(|g| g.epoch == r.epoch)
            .and_then(|g| g.nav.node_mut(r.index))
    }

    pub fn is_valid(&self, r: NodeRef) -> bool {
        self.node(r).is_some()
    }

    /// Total live nodes over all graphs.
    pub fn node_count(&self) -> usize {
        self.iter().map(|g| g.nav.node_count()).sum()
    }

    /// Nearest walkable node on a link-anchor capable graph selected by
    /// `mask`. Returns the node and its squared distance.
    pub fn find_nearest_walkable(&self, pos: VoxelCoord, mask: GraphMask) -> Option<(NodeRef, i64)> {
        self.iter()
            .filter(|g| mask.contains(g.index) && g.kind.capabilities().link_anchor)
            .filter_map(|g| {
                g.nav
                    .find_nearest_node(pos, |n| n.walkable)
                    .map(|(i, d)| (g.node_ref(i), d))
            })
            .min_by_key(|&(r, d)| (d, r))
    }

    /// Bounds of the given graphs' current nodes, merged.
    pub fn bounds_of(&self, graphs: &[GraphIndex]) -> Option<Aabb> {
        graphs
            .iter()
            .filter_map(|&i| self.get(i).and_then(Graph::bounds))
            .reduce(Aabb::union)
    }
}
