// Off-mesh links and their dirty-region index.
//
// An off-mesh link joins two points that surface connections do not (a
// ladder, a jump, a teleporter). The user declares a `LinkSource`; the
// registry resolves it into a `LinkConcrete` by snapping each anchor to the
// nearest walkable node and inserting two nodes into the link graph with
// `EdgeKind::OffMeshLink` connections between them and the anchors.
//
// Sources live in an arena keyed by `LinkId` (index + generation) owned by
// the coordinator. Their bounds (both anchors, grown by the snapping
// distance) are kept in an `rstar` R-tree. `dirty_bounds(box)` tags every
// source whose bounds intersect the box; `refresh()` re-resolves only tagged
// sources.
//
// Adds and removals are staged, not applied: they land in pending lists and
// are applied at the start of the next `refresh()`, which the coordinator
// runs at the end of a work-item batch (with search paused and the
// structure guard in the allow-adding-only state, so the link graph can be
// created on demand).
//
// **Critical constraint: structural equivalence.** A re-resolved source keeps
// its existing concrete when the anchors resolve to the same nodes, the link
// nodes are still valid and the policy is unchanged. Only then is nothing
// touched; otherwise the old concrete is disconnected and a new one is
// built. Without the check, every unrelated edit would churn every link.
//
// See also: `work_item.rs` (batch completion), `coordinator.rs` (`add_link`,
// `remove_link`, `dirty_bounds`), `graph_set.rs` for `GraphKind::Link`.

use crate::error::{NavError, Result};
use crate::graph_set::{GraphKind, GraphSet};
use crate::nav::{Connection, ConnectionTarget, EdgeKind};
use crate::structure_guard::StructureGuard;
use crate::types::{Aabb, GraphIndex, GraphMask, LinkId, NodeRef, VoxelCoord};
use rstar::{AABB, Envelope, RTree, RTreeObject, SelectionFunction};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

// ---------------------------------------------------------------------------
// Sources and concretes
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkDirection {
    /// Traversable from start to end only.
    OneWay,
    TwoWay,
}

/// User-declared link geometry and policy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LinkSource {
    pub start: VoxelCoord,
    pub end: VoxelCoord,
    pub direction: LinkDirection,
    /// Tag given to the inserted link nodes.
    pub tag: u32,
    /// Multiplier on the straight-line length of the link.
    pub cost_factor: f32,
    /// Maximum Euclidean distance from an anchor to the node it snaps to.
    pub max_snap_distance: f32,
    /// Graphs the anchors may snap to.
    pub graph_mask: GraphMask,
}

impl LinkSource {
    pub fn new(start: VoxelCoord, end: VoxelCoord) -> Self {
        Self {
            start,
            end,
            direction: LinkDirection::TwoWay,
            tag: 0,
            cost_factor: 1.0,
            max_snap_distance: 1.5,
            graph_mask: GraphMask::ALL,
        }
    }

    pub fn one_way(mut self) -> Self {
        self.direction = LinkDirection::OneWay;
        self
    }

    pub fn with_tag(mut self, tag: u32) -> Self {
        self.tag = tag;
        self
    }

    pub fn with_cost_factor(mut self, cost_factor: f32) -> Self {
        self.cost_factor = cost_factor;
        self
    }

    pub fn with_snap_distance(mut self, max_snap_distance: f32) -> Self {
        self.max_snap_distance = max_snap_distance;
        self
    }

    pub fn with_mask(mut self, graph_mask: GraphMask) -> Self {
        self.graph_mask = graph_mask;
        self
    }

    /// The region where a graph change can affect how this link resolves.
    /// An infinite snap distance covers the whole coordinate range.
    pub fn bounds(&self) -> Aabb {
        // `as` saturates, and `expand` saturates at the range.
        let reach = self.max_snap_distance.max(0.0).ceil() as i32;
        Aabb::from_corners(self.start, self.end).expand(reach)
    }

    fn policy(&self) -> LinkPolicy {
        LinkPolicy {
            direction: self.direction,
            tag: self.tag,
            cost_factor: self.cost_factor,
        }
    }

    fn snap(&self, graphs: &GraphSet, pos: VoxelCoord) -> Option<NodeRef> {
        let max = f64::from(self.max_snap_distance.max(0.0));
        graphs
            .find_nearest_walkable(pos, self.graph_mask)
            .filter(|&(_, d2)| d2 as f64 <= max * max)
            .map(|(r, _)| r)
    }
}

/// The part of a source that shapes its connections.
#[derive(Clone, Copy, Debug, PartialEq)]
struct LinkPolicy {
    direction: LinkDirection,
    tag: u32,
    cost_factor: f32,
}

/// Resolved, connected state of a link.
#[derive(Clone, Debug, PartialEq)]
pub struct LinkConcrete {
    /// Node the start anchor snapped to.
    pub start: NodeRef,
    pub end: NodeRef,
    /// Link-graph node at the start anchor.
    pub start_link_node: NodeRef,
    pub end_link_node: NodeRef,
    policy: LinkPolicy,
}

impl LinkConcrete {
    fn is_equivalent(&self, graphs: &GraphSet, start: NodeRef, end: NodeRef, policy: LinkPolicy) -> bool {
        self.start == start
            && self.end == end
            && self.policy == policy
            && graphs.is_valid(self.start_link_node)
            && graphs.is_valid(self.end_link_node)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkStatus {
    /// Registered but never resolved.
    Inactive,
    /// Staged for the next refresh.
    Pending,
    Active,
    /// No acceptable node near the start anchor. Implies inactive.
    FailedToConnectStart,
    /// No acceptable node near the end anchor. Implies inactive.
    FailedToConnectEnd,
    /// Both anchors snapped, but the graph limit left no slot for the link
    /// graph. Implies inactive. Retried once a graph is removed.
    FailedToCreateLinkGraph,
}

impl LinkStatus {
    pub fn is_active(self) -> bool {
        self == LinkStatus::Active
    }
}

/// What one `refresh()` did.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RefreshReport {
    /// Dirty regions consumed by this refresh.
    pub regions: Vec<Aabb>,
    pub added: usize,
    pub removed: usize,
    /// Sources re-resolved.
    pub examined: usize,
    /// Sources whose concrete was rebuilt.
    pub reconnected: usize,
    /// Sources that failed to snap an anchor.
    pub failed: usize,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq)]
struct IndexedLink {
    id: LinkId,
    envelope: AABB<[f64; 3]>,
}

impl IndexedLink {
    fn new(id: LinkId, bounds: Aabb) -> Self {
        Self {
            id,
            envelope: AABB::from_corners(
                [bounds.min.x, bounds.min.y, bounds.min.z].map(f64::from),
                [bounds.max.x, bounds.max.y, bounds.max.z].map(f64::from),
            ),
        }
    }
}

impl RTreeObject for IndexedLink {
    type Envelope = AABB<[f64; 3]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

/// Selects every indexed link whose envelope intersects the query box.
struct Intersecting(AABB<[f64; 3]>);

impl SelectionFunction<IndexedLink> for Intersecting {
    fn should_unpack_parent(&self, envelope: &AABB<[f64; 3]>) -> bool {
        envelope.intersects(&self.0)
    }

    fn should_unpack_leaf(&self, leaf: &IndexedLink) -> bool {
        leaf.envelope.intersects(&self.0)
    }
}

#[derive(Debug)]
struct LinkEntry {
    source: LinkSource,
    status: LinkStatus,
    concrete: Option<LinkConcrete>,
    dirty: bool,
    pending_removal: bool,
    indexed: Option<IndexedLink>,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    entry: Option<LinkEntry>,
}

/// Arena of link sources plus the dirty-region index.
#[derive(Default)]
pub struct OffMeshLinks {
    slots: Vec<Slot>,
    free: Vec<u32>,
    tree: RTree<IndexedLink>,
    pending_adds: Vec<LinkId>,
    pending_removals: Vec<LinkId>,
    dirty_regions: Vec<Aabb>,
    refresh_scheduled: bool,
}

impl OffMeshLinks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a source. It is inserted into the index and resolved on the
    /// next refresh; until then its status is `Pending`.
    pub fn add(&mut self, source: LinkSource) -> LinkId {
        let entry = LinkEntry {
            source,
            status: LinkStatus::Pending,
            concrete: None,
            dirty: true,
            pending_removal: false,
            indexed: None,
        };
        let id = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.entry = Some(entry);
                LinkId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    entry: Some(entry),
                });
                LinkId {
                    index: (self.slots.len() - 1) as u32,
                    generation: 0,
                }
            }
        };
        self.pending_adds.push(id);
        trace!(link = %id, "nav.link.add_staged");
        id
    }

    /// Stage a removal. Removing a link that is already pending removal is a
    /// no-op.
    pub fn remove(&mut self, id: LinkId) -> Result<()> {
        let entry = self.entry_mut(id).ok_or(NavError::NoSuchLink(id))?;
        if !entry.pending_removal {
            entry.pending_removal = true;
            self.pending_removals.push(id);
            trace!(link = %id, "nav.link.remove_staged");
        }
        Ok(())
    }

    /// Tag every source whose bounds intersect `bounds`. The region is also
    /// recorded for the next `RefreshReport`.
    pub fn dirty_bounds(&mut self, bounds: Aabb) {
        let query = IndexedLink::new(LinkId { index: 0, generation: 0 }, bounds).envelope;
        let hits: Vec<LinkId> = self
            .tree
            .locate_with_selection_function(Intersecting(query))
            .map(|l| l.id)
            .collect();
        for id in hits {
            if let Some(entry) = self.entry_mut(id) {
                entry.dirty = true;
            }
        }
        if !self.dirty_regions.contains(&bounds) {
            self.dirty_regions.push(bounds);
        }
    }

    /// Tag every source that failed for want of a link graph, so the next
    /// refresh tries again. Returns true if any were tagged.
    pub fn retry_link_graph_failures(&mut self) -> bool {
        let mut tagged = false;
        for slot in &mut self.slots {
            if let Some(entry) = slot
                .entry
                .as_mut()
                .filter(|e| e.status == LinkStatus::FailedToCreateLinkGraph)
            {
                entry.dirty = true;
                tagged = true;
            }
        }
        tagged
    }

    /// Returns true the first time it is called after a refresh, so the
    /// caller schedules exactly one work item to drive it.
    pub fn request_refresh(&mut self) -> bool {
        !std::mem::replace(&mut self.refresh_scheduled, true)
    }

    /// Whether staged changes or dirty sources are waiting for a refresh.
    pub fn needs_refresh(&self) -> bool {
        !self.pending_adds.is_empty()
            || !self.pending_removals.is_empty()
            || self.live().any(|(_, e)| e.dirty)
    }

    pub fn status(&self, id: LinkId) -> Option<LinkStatus> {
        self.entry(id).map(|e| e.status)
    }

    pub fn is_pending_removal(&self, id: LinkId) -> bool {
        self.entry(id).is_some_and(|e| e.pending_removal)
    }

    pub fn concrete(&self, id: LinkId) -> Option<&LinkConcrete> {
        self.entry(id).and_then(|e| e.concrete.as_ref())
    }

    pub fn source(&self, id: LinkId) -> Option<&LinkSource> {
        self.entry(id).map(|e| &e.source)
    }

    /// Registered links, including ones staged for removal.
    pub fn len(&self) -> usize {
        self.live().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every registered link in id order.
    pub fn iter(&self) -> impl Iterator<Item = (LinkId, &LinkSource, LinkStatus)> {
        self.live().map(|(id, e)| (id, &e.source, e.status))
    }

    /// Create the link graph if it does not exist. Subject to the structure
    /// guard like any other graph add.
    pub fn ensure_link_graph(
        &self,
        graphs: &mut GraphSet,
        guard: &StructureGuard,
    ) -> Result<GraphIndex> {
        if let Some(index) = graphs.link_graph() {
            return Ok(index);
        }
        guard.assert_mutable(true, "add the link graph")?;
        let index = graphs.add(GraphKind::Link, "off-mesh links")?;
        debug!(graph = %index, "nav.link.graph_created");
        Ok(index)
    }

    /// Apply staged removals and adds, then re-resolve every dirty source.
    pub fn refresh(&mut self, graphs: &mut GraphSet, guard: &StructureGuard) -> Result<RefreshReport> {
        self.refresh_scheduled = false;
        let mut report = RefreshReport {
            regions: std::mem::take(&mut self.dirty_regions),
            ..RefreshReport::default()
        };

        for id in std::mem::take(&mut self.pending_removals) {
            let Some(entry) = self.take_entry(id) else {
                continue;
            };
            if let Some(concrete) = &entry.concrete {
                disconnect(graphs, concrete);
            }
            if let Some(indexed) = &entry.indexed {
                self.tree.remove(indexed);
            }
            report.removed += 1;
            debug!(link = %id, "nav.link.removed");
        }

        for id in std::mem::take(&mut self.pending_adds) {
            let Some(entry) = self.entry_mut(id) else {
                continue;
            };
            let indexed = IndexedLink::new(id, entry.source.bounds());
            entry.indexed = Some(indexed);
            entry.dirty = true;
            self.tree.insert(indexed);
            report.added += 1;
        }

        let dirty: Vec<LinkId> = self.live().filter(|(_, e)| e.dirty).map(|(id, _)| id).collect();
        for id in dirty {
            report.examined += 1;
            match self.resolve(id, graphs, guard)? {
                Resolution::Unchanged => {}
                Resolution::Reconnected => report.reconnected += 1,
                Resolution::Failed => report.failed += 1,
            }
        }

        if report.examined > 0 || report.removed > 0 {
            debug!(
                regions = report.regions.len(),
                examined = report.examined,
                reconnected = report.reconnected,
                failed = report.failed,
                removed = report.removed,
                "nav.link.refreshed"
            );
        }
        Ok(report)
    }

    fn resolve(&mut self, id: LinkId, graphs: &mut GraphSet, guard: &StructureGuard) -> Result<Resolution> {
        let Some(entry) = self.entry(id) else {
            return Ok(Resolution::Unchanged);
        };
        let source = entry.source.clone();
        let policy = source.policy();
        let start = source.snap(graphs, source.start);
        let end = source.snap(graphs, source.end);

        let (start, end) = match (start, end) {
            (Some(s), Some(e)) => (s, e),
            (s, _) => {
                let status = if s.is_none() {
                    LinkStatus::FailedToConnectStart
                } else {
                    LinkStatus::FailedToConnectEnd
                };
                let Some(entry) = self.entry_mut(id) else {
                    return Ok(Resolution::Unchanged);
                };
                if let Some(old) = entry.concrete.take() {
                    disconnect(graphs, &old);
                }
                entry.status = status;
                entry.dirty = false;
                debug!(link = %id, ?status, "nav.link.snap_failed");
                return Ok(Resolution::Failed);
            }
        };

        if entry
            .concrete
            .as_ref()
            .is_some_and(|c| c.is_equivalent(graphs, start, end, policy))
        {
            if let Some(entry) = self.entry_mut(id) {
                entry.status = LinkStatus::Active;
                entry.dirty = false;
            }
            return Ok(Resolution::Unchanged);
        }

        let link_graph = match self.ensure_link_graph(graphs, guard) {
            Ok(index) => index,
            Err(NavError::TooManyGraphs { limit }) => {
                let Some(entry) = self.entry_mut(id) else {
                    return Ok(Resolution::Unchanged);
                };
                if let Some(old) = entry.concrete.take() {
                    disconnect(graphs, &old);
                }
                entry.status = LinkStatus::FailedToCreateLinkGraph;
                entry.dirty = false;
                debug!(link = %id, limit, "nav.link.graph_unavailable");
                return Ok(Resolution::Failed);
            }
            Err(err) => return Err(err),
        };
        let Some(entry) = self.entry_mut(id) else {
            return Ok(Resolution::Unchanged);
        };
        if let Some(old) = entry.concrete.take() {
            disconnect(graphs, &old);
        }
        entry.concrete = connect(graphs, link_graph, &source, start, end);
        entry.status = if entry.concrete.is_some() {
            LinkStatus::Active
        } else {
            LinkStatus::Inactive
        };
        entry.dirty = false;
        trace!(link = %id, start = %start, end = %end, "nav.link.connected");
        Ok(Resolution::Reconnected)
    }

    fn entry(&self, id: LinkId) -> Option<&LinkEntry> {
        self.slots
            .get(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.entry.as_ref())
    }

    fn entry_mut(&mut self, id: LinkId) -> Option<&mut LinkEntry> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.entry.as_mut())
    }

    fn take_entry(&mut self, id: LinkId) -> Option<LinkEntry> {
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)?;
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        Some(entry)
    }

    fn live(&self) -> impl Iterator<Item = (LinkId, &LinkEntry)> {
        self.slots.iter().enumerate().filter_map(|(i, s)| {
            s.entry.as_ref().map(|e| {
                (
                    LinkId {
                        index: i as u32,
                        generation: s.generation,
                    },
                    e,
                )
            })
        })
    }
}

enum Resolution {
    Unchanged,
    Reconnected,
    Failed,
}

/// Insert link nodes and connections for a resolved source. Returns `None`
/// if an anchor or the link graph vanished in the meantime.
fn connect(
    graphs: &mut GraphSet,
    link_graph: GraphIndex,
    source: &LinkSource,
    start: NodeRef,
    end: NodeRef,
) -> Option<LinkConcrete> {
    let start_pos = graphs.node(start)?.position;
    let end_pos = graphs.node(end)?.position;
    let graph = graphs.get_mut(link_graph)?;

    let s = graph.nav.add_node_with(source.start, true, source.tag);
    let e = graph.nav.add_node_with(source.end, true, source.tag);
    let length = source.start.distance(source.end) * source.cost_factor;
    let link = |to, cost| Connection {
        to,
        cost,
        kind: EdgeKind::OffMeshLink,
    };
    graph.nav.add_connection(s, link(ConnectionTarget::Local(e), length));
    if source.direction == LinkDirection::TwoWay {
        graph.nav.add_connection(e, link(ConnectionTarget::Local(s), length));
    }
    let start_cost = source.start.distance(start_pos);
    let end_cost = source.end.distance(end_pos);
    graph.nav.add_connection(s, link(ConnectionTarget::Remote(start), start_cost));
    graph.nav.add_connection(e, link(ConnectionTarget::Remote(end), end_cost));
    let start_link_node = graph.node_ref(s);
    let end_link_node = graph.node_ref(e);

    if let Some(node) = graphs.node_mut(start) {
        node.connections.push(link(ConnectionTarget::Remote(start_link_node), start_cost));
    }
    if let Some(node) = graphs.node_mut(end) {
        node.connections.push(link(ConnectionTarget::Remote(end_link_node), end_cost));
    }

    Some(LinkConcrete {
        start,
        end,
        start_link_node,
        end_link_node,
        policy: source.policy(),
    })
}

/// Remove every connection and link node a concrete inserted. Parts that
/// are already stale are skipped.
fn disconnect(graphs: &mut GraphSet, concrete: &LinkConcrete) {
    for (anchor, link_node) in [
        (concrete.start, concrete.start_link_node),
        (concrete.end, concrete.end_link_node),
    ] {
        if let Some(node) = graphs.node_mut(anchor) {
            node.connections
                .retain(|c| c.to != ConnectionTarget::Remote(link_node));
        }
    }
    for link_node in [concrete.start_link_node, concrete.end_link_node] {
        if let Some(graph) = graphs
            .get_mut(link_node.graph)
            .filter(|g| g.epoch() == link_node.epoch)
        {
            graph.nav.remove_node(link_node.index);
        }
    }
}
