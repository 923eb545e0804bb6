// Incremental graph updates.
//
// A `GraphUpdate` edits the nodes of updatable graphs inside a box: it can
// change walkability, retag nodes, and add a penalty to the surface
// connections leaving them. Updates are queued on a `GraphUpdateQueue` and
// turned into a single work item when they are due, so they run under the
// same conditions as any other mutation (search paused, data lock held) and
// their bounds are reported dirty for the off-mesh link refresh.
//
// With batching enabled, updates are held back until the batching interval
// has passed since the last batch was released; `take_due(force = true)`
// releases them regardless.
//
// See also: `work_item.rs`, `coordinator.rs` (`update_graphs`,
// `flush_graph_updates`).

use crate::graph_set::GraphSet;
use crate::nav::EdgeKind;
use crate::types::{Aabb, GraphMask};
use crate::work_item::WorkItem;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::debug;

/// An edit to every node inside `bounds` on the selected graphs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GraphUpdate {
    pub bounds: Aabb,
    pub set_walkable: Option<bool>,
    pub set_tag: Option<u32>,
    /// Added to the cost of surface connections leaving affected nodes.
    /// Costs never drop below zero.
    pub add_penalty: f32,
    pub graph_mask: GraphMask,
}

impl GraphUpdate {
    pub fn new(bounds: Aabb) -> Self {
        Self {
            bounds,
            set_walkable: None,
            set_tag: None,
            add_penalty: 0.0,
            graph_mask: GraphMask::ALL,
        }
    }

    pub fn walkable(mut self, walkable: bool) -> Self {
        self.set_walkable = Some(walkable);
        self
    }

    pub fn tag(mut self, tag: u32) -> Self {
        self.set_tag = Some(tag);
        self
    }

    pub fn penalty(mut self, penalty: f32) -> Self {
        self.add_penalty = penalty;
        self
    }

    pub fn mask(mut self, graph_mask: GraphMask) -> Self {
        self.graph_mask = graph_mask;
        self
    }

    /// Apply to graph memory. Returns how many nodes were touched. Graphs
    /// whose kind is not updatable are skipped.
    pub fn apply(&self, graphs: &mut GraphSet) -> usize {
        let mut touched = 0;
        for graph in graphs.iter_mut() {
            if !self.graph_mask.contains(graph.index) {
                continue;
            }
            if !graph.kind.capabilities().updatable {
                debug!(graph = %graph.index, kind = graph.kind.name(), "nav.update.skipped");
                continue;
            }
            for (_, node) in graph.nav.nodes_mut() {
                if !self.bounds.contains(node.position) {
                    continue;
                }
                if let Some(walkable) = self.set_walkable {
                    node.walkable = walkable;
                }
                if let Some(tag) = self.set_tag {
                    node.tag = tag;
                }
                if self.add_penalty != 0.0 {
                    for connection in node.connections.iter_mut() {
                        if connection.kind == EdgeKind::Surface {
                            connection.cost = (connection.cost + self.add_penalty).max(0.0);
                        }
                    }
                }
                touched += 1;
            }
        }
        touched
    }
}

/// Holds updates until they are due.
#[derive(Debug)]
pub struct GraphUpdateQueue {
    queued: Vec<GraphUpdate>,
    batching: bool,
    interval: Duration,
    last_release: Option<Instant>,
}

impl GraphUpdateQueue {
    pub fn new(batching: bool, interval: Duration) -> Self {
        Self {
            queued: Vec::new(),
            batching,
            interval,
            last_release: None,
        }
    }

    pub fn push(&mut self, update: GraphUpdate) {
        self.queued.push(update);
    }

    pub fn len(&self) -> usize {
        self.queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }

    /// Whether queued updates would be released at `now`.
    pub fn is_due(&self, now: Instant) -> bool {
        !self.queued.is_empty()
            && (!self.batching
                || self
                    .last_release
                    .is_none_or(|t| now.saturating_duration_since(t) >= self.interval))
    }

    /// Release every queued update as one work item, if they are due (or
    /// `force` is set).
    pub fn take_due(&mut self, now: Instant, force: bool) -> Option<WorkItem> {
        if self.queued.is_empty() || !(force || self.is_due(now)) {
            return None;
        }
        self.last_release = Some(now);
        let updates = std::mem::take(&mut self.queued);
        debug!(updates = updates.len(), "nav.update.released");
        Some(
            WorkItem::once(move |ctx| {
                for update in &updates {
                    let touched = update.apply(ctx.graphs_mut());
                    ctx.dirty_bounds(update.bounds);
                    debug!(bounds = %update.bounds, touched, "nav.update.applied");
                }
            })
            .labeled("graph updates"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generators::GridGraphSettings;
    use crate::graph_set::GraphKind;
    use crate::nav::NavGraph;
    use crate::structure_guard::StructureGuard;
    use crate::types::{GraphIndex, VoxelCoord};
    use crate::work_item::{DrainOutcome, WorkItemQueue};

    /// A 4x1 row of connected nodes along X.
    fn row() -> (GraphSet, GraphIndex) {
        let mut set = GraphSet::new(4);
        let kind = GraphKind::Grid(GridGraphSettings::new(VoxelCoord::new(0, 0, 0), 4, 1));
        let g = set.add(kind, "row").unwrap();
        let mut nav = NavGraph::new();
        for x in 0..4 {
            let id = nav.add_node(VoxelCoord::new(x, 0, 0));
            if x > 0 {
                nav.add_edge(id - 1, id, 1.0);
            }
        }
        set.get_mut(g).unwrap().replace_nodes(nav);
        (set, g)
    }

    fn cell(x: i32) -> Aabb {
        Aabb::from_point(VoxelCoord::new(x, 0, 0))
    }

    #[test]
    fn apply_edits_nodes_inside_bounds_only() {
        let (mut set, g) = row();
        let update = GraphUpdate::new(Aabb::from_corners(
            VoxelCoord::new(1, 0, 0),
            VoxelCoord::new(2, 0, 0),
        ))
        .walkable(false)
        .tag(7);
        assert_eq!(update.apply(&mut set), 2);
        let nav = &set.get(g).unwrap().nav;
        let walkable: Vec<bool> = nav.nodes().map(|(_, n)| n.walkable).collect();
        assert_eq!(walkable, vec![true, false, false, true]);
        assert_eq!(nav.node(1).unwrap().tag, 7);
        assert_eq!(nav.node(0).unwrap().tag, 0);
    }

    #[test]
    fn penalty_is_clamped_at_zero() {
        let (mut set, g) = row();
        GraphUpdate::new(cell(0)).penalty(-5.0).apply(&mut set);
        let nav = &set.get(g).unwrap().nav;
        assert_eq!(nav.node(0).unwrap().connections[0].cost, 0.0);
        assert_eq!(nav.node(1).unwrap().connections[0].cost, 1.0);
    }

    #[test]
    fn masked_and_non_updatable_graphs_are_skipped() {
        let (mut set, g) = row();
        let link = set.add(GraphKind::Link, "links").unwrap();
        set.get_mut(link).unwrap().nav.add_node(VoxelCoord::new(0, 0, 0));
        let everything = Aabb::from_corners(VoxelCoord::new(-9, -9, -9), VoxelCoord::new(9, 9, 9));

        assert_eq!(GraphUpdate::new(everything).walkable(false).apply(&mut set), 4);
        assert!(set.get(link).unwrap().nav.node(0).unwrap().walkable);

        let other = GraphMask::single(GraphIndex(g.0 + 5));
        assert_eq!(GraphUpdate::new(everything).mask(other).apply(&mut set), 0);
    }

    #[test]
    fn released_item_applies_and_reports_dirty_bounds() {
        let (mut set, g) = row();
        let mut queue = GraphUpdateQueue::new(false, Duration::ZERO);
        queue.push(GraphUpdate::new(cell(3)).walkable(false));
        queue.push(GraphUpdate::new(cell(0)).tag(2));
        let item = queue.take_due(Instant::now(), false).unwrap();
        assert!(queue.is_empty());

        let mut work = WorkItemQueue::new();
        work.push(item);
        let DrainOutcome::Completed(batch) = work.drain(&mut set, &StructureGuard::new(), true).unwrap()
        else {
            panic!("batch should complete");
        };
        assert_eq!(batch.regions, vec![cell(3), cell(0)]);
        let nav = &set.get(g).unwrap().nav;
        assert!(!nav.node(3).unwrap().walkable);
        assert_eq!(nav.node(0).unwrap().tag, 2);
    }

    #[test]
    fn batching_holds_updates_for_the_interval() {
        let mut queue = GraphUpdateQueue::new(true, Duration::from_millis(200));
        let t0 = Instant::now();
        queue.push(GraphUpdate::new(cell(0)));
        // Nothing released yet, so the first batch goes out at once.
        assert!(queue.take_due(t0, false).is_some());

        queue.push(GraphUpdate::new(cell(1)));
        assert!(!queue.is_due(t0 + Duration::from_millis(50)));
        assert!(queue.take_due(t0 + Duration::from_millis(50), false).is_none());
        assert_eq!(queue.len(), 1);
        assert!(queue.take_due(t0 + Duration::from_millis(250), false).is_some());
    }

    #[test]
    fn force_releases_regardless_of_interval() {
        let mut queue = GraphUpdateQueue::new(true, Duration::from_secs(60));
        let t0 = Instant::now();
        queue.push(GraphUpdate::new(cell(0)));
        queue.take_due(t0, false);
        queue.push(GraphUpdate::new(cell(1)));
        assert!(queue.take_due(t0, true).is_some());
        assert!(queue.take_due(t0, true).is_none());
    }
}
