// Graph generators and the resumable scan promise.
//
// Generation geometry is deliberately simple; the coordinator only needs the
// two-phase interface:
// - `ScanPromise::step()` does one bounded unit of prepare work. Prepare
//   builds a brand new `NavGraph` off to the side and never touches live
//   graph memory, so it can run while other graphs are being prepared (in
//   parallel for blocking scans, round-robin for cooperative ones).
// - `ScanPromise::apply()` is the short commit: it swaps the prepared nodes
//   into the live `Graph` and advances its epoch.
//
// Two generators exist:
// - Grid: a `width x depth` lattice of cells at a fixed height, minus
//   blocked cells, with 4-neighbour connections.
// - Point: explicit points, each connected to every other point within
//   `max_distance`.
//
// See also: `scan.rs` which drives promises, `graph_set.rs` for `GraphKind`
// (the closed set of graph variants these settings belong to).

use crate::config::NavConfig;
use crate::graph_set::{Graph, GraphKind};
use crate::nav::NavGraph;
use crate::types::{GraphIndex, VoxelCoord};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Settings for a grid graph.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GridGraphSettings {
    /// World position of cell (0, 0).
    pub origin: VoxelCoord,
    /// Cells along X.
    pub width: u32,
    /// Cells along Z.
    pub depth: u32,
    /// Cells (x, z), relative to `origin`, that produce no node.
    pub blocked: BTreeSet<(i32, i32)>,
    /// Tag given to every generated node.
    pub tag: u32,
    /// Cost of moving between neighbouring cells.
    pub step_cost: f32,
}

impl GridGraphSettings {
    pub fn new(origin: VoxelCoord, width: u32, depth: u32) -> Self {
        Self {
            origin,
            width,
            depth,
            blocked: BTreeSet::new(),
            tag: 0,
            step_cost: 1.0,
        }
    }

    pub fn with_blocked(mut self, cells: impl IntoIterator<Item = (i32, i32)>) -> Self {
        self.blocked.extend(cells);
        self
    }

    /// World position of cell `(x, z)`.
    pub fn cell_position(&self, x: i32, z: i32) -> VoxelCoord {
        VoxelCoord::new(self.origin.x + x, self.origin.y, self.origin.z + z)
    }
}

/// Settings for a point graph.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PointGraphSettings {
    pub points: Vec<VoxelCoord>,
    /// Points closer than this (Euclidean) are connected, cost = distance.
    pub max_distance: f32,
}

/// Result of one prepare step.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PrepareStatus {
    Pending { done: usize, total: usize },
    Ready,
}

enum PrepareWork {
    Grid {
        settings: GridGraphSettings,
        rows_per_step: usize,
        next_row: u32,
        prev_row: Vec<Option<u32>>,
    },
    Point {
        settings: PointGraphSettings,
        nodes_per_step: usize,
        next: usize,
    },
}

/// A resumable rebuild of one graph. Created by `ScanPromise::begin`,
/// advanced with `step()`, committed with `apply()`.
pub struct ScanPromise {
    graph: GraphIndex,
    work: PrepareWork,
    built: NavGraph,
}

impl ScanPromise {
    /// Start a rebuild of `graph`. Returns `None` for kinds that are not
    /// scannable (see `GraphKind::capabilities`).
    pub fn begin(graph: GraphIndex, kind: &GraphKind, config: &NavConfig) -> Option<Self> {
        let work = match kind {
            GraphKind::Grid(settings) => PrepareWork::Grid {
                settings: settings.clone(),
                rows_per_step: config.grid_rows_per_step.max(1),
                next_row: 0,
                prev_row: Vec::new(),
            },
            GraphKind::Point(settings) => PrepareWork::Point {
                settings: settings.clone(),
                nodes_per_step: config.point_nodes_per_step.max(1),
                next: 0,
            },
            GraphKind::Link => return None,
        };
        Some(Self {
            graph,
            work,
            built: NavGraph::new(),
        })
    }

    pub fn graph(&self) -> GraphIndex {
        self.graph
    }

    /// (units done, total units).
    pub fn progress_units(&self) -> (usize, usize) {
        match &self.work {
            PrepareWork::Grid {
                settings, next_row, ..
            } => (*next_row as usize, settings.depth as usize),
            PrepareWork::Point { settings, next, .. } => (*next, settings.points.len()),
        }
    }

    /// Fraction of prepare work done, in `0.0..=1.0`.
    pub fn progress(&self) -> f32 {
        let (done, total) = self.progress_units();
        if total == 0 {
            1.0
        } else {
            done as f32 / total as f32
        }
    }

    pub fn is_ready(&self) -> bool {
        let (done, total) = self.progress_units();
        done >= total
    }

    /// Do one bounded unit of prepare work.
    pub fn step(&mut self) -> PrepareStatus {
        match &mut self.work {
            PrepareWork::Grid {
                settings,
                rows_per_step,
                next_row,
                prev_row,
            } => {
                let end = (*next_row as usize + *rows_per_step).min(settings.depth as usize) as u32;
                while *next_row < end {
                    let z = *next_row as i32;
                    let mut row = Vec::with_capacity(settings.width as usize);
                    for x in 0..settings.width as i32 {
                        if settings.blocked.contains(&(x, z)) {
                            row.push(None);
                            continue;
                        }
                        let id = self.built.add_node_with(
                            settings.cell_position(x, z),
                            true,
                            settings.tag,
                        );
                        if let Some(Some(left)) = row.last().copied() {
                            self.built.add_edge(left, id, settings.step_cost);
                        }
                        if let Some(Some(up)) = prev_row.get(x as usize).copied() {
                            self.built.add_edge(up, id, settings.step_cost);
                        }
                        row.push(Some(id));
                    }
                    *prev_row = row;
                    *next_row += 1;
                }
            }
            PrepareWork::Point {
                settings,
                nodes_per_step,
                next,
            } => {
                let end = (*next + *nodes_per_step).min(settings.points.len());
                let max_sq = f64::from(settings.max_distance) * f64::from(settings.max_distance);
                while *next < end {
                    let pos = settings.points[*next];
                    let id = self.built.add_node(pos);
                    for earlier in 0..id {
                        let other = settings.points[earlier as usize];
                        let d2 = pos.distance_squared(other) as f64;
                        if d2 <= max_sq {
                            self.built.add_edge(earlier, id, d2.sqrt() as f32);
                        }
                    }
                    *next += 1;
                }
            }
        }
        let (done, total) = self.progress_units();
        if done >= total {
            PrepareStatus::Ready
        } else {
            PrepareStatus::Pending { done, total }
        }
    }

    /// Run every remaining prepare step.
    pub fn prepare_to_completion(&mut self) {
        while self.step() != PrepareStatus::Ready {}
    }

    /// Commit the prepared nodes into the live graph. Any prepare work still
    /// outstanding is finished first, so a partially built graph is never
    /// made visible.
    pub fn apply(mut self, graph: &mut Graph) {
        debug_assert_eq!(graph.index, self.graph);
        self.prepare_to_completion();
        graph.replace_nodes(self.built);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nav::ConnectionTarget;

    fn config(rows: usize) -> NavConfig {
        NavConfig {
            grid_rows_per_step: rows,
            point_nodes_per_step: 2,
            ..NavConfig::default()
        }
    }

    #[test]
    fn grid_prepare_is_incremental() {
        let kind = GraphKind::Grid(GridGraphSettings::new(VoxelCoord::new(0, 0, 0), 4, 5));
        let mut promise = ScanPromise::begin(GraphIndex(0), &kind, &config(2)).unwrap();
        assert_eq!(promise.step(), PrepareStatus::Pending { done: 2, total: 5 });
        assert_eq!(promise.step(), PrepareStatus::Pending { done: 4, total: 5 });
        assert_eq!(promise.step(), PrepareStatus::Ready);
        assert!(promise.is_ready());
        assert_eq!(promise.built.node_count(), 20);
    }

    #[test]
    fn grid_skips_blocked_cells_and_connects_neighbours() {
        let settings =
            GridGraphSettings::new(VoxelCoord::new(10, 2, 10), 3, 3).with_blocked([(1, 1)]);
        let kind = GraphKind::Grid(settings);
        let mut promise = ScanPromise::begin(GraphIndex(0), &kind, &config(8)).unwrap();
        promise.prepare_to_completion();
        let built = &promise.built;
        assert_eq!(built.node_count(), 8);
        assert!(built.nodes().all(|(_, n)| n.position.y == 2));
        // Corner (0,0) connects right and down only.
        let corner = built.node(0).unwrap();
        assert_eq!(corner.connections.len(), 2);
        // No node sits at the blocked cell.
        assert!(
            built
                .nodes()
                .all(|(_, n)| n.position != VoxelCoord::new(11, 2, 11))
        );
    }

    #[test]
    fn point_graph_connects_within_distance() {
        let settings = PointGraphSettings {
            points: vec![
                VoxelCoord::new(0, 0, 0),
                VoxelCoord::new(3, 0, 0),
                VoxelCoord::new(20, 0, 0),
            ],
            max_distance: 5.0,
        };
        let kind = GraphKind::Point(settings);
        let mut promise = ScanPromise::begin(GraphIndex(1), &kind, &config(1)).unwrap();
        assert_eq!(promise.step(), PrepareStatus::Pending { done: 2, total: 3 });
        assert_eq!(promise.step(), PrepareStatus::Ready);
        let built = &promise.built;
        let first: Vec<_> = built.node(0).unwrap().connections.iter().map(|c| c.to).collect();
        assert_eq!(first, vec![ConnectionTarget::Local(1)]);
        assert!(built.node(2).unwrap().connections.is_empty());
    }

    #[test]
    fn link_graph_is_not_scannable() {
        assert!(ScanPromise::begin(GraphIndex(0), &GraphKind::Link, &config(1)).is_none());
    }

    #[test]
    fn empty_grid_is_immediately_ready() {
        let kind = GraphKind::Grid(GridGraphSettings::new(VoxelCoord::new(0, 0, 0), 4, 0));
        let promise = ScanPromise::begin(GraphIndex(0), &kind, &config(1)).unwrap();
        assert!(promise.is_ready());
        assert_eq!(promise.progress(), 1.0);
    }
}
