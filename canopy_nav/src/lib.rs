// canopy_nav — graph-mutation coordinator for concurrent pathfinding.
//
// A pool of search worker threads continuously reads navigation graphs to
// answer path requests. This crate sequences everything that changes those
// graphs (full rescans, incremental edits, structural add/remove of graphs,
// off-mesh link upkeep) so that no worker or auxiliary reader ever observes
// a torn graph, while stalling search as little as possible.
//
// Module overview:
// - `coordinator.rs`:     NavCoordinator, the explicit owner of every component below.
// - `scan.rs`:            Scan pipeline: blocking and time-sliced cooperative rescans.
// - `work_item.rs`:       FIFO queue of two-phase work items, run with search paused.
// - `search_pool.rs`:     Search worker threads and the pause/resume protocol.
// - `structure_guard.rs`: Nestable guard over adding/removing graphs.
// - `data_lock.rs`:       Writer-preferring read/write lock for auxiliary readers.
// - `offmesh.rs`:         Off-mesh links: registry, AABB tree, dirty refresh.
// - `graph_update.rs`:    Incremental graph updates (walkability, tags, penalties).
// - `connectivity.rs`:    Flood-fill connectivity areas.
// - `graph_set.rs`:       Graph registry, graph kinds and their capabilities.
// - `generators.rs`:      Grid/point generators and the resumable scan promise.
// - `nav.rs`:             Per-graph node and connection storage.
// - `pathfinding.rs`:     A* over the graph set.
// - `config.rs`:          NavConfig, all tunables, loadable from JSON.
// - `error.rs`:           NavError.
// - `types.rs`:           VoxelCoord, Aabb, ids.
//
// The `navsim` binary (`src/bin/navsim.rs`) drives a coordinator headless
// under load.
//
// **Critical constraint: graph memory is only mutated with search paused.**
// Every mutation path (work items, scan apply, structural changes) pauses
// the worker pool and takes the data write lock before touching a node.

pub mod config;
pub mod connectivity;
pub mod coordinator;
pub mod data_lock;
pub mod error;
pub mod generators;
pub mod graph_set;
pub mod graph_update;
pub mod nav;
pub mod offmesh;
pub mod pathfinding;
pub mod scan;
pub mod search_pool;
pub mod structure_guard;
pub mod types;
pub mod work_item;

pub use config::NavConfig;
pub use coordinator::{NavCoordinator, NavStats};
pub use error::{NavError, Result};
pub use graph_set::{GraphKind, GraphSet};
pub use offmesh::{LinkSource, LinkStatus};
pub use scan::{ScanEvent, ScanProgress};
pub use search_pool::{PathRequest, SearchHandle};
pub use types::{Aabb, GraphIndex, GraphMask, LinkId, NodeRef, VoxelCoord};
pub use work_item::{WorkContext, WorkItem};
