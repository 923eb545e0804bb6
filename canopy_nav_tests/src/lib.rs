// Test harness for threaded coordinator scenarios.
//
// Wraps a real `NavCoordinator` with a small fixed world (two grid islands
// a few cells apart) and synchronous helpers for the asynchronous parts:
// submitting path requests and pumping `update()` until their callbacks
// have run, or polling a condition with a timeout. Everything else goes
// through the same code paths the driver binary uses.
//
// See also: `tests/concurrency.rs` and `tests/links.rs` for the scenarios.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use canopy_nav::generators::GridGraphSettings;
use canopy_nav::pathfinding::PathOutcome;
use canopy_nav::types::PathRequestId;
use canopy_nav::{GraphIndex, GraphKind, NavConfig, NavCoordinator, PathRequest, VoxelCoord};
use parking_lot::Mutex;

/// Default timeout for blocking poll loops.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(10);

/// Sleep between poll attempts.
pub const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Width and depth of each island.
pub const ISLAND: u32 = 8;

/// X of the east island's first column.
pub const EAST_X: i32 = ISLAND as i32 + 4;

/// Outcomes delivered to path callbacks, in delivery order.
#[derive(Clone, Default)]
pub struct PathLog {
    outcomes: Arc<Mutex<Vec<(PathRequestId, PathOutcome)>>>,
}

impl PathLog {
    /// A callback that appends to this log.
    pub fn callback(&self) -> impl FnOnce(PathRequestId, PathOutcome) + Send + 'static {
        let outcomes = self.outcomes.clone();
        move |id, outcome| outcomes.lock().push((id, outcome))
    }

    pub fn len(&self) -> usize {
        self.outcomes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn take(&self) -> Vec<(PathRequestId, PathOutcome)> {
        std::mem::take(&mut *self.outcomes.lock())
    }
}

/// A coordinator over two scanned islands, west at x=0 and east at `EAST_X`.
pub struct TestWorld {
    pub nav: NavCoordinator,
    pub west: GraphIndex,
    pub east: GraphIndex,
    pub paths: PathLog,
}

impl TestWorld {
    pub fn new(config: NavConfig) -> Self {
        let mut nav = NavCoordinator::new(config);
        let west = nav
            .add_graph(island(0), "west")
            .expect("add west island");
        let east = nav
            .add_graph(island(EAST_X), "east")
            .expect("add east island");
        nav.scan(None).expect("initial scan");
        Self {
            nav,
            west,
            east,
            paths: PathLog::default(),
        }
    }

    /// Two search threads, small cooperative steps.
    pub fn threaded() -> Self {
        Self::new(NavConfig {
            search_threads: 2,
            grid_rows_per_step: 1,
            ..NavConfig::default()
        })
    }

    /// Submit a request whose outcome lands in `self.paths`.
    pub fn submit(&self, start: VoxelCoord, goal: VoxelCoord) -> PathRequestId {
        self.nav
            .search_handle()
            .submit(PathRequest::new(start, goal), self.paths.callback())
    }

    /// Call `update()` until `count` outcomes have been delivered.
    pub fn pump_until_paths(&mut self, count: usize) {
        let start = Instant::now();
        while self.paths.len() < count {
            assert!(
                start.elapsed() < POLL_TIMEOUT,
                "timed out waiting for {count} paths, have {}",
                self.paths.len()
            );
            self.nav.update().expect("update failed");
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Submit one request and wait for its outcome.
    pub fn find_path(&mut self, start: VoxelCoord, goal: VoxelCoord) -> PathOutcome {
        let before = self.paths.len();
        let id = self.submit(start, goal);
        self.pump_until_paths(before + 1);
        self.paths
            .take()
            .into_iter()
            .find(|(got, _)| *got == id)
            .map(|(_, outcome)| outcome)
            .expect("outcome for submitted request")
    }
}

/// Grid settings for one island with its first column at `x0`.
pub fn island(x0: i32) -> GraphKind {
    GraphKind::Grid(GridGraphSettings::new(VoxelCoord::new(x0, 0, 0), ISLAND, ISLAND))
}

/// Poll `condition` until it holds or `POLL_TIMEOUT` passes.
pub fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let start = Instant::now();
    while !condition() {
        assert!(start.elapsed() < POLL_TIMEOUT, "timed out waiting for {what}");
        thread::sleep(POLL_INTERVAL);
    }
}
