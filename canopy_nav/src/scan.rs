// Scan pipeline: full (re)builds of one or more graphs.
//
// A scan is an explicit state machine (`ScanTask`) owned by the coordinator
// and advanced by `step_scan(budget)`. It never captures a continuation: the
// blocking `scan()` loops `step_scan(None)`, `scan_async()` hands out a
// `ScanProgress` iterator whose `next()` is one time-sliced step, and
// `update()` steps whatever scan is active once per frame.
//
// Stages:
// - Begin: pause search, return completed paths, force-drain work items,
//   make sure the link graph exists, enter the structure guard
//   (`allow_adding_only = false`), run pre-scan hooks, create one
//   `ScanPromise` per graph. Blocking scans destroy the old nodes here.
// - Prepare: blocking scans prepare every promise in parallel (rayon).
//   Cooperative scans step promises round-robin until the time slice is
//   spent, keeping the old nodes live so searches and readers never see a
//   half-built graph.
// - Apply: under the data write lock, with no way to yield in between,
//   commit every promise, tag old and new bounds dirty, refresh links,
//   recompute connectivity, run post-scan hooks. Then release the write
//   lock, the guard and the pause, in that order.
//
// Scans are never queued or merged: starting a scan, flushing work items or
// shutting down while a scan is active first runs it to completion.
//
// **Critical constraint: a failing hook leaves the scanned graphs empty.**
// The task is aborted, every affected graph has its nodes destroyed, all
// locks are released in reverse order and the hook's error is returned.
//
// See also: `generators.rs` for `ScanPromise`, `coordinator.rs` for the rest
// of `NavCoordinator`.

use crate::coordinator::NavCoordinator;
use crate::error::{HookStage, NavError, Result};
use crate::generators::{PrepareStatus, ScanPromise};
use crate::search_pool::PauseLock;
use crate::structure_guard::StructureGuardToken;
use crate::types::{Aabb, GraphIndex};
use rayon::prelude::*;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// One observable step of a scan.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ScanEvent {
    /// Prepare work advanced. `progress` is in `0.0..=1.0` over all graphs.
    Preparing { progress: f32 },
    /// Every graph was committed and dependent data recomputed.
    Completed { graphs: usize },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ScanStage {
    Begin,
    Prepare,
    Done,
}

pub(crate) struct ScanTask {
    targets: Vec<GraphIndex>,
    cooperative: bool,
    stage: ScanStage,
    // Released in reverse acquisition order: guard, then pause.
    pause: Option<PauseLock>,
    guard: Option<StructureGuardToken>,
    promises: Vec<ScanPromise>,
    cursor: usize,
    old_bounds: Option<Aabb>,
    started: Instant,
}

impl ScanTask {
    fn new(targets: Vec<GraphIndex>, cooperative: bool) -> Self {
        Self {
            targets,
            cooperative,
            stage: ScanStage::Begin,
            pause: None,
            guard: None,
            promises: Vec::new(),
            cursor: 0,
            old_bounds: None,
            started: Instant::now(),
        }
    }

    fn progress(&self) -> f32 {
        if self.promises.is_empty() {
            return 0.0;
        }
        self.promises.iter().map(ScanPromise::progress).sum::<f32>() / self.promises.len() as f32
    }

    /// Step promises round-robin. Returns true once all are ready. Always
    /// makes at least one step of progress when any promise is pending.
    fn step_promises(&mut self, deadline: Option<Instant>) -> bool {
        let n = self.promises.len();
        loop {
            let cursor = self.cursor;
            let Some(offset) = (0..n).find(|k| !self.promises[(cursor + k) % n].is_ready()) else {
                return true;
            };
            let i = (cursor + offset) % n;
            if let PrepareStatus::Pending { done, total } = self.promises[i].step() {
                debug!(graph = %self.promises[i].graph(), done, total, "nav.scan.step");
            }
            self.cursor = (i + 1) % n;
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return self.promises.iter().all(ScanPromise::is_ready);
            }
        }
    }

    fn release(&mut self) {
        self.guard = None;
        self.pause = None;
    }
}

/// Iterator over the events of a cooperative scan. Each `next()` advances
/// the scan by one time slice. Dropping it early leaves the scan active; it
/// is then stepped by `update()` or completed by the next conflicting call.
pub struct ScanProgress<'a> {
    nav: &'a mut NavCoordinator,
    finished: bool,
}

impl Iterator for ScanProgress<'_> {
    type Item = Result<ScanEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let slice = self.nav.config.scan_time_slice();
        match self.nav.step_scan(Some(slice)) {
            Ok(Some(event)) => {
                self.finished = matches!(event, ScanEvent::Completed { .. });
                Some(Ok(event))
            }
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

impl NavCoordinator {
    /// Rescan `graphs` (all scannable graphs if `None`) and block until the
    /// new nodes are committed.
    pub fn scan(&mut self, graphs: Option<&[GraphIndex]>) -> Result<()> {
        self.complete_active_scan()?;
        let targets = self.scan_targets(graphs)?;
        self.active_scan = Some(ScanTask::new(targets, false));
        self.complete_active_scan()
    }

    /// Start a cooperative rescan. Nothing happens until the returned
    /// iterator (or `update()`) steps it.
    pub fn scan_async(&mut self, graphs: Option<&[GraphIndex]>) -> Result<ScanProgress<'_>> {
        self.complete_active_scan()?;
        let targets = self.scan_targets(graphs)?;
        self.active_scan = Some(ScanTask::new(targets, true));
        Ok(ScanProgress {
            nav: self,
            finished: false,
        })
    }

    pub fn is_scanning(&self) -> bool {
        self.active_scan.is_some()
    }

    /// Advance the active scan by at most `budget` of prepare work. Returns
    /// `None` when no scan is active.
    pub fn step_active_scan(&mut self, budget: Duration) -> Result<Option<ScanEvent>> {
        self.step_scan(Some(budget))
    }

    /// Run the active scan, if any, to completion.
    pub(crate) fn complete_active_scan(&mut self) -> Result<()> {
        while self.active_scan.is_some() {
            self.step_scan(None)?;
        }
        Ok(())
    }

    fn scan_targets(&self, requested: Option<&[GraphIndex]>) -> Result<Vec<GraphIndex>> {
        let graphs = self.graphs_read();
        let Some(requested) = requested else {
            return Ok(graphs
                .iter()
                .filter(|g| g.kind.capabilities().scannable)
                .map(|g| g.index)
                .collect());
        };
        let mut targets = Vec::with_capacity(requested.len());
        for &index in requested {
            let graph = graphs.get(index).ok_or(NavError::NoSuchGraph(index))?;
            if !graph.kind.capabilities().scannable {
                return Err(NavError::Unsupported {
                    graph: index,
                    kind: graph.kind.name(),
                    capability: "scanning",
                });
            }
            if !targets.contains(&index) {
                targets.push(index);
            }
        }
        Ok(targets)
    }

    /// One step of the active scan. `None` budget means no time limit.
    pub(crate) fn step_scan(&mut self, budget: Option<Duration>) -> Result<Option<ScanEvent>> {
        let Some(mut task) = self.active_scan.take() else {
            return Ok(None);
        };
        let deadline = budget.map(|b| Instant::now() + b);
        let result = match task.stage {
            ScanStage::Begin => self.begin_scan(&mut task),
            ScanStage::Prepare => self.prepare_scan(&mut task, deadline),
            ScanStage::Done => Ok(ScanEvent::Completed {
                graphs: task.targets.len(),
            }),
        };
        match result {
            Ok(event) => {
                if task.stage != ScanStage::Done {
                    self.active_scan = Some(task);
                }
                Ok(Some(event))
            }
            Err(e) => {
                self.abort_scan(task, &e);
                Err(e)
            }
        }
    }

    fn begin_scan(&mut self, task: &mut ScanTask) -> Result<ScanEvent> {
        task.pause = Some(self.search.pause(true));
        self.return_paths_blocking();
        self.run_work_items(true)?;
        if !self.links.is_empty() {
            let mut graphs = self.data.write();
            match self.links.ensure_link_graph(&mut graphs, &self.guard) {
                // Links are marked failed at the next refresh; the scan goes on.
                Err(NavError::TooManyGraphs { limit }) => {
                    debug!(limit, "nav.scan.link_graph_unavailable");
                }
                Err(e) => return Err(e),
                Ok(_) => {}
            }
        }
        task.guard = Some(self.guard.enter(false));
        info!(
            graphs = task.targets.len(),
            cooperative = task.cooperative,
            "nav.scan.begin"
        );

        {
            let graphs = self.graphs_read();
            for hook in &mut self.hooks.pre_scan {
                hook(&*graphs).map_err(|source| NavError::Hook {
                    stage: HookStage::PreScan,
                    source,
                })?;
            }
            for &index in &task.targets {
                let Some(graph) = graphs.get(index) else {
                    continue;
                };
                for hook in &mut self.hooks.graph_pre_scan {
                    hook(graph).map_err(|source| NavError::Hook {
                        stage: HookStage::GraphPreScan,
                        source,
                    })?;
                }
                task.promises
                    .extend(ScanPromise::begin(index, &graph.kind, &self.config));
            }
            task.old_bounds = graphs.bounds_of(&task.targets);
        }

        if !task.cooperative {
            let mut graphs = self.data.write();
            for &index in &task.targets {
                if let Some(graph) = graphs.get_mut(index) {
                    graph.destroy_all_nodes();
                }
                graphs.strip_connections_into(index);
            }
        }
        task.stage = ScanStage::Prepare;
        Ok(ScanEvent::Preparing { progress: 0.0 })
    }

    fn prepare_scan(&mut self, task: &mut ScanTask, deadline: Option<Instant>) -> Result<ScanEvent> {
        if task.cooperative {
            if !task.step_promises(deadline) {
                return Ok(ScanEvent::Preparing {
                    progress: task.progress(),
                });
            }
        } else {
            task.promises
                .par_iter_mut()
                .for_each(ScanPromise::prepare_to_completion);
        }
        self.apply_scan(task)
    }

    fn apply_scan(&mut self, task: &mut ScanTask) -> Result<ScanEvent> {
        {
            let mut graphs = self.data.write();
            for promise in task.promises.drain(..) {
                let index = promise.graph();
                if let Some(graph) = graphs.get_mut(index) {
                    promise.apply(graph);
                }
                graphs.strip_connections_into(index);
            }

            let new_bounds = graphs.bounds_of(&task.targets);
            for bounds in [task.old_bounds, new_bounds].into_iter().flatten() {
                self.links.dirty_bounds(bounds);
            }
            if self.links.is_empty() || graphs.link_graph().is_some() {
                self.refresh_links(&mut graphs)?;
            } else {
                // Links added mid-scan need a link graph, which cannot be
                // created while the guard is held. The next batch does it.
                self.schedule_link_refresh();
            }
            self.recompute_connectivity(&mut graphs);

            for &index in &task.targets {
                let Some(graph) = graphs.get(index) else {
                    continue;
                };
                for hook in &mut self.hooks.graph_post_scan {
                    hook(graph).map_err(|source| NavError::Hook {
                        stage: HookStage::GraphPostScan,
                        source,
                    })?;
                }
            }
            for hook in &mut self.hooks.post_scan {
                hook(&*graphs).map_err(|source| NavError::Hook {
                    stage: HookStage::PostScan,
                    source,
                })?;
            }
        }
        task.release();
        task.stage = ScanStage::Done;
        self.stats.scans_completed += 1;
        info!(
            graphs = task.targets.len(),
            elapsed_ms = task.started.elapsed().as_millis() as u64,
            "nav.scan.completed"
        );
        Ok(ScanEvent::Completed {
            graphs: task.targets.len(),
        })
    }

    fn abort_scan(&mut self, mut task: ScanTask, error: &NavError) {
        let reset = matches!(error, NavError::Hook { .. }) || task.stage != ScanStage::Begin;
        if reset {
            let mut graphs = self.data.write();
            for &index in &task.targets {
                if let Some(graph) = graphs.get_mut(index) {
                    graph.destroy_all_nodes();
                }
                graphs.strip_connections_into(index);
            }
            self.recompute_connectivity(&mut graphs);
        }
        task.release();
        self.stats.scans_aborted += 1;
        warn!(error = %error, graphs = task.targets.len(), reset, "nav.scan.aborted");
        if reset {
            if let Some(bounds) = task.old_bounds {
                self.dirty_bounds(bounds);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NavConfig;
    use crate::generators::{GridGraphSettings, PointGraphSettings};
    use crate::graph_set::GraphKind;
    use crate::offmesh::{LinkSource, LinkStatus};
    use crate::types::{GraphMask, VoxelCoord};
    use std::sync::Arc;

    fn nav() -> NavCoordinator {
        NavCoordinator::new(NavConfig {
            search_threads: 1,
            grid_rows_per_step: 1,
            ..NavConfig::default()
        })
    }

    fn grid(x0: i32, width: u32, depth: u32) -> GraphKind {
        GraphKind::Grid(GridGraphSettings::new(VoxelCoord::new(x0, 0, 0), width, depth))
    }

    fn node_count(nav: &NavCoordinator, index: GraphIndex) -> usize {
        nav.with_graphs(|g| g.get(index).map_or(0, |g| g.nav.node_count()))
    }

    #[test]
    fn blocking_scan_builds_every_scannable_graph() {
        let mut nav = nav();
        let a = nav.add_graph(grid(0, 3, 3), "a").unwrap();
        let b = nav.add_graph(grid(10, 2, 2), "b").unwrap();
        nav.scan(None).unwrap();
        assert_eq!(node_count(&nav, a), 9);
        assert_eq!(node_count(&nav, b), 4);
        assert!(!nav.is_scanning());
        assert!(nav.guard.is_empty());
        assert_eq!(nav.search_stats().pause_count, 0);
        assert_eq!(nav.stats().scans_completed, 1);
    }

    #[test]
    fn scan_of_link_graph_is_unsupported() {
        let mut nav = nav();
        let link = nav.add_graph(GraphKind::Link, "links").unwrap();
        assert!(matches!(
            nav.scan(Some(&[link])),
            Err(NavError::Unsupported { capability: "scanning", .. })
        ));
        assert!(matches!(
            nav.scan(Some(&[GraphIndex(9)])),
            Err(NavError::NoSuchGraph(_))
        ));
    }

    #[test]
    fn cooperative_scan_yields_progress_then_completes() {
        let mut nav = nav();
        let a = nav.add_graph(grid(0, 4, 6), "a").unwrap();
        nav.add_graph(
            GraphKind::Point(PointGraphSettings {
                points: (0..5).map(|i| VoxelCoord::new(20 + i, 0, 0)).collect(),
                max_distance: 1.5,
            }),
            "p",
        )
        .unwrap();
        let events: Vec<ScanEvent> = nav
            .scan_async(None)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert!(matches!(events.first(), Some(ScanEvent::Preparing { .. })));
        assert_eq!(events.last(), Some(&ScanEvent::Completed { graphs: 2 }));
        assert_eq!(node_count(&nav, a), 24);
        assert!(!nav.is_scanning());
    }

    #[test]
    fn cooperative_scan_keeps_old_nodes_until_apply() {
        let mut nav = nav();
        let a = nav.add_graph(grid(0, 3, 8), "a").unwrap();
        nav.scan(None).unwrap();
        let before = nav.with_graphs(|g| g.get(a).unwrap().epoch());

        let mut progress = nav.scan_async(None).unwrap();
        progress.next().unwrap().unwrap();
        assert!(nav.is_scanning());
        assert_eq!(node_count(&nav, a), 24);
        assert_eq!(nav.with_graphs(|g| g.get(a).unwrap().epoch()), before);

        // Structural changes are refused until the scan commits.
        assert!(matches!(
            nav.remove_graph(a),
            Err(NavError::StructureLocked { .. })
        ));
        assert!(matches!(
            nav.add_graph(grid(50, 1, 1), "late"),
            Err(NavError::StructureLocked { .. })
        ));

        while nav.is_scanning() {
            nav.update().unwrap();
        }
        assert_ne!(nav.with_graphs(|g| g.get(a).unwrap().epoch()), before);
        assert_eq!(node_count(&nav, a), 24);
        assert!(nav.guard.is_empty());
    }

    #[test]
    fn second_scan_completes_the_first_before_starting() {
        let mut nav = nav();
        nav.add_graph(grid(0, 3, 8), "a").unwrap();
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let pre = log.clone();
        nav.on_pre_scan(move |_| {
            pre.lock().push("pre");
            Ok(())
        });
        let post = log.clone();
        nav.on_post_scan(move |_| {
            post.lock().push("post");
            Ok(())
        });

        let mut first = nav.scan_async(None).unwrap();
        first.next().unwrap().unwrap();
        nav.scan(None).unwrap();
        assert_eq!(*log.lock(), vec!["pre", "post", "pre", "post"]);
        assert_eq!(nav.stats().scans_completed, 2);
    }

    #[test]
    fn flush_completes_an_active_scan() {
        let mut nav = nav();
        nav.add_graph(grid(0, 3, 8), "a").unwrap();
        let mut progress = nav.scan_async(None).unwrap();
        progress.next().unwrap().unwrap();
        nav.flush_work_items().unwrap();
        assert!(!nav.is_scanning());
        assert_eq!(nav.stats().scans_completed, 1);
    }

    #[test]
    fn failing_hook_aborts_and_empties_the_graph() {
        let mut nav = nav();
        let a = nav.add_graph(grid(0, 3, 3), "a").unwrap();
        nav.scan(None).unwrap();
        nav.on_graph_post_scan(|_| Err("broken".into()));

        let err = nav.scan(None).unwrap_err();
        assert!(matches!(
            err,
            NavError::Hook {
                stage: HookStage::GraphPostScan,
                ..
            }
        ));
        assert_eq!(node_count(&nav, a), 0);
        assert!(!nav.is_scanning());
        assert!(nav.guard.is_empty());
        assert_eq!(nav.search_stats().pause_count, 0);
        assert_eq!(nav.stats().scans_aborted, 1);
    }

    #[test]
    fn failing_pre_scan_hook_propagates() {
        let mut nav = nav();
        nav.add_graph(grid(0, 2, 2), "a").unwrap();
        nav.on_pre_scan(|_| Err("nope".into()));
        let mut progress = nav.scan_async(None).unwrap();
        let first = progress.next().unwrap();
        assert!(matches!(
            first,
            Err(NavError::Hook {
                stage: HookStage::PreScan,
                ..
            })
        ));
        assert!(progress.next().is_none());
        assert!(!nav.is_scanning());
        assert!(nav.guard.is_empty());
    }

    #[test]
    fn rescan_keeps_links_connected() {
        let mut nav = nav();
        nav.add_graph(grid(0, 3, 3), "west").unwrap();
        nav.add_graph(grid(10, 3, 3), "east").unwrap();
        nav.scan(None).unwrap();
        let id = nav.add_link(LinkSource::new(
            VoxelCoord::new(2, 0, 1),
            VoxelCoord::new(10, 0, 1),
        ));
        nav.flush_work_items().unwrap();
        assert_eq!(nav.link_status(id), Some(LinkStatus::Active));

        nav.scan(None).unwrap();
        assert_eq!(nav.link_status(id), Some(LinkStatus::Active));
        assert!(nav.is_reachable(
            VoxelCoord::new(0, 0, 0),
            VoxelCoord::new(12, 0, 2),
            GraphMask::ALL
        ));
    }

    #[test]
    fn empty_target_list_completes_immediately() {
        let mut nav = nav();
        nav.scan(Some(&[])).unwrap();
        assert_eq!(nav.stats().scans_completed, 1);
    }
}
