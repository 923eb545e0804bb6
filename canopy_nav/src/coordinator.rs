// The navigation coordinator: explicit owner of every component.
//
// `NavCoordinator` sequences every read, write and structural change of
// graph memory. It owns the graph set (behind `GraphDataLock`), the search
// worker pool, the structure guard, the work-item queue, the off-mesh link
// registry, queued incremental graph updates, user hooks, and the active
// scan if one is in flight. There is no global state: two coordinators are
// fully independent.
//
// Mutation sequence (work items, graph updates, link upkeep):
// 1. Pause search (immediate), then hand back completed paths so no result
//    referencing soon-to-change nodes escapes later.
// 2. Take the data write lock.
// 3. Drain the work-item queue under an allow-adding-only guard entry.
// 4. When the batch completes: tag every region the batch reported dirty,
//    refresh off-mesh links once, recompute connectivity, fire
//    `graphs_updated` hooks.
// 5. Release the write lock, then the pause.
//
// Structural entry points (`add_graph`, `remove_graph`, `clear_graph`) check
// the guard first, then pause, return paths and force-drain work items before
// touching the registry.
//
// **Critical constraint: only this thread mutates graph memory.** Search
// workers and the coordinator's own read-only queries go straight to the
// graph `RwLock`; every mutation also passes the data-lock gate so auxiliary
// readers never see a commit in progress.
//
// See also: `scan.rs` for the scan half of this type, `work_item.rs`,
// `offmesh.rs`, `search_pool.rs`, `data_lock.rs`, `structure_guard.rs`.

use crate::config::NavConfig;
use crate::connectivity::{self, ConnectivityReport};
use crate::data_lock::{GraphDataLock, GraphReadGuard, GraphWriteGuard, PendingRead, PendingWrite};
use crate::error::{HookError, Result};
use crate::graph_set::{Graph, GraphKind, GraphSet};
use crate::graph_update::{GraphUpdate, GraphUpdateQueue};
use crate::offmesh::{LinkConcrete, LinkSource, LinkStatus, OffMeshLinks, RefreshReport};
use crate::scan::ScanTask;
use crate::search_pool::{SearchHandle, SearchPool, SearchStats};
use crate::structure_guard::StructureGuard;
use crate::types::{Aabb, GraphIndex, GraphMask, LinkId, VoxelCoord};
use crate::work_item::{BatchState, DrainOutcome, WorkItem, WorkItemQueue};
use parking_lot::RawRwLock;
use parking_lot::lock_api::ArcRwLockReadGuard;
use serde::Serialize;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Hook over the whole graph set, run before or after a scan.
pub type ScanHook = Box<dyn FnMut(&GraphSet) -> std::result::Result<(), HookError> + Send>;
/// Hook over one scanned graph.
pub type GraphScanHook = Box<dyn FnMut(&Graph) -> std::result::Result<(), HookError> + Send>;
/// Hook fired once per completed work-item batch.
pub type GraphsUpdatedHook = Box<dyn FnMut(&GraphSet) + Send>;

#[derive(Default)]
pub(crate) struct Hooks {
    pub(crate) pre_scan: Vec<ScanHook>,
    pub(crate) graph_pre_scan: Vec<GraphScanHook>,
    pub(crate) graph_post_scan: Vec<GraphScanHook>,
    pub(crate) post_scan: Vec<ScanHook>,
    pub(crate) graphs_updated: Vec<GraphsUpdatedHook>,
}

/// Counters for tests and the driver.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct NavStats {
    pub batches_completed: u64,
    pub work_items_completed: u64,
    pub link_refreshes: u64,
    pub links_reconnected: u64,
    pub links_failed: u64,
    pub connectivity_recomputes: u64,
    pub scans_completed: u64,
    pub scans_aborted: u64,
    pub paths_returned: u64,
}

pub struct NavCoordinator {
    pub(crate) config: NavConfig,
    pub(crate) data: GraphDataLock,
    pub(crate) guard: StructureGuard,
    pub(crate) search: SearchPool,
    pub(crate) work: WorkItemQueue,
    pub(crate) updates: GraphUpdateQueue,
    pub(crate) links: OffMeshLinks,
    pub(crate) hooks: Hooks,
    pub(crate) active_scan: Option<ScanTask>,
    pub(crate) stats: NavStats,
    pub(crate) last_refresh: Option<RefreshReport>,
    shut_down: bool,
}

impl Default for NavCoordinator {
    fn default() -> Self {
        Self::new(NavConfig::default())
    }
}

impl NavCoordinator {
    pub fn new(config: NavConfig) -> Self {
        let data = GraphDataLock::new(GraphSet::new(config.graph_limit()));
        let search = SearchPool::new(data.graphs().clone(), config.search_threads);
        let updates = GraphUpdateQueue::new(
            config.batch_graph_updates,
            config.graph_update_batching_interval(),
        );
        info!(
            search_threads = config.search_threads,
            max_graphs = config.graph_limit(),
            "nav.coordinator.started"
        );
        Self {
            config,
            data,
            guard: StructureGuard::new(),
            search,
            work: WorkItemQueue::new(),
            updates,
            links: OffMeshLinks::new(),
            hooks: Hooks::default(),
            active_scan: None,
            stats: NavStats::default(),
            last_refresh: None,
            shut_down: false,
        }
    }

    pub fn config(&self) -> &NavConfig {
        &self.config
    }

    pub fn stats(&self) -> NavStats {
        self.stats
    }

    pub fn search_stats(&self) -> SearchStats {
        self.search.stats()
    }

    /// The report of the most recent off-mesh link refresh.
    pub fn last_link_refresh(&self) -> Option<&RefreshReport> {
        self.last_refresh.as_ref()
    }

    /// Read access for the coordinator's own queries. Bypasses the data-lock
    /// gate, which only orders mutations against auxiliary readers.
    pub(crate) fn graphs_read(&self) -> ArcRwLockReadGuard<RawRwLock, GraphSet> {
        self.data.graphs().read_arc()
    }

    /// Run `f` against the current graph set.
    pub fn with_graphs<R>(&self, f: impl FnOnce(&GraphSet) -> R) -> R {
        f(&self.graphs_read())
    }

    pub fn graph_count(&self) -> usize {
        self.graphs_read().len()
    }

    // -----------------------------------------------------------------------
    // Per-frame tick
    // -----------------------------------------------------------------------

    /// Return completed paths, release due graph updates, then either step
    /// the active cooperative scan by one time slice or drain work items
    /// without forcing.
    pub fn update(&mut self) -> Result<()> {
        self.return_paths_limited();
        if let Some(item) = self.updates.take_due(Instant::now(), false) {
            self.work.push(item);
        }
        if self.active_scan.is_some() {
            let slice = self.config.scan_time_slice();
            self.step_scan(Some(slice))?;
        } else {
            self.run_work_items(false)?;
        }
        Ok(())
    }

    fn return_paths_limited(&mut self) {
        let returned = match self.config.return_paths_per_update {
            0 => self.search.return_completed(false),
            max => self.search.return_completed_up_to(max),
        };
        self.stats.paths_returned += returned as u64;
    }

    /// Wait for searches in progress (search must be paused) and hand every
    /// completed result back.
    pub(crate) fn return_paths_blocking(&mut self) {
        let returned = self.search.return_completed(true);
        self.stats.paths_returned += returned as u64;
    }

    // -----------------------------------------------------------------------
    // Work items
    // -----------------------------------------------------------------------

    pub fn add_work_item(&mut self, item: WorkItem) {
        self.work.push(item);
    }

    pub fn pending_work_items(&self) -> usize {
        self.work.len()
    }

    /// Run every queued work item to completion. An in-flight cooperative
    /// scan is completed first.
    pub fn flush_work_items(&mut self) -> Result<()> {
        self.complete_active_scan()?;
        self.run_work_items(true)?;
        Ok(())
    }

    /// Drain the queue under a pause and the data write lock. Returns true
    /// when the queue ended empty.
    pub(crate) fn run_work_items(&mut self, force: bool) -> Result<bool> {
        if self.work.is_empty() {
            return Ok(true);
        }
        let _pause = self.search.pause(true);
        self.return_paths_blocking();
        let mut graphs = self.data.write();
        match self.work.drain(&mut graphs, &self.guard, force)? {
            DrainOutcome::Idle => Ok(true),
            DrainOutcome::InProgress => Ok(false),
            DrainOutcome::Completed(batch) => {
                self.complete_batch(&mut graphs, batch)?;
                Ok(true)
            }
        }
    }

    /// Batch completion: one link refresh over the union of dirty regions,
    /// connectivity, hooks.
    fn complete_batch(&mut self, graphs: &mut GraphWriteGuard, batch: BatchState) -> Result<()> {
        let _token = self.guard.enter(true);
        for region in &batch.regions {
            self.links.dirty_bounds(*region);
        }
        let report = self.refresh_links(graphs)?;
        let links_changed = report.reconnected > 0 || report.removed > 0 || report.failed > 0;
        if batch.connectivity_dirty || links_changed {
            self.recompute_connectivity(graphs);
        }
        for hook in &mut self.hooks.graphs_updated {
            hook(&**graphs);
        }
        self.stats.batches_completed += 1;
        self.stats.work_items_completed += batch.items_completed as u64;
        debug!(
            items = batch.items_completed,
            regions = batch.regions.len(),
            "nav.work.batch_completed"
        );
        Ok(())
    }

    pub(crate) fn refresh_links(&mut self, graphs: &mut GraphSet) -> Result<RefreshReport> {
        let report = self.links.refresh(graphs, &self.guard)?;
        self.stats.link_refreshes += 1;
        self.stats.links_reconnected += report.reconnected as u64;
        self.stats.links_failed += report.failed as u64;
        self.last_refresh = Some(report.clone());
        Ok(report)
    }

    pub(crate) fn recompute_connectivity(&mut self, graphs: &mut GraphSet) -> ConnectivityReport {
        self.stats.connectivity_recomputes += 1;
        connectivity::recompute_areas(graphs)
    }

    /// Queue a no-op work item whose batch completion refreshes links,
    /// unless one is already queued.
    pub(crate) fn schedule_link_refresh(&mut self) {
        if self.links.request_refresh() {
            self.work.push(WorkItem::noop().labeled("link refresh"));
        }
    }

    // -----------------------------------------------------------------------
    // Graph structure
    // -----------------------------------------------------------------------

    /// Register a new graph. It has no nodes until it is scanned.
    pub fn add_graph(&mut self, kind: GraphKind, name: &str) -> Result<GraphIndex> {
        self.guard.assert_mutable(true, "add a graph")?;
        let _pause = self.search.pause(true);
        self.return_paths_blocking();
        self.run_work_items(true)?;
        let mut graphs = self.data.write();
        let index = graphs.add(kind, name)?;
        info!(graph = %index, name, "nav.graph.added");
        Ok(index)
    }

    /// Remove a graph. Connections into it are stripped and links anchored
    /// on it are re-resolved on the next batch.
    pub fn remove_graph(&mut self, index: GraphIndex) -> Result<()> {
        self.guard.assert_mutable(false, "remove a graph")?;
        let _pause = self.search.pause(true);
        self.return_paths_blocking();
        self.run_work_items(true)?;
        let bounds = {
            let mut graphs = self.data.write();
            let removed = graphs.remove(index)?;
            self.recompute_connectivity(&mut graphs);
            removed.bounds()
        };
        info!(graph = %index, "nav.graph.removed");
        if let Some(bounds) = bounds {
            self.dirty_bounds(bounds);
        }
        if self.links.retry_link_graph_failures() {
            self.schedule_link_refresh();
        }
        Ok(())
    }

    /// Destroy every node of a graph, keeping the graph registered.
    pub fn clear_graph(&mut self, index: GraphIndex) -> Result<()> {
        self.guard.assert_mutable(false, "clear a graph")?;
        let _pause = self.search.pause(true);
        self.return_paths_blocking();
        self.run_work_items(true)?;
        let bounds = {
            let mut graphs = self.data.write();
            let bounds = graphs.get(index).and_then(Graph::bounds);
            graphs.clear(index)?;
            self.recompute_connectivity(&mut graphs);
            bounds
        };
        debug!(graph = %index, "nav.graph.cleared");
        if let Some(bounds) = bounds {
            self.dirty_bounds(bounds);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Off-mesh links
    // -----------------------------------------------------------------------

    /// Register a link. It connects on the next batch completion.
    pub fn add_link(&mut self, source: LinkSource) -> LinkId {
        let id = self.links.add(source);
        self.schedule_link_refresh();
        id
    }

    pub fn remove_link(&mut self, id: LinkId) -> Result<()> {
        self.links.remove(id)?;
        self.schedule_link_refresh();
        Ok(())
    }

    /// Tell the link registry that nodes inside `bounds` changed.
    pub fn dirty_bounds(&mut self, bounds: Aabb) {
        self.links.dirty_bounds(bounds);
        self.schedule_link_refresh();
    }

    pub fn link_status(&self, id: LinkId) -> Option<LinkStatus> {
        self.links.status(id)
    }

    pub fn link_concrete(&self, id: LinkId) -> Option<&LinkConcrete> {
        self.links.concrete(id)
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    // -----------------------------------------------------------------------
    // Incremental graph updates
    // -----------------------------------------------------------------------

    /// Queue an update. It becomes a work item once due (see
    /// `NavConfig::batch_graph_updates`).
    pub fn update_graphs(&mut self, update: GraphUpdate) {
        self.updates.push(update);
    }

    pub fn pending_graph_updates(&self) -> usize {
        self.updates.len()
    }

    /// Apply every queued update now, ignoring the batching interval.
    pub fn flush_graph_updates(&mut self) -> Result<()> {
        if let Some(item) = self.updates.take_due(Instant::now(), true) {
            self.work.push(item);
        }
        self.flush_work_items()
    }

    // -----------------------------------------------------------------------
    // Auxiliary access to graph memory
    // -----------------------------------------------------------------------

    /// A clone of the data lock for background computations on other threads.
    pub fn graph_data_lock(&self) -> GraphDataLock {
        self.data.clone()
    }

    pub fn lock_graph_data_for_reading(&self) -> GraphReadGuard {
        self.data.read()
    }

    pub fn lock_graph_data_for_writing(&self) -> GraphWriteGuard {
        self.data.write()
    }

    pub fn lock_graph_data_for_reading_async(&self) -> PendingRead {
        self.data.read_async()
    }

    pub fn lock_graph_data_for_writing_async(&self) -> PendingWrite {
        self.data.write_async()
    }

    // -----------------------------------------------------------------------
    // Search
    // -----------------------------------------------------------------------

    pub fn search_handle(&self) -> SearchHandle {
        self.search.handle()
    }

    /// Search queued requests on this thread, then return the results.
    /// Needed when `search_threads` is 0.
    pub fn process_paths_inline(&mut self) -> usize {
        let searched = self.search.process_pending();
        self.return_paths_limited();
        searched
    }

    /// Whether `goal` can be reached from `start` according to the last
    /// connectivity recompute. Both ends snap to the nearest walkable node.
    pub fn is_reachable(&self, start: VoxelCoord, goal: VoxelCoord, mask: GraphMask) -> bool {
        let graphs = self.graphs_read();
        match (
            graphs.find_nearest_walkable(start, mask),
            graphs.find_nearest_walkable(goal, mask),
        ) {
            (Some((a, _)), Some((b, _))) => connectivity::same_area(&graphs, a, b),
            _ => false,
        }
    }

    // -----------------------------------------------------------------------
    // Hooks
    // -----------------------------------------------------------------------

    pub fn on_pre_scan(
        &mut self,
        hook: impl FnMut(&GraphSet) -> std::result::Result<(), HookError> + Send + 'static,
    ) {
        self.hooks.pre_scan.push(Box::new(hook));
    }

    pub fn on_graph_pre_scan(
        &mut self,
        hook: impl FnMut(&Graph) -> std::result::Result<(), HookError> + Send + 'static,
    ) {
        self.hooks.graph_pre_scan.push(Box::new(hook));
    }

    pub fn on_graph_post_scan(
        &mut self,
        hook: impl FnMut(&Graph) -> std::result::Result<(), HookError> + Send + 'static,
    ) {
        self.hooks.graph_post_scan.push(Box::new(hook));
    }

    pub fn on_post_scan(
        &mut self,
        hook: impl FnMut(&GraphSet) -> std::result::Result<(), HookError> + Send + 'static,
    ) {
        self.hooks.post_scan.push(Box::new(hook));
    }

    pub fn on_graphs_updated(&mut self, hook: impl FnMut(&GraphSet) + Send + 'static) {
        self.hooks.graphs_updated.push(Box::new(hook));
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Complete the active scan, apply queued updates and work items, then
    /// stop the search workers. Idempotent.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;
        let result = self.flush_graph_updates();
        self.search.shutdown();
        self.return_paths_limited();
        info!(stats = ?self.stats, "nav.coordinator.shutdown");
        result
    }
}

impl Drop for NavCoordinator {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!(error = %e, "nav.coordinator.shutdown_failed");
        }
        if !self.guard.is_empty() {
            warn!(depth = self.guard.depth(), "nav.coordinator.guard_leaked");
        }
    }
}
