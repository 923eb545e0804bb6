// Work items and the FIFO mutation scheduler.
//
// A `WorkItem` is a two-phase unit of graph mutation: an optional one-shot
// `init`, then a `step(force)` that is called once per drain until it
// returns true ("done"). Earlier steps may only prepare data; side effects on
// graph memory belong in the step that returns true, because only that call
// is guaranteed to run while search is paused and the data lock is held.
//
// `WorkItemQueue::drain(force)` runs items strictly front to back:
// - not forced: a step returning false stops the drain, the item stays at
//   the head and resumes on the next drain;
// - forced: every step must return true. One that does not is a contract
//   violation, logged at `error!` and reported as `NavError::WorkItemStalled`.
//
// Every effect a batch has on the world (dirty regions, completed items,
// connectivity staleness) accumulates in a `BatchState` that survives
// partial drains. When the queue empties, the drain returns
// `DrainOutcome::Completed` with the accumulated state exactly once, and the
// caller runs the batch-completion work (link refresh, connectivity, hooks)
// over the cumulative effect of every item.
//
// The drain enters the structure guard with `allow_adding_only = true` for
// its whole duration, so items may add graphs (the link graph is created
// this way) but never remove them.
//
// **Critical constraint: no reentrancy.** While an item runs, a thread-local
// flag is set; pausing search from inside an item panics (see
// `search_pool.rs`), as does draining the queue again.
//
// See also: `coordinator.rs` which pauses search and takes the data lock
// around `drain`, `offmesh.rs` and `graph_update.rs` for item producers.

use crate::connectivity;
use crate::error::{NavError, Result};
use crate::graph_set::{GraphKind, GraphSet};
use crate::structure_guard::StructureGuard;
use crate::types::{Aabb, GraphIndex};
use std::cell::Cell;
use std::collections::VecDeque;
use std::fmt;
use tracing::{error, trace};

thread_local! {
    static IN_WORK_ITEM: Cell<bool> = const { Cell::new(false) };
}

/// True while the current thread is executing a work item.
pub fn in_work_item() -> bool {
    IN_WORK_ITEM.with(Cell::get)
}

/// Sets the work-item flag for its lifetime, restoring the previous value on
/// drop (including during unwinding).
struct WorkItemScope {
    previous: bool,
}

impl WorkItemScope {
    fn enter() -> Self {
        Self {
            previous: IN_WORK_ITEM.with(|flag| flag.replace(true)),
        }
    }
}

impl Drop for WorkItemScope {
    fn drop(&mut self) {
        IN_WORK_ITEM.with(|flag| flag.set(self.previous));
    }
}

type InitFn = Box<dyn FnOnce(&mut WorkContext<'_>) + Send>;
type StepFn = Box<dyn FnMut(&mut WorkContext<'_>, bool) -> bool + Send>;

/// A two-phase graph mutation.
pub struct WorkItem {
    label: &'static str,
    init: Option<InitFn>,
    step: StepFn,
}

impl WorkItem {
    /// An item whose `step(ctx, force)` is called until it returns true.
    pub fn new(step: impl FnMut(&mut WorkContext<'_>, bool) -> bool + Send + 'static) -> Self {
        Self {
            label: "work item",
            init: None,
            step: Box::new(step),
        }
    }

    /// An item that completes in its first step.
    pub fn once(f: impl FnOnce(&mut WorkContext<'_>) + Send + 'static) -> Self {
        let mut f = Some(f);
        Self::new(move |ctx, _force| {
            if let Some(f) = f.take() {
                f(ctx);
            }
            true
        })
    }

    /// An item that does nothing. Used to force a batch boundary (and with it
    /// a link refresh).
    pub fn noop() -> Self {
        Self::new(|_, _| true).labeled("no-op")
    }

    /// Run `init` once before the first step.
    pub fn with_init(mut self, init: impl FnOnce(&mut WorkContext<'_>) + Send + 'static) -> Self {
        self.init = Some(Box::new(init));
        self
    }

    /// Name used in log events.
    pub fn labeled(mut self, label: &'static str) -> Self {
        self.label = label;
        self
    }

    pub fn label(&self) -> &'static str {
        self.label
    }
}

impl fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkItem")
            .field("label", &self.label)
            .field("has_init", &self.init.is_some())
            .finish()
    }
}

/// The cumulative effect of the items drained in one batch.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BatchState {
    /// Regions whose nodes changed, in the order they were reported.
    pub regions: Vec<Aabb>,
    pub items_completed: usize,
    /// Graph memory was handed out mutably since connectivity was last
    /// recomputed.
    pub connectivity_dirty: bool,
}

impl BatchState {
    fn push_region(&mut self, bounds: Aabb) {
        if !self.regions.contains(&bounds) {
            self.regions.push(bounds);
        }
    }
}

/// What a work item sees while it runs.
pub struct WorkContext<'a> {
    graphs: &'a mut GraphSet,
    guard: &'a StructureGuard,
    batch: &'a mut BatchState,
    spawned: Vec<WorkItem>,
}

impl<'a> WorkContext<'a> {
    pub fn graphs(&self) -> &GraphSet {
        &*self.graphs
    }

    /// Mutable graph memory. Marks connectivity stale.
    pub fn graphs_mut(&mut self) -> &mut GraphSet {
        self.batch.connectivity_dirty = true;
        &mut *self.graphs
    }

    /// Report that nodes inside `bounds` changed. Off-mesh links touching the
    /// region are re-resolved when the batch completes.
    pub fn dirty_bounds(&mut self, bounds: Aabb) {
        self.batch.connectivity_dirty = true;
        self.batch.push_region(bounds);
    }

    /// Recompute connectivity areas now if graph memory changed since the
    /// last recompute, so the item can rely on `NavNode::area`.
    pub fn ensure_valid_flood_fill(&mut self) {
        if self.batch.connectivity_dirty {
            connectivity::recompute_areas(&mut *self.graphs);
            self.batch.connectivity_dirty = false;
        }
    }

    /// Queue another item behind every item already queued.
    pub fn add_work_item(&mut self, item: WorkItem) {
        self.spawned.push(item);
    }

    /// Add a graph. Permitted inside a batch as long as no scan holds the
    /// structure guard.
    pub fn add_graph(&mut self, kind: GraphKind, name: &str) -> Result<GraphIndex> {
        self.guard.assert_mutable(true, "add a graph")?;
        self.batch.connectivity_dirty = true;
        self.graphs.add(kind, name)
    }

    /// Removing graphs is never permitted from inside a batch; this always
    /// fails with `NavError::StructureLocked` while the batch runs.
    pub fn remove_graph(&mut self, index: GraphIndex) -> Result<()> {
        self.guard.assert_mutable(false, "remove a graph")?;
        self.batch.connectivity_dirty = true;
        self.graphs.remove(index).map(drop)
    }
}

struct Pending {
    item: WorkItem,
    initialized: bool,
}

/// Result of one `WorkItemQueue::drain`.
#[derive(Debug, PartialEq)]
pub enum DrainOutcome {
    /// Nothing was queued.
    Idle,
    /// An item asked for more time; the batch is still open.
    InProgress,
    /// The queue emptied. Carries the cumulative effect of the whole batch.
    Completed(BatchState),
}

/// FIFO of pending work items.
#[derive(Default)]
pub struct WorkItemQueue {
    items: VecDeque<Pending>,
    batch: BatchState,
}

impl WorkItemQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, item: WorkItem) {
        trace!(label = item.label, queued = self.items.len() + 1, "nav.work.enqueued");
        self.items.push_back(Pending {
            item,
            initialized: false,
        });
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Run queued items front to back. The caller must have paused search
    /// and hold the data write lock.
    ///
    /// Panics if called from inside a work item or while the structure
    /// guard is held.
    pub fn drain(
        &mut self,
        graphs: &mut GraphSet,
        guard: &StructureGuard,
        force: bool,
    ) -> Result<DrainOutcome> {
        assert!(
            !in_work_item(),
            "work items cannot be drained from inside a work item"
        );
        if self.items.is_empty() {
            return Ok(DrainOutcome::Idle);
        }
        assert!(
            guard.is_empty(),
            "work items cannot be drained while the graph structure is locked"
        );
        let _token = guard.enter(true);
        let _scope = WorkItemScope::enter();

        while let Some(mut pending) = self.items.pop_front() {
            let mut ctx = WorkContext {
                graphs: &mut *graphs,
                guard,
                batch: &mut self.batch,
                spawned: Vec::new(),
            };
            if !pending.initialized {
                if let Some(init) = pending.item.init.take() {
                    init(&mut ctx);
                }
                pending.initialized = true;
            }
            let done = (pending.item.step)(&mut ctx, force);
            let WorkContext { spawned, .. } = ctx;

            if done {
                trace!(label = pending.item.label, "nav.work.completed");
                self.batch.items_completed += 1;
                self.extend(spawned);
                continue;
            }

            let label = pending.item.label;
            self.items.push_front(pending);
            self.extend(spawned);
            if force {
                error!(label, "nav.work.forced_step_incomplete");
                return Err(NavError::WorkItemStalled);
            }
            trace!(label, remaining = self.items.len(), "nav.work.yielded");
            return Ok(DrainOutcome::InProgress);
        }

        Ok(DrainOutcome::Completed(std::mem::take(&mut self.batch)))
    }

    fn extend(&mut self, spawned: Vec<WorkItem>) {
        for item in spawned {
            self.push(item);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generators::GridGraphSettings;
    use crate::types::VoxelCoord;
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use std::sync::Arc;

    type Log = Arc<Mutex<Vec<String>>>;

    fn grid() -> GraphKind {
        GraphKind::Grid(GridGraphSettings::new(VoxelCoord::new(0, 0, 0), 2, 2))
    }

    fn region(x: i32) -> Aabb {
        Aabb::from_corners(VoxelCoord::new(x, 0, 0), VoxelCoord::new(x + 1, 1, 1))
    }

    /// An item that needs `steps` calls (or one forced call) to finish.
    fn counted(log: &Log, name: &'static str, steps: usize) -> WorkItem {
        let init_log = Arc::clone(log);
        let step_log = Arc::clone(log);
        let mut calls = 0;
        WorkItem::new(move |_, force| {
            calls += 1;
            let done = force || calls >= steps;
            if done {
                step_log.lock().push(format!("{name}:done"));
            }
            done
        })
        .with_init(move |_| init_log.lock().push(format!("{name}:init")))
    }

    #[test]
    fn empty_queue_is_idle() {
        let mut queue = WorkItemQueue::new();
        let mut graphs = GraphSet::new(4);
        let guard = StructureGuard::new();
        assert_eq!(queue.drain(&mut graphs, &guard, true).unwrap(), DrainOutcome::Idle);
    }

    #[test]
    fn init_runs_once_before_first_step() {
        let log: Log = Arc::default();
        let mut queue = WorkItemQueue::new();
        queue.push(counted(&log, "a", 3));
        let mut graphs = GraphSet::new(4);
        let guard = StructureGuard::new();

        assert_eq!(
            queue.drain(&mut graphs, &guard, false).unwrap(),
            DrainOutcome::InProgress
        );
        assert_eq!(
            queue.drain(&mut graphs, &guard, false).unwrap(),
            DrainOutcome::InProgress
        );
        assert!(matches!(
            queue.drain(&mut graphs, &guard, false).unwrap(),
            DrainOutcome::Completed(_)
        ));
        assert_eq!(*log.lock(), vec!["a:init", "a:done"]);
        assert!(guard.is_empty());
    }

    #[test]
    fn batch_accumulates_across_partial_drains() {
        let mut queue = WorkItemQueue::new();
        queue.push(WorkItem::once(|ctx| ctx.dirty_bounds(region(0))));
        let mut waited = false;
        queue.push(WorkItem::new(move |ctx, _| {
            if !waited {
                waited = true;
                return false;
            }
            ctx.dirty_bounds(region(10));
            true
        }));
        let mut graphs = GraphSet::new(4);
        let guard = StructureGuard::new();

        assert_eq!(
            queue.drain(&mut graphs, &guard, false).unwrap(),
            DrainOutcome::InProgress
        );
        let DrainOutcome::Completed(batch) = queue.drain(&mut graphs, &guard, false).unwrap() else {
            panic!("batch should complete");
        };
        assert_eq!(batch.regions, vec![region(0), region(10)]);
        assert_eq!(batch.items_completed, 2);
        // The next batch starts empty.
        queue.push(WorkItem::noop());
        let DrainOutcome::Completed(batch) = queue.drain(&mut graphs, &guard, false).unwrap() else {
            panic!("batch should complete");
        };
        assert!(batch.regions.is_empty());
    }

    #[test]
    fn forced_step_that_does_not_finish_is_an_error() {
        let mut queue = WorkItemQueue::new();
        queue.push(WorkItem::new(|_, _| false).labeled("stuck"));
        let mut graphs = GraphSet::new(4);
        let guard = StructureGuard::new();
        let err = queue.drain(&mut graphs, &guard, true).unwrap_err();
        assert!(matches!(err, NavError::WorkItemStalled));
        assert_eq!(queue.len(), 1);
        assert!(guard.is_empty());
    }

    #[test]
    fn nested_items_run_after_existing_ones() {
        let log: Log = Arc::default();
        let mut queue = WorkItemQueue::new();
        let spawn_log = Arc::clone(&log);
        queue.push(WorkItem::once(move |ctx| {
            spawn_log.lock().push("a:done".into());
            let nested_log = Arc::clone(&spawn_log);
            ctx.add_work_item(WorkItem::once(move |_| nested_log.lock().push("c:done".into())));
        }));
        queue.push(counted(&log, "b", 1));
        let mut graphs = GraphSet::new(4);
        let guard = StructureGuard::new();
        queue.drain(&mut graphs, &guard, true).unwrap();
        assert_eq!(*log.lock(), vec!["a:done", "b:init", "b:done", "c:done"]);
    }

    #[test]
    fn items_may_add_graphs_but_not_remove_them() {
        let mut graphs = GraphSet::new(4);
        let existing = graphs.add(grid(), "existing").unwrap();
        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&results);
        let mut queue = WorkItemQueue::new();
        queue.push(WorkItem::once(move |ctx| {
            let added = ctx.add_graph(GraphKind::Link, "links").map(|_| ());
            let removed = ctx.remove_graph(existing);
            sink.lock().push((added.is_ok(), removed.err()));
        }));
        let guard = StructureGuard::new();
        queue.drain(&mut graphs, &guard, true).unwrap();

        let results = results.lock();
        assert!(results[0].0);
        assert!(matches!(
            results[0].1,
            Some(NavError::StructureLocked { .. })
        ));
        assert_eq!(graphs.len(), 2);
        assert!(graphs.link_graph().is_some());
    }

    #[test]
    fn ensure_valid_flood_fill_recomputes_areas() {
        let mut graphs = GraphSet::new(4);
        let g = graphs.add(grid(), "g").unwrap();
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        let mut queue = WorkItemQueue::new();
        queue.push(WorkItem::once(move |ctx| {
            let graph = ctx.graphs_mut().get_mut(g).unwrap();
            let node = graph.nav.add_node(VoxelCoord::new(0, 0, 0));
            let r = graph.node_ref(node);
            ctx.ensure_valid_flood_fill();
            *sink.lock() = ctx.graphs().node(r).map(|n| n.area);
        }));
        let guard = StructureGuard::new();
        let DrainOutcome::Completed(batch) = queue.drain(&mut graphs, &guard, true).unwrap() else {
            panic!("batch should complete");
        };
        assert_eq!(*seen.lock(), Some(1));
        assert!(!batch.connectivity_dirty);
    }

    #[test]
    fn flag_is_set_only_while_items_run() {
        let seen = Arc::new(Mutex::new(false));
        let sink = Arc::clone(&seen);
        let mut queue = WorkItemQueue::new();
        queue.push(WorkItem::once(move |_| *sink.lock() = in_work_item()));
        let mut graphs = GraphSet::new(4);
        queue.drain(&mut graphs, &StructureGuard::new(), true).unwrap();
        assert!(*seen.lock());
        assert!(!in_work_item());
    }

    #[test]
    #[should_panic(expected = "structure is locked")]
    fn drain_while_guard_held_panics() {
        let mut queue = WorkItemQueue::new();
        queue.push(WorkItem::noop());
        let guard = StructureGuard::new();
        let _scan = guard.enter(false);
        let mut graphs = GraphSet::new(4);
        let _ = queue.drain(&mut graphs, &guard, true);
    }

    proptest! {
        #[test]
        fn items_complete_in_enqueue_order(steps in prop::collection::vec(1usize..4, 0..12)) {
            let log: Log = Arc::default();
            let mut queue = WorkItemQueue::new();
            let names: Vec<&'static str> = ["i0", "i1", "i2", "i3", "i4", "i5", "i6", "i7", "i8", "i9", "i10", "i11"]
                .into_iter()
                .take(steps.len())
                .collect();
            for (&name, &n) in names.iter().zip(&steps) {
                queue.push(counted(&log, name, n));
            }
            let mut graphs = GraphSet::new(4);
            let guard = StructureGuard::new();

            let mut completed_batches = 0;
            for _ in 0..(steps.iter().sum::<usize>() + 1) {
                match queue.drain(&mut graphs, &guard, false).unwrap() {
                    DrainOutcome::Completed(batch) => {
                        prop_assert_eq!(batch.items_completed, steps.len());
                        completed_batches += 1;
                    }
                    DrainOutcome::Idle | DrainOutcome::InProgress => {}
                }
            }
            prop_assert!(queue.is_empty());
            prop_assert_eq!(completed_batches, usize::from(!steps.is_empty()));
            let done: Vec<String> = log.lock().iter().filter(|e| e.ends_with(":done")).cloned().collect();
            let expected: Vec<String> = names.iter().map(|n| format!("{n}:done")).collect();
            prop_assert_eq!(done, expected);
        }

        #[test]
        fn forced_flush_finishes_every_item(steps in prop::collection::vec(1usize..6, 1..12)) {
            let log: Log = Arc::default();
            let mut queue = WorkItemQueue::new();
            for &n in &steps {
                queue.push(counted(&log, "x", n));
            }
            let mut graphs = GraphSet::new(4);
            let guard = StructureGuard::new();
            let outcome = queue.drain(&mut graphs, &guard, true).unwrap();
            prop_assert!(matches!(outcome, DrainOutcome::Completed(_)));
            prop_assert_eq!(log.lock().iter().filter(|e| e.ends_with(":done")).count(), steps.len());
        }
    }
}
