// Search worker pool and the pause protocol.
//
// `SearchPool` owns N worker threads. Path requests enter a FIFO queue; a
// worker takes one only while no pause is outstanding, runs A* against graph
// memory (read lock held for exactly that unit of work), and pushes the
// outcome to the return queue. Outcomes are handed back on the caller's
// thread by `return_completed`, which is how the coordinator makes sure no
// result referencing about-to-be-destroyed nodes escapes after a mutation
// has started.
//
// Pause protocol:
// - `pause(immediate)` increments a pause count and returns a `PauseLock`.
//   While the count is non-zero no worker starts a new request; a worker
//   always finishes the one it is on.
// - `immediate = true` blocks until every worker is idle. With `false` the
//   call returns at once and `PauseLock::wait_until_paused` completes the
//   drain later.
// - Pauses coalesce: only the release of the last outstanding `PauseLock`
//   resumes the workers. Release happens on drop (or via `release(self)`),
//   so a lock cannot be released twice.
//
// **Critical constraint: no pause from inside a paused section.** Calling
// `pause` from a search worker thread, or from inside a work item, would wait
// on the very worker pool the call stack has already stopped. Both are
// detected with thread-local flags and panic instead of deadlocking.
//
// With zero threads, requests only run when `process_pending` is called.
//
// See also: `pathfinding.rs` for the search itself, `coordinator.rs` which
// owns the pool, `work_item.rs` for the work-item flag.

use crate::graph_set::GraphSet;
use crate::pathfinding::{PathOutcome, find_path};
use crate::types::{GraphMask, PathRequestId, VoxelCoord};
use crate::work_item;
use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, trace};

thread_local! {
    static IN_SEARCH_WORKER: Cell<bool> = const { Cell::new(false) };
}

/// Callback invoked (on the thread calling `return_completed`) with the
/// outcome of a request.
pub type PathCallback = Box<dyn FnOnce(PathRequestId, PathOutcome) + Send>;

/// A path query: both endpoints are snapped to the nearest walkable node of
/// the graphs selected by `graph_mask`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PathRequest {
    pub start: VoxelCoord,
    pub goal: VoxelCoord,
    pub graph_mask: GraphMask,
}

impl PathRequest {
    pub fn new(start: VoxelCoord, goal: VoxelCoord) -> Self {
        Self {
            start,
            goal,
            graph_mask: GraphMask::ALL,
        }
    }

    pub fn with_mask(mut self, graph_mask: GraphMask) -> Self {
        self.graph_mask = graph_mask;
        self
    }
}

struct QueuedPath {
    id: PathRequestId,
    request: PathRequest,
    callback: PathCallback,
}

struct CompletedPath {
    id: PathRequestId,
    outcome: PathOutcome,
    callback: PathCallback,
}

#[derive(Default)]
struct PoolState {
    queue: VecDeque<QueuedPath>,
    completed: VecDeque<CompletedPath>,
    pause_count: usize,
    /// Requests currently being searched.
    busy: usize,
    shutdown: bool,
    searched: u64,
}

struct PoolShared {
    state: Mutex<PoolState>,
    /// Signalled when work arrives, a pause ends, or on shutdown.
    work_ready: Condvar,
    /// Signalled whenever a worker finishes a request.
    idle: Condvar,
    graphs: Arc<RwLock<GraphSet>>,
    next_id: AtomicU64,
}

impl PoolShared {
    fn finish(&self, job: QueuedPath, outcome: PathOutcome) {
        let mut state = self.state.lock();
        state.busy -= 1;
        state.searched += 1;
        state.completed.push_back(CompletedPath {
            id: job.id,
            outcome,
            callback: job.callback,
        });
        self.idle.notify_all();
    }

    fn search(&self, request: &PathRequest) -> PathOutcome {
        let graphs = self.graphs.read();
        find_path(&graphs, request.start, request.goal, request.graph_mask)
    }
}

/// Snapshot of the pool for observability.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SearchStats {
    pub queued: usize,
    pub in_progress: usize,
    pub awaiting_return: usize,
    pub pause_count: usize,
    /// Requests searched since the pool was created.
    pub searched: u64,
}

/// Owns the worker threads.
pub struct SearchPool {
    shared: Arc<PoolShared>,
    workers: Vec<JoinHandle<()>>,
}

impl SearchPool {
    pub fn new(graphs: Arc<RwLock<GraphSet>>, threads: usize) -> Self {
        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState::default()),
            work_ready: Condvar::new(),
            idle: Condvar::new(),
            graphs,
            next_id: AtomicU64::new(1),
        });
        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let worker_shared = Arc::clone(&shared);
            match thread::Builder::new()
                .name(format!("nav-search-{i}"))
                .spawn(move || worker_loop(&worker_shared))
            {
                Ok(handle) => workers.push(handle),
                Err(err) => error!(error = %err, worker = i, "nav.search.spawn_failed"),
            }
        }
        debug!(threads = workers.len(), "nav.search.started");
        Self { shared, workers }
    }

    pub fn handle(&self) -> SearchHandle {
        SearchHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn thread_count(&self) -> usize {
        self.workers.len()
    }

    pub fn pause(&self, immediate: bool) -> PauseLock {
        pause(&self.shared, immediate)
    }

    /// Hand every completed outcome to its callback on this thread. With
    /// `block_for_in_progress`, first wait for requests currently being
    /// searched (meant to be called while search is paused, so the wait is
    /// bounded). Returns the number of callbacks invoked.
    pub fn return_completed(&self, block_for_in_progress: bool) -> usize {
        self.return_up_to(block_for_in_progress, usize::MAX)
    }

    /// Like `return_completed(false)` but stops after `max` callbacks.
    pub fn return_completed_up_to(&self, max: usize) -> usize {
        self.return_up_to(false, max)
    }

    fn return_up_to(&self, block_for_in_progress: bool, max: usize) -> usize {
        let batch: Vec<CompletedPath> = {
            let mut state = self.shared.state.lock();
            if block_for_in_progress {
                while state.busy > 0 {
                    self.shared.idle.wait(&mut state);
                }
            }
            let n = state.completed.len().min(max);
            state.completed.drain(..n).collect()
        };
        let n = batch.len();
        for done in batch {
            (done.callback)(done.id, done.outcome);
        }
        if n > 0 {
            trace!(returned = n, "nav.search.returned");
        }
        n
    }

    /// Search queued requests on the calling thread until the queue is empty
    /// or a pause is requested. Returns the number searched.
    pub fn process_pending(&self) -> usize {
        let mut searched = 0;
        loop {
            let job = {
                let mut state = self.shared.state.lock();
                if state.pause_count > 0 {
                    break;
                }
                match state.queue.pop_front() {
                    Some(job) => {
                        state.busy += 1;
                        job
                    }
                    None => break,
                }
            };
            let outcome = self.shared.search(&job.request);
            self.shared.finish(job, outcome);
            searched += 1;
        }
        searched
    }

    /// True when nothing is queued and nothing is being searched.
    pub fn is_queue_drained(&self) -> bool {
        let state = self.shared.state.lock();
        state.queue.is_empty() && state.busy == 0
    }

    pub fn stats(&self) -> SearchStats {
        self.handle().stats()
    }

    /// Stop and join every worker. Queued requests are dropped unsearched;
    /// completed outcomes can still be returned.
    pub fn shutdown(&mut self) {
        {
            let mut state = self.shared.state.lock();
            if state.shutdown && self.workers.is_empty() {
                return;
            }
            state.shutdown = true;
            let dropped = state.queue.len();
            state.queue.clear();
            if dropped > 0 {
                debug!(dropped, "nav.search.dropped_queued");
            }
        }
        self.shared.work_ready.notify_all();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("nav.search.worker_panicked");
            }
        }
        debug!("nav.search.stopped");
    }
}

impl Drop for SearchPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &PoolShared) {
    IN_SEARCH_WORKER.with(|flag| flag.set(true));
    loop {
        let job = {
            let mut state = shared.state.lock();
            loop {
                if state.shutdown {
                    return;
                }
                if state.pause_count == 0 {
                    if let Some(job) = state.queue.pop_front() {
                        state.busy += 1;
                        break job;
                    }
                }
                shared.work_ready.wait(&mut state);
            }
        };
        let outcome = shared.search(&job.request);
        shared.finish(job, outcome);
    }
}

fn pause(shared: &Arc<PoolShared>, immediate: bool) -> PauseLock {
    assert!(
        !IN_SEARCH_WORKER.with(Cell::get),
        "search cannot be paused from a search worker thread"
    );
    assert!(
        !work_item::in_work_item(),
        "search cannot be paused from inside a work item"
    );
    let mut state = shared.state.lock();
    state.pause_count += 1;
    trace!(count = state.pause_count, immediate, "nav.search.pause");
    if immediate {
        while state.busy > 0 {
            shared.idle.wait(&mut state);
        }
    }
    PauseLock {
        shared: Arc::clone(shared),
    }
}

/// Cloneable, `Send` handle for submitting requests from any thread.
#[derive(Clone)]
pub struct SearchHandle {
    shared: Arc<PoolShared>,
}

impl SearchHandle {
    /// Queue a request. The callback runs when the coordinator next returns
    /// completed paths.
    pub fn submit(
        &self,
        request: PathRequest,
        callback: impl FnOnce(PathRequestId, PathOutcome) + Send + 'static,
    ) -> PathRequestId {
        let id = PathRequestId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        let mut state = self.shared.state.lock();
        state.queue.push_back(QueuedPath {
            id,
            request,
            callback: Box::new(callback),
        });
        self.shared.work_ready.notify_one();
        id
    }

    /// See `SearchPool::pause`.
    pub fn pause(&self, immediate: bool) -> PauseLock {
        pause(&self.shared, immediate)
    }

    pub fn stats(&self) -> SearchStats {
        let state = self.shared.state.lock();
        SearchStats {
            queued: state.queue.len(),
            in_progress: state.busy,
            awaiting_return: state.completed.len(),
            pause_count: state.pause_count,
            searched: state.searched,
        }
    }
}

/// Held while search is paused. Dropping it releases the pause.
#[must_use = "search resumes as soon as the pause lock is dropped"]
pub struct PauseLock {
    shared: Arc<PoolShared>,
}

impl PauseLock {
    /// True once no worker is searching.
    pub fn is_paused(&self) -> bool {
        self.shared.state.lock().busy == 0
    }

    /// Block until no worker is searching.
    pub fn wait_until_paused(&self) {
        let mut state = self.shared.state.lock();
        while state.busy > 0 {
            self.shared.idle.wait(&mut state);
        }
    }

    /// Release the pause. Workers resume if this was the last one.
    pub fn release(self) {}
}

impl Drop for PauseLock {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.pause_count -= 1;
        trace!(count = state.pause_count, "nav.search.release");
        if state.pause_count == 0 {
            self.shared.work_ready.notify_all();
        }
    }
}
