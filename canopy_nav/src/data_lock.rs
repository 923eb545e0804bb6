// Multi-reader/single-writer gate over raw graph memory.
//
// Graph memory lives in an `Arc<parking_lot::RwLock<GraphSet>>`. Search
// workers read it directly and are kept out of the way by the pause protocol
// (`search_pool.rs`); they never touch this gate. `GraphDataLock` is the
// separate gate for auxiliary background computations that want to read
// graph memory concurrently with each other but never while a mutation is
// committing. The coordinator takes the write side for every work-item
// batch and for the commit phase of every scan.
//
// The gate is writer-preferring: once a writer is waiting, new readers are
// refused until it has been granted and released, and the writer is granted
// only when the reader count is zero. Readers that were granted before the
// write request finish normally.
//
// Async variants (`read_async`/`write_async`) return a pending handle instead
// of blocking. A `PendingWrite` counts as a waiting writer from the moment it
// is created until it is acquired or dropped.
//
// **Critical constraint: no reentrancy.** Holding a guard on the thread that
// owns the `NavCoordinator` and then calling into the coordinator deadlocks,
// as with any non-reentrant lock.
//
// See also: `coordinator.rs` (`lock_graph_data_for_reading/_writing`),
// `scan.rs` for the commit phase.

use crate::graph_set::GraphSet;
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Condvar, Mutex, RawRwLock, RwLock};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tracing::trace;

#[derive(Default, Debug)]
struct LockState {
    readers: u32,
    writer: bool,
    writers_waiting: u32,
}

impl LockState {
    fn can_read(&self) -> bool {
        !self.writer && self.writers_waiting == 0
    }

    fn can_write(&self) -> bool {
        !self.writer && self.readers == 0
    }
}

#[derive(Default)]
struct Gate {
    state: Mutex<LockState>,
    changed: Condvar,
}

/// Snapshot of the gate state for observability.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockSnapshot {
    /// Number of granted readers.
    pub readers: u32,
    /// Whether the writer is granted.
    pub writer: bool,
    /// Writers (blocking or pending) waiting for the readers to leave.
    pub writers_waiting: u32,
}

/// Cloneable handle to graph memory and its gate.
#[derive(Clone)]
pub struct GraphDataLock {
    graphs: Arc<RwLock<GraphSet>>,
    gate: Arc<Gate>,
}

impl GraphDataLock {
    pub fn new(graphs: GraphSet) -> Self {
        Self {
            graphs: Arc::new(RwLock::new(graphs)),
            gate: Arc::new(Gate::default()),
        }
    }

    /// The raw graph memory, bypassing the gate. Used by search workers and
    /// by the coordinator's own read-only queries.
    pub(crate) fn graphs(&self) -> &Arc<RwLock<GraphSet>> {
        &self.graphs
    }

    /// Acquire the read side, blocking while a writer is active or waiting.
    pub fn read(&self) -> GraphReadGuard {
        let mut state = self.gate.state.lock();
        while !state.can_read() {
            self.gate.changed.wait(&mut state);
        }
        state.readers += 1;
        drop(state);
        self.read_granted()
    }

    /// Acquire the read side if that is possible right now.
    pub fn try_read(&self) -> Option<GraphReadGuard> {
        let mut state = self.gate.state.lock();
        if !state.can_read() {
            return None;
        }
        state.readers += 1;
        drop(state);
        Some(self.read_granted())
    }

    /// Acquire the write side, blocking until every granted reader has left.
    pub fn write(&self) -> GraphWriteGuard {
        let mut state = self.gate.state.lock();
        state.writers_waiting += 1;
        while !state.can_write() {
            self.gate.changed.wait(&mut state);
        }
        state.writers_waiting -= 1;
        state.writer = true;
        drop(state);
        self.write_granted()
    }

    /// Request the read side without blocking.
    pub fn read_async(&self) -> PendingRead {
        PendingRead { lock: self.clone() }
    }

    /// Request the write side without blocking. New readers are refused from
    /// this point on.
    pub fn write_async(&self) -> PendingWrite {
        self.gate.state.lock().writers_waiting += 1;
        trace!("nav.data_lock.write_requested");
        PendingWrite {
            lock: self.clone(),
            waiting: true,
        }
    }

    pub fn snapshot(&self) -> LockSnapshot {
        let state = self.gate.state.lock();
        LockSnapshot {
            readers: state.readers,
            writer: state.writer,
            writers_waiting: state.writers_waiting,
        }
    }

    fn read_granted(&self) -> GraphReadGuard {
        // Order matters: the ticket is registered before the inner lock is
        // taken, and released after it (field drop order).
        let ticket = GateTicket {
            gate: Arc::clone(&self.gate),
            write: false,
        };
        GraphReadGuard {
            inner: self.graphs.read_arc(),
            _ticket: ticket,
        }
    }

    fn write_granted(&self) -> GraphWriteGuard {
        let ticket = GateTicket {
            gate: Arc::clone(&self.gate),
            write: true,
        };
        GraphWriteGuard {
            inner: self.graphs.write_arc(),
            _ticket: ticket,
        }
    }
}

/// Releases one gate slot on drop.
struct GateTicket {
    gate: Arc<Gate>,
    write: bool,
}

impl Drop for GateTicket {
    fn drop(&mut self) {
        let mut state = self.gate.state.lock();
        if self.write {
            state.writer = false;
        } else {
            state.readers -= 1;
        }
        self.gate.changed.notify_all();
    }
}

/// Shared access to graph memory.
pub struct GraphReadGuard {
    inner: ArcRwLockReadGuard<RawRwLock, GraphSet>,
    _ticket: GateTicket,
}

impl Deref for GraphReadGuard {
    type Target = GraphSet;

    fn deref(&self) -> &GraphSet {
        &self.inner
    }
}

/// Exclusive access to graph memory.
pub struct GraphWriteGuard {
    inner: ArcRwLockWriteGuard<RawRwLock, GraphSet>,
    _ticket: GateTicket,
}

impl Deref for GraphWriteGuard {
    type Target = GraphSet;

    fn deref(&self) -> &GraphSet {
        &self.inner
    }
}

impl DerefMut for GraphWriteGuard {
    fn deref_mut(&mut self) -> &mut GraphSet {
        &mut self.inner
    }
}

/// Completion handle for an asynchronous read request.
pub struct PendingRead {
    lock: GraphDataLock,
}

impl PendingRead {
    /// Whether `try_acquire` would succeed right now.
    pub fn is_ready(&self) -> bool {
        self.lock.gate.state.lock().can_read()
    }

    pub fn try_acquire(&mut self) -> Option<GraphReadGuard> {
        self.lock.try_read()
    }

    /// Block until granted.
    pub fn wait(self) -> GraphReadGuard {
        self.lock.read()
    }
}

/// Completion handle for an asynchronous write request.
pub struct PendingWrite {
    lock: GraphDataLock,
    waiting: bool,
}

impl PendingWrite {
    pub fn is_ready(&self) -> bool {
        self.lock.gate.state.lock().can_write()
    }

    pub fn try_acquire(&mut self) -> Option<GraphWriteGuard> {
        let mut state = self.lock.gate.state.lock();
        if !self.waiting || !state.can_write() {
            return None;
        }
        state.writers_waiting -= 1;
        state.writer = true;
        self.waiting = false;
        drop(state);
        Some(self.lock.write_granted())
    }

    /// Block until granted.
    pub fn wait(mut self) -> GraphWriteGuard {
        loop {
            if let Some(guard) = self.try_acquire() {
                return guard;
            }
            let mut state = self.lock.gate.state.lock();
            if !state.can_write() {
                self.lock.gate.changed.wait(&mut state);
            }
        }
    }
}

impl Drop for PendingWrite {
    fn drop(&mut self) {
        if self.waiting {
            let mut state = self.lock.gate.state.lock();
            state.writers_waiting -= 1;
            self.lock.gate.changed.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generators::GridGraphSettings;
    use crate::graph_set::GraphKind;
    use crate::types::VoxelCoord;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn lock() -> GraphDataLock {
        GraphDataLock::new(GraphSet::new(4))
    }

    #[test]
    fn concurrent_readers_are_granted() {
        let lock = lock();
        let a = lock.read();
        let b = lock.read();
        assert_eq!(lock.snapshot().readers, 2);
        assert!(lock.try_read().is_some());
        drop((a, b));
        assert_eq!(lock.snapshot(), LockSnapshot::default());
    }

    #[test]
    fn writer_mutates_through_guard() {
        let lock = lock();
        {
            let mut graphs = lock.write();
            let kind = GraphKind::Grid(GridGraphSettings::new(VoxelCoord::new(0, 0, 0), 1, 1));
            graphs.add(kind, "g").unwrap();
            assert!(lock.snapshot().writer);
            assert!(lock.try_read().is_none());
        }
        assert_eq!(lock.read().len(), 1);
    }

    #[test]
    fn pending_write_refuses_new_readers() {
        let lock = lock();
        let reader = lock.read();
        let mut pending = lock.write_async();
        assert!(pending.try_acquire().is_none());
        assert!(lock.try_read().is_none());
        assert!(!lock.read_async().is_ready());

        drop(reader);
        let guard = pending.try_acquire().unwrap();
        assert!(lock.try_read().is_none());
        drop(guard);
        assert!(lock.try_read().is_some());
    }

    #[test]
    fn dropped_pending_write_unblocks_readers() {
        let lock = lock();
        let pending = lock.write_async();
        assert!(lock.try_read().is_none());
        drop(pending);
        assert!(lock.try_read().is_some());
    }

    #[test]
    fn pending_read_acquires_once_writer_leaves() {
        let lock = lock();
        let writer = lock.write();
        let mut pending = lock.read_async();
        assert!(pending.try_acquire().is_none());
        drop(writer);
        assert!(pending.is_ready());
        assert!(pending.try_acquire().is_some());
    }

    #[test]
    fn blocking_writer_waits_for_earlier_readers() {
        let lock = lock();
        let reader = lock.read();
        let (tx, rx) = mpsc::channel();
        let writer_lock = lock.clone();
        let handle = thread::spawn(move || {
            let _guard = writer_lock.write();
            tx.send(()).unwrap();
        });
        // The writer registers as waiting but cannot be granted yet.
        while lock.snapshot().writers_waiting == 0 {
            thread::yield_now();
        }
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        drop(reader);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        handle.join().unwrap();
        assert_eq!(lock.snapshot(), LockSnapshot::default());
    }

    #[test]
    fn pending_write_wait_blocks_until_readers_leave() {
        let lock = lock();
        let (tx, rx) = mpsc::channel();
        let reader_lock = lock.clone();
        let handle = thread::spawn(move || {
            let reader = reader_lock.read();
            tx.send(()).unwrap();
            thread::sleep(Duration::from_millis(20));
            drop(reader);
        });
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let pending = lock.write_async();
        let guard = pending.wait();
        assert!(lock.snapshot().writer);
        drop(guard);
        handle.join().unwrap();
    }
}
