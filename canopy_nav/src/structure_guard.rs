// Nestable guard over structural graph changes.
//
// Adding or removing a graph while a scan or a work-item batch is in flight
// would invalidate node references the in-flight operation is holding. The
// guard is a stack of `allow_adding_only` flags: every scan and every batch
// pushes an entry for as long as it runs, and every structural entry point
// asks `assert_mutable` before acting.
//
// A structural change is permitted iff the stack is empty, or the change only
// adds a graph and every entry on the stack allows adding. Work-item batches
// push `true` so off-mesh link resolution can create the link graph
// mid-batch; scans push `false`.
//
// Entries are pushed by `enter()` and removed when the returned token drops.
// Tokens may be held across calls (a cooperative scan keeps its token for
// several frames), so the stack is shared behind an `Arc`.
//
// See also: `work_item.rs` and `scan.rs` which enter the guard,
// `coordinator.rs` whose structural entry points check it.

use crate::error::{NavError, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::trace;

#[derive(Debug, Default)]
struct GuardStack {
    entries: Vec<(u64, bool)>,
    next_id: u64,
}

/// Shared handle to the guard stack.
#[derive(Clone, Debug, Default)]
pub struct StructureGuard {
    stack: Arc<Mutex<GuardStack>>,
}

/// Scoped entry on the guard stack. Dropping it removes the entry.
#[must_use = "the guard entry is removed as soon as the token is dropped"]
#[derive(Debug)]
pub struct StructureGuardToken {
    stack: Arc<Mutex<GuardStack>>,
    id: u64,
}

impl StructureGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push an entry. Structural changes are restricted until the token drops.
    pub fn enter(&self, allow_adding_only: bool) -> StructureGuardToken {
        let mut stack = self.stack.lock();
        let id = stack.next_id;
        stack.next_id += 1;
        stack.entries.push((id, allow_adding_only));
        trace!(depth = stack.entries.len(), allow_adding_only, "nav.guard.enter");
        StructureGuardToken {
            stack: Arc::clone(&self.stack),
            id,
        }
    }

    /// Whether a structural change is currently permitted.
    pub fn is_mutable(&self, is_add_only: bool) -> bool {
        let stack = self.stack.lock();
        stack.entries.is_empty() || (is_add_only && stack.entries.iter().all(|&(_, allow)| allow))
    }

    /// Fail with `NavError::StructureLocked` unless a structural change is
    /// permitted. `operation` names the change for the error message.
    pub fn assert_mutable(&self, is_add_only: bool, operation: &'static str) -> Result<()> {
        if self.is_mutable(is_add_only) {
            Ok(())
        } else {
            Err(NavError::StructureLocked { operation })
        }
    }

    pub fn depth(&self) -> usize {
        self.stack.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.depth() == 0
    }

    /// The `allow_adding_only` flags currently on the stack, bottom first.
    pub fn snapshot(&self) -> Vec<bool> {
        self.stack.lock().entries.iter().map(|&(_, allow)| allow).collect()
    }
}

impl Drop for StructureGuardToken {
    fn drop(&mut self) {
        let mut stack = self.stack.lock();
        if let Some(pos) = stack.entries.iter().rposition(|&(id, _)| id == self.id) {
            stack.entries.remove(pos);
        }
        trace!(depth = stack.entries.len(), "nav.guard.exit");
    }
}
