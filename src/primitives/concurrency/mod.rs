#![forbid(unsafe_code)]
//! Worker registry, the checkpoint read/write lock and page-lock diagnostics.
//!
//! Per-worker state is keyed by [`WorkerId`] handed out by [`Workers`]; nothing
//! here depends on thread identity, so a worker context may move between threads.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use tracing::debug;

use crate::types::{FullPageId, Result, StrataError, WorkerId};

/// Registry of live workers.
#[derive(Default)]
pub struct Workers {
    next: AtomicU64,
    live: Mutex<HashMap<WorkerId, String>>,
}

impl Workers {
    /// Creates an empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a worker. The returned context deregisters it on drop.
    pub fn register(self: &Arc<Self>, name: impl Into<String>) -> WorkerContext {
        let id = WorkerId(self.next.fetch_add(1, Ordering::Relaxed) + 1);
        let name = name.into();
        debug!(worker = id.0, name = %name, "workers.register");
        self.live.lock().insert(id, name.clone());
        WorkerContext {
            id,
            name,
            registry: Arc::clone(self),
        }
    }

    /// Returns `(id, name)` for every live worker, ordered by id.
    pub fn live(&self) -> Vec<(WorkerId, String)> {
        let mut out: Vec<_> = self
            .live
            .lock()
            .iter()
            .map(|(id, name)| (*id, name.clone()))
            .collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }
}

/// Context object passed through every operation that takes locks.
pub struct WorkerContext {
    id: WorkerId,
    name: String,
    registry: Arc<Workers>,
}

impl WorkerContext {
    /// Worker id.
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Worker name given at registration.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerContext")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

impl Drop for WorkerContext {
    fn drop(&mut self) {
        self.registry.live.lock().remove(&self.id);
        debug!(worker = self.id.0, "workers.deregister");
    }
}

#[derive(Default, Debug)]
struct LockState {
    readers: usize,
    writer: bool,
    writers_waiting: usize,
    holds: HashMap<WorkerId, usize>,
}

/// Snapshot of lock state for observability.
#[derive(Default, Debug, Clone, Copy)]
pub struct LockSnapshot {
    /// Number of workers holding the read side.
    pub readers: usize,
    /// Whether the write side is held.
    pub writer: bool,
    /// Number of writers queued.
    pub writers_waiting: usize,
}

/// Shared/exclusive lock separating structural mutation (read side) from the
/// checkpoint's dirty-set snapshot (write side).
///
/// The read side is reentrant per worker: nested acquisitions only bump a depth
/// counter and never wait, even when a writer is queued. New readers wait while a
/// writer is queued so the snapshot phase cannot starve.
#[derive(Default)]
pub struct CheckpointLock {
    state: Mutex<LockState>,
    cond: Condvar,
}

impl CheckpointLock {
    /// Creates an unlocked instance.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Acquires the read side for `worker`, blocking during a write phase.
    pub fn read(self: &Arc<Self>, worker: &WorkerContext) -> CheckpointReadGuard {
        let mut state = self.state.lock();
        self.acquire_read_locked(&mut state, worker.id(), None);
        self.read_guard(worker.id())
    }

    /// Like [`CheckpointLock::read`] but gives up after `timeout`.
    pub fn try_read_for(
        self: &Arc<Self>,
        worker: &WorkerContext,
        timeout: Duration,
    ) -> Option<CheckpointReadGuard> {
        let mut state = self.state.lock();
        let deadline = Instant::now() + timeout;
        if self.acquire_read_locked(&mut state, worker.id(), Some(deadline)) {
            Some(self.read_guard(worker.id()))
        } else {
            None
        }
    }

    fn read_guard(self: &Arc<Self>, worker: WorkerId) -> CheckpointReadGuard {
        CheckpointReadGuard {
            lock: Arc::clone(self),
            worker,
            acquired_at: Instant::now(),
        }
    }

    fn acquire_read_locked(
        &self,
        state: &mut parking_lot::MutexGuard<'_, LockState>,
        worker: WorkerId,
        deadline: Option<Instant>,
    ) -> bool {
        if let Some(depth) = state.holds.get_mut(&worker) {
            *depth += 1;
            return true;
        }
        while state.writer || state.writers_waiting > 0 {
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(state, deadline).timed_out()
                        && (state.writer || state.writers_waiting > 0)
                    {
                        return false;
                    }
                }
                None => self.cond.wait(state),
            }
        }
        state.readers += 1;
        state.holds.insert(worker, 1);
        true
    }

    fn release_read(&self, worker: WorkerId) {
        let mut state = self.state.lock();
        let depth = state
            .holds
            .get_mut(&worker)
            .map(|depth| {
                *depth -= 1;
                *depth
            })
            .unwrap_or_else(|| panic!("worker {worker} releases a checkpoint read lock it does not hold"));
        if depth == 0 {
            state.holds.remove(&worker);
            state.readers -= 1;
            if state.readers == 0 {
                self.cond.notify_all();
            }
        }
    }

    /// Acquires the write side, waiting for every reader to leave.
    pub fn write(self: &Arc<Self>) -> CheckpointWriteGuard {
        let mut state = self.state.lock();
        state.writers_waiting += 1;
        while state.writer || state.readers > 0 {
            self.cond.wait(&mut state);
        }
        state.writers_waiting -= 1;
        state.writer = true;
        CheckpointWriteGuard {
            lock: Arc::clone(self),
        }
    }

    /// Returns the reentrancy depth `worker` currently holds.
    pub fn hold_count(&self, worker: WorkerId) -> usize {
        self.state.lock().holds.get(&worker).copied().unwrap_or(0)
    }

    /// Returns true when `worker` holds the read side.
    pub fn is_held_by(&self, worker: WorkerId) -> bool {
        self.hold_count(worker) > 0
    }

    /// Captures the current lock state.
    pub fn snapshot(&self) -> LockSnapshot {
        let state = self.state.lock();
        LockSnapshot {
            readers: state.readers,
            writer: state.writer,
            writers_waiting: state.writers_waiting,
        }
    }
}

/// Held read side of the checkpoint lock. Released on drop.
///
/// Page access through the buffer manager requires a guard, which makes it
/// impossible to touch tree pages outside a checkpoint read lock.
pub struct CheckpointReadGuard {
    lock: Arc<CheckpointLock>,
    worker: WorkerId,
    acquired_at: Instant,
}

impl CheckpointReadGuard {
    /// Worker owning this guard.
    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    /// Time since this guard last (re)acquired the lock.
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    /// Releases and reacquires the lock so a pending checkpoint can run.
    ///
    /// Only the outermost hold can let a checkpoint through; for nested holds this
    /// is a no-op and returns false.
    pub fn relock(&mut self) -> bool {
        {
            let state = self.lock.state.lock();
            if state.holds.get(&self.worker).copied().unwrap_or(0) != 1 {
                return false;
            }
        }
        self.lock.release_read(self.worker);
        let mut state = self.lock.state.lock();
        self.lock
            .acquire_read_locked(&mut state, self.worker, None);
        drop(state);
        self.acquired_at = Instant::now();
        true
    }
}

impl fmt::Debug for CheckpointReadGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckpointReadGuard")
            .field("worker", &self.worker)
            .finish()
    }
}

impl Drop for CheckpointReadGuard {
    fn drop(&mut self) {
        self.lock.release_read(self.worker);
    }
}

/// Held write side of the checkpoint lock.
pub struct CheckpointWriteGuard {
    lock: Arc<CheckpointLock>,
}

impl Drop for CheckpointWriteGuard {
    fn drop(&mut self) {
        let mut state = self.lock.state.lock();
        state.writer = false;
        self.lock.cond.notify_all();
    }
}

/// Cooperative cancellation flag shared between a long-running operation and its owner.
#[derive(Clone, Default, Debug)]
pub struct CancellationToken {
    cancelled: Arc<std::sync::atomic::AtomicBool>,
}

impl CancellationToken {
    /// Creates a token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation; takes effect at the next checked boundary.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Returns true once [`CancellationToken::cancel`] was called.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Fails with [`StrataError::Cancelled`] after cancellation.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(StrataError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Latch mode of a page access.
#[derive(Copy, Clone, Debug, Eq, PartialEq, serde::Serialize)]
pub enum LatchMode {
    /// Shared latch.
    Shared,
    /// Exclusive latch.
    Exclusive,
}

type HeldPages = SmallVec<[(FullPageId, LatchMode); 8]>;

/// Registry of page latches held by each worker, for diagnostics.
#[derive(Default)]
pub struct PageLockTracker {
    held: Mutex<HashMap<WorkerId, HeldPages>>,
}

impl PageLockTracker {
    /// Creates an empty tracker.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Records a latch acquisition.
    pub fn on_lock(&self, worker: WorkerId, page: FullPageId, mode: LatchMode) {
        self.held.lock().entry(worker).or_default().push((page, mode));
    }

    /// Records a latch release.
    pub fn on_unlock(&self, worker: WorkerId, page: FullPageId) {
        let mut held = self.held.lock();
        if let Some(pages) = held.get_mut(&worker) {
            if let Some(pos) = pages.iter().rposition(|(id, _)| *id == page) {
                pages.remove(pos);
            }
            if pages.is_empty() {
                held.remove(&worker);
            }
        }
    }

    /// Pages currently latched by `worker`, oldest first.
    pub fn held_by(&self, worker: WorkerId) -> Vec<(FullPageId, LatchMode)> {
        self.held
            .lock()
            .get(&worker)
            .map(|pages| pages.to_vec())
            .unwrap_or_default()
    }

    /// Full dump of held latches, ordered by worker id.
    pub fn dump(&self) -> Vec<(WorkerId, Vec<(FullPageId, LatchMode)>)> {
        let mut out: Vec<_> = self
            .held
            .lock()
            .iter()
            .map(|(worker, pages)| (*worker, pages.to_vec()))
            .collect();
        out.sort_by_key(|(worker, _)| *worker);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GroupId, PageIdx, PartitionId};
    use std::sync::mpsc;
    use std::thread;

    #[test]
    fn workers_deregister_on_drop() {
        let workers = Workers::new();
        let a = workers.register("a");
        let b = workers.register("b");
        assert_ne!(a.id(), b.id());
        assert_eq!(workers.live().len(), 2);
        drop(a);
        assert_eq!(workers.live(), vec![(b.id(), "b".to_string())]);
    }

    #[test]
    fn read_lock_is_reentrant_per_worker() {
        let workers = Workers::new();
        let worker = workers.register("w");
        let lock = CheckpointLock::new();
        let outer = lock.read(&worker);
        let inner = lock.read(&worker);
        assert_eq!(lock.hold_count(worker.id()), 2);
        assert_eq!(lock.snapshot().readers, 1);
        drop(inner);
        assert!(lock.is_held_by(worker.id()));
        drop(outer);
        assert!(!lock.is_held_by(worker.id()));
        assert_eq!(lock.snapshot().readers, 0);
    }

    #[test]
    fn nested_read_does_not_wait_for_queued_writer() {
        let workers = Workers::new();
        let worker = workers.register("w");
        let lock = CheckpointLock::new();
        let outer = lock.read(&worker);

        let writer_lock = Arc::clone(&lock);
        let (tx, rx) = mpsc::channel();
        let writer = thread::spawn(move || {
            let _guard = writer_lock.write();
            tx.send(()).unwrap();
        });
        while lock.snapshot().writers_waiting == 0 {
            thread::yield_now();
        }
        let nested = lock.read(&worker);
        assert!(rx.try_recv().is_err(), "writer must wait for the reader");
        drop(nested);
        drop(outer);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        writer.join().unwrap();
    }

    #[test]
    fn try_read_times_out_during_write_phase() {
        let workers = Workers::new();
        let worker = workers.register("w");
        let lock = CheckpointLock::new();
        let write = lock.write();
        assert!(lock
            .try_read_for(&worker, Duration::from_millis(20))
            .is_none());
        drop(write);
        assert!(lock
            .try_read_for(&worker, Duration::from_millis(20))
            .is_some());
    }

    #[test]
    fn relock_lets_writer_through() {
        let workers = Workers::new();
        let worker = workers.register("visitor");
        let lock = CheckpointLock::new();
        let mut guard = lock.read(&worker);

        let writer_lock = Arc::clone(&lock);
        let writer = thread::spawn(move || {
            let _guard = writer_lock.write();
        });
        while lock.snapshot().writers_waiting == 0 {
            thread::yield_now();
        }
        assert!(guard.relock());
        writer.join().unwrap();
        assert_eq!(lock.hold_count(worker.id()), 1);
    }

    #[test]
    fn tracker_records_latches_per_worker() {
        let tracker = PageLockTracker::new();
        let page = FullPageId::new(GroupId(1), PartitionId(0), PageIdx(5));
        tracker.on_lock(WorkerId(1), page, LatchMode::Exclusive);
        tracker.on_lock(WorkerId(2), page, LatchMode::Shared);
        assert_eq!(tracker.held_by(WorkerId(1)), vec![(page, LatchMode::Exclusive)]);
        tracker.on_unlock(WorkerId(1), page);
        let dump = tracker.dump();
        assert_eq!(dump.len(), 1);
        assert_eq!(dump[0].0, WorkerId(2));
    }
}
