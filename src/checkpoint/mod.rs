//! Checkpointer: flushes dirty pages to their stores under a short write phase.
//!
//! A checkpoint captures every region's dirty set under the checkpoint write
//! lock, logs page images of WAL-logged regions, writes the pages with a pool
//! of scoped threads and finally persists the checkpoint cookie. Mutators only
//! wait during the capture. Once the cookie is stored, WAL segments wholly
//! before the checkpoint's begin record are deleted.

pub mod measurement;
mod restore;
pub mod throttle;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::primitives::concurrency::{CheckpointLock, CheckpointReadGuard, WorkerContext};
use crate::primitives::pager::PageMemory;
use crate::primitives::wal::{Wal, WalRecord};
use crate::types::{clone_error, FullPageId, Result, StrataError, WalPointer};

pub use measurement::IntervalMeasurement;
pub use restore::{restore_pages, CheckpointCookie, RestoreOutcome};
pub use throttle::{SpeedBasedThrottle, ThrottleStats, WriteProgress};

/// Progress of a requested checkpoint.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize)]
pub enum CheckpointState {
    /// Queued for the checkpointer thread.
    Scheduled,
    /// Dirty sets captured; mutators run again.
    Started,
    /// Every captured page reached its store.
    Finished,
}

/// Description of one checkpoint. Fields fill in as the checkpoint advances.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct CheckpointInfo {
    pub id: u64,
    pub reason: String,
    pub pages: u64,
    pub begin: WalPointer,
}

struct ProgressState {
    reached: CheckpointState,
    info: CheckpointInfo,
    error: Option<StrataError>,
}

struct ProgressShared {
    state: Mutex<ProgressState>,
    cond: Condvar,
}

/// Handle returned by [`Checkpointer::force_checkpoint`].
#[derive(Clone)]
pub struct CheckpointProgress {
    shared: Arc<ProgressShared>,
}

impl CheckpointProgress {
    fn new(reason: &str) -> Self {
        Self {
            shared: Arc::new(ProgressShared {
                state: Mutex::new(ProgressState {
                    reached: CheckpointState::Scheduled,
                    info: CheckpointInfo {
                        reason: reason.to_string(),
                        ..CheckpointInfo::default()
                    },
                    error: None,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    fn advance(&self, reached: CheckpointState, info: &CheckpointInfo) {
        let mut state = self.shared.state.lock();
        state.reached = reached;
        state.info = CheckpointInfo {
            reason: state.info.reason.clone(),
            ..info.clone()
        };
        self.shared.cond.notify_all();
    }

    fn fail(&self, err: StrataError) {
        let mut state = self.shared.state.lock();
        state.error = Some(err);
        self.shared.cond.notify_all();
    }

    /// State reached so far.
    pub fn state(&self) -> CheckpointState {
        self.shared.state.lock().reached
    }

    /// Blocks until `state` is reached or the checkpoint fails.
    ///
    /// Must not be called while holding a checkpoint read lock.
    pub fn wait(&self, state: CheckpointState) -> Result<CheckpointInfo> {
        let mut guard = self.shared.state.lock();
        loop {
            if let Some(err) = &guard.error {
                return Err(clone_error(err));
            }
            if guard.reached >= state {
                return Ok(guard.info.clone());
            }
            self.shared.cond.wait(&mut guard);
        }
    }

    /// Like [`CheckpointProgress::wait`], returning `None` on timeout.
    pub fn wait_timeout(&self, state: CheckpointState, timeout: Duration) -> Result<Option<CheckpointInfo>> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.shared.state.lock();
        loop {
            if let Some(err) = &guard.error {
                return Err(clone_error(err));
            }
            if guard.reached >= state {
                return Ok(Some(guard.info.clone()));
            }
            if self.shared.cond.wait_until(&mut guard, deadline).timed_out() {
                return Ok(None);
            }
        }
    }
}

/// Checkpointer settings.
#[derive(Clone, Debug)]
pub struct CheckpointerConfig {
    /// Time between timer-driven checkpoints.
    pub frequency: Duration,
    /// Threads writing pages.
    pub threads: usize,
    /// Page images held in memory at once by the write phase.
    pub write_batch: usize,
    /// Where the cookie of the last finished checkpoint lives.
    pub cookie_path: PathBuf,
}

struct Region {
    memory: Arc<PageMemory>,
    throttle: Option<Arc<SpeedBasedThrottle>>,
}

#[derive(Default)]
struct Control {
    pending: Vec<(String, CheckpointProgress)>,
    stop: bool,
}

struct Shared {
    config: CheckpointerConfig,
    lock: Arc<CheckpointLock>,
    wal: Arc<Wal>,
    regions: RwLock<Vec<Region>>,
    progress: Arc<WriteProgress>,
    control: Mutex<Control>,
    wakeup: Condvar,
    subscribers: Mutex<Vec<mpsc::Sender<CheckpointInfo>>>,
    next_id: AtomicU64,
    last: Mutex<Option<CheckpointInfo>>,
}

/// Owner of the checkpoint lock and the `strata-checkpointer` thread.
pub struct Checkpointer {
    shared: Arc<Shared>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Checkpointer {
    /// Spawns the checkpointer thread. `last_id` is the id of the newest
    /// checkpoint found on disk.
    pub fn start(config: CheckpointerConfig, lock: Arc<CheckpointLock>, wal: Arc<Wal>, last_id: u64) -> Result<Self> {
        let shared = Arc::new(Shared {
            config,
            lock,
            wal,
            regions: RwLock::new(Vec::new()),
            progress: WriteProgress::new(),
            control: Mutex::new(Control::default()),
            wakeup: Condvar::new(),
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(last_id + 1),
            last: Mutex::new(None),
        });
        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("strata-checkpointer".into())
            .spawn(move || worker.run_loop())?;
        info!(
            frequency_ms = shared.config.frequency.as_millis() as u64,
            threads = shared.config.threads,
            "checkpoint.start"
        );
        Ok(Self {
            shared,
            thread: Mutex::new(Some(handle)),
        })
    }

    /// The checkpoint read/write lock.
    pub fn lock(&self) -> &Arc<CheckpointLock> {
        &self.shared.lock
    }

    /// Write progress shared with region throttles.
    pub fn write_progress(&self) -> Arc<WriteProgress> {
        Arc::clone(&self.shared.progress)
    }

    /// Adds a region to every following checkpoint.
    ///
    /// Waits for a running checkpoint; must not be called under a checkpoint read lock.
    pub fn add_region(&self, memory: Arc<PageMemory>, throttle: Option<Arc<SpeedBasedThrottle>>) {
        debug!(region = %memory.config().name, "checkpoint.region.add");
        self.shared.regions.write().push(Region { memory, throttle });
    }

    /// Removes a region by name; returns false when it was not registered.
    pub fn remove_region(&self, name: &str) -> bool {
        let mut regions = self.shared.regions.write();
        let before = regions.len();
        regions.retain(|r| r.memory.config().name != name);
        before != regions.len()
    }

    /// Reentrant per-worker read lock; blocks during a checkpoint's write phase.
    pub fn checkpoint_read_lock(&self, worker: &WorkerContext) -> CheckpointReadGuard {
        self.shared.lock.read(worker)
    }

    /// Like [`Checkpointer::checkpoint_read_lock`] but gives up after `timeout`.
    pub fn try_checkpoint_read_lock(&self, worker: &WorkerContext, timeout: Duration) -> Option<CheckpointReadGuard> {
        self.shared.lock.try_read_for(worker, timeout)
    }

    /// Requests a checkpoint. Requests made while one is queued share it.
    pub fn force_checkpoint(&self, reason: &str) -> CheckpointProgress {
        let progress = CheckpointProgress::new(reason);
        let mut control = self.shared.control.lock();
        if control.stop {
            progress.fail(StrataError::NodeStopped);
            return progress;
        }
        control.pending.push((reason.to_string(), progress.clone()));
        self.shared.wakeup.notify_all();
        debug!(reason, "checkpoint.force");
        progress
    }

    /// Completion channel receiving every finished checkpoint.
    pub fn subscribe(&self) -> mpsc::Receiver<CheckpointInfo> {
        let (tx, rx) = mpsc::channel();
        self.shared.subscribers.lock().push(tx);
        rx
    }

    /// Last finished checkpoint.
    pub fn last_checkpoint(&self) -> Option<CheckpointInfo> {
        self.shared.last.lock().clone()
    }

    /// Stops the thread; queued requests fail with [`StrataError::NodeStopped`].
    pub fn stop(&self) {
        {
            let mut control = self.shared.control.lock();
            control.stop = true;
            self.shared.wakeup.notify_all();
        }
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                error!("checkpoint.thread.panicked");
            }
        }
    }
}

impl Drop for Checkpointer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn run_loop(self: Arc<Self>) {
        let mut last_run = Instant::now();
        loop {
            let batch = {
                let mut control = self.control.lock();
                let deadline = last_run + self.config.frequency;
                while control.pending.is_empty() && !control.stop {
                    if self.wakeup.wait_until(&mut control, deadline).timed_out() {
                        break;
                    }
                }
                if control.stop {
                    for (_, progress) in control.pending.drain(..) {
                        progress.fail(StrataError::NodeStopped);
                    }
                    break;
                }
                std::mem::take(&mut control.pending)
            };
            let reason = if batch.is_empty() {
                "timer".to_string()
            } else {
                let mut reasons: Vec<&str> = batch.iter().map(|(r, _)| r.as_str()).collect();
                reasons.dedup();
                reasons.join(",")
            };
            let handles: Vec<CheckpointProgress> = batch.into_iter().map(|(_, p)| p).collect();
            if let Err(err) = self.checkpoint(&reason, &handles) {
                error!(reason = %reason, error = %err, "checkpoint.failed");
                for progress in &handles {
                    progress.fail(clone_error(&err));
                }
            }
            last_run = Instant::now();
        }
        debug!("checkpoint.thread.exit");
    }

    fn checkpoint(&self, reason: &str, handles: &[CheckpointProgress]) -> Result<CheckpointInfo> {
        let regions = self.regions.read();
        let started = Instant::now();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let (begin, plan) = {
            let _write = self.lock.write();
            let begin = self.wal.append_checkpoint_begin(id)?;
            let mut plan = Vec::with_capacity(regions.len());
            for region in regions.iter() {
                if let Some(throttle) = &region.throttle {
                    throttle.on_begin_checkpoint();
                }
                plan.push(region.memory.begin_checkpoint());
            }
            let total: usize = plan.iter().map(Vec::len).sum();
            self.progress.begin(total as u64);
            (begin, plan)
        };
        let total: u64 = plan.iter().map(|p| p.len() as u64).sum();
        let mut info = CheckpointInfo {
            id,
            reason: reason.to_string(),
            pages: total,
            begin,
        };
        for progress in handles {
            progress.advance(CheckpointState::Started, &info);
        }
        info!(id, reason, pages = total, begin = begin.0, "checkpoint.begin");

        let result = self.write_pages(id, begin, &regions, &plan);
        self.progress.finish();
        match result {
            Ok(written) => {
                for region in regions.iter() {
                    region.memory.finish_checkpoint();
                    if let Some(throttle) = &region.throttle {
                        throttle.on_finish_checkpoint();
                    }
                }
                info.pages = written;
            }
            Err(err) => {
                for region in regions.iter() {
                    region.memory.abort_checkpoint();
                    if let Some(throttle) = &region.throttle {
                        throttle.on_finish_checkpoint();
                    }
                }
                return Err(StrataError::CheckpointFailed(err.to_string()));
            }
        }

        match self.wal.truncate_before(begin) {
            Ok(removed) => debug!(id, removed, wal_bytes = self.wal.len(), "checkpoint.wal.truncated"),
            Err(err) => warn!(id, error = %err, "checkpoint.wal.truncate_failed"),
        }
        *self.last.lock() = Some(info.clone());
        for progress in handles {
            progress.advance(CheckpointState::Finished, &info);
        }
        self.subscribers
            .lock()
            .retain(|tx| tx.send(info.clone()).is_ok());
        info!(
            id,
            pages = info.pages,
            duration_ms = started.elapsed().as_millis() as u64,
            "checkpoint.finished"
        );
        Ok(info)
    }

    /// Logs and writes the captured pages, holding at most `write_batch`
    /// images at a time. Images of WAL-logged regions are appended as they are
    /// copied and read back from the log once it is synced, so that no store
    /// page changes before every image of the checkpoint is durable.
    fn write_pages(&self, id: u64, begin: WalPointer, regions: &[Region], plan: &[Vec<FullPageId>]) -> Result<u64> {
        let batch = self.config.write_batch.max(1);
        let mut pending: Vec<(usize, FullPageId, Box<[u8]>)> = Vec::with_capacity(batch);
        let mut written = 0;
        let mut logged_regions = Vec::new();
        let mut first_logged = None;
        for (idx, (region, pages)) in regions.iter().zip(plan).enumerate() {
            let wal_logged = region.memory.config().wal_logged;
            for page in pages {
                let Some(image) = region.memory.checkpoint_copy(*page)? else {
                    continue;
                };
                if wal_logged {
                    let pointer = self.wal.append(&WalRecord::PageSnapshot {
                        page: *page,
                        bytes: image.into_vec(),
                    })?;
                    first_logged.get_or_insert(pointer);
                    logged_regions.push(idx);
                    continue;
                }
                pending.push((idx, *page, image));
                if pending.len() >= batch {
                    written += self.write_batch(regions, &mut pending)?;
                }
            }
        }
        written += self.write_batch(regions, &mut pending)?;
        let logged = logged_regions.len() as u64;
        self.wal
            .append(&WalRecord::CheckpointPagesLogged { id, pages: logged })?;
        self.wal.sync()?;
        debug!(id, logged, "checkpoint.pages_logged");

        if let Some(from) = first_logged {
            let mut owners = logged_regions.into_iter();
            for item in self.wal.replay(Some(from))? {
                match item?.1 {
                    WalRecord::PageSnapshot { page, bytes } => {
                        let Some(idx) = owners.next() else {
                            break;
                        };
                        pending.push((idx, page, bytes.into_boxed_slice()));
                        if pending.len() >= batch {
                            written += self.write_batch(regions, &mut pending)?;
                        }
                    }
                    WalRecord::CheckpointPagesLogged { id: done, .. } if done == id => break,
                    _ => {}
                }
            }
            written += self.write_batch(regions, &mut pending)?;
            if owners.next().is_some() {
                return Err(StrataError::CheckpointFailed(format!(
                    "page images of checkpoint {id} are missing from the log"
                )));
            }
        }
        for region in regions {
            region.memory.sync_stores()?;
        }

        self.wal.append(&WalRecord::CheckpointEnd { id })?;
        self.wal.sync()?;
        CheckpointCookie { id, begin }.store(&self.config.cookie_path)?;
        Ok(written)
    }

    /// Writes `pending` with the page writer threads and empties it.
    fn write_batch(&self, regions: &[Region], pending: &mut Vec<(usize, FullPageId, Box<[u8]>)>) -> Result<u64> {
        if pending.is_empty() {
            return Ok(0);
        }
        let threads = self.config.threads.max(1).min(pending.len());
        let chunk = pending.len().div_ceil(threads);
        let results: Vec<Result<u64>> = thread::scope(|scope| {
            let workers: Vec<_> = pending
                .chunks_mut(chunk)
                .map(|part| scope.spawn(move || self.write_chunk(regions, part)))
                .collect();
            workers
                .into_iter()
                .map(|w| w.join().unwrap_or_else(|_| Err(StrataError::CheckpointFailed("page writer panicked".into()))))
                .collect()
        });
        pending.clear();
        let mut written = 0;
        for result in results {
            written += result?;
        }
        Ok(written)
    }

    fn write_chunk(&self, regions: &[Region], part: &mut [(usize, FullPageId, Box<[u8]>)]) -> Result<u64> {
        let mut written = 0;
        for (idx, page, image) in part.iter_mut() {
            let memory = &regions[*idx].memory;
            let Some(store) = memory.registered_store(page.group, page.partition) else {
                debug!(page = %page, "checkpoint.page.store_gone");
                continue;
            };
            store.write_page(page.index, image)?;
            self.progress.page_written();
            written += 1;
        }
        Ok(written)
    }
}
