#![forbid(unsafe_code)]

//! The storage engine: one data directory, one WAL, one default region and
//! the cache groups of a [`Schema`].
//!
//! Opening a directory finishes interrupted defragmentations, restores the
//! page images of the newest logged checkpoint, runs transaction recovery
//! and replays the logical records written after that checkpoint began.

mod schema;

use std::collections::BTreeMap;
use std::fs;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::checkpoint::{
    restore_pages, CheckpointCookie, CheckpointInfo, CheckpointProgress, CheckpointState, Checkpointer,
    CheckpointerConfig, SpeedBasedThrottle, ThrottleStats,
};
use crate::config::StorageConfig;
use crate::defrag::{files, DefragReport, DefragSettings, DefragSource, DefragmentationManager};
use crate::primitives::concurrency::{
    CancellationToken, CheckpointLock, CheckpointReadGuard, PageLockTracker, WorkerContext, Workers,
};
use crate::primitives::io;
use crate::primitives::pager::{MemoryStats, PageMemory, PageStore, PartitionMeta, RegionConfig};
use crate::primitives::wal::{DataOp, DataRecord, IndexUpdate, TxRecord, Wal, WalRecord, WalStats};
use crate::recovery::{
    ConflictPolicy, FailureHandler, Membership, RecoveryContext, RecoveryCoordinator, RecoveryMessage, Standalone,
    Transport, TxWalState,
};
use crate::storage::btree::{VisitOptions, VisitSummary};
use crate::storage::{IndexDef, IndexStore, PartitionStats, PartitionStore, PartitionWrite, Row};
use crate::types::{GroupId, Link, NodeId, PartitionId, Result, StrataError, WalPointer};

pub use schema::{GroupSchema, IndexKeyExtractor, IndexSchema, RowOperation, RowScope, Schema};

const WAL_DIR: &str = "wal";
const COOKIE_FILE: &str = "checkpoint.cookie";
const DEFAULT_REGION: &str = "default";
const EXPIRE_BATCH: usize = 256;

/// WAL segment directory of a data directory.
pub fn wal_dir(dir: &Path) -> PathBuf {
    dir.join(WAL_DIR)
}

/// Checkpoint cookie of a data directory.
pub fn cookie_path(dir: &Path) -> PathBuf {
    dir.join(COOKIE_FILE)
}

/// Peers and policy for transaction recovery.
///
/// The coordinator exists before the engine does, so the caller can route
/// peers' messages to it while [`Engine::open_with_recovery`] waits.
pub struct RecoveryOptions {
    coordinator: Arc<RecoveryCoordinator>,
    stopped: Arc<AtomicBool>,
    timeout: Duration,
}

impl RecoveryOptions {
    pub fn new(
        local: NodeId,
        transport: Arc<dyn Transport>,
        membership: Arc<dyn Membership>,
        policy: ConflictPolicy,
    ) -> Self {
        Self::with_failure_handler(local, transport, membership, policy, None)
    }

    /// Like [`RecoveryOptions::new`], also notifying `handler` when the node stops.
    pub fn with_failure_handler(
        local: NodeId,
        transport: Arc<dyn Transport>,
        membership: Arc<dyn Membership>,
        policy: ConflictPolicy,
        handler: Option<Arc<dyn FailureHandler>>,
    ) -> Self {
        let stopped = Arc::new(AtomicBool::new(false));
        let failure = Arc::new(StopNode {
            stopped: Arc::clone(&stopped),
            next: handler,
        });
        Self {
            coordinator: Arc::new(RecoveryCoordinator::new(local, transport, membership, failure, policy)),
            stopped,
            timeout: Duration::from_secs(60),
        }
    }

    /// Node without peers.
    pub fn standalone() -> Self {
        Self::new(NodeId(0), Arc::new(Standalone), Arc::new(Standalone), ConflictPolicy::default())
    }

    /// Longest wait for peers' answers before the open fails.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Entry point for messages arriving while the engine opens.
    pub fn coordinator(&self) -> Arc<RecoveryCoordinator> {
        Arc::clone(&self.coordinator)
    }
}

struct StopNode {
    stopped: Arc<AtomicBool>,
    next: Option<Arc<dyn FailureHandler>>,
}

impl FailureHandler for StopNode {
    fn on_critical_failure(&self, err: &StrataError) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            error!(error = %err, "engine.stopped");
        }
        if let Some(next) = &self.next {
            next.on_critical_failure(err);
        }
    }
}

struct GroupStores {
    partitions: BTreeMap<PartitionId, Arc<PartitionStore>>,
    index: IndexStore,
}

impl GroupStores {
    fn partition(&self, partition: PartitionId) -> Result<&Arc<PartitionStore>> {
        self.partitions
            .get(&partition)
            .ok_or(StrataError::Invalid("partition outside the group"))
    }
}

struct GroupHandle {
    schema: GroupSchema,
    dir: PathBuf,
    frozen: AtomicBool,
    stores: RwLock<GroupStores>,
    maintenance: Mutex<()>,
    /// Visits in flight. They hold partition pages without the stores lock.
    visits: Mutex<usize>,
    visits_done: Condvar,
}

impl GroupHandle {
    fn new(schema: GroupSchema, dir: PathBuf, frozen: bool, stores: GroupStores) -> Self {
        Self {
            schema,
            dir,
            frozen: AtomicBool::new(frozen),
            stores: RwLock::new(stores),
            maintenance: Mutex::new(()),
            visits: Mutex::new(0),
            visits_done: Condvar::new(),
        }
    }

    /// Registers a visit unless the group is frozen. The frozen flag is read
    /// under the counter lock, so [`GroupHandle::drain_visits`] after a freeze
    /// sees every visit that got through.
    fn begin_visit(&self) -> Result<VisitTicket<'_>> {
        let mut visits = self.visits.lock();
        Engine::available(self)?;
        *visits += 1;
        Ok(VisitTicket { handle: self })
    }

    fn drain_visits(&self) {
        let mut visits = self.visits.lock();
        while *visits > 0 {
            self.visits_done.wait(&mut visits);
        }
    }
}

struct VisitTicket<'a> {
    handle: &'a GroupHandle,
}

impl Drop for VisitTicket<'_> {
    fn drop(&mut self) {
        let mut visits = self.handle.visits.lock();
        *visits -= 1;
        if *visits == 0 {
            self.handle.visits_done.notify_all();
        }
    }
}

/// Outcome of the recovery run during open.
#[derive(Clone, Debug, Default, Serialize)]
pub struct RecoveryReport {
    /// Checkpoint whose page images were restored.
    pub restored_checkpoint: Option<u64>,
    pub pages_restored: u64,
    pub replay_from: Option<u64>,
    pub records_replayed: u64,
    /// Data records of transactions resolved as rolled back.
    pub records_skipped: u64,
    pub skipped_transactions: usize,
    /// Groups found with a pending defragmentation request.
    pub frozen_groups: Vec<u32>,
    pub duration_ms: u64,
}

/// Result of one row mutation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RowOutcome {
    /// Link of the written row; `None` for removals.
    pub link: Option<Link>,
    /// Row replaced or removed.
    pub old: Option<Row>,
    pub counter: u64,
    pub pointer: WalPointer,
}

/// Group section of [`EngineStats`].
#[derive(Clone, Debug, Serialize)]
pub struct GroupStats {
    pub id: u32,
    pub name: String,
    pub frozen: bool,
    pub partitions: Vec<PartitionStats>,
    pub index_pages: u32,
    pub indexes: Vec<IndexDef>,
}

/// Engine-wide figures.
#[derive(Clone, Debug, Serialize)]
pub struct EngineStats {
    pub region: MemoryStats,
    pub throttle: Option<ThrottleStats>,
    pub wal: WalStats,
    /// Bytes held by the retained WAL segments.
    pub wal_bytes: u64,
    pub wal_segments: usize,
    pub last_checkpoint: Option<CheckpointInfo>,
    pub recovery: RecoveryReport,
    pub groups: Vec<GroupStats>,
}

/// Storage engine over one data directory.
pub struct Engine {
    dir: PathBuf,
    config: StorageConfig,
    wal: Arc<Wal>,
    workers: Arc<Workers>,
    checkpointer: Checkpointer,
    memory: Arc<PageMemory>,
    throttle: Option<Arc<SpeedBasedThrottle>>,
    groups: BTreeMap<GroupId, Arc<GroupHandle>>,
    coordinator: Arc<RecoveryCoordinator>,
    stopped: Arc<AtomicBool>,
    recovery: RecoveryReport,
}

impl Engine {
    /// Opens or creates a standalone engine at `dir`.
    pub fn open(dir: impl AsRef<Path>, config: StorageConfig, schema: Schema) -> Result<Self> {
        Self::open_with_recovery(dir, config, schema, RecoveryOptions::standalone())
    }

    /// Opens or creates an engine whose transaction recovery consults peers.
    pub fn open_with_recovery(
        dir: impl AsRef<Path>,
        config: StorageConfig,
        schema: Schema,
        recovery: RecoveryOptions,
    ) -> Result<Self> {
        let started = Instant::now();
        config.validate()?;
        schema.validate()?;
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let wal = Arc::new(Wal::open(wal_dir(&dir), config.wal_options())?);
        let memory = PageMemory::new(
            RegionConfig {
                name: DEFAULT_REGION.into(),
                page_size: config.page_size,
                capacity: config.region_pages,
                checkpoint_buffer: config.checkpoint_buffer_pages,
                wal_logged: true,
            },
            PageLockTracker::new(),
        );

        let mut report = RecoveryReport::default();
        let mut layouts = Vec::new();
        for group in schema.groups() {
            let gdir = files::group_dir(&dir, group.id);
            fs::create_dir_all(&gdir)?;
            let partitions = group.partition_ids();
            if files::completed_marker(&gdir).exists() {
                info!(group = group.id.0, "engine.defrag.finish_pending");
                files::batch_rename(&gdir, &partitions)?;
                files::cleanup(&gdir, &partitions)?;
            }
            let frozen = files::request_marker(&gdir).exists();
            if frozen {
                warn!(group = group.id.0, "engine.group.frozen");
                report.frozen_groups.push(group.id.0);
            }
            register_stores(&memory, &config, &gdir, group)?;
            layouts.push((group.clone(), gdir, frozen));
        }

        let cookie = CheckpointCookie::load(&cookie_path(&dir))?;
        let restored = restore_pages(&wal, cookie, &memory)?;
        report.restored_checkpoint = restored.checkpoint;
        report.pages_restored = restored.pages_restored;
        report.replay_from = restored.replay_from.map(|p| p.0);
        let last_id = restored.checkpoint.unwrap_or(0).max(cookie.map_or(0, |c| c.id));

        let checkpointer = Checkpointer::start(
            CheckpointerConfig {
                frequency: config.checkpoint_frequency(),
                threads: config.checkpoint_threads,
                write_batch: config.checkpoint_write_batch_pages,
                cookie_path: cookie_path(&dir),
            },
            CheckpointLock::new(),
            Arc::clone(&wal),
            last_id,
        )?;
        let throttle = config.throttle_enabled.then(|| {
            let throttle = SpeedBasedThrottle::new(DEFAULT_REGION, memory.counters(), checkpointer.write_progress());
            memory.set_throttle(throttle.clone());
            throttle
        });
        checkpointer.add_region(Arc::clone(&memory), throttle.clone());

        let workers = Workers::new();
        let mut groups = BTreeMap::new();
        {
            let worker = workers.register("strata-open");
            let guard = checkpointer.checkpoint_read_lock(&worker);
            for (group, gdir, frozen) in layouts {
                let stores = open_group(&guard, &memory, &group)?;
                groups.insert(group.id, Arc::new(GroupHandle::new(group, gdir, frozen, stores)));
            }
        }

        let mut engine = Self {
            dir,
            config,
            wal,
            workers,
            checkpointer,
            memory,
            throttle,
            groups,
            coordinator: recovery.coordinator,
            stopped: recovery.stopped,
            recovery: RecoveryReport::default(),
        };
        let ctx = engine.resolve_transactions(restored.replay_from, recovery.timeout)?;
        report.skipped_transactions = ctx.skip_txs.len();
        engine.replay(&ctx, &mut report)?;
        if report.records_replayed > 0 {
            engine
                .checkpointer
                .force_checkpoint("recovery")
                .wait(CheckpointState::Finished)?;
        }
        report.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            dir = %engine.dir.display(),
            groups = engine.groups.len(),
            restored = ?report.restored_checkpoint,
            pages_restored = report.pages_restored,
            replayed = report.records_replayed,
            skipped = report.records_skipped,
            duration_ms = report.duration_ms,
            "engine.opened"
        );
        engine.recovery = report;
        Ok(engine)
    }

    fn resolve_transactions(&self, init_pointer: Option<WalPointer>, timeout: Duration) -> Result<RecoveryContext> {
        let states = TxWalState::scan(&self.wal, init_pointer)?;
        debug!(transactions = states.len(), "engine.recovery.scanned");
        self.coordinator.on_wal_scanned(init_pointer, states)?;
        match self.coordinator.future().wait_timeout(timeout)? {
            Some(ctx) => Ok(ctx),
            None => Err(StrataError::Recovery(format!(
                "peers did not answer within {} ms",
                timeout.as_millis()
            ))),
        }
    }

    fn replay(&self, ctx: &RecoveryContext, report: &mut RecoveryReport) -> Result<()> {
        let worker = self.workers.register("strata-replay");
        for item in self.wal.replay(ctx.init_pointer)? {
            let (pointer, record) = item?;
            let WalRecord::Data(record) = record else {
                continue;
            };
            if record.tx.is_some_and(|tx| ctx.skips(tx)) {
                report.records_skipped += 1;
                continue;
            }
            let Some(handle) = self.groups.get(&record.group) else {
                debug!(group = record.group.0, pointer = pointer.0, "engine.replay.unknown_group");
                continue;
            };
            let guard = self.checkpointer.checkpoint_read_lock(&worker);
            let stores = handle.stores.read();
            let part = stores.partition(record.partition)?;
            let write = part.write();
            apply_record(&guard, &write, &stores.index, &record)?;
            report.records_replayed += 1;
        }
        Ok(())
    }

    fn ensure_running(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(StrataError::NodeStopped);
        }
        Ok(())
    }

    fn group(&self, id: GroupId) -> Result<&Arc<GroupHandle>> {
        self.groups.get(&id).ok_or(StrataError::NotFound)
    }

    fn available(handle: &GroupHandle) -> Result<()> {
        if handle.frozen.load(Ordering::SeqCst) {
            return Err(StrataError::GroupUnavailable(handle.schema.id));
        }
        Ok(())
    }

    /// Data directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Registers a worker; every lock-taking call is made on behalf of one.
    pub fn worker(&self, name: impl Into<String>) -> WorkerContext {
        self.workers.register(name)
    }

    /// Enters the region checkpoints cannot cross. Reentrant per worker.
    pub fn checkpoint_read_lock(&self, worker: &WorkerContext) -> CheckpointReadGuard {
        self.checkpointer.checkpoint_read_lock(worker)
    }

    /// Requests a checkpoint. Waiting on the result under a read lock deadlocks.
    pub fn force_checkpoint(&self, reason: &str) -> CheckpointProgress {
        self.checkpointer.force_checkpoint(reason)
    }

    /// Completion events of every following checkpoint.
    pub fn subscribe_checkpoints(&self) -> mpsc::Receiver<CheckpointInfo> {
        self.checkpointer.subscribe()
    }

    /// Recovery figures of the open that produced this engine.
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    pub fn is_frozen(&self, group: GroupId) -> Result<bool> {
        Ok(self.group(group)?.frozen.load(Ordering::SeqCst))
    }

    /// Inserts or replaces a row; returns the replaced row.
    pub fn put(
        &self,
        worker: &WorkerContext,
        scope: RowScope,
        key: &[u8],
        value: &[u8],
        expire_at: u64,
    ) -> Result<Option<Row>> {
        let op = RowOperation::put(scope, key, value).expire_at(expire_at);
        Ok(self.apply(worker, op)?.old)
    }

    /// Removes a row; returns it when it existed.
    pub fn remove(&self, worker: &WorkerContext, scope: RowScope, key: &[u8]) -> Result<Option<Row>> {
        Ok(self.apply(worker, RowOperation::remove(scope, key))?.old)
    }

    /// Logs and applies one row mutation, maintaining the group's indexes.
    pub fn apply(&self, worker: &WorkerContext, op: RowOperation) -> Result<RowOutcome> {
        self.ensure_running()?;
        let handle = self.group(op.scope.group)?;
        let outcome = {
            let guard = self.checkpointer.checkpoint_read_lock(worker);
            let stores = handle.stores.read();
            Self::available(handle)?;
            let part = stores.partition(op.scope.partition)?;
            let write = part.write();
            let counter = op.counter.unwrap_or_else(|| write.next_counter());
            let cache = op.scope.cache;
            let value = match (op.op, &op.value) {
                (DataOp::Put, Some(value)) => {
                    part.check_put(cache, &op.key, value)?;
                    Some(value.as_slice())
                }
                (DataOp::Put, None) => return Err(StrataError::Invalid("put without a value")),
                (DataOp::Remove, _) => None,
            };
            let old = write.current(&guard, cache, &op.key)?;
            let index_updates = self.index_updates(handle, &stores, &op, old.as_ref().map(|o| &o.row), value)?;
            let record = DataRecord {
                group: op.scope.group,
                cache,
                partition: op.scope.partition,
                key: op.key,
                op: op.op,
                value: op.value,
                expire_at: op.expire_at,
                counter,
                tx: op.tx,
                index_updates,
            };
            let pointer = self.wal.append(&WalRecord::Data(record.clone()))?;
            let applied = apply_record(&guard, &write, &stores.index, &record)?;
            RowOutcome {
                link: applied.link,
                old: applied.old,
                counter,
                pointer,
            }
        };
        self.wal.sync_for(self.config.synchronous, self.config.wal_sync_interval())?;
        Ok(outcome)
    }

    fn index_updates(
        &self,
        handle: &GroupHandle,
        stores: &GroupStores,
        op: &RowOperation,
        old: Option<&Row>,
        value: Option<&[u8]>,
    ) -> Result<Vec<IndexUpdate>> {
        let max = stores.index.max_key_len();
        let mut updates = Vec::new();
        for index in &handle.schema.indexes {
            let old_key = old.and_then(|row| index.extractor.extract(row.cache, &row.key, &row.value));
            let new_key = value.and_then(|v| index.extractor.extract(op.scope.cache, &op.key, v));
            if let Some(key) = &new_key {
                if key.len() > max {
                    return Err(StrataError::KeyTooLarge { len: key.len(), max });
                }
            }
            if old_key.is_some() || new_key.is_some() {
                updates.push(IndexUpdate {
                    index: index.id,
                    old_key,
                    new_key,
                });
            }
        }
        Ok(updates)
    }

    /// Point lookup.
    pub fn get(&self, worker: &WorkerContext, scope: RowScope, key: &[u8]) -> Result<Option<Row>> {
        self.ensure_running()?;
        let handle = self.group(scope.group)?;
        let guard = self.checkpointer.checkpoint_read_lock(worker);
        let stores = handle.stores.read();
        Self::available(handle)?;
        let row = stores.partition(scope.partition)?.get(&guard, scope.cache, key)?;
        Ok(row.map(|stored| stored.row))
    }

    /// Rows of the scope's cache with keys inside the bounds, in key order.
    pub fn scan(
        &self,
        worker: &WorkerContext,
        scope: RowScope,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
        limit: Option<usize>,
    ) -> Result<Vec<Row>> {
        self.ensure_running()?;
        let handle = self.group(scope.group)?;
        let guard = self.checkpointer.checkpoint_read_lock(worker);
        let stores = handle.stores.read();
        Self::available(handle)?;
        let rows = stores
            .partition(scope.partition)?
            .scan(&guard, scope.cache, lower, upper, limit)?;
        Ok(rows.into_iter().map(|stored| stored.row).collect())
    }

    /// Visits every row of a partition, cycling the checkpoint read lock per
    /// `options`. Rows written concurrently may or may not be seen. A visit
    /// still running when the group is frozen for defragmentation fails with
    /// [`StrataError::GroupUnavailable`] at its next row.
    pub fn visit<F>(
        &self,
        worker: &WorkerContext,
        group: GroupId,
        partition: PartitionId,
        options: &VisitOptions,
        mut visitor: F,
    ) -> Result<VisitSummary>
    where
        F: FnMut(&Row) -> Result<bool>,
    {
        self.ensure_running()?;
        let handle = self.group(group)?;
        let _ticket = handle.begin_visit()?;
        let part = Arc::clone(handle.stores.read().partition(partition)?);
        let mut guard = self.checkpointer.checkpoint_read_lock(worker);
        part.visit(&mut guard, options, |_, _, row| {
            Self::available(handle)?;
            visitor(&row)
        })
    }

    /// Rows whose secondary index `index` holds `key`.
    pub fn index_lookup(&self, worker: &WorkerContext, group: GroupId, index: u16, key: &[u8]) -> Result<Vec<Row>> {
        self.ensure_running()?;
        let handle = self.group(group)?;
        let guard = self.checkpointer.checkpoint_read_lock(worker);
        let stores = handle.stores.read();
        Self::available(handle)?;
        let mut rows = Vec::new();
        for link in stores.index.lookup(&guard, index, key)? {
            let part = stores
                .partitions
                .get(&link.partition())
                .ok_or(StrataError::Corruption("index entry points into an unknown partition"))?;
            rows.push(part.read_row(&guard, link)?);
        }
        Ok(rows)
    }

    /// Removes every row whose expiry is at or before `now` in the groups that
    /// are not frozen. Returns the number of rows removed.
    pub fn expire(&self, worker: &WorkerContext, now: u64) -> Result<u64> {
        self.ensure_running()?;
        let mut removed = 0u64;
        for handle in self.groups.values() {
            if handle.frozen.load(Ordering::SeqCst) {
                continue;
            }
            for partition in handle.schema.partition_ids() {
                loop {
                    let batch = {
                        let guard = self.checkpointer.checkpoint_read_lock(worker);
                        let stores = handle.stores.read();
                        stores.partition(partition)?.expired(&guard, now, EXPIRE_BATCH)?
                    };
                    let done = batch.len() < EXPIRE_BATCH;
                    for row in batch {
                        let scope = RowScope::new(handle.schema.id, row.cache, partition);
                        if self.apply(worker, RowOperation::remove(scope, row.key))?.old.is_some() {
                            removed += 1;
                        }
                    }
                    if done {
                        break;
                    }
                }
            }
        }
        if removed > 0 {
            debug!(now, removed, "engine.expired");
        }
        Ok(removed)
    }

    /// Logs a transaction state change for recovery.
    pub fn log_tx(&self, record: TxRecord) -> Result<WalPointer> {
        self.ensure_running()?;
        let pointer = self.wal.append(&WalRecord::Tx(record))?;
        self.wal.sync_for(self.config.synchronous, self.config.wal_sync_interval())?;
        Ok(pointer)
    }

    /// Meta page contents of a partition.
    pub fn partition_meta(&self, group: GroupId, partition: PartitionId) -> Result<PartitionMeta> {
        let handle = self.group(group)?;
        let stores = handle.stores.read();
        Ok(stores.partition(partition)?.meta())
    }

    /// Forwards a peer's recovery message.
    pub fn on_recovery_message(&self, from: NodeId, message: RecoveryMessage) {
        self.coordinator.on_message(from, message);
    }

    /// Forwards a peer's recovery message in its JSON form.
    pub fn on_recovery_payload(&self, from: NodeId, payload: &str) {
        self.coordinator.on_payload(from, payload);
    }

    /// Forwards a membership change.
    pub fn on_node_left(&self, node: NodeId) {
        self.coordinator.on_node_left(node);
    }

    /// Compacts `group` and swaps the compacted stores in.
    ///
    /// Row operations on the group fail with [`StrataError::GroupUnavailable`]
    /// until this returns, and running visits end at their next row. On error
    /// or cancellation the half-written files are removed and the group is
    /// released; finished partition copies stay for the next call to reuse.
    /// Once every copy is complete the group instead stays frozen and the next
    /// call or open finishes the swap. Must not be called under a checkpoint
    /// read lock.
    pub fn defragment(&self, group: GroupId, token: &CancellationToken) -> Result<DefragReport> {
        self.ensure_running()?;
        let handle = self.group(group)?;
        let Some(_maintenance) = handle.maintenance.try_lock() else {
            return Err(StrataError::Invalid("defragmentation already running for the group"));
        };
        let request = files::request_marker(&handle.dir);
        if !request.exists() {
            io::write_atomic(&request, b"")?;
        }
        handle.frozen.store(true, Ordering::SeqCst);
        // Waits for row operations that passed the frozen check.
        drop(handle.stores.write());
        handle.drain_visits();
        info!(group = group.0, "engine.group.frozen");

        match self.compact_group(handle, token) {
            Ok(report) => {
                self.reopen_group(handle)?;
                handle.frozen.store(false, Ordering::SeqCst);
                info!(group = group.0, "engine.group.released");
                Ok(report)
            }
            Err(err) if files::completed_marker(&handle.dir).exists() => {
                error!(group = group.0, error = %err, "engine.defrag.swap_failed");
                Err(err)
            }
            Err(err) => {
                warn!(group = group.0, error = %err, "engine.defrag.aborted");
                if let Err(cleanup) = files::abort(&handle.dir, &handle.schema.partition_ids()) {
                    warn!(group = group.0, error = %cleanup, "engine.defrag.abort_cleanup_failed");
                }
                handle.frozen.store(false, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    fn compact_group(&self, handle: &GroupHandle, token: &CancellationToken) -> Result<DefragReport> {
        let group = handle.schema.id;
        self.checkpointer
            .force_checkpoint(&format!("defrag-freeze-{}", group.0))
            .wait(CheckpointState::Finished)?;
        let settings = DefragSettings {
            page_size: self.config.page_size,
            region_pages: self.config.defrag_region_pages,
            lock_hold: self.config.defrag_lock_hold(),
            verify_checksums: self.config.verify_checksums,
        };
        let stores = handle.stores.read();
        let source = DefragSource {
            group,
            dir: &handle.dir,
            partitions: &stores.partitions,
            index: &stores.index,
        };
        let manager = DefragmentationManager::new(&self.checkpointer, &self.workers, settings);
        manager.defragment_group(&source, token)
    }

    fn reopen_group(&self, handle: &GroupHandle) -> Result<()> {
        let worker = self.workers.register("strata-reopen");
        let guard = self.checkpointer.checkpoint_read_lock(&worker);
        let mut stores = handle.stores.write();
        let dropped = self.memory.invalidate(handle.schema.id, None);
        register_stores(&self.memory, &self.config, &handle.dir, &handle.schema)?;
        *stores = open_group(&guard, &self.memory, &handle.schema)?;
        debug!(group = handle.schema.id.0, dropped, "engine.group.reopened");
        Ok(())
    }

    /// Engine-wide figures.
    pub fn stats(&self) -> Result<EngineStats> {
        let mut groups = Vec::new();
        for handle in self.groups.values() {
            let stores = handle.stores.read();
            let mut partitions = Vec::new();
            for part in stores.partitions.values() {
                partitions.push(part.stats()?);
            }
            groups.push(GroupStats {
                id: handle.schema.id.0,
                name: handle.schema.name.clone(),
                frozen: handle.frozen.load(Ordering::SeqCst),
                partitions,
                index_pages: self.memory.store(handle.schema.id, PartitionId::INDEX)?.allocated(),
                indexes: stores.index.definitions(),
            });
        }
        Ok(EngineStats {
            region: self.memory.stats(),
            throttle: self.throttle.as_ref().map(|t| t.stats()),
            wal: self.wal.stats(),
            wal_bytes: self.wal.len(),
            wal_segments: self.wal.segment_count(),
            last_checkpoint: self.checkpointer.last_checkpoint(),
            recovery: self.recovery.clone(),
            groups,
        })
    }

    /// Checkpoints everything and stops the checkpointer.
    pub fn close(self) -> Result<()> {
        let info = self
            .checkpointer
            .force_checkpoint("close")
            .wait(CheckpointState::Finished)?;
        self.checkpointer.stop();
        self.wal.sync()?;
        info!(dir = %self.dir.display(), checkpoint = info.id, "engine.closed");
        Ok(())
    }
}

fn register_stores(memory: &PageMemory, config: &StorageConfig, dir: &Path, group: &GroupSchema) -> Result<()> {
    let open = |path: PathBuf, partition: PartitionId| -> Result<Arc<PageStore>> {
        PageStore::open_or_create(path, group.id, partition, config.page_size, config.verify_checksums)
    };
    for partition in group.partition_ids() {
        memory.register_store(open(files::partition_file(dir, partition), partition)?)?;
    }
    memory.register_store(open(files::index_file(dir), PartitionId::INDEX)?)
}

fn open_group(guard: &CheckpointReadGuard, memory: &Arc<PageMemory>, group: &GroupSchema) -> Result<GroupStores> {
    let mut partitions = BTreeMap::new();
    for partition in group.partition_ids() {
        let store = PartitionStore::open_or_create(guard, Arc::clone(memory), group.id, partition)?;
        partitions.insert(partition, Arc::new(store));
    }
    let index = IndexStore::open_or_create(guard, Arc::clone(memory), group.id)?;
    for def in &group.indexes {
        index.ensure_index(guard, def.id, &def.name)?;
    }
    Ok(GroupStores { partitions, index })
}

struct Applied {
    link: Option<Link>,
    old: Option<Row>,
}

/// Applies a logged mutation. Shared by live writes and replay, so index
/// links always come from the row store rather than from the log.
fn apply_record(
    guard: &CheckpointReadGuard,
    write: &PartitionWrite<'_>,
    index: &IndexStore,
    record: &DataRecord,
) -> Result<Applied> {
    match (record.op, &record.value) {
        (DataOp::Put, Some(value)) => {
            let out = write.put(guard, record.cache, &record.key, value, record.expire_at, record.counter)?;
            for update in &record.index_updates {
                if let (Some(key), Some(old)) = (&update.old_key, &out.old) {
                    index.remove(guard, update.index, key, old.link)?;
                }
                if let Some(key) = &update.new_key {
                    index.insert(guard, update.index, key, out.link)?;
                }
            }
            Ok(Applied {
                link: Some(out.link),
                old: out.old.map(|stored| stored.row),
            })
        }
        (DataOp::Put, None) => Err(StrataError::Corruption("put record without a value")),
        (DataOp::Remove, _) => {
            let removed = write.remove(guard, record.cache, &record.key, record.counter)?;
            if let Some(old) = &removed {
                for update in &record.index_updates {
                    if let Some(key) = &update.old_key {
                        index.remove(guard, update.index, key, old.link)?;
                    }
                }
            }
            Ok(Applied {
                link: None,
                old: removed.map(|stored| stored.row),
            })
        }
    }
}

#[cfg(test)]
mod tests;
