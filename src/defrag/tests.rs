use std::path::PathBuf;

use tempfile::TempDir;

use super::*;
use crate::checkpoint::CheckpointerConfig;
use crate::primitives::concurrency::{CheckpointLock, WorkerContext};
use crate::primitives::wal::{Wal, WalOptions};
use crate::types::{CacheId, Link, PageIdx};

const GROUP: GroupId = GroupId(5);
const PAGE: u32 = 1024;

struct Fixture {
    _tmp: TempDir,
    dir: PathBuf,
    checkpointer: Checkpointer,
    workers: Arc<Workers>,
    memory: Arc<PageMemory>,
    partitions: BTreeMap<PartitionId, Arc<PartitionStore>>,
    index: IndexStore,
}

fn settings() -> DefragSettings {
    DefragSettings {
        page_size: PAGE,
        region_pages: 512,
        lock_hold: Duration::from_millis(1),
        verify_checksums: true,
    }
}

fn region(name: &str) -> Arc<PageMemory> {
    PageMemory::new(
        RegionConfig {
            name: name.into(),
            page_size: PAGE,
            capacity: 2048,
            checkpoint_buffer: 512,
            wal_logged: false,
        },
        PageLockTracker::new(),
    )
}

fn register(memory: &PageMemory, dir: &Path) -> Result<()> {
    for p in 0..2u16 {
        let path = files::partition_file(dir, PartitionId(p));
        memory.register_store(PageStore::open_or_create(path, GROUP, PartitionId(p), PAGE, true)?)?;
    }
    memory.register_store(PageStore::open_or_create(files::index_file(dir), GROUP, PartitionId::INDEX, PAGE, true)?)
}

fn key(i: u32) -> Vec<u8> {
    format!("key-{i:05}").into_bytes()
}

fn fixture() -> Result<Fixture> {
    let tmp = tempfile::tempdir()?;
    let dir = files::group_dir(tmp.path(), GROUP);
    std::fs::create_dir_all(&dir)?;
    let wal = Arc::new(Wal::open(tmp.path().join("wal"), WalOptions::default())?);
    let checkpointer = Checkpointer::start(
        CheckpointerConfig {
            frequency: Duration::from_secs(3600),
            threads: 2,
            write_batch: 256,
            cookie_path: tmp.path().join("checkpoint.cookie"),
        },
        CheckpointLock::new(),
        wal,
        0,
    )?;
    let memory = region("default");
    register(&memory, &dir)?;
    checkpointer.add_region(Arc::clone(&memory), None);
    let workers = Workers::new();
    let worker = workers.register("fill");
    let (partitions, index) = {
        let guard = checkpointer.checkpoint_read_lock(&worker);
        let mut partitions = BTreeMap::new();
        for p in 0..2u16 {
            let part = PartitionStore::create(&guard, Arc::clone(&memory), GROUP, PartitionId(p))?;
            partitions.insert(PartitionId(p), Arc::new(part));
        }
        let index = IndexStore::create(&guard, Arc::clone(&memory), GROUP)?;
        index.ensure_index(&guard, 1, "by_value")?;
        (partitions, index)
    };
    let fx = Fixture {
        _tmp: tmp,
        dir,
        checkpointer,
        workers,
        memory,
        partitions,
        index,
    };
    fill(&fx, &worker)?;
    Ok(fx)
}

// Writes 600 rows per partition, then removes two thirds of them.
fn fill(fx: &Fixture, worker: &WorkerContext) -> Result<()> {
    let guard = fx.checkpointer.checkpoint_read_lock(worker);
    for (p, part) in &fx.partitions {
        let w = part.write();
        for i in 0..600u32 {
            let expire = if i % 10 == 0 { 1_000 + u64::from(i) } else { 0 };
            let value = format!("value-{}-{i}", p.0).into_bytes();
            let counter = w.next_counter();
            let out = w.put(&guard, CacheId(i % 3), &key(i), &value, expire, counter)?;
            fx.index.insert(&guard, 1, &value, out.link)?;
        }
        for i in (0..600u32).filter(|i| i % 3 != 0) {
            let counter = w.next_counter();
            if let Some(old) = w.remove(&guard, CacheId(i % 3), &key(i), counter)? {
                fx.index.remove(&guard, 1, &old.row.value, old.link)?;
            }
        }
    }
    Ok(())
}

fn source(fx: &Fixture) -> DefragSource<'_> {
    DefragSource {
        group: GROUP,
        dir: &fx.dir,
        partitions: &fx.partitions,
        index: &fx.index,
    }
}

fn flush(fx: &Fixture) -> Result<()> {
    fx.checkpointer.force_checkpoint("flush").wait(CheckpointState::Finished)?;
    Ok(())
}

#[test]
fn compacted_group_keeps_rows_meta_and_index() -> Result<()> {
    let fx = fixture()?;
    flush(&fx)?;
    let before: BTreeMap<PartitionId, _> = fx.partitions.iter().map(|(p, s)| (*p, s.snapshot())).collect();
    let manager = DefragmentationManager::new(&fx.checkpointer, &fx.workers, settings());
    let report = manager.defragment_group(&source(&fx), &CancellationToken::new())?;

    assert_eq!(report.partitions_processed, vec![0, 1]);
    assert_eq!(report.rows_copied, 400);
    assert_eq!(report.index_entries, 400);
    assert!(report.new_pages < report.old_pages, "{report:?}");
    assert!(!files::completed_marker(&fx.dir).exists());
    assert!(!files::mapping_file(&fx.dir, PartitionId(0)).exists());

    fx.memory.invalidate(GROUP, None);
    let fresh = region("reopened");
    register(&fresh, &fx.dir)?;
    let lock = CheckpointLock::new();
    let worker = fx.workers.register("verify");
    let guard = lock.read(&worker);
    let index = IndexStore::open(&guard, Arc::clone(&fresh), GROUP)?;
    for (p, old) in &before {
        let part = PartitionStore::open(&guard, Arc::clone(&fresh), GROUP, *p)?;
        assert_eq!(&part.snapshot(), old);
        for i in (0..600u32).step_by(3) {
            let row = part.get(&guard, CacheId(i % 3), &key(i))?.expect("row survives");
            let value = format!("value-{}-{i}", p.0).into_bytes();
            assert_eq!(row.row.value, value);
            assert_eq!(index.lookup(&guard, 1, &value)?, vec![row.link]);
        }
        assert!(part.get(&guard, CacheId(1), &key(1))?.is_none());
        let expired = part.expired(&guard, u64::MAX, usize::MAX)?;
        assert_eq!(expired.len(), 20);
    }
    Ok(())
}

#[test]
fn finished_partitions_are_skipped_on_resume() -> Result<()> {
    let fx = fixture()?;
    flush(&fx)?;
    // A first run that finished partition 0 and then stopped.
    let token = CancellationToken::new();
    let manager = DefragmentationManager::new(&fx.checkpointer, &fx.workers, settings());
    {
        let only_first: BTreeMap<PartitionId, Arc<PartitionStore>> = fx
            .partitions
            .iter()
            .filter(|(p, _)| p.0 == 0)
            .map(|(p, s)| (*p, Arc::clone(s)))
            .collect();
        let partial = DefragSource {
            partitions: &only_first,
            ..source(&fx)
        };
        let parts = Lease::new(&fx.checkpointer, PARTITION_REGION, &manager.settings, GROUP);
        let mappings = Lease::new(&fx.checkpointer, MAPPING_REGION, &manager.settings, GROUP);
        let mut report = DefragReport::default();
        manager.copy_partition(
            &partial,
            PartitionId(0),
            &fx.partitions[&PartitionId(0)],
            &parts.memory,
            &mappings.memory,
            &token,
            &mut report,
        )?;
    }
    assert!(files::defragmented_partition_file(&fx.dir, PartitionId(0)).exists());

    let report = manager.defragment_group(&source(&fx), &token)?;
    assert_eq!(report.partitions_skipped, vec![0]);
    assert_eq!(report.partitions_processed, vec![1]);
    assert_eq!(report.index_entries, 400);
    Ok(())
}

#[test]
fn cancellation_leaves_live_files_alone() -> Result<()> {
    let fx = fixture()?;
    flush(&fx)?;
    let live = std::fs::read(files::partition_file(&fx.dir, PartitionId(0)))?;
    let token = CancellationToken::new();
    token.cancel();
    let manager = DefragmentationManager::new(&fx.checkpointer, &fx.workers, settings());
    let err = manager.defragment_group(&source(&fx), &token).expect_err("cancelled");
    assert!(matches!(err, StrataError::Cancelled));
    assert_eq!(std::fs::read(files::partition_file(&fx.dir, PartitionId(0)))?, live);
    assert!(!files::completed_marker(&fx.dir).exists());
    Ok(())
}

#[test]
fn dangling_index_entry_is_corruption() -> Result<()> {
    let fx = fixture()?;
    {
        let worker = fx.workers.register("damage");
        let guard = fx.checkpointer.checkpoint_read_lock(&worker);
        fx.index.insert(&guard, 1, b"ghost", Link::new(PartitionId(1), PageIdx(9999), 1))?;
    }
    flush(&fx)?;
    let manager = DefragmentationManager::new(&fx.checkpointer, &fx.workers, settings());
    let err = manager
        .defragment_group(&source(&fx), &CancellationToken::new())
        .expect_err("unmapped");
    assert!(matches!(err, StrataError::Corruption(_)));
    Ok(())
}

#[test]
fn link_map_pairs_every_live_row_with_a_distinct_copy() -> Result<()> {
    let fx = fixture()?;
    flush(&fx)?;
    let part = PartitionId(1);
    let old = &fx.partitions[&part];
    let manager = DefragmentationManager::new(&fx.checkpointer, &fx.workers, settings());
    let parts = Lease::new(&fx.checkpointer, PARTITION_REGION, &manager.settings, GROUP);
    let mappings = Lease::new(&fx.checkpointer, MAPPING_REGION, &manager.settings, GROUP);
    let map = manager.copy_partition(
        &source(&fx),
        part,
        old,
        &parts.memory,
        &mappings.memory,
        &CancellationToken::new(),
        &mut DefragReport::default(),
    )?;

    let copied = region("copied");
    copied.register_store(PageStore::open(
        files::defragmented_partition_file(&fx.dir, part),
        GROUP,
        part,
        PAGE,
        true,
    )?)?;
    let worker = fx.workers.register("verify");
    let mut guard = fx.checkpointer.checkpoint_read_lock(&worker);
    let mut live = Vec::new();
    let options = VisitOptions {
        relock_after: Duration::from_secs(60),
        cancel: None,
    };
    old.visit(&mut guard, &options, |_, link, _| {
        live.push(link);
        Ok(true)
    })?;
    live.sort();

    let copy = PartitionStore::open(&guard, Arc::clone(&copied), GROUP, part)?;
    let entries = map.entries(&guard)?;
    assert_eq!(entries.len(), 200);
    let mapped: Vec<Link> = entries.iter().map(|(old_link, _)| *old_link).collect();
    assert_eq!(mapped, live);
    let targets: std::collections::BTreeSet<Link> = entries.iter().map(|(_, new_link)| *new_link).collect();
    assert_eq!(targets.len(), entries.len());
    for (old_link, new_link) in &entries {
        assert_eq!(copy.read_row(&guard, *new_link)?, old.read_row(&guard, *old_link)?);
    }
    Ok(())
}
