use std::ops::Bound;

use tempfile::TempDir;

use super::*;
use crate::primitives::wal::TxState;
use crate::recovery::TxStateRequest;
use crate::types::{CacheId, PageIdx, TxId};

const GROUP: GroupId = GroupId(3);
const BY_VALUE: u16 = 1;

fn config() -> StorageConfig {
    StorageConfig {
        page_size: 1024,
        region_pages: 1024,
        checkpoint_buffer_pages: 256,
        checkpoint_frequency_ms: 3_600_000,
        checkpoint_threads: 2,
        defrag_region_pages: 512,
        defrag_lock_hold_ms: 1,
        ..StorageConfig::default()
    }
}

fn value_key(_: CacheId, _: &[u8], value: &[u8]) -> Option<Vec<u8>> {
    value.strip_prefix(b"v:").map(<[u8]>::to_vec)
}

fn schema() -> Schema {
    Schema::new().group(GroupSchema::new(GROUP, "people", 2).index(BY_VALUE, "by_value", value_key))
}

fn open(dir: &TempDir) -> Result<Engine> {
    Engine::open(dir.path(), config(), schema())
}

fn scope(partition: u16) -> RowScope {
    RowScope::new(GROUP, CacheId(1), PartitionId(partition))
}

fn key(i: u32) -> Vec<u8> {
    format!("k{i:04}").into_bytes()
}

#[test]
fn rows_and_index_follow_mutations() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let engine = open(&dir)?;
    let w = engine.worker("test");

    assert!(engine.put(&w, scope(0), b"alice", b"v:red", 0)?.is_none());
    engine.put(&w, scope(1), b"bob", b"v:red", 0)?;
    let found = engine.index_lookup(&w, GROUP, BY_VALUE, b"red")?;
    assert_eq!(found.len(), 2);

    let old = engine.put(&w, scope(0), b"alice", b"v:blue", 0)?.expect("replaced");
    assert_eq!(old.value, b"v:red");
    assert_eq!(engine.index_lookup(&w, GROUP, BY_VALUE, b"red")?.len(), 1);
    let blue = engine.index_lookup(&w, GROUP, BY_VALUE, b"blue")?;
    assert_eq!(blue.iter().map(|r| r.key.as_slice()).collect::<Vec<_>>(), vec![&b"alice"[..]]);

    assert!(engine.remove(&w, scope(1), b"bob")?.is_some());
    assert!(engine.index_lookup(&w, GROUP, BY_VALUE, b"red")?.is_empty());
    assert!(engine.get(&w, scope(1), b"bob")?.is_none());

    // Rows without an index key stay out of the index.
    engine.put(&w, scope(0), b"carol", b"plain", 0)?;
    assert_eq!(engine.get(&w, scope(0), b"carol")?.map(|r| r.value), Some(b"plain".to_vec()));
    engine.close()
}

#[test]
fn growing_update_moves_the_row_and_its_index_entry() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let engine = open(&dir)?;
    let w = engine.worker("test");
    let first = engine.apply(&w, RowOperation::put(scope(0), b"alice".to_vec(), b"v:a".to_vec()))?;
    for i in 0..30 {
        engine.put(&w, scope(0), &key(i), &[b'.'; 40], 0)?;
    }

    let grown = format!("v:{}", "a".repeat(150)).into_bytes();
    let moved = engine.apply(&w, RowOperation::put(scope(0), b"alice".to_vec(), grown.clone()))?;
    assert_ne!(moved.link, first.link);
    assert!(engine.index_lookup(&w, GROUP, BY_VALUE, b"a")?.is_empty());
    let found = engine.index_lookup(&w, GROUP, BY_VALUE, &grown[2..])?;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].value, grown);
    assert_eq!(engine.partition_meta(GROUP, PartitionId(0))?.row_count, 31);
    drop(w);
    engine.close()?;

    let engine = open(&dir)?;
    let w = engine.worker("reopened");
    assert_eq!(engine.get(&w, scope(0), b"alice")?.map(|r| r.value), Some(grown.clone()));
    assert_eq!(engine.index_lookup(&w, GROUP, BY_VALUE, &grown[2..])?.len(), 1);
    drop(w);
    engine.close()
}

#[test]
fn scan_honors_bounds_and_caches() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let engine = open(&dir)?;
    let w = engine.worker("test");
    for i in 0..50 {
        engine.put(&w, scope(0), &key(i), b"x", 0)?;
    }
    let other = RowScope::new(GROUP, CacheId(2), PartitionId(0));
    engine.put(&w, other, &key(10), b"y", 0)?;

    let rows = engine.scan(&w, scope(0), Bound::Included(&key(10)), Bound::Excluded(&key(20)), None)?;
    assert_eq!(rows.len(), 10);
    assert!(rows.iter().all(|r| r.cache == CacheId(1)));
    let limited = engine.scan(&w, scope(0), Bound::Unbounded, Bound::Unbounded, Some(5))?;
    assert_eq!(limited.first().map(|r| r.key.clone()), Some(key(0)));
    assert_eq!(limited.len(), 5);
    assert_eq!(engine.scan(&w, other, Bound::Unbounded, Bound::Unbounded, None)?.len(), 1);

    let mut seen = 0;
    engine.visit(&w, GROUP, PartitionId(0), &VisitOptions::default(), |_| {
        seen += 1;
        Ok(true)
    })?;
    assert_eq!(seen, 51);
    Ok(())
}

#[test]
fn unchecked_writes_are_replayed_on_open() -> Result<()> {
    let dir = tempfile::tempdir()?;
    {
        let engine = open(&dir)?;
        let w = engine.worker("test");
        for i in 0..40 {
            engine.put(&w, scope(i as u16 % 2), &key(i), format!("v:{i}").as_bytes(), 0)?;
        }
        engine.force_checkpoint("half").wait(CheckpointState::Finished)?;
        for i in 40..80 {
            engine.put(&w, scope(i as u16 % 2), &key(i), format!("v:{i}").as_bytes(), 0)?;
        }
        engine.remove(&w, scope(0), &key(0))?;
        // Dropped without a final checkpoint.
    }
    let engine = open(&dir)?;
    let report = engine.recovery_report().clone();
    assert!(report.restored_checkpoint.is_some());
    assert_eq!(report.records_replayed, 41);
    let w = engine.worker("test");
    assert!(engine.get(&w, scope(0), &key(0))?.is_none());
    for i in 1..80 {
        let row = engine.get(&w, scope(i as u16 % 2), &key(i))?.expect("replayed");
        assert_eq!(row.value, format!("v:{i}").into_bytes());
        assert_eq!(engine.index_lookup(&w, GROUP, BY_VALUE, i.to_string().as_bytes())?.len(), 1);
    }
    assert_eq!(engine.partition_meta(GROUP, PartitionId(1))?.row_count, 40);
    Ok(())
}

#[test]
fn rolled_back_transactions_are_not_replayed() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let local = [NodeId(0)];
    {
        let engine = open(&dir)?;
        let w = engine.worker("test");
        for (tx, state) in [(1u64, TxState::Preparing), (2, TxState::Preparing)] {
            engine.log_tx(TxRecord {
                tx: TxId(tx),
                state,
                participants: local.to_vec(),
            })?;
        }
        engine.apply(&w, RowOperation::put(scope(0), b"kept".to_vec(), b"v:1".to_vec()).tx(TxId(1)))?;
        engine.apply(&w, RowOperation::put(scope(0), b"lost".to_vec(), b"v:2".to_vec()).tx(TxId(2)))?;
        engine.log_tx(TxRecord {
            tx: TxId(1),
            state: TxState::Committed,
            participants: local.to_vec(),
        })?;
    }
    let engine = open(&dir)?;
    assert_eq!(engine.recovery_report().records_skipped, 1);
    let w = engine.worker("test");
    assert!(engine.get(&w, scope(0), b"kept")?.is_some());
    assert!(engine.get(&w, scope(0), b"lost")?.is_none());
    assert!(engine.index_lookup(&w, GROUP, BY_VALUE, b"2")?.is_empty());
    Ok(())
}

#[test]
fn transaction_states_survive_wal_truncation() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = StorageConfig {
        wal_segment_bytes: 4096,
        ..config()
    };
    {
        let engine = Engine::open(dir.path(), config.clone(), schema())?;
        let w = engine.worker("test");
        let prepared_at = engine.log_tx(TxRecord {
            tx: TxId(5),
            state: TxState::Preparing,
            participants: vec![NodeId(0)],
        })?;
        for round in 0..6u32 {
            for i in 0..20 {
                engine.put(&w, scope(i as u16 % 2), &key(i), format!("v:{round}-{i}").as_bytes(), 0)?;
            }
            engine.force_checkpoint("round").wait(CheckpointState::Finished)?;
        }
        assert!(engine.stats()?.wal.segments_removed > 0);
        assert!(engine.wal.first_pointer() > prepared_at);
        engine.apply(&w, RowOperation::put(scope(0), b"pending".to_vec(), b"v:p".to_vec()).tx(TxId(5)))?;
        // Dropped without a final checkpoint.
    }
    let engine = Engine::open(dir.path(), config, schema())?;
    assert_eq!(engine.recovery_report().records_skipped, 1);
    let w = engine.worker("test");
    assert!(engine.get(&w, scope(0), b"pending")?.is_none());
    assert_eq!(engine.get(&w, scope(1), &key(19))?.map(|r| r.value), Some(b"v:5-19".to_vec()));
    Ok(())
}

#[test]
fn external_counters_leave_gaps() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let engine = open(&dir)?;
    let w = engine.worker("test");
    let first = engine.apply(&w, RowOperation::put(scope(0), b"a".to_vec(), b"1".to_vec()))?;
    assert_eq!(first.counter, 1);
    engine.apply(&w, RowOperation::put(scope(0), b"b".to_vec(), b"2".to_vec()).counter(5))?;
    let meta = engine.partition_meta(GROUP, PartitionId(0))?;
    assert_eq!(meta.counter_lwm, 1);
    assert_eq!(meta.counter_hwm, 5);
    Ok(())
}

#[test]
fn expire_removes_due_rows() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let engine = open(&dir)?;
    let w = engine.worker("test");
    for i in 0..300u32 {
        let expire = if i % 2 == 0 { 1_000 + u64::from(i) } else { 0 };
        engine.put(&w, scope(0), &key(i), format!("v:{i}").as_bytes(), expire)?;
    }
    assert_eq!(engine.expire(&w, 1_100)?, 51);
    assert!(engine.get(&w, scope(0), &key(0))?.is_none());
    assert!(engine.index_lookup(&w, GROUP, BY_VALUE, b"100")?.is_empty());
    assert!(engine.get(&w, scope(0), &key(102))?.is_some());
    assert_eq!(engine.expire(&w, u64::MAX)?, 99);
    assert_eq!(engine.expire(&w, u64::MAX)?, 0);
    Ok(())
}

#[test]
fn defragment_compacts_and_releases_the_group() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let engine = open(&dir)?;
    let w = engine.worker("test");
    for i in 0..400u32 {
        engine.put(&w, scope(i as u16 % 2), &key(i), format!("v:{i}").as_bytes(), 0)?;
    }
    for i in (0..400u32).filter(|i| i % 4 != 0) {
        engine.remove(&w, scope(i as u16 % 2), &key(i))?;
    }
    let before = engine.partition_meta(GROUP, PartitionId(0))?;

    let report = engine.defragment(GROUP, &CancellationToken::new())?;
    assert_eq!(report.partitions_processed, vec![0, 1]);
    assert_eq!(report.rows_copied, 100);
    assert!(report.new_pages < report.old_pages);
    assert!(!engine.is_frozen(GROUP)?);

    let after = engine.partition_meta(GROUP, PartitionId(0))?;
    assert_eq!(after.row_count, before.row_count);
    assert_eq!(after.counter_lwm, before.counter_lwm);
    for i in (0..400u32).step_by(4) {
        assert!(engine.get(&w, scope(i as u16 % 2), &key(i))?.is_some());
        assert_eq!(engine.index_lookup(&w, GROUP, BY_VALUE, i.to_string().as_bytes())?.len(), 1);
    }
    engine.put(&w, scope(0), b"after", b"v:after", 0)?;
    drop(w);
    engine.close()?;

    let engine = open(&dir)?;
    let w = engine.worker("test");
    assert!(engine.get(&w, scope(0), b"after")?.is_some());
    assert!(engine.get(&w, scope(0), &key(8))?.is_some());
    Ok(())
}

#[test]
fn cancelled_defragment_releases_the_group() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let engine = open(&dir)?;
    let w = engine.worker("test");
    engine.put(&w, scope(0), b"a", b"v:a", 0)?;
    let token = CancellationToken::new();
    token.cancel();
    let err = engine.defragment(GROUP, &token).expect_err("cancelled");
    assert!(matches!(err, StrataError::Cancelled));
    assert!(!engine.is_frozen(GROUP)?);
    assert!(!files::request_marker(&files::group_dir(dir.path(), GROUP)).exists());
    assert!(engine.get(&w, scope(0), b"a")?.is_some());
    Ok(())
}

#[test]
fn pending_request_opens_the_group_frozen() -> Result<()> {
    let dir = tempfile::tempdir()?;
    {
        let engine = open(&dir)?;
        let w = engine.worker("test");
        engine.put(&w, scope(0), b"a", b"v:a", 0)?;
    }
    fs::write(files::request_marker(&files::group_dir(dir.path(), GROUP)), b"")?;

    let engine = open(&dir)?;
    assert_eq!(engine.recovery_report().frozen_groups, vec![GROUP.0]);
    let w = engine.worker("test");
    let err = engine.get(&w, scope(0), b"a").expect_err("frozen");
    assert!(matches!(err, StrataError::GroupUnavailable(GroupId(3))));
    assert!(matches!(
        engine.put(&w, scope(0), b"b", b"v:b", 0),
        Err(StrataError::GroupUnavailable(_))
    ));

    engine.defragment(GROUP, &CancellationToken::new())?;
    assert_eq!(engine.get(&w, scope(0), b"a")?.map(|r| r.value), Some(b"v:a".to_vec()));
    Ok(())
}

#[test]
fn unanswerable_recovery_request_keeps_the_node_serving() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let engine = open(&dir)?;
    let w = engine.worker("test");
    // A standalone node cannot send the answer; the requester is gone.
    engine.on_recovery_message(
        NodeId(7),
        RecoveryMessage::TxStateRequest(TxStateRequest {
            transaction_ids: vec![TxId(1)],
        }),
    );
    engine.put(&w, scope(0), b"a", b"b", 0)?;
    assert_eq!(engine.get(&w, scope(0), b"a")?.map(|r| r.value), Some(b"b".to_vec()));
    Ok(())
}

#[test]
fn recovery_failure_stops_the_node() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let engine = open(&dir)?;
    let w = engine.worker("test");
    engine.on_recovery_payload(NodeId(7), "{not json");
    assert!(matches!(engine.put(&w, scope(0), b"a", b"b", 0), Err(StrataError::NodeStopped)));
    assert!(matches!(engine.get(&w, scope(0), b"a"), Err(StrataError::NodeStopped)));
    Ok(())
}

#[test]
fn failed_defragment_keeps_finished_copies_for_the_retry() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let engine = open(&dir)?;
    let w = engine.worker("test");
    for i in 0..50u32 {
        engine.put(&w, scope(i as u16 % 2), &key(i), format!("v:{i}").as_bytes(), 0)?;
    }
    let handle = engine.group(GROUP)?;
    let ghost = Link::new(PartitionId(1), PageIdx(9999), 1);
    {
        let guard = engine.checkpoint_read_lock(&w);
        handle.stores.read().index.insert(&guard, BY_VALUE, b"ghost", ghost)?;
    }

    let err = engine
        .defragment(GROUP, &CancellationToken::new())
        .expect_err("index entry without a row");
    assert!(matches!(err, StrataError::Corruption(_)));
    let gdir = files::group_dir(dir.path(), GROUP);
    for p in [PartitionId(0), PartitionId(1)] {
        assert!(files::defragmented_partition_file(&gdir, p).exists());
        assert!(files::mapping_file(&gdir, p).exists());
        assert!(!files::partition_tmp_file(&gdir, p).exists());
    }
    assert!(!files::index_tmp_file(&gdir).exists());
    assert!(!files::request_marker(&gdir).exists());
    assert!(!engine.is_frozen(GROUP)?);

    // Partition 1 changes after the failed run, so only its copy is redone.
    engine.put(&w, scope(1), b"late", b"v:late", 0)?;
    {
        let guard = engine.checkpoint_read_lock(&w);
        handle.stores.read().index.remove(&guard, BY_VALUE, b"ghost", ghost)?;
    }
    let report = engine.defragment(GROUP, &CancellationToken::new())?;
    assert_eq!(report.partitions_skipped, vec![0]);
    assert_eq!(report.partitions_processed, vec![1]);
    assert_eq!(report.index_entries, 51);
    assert!(!files::defragmented_partition_file(&gdir, PartitionId(0)).exists());
    assert_eq!(engine.get(&w, scope(1), b"late")?.map(|r| r.value), Some(b"v:late".to_vec()));
    for i in 0..50u32 {
        let found = engine.index_lookup(&w, GROUP, BY_VALUE, i.to_string().as_bytes())?;
        assert_eq!(found.len(), 1, "row {i}");
        assert_eq!(found[0].key, key(i));
    }
    Ok(())
}

#[test]
fn defragment_waits_out_a_running_visit() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let engine = open(&dir)?;
    let w = engine.worker("test");
    for i in 0..200u32 {
        engine.put(&w, scope(0), &key(i), b"v:x", 0)?;
    }
    let options = VisitOptions {
        relock_after: Duration::ZERO,
        cancel: None,
    };
    let (started, wait_start) = mpsc::channel();
    let (visit, report) = std::thread::scope(|s| {
        let defrag = s.spawn(|| {
            let wait_start = wait_start;
            let _ = wait_start.recv();
            engine.defragment(GROUP, &CancellationToken::new())
        });
        let mut seen = 0u32;
        let visit = engine.visit(&w, GROUP, PartitionId(0), &options, |_| {
            if seen == 0 {
                let _ = started.send(());
            }
            seen += 1;
            std::thread::sleep(Duration::from_millis(3));
            Ok(true)
        });
        (visit, defrag.join().expect("defrag thread"))
    });
    assert!(matches!(visit, Err(StrataError::GroupUnavailable(GroupId(3)))));
    assert_eq!(report?.rows_copied, 200);
    assert!(!engine.is_frozen(GROUP)?);

    let again = engine.visit(&w, GROUP, PartitionId(0), &options, |_| Ok(true))?;
    assert!(again.completed);
    assert_eq!(again.entries, 200);
    Ok(())
}

#[test]
fn oversized_index_key_is_rejected_before_logging() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let engine = open(&dir)?;
    let w = engine.worker("test");
    let mut value = b"v:".to_vec();
    value.extend(std::iter::repeat(b'z').take(600));
    let before = engine.stats()?.wal.records_appended;
    let err = engine.put(&w, scope(0), b"big", &value, 0).expect_err("too large");
    assert!(matches!(err, StrataError::KeyTooLarge { .. }));
    assert_eq!(engine.stats()?.wal.records_appended, before);
    assert!(engine.get(&w, scope(0), b"big")?.is_none());
    Ok(())
}

#[test]
fn stats_cover_every_group() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let engine = open(&dir)?;
    let w = engine.worker("test");
    engine.put(&w, scope(1), b"a", b"v:a", 0)?;
    let stats = engine.stats()?;
    assert_eq!(stats.groups.len(), 1);
    let group = &stats.groups[0];
    assert_eq!(group.name, "people");
    assert_eq!(group.partitions.len(), 2);
    assert_eq!(group.partitions[1].rows, 1);
    assert_eq!(group.indexes.iter().map(|d| d.name.as_str()).collect::<Vec<_>>(), vec!["by_value"]);
    assert!(stats.throttle.is_some());
    serde_json::to_string(&stats)?;
    Ok(())
}
