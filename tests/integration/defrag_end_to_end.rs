#![allow(missing_docs)]

use std::fs;
use std::ops::Bound;
use std::sync::Arc;
use std::thread;

use strata::checkpoint::CheckpointState;
use strata::defrag::files;
use strata::primitives::concurrency::CancellationToken;
use strata::types::{CacheId, GroupId, PartitionId};
use strata::{Engine, GroupSchema, Result, RowScope, Schema, StorageConfig, StrataError};
use tempfile::TempDir;

const ORDERS: GroupId = GroupId(10);
const OTHER: GroupId = GroupId(11);
const BY_STATUS: u16 = 1;
const PARTITIONS: u16 = 3;

fn config() -> StorageConfig {
    StorageConfig {
        page_size: 1024,
        region_pages: 2048,
        checkpoint_buffer_pages: 512,
        checkpoint_frequency_ms: 3_600_000,
        checkpoint_threads: 2,
        defrag_region_pages: 256,
        defrag_lock_hold_ms: 1,
        ..StorageConfig::default()
    }
}

fn status(_: CacheId, _: &[u8], value: &[u8]) -> Option<Vec<u8>> {
    value.split(|b| *b == b'|').next().map(<[u8]>::to_vec)
}

fn schema() -> Schema {
    Schema::new()
        .group(GroupSchema::new(ORDERS, "orders", PARTITIONS).index(BY_STATUS, "by_status", status))
        .group(GroupSchema::new(OTHER, "other", 1))
}

fn scope(group: GroupId, partition: u16) -> RowScope {
    RowScope::new(group, CacheId(1), PartitionId(partition))
}

fn order_key(i: u32) -> Vec<u8> {
    format!("order-{i:05}").into_bytes()
}

fn order_value(i: u32) -> Vec<u8> {
    let state = if i % 3 == 0 { "open" } else { "closed" };
    let mut v = format!("{state}|{i}|").into_bytes();
    v.resize(v.len() + 80, b'.');
    v
}

/// Writes 600 orders and removes two thirds of them, leaving sparse pages.
fn seed(dir: &TempDir) -> Result<()> {
    let engine = Engine::open(dir.path(), config(), schema())?;
    let w = engine.worker("seed");
    for i in 0..600 {
        engine.put(&w, scope(ORDERS, (i % PARTITIONS as u32) as u16), &order_key(i), &order_value(i), 0)?;
    }
    for i in (0..600).filter(|i| i % 3 != 0) {
        engine.remove(&w, scope(ORDERS, (i % PARTITIONS as u32) as u16), &order_key(i))?;
    }
    engine.put(&w, scope(OTHER, 0), b"untouched", b"yes", 0)?;
    engine.close()
}

fn assert_orders(engine: &Engine) -> Result<()> {
    let w = engine.worker("check");
    for i in 0..600 {
        let row = engine.get(&w, scope(ORDERS, (i % PARTITIONS as u32) as u16), &order_key(i))?;
        if i % 3 == 0 {
            assert_eq!(row.map(|r| r.value), Some(order_value(i)), "order {i}");
        } else {
            assert!(row.is_none(), "order {i} came back");
        }
    }
    assert_eq!(engine.index_lookup(&w, ORDERS, BY_STATUS, b"open")?.len(), 200);
    assert!(engine.index_lookup(&w, ORDERS, BY_STATUS, b"closed")?.is_empty());
    assert!(engine.get(&w, scope(OTHER, 0), b"untouched")?.is_some());
    Ok(())
}

#[test]
fn defragmented_group_survives_reopen() -> Result<()> {
    let dir = tempfile::tempdir()?;
    seed(&dir)?;

    let engine = Engine::open(dir.path(), config(), schema())?;
    let report = engine.defragment(ORDERS, &CancellationToken::new())?;
    assert_eq!(report.rows_copied, 200);
    assert_eq!(report.index_entries, 200);
    assert!(report.new_pages < report.old_pages);
    assert!(!engine.is_frozen(ORDERS)?);
    assert_orders(&engine)?;

    // The group takes writes again and the new rows reach the index.
    let w = engine.worker("after");
    engine.put(&w, scope(ORDERS, 1), b"order-late", b"open|late|", 0)?;
    assert_eq!(engine.index_lookup(&w, ORDERS, BY_STATUS, b"open")?.len(), 201);
    engine.remove(&w, scope(ORDERS, 1), b"order-late")?;
    drop(w);
    engine.close()?;

    let gdir = files::group_dir(dir.path(), ORDERS);
    assert!(!files::request_marker(&gdir).exists());
    assert!(!files::completed_marker(&gdir).exists());
    for partition in 0..PARTITIONS {
        assert!(!files::defragmented_partition_file(&gdir, PartitionId(partition)).exists());
        assert!(!files::mapping_file(&gdir, PartitionId(partition)).exists());
    }

    let engine = Engine::open(dir.path(), config(), schema())?;
    assert!(engine.recovery_report().frozen_groups.is_empty());
    assert_orders(&engine)?;
    engine.close()
}

#[test]
fn finished_copies_are_published_on_open() -> Result<()> {
    let dir = tempfile::tempdir()?;
    seed(&dir)?;

    // A run that crashed after the completion marker: every copy is on disk
    // but none was renamed into place yet.
    let gdir = files::group_dir(dir.path(), ORDERS);
    for partition in 0..PARTITIONS {
        let partition = PartitionId(partition);
        fs::copy(
            files::partition_file(&gdir, partition),
            files::defragmented_partition_file(&gdir, partition),
        )?;
    }
    fs::copy(files::index_file(&gdir), files::defragmented_index_file(&gdir))?;
    fs::write(files::request_marker(&gdir), b"")?;
    fs::write(files::completed_marker(&gdir), b"")?;

    let engine = Engine::open(dir.path(), config(), schema())?;
    assert!(!engine.is_frozen(ORDERS)?);
    assert!(!files::completed_marker(&gdir).exists());
    assert!(!files::defragmented_index_file(&gdir).exists());
    assert_orders(&engine)?;
    engine.close()
}

#[test]
fn frozen_group_rejects_rows_while_others_serve() -> Result<()> {
    let dir = tempfile::tempdir()?;
    seed(&dir)?;
    fs::write(files::request_marker(&files::group_dir(dir.path(), ORDERS)), b"")?;

    let engine = Arc::new(Engine::open(dir.path(), config(), schema())?);
    assert_eq!(engine.recovery_report().frozen_groups, vec![ORDERS.0]);
    let w = engine.worker("client");
    let err = engine.get(&w, scope(ORDERS, 0), &order_key(0)).unwrap_err();
    assert!(matches!(err, StrataError::GroupUnavailable(g) if g == ORDERS));
    assert!(engine.get(&w, scope(OTHER, 0), b"untouched")?.is_some());
    drop(w);

    // The pending request is resumed by the next defragment call, which may
    // run on any thread.
    let runner = Arc::clone(&engine);
    let report = thread::spawn(move || runner.defragment(ORDERS, &CancellationToken::new()))
        .join()
        .expect("defrag thread")?;
    assert_eq!(report.rows_copied, 200);
    assert!(!engine.is_frozen(ORDERS)?);
    assert_orders(&engine)?;

    let engine = Arc::try_unwrap(engine).map_err(|_| StrataError::Invalid("engine still shared"))?;
    engine.close()
}

#[test]
fn second_defragment_call_is_refused_while_one_runs() -> Result<()> {
    let dir = tempfile::tempdir()?;
    seed(&dir)?;
    let engine = Arc::new(Engine::open(dir.path(), config(), schema())?);

    let token = CancellationToken::new();
    let runs: Vec<_> = (0..2)
        .map(|_| {
            let engine = Arc::clone(&engine);
            let token = token.clone();
            thread::spawn(move || engine.defragment(ORDERS, &token))
        })
        .collect();
    let results: Vec<_> = runs.into_iter().map(|h| h.join().expect("defrag thread")).collect();

    // Either both ran one after the other, or the second was refused.
    let ok = results.iter().filter(|r| r.is_ok()).count();
    assert!(ok >= 1);
    for result in &results {
        if let Err(err) = result {
            assert!(matches!(err, StrataError::Invalid(_)), "{err}");
        }
    }
    assert!(!engine.is_frozen(ORDERS)?);
    assert_orders(&engine)
}

#[test]
fn full_partition_keeps_every_row_and_counter() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = StorageConfig {
        defrag_region_pages: 2048,
        region_pages: 4096,
        ..config()
    };
    let engine = Engine::open(dir.path(), config.clone(), schema())?;
    let w = engine.worker("load");
    for i in 0..10_000u32 {
        engine.put(&w, scope(OTHER, 0), &order_key(i), format!("value-{i}").as_bytes(), 0)?;
    }
    engine.force_checkpoint("loaded").wait(CheckpointState::Finished)?;
    let all = |engine: &Engine| engine.scan(&w, scope(OTHER, 0), Bound::Unbounded, Bound::Unbounded, None);
    let before = all(&engine)?;
    assert_eq!(before.len(), 10_000);
    let meta = engine.partition_meta(OTHER, PartitionId(0))?;

    let report = engine.defragment(OTHER, &CancellationToken::new())?;
    assert_eq!(report.rows_copied, 10_000);
    let after = all(&engine)?;
    assert_eq!(after, before);
    for (i, row) in after.iter().enumerate() {
        assert_eq!(row.value, format!("value-{i}").into_bytes());
    }
    let moved = engine.partition_meta(OTHER, PartitionId(0))?;
    assert_eq!(moved.counter_hwm, meta.counter_hwm);
    assert_eq!(moved.counter_lwm, meta.counter_lwm);
    assert_eq!(moved.row_count, 10_000);
    drop(w);
    engine.close()?;

    let engine = Engine::open(dir.path(), config, schema())?;
    let w = engine.worker("reopened");
    assert_eq!(engine.scan(&w, scope(OTHER, 0), Bound::Unbounded, Bound::Unbounded, None)?, before);
    assert_eq!(engine.partition_meta(OTHER, PartitionId(0))?.counter_hwm, meta.counter_hwm);
    drop(w);
    engine.close()
}
