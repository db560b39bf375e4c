#![allow(missing_docs)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use strata::checkpoint::CheckpointState;
use strata::primitives::concurrency::CancellationToken;
use strata::storage::VisitOptions;
use strata::types::{CacheId, GroupId, PartitionId};
use strata::{Engine, GroupSchema, Result, RowScope, Schema, StorageConfig, StrataError};
use tempfile::TempDir;

const GROUP: GroupId = GroupId(4);
const ROWS: u32 = 2_000;

fn scope() -> RowScope {
    RowScope::new(GROUP, CacheId(1), PartitionId(0))
}

fn key(i: u32) -> Vec<u8> {
    format!("visit-{i:06}").into_bytes()
}

fn loaded(dir: &TempDir) -> Result<Arc<Engine>> {
    let config = StorageConfig {
        page_size: 1024,
        region_pages: 4096,
        checkpoint_buffer_pages: 1024,
        checkpoint_frequency_ms: 3_600_000,
        checkpoint_threads: 2,
        ..StorageConfig::default()
    };
    let engine = Engine::open(dir.path(), config, Schema::new().group(GroupSchema::new(GROUP, "visited", 1)))?;
    let w = engine.worker("load");
    for i in 0..ROWS {
        engine.put(&w, scope(), &key(i), &[b'r'; 40], 0)?;
    }
    drop(w);
    Ok(Arc::new(engine))
}

fn options(cancel: Option<CancellationToken>) -> VisitOptions {
    VisitOptions {
        relock_after: Duration::from_millis(1),
        cancel,
    }
}

#[test]
fn checkpoint_completes_while_a_visit_runs() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let engine = loaded(&dir)?;
    let w = engine.worker("visitor");

    let (tx, rx) = mpsc::channel();
    let mut requester = None;
    let mut finished_at = None;
    let mut seen = 0u32;
    let summary = engine.visit(&w, GROUP, PartitionId(0), &options(None), |_| {
        seen += 1;
        if requester.is_none() {
            let engine = Arc::clone(&engine);
            let tx = tx.clone();
            requester = Some(thread::spawn(move || {
                let info = engine.force_checkpoint("during-visit").wait(CheckpointState::Finished);
                let _ = tx.send(info);
            }));
        }
        if finished_at.is_none() {
            if let Ok(info) = rx.recv_timeout(Duration::from_millis(2)) {
                info?;
                finished_at = Some(seen);
            }
        }
        Ok(true)
    })?;

    assert!(summary.completed);
    assert_eq!(summary.entries, u64::from(ROWS));
    assert_eq!(seen, ROWS);
    assert!(summary.relocks >= 1, "visit never released the checkpoint lock");
    let at = finished_at.expect("checkpoint did not finish during the visit");
    assert!(at < ROWS);
    if let Some(handle) = requester {
        handle.join().expect("requester thread");
    }
    Ok(())
}

#[test]
fn concurrent_writes_do_not_break_the_visit() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let engine = loaded(&dir)?;
    let stop = Arc::new(AtomicBool::new(false));
    let writer = {
        let engine = Arc::clone(&engine);
        let stop = Arc::clone(&stop);
        thread::spawn(move || -> Result<u32> {
            let w = engine.worker("writer");
            let mut written = 0;
            while !stop.load(Ordering::Relaxed) && written < 1_000 {
                engine.put(&w, scope(), format!("late-{written:05}").as_bytes(), b"new", 0)?;
                written += 1;
            }
            Ok(written)
        })
    };

    let w = engine.worker("visitor");
    let mut previous: Option<Vec<u8>> = None;
    let summary = engine.visit(&w, GROUP, PartitionId(0), &options(None), |row| {
        if let Some(prev) = &previous {
            assert!(prev < &row.key, "visit went backwards");
        }
        previous = Some(row.key.clone());
        thread::sleep(Duration::from_micros(20));
        Ok(true)
    })?;
    stop.store(true, Ordering::Relaxed);
    let written = writer.join().expect("writer thread")?;

    assert!(summary.completed);
    assert!(summary.entries >= u64::from(ROWS));
    assert!(summary.entries <= u64::from(ROWS + written));
    Ok(())
}

#[test]
fn cancelled_visit_stops_at_a_boundary() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let engine = loaded(&dir)?;
    let w = engine.worker("visitor");
    let token = CancellationToken::new();
    let mut seen = 0u32;
    let result = engine.visit(&w, GROUP, PartitionId(0), &options(Some(token.clone())), |_| {
        seen += 1;
        if seen == 10 {
            token.cancel();
        }
        Ok(true)
    });
    assert!(matches!(result, Err(StrataError::Cancelled)));
    assert!(seen < ROWS);

    // A visitor returning false ends the traversal cleanly.
    let summary = engine.visit(&w, GROUP, PartitionId(0), &options(None), |_| Ok(false))?;
    assert!(!summary.completed);
    assert_eq!(summary.entries, 1);
    Ok(())
}
