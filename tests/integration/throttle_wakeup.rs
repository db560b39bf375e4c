#![allow(missing_docs)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use strata::checkpoint::{CheckpointState, SpeedBasedThrottle, WriteProgress};
use strata::primitives::pager::{DirtyThrottle, RegionCounters};
use strata::types::{CacheId, GroupId, PartitionId};
use strata::{Engine, GroupSchema, Result, RowScope, Schema, StorageConfig};

const PARKERS: usize = 4;

fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn finished_checkpoint_wakes_parked_writers() {
    let counters = Arc::new(RegionCounters::default());
    counters.set(0, 10_000, 0, 100);
    let progress = WriteProgress::new();
    let throttle = SpeedBasedThrottle::new("wakeup", counters, Arc::clone(&progress));
    throttle.on_begin_checkpoint();
    progress.begin(1_000);

    let started = Instant::now();
    let parked: Vec<_> = (0..PARKERS)
        .map(|_| {
            let throttle = Arc::clone(&throttle);
            thread::spawn(move || throttle.park(Duration::from_secs(60)))
        })
        .collect();
    wait_for("parked writers", || throttle.parked_threads() == PARKERS);

    progress.finish();
    throttle.on_finish_checkpoint();
    for handle in parked {
        handle.join().expect("parked thread");
    }
    assert!(started.elapsed() < Duration::from_secs(30));
    assert_eq!(throttle.parked_threads(), 0);
}

#[test]
fn park_after_the_wakeup_runs_its_full_time() {
    let throttle = SpeedBasedThrottle::new("late", Arc::new(RegionCounters::default()), WriteProgress::new());
    throttle.on_finish_checkpoint();
    let started = Instant::now();
    throttle.park(Duration::from_millis(50));
    assert!(started.elapsed() >= Duration::from_millis(50));
}

#[test]
fn backoff_parks_end_with_the_checkpoint() {
    // Checkpoint buffer nearly full: every mark of a page still owed to the
    // checkpoint backs off.
    let counters = Arc::new(RegionCounters::default());
    counters.set(100, 10_000, 95, 100);
    let progress = WriteProgress::new();
    let throttle = SpeedBasedThrottle::new("backoff", counters, Arc::clone(&progress));
    throttle.on_begin_checkpoint();
    progress.begin(1_000);

    let writers: Vec<_> = (0..PARKERS)
        .map(|_| {
            let throttle = Arc::clone(&throttle);
            let progress = Arc::clone(&progress);
            thread::spawn(move || {
                let mut marks = 0u64;
                while progress.is_running() {
                    throttle.on_mark_dirty(true);
                    marks += 1;
                }
                marks
            })
        })
        .collect();
    wait_for("backoff parks", || throttle.stats().parks > 50);

    progress.finish();
    let marks: u64 = writers.into_iter().map(|h| h.join().expect("writer thread")).sum();
    assert!(marks > 0);
    assert!(throttle.stats().backoff_step > 0);
    throttle.on_finish_checkpoint();
    assert_eq!(throttle.stats().backoff_step, 0);

    // Outside a checkpoint marks never park.
    let parks = throttle.stats().parks;
    for _ in 0..100 {
        throttle.on_mark_dirty(true);
    }
    assert_eq!(throttle.stats().parks, parks);
}

#[test]
fn engine_writers_finish_across_checkpoints() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = StorageConfig {
        page_size: 1024,
        region_pages: 512,
        checkpoint_buffer_pages: 32,
        checkpoint_frequency_ms: 3_600_000,
        checkpoint_threads: 1,
        throttle_enabled: true,
        ..StorageConfig::default()
    };
    let group = GroupId(2);
    let engine = Arc::new(Engine::open(
        dir.path(),
        config,
        Schema::new().group(GroupSchema::new(group, "hot", 4)),
    )?);

    let writers: Vec<_> = (0..PARKERS as u16)
        .map(|partition| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || -> Result<()> {
                let w = engine.worker(format!("writer-{partition}"));
                let scope = RowScope::new(group, CacheId(1), PartitionId(partition));
                for i in 0..400u32 {
                    engine.put(&w, scope, format!("k{i:05}").as_bytes(), &[b'w'; 64], 0)?;
                }
                Ok(())
            })
        })
        .collect();
    for round in 0..5 {
        engine
            .force_checkpoint(&format!("round-{round}"))
            .wait(CheckpointState::Finished)?;
    }
    for handle in writers {
        handle.join().expect("writer thread")?;
    }

    let stats = engine.stats()?;
    let throttle = stats.throttle.expect("throttle enabled");
    assert_eq!(throttle.parked_threads, 0);
    let rows: u64 = stats.groups[0].partitions.iter().map(|p| p.rows).sum();
    assert_eq!(rows, 1_600);
    Ok(())
}
