#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::ops::Bound;

use proptest::prelude::*;
use strata::checkpoint::CheckpointState;
use strata::types::{CacheId, GroupId, PartitionId};
use strata::{Engine, GroupSchema, RowScope, Schema, StorageConfig};
use tempfile::TempDir;

const GROUP: GroupId = GroupId(1);
const PARTITIONS: u16 = 2;

#[derive(Clone, Debug)]
enum Op {
    Put { partition: u16, key: u8, len: usize },
    Remove { partition: u16, key: u8 },
    Checkpoint,
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        6 => (0..PARTITIONS, any::<u8>(), 0usize..300).prop_map(|(partition, key, len)| Op::Put { partition, key, len }),
        3 => (0..PARTITIONS, any::<u8>()).prop_map(|(partition, key)| Op::Remove { partition, key }),
        1 => Just(Op::Checkpoint),
    ]
}

fn config() -> StorageConfig {
    StorageConfig {
        page_size: 1024,
        region_pages: 512,
        checkpoint_buffer_pages: 128,
        checkpoint_frequency_ms: 3_600_000,
        checkpoint_threads: 2,
        ..StorageConfig::default()
    }
}

fn schema() -> Schema {
    Schema::new().group(GroupSchema::new(GROUP, "durable", PARTITIONS))
}

fn scope(partition: u16) -> RowScope {
    RowScope::new(GROUP, CacheId(1), PartitionId(partition))
}

fn key(k: u8) -> Vec<u8> {
    format!("key-{k:03}").into_bytes()
}

fn value(k: u8, step: usize, len: usize) -> Vec<u8> {
    let mut v = format!("{k}:{step}:").into_bytes();
    v.resize(v.len() + len, k);
    v
}

type Model = BTreeMap<(u16, Vec<u8>), Vec<u8>>;

fn run(dir: &TempDir, ops: &[Op]) -> strata::Result<Model> {
    let engine = Engine::open(dir.path(), config(), schema())?;
    let w = engine.worker("writer");
    let mut model = Model::new();
    for (step, op) in ops.iter().enumerate() {
        match op {
            Op::Put { partition, key: k, len } => {
                let v = value(*k, step, *len);
                engine.put(&w, scope(*partition), &key(*k), &v, 0)?;
                model.insert((*partition, key(*k)), v);
            }
            Op::Remove { partition, key: k } => {
                let removed = engine.remove(&w, scope(*partition), &key(*k))?;
                assert_eq!(removed.is_some(), model.remove(&(*partition, key(*k))).is_some());
            }
            Op::Checkpoint => {
                engine.force_checkpoint("test").wait(CheckpointState::Finished)?;
            }
        }
    }
    // Dropped without a closing checkpoint; reopening must replay the tail.
    drop(w);
    drop(engine);
    Ok(model)
}

fn contents(engine: &Engine) -> strata::Result<Model> {
    let w = engine.worker("reader");
    let mut found = Model::new();
    for partition in 0..PARTITIONS {
        for row in engine.scan(&w, scope(partition), Bound::Unbounded, Bound::Unbounded, None)? {
            found.insert((partition, row.key), row.value);
        }
    }
    Ok(found)
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 16, ..ProptestConfig::default() })]

    #[test]
    fn reopened_engine_matches_the_model(ops in prop::collection::vec(arb_op(), 1..120)) {
        let dir = tempfile::tempdir()?;
        let model = run(&dir, &ops)?;

        let engine = Engine::open(dir.path(), config(), schema())?;
        prop_assert_eq!(contents(&engine)?, model.clone());
        for partition in 0..PARTITIONS {
            let meta = engine.partition_meta(GROUP, PartitionId(partition))?;
            let expected = model.keys().filter(|(p, _)| *p == partition).count() as u64;
            prop_assert_eq!(meta.row_count, expected);
        }
        engine.close()?;

        // A second open starts from the recovery checkpoint and replays nothing.
        let engine = Engine::open(dir.path(), config(), schema())?;
        prop_assert_eq!(engine.recovery_report().records_replayed, 0);
        prop_assert_eq!(contents(&engine)?, model);
        engine.close()?;
    }
}

#[test]
fn counters_survive_a_crash() -> strata::Result<()> {
    let dir = tempfile::tempdir()?;
    {
        let engine = Engine::open(dir.path(), config(), schema())?;
        let w = engine.worker("writer");
        for k in 0..30u8 {
            engine.put(&w, scope(0), &key(k), b"x", 0)?;
        }
        engine.force_checkpoint("mid").wait(CheckpointState::Finished)?;
        for k in 0..10u8 {
            engine.remove(&w, scope(0), &key(k))?;
        }
    }
    let engine = Engine::open(dir.path(), config(), schema())?;
    let meta = engine.partition_meta(GROUP, PartitionId(0))?;
    assert_eq!(meta.row_count, 20);
    assert_eq!(meta.counter_hwm, 40);
    assert_eq!(meta.counter_lwm, 40);
    engine.close()
}
