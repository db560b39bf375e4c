#![allow(missing_docs)]

use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::Value;
use strata::types::{CacheId, GroupId, PartitionId};
use strata::{Engine, GroupSchema, RowScope, Schema, StorageConfig};
use tempfile::TempDir;

const GROUP: GroupId = GroupId(5);
const PAGE_SIZE: &str = "1024";

fn seed_config() -> StorageConfig {
    StorageConfig {
        page_size: 1024,
        region_pages: 256,
        checkpoint_buffer_pages: 64,
        checkpoint_threads: 1,
        ..StorageConfig::default()
    }
}

fn setup_db() -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("data");
    seed_demo(&path).expect("seed demo data");
    (dir, path)
}

fn seed_demo(path: &Path) -> strata::Result<()> {
    let schema = Schema::new().group(GroupSchema::new(GROUP, "demo", 2));
    let engine = Engine::open(path, seed_config(), schema)?;
    let w = engine.worker("seed");
    for i in 0..120u32 {
        let scope = RowScope::new(GROUP, CacheId(1), PartitionId((i % 2) as u16));
        engine.put(&w, scope, format!("user-{i:04}").as_bytes(), &[b'u'; 48], 0)?;
    }
    for i in (0..120u32).filter(|i| i % 4 != 0) {
        let scope = RowScope::new(GROUP, CacheId(1), PartitionId((i % 2) as u16));
        engine.remove(&w, scope, format!("user-{i:04}").as_bytes())?;
    }
    drop(w);
    engine.close()
}

fn run_json(args: &[&str], path: &Path) -> Value {
    let output = cargo_bin_cmd!("strata")
        .args(["--format", "json", "--page-size", PAGE_SIZE])
        .args(args)
        .arg(path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    serde_json::from_slice(&output).expect("json output")
}

#[test]
fn stats_reports_groups_and_files() {
    let (_tmp, path) = setup_db();
    let json = run_json(&["stats"], &path);

    assert_eq!(json["page_size"], 1024);
    let groups = json["engine"]["groups"].as_array().expect("groups array");
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0]["id"], GROUP.0);
    assert_eq!(groups[0]["frozen"], false);
    let rows: u64 = groups[0]["partitions"]
        .as_array()
        .expect("partitions array")
        .iter()
        .map(|p| p["rows"].as_u64().expect("row count"))
        .sum();
    assert_eq!(rows, 30);

    let fs_groups = json["filesystem"]["groups"].as_array().expect("fs groups");
    assert_eq!(fs_groups[0]["defrag_pending"], false);
    assert!(fs_groups[0]["files"].as_u64().expect("file count") >= 3);
    assert!(json["filesystem"]["wal_size_bytes"].as_u64().expect("wal size") > 0);
}

#[test]
fn checkpoint_reports_the_admin_reason() {
    let (_tmp, path) = setup_db();
    let json = run_json(&["checkpoint"], &path);
    assert_eq!(json["reason"], "admin");
    assert!(json["id"].as_u64().expect("checkpoint id") > 1);
    assert!(json["duration_ms"].as_f64().is_some());
}

#[test]
fn defrag_compacts_the_group() {
    let (_tmp, path) = setup_db();
    let json = run_json(&["defrag", "--group", "5"], &path);
    assert_eq!(json["group"], GROUP.0);
    assert_eq!(json["rows_copied"], 30);
    assert_eq!(json["partitions_processed"], serde_json::json!([0, 1]));
    assert!(json["new_pages"].as_u64() <= json["old_pages"].as_u64());

    // Data stays readable after the swap.
    let stats = run_json(&["stats"], &path);
    assert_eq!(stats["engine"]["groups"][0]["frozen"], false);
}

#[test]
fn defrag_of_unknown_group_fails() {
    let (_tmp, path) = setup_db();
    let assert = cargo_bin_cmd!("strata")
        .args(["--page-size", PAGE_SIZE, "defrag", "--group", "99"])
        .arg(&path)
        .assert()
        .failure();
    let stderr = String::from_utf8_lossy(&assert.get_output().stderr).to_string();
    assert!(stderr.contains("group 99 not found"), "{stderr}");
}

#[test]
fn wal_dump_lists_records_with_limit() {
    let (_tmp, path) = setup_db();
    let json = run_json(&["wal-dump", "--limit", "5"], &path);
    let entries = json["entries"].as_array().expect("entries");
    assert_eq!(entries.len(), 5);
    assert!(json["error"].is_null());
    assert!(entries.iter().any(|e| e["kind"] == "data"));

    let from = entries[2]["pointer"].as_u64().expect("pointer");
    let tail = run_json(&["wal-dump", "--limit", "1", "--from", &from.to_string()], &path);
    assert_eq!(tail["entries"][0]["pointer"], from);
    assert_eq!(tail["from"], from);
}

#[test]
fn wal_dump_text_output_counts_records() {
    let (_tmp, path) = setup_db();
    let assert = cargo_bin_cmd!("strata")
        .args(["wal-dump", "--limit", "3"])
        .arg(&path)
        .assert()
        .success();
    let stdout = String::from_utf8_lossy(&assert.get_output().stdout).to_string();
    assert!(stdout.contains("3 records"), "{stdout}");
}

#[test]
fn config_file_is_read_from_the_environment() {
    let (tmp, path) = setup_db();
    let config = tmp.path().join("strata.toml");
    fs::write(&config, "page_size = 1024\nregion_pages = 128\ncheckpoint_buffer_pages = 32\n").expect("write config");
    let output = cargo_bin_cmd!("strata")
        .env("STRATA_CONFIG", &config)
        .args(["--format", "json", "stats"])
        .arg(&path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json: Value = serde_json::from_slice(&output).expect("json output");
    assert_eq!(json["engine"]["region"]["capacity"], 128);

    fs::write(&config, "page_size = 1000\n").expect("write config");
    cargo_bin_cmd!("strata")
        .env("STRATA_CONFIG", &config)
        .args(["stats"])
        .arg(&path)
        .assert()
        .failure();
}

#[test]
fn missing_directory_is_an_error() {
    let tmp = TempDir::new().expect("tempdir");
    let missing = tmp.path().join("nope");
    let assert = cargo_bin_cmd!("strata").args(["stats"]).arg(&missing).assert().failure();
    let stderr = String::from_utf8_lossy(&assert.get_output().stderr).to_string();
    assert!(stderr.contains("data directory not found"), "{stderr}");
    assert!(!missing.exists());
}
