use std::fs;
use std::path::Path;

use serde::Serialize;

use crate::admin::util::open_engine;
use crate::admin::Result;
use crate::config::StorageConfig;
use crate::defrag::files;
use crate::engine::{self, EngineStats};
use crate::primitives::wal;
use crate::types::GroupId;

#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    pub page_size: u32,
    pub engine: EngineStats,
    pub filesystem: FilesystemStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct FilesystemStats {
    pub data_dir: String,
    pub wal_path: String,
    pub wal_size_bytes: u64,
    pub groups: Vec<GroupFiles>,
}

/// Files of one group directory.
#[derive(Debug, Clone, Serialize)]
pub struct GroupFiles {
    pub dir: String,
    pub files: usize,
    pub size_bytes: u64,
    /// A defragmentation request is pending.
    pub defrag_pending: bool,
}

pub fn stats(path: impl AsRef<Path>, config: &StorageConfig) -> Result<StatsReport> {
    let path = path.as_ref();
    let engine = open_engine(path, config)?;
    let engine_stats = engine.stats()?;
    engine.close()?;

    let wal_dir = engine::wal_dir(path);
    let wal_size = wal::disk_usage(&wal_dir)?;
    let mut groups = Vec::new();
    for group in &engine_stats.groups {
        let dir = files::group_dir(path, GroupId(group.id));
        let mut files = 0;
        let mut size_bytes = 0;
        for entry in fs::read_dir(&dir)? {
            let meta = entry?.metadata()?;
            if meta.is_file() {
                files += 1;
                size_bytes += meta.len();
            }
        }
        groups.push(GroupFiles {
            defrag_pending: files::request_marker(&dir).exists(),
            dir: dir.display().to_string(),
            files,
            size_bytes,
        });
    }

    Ok(StatsReport {
        page_size: config.page_size,
        engine: engine_stats,
        filesystem: FilesystemStats {
            data_dir: path.display().to_string(),
            wal_path: wal_dir.display().to_string(),
            wal_size_bytes: wal_size,
            groups,
        },
    })
}
