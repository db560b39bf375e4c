use std::path::Path;
use std::time::Instant;

use serde::Serialize;

use crate::admin::util::open_engine;
use crate::admin::Result;
use crate::checkpoint::CheckpointState;
use crate::config::StorageConfig;

/// Report generated after a forced checkpoint.
#[derive(Debug, Clone, Serialize)]
pub struct CheckpointReport {
    pub id: u64,
    pub reason: String,
    /// Pages written by the checkpoint.
    pub pages: u64,
    /// WAL pointer of the checkpoint's begin record.
    pub begin: u64,
    /// Duration of the checkpoint in milliseconds.
    pub duration_ms: f64,
}

/// Opens the directory, forces a checkpoint and closes it again.
///
/// # Errors
///
/// Returns an error if the directory cannot be opened or the checkpoint fails.
pub fn checkpoint(path: impl AsRef<Path>, config: &StorageConfig) -> Result<CheckpointReport> {
    let engine = open_engine(path.as_ref(), config)?;
    let start = Instant::now();
    let info = engine.force_checkpoint("admin").wait(CheckpointState::Finished)?;
    let elapsed = start.elapsed();
    engine.close()?;
    Ok(CheckpointReport {
        id: info.id,
        reason: info.reason,
        pages: info.pages,
        begin: info.begin.0,
        duration_ms: elapsed.as_secs_f64() * 1_000.0,
    })
}
