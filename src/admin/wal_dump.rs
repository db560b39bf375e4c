use std::path::Path;

use serde::Serialize;

use crate::admin::{AdminError, Result};
use crate::engine;
use crate::primitives::wal::{DataOp, Wal, WalOptions, WalRecord};
use crate::types::WalPointer;

const KEY_PREVIEW: usize = 32;

/// One WAL record.
#[derive(Debug, Clone, Serialize)]
pub struct WalEntry {
    pub pointer: u64,
    pub kind: &'static str,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct WalDumpReport {
    pub path: String,
    pub from: Option<u64>,
    pub entries: Vec<WalEntry>,
    /// Set when a record failed to decode; the dump stops there.
    pub error: Option<String>,
}

/// Lists the records of the directory's WAL, starting at `from`.
///
/// Opening the log truncates a torn tail, as the engine would.
pub fn wal_dump(path: impl AsRef<Path>, from: Option<u64>, limit: Option<usize>) -> Result<WalDumpReport> {
    let wal_dir = engine::wal_dir(path.as_ref());
    if !wal_dir.is_dir() {
        return Err(AdminError::missing_database(path.as_ref()));
    }
    let wal = Wal::open(&wal_dir, WalOptions::default())?;
    let mut report = WalDumpReport {
        path: wal_dir.display().to_string(),
        from,
        entries: Vec::new(),
        error: None,
    };
    for item in wal.replay(from.map(WalPointer))? {
        if limit.is_some_and(|limit| report.entries.len() >= limit) {
            break;
        }
        match item {
            Ok((pointer, record)) => report.entries.push(WalEntry {
                pointer: pointer.0,
                kind: record.kind_name(),
                detail: describe(&record),
            }),
            Err(err) => {
                report.error = Some(err.to_string());
                break;
            }
        }
    }
    Ok(report)
}

fn describe(record: &WalRecord) -> String {
    match record {
        WalRecord::Data(rec) => {
            let key = &rec.key[..rec.key.len().min(KEY_PREVIEW)];
            let op = match rec.op {
                DataOp::Put => "put",
                DataOp::Remove => "remove",
            };
            let mut out = format!(
                "grp={} part={} cache={} {op} key={} counter={}",
                rec.group.0,
                rec.partition.0,
                rec.cache.0,
                hex::encode(key),
                rec.counter
            );
            if let Some(value) = &rec.value {
                out.push_str(&format!(" value_len={}", value.len()));
            }
            if rec.expire_at != 0 {
                out.push_str(&format!(" expire_at={}", rec.expire_at));
            }
            if let Some(tx) = rec.tx {
                out.push_str(&format!(" tx={tx}"));
            }
            if !rec.index_updates.is_empty() {
                out.push_str(&format!(" index_updates={}", rec.index_updates.len()));
            }
            out
        }
        WalRecord::Tx(rec) => {
            let nodes: Vec<String> = rec.participants.iter().map(|n| n.to_string()).collect();
            format!("tx={} state={:?} participants=[{}]", rec.tx, rec.state, nodes.join(","))
        }
        WalRecord::CheckpointBegin { id, txs } => format!("id={id} txs={}", txs.len()),
        WalRecord::CheckpointEnd { id } => format!("id={id}"),
        WalRecord::PageSnapshot { page, bytes } => format!("page={page} len={}", bytes.len()),
        WalRecord::CheckpointPagesLogged { id, pages } => format!("id={id} pages={pages}"),
    }
}
