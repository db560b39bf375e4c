use std::path::Path;

use crate::admin::util::open_engine;
use crate::admin::{AdminError, Result};
use crate::config::StorageConfig;
use crate::defrag::DefragReport;
use crate::primitives::concurrency::CancellationToken;
use crate::types::GroupId;

/// Opens the directory, defragments `group` and closes it again.
///
/// # Errors
///
/// Returns an error when the group does not exist or defragmentation fails;
/// an interrupted run resumes on the next call.
pub fn defrag(path: impl AsRef<Path>, config: &StorageConfig, group: GroupId) -> Result<DefragReport> {
    let engine = open_engine(path.as_ref(), config)?;
    if engine.is_frozen(group).is_err() {
        return Err(AdminError::Message(format!("group {} not found", group.0)));
    }
    let report = engine.defragment(group, &CancellationToken::new())?;
    engine.close()?;
    Ok(report)
}
