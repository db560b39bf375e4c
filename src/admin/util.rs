use std::path::Path;

use crate::admin::error::{AdminError, Result};
use crate::config::StorageConfig;
use crate::engine::{self, Engine, Schema};

/// Opens an existing data directory with the groups found in it.
///
/// Index extractors are not known to admin tooling, so the returned engine
/// must not be used for row writes on indexed groups.
///
/// # Errors
///
/// Returns [`AdminError::MissingDatabase`] when `path` holds no WAL.
pub fn open_engine(path: &Path, config: &StorageConfig) -> Result<Engine> {
    if !engine::wal_dir(path).is_dir() {
        return Err(AdminError::missing_database(path));
    }
    let schema = Schema::discover(path)?;
    Ok(Engine::open(path, config.clone(), schema)?)
}
