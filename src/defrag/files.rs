//! File names inside a group directory and the renames that publish a
//! defragmented group.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::primitives::io;
use crate::types::{GroupId, PartitionId, Result};

/// Directory of `group` under the data directory.
pub fn group_dir(data_dir: &Path, group: GroupId) -> PathBuf {
    data_dir.join(format!("grp-{}", group.0))
}

/// Live store of a data partition.
pub fn partition_file(dir: &Path, partition: PartitionId) -> PathBuf {
    dir.join(format!("part-{}.bin", partition.0))
}

/// Live store of the index partition.
pub fn index_file(dir: &Path) -> PathBuf {
    dir.join("index.bin")
}

/// Partition copy being written.
pub fn partition_tmp_file(dir: &Path, partition: PartitionId) -> PathBuf {
    dir.join(format!("part-{}.bin.tmp", partition.0))
}

/// Old-link to new-link map of a partition copy.
pub fn mapping_file(dir: &Path, partition: PartitionId) -> PathBuf {
    dir.join(format!("part-{}.mapping.tmp", partition.0))
}

/// Finished partition copy waiting for the batch rename.
pub fn defragmented_partition_file(dir: &Path, partition: PartitionId) -> PathBuf {
    dir.join(format!("part-{}.dfrg.bin", partition.0))
}

/// Index partition copy being written.
pub fn index_tmp_file(dir: &Path) -> PathBuf {
    dir.join("index.bin.tmp")
}

/// Finished index copy waiting for the batch rename.
pub fn defragmented_index_file(dir: &Path) -> PathBuf {
    dir.join("index.dfrg.bin")
}

/// Persisted defragmentation request; the group stays frozen while it exists.
pub fn request_marker(dir: &Path) -> PathBuf {
    dir.join("defrag.request")
}

/// Written once every copy of the group is finished.
pub fn completed_marker(dir: &Path) -> PathBuf {
    dir.join("defrag.completed")
}

/// Moves a finished copy into place, syncing the directory.
pub(crate) fn rename(from: &Path, to: &Path) -> Result<()> {
    fs::rename(from, to)?;
    if let Some(parent) = to.parent() {
        io::sync_dir(parent)?;
    }
    debug!(from = %from.display(), to = %to.display(), "defrag.rename");
    Ok(())
}

/// Replaces the live stores with every finished copy. Safe to repeat.
pub fn batch_rename(dir: &Path, partitions: &[PartitionId]) -> Result<usize> {
    let mut renamed = 0;
    for partition in partitions {
        let copy = defragmented_partition_file(dir, *partition);
        if copy.exists() {
            rename(&copy, &partition_file(dir, *partition))?;
            renamed += 1;
        }
    }
    let index = defragmented_index_file(dir);
    if index.exists() {
        rename(&index, &index_file(dir))?;
        renamed += 1;
    }
    info!(dir = %dir.display(), renamed, "defrag.batch_rename");
    Ok(renamed)
}

/// Deletes working files and both markers. The request goes first so that a
/// crash in between leaves only the completion marker behind.
pub fn cleanup(dir: &Path, partitions: &[PartitionId]) -> Result<()> {
    for partition in partitions {
        io::remove_if_exists(&partition_tmp_file(dir, *partition))?;
        io::remove_if_exists(&mapping_file(dir, *partition))?;
        io::remove_if_exists(&defragmented_partition_file(dir, *partition))?;
    }
    io::remove_if_exists(&index_tmp_file(dir))?;
    io::remove_if_exists(&defragmented_index_file(dir))?;
    io::remove_if_exists(&request_marker(dir))?;
    io::remove_if_exists(&completed_marker(dir))?;
    io::sync_dir(dir)
}

/// Removes what an aborted run left half written, and the request marker.
/// Finished partition copies stay, with their link maps, so that the next run
/// can reuse the ones still matching their live partition.
pub fn abort(dir: &Path, partitions: &[PartitionId]) -> Result<()> {
    for partition in partitions {
        io::remove_if_exists(&partition_tmp_file(dir, *partition))?;
        if !defragmented_partition_file(dir, *partition).exists() {
            io::remove_if_exists(&mapping_file(dir, *partition))?;
        }
    }
    io::remove_if_exists(&index_tmp_file(dir))?;
    io::remove_if_exists(&defragmented_index_file(dir))?;
    io::remove_if_exists(&request_marker(dir))?;
    io::sync_dir(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_follow_the_group_layout() {
        let dir = group_dir(Path::new("/data"), GroupId(7));
        assert_eq!(dir, PathBuf::from("/data/grp-7"));
        let p = PartitionId(3);
        assert!(partition_file(&dir, p).ends_with("part-3.bin"));
        assert!(partition_tmp_file(&dir, p).ends_with("part-3.bin.tmp"));
        assert!(mapping_file(&dir, p).ends_with("part-3.mapping.tmp"));
        assert!(defragmented_partition_file(&dir, p).ends_with("part-3.dfrg.bin"));
        assert!(index_tmp_file(&dir).ends_with("index.bin.tmp"));
        assert!(defragmented_index_file(&dir).ends_with("index.dfrg.bin"));
    }

    #[test]
    fn batch_rename_is_repeatable() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let dir = tmp.path();
        let parts = [PartitionId(0), PartitionId(1)];
        fs::write(partition_file(dir, parts[0]), b"old-0")?;
        fs::write(partition_file(dir, parts[1]), b"old-1")?;
        fs::write(defragmented_partition_file(dir, parts[0]), b"new-0")?;
        fs::write(defragmented_index_file(dir), b"new-index")?;
        fs::write(completed_marker(dir), b"")?;

        assert_eq!(batch_rename(dir, &parts)?, 2);
        assert_eq!(batch_rename(dir, &parts)?, 0);
        assert_eq!(fs::read(partition_file(dir, parts[0]))?, b"new-0");
        assert_eq!(fs::read(partition_file(dir, parts[1]))?, b"old-1");
        assert_eq!(fs::read(index_file(dir))?, b"new-index");

        cleanup(dir, &parts)?;
        assert!(!completed_marker(dir).exists());
        assert!(partition_file(dir, parts[1]).exists());
        Ok(())
    }

    #[test]
    fn abort_keeps_finished_copies() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let dir = tmp.path();
        let parts = [PartitionId(0), PartitionId(1)];
        fs::write(defragmented_partition_file(dir, parts[0]), b"done")?;
        fs::write(mapping_file(dir, parts[0]), b"map-0")?;
        fs::write(partition_tmp_file(dir, parts[1]), b"half")?;
        fs::write(mapping_file(dir, parts[1]), b"map-1")?;
        fs::write(index_tmp_file(dir), b"index")?;
        fs::write(request_marker(dir), b"")?;

        abort(dir, &parts)?;
        assert!(defragmented_partition_file(dir, parts[0]).exists());
        assert!(mapping_file(dir, parts[0]).exists());
        assert!(!partition_tmp_file(dir, parts[1]).exists());
        assert!(!mapping_file(dir, parts[1]).exists());
        assert!(!index_tmp_file(dir).exists());
        assert!(!request_marker(dir).exists());
        Ok(())
    }
}
