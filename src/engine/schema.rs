use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use crate::primitives::wal::DataOp;
use crate::types::{CacheId, GroupId, PartitionId, Result, StrataError, TxId};

/// Derives a secondary index key from a row.
///
/// Returning `None` leaves the row out of the index.
pub trait IndexKeyExtractor: Send + Sync {
    fn extract(&self, cache: CacheId, key: &[u8], value: &[u8]) -> Option<Vec<u8>>;
}

impl<F> IndexKeyExtractor for F
where
    F: Fn(CacheId, &[u8], &[u8]) -> Option<Vec<u8>> + Send + Sync,
{
    fn extract(&self, cache: CacheId, key: &[u8], value: &[u8]) -> Option<Vec<u8>> {
        self(cache, key, value)
    }
}

/// Secondary index of a group.
#[derive(Clone)]
pub struct IndexSchema {
    pub id: u16,
    pub name: String,
    pub extractor: Arc<dyn IndexKeyExtractor>,
}

impl fmt::Debug for IndexSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexSchema")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// A cache group: a fixed set of partitions plus one index partition.
#[derive(Clone, Debug)]
pub struct GroupSchema {
    pub id: GroupId,
    pub name: String,
    /// Number of data partitions, numbered from zero.
    pub partitions: u16,
    pub indexes: Vec<IndexSchema>,
}

impl GroupSchema {
    pub fn new(id: GroupId, name: impl Into<String>, partitions: u16) -> Self {
        Self {
            id,
            name: name.into(),
            partitions,
            indexes: Vec::new(),
        }
    }

    /// Adds a secondary index maintained on every row mutation.
    pub fn index(mut self, id: u16, name: impl Into<String>, extractor: impl IndexKeyExtractor + 'static) -> Self {
        self.indexes.push(IndexSchema {
            id,
            name: name.into(),
            extractor: Arc::new(extractor),
        });
        self
    }

    pub fn partition_ids(&self) -> Vec<PartitionId> {
        (0..self.partitions).map(PartitionId).collect()
    }
}

/// Every group an engine serves.
#[derive(Clone, Debug, Default)]
pub struct Schema {
    groups: BTreeMap<GroupId, GroupSchema>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn group(mut self, group: GroupSchema) -> Self {
        self.groups.insert(group.id, group);
        self
    }

    pub fn groups(&self) -> impl Iterator<Item = &GroupSchema> {
        self.groups.values()
    }

    pub fn get(&self, id: GroupId) -> Option<&GroupSchema> {
        self.groups.get(&id)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        for group in self.groups.values() {
            if group.partitions == 0 || group.partitions == PartitionId::INDEX.0 {
                return Err(StrataError::Invalid("group partition count out of range"));
            }
            let mut ids: Vec<u16> = group.indexes.iter().map(|i| i.id).collect();
            ids.sort_unstable();
            ids.dedup();
            if ids.len() != group.indexes.len() {
                return Err(StrataError::Invalid("duplicate index id in group"));
            }
        }
        Ok(())
    }

    /// Rebuilds the group layout found under `dir`, without index extractors.
    ///
    /// Admin tooling uses this to open a data directory it did not create.
    pub fn discover(dir: &Path) -> Result<Self> {
        let mut schema = Schema::new();
        if !dir.exists() {
            return Ok(schema);
        }
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(|n| n.strip_prefix("grp-")).and_then(|n| n.parse().ok()) else {
                continue;
            };
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let mut partitions = 0u16;
            for file in fs::read_dir(entry.path())? {
                let file = file?.file_name();
                let count = file
                    .to_str()
                    .and_then(|n| n.strip_prefix("part-"))
                    .and_then(|n| n.strip_suffix(".bin"))
                    .and_then(|n| n.parse::<u16>().ok())
                    .map(|n| n + 1);
                if let Some(count) = count {
                    partitions = partitions.max(count);
                }
            }
            if partitions > 0 {
                schema = schema.group(GroupSchema::new(GroupId(id), format!("grp-{id}"), partitions));
            }
        }
        Ok(schema)
    }
}

/// Addresses the rows of one cache inside one partition.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct RowScope {
    pub group: GroupId,
    pub cache: CacheId,
    pub partition: PartitionId,
}

impl RowScope {
    pub const fn new(group: GroupId, cache: CacheId, partition: PartitionId) -> Self {
        Self {
            group,
            cache,
            partition,
        }
    }
}

/// A row mutation as submitted by a collaborator.
///
/// `counter` carries an update counter assigned elsewhere (for example by a
/// primary copy); the partition assigns the next one when it is absent.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RowOperation {
    pub scope: RowScope,
    pub key: Vec<u8>,
    pub op: DataOp,
    pub value: Option<Vec<u8>>,
    pub expire_at: u64,
    pub counter: Option<u64>,
    pub tx: Option<TxId>,
}

impl RowOperation {
    pub fn put(scope: RowScope, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            scope,
            key: key.into(),
            op: DataOp::Put,
            value: Some(value.into()),
            expire_at: 0,
            counter: None,
            tx: None,
        }
    }

    pub fn remove(scope: RowScope, key: impl Into<Vec<u8>>) -> Self {
        Self {
            scope,
            key: key.into(),
            op: DataOp::Remove,
            value: None,
            expire_at: 0,
            counter: None,
            tx: None,
        }
    }

    /// Expiry time in milliseconds; 0 never expires.
    pub fn expire_at(mut self, expire_at: u64) -> Self {
        self.expire_at = expire_at;
        self
    }

    pub fn counter(mut self, counter: u64) -> Self {
        self.counter = Some(counter);
        self
    }

    pub fn tx(mut self, tx: TxId) -> Self {
        self.tx = Some(tx);
        self
    }
}
