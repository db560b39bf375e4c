#![forbid(unsafe_code)]

//! Group index partition: the secondary index catalog and one tree per index.
//!
//! Index entries are `index key || link` with an empty value, so several rows
//! may share an index key.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::info;

use crate::primitives::bytes::be;
use crate::primitives::concurrency::CheckpointReadGuard;
use crate::primitives::pager::PageMemory;
use crate::storage::btree::{BTree, PageAllocator, StoreAllocator};
use crate::types::page::{self, PageFlag, PAGE_HDR_LEN};
use crate::types::{FullPageId, GroupId, Link, PageIdx, PageIo, PageKind, PartitionId, Result, StrataError};

const CATALOG_COUNT: usize = PAGE_HDR_LEN;
const CATALOG_ENTRIES: usize = PAGE_HDR_LEN + 2;
const LINK_LEN: usize = 8;

/// Catalog entry of one secondary index.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct IndexDef {
    pub id: u16,
    pub name: String,
    /// Tree meta page inside the index partition.
    pub meta_page: u32,
}

/// Tree entry key for `index_key` pointing at `link`.
pub fn entry_key(index_key: &[u8], link: Link) -> Vec<u8> {
    let mut out = Vec::with_capacity(index_key.len() + LINK_LEN);
    out.extend_from_slice(index_key);
    out.extend_from_slice(&link.to_be_bytes());
    out
}

/// Splits a tree entry key into the index key and the row link.
pub fn split_entry(entry: &[u8]) -> Result<(&[u8], Link)> {
    if entry.len() < LINK_LEN {
        return Err(StrataError::Corruption("index entry shorter than a link"));
    }
    let (key, link) = entry.split_at(entry.len() - LINK_LEN);
    Ok((key, Link::from_be_slice(link)?))
}

fn encode_catalog(page: &mut [u8], defs: &[IndexDef]) -> Result<()> {
    let mut at = CATALOG_ENTRIES;
    for def in defs {
        let name = def.name.as_bytes();
        let name_len = u8::try_from(name.len()).map_err(|_| StrataError::Invalid("index name longer than 255 bytes"))?;
        if at + 7 + name.len() > page.len() {
            return Err(StrataError::Invalid("index catalog page is full"));
        }
        be::put_u16(page, at, def.id);
        be::put_u32(page, at + 2, def.meta_page);
        page[at + 6] = name_len;
        page[at + 7..at + 7 + name.len()].copy_from_slice(name);
        at += 7 + name.len();
    }
    be::put_u16(page, CATALOG_COUNT, defs.len() as u16);
    Ok(())
}

fn decode_catalog(page: &[u8]) -> Result<Vec<IndexDef>> {
    PageIo::expect(page, PageKind::IndexCatalog)?;
    let count = be::u16_at(page, CATALOG_COUNT) as usize;
    let mut at = CATALOG_ENTRIES;
    let mut defs = Vec::with_capacity(count);
    for _ in 0..count {
        let header = page
            .get(at..at + 7)
            .ok_or(StrataError::Corruption("index catalog entry outside page"))?;
        let name_len = header[6] as usize;
        let name = page
            .get(at + 7..at + 7 + name_len)
            .ok_or(StrataError::Corruption("index catalog name outside page"))?;
        defs.push(IndexDef {
            id: be::u16_at(page, at),
            meta_page: be::u32_at(page, at + 2),
            name: String::from_utf8(name.to_vec())
                .map_err(|_| StrataError::Corruption("index name is not utf-8"))?,
        });
        at += 7 + name_len;
    }
    Ok(defs)
}

/// Index partition of one group.
pub struct IndexStore {
    group: GroupId,
    memory: Arc<PageMemory>,
    trees: RwLock<BTreeMap<u16, (IndexDef, Arc<BTree>)>>,
}

impl IndexStore {
    fn catalog_page(group: GroupId) -> FullPageId {
        FullPageId::new(group, PartitionId::INDEX, PageIdx::META)
    }

    fn allocator(memory: &Arc<PageMemory>, group: GroupId) -> Arc<dyn PageAllocator> {
        StoreAllocator::new(Arc::clone(memory), group, PartitionId::INDEX, PageFlag::Index)
    }

    /// Writes an empty catalog into a fresh, registered index store.
    pub fn create(guard: &CheckpointReadGuard, memory: Arc<PageMemory>, group: GroupId) -> Result<Self> {
        let id = memory.allocate_page(guard, group, PartitionId::INDEX, PageFlag::Index)?;
        if id.index != PageIdx::META {
            return Err(StrataError::Invalid("index store is not empty"));
        }
        {
            let mut page = memory.write_page(guard, id)?;
            page::init_page(page.data_mut(), PageIo::IndexCatalogV1, id)?;
            encode_catalog(page.data_mut(), &[])?;
        }
        Ok(Self {
            group,
            memory,
            trees: RwLock::new(BTreeMap::new()),
        })
    }

    /// Loads the catalog and opens every index tree.
    pub fn open(guard: &CheckpointReadGuard, memory: Arc<PageMemory>, group: GroupId) -> Result<Self> {
        let defs = {
            let page = memory.read_page(guard, Self::catalog_page(group))?;
            decode_catalog(&page)?
        };
        let mut trees = BTreeMap::new();
        for def in defs {
            let tree = BTree::open(
                guard,
                Arc::clone(&memory),
                Self::allocator(&memory, group),
                Self::catalog_page(group).with_index(PageIdx(def.meta_page)),
                index_tree_name(group, &def.name),
            )?;
            trees.insert(def.id, (def, Arc::new(tree)));
        }
        Ok(Self {
            group,
            memory,
            trees: RwLock::new(trees),
        })
    }

    /// Opens the index partition, writing an empty catalog first when the store is empty.
    pub fn open_or_create(guard: &CheckpointReadGuard, memory: Arc<PageMemory>, group: GroupId) -> Result<Self> {
        if memory.store(group, PartitionId::INDEX)?.allocated() <= PageIdx::META.0 {
            Self::create(guard, memory, group)
        } else {
            Self::open(guard, memory, group)
        }
    }

    /// Creates the tree of index `id` unless the catalog already has it.
    pub fn ensure_index(&self, guard: &CheckpointReadGuard, id: u16, name: &str) -> Result<()> {
        let mut trees = self.trees.write();
        if let Some((def, _)) = trees.get(&id) {
            if def.name != name {
                return Err(StrataError::Invalid("index id already used under another name"));
            }
            return Ok(());
        }
        let tree = BTree::create(
            guard,
            Arc::clone(&self.memory),
            Self::allocator(&self.memory, self.group),
            index_tree_name(self.group, name),
        )?;
        let def = IndexDef {
            id,
            name: name.to_string(),
            meta_page: tree.meta_page().index.0,
        };
        trees.insert(id, (def, Arc::new(tree)));
        let defs: Vec<IndexDef> = trees.values().map(|(d, _)| d.clone()).collect();
        let mut page = self.memory.write_page(guard, Self::catalog_page(self.group))?;
        encode_catalog(page.data_mut(), &defs)?;
        info!(group = self.group.0, index = id, name, "index.create");
        Ok(())
    }

    /// Catalog entries in id order.
    pub fn definitions(&self) -> Vec<IndexDef> {
        self.trees.read().values().map(|(d, _)| d.clone()).collect()
    }

    /// Tree of index `id`.
    pub fn tree(&self, id: u16) -> Result<Arc<BTree>> {
        self.trees
            .read()
            .get(&id)
            .map(|(_, tree)| Arc::clone(tree))
            .ok_or(StrataError::NotFound)
    }

    /// Largest index key the trees accept.
    pub fn max_key_len(&self) -> usize {
        crate::storage::btree::page::max_entry_len(self.memory.page_size()) - LINK_LEN
    }

    /// Adds `index_key -> link` to index `id`.
    pub fn insert(&self, guard: &CheckpointReadGuard, id: u16, index_key: &[u8], link: Link) -> Result<()> {
        self.tree(id)?.putx(guard, &entry_key(index_key, link), &[])
    }

    /// Removes `index_key -> link` from index `id`; returns false when absent.
    pub fn remove(&self, guard: &CheckpointReadGuard, id: u16, index_key: &[u8], link: Link) -> Result<bool> {
        Ok(self.tree(id)?.remove(guard, &entry_key(index_key, link))?.is_some())
    }

    /// Links of every row whose index key equals `index_key`.
    pub fn lookup(&self, guard: &CheckpointReadGuard, id: u16, index_key: &[u8]) -> Result<Vec<Link>> {
        let tree = self.tree(id)?;
        let lower = entry_key(index_key, Link(0));
        let upper = entry_key(index_key, Link(u64::MAX));
        let mut links = Vec::new();
        for entry in tree.find(guard, Bound::Included(&lower), Bound::Included(&upper)) {
            let (entry, _) = entry?;
            let (key, link) = split_entry(&entry)?;
            if key == index_key {
                links.push(link);
            }
        }
        Ok(links)
    }
}

fn index_tree_name(group: GroupId, name: &str) -> String {
    format!("grp-{}/index/{name}", group.0)
}
