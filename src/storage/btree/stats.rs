use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use serde::Serialize;

/// Snapshot of B+ tree statistics at a point in time.
#[derive(Default, Debug, Clone, Copy, Serialize)]
pub struct BTreeStatsSnapshot {
    /// Number of leaf page searches performed
    pub leaf_searches: u64,
    /// Number of inner page searches performed
    pub inner_searches: u64,
    /// Number of leaf page splits performed
    pub leaf_splits: u64,
    /// Number of inner page splits performed
    pub inner_splits: u64,
    /// Number of times the root grew a level
    pub root_splits: u64,
    /// Leaves delivered by `visit`
    pub visited_leaves: u64,
    /// Checkpoint lock release/reacquire cycles during `visit`
    pub visit_relocks: u64,
}

/// Thread-safe statistics tracking for B+ tree operations.
#[derive(Default)]
pub struct BTreeStats {
    leaf_searches: AtomicU64,
    inner_searches: AtomicU64,
    leaf_splits: AtomicU64,
    inner_splits: AtomicU64,
    root_splits: AtomicU64,
    visited_leaves: AtomicU64,
    visit_relocks: AtomicU64,
}

impl BTreeStats {
    /// Returns the current count of leaf page searches.
    pub fn leaf_searches(&self) -> u64 {
        self.leaf_searches.load(AtomicOrdering::Relaxed)
    }

    /// Returns the current count of leaf page splits.
    pub fn leaf_splits(&self) -> u64 {
        self.leaf_splits.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of relock cycles performed by `visit`.
    pub fn visit_relocks(&self) -> u64 {
        self.visit_relocks.load(AtomicOrdering::Relaxed)
    }

    pub(crate) fn inc_leaf_searches(&self) {
        self.leaf_searches.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_inner_searches(&self) {
        self.inner_searches.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_leaf_splits(&self) {
        self.leaf_splits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_inner_splits(&self) {
        self.inner_splits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_root_splits(&self) {
        self.root_splits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_visited_leaves(&self) {
        self.visited_leaves.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_visit_relocks(&self) {
        self.visit_relocks.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Creates a snapshot of all current statistics.
    pub fn snapshot(&self) -> BTreeStatsSnapshot {
        BTreeStatsSnapshot {
            leaf_searches: self.leaf_searches(),
            inner_searches: self.inner_searches.load(AtomicOrdering::Relaxed),
            leaf_splits: self.leaf_splits(),
            inner_splits: self.inner_splits.load(AtomicOrdering::Relaxed),
            root_splits: self.root_splits.load(AtomicOrdering::Relaxed),
            visited_leaves: self.visited_leaves.load(AtomicOrdering::Relaxed),
            visit_relocks: self.visit_relocks(),
        }
    }

    /// Emits current statistics to the tracing infrastructure.
    pub fn emit_tracing(&self, tree: &str) {
        let snapshot = self.snapshot();
        tracing::debug!(
            target: "strata::btree::stats",
            tree,
            leaf_searches = snapshot.leaf_searches,
            inner_searches = snapshot.inner_searches,
            leaf_splits = snapshot.leaf_splits,
            inner_splits = snapshot.inner_splits,
            root_splits = snapshot.root_splits,
            visited_leaves = snapshot.visited_leaves,
            visit_relocks = snapshot.visit_relocks,
            "btree.stats"
        );
    }
}
