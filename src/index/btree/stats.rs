use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

/// Snapshot of tree maintenance statistics at a point in time.
#[derive(Default, Debug, Clone, Copy)]
pub struct BTreeStatsSnapshot {
    /// Number of leaf node splits performed.
    pub leaf_splits: u64,
    /// Number of inner node splits performed.
    pub inner_splits: u64,
    /// Number of leaf node merges performed.
    pub leaf_merges: u64,
    /// Number of inner node merges performed.
    pub inner_merges: u64,
    /// Number of sibling redistributions performed.
    pub redistributions: u64,
    /// Number of root swaps (height changes in either direction).
    pub root_swaps: u64,
}

/// Thread-safe counters for tree maintenance events.
#[derive(Default)]
pub struct BTreeStats {
    leaf_splits: AtomicU64,
    inner_splits: AtomicU64,
    leaf_merges: AtomicU64,
    inner_merges: AtomicU64,
    redistributions: AtomicU64,
    root_swaps: AtomicU64,
}

impl BTreeStats {
    /// Returns the current count of leaf splits.
    pub fn leaf_splits(&self) -> u64 {
        self.leaf_splits.load(AtomicOrdering::Relaxed)
    }

    /// Returns the current count of inner node splits.
    pub fn inner_splits(&self) -> u64 {
        self.inner_splits.load(AtomicOrdering::Relaxed)
    }

    /// Returns the current count of leaf merges.
    pub fn leaf_merges(&self) -> u64 {
        self.leaf_merges.load(AtomicOrdering::Relaxed)
    }

    /// Returns the current count of inner node merges.
    pub fn inner_merges(&self) -> u64 {
        self.inner_merges.load(AtomicOrdering::Relaxed)
    }

    /// Returns the current count of sibling redistributions.
    pub fn redistributions(&self) -> u64 {
        self.redistributions.load(AtomicOrdering::Relaxed)
    }

    /// Returns the current count of root swaps.
    pub fn root_swaps(&self) -> u64 {
        self.root_swaps.load(AtomicOrdering::Relaxed)
    }

    pub(crate) fn inc_split(&self, leaf: bool) {
        let counter = if leaf { &self.leaf_splits } else { &self.inner_splits };
        counter.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_merge(&self, leaf: bool) {
        let counter = if leaf { &self.leaf_merges } else { &self.inner_merges };
        counter.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_redistribution(&self) {
        self.redistributions.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_root_swap(&self) {
        self.root_swaps.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Creates a snapshot of all current counters.
    pub fn snapshot(&self) -> BTreeStatsSnapshot {
        BTreeStatsSnapshot {
            leaf_splits: self.leaf_splits(),
            inner_splits: self.inner_splits(),
            leaf_merges: self.leaf_merges(),
            inner_merges: self.inner_merges(),
            redistributions: self.redistributions(),
            root_swaps: self.root_swaps(),
        }
    }

    /// Emits current counters to the tracing infrastructure.
    pub fn emit_tracing(&self) {
        let snapshot = self.snapshot();
        tracing::info!(
            target: "umbra_index::stats",
            leaf_splits = snapshot.leaf_splits,
            inner_splits = snapshot.inner_splits,
            leaf_merges = snapshot.leaf_merges,
            inner_merges = snapshot.inner_merges,
            redistributions = snapshot.redistributions,
            root_swaps = snapshot.root_swaps,
            "btree stats snapshot"
        );
    }
}
