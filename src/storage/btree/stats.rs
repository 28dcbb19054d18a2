use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

/// Snapshot of B-tree counters at a point in time.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct BTreeStatsSnapshot {
    /// Internal pages visited by descents.
    pub internal_searches: u64,
    /// Leaves reached by descents.
    pub leaf_searches: u64,
    /// Descents restarted after a range mismatch.
    pub descend_retries: u64,
    /// Inserts applied by extending the append stream.
    pub leaf_appends: u64,
    /// Leaf rewrites into a single compressed stream.
    pub leaf_rebuilds: u64,
    pub leaf_splits: u64,
    pub internal_splits: u64,
    pub root_splits: u64,
    /// Empty leaves folded into their left sibling.
    pub leaf_merges: u64,
}

/// Thread-safe B-tree counters.
#[derive(Default)]
pub struct BTreeStats {
    internal_searches: AtomicU64,
    leaf_searches: AtomicU64,
    descend_retries: AtomicU64,
    leaf_appends: AtomicU64,
    leaf_rebuilds: AtomicU64,
    leaf_splits: AtomicU64,
    internal_splits: AtomicU64,
    root_splits: AtomicU64,
    leaf_merges: AtomicU64,
}

macro_rules! bump {
    ($($name:ident => $field:ident),* $(,)?) => {
        $(
            pub(crate) fn $name(&self) {
                self.$field.fetch_add(1, AtomicOrdering::Relaxed);
            }
        )*
    };
}

impl BTreeStats {
    bump! {
        inc_internal_searches => internal_searches,
        inc_leaf_searches => leaf_searches,
        inc_descend_retries => descend_retries,
        inc_leaf_appends => leaf_appends,
        inc_leaf_rebuilds => leaf_rebuilds,
        inc_leaf_splits => leaf_splits,
        inc_internal_splits => internal_splits,
        inc_root_splits => root_splits,
        inc_leaf_merges => leaf_merges,
    }

    /// Creates a snapshot of all current counters.
    pub fn snapshot(&self) -> BTreeStatsSnapshot {
        let load = |c: &AtomicU64| c.load(AtomicOrdering::Relaxed);
        BTreeStatsSnapshot {
            internal_searches: load(&self.internal_searches),
            leaf_searches: load(&self.leaf_searches),
            descend_retries: load(&self.descend_retries),
            leaf_appends: load(&self.leaf_appends),
            leaf_rebuilds: load(&self.leaf_rebuilds),
            leaf_splits: load(&self.leaf_splits),
            internal_splits: load(&self.internal_splits),
            root_splits: load(&self.root_splits),
            leaf_merges: load(&self.leaf_merges),
        }
    }

    /// Emits the current counters as one tracing event.
    pub fn emit_tracing(&self) {
        let s = self.snapshot();
        tracing::info!(
            target: "colstore::btree::stats",
            internal_searches = s.internal_searches,
            leaf_searches = s.leaf_searches,
            descend_retries = s.descend_retries,
            leaf_appends = s.leaf_appends,
            leaf_rebuilds = s.leaf_rebuilds,
            leaf_splits = s.leaf_splits,
            internal_splits = s.internal_splits,
            root_splits = s.root_splits,
            leaf_merges = s.leaf_merges,
            "btree stats snapshot"
        );
    }
}
