#![forbid(unsafe_code)]

//! Attribute B-trees keyed by tid.

/// Leaf and internal page bodies.
pub mod page;

mod cursor;
mod stats;
mod tree;

pub use cursor::Cursor;
pub use page::{Downlink, Leaf, LeafState};
pub use stats::{BTreeStats, BTreeStatsSnapshot};
pub use tree::{BTree, PartitionReport};

#[cfg(test)]
mod tests;
