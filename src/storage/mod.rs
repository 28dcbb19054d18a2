//! Columnar storage core: page catalog, attribute streams, per-attribute
//! B-trees, undo log, TOAST and the meta page.

/// Attribute stream codec.
///
/// Chunked, delta-encoded column values with optional whole-stream
/// compression.
pub mod attstream;

/// Per-attribute B-trees keyed by tid.
pub mod btree;

/// Page types, trailers and classification.
pub mod catalog;

/// Meta page and free page map.
pub mod meta;

/// Relation-wide tuning knobs.
pub mod options;

/// Relation context tying the trees, undo log and TOAST together.
pub mod relation;

/// Out-of-line storage for large values.
pub mod toast;

/// Append-only undo log and visibility resolution.
pub mod undo;

pub use btree::{BTree, Cursor, PartitionReport};
pub use options::{Compression, StoreOptions};
pub use relation::{Relation, Row, RowScan, VacuumReport, Values};
