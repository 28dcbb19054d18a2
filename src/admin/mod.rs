#![forbid(unsafe_code)]

//! Relation inspection and maintenance utilities.
//!
//! Read-only views over raw pages for diagnostics, integrity verification,
//! and helpers for opening relation files from the command line.

mod error;
mod inspect;
mod options;
mod util;
mod verify;

/// Error types for administrative operations.
pub use error::{AdminError, Result};

/// Page-level inspection.
///
/// Classifies pages and decodes undo, TOAST, B-tree and meta pages into
/// serializable rows.
pub use inspect::{
    decode_attribute_chunk, AttStreamChunkRow, BtreePageRow, DecodedChunkRow, Inspector,
    MetaPageRow, ToastPageRow, UndoPageRow,
};

/// Configuration options for opening a relation in admin mode.
pub use options::AdminOpenOptions;

/// Relation integrity verification.
pub use verify::{
    verify, verify_relation, VerifyCounts, VerifyFinding, VerifyLevel, VerifyReport,
    VerifySeverity,
};

/// Utility functions for opening relation files.
pub use util::{open_pool, open_relation};
