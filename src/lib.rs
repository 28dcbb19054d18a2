//! Columnar storage core.
//!
//! A relation stores every column in its own B-tree keyed by a logical row
//! id (tid). Leaves hold compressed attribute streams; row versions are
//! tracked through an append-only undo log and large values move out of
//! line to TOAST pages.

#![warn(missing_docs)]

pub mod admin;
pub mod primitives;
pub mod storage;
pub mod types;
