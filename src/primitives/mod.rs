//! Building blocks under the relation storage layer: chunk decoding helpers,
//! block I/O and the buffer pool.

/// Varints and a bounds-checked cursor for attribute-stream chunks.
pub mod bytes;

/// Block-granular relation storage backends.
pub mod io;

/// Buffer pool over a relation file.
///
/// Manages page frames, pins and page-scoped locks.
pub mod pager;
