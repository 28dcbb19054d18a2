#![forbid(unsafe_code)]
//! Identifiers, error type and page-level constants shared by every layer.

mod checksum;
pub mod page;

use std::fmt;

pub use checksum::page_crc32;

/// Physical block number inside a relation.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, serde::Serialize)]
#[serde(transparent)]
pub struct BlockNumber(pub u32);

impl BlockNumber {
    /// Sentinel meaning "no block".
    pub const INVALID: BlockNumber = BlockNumber(u32::MAX);

    /// Returns `true` unless this is the [`BlockNumber::INVALID`] sentinel.
    pub const fn is_valid(self) -> bool {
        self.0 != u32::MAX
    }

    /// Maps the sentinel to `None`.
    pub fn valid(self) -> Option<BlockNumber> {
        self.is_valid().then_some(self)
    }
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "{}", self.0)
        } else {
            f.write_str("invalid")
        }
    }
}

/// Logical row identifier.
///
/// Zero is never assigned to a row; the first row of a relation receives
/// [`Tid::MIN`]. B-tree key ranges are half-open `[lokey, hikey)` and the
/// rightmost leaf of every tree ends at [`Tid::MAX_PLUS_ONE`].
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, serde::Serialize)]
#[serde(transparent)]
pub struct Tid(pub u64);

impl Tid {
    /// Invalid tid, also the "previous tid" of the first chunk in a stream.
    pub const INVALID: Tid = Tid(0);
    /// First assignable tid.
    pub const MIN: Tid = Tid(1);
    /// Exclusive upper bound of the tid space.
    pub const MAX_PLUS_ONE: Tid = Tid(u64::MAX);

    /// Returns the following tid.
    pub fn next(self) -> Tid {
        Tid(self.0 + 1)
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Attribute number; 0 is the tid tree, user columns start at 1.
pub type AttrNum = u16;

/// Attribute number of the tid/row-existence tree.
pub const TID_TREE_ATTNO: AttrNum = 0;

/// Address of an undo record: block, in-page offset and global counter.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, serde::Serialize)]
pub struct UndoPtr {
    /// Strictly increasing counter assigned at append time; 0 is invalid.
    pub counter: u64,
    /// Undo page holding the record.
    pub block: BlockNumber,
    /// Byte offset of the record inside its page.
    pub offset: u16,
}

/// Encoded length of an [`UndoPtr`].
pub const UNDO_PTR_LEN: usize = 14;

impl UndoPtr {
    /// Pointer that references no record.
    pub const INVALID: UndoPtr = UndoPtr {
        counter: 0,
        block: BlockNumber::INVALID,
        offset: 0,
    };

    /// Returns `true` when the pointer references a record.
    pub const fn is_valid(&self) -> bool {
        self.counter != 0
    }

    /// Big-endian encoding used on pages and in tid-tree values.
    pub fn to_bytes(&self) -> [u8; UNDO_PTR_LEN] {
        let mut out = [0u8; UNDO_PTR_LEN];
        out[0..8].copy_from_slice(&self.counter.to_be_bytes());
        out[8..12].copy_from_slice(&self.block.0.to_be_bytes());
        out[12..14].copy_from_slice(&self.offset.to_be_bytes());
        out
    }

    /// Decodes a pointer written by [`UndoPtr::to_bytes`].
    pub fn from_bytes(src: &[u8]) -> Result<Self> {
        if src.len() < UNDO_PTR_LEN {
            return Err(ColstoreError::Corruption("undo pointer truncated"));
        }
        Ok(Self {
            counter: page::read_u64(src, 0),
            block: BlockNumber(page::read_u32(src, 8)),
            offset: page::read_u16(src, 12),
        })
    }
}

impl Default for UndoPtr {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Display for UndoPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.counter, self.block, self.offset)
    }
}

/// Errors surfaced by the storage core.
#[derive(thiserror::Error, Debug)]
pub enum ColstoreError {
    /// Underlying file I/O failed.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// Structural corruption without further context.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Corruption detected on a specific page.
    #[error("corruption at block {block}: {detail}")]
    PageCorruption {
        /// Offending block.
        block: BlockNumber,
        /// What was wrong.
        detail: &'static str,
    },
    /// A page carried a different type tag than its access path requires.
    #[error("unexpected page tag at block {block}: expected {expected:#06x}, found {found:#06x}")]
    PageTypeMismatch {
        /// Offending block.
        block: BlockNumber,
        /// Tag the access path required.
        expected: u16,
        /// Tag found in the last two bytes of the page.
        found: u16,
    },
    /// The special area size does not match the trailer size of the page type.
    #[error("special size mismatch at block {block}: expected {expected}, found {found}")]
    SpecialSizeMismatch {
        /// Offending block.
        block: BlockNumber,
        /// Trailer size of the expected page type.
        expected: usize,
        /// `PAGE_SIZE - special`.
        found: usize,
    },
    /// A TOAST chain ended before delivering the declared size.
    #[error("toast chain for tid {tid} truncated at block {block}: {got} of {total} bytes")]
    ToastChainTruncated {
        /// Owning tid.
        tid: Tid,
        /// Last block visited.
        block: BlockNumber,
        /// Bytes reconstructed so far.
        got: u64,
        /// Declared total size.
        total: u64,
    },
    /// A B-tree descent reached a page whose key range excludes the target.
    #[error("btree page {block} range [{lokey}, {hikey}) does not contain tid {tid}")]
    KeyRangeMismatch {
        /// Page reached by the descent.
        block: BlockNumber,
        /// Target tid.
        tid: Tid,
        /// Page low key.
        lokey: Tid,
        /// Page high key.
        hikey: Tid,
    },
    /// A compressed payload could not be decompressed.
    #[error("decompression failed at block {block}: {reason}")]
    Decompression {
        /// Page holding the payload.
        block: BlockNumber,
        /// Decoder message.
        reason: String,
    },
    /// No free page and the relation cannot grow.
    #[error("page allocation failed: relation limited to {limit} blocks")]
    AllocationFailed {
        /// Configured block limit.
        limit: u32,
    },
    /// Every buffer frame is pinned.
    #[error("buffer pool exhausted: all {capacity} frames pinned")]
    BufferPoolExhausted {
        /// Number of frames in the pool.
        capacity: usize,
    },
    /// A descent kept observing concurrent splits.
    #[error("btree descent for attribute {attno} tid {tid} gave up after {attempts} attempts")]
    RetryExhausted {
        /// Attribute tree.
        attno: AttrNum,
        /// Target tid.
        tid: Tid,
        /// Attempts made.
        attempts: u32,
    },
    /// The caller's interrupt flag was raised.
    #[error("operation interrupted")]
    Interrupted,
    /// Invalid argument supplied by the caller.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// A requested item does not exist.
    #[error("{0} not found")]
    NotFound(&'static str),
}

impl ColstoreError {
    /// Returns `true` for on-disk format corruption, including undecodable
    /// compressed payloads.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            ColstoreError::Corruption(_)
                | ColstoreError::PageCorruption { .. }
                | ColstoreError::PageTypeMismatch { .. }
                | ColstoreError::SpecialSizeMismatch { .. }
                | ColstoreError::ToastChainTruncated { .. }
                | ColstoreError::KeyRangeMismatch { .. }
                | ColstoreError::Decompression { .. }
        )
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ColstoreError>;
