use serde::{Deserialize, Serialize};

use crate::primitives::pager::PoolOptions;
use crate::types::page::{PAGE_HDR_LEN, PAGE_SIZE};

use super::catalog::TOAST_TRAILER_LEN;

/// Payload codec applied to attribute streams.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    /// Streams are stored as plain chunk sequences.
    None,
    /// Streams are compressed with raw Snappy when that saves space.
    #[default]
    Snappy,
}

/// Largest TOAST chunk payload that fits on one page.
pub const MAX_TOAST_CHUNK: usize = PAGE_SIZE - PAGE_HDR_LEN - TOAST_TRAILER_LEN;

/// Configuration supplied when creating or opening a relation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreOptions {
    /// Number of buffer pool frames.
    pub cache_pages: usize,
    /// Maximum relation size in blocks; `None` for unbounded.
    pub max_blocks: Option<u32>,
    /// Codec for compressed leaf streams.
    pub compression: Compression,
    /// Varlena values longer than this are moved to TOAST.
    pub toast_threshold: usize,
    /// Payload bytes per TOAST chunk.
    pub toast_chunk_capacity: usize,
    /// Compress individual TOAST chunks when it saves space.
    pub toast_compression: bool,
    /// Retries from the root before a descent gives up.
    pub max_descend_retries: u32,
    /// Verify page checksums on load.
    pub verify_checksums: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            cache_pages: 256,
            max_blocks: None,
            compression: Compression::Snappy,
            toast_threshold: 2032,
            toast_chunk_capacity: MAX_TOAST_CHUNK,
            toast_compression: true,
            max_descend_retries: 16,
            verify_checksums: true,
        }
    }
}

impl StoreOptions {
    /// Sets the buffer pool size.
    pub fn cache_pages(mut self, pages: usize) -> Self {
        self.cache_pages = pages;
        self
    }

    /// Caps the relation size.
    pub fn max_blocks(mut self, blocks: u32) -> Self {
        self.max_blocks = Some(blocks);
        self
    }

    /// Selects the leaf stream codec.
    pub fn compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// Sets the inline size limit for varlena values.
    pub fn toast_threshold(mut self, bytes: usize) -> Self {
        self.toast_threshold = bytes;
        self
    }

    /// Sets the TOAST chunk capacity.
    pub fn toast_chunk_capacity(mut self, bytes: usize) -> Self {
        self.toast_chunk_capacity = bytes;
        self
    }

    /// Enables or disables per-chunk TOAST compression.
    pub fn toast_compression(mut self, enabled: bool) -> Self {
        self.toast_compression = enabled;
        self
    }

    /// Sets the descent retry bound.
    pub fn max_descend_retries(mut self, retries: u32) -> Self {
        self.max_descend_retries = retries;
        self
    }

    /// Enables or disables checksum verification.
    pub fn verify_checksums(mut self, enabled: bool) -> Self {
        self.verify_checksums = enabled;
        self
    }

    /// Checks the values for consistency.
    pub fn validate(&self) -> crate::types::Result<()> {
        use crate::types::ColstoreError;
        if self.toast_chunk_capacity == 0 || self.toast_chunk_capacity > MAX_TOAST_CHUNK {
            return Err(ColstoreError::Invalid("toast_chunk_capacity out of range"));
        }
        if self.toast_threshold == 0 || self.toast_threshold > MAX_INLINE_VARLENA {
            return Err(ColstoreError::Invalid("toast_threshold out of range"));
        }
        Ok(())
    }

    /// Buffer pool settings derived from these options.
    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            cache_pages: self.cache_pages,
            max_blocks: self.max_blocks,
            verify_checksums: self.verify_checksums,
        }
    }
}

/// Upper bound for inline varlena values, leaving room for several items per
/// leaf.
pub const MAX_INLINE_VARLENA: usize = 2032;
