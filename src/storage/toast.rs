#![forbid(unsafe_code)]
//! Out-of-line storage for large values.
//!
//! A value is cut into chunks of at most `chunk_capacity` bytes. Each chunk
//! lives on its own TOAST page, optionally Snappy-compressed, and the pages
//! form a doubly linked chain in offset order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::primitives::pager::BufferPool;
use crate::storage::attstream::ToastPointer;
use crate::storage::catalog::{self, ToastOpaque};
use crate::storage::meta::{self, MetaGuard};
use crate::storage::options::{StoreOptions, MAX_TOAST_CHUNK};
use crate::types::{
    page::{self, PAGE_HDR_LEN},
    BlockNumber, ColstoreError, Result, Tid,
};

/// Counters for TOAST activity.
#[derive(Default)]
pub struct ToastMetrics {
    chunks_written: AtomicU64,
    chunks_freed: AtomicU64,
    bytes_stored: AtomicU64,
    bytes_fetched: AtomicU64,
}

/// Point-in-time copy of [`ToastMetrics`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ToastMetricsSnapshot {
    pub chunks_written: u64,
    pub chunks_freed: u64,
    pub bytes_stored: u64,
    pub bytes_fetched: u64,
}

impl ToastMetrics {
    pub fn snapshot(&self) -> ToastMetricsSnapshot {
        ToastMetricsSnapshot {
            chunks_written: self.chunks_written.load(Ordering::Relaxed),
            chunks_freed: self.chunks_freed.load(Ordering::Relaxed),
            bytes_stored: self.bytes_stored.load(Ordering::Relaxed),
            bytes_fetched: self.bytes_fetched.load(Ordering::Relaxed),
        }
    }
}

/// One validated link of a TOAST chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ToastChunk {
    pub block: BlockNumber,
    pub opaque: ToastOpaque,
    /// Bytes stored on the page (compressed size when compressed).
    pub stored_len: usize,
}

struct Piece {
    stored: Vec<u8>,
    raw_len: usize,
    compressed: bool,
}

/// TOAST manager over a relation's buffer pool.
pub struct Toast {
    pool: Arc<BufferPool>,
    chunk_capacity: usize,
    compress: bool,
    metrics: ToastMetrics,
}

impl Toast {
    pub fn new(pool: Arc<BufferPool>, options: &StoreOptions) -> Result<Self> {
        if options.toast_chunk_capacity == 0 || options.toast_chunk_capacity > MAX_TOAST_CHUNK {
            return Err(ColstoreError::Invalid("toast_chunk_capacity out of range"));
        }
        Ok(Self {
            pool,
            chunk_capacity: options.toast_chunk_capacity,
            compress: options.toast_compression,
            metrics: ToastMetrics::default(),
        })
    }

    pub fn chunk_capacity(&self) -> usize {
        self.chunk_capacity
    }

    pub fn metrics(&self) -> ToastMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Stores `value` on behalf of `tid`.
    ///
    /// The meta page is locked only while each chunk page is allocated, and
    /// at most one chunk page is held exclusively at a time. A chain that
    /// cannot be completed is returned to the free list.
    pub fn store(&self, tid: Tid, value: &[u8]) -> Result<ToastPointer> {
        let pieces = self.cut(value)?;
        let total_size = value.len() as u64;
        let mut written = Vec::with_capacity(pieces.len());
        if let Err(err) = self.write_chain(tid, total_size, &pieces, &mut written) {
            if !written.is_empty() {
                let mut meta = MetaGuard::lock(&self.pool)?;
                for block in &written {
                    meta.free_block(*block)?;
                }
            }
            warn!(tid = tid.0, chunks = written.len(), %err, "toast.store.abandoned");
            return Err(err);
        }
        let stored_bytes: usize = pieces.iter().map(|p| p.stored.len()).sum();
        self.metrics
            .chunks_written
            .fetch_add(pieces.len() as u64, Ordering::Relaxed);
        self.metrics
            .bytes_stored
            .fetch_add(stored_bytes as u64, Ordering::Relaxed);
        let first = written.first().copied().unwrap_or(BlockNumber::INVALID);
        debug!(tid = tid.0, total_size, chunks = written.len(), first = first.0, "toast.store");
        Ok(ToastPointer {
            first_block: first,
            total_size,
        })
    }

    fn cut(&self, value: &[u8]) -> Result<Vec<Piece>> {
        let mut encoder = snap::raw::Encoder::new();
        value
            .chunks(self.chunk_capacity)
            .map(|raw| {
                if self.compress {
                    let packed = encoder
                        .compress_vec(raw)
                        .map_err(|_| ColstoreError::Invalid("snappy rejected toast chunk"))?;
                    if packed.len() < raw.len() {
                        return Ok(Piece {
                            stored: packed,
                            raw_len: raw.len(),
                            compressed: true,
                        });
                    }
                }
                Ok(Piece {
                    stored: raw.to_vec(),
                    raw_len: raw.len(),
                    compressed: false,
                })
            })
            .collect()
    }

    /// Writes one page per piece, recording each block in `written` as soon
    /// as it is allocated. A chunk is linked to its successor only after
    /// the successor page has been released.
    fn write_chain(
        &self,
        tid: Tid,
        total_size: u64,
        pieces: &[Piece],
        written: &mut Vec<BlockNumber>,
    ) -> Result<()> {
        let mut offset = 0u64;
        for piece in pieces {
            let prev = written.last().copied().unwrap_or(BlockNumber::INVALID);
            let mut page = meta::allocate_page(&self.pool)?;
            let block = page.block;
            written.push(block);
            let opaque = ToastOpaque {
                tid,
                total_size,
                slice_offset: offset,
                prev,
                next: BlockNumber::INVALID,
                decompressed_size: piece.raw_len as u32,
                is_compressed: piece.compressed,
            };
            let hdr = catalog::init_typed(page.data_mut(), &opaque)?;
            let buf = page.data_mut();
            let end = PAGE_HDR_LEN + piece.stored.len();
            buf[PAGE_HDR_LEN..end].copy_from_slice(&piece.stored);
            page::set_bounds(buf, end, hdr.upper as usize);
            drop(page);

            if prev.is_valid() {
                let mut prev_page = self.pool.write(prev)?;
                let mut prev_opaque =
                    catalog::expect_trailer::<ToastOpaque>(prev, prev_page.data())?;
                prev_opaque.next = block;
                catalog::write_trailer(prev_page.data_mut(), &prev_opaque);
            }
            trace!(
                block = block.0,
                offset,
                stored = piece.stored.len(),
                compressed = piece.compressed,
                "toast.store.chunk"
            );
            offset += piece.raw_len as u64;
        }
        Ok(())
    }

    /// Walks and validates the chain of `pointer`, owned by `tid`.
    pub fn chunks(&self, tid: Tid, pointer: ToastPointer) -> Result<Vec<ToastChunk>> {
        let mut out = Vec::new();
        self.walk(tid, pointer, |chunk, _| {
            out.push(chunk);
            Ok(())
        })?;
        Ok(out)
    }

    /// Reassembles the value referenced by `pointer`.
    pub fn fetch(&self, tid: Tid, pointer: ToastPointer) -> Result<Vec<u8>> {
        let mut value = Vec::with_capacity(pointer.total_size.min(1 << 24) as usize);
        let mut decoder = snap::raw::Decoder::new();
        self.walk(tid, pointer, |chunk, stored| {
            if chunk.opaque.is_compressed {
                let raw = decoder.decompress_vec(stored).map_err(|err| {
                    ColstoreError::Decompression {
                        block: chunk.block,
                        reason: err.to_string(),
                    }
                })?;
                value.extend_from_slice(&raw);
            } else {
                value.extend_from_slice(stored);
            }
            Ok(())
        })?;
        self.metrics
            .bytes_fetched
            .fetch_add(value.len() as u64, Ordering::Relaxed);
        Ok(value)
    }

    /// Frees every chunk of `pointer`.
    pub fn delete(&self, tid: Tid, pointer: ToastPointer) -> Result<usize> {
        let mut meta = MetaGuard::lock(&self.pool)?;
        self.delete_with(&mut meta, tid, pointer)
    }

    /// Frees every chunk of `pointer` using a meta guard the caller holds.
    /// The chain is validated completely before any page is released.
    pub fn delete_with(
        &self,
        meta: &mut MetaGuard<'_>,
        tid: Tid,
        pointer: ToastPointer,
    ) -> Result<usize> {
        let chunks = self.chunks(tid, pointer)?;
        for chunk in &chunks {
            meta.free_block(chunk.block)?;
        }
        self.metrics
            .chunks_freed
            .fetch_add(chunks.len() as u64, Ordering::Relaxed);
        debug!(tid = tid.0, chunks = chunks.len(), "toast.delete");
        Ok(chunks.len())
    }

    fn walk<F>(&self, tid: Tid, pointer: ToastPointer, mut visit: F) -> Result<()>
    where
        F: FnMut(ToastChunk, &[u8]) -> Result<()>,
    {
        let total = pointer.total_size;
        let mut block = pointer.first_block;
        let mut prev = BlockNumber::INVALID;
        let mut got = 0u64;
        while got < total {
            if !block.is_valid() {
                return Err(ColstoreError::ToastChainTruncated {
                    tid,
                    block: prev,
                    got,
                    total,
                });
            }
            let page = self.pool.read(block)?;
            let data = page.data();
            let hdr = catalog::expect_header::<ToastOpaque>(block, data)?;
            let opaque = catalog::expect_trailer::<ToastOpaque>(block, data)?;
            check_link(block, &opaque, tid, total, got, prev)?;
            let stored = &data[PAGE_HDR_LEN..hdr.lower as usize];
            let raw_len = if opaque.is_compressed {
                snap::raw::decompress_len(stored).map_err(|err| ColstoreError::Decompression {
                    block,
                    reason: err.to_string(),
                })?
            } else {
                stored.len()
            };
            if raw_len != opaque.decompressed_size as usize || raw_len == 0 {
                return Err(ColstoreError::PageCorruption {
                    block,
                    detail: "toast chunk size does not match its trailer",
                });
            }
            got += raw_len as u64;
            if got > total {
                return Err(ColstoreError::PageCorruption {
                    block,
                    detail: "toast chain exceeds declared total size",
                });
            }
            visit(
                ToastChunk {
                    block,
                    opaque,
                    stored_len: stored.len(),
                },
                stored,
            )?;
            prev = block;
            block = opaque.next;
        }
        if got == total && block.is_valid() {
            return Err(ColstoreError::PageCorruption {
                block: prev,
                detail: "toast chain continues past declared total size",
            });
        }
        Ok(())
    }
}

fn check_link(
    block: BlockNumber,
    opaque: &ToastOpaque,
    tid: Tid,
    total: u64,
    got: u64,
    prev: BlockNumber,
) -> Result<()> {
    let detail = if opaque.tid != tid {
        "toast chunk belongs to another tid"
    } else if opaque.total_size != total {
        "toast chunk disagrees on total size"
    } else if opaque.slice_offset != got {
        "toast chunk offset out of sequence"
    } else if opaque.prev != prev {
        "toast chunk back-link broken"
    } else {
        return Ok(());
    };
    Err(ColstoreError::PageCorruption { block, detail })
}
