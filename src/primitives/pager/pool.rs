use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{
    lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard},
    Mutex, RawRwLock,
};
use tracing::{debug, trace};

use super::frame::Frame;
use crate::primitives::io::FileIo;
use crate::types::{
    page::{self, PAGE_SIZE},
    BlockNumber, ColstoreError, Result,
};

/// Configuration of a [`BufferPool`].
#[derive(Clone, Debug)]
pub struct PoolOptions {
    /// Number of page frames kept in memory.
    pub cache_pages: usize,
    /// Hard limit on the relation size in blocks.
    pub max_blocks: Option<u32>,
    /// Verify page checksums when loading from the backend.
    pub verify_checksums: bool,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            cache_pages: 256,
            max_blocks: None,
            verify_checksums: true,
        }
    }
}

/// Counters describing pool activity.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Requests served from a resident frame.
    pub hits: u64,
    /// Requests that had to load from the backend.
    pub misses: u64,
    /// Frames reclaimed by the clock.
    pub evictions: u64,
    /// Dirty frames written back.
    pub writebacks: u64,
    /// Blocks appended to the relation.
    pub extensions: u64,
}

struct PoolInner {
    frames: Vec<Frame>,
    table: HashMap<BlockNumber, usize>,
    clock_hand: usize,
    nblocks: u32,
    stats: PoolStats,
}

/// Index-addressed arena of page frames over a [`FileIo`] backend.
///
/// Every handle pins its frame and holds the page lock for its lifetime;
/// dropping the handle releases the lock first and the pin second.
pub struct BufferPool {
    io: Arc<dyn FileIo>,
    inner: Mutex<PoolInner>,
    extend_lock: Mutex<()>,
    options: PoolOptions,
}

impl BufferPool {
    /// Opens a pool over `io`, sized to the blocks the backend holds.
    pub fn new(io: Arc<dyn FileIo>, options: PoolOptions) -> Result<Self> {
        if options.cache_pages < 4 {
            return Err(ColstoreError::Invalid("cache_pages must be at least 4"));
        }
        let nblocks = io.nblocks()?;
        let frames = (0..options.cache_pages).map(|_| Frame::new()).collect();
        debug!(nblocks, cache_pages = options.cache_pages, "pool.open");
        Ok(Self {
            io,
            inner: Mutex::new(PoolInner {
                frames,
                table: HashMap::new(),
                clock_hand: 0,
                nblocks,
                stats: PoolStats::default(),
            }),
            extend_lock: Mutex::new(()),
            options,
        })
    }

    /// Number of blocks in the relation.
    pub fn nblocks(&self) -> u32 {
        self.inner.lock().nblocks
    }

    /// Number of frames in the arena.
    pub fn capacity(&self) -> usize {
        self.options.cache_pages
    }

    /// Snapshot of the activity counters.
    pub fn stats(&self) -> PoolStats {
        self.inner.lock().stats.clone()
    }

    /// Pins `block` and takes its shared lock.
    pub fn read(&self, block: BlockNumber) -> Result<PageRef<'_>> {
        let (idx, buf) = self.pin(block, false)?;
        let guard = buf.read_arc();
        Ok(PageRef {
            block,
            pool: self,
            frame_idx: idx,
            guard: Some(guard),
        })
    }

    /// Pins `block` and takes its exclusive lock. The frame is marked dirty.
    pub fn write(&self, block: BlockNumber) -> Result<PageMut<'_>> {
        let (idx, buf) = self.pin(block, true)?;
        let guard = buf.write_arc();
        Ok(PageMut {
            block,
            pool: self,
            frame_idx: idx,
            guard: Some(guard),
        })
    }

    /// Appends one zeroed block to the relation and returns it exclusively
    /// locked.
    pub fn extend(&self) -> Result<PageMut<'_>> {
        let _ext = self.extend_lock.lock();
        let (block, idx, buf) = {
            let mut inner = self.inner.lock();
            let next = inner.nblocks;
            if let Some(limit) = self.options.max_blocks {
                if next >= limit {
                    return Err(ColstoreError::AllocationFailed { limit });
                }
            }
            if next == BlockNumber::INVALID.0 {
                return Err(ColstoreError::AllocationFailed { limit: next });
            }
            let block = BlockNumber(next);
            let idx = self.obtain_frame(&mut inner)?;
            self.io.write_block(block, &[0u8; PAGE_SIZE])?;
            inner.nblocks = next + 1;
            inner.stats.extensions += 1;
            let frame = &mut inner.frames[idx];
            frame.buf.write().fill(0);
            frame.reset(block);
            frame.pin_count = 1;
            frame.dirty = true;
            let buf = Arc::clone(&frame.buf);
            inner.table.insert(block, idx);
            (block, idx, buf)
        };
        trace!(block = block.0, "pool.extend");
        let guard = buf.write_arc();
        Ok(PageMut {
            block,
            pool: self,
            frame_idx: idx,
            guard: Some(guard),
        })
    }

    /// Writes every dirty frame back to the backend and syncs it.
    ///
    /// Must not be called while the calling thread holds a [`PageMut`].
    pub fn flush(&self) -> Result<()> {
        let pinned: Vec<(usize, BlockNumber, Arc<parking_lot::RwLock<Box<[u8]>>>)> = {
            let mut inner = self.inner.lock();
            let mut out = Vec::new();
            for (idx, frame) in inner.frames.iter_mut().enumerate() {
                if let (Some(block), true) = (frame.block, frame.dirty) {
                    frame.pin_count += 1;
                    frame.dirty = false;
                    out.push((idx, block, Arc::clone(&frame.buf)));
                }
            }
            out
        };
        let mut result = Ok(());
        let mut written = 0u64;
        for (idx, block, buf) in &pinned {
            if result.is_ok() {
                let mut image = buf.read().to_vec();
                page::stamp_checksum(*block, &mut image);
                result = self.io.write_block(*block, &image);
                if result.is_ok() {
                    written += 1;
                } else {
                    self.inner.lock().frames[*idx].dirty = true;
                }
            }
            self.unpin(*idx);
        }
        result?;
        self.inner.lock().stats.writebacks += written;
        self.io.sync()?;
        debug!(pages = written, "pool.flush");
        Ok(())
    }

    fn pin(
        &self,
        block: BlockNumber,
        dirty: bool,
    ) -> Result<(usize, Arc<parking_lot::RwLock<Box<[u8]>>>)> {
        let mut inner = self.inner.lock();
        if !block.is_valid() || block.0 >= inner.nblocks {
            return Err(ColstoreError::PageCorruption {
                block,
                detail: "block beyond end of relation",
            });
        }
        if let Some(&idx) = inner.table.get(&block) {
            inner.stats.hits += 1;
            let frame = &mut inner.frames[idx];
            frame.pin_count += 1;
            frame.reference = true;
            frame.dirty |= dirty;
            return Ok((idx, Arc::clone(&frame.buf)));
        }
        inner.stats.misses += 1;
        let idx = self.obtain_frame(&mut inner)?;
        {
            let frame = &mut inner.frames[idx];
            let mut buf = frame.buf.write();
            self.io.read_block(block, &mut buf[..])?;
            if self.options.verify_checksums {
                page::verify_checksum(block, &buf[..])?;
            }
        }
        let frame = &mut inner.frames[idx];
        frame.reset(block);
        frame.pin_count = 1;
        frame.dirty = dirty;
        let buf = Arc::clone(&frame.buf);
        inner.table.insert(block, idx);
        Ok((idx, buf))
    }

    fn unpin(&self, idx: usize) {
        let mut inner = self.inner.lock();
        let frame = &mut inner.frames[idx];
        debug_assert!(frame.pin_count > 0, "unpin of unpinned frame");
        frame.pin_count = frame.pin_count.saturating_sub(1);
    }

    /// Returns an unassigned frame, evicting with the clock when necessary.
    fn obtain_frame(&self, inner: &mut PoolInner) -> Result<usize> {
        if let Some(idx) = inner
            .frames
            .iter()
            .position(|f| f.block.is_none() && f.is_evictable())
        {
            return Ok(idx);
        }
        let len = inner.frames.len();
        for _ in 0..len * 2 {
            let idx = inner.clock_hand;
            inner.clock_hand = (inner.clock_hand + 1) % len;
            let frame = &mut inner.frames[idx];
            if !frame.is_evictable() {
                continue;
            }
            if frame.reference {
                frame.reference = false;
                continue;
            }
            self.evict(inner, idx)?;
            return Ok(idx);
        }
        Err(ColstoreError::BufferPoolExhausted { capacity: len })
    }

    fn evict(&self, inner: &mut PoolInner, idx: usize) -> Result<()> {
        let Some(block) = inner.frames[idx].block else {
            return Ok(());
        };
        if inner.frames[idx].dirty {
            let mut image = inner.frames[idx].buf.read().to_vec();
            page::stamp_checksum(block, &mut image);
            self.io.write_block(block, &image)?;
            inner.stats.writebacks += 1;
        }
        inner.table.remove(&block);
        let frame = &mut inner.frames[idx];
        frame.block = None;
        frame.dirty = false;
        frame.reference = false;
        inner.stats.evictions += 1;
        trace!(block = block.0, "pool.evict");
        Ok(())
    }
}

/// Shared handle on a pinned page.
pub struct PageRef<'a> {
    /// Block held by this handle.
    pub block: BlockNumber,
    pool: &'a BufferPool,
    frame_idx: usize,
    guard: Option<ArcRwLockReadGuard<RawRwLock, Box<[u8]>>>,
}

impl<'a> PageRef<'a> {
    /// Returns the page bytes.
    pub fn data(&self) -> &[u8] {
        match self.guard.as_ref() {
            Some(guard) => &guard[..],
            None => &[],
        }
    }
}

impl fmt::Debug for PageRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageRef")
            .field("block", &self.block)
            .field("frame", &self.frame_idx)
            .finish()
    }
}

impl<'a> Drop for PageRef<'a> {
    fn drop(&mut self) {
        if let Some(guard) = self.guard.take() {
            drop(guard);
        }
        self.pool.unpin(self.frame_idx);
    }
}

/// Exclusive handle on a pinned page.
pub struct PageMut<'a> {
    /// Block held by this handle.
    pub block: BlockNumber,
    pool: &'a BufferPool,
    frame_idx: usize,
    guard: Option<ArcRwLockWriteGuard<RawRwLock, Box<[u8]>>>,
}

impl<'a> PageMut<'a> {
    /// Returns the page bytes.
    pub fn data(&self) -> &[u8] {
        match self.guard.as_ref() {
            Some(guard) => &guard[..],
            None => &[],
        }
    }

    /// Returns the page bytes for modification.
    pub fn data_mut(&mut self) -> &mut [u8] {
        match self.guard.as_mut() {
            Some(guard) => &mut guard[..],
            None => &mut [],
        }
    }
}

impl fmt::Debug for PageMut<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageMut")
            .field("block", &self.block)
            .field("frame", &self.frame_idx)
            .finish()
    }
}

impl<'a> Drop for PageMut<'a> {
    fn drop(&mut self) {
        if let Some(guard) = self.guard.take() {
            drop(guard);
        }
        self.pool.unpin(self.frame_idx);
    }
}
