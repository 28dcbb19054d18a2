#![forbid(unsafe_code)]
//! Meta page and free page map.
//!
//! Block 0 holds the undo log bookkeeping and the free-list head in its
//! trailer, and the attribute directory in its body. Every mutation goes
//! through a [`MetaGuard`], which holds the meta page exclusively for the
//! duration of one operation.

use core::ops::Range;

use tracing::{debug, trace};

use crate::primitives::pager::{BufferPool, PageMut};
use crate::storage::attstream::AttrType;
use crate::storage::catalog::{self, FreeOpaque, MetaOpaque};
use crate::types::{
    page::{self, read_u16, read_u32, read_u64, write_u16, write_u32, write_u64, PAGE_HDR_LEN},
    AttrNum, BlockNumber, ColstoreError, Result, Tid, UndoPtr,
};

/// Well-known block of the meta page.
pub const META_BLOCK: BlockNumber = BlockNumber(0);

const META_NATTS: Range<usize> = PAGE_HDR_LEN..PAGE_HDR_LEN + 2;
const META_RESERVED: Range<usize> = PAGE_HDR_LEN + 2..PAGE_HDR_LEN + 4;
const META_NEXT_TID: Range<usize> = PAGE_HDR_LEN + 4..PAGE_HDR_LEN + 12;
const META_DIRECTORY: usize = PAGE_HDR_LEN + 12;
const DIR_ENTRY_LEN: usize = 12;

/// Largest number of user attributes the directory can describe.
pub const MAX_ATTRIBUTES: usize = (page::PAGE_SIZE
    - META_DIRECTORY
    - catalog::META_TRAILER_LEN)
    / DIR_ENTRY_LEN
    - 1;

/// One attribute directory entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttrEntry {
    /// Root of the attribute's B-tree.
    pub root: BlockNumber,
    pub attr: AttrType,
}

/// Consistent copy of the meta page.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetaSnapshot {
    pub opaque: MetaOpaque,
    /// Next tid to be assigned.
    pub next_tid: Tid,
    /// Entry 0 is the tid tree, entry `n` is user attribute `n`.
    pub attrs: Vec<AttrEntry>,
}

impl MetaSnapshot {
    /// Number of user attributes.
    pub fn natts(&self) -> usize {
        self.attrs.len() - 1
    }

    /// Directory entry for `attno`.
    pub fn entry(&self, attno: AttrNum) -> Result<AttrEntry> {
        self.attrs
            .get(attno as usize)
            .copied()
            .ok_or(ColstoreError::NotFound("attribute"))
    }
}

/// Initial trailer of a freshly created relation.
pub fn initial_opaque() -> MetaOpaque {
    MetaOpaque {
        undo_head: BlockNumber::INVALID,
        undo_tail: BlockNumber::INVALID,
        undo_tail_first_counter: 1,
        oldest: UndoPtr {
            counter: 1,
            block: BlockNumber::INVALID,
            offset: 0,
        },
        fpm_head: BlockNumber::INVALID,
        flags: 0,
    }
}

/// Creates the meta page in an empty relation. `attrs` lists the user
/// attributes; the tid tree entry is added in front. All roots start
/// invalid.
pub fn init_meta(pool: &BufferPool, attrs: &[AttrType]) -> Result<()> {
    if pool.nblocks() != 0 {
        return Err(ColstoreError::Invalid("relation is not empty"));
    }
    if attrs.len() > MAX_ATTRIBUTES {
        return Err(ColstoreError::Invalid("too many attributes"));
    }
    for attr in attrs {
        attr.validate()?;
    }
    let mut page = pool.extend()?;
    if page.block != META_BLOCK {
        return Err(ColstoreError::Invalid("meta page must be block 0"));
    }
    let buf = page.data_mut();
    catalog::init_typed(buf, &initial_opaque())?;
    write_u16(buf, META_NATTS.start, attrs.len() as u16);
    buf[META_RESERVED].fill(0);
    write_u64(buf, META_NEXT_TID.start, Tid::MIN.0);
    let entries = std::iter::once(AttrType::TID_TREE).chain(attrs.iter().copied());
    for (idx, attr) in entries.enumerate() {
        write_entry(
            buf,
            idx,
            AttrEntry {
                root: BlockNumber::INVALID,
                attr,
            },
        );
    }
    let lower = META_DIRECTORY + (attrs.len() + 1) * DIR_ENTRY_LEN;
    let upper = page::PageHeader::decode_unchecked(buf).upper as usize;
    page::set_bounds(buf, lower, upper);
    debug!(natts = attrs.len(), "meta.init");
    Ok(())
}

/// Reads the meta page under a shared lock.
pub fn read_meta(pool: &BufferPool) -> Result<MetaSnapshot> {
    let page = pool.read(META_BLOCK)?;
    decode_snapshot(page.data())
}

/// Root of the tree for `attno`, read under a shared lock.
pub fn read_root(pool: &BufferPool, attno: AttrNum) -> Result<BlockNumber> {
    let page = pool.read(META_BLOCK)?;
    let buf = page.data();
    catalog::expect_header::<MetaOpaque>(META_BLOCK, buf)?;
    let natts = read_u16(buf, META_NATTS.start) as usize;
    if attno as usize > natts {
        return Err(ColstoreError::NotFound("attribute"));
    }
    Ok(read_entry(buf, attno as usize)?.root)
}

fn decode_snapshot(buf: &[u8]) -> Result<MetaSnapshot> {
    let opaque = catalog::expect_trailer::<MetaOpaque>(META_BLOCK, buf)?;
    let natts = read_u16(buf, META_NATTS.start) as usize;
    let hdr = page::PageHeader::decode_unchecked(buf);
    if META_DIRECTORY + (natts + 1) * DIR_ENTRY_LEN != hdr.lower as usize {
        return Err(ColstoreError::PageCorruption {
            block: META_BLOCK,
            detail: "attribute directory does not match page bounds",
        });
    }
    let attrs = (0..=natts)
        .map(|idx| read_entry(buf, idx))
        .collect::<Result<Vec<_>>>()?;
    Ok(MetaSnapshot {
        opaque,
        next_tid: Tid(read_u64(buf, META_NEXT_TID.start)),
        attrs,
    })
}

fn entry_range(idx: usize) -> Range<usize> {
    let start = META_DIRECTORY + idx * DIR_ENTRY_LEN;
    start..start + DIR_ENTRY_LEN
}

fn read_entry(buf: &[u8], idx: usize) -> Result<AttrEntry> {
    let r = entry_range(idx);
    let attr = AttrType {
        length: read_u16(buf, r.start + 4) as i16,
        by_value: buf[r.start + 6] != 0,
    };
    attr.validate().map_err(|_| ColstoreError::PageCorruption {
        block: META_BLOCK,
        detail: "invalid attribute type in directory",
    })?;
    Ok(AttrEntry {
        root: BlockNumber(read_u32(buf, r.start)),
        attr,
    })
}

fn write_entry(buf: &mut [u8], idx: usize, entry: AttrEntry) {
    let r = entry_range(idx);
    write_u32(buf, r.start, entry.root.0);
    write_u16(buf, r.start + 4, entry.attr.length as u16);
    buf[r.start + 6] = entry.attr.by_value as u8;
    buf[r.start + 7] = 0;
    write_u32(buf, r.start + 8, 0);
}

/// Exclusive handle on the meta page.
///
/// Lock order: B-tree pages may be held while acquiring this guard; undo,
/// TOAST and free pages are only locked after it.
pub struct MetaGuard<'a> {
    pool: &'a BufferPool,
    page: PageMut<'a>,
    opaque: MetaOpaque,
}

impl<'a> MetaGuard<'a> {
    /// Takes the meta page exclusively.
    pub fn lock(pool: &'a BufferPool) -> Result<Self> {
        let page = pool.write(META_BLOCK)?;
        let opaque = catalog::expect_trailer::<MetaOpaque>(META_BLOCK, page.data())?;
        Ok(Self { pool, page, opaque })
    }

    /// Buffer pool the guard allocates from.
    pub fn pool(&self) -> &'a BufferPool {
        self.pool
    }

    pub fn opaque(&self) -> &MetaOpaque {
        &self.opaque
    }

    /// Replaces the trailer.
    pub fn set_opaque(&mut self, opaque: MetaOpaque) {
        self.opaque = opaque;
        catalog::write_trailer(self.page.data_mut(), &self.opaque);
    }

    /// Directory entry for `attno`.
    pub fn entry(&self, attno: AttrNum) -> Result<AttrEntry> {
        let natts = read_u16(self.page.data(), META_NATTS.start) as usize;
        if attno as usize > natts {
            return Err(ColstoreError::NotFound("attribute"));
        }
        read_entry(self.page.data(), attno as usize)
    }

    /// Points the directory entry of `attno` at a new root.
    pub fn set_root(&mut self, attno: AttrNum, root: BlockNumber) -> Result<()> {
        let mut entry = self.entry(attno)?;
        entry.root = root;
        write_entry(self.page.data_mut(), attno as usize, entry);
        debug!(attno, root = root.0, "meta.set_root");
        Ok(())
    }

    /// Reserves `count` consecutive tids and returns the first.
    pub fn reserve_tids(&mut self, count: u64) -> Result<Tid> {
        let buf = self.page.data_mut();
        let first = read_u64(buf, META_NEXT_TID.start);
        let next = first
            .checked_add(count)
            .filter(|n| *n < Tid::MAX_PLUS_ONE.0)
            .ok_or(ColstoreError::Invalid("tid space exhausted"))?;
        write_u64(buf, META_NEXT_TID.start, next);
        Ok(Tid(first))
    }

    /// Pops the free-list head, or extends the relation when the list is
    /// empty. The page comes back exclusively locked and zeroed.
    pub fn allocate(&mut self) -> Result<PageMut<'a>> {
        let head = self.opaque.fpm_head;
        if !head.is_valid() {
            let page = self.pool.extend()?;
            trace!(block = page.block.0, "meta.allocate.extend");
            return Ok(page);
        }
        let mut page = self.pool.write(head)?;
        let free = catalog::expect_trailer::<FreeOpaque>(head, page.data())?;
        let mut opaque = self.opaque;
        opaque.fpm_head = free.next;
        self.set_opaque(opaque);
        page.data_mut().fill(0);
        trace!(block = head.0, next = free.next.0, "meta.allocate.reuse");
        Ok(page)
    }

    /// Pushes a page the caller already holds exclusively onto the free
    /// list.
    pub fn free_locked(&mut self, page: &mut PageMut<'_>) -> Result<()> {
        if page.block == META_BLOCK {
            return Err(ColstoreError::Invalid("cannot free the meta page"));
        }
        catalog::init_typed(
            page.data_mut(),
            &FreeOpaque {
                next: self.opaque.fpm_head,
            },
        )?;
        let mut opaque = self.opaque;
        opaque.fpm_head = page.block;
        self.set_opaque(opaque);
        trace!(block = page.block.0, "meta.free");
        Ok(())
    }

    /// Locks `block` and pushes it onto the free list.
    pub fn free_block(&mut self, block: BlockNumber) -> Result<()> {
        if block == META_BLOCK {
            return Err(ColstoreError::Invalid("cannot free the meta page"));
        }
        let mut page = self.pool.write(block)?;
        self.free_locked(&mut page)
    }
}

/// Allocates one page under a short-lived meta lock.
pub fn allocate_page(pool: &BufferPool) -> Result<PageMut<'_>> {
    let mut meta = MetaGuard::lock(pool)?;
    meta.allocate()
}

/// Walks the free list. Used by inspection and verification.
pub fn free_list(pool: &BufferPool) -> Result<Vec<BlockNumber>> {
    let mut block = read_meta(pool)?.opaque.fpm_head;
    let mut out = Vec::new();
    while block.is_valid() {
        if out.len() as u32 > pool.nblocks() {
            return Err(ColstoreError::Corruption("free list contains a cycle"));
        }
        out.push(block);
        let page = pool.read(block)?;
        block = catalog::expect_trailer::<FreeOpaque>(block, page.data())?.next;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::io::MemFileIo;
    use crate::primitives::pager::PoolOptions;
    use std::sync::Arc;

    fn pool() -> BufferPool {
        let options = PoolOptions {
            cache_pages: 8,
            ..PoolOptions::default()
        };
        BufferPool::new(Arc::new(MemFileIo::new()), options).unwrap()
    }

    #[test]
    fn fresh_meta_page_reports_empty_state() {
        let pool = pool();
        init_meta(&pool, &[AttrType::by_value(4).unwrap(), AttrType::VARLENA]).unwrap();
        let snap = read_meta(&pool).unwrap();
        assert_eq!(snap.opaque.undo_head, snap.opaque.undo_tail);
        assert_eq!(snap.opaque.fpm_head, BlockNumber::INVALID);
        assert_eq!(snap.opaque.flags, 0);
        assert_eq!(snap.next_tid, Tid::MIN);
        assert_eq!(snap.natts(), 2);
        assert_eq!(snap.entry(0).unwrap().attr, AttrType::TID_TREE);
        assert_eq!(snap.entry(2).unwrap().attr, AttrType::VARLENA);
        assert!(snap.entry(3).is_err());
    }

    #[test]
    fn free_list_is_lifo_and_reuses_pages() {
        let pool = pool();
        init_meta(&pool, &[]).unwrap();
        let blocks: Vec<_> = (0..3).map(|_| allocate_page(&pool).unwrap().block).collect();
        assert_eq!(blocks, vec![BlockNumber(1), BlockNumber(2), BlockNumber(3)]);
        {
            let mut meta = MetaGuard::lock(&pool).unwrap();
            meta.free_block(BlockNumber(1)).unwrap();
            meta.free_block(BlockNumber(3)).unwrap();
        }
        assert_eq!(free_list(&pool).unwrap(), vec![BlockNumber(3), BlockNumber(1)]);
        assert_eq!(allocate_page(&pool).unwrap().block, BlockNumber(3));
        assert_eq!(allocate_page(&pool).unwrap().block, BlockNumber(1));
        assert_eq!(allocate_page(&pool).unwrap().block, BlockNumber(4));
        assert!(free_list(&pool).unwrap().is_empty());
    }

    #[test]
    fn reserve_tids_and_roots_persist() {
        let pool = pool();
        init_meta(&pool, &[AttrType::by_value(8).unwrap()]).unwrap();
        {
            let mut meta = MetaGuard::lock(&pool).unwrap();
            assert_eq!(meta.reserve_tids(10).unwrap(), Tid(1));
            assert_eq!(meta.reserve_tids(5).unwrap(), Tid(11));
            meta.set_root(1, BlockNumber(7)).unwrap();
            assert!(meta.set_root(2, BlockNumber(7)).is_err());
        }
        let snap = read_meta(&pool).unwrap();
        assert_eq!(snap.next_tid, Tid(16));
        assert_eq!(snap.entry(1).unwrap().root, BlockNumber(7));
    }

    #[test]
    fn freeing_meta_page_is_rejected() {
        let pool = pool();
        init_meta(&pool, &[]).unwrap();
        let mut meta = MetaGuard::lock(&pool).unwrap();
        assert!(meta.free_block(META_BLOCK).is_err());
    }
}
