#![forbid(unsafe_code)]
//! Append-only undo log.
//!
//! Records are packed from the page header upwards; `lower` marks the next
//! free byte. The meta page tracks head, tail and the counter of the first
//! record on the tail page, and serializes every append.

mod record;
mod visibility;

use std::sync::Arc;

use tracing::{debug, trace, warn};

pub use record::{
    flags as record_flags, LockMode, NewUndoRecord, UndoKind, UndoRecord, UndoRecordHeader,
    UNDO_REC_HDR_LEN,
};
pub use visibility::{AllVisible, CounterSnapshot, TupleVisibility, VisibilityOracle};

use crate::primitives::pager::BufferPool;
use crate::storage::attstream::{ToastPointer, TOAST_POINTER_LEN};
use crate::storage::catalog::{self, UndoOpaque, UNDO_TRAILER_LEN};
use crate::storage::meta::{self, MetaGuard};
use crate::storage::toast::Toast;
use crate::types::{
    page::{self, PageHeader, PAGE_HDR_LEN, PAGE_SIZE},
    BlockNumber, ColstoreError, Result, UndoPtr,
};

/// Bytes available for records on one undo page.
pub const UNDO_PAGE_USABLE: usize = PAGE_SIZE - PAGE_HDR_LEN - UNDO_TRAILER_LEN;

/// Per-page summary reported by [`UndoLog::pages`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UndoPageSummary {
    pub block: BlockNumber,
    pub nrecords: u16,
    pub free_space: usize,
    pub first: UndoPtr,
    pub last: UndoPtr,
    pub next: BlockNumber,
}

/// Undo log of one relation.
pub struct UndoLog {
    pool: Arc<BufferPool>,
    toast: Arc<Toast>,
}

impl UndoLog {
    pub fn new(pool: Arc<BufferPool>, toast: Arc<Toast>) -> Self {
        Self { pool, toast }
    }

    /// Appends `rec` and returns its pointer.
    ///
    /// A payload that cannot share a page with its header is stored in
    /// TOAST first, and the record then starts a fresh page.
    pub fn append(&self, rec: NewUndoRecord) -> Result<UndoPtr> {
        let payload_len = u32::try_from(rec.payload.len())
            .map_err(|_| ColstoreError::Invalid("undo payload too large"))?;
        let (stored, spill) = if UNDO_REC_HDR_LEN + rec.payload.len() > UNDO_PAGE_USABLE {
            let ptr = self.toast.store(rec.tid, &rec.payload)?;
            (ptr.to_bytes().to_vec(), Some(ptr))
        } else {
            (rec.payload, None)
        };
        let header = UndoRecordHeader {
            size: (UNDO_REC_HDR_LEN + stored.len()) as u16,
            kind: rec.kind,
            flags: if spill.is_some() { record_flags::SPILLED } else { 0 },
            ptr: UndoPtr::INVALID,
            xid: rec.xid,
            cid: rec.cid,
            tid: rec.tid,
            prev: rec.prev,
            payload_len,
        };

        let appended = self.place(header, &stored);
        if let (Err(err), Some(ptr)) = (&appended, spill) {
            // `place` has released the meta lock.
            match self.toast.delete(rec.tid, ptr) {
                Ok(pages) => debug!(tid = rec.tid.0, pages, %err, "undo.append.spill_freed"),
                Err(cleanup) => warn!(tid = rec.tid.0, %err, %cleanup, "undo.append.spill_leaked"),
            }
        }
        appended
    }

    /// Writes an encoded record at the tail, opening a new page when it does
    /// not fit or when its payload was spilled.
    fn place(&self, mut header: UndoRecordHeader, stored: &[u8]) -> Result<UndoPtr> {
        let spilled = header.is_spilled();
        let size = header.size as usize;
        let mut meta = MetaGuard::lock(&self.pool)?;
        let tail = meta.opaque().undo_tail;
        let mut counter = meta.opaque().undo_tail_first_counter;
        if tail.is_valid() {
            let mut page = self.pool.write(tail)?;
            let hdr = catalog::expect_header::<UndoOpaque>(tail, page.data())?;
            let mut opaque = catalog::expect_trailer::<UndoOpaque>(tail, page.data())?;
            counter = opaque.first_counter + opaque.nrecords as u64;
            if !spilled && hdr.free_space() >= size {
                let offset = hdr.lower as usize;
                header.ptr = UndoPtr {
                    counter,
                    block: tail,
                    offset: offset as u16,
                };
                write_record(page.data_mut(), offset, &header, stored);
                opaque.nrecords += 1;
                catalog::write_trailer(page.data_mut(), &opaque);
                trace!(counter, block = tail.0, offset, size, "undo.append");
                return Ok(header.ptr);
            }
        }

        let mut page = meta.allocate()?;
        let block = page.block;
        let opaque = UndoOpaque {
            first_counter: counter,
            next: BlockNumber::INVALID,
            nrecords: 1,
        };
        catalog::init_typed(page.data_mut(), &opaque)?;
        header.ptr = UndoPtr {
            counter,
            block,
            offset: PAGE_HDR_LEN as u16,
        };
        write_record(page.data_mut(), PAGE_HDR_LEN, &header, stored);
        drop(page);

        if tail.is_valid() {
            let mut old = self.pool.write(tail)?;
            let mut old_opaque = catalog::expect_trailer::<UndoOpaque>(tail, old.data())?;
            old_opaque.next = block;
            catalog::write_trailer(old.data_mut(), &old_opaque);
        }
        let mut m = *meta.opaque();
        m.undo_tail = block;
        m.undo_tail_first_counter = counter;
        if !m.undo_head.is_valid() {
            m.undo_head = block;
        }
        meta.set_opaque(m);
        debug!(counter, block = block.0, spilled, "undo.append.new_page");
        Ok(header.ptr)
    }

    /// Reads the header at `ptr` after validating that it lives there.
    pub fn fetch_header(&self, ptr: UndoPtr) -> Result<UndoRecordHeader> {
        Ok(self.locate(ptr)?.0)
    }

    /// Reads the record at `ptr`, following a spilled payload into TOAST.
    pub fn fetch(&self, ptr: UndoPtr) -> Result<UndoRecord> {
        let (header, stored) = self.locate(ptr)?;
        let payload = if header.is_spilled() {
            let toast = ToastPointer::from_bytes(&stored)?;
            let value = self.toast.fetch(header.tid, toast)?;
            if value.len() != header.payload_len as usize {
                return Err(ColstoreError::PageCorruption {
                    block: ptr.block,
                    detail: "spilled undo payload has wrong length",
                });
            }
            value
        } else {
            stored
        };
        Ok(UndoRecord { header, payload })
    }

    fn locate(&self, ptr: UndoPtr) -> Result<(UndoRecordHeader, Vec<u8>)> {
        if !ptr.is_valid() || !ptr.block.is_valid() {
            return Err(ColstoreError::Invalid("invalid undo pointer"));
        }
        let page = self.pool.read(ptr.block)?;
        let data = page.data();
        let hdr = catalog::expect_header::<UndoOpaque>(ptr.block, data)?;
        let opaque = catalog::expect_trailer::<UndoOpaque>(ptr.block, data)?;
        let corrupt = |detail| ColstoreError::PageCorruption {
            block: ptr.block,
            detail,
        };
        if ptr.counter < opaque.first_counter
            || ptr.counter >= opaque.first_counter + opaque.nrecords as u64
        {
            return Err(corrupt("undo pointer counter outside its page"));
        }
        let offset = ptr.offset as usize;
        if offset < PAGE_HDR_LEN || offset + UNDO_REC_HDR_LEN > hdr.lower as usize {
            return Err(corrupt("undo pointer offset outside record area"));
        }
        let header = UndoRecordHeader::decode(&data[offset..])
            .map_err(|_| corrupt("undecodable undo record"))?;
        if header.ptr != ptr {
            return Err(corrupt("undo record self pointer mismatch"));
        }
        let end = offset + header.size as usize;
        if end > hdr.lower as usize {
            return Err(corrupt("undo record overruns page"));
        }
        let stored = data[offset + UNDO_REC_HDR_LEN..end].to_vec();
        let expected = if header.is_spilled() {
            TOAST_POINTER_LEN
        } else {
            header.payload_len as usize
        };
        if stored.len() != expected {
            return Err(corrupt("undo record payload length mismatch"));
        }
        Ok((header, stored))
    }

    /// Decides whether the version anchored at `ptr` is visible.
    ///
    /// Pointers older than the retained horizon are visible to everyone.
    pub fn resolve(&self, ptr: UndoPtr, oracle: &dyn VisibilityOracle) -> Result<TupleVisibility> {
        let oldest = meta::read_meta(&self.pool)?.opaque.oldest.counter;
        let mut cur = ptr;
        loop {
            if !cur.is_valid() || cur.counter < oldest {
                return Ok(TupleVisibility::Visible);
            }
            let rec = self.fetch_header(cur)?;
            let seen = oracle.sees(&rec);
            match rec.kind {
                UndoKind::Insert => {
                    return Ok(if seen {
                        TupleVisibility::Visible
                    } else {
                        TupleVisibility::Invisible
                    })
                }
                UndoKind::Delete | UndoKind::Update if seen => {
                    return Ok(TupleVisibility::Invisible)
                }
                UndoKind::Delete | UndoKind::Update | UndoKind::Lock => {}
            }
            if rec.prev.is_valid() && rec.prev.counter >= cur.counter {
                return Err(ColstoreError::PageCorruption {
                    block: cur.block,
                    detail: "undo prev pointer does not move backwards",
                });
            }
            cur = rec.prev;
        }
    }

    /// Counter the next appended record will receive.
    pub fn next_counter(&self) -> Result<u64> {
        let m = meta::read_meta(&self.pool)?.opaque;
        if !m.undo_tail.is_valid() {
            return Ok(m.undo_tail_first_counter);
        }
        let page = self.pool.read(m.undo_tail)?;
        let opaque = catalog::expect_trailer::<UndoOpaque>(m.undo_tail, page.data())?;
        Ok(opaque.first_counter + opaque.nrecords as u64)
    }

    /// Moves the retained horizon forward to `horizon` and frees every
    /// non-tail page whose records all lie below it, along with their
    /// spilled payloads. Returns the number of undo pages freed.
    pub fn advance_oldest(&self, horizon: u64) -> Result<usize> {
        let mut meta = MetaGuard::lock(&self.pool)?;
        let mut m = *meta.opaque();
        let next_counter = if m.undo_tail.is_valid() {
            let page = self.pool.read(m.undo_tail)?;
            let tail = catalog::expect_trailer::<UndoOpaque>(m.undo_tail, page.data())?;
            tail.first_counter + tail.nrecords as u64
        } else {
            m.undo_tail_first_counter
        };
        let horizon = horizon.min(next_counter);
        if horizon <= m.oldest.counter {
            return Ok(0);
        }

        let mut freed = 0usize;
        let mut head = m.undo_head;
        while head.is_valid() && head != m.undo_tail {
            let mut page = self.pool.write(head)?;
            let opaque = catalog::expect_trailer::<UndoOpaque>(head, page.data())?;
            if opaque.first_counter + opaque.nrecords as u64 > horizon {
                break;
            }
            for rec in page_records(head, page.data())? {
                let (header, stored) = rec;
                if header.is_spilled() {
                    let ptr = ToastPointer::from_bytes(&stored)?;
                    self.toast.delete_with(&mut meta, header.tid, ptr)?;
                }
            }
            meta.free_locked(&mut page)?;
            trace!(block = head.0, "undo.reclaim.page");
            freed += 1;
            head = opaque.next;
        }

        let oldest = self.pointer_for(head, horizon)?;
        m = *meta.opaque();
        m.undo_head = head;
        m.oldest = oldest;
        meta.set_opaque(m);
        debug!(horizon, freed, head = head.0, "undo.advance_oldest");
        Ok(freed)
    }

    /// Pointer of the record numbered `counter`, searching from `block`.
    /// A counter past the last record maps to an invalid block.
    fn pointer_for(&self, mut block: BlockNumber, counter: u64) -> Result<UndoPtr> {
        while block.is_valid() {
            let page = self.pool.read(block)?;
            let opaque = catalog::expect_trailer::<UndoOpaque>(block, page.data())?;
            if counter < opaque.first_counter + opaque.nrecords as u64 {
                for (header, _) in page_records(block, page.data())? {
                    if header.ptr.counter == counter {
                        return Ok(header.ptr);
                    }
                }
                return Err(ColstoreError::PageCorruption {
                    block,
                    detail: "undo counter missing from its page",
                });
            }
            block = opaque.next;
        }
        Ok(UndoPtr {
            counter,
            block: BlockNumber::INVALID,
            offset: 0,
        })
    }

    /// Walks the chain from the meta page's head.
    pub fn pages(&self) -> Result<UndoPages<'_>> {
        let head = meta::read_meta(&self.pool)?.opaque.undo_head;
        Ok(UndoPages {
            pool: &self.pool,
            next: head,
            seen: 0,
        })
    }
}

/// Iterator returned by [`UndoLog::pages`].
pub struct UndoPages<'a> {
    pool: &'a BufferPool,
    next: BlockNumber,
    seen: u32,
}

impl Iterator for UndoPages<'_> {
    type Item = Result<UndoPageSummary>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.next.is_valid() {
            return None;
        }
        let block = self.next;
        self.seen += 1;
        if self.seen > self.pool.nblocks() {
            self.next = BlockNumber::INVALID;
            return Some(Err(ColstoreError::Corruption("undo chain contains a cycle")));
        }
        let summary = summarize_undo_page(self.pool, block);
        self.next = match &summary {
            Ok(s) => s.next,
            Err(_) => BlockNumber::INVALID,
        };
        Some(summary)
    }
}

/// Summary of one undo page.
pub fn summarize_undo_page(pool: &BufferPool, block: BlockNumber) -> Result<UndoPageSummary> {
    let page = pool.read(block)?;
    let data = page.data();
    let hdr = catalog::expect_header::<UndoOpaque>(block, data)?;
    let opaque = catalog::expect_trailer::<UndoOpaque>(block, data)?;
    let records = page_records(block, data)?;
    let first = records.first().map_or(UndoPtr::INVALID, |(h, _)| h.ptr);
    let last = records.last().map_or(UndoPtr::INVALID, |(h, _)| h.ptr);
    Ok(UndoPageSummary {
        block,
        nrecords: opaque.nrecords,
        free_space: hdr.free_space(),
        first,
        last,
        next: opaque.next,
    })
}

fn write_record(page: &mut [u8], offset: usize, header: &UndoRecordHeader, stored: &[u8]) {
    header.encode(&mut page[offset..offset + UNDO_REC_HDR_LEN]);
    let end = offset + UNDO_REC_HDR_LEN + stored.len();
    page[offset + UNDO_REC_HDR_LEN..end].copy_from_slice(stored);
    let upper = PageHeader::decode_unchecked(page).upper as usize;
    page::set_bounds(page, end, upper);
}

fn page_records(block: BlockNumber, data: &[u8]) -> Result<Vec<(UndoRecordHeader, Vec<u8>)>> {
    let hdr = catalog::expect_header::<UndoOpaque>(block, data)?;
    let opaque = catalog::expect_trailer::<UndoOpaque>(block, data)?;
    let lower = hdr.lower as usize;
    let corrupt = |detail| ColstoreError::PageCorruption { block, detail };
    let mut out = Vec::with_capacity(opaque.nrecords as usize);
    let mut off = PAGE_HDR_LEN;
    while off < lower {
        if off + UNDO_REC_HDR_LEN > lower {
            return Err(corrupt("undo record header crosses lower bound"));
        }
        let header = UndoRecordHeader::decode(&data[off..])
            .map_err(|_| corrupt("undecodable undo record"))?;
        let expected = UndoPtr {
            counter: opaque.first_counter + out.len() as u64,
            block,
            offset: off as u16,
        };
        if header.ptr != expected {
            return Err(corrupt("undo record self pointer mismatch"));
        }
        let end = off + header.size as usize;
        if end > lower {
            return Err(corrupt("undo record overruns page"));
        }
        out.push((header, data[off + UNDO_REC_HDR_LEN..end].to_vec()));
        off = end;
    }
    if out.len() != opaque.nrecords as usize {
        return Err(corrupt("undo record count disagrees with trailer"));
    }
    Ok(out)
}
