//! Read-only page inspection.
//!
//! Every function works on raw pages through the buffer pool and never
//! modifies the relation. Scans over many pages check the interrupt flag
//! once per page.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tracing::warn;

use crate::primitives::pager::BufferPool;
use crate::storage::attstream::{decode_chunk, AttStream, AttrType, Datum, STREAM_HDR_LEN};
use crate::storage::btree::{page as btree_page, Leaf};
use crate::storage::catalog::{self, BtreeOpaque, PageClass, PageType, Trailer};
use crate::storage::meta::{self, META_BLOCK};
use crate::storage::undo::summarize_undo_page;
use crate::types::{
    page::PageHeader, AttrNum, BlockNumber, ColstoreError, Result, Tid, UndoPtr,
};

/// One undo page on the chain from the meta page's head.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct UndoPageRow {
    pub block: BlockNumber,
    pub record_count: u16,
    pub free_space: usize,
    pub first_pointer: UndoPtr,
    pub last_pointer: UndoPtr,
    pub next: BlockNumber,
}

/// One TOAST chunk page.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ToastPageRow {
    pub block: BlockNumber,
    pub owning_tid: Tid,
    pub total_size: u64,
    pub chunk_offset: u64,
    pub prev: BlockNumber,
    pub next: BlockNumber,
    pub decompressed_size: u32,
    pub is_compressed: bool,
}

/// One B-tree page. Size columns are only filled in for leaves.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct BtreePageRow {
    pub block: BlockNumber,
    pub next: BlockNumber,
    pub attno: AttrNum,
    pub level: u16,
    pub lokey: Tid,
    pub hikey: Tid,
    pub item_count: usize,
    pub compressed_count: Option<usize>,
    pub stored_size: Option<usize>,
    pub uncompressed_size: Option<usize>,
    pub free_space: usize,
}

/// Decoded trailer of the meta page.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MetaPageRow {
    pub block: BlockNumber,
    pub undo_head: BlockNumber,
    pub undo_tail: BlockNumber,
    pub undo_tail_first_counter: u64,
    pub oldest_pointer: UndoPtr,
    pub free_list_head: BlockNumber,
    pub flags: u32,
    pub natts: usize,
    pub next_tid: Tid,
    /// Tree roots, tid tree first.
    pub roots: Vec<BlockNumber>,
}

/// One chunk of an attribute stream on a leaf page.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AttStreamChunkRow {
    pub attno: AttrNum,
    pub chunk_no: usize,
    pub upper_stream: bool,
    pub compressed: bool,
    pub attbyval: bool,
    pub attlen: i16,
    pub chunk_start: usize,
    pub chunk_len: usize,
    pub prev_tid: Tid,
    pub first_tid: Tid,
    pub last_tid: Tid,
    pub count: usize,
    /// Hex-encoded chunk bytes.
    pub chunk: String,
}

/// Result of [`decode_attribute_chunk`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DecodedChunkRow {
    pub count: usize,
    pub tids: Vec<Tid>,
    /// Hex-encoded values; empty for nulls, the pointer bytes for toasted
    /// values.
    pub values: Vec<String>,
    pub nulls: Vec<bool>,
    pub toasted: Vec<bool>,
}

/// Decodes one raw chunk without any page context.
pub fn decode_attribute_chunk(
    by_value: bool,
    type_length: i16,
    prev_tid: Tid,
    last_tid: Tid,
    raw: &[u8],
) -> Result<DecodedChunkRow> {
    let attr = AttrType {
        by_value,
        length: type_length,
    };
    let chunk = decode_chunk(attr, prev_tid, last_tid, raw)?;
    let mut row = DecodedChunkRow {
        count: chunk.items.len(),
        tids: Vec::with_capacity(chunk.items.len()),
        values: Vec::with_capacity(chunk.items.len()),
        nulls: Vec::with_capacity(chunk.items.len()),
        toasted: Vec::with_capacity(chunk.items.len()),
    };
    for item in chunk.items {
        row.tids.push(item.tid);
        let (value, null, toasted) = match item.datum {
            Datum::Null => (String::new(), true, false),
            Datum::Value(bytes) => (hex::encode(&bytes), false, false),
            Datum::Toast(ptr) => (hex::encode(ptr.to_bytes()), false, true),
        };
        row.values.push(value);
        row.nulls.push(null);
        row.toasted.push(toasted);
    }
    Ok(row)
}

/// Page inspector over one relation.
pub struct Inspector<'a> {
    pool: &'a BufferPool,
    interrupt: Option<&'a AtomicBool>,
}

impl<'a> Inspector<'a> {
    pub fn new(pool: &'a BufferPool) -> Self {
        Self {
            pool,
            interrupt: None,
        }
    }

    /// Makes page scans fail with `Interrupted` once `flag` is raised.
    pub fn with_interrupt(mut self, flag: &'a AtomicBool) -> Self {
        self.interrupt = Some(flag);
        self
    }

    fn check_interrupt(&self) -> Result<()> {
        match self.interrupt {
            Some(flag) if flag.load(Ordering::Relaxed) => Err(ColstoreError::Interrupted),
            _ => Ok(()),
        }
    }

    fn check_block(&self, block: BlockNumber) -> Result<()> {
        if !block.is_valid() || block.0 >= self.pool.nblocks() {
            return Err(ColstoreError::NotFound("block"));
        }
        Ok(())
    }

    /// Classifies `block` by its trailing tag. Unknown tags are a result,
    /// not an error.
    pub fn page_type(&self, block: BlockNumber) -> Result<PageType> {
        self.check_block(block)?;
        let page = self.pool.read(block)?;
        Ok(catalog::classify(page.data()))
    }

    /// Undo pages from the head of the chain to the tail.
    pub fn scan_undo_pages(&self) -> Result<Vec<UndoPageRow>> {
        let meta = meta::read_meta(self.pool)?.opaque;
        let mut rows = Vec::new();
        let mut seen = HashSet::new();
        let mut block = meta.undo_head;
        while block.is_valid() {
            self.check_interrupt()?;
            if !seen.insert(block) {
                return Err(ColstoreError::PageCorruption {
                    block,
                    detail: "undo page chain contains a cycle",
                });
            }
            let summary = summarize_undo_page(self.pool, block)?;
            rows.push(UndoPageRow {
                block,
                record_count: summary.nrecords,
                free_space: summary.free_space,
                first_pointer: summary.first,
                last_pointer: summary.last,
                next: summary.next,
            });
            block = summary.next;
        }
        Ok(rows)
    }

    /// Every TOAST page in block order.
    pub fn scan_toast_pages(&self) -> Result<Vec<ToastPageRow>> {
        let mut rows = Vec::new();
        for n in 0..self.pool.nblocks() {
            self.check_interrupt()?;
            let block = BlockNumber(n);
            let page = self.pool.read(block)?;
            match catalog::inspect(page.data()) {
                PageClass::Typed(Trailer::Toast(op)) => rows.push(ToastPageRow {
                    block,
                    owning_tid: op.tid,
                    total_size: op.total_size,
                    chunk_offset: op.slice_offset,
                    prev: op.prev,
                    next: op.next,
                    decompressed_size: op.decompressed_size,
                    is_compressed: op.is_compressed,
                }),
                class => skip_malformed(block, class, PageType::Toast),
            }
        }
        Ok(rows)
    }

    /// Every B-tree page in block order.
    pub fn scan_btree_pages(&self) -> Result<Vec<BtreePageRow>> {
        let attrs = meta::read_meta(self.pool)?.attrs;
        let mut rows = Vec::new();
        for n in 0..self.pool.nblocks() {
            self.check_interrupt()?;
            let block = BlockNumber(n);
            let page = self.pool.read(block)?;
            let data = page.data();
            match catalog::inspect(data) {
                PageClass::Typed(Trailer::Btree(op)) => {
                    let attr = attrs
                        .get(op.attno as usize)
                        .map(|e| e.attr)
                        .ok_or(ColstoreError::PageCorruption {
                            block,
                            detail: "btree page names an unknown attribute",
                        })?;
                    rows.push(btree_row(block, data, &op, attr)?);
                }
                class => skip_malformed(block, class, PageType::Btree),
            }
        }
        Ok(rows)
    }

    /// Decoded meta page.
    pub fn meta_page_snapshot(&self) -> Result<MetaPageRow> {
        let snap = meta::read_meta(self.pool)?;
        let m = snap.opaque;
        Ok(MetaPageRow {
            block: META_BLOCK,
            undo_head: m.undo_head,
            undo_tail: m.undo_tail,
            undo_tail_first_counter: m.undo_tail_first_counter,
            oldest_pointer: m.oldest,
            free_list_head: m.fpm_head,
            flags: m.flags,
            natts: snap.natts(),
            next_tid: snap.next_tid,
            roots: snap.attrs.iter().map(|e| e.root).collect(),
        })
    }

    /// Every chunk of both streams on the leaf at `block`.
    pub fn dump_attstreams(&self, block: BlockNumber) -> Result<Vec<AttStreamChunkRow>> {
        self.check_block(block)?;
        let snap = meta::read_meta(self.pool)?;
        let page = self.pool.read(block)?;
        let leaf = Leaf::parse(block, page.data())?;
        let attno = leaf.opaque.attno;
        let attr = snap.entry(attno)?.attr;
        let mut rows = Vec::new();
        for (upper, stream) in [(false, &leaf.lower), (true, &leaf.upper)] {
            let Some(stream) = stream else { continue };
            let mut decoder = stream.decoder(attr, block)?;
            let mut chunk_no = 0;
            while let Some(chunk) = decoder.next_chunk()? {
                rows.push(AttStreamChunkRow {
                    attno,
                    chunk_no,
                    upper_stream: upper,
                    compressed: stream.is_compressed(),
                    attbyval: attr.by_value,
                    attlen: attr.length,
                    chunk_start: chunk.start,
                    chunk_len: chunk.len,
                    prev_tid: chunk.prev_tid,
                    first_tid: chunk.first_tid,
                    last_tid: chunk.last_tid,
                    count: chunk.items.len(),
                    chunk: hex::encode(&chunk.raw),
                });
                chunk_no += 1;
            }
        }
        Ok(rows)
    }
}

fn btree_row(block: BlockNumber, data: &[u8], op: &BtreeOpaque, attr: AttrType) -> Result<BtreePageRow> {
    let free_space = PageHeader::decode(block, data)?.free_space();
    let mut row = BtreePageRow {
        block,
        next: op.next,
        attno: op.attno,
        level: op.level,
        lokey: op.lokey,
        hikey: op.hikey,
        item_count: 0,
        compressed_count: None,
        stored_size: None,
        uncompressed_size: None,
        free_space,
    };
    if op.level > 0 {
        row.item_count = btree_page::internal_items(block, data)?.len();
        return Ok(row);
    }
    let leaf = Leaf::parse(block, data)?;
    let mut compressed = 0;
    let mut uncompressed = 0;
    for (upper, stream) in [(false, &leaf.lower), (true, &leaf.upper)] {
        let Some(stream) = stream else { continue };
        let n = leaf.stream_items(attr, upper)?.len();
        row.item_count += n;
        if stream.is_compressed() {
            compressed += n;
        }
        uncompressed += raw_size(stream);
    }
    row.compressed_count = Some(compressed);
    row.stored_size = Some(leaf.used());
    row.uncompressed_size = Some(uncompressed);
    Ok(row)
}

fn raw_size(stream: &AttStream) -> usize {
    STREAM_HDR_LEN + stream.header.decompressed_size as usize
}

fn skip_malformed(block: BlockNumber, class: PageClass, wanted: PageType) {
    if let PageClass::Malformed { tag, special_size } = class {
        if PageType::from_tag(tag) == wanted {
            warn!(
                block = block.0,
                tag,
                special_size,
                "inspect.skip_malformed"
            );
        }
    }
}
