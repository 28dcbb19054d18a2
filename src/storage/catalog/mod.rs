#![forbid(unsafe_code)]
//! Page catalog: type tags and the typed opaque trailers of every page kind.
//!
//! The last two bytes of each page carry its type tag. The trailer size is
//! fixed per type and is checked against the header's `special` offset before
//! any trailer field is read.

use core::fmt;

use serde::Serialize;

use crate::types::{
    page::{
        self, read_u16, read_u32, read_u64, write_u16, write_u32, write_u64, PageHeader,
        PAGE_SIZE,
    },
    AttrNum, BlockNumber, ColstoreError, Result, Tid, UndoPtr,
};

/// Tag of the meta page.
pub const META_PAGE_TAG: u16 = 0xF083;
/// Tag of B-tree pages.
pub const BTREE_PAGE_TAG: u16 = 0xF084;
/// Tag of undo log pages.
pub const UNDO_PAGE_TAG: u16 = 0xF085;
/// Tag of TOAST chunk pages.
pub const TOAST_PAGE_TAG: u16 = 0xF086;
/// Tag of pages on the free list.
pub const FREE_PAGE_TAG: u16 = 0xF087;

pub const META_TRAILER_LEN: usize = 48;
pub const BTREE_TRAILER_LEN: usize = 32;
pub const UNDO_TRAILER_LEN: usize = 16;
pub const TOAST_TRAILER_LEN: usize = 40;
pub const FREE_TRAILER_LEN: usize = 8;

/// Set on the root page of each attribute tree.
pub const BTREE_FLAG_ROOT: u16 = 0x0001;

/// Page classification by trailing tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum PageType {
    Meta,
    Btree,
    Undo,
    Toast,
    Free,
    /// Never-initialised, all-zero page.
    New,
    /// Tag not produced by this engine.
    Unrecognized(u16),
}

impl PageType {
    /// Maps a raw tag to its page type.
    pub fn from_tag(tag: u16) -> Self {
        match tag {
            META_PAGE_TAG => PageType::Meta,
            BTREE_PAGE_TAG => PageType::Btree,
            UNDO_PAGE_TAG => PageType::Undo,
            TOAST_PAGE_TAG => PageType::Toast,
            FREE_PAGE_TAG => PageType::Free,
            other => PageType::Unrecognized(other),
        }
    }

    /// Fixed opaque trailer size for engine page types.
    pub fn trailer_len(self) -> Option<usize> {
        match self {
            PageType::Meta => Some(META_TRAILER_LEN),
            PageType::Btree => Some(BTREE_TRAILER_LEN),
            PageType::Undo => Some(UNDO_TRAILER_LEN),
            PageType::Toast => Some(TOAST_TRAILER_LEN),
            PageType::Free => Some(FREE_TRAILER_LEN),
            PageType::New | PageType::Unrecognized(_) => None,
        }
    }
}

impl fmt::Display for PageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageType::Meta => f.write_str("META"),
            PageType::Btree => f.write_str("BTREE"),
            PageType::Undo => f.write_str("UNDO"),
            PageType::Toast => f.write_str("TOAST"),
            PageType::Free => f.write_str("FREE"),
            PageType::New => f.write_str("NEW"),
            PageType::Unrecognized(tag) => write!(f, "UNKNOWN {tag:#06x}"),
        }
    }
}

/// Classifies a page by its trailing tag. Never fails.
pub fn classify(page: &[u8]) -> PageType {
    if page.len() < PAGE_SIZE {
        return PageType::Unrecognized(0);
    }
    if page::is_new(page) {
        return PageType::New;
    }
    PageType::from_tag(page::read_tag(page))
}

/// A fixed-size opaque trailer.
pub trait Opaque: Sized {
    /// Trailer size including the tag.
    const LEN: usize;
    /// Page tag.
    const TAG: u16;

    /// Decodes from the `LEN`-byte trailer slice.
    fn decode(src: &[u8]) -> Self;
    /// Encodes into the `LEN`-byte trailer slice, tag included.
    fn encode(&self, dst: &mut [u8]);
}

fn trailer_slice<T: Opaque>(page: &[u8]) -> &[u8] {
    &page[PAGE_SIZE - T::LEN..PAGE_SIZE]
}

/// Zeroes `page` and initialises it as a `T` page carrying `opaque`.
pub fn init_typed<T: Opaque>(page: &mut [u8], opaque: &T) -> Result<PageHeader> {
    let hdr = page::init_page(page, T::LEN, T::TAG)?;
    write_trailer(page, opaque);
    Ok(hdr)
}

/// Overwrites the trailer of a page already initialised as `T`.
pub fn write_trailer<T: Opaque>(page: &mut [u8], opaque: &T) {
    opaque.encode(&mut page[PAGE_SIZE - T::LEN..PAGE_SIZE]);
}

/// Strict access path: the tag and the special size must both match `T`.
pub fn expect_trailer<T: Opaque>(block: BlockNumber, page: &[u8]) -> Result<T> {
    expect_header::<T>(block, page)?;
    Ok(T::decode(trailer_slice::<T>(page)))
}

/// Validates tag, special size and header bounds for a `T` page.
pub fn expect_header<T: Opaque>(block: BlockNumber, page: &[u8]) -> Result<PageHeader> {
    if page.len() < PAGE_SIZE {
        return Err(ColstoreError::PageCorruption {
            block,
            detail: "page shorter than PAGE_SIZE",
        });
    }
    let found = page::read_tag(page);
    if found != T::TAG {
        return Err(ColstoreError::PageTypeMismatch {
            block,
            expected: T::TAG,
            found,
        });
    }
    let raw = PageHeader::decode_unchecked(page);
    let special_size = raw.special_size();
    if special_size != T::LEN {
        return Err(ColstoreError::SpecialSizeMismatch {
            block,
            expected: T::LEN,
            found: special_size,
        });
    }
    PageHeader::decode(block, page)
}

/// Typed trailer of any engine page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Trailer {
    Meta(MetaOpaque),
    Btree(BtreeOpaque),
    Undo(UndoOpaque),
    Toast(ToastOpaque),
    Free(FreeOpaque),
}

/// Lenient classification result used by inspection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageClass {
    /// All-zero page.
    New,
    /// Known tag with a matching trailer size.
    Typed(Trailer),
    /// Known tag but the special area has the wrong size.
    Malformed { tag: u16, special_size: usize },
    /// Unknown tag.
    Unrecognized(u16),
}

/// Classifies `page` and decodes its trailer when the layout is consistent.
pub fn inspect(page: &[u8]) -> PageClass {
    let ty = classify(page);
    let Some(expected) = ty.trailer_len() else {
        return match ty {
            PageType::New => PageClass::New,
            PageType::Unrecognized(tag) => PageClass::Unrecognized(tag),
            _ => PageClass::Unrecognized(0),
        };
    };
    let special_size = PageHeader::decode_unchecked(page).special_size();
    let tag = page::read_tag(page);
    if special_size != expected {
        return PageClass::Malformed { tag, special_size };
    }
    let trailer = match ty {
        PageType::Meta => Trailer::Meta(MetaOpaque::decode(trailer_slice::<MetaOpaque>(page))),
        PageType::Btree => Trailer::Btree(BtreeOpaque::decode(trailer_slice::<BtreeOpaque>(page))),
        PageType::Undo => Trailer::Undo(UndoOpaque::decode(trailer_slice::<UndoOpaque>(page))),
        PageType::Toast => Trailer::Toast(ToastOpaque::decode(trailer_slice::<ToastOpaque>(page))),
        PageType::Free => Trailer::Free(FreeOpaque::decode(trailer_slice::<FreeOpaque>(page))),
        PageType::New | PageType::Unrecognized(_) => return PageClass::Unrecognized(tag),
    };
    PageClass::Typed(trailer)
}

/// Meta page trailer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MetaOpaque {
    pub undo_head: BlockNumber,
    pub undo_tail: BlockNumber,
    /// Counter of the first record on the tail page.
    pub undo_tail_first_counter: u64,
    /// Records older than this may be reclaimed.
    pub oldest: UndoPtr,
    /// Head of the free page list.
    pub fpm_head: BlockNumber,
    pub flags: u32,
}

impl Opaque for MetaOpaque {
    const LEN: usize = META_TRAILER_LEN;
    const TAG: u16 = META_PAGE_TAG;

    fn decode(src: &[u8]) -> Self {
        Self {
            undo_head: BlockNumber(read_u32(src, 0)),
            undo_tail: BlockNumber(read_u32(src, 4)),
            undo_tail_first_counter: read_u64(src, 8),
            oldest: UndoPtr {
                counter: read_u64(src, 16),
                block: BlockNumber(read_u32(src, 24)),
                offset: read_u16(src, 28),
            },
            fpm_head: BlockNumber(read_u32(src, 32)),
            flags: read_u32(src, 36),
        }
    }

    fn encode(&self, dst: &mut [u8]) {
        write_u32(dst, 0, self.undo_head.0);
        write_u32(dst, 4, self.undo_tail.0);
        write_u64(dst, 8, self.undo_tail_first_counter);
        write_u64(dst, 16, self.oldest.counter);
        write_u32(dst, 24, self.oldest.block.0);
        write_u16(dst, 28, self.oldest.offset);
        dst[30..32].fill(0);
        write_u32(dst, 32, self.fpm_head.0);
        write_u32(dst, 36, self.flags);
        dst[40..46].fill(0);
        write_u16(dst, 46, Self::TAG);
    }
}

/// B-tree page trailer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BtreeOpaque {
    /// Right sibling on the same level.
    pub next: BlockNumber,
    pub attno: AttrNum,
    /// 0 for leaves.
    pub level: u16,
    pub lokey: Tid,
    pub hikey: Tid,
    pub flags: u16,
}

impl BtreeOpaque {
    /// Returns `true` if `tid` falls in `[lokey, hikey)`.
    pub fn covers(&self, tid: Tid) -> bool {
        self.lokey <= tid && tid < self.hikey
    }

    pub fn is_root(&self) -> bool {
        self.flags & BTREE_FLAG_ROOT != 0
    }
}

impl Opaque for BtreeOpaque {
    const LEN: usize = BTREE_TRAILER_LEN;
    const TAG: u16 = BTREE_PAGE_TAG;

    fn decode(src: &[u8]) -> Self {
        Self {
            next: BlockNumber(read_u32(src, 0)),
            attno: read_u16(src, 4),
            level: read_u16(src, 6),
            lokey: Tid(read_u64(src, 8)),
            hikey: Tid(read_u64(src, 16)),
            flags: read_u16(src, 24),
        }
    }

    fn encode(&self, dst: &mut [u8]) {
        write_u32(dst, 0, self.next.0);
        write_u16(dst, 4, self.attno);
        write_u16(dst, 6, self.level);
        write_u64(dst, 8, self.lokey.0);
        write_u64(dst, 16, self.hikey.0);
        write_u16(dst, 24, self.flags);
        dst[26..30].fill(0);
        write_u16(dst, 30, Self::TAG);
    }
}

/// Undo page trailer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UndoOpaque {
    /// Counter of the first record on this page.
    pub first_counter: u64,
    /// Next (newer) undo page.
    pub next: BlockNumber,
    pub nrecords: u16,
}

impl Opaque for UndoOpaque {
    const LEN: usize = UNDO_TRAILER_LEN;
    const TAG: u16 = UNDO_PAGE_TAG;

    fn decode(src: &[u8]) -> Self {
        Self {
            first_counter: read_u64(src, 0),
            next: BlockNumber(read_u32(src, 8)),
            nrecords: read_u16(src, 12),
        }
    }

    fn encode(&self, dst: &mut [u8]) {
        write_u64(dst, 0, self.first_counter);
        write_u32(dst, 8, self.next.0);
        write_u16(dst, 12, self.nrecords);
        write_u16(dst, 14, Self::TAG);
    }
}

/// TOAST chunk page trailer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ToastOpaque {
    /// Owning row.
    pub tid: Tid,
    /// Logical size of the whole value.
    pub total_size: u64,
    /// Offset of this chunk inside the value.
    pub slice_offset: u64,
    pub prev: BlockNumber,
    pub next: BlockNumber,
    /// Payload size after decompression.
    pub decompressed_size: u32,
    pub is_compressed: bool,
}

impl Opaque for ToastOpaque {
    const LEN: usize = TOAST_TRAILER_LEN;
    const TAG: u16 = TOAST_PAGE_TAG;

    fn decode(src: &[u8]) -> Self {
        Self {
            tid: Tid(read_u64(src, 0)),
            total_size: read_u64(src, 8),
            slice_offset: read_u64(src, 16),
            prev: BlockNumber(read_u32(src, 24)),
            next: BlockNumber(read_u32(src, 28)),
            decompressed_size: read_u32(src, 32),
            is_compressed: src[36] != 0,
        }
    }

    fn encode(&self, dst: &mut [u8]) {
        write_u64(dst, 0, self.tid.0);
        write_u64(dst, 8, self.total_size);
        write_u64(dst, 16, self.slice_offset);
        write_u32(dst, 24, self.prev.0);
        write_u32(dst, 28, self.next.0);
        write_u32(dst, 32, self.decompressed_size);
        dst[36] = self.is_compressed as u8;
        dst[37] = 0;
        write_u16(dst, 38, Self::TAG);
    }
}

/// Free page trailer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FreeOpaque {
    pub next: BlockNumber,
}

impl Opaque for FreeOpaque {
    const LEN: usize = FREE_TRAILER_LEN;
    const TAG: u16 = FREE_PAGE_TAG;

    fn decode(src: &[u8]) -> Self {
        Self {
            next: BlockNumber(read_u32(src, 0)),
        }
    }

    fn encode(&self, dst: &mut [u8]) {
        write_u32(dst, 0, self.next.0);
        dst[4..6].fill(0);
        write_u16(dst, 6, Self::TAG);
    }
}
