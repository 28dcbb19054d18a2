//! Generic page layout shared by every page type.
//!
//! ```text
//! 0        16                lower        upper            special      8192
//! | header | low-side data -> |   free    | <- high-side data | trailer |tag|
//! ```
//!
//! The header records the free-space bounds; the type-specific opaque
//! trailer occupies `[special, PAGE_SIZE)` and always ends with the 2-byte
//! page-type tag.

use super::{page_crc32, BlockNumber, ColstoreError, Result};

/// Engine-wide page size.
pub const PAGE_SIZE: usize = 8192;
/// Length of the generic header.
pub const PAGE_HDR_LEN: usize = 16;
/// Current header layout version.
pub const PAGE_LAYOUT_VERSION: u16 = 1;
/// Size of the page-type tag at the very end of every page.
pub const PAGE_TAG_LEN: usize = 2;

/// Byte offsets of the header fields.
pub mod header {
    use core::ops::Range;

    pub const CHECKSUM: Range<usize> = 0..4;
    pub const FLAGS: Range<usize> = 4..6;
    pub const LOWER: Range<usize> = 6..8;
    pub const UPPER: Range<usize> = 8..10;
    pub const SPECIAL: Range<usize> = 10..12;
    pub const VERSION: Range<usize> = 12..14;
    pub const RESERVED: Range<usize> = 14..16;
}

/// Decoded generic header.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PageHeader {
    /// Stored checksum, 0 until the page is first written out.
    pub checksum: u32,
    /// Page-level flag bits (currently unused, always 0).
    pub flags: u16,
    /// End of the low-side data area.
    pub lower: u16,
    /// Start of the high-side data area.
    pub upper: u16,
    /// Start of the opaque trailer.
    pub special: u16,
    /// Header layout version.
    pub version: u16,
}

impl PageHeader {
    /// Header of a freshly initialised, empty page with a trailer of
    /// `special_size` bytes.
    pub fn empty(special_size: usize) -> Result<Self> {
        if special_size < PAGE_TAG_LEN || PAGE_HDR_LEN + special_size > PAGE_SIZE {
            return Err(ColstoreError::Invalid("special size out of range"));
        }
        let special = (PAGE_SIZE - special_size) as u16;
        Ok(Self {
            checksum: 0,
            flags: 0,
            lower: PAGE_HDR_LEN as u16,
            upper: special,
            special,
            version: PAGE_LAYOUT_VERSION,
        })
    }

    /// Writes the header into the first [`PAGE_HDR_LEN`] bytes of `dst`.
    pub fn encode(&self, dst: &mut [u8]) {
        dst[header::CHECKSUM].copy_from_slice(&self.checksum.to_be_bytes());
        dst[header::FLAGS].copy_from_slice(&self.flags.to_be_bytes());
        dst[header::LOWER].copy_from_slice(&self.lower.to_be_bytes());
        dst[header::UPPER].copy_from_slice(&self.upper.to_be_bytes());
        dst[header::SPECIAL].copy_from_slice(&self.special.to_be_bytes());
        dst[header::VERSION].copy_from_slice(&self.version.to_be_bytes());
        dst[header::RESERVED].fill(0);
    }

    /// Decodes and validates the free-space bounds of `src`.
    pub fn decode(block: BlockNumber, src: &[u8]) -> Result<Self> {
        if src.len() < PAGE_SIZE {
            return Err(ColstoreError::PageCorruption {
                block,
                detail: "page shorter than PAGE_SIZE",
            });
        }
        let hdr = Self::decode_unchecked(src);
        if hdr.version != PAGE_LAYOUT_VERSION {
            return Err(ColstoreError::PageCorruption {
                block,
                detail: "unsupported page layout version",
            });
        }
        let (lower, upper, special) = (
            hdr.lower as usize,
            hdr.upper as usize,
            hdr.special as usize,
        );
        if lower < PAGE_HDR_LEN || lower > upper || upper > special || special > PAGE_SIZE {
            return Err(ColstoreError::PageCorruption {
                block,
                detail: "page free-space bounds out of order",
            });
        }
        Ok(hdr)
    }

    /// Reads the raw fields without validating them.
    pub fn decode_unchecked(src: &[u8]) -> Self {
        Self {
            checksum: read_u32(src, header::CHECKSUM.start),
            flags: read_u16(src, header::FLAGS.start),
            lower: read_u16(src, header::LOWER.start),
            upper: read_u16(src, header::UPPER.start),
            special: read_u16(src, header::SPECIAL.start),
            version: read_u16(src, header::VERSION.start),
        }
    }

    /// Exact number of unused bytes between the two data areas.
    pub fn free_space(&self) -> usize {
        (self.upper as usize).saturating_sub(self.lower as usize)
    }

    /// Size of the opaque trailer in bytes.
    pub fn special_size(&self) -> usize {
        PAGE_SIZE.saturating_sub(self.special as usize)
    }
}

/// Zeroes `page` and lays down an empty header plus a trailer of
/// `special_size` bytes ending in `tag`.
pub fn init_page(page: &mut [u8], special_size: usize, tag: u16) -> Result<PageHeader> {
    let hdr = PageHeader::empty(special_size)?;
    page[..PAGE_SIZE].fill(0);
    hdr.encode(page);
    write_tag(page, tag);
    Ok(hdr)
}

/// Reads the page-type tag from the final two bytes.
pub fn read_tag(page: &[u8]) -> u16 {
    read_u16(page, PAGE_SIZE - PAGE_TAG_LEN)
}

/// Writes the page-type tag into the final two bytes.
pub fn write_tag(page: &mut [u8], tag: u16) {
    write_u16(page, PAGE_SIZE - PAGE_TAG_LEN, tag);
}

/// Updates the `lower`/`upper` bounds in place.
pub fn set_bounds(page: &mut [u8], lower: usize, upper: usize) {
    debug_assert!(lower <= upper && upper <= PAGE_SIZE);
    write_u16(page, header::LOWER.start, lower as u16);
    write_u16(page, header::UPPER.start, upper as u16);
}

/// Returns `true` for a page that has never been initialised.
pub fn is_new(page: &[u8]) -> bool {
    page[..PAGE_SIZE].iter().all(|b| *b == 0)
}

/// Computes and stores the page checksum. Called on write-out.
pub fn stamp_checksum(block: BlockNumber, page: &mut [u8]) {
    page[header::CHECKSUM].fill(0);
    let crc = page_crc32(block.0, &page[..PAGE_SIZE]);
    page[header::CHECKSUM].copy_from_slice(&crc.to_be_bytes());
}

/// Verifies the checksum written by [`stamp_checksum`]. New pages pass.
pub fn verify_checksum(block: BlockNumber, page: &[u8]) -> Result<()> {
    if is_new(page) {
        return Ok(());
    }
    let stored = read_u32(page, header::CHECKSUM.start);
    let mut scratch = page[..PAGE_SIZE].to_vec();
    scratch[header::CHECKSUM].fill(0);
    if page_crc32(block.0, &scratch) != stored {
        return Err(ColstoreError::PageCorruption {
            block,
            detail: "page checksum mismatch",
        });
    }
    Ok(())
}

pub(crate) fn read_u16(src: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([src[off], src[off + 1]])
}

pub(crate) fn read_u32(src: &[u8], off: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&src[off..off + 4]);
    u32::from_be_bytes(b)
}

pub(crate) fn read_u64(src: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&src[off..off + 8]);
    u64::from_be_bytes(b)
}

pub(crate) fn write_u16(dst: &mut [u8], off: usize, v: u16) {
    dst[off..off + 2].copy_from_slice(&v.to_be_bytes());
}

pub(crate) fn write_u32(dst: &mut [u8], off: usize, v: u32) {
    dst[off..off + 4].copy_from_slice(&v.to_be_bytes());
}

pub(crate) fn write_u64(dst: &mut [u8], off: usize, v: u64) {
    dst[off..off + 8].copy_from_slice(&v.to_be_bytes());
}
