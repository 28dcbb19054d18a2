#![forbid(unsafe_code)]
//! Attribute stream codec.
//!
//! A stream holds `(tid, datum)` pairs for one attribute in strictly
//! increasing tid order, packed into self-delimiting chunks:
//!
//! ```text
//! stream : header(24) payload
//! payload: chunk* | snappy(chunk*)
//! chunk  : num_elems first_delta span body_len body      (all varints)
//! body   : (code [value])*      code = (tid_delta << 1) | isnull
//! ```
//!
//! Each chunk is decodable from its own bytes plus the last tid of the chunk
//! before it, so decoding can resume from any chunk boundary.

mod decode;
mod encode;

use std::borrow::Cow;

use bytes::Bytes;

use crate::storage::options::{Compression, MAX_INLINE_VARLENA};
use crate::types::{
    page::{read_u16, read_u32, read_u64, write_u16, write_u32, write_u64},
    BlockNumber, ColstoreError, Result, Tid, UNDO_PTR_LEN,
};

pub use decode::{decode_chunk, AttStreamDecoder, DecodedChunk, StreamItems};
pub use encode::{encode_chunks, CHUNK_MAX_ELEMS, CHUNK_TARGET_BODY};

/// Size of the stream header.
pub const STREAM_HDR_LEN: usize = 24;
/// Stream payload is Snappy-compressed.
pub const ATTSTREAM_COMPRESSED: u16 = 0x0001;
/// Encoded size of a [`ToastPointer`].
pub const TOAST_POINTER_LEN: usize = 12;

/// Physical type of an attribute.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct AttrType {
    /// Passed by value (1, 2, 4 or 8 bytes).
    pub by_value: bool,
    /// Fixed width in bytes, or -1 for variable length.
    pub length: i16,
}

impl AttrType {
    /// Variable-length, by-reference attribute.
    pub const VARLENA: AttrType = AttrType {
        by_value: false,
        length: -1,
    };

    /// Value type of the tid tree: the row's undo pointer.
    pub const TID_TREE: AttrType = AttrType {
        by_value: false,
        length: UNDO_PTR_LEN as i16,
    };

    /// Fixed-width by-value attribute of `len` bytes.
    pub fn by_value(len: i16) -> Result<Self> {
        let attr = AttrType {
            by_value: true,
            length: len,
        };
        attr.validate()?;
        Ok(attr)
    }

    /// Fixed-width by-reference attribute of `len` bytes.
    pub fn fixed(len: i16) -> Result<Self> {
        let attr = AttrType {
            by_value: false,
            length: len,
        };
        attr.validate()?;
        Ok(attr)
    }

    /// Checks the combination of `by_value` and `length`.
    pub fn validate(&self) -> Result<()> {
        match (self.by_value, self.length) {
            (true, 1 | 2 | 4 | 8) => Ok(()),
            (true, _) => Err(ColstoreError::Invalid(
                "by-value attributes must be 1, 2, 4 or 8 bytes wide",
            )),
            (false, -1) => Ok(()),
            (false, len) if len > 0 && len as usize <= MAX_INLINE_VARLENA => Ok(()),
            (false, _) => Err(ColstoreError::Invalid("invalid attribute length")),
        }
    }

    /// Returns `true` for variable-length attributes.
    pub fn is_varlena(&self) -> bool {
        self.length == -1
    }

    /// Width of fixed-length values.
    pub fn fixed_len(&self) -> Option<usize> {
        (self.length > 0).then_some(self.length as usize)
    }
}

/// Reference to a value stored out of line. The owning tid is the tid of
/// the element carrying the pointer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ToastPointer {
    /// First chunk of the chain.
    pub first_block: BlockNumber,
    /// Logical size of the value.
    pub total_size: u64,
}

impl ToastPointer {
    pub fn to_bytes(&self) -> [u8; TOAST_POINTER_LEN] {
        let mut out = [0u8; TOAST_POINTER_LEN];
        write_u32(&mut out, 0, self.first_block.0);
        write_u64(&mut out, 4, self.total_size);
        out
    }

    pub fn from_bytes(src: &[u8]) -> Result<Self> {
        if src.len() != TOAST_POINTER_LEN {
            return Err(ColstoreError::Corruption("toast pointer has wrong length"));
        }
        Ok(Self {
            first_block: BlockNumber(read_u32(src, 0)),
            total_size: read_u64(src, 4),
        })
    }
}

/// Value of one attribute for one row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Datum {
    Null,
    Value(Bytes),
    /// Varlena value moved to TOAST.
    Toast(ToastPointer),
}

impl Datum {
    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }
}

/// One stream element.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttItem {
    pub tid: Tid,
    pub datum: Datum,
}

impl AttItem {
    pub fn new(tid: Tid, datum: Datum) -> Self {
        Self { tid, datum }
    }
}

/// Decoded stream header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamHeader {
    /// Stored size including this header.
    pub size: u32,
    /// Length of the chunk image once decompressed.
    pub decompressed_size: u32,
    /// Capacity needed to hold the decompressed image.
    pub decompressed_bufsize: u32,
    pub flags: u16,
    /// Tid of the last element in the stream.
    pub lasttid: Tid,
}

impl StreamHeader {
    pub fn is_compressed(&self) -> bool {
        self.flags & ATTSTREAM_COMPRESSED != 0
    }

    fn encode(&self, dst: &mut [u8]) {
        write_u32(dst, 0, self.size);
        write_u32(dst, 4, self.decompressed_size);
        write_u32(dst, 8, self.decompressed_bufsize);
        write_u16(dst, 12, self.flags);
        write_u16(dst, 14, 0);
        write_u64(dst, 16, self.lasttid.0);
    }

    fn decode(src: &[u8]) -> Self {
        Self {
            size: read_u32(src, 0),
            decompressed_size: read_u32(src, 4),
            decompressed_bufsize: read_u32(src, 8),
            flags: read_u16(src, 12),
            lasttid: Tid(read_u64(src, 16)),
        }
    }
}

/// A self-contained attribute stream: header plus stored payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttStream {
    pub header: StreamHeader,
    payload: Bytes,
}

impl AttStream {
    /// Encodes `items` and applies `compression` when it makes the stream
    /// smaller.
    pub fn build(attr: AttrType, items: &[AttItem], compression: Compression) -> Result<Self> {
        let chunks = encode_chunks(attr, Tid::INVALID, items)?;
        let lasttid = items.last().map(|i| i.tid).unwrap_or(Tid::INVALID);
        Self::from_chunks(chunks, lasttid, compression)
    }

    /// Wraps an already encoded chunk sequence.
    pub fn from_chunks(chunks: Vec<u8>, lasttid: Tid, compression: Compression) -> Result<Self> {
        let raw_len = u32::try_from(chunks.len())
            .map_err(|_| ColstoreError::Invalid("attribute stream too large"))?;
        let (payload, flags) = match compression {
            Compression::Snappy if !chunks.is_empty() => {
                let compressed = snap::raw::Encoder::new()
                    .compress_vec(&chunks)
                    .map_err(|_| ColstoreError::Invalid("snappy rejected stream payload"))?;
                if compressed.len() < chunks.len() {
                    (compressed, ATTSTREAM_COMPRESSED)
                } else {
                    (chunks, 0)
                }
            }
            _ => (chunks, 0),
        };
        let size = (STREAM_HDR_LEN + payload.len()) as u32;
        Ok(Self {
            header: StreamHeader {
                size,
                decompressed_size: raw_len,
                decompressed_bufsize: raw_len,
                flags,
                lasttid,
            },
            payload: Bytes::from(payload),
        })
    }

    /// Parses a stream from the start of `src`. Trailing bytes are ignored.
    pub fn parse(block: BlockNumber, src: &[u8]) -> Result<Self> {
        if src.len() < STREAM_HDR_LEN {
            return Err(ColstoreError::PageCorruption {
                block,
                detail: "attribute stream shorter than its header",
            });
        }
        let header = StreamHeader::decode(src);
        let size = header.size as usize;
        if size < STREAM_HDR_LEN || size > src.len() {
            return Err(ColstoreError::PageCorruption {
                block,
                detail: "attribute stream size exceeds its region",
            });
        }
        if header.flags & !ATTSTREAM_COMPRESSED != 0 {
            return Err(ColstoreError::PageCorruption {
                block,
                detail: "unknown attribute stream flags",
            });
        }
        if header.decompressed_size > header.decompressed_bufsize
            || (!header.is_compressed() && header.decompressed_size as usize != size - STREAM_HDR_LEN)
        {
            return Err(ColstoreError::PageCorruption {
                block,
                detail: "attribute stream sizes inconsistent",
            });
        }
        Ok(Self {
            header,
            payload: Bytes::copy_from_slice(&src[STREAM_HDR_LEN..size]),
        })
    }

    /// Stored size in bytes, header included.
    pub fn stored_len(&self) -> usize {
        STREAM_HDR_LEN + self.payload.len()
    }

    pub fn is_compressed(&self) -> bool {
        self.header.is_compressed()
    }

    /// Stored payload (compressed image when compressed).
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Writes header and payload into `dst`, which must be `stored_len` long.
    pub fn write_to(&self, dst: &mut [u8]) {
        debug_assert_eq!(dst.len(), self.stored_len());
        self.header.encode(&mut dst[..STREAM_HDR_LEN]);
        dst[STREAM_HDR_LEN..].copy_from_slice(&self.payload);
    }

    /// Header and payload as one buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.stored_len()];
        self.write_to(&mut out);
        out
    }

    /// The logical chunk sequence, decompressing when needed.
    pub fn chunk_image(&self, block: BlockNumber) -> Result<Cow<'_, Bytes>> {
        if !self.is_compressed() {
            return Ok(Cow::Borrowed(&self.payload));
        }
        let decoded_len = snap::raw::decompress_len(&self.payload).map_err(|err| {
            ColstoreError::Decompression {
                block,
                reason: err.to_string(),
            }
        })?;
        if decoded_len != self.header.decompressed_size as usize {
            return Err(ColstoreError::Decompression {
                block,
                reason: format!(
                    "decompressed length {decoded_len} does not match header {}",
                    self.header.decompressed_size
                ),
            });
        }
        let image = snap::raw::Decoder::new()
            .decompress_vec(&self.payload)
            .map_err(|err| ColstoreError::Decompression {
                block,
                reason: err.to_string(),
            })?;
        Ok(Cow::Owned(Bytes::from(image)))
    }

    /// Lazy decoder over the stream's elements.
    pub fn decoder(&self, attr: AttrType, block: BlockNumber) -> Result<AttStreamDecoder> {
        let image = self.chunk_image(block)?.into_owned();
        Ok(AttStreamDecoder::new(attr, image, self.header.lasttid, block))
    }

    /// Decodes every element.
    pub fn items(&self, attr: AttrType, block: BlockNumber) -> Result<Vec<AttItem>> {
        self.decoder(attr, block)?.into_items().collect()
    }
}
