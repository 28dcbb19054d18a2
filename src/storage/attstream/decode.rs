use bytes::Bytes;

use crate::primitives::bytes::{buf::Cursor, var};
use crate::types::{BlockNumber, ColstoreError, Result, Tid};

use super::{AttItem, AttrType, Datum, ToastPointer, TOAST_POINTER_LEN};

/// One decoded chunk together with its position in the chunk image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedChunk {
    /// Offset of the chunk inside the chunk image.
    pub start: usize,
    /// Encoded length of the chunk.
    pub len: usize,
    /// Last tid of the preceding chunk.
    pub prev_tid: Tid,
    pub first_tid: Tid,
    pub last_tid: Tid,
    /// The encoded chunk bytes.
    pub raw: Bytes,
    pub items: Vec<AttItem>,
}

/// Lazy, restartable decoder over a chunk image.
pub struct AttStreamDecoder {
    attr: AttrType,
    image: Bytes,
    lasttid: Tid,
    block: BlockNumber,
    pos: usize,
    prev_tid: Tid,
}

impl AttStreamDecoder {
    /// Creates a decoder positioned before the first chunk.
    pub fn new(attr: AttrType, image: Bytes, lasttid: Tid, block: BlockNumber) -> Self {
        Self {
            attr,
            image,
            lasttid,
            block,
            pos: 0,
            prev_tid: Tid::INVALID,
        }
    }

    /// Byte offset of the next chunk.
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Last tid of the chunk decoded most recently.
    pub fn prev_tid(&self) -> Tid {
        self.prev_tid
    }

    /// Rewinds to the first chunk.
    pub fn reset(&mut self) {
        self.pos = 0;
        self.prev_tid = Tid::INVALID;
    }

    /// Continues from a chunk boundary previously reported by
    /// [`AttStreamDecoder::pos`], given the last tid before it.
    pub fn resume_at(&mut self, pos: usize, prev_tid: Tid) -> Result<()> {
        if pos > self.image.len() {
            return Err(ColstoreError::Invalid("resume position beyond stream"));
        }
        self.pos = pos;
        self.prev_tid = prev_tid;
        Ok(())
    }

    /// Decodes the next chunk, or returns `None` at the end of the stream.
    pub fn next_chunk(&mut self) -> Result<Option<DecodedChunk>> {
        if self.pos >= self.image.len() {
            if self.prev_tid != self.lasttid && self.pos != 0 {
                return Err(ColstoreError::PageCorruption {
                    block: self.block,
                    detail: "attribute stream ends before its last tid",
                });
            }
            return Ok(None);
        }
        let chunk = decode_chunk_at(self.attr, &self.image, self.pos, self.prev_tid)
            .map_err(|err| attach_block(err, self.block))?;
        if chunk.last_tid > self.lasttid {
            return Err(ColstoreError::PageCorruption {
                block: self.block,
                detail: "attribute chunk extends past the stream's last tid",
            });
        }
        self.pos = chunk.start + chunk.len;
        self.prev_tid = chunk.last_tid;
        Ok(Some(chunk))
    }

    /// Element iterator decoding one chunk at a time.
    pub fn into_items(self) -> StreamItems {
        StreamItems {
            decoder: self,
            pending: Vec::new().into_iter(),
            done: false,
        }
    }
}

/// Iterator over the elements of a stream.
pub struct StreamItems {
    decoder: AttStreamDecoder,
    pending: std::vec::IntoIter<AttItem>,
    done: bool,
}

impl Iterator for StreamItems {
    type Item = Result<AttItem>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.pending.next() {
                return Some(Ok(item));
            }
            if self.done {
                return None;
            }
            match self.decoder.next_chunk() {
                Ok(Some(chunk)) => self.pending = chunk.items.into_iter(),
                Ok(None) => {
                    self.done = true;
                    return None;
                }
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }
    }
}

/// Decodes a single chunk outside of any page context.
///
/// `raw` must hold exactly one chunk whose last tid equals `last_tid`.
pub fn decode_chunk(
    attr: AttrType,
    prev_tid: Tid,
    last_tid: Tid,
    raw: &[u8],
) -> Result<DecodedChunk> {
    attr.validate()?;
    let image = Bytes::copy_from_slice(raw);
    let chunk = decode_chunk_at(attr, &image, 0, prev_tid)?;
    if chunk.len != raw.len() {
        return Err(ColstoreError::Corruption("trailing bytes after chunk"));
    }
    if chunk.last_tid != last_tid {
        return Err(ColstoreError::Corruption("chunk last tid does not match"));
    }
    Ok(chunk)
}

fn attach_block(err: ColstoreError, block: BlockNumber) -> ColstoreError {
    match err {
        ColstoreError::Corruption(detail) => ColstoreError::PageCorruption { block, detail },
        other => other,
    }
}

fn decode_chunk_at(attr: AttrType, image: &Bytes, start: usize, prev_tid: Tid) -> Result<DecodedChunk> {
    let mut cur = Cursor::at(&image[..], start);
    let num_elems = cur.varint()?;
    let first_delta = cur.varint()?;
    let span = cur.varint()?;
    let body_len = cur.length()?;
    if num_elems == 0 {
        return Err(ColstoreError::Corruption("empty attribute chunk"));
    }
    if first_delta == 0 {
        return Err(ColstoreError::Corruption("chunk does not advance past previous tid"));
    }
    let first_tid = prev_tid
        .0
        .checked_add(first_delta)
        .ok_or(ColstoreError::Corruption("chunk first tid overflows"))?;
    let last_tid = first_tid
        .checked_add(span)
        .ok_or(ColstoreError::Corruption("chunk span overflows"))?;
    let body_start = cur.position();
    cur.take(body_len)?;
    let end = cur.position();
    if num_elems as usize > body_len {
        return Err(ColstoreError::Corruption("chunk element count exceeds body"));
    }

    let mut items = Vec::with_capacity(num_elems as usize);
    let mut off = body_start;
    let mut tid = prev_tid.0;
    for i in 0..num_elems {
        let code = var::decode_u64(&image[..end], &mut off)?;
        let delta = code >> 1;
        let isnull = code & 1 == 1;
        if delta == 0 || (i == 0 && delta != first_delta) {
            return Err(ColstoreError::Corruption("chunk tid delta inconsistent"));
        }
        tid = tid
            .checked_add(delta)
            .ok_or(ColstoreError::Corruption("chunk tid overflows"))?;
        let datum = if isnull {
            Datum::Null
        } else {
            decode_value(attr, image, end, &mut off)?
        };
        items.push(AttItem::new(Tid(tid), datum));
    }
    if off != end {
        return Err(ColstoreError::Corruption("chunk body length mismatch"));
    }
    if tid != last_tid {
        return Err(ColstoreError::Corruption("chunk span does not match its elements"));
    }
    Ok(DecodedChunk {
        start,
        len: end - start,
        prev_tid,
        first_tid: Tid(first_tid),
        last_tid: Tid(last_tid),
        raw: image.slice(start..end),
        items,
    })
}

fn decode_value(attr: AttrType, image: &Bytes, end: usize, off: &mut usize) -> Result<Datum> {
    match attr.fixed_len() {
        Some(len) => {
            let value = slice(image, end, off, len)?;
            Ok(Datum::Value(value))
        }
        None => {
            let hdr = var::decode_u64(&image[..end], off)?;
            let len = (hdr >> 1) as usize;
            let value = slice(image, end, off, len)?;
            if hdr & 1 == 1 {
                if len != TOAST_POINTER_LEN {
                    return Err(ColstoreError::Corruption("toast pointer has wrong length"));
                }
                Ok(Datum::Toast(ToastPointer::from_bytes(&value)?))
            } else {
                Ok(Datum::Value(value))
            }
        }
    }
}

fn slice(image: &Bytes, end: usize, off: &mut usize, len: usize) -> Result<Bytes> {
    let stop = off
        .checked_add(len)
        .filter(|stop| *stop <= end)
        .ok_or(ColstoreError::Corruption("value runs past chunk body"))?;
    let value = image.slice(*off..stop);
    *off = stop;
    Ok(value)
}
