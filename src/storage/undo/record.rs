//! Undo record layout.
//!
//! ```text
//! 0     2    3     4          18    26    30    38          52           56
//! | size|kind|flags| self ptr | xid | cid | tid | prev ptr  | payload_len| payload...
//! ```

use core::ops::Range;

use crate::types::{
    page::{read_u16, read_u32, read_u64, write_u16, write_u32, write_u64},
    ColstoreError, Result, Tid, UndoPtr, UNDO_PTR_LEN,
};

/// Fixed header length of every record.
pub const UNDO_REC_HDR_LEN: usize = 56;

const SIZE: usize = 0;
const KIND: usize = 2;
const FLAGS: usize = 3;
const SELF_PTR: Range<usize> = 4..4 + UNDO_PTR_LEN;
const XID: usize = 18;
const CID: usize = 26;
const TID: usize = 30;
const PREV_PTR: Range<usize> = 38..38 + UNDO_PTR_LEN;
const PAYLOAD_LEN: usize = 52;

/// Record flag bits.
pub mod flags {
    /// Payload lives in a TOAST chain; the record stores the pointer.
    pub const SPILLED: u8 = 0x01;
}

/// What a record describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize)]
pub enum UndoKind {
    Insert,
    Delete,
    Update,
    Lock,
}

impl UndoKind {
    pub fn code(self) -> u8 {
        match self {
            UndoKind::Insert => 1,
            UndoKind::Delete => 2,
            UndoKind::Update => 3,
            UndoKind::Lock => 4,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => UndoKind::Insert,
            2 => UndoKind::Delete,
            3 => UndoKind::Update,
            4 => UndoKind::Lock,
            _ => return None,
        })
    }
}

/// Row lock strength carried by [`UndoKind::Lock`] records.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    Share,
    Exclusive,
}

impl LockMode {
    fn code(self) -> u8 {
        match self {
            LockMode::Share => 1,
            LockMode::Exclusive => 2,
        }
    }
}

/// Decoded record header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UndoRecordHeader {
    /// Bytes the record occupies on its page.
    pub size: u16,
    pub kind: UndoKind,
    pub flags: u8,
    /// Position of the record itself.
    pub ptr: UndoPtr,
    pub xid: u64,
    pub cid: u32,
    pub tid: Tid,
    /// Previous record for the same row.
    pub prev: UndoPtr,
    /// Logical payload length, whether inline or spilled.
    pub payload_len: u32,
}

impl UndoRecordHeader {
    pub fn is_spilled(&self) -> bool {
        self.flags & flags::SPILLED != 0
    }

    pub(crate) fn encode(&self, dst: &mut [u8]) {
        write_u16(dst, SIZE, self.size);
        dst[KIND] = self.kind.code();
        dst[FLAGS] = self.flags;
        dst[SELF_PTR].copy_from_slice(&self.ptr.to_bytes());
        write_u64(dst, XID, self.xid);
        write_u32(dst, CID, self.cid);
        write_u64(dst, TID, self.tid.0);
        dst[PREV_PTR].copy_from_slice(&self.prev.to_bytes());
        write_u32(dst, PAYLOAD_LEN, self.payload_len);
    }

    pub(crate) fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < UNDO_REC_HDR_LEN {
            return Err(ColstoreError::Corruption("undo record header truncated"));
        }
        let kind = UndoKind::from_code(src[KIND])
            .ok_or(ColstoreError::Corruption("unknown undo record kind"))?;
        let size = read_u16(src, SIZE);
        if (size as usize) < UNDO_REC_HDR_LEN {
            return Err(ColstoreError::Corruption("undo record shorter than its header"));
        }
        Ok(Self {
            size,
            kind,
            flags: src[FLAGS],
            ptr: UndoPtr::from_bytes(&src[SELF_PTR])?,
            xid: read_u64(src, XID),
            cid: read_u32(src, CID),
            tid: Tid(read_u64(src, TID)),
            prev: UndoPtr::from_bytes(&src[PREV_PTR])?,
            payload_len: read_u32(src, PAYLOAD_LEN),
        })
    }
}

/// A record ready to be appended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewUndoRecord {
    pub kind: UndoKind,
    pub xid: u64,
    pub cid: u32,
    pub tid: Tid,
    pub prev: UndoPtr,
    pub payload: Vec<u8>,
}

impl NewUndoRecord {
    pub fn insert(tid: Tid, xid: u64, cid: u32) -> Self {
        Self::bare(UndoKind::Insert, tid, xid, cid, UndoPtr::INVALID)
    }

    pub fn delete(tid: Tid, xid: u64, cid: u32, prev: UndoPtr) -> Self {
        Self::bare(UndoKind::Delete, tid, xid, cid, prev)
    }

    /// Update of `tid` whose new version lives at `new_tid`.
    pub fn update(tid: Tid, new_tid: Tid, xid: u64, cid: u32, prev: UndoPtr) -> Self {
        let mut rec = Self::bare(UndoKind::Update, tid, xid, cid, prev);
        rec.payload = new_tid.0.to_be_bytes().to_vec();
        rec
    }

    pub fn lock(tid: Tid, mode: LockMode, xid: u64, cid: u32, prev: UndoPtr) -> Self {
        let mut rec = Self::bare(UndoKind::Lock, tid, xid, cid, prev);
        rec.payload = vec![mode.code()];
        rec
    }

    /// Replaces the payload.
    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    fn bare(kind: UndoKind, tid: Tid, xid: u64, cid: u32, prev: UndoPtr) -> Self {
        Self {
            kind,
            xid,
            cid,
            tid,
            prev,
            payload: Vec::new(),
        }
    }
}

/// A fetched record with its payload materialised.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UndoRecord {
    pub header: UndoRecordHeader,
    pub payload: Vec<u8>,
}

impl UndoRecord {
    /// New tid recorded by an update.
    pub fn updated_tid(&self) -> Option<Tid> {
        if self.header.kind != UndoKind::Update || self.payload.len() < 8 {
            return None;
        }
        Some(Tid(read_u64(&self.payload, 0)))
    }

    pub fn lock_mode(&self) -> Option<LockMode> {
        if self.header.kind != UndoKind::Lock {
            return None;
        }
        match self.payload.first() {
            Some(1) => Some(LockMode::Share),
            Some(2) => Some(LockMode::Exclusive),
            _ => None,
        }
    }
}
