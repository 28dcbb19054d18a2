use crate::primitives::bytes::var;
use crate::types::{ColstoreError, Result, Tid};

use super::{AttItem, AttrType, Datum, TOAST_POINTER_LEN};

/// A chunk is closed once it holds this many elements.
pub const CHUNK_MAX_ELEMS: usize = 128;
/// A chunk is closed once its body reaches this many bytes.
pub const CHUNK_TARGET_BODY: usize = 1024;
/// Largest gap between consecutive tids; the low bit of each element code
/// carries the null flag.
pub const MAX_TID_DELTA: u64 = u64::MAX >> 1;

/// Encodes `items` as a chunk sequence continuing after `prev_tid`.
///
/// Tids must be strictly increasing and greater than `prev_tid`; values must
/// match `attr`.
pub fn encode_chunks(attr: AttrType, prev_tid: Tid, items: &[AttItem]) -> Result<Vec<u8>> {
    attr.validate()?;
    let mut out = Vec::new();
    let mut body = Vec::with_capacity(CHUNK_TARGET_BODY + 64);
    let mut chunk_prev = prev_tid;
    let mut last = prev_tid;
    let mut first = Tid::INVALID;
    let mut count = 0usize;

    for item in items {
        if item.tid <= last || item.tid == Tid::MAX_PLUS_ONE {
            return Err(ColstoreError::Invalid("stream tids must be strictly increasing"));
        }
        if count == 0 {
            first = item.tid;
        }
        let delta = item.tid.0 - last.0;
        if delta > MAX_TID_DELTA {
            return Err(ColstoreError::Invalid("tid gap too large for a stream element"));
        }
        let isnull = item.datum.is_null() as u64;
        var::encode_u64((delta << 1) | isnull, &mut body);
        encode_value(attr, &item.datum, &mut body)?;
        last = item.tid;
        count += 1;

        if count == CHUNK_MAX_ELEMS || body.len() >= CHUNK_TARGET_BODY {
            flush_chunk(&mut out, &mut body, chunk_prev, first, last, count);
            chunk_prev = last;
            count = 0;
        }
    }
    if count > 0 {
        flush_chunk(&mut out, &mut body, chunk_prev, first, last, count);
    }
    Ok(out)
}

fn flush_chunk(
    out: &mut Vec<u8>,
    body: &mut Vec<u8>,
    prev: Tid,
    first: Tid,
    last: Tid,
    count: usize,
) {
    var::encode_u64(count as u64, out);
    var::encode_u64(first.0 - prev.0, out);
    var::encode_u64(last.0 - first.0, out);
    var::encode_u64(body.len() as u64, out);
    out.extend_from_slice(body);
    body.clear();
}

fn encode_value(attr: AttrType, datum: &Datum, out: &mut Vec<u8>) -> Result<()> {
    match (attr.fixed_len(), datum) {
        (_, Datum::Null) => Ok(()),
        (Some(len), Datum::Value(bytes)) => {
            if bytes.len() != len {
                return Err(ColstoreError::Invalid("fixed-length value has wrong width"));
            }
            out.extend_from_slice(bytes);
            Ok(())
        }
        (Some(_), Datum::Toast(_)) => Err(ColstoreError::Invalid(
            "only variable-length values can be toasted",
        )),
        (None, Datum::Value(bytes)) => {
            var::encode_u64((bytes.len() as u64) << 1, out);
            out.extend_from_slice(bytes);
            Ok(())
        }
        (None, Datum::Toast(ptr)) => {
            var::encode_u64(((TOAST_POINTER_LEN as u64) << 1) | 1, out);
            out.extend_from_slice(&ptr.to_bytes());
            Ok(())
        }
    }
}
