#![forbid(unsafe_code)]
//! Varints and a bounds-checked reader for attribute-stream chunks.
//!
//! Truncated or overlong input is reported as [`ColstoreError::Corruption`].

use crate::types::{ColstoreError, Result};

pub mod var {
    //! 7-bit little-endian group varints, high bit set on every byte but
    //! the last.

    use super::{ColstoreError, Result};

    /// Longest encoding of a u64.
    pub const MAX_LEN: usize = 10;

    /// Appends `v` to `out`.
    pub fn encode_u64(v: u64, out: &mut Vec<u8>) {
        let len = encoded_len(v);
        out.extend((0..len).map(|i| {
            let group = (v >> (7 * i)) as u8 & 0x7f;
            if i + 1 < len {
                group | 0x80
            } else {
                group
            }
        }));
    }

    /// Length of the encoding of `v`.
    pub fn encoded_len(v: u64) -> usize {
        ((64 - v.leading_zeros() as usize).max(1) + 6) / 7
    }

    /// Reads one varint at `*off` and moves `off` past it.
    pub fn decode_u64(src: &[u8], off: &mut usize) -> Result<u64> {
        let rest = src.get(*off..).unwrap_or_default();
        let mut value = 0u64;
        for (i, &byte) in rest.iter().take(MAX_LEN).enumerate() {
            let group = u64::from(byte & 0x7f);
            if i == MAX_LEN - 1 && group > 1 {
                return Err(ColstoreError::Corruption("varint overflows 64 bits"));
            }
            value |= group << (7 * i);
            if byte & 0x80 == 0 {
                *off += i + 1;
                return Ok(value);
            }
        }
        Err(if rest.len() < MAX_LEN {
            ColstoreError::Corruption("varint truncated")
        } else {
            ColstoreError::Corruption("varint longer than 10 bytes")
        })
    }
}

pub mod buf {
    //! Forward-only reader over a chunk image.

    use super::{var, ColstoreError, Result};

    /// Reads varints and byte runs from a slice, tracking the position.
    #[derive(Debug, Clone)]
    pub struct Cursor<'a> {
        buf: &'a [u8],
        pos: usize,
    }

    impl<'a> Cursor<'a> {
        pub fn new(buf: &'a [u8]) -> Self {
            Self::at(buf, 0)
        }

        /// Starts reading at `pos`.
        pub fn at(buf: &'a [u8], pos: usize) -> Self {
            Self { buf, pos }
        }

        pub fn position(&self) -> usize {
            self.pos
        }

        /// Next `n` bytes.
        pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
            let run = self
                .pos
                .checked_add(n)
                .and_then(|end| self.buf.get(self.pos..end))
                .ok_or(ColstoreError::Corruption("read past end of chunk image"))?;
            self.pos += n;
            Ok(run)
        }

        pub fn varint(&mut self) -> Result<u64> {
            var::decode_u64(self.buf, &mut self.pos)
        }

        /// A varint used as a byte length.
        pub fn length(&mut self) -> Result<usize> {
            usize::try_from(self.varint()?)
                .map_err(|_| ColstoreError::Corruption("length does not fit in memory"))
        }

        pub fn remaining(&self) -> usize {
            self.buf.len().saturating_sub(self.pos)
        }

        pub fn is_empty(&self) -> bool {
            self.remaining() == 0
        }
    }
}
