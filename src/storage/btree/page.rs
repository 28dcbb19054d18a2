//! B-tree page bodies.
//!
//! Internal pages pack `(key u64, child u32)` downlinks from the header to
//! `lower`. Leaf pages carry up to two attribute streams: the lower stream
//! at `[16, lower)` and an uncompressed append stream at `[upper, special)`.

use std::cmp::Ordering;

use crate::storage::attstream::{AttItem, AttStream, AttrType, Datum, STREAM_HDR_LEN};
use crate::storage::catalog::{self, BtreeOpaque, BTREE_TRAILER_LEN};
use crate::types::{
    page::{self, read_u32, read_u64, write_u32, write_u64, PageHeader, PAGE_HDR_LEN, PAGE_SIZE},
    BlockNumber, ColstoreError, Result, Tid,
};

/// Encoded size of one downlink.
pub const DOWNLINK_LEN: usize = 12;
/// Bytes available to page contents between header and trailer.
pub const NODE_AREA: usize = PAGE_SIZE - PAGE_HDR_LEN - BTREE_TRAILER_LEN;
/// Maximum number of downlinks on an internal page.
pub const INTERNAL_FANOUT: usize = NODE_AREA / DOWNLINK_LEN;

/// Separator key and child pointer of an internal page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Downlink {
    /// Low key of the child's range.
    pub key: Tid,
    pub child: BlockNumber,
}

/// Layout of a leaf, by the streams it holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub enum LeafState {
    Empty,
    /// Lower stream only.
    Single,
    /// Lower stream plus an append stream.
    Dual,
}

/// Validated header and trailer of a B-tree page.
pub fn read_node(block: BlockNumber, data: &[u8]) -> Result<(PageHeader, BtreeOpaque)> {
    let hdr = catalog::expect_header::<BtreeOpaque>(block, data)?;
    let opaque = catalog::expect_trailer::<BtreeOpaque>(block, data)?;
    if opaque.lokey >= opaque.hikey {
        return Err(ColstoreError::PageCorruption {
            block,
            detail: "btree page has an empty key range",
        });
    }
    Ok((hdr, opaque))
}

/// Decodes the downlinks of an internal page.
pub fn internal_items(block: BlockNumber, data: &[u8]) -> Result<Vec<Downlink>> {
    let (hdr, opaque) = read_node(block, data)?;
    let corrupt = |detail| ColstoreError::PageCorruption { block, detail };
    if opaque.level == 0 {
        return Err(corrupt("leaf page read as internal"));
    }
    let body = hdr.lower as usize - PAGE_HDR_LEN;
    if body == 0 || body % DOWNLINK_LEN != 0 {
        return Err(corrupt("internal page body is not a downlink array"));
    }
    let items: Vec<_> = (0..body / DOWNLINK_LEN)
        .map(|i| {
            let off = PAGE_HDR_LEN + i * DOWNLINK_LEN;
            Downlink {
                key: Tid(read_u64(data, off)),
                child: BlockNumber(read_u32(data, off + 8)),
            }
        })
        .collect();
    if items[0].key != opaque.lokey {
        return Err(corrupt("first downlink does not start at page low key"));
    }
    for pair in items.windows(2) {
        if pair[0].key >= pair[1].key {
            return Err(corrupt("downlink keys not strictly increasing"));
        }
    }
    if items.iter().any(|d| d.key >= opaque.hikey || !d.child.is_valid()) {
        return Err(corrupt("downlink outside page key range"));
    }
    Ok(items)
}

/// Index of the downlink whose child covers `tid`.
pub fn child_index(items: &[Downlink], tid: Tid) -> usize {
    items.partition_point(|d| d.key <= tid).saturating_sub(1)
}

/// Initialises `page` as an internal page holding `items`.
pub fn init_internal(page: &mut [u8], opaque: &BtreeOpaque, items: &[Downlink]) -> Result<()> {
    if items.is_empty() || items.len() > INTERNAL_FANOUT {
        return Err(ColstoreError::Invalid("downlink count out of range"));
    }
    let hdr = catalog::init_typed(page, opaque)?;
    for (i, item) in items.iter().enumerate() {
        let off = PAGE_HDR_LEN + i * DOWNLINK_LEN;
        write_u64(page, off, item.key.0);
        write_u32(page, off + 8, item.child.0);
    }
    page::set_bounds(
        page,
        PAGE_HDR_LEN + items.len() * DOWNLINK_LEN,
        hdr.upper as usize,
    );
    Ok(())
}

/// Returns `true` if streams of these sizes fit on one leaf.
pub fn leaf_fits(lower: Option<&AttStream>, upper: Option<&AttStream>) -> bool {
    lower.map_or(0, AttStream::stored_len) + upper.map_or(0, AttStream::stored_len) <= NODE_AREA
}

/// Initialises `page` as a leaf holding the given streams.
pub fn init_leaf(
    page: &mut [u8],
    opaque: &BtreeOpaque,
    lower: Option<&AttStream>,
    upper: Option<&AttStream>,
) -> Result<()> {
    if opaque.level != 0 {
        return Err(ColstoreError::Invalid("leaf opaque must have level 0"));
    }
    if !leaf_fits(lower, upper) {
        return Err(ColstoreError::Invalid("streams do not fit on a leaf page"));
    }
    let hdr = catalog::init_typed(page, opaque)?;
    let mut low_end = PAGE_HDR_LEN;
    if let Some(stream) = lower {
        low_end += stream.stored_len();
        stream.write_to(&mut page[PAGE_HDR_LEN..low_end]);
    }
    let mut high_start = hdr.special as usize;
    if let Some(stream) = upper {
        high_start -= stream.stored_len();
        stream.write_to(&mut page[high_start..hdr.special as usize]);
    }
    page::set_bounds(page, low_end, high_start);
    Ok(())
}

/// The streams of a leaf page.
#[derive(Clone, Debug)]
pub struct Leaf {
    pub block: BlockNumber,
    pub opaque: BtreeOpaque,
    pub lower: Option<AttStream>,
    pub upper: Option<AttStream>,
}

impl Leaf {
    /// Parses the leaf at `block`. Each stream must fill its region exactly.
    pub fn parse(block: BlockNumber, data: &[u8]) -> Result<Self> {
        let (hdr, opaque) = read_node(block, data)?;
        if opaque.level != 0 {
            return Err(ColstoreError::PageCorruption {
                block,
                detail: "internal page read as leaf",
            });
        }
        let lower = region_stream(block, &data[PAGE_HDR_LEN..hdr.lower as usize])?;
        let upper = region_stream(block, &data[hdr.upper as usize..hdr.special as usize])?;
        Ok(Self {
            block,
            opaque,
            lower,
            upper,
        })
    }

    pub fn state(&self) -> LeafState {
        match (&self.lower, &self.upper) {
            (None, None) => LeafState::Empty,
            (_, None) => LeafState::Single,
            (_, Some(_)) => LeafState::Dual,
        }
    }

    /// Largest tid stored on the leaf.
    pub fn max_tid(&self) -> Option<Tid> {
        let lower = self.lower.as_ref().map(|s| s.header.lasttid);
        let upper = self.upper.as_ref().map(|s| s.header.lasttid);
        lower.max(upper)
    }

    /// Stored bytes used by the streams.
    pub fn used(&self) -> usize {
        self.lower.as_ref().map_or(0, AttStream::stored_len)
            + self.upper.as_ref().map_or(0, AttStream::stored_len)
    }

    /// Decodes one stream and checks it against the leaf's key range.
    pub fn stream_items(&self, attr: AttrType, upper: bool) -> Result<Vec<AttItem>> {
        let stream = if upper { &self.upper } else { &self.lower };
        let Some(stream) = stream else {
            return Ok(Vec::new());
        };
        let items = stream.items(attr, self.block)?;
        let in_range = |item: &AttItem| self.opaque.covers(item.tid);
        if !items.first().map_or(true, in_range) || !items.last().map_or(true, in_range) {
            return Err(ColstoreError::PageCorruption {
                block: self.block,
                detail: "leaf item outside page key range",
            });
        }
        Ok(items)
    }

    /// Every element of the leaf in tid order.
    pub fn items(&self, attr: AttrType) -> Result<Vec<AttItem>> {
        let lower = self.stream_items(attr, false)?;
        let upper = self.stream_items(attr, true)?;
        merge_items(lower, upper).map_err(|_| ColstoreError::PageCorruption {
            block: self.block,
            detail: "tid present in both leaf streams",
        })
    }

    /// Looks up one tid, decoding only the chunks that may hold it.
    pub fn find(&self, attr: AttrType, tid: Tid) -> Result<Option<Datum>> {
        for stream in [&self.lower, &self.upper].into_iter().flatten() {
            if stream.header.lasttid < tid {
                continue;
            }
            let mut decoder = stream.decoder(attr, self.block)?;
            while let Some(chunk) = decoder.next_chunk()? {
                if chunk.last_tid < tid {
                    continue;
                }
                if chunk.first_tid > tid {
                    break;
                }
                if let Ok(idx) = chunk.items.binary_search_by(|i| i.tid.cmp(&tid)) {
                    return Ok(Some(chunk.items[idx].datum.clone()));
                }
                break;
            }
        }
        Ok(None)
    }
}

fn region_stream(block: BlockNumber, region: &[u8]) -> Result<Option<AttStream>> {
    if region.len() < STREAM_HDR_LEN {
        return Ok(None);
    }
    let stream = AttStream::parse(block, region)?;
    if stream.stored_len() != region.len() {
        return Err(ColstoreError::PageCorruption {
            block,
            detail: "leaf stream does not fill its region",
        });
    }
    Ok(Some(stream))
}

/// Merges two tid-sorted item lists. A tid present in both is rejected.
pub fn merge_items(a: Vec<AttItem>, b: Vec<AttItem>) -> std::result::Result<Vec<AttItem>, Tid> {
    if b.is_empty() {
        return Ok(a);
    }
    if a.is_empty() {
        return Ok(b);
    }
    let mut out = Vec::with_capacity(a.len() + b.len());
    let mut a = a.into_iter().peekable();
    let mut b = b.into_iter().peekable();
    loop {
        let ord = match (a.peek(), b.peek()) {
            (Some(x), Some(y)) => x.tid.cmp(&y.tid),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => break,
        };
        match ord {
            Ordering::Less => out.extend(a.next()),
            Ordering::Greater => out.extend(b.next()),
            Ordering::Equal => return Err(a.peek().map_or(Tid::INVALID, |i| i.tid)),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::catalog::BTREE_FLAG_ROOT;
    use crate::storage::options::Compression;
    use bytes::Bytes;

    fn opaque(level: u16, lokey: u64, hikey: u64) -> BtreeOpaque {
        BtreeOpaque {
            next: BlockNumber::INVALID,
            attno: 1,
            level,
            lokey: Tid(lokey),
            hikey: Tid(hikey),
            flags: BTREE_FLAG_ROOT,
        }
    }

    fn int8_items(tids: impl Iterator<Item = u64>) -> Vec<AttItem> {
        tids.map(|t| AttItem::new(Tid(t), Datum::Value(Bytes::copy_from_slice(&t.to_be_bytes()))))
            .collect()
    }

    #[test]
    fn internal_page_round_trip_and_child_search() {
        let mut page = vec![0u8; PAGE_SIZE];
        let items = vec![
            Downlink { key: Tid(1), child: BlockNumber(4) },
            Downlink { key: Tid(100), child: BlockNumber(9) },
            Downlink { key: Tid(250), child: BlockNumber(5) },
        ];
        init_internal(&mut page, &opaque(1, 1, u64::MAX), &items).unwrap();
        let back = internal_items(BlockNumber(2), &page).unwrap();
        assert_eq!(back, items);
        assert_eq!(child_index(&back, Tid(1)), 0);
        assert_eq!(child_index(&back, Tid(99)), 0);
        assert_eq!(child_index(&back, Tid(100)), 1);
        assert_eq!(child_index(&back, Tid(10_000)), 2);
    }

    #[test]
    fn internal_page_rejects_unsorted_keys() {
        let mut page = vec![0u8; PAGE_SIZE];
        let items = vec![
            Downlink { key: Tid(1), child: BlockNumber(4) },
            Downlink { key: Tid(1), child: BlockNumber(9) },
        ];
        init_internal(&mut page, &opaque(1, 1, u64::MAX), &items).unwrap();
        assert!(internal_items(BlockNumber(2), &page).unwrap_err().is_corruption());
    }

    #[test]
    fn dual_leaf_round_trip() {
        let attr = AttrType::by_value(8).unwrap();
        let lower_items = int8_items(1..=500);
        let upper_items = int8_items(501..=520);
        let lower = AttStream::build(attr, &lower_items, Compression::Snappy).unwrap();
        let upper = AttStream::build(attr, &upper_items, Compression::None).unwrap();
        let mut page = vec![0u8; PAGE_SIZE];
        init_leaf(&mut page, &opaque(0, 1, u64::MAX), Some(&lower), Some(&upper)).unwrap();

        let leaf = Leaf::parse(BlockNumber(3), &page).unwrap();
        assert_eq!(leaf.state(), LeafState::Dual);
        assert_eq!(leaf.max_tid(), Some(Tid(520)));
        let all = leaf.items(attr).unwrap();
        assert_eq!(all.len(), 520);
        assert_eq!(all, int8_items(1..=520));
        assert_eq!(
            leaf.find(attr, Tid(510)).unwrap(),
            Some(Datum::Value(Bytes::copy_from_slice(&510u64.to_be_bytes())))
        );
        assert_eq!(leaf.find(attr, Tid(521)).unwrap(), None);
    }

    #[test]
    fn empty_leaf_has_no_streams() {
        let mut page = vec![0u8; PAGE_SIZE];
        init_leaf(&mut page, &opaque(0, 1, u64::MAX), None, None).unwrap();
        let leaf = Leaf::parse(BlockNumber(3), &page).unwrap();
        assert_eq!(leaf.state(), LeafState::Empty);
        assert!(leaf.items(AttrType::VARLENA).unwrap().is_empty());
    }

    #[test]
    fn leaf_items_must_lie_in_key_range() {
        let attr = AttrType::by_value(8).unwrap();
        let stream = AttStream::build(attr, &int8_items(5..=10), Compression::None).unwrap();
        let mut page = vec![0u8; PAGE_SIZE];
        init_leaf(&mut page, &opaque(0, 1, 8), Some(&stream), None).unwrap();
        let leaf = Leaf::parse(BlockNumber(3), &page).unwrap();
        assert!(leaf.items(attr).unwrap_err().is_corruption());
    }

    #[test]
    fn merge_detects_duplicates() {
        let merged = merge_items(int8_items([1, 4].into_iter()), int8_items([2, 3, 9].into_iter()));
        let tids: Vec<_> = merged.unwrap().iter().map(|i| i.tid.0).collect();
        assert_eq!(tids, vec![1, 2, 3, 4, 9]);
        assert_eq!(
            merge_items(int8_items([1, 4].into_iter()), int8_items([4].into_iter())),
            Err(Tid(4))
        );
    }
}
