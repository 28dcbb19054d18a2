#![allow(missing_docs)]

use bytes::Bytes;
use colstore::{
    admin::decode_attribute_chunk,
    storage::{
        attstream::{
            decode_chunk, encode_chunks, AttItem, AttStream, AttStreamDecoder, AttrType, Datum,
            ToastPointer,
        },
        Compression,
    },
    types::{BlockNumber, Tid},
};
use proptest::prelude::*;

const BLOCK: BlockNumber = BlockNumber(3);

fn items_from(gaps: &[u64], datums: Vec<Datum>) -> Vec<AttItem> {
    let mut tid = 0u64;
    gaps.iter()
        .zip(datums)
        .map(|(gap, datum)| {
            tid += gap;
            AttItem::new(Tid(tid), datum)
        })
        .collect()
}

fn int8_datum() -> impl Strategy<Value = Datum> {
    prop_oneof![
        1 => Just(Datum::Null),
        6 => any::<i64>().prop_map(|v| Datum::Value(Bytes::copy_from_slice(&v.to_be_bytes()))),
    ]
}

fn text_datum() -> impl Strategy<Value = Datum> {
    prop_oneof![
        1 => Just(Datum::Null),
        1 => (1u32..5000, 1u64..1_000_000).prop_map(|(block, size)| Datum::Toast(ToastPointer {
            first_block: BlockNumber(block),
            total_size: size,
        })),
        6 => proptest::collection::vec(any::<u8>(), 0..200).prop_map(|v| Datum::Value(Bytes::from(v))),
    ]
}

fn decode_per_chunk(attr: AttrType, image: Vec<u8>, last: Tid) -> (Vec<AttItem>, Vec<AttItem>, usize) {
    let mut decoder = AttStreamDecoder::new(attr, Bytes::from(image), last, BLOCK);
    let mut whole = Vec::new();
    let mut isolated = Vec::new();
    let mut chunks = 0;
    while let Some(chunk) = decoder.next_chunk().unwrap() {
        let alone = decode_chunk(attr, chunk.prev_tid, chunk.last_tid, &chunk.raw).unwrap();
        assert_eq!(alone.first_tid, chunk.first_tid);
        isolated.extend(alone.items);
        whole.extend(chunk.items);
        chunks += 1;
    }
    (whole, isolated, chunks)
}

#[test]
fn varlena_chunk_decodes_through_admin_entry_point() {
    let items = vec![
        AttItem::new(Tid(10), Datum::Value(Bytes::from_static(b"alpha"))),
        AttItem::new(Tid(11), Datum::Null),
        AttItem::new(
            Tid(15),
            Datum::Toast(ToastPointer {
                first_block: BlockNumber(9),
                total_size: 70_000,
            }),
        ),
    ];
    let raw = encode_chunks(AttrType::VARLENA, Tid(4), &items).unwrap();
    let row = decode_attribute_chunk(false, -1, Tid(4), Tid(15), &raw).unwrap();
    assert_eq!(row.count, 3);
    assert_eq!(row.tids, vec![Tid(10), Tid(11), Tid(15)]);
    assert_eq!(row.nulls, vec![false, true, false]);
    assert_eq!(row.toasted, vec![false, false, true]);
    assert_eq!(row.values[0], hex::encode(b"alpha"));

    // A wrong last tid means the caller handed over the wrong chunk.
    assert!(decode_attribute_chunk(false, -1, Tid(4), Tid(16), &raw).is_err());
}

#[test]
fn resuming_mid_stream_matches_full_decode() {
    let attr = AttrType::by_value(8).unwrap();
    let items: Vec<_> = (1..=1_000u64)
        .map(|t| AttItem::new(Tid(t * 3), Datum::Value(Bytes::copy_from_slice(&t.to_be_bytes()))))
        .collect();
    let image = Bytes::from(encode_chunks(attr, Tid::INVALID, &items).unwrap());
    let mut decoder = AttStreamDecoder::new(attr, image.clone(), Tid(3_000), BLOCK);
    let first = decoder.next_chunk().unwrap().unwrap();
    let second = decoder.next_chunk().unwrap().unwrap();
    assert_eq!(second.prev_tid, first.last_tid);

    let mut resumed = AttStreamDecoder::new(attr, image, Tid(3_000), BLOCK);
    resumed.resume_at(second.start, first.last_tid).unwrap();
    let rest: Vec<_> = resumed.into_items().collect::<Result<_, _>>().unwrap();
    assert_eq!(rest.as_slice(), &items[first.items.len()..]);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn int8_streams_roundtrip(
        gaps in proptest::collection::vec(1u64..1_000, 1..600),
        datums in proptest::collection::vec(int8_datum(), 600),
        snappy in any::<bool>(),
    ) {
        let attr = AttrType::by_value(8).unwrap();
        let items = items_from(&gaps, datums);
        let compression = if snappy { Compression::Snappy } else { Compression::None };
        let stream = AttStream::build(attr, &items, compression).unwrap();
        let parsed = AttStream::parse(BLOCK, &stream.to_vec()).unwrap();
        prop_assert_eq!(parsed.items(attr, BLOCK).unwrap(), items);
    }

    #[test]
    fn chunks_decode_in_isolation(
        gaps in proptest::collection::vec(1u64..(1 << 40), 1..500),
        datums in proptest::collection::vec(text_datum(), 500),
    ) {
        let items = items_from(&gaps, datums);
        let last = items.last().map(|i| i.tid).unwrap();
        let image = encode_chunks(AttrType::VARLENA, Tid::INVALID, &items).unwrap();
        let (whole, isolated, chunks) = decode_per_chunk(AttrType::VARLENA, image, last);
        prop_assert!(chunks >= items.len().div_ceil(128));
        prop_assert_eq!(&whole, &items);
        prop_assert_eq!(isolated, whole);
    }
}
