#![allow(missing_docs)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use bytes::Bytes;
use colstore::{
    primitives::{io::MemFileIo, pager::BufferPool},
    storage::{
        attstream::{AttItem, AttrType, Datum},
        Relation, StoreOptions,
    },
    types::{Result, Tid},
};
use rand::{seq::SliceRandom, Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

const INT4: u16 = 1;
const TEXT: u16 = 2;

fn relation(options: StoreOptions) -> Relation {
    let pool = Arc::new(
        BufferPool::new(Arc::new(MemFileIo::new()), options.pool_options()).expect("pool"),
    );
    Relation::create(
        pool,
        &[AttrType::by_value(4).unwrap(), AttrType::VARLENA],
        options,
    )
    .expect("relation")
}

fn int4(v: u32) -> Datum {
    Datum::Value(Bytes::copy_from_slice(&v.to_be_bytes()))
}

fn collect(rel: &Relation, attno: u16) -> Result<Vec<AttItem>> {
    let mut cursor = rel.tree().scan(attno, Tid::MIN, Tid::MAX_PLUS_ONE)?;
    let mut out = Vec::new();
    while let Some(item) = cursor.next()? {
        out.push(item);
    }
    Ok(out)
}

#[test]
fn random_batches_keep_leaves_partitioned() -> Result<()> {
    let rel = relation(StoreOptions::default());
    let mut rng = ChaCha8Rng::seed_from_u64(0xC015);
    let mut reference: BTreeMap<u64, u32> = BTreeMap::new();

    for round in 0..40 {
        let want = rng.gen_range(1..400);
        let mut tids = BTreeSet::new();
        while tids.len() < want {
            let tid = rng.gen_range(1..200_000u64);
            if !reference.contains_key(&tid) {
                tids.insert(tid);
            }
        }
        let items: Vec<_> = tids
            .iter()
            .map(|&t| {
                let v = rng.gen();
                reference.insert(t, v);
                AttItem::new(Tid(t), int4(v))
            })
            .collect();
        rel.tree().insert(INT4, &items)?;

        if round % 5 == 4 {
            let mut present: Vec<u64> = reference.keys().copied().collect();
            present.shuffle(&mut rng);
            let doomed: Vec<Tid> = present.iter().take(present.len() / 3).map(|&t| Tid(t)).collect();
            for t in &doomed {
                reference.remove(&t.0);
            }
            assert_eq!(rel.tree().remove(INT4, &doomed)?, doomed.len());
        }

        let report = rel.tree().check_partition(INT4)?;
        assert_eq!(report.items, reference.len(), "round {round}");
    }

    let scanned = collect(&rel, INT4)?;
    let expected: Vec<_> = reference
        .iter()
        .map(|(&t, &v)| AttItem::new(Tid(t), int4(v)))
        .collect();
    assert_eq!(scanned, expected);
    assert!(rel.btree_stats().leaf_splits > 0);
    Ok(())
}

#[test]
fn emptied_leaves_are_merged_away() -> Result<()> {
    let rel = relation(StoreOptions::default().compression(colstore::storage::Compression::None));
    let items: Vec<_> = (1..=400u64)
        .map(|t| AttItem::new(Tid(t), Datum::Value(Bytes::from(vec![b'x'; 120]))))
        .collect();
    rel.tree().insert(TEXT, &items)?;
    let before = rel.tree().check_partition(TEXT)?;
    assert!(before.leaves > 3);

    let doomed: Vec<Tid> = (101..=300u64).map(Tid).collect();
    assert_eq!(rel.tree().remove(TEXT, &doomed)?, 200);
    let after = rel.tree().check_partition(TEXT)?;
    assert_eq!(after.items, 200);
    assert!(after.leaves < before.leaves);
    assert!(rel.btree_stats().leaf_merges > 0);
    Ok(())
}

#[test]
fn concurrent_writers_on_disjoint_ranges() -> Result<()> {
    let rel = relation(StoreOptions::default());
    std::thread::scope(|scope| {
        for worker in 0..4u64 {
            let rel = &rel;
            scope.spawn(move || {
                let base = worker * 1_000_000;
                for batch in 0..20u64 {
                    let items: Vec<_> = (0..100u64)
                        .map(|i| {
                            let tid = base + batch * 100 + i + 1;
                            AttItem::new(Tid(tid), int4(tid as u32))
                        })
                        .collect();
                    rel.tree().insert(INT4, &items).expect("insert");
                }
            });
        }
    });

    let report = rel.tree().check_partition(INT4)?;
    assert_eq!(report.items, 8_000);
    let scanned = collect(&rel, INT4)?;
    assert!(scanned.windows(2).all(|w| w[0].tid < w[1].tid));
    assert_eq!(rel.tree().lookup(INT4, Tid(3_000_001))?, Some(int4(3_000_001)));
    Ok(())
}
