use super::{BTree, Leaf, LeafState};
use crate::primitives::io::MemFileIo;
use crate::primitives::pager::BufferPool;
use crate::storage::attstream::{AttItem, AttrType, Datum};
use crate::storage::catalog::{expect_trailer, write_trailer, BtreeOpaque};
use crate::storage::meta;
use crate::storage::options::{Compression, StoreOptions};
use crate::types::{AttrNum, ColstoreError, Result, Tid};
use bytes::Bytes;
use proptest::prelude::*;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

const INT8: AttrNum = 1;
const TEXT: AttrNum = 2;

fn setup(options: &StoreOptions) -> Result<(Arc<BufferPool>, BTree)> {
    let pool = Arc::new(BufferPool::new(
        Arc::new(MemFileIo::new()),
        options.pool_options(),
    )?);
    meta::init_meta(&pool, &[AttrType::by_value(8)?, AttrType::VARLENA])?;
    let tree = BTree::open(Arc::clone(&pool), options)?;
    for attno in 0..=tree.natts() as AttrNum {
        tree.create_root(attno)?;
    }
    Ok((pool, tree))
}

fn plain() -> StoreOptions {
    StoreOptions::default().compression(Compression::None)
}

fn int8(v: u64) -> Datum {
    Datum::Value(Bytes::copy_from_slice(&v.to_be_bytes()))
}

fn text(len: usize, fill: u8) -> Datum {
    Datum::Value(Bytes::from(vec![fill; len]))
}

fn collect(tree: &BTree, attno: AttrNum, lo: Tid, hi: Tid) -> Result<Vec<AttItem>> {
    let mut cursor = tree.scan(attno, lo, hi)?;
    let mut out = Vec::new();
    while let Some(item) = cursor.next()? {
        out.push(item);
    }
    Ok(out)
}

#[test]
fn empty_tree_lookup_returns_none() -> Result<()> {
    let (_pool, tree) = setup(&plain())?;
    assert_eq!(tree.lookup(INT8, Tid(1))?, None);
    assert_eq!(tree.lookup(INT8, Tid::INVALID)?, None);
    assert!(collect(&tree, INT8, Tid::MIN, Tid::MAX_PLUS_ONE)?.is_empty());
    let report = tree.check_partition(INT8)?;
    assert_eq!((report.leaves, report.items, report.depth), (1, 0, 1));
    Ok(())
}

#[test]
fn create_root_twice_is_rejected() -> Result<()> {
    let (_pool, tree) = setup(&plain())?;
    assert!(matches!(
        tree.create_root(INT8),
        Err(ColstoreError::Invalid(_))
    ));
    assert!(matches!(tree.root(9), Err(ColstoreError::NotFound(_))));
    Ok(())
}

#[test]
fn insert_and_lookup_roundtrip() -> Result<()> {
    let (_pool, tree) = setup(&plain())?;
    let items: Vec<AttItem> = (1..=50u64)
        .map(|t| {
            let datum = if t % 7 == 0 { Datum::Null } else { int8(t * 3) };
            AttItem::new(Tid(t), datum)
        })
        .collect();
    tree.insert(INT8, &items)?;
    for item in &items {
        assert_eq!(tree.lookup(INT8, item.tid)?, Some(item.datum.clone()));
    }
    assert_eq!(tree.lookup(INT8, Tid(51))?, None);
    Ok(())
}

#[test]
fn later_batches_append_to_the_upper_stream() -> Result<()> {
    let (pool, tree) = setup(&plain())?;
    tree.insert(INT8, &[AttItem::new(Tid(1), int8(1))])?;
    tree.insert(INT8, &[AttItem::new(Tid(2), int8(2))])?;
    let root = tree.root(INT8)?;
    let page = pool.read(root)?;
    let leaf = Leaf::parse(root, page.data())?;
    assert_eq!(leaf.state(), LeafState::Dual);
    assert_eq!(leaf.max_tid(), Some(Tid(2)));
    assert!(tree.stats().leaf_appends >= 1);
    Ok(())
}

#[test]
fn duplicate_and_unsorted_batches_are_rejected() -> Result<()> {
    let (_pool, tree) = setup(&plain())?;
    tree.insert(INT8, &[AttItem::new(Tid(5), int8(5))])?;
    let dup = tree.insert(INT8, &[AttItem::new(Tid(5), int8(6))]);
    assert!(matches!(dup, Err(ColstoreError::Invalid(_))));
    let unsorted = tree.insert(
        INT8,
        &[AttItem::new(Tid(9), int8(1)), AttItem::new(Tid(8), int8(2))],
    );
    assert!(matches!(unsorted, Err(ColstoreError::Invalid(_))));
    assert_eq!(tree.lookup(INT8, Tid(5))?, Some(int8(5)));
    Ok(())
}

#[test]
fn leaf_splits_keep_the_partition() -> Result<()> {
    let (_pool, tree) = setup(&plain())?;
    let mut rng = ChaCha8Rng::seed_from_u64(11);
    let items: Vec<AttItem> = (1..=6_000u64)
        .map(|t| AttItem::new(Tid(t), int8(rng.gen())))
        .collect();
    for batch in items.chunks(500) {
        tree.insert(INT8, batch)?;
    }
    let report = tree.check_partition(INT8)?;
    assert_eq!(report.items, 6_000);
    assert!(report.leaves > 1);
    assert_eq!(report.depth, 2);
    assert!(tree.stats().leaf_splits > 0);
    assert_eq!(collect(&tree, INT8, Tid::MIN, Tid::MAX_PLUS_ONE)?, items);
    Ok(())
}

/// Raises the low key of the second INT8 leaf by two and returns the first
/// tid that no leaf covers any more.
fn shift_second_leaf(pool: &BufferPool, tree: &BTree) -> Result<Tid> {
    let leaves = tree.leaf_blocks(INT8)?;
    assert!(leaves.len() > 1);
    let mut page = pool.write(leaves[1])?;
    let mut opaque: BtreeOpaque = expect_trailer(page.block, page.data())?;
    let orphan = opaque.lokey;
    opaque.lokey = Tid(orphan.0 + 2);
    write_trailer(page.data_mut(), &opaque);
    Ok(orphan)
}

#[test]
fn descent_reports_a_leaf_that_no_longer_covers_its_range() -> Result<()> {
    let (pool, tree) = setup(&plain())?;
    let items: Vec<AttItem> = (1..=3_000u64).map(|t| AttItem::new(Tid(t), int8(t))).collect();
    tree.insert(INT8, &items)?;
    let orphan = shift_second_leaf(&pool, &tree)?;

    let before = tree.stats().descend_retries;
    match tree.lookup(INT8, orphan) {
        Err(ColstoreError::KeyRangeMismatch { tid, lokey, .. }) => {
            assert_eq!(tid, orphan);
            assert_eq!(lokey, Tid(orphan.0 + 2));
        }
        other => panic!("expected a key range mismatch, got {other:?}"),
    }
    assert_eq!(tree.stats().descend_retries - before, 1);
    assert_eq!(tree.lookup(INT8, Tid(orphan.0 + 2))?, Some(int8(orphan.0 + 2)));
    Ok(())
}

#[test]
fn descent_without_retries_gives_up() -> Result<()> {
    let (pool, tree) = setup(&plain().max_descend_retries(0))?;
    let items: Vec<AttItem> = (1..=3_000u64).map(|t| AttItem::new(Tid(t), int8(t))).collect();
    tree.insert(INT8, &items)?;
    let orphan = shift_second_leaf(&pool, &tree)?;
    assert!(matches!(
        tree.lookup(INT8, orphan),
        Err(ColstoreError::RetryExhausted { attno: INT8, attempts: 1, .. })
    ));
    Ok(())
}

#[test]
fn root_split_moves_the_root_flag() -> Result<()> {
    let (pool, tree) = setup(&plain())?;
    let old_root = tree.root(TEXT)?;
    let items: Vec<AttItem> = (1..=200u64)
        .map(|t| AttItem::new(Tid(t), text(300, t as u8)))
        .collect();
    tree.insert(TEXT, &items)?;

    let new_root = tree.root(TEXT)?;
    assert_ne!(new_root, old_root);
    let (_, root_opaque) = super::page::read_node(new_root, pool.read(new_root)?.data())?;
    assert!(root_opaque.is_root());
    assert_eq!(root_opaque.level, 1);
    let (_, old_opaque) = super::page::read_node(old_root, pool.read(old_root)?.data())?;
    assert!(!old_opaque.is_root());
    assert_eq!(old_opaque.lokey, Tid::MIN);
    assert_eq!(tree.stats().root_splits, 1);
    assert_eq!(tree.check_partition(TEXT)?.items, 200);
    Ok(())
}

#[test]
fn out_of_order_inserts_land_in_the_right_leaf() -> Result<()> {
    let (_pool, tree) = setup(&plain())?;
    let evens: Vec<AttItem> = (1..=400u64)
        .map(|t| AttItem::new(Tid(t * 2), text(100, 1)))
        .collect();
    tree.insert(TEXT, &evens)?;
    let odds: Vec<AttItem> = (0..400u64)
        .map(|t| AttItem::new(Tid(t * 2 + 1), text(100, 2)))
        .collect();
    tree.insert(TEXT, &odds)?;
    let all = collect(&tree, TEXT, Tid::MIN, Tid::MAX_PLUS_ONE)?;
    assert_eq!(all.len(), 800);
    assert!(all.windows(2).all(|w| w[0].tid < w[1].tid));
    assert_eq!(tree.check_partition(TEXT)?.items, 800);
    Ok(())
}

#[test]
fn replace_overwrites_in_place_and_after_split() -> Result<()> {
    let (_pool, tree) = setup(&plain())?;
    let items: Vec<AttItem> = (1..=60u64)
        .map(|t| AttItem::new(Tid(t), text(100, 0)))
        .collect();
    tree.insert(TEXT, &items)?;
    tree.replace(TEXT, Tid(10), text(20, 9))?;
    assert_eq!(tree.lookup(TEXT, Tid(10))?, Some(text(20, 9)));

    // Growing values until the leaf overflows forces the slow path.
    for t in 1..=60u64 {
        tree.replace(TEXT, Tid(t), text(1_500, t as u8))?;
    }
    for t in 1..=60u64 {
        assert_eq!(tree.lookup(TEXT, Tid(t))?, Some(text(1_500, t as u8)));
    }
    assert!(tree.stats().leaf_splits > 0);
    assert!(matches!(
        tree.replace(TEXT, Tid(61), Datum::Null),
        Err(ColstoreError::NotFound(_))
    ));
    Ok(())
}

#[test]
fn removing_a_whole_leaf_merges_it_away() -> Result<()> {
    let (pool, tree) = setup(&plain())?;
    let items: Vec<AttItem> = (1..=2_000u64)
        .map(|t| AttItem::new(Tid(t), text(200, t as u8)))
        .collect();
    tree.insert(TEXT, &items)?;
    let leaves = tree.leaf_blocks(TEXT)?;
    assert!(leaves.len() > 5);

    let victim = leaves[3];
    let doomed: Vec<Tid> = {
        let page = pool.read(victim)?;
        Leaf::parse(victim, page.data())?
            .items(AttrType::VARLENA)?
            .into_iter()
            .map(|i| i.tid)
            .collect()
    };
    assert_eq!(tree.remove(TEXT, &doomed)?, doomed.len());

    let after = tree.leaf_blocks(TEXT)?;
    assert_eq!(after.len(), leaves.len() - 1);
    assert!(!after.contains(&victim));
    assert!(meta::free_list(&pool)?.contains(&victim));
    assert_eq!(tree.stats().leaf_merges, 1);
    let report = tree.check_partition(TEXT)?;
    assert_eq!(report.items, 2_000 - doomed.len());
    for tid in doomed {
        assert_eq!(tree.lookup(TEXT, tid)?, None);
    }
    Ok(())
}

#[test]
fn removing_missing_tids_is_a_no_op() -> Result<()> {
    let (_pool, tree) = setup(&plain())?;
    tree.insert(INT8, &[AttItem::new(Tid(3), int8(3))])?;
    assert_eq!(tree.remove(INT8, &[Tid(1), Tid(4), Tid::INVALID])?, 0);
    assert_eq!(tree.remove(INT8, &[Tid(3), Tid(3)])?, 1);
    assert_eq!(tree.check_partition(INT8)?.items, 0);
    Ok(())
}

#[test]
fn scan_respects_bounds() -> Result<()> {
    let (_pool, tree) = setup(&plain())?;
    let items: Vec<AttItem> = (1..=1_000u64)
        .map(|t| AttItem::new(Tid(t), text(64, 3)))
        .collect();
    tree.insert(TEXT, &items)?;
    let got = collect(&tree, TEXT, Tid(250), Tid(750))?;
    assert_eq!(got.len(), 500);
    assert_eq!(got.first().map(|i| i.tid), Some(Tid(250)));
    assert_eq!(got.last().map(|i| i.tid), Some(Tid(749)));
    assert!(collect(&tree, TEXT, Tid(10), Tid(10))?.is_empty());
    assert_eq!(collect(&tree, TEXT, Tid::INVALID, Tid(3))?.len(), 2);
    Ok(())
}

#[test]
fn full_scan_visits_every_leaf_once() -> Result<()> {
    let (_pool, tree) = setup(&plain())?;
    let items: Vec<AttItem> = (1..=2_000u64)
        .map(|t| AttItem::new(Tid(t * 2), text(48, 5)))
        .collect();
    tree.insert(TEXT, &items)?;
    let report = tree.check_partition(TEXT)?;
    let mut cursor = tree.scan(TEXT, Tid::MIN, Tid::MAX_PLUS_ONE)?;
    let mut seen = 0;
    while cursor.next()?.is_some() {
        seen += 1;
    }
    assert_eq!(seen, 2_000);
    assert_eq!(cursor.leaves_visited(), report.leaves);
    Ok(())
}

#[test]
fn raised_interrupt_stops_the_scan() -> Result<()> {
    let (_pool, tree) = setup(&plain())?;
    tree.insert(INT8, &[AttItem::new(Tid(1), int8(1))])?;
    let flag = AtomicBool::new(true);
    let mut cursor = tree.scan_interruptible(INT8, Tid::MIN, Tid::MAX_PLUS_ONE, &flag)?;
    assert!(matches!(cursor.next(), Err(ColstoreError::Interrupted)));
    assert_eq!(cursor.next()?, None);
    Ok(())
}

#[test]
fn snappy_leaves_read_back() -> Result<()> {
    let options = StoreOptions::default().compression(Compression::Snappy);
    let (_pool, tree) = setup(&options)?;
    let items: Vec<AttItem> = (1..=3_000u64)
        .map(|t| AttItem::new(Tid(t), int8(t % 5)))
        .collect();
    tree.insert(INT8, &items)?;
    assert_eq!(tree.check_partition(INT8)?.items, 3_000);
    assert_eq!(tree.lookup(INT8, Tid(2_999))?, Some(int8(4)));
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]
    #[test]
    fn leaves_partition_the_tid_space(
        lens in prop::collection::vec(0usize..600, 1..400),
        removals in prop::collection::vec(any::<prop::sample::Index>(), 0..120),
        batch in 1usize..64,
    ) {
        let (_pool, tree) = setup(&plain()).expect("setup");
        let mut reference = BTreeMap::new();
        let items: Vec<AttItem> = lens
            .iter()
            .enumerate()
            .map(|(i, len)| {
                let tid = Tid(i as u64 + 1);
                let datum = text(*len, i as u8);
                reference.insert(tid, datum.clone());
                AttItem::new(tid, datum)
            })
            .collect();
        for chunk in items.chunks(batch) {
            tree.insert(TEXT, chunk).expect("insert");
        }
        let doomed: Vec<Tid> = removals.iter().map(|ix| items[ix.index(items.len())].tid).collect();
        for tid in &doomed {
            reference.remove(tid);
        }
        tree.remove(TEXT, &doomed).expect("remove");

        let report = tree.check_partition(TEXT).expect("partition");
        prop_assert_eq!(report.items, reference.len());
        let actual: BTreeMap<Tid, Datum> = collect(&tree, TEXT, Tid::MIN, Tid::MAX_PLUS_ONE)
            .expect("scan")
            .into_iter()
            .map(|i| (i.tid, i.datum))
            .collect();
        prop_assert_eq!(actual, reference);
    }
}
