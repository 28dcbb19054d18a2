#![allow(missing_docs)]

use std::sync::Arc;

use colstore::{
    admin::Inspector,
    primitives::{io::MemFileIo, pager::BufferPool},
    storage::{attstream::AttrType, meta, Relation, StoreOptions},
    types::{BlockNumber, Result, Tid},
};
use proptest::prelude::*;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tempfile::TempDir;

fn noise(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    (0..len).map(|_| rng.gen()).collect()
}

fn mem_relation(options: StoreOptions) -> Relation {
    let pool = Arc::new(
        BufferPool::new(Arc::new(MemFileIo::new()), options.pool_options()).expect("pool"),
    );
    Relation::create(pool, &[AttrType::VARLENA], options).expect("relation")
}

#[test]
fn fifty_thousand_bytes_split_into_seven_chunks() -> Result<()> {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("toast.col");
    let options = StoreOptions::default().toast_chunk_capacity(8_000);
    let value = noise(50_000, 11);
    let pointer = {
        let rel = Relation::create_path(&path, &[AttrType::VARLENA], options.clone())?;
        let pointer = rel.toast().store(Tid(42), &value)?;
        rel.flush()?;
        pointer
    };
    assert_eq!(pointer.total_size, 50_000);

    let rel = Relation::open_path(&path, options)?;
    let rows = Inspector::new(rel.pool()).scan_toast_pages()?;
    assert_eq!(rows.len(), 7);
    let mut offsets: Vec<u64> = rows.iter().map(|r| r.chunk_offset).collect();
    offsets.sort_unstable();
    assert_eq!(offsets, (0..7).map(|i| i * 8_000).collect::<Vec<_>>());
    assert!(rows.iter().all(|r| r.total_size == 50_000 && r.owning_tid == Tid(42)));

    let chunks = rel.toast().chunks(Tid(42), pointer)?;
    assert_eq!(chunks.len(), 7);
    assert_eq!(chunks[0].block, pointer.first_block);
    assert_eq!(chunks[0].opaque.prev, BlockNumber::INVALID);
    assert_eq!(chunks[6].opaque.next, BlockNumber::INVALID);
    assert_eq!(chunks[6].opaque.decompressed_size, 2_000);
    assert_eq!(rel.toast().fetch(Tid(42), pointer)?, value);
    Ok(())
}

#[test]
fn chain_owned_by_another_tid_is_rejected() -> Result<()> {
    let rel = mem_relation(StoreOptions::default().toast_chunk_capacity(1_000));
    let pointer = rel.toast().store(Tid(5), &noise(3_000, 2))?;
    let err = rel.toast().fetch(Tid(6), pointer).unwrap_err();
    assert!(err.is_corruption());
    Ok(())
}

#[test]
fn deleted_chain_pages_are_reused() -> Result<()> {
    let rel = mem_relation(StoreOptions::default().toast_chunk_capacity(4_000));
    let first = rel.toast().store(Tid(1), &noise(12_000, 3))?;
    let blocks_before = rel.pool().nblocks();
    assert_eq!(rel.toast().delete(Tid(1), first)?, 3);
    assert_eq!(meta::free_list(rel.pool())?.len(), 3);

    let second = rel.toast().store(Tid(2), &noise(12_000, 4))?;
    assert_eq!(rel.pool().nblocks(), blocks_before);
    assert!(meta::free_list(rel.pool())?.is_empty());
    assert_eq!(rel.toast().fetch(Tid(2), second)?, noise(12_000, 4));
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn stored_values_reassemble(
        len in 1usize..40_000,
        capacity in 500usize..8_000,
        repetitive in any::<bool>(),
        seed in any::<u64>(),
    ) {
        let rel = mem_relation(StoreOptions::default().toast_chunk_capacity(capacity));
        let value = if repetitive {
            b"colstore".iter().copied().cycle().take(len).collect()
        } else {
            noise(len, seed)
        };
        let pointer = rel.toast().store(Tid(9), &value).unwrap();
        prop_assert_eq!(pointer.total_size, len as u64);
        let chunks = rel.toast().chunks(Tid(9), pointer).unwrap();
        prop_assert_eq!(chunks.len(), len.div_ceil(capacity));
        let declared: u64 = chunks.iter().map(|c| c.opaque.decompressed_size as u64).sum();
        prop_assert_eq!(declared, len as u64);
        prop_assert_eq!(rel.toast().fetch(Tid(9), pointer).unwrap(), value);
    }
}
