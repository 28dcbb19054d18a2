#![allow(missing_docs)]

use std::sync::Arc;

use colstore::{
    admin::Inspector,
    primitives::{io::MemFileIo, pager::BufferPool},
    storage::{
        attstream::AttrType,
        undo::{CounterSnapshot, NewUndoRecord, TupleVisibility},
        Relation, StoreOptions,
    },
    types::{Result, Tid},
};
use proptest::prelude::*;
use tempfile::TempDir;

fn mem_relation() -> Relation {
    let options = StoreOptions::default();
    let pool = Arc::new(
        BufferPool::new(Arc::new(MemFileIo::new()), options.pool_options()).expect("pool"),
    );
    Relation::create(pool, &[AttrType::VARLENA], options).expect("relation")
}

fn record(tid: u64, payload_len: usize) -> NewUndoRecord {
    NewUndoRecord::insert(Tid(tid), 7, 0).with_payload(vec![0x5A; payload_len])
}

#[test]
fn oversized_third_record_starts_a_second_page() -> Result<()> {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("undo.col");
    {
        let rel = Relation::create_path(&path, &[AttrType::VARLENA], StoreOptions::default())?;
        for (tid, len) in [(1, 40), (2, 40), (3, 9000)] {
            rel.undo().append(record(tid, len))?;
        }
        rel.flush()?;
    }

    let rel = Relation::open_path(&path, StoreOptions::default())?;
    let rows = Inspector::new(rel.pool()).scan_undo_pages()?;
    let counts: Vec<u16> = rows.iter().map(|r| r.record_count).collect();
    assert_eq!(counts, vec![2, 1]);
    assert_eq!(rows[0].next, rows[1].block);
    assert_eq!(rows[0].first_pointer.counter, 1);
    assert_eq!(rows[0].last_pointer.counter, 2);
    assert_eq!(rows[1].first_pointer.counter, 3);

    let meta = Inspector::new(rel.pool()).meta_page_snapshot()?;
    assert_eq!(meta.undo_head, rows[0].block);
    assert_eq!(meta.undo_tail, rows[1].block);
    assert_eq!(meta.undo_tail_first_counter, 3);

    // The spilled payload lives in TOAST and comes back intact.
    let spilled = rel.undo().fetch(rows[1].first_pointer)?;
    assert!(spilled.header.is_spilled());
    assert_eq!(spilled.payload.len(), 9000);
    assert!(!Inspector::new(rel.pool()).scan_toast_pages()?.is_empty());
    Ok(())
}

#[test]
fn horizon_hides_nothing_below_it() -> Result<()> {
    let rel = mem_relation();
    let first = rel.undo().append(record(1, 16))?;
    let second = rel.undo().append(record(2, 16))?;
    let freed = rel.undo().advance_oldest(second.counter)?;
    assert_eq!(freed, 0);
    // Below the oldest retained counter everything is visible to everyone.
    assert_eq!(
        rel.undo().resolve(first, &CounterSnapshot::new(0))?,
        TupleVisibility::Visible
    );
    assert_eq!(
        rel.undo().resolve(second, &CounterSnapshot::new(second.counter))?,
        TupleVisibility::Invisible
    );
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn counters_are_dense_and_increasing(sizes in proptest::collection::vec(0usize..3000, 1..80)) {
        let rel = mem_relation();
        let mut previous = None;
        for (i, len) in sizes.iter().enumerate() {
            let ptr = rel.undo().append(record(i as u64 + 1, *len)).unwrap();
            prop_assert_eq!(ptr.counter, i as u64 + 1);
            if let Some(prev) = previous {
                prop_assert!(ptr.counter > prev);
            }
            previous = Some(ptr.counter);
            let header = rel.undo().fetch_header(ptr).unwrap();
            prop_assert_eq!(header.tid, Tid(i as u64 + 1));
        }
        let total: usize = Inspector::new(rel.pool())
            .scan_undo_pages()
            .unwrap()
            .iter()
            .map(|r| r.record_count as usize)
            .sum();
        prop_assert_eq!(total, sizes.len());
    }
}
