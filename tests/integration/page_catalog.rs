#![allow(missing_docs)]

use std::path::PathBuf;

use colstore::{
    admin::{open_pool, AdminOpenOptions, Inspector},
    storage::{attstream::AttrType, catalog::PageType, meta, Relation, StoreOptions},
    types::{page::write_tag, BlockNumber, Tid},
};
use tempfile::TempDir;

fn fresh_relation(name: &str, attrs: &[AttrType]) -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join(format!("{name}.col"));
    let rel = Relation::create_path(&path, attrs, StoreOptions::default()).expect("create");
    rel.flush().expect("flush");
    (dir, path)
}

#[test]
fn initialized_meta_page_is_empty() {
    let attrs = [AttrType::by_value(4).unwrap(), AttrType::VARLENA];
    let (_dir, path) = fresh_relation("meta", &attrs);
    let pool = open_pool(&path, &AdminOpenOptions::default()).expect("open pool");
    let inspector = Inspector::new(&pool);

    let row = inspector.meta_page_snapshot().expect("meta");
    assert_eq!(row.block, meta::META_BLOCK);
    assert_eq!(row.undo_head, row.undo_tail);
    assert_eq!(row.undo_head, BlockNumber::INVALID);
    assert_eq!(row.free_list_head, BlockNumber::INVALID);
    assert_eq!(row.flags, 0);
    assert_eq!(row.natts, 2);
    assert_eq!(row.next_tid, Tid::MIN);
    assert_eq!(row.roots.len(), 3);
    assert!(row.roots.iter().all(|root| root.is_valid()));

    assert_eq!(inspector.page_type(meta::META_BLOCK).unwrap(), PageType::Meta);
    for root in &row.roots {
        assert_eq!(inspector.page_type(*root).unwrap(), PageType::Btree);
    }
    assert!(inspector.scan_undo_pages().unwrap().is_empty());
    assert!(inspector.scan_toast_pages().unwrap().is_empty());
    assert_eq!(inspector.scan_btree_pages().unwrap().len(), 3);
}

#[test]
fn relation_reopens_from_disk() {
    let (_dir, path) = fresh_relation("reopen", &[AttrType::by_value(8).unwrap()]);
    let rel = Relation::open_path(&path, StoreOptions::default()).expect("reopen");
    assert_eq!(rel.natts(), 1);
    assert_eq!(rel.meta().unwrap().attrs[1].attr, AttrType::by_value(8).unwrap());
}

#[test]
fn unknown_tag_classifies_as_unrecognized() {
    let (_dir, path) = fresh_relation("tags", &[AttrType::VARLENA]);
    let root = {
        let pool = open_pool(&path, &AdminOpenOptions::default()).unwrap();
        let root = meta::read_root(&pool, 1).unwrap();
        {
            let mut page = pool.write(root).unwrap();
            write_tag(page.data_mut(), 0x1234);
        }
        pool.flush().unwrap();
        root
    };

    let pool = open_pool(&path, &AdminOpenOptions::default()).unwrap();
    let inspector = Inspector::new(&pool);
    assert_eq!(
        inspector.page_type(root).expect("classification never fails on tags"),
        PageType::Unrecognized(0x1234)
    );
    // Only the tid tree root is left for the B-tree scan to report.
    let rows = inspector.scan_btree_pages().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].attno, 0);
}

#[test]
fn out_of_range_block_is_not_found() {
    let (_dir, path) = fresh_relation("range", &[AttrType::VARLENA]);
    let pool = open_pool(&path, &AdminOpenOptions::default()).unwrap();
    let err = Inspector::new(&pool)
        .page_type(BlockNumber(pool.nblocks() + 10))
        .unwrap_err();
    assert!(!err.is_corruption());
}

#[test]
fn missing_file_is_reported() {
    let dir = TempDir::new().unwrap();
    let err = open_pool(&dir.path().join("absent.col"), &AdminOpenOptions::default())
        .err()
        .expect("missing file");
    assert!(err.to_string().contains("relation not found"));
}
