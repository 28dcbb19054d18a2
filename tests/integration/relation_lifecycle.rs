#![allow(missing_docs)]

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

use bytes::Bytes;
use colstore::{
    admin::{verify_relation, VerifyLevel},
    storage::{
        attstream::AttrType,
        undo::{AllVisible, CounterSnapshot, LockMode},
        Relation, Row, StoreOptions, Values,
    },
    types::{ColstoreError, Result, Tid},
};
use tempfile::TempDir;

fn attrs() -> [AttrType; 3] {
    [
        AttrType::by_value(8).unwrap(),
        AttrType::VARLENA,
        AttrType::fixed(16).unwrap(),
    ]
}

fn options() -> StoreOptions {
    StoreOptions::default().toast_threshold(512).cache_pages(64)
}

fn row(n: u64) -> Values {
    let text = if n % 50 == 0 {
        vec![b'L'; 3_000 + n as usize]
    } else {
        format!("value-{n}").into_bytes()
    };
    let mut fixed = [0u8; 16];
    fixed[..8].copy_from_slice(&n.to_be_bytes());
    vec![
        Some(Bytes::copy_from_slice(&n.to_be_bytes())),
        if n % 7 == 3 { None } else { Some(Bytes::from(text)) },
        Some(Bytes::copy_from_slice(&fixed)),
    ]
}

fn scan_all(rel: &Relation, oracle: &dyn colstore::storage::undo::VisibilityOracle) -> Result<Vec<Row>> {
    let mut scan = rel.scan(oracle, None)?;
    let mut out = Vec::new();
    while let Some(row) = scan.next()? {
        out.push(row);
    }
    Ok(out)
}

fn seeded(dir: &Path) -> Result<(PathBuf, Vec<Tid>)> {
    let path = dir.join("rel.col");
    let rel = Relation::create_path(&path, &attrs(), options())?;
    let rows: Vec<Values> = (1..=1_500).map(row).collect();
    let mut tids = Vec::new();
    for batch in rows.chunks(300) {
        tids.extend(rel.insert(10, 0, batch)?);
    }
    rel.flush()?;
    Ok((path, tids))
}

#[test]
fn rows_survive_reopen() -> Result<()> {
    let dir = TempDir::new().expect("tempdir");
    let (path, tids) = seeded(dir.path())?;
    assert_eq!(tids.first(), Some(&Tid::MIN));
    assert!(tids.windows(2).all(|w| w[1] == w[0].next()));

    let rel = Relation::open_path(&path, options())?;
    let rows = scan_all(&rel, &AllVisible)?;
    assert_eq!(rows.len(), 1_500);
    for (i, r) in rows.iter().enumerate() {
        assert_eq!(r.values, row(i as u64 + 1));
    }
    assert_eq!(rel.fetch(Tid(100), &AllVisible)?.unwrap().values, row(100));
    assert_eq!(rel.meta()?.next_tid, Tid(1_501));

    let report = verify_relation(&rel, VerifyLevel::Full);
    assert!(report.success, "{:?}", report.findings);
    // Every 50th value is toasted unless it falls on a NULL slot.
    assert_eq!(report.counts.toast_chains, 26);
    Ok(())
}

#[test]
fn snapshots_see_their_own_history() -> Result<()> {
    let dir = TempDir::new().expect("tempdir");
    let (path, _) = seeded(dir.path())?;
    let rel = Relation::open_path(&path, options())?;

    let before = CounterSnapshot::new(rel.undo().next_counter()?);
    rel.delete(Tid(5), 20, 0)?;
    let new_tid = rel.update(Tid(6), 20, 1, row(6_000))?;
    rel.lock(Tid(7), LockMode::Exclusive, 20, 2)?;
    let after = CounterSnapshot::new(rel.undo().next_counter()?);

    assert!(rel.fetch(Tid(5), &before)?.is_some());
    assert!(rel.fetch(Tid(5), &after)?.is_none());
    assert_eq!(rel.fetch(Tid(6), &before)?.unwrap().values, row(6));
    assert!(rel.fetch(Tid(6), &after)?.is_none());
    assert_eq!(rel.fetch(new_tid, &after)?.unwrap().values, row(6_000));
    assert!(rel.fetch(new_tid, &before)?.is_none());
    assert_eq!(rel.fetch(Tid(7), &after)?.unwrap().values, row(7));

    assert_eq!(scan_all(&rel, &before)?.len(), 1_500);
    let now = scan_all(&rel, &after)?;
    assert_eq!(now.len(), 1_499);
    assert_eq!(now.last().map(|r| r.tid), Some(new_tid));
    Ok(())
}

#[test]
fn vacuum_reclaims_deleted_rows() -> Result<()> {
    let dir = TempDir::new().expect("tempdir");
    let (path, _) = seeded(dir.path())?;
    let rel = Relation::open_path(&path, options())?;
    for t in (50..=500u64).step_by(50) {
        rel.delete(Tid(t), 30, 0)?;
    }
    let horizon = rel.undo().next_counter()?;
    let report = rel.vacuum(horizon, &AllVisible)?;
    assert_eq!(report.dead_tids, 10);
    assert_eq!(report.items_removed, 40);
    assert_eq!(report.toast_chains_freed, 8);
    assert!(report.undo_pages_freed > 0);

    assert!(rel.fetch(Tid(50), &AllVisible)?.is_none());
    assert_eq!(scan_all(&rel, &AllVisible)?.len(), 1_490);
    assert_eq!(rel.meta()?.opaque.oldest.counter, horizon);
    let verify = verify_relation(&rel, VerifyLevel::Full);
    assert!(verify.success, "{:?}", verify.findings);
    assert_eq!(verify.counts.toast_chains, 18);

    // A second pass finds nothing new.
    assert_eq!(rel.vacuum(horizon, &AllVisible)?.dead_tids, 0);
    Ok(())
}

#[test]
fn raised_interrupt_stops_a_scan() -> Result<()> {
    let dir = TempDir::new().expect("tempdir");
    let (path, _) = seeded(dir.path())?;
    let rel = Relation::open_path(&path, options())?;
    let flag = AtomicBool::new(true);
    let err = match rel.scan(&AllVisible, Some(&flag)) {
        Ok(mut scan) => scan.next().unwrap_err(),
        Err(err) => err,
    };
    assert!(matches!(err, ColstoreError::Interrupted));
    Ok(())
}

#[test]
fn rows_of_the_wrong_shape_are_rejected() -> Result<()> {
    let dir = TempDir::new().expect("tempdir");
    let rel = Relation::create_path(dir.path().join("shape.col"), &attrs(), options())?;
    let short = vec![Some(Bytes::from_static(b"12345678"))];
    assert!(rel.insert(1, 0, &[short]).is_err());
    let mut bad_fixed = row(1);
    bad_fixed[2] = Some(Bytes::from_static(b"too short"));
    assert!(rel.insert(1, 0, &[bad_fixed]).is_err());
    assert!(rel.fetch(Tid::MIN, &AllVisible)?.is_none());
    Ok(())
}
