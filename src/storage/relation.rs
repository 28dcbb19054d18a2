//! Relation context: the attribute trees, the undo log and TOAST of one
//! relation file, opened together.
//!
//! Row versions are anchored in the tid tree (attno 0), whose value for a
//! tid is the pointer to the newest undo record of that row. User columns
//! live in attribute trees 1..=natts keyed by the same tid.

use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info};

use crate::primitives::io::StdFileIo;
use crate::primitives::pager::BufferPool;
use crate::storage::attstream::{AttItem, AttrType, Datum};
use crate::storage::btree::{BTree, BTreeStatsSnapshot, Cursor};
use crate::storage::meta::{self, MetaGuard, MetaSnapshot};
use crate::storage::options::StoreOptions;
use crate::storage::toast::{Toast, ToastMetricsSnapshot};
use crate::storage::undo::{
    LockMode, NewUndoRecord, UndoKind, UndoLog, VisibilityOracle,
};
use crate::types::{AttrNum, ColstoreError, Result, Tid, UndoPtr, TID_TREE_ATTNO};

/// Column values of one row; `None` is SQL NULL.
pub type Values = Vec<Option<Bytes>>;

/// A visible row version.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Row {
    pub tid: Tid,
    pub values: Values,
}

/// Work done by [`Relation::vacuum`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct VacuumReport {
    pub dead_tids: usize,
    pub items_removed: usize,
    pub toast_chains_freed: usize,
    pub undo_pages_freed: usize,
}

/// An open relation.
pub struct Relation {
    pool: Arc<BufferPool>,
    tree: BTree,
    undo: UndoLog,
    toast: Arc<Toast>,
    options: StoreOptions,
}

impl Relation {
    /// Formats an empty relation with the given user attributes.
    pub fn create(pool: Arc<BufferPool>, attrs: &[AttrType], options: StoreOptions) -> Result<Self> {
        options.validate()?;
        meta::init_meta(&pool, attrs)?;
        let rel = Self::open(pool, options)?;
        for attno in 0..=attrs.len() as AttrNum {
            rel.tree.create_root(attno)?;
        }
        info!(natts = attrs.len(), "relation.create");
        Ok(rel)
    }

    /// Opens a formatted relation.
    pub fn open(pool: Arc<BufferPool>, options: StoreOptions) -> Result<Self> {
        options.validate()?;
        let tree = BTree::open(Arc::clone(&pool), &options)?;
        let toast = Arc::new(Toast::new(Arc::clone(&pool), &options)?);
        let undo = UndoLog::new(Arc::clone(&pool), Arc::clone(&toast));
        Ok(Self {
            pool,
            tree,
            undo,
            toast,
            options,
        })
    }

    /// Creates a relation file at `path`.
    pub fn create_path(path: impl AsRef<Path>, attrs: &[AttrType], options: StoreOptions) -> Result<Self> {
        let pool = Self::file_pool(path.as_ref(), &options)?;
        Self::create(pool, attrs, options)
    }

    /// Opens the relation file at `path`.
    pub fn open_path(path: impl AsRef<Path>, options: StoreOptions) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ColstoreError::NotFound("relation file"));
        }
        let pool = Self::file_pool(path, &options)?;
        Self::open(pool, options)
    }

    fn file_pool(path: &Path, options: &StoreOptions) -> Result<Arc<BufferPool>> {
        let io = StdFileIo::open(path)?;
        Ok(Arc::new(BufferPool::new(Arc::new(io), options.pool_options())?))
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn tree(&self) -> &BTree {
        &self.tree
    }

    pub fn undo(&self) -> &UndoLog {
        &self.undo
    }

    pub fn toast(&self) -> &Toast {
        &self.toast
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    pub fn natts(&self) -> usize {
        self.tree.natts()
    }

    pub fn meta(&self) -> Result<MetaSnapshot> {
        meta::read_meta(&self.pool)
    }

    pub fn btree_stats(&self) -> BTreeStatsSnapshot {
        self.tree.stats()
    }

    pub fn toast_metrics(&self) -> ToastMetricsSnapshot {
        self.toast.metrics()
    }

    /// Writes every dirty page back to the relation file.
    pub fn flush(&self) -> Result<()> {
        self.pool.flush()
    }

    /// Inserts `rows` as new versions created by (`xid`, `cid`) and returns
    /// their tids in order.
    pub fn insert(&self, xid: u64, cid: u32, rows: &[Values]) -> Result<Vec<Tid>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        for row in rows {
            self.check_row(row)?;
        }
        let first = MetaGuard::lock(&self.pool)?.reserve_tids(rows.len() as u64)?;
        let tids: Vec<Tid> = (0..rows.len() as u64).map(|i| Tid(first.0 + i)).collect();

        let mut anchors = Vec::with_capacity(rows.len());
        for &tid in &tids {
            let ptr = self.undo.append(NewUndoRecord::insert(tid, xid, cid))?;
            anchors.push(AttItem::new(tid, undo_datum(ptr)));
        }
        for attno in 1..=self.natts() as AttrNum {
            let attr = self.tree.attr(attno)?;
            let mut items = Vec::with_capacity(rows.len());
            for (row, &tid) in rows.iter().zip(&tids) {
                let datum = self.to_datum(attr, tid, &row[attno as usize - 1])?;
                items.push(AttItem::new(tid, datum));
            }
            self.tree.insert(attno, &items)?;
        }
        // The tid tree goes last: a tid present there has all its columns.
        self.tree.insert(TID_TREE_ATTNO, &anchors)?;
        debug!(xid, cid, first = first.0, rows = rows.len(), "relation.insert");
        Ok(tids)
    }

    /// Records a delete of `tid`.
    pub fn delete(&self, tid: Tid, xid: u64, cid: u32) -> Result<UndoPtr> {
        let prev = self.anchor(tid)?;
        let ptr = self.undo.append(NewUndoRecord::delete(tid, xid, cid, prev))?;
        self.tree.replace(TID_TREE_ATTNO, tid, undo_datum(ptr))?;
        debug!(tid = tid.0, xid, "relation.delete");
        Ok(ptr)
    }

    /// Inserts `row` as the successor of `tid` and marks `tid` updated.
    /// Returns the new version's tid.
    pub fn update(&self, tid: Tid, xid: u64, cid: u32, row: Values) -> Result<Tid> {
        let prev = self.anchor(tid)?;
        let new_tid = self
            .insert(xid, cid, std::slice::from_ref(&row))?
            .first()
            .copied()
            .ok_or(ColstoreError::Invalid("update produced no row"))?;
        let ptr = self
            .undo
            .append(NewUndoRecord::update(tid, new_tid, xid, cid, prev))?;
        self.tree.replace(TID_TREE_ATTNO, tid, undo_datum(ptr))?;
        debug!(tid = tid.0, new_tid = new_tid.0, xid, "relation.update");
        Ok(new_tid)
    }

    /// Records a row lock on `tid`. Locks do not change visibility.
    pub fn lock(&self, tid: Tid, mode: LockMode, xid: u64, cid: u32) -> Result<UndoPtr> {
        let prev = self.anchor(tid)?;
        let ptr = self
            .undo
            .append(NewUndoRecord::lock(tid, mode, xid, cid, prev))?;
        self.tree.replace(TID_TREE_ATTNO, tid, undo_datum(ptr))?;
        Ok(ptr)
    }

    /// Newest undo pointer of `tid`.
    pub fn anchor(&self, tid: Tid) -> Result<UndoPtr> {
        match self.tree.lookup(TID_TREE_ATTNO, tid)? {
            Some(datum) => anchor_of(tid, &datum),
            None => Err(ColstoreError::NotFound("tid")),
        }
    }

    /// The row at `tid` if `oracle` can see it.
    pub fn fetch(&self, tid: Tid, oracle: &dyn VisibilityOracle) -> Result<Option<Row>> {
        let Some(datum) = self.tree.lookup(TID_TREE_ATTNO, tid)? else {
            return Ok(None);
        };
        let ptr = anchor_of(tid, &datum)?;
        if !self.undo.resolve(ptr, oracle)?.is_visible() {
            return Ok(None);
        }
        let mut values = Vec::with_capacity(self.natts());
        for attno in 1..=self.natts() as AttrNum {
            let datum = self
                .tree
                .lookup(attno, tid)?
                .ok_or(ColstoreError::Corruption("tid has no value in an attribute tree"))?;
            values.push(self.detoast(tid, datum)?);
        }
        Ok(Some(Row { tid, values }))
    }

    /// Rows visible to `oracle` in tid order. A raised `interrupt` fails the
    /// scan before its next leaf.
    pub fn scan<'a>(
        &'a self,
        oracle: &'a dyn VisibilityOracle,
        interrupt: Option<&'a AtomicBool>,
    ) -> Result<RowScan<'a>> {
        let (lo, hi) = (Tid::MIN, Tid::MAX_PLUS_ONE);
        let anchors = match interrupt {
            Some(flag) => self.tree.scan_interruptible(TID_TREE_ATTNO, lo, hi, flag)?,
            None => self.tree.scan(TID_TREE_ATTNO, lo, hi)?,
        };
        let mut columns = Vec::with_capacity(self.natts());
        for attno in 1..=self.natts() as AttrNum {
            let cursor = match interrupt {
                Some(flag) => self.tree.scan_interruptible(attno, lo, hi, flag)?,
                None => self.tree.scan(attno, lo, hi)?,
            };
            columns.push(Column {
                attno,
                cursor,
                pending: None,
            });
        }
        Ok(RowScan {
            rel: self,
            oracle,
            anchors,
            columns,
        })
    }

    /// Removes row versions whose delete or update is below `horizon` and
    /// seen by `oracle`, frees their TOAST chains, then discards undo
    /// records below `horizon`.
    ///
    /// `oracle` must see every record below `horizon`; afterwards those
    /// records no longer exist and their rows count as visible to all.
    pub fn vacuum(&self, horizon: u64, oracle: &dyn VisibilityOracle) -> Result<VacuumReport> {
        let oldest = self.meta()?.opaque.oldest.counter;
        let mut dead = Vec::new();
        let mut cursor = self.tree.scan(TID_TREE_ATTNO, Tid::MIN, Tid::MAX_PLUS_ONE)?;
        while let Some(item) = cursor.next()? {
            let ptr = anchor_of(item.tid, &item.datum)?;
            if self.is_dead(ptr, oldest, horizon, oracle)? {
                dead.push(item.tid);
            }
        }
        drop(cursor);

        let mut report = VacuumReport {
            dead_tids: dead.len(),
            ..VacuumReport::default()
        };
        if !dead.is_empty() {
            report.items_removed += self.tree.remove(TID_TREE_ATTNO, &dead)?;
            for attno in 1..=self.natts() as AttrNum {
                if self.tree.attr(attno)?.is_varlena() {
                    for &tid in &dead {
                        if let Some(Datum::Toast(ptr)) = self.tree.lookup(attno, tid)? {
                            self.toast.delete(tid, ptr)?;
                            report.toast_chains_freed += 1;
                        }
                    }
                }
                report.items_removed += self.tree.remove(attno, &dead)?;
            }
        }
        report.undo_pages_freed = self.undo.advance_oldest(horizon)?;
        info!(
            horizon,
            dead = report.dead_tids,
            toast = report.toast_chains_freed,
            undo_pages = report.undo_pages_freed,
            "relation.vacuum"
        );
        Ok(report)
    }

    fn is_dead(
        &self,
        mut ptr: UndoPtr,
        oldest: u64,
        horizon: u64,
        oracle: &dyn VisibilityOracle,
    ) -> Result<bool> {
        loop {
            if !ptr.is_valid() || ptr.counter < oldest {
                return Ok(false);
            }
            let rec = self.undo.fetch_header(ptr)?;
            match rec.kind {
                UndoKind::Insert => return Ok(false),
                UndoKind::Delete | UndoKind::Update => {
                    return Ok(rec.ptr.counter < horizon && oracle.sees(&rec))
                }
                UndoKind::Lock => ptr = rec.prev,
            }
        }
    }

    fn check_row(&self, row: &Values) -> Result<()> {
        if row.len() != self.natts() {
            return Err(ColstoreError::Invalid("row width does not match the relation"));
        }
        for (idx, value) in row.iter().enumerate() {
            let attr = self.tree.attr(idx as AttrNum + 1)?;
            if let (Some(len), Some(v)) = (attr.fixed_len(), value) {
                if v.len() != len {
                    return Err(ColstoreError::Invalid("fixed-length value has wrong width"));
                }
            }
        }
        Ok(())
    }

    fn to_datum(&self, attr: AttrType, tid: Tid, value: &Option<Bytes>) -> Result<Datum> {
        Ok(match value {
            None => Datum::Null,
            Some(v) if attr.is_varlena() && v.len() > self.options.toast_threshold => {
                Datum::Toast(self.toast.store(tid, v)?)
            }
            Some(v) => Datum::Value(v.clone()),
        })
    }

    fn detoast(&self, tid: Tid, datum: Datum) -> Result<Option<Bytes>> {
        Ok(match datum {
            Datum::Null => None,
            Datum::Value(v) => Some(v),
            Datum::Toast(ptr) => Some(Bytes::from(self.toast.fetch(tid, ptr)?)),
        })
    }
}

fn undo_datum(ptr: UndoPtr) -> Datum {
    Datum::Value(Bytes::copy_from_slice(&ptr.to_bytes()))
}

fn anchor_of(tid: Tid, datum: &Datum) -> Result<UndoPtr> {
    match datum {
        Datum::Value(bytes) => UndoPtr::from_bytes(bytes),
        _ => {
            debug!(tid = tid.0, "relation.anchor.malformed");
            Err(ColstoreError::Corruption("tid tree value is not an undo pointer"))
        }
    }
}

struct Column<'a> {
    attno: AttrNum,
    cursor: Cursor<'a>,
    pending: Option<AttItem>,
}

impl Column<'_> {
    /// Advances to `tid` and takes its item, if the cursor has one.
    fn seek(&mut self, tid: Tid) -> Result<Option<AttItem>> {
        loop {
            let item = match self.pending.take() {
                Some(item) => item,
                None => match self.cursor.next()? {
                    Some(item) => item,
                    None => return Ok(None),
                },
            };
            if item.tid == tid {
                return Ok(Some(item));
            }
            if item.tid > tid {
                self.pending = Some(item);
                return Ok(None);
            }
        }
    }
}

/// Visible rows in tid order, produced by [`Relation::scan`].
pub struct RowScan<'a> {
    rel: &'a Relation,
    oracle: &'a dyn VisibilityOracle,
    anchors: Cursor<'a>,
    columns: Vec<Column<'a>>,
}

impl RowScan<'_> {
    pub fn next(&mut self) -> Result<Option<Row>> {
        while let Some(anchor) = self.anchors.next()? {
            let tid = anchor.tid;
            let ptr = anchor_of(tid, &anchor.datum)?;
            if !self.rel.undo.resolve(ptr, self.oracle)?.is_visible() {
                continue;
            }
            let mut values = Vec::with_capacity(self.columns.len());
            for col in &mut self.columns {
                let datum = match col.seek(tid)? {
                    Some(item) => item.datum,
                    // The column moved under the cursor; ask the tree directly.
                    None => self.rel.tree.lookup(col.attno, tid)?.ok_or(
                        ColstoreError::Corruption("tid has no value in an attribute tree"),
                    )?,
                };
                values.push(self.rel.detoast(tid, datum)?);
            }
            return Ok(Some(Row { tid, values }));
        }
        Ok(None)
    }
}
