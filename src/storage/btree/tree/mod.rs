//! Per-attribute B-tree over tids.
//!
//! Every attribute, and the tid tree at attno 0, has its own tree rooted in
//! the meta page directory. Leaves partition `[Tid::MIN, Tid::MAX_PLUS_ONE)`
//! into half-open ranges linked left to right.

mod insert;
mod maintenance;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use smallvec::SmallVec;
use tracing::{debug, warn};

pub use maintenance::PartitionReport;

use super::cursor::Cursor;
use super::page::{self, Leaf};
use super::stats::{BTreeStats, BTreeStatsSnapshot};
use crate::primitives::pager::{BufferPool, PageMut, PageRef};
use crate::storage::attstream::{AttrType, Datum};
use crate::storage::catalog::{BtreeOpaque, BTREE_FLAG_ROOT, BTREE_PAGE_TAG};
use crate::storage::meta::{self, MetaGuard};
use crate::storage::options::{Compression, StoreOptions};
use crate::types::{
    page::{read_tag, PageHeader},
    AttrNum, BlockNumber, ColstoreError, Result, Tid,
};

/// A locked page the descent can inspect.
pub(crate) trait Latched {
    fn bytes(&self) -> &[u8];
}

impl Latched for PageRef<'_> {
    fn bytes(&self) -> &[u8] {
        self.data()
    }
}

impl Latched for PageMut<'_> {
    fn bytes(&self) -> &[u8] {
        self.data()
    }
}

/// Result of a successful descent: the target page, locked, plus the
/// internal pages visited on the way down.
pub(crate) struct Descended<G> {
    pub page: G,
    pub opaque: BtreeOpaque,
    pub path: DescentPath,
}

/// Internal pages visited from the root, top first.
pub(crate) type DescentPath = SmallVec<[BlockNumber; 8]>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MismatchKind {
    NotBtree,
    Attno,
    Level,
    Range,
}

/// Page that did not match what the descent expected at that point.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Mismatch {
    block: BlockNumber,
    kind: MismatchKind,
    lokey: Tid,
    hikey: Tid,
}

impl Mismatch {
    fn into_error(self, tid: Tid) -> ColstoreError {
        let detail = match self.kind {
            MismatchKind::Range => {
                return ColstoreError::KeyRangeMismatch {
                    block: self.block,
                    tid,
                    lokey: self.lokey,
                    hikey: self.hikey,
                }
            }
            MismatchKind::NotBtree => "descent reached a non-btree page",
            MismatchKind::Attno => "descent reached another attribute's page",
            MismatchKind::Level => "descent reached a page at the wrong level",
        };
        ColstoreError::PageCorruption {
            block: self.block,
            detail,
        }
    }
}

/// The attribute trees of one relation.
pub struct BTree {
    pool: Arc<BufferPool>,
    attrs: Vec<AttrType>,
    smo: Vec<Mutex<()>>,
    max_retries: u32,
    compression: Compression,
    stats: Arc<BTreeStats>,
}

impl BTree {
    /// Opens the trees described by the meta page directory.
    pub fn open(pool: Arc<BufferPool>, options: &StoreOptions) -> Result<Self> {
        let snapshot = meta::read_meta(&pool)?;
        let attrs: Vec<AttrType> = snapshot.attrs.iter().map(|e| e.attr).collect();
        let smo = attrs.iter().map(|_| Mutex::new(())).collect();
        Ok(Self {
            pool,
            attrs,
            smo,
            max_retries: options.max_descend_retries,
            compression: options.compression,
            stats: Arc::new(BTreeStats::default()),
        })
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Physical type of `attno`'s values.
    pub fn attr(&self, attno: AttrNum) -> Result<AttrType> {
        self.attrs
            .get(attno as usize)
            .copied()
            .ok_or(ColstoreError::NotFound("attribute"))
    }

    /// Number of user attributes.
    pub fn natts(&self) -> usize {
        self.attrs.len().saturating_sub(1)
    }

    pub fn stats(&self) -> BTreeStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn emit_stats(&self) {
        self.stats.emit_tracing();
    }

    /// Current root of `attno`'s tree.
    pub fn root(&self, attno: AttrNum) -> Result<BlockNumber> {
        self.attr(attno)?;
        meta::read_root(&self.pool, attno)
    }

    fn smo_lock(&self, attno: AttrNum) -> MutexGuard<'_, ()> {
        self.smo[attno as usize].lock()
    }

    /// Allocates an empty root leaf covering the whole tid space.
    pub fn create_root(&self, attno: AttrNum) -> Result<BlockNumber> {
        self.attr(attno)?;
        let _smo = self.smo_lock(attno);
        let mut meta = MetaGuard::lock(&self.pool)?;
        if meta.entry(attno)?.root.is_valid() {
            return Err(ColstoreError::Invalid("attribute tree already has a root"));
        }
        let mut page = meta.allocate()?;
        let opaque = BtreeOpaque {
            next: BlockNumber::INVALID,
            attno,
            level: 0,
            lokey: Tid::MIN,
            hikey: Tid::MAX_PLUS_ONE,
            flags: BTREE_FLAG_ROOT,
        };
        page::init_leaf(page.data_mut(), &opaque, None, None)?;
        meta.set_root(attno, page.block)?;
        debug!(attno, root = page.block.0, "btree.create_root");
        Ok(page.block)
    }

    /// Value stored for `tid`, if any.
    pub fn lookup(&self, attno: AttrNum, tid: Tid) -> Result<Option<Datum>> {
        let attr = self.attr(attno)?;
        if tid < Tid::MIN || tid >= Tid::MAX_PLUS_ONE {
            return Ok(None);
        }
        let found = self.descend_read(attno, tid, 0)?;
        let leaf = Leaf::parse(found.page.block, found.page.data())?;
        leaf.find(attr, tid)
    }

    /// Lazy scan of `[lo, hi)`.
    pub fn scan(&self, attno: AttrNum, lo: Tid, hi: Tid) -> Result<Cursor<'_>> {
        Cursor::new(self, attno, self.attr(attno)?, lo, hi, None)
    }

    /// Like [`BTree::scan`], failing with `Interrupted` once `interrupt` is
    /// raised. The flag is checked before every leaf.
    pub fn scan_interruptible<'a>(
        &'a self,
        attno: AttrNum,
        lo: Tid,
        hi: Tid,
        interrupt: &'a AtomicBool,
    ) -> Result<Cursor<'a>> {
        Cursor::new(self, attno, self.attr(attno)?, lo, hi, Some(interrupt))
    }

    pub(crate) fn descend_read(
        &self,
        attno: AttrNum,
        tid: Tid,
        level: u16,
    ) -> Result<Descended<PageRef<'_>>> {
        self.descend(attno, tid, level, |block| self.pool.read(block))
    }

    pub(crate) fn descend_write(
        &self,
        attno: AttrNum,
        tid: Tid,
        level: u16,
    ) -> Result<Descended<PageMut<'_>>> {
        self.descend(attno, tid, level, |block| self.pool.write(block))
    }

    /// Descends from the root to the page at `level` covering `tid`,
    /// restarting when a page no longer matches. Seeing the same mismatch
    /// on two consecutive attempts is reported as corruption.
    fn descend<G, L>(&self, attno: AttrNum, tid: Tid, level: u16, lock: L) -> Result<Descended<G>>
    where
        G: Latched,
        L: Fn(BlockNumber) -> Result<G>,
    {
        let mut previous: Option<Mismatch> = None;
        for attempt in 0..=self.max_retries {
            match self.try_descend(attno, tid, level, &lock)? {
                Ok(found) => {
                    if level == 0 {
                        self.stats.inc_leaf_searches();
                    }
                    return Ok(found);
                }
                Err(mismatch) => {
                    if previous == Some(mismatch) {
                        return Err(mismatch.into_error(tid));
                    }
                    self.stats.inc_descend_retries();
                    warn!(
                        attno,
                        tid = tid.0,
                        block = mismatch.block.0,
                        kind = ?mismatch.kind,
                        attempt,
                        "btree.descend.retry"
                    );
                    previous = Some(mismatch);
                }
            }
        }
        Err(ColstoreError::RetryExhausted {
            attno,
            tid,
            attempts: self.max_retries + 1,
        })
    }

    fn try_descend<G, L>(
        &self,
        attno: AttrNum,
        tid: Tid,
        level: u16,
        lock: &L,
    ) -> Result<std::result::Result<Descended<G>, Mismatch>>
    where
        G: Latched,
        L: Fn(BlockNumber) -> Result<G>,
    {
        let root = self.root(attno)?;
        if !root.is_valid() {
            return Err(ColstoreError::NotFound("btree root"));
        }
        let mut block = root;
        let mut expect_level = None;
        let mut path = DescentPath::new();
        loop {
            let page = self.pool.read(block)?;
            let opaque = match check_node(block, page.data(), attno, expect_level, tid)? {
                Ok((_, opaque)) => opaque,
                Err(mismatch) => return Ok(Err(mismatch)),
            };
            if opaque.level < level {
                return Err(ColstoreError::NotFound("btree level"));
            }
            if opaque.level == level {
                drop(page);
                let guard = lock(block)?;
                return Ok(
                    check_node(block, guard.bytes(), attno, Some(level), tid)?.map(
                        |(_, opaque)| Descended {
                            page: guard,
                            opaque,
                            path,
                        },
                    ),
                );
            }
            self.stats.inc_internal_searches();
            let items = page::internal_items(block, page.data())?;
            let child = items[page::child_index(&items, tid)].child;
            path.push(block);
            expect_level = Some(opaque.level - 1);
            block = child;
        }
    }
}

/// Checks that `data` is a page of `attno`'s tree at `level` whose range
/// covers `tid`. Structural damage is an error; a mismatch is not.
fn check_node(
    block: BlockNumber,
    data: &[u8],
    attno: AttrNum,
    level: Option<u16>,
    tid: Tid,
) -> Result<std::result::Result<(PageHeader, BtreeOpaque), Mismatch>> {
    let mismatch = |kind, opaque: Option<&BtreeOpaque>| Mismatch {
        block,
        kind,
        lokey: opaque.map_or(Tid::INVALID, |o| o.lokey),
        hikey: opaque.map_or(Tid::INVALID, |o| o.hikey),
    };
    if read_tag(data) != BTREE_PAGE_TAG {
        return Ok(Err(mismatch(MismatchKind::NotBtree, None)));
    }
    let (hdr, opaque) = page::read_node(block, data)?;
    if opaque.attno != attno {
        return Ok(Err(mismatch(MismatchKind::Attno, Some(&opaque))));
    }
    if level.is_some_and(|l| l != opaque.level) {
        return Ok(Err(mismatch(MismatchKind::Level, Some(&opaque))));
    }
    if !opaque.covers(tid) {
        return Ok(Err(mismatch(MismatchKind::Range, Some(&opaque))));
    }
    Ok(Ok((hdr, opaque)))
}
