use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{trace, warn};

use super::page::{self, Leaf};
use super::tree::BTree;
use crate::storage::attstream::{AttItem, AttrType};
use crate::storage::catalog::BTREE_PAGE_TAG;
use crate::types::{page::read_tag, AttrNum, BlockNumber, ColstoreError, Result, Tid};

/// Lazy range scan over one attribute tree.
///
/// Leaves are loaded one at a time. Moving right follows the `next` link
/// and checks that the sibling starts where the previous leaf ended; if it
/// does not (a split or merge happened in between) the cursor re-descends
/// from the root at the first tid it has not returned yet.
pub struct Cursor<'a> {
    tree: &'a BTree,
    attno: AttrNum,
    attr: AttrType,
    /// Lowest tid the next leaf load may return.
    next_tid: Tid,
    hi: Tid,
    buffer: std::vec::IntoIter<AttItem>,
    follow: Option<(BlockNumber, Tid)>,
    interrupt: Option<&'a AtomicBool>,
    leaves: usize,
    done: bool,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(
        tree: &'a BTree,
        attno: AttrNum,
        attr: AttrType,
        lo: Tid,
        hi: Tid,
        interrupt: Option<&'a AtomicBool>,
    ) -> Result<Self> {
        let lo = lo.max(Tid::MIN);
        let hi = hi.min(Tid::MAX_PLUS_ONE);
        Ok(Self {
            tree,
            attno,
            attr,
            next_tid: lo,
            hi,
            buffer: Vec::new().into_iter(),
            follow: None,
            interrupt,
            leaves: 0,
            done: lo >= hi,
        })
    }

    /// Returns the next item in tid order.
    pub fn next(&mut self) -> Result<Option<AttItem>> {
        loop {
            if let Some(item) = self.buffer.next() {
                return Ok(Some(item));
            }
            if self.done {
                return Ok(None);
            }
            if let Err(err) = self.load_leaf() {
                self.done = true;
                return Err(err);
            }
        }
    }

    /// Number of leaves loaded so far.
    pub fn leaves_visited(&self) -> usize {
        self.leaves
    }

    fn load_leaf(&mut self) -> Result<()> {
        if self.interrupt.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
            return Err(ColstoreError::Interrupted);
        }
        let leaf = match self.follow.take() {
            Some((block, lokey)) => match self.read_sibling(block, lokey)? {
                Some(leaf) => leaf,
                None => self.descend_leaf()?,
            },
            None => self.descend_leaf()?,
        };
        self.leaves += 1;
        let (lo, hi) = (self.next_tid, self.hi);
        let items: Vec<AttItem> = leaf
            .items(self.attr)?
            .into_iter()
            .filter(|i| i.tid >= lo && i.tid < hi)
            .collect();
        trace!(
            attno = self.attno,
            block = leaf.block.0,
            items = items.len(),
            "btree.scan.leaf"
        );
        self.buffer = items.into_iter();
        let hikey = leaf.opaque.hikey;
        if hikey >= self.hi || !leaf.opaque.next.is_valid() {
            self.done = true;
        } else {
            self.next_tid = hikey;
            self.follow = Some((leaf.opaque.next, hikey));
        }
        Ok(())
    }

    fn descend_leaf(&self) -> Result<Leaf> {
        let found = self.tree.descend_read(self.attno, self.next_tid, 0)?;
        Leaf::parse(found.page.block, found.page.data())
    }

    fn read_sibling(&self, block: BlockNumber, lokey: Tid) -> Result<Option<Leaf>> {
        let page = self.tree.pool().read(block)?;
        let data = page.data();
        if read_tag(data) == BTREE_PAGE_TAG {
            let (_, opaque) = page::read_node(block, data)?;
            if opaque.attno == self.attno && opaque.level == 0 && opaque.lokey == lokey {
                return Leaf::parse(block, data).map(Some);
            }
        }
        warn!(
            attno = self.attno,
            block = block.0,
            tid = lokey.0,
            "btree.scan.resync"
        );
        Ok(None)
    }
}
