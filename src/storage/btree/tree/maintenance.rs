use tracing::debug;

use super::insert::LeafWrite;
use super::{BTree, Descended};
use crate::storage::btree::page::{self, Leaf, LeafState};
use crate::storage::catalog;
use crate::storage::meta::MetaGuard;
use crate::types::{AttrNum, BlockNumber, ColstoreError, Result, Tid};

/// Outcome of [`BTree::check_partition`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct PartitionReport {
    pub leaves: usize,
    pub items: usize,
    /// Number of levels, leaves included.
    pub depth: u16,
}

impl BTree {
    /// Removes `tids` from the tree and folds leaves left empty into their
    /// left sibling. Returns the number of items removed.
    pub fn remove(&self, attno: AttrNum, tids: &[Tid]) -> Result<usize> {
        let attr = self.attr(attno)?;
        let mut sorted: Vec<Tid> = tids
            .iter()
            .copied()
            .filter(|t| *t >= Tid::MIN && *t < Tid::MAX_PLUS_ONE)
            .collect();
        sorted.sort_unstable();
        sorted.dedup();

        let mut removed = 0usize;
        let mut emptied = Vec::new();
        let mut rest = &sorted[..];
        while let Some(&first) = rest.first() {
            let mut found = self.descend_write(attno, first, 0)?;
            let n = rest.partition_point(|t| *t < found.opaque.hikey);
            let batch = &rest[..n];
            rest = &rest[n..];

            let mut items = Leaf::parse(found.page.block, found.page.data())?.items(attr)?;
            let before = items.len();
            items.retain(|i| batch.binary_search(&i.tid).is_err());
            let gone = before - items.len();
            if gone == 0 {
                continue;
            }
            removed += gone;
            let now_empty = items.is_empty();
            let lokey = found.opaque.lokey;
            let is_root = found.opaque.is_root();
            match self.rewrite_leaf(attr, &mut found.page, &found.opaque, items)? {
                LeafWrite::Done => {}
                LeafWrite::Split(_) => {
                    drop(found);
                    self.modify_leaf_smo(attno, attr, first, |items| {
                        items.retain(|i| batch.binary_search(&i.tid).is_err());
                        Ok(())
                    })?;
                }
            }
            if now_empty && !is_root {
                emptied.push(lokey);
            }
        }
        for lokey in emptied {
            self.merge_empty_leaf(attno, lokey)?;
        }
        debug!(attno, removed, "btree.remove");
        Ok(removed)
    }

    /// Folds the empty leaf starting at `lokey` into its left sibling under
    /// the same parent and frees it. Leftmost children are left alone.
    /// Returns `true` if a page was freed.
    pub fn merge_empty_leaf(&self, attno: AttrNum, lokey: Tid) -> Result<bool> {
        let _smo = self.smo_lock(attno);
        let Descended {
            page: mut parent,
            opaque: parent_opaque,
            ..
        } = match self.descend_write(attno, lokey, 1) {
            Ok(found) => found,
            Err(ColstoreError::NotFound(_)) => return Ok(false),
            Err(err) => return Err(err),
        };
        let mut items = page::internal_items(parent.block, parent.data())?;
        let idx = page::child_index(&items, lokey);
        if idx == 0 || items[idx].key != lokey {
            return Ok(false);
        }
        let (left_block, target_block) = (items[idx - 1].child, items[idx].child);
        let mut left = self.pool.write(left_block)?;
        let mut target = self.pool.write(target_block)?;
        let left_leaf = Leaf::parse(left_block, left.data())?;
        let target_leaf = Leaf::parse(target_block, target.data())?;
        if left_leaf.opaque.attno != attno
            || target_leaf.opaque.attno != attno
            || left_leaf.opaque.next != target_block
            || left_leaf.opaque.hikey != target_leaf.opaque.lokey
        {
            return Err(ColstoreError::PageCorruption {
                block: target_block,
                detail: "sibling leaves disagree with their parent",
            });
        }
        if target_leaf.state() != LeafState::Empty {
            return Ok(false);
        }

        let mut merged = left_leaf.opaque;
        merged.hikey = target_leaf.opaque.hikey;
        merged.next = target_leaf.opaque.next;
        catalog::write_trailer(left.data_mut(), &merged);
        items.remove(idx);
        page::init_internal(parent.data_mut(), &parent_opaque, &items)?;

        let mut meta = MetaGuard::lock(&self.pool)?;
        meta.free_locked(&mut target)?;
        self.stats.inc_leaf_merges();
        debug!(
            attno,
            left = left_block.0,
            freed = target_block.0,
            "btree.merge"
        );
        Ok(true)
    }

    /// Walks the leaf level left to right and verifies that the leaf ranges
    /// partition the tid space with no gap or overlap, and that every item
    /// lies inside its leaf's range.
    pub fn check_partition(&self, attno: AttrNum) -> Result<PartitionReport> {
        let attr = self.attr(attno)?;
        let root = self.root(attno)?;
        let depth = {
            let page = self.pool.read(root)?;
            page::read_node(root, page.data())?.1.level + 1
        };
        let mut block = self.descend_read(attno, Tid::MIN, 0)?.page.block;
        let mut report = PartitionReport {
            depth,
            ..PartitionReport::default()
        };
        let mut expected_lo = Tid::MIN;
        loop {
            if report.leaves as u32 > self.pool.nblocks() {
                return Err(ColstoreError::Corruption("leaf chain contains a cycle"));
            }
            let page = self.pool.read(block)?;
            let leaf = Leaf::parse(block, page.data())?;
            if leaf.opaque.attno != attno {
                return Err(ColstoreError::PageCorruption {
                    block,
                    detail: "leaf chain crosses into another attribute",
                });
            }
            if leaf.opaque.lokey != expected_lo {
                return Err(ColstoreError::PageCorruption {
                    block,
                    detail: "leaf ranges leave a gap or overlap",
                });
            }
            report.items += leaf.items(attr)?.len();
            report.leaves += 1;
            expected_lo = leaf.opaque.hikey;
            match leaf.opaque.next.valid() {
                Some(next) => block = next,
                None => break,
            }
        }
        if expected_lo != Tid::MAX_PLUS_ONE {
            return Err(ColstoreError::PageCorruption {
                block,
                detail: "rightmost leaf does not end the tid space",
            });
        }
        Ok(report)
    }

    /// Leaf blocks from left to right.
    pub fn leaf_blocks(&self, attno: AttrNum) -> Result<Vec<BlockNumber>> {
        let mut block = self.descend_read(attno, Tid::MIN, 0)?.page.block;
        let mut out = Vec::new();
        loop {
            if out.len() as u32 > self.pool.nblocks() {
                return Err(ColstoreError::Corruption("leaf chain contains a cycle"));
            }
            out.push(block);
            let page = self.pool.read(block)?;
            match Leaf::parse(block, page.data())?.opaque.next.valid() {
                Some(next) => block = next,
                None => return Ok(out),
            }
        }
    }
}
