use std::ops::Range;

use tracing::{debug, trace};

use super::{BTree, DescentPath, Descended};
use crate::primitives::pager::PageMut;
use crate::storage::attstream::{AttItem, AttStream, AttrType, Datum};
use crate::storage::btree::page::{self, merge_items, Downlink, Leaf, INTERNAL_FANOUT};
use crate::storage::catalog::{self, BtreeOpaque, BTREE_FLAG_ROOT};
use crate::storage::meta::MetaGuard;
use crate::storage::options::Compression;
use crate::types::{AttrNum, BlockNumber, ColstoreError, Result, Tid};

/// Items handled by one structural modification.
const SMO_BATCH: usize = 256;

pub(super) enum LeafWrite {
    Done,
    /// The leaf cannot hold these items; it must be split.
    Split(Vec<AttItem>),
}

impl BTree {
    /// Inserts `items`, which must have strictly increasing tids not yet
    /// present in the tree.
    pub fn insert(&self, attno: AttrNum, items: &[AttItem]) -> Result<()> {
        let attr = self.attr(attno)?;
        validate_batch(items)?;
        let mut rest = items;
        while let Some(first) = rest.first() {
            let mut found = self.descend_write(attno, first.tid, 0)?;
            let n = rest.partition_point(|i| i.tid < found.opaque.hikey);
            let batch = &rest[..n];
            if let LeafWrite::Split(_) = self.append_to_leaf(attr, &mut found.page, &found.opaque, batch)? {
                drop(found);
                self.insert_smo(attno, attr, batch)?;
            }
            rest = &rest[n..];
        }
        Ok(())
    }

    /// Overwrites the value stored for `tid`.
    pub fn replace(&self, attno: AttrNum, tid: Tid, datum: Datum) -> Result<()> {
        let attr = self.attr(attno)?;
        let edit = |items: &mut Vec<AttItem>| -> Result<()> {
            let idx = items
                .binary_search_by(|i| i.tid.cmp(&tid))
                .map_err(|_| ColstoreError::NotFound("tid"))?;
            items[idx].datum = datum.clone();
            Ok(())
        };
        {
            let mut found = self.descend_write(attno, tid, 0)?;
            let mut items = Leaf::parse(found.page.block, found.page.data())?.items(attr)?;
            edit(&mut items)?;
            if let LeafWrite::Done = self.rewrite_leaf(attr, &mut found.page, &found.opaque, items)? {
                trace!(attno, tid = tid.0, "btree.replace");
                return Ok(());
            }
        }
        self.modify_leaf_smo(attno, attr, tid, edit)
    }

    /// Applies `edit` to the items of the leaf covering `tid` while holding
    /// the tree's structure lock, splitting the leaf if the result does not
    /// fit.
    pub(super) fn modify_leaf_smo<F>(&self, attno: AttrNum, attr: AttrType, tid: Tid, edit: F) -> Result<()>
    where
        F: Fn(&mut Vec<AttItem>) -> Result<()>,
    {
        let _smo = self.smo_lock(attno);
        let mut found = self.descend_write(attno, tid, 0)?;
        let mut items = Leaf::parse(found.page.block, found.page.data())?.items(attr)?;
        edit(&mut items)?;
        match self.rewrite_leaf(attr, &mut found.page, &found.opaque, items)? {
            LeafWrite::Done => Ok(()),
            LeafWrite::Split(all) => self.split_leaf(attno, attr, found, all),
        }
    }

    fn insert_smo(&self, attno: AttrNum, attr: AttrType, items: &[AttItem]) -> Result<()> {
        let _smo = self.smo_lock(attno);
        let mut rest = items;
        while let Some(first) = rest.first() {
            let mut found = self.descend_write(attno, first.tid, 0)?;
            let n = rest
                .partition_point(|i| i.tid < found.opaque.hikey)
                .min(SMO_BATCH);
            let batch = &rest[..n];
            if let LeafWrite::Split(all) =
                self.append_to_leaf(attr, &mut found.page, &found.opaque, batch)?
            {
                self.split_leaf(attno, attr, found, all)?;
            }
            rest = &rest[n..];
        }
        Ok(())
    }

    /// Adds `batch` to a locked leaf.
    ///
    /// Tids above everything on the leaf go to the uncompressed append
    /// stream while it fits. Otherwise both streams and the batch are merged
    /// into one compressed lower stream.
    fn append_to_leaf(
        &self,
        attr: AttrType,
        page: &mut PageMut<'_>,
        opaque: &BtreeOpaque,
        batch: &[AttItem],
    ) -> Result<LeafWrite> {
        let leaf = Leaf::parse(page.block, page.data())?;
        let appends = match (leaf.lower.as_ref(), leaf.max_tid(), batch.first()) {
            (Some(_), Some(max), Some(first)) => first.tid > max,
            _ => false,
        };
        if appends {
            let mut upper = leaf.stream_items(attr, true)?;
            upper.extend_from_slice(batch);
            let stream = AttStream::build(attr, &upper, Compression::None)?;
            if page::leaf_fits(leaf.lower.as_ref(), Some(&stream)) {
                page::init_leaf(page.data_mut(), opaque, leaf.lower.as_ref(), Some(&stream))?;
                self.stats.inc_leaf_appends();
                trace!(block = page.block.0, items = batch.len(), "btree.leaf.append");
                return Ok(LeafWrite::Done);
            }
        }
        let all = merge_items(leaf.items(attr)?, batch.to_vec())
            .map_err(|_| ColstoreError::Invalid("tid already present in attribute tree"))?;
        self.rewrite_leaf(attr, page, opaque, all)
    }

    /// Rewrites a locked leaf as a single compressed stream.
    pub(super) fn rewrite_leaf(
        &self,
        attr: AttrType,
        page: &mut PageMut<'_>,
        opaque: &BtreeOpaque,
        items: Vec<AttItem>,
    ) -> Result<LeafWrite> {
        let stream = if items.is_empty() {
            None
        } else {
            Some(AttStream::build(attr, &items, self.compression)?)
        };
        if !page::leaf_fits(stream.as_ref(), None) {
            return Ok(LeafWrite::Split(items));
        }
        page::init_leaf(page.data_mut(), opaque, stream.as_ref(), None)?;
        self.stats.inc_leaf_rebuilds();
        trace!(block = page.block.0, items = items.len(), "btree.leaf.rebuild");
        Ok(LeafWrite::Done)
    }

    /// Splits a locked leaf into as many pages as `all` needs. The original
    /// page keeps the first group; downlinks for the rest go to the parent
    /// while every leaf involved is still locked.
    pub(super) fn split_leaf<'a>(
        &'a self,
        attno: AttrNum,
        attr: AttrType,
        found: Descended<PageMut<'a>>,
        all: Vec<AttItem>,
    ) -> Result<()> {
        let Descended {
            page: leaf_page,
            opaque,
            path,
        } = found;
        let groups = self.pack_groups(attr, &all)?;
        let new_pages = self.allocate_pages(groups.len() - 1)?;
        let mut pages = Vec::with_capacity(groups.len());
        pages.push(leaf_page);
        pages.extend(new_pages);

        let blocks: Vec<BlockNumber> = pages.iter().map(|p| p.block).collect();
        let keys: Vec<Tid> = groups
            .iter()
            .enumerate()
            .map(|(k, (range, _))| if k == 0 { opaque.lokey } else { all[range.start].tid })
            .collect();
        for (k, (pg, (_, stream))) in pages.iter_mut().zip(&groups).enumerate() {
            let op = BtreeOpaque {
                next: blocks.get(k + 1).copied().unwrap_or(opaque.next),
                attno,
                level: 0,
                lokey: keys[k],
                hikey: keys.get(k + 1).copied().unwrap_or(opaque.hikey),
                flags: if k == 0 { opaque.flags } else { 0 },
            };
            page::init_leaf(pg.data_mut(), &op, Some(stream), None)?;
        }
        if groups.len() == 1 {
            return Ok(());
        }
        self.stats.inc_leaf_splits();
        debug!(
            attno,
            block = blocks[0].0,
            pages = groups.len(),
            items = all.len(),
            "btree.split"
        );

        let downlinks = (1..blocks.len())
            .map(|k| Downlink {
                key: keys[k],
                child: blocks[k],
            })
            .collect();
        let mut held = pages;
        self.propagate(attno, path, blocks[0], 0, downlinks, &mut held)
    }

    /// Greedy packing: each group is the longest prefix of the remaining
    /// items whose compressed stream fits on a leaf.
    fn pack_groups(&self, attr: AttrType, all: &[AttItem]) -> Result<Vec<(Range<usize>, AttStream)>> {
        let mut out = Vec::new();
        let mut start = 0;
        while start < all.len() {
            let whole = AttStream::build(attr, &all[start..], self.compression)?;
            if page::leaf_fits(Some(&whole), None) {
                out.push((start..all.len(), whole));
                break;
            }
            let (mut lo, mut hi) = (0usize, all.len() - start);
            let mut best = None;
            while hi - lo > 1 {
                let mid = lo + (hi - lo) / 2;
                let stream = AttStream::build(attr, &all[start..start + mid], self.compression)?;
                if page::leaf_fits(Some(&stream), None) {
                    lo = mid;
                    best = Some(stream);
                } else {
                    hi = mid;
                }
            }
            let stream = best.ok_or(ColstoreError::Invalid("item too large for a leaf page"))?;
            out.push((start..start + lo, stream));
            start += lo;
        }
        if out.is_empty() {
            return Err(ColstoreError::Invalid("nothing to split"));
        }
        Ok(out)
    }

    /// Allocates `n` zeroed pages under one meta lock. On failure the pages
    /// already taken go back to the free list.
    fn allocate_pages(&self, n: usize) -> Result<Vec<PageMut<'_>>> {
        let mut meta = MetaGuard::lock(&self.pool)?;
        let mut pages = Vec::with_capacity(n);
        for _ in 0..n {
            match meta.allocate() {
                Ok(page) => pages.push(page),
                Err(err) => {
                    for mut page in pages {
                        meta.free_locked(&mut page)?;
                    }
                    return Err(err);
                }
            }
        }
        Ok(pages)
    }

    /// Inserts `downlinks` for children of `current` one level up, splitting
    /// internal pages and growing a new root as needed.
    fn propagate<'a>(
        &'a self,
        attno: AttrNum,
        mut path: DescentPath,
        mut current: BlockNumber,
        mut child_level: u16,
        mut downlinks: Vec<Downlink>,
        held: &mut Vec<PageMut<'a>>,
    ) -> Result<()> {
        loop {
            let Some(parent_block) = path.pop() else {
                let root = self.grow_root(attno, current, child_level, held)?;
                path.push(root);
                continue;
            };
            let mut parent = match held.iter().position(|p| p.block == parent_block) {
                Some(pos) => held.swap_remove(pos),
                None => self.pool.write(parent_block)?,
            };
            let (_, opaque) = page::read_node(parent_block, parent.data())?;
            if opaque.level != child_level + 1 || opaque.attno != attno {
                return Err(ColstoreError::PageCorruption {
                    block: parent_block,
                    detail: "split path no longer matches the tree",
                });
            }
            let mut items = page::internal_items(parent_block, parent.data())?;
            for d in &downlinks {
                let pos = items.partition_point(|x| x.key < d.key);
                if !opaque.covers(d.key) || items.get(pos).is_some_and(|x| x.key == d.key) {
                    return Err(ColstoreError::PageCorruption {
                        block: parent_block,
                        detail: "downlink key collides with parent range",
                    });
                }
                items.insert(pos, *d);
            }
            if items.len() <= INTERNAL_FANOUT {
                page::init_internal(parent.data_mut(), &opaque, &items)?;
                held.push(parent);
                trace!(block = parent_block.0, items = items.len(), "btree.downlink");
                return Ok(());
            }

            let parts = items.len().div_ceil(INTERNAL_FANOUT);
            let per = items.len().div_ceil(parts);
            let chunks: Vec<&[Downlink]> = items.chunks(per).collect();
            let mut pages = vec![parent];
            pages.extend(self.allocate_pages(chunks.len() - 1)?);
            let blocks: Vec<BlockNumber> = pages.iter().map(|p| p.block).collect();
            for (k, pg) in pages.iter_mut().enumerate() {
                let op = BtreeOpaque {
                    next: blocks.get(k + 1).copied().unwrap_or(opaque.next),
                    attno,
                    level: opaque.level,
                    lokey: if k == 0 { opaque.lokey } else { chunks[k][0].key },
                    hikey: chunks.get(k + 1).map_or(opaque.hikey, |c| c[0].key),
                    flags: if k == 0 { opaque.flags } else { 0 },
                };
                page::init_internal(pg.data_mut(), &op, chunks[k])?;
            }
            downlinks = (1..chunks.len())
                .map(|k| Downlink {
                    key: chunks[k][0].key,
                    child: blocks[k],
                })
                .collect();
            held.extend(pages);
            self.stats.inc_internal_splits();
            debug!(attno, block = parent_block.0, level = opaque.level, "btree.split.internal");
            current = parent_block;
            child_level = opaque.level;
        }
    }

    /// Puts a new internal root above `old_root`, which must be held.
    fn grow_root<'a>(
        &'a self,
        attno: AttrNum,
        old_root: BlockNumber,
        child_level: u16,
        held: &mut Vec<PageMut<'a>>,
    ) -> Result<BlockNumber> {
        let pos = held
            .iter()
            .position(|p| p.block == old_root)
            .ok_or(ColstoreError::Invalid("root split without the old root locked"))?;
        let mut meta = MetaGuard::lock(&self.pool)?;
        let mut root = meta.allocate()?;
        let op = BtreeOpaque {
            next: BlockNumber::INVALID,
            attno,
            level: child_level + 1,
            lokey: Tid::MIN,
            hikey: Tid::MAX_PLUS_ONE,
            flags: BTREE_FLAG_ROOT,
        };
        page::init_internal(
            root.data_mut(),
            &op,
            &[Downlink {
                key: Tid::MIN,
                child: old_root,
            }],
        )?;
        meta.set_root(attno, root.block)?;
        drop(meta);

        let old = &mut held[pos];
        let mut old_op = catalog::expect_trailer::<BtreeOpaque>(old.block, old.data())?;
        old_op.flags &= !BTREE_FLAG_ROOT;
        catalog::write_trailer(old.data_mut(), &old_op);

        let block = root.block;
        held.push(root);
        self.stats.inc_root_splits();
        debug!(attno, root = block.0, level = child_level + 1, "btree.split.root");
        Ok(block)
    }
}

fn validate_batch(items: &[AttItem]) -> Result<()> {
    if items.first().is_some_and(|i| i.tid < Tid::MIN)
        || items.last().is_some_and(|i| i.tid >= Tid::MAX_PLUS_ONE)
    {
        return Err(ColstoreError::Invalid("tid outside the assignable range"));
    }
    if items.windows(2).any(|w| w[0].tid >= w[1].tid) {
        return Err(ColstoreError::Invalid("insert tids must be strictly increasing"));
    }
    Ok(())
}
