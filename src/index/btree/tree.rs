use std::sync::Arc;

use smallvec::SmallVec;
use tracing::trace;

use super::buffer::BufferManager;
use super::iter::{AscendingLeafIter, DescendingLeafIter};
use super::node::{Keying, Node};
use super::prefix;
use super::stats::{BTreeStats, BTreeStatsSnapshot};
use crate::store::PageStore;
use crate::types::{PageId, Result, UmbraError};

/// Configuration knobs for a tree instance.
#[derive(Clone, Debug)]
pub struct TreeOptions {
    /// Leaf node capacity; derived from the page size when `None`.
    pub leaf_order: Option<usize>,
    /// Inner node capacity; derived from the page size when `None`.
    pub inner_order: Option<usize>,
    /// Whether the byte-budget bound participates in overflow and merge
    /// decisions and pages persist keys in packed form.
    pub compression: bool,
    /// Root page id of an existing tree to open.
    pub root_page: Option<PageId>,
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            leaf_order: None,
            inner_order: None,
            compression: true,
            root_page: None,
        }
    }
}

/// The balanced-tree engine shared by the unique and non-unique fronts.
///
/// Single-writer: callers serialize mutating calls against one instance.
/// Read-only consumers may fault pages in through the buffer manager.
pub struct BTree {
    buffer: BufferManager,
    root: PageId,
    min_key: Option<i64>,
    max_key: Option<i64>,
    entry_count: u64,
    modcount: u64,
    stats: Arc<BTreeStats>,
}

type ChildIds = SmallVec<[PageId; 8]>;

impl BTree {
    /// Open an existing tree from `opts.root_page`, or create a fresh one
    /// whose root is a single empty leaf.
    pub fn open(store: Arc<dyn PageStore>, keying: Keying, opts: TreeOptions) -> Result<Self> {
        let page_size = store.page_size();
        let leaf_order = opts
            .leaf_order
            .unwrap_or_else(|| derived_leaf_order(page_size));
        let inner_order = opts
            .inner_order
            .unwrap_or_else(|| derived_inner_order(page_size, keying));
        if leaf_order < 3 || inner_order < 3 {
            return Err(UmbraError::State("node order must be at least 3"));
        }
        let buffer = BufferManager::new(store, keying, leaf_order, inner_order, opts.compression);
        let mut tree = Self {
            buffer,
            root: crate::types::NO_PAGE,
            min_key: None,
            max_key: None,
            entry_count: 0,
            modcount: 0,
            stats: Arc::new(BTreeStats::default()),
        };
        match opts.root_page {
            Some(root) => {
                tree.root = root;
                let is_root = tree.buffer.with_node(root, |n| n.is_root())?;
                if !is_root {
                    tree.buffer.with_node_mut(root, |n| n.is_root = true)?;
                }
                tree.recompute_cached_state()?;
            }
            None => {
                let root = Node::new_leaf(leaf_order, true, keying, opts.compression);
                tree.root = tree.buffer.register(root)?;
            }
        }
        Ok(tree)
    }

    /// Buffer manager backing this tree.
    pub fn buffer(&self) -> &BufferManager {
        &self.buffer
    }

    /// Current root page id.
    pub fn root_page(&self) -> PageId {
        self.root
    }

    /// Number of live entries.
    pub fn size(&self) -> u64 {
        self.entry_count
    }

    /// Smallest key present, if any. Maintained incrementally on insert
    /// and recomputed by a one-shot scan when a boundary key is deleted.
    pub fn min_key(&self) -> Option<i64> {
        self.min_key
    }

    /// Largest key present, if any.
    pub fn max_key(&self) -> Option<i64> {
        self.max_key
    }

    /// Count of structural or content modifications applied so far.
    pub fn modcount(&self) -> u64 {
        self.modcount
    }

    /// Live statistics counters.
    pub fn stats(&self) -> Arc<BTreeStats> {
        Arc::clone(&self.stats)
    }

    /// Snapshot the statistics counters.
    pub fn stats_snapshot(&self) -> BTreeStatsSnapshot {
        self.stats.snapshot()
    }

    /// Emit the statistics counters to the tracing sink.
    pub fn emit_stats(&self) {
        self.stats.emit_tracing();
    }

    /// Number of pages this tree's buffer manager has written.
    pub fn written_pages(&self) -> u64 {
        self.buffer.written_pages()
    }

    /// Insert an entry. Rejects an existing key (unique keying) or an
    /// existing exact pair (non-unique keying).
    pub fn insert(&mut self, key: i64, value: i64) -> Result<()> {
        let root = self.root;
        self.insert_rec(root, key, value)?;
        self.modcount += 1;
        if self.node_overflows(root)? {
            self.handle_root_overflow()?;
        }
        self.min_key = Some(self.min_key.map_or(key, |m| m.min(key)));
        self.max_key = Some(self.max_key.map_or(key, |m| m.max(key)));
        self.entry_count += 1;
        Ok(())
    }

    /// Delete the entry matching `(key, value)` under the keying strategy
    /// (the value is ignored by unique trees) and return the stored
    /// value. Underfull ancestors rebalance on the way back up.
    pub fn delete(&mut self, key: i64, value: i64) -> Result<i64> {
        if self.buffer.with_node(self.root, |n| n.num_keys())? == 0 {
            return Err(UmbraError::NotFound);
        }
        self.modcount += 1;
        let old = self.delete_rec(self.root, key, value)?;
        self.entry_count -= 1;
        if self.entry_count == 0 {
            self.min_key = None;
            self.max_key = None;
        } else {
            if self.min_key == Some(key) {
                self.min_key = self.compute_min()?;
            }
            if self.max_key == Some(key) {
                self.max_key = self.compute_max()?;
            }
        }
        Ok(old)
    }

    /// Look up the entry matching `(key, value)` under the keying
    /// strategy and return its stored value.
    pub fn get(&self, key: i64, value: i64) -> Result<Option<i64>> {
        enum Step {
            Done(Option<i64>),
            Descend(usize),
        }
        let keying = self.buffer.keying();
        let mut current = self.root;
        loop {
            let step = self.buffer.with_node(current, |n| {
                let pos = n.find_pos(keying, key, value);
                if !n.is_leaf() {
                    Step::Descend(pos)
                } else if n.contains_entry(keying, key, value) {
                    Step::Done(Some(n.values()[pos - 1]))
                } else {
                    Step::Done(None)
                }
            })?;
            match step {
                Step::Done(found) => return Ok(found),
                Step::Descend(child_idx) => current = self.child_at(current, child_idx)?,
            }
        }
    }

    /// Whether the exact entry exists under the keying strategy.
    pub fn contains(&self, key: i64, value: i64) -> Result<bool> {
        Ok(self.get(key, value)?.is_some())
    }

    /// Flush every dirty node reachable from the root, children first,
    /// and return the root page id to hand to the next session.
    pub fn flush(&mut self) -> Result<PageId> {
        self.buffer.write(self.root)
    }

    /// Drop every buffered node and reset to a single empty leaf root.
    pub fn clear(&mut self) -> Result<()> {
        self.buffer.clear();
        let root = Node::new_leaf(
            self.buffer.leaf_order(),
            true,
            self.buffer.keying(),
            self.buffer.compression(),
        );
        self.root = self.buffer.register(root)?;
        self.min_key = None;
        self.max_key = None;
        self.entry_count = 0;
        self.modcount += 1;
        Ok(())
    }

    /// Ascending iteration over the full key range.
    pub fn iter_ascending(&self) -> Result<AscendingLeafIter<'_>> {
        AscendingLeafIter::new(self, i64::MIN, i64::MAX)
    }

    /// Ascending iteration over `[start, end]` (both inclusive).
    pub fn range_ascending(&self, start: i64, end: i64) -> Result<AscendingLeafIter<'_>> {
        AscendingLeafIter::new(self, start, end)
    }

    /// Descending iteration over the full key range.
    pub fn iter_descending(&self) -> Result<DescendingLeafIter<'_>> {
        DescendingLeafIter::new(self, i64::MIN, i64::MAX)
    }

    /// Descending iteration over `[start, end]` (both inclusive).
    pub fn range_descending(&self, start: i64, end: i64) -> Result<DescendingLeafIter<'_>> {
        DescendingLeafIter::new(self, start, end)
    }

    /// Number of leaf nodes reachable from the root. Walks the tree.
    pub fn leaf_count(&self) -> Result<usize> {
        self.count_nodes(true)
    }

    /// Number of inner nodes reachable from the root. Walks the tree.
    pub fn inner_count(&self) -> Result<usize> {
        self.count_nodes(false)
    }

    fn count_nodes(&self, leaves: bool) -> Result<usize> {
        let mut stack: Vec<PageId> = vec![self.root];
        let mut count = 0usize;
        while let Some(id) = stack.pop() {
            let (is_leaf, children) = self.node_children(id)?;
            if is_leaf == leaves {
                count += 1;
            }
            stack.extend(children);
        }
        Ok(count)
    }

    fn node_children(&self, id: PageId) -> Result<(bool, ChildIds)> {
        self.buffer.with_node(id, |n| {
            (n.is_leaf(), n.child_ids().iter().copied().collect::<ChildIds>())
        })
    }

    /// Verify the structural invariants of the whole tree: sortedness
    /// under the keying strategy, key-count bounds, separator fencing,
    /// uniform leaf depth, parent child-size bookkeeping.
    pub fn check_structure(&self) -> Result<()> {
        let keying = self.buffer.keying();
        self.check_node(self.root, None, None, true, keying)
            .map(|_| ())
    }

    fn check_node(
        &self,
        id: PageId,
        lower: Option<(i64, i64)>,
        upper: Option<(i64, i64)>,
        expect_root: bool,
        keying: Keying,
    ) -> Result<usize> {
        let (is_leaf, is_root, num_keys, order, entries, children, child_sizes) =
            self.buffer.with_node(id, |n| {
                (
                    n.is_leaf(),
                    n.is_root(),
                    n.num_keys(),
                    n.order,
                    n.keys()
                        .iter()
                        .zip(n.values())
                        .map(|(&k, &v)| (k, v))
                        .collect::<Vec<_>>(),
                    n.child_ids().iter().copied().collect::<ChildIds>(),
                    n.child_sizes.clone(),
                )
            })?;
        if is_root != expect_root {
            return Err(UmbraError::State("root flag out of place"));
        }
        // Minimum occupancy is not asserted: rebalancing falls through
        // when no sibling merge fits and no sibling has spare keys, so
        // an underfull node can legitimately persist.
        if num_keys > order - 1 {
            return Err(UmbraError::State("node above maximum occupancy"));
        }
        for pair in entries.windows(2) {
            if keying.cmp_entries(pair[0], pair[1]) != std::cmp::Ordering::Less {
                return Err(UmbraError::State("entries out of order"));
            }
        }
        if let (Some(low), Some(first)) = (lower, entries.first()) {
            if keying.cmp_entries(*first, low) == std::cmp::Ordering::Less {
                return Err(UmbraError::State("entry below its lower fence"));
            }
        }
        if let (Some(high), Some(last)) = (upper, entries.last()) {
            if keying.cmp_entries(*last, high) != std::cmp::Ordering::Less {
                return Err(UmbraError::State("entry at or above its upper fence"));
            }
        }
        if is_leaf {
            return Ok(1);
        }
        if children.len() != num_keys + 1 {
            return Err(UmbraError::State("inner child count is not key count plus one"));
        }
        let mut height = None;
        for (i, &child) in children.iter().enumerate() {
            let child_lower = if i == 0 { lower } else { Some(entries[i - 1]) };
            let child_upper = if i == num_keys { upper } else { Some(entries[i]) };
            let child_height = self.check_node(child, child_lower, child_upper, false, keying)?;
            if *height.get_or_insert(child_height) != child_height {
                return Err(UmbraError::State("leaves at differing depths"));
            }
            // Zero means "not yet tracked": sizes are rebuilt lazily
            // after a node is faulted in from disk.
            let actual = self.buffer.with_node(child, |n| n.byte_size())?;
            if child_sizes[i] != 0 && child_sizes[i] != actual {
                return Err(UmbraError::State("stale child size bookkeeping"));
            }
        }
        Ok(height.unwrap_or(1) + 1)
    }

    /// Adopt an already-registered node graph as this tree's content.
    /// Test fixture support for building exact tree shapes.
    #[cfg(test)]
    pub(crate) fn install_root(&mut self, root: PageId) -> Result<()> {
        self.root = root;
        self.recompute_cached_state()
    }

    fn recompute_cached_state(&mut self) -> Result<()> {
        self.min_key = self.compute_min()?;
        self.max_key = self.compute_max()?;
        let mut count = 0u64;
        let mut iter = self.iter_ascending()?;
        while iter.next()?.is_some() {
            count += 1;
        }
        self.entry_count = count;
        Ok(())
    }

    fn compute_min(&self) -> Result<Option<i64>> {
        Ok(self.iter_ascending()?.next()?.map(|(k, _)| k))
    }

    fn compute_max(&self) -> Result<Option<i64>> {
        Ok(self.iter_descending()?.next()?.map(|(k, _)| k))
    }

    fn insert_rec(&mut self, node_id: PageId, key: i64, value: i64) -> Result<()> {
        let keying = self.buffer.keying();
        let compression = self.buffer.compression();
        let is_leaf = self.buffer.with_node(node_id, |n| n.is_leaf())?;
        if is_leaf {
            return self.buffer.with_node_mut(node_id, |n| {
                n.leaf_put(keying, key, value)?;
                n.recompute_size(keying, compression);
                Ok(())
            })?;
        }
        let child_idx = self
            .buffer
            .with_node(node_id, |n| n.find_pos(keying, key, value))?;
        let child_id = self.child_at(node_id, child_idx)?;
        self.insert_rec(child_id, key, value)?;
        if self.node_overflows(child_id)? {
            self.handle_overflow(child_id, node_id)?;
        }
        let child_size = self.buffer.with_node(child_id, |n| n.byte_size())?;
        self.buffer
            .with_node_mut(node_id, |n| n.set_child_size(child_idx, child_size))?;
        Ok(())
    }

    fn node_overflows(&self, id: PageId) -> Result<bool> {
        let page_size = self.buffer.page_size();
        let compression = self.buffer.compression();
        self.buffer
            .with_node(id, |n| n.overflows(page_size, compression))
    }

    /// Resolve an overflowing root: split it and promote one separator
    /// into a freshly allocated root, growing the tree by one level.
    fn handle_root_overflow(&mut self) -> Result<()> {
        let keying = self.buffer.keying();
        let compression = self.buffer.compression();
        let old_root = self.root;
        let new_root = Node::new_inner(self.buffer.inner_order(), true, keying, compression);
        let new_root_id = self.buffer.register(new_root)?;
        self.buffer.with_node_mut(old_root, |n| n.is_root = false)?;
        let (sep_key, sep_value, right_id) = self.split_node(old_root)?;
        let left_size = self.buffer.with_node(old_root, |n| n.byte_size())?;
        let right_size = self.buffer.with_node(right_id, |n| n.byte_size())?;
        self.buffer.with_node_mut(new_root_id, |n| {
            n.root_put(sep_key, sep_value, old_root, right_id)?;
            n.set_child_size(0, left_size);
            n.set_child_size(1, right_size);
            n.recompute_size(keying, compression);
            Ok::<(), UmbraError>(())
        })??;
        self.buffer.set_parent(old_root, Some(new_root_id))?;
        self.buffer.set_parent(right_id, Some(new_root_id))?;
        self.root = new_root_id;
        self.stats.inc_root_swap();
        trace!(
            target: "umbra_index::tree",
            new_root = %new_root_id,
            separator = sep_key,
            "root split"
        );
        Ok(())
    }

    /// Resolve an overflowing non-root child: split it and insert the
    /// separator and new right sibling into the parent.
    fn handle_overflow(&mut self, child_id: PageId, parent_id: PageId) -> Result<()> {
        let keying = self.buffer.keying();
        let compression = self.buffer.compression();
        let (sep_key, sep_value, right_id) = self.split_node(child_id)?;
        let right_size = self.buffer.with_node(right_id, |n| n.byte_size())?;
        self.buffer.with_node_mut(parent_id, |n| {
            n.inner_put(keying, sep_key, sep_value, right_id, right_size)?;
            n.recompute_size(keying, compression);
            Ok::<(), UmbraError>(())
        })??;
        self.buffer.set_parent(right_id, Some(parent_id))?;
        Ok(())
    }

    /// Split a node at the codec's size-balanced cut point. The left
    /// partition keeps the lower entries; a new right sibling takes the
    /// rest. Leaf splits duplicate the right partition's smallest entry
    /// as the separator; inner splits promote the cut entry instead.
    fn split_node(&mut self, node_id: PageId) -> Result<(i64, i64, PageId)> {
        let keying = self.buffer.keying();
        let compression = self.buffer.compression();
        let (is_leaf, order, num_keys) = self
            .buffer
            .with_node(node_id, |n| (n.is_leaf(), n.order, n.num_keys()))?;
        if num_keys < 2 {
            return Err(UmbraError::State("split of a node with fewer than two keys"));
        }
        let keys_in_left = self
            .buffer
            .with_node(node_id, |n| prefix::split_index(n.keys()))?;
        let right = if is_leaf {
            Node::new_leaf(order, false, keying, compression)
        } else {
            Node::new_inner(order, false, keying, compression)
        };
        let right_id = self.buffer.register(right)?;
        let (sep_key, sep_value, moved_children) =
            self.buffer.with_two(node_id, right_id, |left, right| {
                if is_leaf {
                    let move_count = left.num_keys - keys_in_left;
                    right.copy_from(left, keys_in_left, keys_in_left, 0, 0, move_count, 0);
                    right.num_keys = move_count;
                    left.num_keys = keys_in_left;
                    left.recompute_size(keying, compression);
                    right.recompute_size(keying, compression);
                    (right.keys[0], right.values[0], ChildIds::new())
                } else {
                    let sep_key = left.keys[keys_in_left];
                    let sep_value = left.values[keys_in_left];
                    let move_count = left.num_keys - keys_in_left - 1;
                    right.copy_from(
                        left,
                        keys_in_left + 1,
                        keys_in_left + 1,
                        0,
                        0,
                        move_count,
                        move_count + 1,
                    );
                    right.num_keys = move_count;
                    left.num_keys = keys_in_left;
                    left.recompute_size(keying, compression);
                    right.recompute_size(keying, compression);
                    let moved = right.child_ids().iter().copied().collect::<ChildIds>();
                    (sep_key, sep_value, moved)
                }
            })?;
        self.buffer.reparent(&moved_children, right_id);
        self.stats.inc_split(is_leaf);
        trace!(
            target: "umbra_index::tree",
            node = %node_id,
            right = %right_id,
            keys_in_left,
            "node split"
        );
        Ok((sep_key, sep_value, right_id))
    }

    fn delete_rec(&mut self, node_id: PageId, key: i64, value: i64) -> Result<i64> {
        let keying = self.buffer.keying();
        let compression = self.buffer.compression();
        let is_leaf = self.buffer.with_node(node_id, |n| n.is_leaf())?;
        if is_leaf {
            return self.buffer.with_node_mut(node_id, |n| {
                let old = n.leaf_delete(keying, key, value)?;
                n.recompute_size(keying, compression);
                Ok(old)
            })?;
        }
        let child_idx = self
            .buffer
            .with_node(node_id, |n| n.find_pos(keying, key, value))?;
        let child_id = self.child_at(node_id, child_idx)?;
        let old = self.delete_rec(child_id, key, value)?;
        let child_size = self.buffer.with_node(child_id, |n| n.byte_size())?;
        self.buffer
            .with_node_mut(node_id, |n| n.set_child_size(child_idx, child_size))?;
        let page_size = self.buffer.page_size();
        let (underfull, overflowing) = self
            .buffer
            .with_node(child_id, |n| (n.is_underfull(), n.overflows(page_size, compression)))?;
        if underfull {
            self.rebalance(node_id, child_id, child_idx)?;
        } else if overflowing {
            self.handle_overflow(child_id, node_id)?;
        }
        Ok(old)
    }

    /// Resolve an underfull child: merge with a sibling when the
    /// combined entries fit one node, otherwise borrow a size-balanced
    /// run from a sibling holding keys above the minimum.
    fn rebalance(&mut self, parent_id: PageId, child_id: PageId, child_idx: usize) -> Result<()> {
        let keying = self.buffer.keying();
        let compression = self.buffer.compression();
        let page_size = self.buffer.page_size();
        let parent_keys = self.buffer.with_node(parent_id, |n| n.num_keys())?;
        let left_sib = if child_idx > 0 {
            Some(self.child_at(parent_id, child_idx - 1)?)
        } else {
            None
        };
        let right_sib = if child_idx < parent_keys {
            Some(self.child_at(parent_id, child_idx + 1)?)
        } else {
            None
        };

        if let Some(left) = left_sib {
            let fits = self.buffer.with_pair(child_id, left, |c, l| {
                c.fits_into_one_node_with(l, keying, page_size, compression)
            })?;
            if fits {
                return self.merge_with_left(child_id, left, parent_id, child_idx - 1);
            }
        }
        if let Some(right) = right_sib {
            let fits = self.buffer.with_pair(child_id, right, |c, r| {
                c.fits_into_one_node_with(r, keying, page_size, compression)
            })?;
            if fits {
                return self.merge_with_right(child_id, right, parent_id, child_idx);
            }
        }
        if let Some(left) = left_sib {
            if self.buffer.with_node(left, |n| n.has_extra_keys())? {
                return self.redistribute_from_left(child_id, left, parent_id, child_idx - 1);
            }
        }
        if let Some(right) = right_sib {
            if self.buffer.with_node(right, |n| n.has_extra_keys())? {
                return self.redistribute_from_right(child_id, right, parent_id, child_idx);
            }
        }
        Ok(())
    }

    /// Merge the left sibling's entries into `current` and drop the left
    /// sibling and its separator from the parent.
    fn merge_with_left(
        &mut self,
        current: PageId,
        left: PageId,
        parent: PageId,
        key_index: usize,
    ) -> Result<()> {
        let keying = self.buffer.keying();
        let compression = self.buffer.compression();
        let collapsing = self
            .buffer
            .with_node(parent, |n| n.is_root() && n.num_keys() == 1)?;
        if collapsing {
            return self.root_merge_with_left(current, left, parent);
        }
        let is_leaf = self.buffer.with_node(current, |n| n.is_leaf())?;
        let left_keys = self.buffer.with_node(left, |n| n.num_keys())?;
        if is_leaf {
            self.buffer.with_two(left, current, |l, c| {
                c.shift_right(l.num_keys);
                c.copy_from(l, 0, 0, 0, 0, l.num_keys, 0);
                c.num_keys += l.num_keys;
                c.recompute_size(keying, compression);
            })?;
        } else {
            self.buffer.with_two(parent, current, |p, c| {
                c.shift_right(left_keys + 1);
                c.migrate_entry(left_keys, p, key_index);
            })?;
            let moved_children = self
                .buffer
                .with_node(left, |n| n.child_ids().iter().copied().collect::<ChildIds>())?;
            self.buffer.with_two(left, current, |l, c| {
                c.copy_from(l, 0, 0, 0, 0, l.num_keys, l.num_keys + 1);
                c.num_keys += l.num_keys + 1;
                c.recompute_size(keying, compression);
            })?;
            self.buffer.reparent(&moved_children, current);
        }
        self.finish_merge(parent, left, current, key_index, is_leaf, keying, compression)
    }

    /// Merge `current`'s entries into the right sibling and drop
    /// `current` and its separator from the parent.
    fn merge_with_right(
        &mut self,
        current: PageId,
        right: PageId,
        parent: PageId,
        key_index: usize,
    ) -> Result<()> {
        let keying = self.buffer.keying();
        let compression = self.buffer.compression();
        let collapsing = self
            .buffer
            .with_node(parent, |n| n.is_root() && n.num_keys() == 1)?;
        if collapsing {
            return self.root_merge_with_right(current, right, parent);
        }
        let is_leaf = self.buffer.with_node(current, |n| n.is_leaf())?;
        if is_leaf {
            self.buffer.with_two(current, right, |c, r| {
                r.shift_right(c.num_keys);
                r.copy_from(c, 0, 0, 0, 0, c.num_keys, 0);
                r.num_keys += c.num_keys;
                r.recompute_size(keying, compression);
            })?;
        } else {
            self.buffer.with_two(parent, right, |p, r| {
                r.shift_right(1);
                r.migrate_entry(0, p, key_index);
                r.num_keys += 1;
            })?;
            let moved_children = self
                .buffer
                .with_node(current, |n| n.child_ids().iter().copied().collect::<ChildIds>())?;
            self.buffer.with_two(current, right, |c, r| {
                r.shift_right(c.num_keys);
                r.copy_from(c, 0, 0, 0, 0, c.num_keys, c.num_keys + 1);
                r.num_keys += c.num_keys;
                r.recompute_size(keying, compression);
            })?;
            self.buffer.reparent(&moved_children, right);
        }
        self.finish_merge(parent, current, right, key_index, is_leaf, keying, compression)
    }

    /// Shared tail of both merge directions: drop the separator and the
    /// absorbed child from the parent, evict the absorbed node, refresh
    /// the surviving child's size bookkeeping.
    #[allow(clippy::too_many_arguments)]
    fn finish_merge(
        &mut self,
        parent: PageId,
        absorbed: PageId,
        survivor: PageId,
        key_index: usize,
        is_leaf: bool,
        keying: Keying,
        compression: bool,
    ) -> Result<()> {
        self.buffer.with_node_mut(parent, |p| {
            p.shift_left_from(key_index, 1);
            p.num_keys -= 1;
            p.recompute_size(keying, compression);
        })?;
        self.buffer.remove(absorbed);
        let survivor_size = self.buffer.with_node(survivor, |n| n.byte_size())?;
        self.buffer
            .with_node_mut(parent, |p| p.set_child_size(key_index, survivor_size))?;
        self.stats.inc_merge(is_leaf);
        trace!(
            target: "umbra_index::tree",
            absorbed = %absorbed,
            survivor = %survivor,
            "sibling merge"
        );
        Ok(())
    }

    /// The root holds a single separator and its two children now fit in
    /// one node: absorb everything into the right child and make it the
    /// new root, shrinking the tree by one level.
    fn root_merge_with_right(&mut self, current: PageId, right: PageId, parent: PageId) -> Result<()> {
        let keying = self.buffer.keying();
        let compression = self.buffer.compression();
        let is_leaf = self.buffer.with_node(current, |n| n.is_leaf())?;
        if !is_leaf {
            self.buffer.with_two(parent, right, |p, r| {
                r.shift_right(p.num_keys);
                r.migrate_entry(0, p, 0);
                r.num_keys += 1;
            })?;
        }
        let moved_children = self
            .buffer
            .with_node(current, |n| n.child_ids().iter().copied().collect::<ChildIds>())?;
        self.buffer.with_two(current, right, |c, r| {
            r.shift_right(c.num_keys);
            let child_count = if c.is_leaf { 0 } else { c.num_keys + 1 };
            r.copy_from(c, 0, 0, 0, 0, c.num_keys, child_count);
            r.num_keys += c.num_keys;
            r.recompute_size(keying, compression);
        })?;
        self.buffer.reparent(&moved_children, right);
        self.promote_to_root(right)?;
        self.buffer.remove(parent);
        self.buffer.remove(current);
        self.stats.inc_merge(is_leaf);
        Ok(())
    }

    /// Mirror of [`Self::root_merge_with_right`]: the current child
    /// absorbs the left sibling and the root separator and becomes the
    /// new root.
    fn root_merge_with_left(&mut self, current: PageId, left: PageId, parent: PageId) -> Result<()> {
        let keying = self.buffer.keying();
        let compression = self.buffer.compression();
        let is_leaf = self.buffer.with_node(current, |n| n.is_leaf())?;
        if !is_leaf {
            self.buffer.with_two(parent, current, |p, c| {
                c.shift_right(p.num_keys);
                c.migrate_entry(0, p, 0);
                c.num_keys += p.num_keys;
            })?;
        }
        let moved_children = self
            .buffer
            .with_node(left, |n| n.child_ids().iter().copied().collect::<ChildIds>())?;
        self.buffer.with_two(left, current, |l, c| {
            c.shift_right(l.num_keys);
            let child_count = if l.is_leaf { 0 } else { l.num_keys + 1 };
            c.copy_from(l, 0, 0, 0, 0, l.num_keys, child_count);
            c.num_keys += l.num_keys;
            c.recompute_size(keying, compression);
        })?;
        self.buffer.reparent(&moved_children, current);
        self.promote_to_root(current)?;
        self.buffer.remove(parent);
        self.buffer.remove(left);
        self.stats.inc_merge(is_leaf);
        Ok(())
    }

    fn promote_to_root(&mut self, id: PageId) -> Result<()> {
        self.buffer.with_node_mut(id, |n| n.is_root = true)?;
        self.buffer.set_parent(id, None)?;
        self.root = id;
        self.stats.inc_root_swap();
        trace!(target: "umbra_index::tree", new_root = %id, "root collapse");
        Ok(())
    }

    /// Borrow a size-balanced suffix run from the left sibling. The
    /// parent separator rotates down into `current` (inner nodes) or is
    /// refreshed to `current`'s new smallest entry (leaves).
    fn redistribute_from_left(
        &mut self,
        current: PageId,
        left: PageId,
        parent: PageId,
        parent_key_index: usize,
    ) -> Result<()> {
        let keying = self.buffer.keying();
        let compression = self.buffer.compression();
        let mut keys_to_move = self.buffer.with_pair(left, current, |l, c| {
            prefix::keys_to_move_from_left(l.keys(), c.keys())
        })?;
        let (is_leaf, current_keys) = self
            .buffer
            .with_node(current, |n| (n.is_leaf(), n.num_keys()))?;
        if is_leaf {
            if keys_to_move == 0 {
                return Ok(());
            }
            self.buffer.with_two(left, current, |l, c| {
                let start = l.num_keys - keys_to_move;
                c.shift_right(keys_to_move);
                c.copy_from(l, start, start, 0, 0, keys_to_move, 0);
                l.num_keys -= keys_to_move;
                l.recompute_size(keying, compression);
                c.num_keys += keys_to_move;
                c.recompute_size(keying, compression);
            })?;
            self.buffer.with_two(current, parent, |c, p| {
                p.migrate_entry(parent_key_index, c, 0);
                p.recompute_size(keying, compression);
            })?;
        } else {
            keys_to_move = keys_to_move.saturating_sub(if current_keys == 0 { 3 } else { 2 });
            if keys_to_move == 0 {
                return Ok(());
            }
            self.buffer.with_two(parent, current, |p, c| {
                c.shift_right(1);
                c.num_keys += 1;
                c.migrate_entry(0, p, parent_key_index);
                c.shift_right(keys_to_move);
            })?;
            let moved_children = self.buffer.with_node(left, |l| {
                let start = l.num_keys - keys_to_move;
                l.child_ids()[start..].iter().copied().collect::<ChildIds>()
            })?;
            self.buffer.with_two(left, current, |l, c| {
                let start = l.num_keys - keys_to_move;
                c.copy_from(l, start, start, 0, 0, keys_to_move, keys_to_move + 1);
                c.num_keys += keys_to_move;
                c.recompute_size(keying, compression);
                l.num_keys -= keys_to_move;
            })?;
            self.buffer.with_two(left, parent, |l, p| {
                p.migrate_entry(parent_key_index, l, l.num_keys - 1);
                p.recompute_size(keying, compression);
                l.num_keys -= 1;
                l.recompute_size(keying, compression);
            })?;
            self.buffer.reparent(&moved_children, current);
        }
        self.refresh_sibling_sizes(parent, left, current, parent_key_index)?;
        self.stats.inc_redistribution();
        trace!(
            target: "umbra_index::tree",
            donor = %left,
            receiver = %current,
            keys_to_move,
            "redistribute from left"
        );
        Ok(())
    }

    /// Borrow a size-balanced prefix run from the right sibling; the
    /// mirror of [`Self::redistribute_from_left`].
    fn redistribute_from_right(
        &mut self,
        current: PageId,
        right: PageId,
        parent: PageId,
        parent_key_index: usize,
    ) -> Result<()> {
        let keying = self.buffer.keying();
        let compression = self.buffer.compression();
        let mut keys_to_move = self.buffer.with_pair(current, right, |c, r| {
            prefix::keys_to_move_from_right(c.keys(), r.keys())
        })?;
        let is_leaf = self.buffer.with_node(current, |n| n.is_leaf())?;
        if keys_to_move == 0 {
            return Ok(());
        }
        if is_leaf {
            self.buffer.with_two(right, current, |r, c| {
                let dst = c.num_keys;
                c.copy_from(r, 0, 0, dst, dst, keys_to_move, 0);
                r.shift_left(keys_to_move);
                r.num_keys -= keys_to_move;
                r.recompute_size(keying, compression);
                c.num_keys += keys_to_move;
                c.recompute_size(keying, compression);
            })?;
            self.buffer.with_two(right, parent, |r, p| {
                p.migrate_entry(parent_key_index, r, 0);
                p.recompute_size(keying, compression);
            })?;
        } else {
            keys_to_move -= 1;
            if keys_to_move > 0 {
                self.buffer.with_two(parent, current, |p, c| {
                    c.migrate_entry(c.num_keys, p, parent_key_index);
                    c.num_keys += 1;
                })?;
                let moved_children = self.buffer.with_node(right, |r| {
                    r.child_ids()[..=keys_to_move]
                        .iter()
                        .copied()
                        .collect::<ChildIds>()
                })?;
                self.buffer.with_two(right, current, |r, c| {
                    let dst = c.num_keys;
                    c.copy_from(r, 0, 0, dst, dst, keys_to_move, keys_to_move + 1);
                    c.num_keys += keys_to_move;
                    c.recompute_size(keying, compression);
                    r.shift_left(keys_to_move);
                    r.num_keys -= keys_to_move;
                })?;
                self.buffer.with_two(right, parent, |r, p| {
                    p.migrate_entry(parent_key_index, r, 0);
                    p.recompute_size(keying, compression);
                    r.shift_left(1);
                    r.num_keys -= 1;
                    r.recompute_size(keying, compression);
                })?;
                self.buffer.reparent(&moved_children, current);
                self.stats.inc_redistribution();
            }
        }
        self.refresh_sibling_sizes(parent, current, right, parent_key_index)?;
        if is_leaf {
            self.stats.inc_redistribution();
        }
        trace!(
            target: "umbra_index::tree",
            donor = %right,
            receiver = %current,
            keys_to_move,
            "redistribute from right"
        );
        Ok(())
    }

    fn refresh_sibling_sizes(
        &mut self,
        parent: PageId,
        lower: PageId,
        upper: PageId,
        parent_key_index: usize,
    ) -> Result<()> {
        let lower_size = self.buffer.with_node(lower, |n| n.byte_size())?;
        let upper_size = self.buffer.with_node(upper, |n| n.byte_size())?;
        self.buffer.with_node_mut(parent, |p| {
            p.set_child_size(parent_key_index, lower_size);
            p.set_child_size(parent_key_index + 1, upper_size);
        })?;
        Ok(())
    }

    /// Child page id at `idx`, faulted in with its parent link set. All
    /// descent goes through here so that dirty propagation always has a
    /// live parent chain to walk.
    pub(crate) fn child_at(&self, parent_id: PageId, idx: usize) -> Result<PageId> {
        let child = self
            .buffer
            .with_node(parent_id, |n| n.child_ids().get(idx).copied())?
            .ok_or(UmbraError::State("child index out of range"))?;
        if !child.is_valid() {
            return Err(UmbraError::State("descent into the null page"));
        }
        self.buffer.set_parent(child, Some(parent_id))?;
        Ok(child)
    }
}

/// Leaf capacity derived from the page budget: worst-case entries are an
/// 8-byte key plus an 8-byte value with a small header allowance.
fn derived_leaf_order(page_size: usize) -> usize {
    ((page_size.saturating_sub(16)) / 16).max(4)
}

/// Inner capacity derived from the page budget: an 8-byte key plus a
/// 4-byte child id, plus the 8-byte companion value on non-unique trees.
fn derived_inner_order(page_size: usize, keying: Keying) -> usize {
    let per_entry = match keying {
        Keying::Unique => 12,
        Keying::NonUnique => 20,
    };
    ((page_size.saturating_sub(16)) / per_entry).max(4)
}

/// Unique index front: one entry per key.
pub struct UniqueBTree {
    tree: BTree,
}

impl UniqueBTree {
    /// Create a fresh tree on `store` with default options.
    pub fn create(store: &Arc<dyn PageStore>) -> Result<Self> {
        Self::with_options(store, TreeOptions::default())
    }

    /// Create or open a tree on `store` with explicit options.
    pub fn with_options(store: &Arc<dyn PageStore>, opts: TreeOptions) -> Result<Self> {
        Ok(Self {
            tree: BTree::open(Arc::clone(store), Keying::Unique, opts)?,
        })
    }

    /// Insert `key -> value`; rejects an already-present key.
    pub fn insert(&mut self, key: i64, value: i64) -> Result<()> {
        self.tree.insert(key, value)
    }

    /// Value stored under `key`, if any.
    pub fn search(&self, key: i64) -> Result<Option<i64>> {
        self.tree.get(key, 0)
    }

    /// Remove `key` and return its stored value.
    pub fn delete(&mut self, key: i64) -> Result<i64> {
        self.tree.delete(key, 0)
    }

    /// Access the underlying engine.
    pub fn tree(&self) -> &BTree {
        &self.tree
    }

    /// Mutable access to the underlying engine.
    pub fn tree_mut(&mut self) -> &mut BTree {
        &mut self.tree
    }
}

/// Non-unique index front: many values per key, exact pairs unique.
pub struct NonUniqueBTree {
    tree: BTree,
}

impl NonUniqueBTree {
    /// Create a fresh tree on `store` with default options.
    pub fn create(store: &Arc<dyn PageStore>) -> Result<Self> {
        Self::with_options(store, TreeOptions::default())
    }

    /// Create or open a tree on `store` with explicit options.
    pub fn with_options(store: &Arc<dyn PageStore>, opts: TreeOptions) -> Result<Self> {
        Ok(Self {
            tree: BTree::open(Arc::clone(store), Keying::NonUnique, opts)?,
        })
    }

    /// Insert the pair; rejects an already-present exact pair.
    pub fn insert(&mut self, key: i64, value: i64) -> Result<()> {
        self.tree.insert(key, value)
    }

    /// Whether the exact pair is present.
    pub fn contains(&self, key: i64, value: i64) -> Result<bool> {
        self.tree.contains(key, value)
    }

    /// Remove the exact pair and return its stored value.
    pub fn delete(&mut self, key: i64, value: i64) -> Result<i64> {
        self.tree.delete(key, value)
    }

    /// Access the underlying engine.
    pub fn tree(&self) -> &BTree {
        &self.tree
    }

    /// Mutable access to the underlying engine.
    pub fn tree_mut(&mut self) -> &mut BTree {
        &mut self.tree
    }
}
