use smallvec::SmallVec;

use super::tree::BTree;
use crate::types::{PageId, Result};

/// One step of the descent path: a node and the child slot taken.
struct PathEntry {
    page_id: PageId,
    child_idx: usize,
}

type Ancestors = SmallVec<[PathEntry; 8]>;

/// Ordered traversal of leaf entries from the range start upward.
///
/// Holds the ancestor path as a stack; exhausting a leaf pops ancestors
/// to the nearest unvisited right sibling and descends to its leftmost
/// leaf. Not restartable and not snapshot-isolated: structural mutation
/// of the tree mid-iteration leaves the results undefined.
pub struct AscendingLeafIter<'t> {
    tree: &'t BTree,
    end: i64,
    ancestors: Ancestors,
    leaf: Option<PageId>,
    pos: usize,
}

impl<'t> AscendingLeafIter<'t> {
    pub(crate) fn new(tree: &'t BTree, start: i64, end: i64) -> Result<Self> {
        let mut iter = Self {
            tree,
            end,
            ancestors: Ancestors::new(),
            leaf: None,
            pos: 0,
        };
        let root = tree.root_page();
        if tree.buffer().with_node(root, |n| n.num_keys() == 0)? {
            return Ok(iter);
        }
        let mut current = root;
        loop {
            let (is_leaf, idx) = tree
                .buffer()
                .with_node(current, |n| (n.is_leaf(), n.lower_bound_by_key(start)))?;
            if is_leaf {
                iter.leaf = Some(current);
                iter.pos = idx;
                break;
            }
            iter.ancestors.push(PathEntry {
                page_id: current,
                child_idx: idx,
            });
            current = tree.child_at(current, idx)?;
        }
        Ok(iter)
    }

    /// Next entry in ascending order, or `None` past the range end.
    pub fn next(&mut self) -> Result<Option<(i64, i64)>> {
        loop {
            let Some(leaf) = self.leaf else {
                return Ok(None);
            };
            let pos = self.pos;
            let entry = self.tree.buffer().with_node(leaf, |n| {
                (pos < n.num_keys()).then(|| (n.keys()[pos], n.values()[pos]))
            })?;
            match entry {
                Some((key, value)) => {
                    if key > self.end {
                        self.leaf = None;
                        return Ok(None);
                    }
                    self.pos += 1;
                    return Ok(Some((key, value)));
                }
                None => self.advance_leaf()?,
            }
        }
    }

    /// Pop ancestors to the nearest unvisited right sibling and descend
    /// to its leftmost leaf.
    fn advance_leaf(&mut self) -> Result<()> {
        while let Some(entry) = self.ancestors.pop() {
            let num_keys = self
                .tree
                .buffer()
                .with_node(entry.page_id, |n| n.num_keys())?;
            if entry.child_idx >= num_keys {
                continue;
            }
            let next_idx = entry.child_idx + 1;
            let mut current = self.tree.child_at(entry.page_id, next_idx)?;
            self.ancestors.push(PathEntry {
                page_id: entry.page_id,
                child_idx: next_idx,
            });
            loop {
                let is_leaf = self.tree.buffer().with_node(current, |n| n.is_leaf())?;
                if is_leaf {
                    self.leaf = Some(current);
                    self.pos = 0;
                    return Ok(());
                }
                self.ancestors.push(PathEntry {
                    page_id: current,
                    child_idx: 0,
                });
                current = self.tree.child_at(current, 0)?;
            }
        }
        self.leaf = None;
        Ok(())
    }
}

/// Mirror traversal from the range end downward.
pub struct DescendingLeafIter<'t> {
    tree: &'t BTree,
    start: i64,
    ancestors: Ancestors,
    leaf: Option<PageId>,
    /// One past the next position to yield; 0 means the leaf is spent.
    pos_hi: usize,
}

impl<'t> DescendingLeafIter<'t> {
    pub(crate) fn new(tree: &'t BTree, start: i64, end: i64) -> Result<Self> {
        let mut iter = Self {
            tree,
            start,
            ancestors: Ancestors::new(),
            leaf: None,
            pos_hi: 0,
        };
        let root = tree.root_page();
        if tree.buffer().with_node(root, |n| n.num_keys() == 0)? {
            return Ok(iter);
        }
        let mut current = root;
        loop {
            let (is_leaf, idx) = tree
                .buffer()
                .with_node(current, |n| (n.is_leaf(), n.upper_bound_by_key(end)))?;
            if is_leaf {
                iter.leaf = Some(current);
                iter.pos_hi = idx;
                break;
            }
            iter.ancestors.push(PathEntry {
                page_id: current,
                child_idx: idx,
            });
            current = tree.child_at(current, idx)?;
        }
        Ok(iter)
    }

    /// Next entry in descending order, or `None` below the range start.
    pub fn next(&mut self) -> Result<Option<(i64, i64)>> {
        loop {
            let Some(leaf) = self.leaf else {
                return Ok(None);
            };
            if self.pos_hi == 0 {
                self.retreat_leaf()?;
                continue;
            }
            let pos = self.pos_hi - 1;
            let (key, value) = self
                .tree
                .buffer()
                .with_node(leaf, |n| (n.keys()[pos], n.values()[pos]))?;
            if key < self.start {
                self.leaf = None;
                return Ok(None);
            }
            self.pos_hi -= 1;
            return Ok(Some((key, value)));
        }
    }

    /// Pop ancestors to the nearest unvisited left sibling and descend
    /// to its rightmost leaf.
    fn retreat_leaf(&mut self) -> Result<()> {
        while let Some(entry) = self.ancestors.pop() {
            if entry.child_idx == 0 {
                continue;
            }
            let prev_idx = entry.child_idx - 1;
            let mut current = self.tree.child_at(entry.page_id, prev_idx)?;
            self.ancestors.push(PathEntry {
                page_id: entry.page_id,
                child_idx: prev_idx,
            });
            loop {
                let (is_leaf, num_keys) = self
                    .tree
                    .buffer()
                    .with_node(current, |n| (n.is_leaf(), n.num_keys()))?;
                if is_leaf {
                    self.leaf = Some(current);
                    self.pos_hi = num_keys;
                    return Ok(());
                }
                self.ancestors.push(PathEntry {
                    page_id: current,
                    child_idx: num_keys,
                });
                current = self.tree.child_at(current, num_keys)?;
            }
        }
        self.leaf = None;
        Ok(())
    }
}
