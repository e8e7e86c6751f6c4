//! Object position index.
//!
//! Tracks where objects live in the data file. The key packs a page
//! number and an intra-page byte offset into one integer; the value is
//! the page continuing a multi-page object, or [`NO_CONTINUATION`] when
//! the object ends there. An object spanning several pages gets one
//! entry per page, with every entry after the first keyed at offset
//! [`MARK_SECONDARY`].

use std::sync::Arc;

use super::btree::{AscendingLeafIter, TreeOptions, UniqueBTree};
use crate::store::PageStore;
use crate::types::{PageId, Result};

/// Offset sentinel marking a secondary page of a multi-page object.
pub const MARK_SECONDARY: u32 = 0xFFFF_FFFF;

/// Value meaning "no continuation page: the object ends here".
pub const NO_CONTINUATION: u32 = 0;

/// Pack a page number and intra-page offset into a position key.
pub fn position_key(page: u32, offset: u32) -> i64 {
    ((i64::from(page)) << 32) | i64::from(offset)
}

/// Page-number half of a position key.
pub fn page_of(pos: i64) -> u32 {
    ((pos as u64) >> 32) as u32
}

/// Offset half of a position key.
pub fn offset_of(pos: i64) -> u32 {
    pos as u32
}

/// Unique index mapping object positions to continuation pages.
pub struct PositionIndex {
    idx: UniqueBTree,
}

impl PositionIndex {
    /// Create a fresh index on `store`.
    pub fn create(store: &Arc<dyn PageStore>) -> Result<Self> {
        Ok(Self {
            idx: UniqueBTree::create(store)?,
        })
    }

    /// Open an existing index from its flushed root page.
    pub fn open(store: &Arc<dyn PageStore>, root: PageId) -> Result<Self> {
        let opts = TreeOptions {
            root_page: Some(root),
            ..TreeOptions::default()
        };
        Ok(Self {
            idx: UniqueBTree::with_options(store, opts)?,
        })
    }

    /// Record that an object (or one page of it) starts at
    /// `(page, offset)` and continues on `next_page`.
    pub fn add_position(&mut self, page: u32, offset: u32, next_page: u32) -> Result<()> {
        self.idx
            .insert(position_key(page, offset), i64::from(next_page))
    }

    /// Remove a position entry and return its continuation page value.
    pub fn remove_position(&mut self, pos: i64) -> Result<i64> {
        self.idx.delete(pos)
    }

    /// Whether a position entry exists.
    pub fn contains_position(&self, pos: i64) -> Result<bool> {
        Ok(self.idx.search(pos)?.is_some())
    }

    /// Continuation page recorded for a position, if present.
    pub fn next_page_of(&self, pos: i64) -> Result<Option<i64>> {
        self.idx.search(pos)
    }

    /// Largest position key present.
    pub fn max_position(&self) -> Option<i64> {
        self.idx.tree().max_key()
    }

    /// Number of position entries.
    pub fn size(&self) -> u64 {
        self.idx.tree().size()
    }

    /// Drop every entry.
    pub fn clear(&mut self) -> Result<()> {
        self.idx.tree_mut().clear()
    }

    /// Flush the index and return its root page id.
    pub fn write(&mut self) -> Result<PageId> {
        self.idx.tree_mut().flush()
    }

    /// Every position entry in ascending order.
    pub fn iter_positions(&self) -> Result<AscendingLeafIter<'_>> {
        self.idx.tree().iter_ascending()
    }

    /// Start-of-object positions only, skipping secondary-page entries.
    pub fn iter_objects(&self) -> Result<ObjectPositions<'_>> {
        Ok(ObjectPositions {
            inner: self.idx.tree().iter_ascending()?,
        })
    }

    /// Number of leaf nodes in the index.
    pub fn leaf_count(&self) -> Result<usize> {
        self.idx.tree().leaf_count()
    }

    /// Number of inner nodes in the index.
    pub fn inner_count(&self) -> Result<usize> {
        self.idx.tree().inner_count()
    }

    /// Number of pages the index has written to the store.
    pub fn written_pages(&self) -> u64 {
        self.idx.tree().written_pages()
    }
}

/// Iterator over start-of-object positions.
pub struct ObjectPositions<'t> {
    inner: AscendingLeafIter<'t>,
}

impl ObjectPositions<'_> {
    /// Next start-of-object position, or `None` when exhausted.
    pub fn next(&mut self) -> Result<Option<i64>> {
        while let Some((pos, _next_page)) = self.inner.next()? {
            if offset_of(pos) != MARK_SECONDARY {
                return Ok(Some(pos));
            }
        }
        Ok(None)
    }
}
