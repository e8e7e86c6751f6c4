//! External page store seam and an in-memory implementation.
//!
//! The index layer never touches files directly: the buffer manager reads
//! and writes whole page images through [`PageStore`]. Framing, checksums
//! and free-space policy beyond id issuance belong to the implementation
//! behind the trait.

use std::io;
use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};

use bytes::Bytes;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::types::{PageId, Result};

/// Byte-level page storage consumed by the buffer manager.
pub trait PageStore: Send + Sync {
    /// Fixed page size in bytes.
    fn page_size(&self) -> usize;

    /// Issue a fresh page id. Ids are never reused while the store lives.
    fn allocate_page_id(&self) -> Result<PageId>;

    /// Read the page image for `id` into `buf` (`page_size` bytes).
    fn read_page(&self, id: PageId, buf: &mut [u8]) -> Result<()>;

    /// Write the page image for `id`. `buf` must not exceed `page_size`.
    fn write_page(&self, id: PageId, buf: &[u8]) -> Result<()>;
}

/// Heap-backed store for tests and callers without a disk file.
///
/// Several independent trees may share one instance; the allocator keeps
/// their page-id ranges disjoint.
pub struct MemoryPageStore {
    page_size: usize,
    next_id: AtomicU32,
    pages: Mutex<FxHashMap<PageId, Bytes>>,
}

impl MemoryPageStore {
    /// Create a store with the given fixed page size.
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            next_id: AtomicU32::new(1),
            pages: Mutex::new(FxHashMap::default()),
        }
    }

    /// Number of pages that have ever been written.
    pub fn page_count(&self) -> usize {
        self.pages.lock().len()
    }
}

impl PageStore for MemoryPageStore {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn allocate_page_id(&self) -> Result<PageId> {
        Ok(PageId(self.next_id.fetch_add(1, AtomicOrdering::Relaxed)))
    }

    fn read_page(&self, id: PageId, buf: &mut [u8]) -> Result<()> {
        let pages = self.pages.lock();
        let image = pages.get(&id).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("page {id} not written"))
        })?;
        let len = image.len().min(buf.len());
        buf[..len].copy_from_slice(&image[..len]);
        buf[len..].fill(0);
        Ok(())
    }

    fn write_page(&self, id: PageId, buf: &[u8]) -> Result<()> {
        if buf.len() > self.page_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("page image {} exceeds page size {}", buf.len(), self.page_size),
            )
            .into());
        }
        self.pages
            .lock()
            .insert(id, Bytes::copy_from_slice(buf));
        Ok(())
    }
}
