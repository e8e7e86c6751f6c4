use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::debug;

use super::node::{Keying, Node, NODE_FLAGS_LEN};
use super::prefix;
use crate::store::PageStore;
use crate::types::{PageId, Result, UmbraError};

const FLAG_LEAF: u8 = 0b01;
const FLAG_ROOT: u8 = 0b10;

/// Page-id to node cache with clean/dirty partitioning and write-back.
///
/// Every live page id maps to exactly one node instance held in exactly
/// one of the two partitions: `clean` when the on-disk image matches the
/// in-memory state, `dirty` otherwise. The cache state sits behind a
/// mutex so read-only consumers can fault pages in through `&self`; the
/// tree engine itself stays single-writer.
pub struct BufferManager {
    store: Arc<dyn PageStore>,
    keying: Keying,
    leaf_order: usize,
    inner_order: usize,
    compression: bool,
    state: Mutex<BufferState>,
    written_pages: AtomicU64,
}

#[derive(Default)]
struct BufferState {
    clean: FxHashMap<PageId, Node>,
    dirty: FxHashMap<PageId, Node>,
}

impl BufferManager {
    pub(crate) fn new(
        store: Arc<dyn PageStore>,
        keying: Keying,
        leaf_order: usize,
        inner_order: usize,
        compression: bool,
    ) -> Self {
        Self {
            store,
            keying,
            leaf_order,
            inner_order,
            compression,
            state: Mutex::new(BufferState::default()),
            written_pages: AtomicU64::new(0),
        }
    }

    /// Fixed page byte budget of the backing store.
    pub fn page_size(&self) -> usize {
        self.store.page_size()
    }

    pub(crate) fn keying(&self) -> Keying {
        self.keying
    }

    pub(crate) fn leaf_order(&self) -> usize {
        self.leaf_order
    }

    pub(crate) fn inner_order(&self) -> usize {
        self.inner_order
    }

    pub(crate) fn compression(&self) -> bool {
        self.compression
    }

    /// Take ownership of a freshly created node: allocate its page id
    /// from the store and place it in the dirty partition.
    pub(crate) fn register(&self, mut node: Node) -> Result<PageId> {
        let id = self.store.allocate_page_id()?;
        node.page_id = id;
        node.dirty = true;
        self.state.lock().dirty.insert(id, node);
        Ok(id)
    }

    /// Run `f` against the node for `id`, faulting it in from the store
    /// if it is not cached. Read-only: the node stays in its partition.
    pub(crate) fn with_node<R>(&self, id: PageId, f: impl FnOnce(&Node) -> R) -> Result<R> {
        let mut state = self.state.lock();
        self.ensure_cached(&mut state, id)?;
        let node = cached(&state, id).ok_or(UmbraError::State("node vanished from cache"))?;
        Ok(f(node))
    }

    /// Run `f` against a mutable node. The node and every ancestor on
    /// its parent chain move to the dirty partition first, so a partial
    /// flush can never persist a parent over a stale child encoding.
    pub(crate) fn with_node_mut<R>(
        &self,
        id: PageId,
        f: impl FnOnce(&mut Node) -> R,
    ) -> Result<R> {
        let mut state = self.state.lock();
        self.ensure_cached(&mut state, id)?;
        mark_dirty_chain(&mut state, id);
        let node = state
            .dirty
            .get_mut(&id)
            .ok_or(UmbraError::State("node vanished from cache"))?;
        Ok(f(node))
    }

    /// Read-only access to two distinct cached nodes at once.
    pub(crate) fn with_pair<R>(
        &self,
        a: PageId,
        b: PageId,
        f: impl FnOnce(&Node, &Node) -> R,
    ) -> Result<R> {
        if a == b {
            return Err(UmbraError::State("node pair must be distinct"));
        }
        let mut state = self.state.lock();
        self.ensure_cached(&mut state, a)?;
        self.ensure_cached(&mut state, b)?;
        let na = cached(&state, a).ok_or(UmbraError::State("node vanished from cache"))?;
        let nb = cached(&state, b).ok_or(UmbraError::State("node vanished from cache"))?;
        Ok(f(na, nb))
    }

    /// Mutable access to two distinct nodes at once; both are dirtied.
    pub(crate) fn with_two<R>(
        &self,
        a: PageId,
        b: PageId,
        f: impl FnOnce(&mut Node, &mut Node) -> R,
    ) -> Result<R> {
        if a == b {
            return Err(UmbraError::State("node pair must be distinct"));
        }
        let mut state = self.state.lock();
        self.ensure_cached(&mut state, a)?;
        self.ensure_cached(&mut state, b)?;
        mark_dirty_chain(&mut state, a);
        mark_dirty_chain(&mut state, b);
        let mut node_a = state
            .dirty
            .remove(&a)
            .ok_or(UmbraError::State("node vanished from cache"))?;
        let result = match state.dirty.get_mut(&b) {
            Some(node_b) => Ok(f(&mut node_a, node_b)),
            None => Err(UmbraError::State("node vanished from cache")),
        };
        state.dirty.insert(a, node_a);
        result
    }

    /// Set a node's non-owning parent back-reference. Link bookkeeping
    /// only; the node stays in its current partition.
    pub(crate) fn set_parent(&self, id: PageId, parent: Option<PageId>) -> Result<()> {
        let mut state = self.state.lock();
        self.ensure_cached(&mut state, id)?;
        if let Some(node) = cached_mut(&mut state, id) {
            node.parent = parent;
        }
        Ok(())
    }

    /// Fix the parent links of any cached nodes among `children`. Nodes
    /// not currently cached pick the link up when next faulted in.
    pub(crate) fn reparent(&self, children: &[PageId], parent: PageId) {
        let mut state = self.state.lock();
        for &child in children {
            if !child.is_valid() {
                continue;
            }
            if let Some(node) = cached_mut(&mut state, child) {
                node.parent = Some(parent);
            }
        }
    }

    /// Flush the dirty subtree rooted at `id`, children before parents,
    /// and return `id`. Clean nodes cannot have dirty descendants (the
    /// ancestor-dirtying rule), so the walk stops at them.
    pub(crate) fn write(&self, id: PageId) -> Result<PageId> {
        let mut state = self.state.lock();
        let mut stack: Vec<(PageId, bool)> = vec![(id, false)];
        while let Some((page, expanded)) = stack.pop() {
            if expanded {
                self.flush_one(&mut state, page)?;
                continue;
            }
            let Some(node) = state.dirty.get(&page) else {
                continue;
            };
            stack.push((page, true));
            for &child in node.child_ids() {
                if child.is_valid() {
                    stack.push((child, false));
                }
            }
        }
        Ok(id)
    }

    fn flush_one(&self, state: &mut BufferState, id: PageId) -> Result<()> {
        let mut node = state
            .dirty
            .remove(&id)
            .ok_or(UmbraError::State("flush of a node missing from the dirty partition"))?;
        let image = self.encode_node(&node);
        if image.len() > self.store.page_size() {
            state.dirty.insert(id, node);
            return Err(UmbraError::State("node image exceeds the page budget"));
        }
        match self.store.write_page(id, &image) {
            Ok(()) => {
                node.dirty = false;
                debug!(target: "umbra_index::buffer", page = %id, bytes = image.len(), "page flushed");
                state.clean.insert(id, node);
                self.written_pages.fetch_add(1, AtomicOrdering::Relaxed);
                Ok(())
            }
            Err(err) => {
                state.dirty.insert(id, node);
                Err(err)
            }
        }
    }

    /// Evict the node for `id` from both partitions. Used when a node is
    /// merged away or the tree is cleared; any dirty state is dropped.
    pub(crate) fn remove(&self, id: PageId) {
        let mut state = self.state.lock();
        state.clean.remove(&id);
        state.dirty.remove(&id);
    }

    /// Drop every cached node.
    pub(crate) fn clear(&self) {
        let mut state = self.state.lock();
        state.clean.clear();
        state.dirty.clear();
    }

    /// Number of pages written to the store over this manager's life.
    pub fn written_pages(&self) -> u64 {
        self.written_pages.load(AtomicOrdering::Relaxed)
    }

    /// Number of nodes currently in the dirty partition.
    pub fn dirty_count(&self) -> usize {
        self.state.lock().dirty.len()
    }

    /// Number of nodes currently in the clean partition.
    pub fn clean_count(&self) -> usize {
        self.state.lock().clean.len()
    }

    /// Whether `id` is cached in either partition.
    pub fn contains(&self, id: PageId) -> bool {
        let state = self.state.lock();
        state.clean.contains_key(&id) || state.dirty.contains_key(&id)
    }

    /// Whether the cached node for `id` is dirty. Errors if uncached.
    pub fn is_dirty(&self, id: PageId) -> Result<bool> {
        let state = self.state.lock();
        if state.dirty.contains_key(&id) {
            Ok(true)
        } else if state.clean.contains_key(&id) {
            Ok(false)
        } else {
            Err(UmbraError::State("dirtiness query for an uncached node"))
        }
    }

    fn ensure_cached(&self, state: &mut BufferState, id: PageId) -> Result<()> {
        if !id.is_valid() {
            return Err(UmbraError::State("access through the null page id"));
        }
        if state.clean.contains_key(&id) || state.dirty.contains_key(&id) {
            return Ok(());
        }
        let mut buf = vec![0u8; self.store.page_size()];
        self.store.read_page(id, &mut buf)?;
        let node = self.decode_node(&buf, id)?;
        state.clean.insert(id, node);
        Ok(())
    }

    fn encode_node(&self, node: &Node) -> BytesMut {
        let mut out = BytesMut::with_capacity(node.byte_size());
        let mut flags = 0u8;
        if node.is_leaf {
            flags |= FLAG_LEAF;
        }
        if node.is_root {
            flags |= FLAG_ROOT;
        }
        out.put_u8(flags);
        if self.compression {
            out.extend_from_slice(&prefix::encode(node.keys()));
        } else {
            out.extend_from_slice(&prefix::encode_raw(node.keys()));
        }
        match self.keying {
            Keying::Unique if node.is_leaf => {
                for &value in node.values() {
                    out.put_i64(value);
                }
            }
            Keying::Unique => {}
            Keying::NonUnique => {
                if self.compression {
                    out.extend_from_slice(&prefix::encode_unsorted(node.values()));
                } else {
                    out.extend_from_slice(&prefix::encode_raw(node.values()));
                }
            }
        }
        if !node.is_leaf {
            for &child in node.child_ids() {
                out.put_u32(child.0);
            }
        }
        out
    }

    fn decode_node(&self, image: &[u8], id: PageId) -> Result<Node> {
        if image.len() < NODE_FLAGS_LEN {
            return Err(UmbraError::Corruption("page image shorter than node flags"));
        }
        let flags = image[0];
        let is_leaf = flags & FLAG_LEAF != 0;
        let is_root = flags & FLAG_ROOT != 0;
        let order = if is_leaf { self.leaf_order } else { self.inner_order };

        let mut offset = NODE_FLAGS_LEN;
        let (keys, used) = prefix::decode_prefixed(&image[offset..])?;
        offset += used;
        if keys.len() > order - 1 {
            return Err(UmbraError::Corruption("node key count exceeds its order"));
        }

        let mut node = if is_leaf {
            Node::new_leaf(order, is_root, self.keying, self.compression)
        } else {
            Node::new_inner(order, is_root, self.keying, self.compression)
        };
        node.num_keys = keys.len();
        node.keys[..keys.len()].copy_from_slice(&keys);

        match self.keying {
            Keying::Unique if is_leaf => {
                for slot in 0..node.num_keys {
                    let bytes = image
                        .get(offset..offset + 8)
                        .ok_or(UmbraError::Corruption("leaf value array truncated"))?;
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(bytes);
                    node.values[slot] = i64::from_be_bytes(raw);
                    offset += 8;
                }
            }
            Keying::Unique => {}
            Keying::NonUnique => {
                let (values, used) = prefix::decode_prefixed(&image[offset..])?;
                offset += used;
                if values.len() != node.num_keys {
                    return Err(UmbraError::Corruption("value count does not match key count"));
                }
                node.values[..values.len()].copy_from_slice(&values);
            }
        }

        if !is_leaf {
            for slot in 0..=node.num_keys {
                let bytes = image
                    .get(offset..offset + 4)
                    .ok_or(UmbraError::Corruption("child id array truncated"))?;
                let mut raw = [0u8; 4];
                raw.copy_from_slice(bytes);
                let child = PageId(u32::from_be_bytes(raw));
                if !child.is_valid() {
                    return Err(UmbraError::Corruption("inner node references the null page"));
                }
                node.children[slot] = child;
                offset += 4;
            }
        }

        node.page_id = id;
        node.parent = None;
        node.dirty = false;
        node.recompute_size(self.keying, self.compression);
        Ok(node)
    }
}

fn cached<'a>(state: &'a BufferState, id: PageId) -> Option<&'a Node> {
    state.clean.get(&id).or_else(|| state.dirty.get(&id))
}

fn cached_mut<'a>(state: &'a mut BufferState, id: PageId) -> Option<&'a mut Node> {
    if state.clean.contains_key(&id) {
        state.clean.get_mut(&id)
    } else {
        state.dirty.get_mut(&id)
    }
}

/// Move the node for `id` to the dirty partition, then walk the parent
/// chain doing the same, stopping at the first ancestor that is already
/// dirty (its own ancestors are dirty by invariant) or not cached.
fn mark_dirty_chain(state: &mut BufferState, id: PageId) {
    let mut cursor = Some(id);
    while let Some(current) = cursor {
        if state.dirty.contains_key(&current) {
            break;
        }
        let Some(mut node) = state.clean.remove(&current) else {
            break;
        };
        node.dirty = true;
        cursor = node.parent;
        state.dirty.insert(current, node);
    }
}
