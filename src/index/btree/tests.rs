use std::collections::BTreeMap;
use std::sync::Arc;

use proptest::prelude::*;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use super::node::{node_eq, Keying, Node};
use super::prefix;
use super::tree::{NonUniqueBTree, TreeOptions, UniqueBTree};
use crate::store::{MemoryPageStore, PageStore};
use crate::types::{PageId, Result, UmbraError};

const PAGE_SIZE: usize = 4096;

fn memory_store() -> (Arc<MemoryPageStore>, Arc<dyn PageStore>) {
    let store = Arc::new(MemoryPageStore::new(PAGE_SIZE));
    let dynamic: Arc<dyn PageStore> = store.clone();
    (store, dynamic)
}

fn unique_tree(store: &Arc<dyn PageStore>, order: usize) -> Result<UniqueBTree> {
    UniqueBTree::with_options(
        store,
        TreeOptions {
            leaf_order: Some(order),
            inner_order: Some(order),
            ..TreeOptions::default()
        },
    )
}

fn non_unique_tree(store: &Arc<dyn PageStore>, order: usize) -> Result<NonUniqueBTree> {
    NonUniqueBTree::with_options(
        store,
        TreeOptions {
            leaf_order: Some(order),
            inner_order: Some(order),
            ..TreeOptions::default()
        },
    )
}

fn leaf(order: usize, keys: &[i64]) -> Node {
    let mut node = Node::new_leaf(order, false, Keying::Unique, true);
    for (i, &k) in keys.iter().enumerate() {
        node.keys[i] = k;
        node.values[i] = k;
    }
    node.num_keys = keys.len();
    node.recompute_size(Keying::Unique, true);
    node
}

fn inner(order: usize, keys: &[i64], children: &[PageId], is_root: bool) -> Node {
    let mut node = Node::new_inner(order, is_root, Keying::Unique, true);
    for (i, &k) in keys.iter().enumerate() {
        node.keys[i] = k;
    }
    for (i, &c) in children.iter().enumerate() {
        node.children[i] = c;
    }
    node.num_keys = keys.len();
    node.recompute_size(Keying::Unique, true);
    node
}

/// Minimal two-level fixture: separator 17 over leaves [5] and [13],
/// order 4.
fn two_layer_tree(store: &Arc<dyn PageStore>) -> Result<UniqueBTree> {
    let mut tree = unique_tree(store, 4)?;
    let buf = tree.tree().buffer();
    let left = buf.register(leaf(4, &[5]))?;
    let right = buf.register(leaf(4, &[13]))?;
    let root = buf.register(inner(4, &[17], &[left, right], true))?;
    buf.set_parent(left, Some(root))?;
    buf.set_parent(right, Some(root))?;
    tree.tree_mut().install_root(root)?;
    Ok(tree)
}

struct ThreeLayer {
    tree: UniqueBTree,
    leaves: [PageId; 6],
    inners: [PageId; 2],
    root: PageId,
}

/// Root [17], inner [5,13] and [24,30], six leaves. Order 6 throughout.
fn three_layer_tree(store: &Arc<dyn PageStore>) -> Result<ThreeLayer> {
    let mut tree = unique_tree(store, 6)?;
    let buf = tree.tree().buffer();
    let leaf_keys: [&[i64]; 6] = [
        &[2, 3],
        &[5, 7, 8],
        &[14, 16],
        &[19, 20, 22],
        &[24, 27, 29],
        &[33, 34, 38, 39],
    ];
    let mut leaves = [PageId(0); 6];
    for (i, keys) in leaf_keys.iter().enumerate() {
        leaves[i] = buf.register(leaf(6, keys))?;
    }
    let left_inner = buf.register(inner(6, &[5, 13], &leaves[0..3], false))?;
    let right_inner = buf.register(inner(6, &[24, 30], &leaves[3..6], false))?;
    let root = buf.register(inner(6, &[17], &[left_inner, right_inner], true))?;
    for &child in &leaves[0..3] {
        buf.set_parent(child, Some(left_inner))?;
    }
    for &child in &leaves[3..6] {
        buf.set_parent(child, Some(right_inner))?;
    }
    buf.set_parent(left_inner, Some(root))?;
    buf.set_parent(right_inner, Some(root))?;
    tree.tree_mut().install_root(root)?;
    Ok(ThreeLayer {
        tree,
        leaves,
        inners: [left_inner, right_inner],
        root,
    })
}

fn live_node_ids(tree: &UniqueBTree) -> Result<Vec<PageId>> {
    let mut ids = vec![tree.tree().root_page()];
    let mut cursor = 0;
    while cursor < ids.len() {
        let id = ids[cursor];
        cursor += 1;
        let children = tree
            .tree()
            .buffer()
            .with_node(id, |n| n.child_ids().to_vec())?;
        ids.extend(children);
    }
    Ok(ids)
}

fn random_unique_entries(count: usize, seed: u64) -> Vec<(i64, i64)> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut seen = std::collections::HashSet::new();
    let mut entries = Vec::with_capacity(count);
    while entries.len() < count {
        let key = rng.gen_range(0..i64::MAX);
        if seen.insert(key) {
            entries.push((key, rng.gen_range(0..i64::MAX)));
        }
    }
    entries
}

#[test]
fn empty_tree_search_returns_none() -> Result<()> {
    let (_, store) = memory_store();
    let tree = unique_tree(&store, 4)?;
    assert_eq!(tree.search(42)?, None);
    assert_eq!(tree.tree().size(), 0);
    assert_eq!(tree.tree().min_key(), None);
    assert_eq!(tree.tree().max_key(), None);
    Ok(())
}

#[test]
fn delete_on_empty_tree_is_not_found() -> Result<()> {
    let (_, store) = memory_store();
    let mut tree = unique_tree(&store, 4)?;
    assert!(matches!(tree.delete(7), Err(UmbraError::NotFound)));
    Ok(())
}

#[test]
fn unique_insert_rejects_duplicate_key() -> Result<()> {
    let (_, store) = memory_store();
    let mut tree = unique_tree(&store, 4)?;
    tree.insert(10, 100)?;
    assert!(matches!(tree.insert(10, 100), Err(UmbraError::DuplicateKey(10))));
    assert!(matches!(tree.insert(10, 999), Err(UmbraError::DuplicateKey(10))));
    assert_eq!(tree.search(10)?, Some(100));
    Ok(())
}

#[test]
fn search_returns_last_inserted_value_per_key() -> Result<()> {
    let (_, store) = memory_store();
    let mut tree = unique_tree(&store, 8)?;
    let entries = random_unique_entries(2_000, 7);
    for &(key, value) in &entries {
        tree.insert(key, value)?;
    }
    for &(key, value) in &entries {
        assert_eq!(tree.search(key)?, Some(value));
    }
    tree.tree().check_structure()?;
    Ok(())
}

#[test]
fn insert_then_delete_everything_returns_to_empty_root() -> Result<()> {
    let (_, store) = memory_store();
    let mut tree = unique_tree(&store, 6)?;
    let mut entries = random_unique_entries(1_000, 11);
    for &(key, value) in &entries {
        tree.insert(key, value)?;
    }
    let mut rng = ChaCha8Rng::seed_from_u64(13);
    entries.shuffle(&mut rng);
    for &(key, value) in &entries {
        assert_eq!(tree.delete(key)?, value);
    }
    assert_eq!(tree.tree().size(), 0);
    let root = tree.tree().root_page();
    let (is_leaf, num_keys) = tree
        .tree()
        .buffer()
        .with_node(root, |n| (n.is_leaf(), n.num_keys()))?;
    assert!(is_leaf);
    assert_eq!(num_keys, 0);
    assert_eq!(tree.tree().min_key(), None);
    assert_eq!(tree.tree().max_key(), None);
    Ok(())
}

#[test]
fn min_max_follow_boundary_deletes() -> Result<()> {
    let (_, store) = memory_store();
    let mut tree = unique_tree(&store, 4)?;
    for key in [40, 10, 30, 20] {
        tree.insert(key, key * 2)?;
    }
    assert_eq!(tree.tree().min_key(), Some(10));
    assert_eq!(tree.tree().max_key(), Some(40));
    tree.delete(10)?;
    assert_eq!(tree.tree().min_key(), Some(20));
    tree.delete(40)?;
    assert_eq!(tree.tree().max_key(), Some(30));
    tree.delete(20)?;
    tree.delete(30)?;
    assert_eq!(tree.tree().min_key(), None);
    assert_eq!(tree.tree().max_key(), None);
    Ok(())
}

#[test]
fn two_layer_fixture_collapses_to_single_leaf() -> Result<()> {
    let (_, store) = memory_store();
    let mut tree = two_layer_tree(&store)?;
    assert_eq!(tree.tree().size(), 2);
    assert_eq!(tree.tree().min_key(), Some(5));
    assert_eq!(tree.tree().max_key(), Some(13));
    assert_eq!(tree.tree().inner_count()?, 1);
    assert_eq!(tree.tree().leaf_count()?, 2);

    assert_eq!(tree.delete(5)?, 5);
    // The empty leaf merges into its sibling and the root collapses.
    assert_eq!(tree.tree().inner_count()?, 0);
    assert_eq!(tree.tree().leaf_count()?, 1);
    assert_eq!(tree.tree().size(), 1);
    assert_eq!(tree.tree().min_key(), Some(13));
    assert_eq!(tree.tree().max_key(), Some(13));

    assert_eq!(tree.delete(13)?, 13);
    let root = tree.tree().root_page();
    let (is_leaf, num_keys) = tree
        .tree()
        .buffer()
        .with_node(root, |n| (n.is_leaf(), n.num_keys()))?;
    assert!(is_leaf);
    assert_eq!(num_keys, 0);
    assert_eq!(tree.tree().size(), 0);
    Ok(())
}

#[test]
fn dirty_marking_follows_the_mutation_path() -> Result<()> {
    let (raw_store, store) = memory_store();
    let ThreeLayer {
        mut tree,
        leaves,
        inners,
        root,
    } = three_layer_tree(&store)?;
    let buf = tree.tree().buffer();
    assert_eq!(buf.dirty_count(), 9);

    tree.tree_mut().flush()?;
    let buf = tree.tree().buffer();
    assert_eq!(buf.dirty_count(), 0);
    assert_eq!(buf.clean_count(), 9);
    assert_eq!(tree.tree().written_pages(), 9);
    assert_eq!(raw_store.page_count(), 9);

    // Insert on the leftmost path dirties exactly that path.
    tree.insert(4, 4)?;
    let buf = tree.tree().buffer();
    for id in [root, inners[0], leaves[0]] {
        assert!(buf.is_dirty(id)?);
    }
    for id in [inners[1], leaves[1], leaves[2], leaves[3], leaves[4], leaves[5]] {
        assert!(!buf.is_dirty(id)?);
    }

    tree.tree_mut().flush()?;
    assert_eq!(tree.tree().written_pages(), 12);

    // Filling the rightmost leaf past capacity splits it; the split
    // touches only the right spine plus the new sibling.
    tree.insert(32, 32)?;
    tree.insert(35, 35)?;
    let buf = tree.tree().buffer();
    assert_eq!(buf.dirty_count(), 4);
    for id in [root, inners[1], leaves[5]] {
        assert!(buf.is_dirty(id)?);
    }
    for id in [inners[0], leaves[0], leaves[1], leaves[2], leaves[3], leaves[4]] {
        assert!(!buf.is_dirty(id)?);
    }

    tree.tree_mut().flush()?;
    assert_eq!(tree.tree().written_pages(), 16);

    // Deleting 16 leaves [14] underfull; it absorbs its left sibling and
    // the parent drops one separator. The absorbed node is evicted.
    tree.delete(16)?;
    let buf = tree.tree().buffer();
    assert!(buf.is_dirty(root)?);
    assert!(buf.is_dirty(inners[0])?);
    assert!(buf.is_dirty(leaves[2])?);
    assert!(!buf.contains(leaves[1]));
    assert!(!buf.is_dirty(inners[1])?);
    assert!(!buf.is_dirty(leaves[0])?);

    tree.tree_mut().flush()?;
    assert_eq!(tree.tree().written_pages(), 19);

    tree.delete(14)?;
    let buf = tree.tree().buffer();
    assert!(buf.is_dirty(root)?);
    assert!(buf.is_dirty(inners[0])?);
    assert!(buf.is_dirty(leaves[2])?);
    assert!(!buf.is_dirty(inners[1])?);
    Ok(())
}

#[test]
fn flush_moves_every_reachable_node_to_the_clean_partition() -> Result<()> {
    let (_, store) = memory_store();
    let mut tree = unique_tree(&store, 5)?;
    for &(key, value) in &random_unique_entries(300, 23) {
        tree.insert(key, value)?;
    }
    tree.tree_mut().flush()?;
    let buf = tree.tree().buffer();
    assert_eq!(buf.dirty_count(), 0);
    for id in live_node_ids(&tree)? {
        assert!(buf.contains(id));
        assert!(!buf.is_dirty(id)?);
    }
    Ok(())
}

#[test]
fn merged_away_nodes_leave_the_buffer() -> Result<()> {
    let (_, store) = memory_store();
    let ThreeLayer { mut tree, .. } = three_layer_tree(&store)?;
    let initial = live_node_ids(&tree)?;

    for batch in [
        &[2, 3][..],
        &[5, 7, 8][..],
        &[24, 27, 29, 33][..],
        &[14, 16][..],
        &[19, 20, 22][..],
    ] {
        for &key in batch {
            tree.delete(key)?;
        }
        let live = live_node_ids(&tree)?;
        let buf = tree.tree().buffer();
        for &id in &initial {
            if live.contains(&id) {
                continue;
            }
            assert!(!buf.contains(id), "evicted node {id} still buffered");
        }
    }
    Ok(())
}

#[test]
fn flushed_tree_reopens_through_a_second_buffer_manager() -> Result<()> {
    let (_, store) = memory_store();
    let mut tree = unique_tree(&store, 16)?;
    let entries = random_unique_entries(10_000, 42);
    for &(key, value) in &entries {
        tree.insert(key, value)?;
    }
    let root = tree.tree_mut().flush()?;

    let reopened = UniqueBTree::with_options(
        &store,
        TreeOptions {
            leaf_order: Some(16),
            inner_order: Some(16),
            root_page: Some(root),
            ..TreeOptions::default()
        },
    )?;
    assert_eq!(reopened.tree().buffer().dirty_count(), 0);
    assert_eq!(reopened.tree().size(), entries.len() as u64);
    for &(key, value) in &entries {
        assert_eq!(reopened.search(key)?, Some(value));
    }
    reopened.tree().check_structure()?;

    for &(key, _) in &entries {
        tree.delete(key)?;
    }
    let root = tree.tree_mut().flush()?;
    let empty = UniqueBTree::with_options(
        &store,
        TreeOptions {
            leaf_order: Some(16),
            inner_order: Some(16),
            root_page: Some(root),
            ..TreeOptions::default()
        },
    )?;
    for &(key, _) in &entries {
        assert_eq!(empty.search(key)?, None);
    }
    assert_eq!(empty.tree().size(), 0);
    let (is_leaf, children) = empty
        .tree()
        .buffer()
        .with_node(root, |n| (n.is_leaf(), n.child_ids().to_vec()))?;
    assert!(is_leaf);
    assert!(children.is_empty());
    Ok(())
}

#[test]
fn partial_delete_leaves_exactly_the_survivors() -> Result<()> {
    let (_, store) = memory_store();
    let mut tree = unique_tree(&store, 16)?;
    let mut entries = random_unique_entries(10_000, 42);
    for &(key, value) in &entries {
        tree.insert(key, value)?;
    }
    let mut rng = ChaCha8Rng::seed_from_u64(43);
    entries.shuffle(&mut rng);
    let (deleted, kept) = entries.split_at(9_000);
    for &(key, _) in deleted {
        tree.delete(key)?;
    }
    assert_eq!(tree.tree().size(), 1_000);
    for &(key, value) in kept {
        assert_eq!(tree.search(key)?, Some(value));
    }
    for &(key, _) in deleted {
        assert!(matches!(tree.delete(key), Err(UmbraError::NotFound)));
        assert_eq!(tree.search(key)?, None);
    }
    tree.tree().check_structure()?;

    // Exactly one root in the surviving graph.
    let mut roots = 0;
    for id in live_node_ids(&tree)? {
        if tree.tree().buffer().with_node(id, |n| n.is_root())? {
            roots += 1;
        }
    }
    assert_eq!(roots, 1);
    Ok(())
}

#[test]
fn ascending_and_descending_iterators_mirror_each_other() -> Result<()> {
    let (_, store) = memory_store();
    let mut tree = unique_tree(&store, 8)?;
    let entries = random_unique_entries(1_500, 77);
    for &(key, value) in &entries {
        tree.insert(key, value)?;
    }
    let mut forward = Vec::new();
    let mut iter = tree.tree().iter_ascending()?;
    while let Some(entry) = iter.next()? {
        forward.push(entry);
    }
    let mut backward = Vec::new();
    let mut iter = tree.tree().iter_descending()?;
    while let Some(entry) = iter.next()? {
        backward.push(entry);
    }
    backward.reverse();
    assert_eq!(forward, backward);
    assert_eq!(forward.len(), entries.len());
    assert!(forward.windows(2).all(|w| w[0].0 < w[1].0));
    Ok(())
}

#[test]
fn range_iteration_honors_inclusive_bounds() -> Result<()> {
    let (_, store) = memory_store();
    let mut tree = unique_tree(&store, 4)?;
    for key in (0..100).map(|i| i * 10) {
        tree.insert(key, key)?;
    }
    let mut seen = Vec::new();
    let mut iter = tree.tree().range_ascending(250, 500)?;
    while let Some((key, _)) = iter.next()? {
        seen.push(key);
    }
    assert_eq!(seen, (25..=50).map(|i| i * 10).collect::<Vec<_>>());

    let mut seen = Vec::new();
    let mut iter = tree.tree().range_descending(250, 500)?;
    while let Some((key, _)) = iter.next()? {
        seen.push(key);
    }
    assert_eq!(seen, (25..=50).rev().map(|i| i * 10).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn non_unique_tree_keeps_equal_keys_apart_by_value() -> Result<()> {
    let (_, store) = memory_store();
    let mut tree = non_unique_tree(&store, 5)?;
    tree.insert(1, 1)?;
    tree.insert(1, 2)?;
    let root = tree.tree().root_page();
    assert_eq!(tree.tree().buffer().with_node(root, |n| n.num_keys())?, 2);
    assert!(tree.contains(1, 1)?);
    assert!(tree.contains(1, 2)?);
    assert!(!tree.contains(1, 3)?);
    Ok(())
}

#[test]
fn non_unique_rejects_exact_duplicate_pair() -> Result<()> {
    let (_, store) = memory_store();
    let mut tree = non_unique_tree(&store, 5)?;
    tree.insert(1, 1)?;
    assert!(matches!(
        tree.insert(1, 1),
        Err(UmbraError::DuplicateEntry(1, 1))
    ));
    Ok(())
}

#[test]
fn non_unique_delete_removes_only_the_matching_pair() -> Result<()> {
    let (_, store) = memory_store();
    let mut tree = non_unique_tree(&store, 5)?;
    tree.insert(1, 1)?;
    tree.insert(2, 2)?;
    tree.insert(2, 3)?;
    tree.insert(3, 3)?;
    assert_eq!(tree.delete(2, 3)?, 3);
    assert!(tree.contains(2, 2)?);
    assert!(!tree.contains(2, 3)?);
    assert!(matches!(tree.delete(2, 3), Err(UmbraError::NotFound)));
    Ok(())
}

#[test]
fn non_unique_split_handles_a_single_hot_key() -> Result<()> {
    let (_, store) = memory_store();
    let mut tree = non_unique_tree(&store, 5)?;
    for value in 0..100 {
        tree.insert(1, value)?;
    }
    tree.tree().check_structure()?;
    for value in 0..100 {
        assert!(tree.contains(1, value)?);
    }
    assert!(tree.tree().inner_count()? > 0);
    Ok(())
}

#[test]
fn non_unique_bulk_insert_delete_round() -> Result<()> {
    let (_, store) = memory_store();
    let mut tree = non_unique_tree(&store, 32)?;
    let mut pairs = Vec::new();
    let mut rng = ChaCha8Rng::seed_from_u64(5);
    for key in 0..500i64 {
        for _ in 0..4 {
            pairs.push((key, rng.gen_range(0..1_000_000)));
        }
    }
    pairs.sort_unstable();
    pairs.dedup();
    for &(key, value) in &pairs {
        tree.insert(key, value)?;
        assert!(tree.contains(key, value)?);
    }
    for &(key, value) in &pairs {
        assert!(tree.contains(key, value)?);
    }
    for &(key, value) in &pairs {
        tree.delete(key, value)?;
        assert!(!tree.contains(key, value)?);
    }
    assert_eq!(tree.tree().size(), 0);
    let root = tree.tree().root_page();
    assert!(tree.tree().buffer().with_node(root, |n| n.is_leaf())?);

    // Reinsert, delete half, verify the split is exact.
    for &(key, value) in &pairs {
        tree.insert(key, value)?;
    }
    let half = pairs.len() / 2;
    for &(key, value) in &pairs[..half] {
        tree.delete(key, value)?;
    }
    for (i, &(key, value)) in pairs.iter().enumerate() {
        assert_eq!(tree.contains(key, value)?, i >= half);
    }
    tree.tree().check_structure()?;
    Ok(())
}

#[test]
fn non_unique_entries_survive_flush_and_reload() -> Result<()> {
    let (_, store) = memory_store();
    let mut tree = non_unique_tree(&store, 16)?;
    for key in 1_000..2_000i64 {
        tree.insert(key, 32 + key)?;
    }
    let root = tree.tree_mut().flush()?;
    tree.tree_mut().clear()?;

    let reopened = NonUniqueBTree::with_options(
        &store,
        TreeOptions {
            leaf_order: Some(16),
            inner_order: Some(16),
            root_page: Some(root),
            ..TreeOptions::default()
        },
    )?;
    for key in 1_000..2_000i64 {
        assert!(reopened.contains(key, 32 + key)?);
    }
    Ok(())
}

#[test]
fn structural_equality_compares_whole_trees() -> Result<()> {
    let (_, store) = memory_store();
    let first = two_layer_tree(&store)?;
    let mut second = two_layer_tree(&store)?;

    // Both fixtures share one store, so one lookup resolves either
    // side's page ids; the shapes are identical even though the ids are
    // not.
    let root_first = first
        .tree()
        .buffer()
        .with_node(first.tree().root_page(), Clone::clone)?;
    let root_second = second
        .tree()
        .buffer()
        .with_node(second.tree().root_page(), Clone::clone)?;
    let lookup = |id: PageId| {
        first
            .tree()
            .buffer()
            .with_node(id, Clone::clone)
            .ok()
            .or_else(|| second.tree().buffer().with_node(id, Clone::clone).ok())
    };
    assert!(node_eq(&root_first, &root_second, &lookup));

    second.insert(9, 9)?;
    let root_second = second
        .tree()
        .buffer()
        .with_node(second.tree().root_page(), Clone::clone)?;
    let lookup = |id: PageId| {
        first
            .tree()
            .buffer()
            .with_node(id, Clone::clone)
            .ok()
            .or_else(|| second.tree().buffer().with_node(id, Clone::clone).ok())
    };
    assert!(!node_eq(&root_first, &root_second, &lookup));
    Ok(())
}

#[test]
fn clear_resets_to_a_fresh_empty_root() -> Result<()> {
    let (_, store) = memory_store();
    let mut tree = unique_tree(&store, 6)?;
    for &(key, value) in &random_unique_entries(200, 3) {
        tree.insert(key, value)?;
    }
    tree.tree_mut().clear()?;
    assert_eq!(tree.tree().size(), 0);
    assert_eq!(tree.tree().min_key(), None);
    assert_eq!(tree.tree().buffer().clean_count(), 0);
    assert_eq!(tree.tree().buffer().dirty_count(), 1);
    tree.insert(1, 1)?;
    assert_eq!(tree.search(1)?, Some(1));
    Ok(())
}

#[test]
fn codec_round_trips_known_arrays() -> Result<()> {
    for array in [
        vec![0i64],
        vec![1, 2, 3],
        vec![5, 13, 17],
        vec![i64::MIN, -1, 0, 1, i64::MAX],
        vec![42; 7],
        (0..1_000).collect::<Vec<_>>(),
    ] {
        let encoded = prefix::encode(&array);
        assert_eq!(prefix::decode(&encoded)?, array);
        let prefix_len = prefix::common_prefix_of(&array);
        assert_eq!(
            encoded.len(),
            prefix::BLOCK_HEADER_LEN + prefix::encoded_size(array.len(), prefix_len)
        );
    }
    Ok(())
}

#[test]
fn codec_prefix_of_equal_bounds_is_sixty_four() {
    assert_eq!(prefix::common_prefix(42, 42), 64);
    assert_eq!(prefix::common_prefix(8, 15), 61);
    assert_eq!(prefix::common_prefix(0, 1), 63);
    // A sign change kills the shared prefix entirely.
    assert_eq!(prefix::common_prefix(-1, 0), 0);
}

#[test]
fn codec_split_index_balances_packed_sizes() {
    // Uniform arrays cut in the middle.
    let keys: Vec<i64> = (100..108).collect();
    assert_eq!(prefix::split_index(&keys), 4);
    // A highly compressible left run shifts the cut to the right.
    let mut keys: Vec<i64> = vec![0, 1, 2, 3, 4, 5];
    keys.extend([i64::MAX - 1, i64::MAX]);
    let cut = prefix::split_index(&keys);
    assert!(cut > 4, "cut {cut} should land past the compressible run");
}

#[test]
fn empty_block_round_trips() -> Result<()> {
    let encoded = prefix::encode(&[]);
    assert_eq!(encoded.len(), prefix::BLOCK_HEADER_LEN);
    assert_eq!(prefix::decode(&encoded)?, Vec::<i64>::new());
    Ok(())
}

#[test]
fn truncated_block_reports_corruption() {
    let encoded = prefix::encode(&[1, 2, 3]);
    let truncated = &encoded[..encoded.len() - 1];
    assert!(matches!(
        prefix::decode(truncated),
        Err(UmbraError::Corruption(_))
    ));
}

proptest! {
    #[test]
    fn codec_round_trips_any_sorted_array(mut values in proptest::collection::vec(any::<i64>(), 1..200)) {
        values.sort_unstable();
        let encoded = prefix::encode(&values);
        prop_assert_eq!(prefix::decode(&encoded).unwrap(), values);
    }

    #[test]
    fn codec_round_trips_unsorted_companion_arrays(values in proptest::collection::vec(any::<i64>(), 1..200)) {
        let encoded = prefix::encode_unsorted(&values);
        prop_assert_eq!(prefix::decode(&encoded).unwrap(), values);
    }

    #[test]
    fn tree_matches_reference_model(ops in proptest::collection::vec((any::<u8>(), 0i64..512, any::<i64>()), 1..300)) {
        let store: Arc<dyn PageStore> = Arc::new(MemoryPageStore::new(PAGE_SIZE));
        let mut tree = unique_tree(&store, 5).unwrap();
        let mut model = BTreeMap::new();
        for (op, key, value) in ops {
            if op % 3 == 0 {
                match model.remove(&key) {
                    Some(expected) => prop_assert_eq!(tree.delete(key).unwrap(), expected),
                    None => prop_assert!(matches!(tree.delete(key), Err(UmbraError::NotFound))),
                }
            } else {
                match model.entry(key) {
                    std::collections::btree_map::Entry::Vacant(slot) => {
                        tree.insert(key, value).unwrap();
                        slot.insert(value);
                    }
                    std::collections::btree_map::Entry::Occupied(_) => {
                        prop_assert!(matches!(tree.insert(key, value), Err(UmbraError::DuplicateKey(_))));
                    }
                }
            }
        }
        prop_assert_eq!(tree.tree().size(), model.len() as u64);
        for (&key, &value) in &model {
            prop_assert_eq!(tree.search(key).unwrap(), Some(value));
        }
        tree.tree().check_structure().unwrap();
        prop_assert_eq!(tree.tree().min_key(), model.keys().next().copied());
        prop_assert_eq!(tree.tree().max_key(), model.keys().next_back().copied());
    }
}
