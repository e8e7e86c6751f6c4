//! End-to-end exercise of the index layer against one shared page store:
//! build, flush, and reopen trees through fresh buffer managers.

use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use umbra_index::index::btree::{NonUniqueBTree, TreeOptions, UniqueBTree};
use umbra_index::index::pos::{PositionIndex, NO_CONTINUATION};
use umbra_index::store::{MemoryPageStore, PageStore};
use umbra_index::types::Result;

fn entries(count: usize, seed: u64) -> Vec<(i64, i64)> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::with_capacity(count);
    while out.len() < count {
        let key = rng.gen_range(0..(1i64 << 40));
        if seen.insert(key) {
            out.push((key, rng.gen_range(0..(1i64 << 40))));
        }
    }
    out
}

#[test]
fn unique_index_round_trips_through_the_store() -> Result<()> {
    let store: Arc<dyn PageStore> = Arc::new(MemoryPageStore::new(4096));
    let mut tree = UniqueBTree::create(&store)?;
    let mut data = entries(5_000, 1);
    for &(key, value) in &data {
        tree.insert(key, value)?;
    }
    tree.tree().check_structure()?;
    let root = tree.tree_mut().flush()?;
    assert_eq!(tree.tree().buffer().dirty_count(), 0);

    // A second session over the same store sees every entry.
    let reopened = UniqueBTree::with_options(
        &store,
        TreeOptions {
            root_page: Some(root),
            ..TreeOptions::default()
        },
    )?;
    for &(key, value) in &data {
        assert_eq!(reopened.search(key)?, Some(value));
    }

    // Ordered iteration in both directions over the reopened tree.
    data.sort_unstable();
    let mut forward = Vec::new();
    let mut iter = reopened.tree().iter_ascending()?;
    while let Some(entry) = iter.next()? {
        forward.push(entry);
    }
    assert_eq!(forward, data);
    let mut backward = Vec::new();
    let mut iter = reopened.tree().iter_descending()?;
    while let Some(entry) = iter.next()? {
        backward.push(entry);
    }
    backward.reverse();
    assert_eq!(backward, data);

    // Delete a random subset in the first session, flush, reopen again.
    let mut rng = ChaCha8Rng::seed_from_u64(2);
    data.shuffle(&mut rng);
    let (gone, kept) = data.split_at(3_000);
    for &(key, _) in gone {
        tree.delete(key)?;
    }
    let root = tree.tree_mut().flush()?;
    let survivors = UniqueBTree::with_options(
        &store,
        TreeOptions {
            root_page: Some(root),
            ..TreeOptions::default()
        },
    )?;
    assert_eq!(survivors.tree().size(), kept.len() as u64);
    for &(key, value) in kept {
        assert_eq!(survivors.search(key)?, Some(value));
    }
    for &(key, _) in gone {
        assert_eq!(survivors.search(key)?, None);
    }
    survivors.tree().check_structure()?;
    Ok(())
}

#[test]
fn unique_and_position_indexes_share_one_store() -> Result<()> {
    let store: Arc<dyn PageStore> = Arc::new(MemoryPageStore::new(4096));
    let mut tree = NonUniqueBTree::create(&store)?;
    let mut positions = PositionIndex::create(&store)?;

    for key in 0..2_000i64 {
        tree.insert(key % 100, key)?;
    }
    for page in 1..500u32 {
        positions.add_position(page, 16 * page, NO_CONTINUATION)?;
    }
    let tree_root = tree.tree_mut().flush()?;
    let pos_root = positions.write()?;
    assert_ne!(tree_root, pos_root);

    let tree2 = NonUniqueBTree::with_options(
        &store,
        TreeOptions {
            root_page: Some(tree_root),
            ..TreeOptions::default()
        },
    )?;
    for key in 0..2_000i64 {
        assert!(tree2.contains(key % 100, key)?);
    }
    let pos2 = PositionIndex::open(&store, pos_root)?;
    assert_eq!(pos2.size(), 499);
    Ok(())
}
