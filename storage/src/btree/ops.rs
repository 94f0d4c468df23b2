//! Insert, delete and whole-tree walks.
//!
//! Algorithms work on a root-to-leaf path of node copies. Nodes are written
//! back into the cache once their step is done; freed nodes never are.

use std::cmp::Ordering;

use log::debug;

use super::node::{ItemValue, Node, Search};
use super::TreeMeta;
use crate::block::BlockStorage;
use crate::overflow::{Chain, ChainCache};
use crate::store::Space;
use crate::{BlockId, Result, StorageError};

/// Deeper paths can only come from a pointer cycle.
pub(crate) const MAX_HEIGHT: usize = 64;

/// Where an item lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Location {
    pub node: BlockId,
    pub slot: u16,
}

/// One level of a root-to-leaf path. `via` is the parent slot whose child
/// pointer leads here, `None` for the parent's leftmost child (and the root).
#[derive(Clone)]
pub(crate) struct Step {
    pub node: Node,
    pub via: Option<u16>,
}

/// Descends towards `key`, stopping at an exact match or at a leaf.
pub(crate) fn descend<S: BlockStorage>(
    space: &mut Space<S>,
    meta: &TreeMeta,
    key: &[u8],
) -> Result<(Vec<Step>, Search)> {
    let mut path = Vec::new();
    let mut id = meta.root;
    let mut via = None;
    loop {
        if path.len() >= MAX_HEIGHT {
            return Err(StorageError::corrupted(id, "tree deeper than any valid tree"));
        }
        let node = Node::load(space, id, meta.layout)?;
        let search = node.search(key, &meta.cmp)?;
        if search.exact || node.is_leaf() {
            path.push(Step { node, via });
            return Ok((path, search));
        }
        let child = match search.prev {
            Some(slot) => node.child(slot),
            None => node.leftmost(),
        };
        if child == 0 {
            return Err(StorageError::corrupted(id, "internal item without child"));
        }
        path.push(Step { node, via });
        via = search.prev;
        id = child;
    }
}

/// Stored key and location of `key`, if present.
pub(crate) fn find<S: BlockStorage>(
    space: &mut Space<S>,
    meta: &TreeMeta,
    key: &[u8],
) -> Result<Option<(Vec<u8>, Location)>> {
    if key.len() > meta.layout.max_key {
        return Ok(None);
    }
    let (path, search) = descend(space, meta, key)?;
    let step = &path[path.len() - 1];
    Ok(search.next.filter(|_| search.exact).map(|slot| {
        (
            step.node.key(slot).to_vec(),
            Location {
                node: step.node.id,
                slot,
            },
        )
    }))
}

/// Inserts `key` with an empty value. An existing key is left untouched and
/// its location returned.
pub(crate) fn insert<S: BlockStorage>(
    space: &mut Space<S>,
    meta: &mut TreeMeta,
    key: &[u8],
) -> Result<(Vec<u8>, Location)> {
    meta.check_key(key)?;
    let (mut path, search) = descend(space, meta, key)?;
    let level = path.len() - 1;
    if let Some(slot) = search.next.filter(|_| search.exact) {
        let node = &path[level].node;
        return Ok((node.key(slot).to_vec(), Location { node: node.id, slot }));
    }

    let item = meta.layout.encode_item(key, ItemValue::Inline(&[]));
    let loc = insert_at(space, meta, &mut path, level, search.prev, &item, 0)?;
    meta.version += 1;
    Ok((key.to_vec(), loc))
}

/// Puts `item` (with right child `child`) after slot `prev` of the node at
/// `path[level]`, splitting upwards as needed.
fn insert_at<S: BlockStorage>(
    space: &mut Space<S>,
    meta: &mut TreeMeta,
    path: &mut [Step],
    level: usize,
    prev: Option<u16>,
    item: &[u8],
    child: BlockId,
) -> Result<Location> {
    let layout = meta.layout;
    let node = &mut path[level].node;
    if !node.is_full() {
        let slot = node.insert_after(prev, item, child)?;
        node.save(space)?;
        return Ok(Location { node: node.id, slot });
    }

    let order = node.ordered_slots()?;
    let pos = match prev {
        None => 0,
        Some(p) => {
            order
                .iter()
                .position(|&s| s == p)
                .ok_or_else(|| StorageError::corrupted(node.id, "split after unlinked slot"))?
                + 1
        }
    };
    let key = layout.item_key(item);
    let clashes = |s: u16| (meta.cmp)(node.key(s), key) == Ordering::Equal;
    if order.get(pos).is_some_and(|&s| clashes(s)) || (pos > 0 && clashes(order[pos - 1])) {
        return Err(StorageError::DuplicateKey(node.id));
    }

    let mut entries = node.entries()?;
    entries.insert(pos, (item.to_vec(), child));
    let upper = (layout.order() + 1).div_ceil(2);
    let median = entries.len() - upper;

    let sibling_id = space.allocate()?;
    let node = &mut path[level].node;
    let mut sibling = Node::new_empty(sibling_id, layout, entries[median].1);
    let upper_slots = sibling.extend_after(None, &entries[median + 1..])?;
    node.clear();
    let lower_slots = node.extend_after(None, &entries[..median])?;
    node.save(space)?;
    sibling.save(space)?;
    let node_id = node.id;

    let placed = match pos.cmp(&median) {
        Ordering::Less => Some(Location {
            node: node_id,
            slot: lower_slots[pos],
        }),
        Ordering::Greater => Some(Location {
            node: sibling_id,
            slot: upper_slots[pos - median - 1],
        }),
        Ordering::Equal => None,
    };

    let median_item = std::mem::take(&mut entries[median].0);
    let promoted = if level == 0 {
        let root_id = space.allocate()?;
        let mut root = Node::new_empty(root_id, layout, node_id);
        let slot = root.insert_after(None, &median_item, sibling_id)?;
        root.save(space)?;
        meta.set_root(space, root_id)?;
        debug!("btree: root split, tree {} has new root {}", meta.header, root_id);
        Location {
            node: root_id,
            slot,
        }
    } else {
        let via = path[level].via;
        insert_at(space, meta, path, level - 1, via, &median_item, sibling_id)?
    };
    Ok(placed.unwrap_or(promoted))
}

/// Removes `key`, freeing its overflow chain. Returns whether it existed.
pub(crate) fn delete<S: BlockStorage>(
    space: &mut Space<S>,
    meta: &mut TreeMeta,
    chains: &mut ChainCache,
    key: &[u8],
) -> Result<bool> {
    if key.len() > meta.layout.max_key {
        return Ok(false);
    }
    let (mut path, search) = descend(space, meta, key)?;
    let Some(slot) = search.next.filter(|_| search.exact) else {
        return Ok(false);
    };
    let level = path.len() - 1;
    if let ItemValue::Overflow(head) = path[level].node.value(slot) {
        free_chain(space, chains, head)?;
    }

    if path[level].node.is_leaf() {
        path[level].node.unlink(slot, search.prev);
    } else {
        // Replace the separator by the least item of its right subtree
        let mut child = path[level].node.child(slot);
        let mut via = Some(slot);
        loop {
            if path.len() >= MAX_HEIGHT {
                return Err(StorageError::corrupted(child, "tree deeper than any valid tree"));
            }
            let node = Node::load(space, child, meta.layout)?;
            let leaf = node.is_leaf();
            let leftmost = node.leftmost();
            path.push(Step { node, via });
            if leaf {
                break;
            }
            child = leftmost;
            via = None;
        }
        let leaf = path.len() - 1;
        let first = path[leaf]
            .node
            .first()
            .ok_or_else(|| StorageError::corrupted(path[leaf].node.id, "empty non-root leaf"))?;
        let item = path[leaf].node.item(first).to_vec();
        path[level].node.item_mut(slot).copy_from_slice(&item);
        path[leaf].node.unlink(first, None);
    }

    rebalance(space, meta, &mut path)?;
    for step in path.iter_mut() {
        step.node.save(space)?;
    }
    meta.version += 1;
    Ok(true)
}

/// Restores the minimum fill from the bottom of `path` upwards, then
/// collapses an empty internal root.
fn rebalance<S: BlockStorage>(
    space: &mut Space<S>,
    meta: &mut TreeMeta,
    path: &mut [Step],
) -> Result<()> {
    let layout = meta.layout;
    let min = layout.min_items();

    let mut level = path.len() - 1;
    while level > 0 {
        if path[level].node.count() >= min {
            return Ok(());
        }
        let (upper, lower) = path.split_at_mut(level);
        let parent = &mut upper[level - 1].node;
        let via = lower[0].via;
        let node = &mut lower[0].node;

        let left_sep = via;
        let right_sep = match via {
            Some(sep) => parent.next(sep),
            None => parent.first(),
        };

        let mut left = match left_sep {
            Some(sep) => {
                let id = match parent.prev_of(sep)? {
                    Some(p) => parent.child(p),
                    None => parent.leftmost(),
                };
                Some((sep, Node::load(space, id, layout)?))
            }
            None => None,
        };
        if let Some((sep, sibling)) = left.as_mut() {
            if sibling.count() > min {
                rotate_from_left(parent, *sep, sibling, node)?;
                sibling.save(space)?;
                return Ok(());
            }
        }

        let mut right = match right_sep {
            Some(sep) => Some((sep, Node::load(space, parent.child(sep), layout)?)),
            None => None,
        };
        if let Some((sep, sibling)) = right.as_mut() {
            if sibling.count() > min {
                rotate_from_right(parent, *sep, node, sibling)?;
                sibling.save(space)?;
                return Ok(());
            }
        }

        match (left, right) {
            (Some((sep, mut sibling)), _) => {
                let separator = parent.item(sep).to_vec();
                merge_into(&mut sibling, &separator, node)?;
                sibling.save(space)?;
                space.free(node.id)?;
                node.dirty = false;
                let prev = parent.prev_of(sep)?;
                parent.unlink(sep, prev);
            }
            (None, Some((sep, sibling))) => {
                let separator = parent.item(sep).to_vec();
                merge_into(node, &separator, &sibling)?;
                space.free(sibling.id)?;
                parent.unlink(sep, via);
            }
            (None, None) => {
                return Err(StorageError::corrupted(parent.id, "child without siblings"));
            }
        }
        level -= 1;
    }

    let root = &mut path[0].node;
    if root.count() == 0 && !root.is_leaf() {
        let child = root.leftmost();
        space.free(root.id)?;
        root.dirty = false;
        meta.set_root(space, child)?;
        debug!("btree: root collapsed, tree {} has new root {}", meta.header, child);
    }
    Ok(())
}

/// Moves the separator down into `node` and the last item of `left` up.
fn rotate_from_left(parent: &mut Node, sep: u16, left: &mut Node, node: &mut Node) -> Result<()> {
    let last = left
        .last()?
        .ok_or_else(|| StorageError::corrupted(left.id, "lending from an empty node"))?;
    let last_prev = left.prev_of(last)?;
    let separator = parent.item(sep).to_vec();
    let leftmost = node.leftmost();
    node.insert_after(None, &separator, leftmost)?;
    node.set_leftmost(left.child(last));
    parent.item_mut(sep).copy_from_slice(left.item(last));
    left.unlink(last, last_prev);
    Ok(())
}

/// Moves the separator down into `node` and the first item of `right` up.
fn rotate_from_right(parent: &mut Node, sep: u16, node: &mut Node, right: &mut Node) -> Result<()> {
    let first = right
        .first()
        .ok_or_else(|| StorageError::corrupted(right.id, "lending from an empty node"))?;
    let separator = parent.item(sep).to_vec();
    let last = node.last()?;
    node.insert_after(last, &separator, right.leftmost())?;
    let moved = right.child(first);
    right.set_leftmost(moved);
    parent.item_mut(sep).copy_from_slice(right.item(first));
    right.unlink(first, None);
    Ok(())
}

/// Appends the separator and every item of `src` to `dst`.
fn merge_into(dst: &mut Node, separator: &[u8], src: &Node) -> Result<()> {
    let last = dst.last()?;
    let slot = dst.insert_after(last, separator, src.leftmost())?;
    dst.extend_after(Some(slot), &src.entries()?)?;
    Ok(())
}

pub(crate) fn free_chain<S: BlockStorage>(
    space: &mut Space<S>,
    chains: &mut ChainCache,
    head: BlockId,
) -> Result<()> {
    let state = chains.state(head);
    Chain::new(space, state, head).free_all()?;
    chains.forget(head);
    Ok(())
}

/// Visits every node, parents before children.
pub(crate) fn walk<S, F>(space: &mut Space<S>, meta: &TreeMeta, mut f: F) -> Result<()>
where
    S: BlockStorage,
    F: FnMut(&Node) -> Result<()>,
{
    let mut stack = vec![meta.root];
    let mut visited = 0u64;
    while let Some(id) = stack.pop() {
        visited += 1;
        if visited > space.superblock.database_size {
            return Err(StorageError::corrupted(id, "node graph has a cycle"));
        }
        let node = Node::load(space, id, meta.layout)?;
        if !node.is_leaf() {
            stack.push(node.leftmost());
            for slot in node.ordered_slots()? {
                stack.push(node.child(slot));
            }
        }
        f(&node)?;
    }
    Ok(())
}

pub(crate) fn height<S: BlockStorage>(space: &mut Space<S>, meta: &TreeMeta) -> Result<usize> {
    let mut height = 1;
    let mut node = Node::load(space, meta.root, meta.layout)?;
    while !node.is_leaf() {
        if height >= MAX_HEIGHT {
            return Err(StorageError::corrupted(node.id, "tree deeper than any valid tree"));
        }
        node = Node::load(space, node.leftmost(), meta.layout)?;
        height += 1;
    }
    Ok(height)
}

/// Frees every node but the root and every overflow chain; the root becomes
/// an empty leaf.
pub(crate) fn clear<S: BlockStorage>(
    space: &mut Space<S>,
    meta: &mut TreeMeta,
    chains: &mut ChainCache,
) -> Result<()> {
    let root = meta.root;
    let mut nodes = Vec::new();
    let mut heads = Vec::new();
    walk(space, meta, |node| {
        if node.id != root {
            nodes.push(node.id);
        }
        for slot in node.ordered_slots()? {
            if let ItemValue::Overflow(head) = node.value(slot) {
                heads.push(head);
            }
        }
        Ok(())
    })?;

    for head in heads {
        free_chain(space, chains, head)?;
    }
    for id in &nodes {
        space.free(*id)?;
    }
    Node::new_empty(root, meta.layout, 0).save(space)?;
    meta.version += 1;
    meta.lease = None;
    debug!("btree: cleared tree {} ({} nodes freed)", meta.header, nodes.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemoryBlockStorage;
    use crate::btree::checked_len;
    use crate::config::{StoreConfig, TreeOptions};
    use crate::store::Store;

    // 256-byte blocks with 8-byte keys: 8 slots per node, order 9
    fn create_test_tree() -> crate::btree::BTree<MemoryBlockStorage> {
        let config = StoreConfig::default()
            .with_block_size(256)
            .with_cache_blocks(16)
            .with_grow_blocks(32);
        let store = Store::create(MemoryBlockStorage::new(256), config).unwrap();
        store.create_tree(TreeOptions::new(8)).unwrap()
    }

    #[test]
    fn test_first_split_grows_height() {
        let tree = create_test_tree();
        assert_eq!(tree.order().unwrap(), 9);
        for i in 0u8..8 {
            tree.insert(&[i]).unwrap();
        }
        assert_eq!(tree.height().unwrap(), 1);
        tree.insert(&[8]).unwrap();
        assert_eq!(tree.height().unwrap(), 2);
        assert_eq!(checked_len(&tree).unwrap(), 9);
    }

    #[test]
    fn test_split_returns_location_of_new_key() {
        // A full leaf of even keys; 1 stays left, 7 becomes the median,
        // 9 and 15 move to the new sibling
        for k in [1u8, 7, 9, 15] {
            let tree = create_test_tree();
            for i in (0u8..16).step_by(2) {
                tree.put(&[i], &[i]).unwrap();
            }
            let mut entry = tree.insert(&[k]).unwrap();
            assert_eq!(entry.key(), &[k]);
            entry.write_value(&[k, k]).unwrap();
            assert_eq!(tree.height().unwrap(), 2);
            assert_eq!(tree.get(&[k]).unwrap().unwrap().as_ref(), &[k, k]);
            checked_len(&tree).unwrap();
        }
    }

    #[test]
    fn test_delete_internal_key() {
        let tree = create_test_tree();
        for i in 0u8..40 {
            tree.put(&[i], &[i]).unwrap();
        }
        let root_keys: Vec<u8> = tree
            .with_meta(|space, meta, _| {
                let root = Node::load(space, meta.root, meta.layout)?;
                Ok(root
                    .ordered_slots()?
                    .into_iter()
                    .map(|s| root.key(s)[0])
                    .collect())
            })
            .unwrap();
        assert!(!root_keys.is_empty());

        let removed = root_keys.len();
        for k in root_keys {
            assert!(tree.delete(&[k]).unwrap());
            assert!(tree.find(&[k]).unwrap().is_none());
            checked_len(&tree).unwrap();
        }
        assert_eq!(tree.len().unwrap(), 40 - removed);
    }

    #[test]
    fn test_delete_in_reverse_order_rebalances() {
        let tree = create_test_tree();
        for i in 0u8..200 {
            tree.insert(&[i]).unwrap();
        }
        for i in (0u8..200).rev() {
            assert!(tree.delete(&[i]).unwrap());
            if i % 17 == 0 {
                assert_eq!(checked_len(&tree).unwrap(), i as usize);
            }
        }
        assert!(tree.is_empty().unwrap());
    }

    #[test]
    fn test_delete_frees_overflow_chain() {
        let tree = create_test_tree();
        let store = tree.store().clone();
        tree.insert(b"small").unwrap();
        let before = store.allocated_block_count();
        tree.put(b"big", &[9u8; 2000]).unwrap();
        assert!(store.allocated_block_count() > before);
        assert!(tree.delete(b"big").unwrap());
        assert_eq!(store.allocated_block_count(), before);
    }

    #[test]
    fn test_version_bumps_on_structure_changes_only() {
        let tree = create_test_tree();
        let v0 = tree.version().unwrap();
        tree.insert(b"a").unwrap();
        let v1 = tree.version().unwrap();
        assert!(v1 > v0);
        tree.insert(b"a").unwrap().write_value(b"x").unwrap();
        assert_eq!(tree.version().unwrap(), v1);
        tree.delete(b"a").unwrap();
        assert!(tree.version().unwrap() > v1);
    }
}
