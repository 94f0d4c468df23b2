//! Exhaustive structural check, compiled into debug builds only.

use std::cmp::Ordering;
use std::collections::HashSet;

use super::node::{ItemValue, Node};
use super::TreeMeta;
use crate::block::BlockStorage;
use crate::overflow::{Chain, ChainCache};
use crate::store::Space;
use crate::{BlockId, Result, StorageError};

struct Pending {
    id: BlockId,
    depth: usize,
    /// Exclusive key bounds inherited from the ancestors.
    low: Option<Vec<u8>>,
    high: Option<Vec<u8>>,
}

fn claim<S: BlockStorage>(space: &mut Space<S>, seen: &mut HashSet<BlockId>, id: BlockId) -> Result<()> {
    if !seen.insert(id) {
        return Err(StorageError::corrupted(id, "block referenced twice"));
    }
    if !space.is_allocated(id)? {
        return Err(StorageError::corrupted(id, "reachable block is marked free"));
    }
    Ok(())
}

/// Checks key order and bounds, minimum fill, uniform leaf depth, overflow
/// chain links, and that every reachable block is allocated exactly once.
/// Returns the number of keys.
pub(crate) fn check_tree<S: BlockStorage>(
    space: &mut Space<S>,
    meta: &TreeMeta,
    chains: &mut ChainCache,
) -> Result<usize> {
    let layout = meta.layout;
    let cmp = &meta.cmp;
    let mut seen = HashSet::new();
    claim(space, &mut seen, meta.header)?;

    let mut leaf_depth = None;
    let mut count = 0;
    let mut stack = vec![Pending {
        id: meta.root,
        depth: 1,
        low: None,
        high: None,
    }];

    while let Some(Pending {
        id,
        depth,
        low,
        high,
    }) = stack.pop()
    {
        claim(space, &mut seen, id)?;
        let node = Node::load(space, id, layout)?;
        let slots = node.ordered_slots()?;

        if id != meta.root && slots.len() < layout.min_items() {
            return Err(StorageError::corrupted(
                id,
                format!("{} items, minimum is {}", slots.len(), layout.min_items()),
            ));
        }

        let mut prev: Option<&[u8]> = low.as_deref();
        for &slot in &slots {
            let key = node.key(slot);
            if key.len() > layout.max_key {
                return Err(StorageError::corrupted(id, "key longer than the maximum"));
            }
            if prev.is_some_and(|p| cmp(p, key) != Ordering::Less) {
                return Err(StorageError::corrupted(id, format!("key out of order at slot {}", slot)));
            }
            prev = Some(key);
            if let ItemValue::Overflow(head) = node.value(slot) {
                let blocks = Chain::new(space, chains.state(head), head).block_ids()?;
                for block in blocks {
                    claim(space, &mut seen, block)?;
                }
            }
        }
        if let (Some(p), Some(h)) = (prev, high.as_deref()) {
            if cmp(p, h) != Ordering::Less {
                return Err(StorageError::corrupted(id, "key beyond the parent bound"));
            }
        }
        count += slots.len();

        if node.is_leaf() {
            if slots.iter().any(|&s| node.child(s) != 0) {
                return Err(StorageError::corrupted(id, "leaf item with a child"));
            }
            match leaf_depth {
                None => leaf_depth = Some(depth),
                Some(d) if d != depth => {
                    return Err(StorageError::corrupted(
                        id,
                        format!("leaf at depth {}, others at {}", depth, d),
                    ));
                }
                Some(_) => {}
            }
            continue;
        }

        if slots.is_empty() {
            return Err(StorageError::corrupted(id, "internal node without items"));
        }
        let keys: Vec<Vec<u8>> = slots.iter().map(|&s| node.key(s).to_vec()).collect();
        stack.push(Pending {
            id: node.leftmost(),
            depth: depth + 1,
            low: low.clone(),
            high: keys.first().cloned(),
        });
        for (i, &slot) in slots.iter().enumerate() {
            let child = node.child(slot);
            if child == 0 {
                return Err(StorageError::corrupted(id, format!("slot {} has no child", slot)));
            }
            stack.push(Pending {
                id: child,
                depth: depth + 1,
                low: Some(keys[i].clone()),
                high: keys.get(i + 1).cloned().or_else(|| high.clone()),
            });
        }
    }
    Ok(count)
}
