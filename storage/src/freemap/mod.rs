//! Hierarchical bitmap allocator for block ids.
//!
//! The freemap is a tree of blocks living in the same storage it manages.
//! A leaf is a plain bitmap, one bit per block id, `1` meaning free. An
//! internal node is an array of `u64` child pointers whose top bit flags the
//! child subtree as fully allocated, so allocation skips full subtrees
//! without loading them. A pointer of `FULL | 0` marks an absent subtree
//! lying entirely beyond the database end.
//!
//! The tree covers ids `0..database_size`. Its depth is the smallest one
//! whose span reaches the database size; growing past it adds levels at the
//! root. Node blocks created by growth are carved out of the freshly added
//! id range itself.

use log::debug;

use crate::block::BlockStorage;
use crate::bytes_le::{put_u64, u64_at};
use crate::pager::Pager;
use crate::superblock::{Superblock, SUPERBLOCK_ID};
use crate::{BlockId, Result, StorageError};

const FULL: u64 = 1 << 63;
const PTR_MASK: u64 = !FULL;

/// Upper bound on growth retries before giving up on a plan.
const MAX_GROWTH_ROUNDS: u64 = 64;

#[derive(Debug)]
pub struct Freemap {
    block_size: usize,
    grow_blocks: u64,
    depth: usize,
    /// Last selected child (internal levels) or bitmap word (leaf level),
    /// indexed from the root down.
    cursor: Vec<usize>,
}

impl Freemap {
    /// Formats a brand-new freemap: block 0 and the root leaf at block 1 are
    /// in use, everything up to the first growth increment is free.
    pub fn create<S: BlockStorage>(
        pager: &mut Pager<S>,
        sb: &mut Superblock,
        grow_blocks: u64,
    ) -> Result<Self> {
        let mut freemap = Self {
            block_size: pager.block_size(),
            grow_blocks,
            depth: 1,
            cursor: vec![0],
        };

        pager.set_num_blocks(2)?;
        sb.freemap_root = 1;
        sb.database_size = 2;
        sb.allocated_blocks = 0;
        pager.pin_erased(1)?;

        freemap.grow(pager, sb)?;
        Ok(freemap)
    }

    /// Attaches to the freemap described by an existing superblock.
    pub fn open(block_size: usize, grow_blocks: u64, sb: &Superblock) -> Self {
        let mut freemap = Self {
            block_size,
            grow_blocks,
            depth: 1,
            cursor: Vec::new(),
        };
        freemap.depth = freemap.depth_for(sb.database_size);
        freemap.cursor = vec![0; freemap.depth];
        freemap
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    fn leaf_bits(&self) -> u64 {
        self.block_size as u64 * 8
    }

    fn fanout(&self) -> usize {
        self.block_size / 8
    }

    fn words(&self) -> usize {
        self.block_size / 8
    }

    /// Ids covered by one node `level` steps above the leaves.
    fn span(&self, level: usize) -> u64 {
        let mut span = self.leaf_bits();
        for _ in 0..level {
            span = span.saturating_mul(self.fanout() as u64);
        }
        span
    }

    fn depth_for(&self, size: u64) -> usize {
        let mut depth = 1;
        while self.span(depth - 1) < size {
            depth += 1;
        }
        depth
    }

    /// Total nodes needed to cover `size` ids with a tree of `depth` levels.
    fn node_count(&self, depth: usize, size: u64) -> u64 {
        (0..depth).map(|level| size.div_ceil(self.span(level))).sum()
    }

    /// Hands out a free block id, growing the database once if none is left.
    pub fn allocate<S: BlockStorage>(
        &mut self,
        pager: &mut Pager<S>,
        sb: &mut Superblock,
    ) -> Result<BlockId> {
        for attempt in 0..2 {
            if let Some(id) = self.try_allocate(pager, sb)? {
                sb.allocated_blocks += 1;
                return Ok(id);
            }
            if attempt == 0 {
                self.grow(pager, sb)?;
            }
        }
        Err(StorageError::AllocationExhausted {
            size: sb.database_size,
        })
    }

    fn try_allocate<S: BlockStorage>(
        &mut self,
        pager: &mut Pager<S>,
        sb: &Superblock,
    ) -> Result<Option<BlockId>> {
        self.cursor.resize(self.depth, 0);
        let fanout = self.fanout();
        let mut path: Vec<(BlockId, usize)> = Vec::with_capacity(self.depth);
        let mut node = sb.freemap_root;
        let mut base = 0u64;

        for lvl in 0..self.depth - 1 {
            let page = pager.pin(node)?;
            let start = self.cursor[lvl];
            let pick = (0..fanout).map(|i| (start + i) % fanout).find(|&i| {
                let ptr = u64_at(&page, i * 8);
                ptr & FULL == 0 && ptr & PTR_MASK != 0
            });
            let Some(i) = pick else {
                if lvl == 0 {
                    return Ok(None);
                }
                return Err(StorageError::corrupted(
                    node,
                    "freemap node has no free child although its parent says so",
                ));
            };
            let child = u64_at(&page, i * 8) & PTR_MASK;
            drop(page);

            self.cursor[lvl] = i;
            path.push((node, i));
            base += i as u64 * self.span(self.depth - 2 - lvl);
            node = child;
        }

        let leaf_level = self.depth - 1;
        let words = self.words();
        let mut page = pager.pin(node)?;
        let start = self.cursor[leaf_level].min(words - 1);
        let Some(word) = (0..words)
            .map(|i| (start + i) % words)
            .find(|&i| u64_at(&page, i * 8) != 0)
        else {
            if self.depth == 1 {
                return Ok(None);
            }
            return Err(StorageError::corrupted(
                node,
                "freemap leaf has no free bit although its parent says so",
            ));
        };

        let bits = u64_at(&page, word * 8);
        let bit = bits.trailing_zeros() as u64;
        let id = base + word as u64 * 64 + bit;
        if id == SUPERBLOCK_ID || id >= sb.database_size {
            return Err(StorageError::corrupted(
                node,
                format!("free bit for block {} outside the database", id),
            ));
        }
        put_u64(page.data_mut(), word * 8, bits & !(1u64 << bit));
        let leaf_full = (0..words).all(|i| u64_at(&page, i * 8) == 0);
        drop(page);
        self.cursor[leaf_level] = word;

        if leaf_full {
            for &(parent, idx) in path.iter().rev() {
                let mut page = pager.pin(parent)?;
                let ptr = u64_at(&page, idx * 8);
                put_u64(page.data_mut(), idx * 8, ptr | FULL);
                let all_full = (0..fanout).all(|i| u64_at(&page, i * 8) & FULL != 0);
                if !all_full {
                    break;
                }
            }
        }
        Ok(Some(id))
    }

    /// Returns block `id` to the free pool.
    pub fn deallocate<S: BlockStorage>(
        &mut self,
        pager: &mut Pager<S>,
        sb: &mut Superblock,
        id: BlockId,
    ) -> Result<()> {
        if id == SUPERBLOCK_ID || id >= sb.database_size {
            return Err(StorageError::corrupted(
                id,
                format!("cannot free block outside 1..{}", sb.database_size),
            ));
        }
        let (path, leaf, bit) = self.locate(pager, sb, id)?;

        let words = self.words();
        let mut page = pager.pin(leaf)?;
        let word = (bit / 64) as usize;
        let mask = 1u64 << (bit % 64);
        let bits = u64_at(&page, word * 8);
        if bits & mask != 0 {
            return Err(StorageError::corrupted(id, "block freed twice"));
        }
        let was_full = (0..words).all(|i| u64_at(&page, i * 8) == 0);
        put_u64(page.data_mut(), word * 8, bits | mask);
        drop(page);

        sb.allocated_blocks = sb
            .allocated_blocks
            .checked_sub(1)
            .ok_or_else(|| StorageError::corrupted(SUPERBLOCK_ID, "allocated count underflow"))?;

        if was_full {
            let fanout = self.fanout();
            for &(parent, idx) in path.iter().rev() {
                let mut page = pager.pin(parent)?;
                let parent_was_full = (0..fanout).all(|i| u64_at(&page, i * 8) & FULL != 0);
                let ptr = u64_at(&page, idx * 8);
                put_u64(page.data_mut(), idx * 8, ptr & PTR_MASK);
                if !parent_was_full {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Whether block `id` is currently free.
    pub fn is_free<S: BlockStorage>(
        &self,
        pager: &mut Pager<S>,
        sb: &Superblock,
        id: BlockId,
    ) -> Result<bool> {
        if id >= sb.database_size {
            return Ok(false);
        }
        let (_, leaf, bit) = self.locate(pager, sb, id)?;
        let page = pager.pin(leaf)?;
        Ok(u64_at(&page, (bit / 64) as usize * 8) & (1u64 << (bit % 64)) != 0)
    }

    /// Internal path `(node, child index)` from the root, the leaf block and
    /// the bit index of `id` inside it.
    fn locate<S: BlockStorage>(
        &self,
        pager: &mut Pager<S>,
        sb: &Superblock,
        id: BlockId,
    ) -> Result<(Vec<(BlockId, usize)>, BlockId, u64)> {
        let mut path = Vec::with_capacity(self.depth);
        let mut node = sb.freemap_root;
        for level in (1..self.depth).rev() {
            let idx = ((id % self.span(level)) / self.span(level - 1)) as usize;
            let page = pager.pin(node)?;
            let child = u64_at(&page, idx * 8) & PTR_MASK;
            if child == 0 {
                return Err(StorageError::corrupted(
                    node,
                    format!("no freemap subtree covers block {}", id),
                ));
            }
            path.push((node, idx));
            node = child;
        }
        Ok((path, node, id % self.leaf_bits()))
    }

    /// Extends the database by at least one growth increment, adding root
    /// levels and node blocks as needed.
    fn grow<S: BlockStorage>(&mut self, pager: &mut Pager<S>, sb: &mut Superblock) -> Result<()> {
        let old = sb.database_size;
        let existing = self.node_count(self.depth, old);

        // The new nodes live inside the new range, which in turn may need
        // more nodes. Widen until at least one block is left over.
        let mut new = old + self.grow_blocks;
        let mut needed;
        let mut rounds = 0;
        loop {
            needed = self.node_count(self.depth_for(new).max(self.depth), new) - existing;
            if needed < new - old {
                break;
            }
            rounds += 1;
            if rounds > MAX_GROWTH_ROUNDS {
                return Err(StorageError::AllocationExhausted { size: new });
            }
            new += self.grow_blocks;
        }

        debug!(
            "freemap: growing database {} -> {} blocks ({} new freemap nodes)",
            old, new, needed
        );
        pager.set_num_blocks(new)?;
        let mut meta = old..old + needed;

        let target_depth = self.depth_for(new).max(self.depth);
        while self.depth < target_depth {
            let old_root_full = self.is_node_full(pager, sb.freemap_root, self.depth == 1)?;
            let id = next_meta(&mut meta)?;
            let mut page = pager.pin_erased(id)?;
            let data = page.data_mut();
            for i in 0..self.fanout() {
                put_u64(data, i * 8, FULL);
            }
            let flag = if old_root_full { FULL } else { 0 };
            put_u64(data, 0, sb.freemap_root | flag);
            drop(page);

            debug!("freemap: new root level {} at block {}", self.depth + 1, id);
            sb.freemap_root = id;
            self.depth += 1;
        }
        self.cursor = vec![0; self.depth];

        let leaf_bits = self.leaf_bits();
        let first_leaf = old / leaf_bits;
        let last_leaf = (new - 1) / leaf_bits;
        for leaf_index in first_leaf..=last_leaf {
            let leaf = self.ensure_leaf(pager, sb, leaf_index * leaf_bits, &mut meta)?;
            let lo = old.max(leaf_index * leaf_bits) - leaf_index * leaf_bits;
            let hi = new.min((leaf_index + 1) * leaf_bits) - leaf_index * leaf_bits;
            let mut page = pager.pin(leaf)?;
            let data = page.data_mut();
            for bit in lo..hi {
                data[(bit / 8) as usize] |= 1 << (bit % 8);
            }
        }

        sb.database_size = new;
        for id in old..meta.start {
            let (_, leaf, bit) = self.locate(pager, sb, id)?;
            let mut page = pager.pin(leaf)?;
            page.data_mut()[(bit / 8) as usize] &= !(1 << (bit % 8));
        }
        for leaf_index in first_leaf..=last_leaf {
            self.refresh_flags(pager, sb, leaf_index * leaf_bits)?;
        }
        Ok(())
    }

    /// Walks down to the leaf covering `id`, creating absent nodes from the
    /// `meta` id range.
    fn ensure_leaf<S: BlockStorage>(
        &self,
        pager: &mut Pager<S>,
        sb: &Superblock,
        id: BlockId,
        meta: &mut std::ops::Range<BlockId>,
    ) -> Result<BlockId> {
        let mut node = sb.freemap_root;
        for level in (1..self.depth).rev() {
            let idx = ((id % self.span(level)) / self.span(level - 1)) as usize;
            let ptr = u64_at(&pager.pin(node)?, idx * 8);
            let mut child = ptr & PTR_MASK;
            if child == 0 {
                child = next_meta(meta)?;
                let mut page = pager.pin_erased(child)?;
                if level > 1 {
                    let data = page.data_mut();
                    for i in 0..self.fanout() {
                        put_u64(data, i * 8, FULL);
                    }
                }
                drop(page);
                put_u64(pager.pin(node)?.data_mut(), idx * 8, child | FULL);
            }
            node = child;
        }
        Ok(node)
    }

    /// Recomputes the full flags on the path from the leaf covering `id` up
    /// to the root.
    fn refresh_flags<S: BlockStorage>(
        &self,
        pager: &mut Pager<S>,
        sb: &Superblock,
        id: BlockId,
    ) -> Result<()> {
        let (path, leaf, _) = self.locate(pager, sb, id)?;
        let mut full = self.is_node_full(pager, leaf, true)?;
        for &(parent, idx) in path.iter().rev() {
            let mut page = pager.pin(parent)?;
            let ptr = u64_at(&page, idx * 8);
            let want = if full { ptr | FULL } else { ptr & PTR_MASK };
            if want != ptr {
                put_u64(page.data_mut(), idx * 8, want);
            }
            drop(page);
            full = self.is_node_full(pager, parent, false)?;
        }
        Ok(())
    }

    fn is_node_full<S: BlockStorage>(
        &self,
        pager: &mut Pager<S>,
        node: BlockId,
        leaf: bool,
    ) -> Result<bool> {
        let page = pager.pin(node)?;
        let full = if leaf {
            (0..self.words()).all(|i| u64_at(&page, i * 8) == 0)
        } else {
            (0..self.fanout()).all(|i| u64_at(&page, i * 8) & FULL != 0)
        };
        Ok(full)
    }
}

fn next_meta(meta: &mut std::ops::Range<BlockId>) -> Result<BlockId> {
    meta.next().ok_or_else(|| {
        StorageError::corrupted(SUPERBLOCK_ID, "freemap growth needed more nodes than planned")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemoryBlockStorage;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn setup(block_size: usize, grow: u64) -> (Pager<MemoryBlockStorage>, Superblock, Freemap) {
        let mut pager = Pager::new(MemoryBlockStorage::new(block_size), 16);
        let mut sb = Superblock::new(block_size);
        let freemap = Freemap::create(&mut pager, &mut sb, grow).unwrap();
        (pager, sb, freemap)
    }

    #[test]
    fn test_create_reserves_superblock_and_root() {
        let (mut pager, sb, freemap) = setup(64, 16);
        assert_eq!(freemap.depth(), 1);
        assert_eq!(sb.database_size, 18);
        assert!(!freemap.is_free(&mut pager, &sb, 0).unwrap());
        assert!(!freemap.is_free(&mut pager, &sb, 1).unwrap());
        assert!(freemap.is_free(&mut pager, &sb, 2).unwrap());
        assert!(freemap.is_free(&mut pager, &sb, 17).unwrap());
    }

    #[test]
    fn test_allocate_sequential_and_free() {
        let (mut pager, mut sb, mut freemap) = setup(64, 16);
        let a = freemap.allocate(&mut pager, &mut sb).unwrap();
        let b = freemap.allocate(&mut pager, &mut sb).unwrap();
        assert_eq!((a, b), (2, 3));
        assert_eq!(sb.allocated_blocks, 2);

        freemap.deallocate(&mut pager, &mut sb, a).unwrap();
        assert_eq!(sb.allocated_blocks, 1);
        assert!(freemap.is_free(&mut pager, &sb, a).unwrap());
    }

    #[test]
    fn test_double_free_is_corruption() {
        let (mut pager, mut sb, mut freemap) = setup(64, 16);
        let a = freemap.allocate(&mut pager, &mut sb).unwrap();
        freemap.deallocate(&mut pager, &mut sb, a).unwrap();
        let err = freemap.deallocate(&mut pager, &mut sb, a).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Corruption);
        assert!(freemap.deallocate(&mut pager, &mut sb, 0).is_err());
        assert!(freemap.deallocate(&mut pager, &mut sb, 10_000).is_err());
    }

    #[test]
    fn test_growth_adds_levels() {
        // 64-byte blocks: a leaf covers 512 ids, internal fan-out is 8
        let (mut pager, mut sb, mut freemap) = setup(64, 64);
        let mut seen = HashSet::new();
        for _ in 0..5000 {
            let id = freemap.allocate(&mut pager, &mut sb).unwrap();
            assert!(id < sb.database_size);
            assert!(seen.insert(id), "block {} handed out twice", id);
        }
        assert_eq!(freemap.depth(), 3);
        assert_eq!(sb.allocated_blocks, 5000);
        assert_eq!(pager.num_blocks(), sb.database_size);
    }

    #[test]
    fn test_full_subtree_reopens_after_free() {
        let (mut pager, mut sb, mut freemap) = setup(64, 64);
        let ids: Vec<_> = (0..1200)
            .map(|_| freemap.allocate(&mut pager, &mut sb).unwrap())
            .collect();
        // Release one block from the first (now full) leaf
        freemap.deallocate(&mut pager, &mut sb, ids[10]).unwrap();
        let size = sb.database_size;
        let mut reused = false;
        for _ in 0..(size - 1200) {
            if freemap.allocate(&mut pager, &mut sb).unwrap() == ids[10] {
                reused = true;
                break;
            }
        }
        assert!(reused);
    }

    #[test]
    fn test_reopen_keeps_state() {
        let (mut pager, mut sb, mut freemap) = setup(128, 32);
        for _ in 0..100 {
            freemap.allocate(&mut pager, &mut sb).unwrap();
        }
        let mut reopened = Freemap::open(128, 32, &sb);
        assert_eq!(reopened.depth(), freemap.depth());
        let id = reopened.allocate(&mut pager, &mut sb).unwrap();
        assert!(id >= 102);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(12))]

        #[test]
        fn test_growth_across_geometries(
            block_size in prop::sample::select(vec![64usize, 128, 256]),
            grow in 2u64..=300,
        ) {
            let (mut pager, mut sb, mut freemap) = setup(block_size, grow);
            prop_assert_eq!(freemap.depth(), 1);

            // Depth 3 needs more ids than one level-1 node spans
            let limit = freemap.span(1) * 2;
            let mut seen = HashSet::new();
            let mut depths = vec![1];
            while freemap.depth() < 3 {
                prop_assert!((seen.len() as u64) < limit, "no third level after {} blocks", limit);
                let id = freemap.allocate(&mut pager, &mut sb)?;
                prop_assert!(id > 1 && id < sb.database_size);
                prop_assert!(seen.insert(id), "block {} handed out twice", id);
                prop_assert_eq!(pager.num_blocks(), sb.database_size);
                if depths.last() != Some(&freemap.depth()) {
                    depths.push(freemap.depth());
                }
            }

            prop_assert_eq!(depths, vec![1, 2, 3]);
            prop_assert_eq!(sb.allocated_blocks, seen.len() as u64);
            // Everything handed out is still marked in use after the new levels
            for &id in seen.iter().step_by(97) {
                prop_assert!(!freemap.is_free(&mut pager, &sb, id)?);
            }
        }
    }
}
