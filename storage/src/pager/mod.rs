//! Block cache with pin counting and deterministic write-back.
//!
//! Cached pages live in a fixed set of frames. A frame is either free, pinned
//! (pin count > 0) or sitting in the unpinned LRU list, most recently used
//! first. A miss takes a free frame or evicts the LRU tail, writing it back
//! first when dirty. Pinned frames are never in the LRU list, so they can
//! never be chosen for eviction.

use std::collections::HashMap;
use std::ops::Deref;

use log::trace;

use crate::block::BlockStorage;
use crate::{BlockId, Result, StorageError};

type FrameId = usize;

struct Frame {
    block: Option<BlockId>,
    data: Box<[u8]>,
    pin_count: u32,
    dirty: bool,
    /// Neighbour closer to the MRU end.
    prev: Option<FrameId>,
    /// Neighbour closer to the LRU end.
    next: Option<FrameId>,
}

/// Counters describing the cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PagerStats {
    pub capacity: usize,
    pub cached: usize,
    pub pinned: usize,
    pub dirty: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub writes: u64,
}

pub struct Pager<S: BlockStorage> {
    storage: S,
    block_size: usize,
    frames: Vec<Frame>,
    table: HashMap<BlockId, FrameId>,
    free: Vec<FrameId>,
    lru_head: Option<FrameId>,
    lru_tail: Option<FrameId>,
    hits: u64,
    misses: u64,
    evictions: u64,
    writes: u64,
}

impl<S: BlockStorage> Pager<S> {
    pub fn new(storage: S, capacity: usize) -> Self {
        let block_size = storage.block_size();
        let frames = (0..capacity)
            .map(|_| Frame {
                block: None,
                data: vec![0u8; block_size].into_boxed_slice(),
                pin_count: 0,
                dirty: false,
                prev: None,
                next: None,
            })
            .collect();

        Self {
            storage,
            block_size,
            frames,
            table: HashMap::with_capacity(capacity),
            // Popped from the back, so frame 0 is handed out first
            free: (0..capacity).rev().collect(),
            lru_head: None,
            lru_tail: None,
            hits: 0,
            misses: 0,
            evictions: 0,
            writes: 0,
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    pub fn num_blocks(&self) -> u64 {
        self.storage.num_blocks()
    }

    /// Resizes the underlying storage. Cached pages beyond the new end are
    /// dropped without write-back.
    pub fn set_num_blocks(&mut self, num_blocks: u64) -> Result<()> {
        let doomed: Vec<BlockId> = self
            .table
            .keys()
            .copied()
            .filter(|&id| id >= num_blocks)
            .collect();
        for id in doomed {
            let frame = self.table[&id];
            if self.frames[frame].pin_count > 0 {
                panic!("pager: truncating pinned block {}", id);
            }
            self.evict_frame(frame);
        }
        self.storage.set_num_blocks(num_blocks)
    }

    pub fn is_cached(&self, id: BlockId) -> bool {
        self.table.contains_key(&id)
    }

    pub fn pin_count(&self, id: BlockId) -> u32 {
        self.table
            .get(&id)
            .map(|&f| self.frames[f].pin_count)
            .unwrap_or(0)
    }

    /// Pins block `id`, loading it from storage on a miss.
    pub fn pin(&mut self, id: BlockId) -> Result<PageGuard<'_, S>> {
        let frame = self.acquire(id, false)?;
        Ok(PageGuard {
            pager: self,
            frame,
            block: id,
        })
    }

    /// Pins block `id` without reading it: the page starts zeroed and dirty.
    /// For callers about to overwrite the whole block.
    pub fn pin_erased(&mut self, id: BlockId) -> Result<PageGuard<'_, S>> {
        let frame = self.acquire(id, true)?;
        Ok(PageGuard {
            pager: self,
            frame,
            block: id,
        })
    }

    /// Copies block `id` into `buf`.
    pub fn read_block(&mut self, id: BlockId, buf: &mut [u8]) -> Result<()> {
        let page = self.pin(id)?;
        buf.copy_from_slice(&page);
        Ok(())
    }

    /// Replaces the content of block `id` with `buf`.
    pub fn write_block(&mut self, id: BlockId, buf: &[u8]) -> Result<()> {
        let mut page = self.pin_erased(id)?;
        page.data_mut().copy_from_slice(buf);
        Ok(())
    }

    fn acquire(&mut self, id: BlockId, erase: bool) -> Result<FrameId> {
        if let Some(&frame) = self.table.get(&id) {
            self.hits += 1;
            if self.frames[frame].pin_count == 0 {
                self.lru_unlink(frame);
            }
            self.frames[frame].pin_count += 1;
            if erase {
                self.frames[frame].data.fill(0);
                self.frames[frame].dirty = true;
            }
            return Ok(frame);
        }

        self.misses += 1;
        let frame = self.obtain_frame()?;
        if erase {
            self.frames[frame].data.fill(0);
        } else if let Err(e) = self.storage.read_block(id, &mut self.frames[frame].data) {
            self.free.push(frame);
            return Err(e);
        }

        let f = &mut self.frames[frame];
        f.block = Some(id);
        f.pin_count = 1;
        f.dirty = erase;
        self.table.insert(id, frame);
        Ok(frame)
    }

    /// Returns a frame ready to hold a new block: a free one, or the LRU tail
    /// after writing it back.
    fn obtain_frame(&mut self) -> Result<FrameId> {
        if let Some(frame) = self.free.pop() {
            return Ok(frame);
        }

        let victim = self.lru_tail.ok_or(StorageError::CacheExhausted {
            capacity: self.frames.len(),
        })?;
        if self.frames[victim].pin_count != 0 {
            panic!("pager: pinned frame {} found in the LRU list", victim);
        }
        self.write_frame(victim)?;
        trace!(
            "pager: evicting block {:?} from frame {}",
            self.frames[victim].block,
            victim
        );
        self.evictions += 1;
        self.evict_frame(victim);
        Ok(self.free.pop().unwrap_or(victim))
    }

    /// Drops a frame's identity and returns it to the free pool.
    fn evict_frame(&mut self, frame: FrameId) {
        self.lru_unlink(frame);
        if let Some(block) = self.frames[frame].block.take() {
            self.table.remove(&block);
        }
        self.frames[frame].dirty = false;
        self.frames[frame].pin_count = 0;
        self.free.push(frame);
    }

    fn release(&mut self, frame: FrameId) {
        let f = &mut self.frames[frame];
        if f.pin_count == 0 {
            panic!("pager: unpin of unpinned block {:?}", f.block);
        }
        f.pin_count -= 1;
        if f.pin_count == 0 {
            self.lru_push_front(frame);
        }
    }

    fn write_frame(&mut self, frame: FrameId) -> Result<()> {
        let f = &mut self.frames[frame];
        if let (true, Some(block)) = (f.dirty, f.block) {
            trace!("pager: writing back block {}", block);
            self.storage.write_block(block, &f.data)?;
            f.dirty = false;
            self.writes += 1;
        }
        Ok(())
    }

    /// Writes block `id` back if it is cached and dirty.
    pub fn write_back(&mut self, id: BlockId) -> Result<()> {
        match self.table.get(&id) {
            Some(&frame) => self.write_frame(frame),
            None => Ok(()),
        }
    }

    /// Writes block `id` back and removes it from the cache.
    pub fn unload(&mut self, id: BlockId) -> Result<()> {
        if let Some(&frame) = self.table.get(&id) {
            if self.frames[frame].pin_count > 0 {
                panic!("pager: unload of pinned block {}", id);
            }
            self.write_frame(frame)?;
            self.evict_frame(frame);
        }
        Ok(())
    }

    /// Writes every dirty page, in block order, then flushes the storage.
    pub fn flush(&mut self) -> Result<()> {
        let mut dirty: Vec<(BlockId, FrameId)> = self
            .table
            .iter()
            .filter(|(_, &f)| self.frames[f].dirty)
            .map(|(&b, &f)| (b, f))
            .collect();
        dirty.sort_unstable();

        for (_, frame) in dirty {
            self.write_frame(frame)?;
        }
        self.storage.flush()
    }

    pub fn stats(&self) -> PagerStats {
        let cached: Vec<&Frame> = self.table.values().map(|&f| &self.frames[f]).collect();
        PagerStats {
            capacity: self.frames.len(),
            cached: cached.len(),
            pinned: cached.iter().filter(|f| f.pin_count > 0).count(),
            dirty: cached.iter().filter(|f| f.dirty).count(),
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            writes: self.writes,
        }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Flushes and hands back the underlying storage.
    pub fn into_storage(mut self) -> Result<S> {
        self.flush()?;
        Ok(self.storage)
    }

    fn lru_unlink(&mut self, frame: FrameId) {
        let (prev, next) = (self.frames[frame].prev, self.frames[frame].next);
        let linked = prev.is_some() || next.is_some() || self.lru_head == Some(frame);
        if !linked {
            return;
        }
        match prev {
            Some(p) => self.frames[p].next = next,
            None => self.lru_head = next,
        }
        match next {
            Some(n) => self.frames[n].prev = prev,
            None => self.lru_tail = prev,
        }
        self.frames[frame].prev = None;
        self.frames[frame].next = None;
    }

    fn lru_push_front(&mut self, frame: FrameId) {
        self.frames[frame].prev = None;
        self.frames[frame].next = self.lru_head;
        match self.lru_head {
            Some(h) => self.frames[h].prev = Some(frame),
            None => self.lru_tail = Some(frame),
        }
        self.lru_head = Some(frame);
    }
}

/// Scoped pin on one cached block. Dropping the guard unpins the block on
/// every exit path.
pub struct PageGuard<'a, S: BlockStorage> {
    pager: &'a mut Pager<S>,
    frame: FrameId,
    block: BlockId,
}

impl<'a, S: BlockStorage> PageGuard<'a, S> {
    pub fn block(&self) -> BlockId {
        self.block
    }

    /// Mutable access to the page bytes; marks the page dirty.
    pub fn data_mut(&mut self) -> &mut [u8] {
        let frame = &mut self.pager.frames[self.frame];
        frame.dirty = true;
        &mut frame.data
    }

    pub fn is_dirty(&self) -> bool {
        self.pager.frames[self.frame].dirty
    }

    /// The pager this page is pinned in. The page stays pinned while other
    /// blocks are loaded through it.
    pub fn pager(&mut self) -> &mut Pager<S> {
        self.pager
    }
}

impl<S: BlockStorage> Deref for PageGuard<'_, S> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.pager.frames[self.frame].data
    }
}

impl<S: BlockStorage> Drop for PageGuard<'_, S> {
    fn drop(&mut self) {
        self.pager.release(self.frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemoryBlockStorage;

    fn create_test_pager(blocks: u64, capacity: usize) -> Pager<MemoryBlockStorage> {
        let mut storage = MemoryBlockStorage::new(64);
        storage.set_num_blocks(blocks).unwrap();
        Pager::new(storage, capacity)
    }

    #[test]
    fn test_pin_loads_and_caches() {
        let mut pager = create_test_pager(4, 2);
        {
            let page = pager.pin(1).unwrap();
            assert_eq!(page.block(), 1);
            assert!(page.iter().all(|&b| b == 0));
        }
        assert!(pager.is_cached(1));
        pager.pin(1).unwrap();

        let stats = pager.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.pinned, 0);
    }

    #[test]
    fn test_dirty_page_is_written_on_flush() {
        let mut pager = create_test_pager(4, 4);
        {
            let mut page = pager.pin(2).unwrap();
            page.data_mut()[0] = 0xab;
            assert!(page.is_dirty());
        }
        assert_eq!(pager.stats().dirty, 1);
        pager.flush().unwrap();
        assert_eq!(pager.stats().dirty, 0);

        let mut storage = pager.into_storage().unwrap();
        let mut buf = vec![0u8; 64];
        storage.read_block(2, &mut buf).unwrap();
        assert_eq!(buf[0], 0xab);
        assert_eq!(storage.flush_count(), 2);
    }

    #[test]
    fn test_eviction_writes_back_lru_tail() {
        let mut pager = create_test_pager(8, 2);
        pager.write_block(1, &[1u8; 64]).unwrap();
        pager.write_block(2, &[2u8; 64]).unwrap();
        // Touch 1 so that 2 becomes the LRU tail
        pager.pin(1).unwrap();
        pager.pin(3).unwrap();

        assert!(pager.is_cached(1));
        assert!(!pager.is_cached(2));
        assert_eq!(pager.stats().evictions, 1);

        let mut buf = vec![0u8; 64];
        pager.read_block(2, &mut buf).unwrap();
        assert_eq!(buf, vec![2u8; 64]);
    }

    #[test]
    fn test_pinned_page_is_never_evicted() {
        let mut pager = create_test_pager(8, 2);
        let mut page = pager.pin(5).unwrap();
        page.data_mut()[3] = 7;
        for id in 0..8 {
            if id != 5 {
                page.pager().pin(id).unwrap();
            }
        }
        assert_eq!(page.pager().pin_count(5), 1);
        assert_eq!(page[3], 7);
    }

    #[test]
    fn test_cache_exhausted_when_all_pinned() {
        let mut pager = create_test_pager(4, 2);
        let mut a = pager.pin(0).unwrap();
        let mut b = a.pager().pin(1).unwrap();
        let err = b.pager().pin(2).err().unwrap();
        assert!(matches!(err, StorageError::CacheExhausted { capacity: 2 }));
    }

    #[test]
    fn test_erased_pin_skips_read() {
        let mut pager = create_test_pager(4, 4);
        pager.write_block(1, &[9u8; 64]).unwrap();
        pager.flush().unwrap();
        pager.unload(1).unwrap();
        let misses = pager.stats().misses;

        let page = pager.pin_erased(1).unwrap();
        assert!(page.iter().all(|&b| b == 0));
        assert!(page.is_dirty());
        drop(page);
        assert_eq!(pager.stats().misses, misses + 1);
    }

    #[test]
    fn test_unload_flushes_first() {
        let mut pager = create_test_pager(4, 4);
        pager.write_block(3, &[4u8; 64]).unwrap();
        pager.unload(3).unwrap();
        assert!(!pager.is_cached(3));

        let mut buf = vec![0u8; 64];
        pager.read_block(3, &mut buf).unwrap();
        assert_eq!(buf, vec![4u8; 64]);
    }

    #[test]
    fn test_set_num_blocks_grows_storage() {
        let mut pager = create_test_pager(2, 4);
        pager.set_num_blocks(10).unwrap();
        assert_eq!(pager.num_blocks(), 10);
        pager.pin(9).unwrap();
        pager.set_num_blocks(5).unwrap();
        assert!(!pager.is_cached(9));
    }

    #[test]
    #[should_panic(expected = "unload of pinned block")]
    fn test_unload_pinned_panics() {
        let mut pager = create_test_pager(4, 4);
        let mut page = pager.pin(1).unwrap();
        page.pager().unload(1).unwrap();
    }
}
