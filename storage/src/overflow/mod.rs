//! Overflow chains: values too large for a B-tree item, and standalone blobs.
//!
//! A chain is a doubly linked list of blocks:
//!
//! ```text
//! 0   magic     0x18018019
//! 4   data len  i32, bytes of payload used in this block
//! 8   prev      i64, 0 for the head
//! 16  next      i64, 0 for the tail
//! 24  payload   block_size - 24 bytes
//! ```
//!
//! Every block but the tail is full, so byte `pos` always lives in block
//! `pos / payload` at offset `pos % payload`. The head block is never freed
//! while the chain exists, even when the length drops to zero.

use std::collections::{BTreeMap, HashMap};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, trace};

use crate::block::BlockStorage;
use crate::bytes_le::{put_u32, put_u64, u32_at, u64_at};
use crate::store::{HandleToken, Space, Store};
use crate::{BlockId, Result, StorageError};

pub const CHAIN_MAGIC: u32 = 0x18018019;
pub const CHAIN_HEADER_SIZE: usize = 24;

/// Cached chain states are dropped wholesale past this many chains.
const MAX_CACHED_CHAINS: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ChainBlock {
    id: BlockId,
    data_len: usize,
    prev: BlockId,
    next: BlockId,
}

/// What is known about one chain: block ids by index and, once walked, its
/// length. Purely a cache; dropping it only costs a re-walk.
#[derive(Debug, Default)]
pub(crate) struct ChainState {
    known: BTreeMap<u64, BlockId>,
    len: Option<u64>,
    blocks: Option<u64>,
}

impl ChainState {
    fn new(head: BlockId) -> Self {
        let mut known = BTreeMap::new();
        known.insert(0, head);
        Self {
            known,
            len: None,
            blocks: None,
        }
    }
}

/// Chain states keyed by head block.
#[derive(Debug, Default)]
pub(crate) struct ChainCache {
    states: HashMap<BlockId, ChainState>,
}

impl ChainCache {
    pub fn state(&mut self, head: BlockId) -> &mut ChainState {
        if self.states.len() >= MAX_CACHED_CHAINS && !self.states.contains_key(&head) {
            trace!("overflow: dropping {} cached chain states", self.states.len());
            self.states.clear();
        }
        self.states
            .entry(head)
            .or_insert_with(|| ChainState::new(head))
    }

    pub fn forget(&mut self, head: BlockId) {
        self.states.remove(&head);
    }
}

/// Random access to one chain.
pub(crate) struct Chain<'a, S: BlockStorage> {
    space: &'a mut Space<S>,
    state: &'a mut ChainState,
    head: BlockId,
    payload: usize,
}

impl<'a, S: BlockStorage> Chain<'a, S> {
    pub fn new(space: &'a mut Space<S>, state: &'a mut ChainState, head: BlockId) -> Self {
        let payload = space.block_size() - CHAIN_HEADER_SIZE;
        Self {
            space,
            state,
            head,
            payload,
        }
    }

    /// Allocates an empty chain and returns its head block.
    pub fn create(space: &mut Space<S>) -> Result<BlockId> {
        let head = space.allocate()?;
        write_header(
            space,
            &ChainBlock {
                id: head,
                data_len: 0,
                prev: 0,
                next: 0,
            },
            true,
        )?;
        debug!("overflow: created chain at block {}", head);
        Ok(head)
    }

    /// Checks that the head block really starts a chain.
    pub fn validate_head(&mut self) -> Result<()> {
        let head = self.read_block(self.head)?;
        if head.prev != 0 {
            return Err(StorageError::corrupted(self.head, "chain head has a predecessor"));
        }
        Ok(())
    }

    fn read_block(&mut self, id: BlockId) -> Result<ChainBlock> {
        read_header(self.space, id, self.payload)
    }

    /// Block id at chain index `index`, walking from the nearest known one.
    fn seek(&mut self, index: u64) -> Result<BlockId> {
        if let Some(&id) = self.state.known.get(&index) {
            return Ok(id);
        }
        let below = self.state.known.range(..index).next_back().map(|(&i, &b)| (i, b));
        let above = self.state.known.range(index..).next().map(|(&i, &b)| (i, b));

        let (mut at, mut id, forward) = match (below, above) {
            (Some((bi, _)), Some((ai, ab))) if ai - index < index - bi => (ai, ab, false),
            (Some((bi, bb)), _) => (bi, bb, true),
            (None, Some((ai, ab))) => (ai, ab, false),
            (None, None) => (0, self.head, true),
        };

        while at != index {
            let block = self.read_block(id)?;
            let step = if forward { block.next } else { block.prev };
            if step == 0 {
                return Err(StorageError::corrupted(
                    id,
                    format!("chain {} ends before index {}", self.head, index),
                ));
            }
            if forward {
                at += 1;
            } else {
                at -= 1;
            }
            id = step;
            self.state.known.insert(at, id);
        }
        Ok(id)
    }

    /// Walks to the tail once to learn the length.
    fn learn_len(&mut self) -> Result<()> {
        if self.state.len.is_some() {
            return Ok(());
        }
        let (mut at, mut id) = self
            .state
            .known
            .iter()
            .next_back()
            .map(|(&i, &b)| (i, b))
            .unwrap_or((0, self.head));
        loop {
            let block = self.read_block(id)?;
            if block.next == 0 {
                self.state.len = Some(at * self.payload as u64 + block.data_len as u64);
                self.state.blocks = Some(at + 1);
                return Ok(());
            }
            if block.data_len != self.payload {
                return Err(StorageError::corrupted(
                    id,
                    format!("inner chain block holds {} bytes", block.data_len),
                ));
            }
            at += 1;
            id = block.next;
            self.state.known.insert(at, id);
        }
    }

    pub fn len(&mut self) -> Result<u64> {
        self.learn_len()?;
        Ok(self.state.len.unwrap_or(0))
    }

    pub fn block_count(&mut self) -> Result<u64> {
        self.learn_len()?;
        Ok(self.state.blocks.unwrap_or(1))
    }

    /// Reads up to `buf.len()` bytes at `pos`; returns how many were read.
    pub fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        let len = self.len()?;
        if pos >= len {
            return Ok(0);
        }
        let n = buf.len().min((len - pos) as usize);
        let payload = self.payload as u64;
        let mut done = 0;
        while done < n {
            let at = pos + done as u64;
            let off = (at % payload) as usize;
            let id = self.seek(at / payload)?;
            let take = (self.payload - off).min(n - done);
            let page = self.space.pager.pin(id)?;
            let start = CHAIN_HEADER_SIZE + off;
            buf[done..done + take].copy_from_slice(&page[start..start + take]);
            done += take;
        }
        Ok(n)
    }

    /// Reads the whole chain.
    pub fn read_all(&mut self) -> Result<Bytes> {
        let len = self.len()?;
        let mut buf = vec![0u8; len as usize];
        self.read_at(0, &mut buf)?;
        Ok(Bytes::from(buf))
    }

    /// Writes `data` at `pos`, zero-filling any gap past the current end.
    pub fn write_at(&mut self, pos: u64, data: &[u8]) -> Result<()> {
        let len = self.len()?;
        if pos > len {
            self.set_len(pos)?;
        }
        let payload = self.payload as u64;
        let mut done = 0;
        while done < data.len() {
            let at = pos + done as u64;
            let off = (at % payload) as usize;
            let id = self.block_for_write(at / payload)?;
            let take = (self.payload - off).min(data.len() - done);

            let mut page = self.space.pager.pin(id)?;
            let buf = page.data_mut();
            let start = CHAIN_HEADER_SIZE + off;
            buf[start..start + take].copy_from_slice(&data[done..done + take]);
            let used = (u32_at(buf, 4) as usize).max(off + take);
            put_u32(buf, 4, used as u32);
            done += take;
        }
        self.state.len = Some(len.max(pos + data.len() as u64));
        Ok(())
    }

    /// Block at `index`, appending one when `index` is just past the tail.
    fn block_for_write(&mut self, index: u64) -> Result<BlockId> {
        let blocks = self.block_count()?;
        if index < blocks {
            return self.seek(index);
        }
        if index > blocks {
            return Err(StorageError::corrupted(
                self.head,
                format!("write at block {} past tail {}", index, blocks),
            ));
        }
        let tail_id = self.seek(blocks - 1)?;
        let mut tail = self.read_block(tail_id)?;
        let id = self.space.allocate()?;
        write_header(
            self.space,
            &ChainBlock {
                id,
                data_len: 0,
                prev: tail_id,
                next: 0,
            },
            true,
        )?;
        tail.next = id;
        write_header(self.space, &tail, false)?;
        trace!("overflow: chain {} grew to {} blocks", self.head, blocks + 1);

        self.state.known.insert(index, id);
        self.state.blocks = Some(blocks + 1);
        Ok(id)
    }

    /// Truncates or zero-extends the chain to `new_len` bytes.
    pub fn set_len(&mut self, new_len: u64) -> Result<()> {
        let len = self.len()?;
        if new_len == len {
            return Ok(());
        }
        if new_len > len {
            let zeros = vec![0u8; self.payload];
            let mut at = len;
            while at < new_len {
                let take = (self.payload as u64).min(new_len - at) as usize;
                self.write_at(at, &zeros[..take])?;
                at += take as u64;
            }
            return Ok(());
        }

        let payload = self.payload as u64;
        let keep = if new_len == 0 { 1 } else { (new_len - 1) / payload + 1 };
        let last_id = self.seek(keep - 1)?;
        let mut last = self.read_block(last_id)?;

        let mut next = last.next;
        let mut freed = 0u64;
        while next != 0 {
            let block = self.read_block(next)?;
            self.space.free(next)?;
            next = block.next;
            freed += 1;
        }

        last.next = 0;
        last.data_len = (new_len - (keep - 1) * payload) as usize;
        write_header(self.space, &last, false)?;
        trace!(
            "overflow: chain {} truncated to {} bytes, {} blocks freed",
            self.head,
            new_len,
            freed
        );

        self.state.known.retain(|&i, _| i < keep);
        self.state.len = Some(new_len);
        self.state.blocks = Some(keep);
        Ok(())
    }

    /// Block ids in chain order.
    pub fn block_ids(&mut self) -> Result<Vec<BlockId>> {
        let mut ids = Vec::new();
        let mut prev = 0;
        let mut id = self.head;
        while id != 0 {
            let block = self.read_block(id)?;
            if block.prev != prev {
                return Err(StorageError::corrupted(
                    id,
                    format!("prev link {} should be {}", block.prev, prev),
                ));
            }
            if block.next != 0 && block.data_len != self.payload {
                return Err(StorageError::corrupted(
                    id,
                    format!("inner chain block holds {} bytes", block.data_len),
                ));
            }
            if ids.len() as u64 > self.space.superblock.database_size {
                return Err(StorageError::corrupted(self.head, "chain has a cycle"));
            }
            ids.push(id);
            prev = id;
            id = block.next;
        }
        Ok(ids)
    }

    /// Frees every block of the chain, head included.
    pub fn free_all(self) -> Result<()> {
        let mut id = self.head;
        let mut freed = 0;
        while id != 0 {
            let block = read_header(self.space, id, self.payload)?;
            self.space.free(id)?;
            id = block.next;
            freed += 1;
        }
        debug!("overflow: freed chain {} ({} blocks)", self.head, freed);
        Ok(())
    }
}

fn read_header<S: BlockStorage>(
    space: &mut Space<S>,
    id: BlockId,
    payload: usize,
) -> Result<ChainBlock> {
    let page = space.pager.pin(id)?;
    let magic = u32_at(&page, 0);
    if magic != CHAIN_MAGIC {
        return Err(StorageError::BadMagic {
            block: id,
            expected: CHAIN_MAGIC,
            found: magic,
        });
    }
    let data_len = u32_at(&page, 4) as i32;
    if data_len < 0 || data_len as usize > payload {
        return Err(StorageError::corrupted(
            id,
            format!("chain block data length {}", data_len),
        ));
    }
    Ok(ChainBlock {
        id,
        data_len: data_len as usize,
        prev: u64_at(&page, 8),
        next: u64_at(&page, 16),
    })
}

fn write_header<S: BlockStorage>(space: &mut Space<S>, block: &ChainBlock, fresh: bool) -> Result<()> {
    let mut page = if fresh {
        space.pager.pin_erased(block.id)?
    } else {
        space.pager.pin(block.id)?
    };
    let buf = page.data_mut();
    put_u32(buf, 0, CHAIN_MAGIC);
    put_u32(buf, 4, block.data_len as u32);
    put_u64(buf, 8, block.prev);
    put_u64(buf, 16, block.next);
    Ok(())
}

/// Handle to a standalone overflow chain.
///
/// Handles opened on the same head share one drop token: once any of them
/// calls [`Blob::drop_blob`], the others fail with `HandleDropped`. The
/// `Read`/`Write`/`Seek` implementations keep a private cursor per handle.
pub struct Blob<S: BlockStorage> {
    store: Store<S>,
    token: Arc<HandleToken>,
    pos: u64,
}

impl<S: BlockStorage> Blob<S> {
    pub(crate) fn new(store: Store<S>, token: Arc<HandleToken>) -> Self {
        Self {
            store,
            token,
            pos: 0,
        }
    }

    pub fn head(&self) -> BlockId {
        self.token.block()
    }

    pub fn len(&self) -> Result<u64> {
        self.store.with_chain(&self.token, |chain| chain.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Number of blocks in the chain, head included.
    pub fn block_count(&self) -> Result<u64> {
        self.store.with_chain(&self.token, |chain| chain.block_count())
    }

    pub fn read_at(&self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        self.store.with_chain(&self.token, |chain| chain.read_at(pos, buf))
    }

    pub fn write_at(&self, pos: u64, data: &[u8]) -> Result<()> {
        self.store.with_chain(&self.token, |chain| chain.write_at(pos, data))
    }

    pub fn set_len(&self, len: u64) -> Result<()> {
        self.store.with_chain(&self.token, |chain| chain.set_len(len))
    }

    pub fn read_all(&self) -> Result<Bytes> {
        self.store.with_chain(&self.token, |chain| chain.read_all())
    }

    /// Frees the whole chain. Every handle on it becomes unusable.
    pub fn drop_blob(self) -> Result<()> {
        self.store.drop_blob(&self.token)
    }
}

impl<S: BlockStorage> Read for Blob<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.read_at(self.pos, buf)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl<S: BlockStorage> Write for Blob<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_at(self.pos, buf)?;
        self.pos += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(self.store.flush()?)
    }
}

impl<S: BlockStorage> Seek for Blob<S> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let len = self.len()?;
        self.pos = seek_position(self.pos, len, pos)?;
        Ok(self.pos)
    }
}

/// Resolves a `SeekFrom` against a cursor and a length.
pub(crate) fn seek_position(cur: u64, len: u64, pos: SeekFrom) -> io::Result<u64> {
    let (base, delta) = match pos {
        SeekFrom::Start(n) => return Ok(n),
        SeekFrom::End(d) => (len, d),
        SeekFrom::Current(d) => (cur, d),
    };
    base.checked_add_signed(delta).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            "seek to a negative or overflowing position",
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemoryBlockStorage;
    use crate::config::StoreConfig;
    use crate::ErrorKind;

    fn create_test_store() -> Store<MemoryBlockStorage> {
        let config = StoreConfig::default()
            .with_block_size(128)
            .with_cache_blocks(16)
            .with_grow_blocks(16);
        Store::create(MemoryBlockStorage::new(128), config).unwrap()
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 251) as u8).collect()
    }

    #[test]
    fn test_empty_blob_has_one_block() {
        let store = create_test_store();
        let blob = store.create_blob().unwrap();
        assert_eq!(blob.len().unwrap(), 0);
        assert_eq!(blob.block_count().unwrap(), 1);
        assert!(blob.read_all().unwrap().is_empty());
    }

    #[test]
    fn test_write_spans_blocks() {
        let store = create_test_store();
        let blob = store.create_blob().unwrap();
        let data = pattern(1000);
        blob.write_at(0, &data).unwrap();

        assert_eq!(blob.len().unwrap(), 1000);
        // 104 payload bytes per block
        assert_eq!(blob.block_count().unwrap(), 10);
        assert_eq!(blob.read_all().unwrap(), Bytes::from(data.clone()));

        let mut mid = [0u8; 300];
        assert_eq!(blob.read_at(500, &mut mid).unwrap(), 300);
        assert_eq!(&mid[..], &data[500..800]);
        assert_eq!(blob.read_at(990, &mut mid).unwrap(), 10);
        assert_eq!(blob.read_at(1000, &mut mid).unwrap(), 0);
    }

    #[test]
    fn test_write_past_end_zero_fills() {
        let store = create_test_store();
        let blob = store.create_blob().unwrap();
        blob.write_at(0, b"abc").unwrap();
        blob.write_at(250, b"xyz").unwrap();

        let all = blob.read_all().unwrap();
        assert_eq!(all.len(), 253);
        assert_eq!(&all[..3], b"abc");
        assert!(all[3..250].iter().all(|&b| b == 0));
        assert_eq!(&all[250..], b"xyz");
    }

    #[test]
    fn test_truncate_frees_blocks_and_keeps_head() {
        let store = create_test_store();
        let before = store.allocated_block_count();
        let blob = store.create_blob().unwrap();
        blob.write_at(0, &pattern(2000)).unwrap();
        assert!(store.allocated_block_count() > before + 10);

        blob.set_len(150).unwrap();
        assert_eq!(blob.len().unwrap(), 150);
        assert_eq!(blob.block_count().unwrap(), 2);
        assert_eq!(blob.read_all().unwrap(), Bytes::from(pattern(150)));

        blob.set_len(0).unwrap();
        assert_eq!(blob.block_count().unwrap(), 1);
        assert_eq!(store.allocated_block_count(), before + 1);
    }

    #[test]
    fn test_overwrite_in_place() {
        let store = create_test_store();
        let blob = store.create_blob().unwrap();
        blob.write_at(0, &pattern(400)).unwrap();
        blob.write_at(100, &[0xff; 50]).unwrap();

        let all = blob.read_all().unwrap();
        assert_eq!(all.len(), 400);
        assert!(all[100..150].iter().all(|&b| b == 0xff));
        assert_eq!(&all[150..], &pattern(400)[150..]);
    }

    #[test]
    fn test_reads_jump_in_both_directions() {
        let store = create_test_store();
        let blob = store.create_blob().unwrap();
        let data = pattern(3000);
        blob.write_at(0, &data).unwrap();

        // Each read seeks from whichever remembered block is nearest
        let mut buf = [0u8; 40];
        for pos in [2900u64, 60, 1500, 1420, 2200, 10, 2950, 700] {
            let n = blob.read_at(pos, &mut buf).unwrap();
            assert!(n > 0);
            let at = pos as usize;
            assert_eq!(&buf[..n], &data[at..at + n], "read at {}", pos);
        }
    }

    #[test]
    fn test_io_traits() {
        let store = create_test_store();
        let mut blob = store.create_blob().unwrap();
        blob.write_all(b"hello, ").unwrap();
        blob.write_all(b"world").unwrap();

        blob.seek(SeekFrom::Start(7)).unwrap();
        let mut word = String::new();
        blob.read_to_string(&mut word).unwrap();
        assert_eq!(word, "world");

        assert_eq!(blob.seek(SeekFrom::End(-5)).unwrap(), 7);
        assert!(blob.seek(SeekFrom::Current(-100)).is_err());
    }

    #[test]
    fn test_reopen_walks_existing_chain() {
        let store = create_test_store();
        let head = {
            let blob = store.create_blob().unwrap();
            blob.write_at(0, &pattern(777)).unwrap();
            blob.head()
        };
        let blob = store.open_blob(head).unwrap();
        assert_eq!(blob.len().unwrap(), 777);
        assert_eq!(blob.read_all().unwrap(), Bytes::from(pattern(777)));
    }

    #[test]
    fn test_drop_blob_invalidates_other_handles() {
        let store = create_test_store();
        let before = store.allocated_block_count();
        let blob = store.create_blob().unwrap();
        blob.write_at(0, &pattern(500)).unwrap();
        let other = store.open_blob(blob.head()).unwrap();

        blob.drop_blob().unwrap();
        assert_eq!(store.allocated_block_count(), before);
        let err = other.len().unwrap_err();
        assert!(matches!(err, StorageError::HandleDropped(_)));
    }

    #[test]
    fn test_open_non_chain_block() {
        let store = create_test_store();
        let id = store.allocate_block().unwrap();
        store.write_block(id, &[0u8; 128]).unwrap();
        let err = store.open_blob(id).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Format);
    }
}
