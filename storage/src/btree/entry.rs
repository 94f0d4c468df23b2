//! Live handles to single items.

use std::cmp::Ordering;
use std::io::{self, Read, Seek, SeekFrom, Write};

use bytes::Bytes;

use super::node::{ItemValue, Node};
use super::ops::{self, Location};
use super::{BTree, TreeMeta};
use crate::block::BlockStorage;
use crate::overflow::{seek_position, Chain, ChainCache};
use crate::store::Space;
use crate::{Result, StorageError};

/// Handle to one key of a tree and its value.
///
/// An entry caches the node and slot of its item together with the tree
/// version it saw. When the tree has changed shape since, the entry looks its
/// key up again before any access and fails with `EntryDeleted` if the key is
/// gone.
///
/// Writes go through a per-tree lease: only one entry at a time may leave
/// node bytes dirty in the cache. Writing through another entry first writes
/// the previous holder's node back to storage.
pub struct Entry<S: BlockStorage> {
    tree: BTree<S>,
    key: Vec<u8>,
    loc: Location,
    version: u64,
    lease: u64,
}

/// Re-finds the item if the tree changed shape and loads its node.
fn resolve<S: BlockStorage>(
    space: &mut Space<S>,
    meta: &TreeMeta,
    key: &[u8],
    loc: &mut Location,
    version: &mut u64,
) -> Result<Node> {
    if *version != meta.version {
        let (_, found) = ops::find(space, meta, key)?.ok_or(StorageError::EntryDeleted)?;
        *loc = found;
        *version = meta.version;
    }
    let node = Node::load(space, loc.node, meta.layout)?;
    if loc.slot as usize >= meta.layout.slots
        || !node.is_used(loc.slot)
        || (meta.cmp)(node.key(loc.slot), key) != Ordering::Equal
    {
        return Err(StorageError::corrupted(
            loc.node,
            format!("slot {} no longer holds its entry", loc.slot),
        ));
    }
    Ok(node)
}

/// Hands the write lease to `lease`, writing the previous holder's node back.
fn take_lease<S: BlockStorage>(space: &mut Space<S>, meta: &mut TreeMeta, lease: u64, node: &Node) -> Result<()> {
    if let Some((holder, block)) = meta.lease {
        if holder != lease {
            space.pager.write_back(block)?;
        }
    }
    meta.lease = Some((lease, node.id));
    Ok(())
}

/// Stores `data` inline when it fits, otherwise moves it to a new chain.
fn store_inline<S: BlockStorage>(
    space: &mut Space<S>,
    meta: &TreeMeta,
    chains: &mut ChainCache,
    node: &mut Node,
    slot: u16,
    data: &[u8],
) -> Result<()> {
    if data.len() <= meta.layout.inline_capacity(node.key(slot).len()) {
        node.set_value(slot, ItemValue::Inline(data));
    } else {
        let head = Chain::create(space)?;
        Chain::new(space, chains.state(head), head).write_at(0, data)?;
        node.set_value(slot, ItemValue::Overflow(head));
    }
    node.save(space)
}

fn overflow_head(node: &Node, slot: u16) -> Option<u64> {
    match node.value(slot) {
        ItemValue::Overflow(head) => Some(head),
        ItemValue::Inline(_) => None,
    }
}

impl<S: BlockStorage> Entry<S> {
    pub(crate) fn new(tree: BTree<S>, key: Vec<u8>, loc: Location, version: u64, lease: u64) -> Self {
        Self {
            tree,
            key,
            loc,
            version,
            lease,
        }
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn tree(&self) -> &BTree<S> {
        &self.tree
    }

    fn with_node<R>(
        &mut self,
        f: impl FnOnce(&mut Space<S>, &mut TreeMeta, &mut ChainCache, &mut Node, u16) -> Result<R>,
    ) -> Result<R> {
        let Self {
            tree,
            key,
            loc,
            version,
            ..
        } = self;
        tree.with_meta(|space, meta, chains| {
            let mut node = resolve(space, meta, key, loc, version)?;
            f(space, meta, chains, &mut node, loc.slot)
        })
    }

    /// Whether the key has been removed from the tree since this entry was
    /// obtained.
    pub fn is_deleted(&mut self) -> Result<bool> {
        match self.with_node(|_, _, _, _, _| Ok(())) {
            Ok(()) => Ok(false),
            Err(StorageError::EntryDeleted) => Ok(true),
            Err(e) => Err(e),
        }
    }

    /// Whether the value lives in an overflow chain.
    pub fn is_overflow(&mut self) -> Result<bool> {
        self.with_node(|_, _, _, node, slot| Ok(overflow_head(node, slot).is_some()))
    }

    pub fn value_len(&mut self) -> Result<u64> {
        self.with_node(|space, _, chains, node, slot| match node.value(slot) {
            ItemValue::Inline(bytes) => Ok(bytes.len() as u64),
            ItemValue::Overflow(head) => Chain::new(space, chains.state(head), head).len(),
        })
    }

    pub fn read_value(&mut self) -> Result<Bytes> {
        self.with_node(|space, _, chains, node, slot| match node.value(slot) {
            ItemValue::Inline(bytes) => Ok(Bytes::copy_from_slice(bytes)),
            ItemValue::Overflow(head) => Chain::new(space, chains.state(head), head).read_all(),
        })
    }

    /// Reads up to `buf.len()` value bytes at `pos`.
    pub fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        self.with_node(|space, _, chains, node, slot| match node.value(slot) {
            ItemValue::Inline(bytes) => {
                let start = (pos as usize).min(bytes.len());
                let n = buf.len().min(bytes.len() - start);
                buf[..n].copy_from_slice(&bytes[start..start + n]);
                Ok(n)
            }
            ItemValue::Overflow(head) => Chain::new(space, chains.state(head), head).read_at(pos, buf),
        })
    }

    /// Replaces the whole value. A value that has once moved to an overflow
    /// chain stays there, however small it becomes.
    pub fn write_value(&mut self, data: &[u8]) -> Result<()> {
        let lease = self.lease;
        self.with_node(|space, meta, chains, node, slot| {
            take_lease(space, meta, lease, node)?;
            match overflow_head(node, slot) {
                Some(head) => {
                    let mut chain = Chain::new(space, chains.state(head), head);
                    chain.write_at(0, data)?;
                    chain.set_len(data.len() as u64)
                }
                None => store_inline(space, meta, chains, node, slot, data),
            }
        })
    }

    /// Writes `data` at `pos`, zero-filling any gap past the end.
    pub fn write_at(&mut self, pos: u64, data: &[u8]) -> Result<()> {
        let lease = self.lease;
        self.with_node(|space, meta, chains, node, slot| {
            take_lease(space, meta, lease, node)?;
            if let Some(head) = overflow_head(node, slot) {
                return Chain::new(space, chains.state(head), head).write_at(pos, data);
            }
            let mut value = match node.value(slot) {
                ItemValue::Inline(bytes) => bytes.to_vec(),
                ItemValue::Overflow(_) => Vec::new(),
            };
            let start = pos as usize;
            let end = start + data.len();
            if value.len() < end {
                value.resize(end, 0);
            }
            value[start..end].copy_from_slice(data);
            store_inline(space, meta, chains, node, slot, &value)
        })
    }

    /// Truncates or zero-extends the value.
    pub fn set_value_len(&mut self, len: u64) -> Result<()> {
        let lease = self.lease;
        self.with_node(|space, meta, chains, node, slot| {
            take_lease(space, meta, lease, node)?;
            if let Some(head) = overflow_head(node, slot) {
                return Chain::new(space, chains.state(head), head).set_len(len);
            }
            let mut value = match node.value(slot) {
                ItemValue::Inline(bytes) => bytes.to_vec(),
                ItemValue::Overflow(_) => Vec::new(),
            };
            value.resize(len as usize, 0);
            store_inline(space, meta, chains, node, slot, &value)
        })
    }

    /// Seekable byte stream over the value.
    pub fn stream(&mut self) -> ValueStream<'_, S> {
        ValueStream { entry: self, pos: 0 }
    }

    /// Removes the key from the tree.
    pub fn delete(self) -> Result<bool> {
        self.tree.delete(&self.key)
    }
}

/// `Read + Write + Seek` view of one entry's value.
pub struct ValueStream<'e, S: BlockStorage> {
    entry: &'e mut Entry<S>,
    pos: u64,
}

impl<S: BlockStorage> ValueStream<'_, S> {
    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn len(&mut self) -> Result<u64> {
        self.entry.value_len()
    }

    pub fn is_empty(&mut self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Truncates or zero-extends the value; the position is left alone.
    pub fn set_len(&mut self, len: u64) -> Result<()> {
        self.entry.set_value_len(len)
    }
}

impl<S: BlockStorage> Read for ValueStream<'_, S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.entry.read_at(self.pos, buf)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl<S: BlockStorage> Write for ValueStream<'_, S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.entry.write_at(self.pos, buf)?;
        self.pos += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(self.entry.tree.flush()?)
    }
}

impl<S: BlockStorage> Seek for ValueStream<'_, S> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let len = self.entry.value_len()?;
        self.pos = seek_position(self.pos, len, pos)?;
        Ok(self.pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemoryBlockStorage;
    use crate::config::{StoreConfig, TreeOptions};
    use crate::store::Store;

    fn create_test_tree() -> BTree<MemoryBlockStorage> {
        let config = StoreConfig::default()
            .with_block_size(512)
            .with_cache_blocks(16)
            .with_grow_blocks(32);
        let store = Store::create(MemoryBlockStorage::new(512), config).unwrap();
        store.create_tree(TreeOptions::new(16)).unwrap()
    }

    #[test]
    fn test_inline_then_overflow() {
        let tree = create_test_tree();
        let cap = tree.inline_capacity(3).unwrap();
        let mut entry = tree.insert(b"key").unwrap();
        assert_eq!(entry.value_len().unwrap(), 0);

        let small = vec![1u8; cap];
        entry.write_value(&small).unwrap();
        assert!(!entry.is_overflow().unwrap());
        assert_eq!(entry.read_value().unwrap(), Bytes::from(small));

        let big = vec![2u8; cap + 1];
        entry.write_value(&big).unwrap();
        assert!(entry.is_overflow().unwrap());
        assert_eq!(entry.read_value().unwrap(), Bytes::from(big));
    }

    #[test]
    fn test_overflow_is_never_demoted() {
        let tree = create_test_tree();
        let mut entry = tree.insert(b"k").unwrap();
        entry.write_value(&[7u8; 5000]).unwrap();
        entry.write_value(b"tiny").unwrap();
        assert!(entry.is_overflow().unwrap());
        assert_eq!(entry.read_value().unwrap().as_ref(), b"tiny");
        assert_eq!(entry.value_len().unwrap(), 4);
    }

    #[test]
    fn test_entry_follows_key_through_splits() {
        let tree = create_test_tree();
        let mut entry = tree.insert(&500u16.to_be_bytes()).unwrap();
        entry.write_value(b"mine").unwrap();
        for i in 0u16..1000 {
            tree.insert(&i.to_be_bytes()).unwrap();
        }
        assert!(tree.height().unwrap() >= 2);
        assert_eq!(entry.read_value().unwrap().as_ref(), b"mine");
        entry.write_value(b"still mine").unwrap();
        assert_eq!(
            tree.get(&500u16.to_be_bytes()).unwrap().unwrap().as_ref(),
            b"still mine"
        );
    }

    #[test]
    fn test_entry_reports_deletion() {
        let tree = create_test_tree();
        let mut entry = tree.insert(b"gone").unwrap();
        assert!(!entry.is_deleted().unwrap());
        tree.delete(b"gone").unwrap();
        assert!(entry.is_deleted().unwrap());
        assert!(matches!(
            entry.read_value().unwrap_err(),
            StorageError::EntryDeleted
        ));
    }

    #[test]
    fn test_stream_partial_io() {
        let tree = create_test_tree();
        let mut entry = tree.insert(b"s").unwrap();
        {
            let mut stream = entry.stream();
            stream.write_all(b"0123456789").unwrap();
            stream.seek(SeekFrom::Start(2)).unwrap();
            stream.write_all(b"ab").unwrap();
            stream.seek(SeekFrom::End(-3)).unwrap();
            let mut tail = Vec::new();
            stream.read_to_end(&mut tail).unwrap();
            assert_eq!(tail, b"789");
        }
        assert_eq!(entry.read_value().unwrap().as_ref(), b"01ab456789");

        let mut stream = entry.stream();
        stream.seek(SeekFrom::Start(1000)).unwrap();
        stream.write_all(b"end").unwrap();
        assert_eq!(stream.len().unwrap(), 1003);
        stream.set_len(4).unwrap();
        assert_eq!(stream.len().unwrap(), 4);
        drop(stream);
        assert!(entry.is_overflow().unwrap());
        assert_eq!(entry.read_value().unwrap().as_ref(), b"01ab");
    }

    #[test]
    fn test_lease_writes_back_previous_holder() {
        let tree = create_test_tree();
        let store = tree.store().clone();
        let mut a = tree.insert(b"a").unwrap();
        let mut b = tree.insert(b"b").unwrap();
        store.flush().unwrap();

        a.write_value(b"one").unwrap();
        assert_eq!(store.pager_stats().dirty, 1);
        let writes = store.pager_stats().writes;
        b.write_value(b"two").unwrap();
        // a and b share the root leaf; handing the lease over wrote it back
        assert_eq!(store.pager_stats().writes, writes + 1);
        b.write_value(b"three").unwrap();
        assert_eq!(store.pager_stats().writes, writes + 1);
        assert_eq!(tree.get(b"a").unwrap().unwrap().as_ref(), b"one");
    }
}
