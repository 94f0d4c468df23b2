//! Ordered B-tree over cached blocks.
//!
//! Nodes are fixed slot arenas (see [`node`]); key order lives in per-node
//! linked lists. Oversized values spill into overflow chains. A header block
//! records the geometry and the current root:
//!
//! ```text
//! 0   magic            u32  0x38a9af10
//! 4   version          u32  0x00010000
//! 8   max key length   u16
//! 10  root             u64
//! ```
//!
//! Every structural change (insert, split, delete, merge) bumps the in-memory
//! tree version, which cursors and entries compare against to notice that
//! their cached positions may have moved.

mod cursor;
mod entry;
mod node;
mod ops;
#[cfg(debug_assertions)]
mod validate;

use std::sync::Arc;

use bytes::Bytes;
use log::debug;

use crate::block::BlockStorage;
use crate::bytes_le::{put_u16, put_u32, put_u64, u16_at, u32_at, u64_at};
use crate::config::{KeyComparator, TreeOptions};
use crate::overflow::ChainCache;
use crate::store::{HandleToken, Space, Store};
use crate::{BlockId, Result, StorageError};

pub use cursor::Entries;
pub use entry::{Entry, ValueStream};
pub(crate) use node::NodeLayout;

use cursor::Direction;
use node::Node;
use ops::Location;

pub const TREE_MAGIC: u32 = 0x38a9af10;
pub const TREE_VERSION: u32 = 0x0001_0000;

/// In-memory state of one open tree, shared by all of its handles.
pub(crate) struct TreeMeta {
    pub header: BlockId,
    pub root: BlockId,
    pub layout: NodeLayout,
    pub cmp: KeyComparator,
    /// Structural version; bumped on every insert and delete.
    pub version: u64,
    /// Entry currently allowed to hold unflushed node bytes, and its node.
    pub lease: Option<(u64, BlockId)>,
    next_lease: u64,
}

impl TreeMeta {
    pub fn create<S: BlockStorage>(space: &mut Space<S>, options: &TreeOptions) -> Result<Self> {
        let layout = NodeLayout::new(space.block_size(), options.max_key_length)?;
        let header = space.allocate()?;
        let root = space.allocate()?;
        Node::new_empty(root, layout, 0).save(space)?;

        let meta = Self {
            header,
            root,
            layout,
            cmp: options.comparator.clone(),
            version: 0,
            lease: None,
            next_lease: 0,
        };
        meta.write_header(space)?;
        Ok(meta)
    }

    pub fn open<S: BlockStorage>(
        space: &mut Space<S>,
        header: BlockId,
        options: &TreeOptions,
    ) -> Result<Self> {
        if header == 0 || header >= space.superblock.database_size {
            return Err(StorageError::corrupted(header, "tree header outside the database"));
        }
        let (max_key, root) = {
            let page = space.pager.pin(header)?;
            let magic = u32_at(&page, 0);
            if magic != TREE_MAGIC {
                return Err(StorageError::BadMagic {
                    block: header,
                    expected: TREE_MAGIC,
                    found: magic,
                });
            }
            let version = u32_at(&page, 4);
            if version != TREE_VERSION {
                return Err(StorageError::UnsupportedVersion {
                    block: header,
                    version,
                });
            }
            (u16_at(&page, 8), u64_at(&page, 10))
        };

        let layout = NodeLayout::new(space.block_size(), max_key)?;
        // Fails early on a dangling root
        Node::load(space, root, layout)?;
        Ok(Self {
            header,
            root,
            layout,
            cmp: options.comparator.clone(),
            version: 0,
            lease: None,
            next_lease: 0,
        })
    }

    pub fn write_header<S: BlockStorage>(&self, space: &mut Space<S>) -> Result<()> {
        let mut page = space.pager.pin_erased(self.header)?;
        let buf = page.data_mut();
        put_u32(buf, 0, TREE_MAGIC);
        put_u32(buf, 4, TREE_VERSION);
        put_u16(buf, 8, self.layout.max_key as u16);
        put_u64(buf, 10, self.root);
        Ok(())
    }

    pub fn set_root<S: BlockStorage>(&mut self, space: &mut Space<S>, root: BlockId) -> Result<()> {
        self.root = root;
        self.write_header(space)
    }

    pub fn next_lease(&mut self) -> u64 {
        self.next_lease += 1;
        self.next_lease
    }

    pub fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.len() > self.layout.max_key {
            return Err(StorageError::KeyTooLong {
                len: key.len(),
                max: self.layout.max_key,
            });
        }
        Ok(())
    }
}

/// Handle to one B-tree.
///
/// Handles are cheap to clone. All handles opened on the same header block
/// share one in-memory state; after [`BTree::drop_tree`] every one of them
/// fails with `HandleDropped`.
pub struct BTree<S: BlockStorage> {
    store: Store<S>,
    token: Arc<HandleToken>,
}

impl<S: BlockStorage> Clone for BTree<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            token: Arc::clone(&self.token),
        }
    }
}

impl<S: BlockStorage> BTree<S> {
    pub(crate) fn new(store: Store<S>, token: Arc<HandleToken>) -> Self {
        Self { store, token }
    }

    pub(crate) fn with_meta<R>(
        &self,
        f: impl FnOnce(&mut Space<S>, &mut TreeMeta, &mut ChainCache) -> Result<R>,
    ) -> Result<R> {
        self.store.with_tree(&self.token, f)
    }

    pub fn store(&self) -> &Store<S> {
        &self.store
    }

    /// Block holding the tree header; pass it to `Store::open_tree`.
    pub fn header_block(&self) -> BlockId {
        self.token.block()
    }

    pub fn max_key_length(&self) -> Result<usize> {
        self.with_meta(|_, meta, _| Ok(meta.layout.max_key))
    }

    /// Maximum number of children of an internal node.
    pub fn order(&self) -> Result<usize> {
        self.with_meta(|_, meta, _| Ok(meta.layout.order()))
    }

    /// Largest value stored inline next to a key of `key_len` bytes.
    pub fn inline_capacity(&self, key_len: usize) -> Result<usize> {
        self.with_meta(|_, meta, _| Ok(meta.layout.inline_capacity(key_len)))
    }

    pub fn version(&self) -> Result<u64> {
        self.with_meta(|_, meta, _| Ok(meta.version))
    }

    fn entry_at(&self, key: Vec<u8>, loc: Location, version: u64, lease: u64) -> Entry<S> {
        Entry::new(self.clone(), key, loc, version, lease)
    }

    /// Looks `key` up.
    pub fn find(&self, key: &[u8]) -> Result<Option<Entry<S>>> {
        let found = self.with_meta(|space, meta, _| {
            let found = ops::find(space, meta, key)?;
            Ok(found.map(|(key, loc)| (key, loc, meta.version, meta.next_lease())))
        })?;
        Ok(found.map(|(key, loc, version, lease)| self.entry_at(key, loc, version, lease)))
    }

    /// Inserts `key` with an empty value, or returns the existing entry.
    pub fn insert(&self, key: &[u8]) -> Result<Entry<S>> {
        let (key, loc, version, lease) = self.with_meta(|space, meta, _| {
            let (key, loc) = ops::insert(space, meta, key)?;
            Ok((key, loc, meta.version, meta.next_lease()))
        })?;
        Ok(self.entry_at(key, loc, version, lease))
    }

    /// Removes `key` and its value. Returns whether it was present.
    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        self.with_meta(|space, meta, chains| ops::delete(space, meta, chains, key))
    }

    pub fn contains_key(&self, key: &[u8]) -> Result<bool> {
        Ok(self.find(key)?.is_some())
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        match self.find(key)? {
            Some(mut entry) => Ok(Some(entry.read_value()?)),
            None => Ok(None),
        }
    }

    /// Inserts or overwrites `key`.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.insert(key)?.write_value(value)
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.with_meta(|space, meta, _| {
            let root = Node::load(space, meta.root, meta.layout)?;
            Ok(root.count() == 0)
        })
    }

    /// Number of keys. Walks the whole tree.
    pub fn len(&self) -> Result<usize> {
        self.with_meta(|space, meta, _| {
            let mut count = 0;
            ops::walk(space, meta, |node| {
                count += node.count();
                Ok(())
            })?;
            Ok(count)
        })
    }

    /// Number of node levels, 1 for a lone root leaf.
    pub fn height(&self) -> Result<usize> {
        self.with_meta(|space, meta, _| ops::height(space, meta))
    }

    /// Removes every key, freeing all nodes but the root and every overflow
    /// chain.
    pub fn clear(&self) -> Result<()> {
        self.with_meta(|space, meta, chains| ops::clear(space, meta, chains))
    }

    /// Frees the whole tree, header included. Every handle on it, including
    /// clones and entries, becomes unusable.
    pub fn drop_tree(self) -> Result<()> {
        self.store.drop_tree(&self.token, |space, meta, chains| {
            ops::clear(space, meta, chains)?;
            space.free(meta.root)?;
            space.free(meta.header)?;
            debug!("btree: freed tree {}", meta.header);
            Ok(())
        })
    }

    /// Flushes the whole store.
    pub fn flush(&self) -> Result<()> {
        self.store.flush()
    }

    pub fn ascending(&self) -> Entries<S> {
        Entries::new(self.clone(), Direction::Ascending, None)
    }

    /// Keys `>= start`, ascending.
    pub fn ascending_from(&self, start: &[u8]) -> Entries<S> {
        Entries::new(self.clone(), Direction::Ascending, Some(start.to_vec()))
    }

    pub fn descending(&self) -> Entries<S> {
        Entries::new(self.clone(), Direction::Descending, None)
    }

    /// Keys `<= start`, descending.
    pub fn descending_from(&self, start: &[u8]) -> Entries<S> {
        Entries::new(self.clone(), Direction::Descending, Some(start.to_vec()))
    }

    /// Walks the whole tree checking ordering, fill factors, uniform leaf
    /// depth and that no block is referenced twice. Returns the key count.
    #[cfg(debug_assertions)]
    pub fn check_integrity(&self) -> Result<usize> {
        self.with_meta(|space, meta, chains| validate::check_tree(space, meta, chains))
    }
}

/// Key count, verified structurally whenever the checker is compiled in.
#[cfg(test)]
pub(crate) fn checked_len<S: BlockStorage>(tree: &BTree<S>) -> Result<usize> {
    #[cfg(debug_assertions)]
    {
        tree.check_integrity()
    }
    #[cfg(not(debug_assertions))]
    {
        tree.len()
    }
}
