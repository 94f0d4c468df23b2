//! The engine façade.
//!
//! A [`Store`] owns the pager, the freemap and the superblock behind one
//! coarse lock, plus registries of the open trees and blobs. Every handle
//! (`BTree`, `Entry`, `Blob`) keeps a clone of the store and takes the lock
//! for the duration of one operation.
//!
//! Handles opened on the same block id share a [`HandleToken`]; the registry
//! only holds it weakly, so in-memory tree state lives exactly as long as
//! some handle on it does.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use log::{debug, info};
use parking_lot::Mutex;

use crate::block::BlockStorage;
use crate::btree::{BTree, TreeMeta};
use crate::config::{StoreConfig, TreeOptions};
use crate::freemap::Freemap;
use crate::overflow::{Blob, Chain, ChainCache};
use crate::pager::{Pager, PagerStats};
use crate::superblock::{Superblock, RESERVED_SLOTS, SUPERBLOCK_ID};
use crate::{BlockId, Result, StorageError};

/// Shared identity of every handle opened on one block id.
#[derive(Debug)]
pub(crate) struct HandleToken {
    block: BlockId,
    dropped: AtomicBool,
}

impl HandleToken {
    fn new(block: BlockId) -> Self {
        Self {
            block,
            dropped: AtomicBool::new(false),
        }
    }

    pub fn block(&self) -> BlockId {
        self.block
    }

    fn check(&self) -> Result<()> {
        if self.dropped.load(Ordering::Acquire) {
            return Err(StorageError::HandleDropped(self.block));
        }
        Ok(())
    }

    fn mark_dropped(&self) {
        self.dropped.store(true, Ordering::Release);
    }
}

/// Pager, allocator and superblock: everything that touches blocks.
pub(crate) struct Space<S: BlockStorage> {
    pub pager: Pager<S>,
    pub freemap: Freemap,
    pub superblock: Superblock,
}

impl<S: BlockStorage> Space<S> {
    pub fn block_size(&self) -> usize {
        self.pager.block_size()
    }

    pub fn allocate(&mut self) -> Result<BlockId> {
        self.freemap.allocate(&mut self.pager, &mut self.superblock)
    }

    pub fn free(&mut self, id: BlockId) -> Result<()> {
        self.freemap
            .deallocate(&mut self.pager, &mut self.superblock, id)
    }

    /// Whether `id` is in use, by the caller or by the engine itself.
    pub fn is_allocated(&mut self, id: BlockId) -> Result<bool> {
        if id == SUPERBLOCK_ID {
            return Ok(true);
        }
        if id >= self.superblock.database_size {
            return Ok(false);
        }
        Ok(!self.freemap.is_free(&mut self.pager, &self.superblock, id)?)
    }

    fn write_superblock(&mut self) -> Result<()> {
        let mut page = self.pager.pin(SUPERBLOCK_ID)?;
        self.superblock.encode(page.data_mut());
        Ok(())
    }

    /// Superblock first, then every dirty page, then the storage itself.
    pub fn flush(&mut self) -> Result<()> {
        self.write_superblock()?;
        self.pager.flush()
    }
}

pub(crate) struct TreeSlot {
    token: Weak<HandleToken>,
    meta: TreeMeta,
}

pub(crate) struct StoreInner<S: BlockStorage> {
    space: Space<S>,
    config: StoreConfig,
    trees: HashMap<BlockId, TreeSlot>,
    blobs: HashMap<BlockId, Weak<HandleToken>>,
    chains: ChainCache,
}

impl<S: BlockStorage> StoreInner<S> {
    /// Forgets registry slots whose handles are all gone.
    fn prune(&mut self) {
        self.trees.retain(|_, slot| slot.token.strong_count() > 0);
        self.blobs.retain(|_, token| token.strong_count() > 0);
    }

    fn register_tree(&mut self, meta: TreeMeta) -> Arc<HandleToken> {
        let token = Arc::new(HandleToken::new(meta.header));
        self.trees.insert(
            meta.header,
            TreeSlot {
                token: Arc::downgrade(&token),
                meta,
            },
        );
        token
    }

    fn register_blob(&mut self, head: BlockId) -> Arc<HandleToken> {
        let token = Arc::new(HandleToken::new(head));
        self.blobs.insert(head, Arc::downgrade(&token));
        token
    }
}

/// Cloneable handle to one storage engine instance.
pub struct Store<S: BlockStorage> {
    inner: Arc<Mutex<StoreInner<S>>>,
}

impl<S: BlockStorage> Clone for Store<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: BlockStorage> Store<S> {
    /// Formats `storage` as an empty store.
    pub fn create(storage: S, config: StoreConfig) -> Result<Self> {
        config.validate()?;
        check_block_size(&storage, &config)?;

        let mut pager = Pager::new(storage, config.cache_blocks);
        let mut superblock = Superblock::new(config.block_size);
        let freemap = Freemap::create(&mut pager, &mut superblock, config.grow_blocks)?;
        let mut space = Space {
            pager,
            freemap,
            superblock,
        };
        space.flush()?;

        info!(
            "store: created with {}-byte blocks, {} blocks addressable",
            config.block_size, space.superblock.database_size
        );
        Ok(Self::from_space(space, config))
    }

    /// Opens a store previously formatted by [`Store::create`].
    pub fn open(storage: S, config: StoreConfig) -> Result<Self> {
        config.validate()?;
        check_block_size(&storage, &config)?;
        if storage.num_blocks() == 0 {
            return Err(StorageError::corrupted(SUPERBLOCK_ID, "storage is empty"));
        }

        let mut pager = Pager::new(storage, config.cache_blocks);
        let mut buf = vec![0u8; config.block_size];
        pager.read_block(SUPERBLOCK_ID, &mut buf)?;
        let superblock = Superblock::decode(&buf)?;
        if superblock.block_size as usize != config.block_size {
            return Err(StorageError::BlockSizeMismatch {
                expected: config.block_size,
                found: superblock.block_size as usize,
            });
        }
        if pager.num_blocks() < superblock.database_size {
            return Err(StorageError::corrupted(
                SUPERBLOCK_ID,
                format!(
                    "database of {} blocks on a device of {}",
                    superblock.database_size,
                    pager.num_blocks()
                ),
            ));
        }

        let freemap = Freemap::open(config.block_size, config.grow_blocks, &superblock);
        info!(
            "store: opened {} blocks ({} allocated)",
            superblock.database_size, superblock.allocated_blocks
        );
        let space = Space {
            pager,
            freemap,
            superblock,
        };
        Ok(Self::from_space(space, config))
    }

    fn from_space(space: Space<S>, config: StoreConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(StoreInner {
                space,
                config,
                trees: HashMap::new(),
                blobs: HashMap::new(),
                chains: ChainCache::default(),
            })),
        }
    }

    pub fn config(&self) -> StoreConfig {
        self.inner.lock().config.clone()
    }

    pub fn block_size(&self) -> usize {
        self.inner.lock().space.block_size()
    }

    /// Blocks handed out by the allocator and not yet freed.
    pub fn allocated_block_count(&self) -> u64 {
        self.inner.lock().space.superblock.allocated_blocks
    }

    /// Number of blocks the allocator currently addresses.
    pub fn database_size(&self) -> u64 {
        self.inner.lock().space.superblock.database_size
    }

    pub fn superblock(&self) -> Superblock {
        self.inner.lock().space.superblock.clone()
    }

    pub fn freemap_depth(&self) -> usize {
        self.inner.lock().space.freemap.depth()
    }

    pub fn allocate_block(&self) -> Result<BlockId> {
        self.inner.lock().space.allocate()
    }

    pub fn deallocate_block(&self, id: BlockId) -> Result<()> {
        self.inner.lock().space.free(id)
    }

    pub fn is_allocated(&self, id: BlockId) -> Result<bool> {
        self.inner.lock().space.is_allocated(id)
    }

    /// Raw read of an allocated block through the cache.
    pub fn read_block(&self, id: BlockId, buf: &mut [u8]) -> Result<()> {
        self.inner.lock().space.pager.read_block(id, buf)
    }

    /// Raw write of an allocated block through the cache.
    pub fn write_block(&self, id: BlockId, buf: &[u8]) -> Result<()> {
        self.inner.lock().space.pager.write_block(id, buf)
    }

    /// One of the block ids the superblock keeps for the caller (0 = unset).
    pub fn reserved_block(&self, slot: usize) -> Result<BlockId> {
        check_reserved_slot(slot)?;
        Ok(self.inner.lock().space.superblock.reserved[slot])
    }

    pub fn set_reserved_block(&self, slot: usize, id: BlockId) -> Result<()> {
        check_reserved_slot(slot)?;
        self.inner.lock().space.superblock.reserved[slot] = id;
        Ok(())
    }

    pub fn create_tree(&self, options: TreeOptions) -> Result<BTree<S>> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.prune();
        let meta = TreeMeta::create(&mut inner.space, &options)?;
        debug!(
            "store: created tree at block {} (order {})",
            meta.header,
            meta.layout.order()
        );
        let token = inner.register_tree(meta);
        Ok(BTree::new(self.clone(), token))
    }

    /// Opens the tree whose header lives at `header`. A tree that is already
    /// open keeps the comparator it was first opened with.
    pub fn open_tree(&self, header: BlockId, options: TreeOptions) -> Result<BTree<S>> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.prune();
        if let Some(token) = inner.trees.get(&header).and_then(|s| s.token.upgrade()) {
            return Ok(BTree::new(self.clone(), token));
        }
        let meta = TreeMeta::open(&mut inner.space, header, &options)?;
        let token = inner.register_tree(meta);
        Ok(BTree::new(self.clone(), token))
    }

    pub fn create_blob(&self) -> Result<Blob<S>> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.prune();
        let head = Chain::create(&mut inner.space)?;
        let token = inner.register_blob(head);
        Ok(Blob::new(self.clone(), token))
    }

    pub fn open_blob(&self, head: BlockId) -> Result<Blob<S>> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.prune();
        if let Some(token) = inner.blobs.get(&head).and_then(Weak::upgrade) {
            return Ok(Blob::new(self.clone(), token));
        }
        Chain::new(&mut inner.space, inner.chains.state(head), head).validate_head()?;
        let token = inner.register_blob(head);
        Ok(Blob::new(self.clone(), token))
    }

    /// Writes the superblock and every dirty page, then flushes the storage.
    pub fn flush(&self) -> Result<()> {
        self.inner.lock().space.flush()
    }

    pub fn pager_stats(&self) -> PagerStats {
        self.inner.lock().space.pager.stats()
    }

    /// Flushes and hands back the storage. Fails with `StoreInUse` while any
    /// other store clone or handle is alive.
    pub fn close(self) -> Result<S> {
        self.flush()?;
        let mutex = Arc::try_unwrap(self.inner).map_err(|_| StorageError::StoreInUse)?;
        let inner = mutex.into_inner();
        info!(
            "store: closed ({} of {} blocks allocated)",
            inner.space.superblock.allocated_blocks, inner.space.superblock.database_size
        );
        inner.space.pager.into_storage()
    }

    /// Runs `f` against a live tree.
    pub(crate) fn with_tree<R>(
        &self,
        token: &HandleToken,
        f: impl FnOnce(&mut Space<S>, &mut TreeMeta, &mut ChainCache) -> Result<R>,
    ) -> Result<R> {
        token.check()?;
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let slot = inner
            .trees
            .get_mut(&token.block)
            .ok_or(StorageError::HandleDropped(token.block))?;
        f(&mut inner.space, &mut slot.meta, &mut inner.chains)
    }

    /// Frees a tree and invalidates every handle on it.
    pub(crate) fn drop_tree(
        &self,
        token: &HandleToken,
        f: impl FnOnce(&mut Space<S>, &mut TreeMeta, &mut ChainCache) -> Result<()>,
    ) -> Result<()> {
        token.check()?;
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let mut slot = inner
            .trees
            .remove(&token.block)
            .ok_or(StorageError::HandleDropped(token.block))?;
        token.mark_dropped();
        f(&mut inner.space, &mut slot.meta, &mut inner.chains)?;
        debug!("store: dropped tree at block {}", token.block);
        Ok(())
    }

    /// Runs `f` against a live blob.
    pub(crate) fn with_chain<R>(
        &self,
        token: &HandleToken,
        f: impl FnOnce(&mut Chain<'_, S>) -> Result<R>,
    ) -> Result<R> {
        token.check()?;
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let state = inner.chains.state(token.block);
        let mut chain = Chain::new(&mut inner.space, state, token.block);
        f(&mut chain)
    }

    pub(crate) fn drop_blob(&self, token: &HandleToken) -> Result<()> {
        token.check()?;
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        token.mark_dropped();
        inner.blobs.remove(&token.block);
        let state = inner.chains.state(token.block);
        Chain::new(&mut inner.space, state, token.block).free_all()?;
        inner.chains.forget(token.block);
        debug!("store: dropped blob at block {}", token.block);
        Ok(())
    }
}

fn check_block_size<S: BlockStorage>(storage: &S, config: &StoreConfig) -> Result<()> {
    if storage.block_size() != config.block_size {
        return Err(StorageError::BlockSizeMismatch {
            expected: config.block_size,
            found: storage.block_size(),
        });
    }
    Ok(())
}

fn check_reserved_slot(slot: usize) -> Result<()> {
    if slot >= RESERVED_SLOTS {
        return Err(StorageError::InvalidConfig(format!(
            "reserved slot {} out of range (0..{})",
            slot, RESERVED_SLOTS
        )));
    }
    Ok(())
}
