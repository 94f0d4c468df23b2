//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::sync::Once;

use blockkv_storage::{BTree, BlockStorage, MemoryBlockStorage, Store, StoreConfig};
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Installs a fmt subscriber once per test binary. Set `RUST_LOG=debug` to
/// see the engine's log records.
pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn memory_store(block_size: usize) -> Store<MemoryBlockStorage> {
    init_tracing();
    let config = StoreConfig::default().with_block_size(block_size);
    Store::create(MemoryBlockStorage::new(block_size), config).expect("create store")
}

pub fn small_store(block_size: usize, cache_blocks: usize, grow_blocks: u64) -> Store<MemoryBlockStorage> {
    init_tracing();
    let config = StoreConfig::default()
        .with_block_size(block_size)
        .with_cache_blocks(cache_blocks)
        .with_grow_blocks(grow_blocks);
    Store::create(MemoryBlockStorage::new(block_size), config).expect("create store")
}

/// Counts the entries of `tree`, running the structural checker first when it
/// is compiled in.
pub fn checked_len<S: BlockStorage>(tree: &BTree<S>) -> blockkv_storage::Result<usize> {
    #[cfg(debug_assertions)]
    {
        tree.check_integrity()
    }
    #[cfg(not(debug_assertions))]
    {
        tree.len()
    }
}
