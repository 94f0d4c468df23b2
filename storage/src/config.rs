//! Store and tree configuration.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{Result, StorageError};

pub const MIN_BLOCK_SIZE: usize = 64;
pub const MAX_BLOCK_SIZE: usize = 65536;

/// Orders two keys. Must be a total order consistent across reopens.
pub type KeyComparator = Arc<dyn Fn(&[u8], &[u8]) -> Ordering + Send + Sync>;

/// Geometry and cache sizing of a store.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct StoreConfig {
    /// Size of every block in bytes (power of two, 64..=65536).
    pub block_size: usize,
    /// Number of blocks the pager keeps in memory.
    pub cache_blocks: usize,
    /// Number of blocks added to the database when the freemap runs dry.
    pub grow_blocks: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            block_size: 4096,
            cache_blocks: 256,
            grow_blocks: 64,
        }
    }
}

impl StoreConfig {
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_cache_blocks(mut self, cache_blocks: usize) -> Self {
        self.cache_blocks = cache_blocks;
        self
    }

    pub fn with_grow_blocks(mut self, grow_blocks: u64) -> Self {
        self.grow_blocks = grow_blocks;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !self.block_size.is_power_of_two()
            || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&self.block_size)
        {
            return Err(StorageError::InvalidConfig(format!(
                "block size {} is not a power of two in {}..={}",
                self.block_size, MIN_BLOCK_SIZE, MAX_BLOCK_SIZE
            )));
        }
        if self.cache_blocks < 8 {
            return Err(StorageError::InvalidConfig(format!(
                "cache of {} blocks is too small (minimum 8)",
                self.cache_blocks
            )));
        }
        if self.grow_blocks < 2 {
            return Err(StorageError::InvalidConfig(format!(
                "grow increment of {} blocks is too small (minimum 2)",
                self.grow_blocks
            )));
        }
        Ok(())
    }
}

/// Per-tree options. The maximum key length is persisted in the tree header;
/// the comparator is supplied again on every open.
#[derive(Clone)]
pub struct TreeOptions {
    pub max_key_length: u16,
    pub comparator: KeyComparator,
}

impl TreeOptions {
    pub fn new(max_key_length: u16) -> Self {
        Self {
            max_key_length,
            ..Self::default()
        }
    }

    pub fn with_comparator<F>(mut self, cmp: F) -> Self
    where
        F: Fn(&[u8], &[u8]) -> Ordering + Send + Sync + 'static,
    {
        self.comparator = Arc::new(cmp);
        self
    }
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            max_key_length: 64,
            comparator: Arc::new(|a: &[u8], b: &[u8]| a.cmp(b)),
        }
    }
}

impl fmt::Debug for TreeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TreeOptions")
            .field("max_key_length", &self.max_key_length)
            .finish_non_exhaustive()
    }
}
