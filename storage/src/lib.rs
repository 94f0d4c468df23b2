//! Storage engine for blockkv
//!
//! This crate provides the low-level storage primitives: a block device
//! abstraction, a pinned page cache over it, a hierarchical bitmap allocator
//! for block ids and an ordered B-tree whose oversized values spill into
//! linked overflow chains.
//!
//! ```text
//! Store ──┬── BTree ── Entry / ValueStream
//!         ├── Blob (overflow chain)
//!         ├── Freemap
//!         └── Pager ── BlockStorage (memory / file)
//! ```

pub mod block;
pub mod btree;
pub mod config;
pub mod file;
pub mod freemap;
pub mod overflow;
pub mod pager;
pub mod store;
pub mod superblock;

pub use block::{BlockStorage, MemoryBlockStorage};
pub use btree::{BTree, Entries, Entry, ValueStream};
pub use config::{KeyComparator, StoreConfig, TreeOptions};
pub use file::FileBlockStorage;
pub use overflow::Blob;
pub use pager::{PageGuard, Pager, PagerStats};
pub use store::Store;
pub use superblock::Superblock;

use thiserror::Error;

/// Identifier of one fixed-size block. Block 0 holds the superblock.
pub type BlockId = u64;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Block {block}: bad magic (expected {expected:#x}, found {found:#x})")]
    BadMagic {
        block: BlockId,
        expected: u32,
        found: u32,
    },

    #[error("Block {block}: unsupported format version {version:#x}")]
    UnsupportedVersion { block: BlockId, version: u32 },

    #[error("Block size mismatch: expected {expected}, found {found}")]
    BlockSizeMismatch { expected: usize, found: usize },

    #[error("File header size mismatch: expected {expected}, found {found}")]
    HeaderSizeMismatch { expected: usize, found: usize },

    #[error("Block {block} is corrupted: {reason}")]
    Corrupted { block: BlockId, reason: String },

    #[error("Checksum mismatch for {0}")]
    ChecksumMismatch(String),

    #[error("Key of {len} bytes exceeds the maximum of {max}")]
    KeyTooLong { len: usize, max: usize },

    #[error("Key already present in node {0}")]
    DuplicateKey(BlockId),

    #[error("Entry no longer exists in the tree")]
    EntryDeleted,

    #[error("Handle to block {0} was dropped")]
    HandleDropped(BlockId),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Store is still referenced by open handles")]
    StoreInUse,

    #[error("All {capacity} cached pages are pinned")]
    CacheExhausted { capacity: usize },

    #[error("No free block after growing the database to {size} blocks")]
    AllocationExhausted { size: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of a [`StorageError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Wrong engine, wrong version or wrong geometry.
    Format,
    /// Persisted data violates an on-disk invariant.
    Corruption,
    /// The caller (or the engine) broke an API contract.
    Contract,
    /// A bounded resource ran out.
    Exhausted,
    Io,
}

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::BadMagic { .. }
            | StorageError::UnsupportedVersion { .. }
            | StorageError::BlockSizeMismatch { .. }
            | StorageError::HeaderSizeMismatch { .. } => ErrorKind::Format,
            StorageError::Corrupted { .. } | StorageError::ChecksumMismatch(_) => {
                ErrorKind::Corruption
            }
            StorageError::KeyTooLong { .. }
            | StorageError::DuplicateKey(_)
            | StorageError::EntryDeleted
            | StorageError::HandleDropped(_)
            | StorageError::InvalidConfig(_)
            | StorageError::StoreInUse => ErrorKind::Contract,
            StorageError::CacheExhausted { .. } | StorageError::AllocationExhausted { .. } => {
                ErrorKind::Exhausted
            }
            StorageError::Io(_) => ErrorKind::Io,
        }
    }

    pub(crate) fn corrupted(block: BlockId, reason: impl Into<String>) -> Self {
        StorageError::Corrupted {
            block,
            reason: reason.into(),
        }
    }
}

impl From<StorageError> for std::io::Error {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Io(e) => e,
            other => std::io::Error::new(std::io::ErrorKind::Other, other),
        }
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Little-endian field helpers shared by the on-disk codecs.
pub(crate) mod bytes_le {
    pub fn u16_at(buf: &[u8], off: usize) -> u16 {
        u16::from_le_bytes([buf[off], buf[off + 1]])
    }

    pub fn u32_at(buf: &[u8], off: usize) -> u32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&buf[off..off + 4]);
        u32::from_le_bytes(raw)
    }

    pub fn u64_at(buf: &[u8], off: usize) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&buf[off..off + 8]);
        u64::from_le_bytes(raw)
    }

    pub fn put_u16(buf: &mut [u8], off: usize, v: u16) {
        buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
    }

    pub fn put_u32(buf: &mut [u8], off: usize, v: u32) {
        buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
    }

    pub fn put_u64(buf: &mut [u8], off: usize, v: u64) {
        buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let err = StorageError::BadMagic {
            block: 0,
            expected: 0x810893ff,
            found: 0,
        };
        assert_eq!(err.kind(), ErrorKind::Format);
        assert_eq!(StorageError::corrupted(3, "x").kind(), ErrorKind::Corruption);
        assert_eq!(
            StorageError::KeyTooLong { len: 9, max: 8 }.kind(),
            ErrorKind::Contract
        );
        assert_eq!(
            StorageError::AllocationExhausted { size: 64 }.kind(),
            ErrorKind::Exhausted
        );
    }

    #[test]
    fn test_error_display() {
        let err = StorageError::KeyTooLong { len: 70, max: 64 };
        assert_eq!(err.to_string(), "Key of 70 bytes exceeds the maximum of 64");
    }

    #[test]
    fn test_into_io_error() {
        let io: std::io::Error = StorageError::EntryDeleted.into();
        assert_eq!(io.kind(), std::io::ErrorKind::Other);
    }
}
