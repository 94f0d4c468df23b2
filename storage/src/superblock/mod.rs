//! Block 0: engine identification and allocator bookkeeping.
//!
//! ```text
//! 0   magic            u32  0x810893ff
//! 4   version          u32  1
//! 8   block size       u32
//! 12  (padding)        u32
//! 16  freemap root     u64
//! 24  database size    u64  (blocks)
//! 32  allocated count  u64
//! 40  reserved[0]      u64
//! 48  reserved[1]      u64
//! ```

use crate::bytes_le::{put_u32, put_u64, u32_at, u64_at};
use crate::{BlockId, Result, StorageError};

pub const SUPERBLOCK_ID: BlockId = 0;
pub const SUPERBLOCK_MAGIC: u32 = 0x810893ff;
pub const SUPERBLOCK_VERSION: u32 = 1;
pub const RESERVED_SLOTS: usize = 2;

const ENCODED_SIZE: usize = 56;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub block_size: u32,
    pub freemap_root: BlockId,
    /// Number of blocks the freemap currently addresses.
    pub database_size: u64,
    /// Blocks handed out through the allocator and not yet returned.
    pub allocated_blocks: u64,
    pub reserved: [BlockId; RESERVED_SLOTS],
}

impl Superblock {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size: block_size as u32,
            freemap_root: 0,
            database_size: 0,
            allocated_blocks: 0,
            reserved: [0; RESERVED_SLOTS],
        }
    }

    pub fn encode(&self, buf: &mut [u8]) {
        buf[..ENCODED_SIZE].fill(0);
        put_u32(buf, 0, SUPERBLOCK_MAGIC);
        put_u32(buf, 4, SUPERBLOCK_VERSION);
        put_u32(buf, 8, self.block_size);
        put_u64(buf, 16, self.freemap_root);
        put_u64(buf, 24, self.database_size);
        put_u64(buf, 32, self.allocated_blocks);
        put_u64(buf, 40, self.reserved[0]);
        put_u64(buf, 48, self.reserved[1]);
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let magic = u32_at(buf, 0);
        if magic != SUPERBLOCK_MAGIC {
            return Err(StorageError::BadMagic {
                block: SUPERBLOCK_ID,
                expected: SUPERBLOCK_MAGIC,
                found: magic,
            });
        }
        let version = u32_at(buf, 4);
        if version != SUPERBLOCK_VERSION {
            return Err(StorageError::UnsupportedVersion {
                block: SUPERBLOCK_ID,
                version,
            });
        }

        let sb = Self {
            block_size: u32_at(buf, 8),
            freemap_root: u64_at(buf, 16),
            database_size: u64_at(buf, 24),
            allocated_blocks: u64_at(buf, 32),
            reserved: [u64_at(buf, 40), u64_at(buf, 48)],
        };
        if sb.freemap_root == SUPERBLOCK_ID || sb.freemap_root >= sb.database_size {
            return Err(StorageError::corrupted(
                SUPERBLOCK_ID,
                format!(
                    "freemap root {} outside database of {} blocks",
                    sb.freemap_root, sb.database_size
                ),
            ));
        }
        if sb.allocated_blocks > sb.database_size {
            return Err(StorageError::corrupted(
                SUPERBLOCK_ID,
                format!(
                    "{} allocated blocks in a database of {}",
                    sb.allocated_blocks, sb.database_size
                ),
            ));
        }
        Ok(sb)
    }
}
