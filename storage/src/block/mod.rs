//! Block device abstraction.
//!
//! A block storage has a fixed block size and a growable number of blocks,
//! addressed by [`BlockId`]. Everything above the pager reaches storage only
//! through this trait.

use crate::{BlockId, Result, StorageError};

pub trait BlockStorage: Send {
    /// Size of every block in bytes.
    fn block_size(&self) -> usize;

    /// Current number of addressable blocks.
    fn num_blocks(&self) -> u64;

    /// Grows (or shrinks) the device. New blocks read back as zeroes.
    fn set_num_blocks(&mut self, num_blocks: u64) -> Result<()>;

    /// Reads block `id` into `buf`, which must be exactly one block long.
    fn read_block(&mut self, id: BlockId, buf: &mut [u8]) -> Result<()>;

    /// Writes `buf`, exactly one block long, to block `id`.
    fn write_block(&mut self, id: BlockId, buf: &[u8]) -> Result<()>;

    /// Makes previous writes durable.
    fn flush(&mut self) -> Result<()>;
}

pub(crate) fn check_range(id: BlockId, num_blocks: u64) -> Result<()> {
    if id >= num_blocks {
        return Err(StorageError::corrupted(
            id,
            format!("block id beyond device end ({} blocks)", num_blocks),
        ));
    }
    Ok(())
}

pub(crate) fn check_len(buf_len: usize, block_size: usize) -> Result<()> {
    if buf_len != block_size {
        return Err(StorageError::BlockSizeMismatch {
            expected: block_size,
            found: buf_len,
        });
    }
    Ok(())
}

/// Volatile block storage kept entirely in memory.
#[derive(Debug, Clone)]
pub struct MemoryBlockStorage {
    block_size: usize,
    blocks: Vec<Box<[u8]>>,
    flushes: u64,
}

impl MemoryBlockStorage {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            blocks: Vec::new(),
            flushes: 0,
        }
    }

    /// Number of times `flush` has been called.
    pub fn flush_count(&self) -> u64 {
        self.flushes
    }
}

impl BlockStorage for MemoryBlockStorage {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn num_blocks(&self) -> u64 {
        self.blocks.len() as u64
    }

    fn set_num_blocks(&mut self, num_blocks: u64) -> Result<()> {
        let size = self.block_size;
        self.blocks
            .resize_with(num_blocks as usize, || vec![0u8; size].into_boxed_slice());
        Ok(())
    }

    fn read_block(&mut self, id: BlockId, buf: &mut [u8]) -> Result<()> {
        check_range(id, self.num_blocks())?;
        check_len(buf.len(), self.block_size)?;
        buf.copy_from_slice(&self.blocks[id as usize]);
        Ok(())
    }

    fn write_block(&mut self, id: BlockId, buf: &[u8]) -> Result<()> {
        check_range(id, self.num_blocks())?;
        check_len(buf.len(), self.block_size)?;
        self.blocks[id as usize].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.flushes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_storage_grows_zeroed() {
        let mut storage = MemoryBlockStorage::new(64);
        assert_eq!(storage.num_blocks(), 0);
        storage.set_num_blocks(4).unwrap();
        assert_eq!(storage.num_blocks(), 4);

        let mut buf = vec![0xffu8; 64];
        storage.read_block(3, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_memory_storage_round_trip() {
        let mut storage = MemoryBlockStorage::new(64);
        storage.set_num_blocks(2).unwrap();
        let data: Vec<u8> = (0..64).collect();
        storage.write_block(1, &data).unwrap();

        let mut buf = vec![0u8; 64];
        storage.read_block(1, &mut buf).unwrap();
        assert_eq!(buf, data);
    }

    #[test]
    fn test_memory_storage_rejects_out_of_range() {
        let mut storage = MemoryBlockStorage::new(64);
        storage.set_num_blocks(1).unwrap();
        let mut buf = vec![0u8; 64];
        assert!(storage.read_block(1, &mut buf).is_err());
        assert!(storage.write_block(0, &buf[..32]).is_err());
    }
}
