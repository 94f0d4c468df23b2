// storage/src/file/mod.rs

use crate::block::{check_len, check_range, BlockStorage};
use crate::{BlockId, Result, StorageError};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Magic number to identify our block files
const FILE_MAGIC: [u8; 4] = *b"BKV1";

const FILE_VERSION: u32 = 1;

/// Blocks start right after the file header.
const HEADER_SIZE: usize = 512;

#[derive(Debug, Clone, Copy)]
struct FileHeader {
    // Core identification (16 bytes)
    magic: [u8; 4],   // "BKV1"
    version: u32,     // File format version
    header_size: u32, // Size of this header (512)
    block_size: u32,  // Block size

    // Geometry (8 bytes)
    num_blocks: u64, // Blocks addressable in the file

    // Integrity (4 bytes)
    header_checksum: u32, // CRC32 of header
}

impl FileHeader {
    const CHECKSUM_OFFSET: usize = 24;

    fn new(block_size: usize) -> Self {
        Self {
            magic: FILE_MAGIC,
            version: FILE_VERSION,
            header_size: HEADER_SIZE as u32,
            block_size: block_size as u32,
            num_blocks: 0,
            header_checksum: 0,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.magic != FILE_MAGIC {
            return Err(StorageError::BadMagic {
                block: 0,
                expected: u32::from_le_bytes(FILE_MAGIC),
                found: u32::from_le_bytes(self.magic),
            });
        }

        if self.version > FILE_VERSION {
            return Err(StorageError::UnsupportedVersion {
                block: 0,
                version: self.version,
            });
        }

        if self.header_size as usize != HEADER_SIZE {
            return Err(StorageError::HeaderSizeMismatch {
                expected: HEADER_SIZE,
                found: self.header_size as usize,
            });
        }

        Ok(())
    }

    fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];

        bytes[0..4].copy_from_slice(&self.magic);
        bytes[4..8].copy_from_slice(&self.version.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.header_size.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.block_size.to_le_bytes());
        bytes[16..24].copy_from_slice(&self.num_blocks.to_le_bytes());
        bytes[24..28].copy_from_slice(&self.header_checksum.to_le_bytes());

        bytes
    }

    fn from_bytes(bytes: &[u8; HEADER_SIZE]) -> Result<Self> {
        let word = |off: usize| {
            u32::from_le_bytes([bytes[off], bytes[off + 1], bytes[off + 2], bytes[off + 3]])
        };
        let mut blocks = [0u8; 8];
        blocks.copy_from_slice(&bytes[16..24]);

        let header = Self {
            magic: [bytes[0], bytes[1], bytes[2], bytes[3]],
            version: word(4),
            header_size: word(8),
            block_size: word(12),
            num_blocks: u64::from_le_bytes(blocks),
            header_checksum: word(24),
        };

        header.validate()?;
        Ok(header)
    }

    fn compute_checksum(&self) -> u32 {
        let bytes = self.to_bytes();
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&bytes[..Self::CHECKSUM_OFFSET]); // Hash everything before checksum field
        hasher.update(&bytes[Self::CHECKSUM_OFFSET + 4..]); // and everything after it
        hasher.finalize()
    }

    fn update_checksum(&mut self) {
        self.header_checksum = self.compute_checksum();
    }

    fn verify_checksum(&self) -> bool {
        self.compute_checksum() == self.header_checksum
    }
}

/// Block storage persisted in a single file.
///
/// Layout: a 512-byte header followed by `num_blocks` blocks.
pub struct FileBlockStorage {
    file: File,
    header: FileHeader,
}

impl FileBlockStorage {
    pub fn create_new(path: &Path, block_size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;

        let mut storage = Self {
            file,
            header: FileHeader::new(block_size),
        };

        storage.write_header()?;

        Ok(storage)
    }

    pub fn open(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;

        let header = Self::read_header(&mut file)?;

        Ok(Self { file, header })
    }

    fn block_offset(&self, id: BlockId) -> u64 {
        HEADER_SIZE as u64 + id * self.header.block_size as u64
    }

    fn write_header(&mut self) -> Result<()> {
        self.header.update_checksum();

        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&self.header.to_bytes())?;

        Ok(())
    }

    fn read_header(file: &mut File) -> Result<FileHeader> {
        file.seek(SeekFrom::Start(0))?;

        let mut buffer = [0u8; HEADER_SIZE];
        file.read_exact(&mut buffer)?;

        let header = FileHeader::from_bytes(&buffer)?;

        if !header.verify_checksum() {
            return Err(StorageError::ChecksumMismatch("file header".to_string()));
        }

        Ok(header)
    }
}

impl BlockStorage for FileBlockStorage {
    fn block_size(&self) -> usize {
        self.header.block_size as usize
    }

    fn num_blocks(&self) -> u64 {
        self.header.num_blocks
    }

    fn set_num_blocks(&mut self, num_blocks: u64) -> Result<()> {
        let len = self.block_offset(num_blocks);
        self.file.set_len(len)?;
        self.header.num_blocks = num_blocks;
        self.write_header()
    }

    fn read_block(&mut self, id: BlockId, buf: &mut [u8]) -> Result<()> {
        check_range(id, self.header.num_blocks)?;
        check_len(buf.len(), self.block_size())?;

        let offset = self.block_offset(id);
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write_block(&mut self, id: BlockId, buf: &[u8]) -> Result<()> {
        check_range(id, self.header.num_blocks)?;
        check_len(buf.len(), self.block_size())?;

        let offset = self.block_offset(id);
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blocks.db");

        {
            let mut storage = FileBlockStorage::create_new(&path, 256).unwrap();
            storage.set_num_blocks(3).unwrap();
            let block = vec![0x5au8; 256];
            storage.write_block(2, &block).unwrap();
            storage.flush().unwrap();
        }

        let mut storage = FileBlockStorage::open(&path).unwrap();
        assert_eq!(storage.block_size(), 256);
        assert_eq!(storage.num_blocks(), 3);

        let mut buf = vec![0u8; 256];
        storage.read_block(2, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0x5a));
        storage.read_block(1, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_create_new_refuses_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blocks.db");
        FileBlockStorage::create_new(&path, 128).unwrap();
        assert!(FileBlockStorage::create_new(&path, 128).is_err());
    }

    #[test]
    fn test_corrupted_header_is_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blocks.db");
        {
            let mut storage = FileBlockStorage::create_new(&path, 128).unwrap();
            storage.set_num_blocks(1).unwrap();
        }

        // Flip a byte inside the block count
        let mut raw = std::fs::read(&path).unwrap();
        raw[17] ^= 0xff;
        std::fs::write(&path, &raw).unwrap();

        assert!(matches!(
            FileBlockStorage::open(&path),
            Err(StorageError::ChecksumMismatch(_))
        ));
    }

    #[test]
    fn test_wrong_magic_is_format_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("not-a-db");
        std::fs::write(&path, vec![0u8; HEADER_SIZE]).unwrap();

        let err = FileBlockStorage::open(&path).err().unwrap();
        assert_eq!(err.kind(), crate::ErrorKind::Format);
    }

    #[test]
    fn test_foreign_header_size_is_format_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blocks.db");
        FileBlockStorage::create_new(&path, 128).unwrap();

        let mut raw = std::fs::read(&path).unwrap();
        raw[8..12].copy_from_slice(&1024u32.to_le_bytes());
        std::fs::write(&path, &raw).unwrap();

        let err = FileBlockStorage::open(&path).err().unwrap();
        assert!(matches!(
            err,
            StorageError::HeaderSizeMismatch { expected: HEADER_SIZE, found: 1024 }
        ));
        assert_eq!(err.kind(), crate::ErrorKind::Format);
    }

    #[test]
    fn test_out_of_range_access() {
        let dir = tempdir().unwrap();
        let mut storage = FileBlockStorage::create_new(&dir.path().join("b"), 64).unwrap();
        let mut buf = vec![0u8; 64];
        assert!(storage.read_block(0, &mut buf).is_err());
    }
}
