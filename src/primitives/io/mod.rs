#![forbid(unsafe_code)]

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::Path;

use parking_lot::Mutex;

use crate::types::{page::PAGE_SIZE, BlockNumber, ColstoreError, Result};

/// Block-granular storage behind a buffer pool.
///
/// Every transfer moves exactly one `PAGE_SIZE` image. Writing the block
/// just past the end grows the relation by one block.
pub trait FileIo: Send + Sync + 'static {
    /// Reads `block` into `dst`.
    fn read_block(&self, block: BlockNumber, dst: &mut [u8]) -> Result<()>;
    /// Writes `src` as the new image of `block`.
    fn write_block(&self, block: BlockNumber, src: &[u8]) -> Result<()>;
    /// Number of whole blocks stored. A trailing partial block is ignored.
    fn nblocks(&self) -> Result<u32>;
    /// Makes completed writes durable.
    fn sync(&self) -> Result<()>;
}

fn block_offset(block: BlockNumber) -> Result<u64> {
    if !block.is_valid() {
        return Err(ColstoreError::Invalid("invalid block number"));
    }
    Ok(block.0 as u64 * PAGE_SIZE as u64)
}

fn check_len(buf: &[u8]) -> Result<()> {
    if buf.len() != PAGE_SIZE {
        return Err(ColstoreError::Invalid("block transfer must be one page"));
    }
    Ok(())
}

fn blocks_in(len: u64) -> Result<u32> {
    u32::try_from(len / PAGE_SIZE as u64).map_err(|_| ColstoreError::Invalid("relation too large"))
}

/// Relation file on the local filesystem.
pub struct StdFileIo {
    file: Mutex<File>,
}

impl StdFileIo {
    pub fn new(file: File) -> Self {
        Self {
            file: Mutex::new(file),
        }
    }

    /// Opens `path` for reading and writing, creating an empty file when it
    /// does not exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self::new(file))
    }
}

impl FileIo for StdFileIo {
    fn read_block(&self, block: BlockNumber, dst: &mut [u8]) -> Result<()> {
        check_len(dst)?;
        let off = block_offset(block)?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(off))?;
        file.read_exact(dst).map_err(|err| match err.kind() {
            ErrorKind::UnexpectedEof => ColstoreError::PageCorruption {
                block,
                detail: "relation file ends inside the block",
            },
            _ => ColstoreError::Io(err),
        })
    }

    fn write_block(&self, block: BlockNumber, src: &[u8]) -> Result<()> {
        check_len(src)?;
        let off = block_offset(block)?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(off))?;
        file.write_all(src)?;
        Ok(())
    }

    fn nblocks(&self) -> Result<u32> {
        blocks_in(self.file.lock().metadata()?.len())
    }

    fn sync(&self) -> Result<()> {
        self.file.lock().sync_data()?;
        Ok(())
    }
}

/// Volatile relation held in memory, one buffer per block.
#[derive(Default)]
pub struct MemFileIo {
    blocks: Mutex<Vec<Box<[u8]>>>,
}

impl MemFileIo {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FileIo for MemFileIo {
    fn read_block(&self, block: BlockNumber, dst: &mut [u8]) -> Result<()> {
        check_len(dst)?;
        let blocks = self.blocks.lock();
        let src = blocks
            .get(block.0 as usize)
            .filter(|_| block.is_valid())
            .ok_or(ColstoreError::PageCorruption {
                block,
                detail: "block beyond end of in-memory relation",
            })?;
        dst.copy_from_slice(src);
        Ok(())
    }

    fn write_block(&self, block: BlockNumber, src: &[u8]) -> Result<()> {
        check_len(src)?;
        block_offset(block)?;
        let mut blocks = self.blocks.lock();
        let idx = block.0 as usize;
        if idx > blocks.len() {
            return Err(ColstoreError::Invalid("write leaves a hole in the relation"));
        }
        if idx == blocks.len() {
            blocks.push(src.to_vec().into_boxed_slice());
        } else {
            blocks[idx].copy_from_slice(src);
        }
        Ok(())
    }

    fn nblocks(&self) -> Result<u32> {
        blocks_in(self.blocks.lock().len() as u64 * PAGE_SIZE as u64)
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}
