//! Block devices.
//!
//! The engine talks to storage through the [`Disk`] trait, one block at a
//! time. Writes are assumed to become durable in issue order per block.
//! [`FileDisk`] backs the log with a regular file; [`MemDisk`] keeps it in
//! memory and can snapshot itself, which the crash-recovery tests use to
//! "cut the power" at a chosen instant.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::RwLock;

use crate::error::{Error, Result};
use crate::param::BSIZE;

pub trait Disk: Send + Sync {
    /// Reads block `bno` into `data`. May block.
    fn read_block(&self, bno: u32, data: &mut [u8; BSIZE]) -> Result<()>;

    /// Writes `data` to block `bno`. May block.
    fn write_block(&self, bno: u32, data: &[u8; BSIZE]) -> Result<()>;

    /// Device capacity in blocks.
    fn nblocks(&self) -> u32;
}

/// A disk backed by a regular file.
pub struct FileDisk {
    file: File,
    nblocks: u32,
}

impl FileDisk {
    /// Opens an existing image file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::options().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len % BSIZE as u64 != 0 {
            return Err(Error::Corrupt("image size is not block aligned"));
        }
        Ok(Self {
            file,
            nblocks: (len / BSIZE as u64) as u32,
        })
    }

    /// Creates (or truncates) an image file of `nblocks` blocks.
    pub fn create<P: AsRef<Path>>(path: P, nblocks: u32) -> Result<Self> {
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(nblocks as u64 * BSIZE as u64)?;
        Ok(Self { file, nblocks })
    }

    fn check(&self, bno: u32) -> Result<u64> {
        if bno >= self.nblocks {
            return Err(Error::Corrupt("block number beyond device"));
        }
        Ok(bno as u64 * BSIZE as u64)
    }
}

impl Disk for FileDisk {
    fn read_block(&self, bno: u32, data: &mut [u8; BSIZE]) -> Result<()> {
        let off = self.check(bno)?;
        self.file.read_exact_at(data, off)?;
        Ok(())
    }

    fn write_block(&self, bno: u32, data: &[u8; BSIZE]) -> Result<()> {
        let off = self.check(bno)?;
        self.file.write_all_at(data, off)?;
        Ok(())
    }

    fn nblocks(&self) -> u32 {
        self.nblocks
    }
}

/// An in-memory disk.
pub struct MemDisk {
    blocks: RwLock<Vec<u8>>,
}

impl MemDisk {
    pub fn new(nblocks: u32) -> Self {
        Self {
            blocks: RwLock::new(vec![0; nblocks as usize * BSIZE]),
        }
    }

    /// Returns an independent copy of the current device contents. Mounting
    /// the copy is equivalent to recovering from a crash at this instant.
    pub fn snapshot(&self) -> MemDisk {
        MemDisk {
            blocks: RwLock::new(self.blocks.read().unwrap().clone()),
        }
    }

    fn range(&self, bno: u32) -> Result<std::ops::Range<usize>> {
        let start = bno as usize * BSIZE;
        if start + BSIZE > self.blocks.read().unwrap().len() {
            return Err(Error::Corrupt("block number beyond device"));
        }
        Ok(start..start + BSIZE)
    }
}

impl Disk for MemDisk {
    fn read_block(&self, bno: u32, data: &mut [u8; BSIZE]) -> Result<()> {
        let range = self.range(bno)?;
        data.copy_from_slice(&self.blocks.read().unwrap()[range]);
        Ok(())
    }

    fn write_block(&self, bno: u32, data: &[u8; BSIZE]) -> Result<()> {
        let range = self.range(bno)?;
        self.blocks.write().unwrap()[range].copy_from_slice(data);
        Ok(())
    }

    fn nblocks(&self) -> u32 {
        (self.blocks.read().unwrap().len() / BSIZE) as u32
    }
}

#[cfg(test)]
mod t {
    use super::*;

    #[test]
    fn memdisk_round_trip() {
        let disk = MemDisk::new(8);
        let mut block = [0u8; BSIZE];
        block[0] = 0xAB;
        block[BSIZE - 1] = 0xCD;
        disk.write_block(5, &block).unwrap();

        let mut out = [0u8; BSIZE];
        disk.read_block(5, &mut out).unwrap();
        assert_eq!(out[0], 0xAB);
        assert_eq!(out[BSIZE - 1], 0xCD);
    }

    #[test]
    fn memdisk_out_of_range() {
        let disk = MemDisk::new(2);
        let mut block = [0u8; BSIZE];
        assert!(disk.read_block(2, &mut block).is_err());
    }

    #[test]
    fn snapshot_is_independent() {
        let disk = MemDisk::new(4);
        let block = [0x11u8; BSIZE];
        disk.write_block(1, &block).unwrap();

        let snap = disk.snapshot();
        let block2 = [0x22u8; BSIZE];
        disk.write_block(1, &block2).unwrap();

        let mut out = [0u8; BSIZE];
        snap.read_block(1, &mut out).unwrap();
        assert_eq!(out[0], 0x11);
    }

    #[test]
    fn filedisk_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let disk = FileDisk::create(&path, 16).unwrap();
        let block = [0x5Au8; BSIZE];
        disk.write_block(3, &block).unwrap();
        drop(disk);

        let disk = FileDisk::open(&path).unwrap();
        assert_eq!(disk.nblocks(), 16);
        let mut out = [0u8; BSIZE];
        disk.read_block(3, &mut out).unwrap();
        assert_eq!(out, block);
    }
}
