//! Superblock and the offline image builder.
//!
//! Disk layout:
//!
//! ```text
//! [ boot | superblock | checkpoint0 | checkpoint1 | log segments ... ]
//! ```
//!
//! `mkfs` computes the superblock and builds an initial file system: a root
//! inode packed into the first inode block, the imap and usage-table blocks
//! describing it, and identical sealed checkpoints in both slots. The
//! segments it fills carry no segment summary; the cleaner's safety scan
//! handles them. The superblock itself is written once and is read-only at
//! runtime.

use std::mem;

use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use crate::bio::{BufData, Bcache};
use crate::checkpoint::DCheckpoint;
use crate::disk::Disk;
use crate::error::{Error, Result};
use crate::imap::{ImapEntry, NENTRY};
use crate::inode::{put_dinode, Dinode, InodeType};
use crate::param::{BSIZE, MAXSEGS, NIMAP_BLOCKS, NINODES, NSUT_BLOCKS, SEGSIZE};
use crate::segusage::{DSegUsage, NSEG_PER_BLOCK, SEG_FREE};

/// Must be the first word of the superblock ("LFS!").
pub const FSMAGIC: u32 = 0x4C46_5321;

/// Fixed block numbers outside the log.
const SB_BLOCK: u32 = 1;
const CHKPT0_BLOCK: u32 = 2;
const CHKPT1_BLOCK: u32 = 3;
const LOG_START: u32 = 4;

/// Root directory inode.
pub const ROOTINO: u32 = 1;

#[repr(C)]
#[derive(Clone, AsBytes, FromBytes)]
pub struct Superblock {
    /// Must be FSMAGIC.
    magic: u32,

    /// Size of file system image (blocks).
    size: u32,

    /// Number of log segments.
    nsegs: u32,

    /// Blocks per segment.
    segsize: u32,

    /// First block of the log.
    segstart: u32,

    /// Maximum number of inodes.
    ninodes: u32,

    /// Block numbers of the two checkpoint slots.
    checkpoint0: u32,
    checkpoint1: u32,
}

const_assert!(mem::size_of::<Superblock>() <= BSIZE);

impl Superblock {
    /// Reads and validates the superblock from its fixed block.
    pub fn read(bcache: &Bcache) -> Result<Superblock> {
        let buf = bcache.bread(SB_BLOCK)?;
        let mut sb = Superblock {
            magic: 0,
            size: 0,
            nsegs: 0,
            segsize: 0,
            segstart: 0,
            ninodes: 0,
            checkpoint0: 0,
            checkpoint1: 0,
        };
        sb.as_bytes_mut()
            .copy_from_slice(&buf.data()[..mem::size_of::<Superblock>()]);
        if sb.magic != FSMAGIC {
            return Err(Error::Corrupt("bad superblock magic"));
        }
        if sb.segsize as usize != SEGSIZE
            || sb.nsegs as usize > MAXSEGS
            || sb.ninodes as usize > NINODES
            || sb.segstart + sb.nsegs * sb.segsize as u32 > sb.size
        {
            return Err(Error::Corrupt("bad superblock geometry"));
        }
        Ok(sb)
    }

    pub fn nsegs(&self) -> u32 {
        self.nsegs
    }

    pub fn ninodes(&self) -> u32 {
        self.ninodes
    }

    pub fn checkpoint_blocks(&self) -> (u32, u32) {
        (self.checkpoint0, self.checkpoint1)
    }

    /// Translates (segment number, block offset within segment) to a disk
    /// block number.
    pub fn seg_to_disk(&self, seg: u32, off: u32) -> u32 {
        debug_assert!(seg < self.nsegs && off < self.segsize);
        self.segstart + seg * self.segsize + off
    }

    /// True if `bno` lies inside the log.
    pub fn in_log(&self, bno: u32) -> bool {
        bno >= self.segstart && bno < self.segstart + self.nsegs * self.segsize
    }

    /// Segment that holds log block `bno`.
    pub fn seg_of(&self, bno: u32) -> u32 {
        assert!(self.in_log(bno), "block outside the log");
        (bno - self.segstart) / self.segsize
    }

    /// The reserved summary slot of a segment.
    pub fn ssb_block(&self, seg: u32) -> u32 {
        self.seg_to_disk(seg, self.segsize - 1)
    }
}

fn write_struct(disk: &dyn Disk, bno: u32, bytes: &[u8]) -> Result<()> {
    let mut data = BufData::zero();
    data[..bytes.len()].copy_from_slice(bytes);
    disk.write_block(bno, &data)
}

/// Builds a fresh file system on `disk`, consuming its whole capacity.
///
/// Segment 0 receives the root inode block followed by the imap and
/// usage-table blocks; every other segment starts on the free ring.
pub fn mkfs(disk: &dyn Disk) -> Result<()> {
    let nblocks = disk.nblocks();
    if nblocks <= LOG_START + SEGSIZE as u32 {
        return Err(Error::Invalid("disk too small"));
    }
    // The imap packs block addresses into 20 bits.
    if nblocks >= 1 << 20 {
        return Err(Error::Invalid("disk too large"));
    }
    let nsegs = ((nblocks - LOG_START) / SEGSIZE as u32).min(MAXSEGS as u32);
    let sut_nblocks = (nsegs as usize).div_ceil(NSEG_PER_BLOCK);

    let sb = Superblock {
        magic: FSMAGIC,
        size: nblocks,
        nsegs,
        segsize: SEGSIZE as u32,
        segstart: LOG_START,
        ninodes: NINODES as u32,
        checkpoint0: CHKPT0_BLOCK,
        checkpoint1: CHKPT1_BLOCK,
    };

    // Boot block and superblock.
    write_struct(disk, 0, &[])?;
    write_struct(disk, SB_BLOCK, sb.as_bytes())?;

    // Root inode, packed into slot 0 of the first log block.
    let inode_bno = sb.seg_to_disk(0, 0);
    let mut root = Dinode::zero();
    root.set_typ(InodeType::Dir);
    root.nlink = 1;
    let mut data = BufData::zero();
    put_dinode(&mut data, 0, &root);
    disk.write_block(inode_bno, &data)?;

    // Imap blocks: only the root mapping is non-zero.
    let mut imap_addrs = [0u32; NIMAP_BLOCKS];
    for (b, addr) in imap_addrs.iter_mut().enumerate() {
        *addr = sb.seg_to_disk(0, 1 + b as u32);
        let mut entries = [0u32; NENTRY];
        if b == ROOTINO as usize / NENTRY {
            entries[ROOTINO as usize % NENTRY] = ImapEntry::encode(inode_bno, 0, 0).raw();
        }
        write_struct(disk, *addr, entries.as_bytes())?;
    }

    // Usage table: segment 0 holds the blocks written above; the rest are
    // free. Entries beyond nsegs stay zero.
    let seg0_used = 1 + NIMAP_BLOCKS + sut_nblocks;
    let mut entries = [DSegUsage { live: 0, age: 0 }; MAXSEGS];
    entries[0].live = (seg0_used * BSIZE) as u32;
    for e in entries.iter_mut().take(nsegs as usize).skip(1) {
        e.live = SEG_FREE;
    }
    let mut sut_addrs = [0u32; NSUT_BLOCKS];
    for b in 0..sut_nblocks {
        let addr = sb.seg_to_disk(0, (1 + NIMAP_BLOCKS + b) as u32);
        sut_addrs[b] = addr;
        write_struct(
            disk,
            addr,
            entries[b * NSEG_PER_BLOCK..(b + 1) * NSEG_PER_BLOCK].as_bytes(),
        )?;
    }

    // Identical checkpoints in both slots. The runtime overwrites slot 0;
    // slot 1 survives as the fallback.
    let mut cp = DCheckpoint::zero();
    cp.cur_seg = 0;
    cp.seg_off = seg0_used as u32;
    cp.tail = sb.seg_to_disk(0, seg0_used as u32);
    cp.imap_addrs = imap_addrs;
    cp.imap_nblocks = NIMAP_BLOCKS as u32;
    cp.sut_addrs = sut_addrs;
    cp.sut_nblocks = sut_nblocks as u32;
    cp.seal(1);
    write_struct(disk, CHKPT0_BLOCK, cp.as_bytes())?;
    write_struct(disk, CHKPT1_BLOCK, cp.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod t {
    use super::*;
    use crate::disk::MemDisk;
    use std::sync::Arc;

    #[test]
    fn mkfs_writes_valid_superblock() {
        let disk = Arc::new(MemDisk::new(4 + 8 * SEGSIZE as u32));
        mkfs(disk.as_ref()).unwrap();

        let bcache = Bcache::new(disk);
        let sb = Superblock::read(&bcache).unwrap();
        assert_eq!(sb.nsegs(), 8);
        assert_eq!(sb.ninodes() as usize, NINODES);
        assert_eq!(sb.checkpoint_blocks(), (2, 3));

        let cp = crate::checkpoint::read_best(&bcache, &sb).unwrap().unwrap();
        assert_eq!(cp.header_timestamp, 1);
        assert_eq!(cp.cur_seg, 0);
        assert!(cp.seg_off > 0);
    }

    #[test]
    fn geometry_round_trip() {
        let disk = Arc::new(MemDisk::new(4 + 8 * SEGSIZE as u32));
        mkfs(disk.as_ref()).unwrap();
        let bcache = Bcache::new(disk);
        let sb = Superblock::read(&bcache).unwrap();

        let bno = sb.seg_to_disk(3, 17);
        assert_eq!(sb.seg_of(bno), 3);
        assert!(sb.in_log(bno));
        assert!(!sb.in_log(0));
        assert_eq!(sb.ssb_block(3), sb.seg_to_disk(3, SEGSIZE as u32 - 1));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let disk = Arc::new(MemDisk::new(4 + 8 * SEGSIZE as u32));
        let bcache = Bcache::new(disk);
        assert!(Superblock::read(&bcache).is_err());
    }
}
