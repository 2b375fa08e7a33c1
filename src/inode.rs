//! On-disk inodes and the dirty-inode buffer.
//!
//! An inode describes a single unnamed file: its type, link count, size,
//! per-inode version, and the list of blocks holding its content. Inodes are
//! packed `IPB` per block, and inode blocks live in the log like everything
//! else; the imap records where the newest image of each inode sits.
//!
//! Modified inodes are not written out one by one. They collect in the
//! dirty-inode buffer and are flushed as a single packed block, which is what
//! lets inode locations drift with the log instead of occupying a fixed
//! region. A second, parallel "flushing" buffer holds the images of a flush
//! in flight so that readers and concurrent updates never race against the
//! half-written block.

use std::mem;

use arrayvec::ArrayVec;
use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use crate::bio::BufData;
use crate::error::{Error, Result};
use crate::param::{BSIZE, NDIRECT};

/// Inodes per block.
pub const IPB: usize = BSIZE / mem::size_of::<Dinode>();

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum InodeType {
    None,
    Dir,
    File,
    Device { major: u16, minor: u16 },
}

/// On-disk inode structure.
// repr(C): this is the in-disk representation and must keep machine layout.
#[repr(C)]
#[derive(Copy, Clone, AsBytes, FromBytes)]
pub struct Dinode {
    /// File type; 0 means the slot is unallocated.
    pub typ: i16,

    /// Major device number (device inodes only).
    pub major: u16,

    /// Minor device number (device inodes only).
    pub minor: u16,

    /// Number of links to the inode.
    pub nlink: i16,

    /// Size of file (bytes).
    pub size: u32,

    /// Bumped on every truncate/free; distinguishes live log blocks from
    /// stale ones without reference counting.
    pub version: u32,

    /// Direct data block addresses.
    pub addrs: [u32; NDIRECT],

    /// Single-indirect block address.
    pub indirect: u32,
}

const_assert!(mem::size_of::<Dinode>() == 64);
const_assert!(BSIZE % mem::size_of::<Dinode>() == 0);
// The imap packs the slot index into 4 bits.
const_assert!(IPB <= 16);

impl Dinode {
    pub const fn zero() -> Self {
        Self {
            typ: 0,
            major: 0,
            minor: 0,
            nlink: 0,
            size: 0,
            version: 0,
            addrs: [0; NDIRECT],
            indirect: 0,
        }
    }

    pub fn typ(&self) -> Result<InodeType> {
        match self.typ {
            0 => Ok(InodeType::None),
            1 => Ok(InodeType::Dir),
            2 => Ok(InodeType::File),
            3 => Ok(InodeType::Device {
                major: self.major,
                minor: self.minor,
            }),
            _ => Err(Error::Corrupt("unknown inode type")),
        }
    }

    pub fn set_typ(&mut self, typ: InodeType) {
        match typ {
            InodeType::None => {
                self.typ = 0;
                self.major = 0;
                self.minor = 0;
            }
            InodeType::Dir => {
                self.typ = 1;
                self.major = 0;
                self.minor = 0;
            }
            InodeType::File => {
                self.typ = 2;
                self.major = 0;
                self.minor = 0;
            }
            InodeType::Device { major, minor } => {
                self.typ = 3;
                self.major = major;
                self.minor = minor;
            }
        }
    }
}

/// Copies the `slot`th inode image out of an inode block.
pub fn dinode_at(data: &BufData, slot: usize) -> Dinode {
    assert!(slot < IPB, "inode slot out of range");
    let mut d = Dinode::zero();
    let off = slot * mem::size_of::<Dinode>();
    d.as_bytes_mut()
        .copy_from_slice(&data[off..off + mem::size_of::<Dinode>()]);
    d
}

/// Writes an inode image into the `slot`th position of an inode block.
pub fn put_dinode(data: &mut BufData, slot: usize, d: &Dinode) {
    assert!(slot < IPB, "inode slot out of range");
    let off = slot * mem::size_of::<Dinode>();
    data[off..off + mem::size_of::<Dinode>()].copy_from_slice(d.as_bytes());
}

/// In-memory staging area for modified inodes awaiting a batched flush.
pub struct DirtyInodes {
    /// Inodes dirtied since the last flush, newest image per inum.
    live: ArrayVec<(u32, Dinode), IPB>,

    /// Images currently being packed and written. Kept separate so a flush
    /// in flight never races with new updates.
    flushing: ArrayVec<(u32, Dinode), IPB>,

    flush_in_progress: bool,
}

impl DirtyInodes {
    pub const fn new() -> Self {
        Self {
            live: ArrayVec::new_const(),
            flushing: ArrayVec::new_const(),
            flush_in_progress: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn flush_in_progress(&self) -> bool {
        self.flush_in_progress
    }

    /// Newest buffered image of `inum`, if any. The live half is newer than
    /// the flushing half.
    pub fn get(&self, inum: u32) -> Option<Dinode> {
        self.live
            .iter()
            .chain(self.flushing.iter())
            .find(|(i, _)| *i == inum)
            .map(|(_, d)| *d)
    }

    /// Updates the buffered image of `inum` in place, or appends it.
    /// Returns false when the buffer is full and the image was not taken;
    /// the caller must flush and retry.
    pub fn put(&mut self, inum: u32, d: Dinode) -> bool {
        if let Some(slot) = self.live.iter_mut().find(|(i, _)| *i == inum) {
            slot.1 = d;
            return true;
        }
        if self.live.is_full() {
            return false;
        }
        self.live.push((inum, d));
        true
    }

    /// Edits the live image of `inum` in place. Returns false on miss.
    pub fn edit<F: FnOnce(&mut Dinode)>(&mut self, inum: u32, f: F) -> bool {
        if let Some(slot) = self.live.iter_mut().find(|(i, _)| *i == inum) {
            f(&mut slot.1);
            return true;
        }
        false
    }

    /// Drops `inum` from the buffer on free. An image already in flight
    /// cannot be removed; its type is zeroed instead, which makes the flush
    /// skip its imap update.
    pub fn forget(&mut self, inum: u32) {
        self.live.retain(|(i, _)| *i != inum);
        for (i, d) in self.flushing.iter_mut() {
            if *i == inum {
                d.set_typ(InodeType::None);
            }
        }
    }

    /// Moves the live buffer into the flushing buffer and latches the flush.
    pub fn take_for_flush(&mut self) -> &[(u32, Dinode)] {
        assert!(!self.flush_in_progress, "dirty-inode flush already running");
        assert!(self.flushing.is_empty(), "flushing buffer not drained");
        self.flushing = mem::take(&mut self.live);
        self.flush_in_progress = true;
        &self.flushing
    }

    pub fn end_flush(&mut self) {
        self.flushing.clear();
        self.flush_in_progress = false;
    }

    /// Puts the images of a failed flush back into the live buffer so they
    /// are not lost. An image updated again while the flush was in flight
    /// is already newer in the live half and is kept as is. Returns how
    /// many images had to be dropped for lack of space.
    pub fn restore_flush(&mut self) -> usize {
        let images = mem::take(&mut self.flushing);
        let mut dropped = 0;
        for (inum, d) in images {
            if self.live.iter().any(|(i, _)| *i == inum) {
                continue;
            }
            if self.live.is_full() {
                dropped += 1;
                continue;
            }
            self.live.push((inum, d));
        }
        self.flush_in_progress = false;
        dropped
    }
}

#[cfg(test)]
mod t {
    use super::*;

    #[test]
    fn type_round_trip() {
        let mut d = Dinode::zero();
        for typ in [
            InodeType::None,
            InodeType::Dir,
            InodeType::File,
            InodeType::Device { major: 3, minor: 7 },
        ] {
            d.set_typ(typ);
            assert_eq!(d.typ().unwrap(), typ);
        }
        d.typ = 9;
        assert!(d.typ().is_err());
    }

    #[test]
    fn pack_unpack_slots() {
        let mut data = crate::bio::BufData::zero();
        let mut d = Dinode::zero();
        d.set_typ(InodeType::File);
        d.size = 4096;
        d.addrs[0] = 77;
        put_dinode(&mut data, 5, &d);

        let out = dinode_at(&data, 5);
        assert_eq!(out.size, 4096);
        assert_eq!(out.addrs[0], 77);
        assert_eq!(dinode_at(&data, 4).typ, 0);
    }

    #[test]
    fn dirty_buffer_shadows_flushing() {
        let mut dirty = DirtyInodes::new();
        let mut d = Dinode::zero();
        d.size = 1;
        dirty.put(9, d);

        dirty.take_for_flush();
        assert_eq!(dirty.get(9).unwrap().size, 1);

        // A newer image in the live half wins over the one in flight.
        d.size = 2;
        dirty.put(9, d);
        assert_eq!(dirty.get(9).unwrap().size, 2);

        dirty.end_flush();
        assert_eq!(dirty.get(9).unwrap().size, 2);
    }

    #[test]
    fn forget_zeroes_in_flight_images() {
        let mut dirty = DirtyInodes::new();
        let mut d = Dinode::zero();
        d.set_typ(InodeType::File);
        dirty.put(4, d);
        dirty.take_for_flush();

        dirty.forget(4);
        assert_eq!(dirty.get(4).unwrap().typ, 0);
    }
}
