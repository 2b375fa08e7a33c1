//! In-memory inodes.
//!
//! The engine keeps a fixed table of in-use inodes as a synchronization
//! point for threads sharing a file. An entry is free when its reference
//! count is zero; `iget` finds or creates an entry and bumps the count,
//! `Lfs::iput` drops it and finalizes the on-disk inode when the last
//! reference to an unlinked inode goes away.
//!
//! Each inode carries two locks with distinct jobs:
//!
//! * `io`, a sleep lock held across the whole of a read, write, or truncate.
//!   It serializes the I/O path, where the thread may block in the buffer
//!   cache.
//! * `core`, a short spin lock over the working copy of the inode fields.
//!   The cleaner patches block addresses through `core` while relocating,
//!   without ever taking `io` — the thread whose allocation triggered the
//!   cleaner may itself be holding `io`.
//!
//! A writer therefore re-reads addresses from `core` at well-defined points
//! instead of assuming they are stable across its own buffer-cache calls.

use std::sync::{Arc, Mutex, MutexGuard};

use array_macro::array;

use crate::error::{Error, Result};
use crate::inode::{Dinode, InodeType};
use crate::lfs::Lfs;
use crate::param::{BSIZE, MAXFILE, NDIRECT, NINODE};
use crate::segment::SumKind;

pub(crate) struct InodeCore {
    /// Has the working copy been read from disk?
    pub valid: bool,
    pub d: Dinode,
}

/// An in-memory inode.
pub struct Inode {
    pub(crate) inum: u32,
    pub(crate) core: spin::Mutex<InodeCore>,
    pub(crate) io: Mutex<()>,
}

impl Inode {
    fn new(inum: u32) -> Self {
        Self {
            inum,
            core: spin::Mutex::new(InodeCore {
                valid: false,
                d: Dinode::zero(),
            }),
            io: Mutex::new(()),
        }
    }

    pub fn inum(&self) -> u32 {
        self.inum
    }
}

pub(crate) struct ItSlot {
    pub nref: u32,
    pub ip: Option<Arc<Inode>>,
}

/// The inode table. Guarded by a single spin lock; critical sections only
/// manipulate reference counts and slot assignment.
pub(crate) struct Itable {
    pub slots: spin::Mutex<[ItSlot; NINODE]>,
}

impl Itable {
    pub fn new() -> Self {
        Self {
            slots: spin::Mutex::new(array![_ => ItSlot { nref: 0, ip: None }; NINODE]),
        }
    }

    /// Finds or creates the entry for `inum` and takes a reference.
    /// Does not lock the inode and does not read it from disk.
    pub fn get(&self, inum: u32) -> Arc<Inode> {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots
            .iter_mut()
            .find(|s| s.ip.as_ref().is_some_and(|ip| ip.inum == inum))
        {
            slot.nref += 1;
            return slot.ip.as_ref().unwrap().clone();
        }
        let slot = slots
            .iter_mut()
            .find(|s| s.nref == 0)
            .expect("itable: no free in-memory inodes");
        let ip = Arc::new(Inode::new(inum));
        slot.nref = 1;
        slot.ip = Some(ip.clone());
        ip
    }

    /// The cached entry for `inum`, if any, without taking a reference.
    /// Used by the cleaner to patch relocated addresses into working copies.
    pub fn lookup(&self, inum: u32) -> Option<Arc<Inode>> {
        self.slots
            .lock()
            .iter()
            .filter_map(|s| s.ip.as_ref())
            .find(|ip| ip.inum == inum)
            .cloned()
    }
}

/// Holding an `InodeGuard` means holding the inode's `io` sleep lock; the
/// working copy has been read from disk.
pub struct InodeGuard<'a> {
    pub(crate) lfs: &'a Lfs,
    pub(crate) ip: &'a Arc<Inode>,
    pub(crate) _io: MutexGuard<'a, ()>,
}

impl InodeGuard<'_> {
    pub fn inum(&self) -> u32 {
        self.ip.inum
    }

    pub fn size(&self) -> u32 {
        self.ip.core.lock().d.size
    }

    pub fn typ(&self) -> Result<InodeType> {
        self.ip.core.lock().d.typ()
    }

    pub fn nlink(&self) -> i16 {
        self.ip.core.lock().d.nlink
    }

    pub fn version(&self) -> u32 {
        self.ip.core.lock().d.version
    }

    /// Sets the link count. Link management belongs to the (out-of-scope)
    /// directory layer; the engine only reacts to a count of zero when the
    /// last reference is put.
    pub fn set_nlink(&mut self, nlink: i16) -> Result<()> {
        self.ip.core.lock().d.nlink = nlink;
        self.update()
    }

    /// Copies the working copy into the dirty-inode buffer. Must be called
    /// after every change to a field that lives on disk.
    pub fn update(&mut self) -> Result<()> {
        let d = self.ip.core.lock().d;
        self.lfs.iupdate(self.ip.inum, d)
    }

    /// Resolves file block `bn` to its current disk address; 0 for a hole.
    fn map_block(&self, bn: usize) -> Result<u32> {
        if bn < NDIRECT {
            return Ok(self.ip.core.lock().d.addrs[bn]);
        }
        let bn = bn - NDIRECT;
        assert!(bn < MAXFILE - NDIRECT, "map_block: out of range");
        let indirect = self.ip.core.lock().d.indirect;
        if indirect == 0 {
            return Ok(0);
        }
        let buf = self.lfs.bcache().bread(indirect)?;
        Ok(buf.data().u32_at(bn))
    }

    /// Copies data out of the file into `dst` from offset `off`.
    /// Returns the number of bytes read.
    pub fn read(&mut self, dst: &mut [u8], off: u32) -> Result<usize> {
        let size = self.size();
        let mut n = dst.len() as u32;
        if off > size || off.wrapping_add(n) < off {
            return Ok(0);
        }
        if off + n > size {
            n = size - off;
        }

        let mut tot: u32 = 0;
        while tot < n {
            let pos = off + tot;
            let m = (n - tot).min(BSIZE as u32 - pos % BSIZE as u32);
            let begin = (pos % BSIZE as u32) as usize;
            let dst = &mut dst[tot as usize..(tot + m) as usize];

            let addr = self.map_block(pos as usize / BSIZE)?;
            if addr == 0 {
                // Hole left by a truncated-then-regrown file.
                dst.fill(0);
            } else {
                let buf = self.lfs.bcache().bread(addr)?;
                dst.copy_from_slice(&buf.data()[begin..begin + m as usize]);
            }
            tot += m;
        }
        Ok(tot as usize)
    }

    /// Appends `src` to the log at file offset `off`. Every block write
    /// allocates a fresh log block; the block previously mapped at that
    /// offset goes dead in the usage table.
    pub fn write(&mut self, src: &[u8], off: u32) -> Result<usize> {
        let size = self.size();
        let n = src.len() as u32;
        if off > size {
            return Err(Error::Invalid("write beyond end of file"));
        }
        if off.checked_add(n).ok_or(Error::Invalid("write overflows"))? as usize
            > MAXFILE * BSIZE
        {
            return Err(Error::Invalid("file too large"));
        }

        let mut tot: u32 = 0;
        while tot < n {
            let pos = off + tot;
            let bn = pos as usize / BSIZE;
            let begin = (pos % BSIZE as u32) as usize;
            let m = ((n - tot) as usize).min(BSIZE - begin);

            let version = self.version();
            let new = self
                .lfs
                .balloc(SumKind::Data, self.ip.inum, bn as u32, version)?;

            // Fill the new block: old contents for a partial overwrite,
            // caller bytes for the written range.
            let old = self.map_block(bn)?;
            {
                let mut nb = self.lfs.bcache().bzero(new);
                if old != 0 && (begin != 0 || m < BSIZE) {
                    let ob = self.lfs.bcache().bread(old)?;
                    nb.data_mut().copy_from(ob.data());
                }
                nb.data_mut()[begin..begin + m]
                    .copy_from_slice(&src[tot as usize..tot as usize + m]);
                nb.write()?;
            }

            // Install the new address. The address displaced at install
            // time — not the one sampled above — is the one that dies; the
            // cleaner may have moved the block in between.
            let prev = self.install_addr(bn, new)?;
            self.lfs.sut_update(new, BSIZE as i64);
            if prev != 0 {
                self.lfs.sut_update(prev, -(BSIZE as i64));
            }
            tot += m as u32;
        }

        {
            let mut core = self.ip.core.lock();
            if off + n > core.d.size {
                core.d.size = off + n;
            }
        }
        self.update()?;
        self.lfs.maybe_periodic_sync();
        Ok(tot as usize)
    }

    /// Points file block `bn` at `new`, returning the displaced address.
    fn install_addr(&mut self, bn: usize, new: u32) -> Result<u32> {
        if bn < NDIRECT {
            let mut core = self.ip.core.lock();
            let prev = core.d.addrs[bn];
            core.d.addrs[bn] = new;
            return Ok(prev);
        }

        let idx = bn - NDIRECT;
        loop {
            let indirect = self.ip.core.lock().d.indirect;
            if indirect == 0 {
                // First indirect use: allocate and seed the mapping block.
                let version = self.version();
                let ib = self
                    .lfs
                    .balloc(SumKind::Indirect, self.ip.inum, 0, version)?;
                let mut buf = self.lfs.bcache().bzero(ib);
                buf.data_mut().set_u32(idx, new);
                buf.write()?;
                self.ip.core.lock().d.indirect = ib;
                self.lfs.sut_update(ib, BSIZE as i64);
                return Ok(0);
            }

            let old_buf = self.lfs.bcache().bread(indirect)?;
            // An indirect block is installed only while the old block's
            // buffer lock is held, so the address is stable once we hold
            // that lock and it still matches.
            if self.ip.core.lock().d.indirect != indirect {
                continue;
            }
            // Copy-on-write, like any other mutation: patching the slot in
            // place would make the durable block under the last checkpoint
            // see a post-checkpoint pointer after a crash.
            let prev = old_buf.data().u32_at(idx);
            let version = self.version();
            let ind_new = self
                .lfs
                .balloc(SumKind::Indirect, self.ip.inum, 0, version)?;
            {
                let mut nb = self.lfs.bcache().bzero(ind_new);
                nb.data_mut().copy_from(old_buf.data());
                nb.data_mut().set_u32(idx, new);
                nb.write()?;
            }
            self.ip.core.lock().d.indirect = ind_new;
            drop(old_buf);
            self.lfs.sut_update(ind_new, BSIZE as i64);
            self.lfs.sut_update(indirect, -(BSIZE as i64));
            return Ok(prev);
        }
    }

    /// Truncates the file to zero length: every referenced block goes dead
    /// in the usage table and the version is bumped, severing stale summary
    /// entries from this inode for good.
    pub fn trunc(&mut self) -> Result<()> {
        let (addrs, indirect) = {
            let mut core = self.ip.core.lock();
            let addrs = core.d.addrs;
            let indirect = core.d.indirect;
            core.d.addrs = [0; NDIRECT];
            core.d.indirect = 0;
            core.d.size = 0;
            core.d.version += 1;
            (addrs, indirect)
        };

        for addr in addrs.into_iter().filter(|&a| a != 0) {
            self.lfs.sut_update(addr, -(BSIZE as i64));
        }
        if indirect != 0 {
            {
                let buf = self.lfs.bcache().bread(indirect)?;
                for idx in 0..BSIZE / 4 {
                    let addr = buf.data().u32_at(idx);
                    if addr != 0 {
                        self.lfs.sut_update(addr, -(BSIZE as i64));
                    }
                }
            }
            self.lfs.sut_update(indirect, -(BSIZE as i64));
        }
        self.update()
    }
}
