//! Buffer cache.
//!
//! The buffer cache is a fixed pool of block-sized buffers holding cached
//! copies of disk blocks. Caching reduces disk reads and provides a
//! synchronization point for blocks used by multiple threads.
//!
//! Interface:
//! * To get a pinned buffer for a particular block, call `bread` (or `bzero`
//!   for a buffer that will be fully overwritten).
//! * After changing buffer data, call `Buf::write` to push it to disk.
//! * Dropping the `Buf` unpins it; pins therefore cannot leak across early
//!   returns or panics.
//! * Only one thread at a time can use a buffer, so do not keep one longer
//!   than necessary.
//!
//! Lock order: the pool metadata is a spin lock and is never held across
//! the per-buffer sleep locks or disk I/O.

use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard};

use array_macro::array;

use crate::disk::Disk;
use crate::error::Result;
use crate::param::{BSIZE, NBUF};

/// Data in a buffer is reinterpreted as on-disk structs built of 32-bit
/// words, so it carries an explicit alignment.
#[repr(align(8))]
pub struct BufData([u8; BSIZE]);

impl BufData {
    pub(crate) const fn zero() -> Self {
        Self([0; BSIZE])
    }

    pub fn copy_from(&mut self, other: &BufData) {
        self.0.copy_from_slice(&other.0);
    }

    /// Reads the `idx`th 32-bit word, as in an indirect or imap block.
    pub fn u32_at(&self, idx: usize) -> u32 {
        let off = idx * 4;
        u32::from_ne_bytes(self.0[off..off + 4].try_into().unwrap())
    }

    /// Writes the `idx`th 32-bit word.
    pub fn set_u32(&mut self, idx: usize, val: u32) {
        let off = idx * 4;
        self.0[off..off + 4].copy_from_slice(&val.to_ne_bytes());
    }
}

impl Deref for BufData {
    type Target = [u8; BSIZE];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for BufData {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

struct BufMeta {
    bno: u32,
    nref: u32,
    /// Has data been read from disk?
    valid: bool,
    last_use: u64,
}

struct Pool {
    slots: [BufMeta; NBUF],
    tick: u64,
}

pub struct Bcache {
    disk: Arc<dyn Disk>,
    pool: spin::Mutex<Pool>,
    data: [Mutex<BufData>; NBUF],
}

/// A pinned, locked buffer. Dropping it unlocks and unpins.
pub struct Buf<'a> {
    cache: &'a Bcache,
    idx: usize,
    bno: u32,
    guard: ManuallyDrop<MutexGuard<'a, BufData>>,
}

impl Bcache {
    pub fn new(disk: Arc<dyn Disk>) -> Self {
        Self {
            disk,
            pool: spin::Mutex::new(Pool {
                slots: array![_ => BufMeta { bno: 0, nref: 0, valid: false, last_use: 0 }; NBUF],
                tick: 0,
            }),
            data: array![_ => Mutex::new(BufData::zero()); NBUF],
        }
    }

    /// Pins a slot for `bno`, reusing a cached mapping or claiming the
    /// least-recently-used free slot.
    fn pin(&self, bno: u32) -> usize {
        let mut pool = self.pool.lock();
        if let Some(idx) = pool
            .slots
            .iter()
            .position(|s| s.bno == bno && (s.nref > 0 || s.valid))
        {
            pool.slots[idx].nref += 1;
            return idx;
        }
        let idx = pool
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.nref == 0)
            .min_by_key(|(_, s)| s.last_use)
            .map(|(i, _)| i)
            .expect("bio: no buffers");
        let slot = &mut pool.slots[idx];
        slot.bno = bno;
        slot.nref = 1;
        slot.valid = false;
        idx
    }

    fn unpin(&self, idx: usize) {
        let mut pool = self.pool.lock();
        pool.tick += 1;
        let tick = pool.tick;
        let slot = &mut pool.slots[idx];
        assert!(slot.nref > 0, "bio: unpin of unpinned buffer");
        slot.nref -= 1;
        slot.last_use = tick;
    }

    /// Returns a locked buffer with the contents of block `bno`.
    pub fn bread(&self, bno: u32) -> Result<Buf<'_>> {
        assert!(bno < self.disk.nblocks(), "bio: block out of range");
        let idx = self.pin(bno);
        let mut guard = self.data[idx].lock().unwrap();
        // Re-check under the lock: a concurrent reader may have loaded it.
        let valid = self.pool.lock().slots[idx].valid;
        if !valid {
            if let Err(e) = self.disk.read_block(bno, &mut guard) {
                drop(guard);
                self.unpin(idx);
                return Err(e);
            }
            self.pool.lock().slots[idx].valid = true;
        }
        Ok(Buf {
            cache: self,
            idx,
            bno,
            guard: ManuallyDrop::new(guard),
        })
    }

    /// Returns a locked buffer for block `bno` with its contents zeroed,
    /// skipping the disk read. For blocks about to be fully overwritten.
    pub fn bzero(&self, bno: u32) -> Buf<'_> {
        assert!(bno < self.disk.nblocks(), "bio: block out of range");
        let idx = self.pin(bno);
        let mut guard = self.data[idx].lock().unwrap();
        guard.0.fill(0);
        self.pool.lock().slots[idx].valid = true;
        Buf {
            cache: self,
            idx,
            bno,
            guard: ManuallyDrop::new(guard),
        }
    }
}

impl Buf<'_> {
    pub fn data(&self) -> &BufData {
        &self.guard
    }

    pub fn data_mut(&mut self) -> &mut BufData {
        &mut self.guard
    }

    /// Writes the buffer contents through to disk.
    pub fn write(&mut self) -> Result<()> {
        self.cache.disk.write_block(self.bno, &self.guard)
    }
}

impl Drop for Buf<'_> {
    fn drop(&mut self) {
        // SAFETY: self is being dropped; the guard is not touched again.
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        self.cache.unpin(self.idx);
    }
}

#[cfg(test)]
mod t {
    use super::*;
    use crate::disk::MemDisk;

    fn harness(nblocks: u32) -> Bcache {
        Bcache::new(Arc::new(MemDisk::new(nblocks)))
    }

    #[test]
    fn read_write_read() {
        let cache = harness(64);
        {
            let mut buf = cache.bzero(7);
            buf.data_mut()[0] = 0x42;
            buf.write().unwrap();
        }
        let buf = cache.bread(7).unwrap();
        assert_eq!(buf.data()[0], 0x42);
    }

    #[test]
    fn cache_hit_keeps_unwritten_data() {
        let cache = harness(64);
        {
            let mut buf = cache.bzero(3);
            buf.data_mut()[9] = 9;
            // No write: the data lives only in the cache.
        }
        let buf = cache.bread(3).unwrap();
        assert_eq!(buf.data()[9], 9);
    }

    #[test]
    fn eviction_reloads_from_disk() {
        let cache = harness(NBUF as u32 * 4);
        {
            let mut buf = cache.bzero(0);
            buf.data_mut()[0] = 1;
            buf.write().unwrap();
        }
        // Touch enough other blocks to evict block 0.
        for bno in 1..=NBUF as u32 {
            let _ = cache.bread(bno).unwrap();
        }
        let buf = cache.bread(0).unwrap();
        assert_eq!(buf.data()[0], 1);
    }

    #[test]
    fn pins_are_released_on_drop() {
        let cache = harness(NBUF as u32 * 4);
        for round in 0..4 {
            for i in 0..NBUF as u32 {
                let _ = cache.bread(round * NBUF as u32 + i).unwrap();
            }
        }
    }
}
