//! Segment usage table.
//!
//! One entry per segment: a live-byte count and the tick of the last
//! modification. The counts are a victim-selection heuristic, not a
//! correctness input — relocation decides liveness by resolving inode paths,
//! so the subtracts here saturate rather than assert.
//!
//! A live count of all-ones is the free sentinel: the segment is on the free
//! ring and the cleaner must skip it. The table is persisted through the
//! checkpoint with the same partial-update scheme as the imap.

use std::mem;

use arrayvec::ArrayVec;
use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use crate::bio::{Bcache, BufData};
use crate::error::Result;
use crate::param::{BSIZE, MAXSEGS, NSUT_BLOCKS, SEGDATA};

/// Live-byte value marking a segment as free.
pub const SEG_FREE: u32 = u32::MAX;

/// Entries per table block.
pub const NSEG_PER_BLOCK: usize = BSIZE / mem::size_of::<DSegUsage>();

/// On-disk per-segment usage record.
#[repr(C)]
#[derive(Copy, Clone, AsBytes, FromBytes)]
pub struct DSegUsage {
    /// Live payload bytes, or `SEG_FREE`.
    pub live: u32,

    /// Tick of the last live-byte change.
    pub age: u32,
}

const_assert!(MAXSEGS % NSEG_PER_BLOCK == 0);

pub struct SegUsage {
    nsegs: u32,
    entries: [DSegUsage; MAXSEGS],
    addrs: [u32; NSUT_BLOCKS],
    nblocks: u32,
    prev: [[u8; BSIZE]; NSUT_BLOCKS],
    forced: [bool; NSUT_BLOCKS],
}

impl SegUsage {
    pub fn load(bcache: &Bcache, nsegs: u32, addrs: [u32; NSUT_BLOCKS]) -> Result<SegUsage> {
        assert!(nsegs as usize <= MAXSEGS, "sut: too many segments");
        let nblocks = (nsegs as usize).div_ceil(NSEG_PER_BLOCK) as u32;
        let mut sut = SegUsage {
            nsegs,
            entries: [DSegUsage { live: 0, age: 0 }; MAXSEGS],
            addrs,
            nblocks,
            prev: [[0; BSIZE]; NSUT_BLOCKS],
            forced: [false; NSUT_BLOCKS],
        };
        for b in 0..nblocks as usize {
            if addrs[b] == 0 {
                continue;
            }
            let buf = bcache.bread(addrs[b])?;
            sut.prev[b].copy_from_slice(&buf.data()[..]);
            sut.entries[b * NSEG_PER_BLOCK..(b + 1) * NSEG_PER_BLOCK]
                .as_bytes_mut()
                .copy_from_slice(&buf.data()[..]);
        }
        Ok(sut)
    }

    pub fn nsegs(&self) -> u32 {
        self.nsegs
    }

    pub fn read(&self, seg: u32) -> (u32, u32) {
        let e = &self.entries[seg as usize];
        (e.live, e.age)
    }

    pub fn is_free(&self, seg: u32) -> bool {
        self.entries[seg as usize].live == SEG_FREE
    }

    /// Adjusts a segment's live bytes, saturating at the ends, and stamps
    /// the age. Adjustments against a freed segment are dropped: the block
    /// they refer to was already relocated or discarded.
    pub fn update(&mut self, seg: u32, delta: i64, tick: u32) {
        let e = &mut self.entries[seg as usize];
        if e.live == SEG_FREE {
            log::warn!("sut: usage update on free segment {}", seg);
            return;
        }
        let live = e.live as i64 + delta;
        e.live = live.clamp(0, (SEGDATA * BSIZE) as i64) as u32;
        e.age = tick;
    }

    /// Marks a segment as on the free ring.
    pub fn mark_free(&mut self, seg: u32, tick: u32) {
        let e = &mut self.entries[seg as usize];
        e.live = SEG_FREE;
        e.age = tick;
    }

    /// Resets a segment the allocator takes off the free ring.
    pub fn reset(&mut self, seg: u32, tick: u32) {
        let e = &mut self.entries[seg as usize];
        e.live = 0;
        e.age = tick;
    }

    /// Utilization in percent of the segment's payload capacity.
    /// Free segments report full so no caller mistakes them for victims.
    pub fn utilization(&self, seg: u32) -> u32 {
        let e = &self.entries[seg as usize];
        if e.live == SEG_FREE {
            return 100;
        }
        (e.live as u64 * 100 / (SEGDATA * BSIZE) as u64).min(100) as u32
    }

    pub fn nfree(&self) -> u32 {
        (0..self.nsegs).filter(|&s| self.is_free(s)).count() as u32
    }

    pub fn total_live(&self) -> u64 {
        (0..self.nsegs)
            .map(|s| self.entries[s as usize].live)
            .filter(|&l| l != SEG_FREE)
            .map(|l| l as u64)
            .sum()
    }

    pub fn nblocks(&self) -> u32 {
        self.nblocks
    }

    pub fn addr(&self, n: usize) -> u32 {
        self.addrs[n]
    }

    pub fn addrs(&self) -> [u32; NSUT_BLOCKS] {
        self.addrs
    }

    pub fn set_addr(&mut self, n: usize, addr: u32) {
        self.addrs[n] = addr;
    }

    pub fn force_rewrite(&mut self, n: usize) {
        self.forced[n] = true;
    }

    pub fn pack_block(&self, n: usize, data: &mut BufData) {
        data.copy_from_slice(
            self.entries[n * NSEG_PER_BLOCK..(n + 1) * NSEG_PER_BLOCK].as_bytes(),
        );
    }

    pub fn changed_blocks(&self) -> ArrayVec<usize, NSUT_BLOCKS> {
        let mut out = ArrayVec::new();
        for n in 0..self.nblocks as usize {
            let cur = self.entries[n * NSEG_PER_BLOCK..(n + 1) * NSEG_PER_BLOCK].as_bytes();
            if self.forced[n] || cur != &self.prev[n][..] {
                out.push(n);
            }
        }
        out
    }

    pub fn note_persisted(&mut self, n: usize, addr: u32, data: &BufData) {
        self.addrs[n] = addr;
        self.prev[n].copy_from_slice(&data[..]);
        self.forced[n] = false;
    }
}

#[cfg(test)]
mod t {
    use super::*;
    use crate::disk::MemDisk;
    use std::sync::Arc;

    fn harness() -> SegUsage {
        let bcache = Bcache::new(Arc::new(MemDisk::new(8)));
        SegUsage::load(&bcache, 16, [0; NSUT_BLOCKS]).unwrap()
    }

    #[test]
    fn update_saturates() {
        let mut sut = harness();
        sut.update(3, -(BSIZE as i64), 1);
        assert_eq!(sut.read(3), (0, 1));

        sut.update(3, BSIZE as i64, 2);
        assert_eq!(sut.read(3), (BSIZE as u32, 2));
    }

    #[test]
    fn free_sentinel_skips_updates() {
        let mut sut = harness();
        sut.mark_free(5, 1);
        sut.update(5, BSIZE as i64, 2);
        assert!(sut.is_free(5));
        assert_eq!(sut.utilization(5), 100);

        sut.reset(5, 3);
        assert_eq!(sut.read(5), (0, 3));
    }

    #[test]
    fn partial_update_tracks_changes() {
        let mut sut = harness();
        assert!(sut.changed_blocks().is_empty());

        sut.update(0, BSIZE as i64, 1);
        assert_eq!(sut.changed_blocks().as_slice(), &[0]);

        let mut data = crate::bio::BufData::zero();
        sut.pack_block(0, &mut data);
        sut.note_persisted(0, 100, &data);
        assert!(sut.changed_blocks().is_empty());

        sut.force_rewrite(0);
        assert_eq!(sut.changed_blocks().as_slice(), &[0]);
    }
}
