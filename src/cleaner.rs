//! The segment cleaner.
//!
//! Run `Lfs::clean` to recycle segments when free space runs low. Victims
//! are picked by cost-benefit: cold, sparsely occupied segments score
//! highest. Each victim's summary blocks say what the segment once held;
//! whether a block is still live is decided by resolving the owning inode's
//! current state — a summary entry whose version or resolved address no
//! longer matches describes a dead block and is skipped.
//!
//! Live blocks are copied to the log tail like ordinary writes, the owning
//! inode (or imap entry) is repointed, and once a closing sync has committed
//! the new locations the victim goes onto the free ring.
//!
//! The cleaner is a synchronous service of the allocator, not a background
//! actor. It never takes an inode's `io` sleep lock — the thread whose
//! allocation triggered it may be holding one — so all pointer patching goes
//! through the dirty-inode buffer, the on-disk inode, and the in-memory
//! working copies, each edit conditional on the old address still being in
//! place.

use arrayvec::ArrayVec;

use crate::error::{Error, Result};
use crate::imap::ImapEntry;
use crate::inode::{put_dinode, Dinode};
use crate::lfs::Lfs;
use crate::param::{
    BSIZE, GC_TARGET_SEGS, GC_THRESHOLD, GC_UTIL_THRESHOLD, NDIRECT, SEGSIZE,
};
use crate::segment::{DSegSum, SumKind};

/// Cleaner progress, visible through `Stats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcPhase {
    Idle,
    Selecting,
    Cleaning(u32),
    Sealing,
    Syncing,
}

impl Lfs {
    /// Checks the cleaning thresholds and runs the cleaner when they fire.
    /// Called on every allocation; cheap when there is nothing to do.
    pub(crate) fn maybe_clean(&self) {
        if self.is_syncing() {
            return;
        }
        let trigger = {
            let log = self.log.lock();
            if log.gc_failed {
                false
            } else {
                let nfree = log.seg.nfree();
                let nsegs = log.sut.nsegs();
                let used_pct = (100 * (nsegs - log.sut.nfree()) / nsegs) as usize;
                nfree < GC_TARGET_SEGS as u32
                    || (used_pct >= GC_THRESHOLD && nfree < 2 * GC_TARGET_SEGS as u32)
            }
        };
        if trigger {
            if let Err(e) = self.clean() {
                log::warn!("cleaner: {e}");
            }
        }
    }

    /// Runs one cleaning pass. Returns whether any segment was freed.
    ///
    /// A pass that cannot free anything latches `gc_failed`, which keeps the
    /// allocator from re-triggering until a deletion opens new space.
    pub fn clean(&self) -> Result<bool> {
        if self.is_syncing() {
            // Sync's own allocations must not re-enter the cleaner; the
            // cleaner runs its own sync when it finishes.
            return Ok(false);
        }
        let mut phase = match self.gc.try_lock() {
            Some(guard) => guard,
            None => return Ok(false),
        };
        let result = self.clean_inner(&mut phase);
        *phase = GcPhase::Idle;
        result
    }

    fn clean_inner(&self, phase: &mut GcPhase) -> Result<bool> {
        *phase = GcPhase::Selecting;

        // Progress guard: relocation itself consumes tail blocks. With no
        // free segment and less than half a segment of tail left, running
        // would risk corrupting the log mid-relocation.
        {
            let mut log = self.log.lock();
            if log.seg.nfree() == 0 && log.seg.remaining() < SEGSIZE as u32 / 2 {
                log.gc_failed = true;
                log::warn!("cleaner: not enough tail space to relocate, giving up");
                return Ok(false);
            }
        }

        let victims = self.select_victims();
        if victims.is_empty() {
            log::debug!("cleaner: no candidate segments");
            self.log.lock().gc_failed = true;
            return Ok(false);
        }

        let mut cleaned: ArrayVec<u32, GC_TARGET_SEGS> = ArrayVec::new();
        for &seg in &victims {
            *phase = GcPhase::Cleaning(seg);
            match self.clean_segment(seg) {
                Ok(()) => cleaned.push(seg),
                Err(Error::OutOfSpace) => {
                    // The victim keeps its live blocks and is not freed;
                    // retrying later is safe.
                    log::warn!("cleaner: out of space mid-segment, stopping early");
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        if cleaned.is_empty() {
            self.log.lock().gc_failed = true;
            return Ok(false);
        }

        // Persist the summary entries for the relocations, then commit the
        // new block locations before recycling the victims: until the
        // checkpoint lands, the old copies may still be referenced by the
        // one on disk.
        *phase = GcPhase::Sealing;
        self.flush_ssb_now()?;
        *phase = GcPhase::Syncing;
        self.sync_for_gc()?;

        let tick = self.tick();
        let mut log = self.log.lock();
        for &seg in &cleaned {
            log.sut.mark_free(seg, tick);
            log.seg.push_free(seg);
        }
        log::info!("cleaner: freed {} segment(s)", cleaned.len());
        Ok(true)
    }

    /// Picks up to `GC_TARGET_SEGS` victims by cost-benefit, best first.
    ///
    /// ```text
    /// score = (100 - u) * age * 1000 / (100 + u)    (0 when u >= 100)
    /// ```
    fn select_victims(&self) -> ArrayVec<u32, GC_TARGET_SEGS> {
        let tick = self.tick();
        let log = self.log.lock();
        let mut victims: ArrayVec<(u64, u32), GC_TARGET_SEGS> = ArrayVec::new();
        // Best over-threshold candidate, used only when nothing else exists.
        let mut fallback: Option<(u64, u32)> = None;

        for seg in 0..log.sut.nsegs() {
            if seg == log.seg.cur_seg() || log.sut.is_free(seg) {
                continue;
            }
            let util = log.sut.utilization(seg);
            if util >= 100 {
                continue;
            }
            let (_, stamp) = log.sut.read(seg);
            let age = tick.saturating_sub(stamp).max(1) as u64;
            let score = (100 - util) as u64 * age * 1000 / (100 + util) as u64;

            if util as usize > GC_UTIL_THRESHOLD {
                if fallback.map_or(true, |(s, _)| score > s) {
                    fallback = Some((score, seg));
                }
                continue;
            }
            let pos = victims
                .iter()
                .position(|&(s, _)| s < score)
                .unwrap_or(victims.len());
            if victims.is_full() {
                if pos >= victims.len() {
                    continue;
                }
                victims.pop();
            }
            victims.insert(pos, (score, seg));
        }

        if victims.is_empty() {
            if let Some(fb) = fallback {
                victims.push(fb);
            }
        }
        victims.iter().map(|&(_, seg)| seg).collect()
    }

    /// Moves every live block out of the victim segment.
    fn clean_segment(&self, victim: u32) -> Result<()> {
        // Summary blocks are found by content, not position: mid-segment
        // flushes leave more than one per segment.
        let mut sums: Vec<DSegSum> = Vec::new();
        for off in 0..SEGSIZE as u32 {
            let bno = self.sb().seg_to_disk(victim, off);
            let buf = self.bcache().bread(bno)?;
            if let Some(sum) = DSegSum::parse(buf.data()) {
                sums.push(sum);
            }
        }

        if sums.is_empty() {
            // Image-builder segments carry no summary.
            self.safety_scan(victim)?;
        } else {
            let mut moved_inode_blocks: Vec<u32> = Vec::new();
            for sum in &sums {
                for entry in sum.entries() {
                    match entry.kind() {
                        None => {
                            log::warn!(
                                "cleaner: corrupt summary entry in segment {victim}, skipping"
                            );
                        }
                        Some(SumKind::Inode) => {
                            self.relocate_victim_inode_blocks(victim, &mut moved_inode_blocks)?;
                        }
                        Some(kind) => {
                            self.relocate_if_live(kind, entry.inum, entry.offset, entry.version, victim)?;
                        }
                    }
                }
            }
        }

        // Current imap or usage-table blocks inside the victim carry no
        // summary entries; force the closing sync to rewrite them elsewhere.
        self.force_meta_rewrite(victim);
        Ok(())
    }

    /// An INODE summary entry covers a whole packed block, so relocation
    /// walks the imap for every block of inodes still inside the victim.
    fn relocate_victim_inode_blocks(
        &self,
        victim: u32,
        moved: &mut Vec<u32>,
    ) -> Result<()> {
        let blocks: Vec<u32> = {
            let log = self.log.lock();
            let sb = self.sb();
            let mut blocks: Vec<u32> = log
                .imap
                .inums_in(|b| sb.in_log(b) && sb.seg_of(b) == victim)
                .into_iter()
                .map(|inum| log.imap.get(inum).block())
                .collect();
            blocks.sort_unstable();
            blocks.dedup();
            blocks
        };
        for block in blocks {
            if !moved.contains(&block) {
                self.relocate_inode_block(block)?;
                moved.push(block);
            }
        }
        Ok(())
    }

    /// Decides liveness for a DATA/INDIRECT summary entry and relocates the
    /// block if it is still reachable inside the victim.
    fn relocate_if_live(
        &self,
        kind: SumKind,
        inum: u32,
        offset: u32,
        version: u32,
        victim: u32,
    ) -> Result<()> {
        if inum == 0 || inum >= self.sb().ninodes() {
            log::warn!("cleaner: summary entry with bad inum {inum}, skipping");
            return Ok(());
        }
        // The inode may have been freed, or freed and reallocated: either
        // kills the entry by imap emptiness or by version mismatch. The
        // imap's truncated version is the cheap first filter; the full
        // counter in the image decides.
        {
            let entry = self.log.lock().imap.get(inum);
            if entry.is_free() {
                return Ok(());
            }
            if !entry.is_buffered() && !entry.version_matches(version) {
                return Ok(());
            }
        }
        let d = match self.iread(inum) {
            Ok(d) => d,
            Err(Error::Invalid(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        if d.version != version {
            return Ok(());
        }

        let addr = match kind {
            SumKind::Indirect => d.indirect,
            SumKind::Data if (offset as usize) < NDIRECT => d.addrs[offset as usize],
            SumKind::Data => {
                if d.indirect == 0 {
                    return Ok(());
                }
                let buf = self.bcache().bread(d.indirect)?;
                buf.data().u32_at(offset as usize - NDIRECT)
            }
            SumKind::Inode => unreachable!("inode entries handled by the block walk"),
        };
        let sb = self.sb();
        if addr == 0 || !sb.in_log(addr) || sb.seg_of(addr) != victim {
            // Already moved, or no longer referenced.
            return Ok(());
        }
        self.relocate_block(kind, inum, offset, addr)
    }

    /// Copies one live block to the log tail and repoints its owner.
    ///
    /// Every pointer edit is conditional on the owner still naming
    /// `old`: a concurrent writer that overwrote the offset wins, and the
    /// freshly copied block simply stays dead.
    fn relocate_block(&self, kind: SumKind, inum: u32, offset: u32, old: u32) -> Result<()> {
        let version = self.iread(inum).map(|d| d.version).unwrap_or(0);

        match kind {
            SumKind::Indirect => {
                let new = self.balloc(SumKind::Indirect, inum, 0, version)?;
                // The old buffer stays locked until the new address is
                // installed, so a writer that wins the buffer lock
                // afterwards re-reads a stable pointer.
                let old_buf = self.bcache().bread(old)?;
                {
                    let mut nb = self.bcache().bzero(new);
                    nb.data_mut().copy_from(old_buf.data());
                    nb.write()?;
                }
                let moved = self.poke_inode(inum, |d| {
                    if d.indirect == old {
                        d.indirect = new;
                        true
                    } else {
                        false
                    }
                })?;
                drop(old_buf);
                if moved {
                    self.sut_update(new, BSIZE as i64);
                    self.sut_update(old, -(BSIZE as i64));
                }
            }
            SumKind::Data if (offset as usize) < NDIRECT => {
                let new = self.balloc(SumKind::Data, inum, offset, version)?;
                {
                    let old_buf = self.bcache().bread(old)?;
                    let mut nb = self.bcache().bzero(new);
                    nb.data_mut().copy_from(old_buf.data());
                    nb.write()?;
                }
                let idx = offset as usize;
                let moved = self.poke_inode(inum, |d| {
                    if d.addrs[idx] == old {
                        d.addrs[idx] = new;
                        true
                    } else {
                        false
                    }
                })?;
                if moved {
                    self.sut_update(new, BSIZE as i64);
                    self.sut_update(old, -(BSIZE as i64));
                }
            }
            SumKind::Data => {
                // Reached through the indirect block: relocate that first
                // (copy-on-write), pointing its slot at the data block's new
                // home in the same stroke.
                let d = self.iread(inum)?;
                let ind_old = d.indirect;
                if ind_old == 0 {
                    return Ok(());
                }
                let idx = offset as usize - NDIRECT;
                let ind_buf = self.bcache().bread(ind_old)?;
                if ind_buf.data().u32_at(idx) != old {
                    return Ok(());
                }

                let new = self.balloc(SumKind::Data, inum, offset, version)?;
                {
                    let old_buf = self.bcache().bread(old)?;
                    let mut nb = self.bcache().bzero(new);
                    nb.data_mut().copy_from(old_buf.data());
                    nb.write()?;
                }
                let ind_new = self.balloc(SumKind::Indirect, inum, 0, version)?;
                {
                    let mut nb = self.bcache().bzero(ind_new);
                    nb.data_mut().copy_from(ind_buf.data());
                    nb.data_mut().set_u32(idx, new);
                    nb.write()?;
                }
                let moved = self.poke_inode(inum, |d| {
                    if d.indirect == ind_old {
                        d.indirect = ind_new;
                        true
                    } else {
                        false
                    }
                })?;
                drop(ind_buf);
                if moved {
                    self.sut_update(new, BSIZE as i64);
                    self.sut_update(old, -(BSIZE as i64));
                    self.sut_update(ind_new, BSIZE as i64);
                    self.sut_update(ind_old, -(BSIZE as i64));
                }
            }
            SumKind::Inode => unreachable!("inode blocks use relocate_inode_block"),
        }
        Ok(())
    }

    /// Moves a packed inode block, merging any newer images from the dirty
    /// and flushing buffers, then rewrites every imap entry that referenced
    /// the old block.
    fn relocate_inode_block(&self, old: u32) -> Result<()> {
        let new = self.balloc(SumKind::Inode, 0, 0, 0)?;

        // (inum, slot) pairs currently mapped into the old block.
        let mapped: Vec<(u32, usize)> = {
            let log = self.log.lock();
            log.imap
                .inums_in(|b| b == old)
                .into_iter()
                .map(|inum| (inum, log.imap.get(inum).slot()))
                .collect()
        };

        {
            let old_buf = self.bcache().bread(old)?;
            let mut nb = self.bcache().bzero(new);
            nb.data_mut().copy_from(old_buf.data());
            drop(old_buf);

            let newer: Vec<(usize, Dinode)> = {
                let dirty = self.dirty.lock();
                mapped
                    .iter()
                    .filter_map(|&(inum, slot)| dirty.get(inum).map(|d| (slot, d)))
                    .collect()
            };
            for (slot, d) in newer {
                put_dinode(nb.data_mut(), slot, &d);
            }
            nb.write()?;
        }

        {
            let mut log = self.log.lock();
            for &(inum, _) in &mapped {
                let entry = log.imap.get(inum);
                if !entry.is_free() && !entry.is_buffered() && entry.block() == old {
                    log.imap
                        .set(inum, ImapEntry::encode(new, entry.version(), entry.slot()));
                }
            }
        }
        self.sut_update(new, BSIZE as i64);
        self.sut_update(old, -(BSIZE as i64));
        Ok(())
    }

    /// Fallback for segments with no summary (the image builder writes
    /// none): walk the imap for inode blocks, then every allocated inode's
    /// pointers, relocating anything that references the victim.
    fn safety_scan(&self, victim: u32) -> Result<()> {
        log::debug!("cleaner: safety scan of segment {victim}");
        let mut moved = Vec::new();
        self.relocate_victim_inode_blocks(victim, &mut moved)?;

        let sb = self.sb();
        for inum in 1..sb.ninodes() {
            let d = match self.iread(inum) {
                Ok(d) => d,
                Err(Error::Invalid(_)) => continue,
                Err(e) => return Err(e),
            };
            for (bn, &addr) in d.addrs.iter().enumerate() {
                if addr != 0 && sb.in_log(addr) && sb.seg_of(addr) == victim {
                    self.relocate_block(SumKind::Data, inum, bn as u32, addr)?;
                }
            }
            if d.indirect == 0 {
                continue;
            }
            if sb.in_log(d.indirect) && sb.seg_of(d.indirect) == victim {
                self.relocate_block(SumKind::Indirect, inum, 0, d.indirect)?;
            }
            // Re-read: the indirect block may just have moved.
            let ind = self.iread(inum)?.indirect;
            if ind == 0 {
                continue;
            }
            let slots: Vec<(usize, u32)> = {
                let buf = self.bcache().bread(ind)?;
                (0..BSIZE / 4)
                    .map(|j| (j, buf.data().u32_at(j)))
                    .filter(|&(_, a)| a != 0 && sb.in_log(a) && sb.seg_of(a) == victim)
                    .collect()
            };
            for (j, addr) in slots {
                self.relocate_block(SumKind::Data, inum, (NDIRECT + j) as u32, addr)?;
            }
        }
        Ok(())
    }

    /// Marks current imap/usage-table blocks living inside the victim for
    /// rewrite at the next persist.
    fn force_meta_rewrite(&self, victim: u32) {
        let sb = self.sb();
        let mut log = self.log.lock();
        for n in 0..log.imap.nblocks() as usize {
            let addr = log.imap.addr(n);
            if addr != 0 && sb.in_log(addr) && sb.seg_of(addr) == victim {
                log.imap.force_rewrite(n);
            }
        }
        for n in 0..log.sut.nblocks() as usize {
            let addr = log.sut.addr(n);
            if addr != 0 && sb.in_log(addr) && sb.seg_of(addr) == victim {
                log.sut.force_rewrite(n);
            }
        }
    }
}
