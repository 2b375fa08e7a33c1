//! The `Lfs` struct: mount, the log-tail allocator, the inode operation
//! surface, and the sync protocol.
//!
//! State is split across three owners, each behind its own short spin lock:
//!
//! * `log` — the allocator tail, summary buffers, free ring, usage table,
//!   and imap. Everything that decides where the next block goes.
//! * `dirty` — the dirty-inode buffer.
//! * `itable` — the in-memory inode table.
//!
//! None of these locks is ever held across buffer-cache I/O: callers copy
//! what they need, release, do the I/O, and re-acquire. The cleaner is a
//! synchronous service invoked from the allocator when free space runs low
//! (see `cleaner.rs`).
//!
//! Sync runs one instance at a time and always in the same order: drain
//! dirty inodes, flush the summary buffer, persist the usage table and the
//! imap (partial update), then write the checkpoint. A crash between syncs
//! loses at most the writes since the last checkpoint.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use zerocopy::AsBytes;

use crate::bio::Bcache;
use crate::checkpoint::{self, DCheckpoint};
use crate::cleaner::GcPhase;
use crate::disk::Disk;
use crate::error::{Error, Result};
use crate::imap::{Imap, ImapEntry};
use crate::inode::{dinode_at, put_dinode, Dinode, DirtyInodes, InodeType};
use crate::itable::{Inode, InodeGuard, Itable};
use crate::param::{BSIZE, SEGDATA, SYNC_INTERVAL_MS};
use crate::segment::{DSegSum, DSegSumEntry, SegManager, SumKind};
use crate::segusage::SegUsage;
use crate::superblock::Superblock;

/// The allocator-side state: log tail, usage table, imap, and the cleaner
/// failure latch. One lock, short critical sections.
pub(crate) struct LogState {
    pub seg: SegManager,
    pub sut: SegUsage,
    pub imap: Imap,

    /// Set when a cleaning pass could not free anything; cleared by any
    /// live-byte decrement, since a deletion may have opened new space.
    pub gc_failed: bool,
}

/// A mounted log-structured file system.
pub struct Lfs {
    sb: Superblock,
    bcache: Bcache,
    pub(crate) log: spin::Mutex<LogState>,
    pub(crate) dirty: spin::Mutex<DirtyInodes>,
    pub(crate) itable: Itable,

    /// Cleaner latch and phase; `try_lock` failure means a pass is running.
    pub(crate) gc: spin::Mutex<GcPhase>,

    /// At most one sync at a time.
    syncing: AtomicBool,

    /// Logical clock: checkpoint timestamp and usage-table age stamp.
    tick: AtomicU32,

    last_sync: spin::Mutex<Instant>,
}

/// Point-in-time counters for callers and tests.
#[derive(Debug, Clone, Copy)]
pub struct Stats {
    pub nsegs: u32,
    pub free_segs: u32,
    pub cur_seg: u32,
    pub seg_off: u32,
    pub live_bytes: u64,
    pub gc_failed: bool,
    pub timestamp: u32,
}

impl Lfs {
    /// Mounts the file system on `disk`, recovering from the best valid
    /// checkpoint. With neither slot valid the log is treated as freshly
    /// formatted; everything since `mkfs` is then gone.
    pub fn mount(disk: Arc<dyn Disk>) -> Result<Lfs> {
        let bcache = Bcache::new(disk);
        let sb = Superblock::read(&bcache)?;

        let cp = checkpoint::read_best(&bcache, &sb)?;
        let fresh = cp.is_none();
        if fresh {
            log::error!("lfs: no valid checkpoint, mounting as freshly formatted");
        }
        let cp = cp.unwrap_or_else(DCheckpoint::zero);

        let imap = Imap::load(&bcache, sb.ninodes() as usize, cp.imap_addrs)?;
        let mut sut = SegUsage::load(&bcache, sb.nsegs(), cp.sut_addrs)?;

        let cur_seg = cp.cur_seg.min(sb.nsegs() - 1);
        let seg_off = cp.seg_off.min(SEGDATA as u32);
        if fresh {
            for seg in 0..sb.nsegs() {
                if seg != cur_seg {
                    sut.mark_free(seg, 0);
                }
            }
        }
        // The free ring is not persisted; it is exactly the set of segments
        // the usage table marks free, consumed in ascending order.
        let free: VecDeque<u32> = (0..sb.nsegs())
            .filter(|&s| s != cur_seg && sut.is_free(s))
            .collect();

        log::debug!(
            "lfs: mounted at segment {} offset {}, {} free segment(s), timestamp {}",
            cur_seg,
            seg_off,
            free.len(),
            cp.header_timestamp
        );
        let tick = cp.header_timestamp;
        Ok(Lfs {
            sb,
            bcache,
            log: spin::Mutex::new(LogState {
                seg: SegManager::new(cur_seg, seg_off, free),
                sut,
                imap,
                gc_failed: false,
            }),
            dirty: spin::Mutex::new(DirtyInodes::new()),
            itable: Itable::new(),
            gc: spin::Mutex::new(GcPhase::Idle),
            syncing: AtomicBool::new(false),
            tick: AtomicU32::new(tick),
            last_sync: spin::Mutex::new(Instant::now()),
        })
    }

    pub(crate) fn sb(&self) -> &Superblock {
        &self.sb
    }

    pub(crate) fn bcache(&self) -> &Bcache {
        &self.bcache
    }

    pub(crate) fn tick(&self) -> u32 {
        self.tick.load(Ordering::Relaxed)
    }

    pub(crate) fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Relaxed)
    }

    fn gc_active(&self) -> bool {
        match self.gc.try_lock() {
            Some(_) => false,
            None => true,
        }
    }

    pub fn stats(&self) -> Stats {
        let log = self.log.lock();
        Stats {
            nsegs: log.sut.nsegs(),
            free_segs: log.seg.nfree(),
            cur_seg: log.seg.cur_seg(),
            seg_off: log.seg.seg_off(),
            live_bytes: log.sut.total_live(),
            gc_failed: log.gc_failed,
            timestamp: self.tick(),
        }
    }

    // ------------------------------------------------------------------
    // Block allocation
    // ------------------------------------------------------------------

    /// Reserves the next log block for a summarized payload block, appending
    /// its summary entry atomically with the tail advance.
    pub(crate) fn balloc(
        &self,
        kind: SumKind,
        inum: u32,
        offset: u32,
        version: u32,
    ) -> Result<u32> {
        self.balloc_entry(Some(DSegSumEntry::new(kind, inum, offset, version)))
    }

    /// Reserves the next log block for internal metadata (imap and
    /// usage-table blocks); no summary entry covers it.
    pub(crate) fn balloc_meta(&self) -> Result<u32> {
        self.balloc_entry(None)
    }

    fn balloc_entry(&self, entry: Option<DSegSumEntry>) -> Result<u32> {
        self.maybe_clean();
        let mut emergency = false;
        loop {
            let log = self.log.lock();
            if log.seg.seg_full() {
                if log.seg.flush_latched() {
                    // Another thread is writing this segment's summary.
                    drop(log);
                    std::thread::yield_now();
                    continue;
                }
                if log.seg.has_entries() {
                    self.seal_segment(log)?;
                    continue;
                }
                let mut log = log;
                match log.seg.pop_free() {
                    Some(next) => {
                        let tick = self.tick();
                        log.sut.reset(next, tick);
                        log.seg.advance(next);
                        continue;
                    }
                    None => {
                        drop(log);
                        if emergency {
                            return Err(Error::OutOfSpace);
                        }
                        // One emergency attempt; the latch keeps a cleaner
                        // already on the stack from recursing.
                        emergency = true;
                        self.clean()?;
                        continue;
                    }
                }
            }

            let mut log = log;
            let bno = log.seg.take_slot(&self.sb);
            if let Some(e) = entry {
                log.seg.push_entry(e);
            }
            // Consuming the last payload slot seals the segment: its
            // summary goes into the reserved final block right away, so a
            // completed segment is always self-describing.
            if log.seg.seg_full() && log.seg.has_entries() && !log.seg.flush_latched() {
                if let Err(e) = self.seal_segment(log) {
                    log::warn!("lfs: segment seal failed, will retry: {e}");
                }
            }
            return Ok(bno);
        }
    }

    /// Writes the buffered summary entries into the reserved final block of
    /// the current segment. Takes the lock guard, releases it around the
    /// I/O, and restores the entries if the write fails.
    fn seal_segment(&self, mut log: spin::MutexGuard<'_, LogState>) -> Result<()> {
        let entries = log.seg.begin_flush();
        let ssb_bno = self.sb.ssb_block(log.seg.cur_seg());
        let next = log
            .seg
            .peek_free()
            .map(|s| self.sb.seg_to_disk(s, 0))
            .unwrap_or(0);
        drop(log);

        let res = self.write_ssb(ssb_bno, &entries, next);
        let mut log = self.log.lock();
        match res {
            Ok(()) => log.seg.end_flush(),
            Err(_) => log.seg.abort_flush(),
        }
        res
    }

    fn write_ssb(&self, bno: u32, entries: &[DSegSumEntry], next_seg_addr: u32) -> Result<()> {
        let sum = DSegSum::new(entries, self.tick(), next_seg_addr);
        let mut buf = self.bcache.bzero(bno);
        buf.data_mut().copy_from_slice(sum.as_bytes());
        buf.write()
    }

    /// Mid-segment summary flush, used by sync and the cleaner's sealing
    /// step: writes the entries collected so far into an ordinary payload
    /// slot. The slot and the entries are taken under one lock acquisition,
    /// which pins them to the same segment. Returns the block written.
    pub(crate) fn flush_ssb_now(&self) -> Result<Option<u32>> {
        loop {
            let mut log = self.log.lock();
            if !log.seg.has_entries() {
                return Ok(None);
            }
            if log.seg.flush_latched() {
                drop(log);
                std::thread::yield_now();
                continue;
            }
            if log.seg.seg_full() {
                // No payload slot left; the summary goes to the reserved
                // block instead.
                self.seal_segment(log)?;
                continue;
            }
            let bno = log.seg.take_slot(&self.sb);
            let entries = log.seg.begin_flush();
            drop(log);

            let res = self.write_ssb(bno, &entries, 0);
            let mut log = self.log.lock();
            return match res {
                Ok(()) => {
                    log.seg.end_flush();
                    Ok(Some(bno))
                }
                Err(e) => {
                    log.seg.abort_flush();
                    Err(e)
                }
            };
        }
    }

    /// Adjusts a block's segment in the usage table. A decrement clears the
    /// cleaner's failure latch: something was deleted or superseded, so a
    /// new pass may succeed.
    pub(crate) fn sut_update(&self, bno: u32, delta: i64) {
        if !self.sb.in_log(bno) {
            log::warn!("lfs: usage update for block {bno} outside the log");
            return;
        }
        let seg = self.sb.seg_of(bno);
        let tick = self.tick();
        let mut log = self.log.lock();
        log.sut.update(seg, delta, tick);
        if delta < 0 {
            log.gc_failed = false;
        }
    }

    // ------------------------------------------------------------------
    // Inode operations
    // ------------------------------------------------------------------

    /// Allocates a fresh inode of the given type and returns its inum.
    /// The inode lives in the dirty-inode buffer until the first flush.
    pub fn ialloc(&self, typ: InodeType) -> Result<u32> {
        let inum = {
            let mut log = self.log.lock();
            let inum = log.imap.first_free().ok_or(Error::OutOfSpace)?;
            log.imap.set(inum, ImapEntry::INBUF);
            inum
        };
        let mut d = Dinode::zero();
        d.set_typ(typ);
        d.nlink = 1;
        if let Err(e) = self.dirty_put(inum, d) {
            // Roll the sentinel back; an imap entry pointing at a buffered
            // image that does not exist would wedge every reader of it.
            self.log.lock().imap.set(inum, ImapEntry::FREE);
            return Err(e);
        }
        log::debug!("ialloc: inum {inum}");
        Ok(inum)
    }

    /// Records a modified inode image in the dirty buffer.
    pub(crate) fn iupdate(&self, inum: u32, d: Dinode) -> Result<()> {
        self.dirty_put(inum, d)
    }

    fn dirty_put(&self, inum: u32, d: Dinode) -> Result<()> {
        loop {
            if self.dirty.lock().put(inum, d) {
                return Ok(());
            }
            self.flush_dirty_inodes()?;
        }
    }

    /// Reads the newest image of an inode: the dirty buffer first (live
    /// half, then flushing half), then the block the imap names.
    pub(crate) fn iread(&self, inum: u32) -> Result<Dinode> {
        let mut spins = 0u32;
        loop {
            if let Some(d) = self.dirty.lock().get(inum) {
                return Ok(d);
            }
            let entry = self.log.lock().imap.get(inum);
            if entry.is_free() {
                return Err(Error::Invalid("read of unallocated inode"));
            }
            if entry.is_buffered() {
                // Normally a flush moved it out from under us and its image
                // is about to land in the imap. A persistent miss means the
                // sentinel was checkpointed without its image (a crash
                // between ialloc and sync).
                spins += 1;
                if spins > 10_000 {
                    log::error!("lfs: imap names a buffered inode with no image (inum {inum})");
                    return Err(Error::Corrupt("buffered imap entry with no image"));
                }
                std::thread::yield_now();
                continue;
            }
            let buf = self.bcache.bread(entry.block())?;
            return Ok(dinode_at(buf.data(), entry.slot()));
        }
    }

    /// Drains the dirty buffer: packs the images into one freshly allocated
    /// log block, writes it, and repoints the imap. Inodes freed while the
    /// flush was in flight have type 0 and keep their imap entry cleared.
    pub(crate) fn flush_dirty_inodes(&self) -> Result<()> {
        let images: Vec<(u32, Dinode)> = loop {
            let mut dirty = self.dirty.lock();
            if dirty.flush_in_progress() {
                drop(dirty);
                std::thread::yield_now();
                continue;
            }
            if dirty.is_empty() {
                return Ok(());
            }
            break dirty.take_for_flush().to_vec();
        };

        let written = (|| {
            let bno = self.balloc(SumKind::Inode, 0, 0, 0)?;
            let mut buf = self.bcache.bzero(bno);
            for (slot, (_, d)) in images.iter().enumerate() {
                put_dinode(buf.data_mut(), slot, d);
            }
            buf.write()?;
            Ok(bno)
        })();

        let bno = match written {
            Ok(bno) => bno,
            Err(e) => {
                let dropped = self.dirty.lock().restore_flush();
                if dropped > 0 {
                    log::error!("lfs: dirty-inode flush failed, {dropped} image(s) lost");
                }
                return Err(e);
            }
        };

        {
            let tick = self.tick();
            let mut log = self.log.lock();
            for (slot, (inum, d)) in images.iter().enumerate() {
                if d.typ == 0 {
                    continue;
                }
                let old = log.imap.get(*inum);
                log.imap
                    .set(*inum, ImapEntry::encode(bno, d.version, slot));
                if !old.is_free() && !old.is_buffered() {
                    // The old packed image is superseded.
                    let oseg = self.sb.seg_of(old.block());
                    log.sut.update(oseg, -(BSIZE as i64), tick);
                    log.gc_failed = false;
                }
            }
            let nseg = self.sb.seg_of(bno);
            log.sut.update(nseg, BSIZE as i64, tick);
        }
        self.dirty.lock().end_flush();
        log::debug!("lfs: flushed {} inode(s) to block {bno}", images.len());
        Ok(())
    }

    /// Finds or creates the in-memory inode for `inum` and takes a
    /// reference. Pair with `iput`.
    pub fn iget(&self, inum: u32) -> Arc<Inode> {
        self.itable.get(inum)
    }

    /// Locks the inode's I/O path, reading the working copy from disk on
    /// first use.
    pub fn ilock<'a>(&'a self, ip: &'a Arc<Inode>) -> Result<InodeGuard<'a>> {
        let io = ip.io.lock().unwrap();
        let valid = ip.core.lock().valid;
        if !valid {
            let d = self.iread(ip.inum())?;
            let mut core = ip.core.lock();
            core.d = d;
            core.valid = true;
        }
        Ok(InodeGuard {
            lfs: self,
            ip,
            _io: io,
        })
    }

    /// Drops a reference taken with `iget`. When the last reference to an
    /// inode with no links goes away, the inode is finalized: truncated,
    /// version-bumped, removed from the imap, and a sync is kicked off.
    pub fn iput(&self, ip: Arc<Inode>) -> Result<()> {
        let finalize = {
            let mut slots = self.itable.slots.lock();
            let slot = slots
                .iter_mut()
                .find(|s| s.ip.as_ref().map_or(false, |p| Arc::ptr_eq(p, &ip)))
                .expect("iput: inode not in table");
            if slot.nref == 1 {
                let core = ip.core.lock();
                let dead = core.valid && core.d.nlink == 0;
                drop(core);
                if !dead {
                    slot.nref = 0;
                }
                // On the dead path nref stays 1 so the slot cannot be
                // reclaimed while we finalize outside the lock.
                dead
            } else {
                slot.nref -= 1;
                false
            }
        };
        if !finalize {
            return Ok(());
        }

        let res = self.ifree(&ip);
        let mut slots = self.itable.slots.lock();
        if let Some(slot) = slots
            .iter_mut()
            .find(|s| s.ip.as_ref().map_or(false, |p| Arc::ptr_eq(p, &ip)))
        {
            slot.nref = 0;
            slot.ip = None;
        }
        res
    }

    /// Frees an unlinked inode: truncate (which bumps the version), drop
    /// any buffered image, clear the imap entry, and sync.
    fn ifree(&self, ip: &Arc<Inode>) -> Result<()> {
        let inum = ip.inum();
        log::debug!("ifree: inum {inum}");
        {
            let mut guard = self.ilock(ip)?;
            guard.trunc()?;
        }
        {
            let mut core = ip.core.lock();
            core.d.set_typ(InodeType::None);
            core.valid = false;
        }
        self.dirty.lock().forget(inum);
        {
            let tick = self.tick();
            let mut log = self.log.lock();
            let old = log.imap.get(inum);
            log.imap.set(inum, ImapEntry::FREE);
            if !old.is_free() && !old.is_buffered() {
                let oseg = self.sb.seg_of(old.block());
                log.sut.update(oseg, -(BSIZE as i64), tick);
                log.gc_failed = false;
            }
        }
        self.sync()
    }

    /// Applies a conditional edit to an inode's persistent image without
    /// taking its `io` lock: in place in the dirty buffer when present,
    /// else read-modify-redirty from disk; the in-memory working copy gets
    /// the same edit. Used by the cleaner to repoint relocated blocks.
    /// Returns whether the edit applied.
    pub(crate) fn poke_inode<F: Fn(&mut Dinode) -> bool>(&self, inum: u32, f: F) -> Result<bool> {
        {
            let mut result = None;
            let hit = self.dirty.lock().edit(inum, |d| result = Some(f(d)));
            if hit {
                let applied = result.unwrap_or(false);
                if applied {
                    self.patch_icache(inum, &f);
                }
                return Ok(applied);
            }
        }

        let mut d = match self.iread(inum) {
            Ok(d) => d,
            Err(Error::Invalid(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        if !f(&mut d) {
            return Ok(false);
        }
        loop {
            let mut dirty = self.dirty.lock();
            let mut result = None;
            if dirty.edit(inum, |img| result = Some(f(img))) {
                // The inode was dirtied since we read it; edit that newer
                // image instead of clobbering it with ours.
                drop(dirty);
                let applied = result.unwrap_or(false);
                if applied {
                    self.patch_icache(inum, &f);
                }
                return Ok(applied);
            }
            if dirty.put(inum, d) {
                break;
            }
            drop(dirty);
            self.flush_dirty_inodes()?;
        }
        self.patch_icache(inum, &f);
        Ok(true)
    }

    /// The speculative half of `poke_inode`: the same conditional edit on
    /// the cached working copy, so a thread holding the inode open sees the
    /// relocated address.
    fn patch_icache<F: Fn(&mut Dinode) -> bool>(&self, inum: u32, f: &F) {
        if let Some(ip) = self.itable.lookup(inum) {
            let mut core = ip.core.lock();
            if core.valid {
                let _ = f(&mut core.d);
            }
        }
    }

    // ------------------------------------------------------------------
    // Sync
    // ------------------------------------------------------------------

    /// Flushes everything and commits a checkpoint. Skipped while a sync
    /// is already running, and while the cleaner runs (it syncs itself on
    /// completion).
    pub fn sync(&self) -> Result<()> {
        if self.gc_active() {
            return Ok(());
        }
        if self.syncing.swap(true, Ordering::Acquire) {
            return Ok(());
        }
        let _latch = scopeguard::guard((), |()| self.syncing.store(false, Ordering::Release));
        self.sync_body()
    }

    /// The cleaner's closing sync: waits for any in-flight sync instead of
    /// skipping, since the victims must not be freed before a checkpoint
    /// commits their relocations.
    pub(crate) fn sync_for_gc(&self) -> Result<()> {
        while self.syncing.swap(true, Ordering::Acquire) {
            std::thread::yield_now();
        }
        let _latch = scopeguard::guard((), |()| self.syncing.store(false, Ordering::Release));
        self.sync_body()
    }

    fn sync_body(&self) -> Result<()> {
        *self.last_sync.lock() = Instant::now();
        self.flush_dirty_inodes()?;
        self.flush_ssb_now()?;
        self.persist_maps()?;
        self.write_checkpoint()
    }

    /// Persists changed imap and usage-table blocks. Allocating a home for
    /// a changed block changes the usage table again, so destinations are
    /// assigned to a fixpoint before any content is written.
    fn persist_maps(&self) -> Result<()> {
        let mut imap_dst: Vec<(usize, u32)> = Vec::new();
        let mut sut_dst: Vec<(usize, u32)> = Vec::new();
        loop {
            let (imap_changed, sut_changed) = {
                let log = self.log.lock();
                let ic: Vec<usize> = log
                    .imap
                    .changed_blocks()
                    .into_iter()
                    .filter(|n| !imap_dst.iter().any(|(m, _)| m == n))
                    .collect();
                let sc: Vec<usize> = log
                    .sut
                    .changed_blocks()
                    .into_iter()
                    .filter(|n| !sut_dst.iter().any(|(m, _)| m == n))
                    .collect();
                (ic, sc)
            };
            if imap_changed.is_empty() && sut_changed.is_empty() {
                break;
            }
            for n in imap_changed {
                let bno = self.balloc_meta()?;
                self.repoint_meta_block(bno, |log| {
                    let old = log.imap.addr(n);
                    log.imap.set_addr(n, bno);
                    old
                });
                imap_dst.push((n, bno));
            }
            for n in sut_changed {
                let bno = self.balloc_meta()?;
                self.repoint_meta_block(bno, |log| {
                    let old = log.sut.addr(n);
                    log.sut.set_addr(n, bno);
                    old
                });
                sut_dst.push((n, bno));
            }
        }

        for (n, bno) in imap_dst {
            let mut buf = self.bcache.bzero(bno);
            self.log.lock().imap.pack_block(n, buf.data_mut());
            buf.write()?;
            self.log.lock().imap.note_persisted(n, bno, buf.data());
        }
        for (n, bno) in sut_dst {
            let mut buf = self.bcache.bzero(bno);
            self.log.lock().sut.pack_block(n, buf.data_mut());
            buf.write()?;
            self.log.lock().sut.note_persisted(n, bno, buf.data());
        }
        Ok(())
    }

    /// Moves a metadata block's home and keeps the usage accounting right.
    fn repoint_meta_block<F: FnOnce(&mut LogState) -> u32>(&self, new: u32, f: F) {
        let tick = self.tick();
        let mut log = self.log.lock();
        let old = f(&mut *log);
        let nseg = self.sb.seg_of(new);
        log.sut.update(nseg, BSIZE as i64, tick);
        if old != 0 && self.sb.in_log(old) {
            let oseg = self.sb.seg_of(old);
            log.sut.update(oseg, -(BSIZE as i64), tick);
        }
    }

    fn write_checkpoint(&self) -> Result<()> {
        let ts = self.tick.fetch_add(1, Ordering::Relaxed) + 1;
        let mut cp = DCheckpoint::zero();
        {
            let log = self.log.lock();
            cp.cur_seg = log.seg.cur_seg();
            cp.seg_off = log.seg.seg_off();
            cp.tail = self.sb.seg_to_disk(cp.cur_seg, cp.seg_off.min(SEGDATA as u32));
            cp.imap_addrs = log.imap.addrs();
            cp.imap_nblocks = log.imap.nblocks();
            cp.sut_addrs = log.sut.addrs();
            cp.sut_nblocks = log.sut.nblocks();
        }
        cp.seal(ts);
        let (slot0, _) = self.sb.checkpoint_blocks();
        checkpoint::write_slot(&self.bcache, slot0, &cp)?;
        log::debug!("lfs: checkpoint {ts} committed");
        Ok(())
    }

    /// Opportunistic sync on the write path, standing in for a periodic
    /// timer.
    pub(crate) fn maybe_periodic_sync(&self) {
        let due = self.last_sync.lock().elapsed() >= Duration::from_millis(SYNC_INTERVAL_MS);
        if due {
            if let Err(e) = self.sync() {
                log::warn!("lfs: periodic sync failed: {e}");
            }
        }
    }

    /// Final sync before the engine goes away. Waits out a running cleaner
    /// or sync rather than skipping.
    pub fn shutdown(&self) -> Result<()> {
        self.sync_for_gc()
    }
}
