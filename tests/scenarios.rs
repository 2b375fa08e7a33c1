//! End-to-end scenarios against an in-memory disk: the write/read path,
//! overwrite liveness, truncation, cleaning under pressure, indirect-block
//! relocation, and checkpoint recovery.

use std::sync::Arc;

use rlfs::param::{BSIZE, GC_TARGET_SEGS, SEGSIZE};
use rlfs::{mkfs, InodeType, Lfs, MemDisk};

fn fresh(nsegs: u32) -> (Arc<MemDisk>, Lfs) {
    let _ = env_logger::builder().is_test(true).try_init();
    let disk = Arc::new(MemDisk::new(4 + nsegs * SEGSIZE as u32));
    mkfs(disk.as_ref()).unwrap();
    let fs = Lfs::mount(disk.clone()).unwrap();
    (disk, fs)
}

/// A recognizable per-file pattern.
fn pattern(inum: u32, len: usize) -> Vec<u8> {
    (0..len).map(|i| (inum as usize + i * 7) as u8).collect()
}

fn write_file(fs: &Lfs, len: usize) -> u32 {
    let inum = fs.ialloc(InodeType::File).unwrap();
    let ip = fs.iget(inum);
    {
        let mut guard = fs.ilock(&ip).unwrap();
        guard.write(&pattern(inum, len), 0).unwrap();
    }
    fs.iput(ip).unwrap();
    inum
}

fn check_file(fs: &Lfs, inum: u32, len: usize) {
    let ip = fs.iget(inum);
    {
        let mut guard = fs.ilock(&ip).unwrap();
        assert_eq!(guard.size() as usize, len, "inum {inum} size");
        let mut buf = vec![0u8; len];
        assert_eq!(guard.read(&mut buf, 0).unwrap(), len);
        assert_eq!(buf, pattern(inum, len), "inum {inum} content");
    }
    fs.iput(ip).unwrap();
}

fn unlink(fs: &Lfs, inum: u32) {
    let ip = fs.iget(inum);
    {
        let mut guard = fs.ilock(&ip).unwrap();
        guard.set_nlink(0).unwrap();
    }
    fs.iput(ip).unwrap();
}

#[test]
fn create_write_read() {
    let (_disk, fs) = fresh(16);
    let before = fs.stats().live_bytes;

    let inum = fs.ialloc(InodeType::File).unwrap();
    assert_eq!(inum, 2, "first inum after the mkfs root");

    let ip = fs.iget(inum);
    {
        let mut guard = fs.ilock(&ip).unwrap();
        assert_eq!(guard.write(b"HELLO", 0).unwrap(), 5);
        assert_eq!(guard.size(), 5);

        let mut buf = [0u8; 5];
        assert_eq!(guard.read(&mut buf, 0).unwrap(), 5);
        assert_eq!(&buf, b"HELLO");
    }
    fs.iput(ip).unwrap();

    fs.sync().unwrap();
    // At least the data block and the inode-block flush went live.
    assert!(fs.stats().live_bytes >= before + 2 * BSIZE as u64);
}

#[test]
fn overwrite_kills_old_block_and_cleaner_reclaims_it() {
    let (_disk, fs) = fresh(16);

    let inum = fs.ialloc(InodeType::File).unwrap();
    let ip = fs.iget(inum);
    {
        let mut guard = fs.ilock(&ip).unwrap();
        guard.write(&[0xAA; BSIZE], 0).unwrap();
        let after_first = fs.stats().live_bytes;
        guard.write(&[0xBB; BSIZE], 0).unwrap();
        // The first copy is dead: one block died, one was appended.
        assert!(fs.stats().live_bytes <= after_first);
    }
    fs.iput(ip).unwrap();

    // Push the tail out of the segment holding the dead block, then clean.
    for _ in 0..3 {
        let filler = write_file(&fs, 16 * BSIZE);
        check_file(&fs, filler, 16 * BSIZE);
    }
    fs.sync().unwrap();

    let before = fs.stats().free_segs;
    assert!(fs.clean().unwrap(), "cleaner should make progress");
    assert!(fs.stats().free_segs >= before);

    let ip = fs.iget(inum);
    {
        let mut guard = fs.ilock(&ip).unwrap();
        let mut buf = [0u8; BSIZE];
        assert_eq!(guard.read(&mut buf, 0).unwrap(), BSIZE);
        assert_eq!(buf, [0xBB; BSIZE]);
    }
    fs.iput(ip).unwrap();
}

#[test]
fn truncate_severs_old_data() {
    let (_disk, fs) = fresh(16);

    let inum = fs.ialloc(InodeType::File).unwrap();
    assert_eq!(inum, 2);
    let ip = fs.iget(inum);
    {
        let mut guard = fs.ilock(&ip).unwrap();
        // 20 KiB forces the indirect block into play.
        guard.write(&pattern(inum, 20 * BSIZE), 0).unwrap();
        assert_eq!(guard.version(), 0);
        guard.set_nlink(0).unwrap();
    }
    fs.iput(ip).unwrap(); // last reference: truncate, version bump, free

    let reused = fs.ialloc(InodeType::File).unwrap();
    assert_eq!(reused, 2, "freed inum is reused");
    let ip = fs.iget(reused);
    {
        let mut guard = fs.ilock(&ip).unwrap();
        assert_eq!(guard.size(), 0, "no old data reachable");
        let mut buf = [0u8; BSIZE];
        assert_eq!(guard.read(&mut buf, 0).unwrap(), 0);
    }
    fs.iput(ip).unwrap();
}

#[test]
fn version_increments_on_truncate() {
    let (_disk, fs) = fresh(16);

    let inum = fs.ialloc(InodeType::File).unwrap();
    let ip = fs.iget(inum);
    {
        let mut guard = fs.ilock(&ip).unwrap();
        guard.write(&pattern(inum, 4 * BSIZE), 0).unwrap();
        assert_eq!(guard.version(), 0);
        guard.trunc().unwrap();
        assert_eq!(guard.version(), 1);
        guard.write(b"fresh", 0).unwrap();
        assert_eq!(guard.version(), 1, "writes do not bump the version");
    }
    fs.iput(ip).unwrap();
}

#[test]
fn gc_under_pressure_loses_nothing() {
    let (_disk, fs) = fresh(16);
    const LEN: usize = 32 * BSIZE; // 32 KiB per file

    // Fill a good share of the disk.
    let first: Vec<u32> = (0..6).map(|_| write_file(&fs, LEN)).collect();
    fs.sync().unwrap();

    // Delete every other file, then keep writing; the allocator invokes
    // the cleaner as the free ring drains.
    for &inum in first.iter().step_by(2) {
        unlink(&fs, inum);
    }
    let survivors: Vec<u32> = first.iter().copied().skip(1).step_by(2).collect();

    let mut later = Vec::new();
    for _ in 0..4 {
        later.push(write_file(&fs, LEN));
    }
    fs.sync().unwrap();

    for &inum in survivors.iter().chain(later.iter()) {
        check_file(&fs, inum, LEN);
    }

    // Cleaning must have kept (or restored) the free-segment target.
    for _ in 0..8 {
        if !fs.clean().unwrap() {
            break;
        }
    }
    assert!(
        fs.stats().free_segs >= GC_TARGET_SEGS as u32,
        "free segments: {} of {}",
        fs.stats().free_segs,
        fs.stats().nsegs,
    );
}

#[test]
fn indirect_block_relocation_preserves_tail() {
    let (_disk, fs) = fresh(16);
    const LEN: usize = 32 * BSIZE;

    let inum = fs.ialloc(InodeType::File).unwrap();
    let ip = fs.iget(inum);
    {
        let mut guard = fs.ilock(&ip).unwrap();
        let data = pattern(inum, LEN);
        // Two halves, the second reached through the indirect block.
        guard.write(&data[..LEN / 2], 0).unwrap();
        guard.write(&data[LEN / 2..], LEN as u32 / 2).unwrap();
    }
    fs.iput(ip).unwrap();
    fs.sync().unwrap();

    // Advance the tail past the segments holding the file, then force a
    // cleaning pass over them; the indirect block must move and keep
    // resolving.
    for _ in 0..2 {
        write_file(&fs, 8 * BSIZE);
    }
    fs.sync().unwrap();
    fs.clean().unwrap();

    check_file(&fs, inum, LEN);
}

#[test]
fn indirect_updates_do_not_leak_across_checkpoint() {
    let (disk, fs) = fresh(16);
    const LEN: usize = 16 * BSIZE;

    let inum = fs.ialloc(InodeType::File).unwrap();
    let ip = fs.iget(inum);
    let old = pattern(inum, LEN);
    {
        let mut guard = fs.ilock(&ip).unwrap();
        guard.write(&old, 0).unwrap();
    }
    fs.sync().unwrap();

    // Overwrite a block reached through the indirect pointer, then crash
    // before the next sync.
    {
        let mut guard = fs.ilock(&ip).unwrap();
        guard.write(&[0x5A; BSIZE], 14 * BSIZE as u32).unwrap();
    }
    let snap = Arc::new(disk.snapshot());
    fs.iput(ip).unwrap();

    // The checkpointed inode still resolves through the old indirect
    // block; the un-synced overwrite must be lost in full, not bleed
    // through a mutated slot of a block the checkpoint references.
    let recovered = Lfs::mount(snap).unwrap();
    let ip = recovered.iget(inum);
    {
        let mut guard = recovered.ilock(&ip).unwrap();
        let mut buf = vec![0u8; LEN];
        assert_eq!(guard.read(&mut buf, 0).unwrap(), LEN);
        assert_eq!(buf, old);
    }
    recovered.iput(ip).unwrap();
}

#[test]
fn checkpoint_recovery_sees_synced_files_only() {
    let (disk, fs) = fresh(16);
    const LEN: usize = 4 * BSIZE;

    let synced: Vec<u32> = (0..3).map(|_| write_file(&fs, LEN)).collect();
    fs.sync().unwrap();

    let unsynced: Vec<u32> = (0..2).map(|_| write_file(&fs, LEN)).collect();

    // Crash: mount a copy of the disk as it is right now.
    let snap = Arc::new(disk.snapshot());
    let recovered = Lfs::mount(snap).unwrap();

    for &inum in &synced {
        check_file(&recovered, inum, LEN);
    }
    for &inum in &unsynced {
        let ip = recovered.iget(inum);
        assert!(
            recovered.ilock(&ip).is_err(),
            "inum {inum} must not be allocated after recovery"
        );
    }
}

#[test]
fn torn_checkpoint_falls_back_to_older_slot() {
    let (disk, fs) = fresh(16);
    write_file(&fs, 4 * BSIZE);
    fs.shutdown().unwrap();
    drop(fs);

    // Tear slot 0: flip the footer timestamp.
    use rlfs::Disk;
    let mut block = [0u8; BSIZE];
    disk.read_block(2, &mut block).unwrap();
    block[BSIZE - 1] ^= 0xFF;
    disk.write_block(2, &block).unwrap();

    // The mount falls back to the mkfs-era checkpoint in slot 1: the file
    // from after mkfs is gone, but the file system is usable.
    let recovered = Lfs::mount(disk.clone()).unwrap();
    let ip = recovered.iget(2);
    assert!(recovered.ilock(&ip).is_err());
    let inum = recovered.ialloc(InodeType::File).unwrap();
    assert_eq!(inum, 2);
}

#[test]
fn remount_preserves_data() {
    let (disk, fs) = fresh(16);
    const LEN: usize = 12 * BSIZE + 300;

    let inum = write_file(&fs, LEN);
    fs.shutdown().unwrap();
    drop(fs);

    let fs = Lfs::mount(disk).unwrap();
    check_file(&fs, inum, LEN);
}

#[test]
fn random_overwrites_match_shadow() {
    use rand::{Rng, SeedableRng};
    let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    let (_disk, fs) = fresh(16);
    const LEN: usize = 24 * BSIZE;

    let inum = fs.ialloc(InodeType::File).unwrap();
    let ip = fs.iget(inum);
    let mut shadow = vec![0u8; LEN];
    {
        let mut guard = fs.ilock(&ip).unwrap();
        guard.write(&shadow, 0).unwrap();

        for _ in 0..40 {
            let off = rng.gen_range(0..LEN - 1);
            let len = rng.gen_range(1..=(LEN - off).min(3 * BSIZE));
            let data: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            guard.write(&data, off as u32).unwrap();
            shadow[off..off + len].copy_from_slice(&data);
        }

        let mut out = vec![0u8; LEN];
        assert_eq!(guard.read(&mut out, 0).unwrap(), LEN);
        assert_eq!(out, shadow);
    }
    fs.iput(ip).unwrap();
}

#[test]
fn concurrent_writers_on_distinct_files() {
    let (_disk, fs) = fresh(32);
    let fs = Arc::new(fs);
    const LEN: usize = 8 * BSIZE;

    let inums: Vec<u32> = (0..4)
        .map(|_| fs.ialloc(InodeType::File).unwrap())
        .collect();

    let mut handles = Vec::new();
    for &inum in &inums {
        let fs = fs.clone();
        handles.push(std::thread::spawn(move || {
            let ip = fs.iget(inum);
            {
                let mut guard = fs.ilock(&ip).unwrap();
                guard.write(&pattern(inum, LEN), 0).unwrap();
            }
            fs.iput(ip).unwrap();
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    fs.sync().unwrap();
    for &inum in &inums {
        check_file(&fs, inum, LEN);
    }
}
