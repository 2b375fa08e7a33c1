/// Block size (bytes).
pub const BSIZE: usize = 1024;

/// Blocks per segment, including the reserved summary block.
pub const SEGSIZE: usize = 32;

/// Data slots per segment. The final block of every segment is reserved for
/// the segment summary and is never handed out for payload.
pub const SEGDATA: usize = SEGSIZE - 1;

/// Direct block pointers per inode.
pub const NDIRECT: usize = 11;

/// Block pointers in a single indirect block.
pub const NINDIRECT: usize = BSIZE / 4;

/// Maximum file size (blocks).
pub const MAXFILE: usize = NDIRECT + NINDIRECT;

/// Maximum number of inodes per file system.
pub const NINODES: usize = 512;

/// Blocks holding the imap.
pub const NIMAP_BLOCKS: usize = NINODES * 4 / BSIZE;

/// Maximum number of segments per file system.
pub const MAXSEGS: usize = 256;

/// Blocks holding the segment usage table.
pub const NSUT_BLOCKS: usize = MAXSEGS * 8 / BSIZE;

/// Size of the disk block cache.
pub const NBUF: usize = 32;

/// Maximum number of in-memory inodes.
pub const NINODE: usize = 32;

/// Disk-use percentage above which the cleaner is triggered.
pub const GC_THRESHOLD: usize = 40;

/// Victim segments cleaned per run; also the free-segment target.
pub const GC_TARGET_SEGS: usize = 4;

/// Segments with utilization above this percentage are not considered
/// for cleaning unless no other candidate exists.
pub const GC_UTIL_THRESHOLD: usize = 90;

/// Milliseconds between opportunistic syncs on the write path.
pub const SYNC_INTERVAL_MS: u64 = 1000;
