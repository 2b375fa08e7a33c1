//! Core engine of a Sprite-style log-structured file system.
//!
//! Every mutation appends to a monotonically growing log tail. Inodes have
//! no fixed home: the imap maps each inode number to the block and slot of
//! its newest image, and drifts along with the log. Each segment's reserved
//! final block holds a summary of what the segment contains, which is what
//! lets the cost-benefit cleaner decide — by version check and path
//! resolution, with no reference counts — which blocks are still live, move
//! them to the tail, and recycle the segment.
//!
//! A minimal session:
//!
//! ```
//! use std::sync::Arc;
//! use rlfs::{mkfs, InodeType, Lfs, MemDisk};
//!
//! let disk = Arc::new(MemDisk::new(4 + 16 * 32));
//! mkfs(disk.as_ref()).unwrap();
//! let fs = Lfs::mount(disk).unwrap();
//!
//! let inum = fs.ialloc(InodeType::File).unwrap();
//! let ip = fs.iget(inum);
//! {
//!     let mut guard = fs.ilock(&ip).unwrap();
//!     guard.write(b"HELLO", 0).unwrap();
//!     let mut buf = [0u8; 5];
//!     guard.read(&mut buf, 0).unwrap();
//!     assert_eq!(&buf, b"HELLO");
//! }
//! fs.iput(ip).unwrap();
//! fs.shutdown().unwrap();
//! ```

mod bio;
mod checkpoint;
mod cleaner;
mod disk;
mod error;
mod imap;
mod inode;
mod itable;
mod lfs;
pub mod param;
mod segment;
mod segusage;
mod superblock;

pub use disk::{Disk, FileDisk, MemDisk};
pub use error::{Error, Result};
pub use inode::InodeType;
pub use itable::{Inode, InodeGuard};
pub use lfs::{Lfs, Stats};
pub use superblock::{mkfs, ROOTINO};
