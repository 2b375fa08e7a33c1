//! Error taxonomy of the engine.
//!
//! Corruption found on the read side (cleaner scans, recovery) is logged and
//! skipped; corruption on the write side and internal invariant violations
//! panic, since continuing would damage more data.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// No free segment could be produced, even after an emergency cleaner
    /// run. Fails the originating write.
    #[error("out of log space")]
    OutOfSpace,

    /// An on-disk value is out of range or fails validation.
    #[error("corrupt file system: {0}")]
    Corrupt(&'static str),

    /// The caller passed an offset or argument outside the file's limits.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),

    /// The underlying block device failed; no state mutation is visible.
    #[error("disk i/o: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
