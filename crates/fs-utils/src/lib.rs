//! Block-device I/O primitives shared by the journal, block cache and
//! copyout engine.
//!
//! A block I/O interface taking device handle, buffer, length, and byte
//! offset, backed by ordinary positioned file I/O so the engine runs
//! unmodified against a regular file standing in for a block device in
//! tests.

mod device;
mod lockfile;

pub use device::BlockDevice;
pub use lockfile::LockFile;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },
    #[error("short write: expected {expected} bytes, wrote {actual}")]
    ShortWrite { expected: usize, actual: usize },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
