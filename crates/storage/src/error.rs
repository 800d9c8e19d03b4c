use thiserror::Error;

use chunksnap_primitives::{ChunkId, Space};

/// Engine-level errors.
///
/// I/O surfaces as a message-level error and the server stays alive;
/// format errors are fatal at startup; journal corruption is fatal;
/// allocation failure is handled by the caller (it triggers pressure
/// eviction for snapshot-data, or is surfaced for metadata).
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] chunksnap_fs_utils::Error),
    #[error(transparent)]
    Journal(#[from] chunksnap_journal::Error),
    #[error("superblock magic mismatch: store is not a chunksnap volume")]
    BadMagic,
    #[error("superblock format version {found} is not supported (expected {expected})")]
    BadVersion { found: u16, expected: u16 },
    #[error("{space} allocator space is exhausted")]
    OutOfSpace { space: Space },
    #[error("leaf {chunk} is full, caller must split")]
    LeafFull { chunk: ChunkId },
    #[error("corrupt leaf at {chunk}: {reason}")]
    CorruptLeaf { chunk: ChunkId, reason: &'static str },
    #[error("corrupt index node at {chunk}: {reason}")]
    CorruptNode { chunk: ChunkId, reason: &'static str },
    #[error("snapshot tag {0} already exists")]
    SnapshotExists(u32),
    #[error("unknown snapshot tag {0}")]
    UnknownSnapshot(u32),
    #[error("maximum of {0} live snapshots already reached")]
    TooManySnapshots(usize),
}

pub type Result<T> = std::result::Result<T, Error>;
