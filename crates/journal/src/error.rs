use thiserror::Error;

/// Errors surfaced while replaying the journal at startup.
///
/// Each of these is fatal: a corrupt journal is not something the daemon
/// can paper over, so recovery either succeeds completely or the process
/// refuses to start.
#[derive(Debug, Error)]
pub enum Recovery {
    #[error("no commit blocks found in journal")]
    NoCommitBlocks,
    #[error("multiple sequence wraps observed in journal")]
    MultipleSequenceWraps,
    #[error("bad block at slot {slot} was not the last block written")]
    BadBlockNotLast { slot: u64 },
    #[error("too many scribbled (checksum-mismatched) journal blocks")]
    TooManyScribbled,
    #[error("bad sequence number at slot {slot}: expected {expected}, found {found}")]
    BadSequence { slot: u64, expected: i64, found: i64 },
    #[error(transparent)]
    Io(#[from] chunksnap_fs_utils::Error),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("journal is full: {dirty} dirty buffers against a {capacity}-chunk journal")]
    Full { dirty: usize, capacity: usize },
    #[error("checksum mismatch in commit block at slot {slot}")]
    ChecksumMismatch { slot: u64 },
    #[error(transparent)]
    Recovery(#[from] Recovery),
    #[error(transparent)]
    Io(#[from] chunksnap_fs_utils::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
