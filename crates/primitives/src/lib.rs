//! Id types and small shared enums for the snapshot-store crates.
//!
//! These are kept dependency-light and `Copy` so every other crate in the
//! workspace can pass them by value without pulling in the engine itself.

use std::fmt;

/// Maximum number of live snapshots a store can hold at once.
///
/// Bounded by the width of a [`ShareMask`]/`snapmask`.
pub const MAX_SNAPSHOTS: usize = 64;

/// The reserved tag meaning "the origin volume", never assigned to a
/// snapshot.
pub const ORIGIN_TAG: u32 = u32::MAX;

/// A chunk index on either the metadata or the snapshot-data device.
///
/// Chunk size is a device-wide power of two fixed at format time; a
/// [`ChunkId`] is always relative to the start of its device, not a byte
/// offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ChunkId(pub u64);

impl ChunkId {
    pub const ZERO: ChunkId = ChunkId(0);

    pub fn checked_add(self, n: u64) -> Option<ChunkId> {
        self.0.checked_add(n).map(ChunkId)
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chunk#{}", self.0)
    }
}

impl From<u64> for ChunkId {
    fn from(v: u64) -> Self {
        ChunkId(v)
    }
}

/// A 512-byte sector offset, as used by the origin device addressing in the
/// superblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Sector(pub u64);

/// Which allocator space a [`ChunkId`] is drawn from.
///
/// The metadata and snapshot-data devices may be the same underlying block
/// device, in which case the two [`Space`]s still address disjoint bitmap
/// regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Space {
    Metadata,
    SnapshotData,
}

impl fmt::Display for Space {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Space::Metadata => "metadata",
            Space::SnapshotData => "snapshot-data",
        })
    }
}

/// A client-visible snapshot tag, chosen by whoever calls `CREATE_SNAPSHOT`.
///
/// [`ORIGIN_TAG`] is reserved and never held by a live snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SnapshotTag(pub u32);

impl SnapshotTag {
    pub fn is_origin(self) -> bool {
        self.0 == ORIGIN_TAG
    }
}

impl fmt::Display for SnapshotTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_origin() {
            f.write_str("origin")
        } else {
            write!(f, "snap#{}", self.0)
        }
    }
}

/// The internal bitmap position (0..64) a live snapshot occupies in every
/// exception's share mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SnapshotBit(pub u8);

impl SnapshotBit {
    pub fn mask(self) -> u64 {
        1u64 << self.0
    }
}

/// A view being written or read: either the origin, or a specific live
/// snapshot.
///
/// A proper tagged variant rather than the `snap == -1` sentinel integer
/// a wire-level client session uses to mean the same thing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum View {
    Origin,
    Snapshot(SnapshotBit),
}

impl View {
    pub fn from_raw(snap: i32) -> Option<View> {
        if snap < 0 {
            Some(View::Origin)
        } else if snap < MAX_SNAPSHOTS as i32 {
            Some(View::Snapshot(SnapshotBit(snap as u8)))
        } else {
            None
        }
    }

    pub fn is_origin(self) -> bool {
        matches!(self, View::Origin)
    }
}

/// Wire-level error codes, shared between `chunksnap-proto` (which encodes
/// them) and `chunksnap-daemon` (which produces them).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ErrorCode {
    #[error("unknown snapshot tag")]
    InvalidSnapshot = 1,
    #[error("usecount would underflow or overflow")]
    Usecount = 2,
    #[error("request size does not match negotiated chunk size")]
    SizeMismatch = 3,
    #[error("request offset does not match the identified origin range")]
    OffsetMismatch = 4,
    #[error("unrecognized message code")]
    UnknownMessage = 5,
    #[error("allocator space exhausted")]
    OutOfSpace = 6,
    #[error("I/O error against a backing device")]
    Io = 7,
}

impl ErrorCode {
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}
