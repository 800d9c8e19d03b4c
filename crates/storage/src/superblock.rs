//! Superblock: the fixed-sector root of a formatted store.

use chunksnap_primitives::{ChunkId, MAX_SNAPSHOTS, ORIGIN_TAG};

use crate::error::{Error, Result};

pub const SB_MAGIC: u64 = 0x6368_756e_6b73_6e70; // "chunksnp" as bytes, little-endian u64
pub const SB_VERSION: u16 = 1;
/// Byte offset of the superblock on the metadata device (`SB_SECTOR << 9`).
pub const SB_SECTOR: u64 = 8;

/// A live snapshot's entry in the superblock's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotRecord {
    pub tag: u32,
    pub bit: u8,
    pub priority: i8,
    pub ctime: u32,
    pub usecount: u32,
}

impl SnapshotRecord {
    const ENCODED_LEN: usize = 4 + 1 + 1 + 4 + 4;

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.tag.to_le_bytes());
        out.push(self.bit);
        out.push(self.priority as u8);
        out.extend_from_slice(&self.ctime.to_le_bytes());
        out.extend_from_slice(&self.usecount.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Self {
        Self {
            tag: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            bit: buf[4],
            priority: buf[5] as i8,
            ctime: u32::from_le_bytes(buf[6..10].try_into().unwrap()),
            usecount: u32::from_le_bytes(buf[10..14].try_into().unwrap()),
        }
    }
}

/// Per-space allocation bookkeeping: bitmap geometry and free-chunk
/// counters for either the metadata or snapshot-data space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocDescriptor {
    pub chunk_size_bits: u8,
    pub total_chunks: u64,
    pub free_chunks: u64,
    pub bitmap_base: ChunkId,
    pub bitmap_blocks: u64,
    pub last_alloc: ChunkId,
}

impl AllocDescriptor {
    const ENCODED_LEN: usize = 1 + 8 * 4 + 8;

    fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.chunk_size_bits);
        out.extend_from_slice(&self.total_chunks.to_le_bytes());
        out.extend_from_slice(&self.free_chunks.to_le_bytes());
        out.extend_from_slice(&self.bitmap_base.0.to_le_bytes());
        out.extend_from_slice(&self.bitmap_blocks.to_le_bytes());
        out.extend_from_slice(&self.last_alloc.0.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Self {
        Self {
            chunk_size_bits: buf[0],
            total_chunks: u64::from_le_bytes(buf[1..9].try_into().unwrap()),
            free_chunks: u64::from_le_bytes(buf[9..17].try_into().unwrap()),
            bitmap_base: ChunkId(u64::from_le_bytes(buf[17..25].try_into().unwrap())),
            bitmap_blocks: u64::from_le_bytes(buf[25..33].try_into().unwrap()),
            last_alloc: ChunkId(u64::from_le_bytes(buf[33..41].try_into().unwrap())),
        }
    }

    pub fn chunk_size(&self) -> usize {
        1usize << self.chunk_size_bits
    }
}

#[derive(Debug, Clone)]
pub struct Superblock {
    pub metadata: AllocDescriptor,
    pub snapshot_data: AllocDescriptor,
    pub etree_root: ChunkId,
    pub etree_levels: u32,
    pub journal_base: ChunkId,
    pub journal_size: u64,
    pub journal_next: u64,
    pub sequence: i64,
    pub origin_offset_sectors: u64,
    pub origin_size_sectors: u64,
    pub snapmask: u64,
    pub snapshots: Vec<SnapshotRecord>,
    pub metadata_used: u64,
    pub snapshot_used: u64,
    pub busy: bool,
    pub ctime: u32,
}

impl Superblock {
    /// Creates a fresh superblock for `--format`, with an empty snapshot
    /// table and a single-leaf, zero-level tree rooted at `root_leaf`.
    pub fn format(
        metadata: AllocDescriptor,
        snapshot_data: AllocDescriptor,
        root_leaf: ChunkId,
        journal_base: ChunkId,
        journal_size: u64,
        origin_offset_sectors: u64,
        origin_size_sectors: u64,
        ctime: u32,
    ) -> Self {
        Self {
            metadata,
            snapshot_data,
            etree_root: root_leaf,
            etree_levels: 0,
            journal_base,
            journal_size,
            journal_next: 0,
            sequence: 0,
            origin_offset_sectors,
            origin_size_sectors,
            snapmask: 0,
            snapshots: Vec::new(),
            metadata_used: 0,
            snapshot_used: 0,
            busy: false,
            ctime,
        }
    }

    pub fn snapshot_by_tag(&self, tag: u32) -> Option<&SnapshotRecord> {
        self.snapshots.iter().find(|s| s.tag == tag)
    }

    pub fn snapshot_by_tag_mut(&mut self, tag: u32) -> Option<&mut SnapshotRecord> {
        self.snapshots.iter_mut().find(|s| s.tag == tag)
    }

    pub fn lowest_free_bit(&self) -> Option<u8> {
        (0..MAX_SNAPSHOTS as u8).find(|b| self.snapmask & (1 << b) == 0)
    }

    pub fn to_bytes(&self, len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len);
        out.extend_from_slice(&SB_MAGIC.to_le_bytes());
        out.extend_from_slice(&SB_VERSION.to_le_bytes());
        out.push(self.busy as u8);
        out.extend_from_slice(&[0u8; 5]); // pad to 8-byte alignment
        self.metadata.encode(&mut out);
        self.snapshot_data.encode(&mut out);
        out.extend_from_slice(&self.etree_root.0.to_le_bytes());
        out.extend_from_slice(&self.etree_levels.to_le_bytes());
        out.extend_from_slice(&self.journal_base.0.to_le_bytes());
        out.extend_from_slice(&self.journal_size.to_le_bytes());
        out.extend_from_slice(&self.journal_next.to_le_bytes());
        out.extend_from_slice(&self.sequence.to_le_bytes());
        out.extend_from_slice(&self.origin_offset_sectors.to_le_bytes());
        out.extend_from_slice(&self.origin_size_sectors.to_le_bytes());
        out.extend_from_slice(&self.snapmask.to_le_bytes());
        out.extend_from_slice(&self.metadata_used.to_le_bytes());
        out.extend_from_slice(&self.snapshot_used.to_le_bytes());
        out.extend_from_slice(&self.ctime.to_le_bytes());
        out.extend_from_slice(&(self.snapshots.len() as u32).to_le_bytes());
        for s in &self.snapshots {
            s.encode(&mut out);
        }
        assert!(out.len() <= len, "superblock does not fit in one chunk");
        out.resize(len, 0);
        out
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < 16 || u64::from_le_bytes(buf[0..8].try_into().unwrap()) != SB_MAGIC {
            return Err(Error::BadMagic);
        }
        let version = u16::from_le_bytes(buf[8..10].try_into().unwrap());
        if version != SB_VERSION {
            return Err(Error::BadVersion {
                found: version,
                expected: SB_VERSION,
            });
        }
        let busy = buf[10] != 0;
        let mut off = 16;
        let metadata = AllocDescriptor::decode(&buf[off..off + AllocDescriptor::ENCODED_LEN]);
        off += AllocDescriptor::ENCODED_LEN;
        let snapshot_data = AllocDescriptor::decode(&buf[off..off + AllocDescriptor::ENCODED_LEN]);
        off += AllocDescriptor::ENCODED_LEN;
        let etree_root = ChunkId(u64::from_le_bytes(buf[off..off + 8].try_into().unwrap()));
        off += 8;
        let etree_levels = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        off += 4;
        let journal_base = ChunkId(u64::from_le_bytes(buf[off..off + 8].try_into().unwrap()));
        off += 8;
        let journal_size = u64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
        off += 8;
        let journal_next = u64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
        off += 8;
        let sequence = i64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
        off += 8;
        let origin_offset_sectors = u64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
        off += 8;
        let origin_size_sectors = u64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
        off += 8;
        let snapmask = u64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
        off += 8;
        let metadata_used = u64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
        off += 8;
        let snapshot_used = u64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
        off += 8;
        let ctime = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        off += 4;
        let count = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap()) as usize;
        off += 4;
        let mut snapshots = Vec::with_capacity(count);
        for _ in 0..count {
            snapshots.push(SnapshotRecord::decode(&buf[off..off + SnapshotRecord::ENCODED_LEN]));
            off += SnapshotRecord::ENCODED_LEN;
        }
        Ok(Self {
            metadata,
            snapshot_data,
            etree_root,
            etree_levels,
            journal_base,
            journal_size,
            journal_next,
            sequence,
            origin_offset_sectors,
            origin_size_sectors,
            snapmask,
            snapshots,
            metadata_used,
            snapshot_used,
            busy,
            ctime,
        })
    }
}

/// The reserved tag meaning "origin" can never appear in the snapshot
/// table; kept here only as a compile-time cross-check against
/// [`chunksnap_primitives::ORIGIN_TAG`].
const _: () = assert!(ORIGIN_TAG == u32::MAX);

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> AllocDescriptor {
        AllocDescriptor {
            chunk_size_bits: 12,
            total_chunks: 4096,
            free_chunks: 4000,
            bitmap_base: ChunkId(1),
            bitmap_blocks: 2,
            last_alloc: ChunkId(0),
        }
    }

    #[test]
    fn round_trips_through_bytes() {
        let mut sb = Superblock::format(descriptor(), descriptor(), ChunkId(10), ChunkId(20), 16, 0, 65536, 1000);
        sb.snapshots.push(SnapshotRecord {
            tag: 1,
            bit: 0,
            priority: 0,
            ctime: 1001,
            usecount: 0,
        });
        sb.snapmask = 1;
        sb.busy = true;

        let bytes = sb.to_bytes(4096);
        let back = Superblock::from_bytes(&bytes).unwrap();
        assert_eq!(back.etree_root, sb.etree_root);
        assert_eq!(back.snapmask, 1);
        assert_eq!(back.snapshots, sb.snapshots);
        assert!(back.busy);
    }

    #[test]
    fn rejects_bad_magic() {
        let buf = vec![0u8; 4096];
        assert!(matches!(Superblock::from_bytes(&buf), Err(Error::BadMagic)));
    }
}
