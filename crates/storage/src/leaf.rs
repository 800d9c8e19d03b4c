//! Exception B-tree leaf layout and leaf-local operations.

use chunksnap_primitives::ChunkId;

use crate::error::{Error, Result};

pub const LEAF_MAGIC: u16 = 0x1eaf;
const LEAF_VERSION: u16 = 1;
const HEADER_LEN: usize = 24;
const DIR_ENTRY_LEN: usize = 8;
const EXCEPTION_LEN: usize = 16;

/// One `{share, chunk}` exception record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exception {
    pub share: u64,
    pub chunk: ChunkId,
}

/// One directory entry: an origin chunk (relative to the leaf's
/// `base_chunk`) and its non-empty list of exceptions.
#[derive(Debug, Clone)]
pub struct LeafEntry {
    pub rchunk: u32,
    pub exceptions: Vec<Exception>,
}

/// A decoded leaf ("eleaf"), held in memory while a request mutates it and
/// re-encoded to its chunk before release.
#[derive(Debug, Clone)]
pub struct Leaf {
    pub base_chunk: ChunkId,
    pub using_mask: u64,
    pub entries: Vec<LeafEntry>,
}

impl Leaf {
    pub fn empty(base_chunk: ChunkId) -> Self {
        Self {
            base_chunk,
            using_mask: 0,
            entries: Vec::new(),
        }
    }

    /// Directory index of the entry matching `rchunk`, if any, else the
    /// index of the smallest entry with `rchunk >= target` (where it
    /// would be inserted).
    pub fn find(&self, rchunk: u32) -> std::result::Result<usize, usize> {
        self.entries.binary_search_by_key(&rchunk, |e| e.rchunk)
    }

    fn total_exceptions(&self) -> usize {
        self.entries.iter().map(|e| e.exceptions.len()).sum()
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + (self.entries.len() + 1) * DIR_ENTRY_LEN + self.total_exceptions() * EXCEPTION_LEN
    }

    pub fn fits(&self, chunk_size: usize) -> bool {
        self.encoded_len() <= chunk_size
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The lowest `rchunk` held by this leaf, used as the split key when a
    /// sibling is created above it.
    pub fn lowest_rchunk(&self) -> Option<u32> {
        self.entries.first().map(|e| e.rchunk)
    }

    pub fn to_bytes(&self, chunk_size: usize, chunk: ChunkId) -> Result<Vec<u8>> {
        if !self.fits(chunk_size) {
            return Err(Error::LeafFull { chunk });
        }
        let mut out = vec![0u8; chunk_size];
        out[0..2].copy_from_slice(&LEAF_MAGIC.to_le_bytes());
        out[2..4].copy_from_slice(&LEAF_VERSION.to_le_bytes());
        out[4..6].copy_from_slice(&(self.entries.len() as u16).to_le_bytes());
        out[8..16].copy_from_slice(&self.base_chunk.0.to_le_bytes());
        out[16..24].copy_from_slice(&self.using_mask.to_le_bytes());

        let dir_start = HEADER_LEN;
        let mut cursor = HEADER_LEN + (self.entries.len() + 1) * DIR_ENTRY_LEN;
        for (i, entry) in self.entries.iter().enumerate() {
            let dir_off = dir_start + i * DIR_ENTRY_LEN;
            out[dir_off..dir_off + 4].copy_from_slice(&(cursor as u32).to_le_bytes());
            out[dir_off + 4..dir_off + 8].copy_from_slice(&entry.rchunk.to_le_bytes());
            for ex in &entry.exceptions {
                out[cursor..cursor + 8].copy_from_slice(&ex.share.to_le_bytes());
                out[cursor + 8..cursor + 16].copy_from_slice(&ex.chunk.0.to_le_bytes());
                cursor += EXCEPTION_LEN;
            }
        }
        // sentinel: offset holds the upper bound, rchunk is unused.
        let sentinel_off = dir_start + self.entries.len() * DIR_ENTRY_LEN;
        out[sentinel_off..sentinel_off + 4].copy_from_slice(&(cursor as u32).to_le_bytes());
        Ok(out)
    }

    pub fn from_bytes(buf: &[u8], chunk: ChunkId) -> Result<Self> {
        if buf.len() < HEADER_LEN || u16::from_le_bytes(buf[0..2].try_into().unwrap()) != LEAF_MAGIC {
            return Err(Error::CorruptLeaf {
                chunk,
                reason: "bad magic",
            });
        }
        let count = u16::from_le_bytes(buf[4..6].try_into().unwrap()) as usize;
        let base_chunk = ChunkId(u64::from_le_bytes(buf[8..16].try_into().unwrap()));
        let using_mask = u64::from_le_bytes(buf[16..24].try_into().unwrap());

        let dir_start = HEADER_LEN;
        let mut offsets = Vec::with_capacity(count + 1);
        let mut rchunks = Vec::with_capacity(count);
        for i in 0..=count {
            let dir_off = dir_start + i * DIR_ENTRY_LEN;
            if dir_off + DIR_ENTRY_LEN > buf.len() {
                return Err(Error::CorruptLeaf {
                    chunk,
                    reason: "directory overruns block",
                });
            }
            let offset = u32::from_le_bytes(buf[dir_off..dir_off + 4].try_into().unwrap()) as usize;
            offsets.push(offset);
            if i < count {
                rchunks.push(u32::from_le_bytes(buf[dir_off + 4..dir_off + 8].try_into().unwrap()));
            }
        }

        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            let (start, end) = (offsets[i], offsets[i + 1]);
            if end < start || end > buf.len() || (end - start) % EXCEPTION_LEN != 0 {
                return Err(Error::CorruptLeaf {
                    chunk,
                    reason: "exception slice out of range",
                });
            }
            let mut exceptions = Vec::with_capacity((end - start) / EXCEPTION_LEN);
            let mut cursor = start;
            while cursor < end {
                let share = u64::from_le_bytes(buf[cursor..cursor + 8].try_into().unwrap());
                let exc_chunk = ChunkId(u64::from_le_bytes(buf[cursor + 8..cursor + 16].try_into().unwrap()));
                exceptions.push(Exception { share, chunk: exc_chunk });
                cursor += EXCEPTION_LEN;
            }
            if exceptions.is_empty() {
                return Err(Error::CorruptLeaf {
                    chunk,
                    reason: "empty exception slice",
                });
            }
            entries.push(LeafEntry {
                rchunk: rchunks[i],
                exceptions,
            });
        }

        Ok(Self {
            base_chunk,
            using_mask,
            entries,
        })
    }
}
