//! Exception B-tree internal ("enode") layout.

use chunksnap_primitives::ChunkId;

use crate::error::{Error, Result};

pub const NODE_MAGIC: u16 = 0xe0de;
const NODE_VERSION: u16 = 1;
const HEADER_LEN: usize = 8;
const ENTRY_LEN: usize = 16;

/// One `(key, child)` pair. The entry at index 0 of a node's `entries` has
/// an unused key — pivots lie *between* children, so the leftmost child
/// has no lower bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeEntry {
    pub key: u64,
    pub child: ChunkId,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub entries: Vec<NodeEntry>,
}

impl Node {
    pub fn new(entries: Vec<NodeEntry>) -> Self {
        Self { entries }
    }

    pub fn max_entries(chunk_size: usize) -> usize {
        (chunk_size - HEADER_LEN) / ENTRY_LEN
    }

    pub fn is_full(&self, chunk_size: usize) -> bool {
        self.entries.len() >= Self::max_entries(chunk_size)
    }

    /// Index of the child to descend into for `key`: the largest entry
    /// whose key is `<= key`, or 0 if `key` is smaller than every pivot.
    pub fn descend_index(&self, key: u64) -> usize {
        match self.entries.binary_search_by_key(&key, |e| e.key) {
            Ok(i) => i,
            Err(0) => 0,
            Err(i) => i - 1,
        }
    }

    pub fn to_bytes(&self, chunk_size: usize, chunk: ChunkId) -> Result<Vec<u8>> {
        if self.entries.len() > Self::max_entries(chunk_size) {
            return Err(Error::LeafFull { chunk });
        }
        let mut out = vec![0u8; chunk_size];
        out[0..2].copy_from_slice(&NODE_MAGIC.to_le_bytes());
        out[2..4].copy_from_slice(&NODE_VERSION.to_le_bytes());
        out[4..6].copy_from_slice(&(self.entries.len() as u16).to_le_bytes());
        for (i, e) in self.entries.iter().enumerate() {
            let off = HEADER_LEN + i * ENTRY_LEN;
            out[off..off + 8].copy_from_slice(&e.key.to_le_bytes());
            out[off + 8..off + 16].copy_from_slice(&e.child.0.to_le_bytes());
        }
        Ok(out)
    }

    pub fn from_bytes(buf: &[u8], chunk: ChunkId) -> Result<Self> {
        if buf.len() < HEADER_LEN || u16::from_le_bytes(buf[0..2].try_into().unwrap()) != NODE_MAGIC {
            return Err(Error::CorruptNode {
                chunk,
                reason: "bad magic",
            });
        }
        let count = u16::from_le_bytes(buf[4..6].try_into().unwrap()) as usize;
        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            let off = HEADER_LEN + i * ENTRY_LEN;
            if off + ENTRY_LEN > buf.len() {
                return Err(Error::CorruptNode {
                    chunk,
                    reason: "entry array overruns block",
                });
            }
            let key = u64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
            let child = ChunkId(u64::from_le_bytes(buf[off + 8..off + 16].try_into().unwrap()));
            entries.push(NodeEntry { key, child });
        }
        Ok(Self { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descend_index_finds_enclosing_pivot() {
        let node = Node::new(vec![
            NodeEntry { key: 0, child: ChunkId(1) },
            NodeEntry { key: 100, child: ChunkId(2) },
            NodeEntry { key: 200, child: ChunkId(3) },
        ]);
        assert_eq!(node.descend_index(0), 0);
        assert_eq!(node.descend_index(50), 0);
        assert_eq!(node.descend_index(100), 1);
        assert_eq!(node.descend_index(150), 1);
        assert_eq!(node.descend_index(9999), 2);
    }

    #[test]
    fn round_trips_through_bytes() {
        let node = Node::new(vec![
            NodeEntry { key: 0, child: ChunkId(5) },
            NodeEntry { key: 42, child: ChunkId(6) },
        ]);
        let bytes = node.to_bytes(256, ChunkId(0)).unwrap();
        let back = Node::from_bytes(&bytes, ChunkId(0)).unwrap();
        assert_eq!(back.entries, node.entries);
    }
}
