//! Buffered, dirty-tracked access to metadata device chunks.

use std::collections::HashMap;

use chunksnap_fs_utils::BlockDevice;
use chunksnap_journal::DirtyBuffer;
use chunksnap_primitives::ChunkId;

use crate::error::Result;

struct Entry {
    data: Vec<u8>,
    refcount: u32,
    dirty: bool,
    /// Set once the buffer has been read from or fully written; `getblk`
    /// hands back zeroed buffers that are not yet loaded.
    loaded: bool,
}

/// A cache over one device's chunks.
///
/// One instance per backing device (the metadata device always has one;
/// a distinct snapshot-data device, if configured, is accessed directly by
/// the copyout engine rather than through this cache, since only metadata
/// blocks need write-back buffering and dirty tracking).
pub struct BlockCache {
    chunk_size: usize,
    entries: HashMap<ChunkId, Entry>,
    /// Insertion-ordered list of dirty chunks, so commits apply in the
    /// order writes happened.
    dirty_order: Vec<ChunkId>,
}

/// A pinned reference to a cached buffer. Released by calling
/// [`BlockCache::brelse`] or [`BlockCache::brelse_dirty`] with the same
/// chunk id; there is no `Drop`-based guard, since the buffer is modeled
/// as owned by the caller until explicitly released, matching a plain
/// `bread`/`brelse` pair.
impl BlockCache {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size,
            entries: HashMap::new(),
            dirty_order: Vec::new(),
        }
    }

    pub fn dirty_buffer_count(&self) -> usize {
        self.dirty_order.len()
    }

    /// Returns a buffer for `chunk` without reading it, pinning it in the
    /// cache. Used when the caller is about to overwrite the whole chunk
    /// (a freshly allocated leaf or bitmap block).
    pub fn getblk(&mut self, chunk: ChunkId) -> &mut [u8] {
        let chunk_size = self.chunk_size;
        let entry = self.entries.entry(chunk).or_insert_with(|| Entry {
            data: vec![0u8; chunk_size],
            refcount: 0,
            dirty: false,
            loaded: true,
        });
        entry.refcount += 1;
        &mut entry.data
    }

    /// Returns a buffer for `chunk`, reading it from `device` on first
    /// access.
    pub fn bread(&mut self, device: &BlockDevice, chunk: ChunkId) -> Result<&[u8]> {
        let chunk_size = self.chunk_size;
        if !self.entries.contains_key(&chunk) {
            let mut data = vec![0u8; chunk_size];
            device.read_at(&mut data, chunk.0 * chunk_size as u64)?;
            self.entries.insert(
                chunk,
                Entry {
                    data,
                    refcount: 0,
                    dirty: false,
                    loaded: true,
                },
            );
        }
        let entry = self.entries.get_mut(&chunk).unwrap();
        if !entry.loaded {
            device.read_at(&mut entry.data, chunk.0 * chunk_size as u64)?;
            entry.loaded = true;
        }
        entry.refcount += 1;
        Ok(&self.entries[&chunk].data)
    }

    pub fn set_buffer_dirty(&mut self, chunk: ChunkId) {
        if let Some(entry) = self.entries.get_mut(&chunk) {
            if !entry.dirty {
                entry.dirty = true;
                self.dirty_order.push(chunk);
            }
        }
    }

    /// Releases one reference without marking the buffer dirty.
    pub fn brelse(&mut self, chunk: ChunkId) {
        if let Some(entry) = self.entries.get_mut(&chunk) {
            entry.refcount = entry.refcount.saturating_sub(1);
        }
    }

    /// Releases one reference and marks the buffer dirty.
    pub fn brelse_dirty(&mut self, chunk: ChunkId) {
        self.set_buffer_dirty(chunk);
        self.brelse(chunk);
    }

    /// Writes one buffer synchronously to its chunk's own location,
    /// bypassing the journal. Used only for the superblock, which is not
    /// itself journaled (the journal lives inside the region it protects).
    pub fn write_buffer(&self, device: &BlockDevice, chunk: ChunkId) -> Result<()> {
        if let Some(entry) = self.entries.get(&chunk) {
            device.write_at(&entry.data, chunk.0 * self.chunk_size as u64)?;
        }
        Ok(())
    }

    pub fn write_buffer_to(&self, device: &BlockDevice, chunk: ChunkId, target_offset: u64) -> Result<()> {
        if let Some(entry) = self.entries.get(&chunk) {
            device.write_at(&entry.data, target_offset)?;
        }
        Ok(())
    }

    /// Drains the dirty list into journal-ready buffers, in commit order,
    /// clearing each buffer's dirty flag. Does not evict anything: clean
    /// buffers stay cached until [`BlockCache::evict_buffer`] is called
    /// under memory pressure (not currently exercised — the working set of
    /// a single store's metadata is small enough to keep resident).
    pub fn flush_buffers(&mut self) -> Vec<DirtyBuffer> {
        let chunk_size = self.chunk_size as u64;
        let mut out = Vec::with_capacity(self.dirty_order.len());
        for chunk in self.dirty_order.drain(..) {
            if let Some(entry) = self.entries.get_mut(&chunk) {
                entry.dirty = false;
                out.push(DirtyBuffer {
                    sector: chunk.0 * chunk_size,
                    data: entry.data.clone(),
                });
            }
        }
        out
    }

    /// Evicts an unpinned, clean buffer. A dirty or pinned buffer is left
    /// alone — the cache never silently drops a write.
    pub fn evict_buffer(&mut self, chunk: ChunkId) -> bool {
        match self.entries.get(&chunk) {
            Some(entry) if entry.refcount == 0 && !entry.dirty => {
                self.entries.remove(&chunk);
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn device() -> (NamedTempFile, BlockDevice) {
        let tmp = NamedTempFile::new().unwrap();
        let dev = BlockDevice::create(tmp.path(), 4096 * 8).unwrap();
        (tmp, dev)
    }

    #[test]
    fn getblk_returns_zeroed_buffer_without_reading() {
        let (_tmp, dev) = device();
        dev.write_at(&[0xffu8; 4096], 0).unwrap();
        let mut cache = BlockCache::new(4096);
        let buf = cache.getblk(ChunkId(0));
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn dirty_buffers_are_flushed_in_order() {
        let mut cache = BlockCache::new(16);
        cache.getblk(ChunkId(2))[0] = 2;
        cache.set_buffer_dirty(ChunkId(2));
        cache.brelse(ChunkId(2));
        cache.getblk(ChunkId(1))[0] = 1;
        cache.set_buffer_dirty(ChunkId(1));
        cache.brelse(ChunkId(1));

        assert_eq!(cache.dirty_buffer_count(), 2);
        let flushed = cache.flush_buffers();
        assert_eq!(flushed[0].sector, 2 * 16);
        assert_eq!(flushed[1].sector, 1 * 16);
        assert_eq!(cache.dirty_buffer_count(), 0);
    }

    #[test]
    fn pinned_buffer_is_not_evicted() {
        let mut cache = BlockCache::new(16);
        cache.getblk(ChunkId(0));
        assert!(!cache.evict_buffer(ChunkId(0)));
        cache.brelse(ChunkId(0));
        assert!(cache.evict_buffer(ChunkId(0)));
    }

    #[test]
    fn bread_caches_after_first_read() {
        let (_tmp, dev) = device();
        dev.write_at(&[7u8; 16], 32).unwrap();
        let mut cache = BlockCache::new(16);
        {
            let buf = cache.bread(&dev, ChunkId(2)).unwrap();
            assert_eq!(buf, &[7u8; 16]);
        }
        cache.brelse(ChunkId(2));
        // second read must not error even if the device changed underneath
        dev.write_at(&[9u8; 16], 32).unwrap();
        let buf = cache.bread(&dev, ChunkId(2)).unwrap();
        assert_eq!(buf, &[7u8; 16]);
    }
}
