//! Bitmap chunk allocator for metadata and snapshot-data spaces.

use chunksnap_fs_utils::BlockDevice;
use chunksnap_primitives::{ChunkId, Space};
use chunksnap_metrics::METRICS;

use crate::cache::BlockCache;
use crate::error::{Error, Result};
use crate::superblock::AllocDescriptor;

fn bits_per_chunk(chunk_size: usize) -> u64 {
    (chunk_size * 8) as u64
}

fn bit_location(chunk_size: usize, chunk: u64) -> (u64, usize, u8) {
    let bpc = bits_per_chunk(chunk_size);
    let block = chunk / bpc;
    let bit_in_block = chunk % bpc;
    (block, (bit_in_block / 8) as usize, (bit_in_block % 8) as u8)
}

fn bit_is_set(buf: &[u8], byte: usize, bit: u8) -> bool {
    buf[byte] & (1 << bit) != 0
}

fn bit_set(buf: &mut [u8], byte: usize, bit: u8) {
    buf[byte] |= 1 << bit;
}

fn bit_clear(buf: &mut [u8], byte: usize, bit: u8) {
    buf[byte] &= !(1 << bit);
}

/// Scans `range` chunks starting at `start`, finds the first unallocated
/// one, marks it allocated, and returns it.
///
/// Wraps to bitmap block 0 once the scan runs past `desc.total_chunks`.
pub fn alloc_chunk_range(
    cache: &mut BlockCache,
    device: &BlockDevice,
    space: Space,
    desc: &mut AllocDescriptor,
    start: ChunkId,
    range: u64,
) -> Result<Option<ChunkId>> {
    let chunk_size = desc.chunk_size();
    let mut checked = 0u64;
    let mut chunk = start.0;
    while checked < range && chunk < desc.total_chunks {
        let (block, byte, bit) = bit_location(chunk_size, chunk);
        let bitmap_chunk = ChunkId(desc.bitmap_base.0 + block);
        let buf = cache.bread(device, bitmap_chunk)?;
        let free = !bit_is_set(buf, byte, bit);
        cache.brelse(bitmap_chunk);
        if free {
            let buf = cache.getblk(bitmap_chunk);
            bit_set(buf, byte, bit);
            cache.brelse_dirty(bitmap_chunk);
            desc.free_chunks -= 1;
            desc.last_alloc = ChunkId(chunk);
            update_metric(space, desc.free_chunks);
            return Ok(Some(ChunkId(chunk)));
        }
        chunk += 1;
        checked += 1;
    }
    Ok(None)
}

/// Allocates one chunk from `space`, scanning from `last_alloc` to the end
/// and then wrapping to the beginning.
pub fn alloc_chunk(
    cache: &mut BlockCache,
    device: &BlockDevice,
    space: Space,
    desc: &mut AllocDescriptor,
) -> Result<ChunkId> {
    let start = desc.last_alloc;
    let tail = desc.total_chunks - start.0;
    if let Some(c) = alloc_chunk_range(cache, device, space, desc, start, tail)? {
        return Ok(c);
    }
    if let Some(c) = alloc_chunk_range(cache, device, space, desc, ChunkId::ZERO, start.0)? {
        return Ok(c);
    }
    Err(Error::OutOfSpace { space })
}

/// Clears `chunk`'s bit. Logs and continues if it was already clear — a
/// double free here is a bug upstream of the allocator, not a reason to
/// crash the daemon.
pub fn free_chunk(
    cache: &mut BlockCache,
    device: &BlockDevice,
    space: Space,
    desc: &mut AllocDescriptor,
    chunk: ChunkId,
) -> Result<()> {
    let (block, byte, bit) = bit_location(desc.chunk_size(), chunk.0);
    let bitmap_chunk = ChunkId(desc.bitmap_base.0 + block);
    let buf = cache.bread(device, bitmap_chunk)?;
    let was_set = bit_is_set(buf, byte, bit);
    cache.brelse(bitmap_chunk);
    if !was_set {
        tracing::warn!(?chunk, ?space, "free_chunk: bit already clear");
        return Ok(());
    }
    let buf = cache.getblk(bitmap_chunk);
    bit_clear(buf, byte, bit);
    cache.brelse_dirty(bitmap_chunk);
    desc.free_chunks += 1;
    update_metric(space, desc.free_chunks);
    Ok(())
}

fn update_metric(space: Space, free: u64) {
    METRICS
        .free_chunks
        .with_label_values(&[match space {
            Space::Metadata => "metadata",
            Space::SnapshotData => "snapshot-data",
        }])
        .set(free as i64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn setup() -> (NamedTempFile, BlockDevice, BlockCache, AllocDescriptor) {
        let tmp = NamedTempFile::new().unwrap();
        let chunk_size = 64usize;
        let dev = BlockDevice::create(tmp.path(), chunk_size as u64 * 16).unwrap();
        let desc = AllocDescriptor {
            chunk_size_bits: 6, // 64
            total_chunks: 32,
            free_chunks: 32,
            bitmap_base: ChunkId(0),
            bitmap_blocks: 1,
            last_alloc: ChunkId::ZERO,
        };
        (tmp, dev, BlockCache::new(chunk_size), desc)
    }

    #[test]
    fn allocates_sequential_chunks_and_frees() {
        let (_tmp, dev, mut cache, mut desc) = setup();
        let a = alloc_chunk(&mut cache, &dev, Space::Metadata, &mut desc).unwrap();
        let b = alloc_chunk(&mut cache, &dev, Space::Metadata, &mut desc).unwrap();
        assert_ne!(a, b);
        assert_eq!(desc.free_chunks, 30);

        free_chunk(&mut cache, &dev, Space::Metadata, &mut desc, a).unwrap();
        assert_eq!(desc.free_chunks, 31);
        let c = alloc_chunk(&mut cache, &dev, Space::Metadata, &mut desc).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn exhaustion_reports_out_of_space() {
        let (_tmp, dev, mut cache, mut desc) = setup();
        for _ in 0..32 {
            alloc_chunk(&mut cache, &dev, Space::SnapshotData, &mut desc).unwrap();
        }
        let err = alloc_chunk(&mut cache, &dev, Space::SnapshotData, &mut desc).unwrap_err();
        assert!(matches!(err, Error::OutOfSpace { .. }));
    }
}
