//! Snapshot lifecycle and pressure-driven eviction.

use chunksnap_metrics::METRICS;
use chunksnap_primitives::{ChunkId, Space, MAX_SNAPSHOTS};

use crate::alloc::free_chunk;
use crate::btree::delete_tree_range;
use crate::cache::BlockCache;
use crate::error::{Error, Result};
use crate::superblock::{Superblock, SnapshotRecord};
use chunksnap_fs_utils::BlockDevice;

/// Creates a snapshot with `tag`, assigning it the lowest bitmap position
/// not already in `snapmask`. Fails if `tag` already names a live
/// snapshot, or if all [`MAX_SNAPSHOTS`] positions are taken.
pub fn create_snapshot(sb: &mut Superblock, tag: u32, now: u32) -> Result<SnapshotRecord> {
    if sb.snapshot_by_tag(tag).is_some() {
        return Err(Error::SnapshotExists(tag));
    }
    let bit = sb.lowest_free_bit().ok_or(Error::TooManySnapshots(MAX_SNAPSHOTS))?;
    let record = SnapshotRecord {
        tag,
        bit,
        priority: 0,
        ctime: now,
        usecount: 0,
    };
    sb.snapshots.push(record);
    sb.snapmask |= 1 << bit;
    tracing::info!(tag, bit, "created snapshot");
    Ok(record)
}

/// Removes `tag`'s snapshot record and releases its bit's exceptions
/// across the whole tree.
pub fn delete_snapshot(
    cache: &mut BlockCache,
    device: &BlockDevice,
    sb: &mut Superblock,
    chunk_size: usize,
    tag: u32,
) -> Result<()> {
    let record = *sb.snapshot_by_tag(tag).ok_or(Error::UnknownSnapshot(tag))?;
    sb.snapshots.retain(|s| s.tag != tag);
    sb.snapmask &= !(1u64 << record.bit);

    delete_tree_range(cache, device, sb, chunk_size, 1u64 << record.bit, |cache, device, sb, chunk| {
        free_chunk(cache, device, Space::SnapshotData, &mut sb.snapshot_data, chunk)?;
        sb.snapshot_used = sb.snapshot_used.saturating_sub(1);
        Ok(())
    })?;
    tracing::info!(tag, bit = record.bit, "deleted snapshot");
    Ok(())
}

/// Picks the live snapshot with `usecount == 0` and the lowest priority,
/// deletes it, and returns its tag. Invoked when `alloc_chunk` on the
/// snapshot-data space fails, to reclaim space under pressure.
pub fn evict_one(cache: &mut BlockCache, device: &BlockDevice, sb: &mut Superblock, chunk_size: usize) -> Result<u32> {
    let victim = sb
        .snapshots
        .iter()
        .filter(|s| s.usecount == 0)
        .min_by_key(|s| s.priority)
        .map(|s| s.tag)
        .ok_or(Error::OutOfSpace {
            space: Space::SnapshotData,
        })?;
    delete_snapshot(cache, device, sb, chunk_size, victim)?;
    METRICS.pressure_evictions.inc();
    tracing::warn!(tag = victim, "evicted snapshot under allocation pressure");
    Ok(victim)
}

pub fn set_priority(sb: &mut Superblock, tag: u32, priority: i8) -> Result<()> {
    sb.snapshot_by_tag_mut(tag).ok_or(Error::UnknownSnapshot(tag))?.priority = priority;
    Ok(())
}

pub fn adjust_usecount(sb: &mut Superblock, tag: u32, delta: i32) -> Result<u32> {
    let record = sb.snapshot_by_tag_mut(tag).ok_or(Error::UnknownSnapshot(tag))?;
    let updated = record.usecount as i64 + delta as i64;
    if updated < 0 || updated > u32::MAX as i64 {
        return Err(Error::UnknownSnapshot(tag));
    }
    record.usecount = updated as u32;
    Ok(record.usecount)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leaf::Leaf;
    use crate::superblock::AllocDescriptor;
    use tempfile::NamedTempFile;

    fn descriptor(chunk_size_bits: u8) -> AllocDescriptor {
        AllocDescriptor {
            chunk_size_bits,
            total_chunks: 64,
            free_chunks: 60,
            bitmap_base: ChunkId(1),
            bitmap_blocks: 1,
            last_alloc: ChunkId(10),
        }
    }

    fn fixture() -> (NamedTempFile, BlockDevice, BlockCache, Superblock) {
        let tmp = NamedTempFile::new().unwrap();
        let chunk_size = 256usize;
        let dev = BlockDevice::create(tmp.path(), chunk_size as u64 * 64).unwrap();
        let mut cache = BlockCache::new(chunk_size);
        let root = ChunkId(10);
        let bytes = Leaf::empty(ChunkId(0)).to_bytes(chunk_size, root).unwrap();
        cache.getblk(root).copy_from_slice(&bytes);
        cache.brelse_dirty(root);
        let sb = Superblock::format(descriptor(8), descriptor(8), root, ChunkId(2), 8, 0, 4096, 0);
        (tmp, dev, cache, sb)
    }

    #[test]
    fn create_assigns_lowest_free_bit() {
        let (_tmp, _dev, _cache, mut sb) = fixture();
        let a = create_snapshot(&mut sb, 1, 100).unwrap();
        let b = create_snapshot(&mut sb, 2, 101).unwrap();
        assert_eq!(a.bit, 0);
        assert_eq!(b.bit, 1);
        assert_eq!(sb.snapmask, 0b11);
    }

    #[test]
    fn duplicate_tag_is_rejected() {
        let (_tmp, _dev, _cache, mut sb) = fixture();
        create_snapshot(&mut sb, 1, 100).unwrap();
        assert!(matches!(create_snapshot(&mut sb, 1, 100), Err(Error::SnapshotExists(1))));
    }

    #[test]
    fn delete_clears_bit_and_removes_record() {
        let (_tmp, dev, mut cache, mut sb) = fixture();
        create_snapshot(&mut sb, 1, 100).unwrap();
        delete_snapshot(&mut cache, &dev, &mut sb, 256, 1).unwrap();
        assert!(sb.snapshot_by_tag(1).is_none());
        assert_eq!(sb.snapmask, 0);
    }

    #[test]
    fn eviction_prefers_lowest_priority_among_unused() {
        let (_tmp, dev, mut cache, mut sb) = fixture();
        create_snapshot(&mut sb, 1, 100).unwrap();
        create_snapshot(&mut sb, 2, 100).unwrap();
        set_priority(&mut sb, 1, 5).unwrap();
        set_priority(&mut sb, 2, 0).unwrap();
        let evicted = evict_one(&mut cache, &dev, &mut sb, 256).unwrap();
        assert_eq!(evicted, 2);
        assert!(sb.snapshot_by_tag(1).is_some());
    }

    #[test]
    fn eviction_skips_snapshots_still_in_use() {
        let (_tmp, dev, mut cache, mut sb) = fixture();
        create_snapshot(&mut sb, 1, 100).unwrap();
        adjust_usecount(&mut sb, 1, 1).unwrap();
        let err = evict_one(&mut cache, &dev, &mut sb, 256).unwrap_err();
        assert!(matches!(err, Error::OutOfSpace { .. }));
    }
}
