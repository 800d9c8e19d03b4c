//! `--format`: lays out a fresh superblock, allocator bitmaps, journal
//! ring and empty root leaf on the configured devices, then exits.
//!
//! Metadata and snapshot-data spaces are formatted independently, each
//! with its own bitmap starting right after the chunk(s) covering the
//! fixed superblock byte offset (`SB_SECTOR << 9`) on its own device —
//! reserved on both spaces for uniformity, though only the metadata
//! device's copy actually backs a superblock. When `--snapshot-device`
//! is left pointing at the same device as `--metadata-device`, the two
//! spaces' chunk numbering still starts from the same origin, so the
//! operator is responsible for keeping the two logically separate
//! (typically by giving them distinct devices); this tool does not carve
//! disjoint byte ranges out of one shared device.

use std::time::{SystemTime, UNIX_EPOCH};

use chunksnap_fs_utils::BlockDevice;
use chunksnap_primitives::{ChunkId, Space};
use chunksnap_storage::leaf::Leaf;
use chunksnap_storage::superblock::AllocDescriptor;
use chunksnap_storage::{alloc, BlockCache, Superblock, SB_SECTOR};

use crate::config::Settings;

fn bitmap_blocks_for(total_chunks: u64, chunk_size: usize) -> u64 {
    let bits_per_chunk = (chunk_size * 8) as u64;
    (total_chunks + bits_per_chunk - 1) / bits_per_chunk
}

fn now_unix() -> u32 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as u32).unwrap_or(0)
}

/// Number of leading chunks that cover byte range `[0, SB_SECTOR << 9 +
/// chunk_size)` — i.e. chunk 0 through whichever chunk the superblock's
/// fixed byte offset falls in, inclusive.
fn reserved_head_chunks(chunk_size: usize) -> u64 {
    (SB_SECTOR << 9) / chunk_size as u64 + 1
}

/// Builds one space's bitmap, reserving the leading chunks that cover the
/// superblock's byte offset, the bitmap itself, and `extra_reserved` more
/// chunks right after it for the caller's own use. Returns the descriptor
/// and the first chunk past every reservation.
fn build_space(device: &BlockDevice, chunk_size: usize, space: Space, extra_reserved: u64) -> anyhow::Result<(AllocDescriptor, u64)> {
    let total_chunks = device.len()? / chunk_size as u64;
    let head = reserved_head_chunks(chunk_size);
    let bitmap_blocks = bitmap_blocks_for(total_chunks, chunk_size);
    let mut desc = AllocDescriptor {
        chunk_size_bits: chunk_size.trailing_zeros() as u8,
        total_chunks,
        free_chunks: total_chunks,
        bitmap_base: ChunkId(head),
        bitmap_blocks,
        last_alloc: ChunkId::ZERO,
    };

    let reserved = head + bitmap_blocks + extra_reserved;
    anyhow::ensure!(reserved < total_chunks, "{space} device is too small to hold its own bitmap and reserved chunks");

    let mut cache = BlockCache::new(chunk_size);
    for chunk in 0..reserved {
        alloc::alloc_chunk_range(&mut cache, device, space, &mut desc, ChunkId(chunk), 1)?;
    }
    for dirty in cache.flush_buffers() {
        device.write_at(&dirty.data, dirty.sector)?;
    }
    device.sync()?;
    Ok((desc, reserved))
}

/// Formats the metadata and snapshot-data devices named in `settings`.
pub fn run(settings: &Settings) -> anyhow::Result<()> {
    let chunk_size = settings.chunk_size;
    let metadata_device = BlockDevice::open(&settings.metadata_device.0)?;
    let snapshot_device = BlockDevice::open(&settings.snapshot_device.0)?;
    let origin_device = BlockDevice::open(&settings.origin_device.0)?;
    let origin_size_sectors = origin_device.len()? / 512;

    let (metadata_desc, after_reserved) = build_space(&metadata_device, chunk_size, Space::Metadata, settings.journal_size + 1)?;
    let journal_base = metadata_desc.bitmap_base.0 + metadata_desc.bitmap_blocks;
    let root_leaf = ChunkId(after_reserved - 1);

    let (snapshot_desc, _) = build_space(&snapshot_device, chunk_size, Space::SnapshotData, 0)?;

    tracing::info!(
        chunk_size,
        metadata_chunks = metadata_desc.total_chunks,
        snapshot_chunks = snapshot_desc.total_chunks,
        journal_size = settings.journal_size,
        root_leaf = root_leaf.0,
        "formatting store"
    );

    let zero = vec![0u8; chunk_size];
    for i in 0..settings.journal_size {
        metadata_device.write_at(&zero, (journal_base + i) * chunk_size as u64)?;
    }

    let mut cache = BlockCache::new(chunk_size);
    let leaf_bytes = Leaf::empty(ChunkId(0)).to_bytes(chunk_size, root_leaf)?;
    cache.getblk(root_leaf).copy_from_slice(&leaf_bytes);
    cache.brelse_dirty(root_leaf);
    for dirty in cache.flush_buffers() {
        metadata_device.write_at(&dirty.data, dirty.sector)?;
    }
    metadata_device.sync()?;

    let sb = Superblock::format(
        metadata_desc,
        snapshot_desc,
        root_leaf,
        ChunkId(journal_base),
        settings.journal_size,
        0,
        origin_size_sectors,
        now_unix(),
    );
    let sb_bytes = sb.to_bytes(chunk_size);
    metadata_device.write_at(&sb_bytes, SB_SECTOR << 9)?;
    metadata_device.sync()?;

    tracing::info!("format complete");
    Ok(())
}
