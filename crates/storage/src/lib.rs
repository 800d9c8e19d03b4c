//! On-disk snapshot-metadata engine: block cache, bitmap allocators,
//! exception B-tree, snapshot registry, and copyout engine.
//!
//! Each concern lives in its own module rather than one large file;
//! [`Engine`] wires them together over one metadata
//! [`chunksnap_fs_utils::BlockDevice`] plus the origin and snapshot-data
//! devices, gathered into a single context value at startup.

pub mod alloc;
pub mod btree;
pub mod buf;
pub mod cache;
pub mod copyout;
pub mod error;
pub mod leaf;
pub mod node;
pub mod registry;
pub mod superblock;

pub use cache::BlockCache;
pub use copyout::CopyoutEngine;
pub use error::{Error, Result};
pub use leaf::{Exception, Leaf, LeafEntry};
pub use node::{Node, NodeEntry};
pub use superblock::{AllocDescriptor, SnapshotRecord, Superblock, SB_SECTOR};

use chunksnap_fs_utils::BlockDevice;
use chunksnap_journal::Journal;
use chunksnap_primitives::{ChunkId, Space, View};

/// Everything one running store needs: the metadata device and its
/// journal and cache, the origin and snapshot-data devices, the copyout
/// engine, and the superblock itself.
///
/// Every mutation goes through `&mut Engine`, and nothing here is shared
/// across threads — the whole store is driven from one single-threaded
/// event loop.
pub struct Engine {
    pub sb: Superblock,
    pub metadata_device: BlockDevice,
    pub origin_device: BlockDevice,
    pub snapshot_device: BlockDevice,
    pub cache: BlockCache,
    pub journal: Journal,
    pub copyout: CopyoutEngine,
    chunk_size: usize,
}

impl Engine {
    pub fn new(
        sb: Superblock,
        metadata_device: BlockDevice,
        origin_device: BlockDevice,
        snapshot_device: BlockDevice,
        journal: Journal,
    ) -> Self {
        let chunk_size = sb.metadata.chunk_size();
        Self {
            cache: BlockCache::new(chunk_size),
            copyout: CopyoutEngine::new(sb.snapshot_data.chunk_size()),
            sb,
            metadata_device,
            origin_device,
            snapshot_device,
            journal,
            chunk_size,
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Ensures `origin_chunk` is unique for `view`, allocating and copying
    /// out a new exception on the snapshot-data device if needed.
    pub fn make_unique(&mut self, origin_chunk: u64, view: View) -> Result<Option<ChunkId>> {
        let Engine {
            sb,
            cache,
            metadata_device,
            origin_device,
            snapshot_device,
            copyout,
            chunk_size,
            ..
        } = self;
        btree::make_unique(
            cache,
            metadata_device,
            sb,
            *chunk_size,
            origin_chunk,
            view,
            |cache, device, sb, prev_exception| {
                // A snapshot write unsharing from an existing exception must
                // copy out that exception's own chunk, not the origin chunk
                // number reinterpreted as a snapshot-data address; only a
                // never-diverged chunk (no prior exception) still reads from
                // the origin device.
                let source_chunk = match (view, prev_exception) {
                    (View::Snapshot(_), Some(prev)) => prev.0 | copyout::SNAPSHOT_SOURCE_BIT,
                    _ => origin_chunk,
                };
                let dest = match alloc::alloc_chunk(cache, device, Space::SnapshotData, &mut sb.snapshot_data) {
                    Ok(dest) => dest,
                    Err(Error::OutOfSpace { space: Space::SnapshotData }) => {
                        registry::evict_one(cache, device, sb, *chunk_size)?;
                        alloc::alloc_chunk(cache, device, Space::SnapshotData, &mut sb.snapshot_data)?
                    }
                    Err(e) => return Err(e),
                };
                sb.snapshot_used += 1;
                copyout.copyout(origin_device, snapshot_device, source_chunk, dest)?;
                copyout.flush(origin_device, snapshot_device)?;
                chunksnap_metrics::METRICS
                    .exceptions_created
                    .with_label_values(&[if view.is_origin() { "origin" } else { "snapshot" }])
                    .inc();
                Ok(dest)
            },
            |cache, device, sb| alloc::alloc_chunk(cache, device, Space::Metadata, &mut sb.metadata).map(|c| {
                sb.metadata_used += 1;
                c
            }),
        )
    }

    pub fn test_unique(&mut self, origin_chunk: u64, view: View) -> Result<(bool, Option<ChunkId>)> {
        btree::test_unique(&mut self.cache, &self.metadata_device, &self.sb, origin_chunk, view)
    }

    /// Commits the current dirty set as one journal transaction, then
    /// flushes the superblock (busy flag still set: a clean shutdown
    /// clears it separately).
    pub fn commit(&mut self) -> Result<i64> {
        let dirty = self.cache.flush_buffers();
        let seq = self.journal.commit(&self.metadata_device, &dirty)?;
        self.sb.journal_next = self.journal.next_slot();
        self.sb.sequence = self.journal.sequence();
        self.write_superblock()?;
        chunksnap_metrics::METRICS.journal_commits.inc();
        chunksnap_metrics::METRICS.dirty_buffer_count.set(0);
        Ok(seq)
    }

    pub fn write_superblock(&self) -> Result<()> {
        let bytes = self.sb.to_bytes(self.chunk_size);
        self.metadata_device.write_at(&bytes, SB_SECTOR << 9)?;
        self.metadata_device.sync()?;
        Ok(())
    }

    /// Back-pressure rule: commit before the dirty set would overrun the
    /// journal ring.
    pub fn should_commit(&self) -> bool {
        self.cache.dirty_buffer_count() + 1 >= self.sb.journal_size as usize
    }
}
