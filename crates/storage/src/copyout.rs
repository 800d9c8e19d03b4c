//! Coalesced block-to-block copyout from origin or snapshot-data to a
//! freshly allocated exception chunk.

use chunksnap_fs_utils::BlockDevice;
use chunksnap_metrics::METRICS;
use chunksnap_primitives::ChunkId;

use crate::buf::AlignedBuf;
use crate::error::Result;

/// High bit of a source chunk number selects which device a copyout reads
/// from: set means the source is itself an exception on the
/// snapshot-data device (a snapshot write copying out its own prior
/// exception), clear means the origin device.
pub const SNAPSHOT_SOURCE_BIT: u64 = 1 << 63;

/// Maximum chunks a single coalesced range may span before it must flush.
pub const COPY_BUFFER_CHUNKS: u64 = 32;

struct PendingRange {
    source_chunk: u64,
    dest_exception: ChunkId,
    count: u64,
}

/// Accumulates contiguous `(source, dest)` pairs into one positioned
/// read + write instead of one syscall pair per chunk.
pub struct CopyoutEngine {
    chunk_size: usize,
    pending: Option<PendingRange>,
}

impl CopyoutEngine {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size,
            pending: None,
        }
    }

    /// Records one chunk to be copied from `source_chunk` (origin unless
    /// [`SNAPSHOT_SOURCE_BIT`] is set) to `dest_exception` on the
    /// snapshot-data device. Coalesces with the in-flight range if it
    /// extends it contiguously and stays within [`COPY_BUFFER_CHUNKS`];
    /// otherwise flushes the current range first.
    pub fn copyout(
        &mut self,
        origin: &BlockDevice,
        snapshot_data: &BlockDevice,
        source_chunk: u64,
        dest_exception: ChunkId,
    ) -> Result<()> {
        if let Some(pending) = &mut self.pending {
            let extends = pending.source_chunk + pending.count == source_chunk
                && pending.dest_exception.0 + pending.count == dest_exception.0
                && pending.count < COPY_BUFFER_CHUNKS;
            if extends {
                pending.count += 1;
                return Ok(());
            }
            self.flush(origin, snapshot_data)?;
        }
        self.pending = Some(PendingRange {
            source_chunk,
            dest_exception,
            count: 1,
        });
        Ok(())
    }

    /// Flushes the in-flight range, if any, performing the actual reads
    /// and write. Must be called before the transaction that will
    /// reference `dest_exception` commits, so the exception data is on
    /// disk before any metadata pointing at it becomes durable.
    pub fn flush(&mut self, origin: &BlockDevice, snapshot_data: &BlockDevice) -> Result<()> {
        let Some(pending) = self.pending.take() else {
            return Ok(());
        };
        let from_snapshot_data = pending.source_chunk & SNAPSHOT_SOURCE_BIT != 0;
        let base = pending.source_chunk & !SNAPSHOT_SOURCE_BIT;
        let len = pending.count as usize * self.chunk_size;
        let mut buf = AlignedBuf::new(len, self.chunk_size);

        let source = if from_snapshot_data { snapshot_data } else { origin };
        source.read_at(buf.as_bytes_mut(), base * self.chunk_size as u64)?;
        snapshot_data.write_at(buf.as_bytes(), pending.dest_exception.0 * self.chunk_size as u64)?;

        METRICS.chunks_copied.inc_by(pending.count);
        tracing::debug!(base, count = pending.count, dest = pending.dest_exception.0, "copied out");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    const CHUNK_SIZE: usize = 64;

    fn device(fill: u8) -> (NamedTempFile, BlockDevice) {
        let tmp = NamedTempFile::new().unwrap();
        let dev = BlockDevice::create(tmp.path(), CHUNK_SIZE as u64 * 16).unwrap();
        dev.write_at(&vec![fill; CHUNK_SIZE * 16], 0).unwrap();
        (tmp, dev)
    }

    #[test]
    fn single_chunk_copyout_round_trips() {
        let (_o, origin) = device(0xAB);
        let (_s, snap) = device(0x00);
        let mut engine = CopyoutEngine::new(CHUNK_SIZE);
        engine.copyout(&origin, &snap, 3, ChunkId(5)).unwrap();
        engine.flush(&origin, &snap).unwrap();

        let mut out = vec![0u8; CHUNK_SIZE];
        snap.read_at(&mut out, 5 * CHUNK_SIZE as u64).unwrap();
        assert_eq!(out, vec![0xABu8; CHUNK_SIZE]);
    }

    #[test]
    fn contiguous_ranges_coalesce_into_one_copy() {
        let (_o, origin) = device(0x11);
        let (_s, snap) = device(0x00);
        let mut engine = CopyoutEngine::new(CHUNK_SIZE);
        engine.copyout(&origin, &snap, 10, ChunkId(0)).unwrap();
        engine.copyout(&origin, &snap, 11, ChunkId(1)).unwrap();
        engine.copyout(&origin, &snap, 12, ChunkId(2)).unwrap();
        engine.flush(&origin, &snap).unwrap();

        for i in 0..3 {
            let mut out = vec![0u8; CHUNK_SIZE];
            snap.read_at(&mut out, i as u64 * CHUNK_SIZE as u64).unwrap();
            assert_eq!(out, vec![0x11u8; CHUNK_SIZE]);
        }
    }

    #[test]
    fn non_contiguous_range_forces_a_flush() {
        let (_o, origin) = device(0x22);
        let (_s, snap) = device(0x00);
        let mut engine = CopyoutEngine::new(CHUNK_SIZE);
        engine.copyout(&origin, &snap, 0, ChunkId(0)).unwrap();
        engine.copyout(&origin, &snap, 5, ChunkId(1)).unwrap(); // not contiguous, flushes first
        engine.flush(&origin, &snap).unwrap();

        let mut out = vec![0u8; CHUNK_SIZE];
        snap.read_at(&mut out, CHUNK_SIZE as u64).unwrap();
        assert_eq!(out, vec![0x22u8; CHUNK_SIZE]);
    }

    #[test]
    fn snapshot_source_bit_selects_snapshot_data_device() {
        let (_o, origin) = device(0x00);
        let (_s, snap) = device(0x33);
        let mut engine = CopyoutEngine::new(CHUNK_SIZE);
        engine.copyout(&origin, &snap, SNAPSHOT_SOURCE_BIT | 2, ChunkId(7)).unwrap();
        engine.flush(&origin, &snap).unwrap();

        let mut out = vec![0u8; CHUNK_SIZE];
        snap.read_at(&mut out, 7 * CHUNK_SIZE as u64).unwrap();
        assert_eq!(out, vec![0x33u8; CHUNK_SIZE]);
    }
}
