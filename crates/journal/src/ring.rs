use chunksnap_fs_utils::BlockDevice;

use crate::error::{Error, Recovery, Result};

/// 8-byte ASCII magic marking a chunk as a commit block.
const COMMIT_MAGIC: [u8; 8] = *b"MAGICNUM";

/// Fixed header preceding the target-sector array in a commit block:
/// magic(8) + checksum(4) + sequence(8) + entry_count(4).
const COMMIT_HEADER_LEN: usize = 8 + 4 + 8 + 4;

#[derive(Clone, Copy, Debug)]
pub struct Options {
    /// Size of one chunk (and one journal slot), in bytes.
    pub chunk_size: usize,
    /// Number of chunks in the journal ring.
    pub journal_size: u64,
}

/// One dirty metadata block awaiting commit: its final sector offset (in
/// bytes) on the metadata device, and its current contents.
#[derive(Clone)]
pub struct DirtyBuffer {
    pub sector: u64,
    pub data: Vec<u8>,
}

/// The write-ahead ring journal.
///
/// Owns no buffers of its own between calls: every [`Journal::commit`] is
/// handed the full dirty set and, on success, has both made it durable in
/// the ring and written it through to its real location, so a single
/// caller on a single thread never observes a state where the commit is
/// durable but the buffers are not yet at their final location.
#[derive(Debug)]
pub struct Journal {
    opts: Options,
    /// Byte offset of the first journal chunk on the metadata device.
    base: u64,
    /// Next free slot to write into, as a slot index (not a byte offset).
    next: u64,
    /// Next sequence number to assign to a committed transaction.
    sequence: i64,
}

enum Slot {
    Empty,
    Data(Vec<u8>),
    Commit { sequence: i64, targets: Vec<u64> },
    Scribbled,
}

impl Journal {
    /// Opens a freshly formatted journal: empty ring, sequence zero.
    pub fn format(opts: Options, base_chunk: u64) -> Self {
        Self {
            opts,
            base: base_chunk * opts.chunk_size as u64,
            next: 0,
            sequence: 0,
        }
    }

    pub fn sequence(&self) -> i64 {
        self.sequence
    }

    /// The ring slot the next commit will start writing into.
    pub fn next_slot(&self) -> u64 {
        self.next
    }

    fn slot_offset(&self, slot: u64) -> u64 {
        self.base + slot * self.opts.chunk_size as u64
    }

    fn read_slot(&self, device: &BlockDevice, slot: u64) -> Result<Slot> {
        let mut buf = vec![0u8; self.opts.chunk_size];
        device.read_at(&mut buf, self.slot_offset(slot))?;
        if buf.iter().all(|&b| b == 0) {
            return Ok(Slot::Empty);
        }
        if buf[..8] == COMMIT_MAGIC {
            if checksum_of(&buf) != 0 {
                return Ok(Slot::Scribbled);
            }
            let sequence = i64::from_le_bytes(buf[12..20].try_into().unwrap());
            let entry_count = u32::from_le_bytes(buf[20..24].try_into().unwrap()) as usize;
            let mut targets = Vec::with_capacity(entry_count);
            for i in 0..entry_count {
                let off = COMMIT_HEADER_LEN + i * 8;
                targets.push(u64::from_le_bytes(buf[off..off + 8].try_into().unwrap()));
            }
            return Ok(Slot::Commit { sequence, targets });
        }
        Ok(Slot::Data(buf))
    }

    fn write_commit_block(&self, device: &BlockDevice, slot: u64, sequence: i64, targets: &[u64]) -> Result<()> {
        let mut buf = vec![0u8; self.opts.chunk_size];
        buf[..8].copy_from_slice(&COMMIT_MAGIC);
        buf[12..20].copy_from_slice(&sequence.to_le_bytes());
        buf[20..24].copy_from_slice(&(targets.len() as u32).to_le_bytes());
        for (i, target) in targets.iter().enumerate() {
            let off = COMMIT_HEADER_LEN + i * 8;
            buf[off..off + 8].copy_from_slice(&target.to_le_bytes());
        }
        let checksum = 0u32.wrapping_sub(checksum_of(&buf));
        buf[8..12].copy_from_slice(&checksum.to_le_bytes());
        device.write_at(&buf, self.slot_offset(slot))?;
        Ok(())
    }

    /// Commits `dirty` as one transaction: stages each buffer's contents
    /// into the ring, writes a durable commit block, then writes every
    /// buffer through to its real location.
    ///
    /// Returns the sequence number assigned to this transaction.
    pub fn commit(&mut self, device: &BlockDevice, dirty: &[DirtyBuffer]) -> Result<i64> {
        if dirty.is_empty() {
            return Ok(self.sequence);
        }
        if dirty.len() as u64 + 1 > self.opts.journal_size {
            return Err(Error::Full {
                dirty: dirty.len(),
                capacity: self.opts.journal_size as usize,
            });
        }

        let mut slot = self.next;
        for buf in dirty {
            device.write_at(&buf.data, self.slot_offset(slot))?;
            slot = (slot + 1) % self.opts.journal_size;
        }
        let commit_slot = slot;
        let targets: Vec<u64> = dirty.iter().map(|b| b.sector).collect();
        let sequence = self.sequence;
        self.write_commit_block(device, commit_slot, sequence, &targets)?;
        device.sync()?;

        for buf in dirty {
            device.write_at(&buf.data, buf.sector)?;
        }
        device.sync()?;

        self.sequence += 1;
        self.next = (commit_slot + 1) % self.opts.journal_size;
        Ok(sequence)
    }

    /// Recovers the journal at startup, replaying the most recent
    /// transaction whose commit block is durable.
    ///
    /// Called only when the superblock's busy flag was found set, meaning
    /// a previous run crashed (or was killed) while active, so at least
    /// one commit (the one made during `--format`) must exist.
    pub fn recover(opts: Options, base_chunk: u64, device: &BlockDevice) -> Result<Self> {
        let base = base_chunk * opts.chunk_size as u64;
        let journal = Self {
            opts,
            base,
            next: 0,
            sequence: 0,
        };

        let size = opts.journal_size;
        let mut slots = Vec::with_capacity(size as usize);
        for s in 0..size {
            slots.push(journal.read_slot(device, s)?);
        }

        let mut commits: Vec<(u64, i64, &[u64])> = Vec::new();
        let mut scribbled_at: Option<u64> = None;
        for (i, slot) in slots.iter().enumerate() {
            match slot {
                Slot::Commit { sequence, targets } => commits.push((i as u64, *sequence, targets.as_slice())),
                Slot::Scribbled => {
                    if scribbled_at.replace(i as u64).is_some() {
                        return Err(Recovery::TooManyScribbled.into());
                    }
                }
                Slot::Empty | Slot::Data(_) => {}
            }
        }

        if commits.is_empty() {
            return Err(Recovery::NoCommitBlocks.into());
        }

        // The ring wraps at most once between the oldest surviving commit
        // and the newest: walking commits in physical slot order, the
        // sequence number should only ever increase, except at exactly one
        // point (the seam where writing wrapped past slot `size - 1` back
        // to slot `0`).
        let mut wraps = 0usize;
        for w in commits.windows(2) {
            if w[1].1 < w[0].1 {
                wraps += 1;
            }
        }
        if wraps > 1 {
            return Err(Recovery::MultipleSequenceWraps.into());
        }

        let (newest_slot, newest_sequence, newest_targets) = *commits
            .iter()
            .max_by_key(|(_, seq, _)| *seq)
            .expect("checked non-empty above");

        if let Some(bad) = scribbled_at {
            let expected = (newest_slot + 1) % size;
            if bad != expected {
                return Err(Recovery::BadBlockNotLast { slot: bad }.into());
            }
        }

        // Replay the data blocks immediately preceding the newest commit,
        // in the order they were written.
        let entry_count = newest_targets.len() as u64;
        for k in 0..entry_count {
            let data_slot = (newest_slot + size - entry_count + k) % size;
            let target = newest_targets[k as usize];
            match &slots[data_slot as usize] {
                Slot::Data(buf) => device.write_at(buf, target)?,
                Slot::Commit { sequence, .. } => {
                    return Err(Recovery::BadSequence {
                        slot: data_slot,
                        expected: newest_sequence,
                        found: *sequence,
                    }
                    .into())
                }
                Slot::Empty | Slot::Scribbled => {
                    return Err(Recovery::BadSequence {
                        slot: data_slot,
                        expected: newest_sequence,
                        found: -1,
                    }
                    .into())
                }
            }
        }
        device.sync()?;

        Ok(Self {
            opts,
            base,
            next: (newest_slot + 1) % size,
            sequence: newest_sequence + 1,
        })
    }
}

/// Sums every 32-bit little-endian word in `buf`, wrapping on overflow.
///
/// A valid commit block satisfies `checksum_of(buf) == 0`: the stored
/// checksum field is chosen as the two's-complement of the sum of every
/// other word, so summing the whole block (including the checksum itself)
/// cancels to zero.
fn checksum_of(buf: &[u8]) -> u32 {
    let mut sum: u32 = 0;
    for word in buf.chunks_exact(4) {
        sum = sum.wrapping_add(u32::from_le_bytes(word.try_into().unwrap()));
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    const CHUNK: usize = 512;
    const RING: u64 = 8;

    fn opts() -> Options {
        Options {
            chunk_size: CHUNK,
            journal_size: RING,
        }
    }

    fn new_device() -> (NamedTempFile, BlockDevice) {
        let tmp = NamedTempFile::new().unwrap();
        // journal ring + a handful of "real" chunks beyond it
        let dev = BlockDevice::create(tmp.path(), (RING + 16) * CHUNK as u64).unwrap();
        (tmp, dev)
    }

    #[test]
    fn commit_writes_through_to_real_location() {
        let (_tmp, dev) = new_device();
        let mut j = Journal::format(opts(), 0);
        let target = (RING + 2) * CHUNK as u64;
        let data = vec![0x42u8; CHUNK];
        j.commit(&dev, &[DirtyBuffer { sector: target, data: data.clone() }]).unwrap();

        let mut out = vec![0u8; CHUNK];
        dev.read_at(&mut out, target).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn empty_commit_is_a_no_op() {
        let (_tmp, dev) = new_device();
        let mut j = Journal::format(opts(), 0);
        let seq_before = j.sequence();
        assert_eq!(j.commit(&dev, &[]).unwrap(), seq_before);
        assert_eq!(j.sequence(), seq_before);
    }

    #[test]
    fn recovery_replays_the_latest_transaction() {
        let (_tmp, dev) = new_device();
        let mut j = Journal::format(opts(), 0);
        let target_a = (RING + 1) * CHUNK as u64;
        let target_b = (RING + 2) * CHUNK as u64;

        j.commit(&dev, &[DirtyBuffer { sector: target_a, data: vec![1u8; CHUNK] }]).unwrap();
        j.commit(&dev, &[DirtyBuffer { sector: target_b, data: vec![2u8; CHUNK] }]).unwrap();

        let recovered = Journal::recover(opts(), 0, &dev).unwrap();
        assert_eq!(recovered.sequence(), j.sequence());

        let mut out = vec![0u8; CHUNK];
        dev.read_at(&mut out, target_a).unwrap();
        assert_eq!(out, vec![1u8; CHUNK]);
        dev.read_at(&mut out, target_b).unwrap();
        assert_eq!(out, vec![2u8; CHUNK]);
    }

    #[test]
    fn recovery_is_idempotent() {
        let (_tmp, dev) = new_device();
        let mut j = Journal::format(opts(), 0);
        let target = (RING + 1) * CHUNK as u64;
        j.commit(&dev, &[DirtyBuffer { sector: target, data: vec![9u8; CHUNK] }]).unwrap();

        let r1 = Journal::recover(opts(), 0, &dev).unwrap();
        let r2 = Journal::recover(opts(), 0, &dev).unwrap();
        assert_eq!(r1.sequence(), r2.sequence());
        assert_eq!(r1.next, r2.next);
    }

    #[test]
    fn recovery_without_any_commit_is_fatal() {
        let (_tmp, dev) = new_device();
        let err = Journal::recover(opts(), 0, &dev).unwrap_err();
        assert!(matches!(err, Error::Recovery(Recovery::NoCommitBlocks)));
    }

    #[test]
    fn oversize_transaction_is_rejected() {
        let (_tmp, dev) = new_device();
        let mut j = Journal::format(opts(), 0);
        let dirty: Vec<DirtyBuffer> = (0..RING)
            .map(|i| DirtyBuffer {
                sector: (RING + i) * CHUNK as u64,
                data: vec![0u8; CHUNK],
            })
            .collect();
        let err = j.commit(&dev, &dirty).unwrap_err();
        assert!(matches!(err, Error::Full { .. }));
    }
}
