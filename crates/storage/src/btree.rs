//! Persistent exception B-tree keyed by origin chunk.
//!
//! Leaves and internal nodes are decoded into the owned [`Leaf`]/[`Node`]
//! structs in [`crate::leaf`]/[`crate::node`], mutated there, and
//! re-encoded on write-back, rather than patched in place by shifting
//! bytes around a live buffer — the on-disk byte layout stays packed and
//! directory-indexed, only the mutation path goes through safe Rust
//! structs instead of manual pointer arithmetic.
//!
//! For simplicity every leaf's `base_chunk` is zero and `rchunk` holds the
//! origin chunk number directly (truncated to 32 bits, which covers an
//! origin of up to 2^32 chunks — 16 TiB at a 4 KiB chunk size). The
//! per-leaf base-chunk compression the on-disk layout reserves space for
//! is therefore unused; leaves keep the field so the byte layout stays
//! fixed-size and self-describing.

use chunksnap_fs_utils::BlockDevice;
use chunksnap_primitives::{ChunkId, SnapshotBit, View};

use crate::cache::BlockCache;
use crate::error::Result;
use crate::leaf::{Exception, Leaf, LeafEntry};
use crate::node::{Node, NodeEntry};
use crate::superblock::Superblock;

/// The path taken by [`probe`] from the root down to a leaf: each step is
/// `(node_chunk, descend_index)`; empty when the root is itself a leaf.
pub struct ProbePath {
    pub nodes: Vec<(ChunkId, usize)>,
    pub leaf_chunk: ChunkId,
}

pub fn probe(cache: &mut BlockCache, device: &BlockDevice, sb: &Superblock, origin_chunk: u64) -> Result<ProbePath> {
    let mut nodes = Vec::with_capacity(sb.etree_levels as usize);
    let mut current = sb.etree_root;
    for _ in 0..sb.etree_levels {
        let buf = cache.bread(device, current)?;
        let node = Node::from_bytes(buf, current)?;
        cache.brelse(current);
        let idx = node.descend_index(origin_chunk);
        let child = node.entries[idx].child;
        nodes.push((current, idx));
        current = child;
    }
    Ok(ProbePath {
        nodes,
        leaf_chunk: current,
    })
}

fn load_leaf(cache: &mut BlockCache, device: &BlockDevice, chunk: ChunkId) -> Result<Leaf> {
    let buf = cache.bread(device, chunk)?;
    let leaf = Leaf::from_bytes(buf, chunk)?;
    cache.brelse(chunk);
    Ok(leaf)
}

fn write_leaf(cache: &mut BlockCache, chunk: ChunkId, leaf: &Leaf, chunk_size: usize) -> Result<()> {
    let bytes = leaf.to_bytes(chunk_size, chunk)?;
    cache.getblk(chunk).copy_from_slice(&bytes);
    cache.brelse_dirty(chunk);
    Ok(())
}

fn write_node(cache: &mut BlockCache, chunk: ChunkId, node: &Node, chunk_size: usize) -> Result<()> {
    let bytes = node.to_bytes(chunk_size, chunk)?;
    cache.getblk(chunk).copy_from_slice(&bytes);
    cache.brelse_dirty(chunk);
    Ok(())
}

/// Tests whether `origin_chunk` is already unique (unshared with any
/// other view) for `view`, without mutating anything.
pub fn test_unique(
    cache: &mut BlockCache,
    device: &BlockDevice,
    sb: &Superblock,
    origin_chunk: u64,
    view: View,
) -> Result<(bool, Option<ChunkId>)> {
    let path = probe(cache, device, sb, origin_chunk)?;
    let leaf = load_leaf(cache, device, path.leaf_chunk)?;
    let rchunk = (origin_chunk - leaf.base_chunk.0) as u32;

    match (leaf.find(rchunk), view) {
        (Ok(i), View::Origin) => {
            let union = leaf.entries[i].exceptions.iter().fold(0u64, |acc, e| acc | e.share);
            Ok(((union & sb.snapmask) == sb.snapmask, None))
        }
        (Err(_), View::Origin) => Ok((sb.snapmask == 0, None)),
        (Ok(i), View::Snapshot(bit)) => {
            let mask = bit.mask();
            match leaf.entries[i].exceptions.iter().find(|e| e.share & mask != 0) {
                Some(ex) => Ok((ex.share == mask, Some(ex.chunk))),
                None => Ok((true, None)),
            }
        }
        (Err(_), View::Snapshot(_)) => Ok((false, None)),
    }
}

/// Records a new exception chunk for `rchunk` in an in-memory leaf.
/// Always inserts — including the degenerate case where the resulting
/// share mask would be empty — rather than special-casing it away; in
/// this single-threaded engine `test_unique` and this function observe
/// the same leaf snapshot, so that case cannot actually arise, but no
/// extra check is added to suppress it if it somehow did.
fn add_exception_to_leaf(leaf: &mut Leaf, rchunk: u32, new_chunk: ChunkId, view: View, active_mask: u64) {
    match leaf.find(rchunk) {
        Err(i) => {
            let sharemap = match view {
                View::Origin => active_mask,
                View::Snapshot(bit) => bit.mask(),
            };
            leaf.entries.insert(
                i,
                LeafEntry {
                    rchunk,
                    exceptions: vec![Exception {
                        share: sharemap,
                        chunk: new_chunk,
                    }],
                },
            );
        }
        Ok(i) => {
            let sharemap = match view {
                View::Origin => {
                    let union = leaf.entries[i].exceptions.iter().fold(0u64, |acc, e| acc | e.share);
                    !union & active_mask
                }
                View::Snapshot(bit) => {
                    let mask = bit.mask();
                    if let Some(existing) = leaf.entries[i].exceptions.iter_mut().find(|e| e.share & mask != 0) {
                        existing.share &= !mask;
                    }
                    mask
                }
            };
            leaf.entries[i].exceptions.insert(
                0,
                Exception {
                    share: sharemap,
                    chunk: new_chunk,
                },
            );
        }
    }
}

/// Inserts `new_chunk` as the exception for `origin_chunk`/`view`,
/// splitting the leaf (and propagating splits up through any ancestor
/// index nodes, possibly growing the tree by one level) if it no longer
/// fits afterward.
pub fn insert_exception(
    cache: &mut BlockCache,
    device: &BlockDevice,
    sb: &mut Superblock,
    chunk_size: usize,
    origin_chunk: u64,
    view: View,
    new_chunk: ChunkId,
    mut alloc_metadata: impl FnMut(&mut BlockCache, &BlockDevice, &mut Superblock) -> Result<ChunkId>,
) -> Result<()> {
    let path = probe(cache, device, sb, origin_chunk)?;
    let mut leaf = load_leaf(cache, device, path.leaf_chunk)?;
    let rchunk = (origin_chunk - leaf.base_chunk.0) as u32;

    add_exception_to_leaf(&mut leaf, rchunk, new_chunk, view, sb.snapmask);

    if leaf.fits(chunk_size) {
        write_leaf(cache, path.leaf_chunk, &leaf, chunk_size)?;
        return Ok(());
    }

    // Split: the right half becomes a fresh leaf; the split key is its
    // lowest rchunk.
    let mid = leaf.entries.len() / 2;
    let right_entries = leaf.entries.split_off(mid);
    let split_key = right_entries[0].rchunk as u64 + leaf.base_chunk.0;
    let right_leaf = Leaf {
        base_chunk: ChunkId(0),
        using_mask: 0,
        entries: right_entries,
    };
    let right_chunk = alloc_metadata(cache, device, sb)?;
    write_leaf(cache, right_chunk, &right_leaf, chunk_size)?;
    write_leaf(cache, path.leaf_chunk, &leaf, chunk_size)?;

    propagate_split(cache, device, sb, chunk_size, path.nodes, split_key, right_chunk, alloc_metadata)
}

fn propagate_split(
    cache: &mut BlockCache,
    device: &BlockDevice,
    sb: &mut Superblock,
    chunk_size: usize,
    mut ancestors: Vec<(ChunkId, usize)>,
    mut split_key: u64,
    mut right_child: ChunkId,
    mut alloc_metadata: impl FnMut(&mut BlockCache, &BlockDevice, &mut Superblock) -> Result<ChunkId>,
) -> Result<()> {
    loop {
        let Some((node_chunk, descend_idx)) = ancestors.pop() else {
            // Splitting the root: grow the tree by one level.
            let old_root = sb.etree_root;
            let new_root_chunk = alloc_metadata(cache, device, sb)?;
            let new_root = Node::new(vec![
                NodeEntry { key: 0, child: old_root },
                NodeEntry {
                    key: split_key,
                    child: right_child,
                },
            ]);
            write_node(cache, new_root_chunk, &new_root, chunk_size)?;
            sb.etree_root = new_root_chunk;
            sb.etree_levels += 1;
            return Ok(());
        };

        let buf = cache.bread(device, node_chunk)?;
        let mut node = Node::from_bytes(buf, node_chunk)?;
        cache.brelse(node_chunk);
        node.entries.insert(
            descend_idx + 1,
            NodeEntry {
                key: split_key,
                child: right_child,
            },
        );

        if !node.is_full(chunk_size) {
            write_node(cache, node_chunk, &node, chunk_size)?;
            return Ok(());
        }

        let mid = node.entries.len() / 2;
        let right_entries = node.entries.split_off(mid);
        split_key = right_entries[0].key;
        let new_right_chunk = alloc_metadata(cache, device, sb)?;
        let right_node = Node::new(right_entries);
        write_node(cache, new_right_chunk, &right_node, chunk_size)?;
        write_node(cache, node_chunk, &node, chunk_size)?;
        right_child = new_right_chunk;
    }
}

/// Ensures `origin_chunk` is unique for `view`, allocating and copying out
/// a new exception if it is not. `new_exception` performs the allocation
/// and copyout and is called at most once, given the chunk of whatever
/// exception currently serves this view (if any) as its copyout source.
/// Returns the exception chunk if one was created this call.
pub fn make_unique(
    cache: &mut BlockCache,
    device: &BlockDevice,
    sb: &mut Superblock,
    chunk_size: usize,
    origin_chunk: u64,
    view: View,
    mut new_exception: impl FnMut(&mut BlockCache, &BlockDevice, &mut Superblock, Option<ChunkId>) -> Result<ChunkId>,
    alloc_metadata: impl FnMut(&mut BlockCache, &BlockDevice, &mut Superblock) -> Result<ChunkId>,
) -> Result<Option<ChunkId>> {
    let (unique, prev_exception) = test_unique(cache, device, sb, origin_chunk, view)?;
    if unique {
        return Ok(None);
    }
    let newex = new_exception(cache, device, sb, prev_exception)?;
    insert_exception(cache, device, sb, chunk_size, origin_chunk, view, newex, alloc_metadata)?;
    Ok(Some(newex))
}

fn collect_leaves(cache: &mut BlockCache, device: &BlockDevice, sb: &Superblock) -> Result<Vec<ChunkId>> {
    let mut leaves = Vec::new();
    collect_leaves_rec(cache, device, sb.etree_root, sb.etree_levels, &mut leaves)?;
    Ok(leaves)
}

fn collect_leaves_rec(
    cache: &mut BlockCache,
    device: &BlockDevice,
    chunk: ChunkId,
    level: u32,
    out: &mut Vec<ChunkId>,
) -> Result<()> {
    if level == 0 {
        out.push(chunk);
        return Ok(());
    }
    let buf = cache.bread(device, chunk)?;
    let node = Node::from_bytes(buf, chunk)?;
    cache.brelse(chunk);
    for entry in &node.entries {
        collect_leaves_rec(cache, device, entry.child, level - 1, out)?;
    }
    Ok(())
}

/// Clears `clear_mask` from every exception's share across the whole
/// tree, freeing any exception whose share becomes zero. Used by snapshot
/// deletion, which always runs this from `resume_chunk = 0`.
///
/// Leaves whose directory empties out are left as empty leaves rather
/// than merged into a sibling — reclaiming those metadata chunks via
/// sibling merges would recover some space, but no insertion-time
/// invariant depends on it, so it is left undone here.
pub fn delete_tree_range(
    cache: &mut BlockCache,
    device: &BlockDevice,
    sb: &mut Superblock,
    chunk_size: usize,
    clear_mask: u64,
    mut free_exception: impl FnMut(&mut BlockCache, &BlockDevice, &mut Superblock, ChunkId) -> Result<()>,
) -> Result<()> {
    for leaf_chunk in collect_leaves(cache, device, sb)? {
        let mut leaf = load_leaf(cache, device, leaf_chunk)?;
        let mut changed = false;
        let mut i = 0;
        while i < leaf.entries.len() {
            let mut j = 0;
            while j < leaf.entries[i].exceptions.len() {
                if leaf.entries[i].exceptions[j].share & clear_mask != 0 {
                    leaf.entries[i].exceptions[j].share &= !clear_mask;
                    changed = true;
                    if leaf.entries[i].exceptions[j].share == 0 {
                        let freed = leaf.entries[i].exceptions.remove(j).chunk;
                        free_exception(cache, device, sb, freed)?;
                        continue;
                    }
                }
                j += 1;
            }
            if leaf.entries[i].exceptions.is_empty() {
                leaf.entries.remove(i);
                continue;
            }
            i += 1;
        }
        if changed {
            write_leaf(cache, leaf_chunk, &leaf, chunk_size)?;
        }
    }
    Ok(())
}

/// Full-tree leaf walk emitting origin chunks where `bit1` and `bit2`
/// disagree on whether they see the current version.
pub fn gen_changelist(
    cache: &mut BlockCache,
    device: &BlockDevice,
    sb: &Superblock,
    bit1: SnapshotBit,
    bit2: SnapshotBit,
) -> Result<Vec<u64>> {
    let (m1, m2) = (bit1.mask(), bit2.mask());
    let mut out = Vec::new();
    for leaf_chunk in collect_leaves(cache, device, sb)? {
        let leaf = load_leaf(cache, device, leaf_chunk)?;
        for entry in &leaf.entries {
            let differs = entry
                .exceptions
                .iter()
                .any(|ex| ((ex.share & m1) == m1) != ((ex.share & m2) == m2));
            if differs {
                out.push(leaf.base_chunk.0 + entry.rchunk as u64);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunksnap_primitives::SnapshotBit;
    use tempfile::NamedTempFile;

    const CHUNK_SIZE: usize = 256;

    fn new_fixture() -> (NamedTempFile, BlockDevice, BlockCache, Superblock) {
        let tmp = NamedTempFile::new().unwrap();
        let dev = BlockDevice::create(tmp.path(), CHUNK_SIZE as u64 * 64).unwrap();
        let mut cache = BlockCache::new(CHUNK_SIZE);
        let root = ChunkId(10);
        write_leaf(&mut cache, root, &Leaf::empty(ChunkId(0)), CHUNK_SIZE).unwrap();
        let desc = crate::superblock::AllocDescriptor {
            chunk_size_bits: 8,
            total_chunks: 64,
            free_chunks: 53,
            bitmap_base: ChunkId(1),
            bitmap_blocks: 1,
            last_alloc: ChunkId(10),
        };
        let sb = Superblock::format(desc, desc, root, ChunkId(2), 8, 0, 4096, 0);
        (tmp, dev, cache, sb)
    }

    fn next_chunk(next: &mut u64) -> impl FnMut(&mut BlockCache, &BlockDevice, &mut Superblock, Option<ChunkId>) -> Result<ChunkId> + '_ {
        move |_, _, _, _| {
            *next += 1;
            Ok(ChunkId(*next))
        }
    }

    #[test]
    fn origin_write_creates_exception_shared_by_all_snapshots() {
        let (_tmp, dev, mut cache, mut sb) = new_fixture();
        sb.snapmask = 0b11; // two live snapshots, bits 0 and 1

        let mut next = 100u64;
        let created = make_unique(
            &mut cache,
            &dev,
            &mut sb,
            CHUNK_SIZE,
            5,
            View::Origin,
            next_chunk(&mut next),
            |_, _, _| Ok(ChunkId(999)),
        )
        .unwrap();
        assert!(created.is_some());

        let (unique, _) = test_unique(&mut cache, &dev, &sb, 5, View::Origin).unwrap();
        assert!(unique);
        let (unique0, ex0) = test_unique(&mut cache, &dev, &sb, 5, View::Snapshot(SnapshotBit(0))).unwrap();
        assert!(unique0);
        assert_eq!(ex0, created);
    }

    #[test]
    fn snapshot_write_splits_share_from_existing_exception() {
        let (_tmp, dev, mut cache, mut sb) = new_fixture();
        sb.snapmask = 0b11;
        let mut next = 200u64;

        make_unique(
            &mut cache,
            &dev,
            &mut sb,
            CHUNK_SIZE,
            5,
            View::Origin,
            next_chunk(&mut next),
            |_, _, _| Ok(ChunkId(999)),
        )
        .unwrap();

        let created = make_unique(
            &mut cache,
            &dev,
            &mut sb,
            CHUNK_SIZE,
            5,
            View::Snapshot(SnapshotBit(0)),
            next_chunk(&mut next),
            |_, _, _| Ok(ChunkId(999)),
        )
        .unwrap();
        assert!(created.is_some());

        let (unique0, _) = test_unique(&mut cache, &dev, &sb, 5, View::Snapshot(SnapshotBit(0))).unwrap();
        assert!(unique0);
        let (unique1, _) = test_unique(&mut cache, &dev, &sb, 5, View::Snapshot(SnapshotBit(1))).unwrap();
        assert!(unique1);
    }

    #[test]
    fn repeated_origin_write_is_a_no_op() {
        let (_tmp, dev, mut cache, mut sb) = new_fixture();
        sb.snapmask = 1;
        let mut next = 300u64;
        let a = make_unique(
            &mut cache,
            &dev,
            &mut sb,
            CHUNK_SIZE,
            5,
            View::Origin,
            next_chunk(&mut next),
            |_, _, _| Ok(ChunkId(999)),
        )
        .unwrap();
        assert!(a.is_some());
        let b = make_unique(
            &mut cache,
            &dev,
            &mut sb,
            CHUNK_SIZE,
            5,
            View::Origin,
            next_chunk(&mut next),
            |_, _, _| Ok(ChunkId(999)),
        )
        .unwrap();
        assert!(b.is_none());
    }

    #[test]
    fn delete_tree_range_clears_bit_and_frees_fully_unshared_exceptions() {
        let (_tmp, dev, mut cache, mut sb) = new_fixture();
        sb.snapmask = 0b11;
        let mut next = 400u64;
        make_unique(
            &mut cache,
            &dev,
            &mut sb,
            CHUNK_SIZE,
            5,
            View::Origin,
            next_chunk(&mut next),
            |_, _, _| Ok(ChunkId(999)),
        )
        .unwrap();

        let mut freed = Vec::new();
        delete_tree_range(&mut cache, &dev, &mut sb, CHUNK_SIZE, 0b11, |_, _, _, chunk| {
            freed.push(chunk);
            Ok(())
        })
        .unwrap();
        assert_eq!(freed.len(), 1);

        let (unique, _) = test_unique(&mut cache, &dev, &sb, 5, View::Origin).unwrap();
        assert!(unique, "leaf is empty, so the chunk is trivially unique again");
    }

    #[test]
    fn gen_changelist_is_empty_for_identical_snapshots() {
        let (_tmp, dev, mut cache, mut sb) = new_fixture();
        sb.snapmask = 0b11;
        let mut next = 500u64;
        make_unique(
            &mut cache,
            &dev,
            &mut sb,
            CHUNK_SIZE,
            5,
            View::Origin,
            next_chunk(&mut next),
            |_, _, _| Ok(ChunkId(999)),
        )
        .unwrap();
        let list = gen_changelist(&mut cache, &dev, &sb, SnapshotBit(0), SnapshotBit(0)).unwrap();
        assert!(list.is_empty());
    }

    #[test]
    fn splitting_a_leaf_preserves_every_entry() {
        let (_tmp, dev, mut cache, mut sb) = new_fixture();
        sb.snapmask = 1;
        let mut next = 1000u64;
        // enough distinct origin chunks to overflow one 256-byte leaf
        for c in 0..20u64 {
            make_unique(
                &mut cache,
                &dev,
                &mut sb,
                CHUNK_SIZE,
                c,
                View::Origin,
                next_chunk(&mut next),
                |_, _, sb| {
                    let n = sb.metadata.total_chunks + 1000;
                    sb.metadata.total_chunks = n;
                    Ok(ChunkId(n))
                },
            )
            .unwrap();
        }
        assert!(sb.etree_levels >= 1, "leaf split should have grown the tree");
        for c in 0..20u64 {
            let (unique, _) = test_unique(&mut cache, &dev, &sb, c, View::Origin).unwrap();
            assert!(unique, "chunk {c} should still be unique after splitting");
        }
    }
}
