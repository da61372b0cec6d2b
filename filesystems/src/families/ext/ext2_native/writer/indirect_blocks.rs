// Indirect block support for the ext2 writer
// Maps logical file blocks onto physical blocks through the 12 direct and
// three indirect pointer levels, growing the tree on demand

use log::{debug, error, trace};
use std::sync::atomic::Ordering;

use super::Ext2Fs;
use crate::families::ext::ext2_native::core::{
    block_cache::BlockRef,
    constants::*,
    inode::{BlockAllocInfo, Ext2InodeInfo},
    types::*,
};

/// How many times a walk restarts after a concurrent rewrite of its chain
const MAX_CHAIN_RETRIES: usize = 8;

/// A physical run backing consecutive logical blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockMapping {
    pub physical: BlockNumber,
    pub count: u32,
    /// Allocated by this call; the blocks hold no valid data yet
    pub new: bool,
    /// The run ends on the last pointer of its pointer block
    pub boundary: bool,
}

/// Per-level pointer indices for one logical block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockPath {
    pub offsets: [usize; 4],
    pub depth: usize,
    /// Pointers left after this one in the last-level pointer array
    pub boundary: u32,
}

/// Split logical block `iblock` into the pointer indices of each level.
///
/// `addr_bits` is log2 of the number of pointers in one block. Indices past
/// the triple-indirect range are reported as `Io`.
pub fn block_to_path(addr_bits: u32, iblock: u64) -> Ext2Result<BlockPath> {
    let ptrs = 1u64 << addr_bits;
    let direct = EXT2_NDIR_BLOCKS as u64;
    let double = 1u64 << (addr_bits * 2);

    let single_start = direct;
    let double_start = single_start + ptrs;
    let triple_start = double_start + double;

    let mut offsets = [0usize; 4];
    let (depth, last_len) = if iblock < single_start {
        offsets[0] = iblock as usize;
        (1, direct)
    } else if iblock < double_start {
        offsets[0] = EXT2_IND_BLOCK;
        offsets[1] = (iblock - single_start) as usize;
        (2, ptrs)
    } else if iblock < triple_start {
        let i = iblock - double_start;
        offsets[0] = EXT2_DIND_BLOCK;
        offsets[1] = (i >> addr_bits) as usize;
        offsets[2] = (i & (ptrs - 1)) as usize;
        (3, ptrs)
    } else if (iblock - triple_start) >> (addr_bits * 2) < ptrs {
        let i = iblock - triple_start;
        offsets[0] = EXT2_TIND_BLOCK;
        offsets[1] = (i >> (addr_bits * 2)) as usize;
        offsets[2] = ((i >> addr_bits) & (ptrs - 1)) as usize;
        offsets[3] = (i & (ptrs - 1)) as usize;
        (4, ptrs)
    } else {
        error!("block_to_path: block {} > big", iblock);
        return Err(corrupted(format!("logical block {} beyond addressable range", iblock)));
    };

    Ok(BlockPath {
        offsets,
        depth,
        boundary: (last_len - 1 - offsets[depth - 1] as u64) as u32,
    })
}

/// Where a pointer lives: the inode's own array or an indirect block
#[derive(Debug, Clone)]
enum Slot {
    Inode(usize),
    Block(BlockRef, usize),
}

/// One link of a pointer chain with the value it held when read
#[derive(Debug, Clone)]
struct Indirect {
    slot: Slot,
    key: BlockNumber,
}

impl Indirect {
    fn index(&self) -> usize {
        match &self.slot {
            Slot::Inode(index) | Slot::Block(_, index) => *index,
        }
    }

    /// Pointer `n` entries after this link in the same array
    fn sibling(&self, inode: &Ext2InodeInfo, n: usize) -> BlockNumber {
        match &self.slot {
            Slot::Inode(index) => inode.block_ptr(index + n),
            Slot::Block(bh, index) => bh.read_u32(index + n),
        }
    }

    fn current(&self, inode: &Ext2InodeInfo) -> BlockNumber {
        self.sibling(inode, 0)
    }

    fn store(&self, inode: &Ext2InodeInfo, n: usize, value: BlockNumber) {
        match &self.slot {
            Slot::Inode(index) => inode.data_slot(index + n).store(value, Ordering::Release),
            Slot::Block(bh, index) => bh.write_u32(index + n, value),
        }
    }
}

/// Outcome of walking a chain
enum Branch {
    /// Every level mapped; the last link holds the data block
    Resolved(Vec<Indirect>),
    /// The last link holds a zero pointer
    MissingAt(Vec<Indirect>),
    /// An earlier link changed under the walk
    Invalidated,
}

// Every link still holds the value it had when the walk read it
fn verify_chain(inode: &Ext2InodeInfo, chain: &[Indirect]) -> bool {
    chain.iter().all(|link| link.current(inode) == link.key)
}

impl Ext2Fs {
    /// Map `maxblocks` logical blocks starting at `iblock`.
    ///
    /// Without `create`, a hole comes back as `None`. With `create`, missing
    /// pointer blocks and data blocks are allocated and spliced in; the
    /// result then has `new` set.
    pub fn get_blocks(
        &self,
        inode: &Ext2InodeInfo,
        iblock: u64,
        maxblocks: u32,
        create: bool,
    ) -> Ext2Result<Option<BlockMapping>> {
        let path = block_to_path(self.volume.geometry().addr_per_block_bits, iblock)?;
        let maxblocks = maxblocks.max(1);

        for _ in 0..MAX_CHAIN_RETRIES {
            let partial = match self.get_branch(inode, &path)? {
                Branch::Resolved(chain) => match self.extend_run(inode, &chain, &path, maxblocks) {
                    Some(mapping) => return Ok(Some(mapping)),
                    None => None,
                },
                Branch::MissingAt(chain) => Some(chain),
                Branch::Invalidated => None,
            };

            if !create {
                match partial {
                    Some(_) => return Ok(None),
                    None => continue,
                }
            }

            let _alloc = inode.lock_alloc();
            let chain = match partial {
                Some(chain) if self.chain_still_valid(inode, &chain) => chain,
                _ => match self.get_branch(inode, &path)? {
                    // someone else filled the hole while we waited
                    Branch::Resolved(chain) => {
                        let physical = chain[path.depth - 1].key;
                        return Ok(Some(BlockMapping {
                            physical,
                            count: 1,
                            new: false,
                            boundary: path.boundary == 0,
                        }));
                    }
                    Branch::MissingAt(chain) => chain,
                    Branch::Invalidated => continue,
                },
            };
            return self.grow_branch(inode, iblock, &path, chain, maxblocks).map(Some);
        }

        error!(
            "inode {}: pointer chain for block {} kept changing, giving up",
            inode.ino(),
            iblock
        );
        Err(corrupted(format!("unstable pointer chain at logical block {}", iblock)))
    }

    /// Physical block behind logical block `iblock`, if mapped
    pub fn bmap(&self, inode: &Ext2InodeInfo, iblock: u64) -> Ext2Result<Option<BlockNumber>> {
        Ok(self.get_blocks(inode, iblock, 1, false)?.map(|m| m.physical))
    }

    fn chain_still_valid(&self, inode: &Ext2InodeInfo, chain: &[Indirect]) -> bool {
        let _meta = inode.read_meta();
        verify_chain(inode, chain)
    }

    // Walk from the inode's pointer array towards the data block, stopping at
    // the first zero pointer
    fn get_branch(&self, inode: &Ext2InodeInfo, path: &BlockPath) -> Ext2Result<Branch> {
        let mut chain = Vec::with_capacity(path.depth);
        {
            let _meta = inode.read_meta();
            let index = path.offsets[0];
            chain.push(Indirect {
                slot: Slot::Inode(index),
                key: inode.block_ptr(index),
            });
        }
        if chain[0].key == 0 {
            return Ok(Branch::MissingAt(chain));
        }

        for level in 1..path.depth {
            let parent = chain[level - 1].key;
            let bh = self.volume.cache().bread(parent)?;
            let _meta = inode.read_meta();
            if !verify_chain(inode, &chain) {
                trace!("inode {}: chain changed at level {}", inode.ino(), level);
                return Ok(Branch::Invalidated);
            }
            let index = path.offsets[level];
            let key = bh.read_u32(index);
            chain.push(Indirect {
                slot: Slot::Block(bh, index),
                key,
            });
            if key == 0 {
                return Ok(Branch::MissingAt(chain));
            }
        }
        Ok(Branch::Resolved(chain))
    }

    // Lengthen a resolved mapping over physically contiguous siblings
    fn extend_run(
        &self,
        inode: &Ext2InodeInfo,
        chain: &[Indirect],
        path: &BlockPath,
        maxblocks: u32,
    ) -> Option<BlockMapping> {
        let last = &chain[path.depth - 1];
        let first = last.key;
        let mut count = 1u32;
        while count < maxblocks && count <= path.boundary {
            let _meta = inode.read_meta();
            if !verify_chain(inode, chain) {
                return None;
            }
            if last.sibling(inode, count as usize) != first.wrapping_add(count) {
                break;
            }
            count += 1;
        }
        Some(BlockMapping {
            physical: first,
            count,
            new: false,
            boundary: count > path.boundary,
        })
    }

    /// Goal for the next allocation: right after the last allocation if it
    /// continues it, otherwise near the closest populated pointer.
    fn find_goal(&self, inode: &Ext2InodeInfo, iblock: u64, partial: &Indirect) -> BlockNumber {
        if let Some(info) = inode.alloc_info() {
            if info.last_alloc_physical != 0 && iblock == info.last_alloc_logical.wrapping_add(1) {
                return info.last_alloc_physical + 1;
            }
        }
        self.find_near(inode, partial)
    }

    fn find_near(&self, inode: &Ext2InodeInfo, partial: &Indirect) -> BlockNumber {
        let index = partial.index();
        let previous = (0..index)
            .rev()
            .map(|i| match &partial.slot {
                Slot::Inode(_) => inode.block_ptr(i),
                Slot::Block(bh, _) => bh.read_u32(i),
            })
            .find(|blk| *blk != 0);
        if let Some(blk) = previous {
            return blk + 1;
        }
        if let Slot::Block(bh, _) = &partial.slot {
            return bh.blocknr();
        }

        // Spread files started at the same time across the group
        let g = self.volume.geometry();
        let colour = self.volume.random_below(16) * (g.blocks_per_group / 16);
        g.group_first_block(inode.block_group()) + colour
    }

    // Number of data blocks to allocate along with `indirect_blks` pointer blocks
    fn blocks_to_allocate(
        inode: &Ext2InodeInfo,
        partial: &Indirect,
        indirect_blks: usize,
        maxblocks: u32,
        boundary: u32,
    ) -> u32 {
        if indirect_blks > 0 {
            return maxblocks.min(boundary + 1);
        }
        let mut count = 1;
        while count < maxblocks
            && count <= boundary
            && partial.sibling(inode, count as usize) == 0
        {
            count += 1;
        }
        count
    }

    /// Allocate `indirect_blks` pointer blocks followed by up to `blks` data
    /// blocks. Returns the block numbers of the pointer blocks, the first data
    /// block and the number of data blocks. Everything is released again when
    /// the allocator runs dry part way.
    fn alloc_blocks(
        &self,
        inode: &Ext2InodeInfo,
        goal: BlockNumber,
        indirect_blks: usize,
        blks: u32,
    ) -> Ext2Result<(Vec<BlockNumber>, BlockNumber, u32)> {
        let mut runs: Vec<(BlockNumber, u32)> = Vec::new();
        let mut meta = Vec::with_capacity(indirect_blks);
        let mut target = blks + indirect_blks as u32;

        loop {
            let (mut current, mut count) = match self.block_allocator.allocate(
                inode.ino(),
                goal,
                target,
                self.creds.as_ref(),
            ) {
                Ok(run) => run,
                Err(e) => {
                    for (start, len) in runs {
                        if let Err(free_err) = self.block_allocator.free_blocks(start, len) {
                            error!("inode {}: releasing blocks {}+{} failed: {}", inode.ino(), start, len, free_err);
                        }
                    }
                    debug!("inode {}: branch allocation failed: {}", inode.ino(), e);
                    return Err(e);
                }
            };
            runs.push((current, count));
            target -= count;
            while meta.len() < indirect_blks && count > 0 {
                meta.push(current);
                current += 1;
                count -= 1;
            }
            if count > 0 {
                let total: u32 = runs.iter().map(|(_, len)| len).sum();
                let sectors = total * (self.volume.block_size() / 512);
                inode.update(|raw| raw.i_blocks = raw.i_blocks.wrapping_add(sectors));
                return Ok((meta, current, count));
            }
        }
    }

    // Allocate the missing part of the chain and hook it in
    fn grow_branch(
        &self,
        inode: &Ext2InodeInfo,
        iblock: u64,
        path: &BlockPath,
        chain: Vec<Indirect>,
        maxblocks: u32,
    ) -> Ext2Result<BlockMapping> {
        if inode.file_type() == FileType::Regular && inode.alloc_info().is_none() {
            inode.set_alloc_info(BlockAllocInfo {
                last_alloc_logical: u64::MAX,
                last_alloc_physical: 0,
            });
        }

        let level = chain.len() - 1;
        let partial = &chain[level];
        let indirect_blks = path.depth - chain.len();
        let goal = self.find_goal(inode, iblock, partial);
        let blks = Self::blocks_to_allocate(inode, partial, indirect_blks, maxblocks, path.boundary);

        let (meta, first_data, count) = self.alloc_blocks(inode, goal, indirect_blks, blks)?;
        let new_blocks: Vec<BlockNumber> = meta.iter().copied().chain(std::iter::once(first_data)).collect();

        // Build the new pointer blocks; each holds one live pointer, the last
        // one points at the whole data run
        let sync_dir = inode.is_dir() && self.is_dirsync(inode);
        for n in 1..=indirect_blks {
            let bh = self.volume.cache().getblk(new_blocks[n - 1]);
            {
                let mut data = bh.write();
                data.fill(0);
            }
            let offset = path.offsets[level + n];
            bh.write_u32(offset, new_blocks[n]);
            if n == indirect_blks {
                for i in 1..count {
                    bh.write_u32(offset + i as usize, first_data + i);
                }
            }
            self.volume.dirty_buffer(&bh, sync_dir)?;
        }

        self.splice_branch(inode, iblock, partial, &new_blocks, indirect_blks, count)?;
        trace!(
            "inode {}: block {} -> {} (+{} pointer blocks, run {})",
            inode.ino(),
            iblock,
            first_data,
            indirect_blks,
            count
        );
        Ok(BlockMapping {
            physical: first_data,
            count,
            new: true,
            boundary: count > path.boundary,
        })
    }

    fn splice_branch(
        &self,
        inode: &Ext2InodeInfo,
        iblock: u64,
        partial: &Indirect,
        new_blocks: &[BlockNumber],
        indirect_blks: usize,
        count: u32,
    ) -> Ext2Result<()> {
        // Direct siblings first so the run is complete once the key lands
        if indirect_blks == 0 {
            for i in 1..count {
                partial.store(inode, i as usize, new_blocks[0] + i);
            }
        }
        partial.store(inode, 0, new_blocks[0]);

        if inode.alloc_info().is_some() {
            inode.set_alloc_info(BlockAllocInfo {
                last_alloc_logical: iblock + count as u64 - 1,
                last_alloc_physical: new_blocks[indirect_blks] + count - 1,
            });
        }

        if let Slot::Block(bh, _) = &partial.slot {
            self.volume.dirty_buffer(bh, self.volume.options().sync)?;
        }
        let now = now_secs();
        inode.update(|raw| {
            raw.i_mtime = now;
            raw.i_ctime = now;
        });
        Ok(())
    }

    pub(super) fn is_dirsync(&self, inode: &Ext2InodeInfo) -> bool {
        self.volume.options().dirsync
            || self.volume.options().sync
            || inode.flags() & (EXT2_DIRSYNC_FL | EXT2_SYNC_FL) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{mount_fresh, small_params};
    use std::sync::atomic::AtomicBool;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use strata_core::MountOptions;

    // 1 KiB blocks: 256 pointers per block
    const BITS_1K: u32 = 8;

    #[test]
    fn direct_blocks_have_depth_one() {
        for i in 0..12u64 {
            let path = block_to_path(BITS_1K, i).unwrap();
            assert_eq!(path.depth, 1);
            assert_eq!(path.offsets[0], i as usize);
            assert_eq!(path.boundary, 11 - i as u32);
        }
    }

    #[test]
    fn indirect_levels_and_boundaries() {
        let path = block_to_path(BITS_1K, 12).unwrap();
        assert_eq!(path.depth, 2);
        assert_eq!(&path.offsets[..2], &[EXT2_IND_BLOCK, 0]);
        assert_eq!(path.boundary, 255);

        let path = block_to_path(BITS_1K, 12 + 255).unwrap();
        assert_eq!(path.depth, 2);
        assert_eq!(path.boundary, 0);

        let path = block_to_path(BITS_1K, 12 + 256).unwrap();
        assert_eq!(path.depth, 3);
        assert_eq!(&path.offsets[..3], &[EXT2_DIND_BLOCK, 0, 0]);

        let path = block_to_path(BITS_1K, 12 + 256 + 256 * 3 + 7).unwrap();
        assert_eq!(&path.offsets[..3], &[EXT2_DIND_BLOCK, 3, 7]);
        assert_eq!(path.boundary, 248);

        let first_tind = 12 + 256 + 65536;
        let path = block_to_path(BITS_1K, first_tind).unwrap();
        assert_eq!(path.depth, 4);
        assert_eq!(path.offsets, [EXT2_TIND_BLOCK, 0, 0, 0]);

        let last = first_tind + (1 << 24) - 1;
        let path = block_to_path(BITS_1K, last).unwrap();
        assert_eq!(path.offsets, [EXT2_TIND_BLOCK, 255, 255, 255]);
        assert!(block_to_path(BITS_1K, last + 1).unwrap_err().is_io());
    }

    #[test]
    fn holes_stay_unmapped_without_create() {
        let fs = mount_fresh(&small_params(), MountOptions::default());
        let root = fs.root().unwrap();
        let file = fs.create(&root, "sparse", 0o644).unwrap();

        assert_eq!(fs.get_blocks(&file, 0, 4, false).unwrap(), None);
        assert_eq!(fs.get_blocks(&file, 500, 1, false).unwrap(), None);
        assert_eq!(file.block_ptr(EXT2_DIND_BLOCK), 0);
    }

    #[test]
    fn create_maps_runs_and_charges_blocks() {
        let fs = mount_fresh(&small_params(), MountOptions::default());
        let root = fs.root().unwrap();
        let file = fs.create(&root, "data", 0o644).unwrap();
        let free_before = fs.volume().free_blocks_count();

        let m = fs.get_blocks(&file, 0, 4, true).unwrap().unwrap();
        assert!(m.new);
        assert_eq!(m.count, 4);
        for i in 0..4 {
            assert_eq!(file.block_ptr(i), m.physical + i as u32);
        }
        assert_eq!(fs.volume().free_blocks_count(), free_before - 4);
        assert_eq!(file.to_disk().i_blocks, 8);

        // lookups return the same run, capped at what was asked for
        let again = fs.get_blocks(&file, 0, 8, false).unwrap().unwrap();
        assert_eq!(again.physical, m.physical);
        assert_eq!(again.count, 4);
        assert!(!again.new);

        // the next allocation continues the run
        let next = fs.get_blocks(&file, 4, 1, true).unwrap().unwrap();
        assert_eq!(next.physical, m.physical + 4);
    }

    #[test]
    fn first_indirect_block_allocates_pointer_block() {
        let fs = mount_fresh(&small_params(), MountOptions::default());
        let root = fs.root().unwrap();
        let file = fs.create(&root, "big", 0o644).unwrap();
        let free_before = fs.volume().free_blocks_count();
        file.update(|raw| {
            raw.i_mtime = 0;
            raw.i_ctime = 0;
        });

        let m = fs.get_blocks(&file, 12, 1, true).unwrap().unwrap();
        let raw = file.to_disk();
        assert!(raw.i_mtime > 0);
        assert_eq!(raw.i_mtime, raw.i_ctime);
        let ind = file.block_ptr(EXT2_IND_BLOCK);
        assert_ne!(ind, 0);
        assert_ne!(ind, m.physical);
        assert_eq!(fs.volume().free_blocks_count(), free_before - 2);

        let bh = fs.volume().cache().bread(ind).unwrap();
        assert_eq!(bh.read_u32(0), m.physical);
        assert!((1..256).all(|i| bh.read_u32(i) == 0));
        assert_eq!(fs.bmap(&file, 12).unwrap(), Some(m.physical));
    }

    #[test]
    fn concurrent_writers_share_one_indirect_block() {
        let fs = Arc::new(mount_fresh(&small_params(), MountOptions::default()));
        let root = fs.root().unwrap();
        let file = fs.create(&root, "shared", 0o644).unwrap();

        let barrier = Arc::new(Barrier::new(4));
        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                let fs = Arc::clone(&fs);
                let file = Arc::clone(&file);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    fs.get_blocks(&file, 12 + t * 10, 1, true).unwrap().unwrap().physical
                })
            })
            .collect();
        let data: Vec<BlockNumber> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let ind = file.block_ptr(EXT2_IND_BLOCK);
        let bh = fs.volume().cache().bread(ind).unwrap();
        for (t, physical) in data.iter().enumerate() {
            assert_eq!(bh.read_u32(t * 10), *physical);
            assert_ne!(*physical, ind);
        }
        // four data blocks plus exactly one pointer block
        assert_eq!(file.to_disk().i_blocks, 5 * 2);
    }

    // Put an identical copy of the single-indirect block elsewhere; returns
    // the original and the copy
    fn duplicate_indirect(fs: &Ext2Fs, file: &Ext2InodeInfo) -> (BlockNumber, BlockNumber) {
        let original = file.block_ptr(EXT2_IND_BLOCK);
        let (copy, _) = fs
            .block_allocator()
            .allocate(file.ino(), original + 100, 1, &Credentials::root())
            .unwrap();
        let contents = fs.volume().cache().bread(original).unwrap().read().to_vec();
        let bh = fs.volume().cache().getblk(copy);
        bh.write().copy_from_slice(&contents);
        fs.volume().dirty_buffer(&bh, false).unwrap();
        (original, copy)
    }

    #[test]
    fn repointed_chain_is_detected_and_walked_again() {
        let fs = mount_fresh(&small_params(), MountOptions::default());
        let root = fs.root().unwrap();
        let file = fs.create(&root, "moving", 0o644).unwrap();
        let m = fs.get_blocks(&file, 12, 1, true).unwrap().unwrap();

        let path = block_to_path(BITS_1K, 12).unwrap();
        let chain = match fs.get_branch(&file, &path).unwrap() {
            Branch::Resolved(chain) => chain,
            _ => panic!("block 12 should be mapped"),
        };
        let (original, copy) = duplicate_indirect(&fs, &file);
        file.data_slot(EXT2_IND_BLOCK).store(copy, Ordering::Release);

        // the old walk no longer matches the inode
        assert!(!fs.chain_still_valid(&file, &chain));
        assert!(fs.extend_run(&file, &chain, &path, 1).is_none());

        // a new walk goes through the copy and finds the same data block
        match fs.get_branch(&file, &path).unwrap() {
            Branch::Resolved(chain) => {
                assert_eq!(chain[0].key, copy);
                assert_eq!(chain[1].key, m.physical);
            }
            _ => panic!("block 12 should still be mapped"),
        }
        assert_eq!(fs.bmap(&file, 12).unwrap(), Some(m.physical));

        // filling a hole lands in the pointer block the inode now uses
        let next = fs.get_blocks(&file, 13, 1, true).unwrap().unwrap();
        assert_eq!(fs.volume().cache().bread(copy).unwrap().read_u32(1), next.physical);
        assert_eq!(fs.volume().cache().bread(original).unwrap().read_u32(1), 0);
    }

    #[test]
    fn walks_under_constant_rewrites_retry_or_give_up() {
        let fs = mount_fresh(&small_params(), MountOptions::default());
        let root = fs.root().unwrap();
        let file = fs.create(&root, "flapping", 0o644).unwrap();
        for iblock in 12..16 {
            fs.get_blocks(&file, iblock, 1, true).unwrap().unwrap();
        }
        let expected = fs.bmap(&file, 14).unwrap().unwrap();
        let (original, copy) = duplicate_indirect(&fs, &file);

        let stop = Arc::new(AtomicBool::new(false));
        let flipper = {
            let file = Arc::clone(&file);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    file.data_slot(EXT2_IND_BLOCK).store(copy, Ordering::Release);
                    file.data_slot(EXT2_IND_BLOCK).store(original, Ordering::Release);
                }
            })
        };

        let mut gave_up = 0;
        for _ in 0..2000 {
            match fs.get_blocks(&file, 14, 1, false) {
                Ok(Some(found)) => assert_eq!(found.physical, expected),
                Ok(None) => panic!("mapped block reported as a hole"),
                Err(e) => {
                    assert!(e.is_io());
                    gave_up += 1;
                }
            }
        }
        stop.store(true, Ordering::Relaxed);
        flipper.join().unwrap();

        assert!(gave_up < 2000);
        assert_eq!(fs.bmap(&file, 14).unwrap(), Some(expected));
    }
}
