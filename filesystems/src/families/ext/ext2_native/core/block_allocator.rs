// ext2 Block Allocator
// Goal-directed, contiguous-run allocation out of a single block group

use log::{debug, error, trace};
use std::sync::Arc;

use super::{
    types::{BlockNumber, Ext2Result, GroupNumber, HostCredentials, InodeNumber, StrataError, corrupted},
    volume::Volume,
};

/// Block allocator over the block bitmaps of a mounted volume
#[derive(Debug, Clone)]
pub struct BlockAllocator {
    volume: Arc<Volume>,
}

impl BlockAllocator {
    pub fn new(volume: Arc<Volume>) -> Self {
        Self { volume }
    }

    pub fn volume(&self) -> &Arc<Volume> {
        &self.volume
    }

    /// Allocate up to `count` contiguous blocks as close to `goal` as possible.
    ///
    /// Only the goal's group is searched, and only from the goal forward. The
    /// returned run starts at the first free block at or after the goal and
    /// extends over the following free blocks, never past the end of the group.
    /// Free blocks before the goal are not considered.
    /// Returns the first block and the length of the run.
    pub fn allocate(
        &self,
        ino: InodeNumber,
        goal: BlockNumber,
        count: u32,
        creds: &dyn HostCredentials,
    ) -> Ext2Result<(BlockNumber, u32)> {
        if count == 0 {
            return Err(StrataError::InvalidArgument(
                "block allocation of zero blocks".to_string(),
            ));
        }
        if !self.volume.has_free_blocks(creds) {
            return Err(StrataError::NoSpace(
                "free blocks below the reserved floor".to_string(),
            ));
        }

        let g = self.volume.geometry();
        let goal = if goal < g.first_data_block || goal >= g.blocks_count {
            g.first_data_block
        } else {
            goal
        };
        let group = g.block_group(goal);
        let grp_goal = (goal - g.first_data_block) % g.blocks_per_group;

        let desc = self.volume.group_desc(group)?;
        if desc.bg_free_blocks_count == 0 {
            debug!("group {} has no free blocks for inode {}", group, ino);
            return Err(StrataError::NoSpace(format!("block group {} is full", group)));
        }

        let bitmap = self.volume.read_block_bitmap(group)?;
        let limit = g.blocks_in_group(group);

        let first = match self.claim_first(&bitmap, grp_goal, limit) {
            Some(bit) => bit,
            None => {
                debug!("no free bit in group {} for inode {}", group, ino);
                return Err(StrataError::NoSpace(format!("block group {} is full", group)));
            }
        };
        let mut num = 1;
        while num < count && first + num < limit && !bitmap.test_and_set(first + num) {
            num += 1;
        }

        let block = g.group_first_block(group) + first;
        if self.volume.in_system_zone(group, block, num)? {
            error!(
                "allocating block in system zone - blocks from {}, length {}",
                block, num
            );
            return Err(StrataError::NoSpace(format!(
                "bitmap for group {} hands out metadata blocks",
                group
            )));
        }
        if block as u64 + num as u64 > g.blocks_count as u64 {
            error!(
                "blocks count({}) < block({}) + count({}) in group {}",
                g.blocks_count, block, num, group
            );
            return Err(corrupted(format!("block {} beyond end of volume", block)));
        }

        let volume = &self.volume;
        volume.update_group_desc(group, |desc| {
            desc.bg_free_blocks_count = desc.bg_free_blocks_count.saturating_sub(num as u16);
            volume.sub_free_blocks(num as u64);
        })?;
        volume.dirty_buffer(bitmap.block(), volume.options().sync)?;

        trace!("inode {}: allocated blocks {}..{} (goal {})", ino, block, block + num, goal);
        Ok((block, num))
    }

    // Claim the first clear bit in `[start, limit)`. A lost race moves on to
    // the next bit; the group end is a failure.
    fn claim_first(&self, bitmap: &super::bitmap::Bitmap, start: u32, limit: u32) -> Option<u32> {
        let mut bit = start;
        while let Some(found) = bitmap.find_next_zero(bit, limit) {
            if !bitmap.test_and_set(found) {
                return Some(found);
            }
            bit = found + 1;
        }
        None
    }

    /// Return `count` blocks starting at `block` to the free pool
    pub fn free_blocks(&self, block: BlockNumber, count: u32) -> Ext2Result<()> {
        let g = self.volume.geometry();
        let end = block as u64 + count as u64;
        if block < g.first_data_block || end > g.blocks_count as u64 {
            error!("freeing blocks not in datazone - block = {}, count = {}", block, count);
            return Err(corrupted(format!(
                "freeing blocks {}+{} outside the data zone",
                block, count
            )));
        }

        let mut block = block;
        let mut count = count;
        while count > 0 {
            let group: GroupNumber = g.block_group(block);
            let bit = (block - g.first_data_block) % g.blocks_per_group;
            let overflow = (bit + count).saturating_sub(g.blocks_per_group);
            let run = count - overflow;

            let bitmap = self.volume.read_block_bitmap(group)?;
            if self.volume.in_system_zone(group, block, run)? {
                error!("freeing blocks in system zones - block = {}, count = {}", block, run);
                return Err(corrupted(format!(
                    "freeing metadata blocks {}+{}",
                    block, run
                )));
            }

            let mut freed = 0u32;
            for i in 0..run {
                if bitmap.test_and_clear(bit + i) {
                    freed += 1;
                } else {
                    error!("bit already cleared for block {}", block + i);
                }
            }
            self.volume
                .dirty_buffer(bitmap.block(), self.volume.options().sync)?;

            let volume = &self.volume;
            volume.update_group_desc(group, |desc| {
                desc.bg_free_blocks_count = desc.bg_free_blocks_count.saturating_add(freed as u16);
                volume.add_free_blocks(freed as u64);
            })?;
            trace!("freed {} blocks at {} in group {}", freed, block, group);

            block += run;
            count = overflow;
        }
        Ok(())
    }
}
