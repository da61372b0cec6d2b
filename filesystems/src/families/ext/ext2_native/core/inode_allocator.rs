// ext2 Inode Allocator
// Picks a block group for a new inode and claims a free bit in its inode bitmap

use log::{debug, error, trace};
use std::sync::Arc;

use super::{
    constants::*,
    inode::Ext2InodeInfo,
    structures::Ext2Inode,
    types::*,
    volume::Volume,
};

/// Inode allocator over the inode bitmaps of a mounted volume
#[derive(Debug, Clone)]
pub struct InodeAllocator {
    volume: Arc<Volume>,
}

/// Volume-wide averages the group-selection policies compare against
#[derive(Debug, Clone, Copy)]
struct GroupStats {
    ngroups: u32,
    avefreei: u64,
    avefreeb: u64,
    free_blocks: u64,
    ndirs: u64,
}

impl InodeAllocator {
    pub fn new(volume: Arc<Volume>) -> Self {
        Self { volume }
    }

    fn stats(&self) -> GroupStats {
        let ngroups = self.volume.groups_count();
        let free_blocks = self.volume.free_blocks_count();
        GroupStats {
            ngroups,
            avefreei: self.volume.free_inodes_count() / ngroups as u64,
            avefreeb: free_blocks / ngroups as u64,
            free_blocks,
            ndirs: self.volume.dirs_count(),
        }
    }

    /// Allocate an inode for a new object of `mode` inside directory `dir`.
    ///
    /// The returned inode is in the `New` state and not yet registered anywhere;
    /// if registration fails the caller hands the number back through [`free`].
    ///
    /// [`free`]: InodeAllocator::free
    pub fn allocate(
        &self,
        dir: &Ext2InodeInfo,
        mode: u16,
        creds: &dyn HostCredentials,
    ) -> Ext2Result<Ext2InodeInfo> {
        let is_dir = FileType::from_mode(mode).is_dir();
        let start = if is_dir {
            if self.volume.options().old_alloc {
                self.find_group_dir()?
            } else {
                self.find_group_orlov(dir)?
            }
        } else {
            self.find_group_other(dir)?
        };
        let mut group = start.ok_or_else(|| {
            debug!("no group with free inodes for child of {}", dir.ino());
            StrataError::NoSpace("no free inodes".to_string())
        })?;

        let g = self.volume.geometry();
        let ipg = g.inodes_per_group;
        let mut claimed = None;
        for _ in 0..g.groups_count {
            let bitmap = self.volume.read_inode_bitmap(group)?;
            let mut bit = 0;
            while let Some(found) = bitmap.find_next_zero(bit, ipg) {
                if !bitmap.test_and_set(found) {
                    claimed = Some((found, bitmap));
                    break;
                }
                // lost the race for this inode
                bit = found + 1;
            }
            if claimed.is_some() {
                break;
            }
            group = (group + 1) % g.groups_count;
        }
        let (bit, bitmap) = claimed.ok_or_else(|| StrataError::NoSpace("no free inodes".to_string()))?;
        self.volume.dirty_buffer(bitmap.block(), self.volume.options().sync)?;

        let ino = group * ipg + bit + 1;
        if ino < g.first_ino || ino > g.inodes_count {
            error!(
                "reserved inode or inode > inodes count - block_group = {}, inode = {}",
                group, ino
            );
            return Err(corrupted(format!("allocated reserved inode {}", ino)));
        }

        let volume = &self.volume;
        volume.sub_free_inodes(1);
        if is_dir {
            volume.inc_dirs();
        }
        volume.update_group_desc(group, |desc| {
            desc.bg_free_inodes_count = desc.bg_free_inodes_count.saturating_sub(1);
            if is_dir {
                volume.inc_debt(group);
                desc.bg_used_dirs_count = desc.bg_used_dirs_count.saturating_add(1);
            } else {
                volume.dec_debt(group);
            }
        })?;

        let raw = self.init_inode(dir, mode, creds);
        trace!("allocated inode {} in group {} (parent {})", ino, group, dir.ino());
        Ok(Ext2InodeInfo::new_inode(ino, group, raw))
    }

    // Fresh on-disk record: owner, inherited flags, timestamps, generation
    fn init_inode(&self, dir: &Ext2InodeInfo, mut mode: u16, creds: &dyn HostCredentials) -> Ext2Inode {
        let dir_mode = dir.mode();
        let gid = if self.volume.options().grpid {
            dir.gid()
        } else if dir_mode & S_ISGID != 0 {
            if FileType::from_mode(mode).is_dir() {
                mode |= S_ISGID;
            }
            dir.gid()
        } else {
            creds.fsgid()
        };

        let now = now_secs();
        let mut raw = Ext2Inode {
            i_mode: mode,
            i_atime: now,
            i_ctime: now,
            i_mtime: now,
            i_flags: mask_flags(mode, dir.flags() & EXT2_FL_INHERITED),
            i_generation: self.volume.next_generation(),
            ..Default::default()
        };
        raw.set_uid(creds.fsuid());
        raw.set_gid(gid);
        raw
    }

    /// Release inode `ino`; used to undo an allocation the host could not register
    pub fn free(&self, ino: InodeNumber, is_dir: bool) -> Ext2Result<()> {
        let g = self.volume.geometry();
        if ino < g.first_ino || ino > g.inodes_count {
            error!("reserved or nonexistent inode {}", ino);
            return Err(corrupted(format!("freeing reserved or nonexistent inode {}", ino)));
        }
        let group = g.inode_group(ino);
        let bit = (ino - 1) % g.inodes_per_group;
        let bitmap = self.volume.read_inode_bitmap(group)?;
        if !bitmap.test_and_clear(bit) {
            error!("bit already cleared for inode {}", ino);
            return Err(corrupted(format!("inode {} already free", ino)));
        }

        let volume = &self.volume;
        volume.update_group_desc(group, |desc| {
            desc.bg_free_inodes_count = desc.bg_free_inodes_count.saturating_add(1);
            if is_dir {
                desc.bg_used_dirs_count = desc.bg_used_dirs_count.saturating_sub(1);
            }
        })?;
        volume.add_free_inodes(1);
        if is_dir {
            volume.dec_dirs();
        }
        volume.dirty_buffer(bitmap.block(), volume.options().sync)?;
        trace!("freed inode {}", ino);
        Ok(())
    }

    /// Directory placement without Orlov: among groups with at least the
    /// average number of free inodes, the one with the most free blocks.
    fn find_group_dir(&self) -> Ext2Result<Option<GroupNumber>> {
        let stats = self.stats();
        let mut best: Option<(GroupNumber, u16)> = None;
        for group in 0..stats.ngroups {
            let desc = self.volume.group_desc(group)?;
            let free_inodes = desc.bg_free_inodes_count as u64;
            if free_inodes == 0 || free_inodes < stats.avefreei {
                continue;
            }
            if best.map_or(true, |(_, blocks)| desc.bg_free_blocks_count > blocks) {
                best = Some((group, desc.bg_free_blocks_count));
            }
        }
        Ok(best.map(|(group, _)| group))
    }

    /// Orlov placement for directories.
    ///
    /// Top-level directories are spread: starting from a random group, take the
    /// group with the fewest directories among those with at least average free
    /// inodes and blocks. Other directories stay near their parent unless its
    /// group is crowded (too many directories, too few free resources, or too
    /// much directory debt). Both paths fall back to any group with at least
    /// average free inodes, then to any group with a free inode at all.
    fn find_group_orlov(&self, parent: &Ext2InodeInfo) -> Ext2Result<Option<GroupNumber>> {
        let stats = self.stats();
        let ngroups = stats.ngroups;
        let g = self.volume.geometry();
        let ipg = g.inodes_per_group as u64;
        let mut parent_group = parent.block_group();

        let top_level = parent.ino() == EXT2_ROOT_INO || parent.flags() & EXT2_TOPDIR_FL != 0;
        if top_level {
            parent_group = self.volume.random_below(ngroups);
            let mut best: Option<GroupNumber> = None;
            let mut best_ndir = ipg;
            for i in 0..ngroups {
                let group = (parent_group + i) % ngroups;
                let desc = self.volume.group_desc(group)?;
                if desc.bg_free_inodes_count == 0
                    || desc.bg_used_dirs_count as u64 >= best_ndir
                    || (desc.bg_free_inodes_count as u64) < stats.avefreei
                    || (desc.bg_free_blocks_count as u64) < stats.avefreeb
                {
                    continue;
                }
                best = Some(group);
                best_ndir = desc.bg_used_dirs_count as u64;
            }
            if best.is_some() {
                return Ok(best);
            }
        } else {
            let ndirs = stats.ndirs.max(1);
            let blocks_per_dir = (g.blocks_count as u64).saturating_sub(stats.free_blocks) / ndirs;
            let max_dirs = ndirs / ngroups as u64 + ipg / 16;
            let min_inodes = stats.avefreei as i64 - (ipg / 4) as i64;
            let min_blocks = stats.avefreeb as i64 - (g.blocks_per_group / 4) as i64;

            let mut max_debt = g.blocks_per_group as u64 / blocks_per_dir.max(ORLOV_BLOCK_COST as u64);
            if max_debt * ORLOV_INODE_COST as u64 > ipg {
                max_debt = ipg / ORLOV_INODE_COST as u64;
            }
            let max_debt = max_debt.clamp(1, ORLOV_MAX_DEBT as u64);

            for i in 0..ngroups {
                let group = (parent_group + i) % ngroups;
                let desc = self.volume.group_desc(group)?;
                if desc.bg_free_inodes_count == 0
                    || self.volume.debt(group) as u64 >= max_debt
                    || desc.bg_used_dirs_count as u64 >= max_dirs
                    || (desc.bg_free_inodes_count as i64) < min_inodes
                    || (desc.bg_free_blocks_count as i64) < min_blocks
                {
                    continue;
                }
                return Ok(Some(group));
            }
        }

        // Fallback: first group with average free inodes, then any free inode
        for avefreei in [stats.avefreei, 0] {
            for i in 0..ngroups {
                let group = (parent_group + i) % ngroups;
                let desc = self.volume.group_desc(group)?;
                if desc.bg_free_inodes_count != 0 && desc.bg_free_inodes_count as u64 >= avefreei {
                    return Ok(Some(group));
                }
            }
            if avefreei == 0 {
                break;
            }
        }
        Ok(None)
    }

    /// Placement for everything but directories: the parent's group if it has
    /// free inodes and blocks, then a quadratic probe seeded by the parent's
    /// group and inode number, then any group with a free inode.
    fn find_group_other(&self, parent: &Ext2InodeInfo) -> Ext2Result<Option<GroupNumber>> {
        let ngroups = self.volume.groups_count();
        let parent_group = parent.block_group();

        let usable = |group: GroupNumber| -> Ext2Result<bool> {
            let desc = self.volume.group_desc(group)?;
            Ok(desc.bg_free_inodes_count != 0 && desc.bg_free_blocks_count != 0)
        };
        if usable(parent_group)? {
            return Ok(Some(parent_group));
        }

        let mut group = ((parent_group as u64 + parent.ino() as u64) % ngroups as u64) as u32;
        let mut step = 1;
        while step < ngroups {
            group += step;
            if group >= ngroups {
                group -= ngroups;
            }
            if usable(group)? {
                return Ok(Some(group));
            }
            step <<= 1;
        }

        // Linear search for a free inode, even in a group without free blocks
        let mut group = parent_group;
        for _ in 0..ngroups {
            group += 1;
            if group >= ngroups {
                group = 0;
            }
            if self.volume.group_desc(group)?.bg_free_inodes_count != 0 {
                return Ok(Some(group));
            }
        }
        Ok(None)
    }
}

/// Keep only the flags that make sense for the kind of inode being created
pub fn mask_flags(mode: u16, flags: u32) -> u32 {
    match FileType::from_mode(mode) {
        FileType::Directory => flags,
        FileType::Regular => flags & EXT2_REG_FLMASK,
        _ => flags & EXT2_OTHER_FLMASK,
    }
}
