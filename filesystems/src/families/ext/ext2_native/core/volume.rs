// ext2 volume metadata
// Parsed superblock, descriptor table, derived geometry and the shared free counters

use log::{debug, error, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use strata_core::{BlockDevice, MountOptions, StrataError};

use super::bitmap::Bitmap;
use super::block_cache::{BlockCache, BlockRef};
use super::constants::*;
use super::structures::{Ext2GroupDesc, Ext2Superblock};
use super::types::*;

/// Constants derived from the superblock at mount time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeGeometry {
    pub block_size: u32,
    pub block_size_bits: u32,
    pub frag_size: u32,
    pub inode_size: u32,
    pub inodes_per_block: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    /// Inode table blocks per group
    pub itb_per_group: u32,
    pub desc_per_block: u32,
    pub groups_count: u32,
    /// Blocks holding the descriptor table
    pub db_count: u32,
    pub first_data_block: u32,
    pub blocks_count: u32,
    pub inodes_count: u32,
    pub first_ino: u32,
    /// Block pointers per indirect block
    pub addr_per_block: u32,
    pub addr_per_block_bits: u32,
}

fn invalid(msg: impl Into<String>) -> StrataError {
    let msg = msg.into();
    error!("ext2 mount: {}", msg);
    StrataError::InvalidArgument(msg)
}

impl VolumeGeometry {
    /// Validate a superblock and derive the mount-time constants from it
    pub fn from_superblock(sb: &Ext2Superblock) -> Ext2Result<Self> {
        if sb.s_magic != EXT2_SUPER_MAGIC {
            return Err(invalid(format!("bad magic 0x{:04X}", sb.s_magic)));
        }
        if sb.s_rev_level == EXT2_GOOD_OLD_REV {
            return Err(invalid("revision 0 volumes are not supported"));
        }
        if sb.s_rev_level > EXT2_DYNAMIC_REV {
            return Err(invalid(format!("unknown revision level {}", sb.s_rev_level)));
        }
        let unsupported = sb.s_feature_incompat & !EXT2_FEATURE_INCOMPAT_SUPP;
        if unsupported != 0 {
            return Err(invalid(format!("unsupported incompat features 0x{:x}", unsupported)));
        }
        let unsupported = sb.s_feature_ro_compat & !EXT2_FEATURE_RO_COMPAT_SUPP;
        if unsupported != 0 {
            return Err(invalid(format!("unsupported ro-compat features 0x{:x}", unsupported)));
        }
        if sb.s_log_block_size > EXT2_MAX_BLOCK_LOG_SIZE - EXT2_MIN_BLOCK_LOG_SIZE {
            return Err(invalid(format!("bad log block size {}", sb.s_log_block_size)));
        }
        let block_size_bits = sb.s_log_block_size + EXT2_MIN_BLOCK_LOG_SIZE;
        let block_size = 1u32 << block_size_bits;

        if sb.s_log_frag_size != sb.s_log_block_size {
            return Err(invalid(format!(
                "fragment size 1024<<{} differs from block size {}",
                sb.s_log_frag_size, block_size
            )));
        }

        let inode_size = sb.s_inode_size as u32;
        if inode_size < EXT2_GOOD_OLD_INODE_SIZE as u32
            || inode_size > block_size
            || !inode_size.is_power_of_two()
        {
            return Err(invalid(format!("unsupported inode size {}", inode_size)));
        }
        if sb.s_first_ino < EXT2_GOOD_OLD_FIRST_INO {
            return Err(invalid(format!("first inode {} is reserved", sb.s_first_ino)));
        }

        let bits_per_block = block_size * 8;
        if sb.s_blocks_per_group == 0 || sb.s_blocks_per_group > bits_per_block {
            return Err(invalid(format!("blocks per group {}", sb.s_blocks_per_group)));
        }
        if sb.s_frags_per_group != sb.s_blocks_per_group {
            return Err(invalid(format!("fragments per group {}", sb.s_frags_per_group)));
        }
        let inodes_per_block = block_size / inode_size;
        if sb.s_inodes_per_group == 0
            || sb.s_inodes_per_group > bits_per_block
            || sb.s_inodes_per_group < inodes_per_block
        {
            return Err(invalid(format!("inodes per group {}", sb.s_inodes_per_group)));
        }
        if sb.s_first_data_block >= sb.s_blocks_count {
            return Err(invalid(format!(
                "first data block {} beyond block count {}",
                sb.s_first_data_block, sb.s_blocks_count
            )));
        }

        let groups_count = (sb.s_blocks_count - sb.s_first_data_block)
            .div_ceil(sb.s_blocks_per_group);
        if groups_count as u64 * sb.s_inodes_per_group as u64 != sb.s_inodes_count as u64 {
            return Err(invalid(format!(
                "inodes count {} does not match {} groups of {}",
                sb.s_inodes_count, groups_count, sb.s_inodes_per_group
            )));
        }
        let desc_per_block = block_size / GROUP_DESC_SIZE as u32;
        let addr_per_block = block_size / 4;

        Ok(Self {
            block_size,
            block_size_bits,
            frag_size: block_size,
            inode_size,
            inodes_per_block,
            blocks_per_group: sb.s_blocks_per_group,
            inodes_per_group: sb.s_inodes_per_group,
            itb_per_group: sb.s_inodes_per_group / inodes_per_block,
            desc_per_block,
            groups_count,
            db_count: groups_count.div_ceil(desc_per_block),
            first_data_block: sb.s_first_data_block,
            blocks_count: sb.s_blocks_count,
            inodes_count: sb.s_inodes_count,
            first_ino: sb.s_first_ino,
            addr_per_block,
            addr_per_block_bits: addr_per_block.trailing_zeros(),
        })
    }

    pub fn group_first_block(&self, group: GroupNumber) -> BlockNumber {
        self.first_data_block + group * self.blocks_per_group
    }

    pub fn group_last_block(&self, group: GroupNumber) -> BlockNumber {
        if group + 1 == self.groups_count {
            self.blocks_count - 1
        } else {
            self.group_first_block(group) + self.blocks_per_group - 1
        }
    }

    /// Blocks actually present in `group` (the last group may be short)
    pub fn blocks_in_group(&self, group: GroupNumber) -> u32 {
        self.group_last_block(group) - self.group_first_block(group) + 1
    }

    pub fn block_group(&self, block: BlockNumber) -> GroupNumber {
        (block - self.first_data_block) / self.blocks_per_group
    }

    pub fn inode_group(&self, ino: InodeNumber) -> GroupNumber {
        (ino - 1) / self.inodes_per_group
    }
}

/// True iff `group` is 0, 1, or an exact power of 3, 5 or 7
pub fn is_group_sparse(group: GroupNumber) -> bool {
    if group <= 1 {
        return true;
    }
    [3u32, 5, 7].iter().any(|&base| is_power_of(group, base))
}

fn is_power_of(mut n: u32, base: u32) -> bool {
    while n % base == 0 {
        n /= base;
    }
    n == 1
}

/// One mounted volume
pub struct Volume {
    cache: BlockCache,
    geometry: VolumeGeometry,
    options: MountOptions,
    sb: Mutex<Ext2Superblock>,
    /// Descriptor table blocks, pinned for the life of the mount
    group_desc: Vec<BlockRef>,
    group_locks: Vec<Mutex<()>>,
    bitmap_checked: Vec<AtomicBool>,
    /// Orlov directory debts, one per group
    debts: Vec<AtomicU8>,
    free_blocks: AtomicU64,
    free_inodes: AtomicU64,
    dirs: AtomicU64,
    next_generation: AtomicU32,
    rng: Mutex<StdRng>,
    resuid: u32,
    resgid: u32,
}

impl Volume {
    /// Mount the volume found on `device`
    pub fn open(device: Arc<dyn BlockDevice>, options: MountOptions) -> Ext2Result<Arc<Self>> {
        options.validate()?;

        let mut raw = vec![0u8; SUPERBLOCK_SIZE];
        device.read_at(SUPERBLOCK_OFFSET, &mut raw)?;
        let mut sb = Ext2Superblock::from_bytes(&raw)?;
        let geometry = VolumeGeometry::from_superblock(&sb)?;

        let needed = geometry.blocks_count as u64 * geometry.block_size as u64;
        if needed > device.size() {
            return Err(invalid(format!(
                "volume needs {} bytes, device has {}",
                needed,
                device.size()
            )));
        }

        let cache = BlockCache::new(device, geometry.block_size, options.cache_capacity);
        let desc_start = geometry.first_data_block + 1;
        let group_desc = (0..geometry.db_count)
            .map(|i| cache.bread(desc_start + i))
            .collect::<Ext2Result<Vec<_>>>()?;

        let mut rng = match options.random_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let next_generation = rng.gen::<u32>();
        let groups = geometry.groups_count as usize;

        let resuid = options.resuid.unwrap_or(sb.s_def_resuid as u32);
        let resgid = options.resgid.unwrap_or(sb.s_def_resgid as u32);

        if sb.s_state & EXT2_VALID_FS == 0 {
            warn!("mounting unchecked volume, running a filesystem check is recommended");
        } else if sb.s_state & EXT2_ERROR_FS != 0 {
            warn!("mounting volume with errors, running a filesystem check is recommended");
        }
        if sb.s_max_mnt_count >= 0 && sb.s_mnt_count >= sb.s_max_mnt_count as u16 {
            warn!("maximal mount count reached, running a filesystem check is recommended");
        }
        sb.s_mnt_count = sb.s_mnt_count.wrapping_add(1);
        sb.s_mtime = now_secs();
        sb.s_state &= !EXT2_VALID_FS;

        let volume = Self {
            cache,
            geometry,
            options,
            sb: Mutex::new(sb),
            group_desc,
            group_locks: (0..groups).map(|_| Mutex::new(())).collect(),
            bitmap_checked: (0..groups).map(|_| AtomicBool::new(false)).collect(),
            debts: (0..groups).map(|_| AtomicU8::new(0)).collect(),
            free_blocks: AtomicU64::new(0),
            free_inodes: AtomicU64::new(0),
            dirs: AtomicU64::new(0),
            next_generation: AtomicU32::new(next_generation),
            rng: Mutex::new(rng),
            resuid,
            resgid,
        };
        volume.check_descriptors()?;

        volume.free_blocks.store(volume.count_free_blocks()?, Ordering::Release);
        volume.free_inodes.store(volume.count_free_inodes()?, Ordering::Release);
        volume.dirs.store(volume.count_dirs()?, Ordering::Release);
        volume.sync_super()?;

        info!(
            "mounted ext2 volume: {} blocks of {} bytes, {} groups, {} free blocks, {} free inodes",
            volume.geometry.blocks_count,
            volume.geometry.block_size,
            volume.geometry.groups_count,
            volume.free_blocks_count(),
            volume.free_inodes_count()
        );
        Ok(Arc::new(volume))
    }

    // Every group's bitmaps and inode table must sit inside the group
    fn check_descriptors(&self) -> Ext2Result<()> {
        let g = &self.geometry;
        for group in 0..g.groups_count {
            let desc = self.group_desc(group)?;
            let first = g.group_first_block(group);
            let last = g.group_last_block(group);
            let in_group = |blk: u32| blk >= first && blk <= last;

            if !in_group(desc.bg_block_bitmap) {
                return Err(invalid(format!(
                    "block bitmap for group {} not in group (block {})",
                    group, desc.bg_block_bitmap
                )));
            }
            if !in_group(desc.bg_inode_bitmap) {
                return Err(invalid(format!(
                    "inode bitmap for group {} not in group (block {})",
                    group, desc.bg_inode_bitmap
                )));
            }
            let table_end = desc.bg_inode_table as u64 + g.itb_per_group as u64 - 1;
            if !in_group(desc.bg_inode_table) || table_end > last as u64 {
                return Err(invalid(format!(
                    "inode table for group {} not in group (block {})",
                    group, desc.bg_inode_table
                )));
            }
        }
        Ok(())
    }

    pub fn geometry(&self) -> &VolumeGeometry {
        &self.geometry
    }

    pub fn options(&self) -> &MountOptions {
        &self.options
    }

    pub fn cache(&self) -> &BlockCache {
        &self.cache
    }

    pub fn block_size(&self) -> u32 {
        self.geometry.block_size
    }

    pub fn groups_count(&self) -> u32 {
        self.geometry.groups_count
    }

    /// Copy of the in-memory superblock
    pub fn superblock(&self) -> Ext2Superblock {
        *self.sb.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn has_incompat(&self, mask: u32) -> bool {
        self.sb
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .has_incompat(mask)
    }

    pub fn has_ro_compat(&self, mask: u32) -> bool {
        self.sb
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .has_ro_compat(mask)
    }

    /// Turn on a read-only compatible feature and write the superblock out
    pub fn set_ro_compat(&self, mask: u32) -> Ext2Result<()> {
        {
            let mut sb = self.sb.lock().unwrap_or_else(PoisonError::into_inner);
            if sb.s_feature_ro_compat & mask == mask {
                return Ok(());
            }
            sb.s_feature_ro_compat |= mask;
        }
        info!("enabling ro-compat feature 0x{:x}", mask);
        self.sync_super()
    }

    pub fn has_filetype(&self) -> bool {
        self.has_incompat(EXT2_FEATURE_INCOMPAT_FILETYPE)
    }

    /// Whether `group` carries a superblock and descriptor table copy
    pub fn has_bg_super(&self, group: GroupNumber) -> bool {
        if self.has_ro_compat(EXT2_FEATURE_RO_COMPAT_SPARSE_SUPER) {
            is_group_sparse(group)
        } else {
            true
        }
    }

    /// Descriptor blocks that follow the superblock copy in `group`
    pub fn bg_num_gdb(&self, group: GroupNumber) -> u32 {
        if self.has_bg_super(group) {
            self.geometry.db_count
        } else {
            0
        }
    }

    pub fn lock_group(&self, group: GroupNumber) -> MutexGuard<'_, ()> {
        self.group_locks[group as usize]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn desc_slot(&self, group: GroupNumber) -> Ext2Result<(&BlockRef, usize)> {
        if group >= self.geometry.groups_count {
            error!(
                "group descriptor: block group {} >= groups count {}",
                group, self.geometry.groups_count
            );
            return Err(corrupted(format!("block group {} out of range", group)));
        }
        let block = (group / self.geometry.desc_per_block) as usize;
        let offset = (group % self.geometry.desc_per_block) as usize * GROUP_DESC_SIZE;
        let bh = self
            .group_desc
            .get(block)
            .ok_or_else(|| corrupted(format!("descriptor block {} not loaded", block)))?;
        Ok((bh, offset))
    }

    pub fn group_desc(&self, group: GroupNumber) -> Ext2Result<Ext2GroupDesc> {
        let (bh, offset) = self.desc_slot(group)?;
        let data = bh.read();
        Ext2GroupDesc::from_bytes(&data[offset..offset + GROUP_DESC_SIZE])
    }

    /// Modify a group descriptor under its group lock and mark it dirty
    pub fn update_group_desc<R>(
        &self,
        group: GroupNumber,
        f: impl FnOnce(&mut Ext2GroupDesc) -> R,
    ) -> Ext2Result<R> {
        let (bh, offset) = self.desc_slot(group)?;
        let _guard = self.lock_group(group);
        let result = {
            let mut data = bh.write();
            let slot = &mut data[offset..offset + GROUP_DESC_SIZE];
            let mut desc = Ext2GroupDesc::from_bytes(&slot[..])?;
            let result = f(&mut desc);
            desc.write_to(slot);
            result
        };
        bh.mark_dirty();
        Ok(result)
    }

    /// Mark a metadata buffer dirty and write it through when `force` is set
    pub fn dirty_buffer(&self, bh: &BlockRef, force: bool) -> Ext2Result<()> {
        bh.mark_dirty();
        if force {
            self.cache.sync_dirty_buffer(bh)?;
        }
        Ok(())
    }

    pub fn read_block_bitmap(&self, group: GroupNumber) -> Ext2Result<Bitmap> {
        let desc = self.group_desc(group)?;
        let first = self.geometry.group_first_block(group);
        let last = self.geometry.group_last_block(group);
        let blk = desc.bg_block_bitmap;
        if blk < first || blk > last {
            error!("block bitmap for group {} outside group (block {})", group, blk);
            return Err(corrupted(format!(
                "cannot read block bitmap: group {}, block {}",
                group, blk
            )));
        }
        let bitmap = Bitmap::new(self.cache.bread(blk)?, self.geometry.blocks_per_group);
        let checked = &self.bitmap_checked[group as usize];
        if !checked.load(Ordering::Acquire) {
            self.validate_block_bitmap(group, &desc, &bitmap)?;
            checked.store(true, Ordering::Release);
        }
        Ok(bitmap)
    }

    // The group's own bitmaps and inode table must be marked in use
    fn validate_block_bitmap(
        &self,
        group: GroupNumber,
        desc: &Ext2GroupDesc,
        bitmap: &Bitmap,
    ) -> Ext2Result<()> {
        let first = self.geometry.group_first_block(group);
        let itb = self.geometry.itb_per_group;
        let bad = if !bitmap.is_set(desc.bg_block_bitmap - first) {
            Some(desc.bg_block_bitmap)
        } else if !bitmap.is_set(desc.bg_inode_bitmap - first) {
            Some(desc.bg_inode_bitmap)
        } else {
            let start = desc.bg_inode_table - first;
            bitmap
                .find_next_zero(start, start + itb)
                .map(|bit| first + bit)
        };
        match bad {
            None => Ok(()),
            Some(block) => {
                error!(
                    "invalid block bitmap for group {}: metadata block {} marked free",
                    group, block
                );
                Err(corrupted(format!(
                    "invalid block bitmap: group {}, block {}",
                    group, block
                )))
            }
        }
    }

    pub fn read_inode_bitmap(&self, group: GroupNumber) -> Ext2Result<Bitmap> {
        let desc = self.group_desc(group)?;
        let blk = desc.bg_inode_bitmap;
        if blk < self.geometry.group_first_block(group) || blk > self.geometry.group_last_block(group) {
            error!("inode bitmap for group {} outside group (block {})", group, blk);
            return Err(corrupted(format!(
                "cannot read inode bitmap: group {}, block {}",
                group, blk
            )));
        }
        Ok(Bitmap::new(self.cache.bread(blk)?, self.geometry.inodes_per_group))
    }

    /// Whether `[start, start + count)` touches metadata of its group
    pub fn in_system_zone(&self, group: GroupNumber, start: BlockNumber, count: u32) -> Ext2Result<bool> {
        let desc = self.group_desc(group)?;
        let end = start as u64 + count as u64;
        let overlaps = |zone_start: u32, zone_len: u32| {
            (zone_start as u64) < end && (start as u64) < zone_start as u64 + zone_len as u64
        };
        let first = self.geometry.group_first_block(group);
        let meta = if self.has_bg_super(group) {
            1 + self.geometry.db_count
        } else {
            0
        };
        Ok(overlaps(first, meta)
            || overlaps(desc.bg_block_bitmap, 1)
            || overlaps(desc.bg_inode_bitmap, 1)
            || overlaps(desc.bg_inode_table, self.geometry.itb_per_group))
    }

    /// Block and byte offset of inode `ino` inside its group's inode table
    pub fn inode_location(&self, ino: InodeNumber) -> Ext2Result<(BlockNumber, usize)> {
        if (ino != EXT2_ROOT_INO && ino < self.geometry.first_ino) || ino > self.geometry.inodes_count {
            error!("bad inode number: {}", ino);
            return Err(corrupted(format!("bad inode number {}", ino)));
        }
        let group = self.geometry.inode_group(ino);
        let desc = self.group_desc(group)?;
        let offset = ((ino - 1) % self.geometry.inodes_per_group) as u64 * self.geometry.inode_size as u64;
        let block = desc.bg_inode_table + (offset >> self.geometry.block_size_bits) as u32;
        Ok((block, (offset & (self.geometry.block_size as u64 - 1)) as usize))
    }

    /// Room left for the caller, keeping the reserved pool for privileged owners
    pub fn has_free_blocks(&self, creds: &dyn HostCredentials) -> bool {
        let free = self.free_blocks_count();
        let reserved = self.superblock().s_r_blocks_count as u64;
        if free < reserved + 1
            && !creds.has_resource_override()
            && self.resuid != creds.fsuid()
            && (self.resgid == 0 || !creds.in_group(self.resgid))
        {
            return false;
        }
        true
    }

    pub fn free_blocks_count(&self) -> u64 {
        self.free_blocks.load(Ordering::Acquire)
    }

    pub fn free_inodes_count(&self) -> u64 {
        self.free_inodes.load(Ordering::Acquire)
    }

    pub fn dirs_count(&self) -> u64 {
        self.dirs.load(Ordering::Acquire)
    }

    pub(crate) fn sub_free_blocks(&self, n: u64) {
        saturating_sub(&self.free_blocks, n);
    }

    pub(crate) fn add_free_blocks(&self, n: u64) {
        self.free_blocks.fetch_add(n, Ordering::AcqRel);
    }

    pub(crate) fn sub_free_inodes(&self, n: u64) {
        saturating_sub(&self.free_inodes, n);
    }

    pub(crate) fn add_free_inodes(&self, n: u64) {
        self.free_inodes.fetch_add(n, Ordering::AcqRel);
    }

    pub(crate) fn inc_dirs(&self) {
        self.dirs.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn dec_dirs(&self) {
        saturating_sub(&self.dirs, 1);
    }

    pub fn debt(&self, group: GroupNumber) -> u32 {
        self.debts[group as usize].load(Ordering::Acquire) as u32
    }

    /// Caller holds the group lock
    pub(crate) fn inc_debt(&self, group: GroupNumber) {
        let debt = &self.debts[group as usize];
        if (debt.load(Ordering::Acquire) as u32) < ORLOV_MAX_DEBT {
            debt.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Caller holds the group lock
    pub(crate) fn dec_debt(&self, group: GroupNumber) {
        let debt = &self.debts[group as usize];
        if debt.load(Ordering::Acquire) > 0 {
            debt.fetch_sub(1, Ordering::AcqRel);
        }
    }

    pub fn random_u32(&self) -> u32 {
        self.rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .gen::<u32>()
    }

    pub fn random_below(&self, bound: u32) -> u32 {
        if bound == 0 {
            return 0;
        }
        self.rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .gen_range(0..bound)
    }

    pub(crate) fn next_generation(&self) -> u32 {
        self.next_generation.fetch_add(1, Ordering::AcqRel)
    }

    pub(crate) fn resuid(&self) -> u32 {
        self.resuid
    }

    pub(crate) fn resgid(&self) -> u32 {
        self.resgid
    }

    pub fn count_free_blocks(&self) -> Ext2Result<u64> {
        let mut total = 0u64;
        for group in 0..self.geometry.groups_count {
            total += self.group_desc(group)?.bg_free_blocks_count as u64;
        }
        Ok(total)
    }

    pub fn count_free_inodes(&self) -> Ext2Result<u64> {
        let mut total = 0u64;
        for group in 0..self.geometry.groups_count {
            total += self.group_desc(group)?.bg_free_inodes_count as u64;
        }
        Ok(total)
    }

    pub fn count_dirs(&self) -> Ext2Result<u64> {
        let mut total = 0u64;
        for group in 0..self.geometry.groups_count {
            total += self.group_desc(group)?.bg_used_dirs_count as u64;
        }
        Ok(total)
    }

    /// Write the counters and the superblock to the device
    pub fn sync_super(&self) -> Ext2Result<()> {
        let raw = {
            let mut sb = self.sb.lock().unwrap_or_else(PoisonError::into_inner);
            sb.s_free_blocks_count = self.free_blocks_count().min(u32::MAX as u64) as u32;
            sb.s_free_inodes_count = self.free_inodes_count().min(u32::MAX as u64) as u32;
            sb.s_wtime = now_secs();
            sb.to_bytes()
        };
        let device = self.cache.device();
        device.write_at(SUPERBLOCK_OFFSET, &raw)?;
        device.flush()?;
        debug!("superblock written");
        Ok(())
    }

    /// Flush every dirty buffer, then the superblock
    pub fn sync(&self) -> Ext2Result<()> {
        self.cache.sync_all()?;
        self.sync_super()
    }

    /// Mark the volume clean and write everything out
    pub fn put_super(&self) -> Ext2Result<()> {
        self.sb
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .s_state |= EXT2_VALID_FS;
        self.sync()?;
        info!("ext2 volume unmounted cleanly");
        Ok(())
    }
}

fn saturating_sub(counter: &AtomicU64, n: u64) {
    let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| Some(v.saturating_sub(n)));
}

impl fmt::Debug for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Volume")
            .field("geometry", &self.geometry)
            .field("free_blocks", &self.free_blocks_count())
            .field("free_inodes", &self.free_inodes_count())
            .finish()
    }
}
