// ext2 volume creation
// Lays out groups, writes superblock copies, descriptors, bitmaps, inode tables and the root directory

use log::{debug, info};
use serde::{Deserialize, Serialize};
use strata_core::BlockDevice;

use super::constants::*;
use super::structures::{encode_rec_len, Ext2GroupDesc, Ext2Inode, Ext2Superblock};
use super::types::*;
use super::volume::is_group_sparse;

/// Parameters for a new volume
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FilesystemParams {
    /// Total size in bytes; rounded down to whole blocks
    pub size_bytes: u64,
    pub block_size: u32,
    pub inode_size: u16,
    /// Defaults to one bitmap block's worth (8 * block_size)
    pub blocks_per_group: Option<u32>,
    /// Overrides the bytes_per_inode ratio
    pub inodes_per_group: Option<u32>,
    pub bytes_per_inode: u32,
    pub reserved_percent: u32,
    pub label: Option<String>,
    pub sparse_super: bool,
    /// Store file types in directory records
    pub filetype: bool,
}

impl Default for FilesystemParams {
    fn default() -> Self {
        Self {
            size_bytes: 0,
            block_size: 1024,
            inode_size: 128,
            blocks_per_group: None,
            inodes_per_group: None,
            bytes_per_inode: 4096,
            reserved_percent: 5,
            label: None,
            sparse_super: true,
            filetype: true,
        }
    }
}

/// Computed placement of every group's metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilesystemLayout {
    pub block_size: u32,
    pub inode_size: u32,
    pub first_data_block: u32,
    pub total_blocks: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub groups_count: u32,
    /// Descriptor table blocks
    pub gdt_blocks: u32,
    pub inode_blocks_per_group: u32,
    pub sparse_super: bool,
}

fn bad_params(msg: impl Into<String>) -> StrataError {
    StrataError::InvalidArgument(msg.into())
}

impl FilesystemLayout {
    /// Calculate layout from parameters
    pub fn from_params(params: &FilesystemParams) -> Ext2Result<Self> {
        let bs = params.block_size;
        if !bs.is_power_of_two() || !(EXT2_MIN_BLOCK_SIZE..=EXT2_MAX_BLOCK_SIZE).contains(&bs) {
            return Err(bad_params(format!("block size {} not supported", bs)));
        }
        let inode_size = params.inode_size as u32;
        if !inode_size.is_power_of_two() || inode_size < EXT2_GOOD_OLD_INODE_SIZE as u32 || inode_size > bs {
            return Err(bad_params(format!("inode size {} not supported", inode_size)));
        }
        let bits_per_block = bs * 8;
        let blocks_per_group = params.blocks_per_group.unwrap_or(bits_per_block);
        if blocks_per_group == 0 || blocks_per_group % 8 != 0 || blocks_per_group > bits_per_block {
            return Err(bad_params(format!("blocks per group {}", blocks_per_group)));
        }

        let first_data_block = if bs == EXT2_MIN_BLOCK_SIZE { 1 } else { 0 };
        let total = params.size_bytes / bs as u64;
        if total > u32::MAX as u64 {
            return Err(bad_params("volume too large for 32-bit block numbers"));
        }
        let mut total_blocks = total as u32;

        if total_blocks <= first_data_block {
            return Err(bad_params(format!("device of {} bytes is too small", params.size_bytes)));
        }
        let groups = (total_blocks - first_data_block).div_ceil(blocks_per_group);

        let inodes_per_block = bs / inode_size;
        let mut inodes_per_group = match params.inodes_per_group {
            Some(n) => n,
            None => {
                let ratio = params.bytes_per_inode.max(bs) as u64;
                let total_inodes = total_blocks as u64 * bs as u64 / ratio;
                total_inodes.div_ceil(groups as u64).min(u32::MAX as u64) as u32
            }
        };
        // whole inode-table blocks, room for the reserved inodes, one bitmap block at most
        inodes_per_group = inodes_per_group
            .max(2 * EXT2_GOOD_OLD_FIRST_INO)
            .div_ceil(inodes_per_block)
            .saturating_mul(inodes_per_block)
            .min(bits_per_block);
        let inode_blocks_per_group = inodes_per_group / inodes_per_block;

        let mut layout = Self {
            block_size: bs,
            inode_size,
            first_data_block,
            total_blocks,
            blocks_per_group,
            inodes_per_group,
            groups_count: 0,
            gdt_blocks: 0,
            inode_blocks_per_group,
            sparse_super: params.sparse_super,
        };

        layout.set_groups();

        // A short last group must fit its own metadata plus some data
        let last = layout.groups_count - 1;
        if last > 0 && layout.blocks_in_group(last) < layout.overhead(last) + 50 {
            total_blocks = layout.group_first_block(last);
            layout.total_blocks = total_blocks;
            layout.set_groups();
        }
        // group 0 also holds the root directory block
        if layout.blocks_in_group(0) < layout.overhead(0) + 2 {
            return Err(bad_params(format!("device of {} bytes is too small", params.size_bytes)));
        }
        if layout.groups_count as u64 * inodes_per_group as u64 > u32::MAX as u64 {
            return Err(bad_params("too many inodes"));
        }
        Ok(layout)
    }

    fn set_groups(&mut self) {
        self.groups_count = (self.total_blocks - self.first_data_block).div_ceil(self.blocks_per_group);
        let desc_per_block = self.block_size / GROUP_DESC_SIZE as u32;
        self.gdt_blocks = self.groups_count.div_ceil(desc_per_block);
    }

    pub fn has_superblock(&self, group: GroupNumber) -> bool {
        !self.sparse_super || is_group_sparse(group)
    }

    pub fn group_first_block(&self, group: GroupNumber) -> BlockNumber {
        self.first_data_block + group * self.blocks_per_group
    }

    pub fn blocks_in_group(&self, group: GroupNumber) -> u32 {
        let first = self.group_first_block(group);
        (self.total_blocks - first).min(self.blocks_per_group)
    }

    /// Blocks used by metadata in a group
    pub fn overhead(&self, group: GroupNumber) -> u32 {
        let mut blocks = 2 + self.inode_blocks_per_group;
        if self.has_superblock(group) {
            blocks += 1 + self.gdt_blocks;
        }
        blocks
    }

    pub fn block_bitmap(&self, group: GroupNumber) -> BlockNumber {
        let mut block = self.group_first_block(group);
        if self.has_superblock(group) {
            block += 1 + self.gdt_blocks;
        }
        block
    }

    pub fn inode_bitmap(&self, group: GroupNumber) -> BlockNumber {
        self.block_bitmap(group) + 1
    }

    pub fn inode_table(&self, group: GroupNumber) -> BlockNumber {
        self.block_bitmap(group) + 2
    }

    pub fn inodes_count(&self) -> u32 {
        self.groups_count * self.inodes_per_group
    }
}

fn set_bit(bitmap: &mut [u8], bit: u32) {
    bitmap[(bit / 8) as usize] |= 1 << (bit % 8);
}

fn write_block(device: &dyn BlockDevice, layout: &FilesystemLayout, block: BlockNumber, data: &[u8]) -> Ext2Result<()> {
    device.write_at(block as u64 * layout.block_size as u64, data)?;
    Ok(())
}

/// Write a fresh, empty volume to `device`
pub fn format_device(device: &dyn BlockDevice, params: &FilesystemParams) -> Ext2Result<FilesystemLayout> {
    let layout = FilesystemLayout::from_params(params)?;
    let bs = layout.block_size as usize;
    let needed = layout.total_blocks as u64 * bs as u64;
    if needed > device.size() {
        return Err(bad_params(format!(
            "device has {} bytes, layout needs {}",
            device.size(),
            needed
        )));
    }
    info!(
        "Formatting ext2: {} blocks of {} bytes, {} groups, {} inodes per group",
        layout.total_blocks, layout.block_size, layout.groups_count, layout.inodes_per_group
    );

    let root_block = layout.inode_table(0) + layout.inode_blocks_per_group;
    let reserved_inodes = EXT2_GOOD_OLD_FIRST_INO - 1;

    // Descriptors, bitmaps, and zeroed inode tables, group by group
    let mut descs = Vec::with_capacity(layout.groups_count as usize);
    let zero = vec![0u8; bs];
    for group in 0..layout.groups_count {
        let first = layout.group_first_block(group);
        let in_group = layout.blocks_in_group(group);
        let overhead = layout.overhead(group);

        let mut block_bitmap = vec![0u8; bs];
        for bit in 0..overhead {
            set_bit(&mut block_bitmap, bit);
        }
        for bit in in_group..(bs as u32 * 8) {
            set_bit(&mut block_bitmap, bit);
        }
        let mut inode_bitmap = vec![0u8; bs];
        for bit in layout.inodes_per_group..(bs as u32 * 8) {
            set_bit(&mut inode_bitmap, bit);
        }

        let mut free_blocks = in_group - overhead;
        let mut free_inodes = layout.inodes_per_group;
        let mut used_dirs = 0;
        if group == 0 {
            set_bit(&mut block_bitmap, root_block - first);
            free_blocks -= 1;
            for bit in 0..reserved_inodes {
                set_bit(&mut inode_bitmap, bit);
            }
            free_inodes -= reserved_inodes;
            used_dirs = 1;
        }

        write_block(device, &layout, layout.block_bitmap(group), &block_bitmap)?;
        write_block(device, &layout, layout.inode_bitmap(group), &inode_bitmap)?;
        for i in 0..layout.inode_blocks_per_group {
            write_block(device, &layout, layout.inode_table(group) + i, &zero)?;
        }

        descs.push(Ext2GroupDesc {
            bg_block_bitmap: layout.block_bitmap(group),
            bg_inode_bitmap: layout.inode_bitmap(group),
            bg_inode_table: layout.inode_table(group),
            bg_free_blocks_count: free_blocks as u16,
            bg_free_inodes_count: free_inodes as u16,
            bg_used_dirs_count: used_dirs,
            ..Default::default()
        });
        debug!("group {}: {} free blocks, {} free inodes", group, free_blocks, free_inodes);
    }

    // Root directory inode and its single block
    let now = now_secs();
    let mut root = Ext2Inode {
        i_mode: S_IFDIR | 0o755,
        i_size: layout.block_size,
        i_atime: now,
        i_ctime: now,
        i_mtime: now,
        i_links_count: 2,
        i_blocks: layout.block_size / 512,
        ..Default::default()
    };
    root.i_block[0] = root_block;
    let root_offset = (EXT2_ROOT_INO - 1) as u64 * layout.inode_size as u64;
    let mut table_block = vec![0u8; bs];
    root.write_to(&mut table_block[(root_offset as usize % bs)..]);
    write_block(device, &layout, layout.inode_table(0) + (root_offset / bs as u64) as u32, &table_block)?;

    let dir_type = if params.filetype { EXT2_FT_DIR } else { EXT2_FT_UNKNOWN };
    let mut dir_block = vec![0u8; bs];
    dir_block[0..4].copy_from_slice(&EXT2_ROOT_INO.to_le_bytes());
    dir_block[4..6].copy_from_slice(&12u16.to_le_bytes());
    dir_block[6] = 1;
    dir_block[7] = dir_type;
    dir_block[8] = b'.';
    dir_block[12..16].copy_from_slice(&EXT2_ROOT_INO.to_le_bytes());
    dir_block[16..18].copy_from_slice(&encode_rec_len(layout.block_size - 12).to_le_bytes());
    dir_block[18] = 2;
    dir_block[19] = dir_type;
    dir_block[20..22].copy_from_slice(b"..");
    write_block(device, &layout, root_block, &dir_block)?;

    // Superblock
    let free_blocks: u32 = descs.iter().map(|d| d.bg_free_blocks_count as u32).sum();
    let free_inodes: u32 = descs.iter().map(|d| d.bg_free_inodes_count as u32).sum();
    let mut sb = Ext2Superblock {
        s_inodes_count: layout.inodes_count(),
        s_blocks_count: layout.total_blocks,
        s_r_blocks_count: (layout.total_blocks as u64 * params.reserved_percent as u64 / 100) as u32,
        s_free_blocks_count: free_blocks,
        s_free_inodes_count: free_inodes,
        s_first_data_block: layout.first_data_block,
        s_log_block_size: layout.block_size.trailing_zeros() - EXT2_MIN_BLOCK_LOG_SIZE,
        s_log_frag_size: layout.block_size.trailing_zeros() - EXT2_MIN_BLOCK_LOG_SIZE,
        s_blocks_per_group: layout.blocks_per_group,
        s_frags_per_group: layout.blocks_per_group,
        s_inodes_per_group: layout.inodes_per_group,
        s_wtime: now,
        s_max_mnt_count: -1,
        s_magic: EXT2_SUPER_MAGIC,
        s_state: EXT2_VALID_FS,
        s_errors: EXT2_ERRORS_CONTINUE,
        s_lastcheck: now,
        s_creator_os: EXT2_OS_LINUX,
        s_rev_level: EXT2_DYNAMIC_REV,
        s_first_ino: EXT2_GOOD_OLD_FIRST_INO,
        s_inode_size: layout.inode_size as u16,
        ..Default::default()
    };
    if params.sparse_super {
        sb.s_feature_ro_compat |= EXT2_FEATURE_RO_COMPAT_SPARSE_SUPER;
    }
    if params.filetype {
        sb.s_feature_incompat |= EXT2_FEATURE_INCOMPAT_FILETYPE;
    }
    sb.s_uuid = *uuid::Uuid::new_v4().as_bytes();
    if let Some(label) = &params.label {
        let len = label.len().min(sb.s_volume_name.len());
        sb.s_volume_name[..len].copy_from_slice(&label.as_bytes()[..len]);
    }

    let mut gdt = vec![0u8; layout.gdt_blocks as usize * bs];
    for (i, desc) in descs.iter().enumerate() {
        desc.write_to(&mut gdt[i * GROUP_DESC_SIZE..]);
    }

    for group in (0..layout.groups_count).filter(|g| layout.has_superblock(*g)) {
        sb.s_block_group_nr = group as u16;
        let sb_offset = if group == 0 {
            SUPERBLOCK_OFFSET
        } else {
            layout.group_first_block(group) as u64 * bs as u64
        };
        device.write_at(sb_offset, &sb.to_bytes())?;
        write_block(device, &layout, layout.group_first_block(group) + 1, &gdt)?;
    }
    device.flush()?;

    info!("ext2 format complete: {} free blocks, {} free inodes", free_blocks, free_inodes);
    Ok(layout)
}
