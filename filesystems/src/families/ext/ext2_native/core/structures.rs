// ext2 on-disk structures
// Field offsets must match the on-disk format exactly; all fields are little-endian

use byteorder::{ByteOrder, LittleEndian};
use static_assertions::assert_eq_size;

use super::constants::*;
use super::types::*;

fn check_len(what: &str, buf: &[u8], need: usize) -> Ext2Result<()> {
    if buf.len() < need {
        return Err(corrupted(format!(
            "{} record truncated: {} bytes, need {}",
            what,
            buf.len(),
            need
        )));
    }
    Ok(())
}

fn read_u32_array<const N: usize>(buf: &[u8]) -> [u32; N] {
    let mut out = [0u32; N];
    LittleEndian::read_u32_into(&buf[..N * 4], &mut out);
    out
}

fn write_u32_array(buf: &mut [u8], values: &[u32]) {
    LittleEndian::write_u32_into(values, &mut buf[..values.len() * 4]);
}

/// ext2 superblock (1024 bytes)
/// Located at byte offset 1024 from the beginning of the device
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ext2Superblock {
    /* 0x000 */ pub s_inodes_count: u32,
    /* 0x004 */ pub s_blocks_count: u32,
    /* 0x008 */ pub s_r_blocks_count: u32,       // Reserved for privileged callers
    /* 0x00C */ pub s_free_blocks_count: u32,
    /* 0x010 */ pub s_free_inodes_count: u32,
    /* 0x014 */ pub s_first_data_block: u32,
    /* 0x018 */ pub s_log_block_size: u32,       // Block size = 1024 << s_log_block_size
    /* 0x01C */ pub s_log_frag_size: u32,
    /* 0x020 */ pub s_blocks_per_group: u32,
    /* 0x024 */ pub s_frags_per_group: u32,
    /* 0x028 */ pub s_inodes_per_group: u32,
    /* 0x02C */ pub s_mtime: u32,
    /* 0x030 */ pub s_wtime: u32,
    /* 0x034 */ pub s_mnt_count: u16,
    /* 0x036 */ pub s_max_mnt_count: i16,
    /* 0x038 */ pub s_magic: u16,
    /* 0x03A */ pub s_state: u16,
    /* 0x03C */ pub s_errors: u16,
    /* 0x03E */ pub s_minor_rev_level: u16,
    /* 0x040 */ pub s_lastcheck: u32,
    /* 0x044 */ pub s_checkinterval: u32,
    /* 0x048 */ pub s_creator_os: u32,
    /* 0x04C */ pub s_rev_level: u32,
    /* 0x050 */ pub s_def_resuid: u16,
    /* 0x052 */ pub s_def_resgid: u16,

    // -- Dynamic revision fields --
    /* 0x054 */ pub s_first_ino: u32,
    /* 0x058 */ pub s_inode_size: u16,
    /* 0x05A */ pub s_block_group_nr: u16,       // Group holding this copy
    /* 0x05C */ pub s_feature_compat: u32,
    /* 0x060 */ pub s_feature_incompat: u32,
    /* 0x064 */ pub s_feature_ro_compat: u32,
    /* 0x068 */ pub s_uuid: [u8; 16],
    /* 0x078 */ pub s_volume_name: [u8; 16],
    /* 0x088 */ pub s_last_mounted: [u8; 64],
    /* 0x0C8 */ pub s_algorithm_usage_bitmap: u32,
    /* 0x0CC */ pub s_prealloc_blocks: u8,
    /* 0x0CD */ pub s_prealloc_dir_blocks: u8,
    /* 0x0CE */ pub s_padding1: u16,
    /* 0x0D0 */ pub s_journal_uuid: [u8; 16],
    /* 0x0E0 */ pub s_journal_inum: u32,
    /* 0x0E4 */ pub s_journal_dev: u32,
    /* 0x0E8 */ pub s_last_orphan: u32,
    /* 0x0EC */ pub s_hash_seed: [u32; 4],
    /* 0x0FC */ pub s_def_hash_version: u8,
    /* 0x0FD */ pub s_reserved_char_pad: u8,
    /* 0x0FE */ pub s_reserved_word_pad: u16,
    /* 0x100 */ pub s_default_mount_opts: u32,
    /* 0x104 */ pub s_first_meta_bg: u32,
    /* 0x108 */ pub s_reserved: [u32; 190],
}

assert_eq_size!(Ext2Superblock, [u8; SUPERBLOCK_SIZE]);

impl Default for Ext2Superblock {
    fn default() -> Self {
        Self::decode(&[0u8; SUPERBLOCK_SIZE])
    }
}

impl Ext2Superblock {
    /// Parse from the 1024 bytes starting at SUPERBLOCK_OFFSET
    pub fn from_bytes(buf: &[u8]) -> Ext2Result<Self> {
        check_len("superblock", buf, SUPERBLOCK_SIZE)?;
        Ok(Self::decode(buf))
    }

    fn decode(b: &[u8]) -> Self {
        let mut sb = Self {
            s_inodes_count: LittleEndian::read_u32(&b[0x00..]),
            s_blocks_count: LittleEndian::read_u32(&b[0x04..]),
            s_r_blocks_count: LittleEndian::read_u32(&b[0x08..]),
            s_free_blocks_count: LittleEndian::read_u32(&b[0x0C..]),
            s_free_inodes_count: LittleEndian::read_u32(&b[0x10..]),
            s_first_data_block: LittleEndian::read_u32(&b[0x14..]),
            s_log_block_size: LittleEndian::read_u32(&b[0x18..]),
            s_log_frag_size: LittleEndian::read_u32(&b[0x1C..]),
            s_blocks_per_group: LittleEndian::read_u32(&b[0x20..]),
            s_frags_per_group: LittleEndian::read_u32(&b[0x24..]),
            s_inodes_per_group: LittleEndian::read_u32(&b[0x28..]),
            s_mtime: LittleEndian::read_u32(&b[0x2C..]),
            s_wtime: LittleEndian::read_u32(&b[0x30..]),
            s_mnt_count: LittleEndian::read_u16(&b[0x34..]),
            s_max_mnt_count: LittleEndian::read_i16(&b[0x36..]),
            s_magic: LittleEndian::read_u16(&b[0x38..]),
            s_state: LittleEndian::read_u16(&b[0x3A..]),
            s_errors: LittleEndian::read_u16(&b[0x3C..]),
            s_minor_rev_level: LittleEndian::read_u16(&b[0x3E..]),
            s_lastcheck: LittleEndian::read_u32(&b[0x40..]),
            s_checkinterval: LittleEndian::read_u32(&b[0x44..]),
            s_creator_os: LittleEndian::read_u32(&b[0x48..]),
            s_rev_level: LittleEndian::read_u32(&b[0x4C..]),
            s_def_resuid: LittleEndian::read_u16(&b[0x50..]),
            s_def_resgid: LittleEndian::read_u16(&b[0x52..]),
            s_first_ino: LittleEndian::read_u32(&b[0x54..]),
            s_inode_size: LittleEndian::read_u16(&b[0x58..]),
            s_block_group_nr: LittleEndian::read_u16(&b[0x5A..]),
            s_feature_compat: LittleEndian::read_u32(&b[0x5C..]),
            s_feature_incompat: LittleEndian::read_u32(&b[0x60..]),
            s_feature_ro_compat: LittleEndian::read_u32(&b[0x64..]),
            s_uuid: [0; 16],
            s_volume_name: [0; 16],
            s_last_mounted: [0; 64],
            s_algorithm_usage_bitmap: LittleEndian::read_u32(&b[0xC8..]),
            s_prealloc_blocks: b[0xCC],
            s_prealloc_dir_blocks: b[0xCD],
            s_padding1: LittleEndian::read_u16(&b[0xCE..]),
            s_journal_uuid: [0; 16],
            s_journal_inum: LittleEndian::read_u32(&b[0xE0..]),
            s_journal_dev: LittleEndian::read_u32(&b[0xE4..]),
            s_last_orphan: LittleEndian::read_u32(&b[0xE8..]),
            s_hash_seed: read_u32_array::<4>(&b[0xEC..]),
            s_def_hash_version: b[0xFC],
            s_reserved_char_pad: b[0xFD],
            s_reserved_word_pad: LittleEndian::read_u16(&b[0xFE..]),
            s_default_mount_opts: LittleEndian::read_u32(&b[0x100..]),
            s_first_meta_bg: LittleEndian::read_u32(&b[0x104..]),
            s_reserved: read_u32_array::<190>(&b[0x108..]),
        };
        sb.s_uuid.copy_from_slice(&b[0x68..0x78]);
        sb.s_volume_name.copy_from_slice(&b[0x78..0x88]);
        sb.s_last_mounted.copy_from_slice(&b[0x88..0xC8]);
        sb.s_journal_uuid.copy_from_slice(&b[0xD0..0xE0]);
        sb
    }

    pub fn to_bytes(&self) -> [u8; SUPERBLOCK_SIZE] {
        let mut b = [0u8; SUPERBLOCK_SIZE];
        LittleEndian::write_u32(&mut b[0x00..], self.s_inodes_count);
        LittleEndian::write_u32(&mut b[0x04..], self.s_blocks_count);
        LittleEndian::write_u32(&mut b[0x08..], self.s_r_blocks_count);
        LittleEndian::write_u32(&mut b[0x0C..], self.s_free_blocks_count);
        LittleEndian::write_u32(&mut b[0x10..], self.s_free_inodes_count);
        LittleEndian::write_u32(&mut b[0x14..], self.s_first_data_block);
        LittleEndian::write_u32(&mut b[0x18..], self.s_log_block_size);
        LittleEndian::write_u32(&mut b[0x1C..], self.s_log_frag_size);
        LittleEndian::write_u32(&mut b[0x20..], self.s_blocks_per_group);
        LittleEndian::write_u32(&mut b[0x24..], self.s_frags_per_group);
        LittleEndian::write_u32(&mut b[0x28..], self.s_inodes_per_group);
        LittleEndian::write_u32(&mut b[0x2C..], self.s_mtime);
        LittleEndian::write_u32(&mut b[0x30..], self.s_wtime);
        LittleEndian::write_u16(&mut b[0x34..], self.s_mnt_count);
        LittleEndian::write_i16(&mut b[0x36..], self.s_max_mnt_count);
        LittleEndian::write_u16(&mut b[0x38..], self.s_magic);
        LittleEndian::write_u16(&mut b[0x3A..], self.s_state);
        LittleEndian::write_u16(&mut b[0x3C..], self.s_errors);
        LittleEndian::write_u16(&mut b[0x3E..], self.s_minor_rev_level);
        LittleEndian::write_u32(&mut b[0x40..], self.s_lastcheck);
        LittleEndian::write_u32(&mut b[0x44..], self.s_checkinterval);
        LittleEndian::write_u32(&mut b[0x48..], self.s_creator_os);
        LittleEndian::write_u32(&mut b[0x4C..], self.s_rev_level);
        LittleEndian::write_u16(&mut b[0x50..], self.s_def_resuid);
        LittleEndian::write_u16(&mut b[0x52..], self.s_def_resgid);
        LittleEndian::write_u32(&mut b[0x54..], self.s_first_ino);
        LittleEndian::write_u16(&mut b[0x58..], self.s_inode_size);
        LittleEndian::write_u16(&mut b[0x5A..], self.s_block_group_nr);
        LittleEndian::write_u32(&mut b[0x5C..], self.s_feature_compat);
        LittleEndian::write_u32(&mut b[0x60..], self.s_feature_incompat);
        LittleEndian::write_u32(&mut b[0x64..], self.s_feature_ro_compat);
        b[0x68..0x78].copy_from_slice(&self.s_uuid);
        b[0x78..0x88].copy_from_slice(&self.s_volume_name);
        b[0x88..0xC8].copy_from_slice(&self.s_last_mounted);
        LittleEndian::write_u32(&mut b[0xC8..], self.s_algorithm_usage_bitmap);
        b[0xCC] = self.s_prealloc_blocks;
        b[0xCD] = self.s_prealloc_dir_blocks;
        LittleEndian::write_u16(&mut b[0xCE..], self.s_padding1);
        b[0xD0..0xE0].copy_from_slice(&self.s_journal_uuid);
        LittleEndian::write_u32(&mut b[0xE0..], self.s_journal_inum);
        LittleEndian::write_u32(&mut b[0xE4..], self.s_journal_dev);
        LittleEndian::write_u32(&mut b[0xE8..], self.s_last_orphan);
        write_u32_array(&mut b[0xEC..], &self.s_hash_seed);
        b[0xFC] = self.s_def_hash_version;
        b[0xFD] = self.s_reserved_char_pad;
        LittleEndian::write_u16(&mut b[0xFE..], self.s_reserved_word_pad);
        LittleEndian::write_u32(&mut b[0x100..], self.s_default_mount_opts);
        LittleEndian::write_u32(&mut b[0x104..], self.s_first_meta_bg);
        write_u32_array(&mut b[0x108..], &self.s_reserved);
        b
    }

    pub fn block_size(&self) -> u32 {
        EXT2_MIN_BLOCK_SIZE << self.s_log_block_size
    }

    pub fn has_compat(&self, mask: u32) -> bool {
        self.s_feature_compat & mask != 0
    }

    pub fn has_incompat(&self, mask: u32) -> bool {
        self.s_feature_incompat & mask != 0
    }

    pub fn has_ro_compat(&self, mask: u32) -> bool {
        self.s_feature_ro_compat & mask != 0
    }

    /// Volume label with trailing NULs stripped
    pub fn volume_name(&self) -> String {
        let end = self
            .s_volume_name
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(self.s_volume_name.len());
        String::from_utf8_lossy(&self.s_volume_name[..end]).into_owned()
    }
}

/// ext2 group descriptor (32 bytes)
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ext2GroupDesc {
    /* 0x00 */ pub bg_block_bitmap: u32,
    /* 0x04 */ pub bg_inode_bitmap: u32,
    /* 0x08 */ pub bg_inode_table: u32,
    /* 0x0C */ pub bg_free_blocks_count: u16,
    /* 0x0E */ pub bg_free_inodes_count: u16,
    /* 0x10 */ pub bg_used_dirs_count: u16,
    /* 0x12 */ pub bg_pad: u16,
    /* 0x14 */ pub bg_reserved: [u32; 3],
}

assert_eq_size!(Ext2GroupDesc, [u8; GROUP_DESC_SIZE]);

impl Ext2GroupDesc {
    pub fn from_bytes(b: &[u8]) -> Ext2Result<Self> {
        check_len("group descriptor", b, GROUP_DESC_SIZE)?;
        Ok(Self {
            bg_block_bitmap: LittleEndian::read_u32(&b[0x00..]),
            bg_inode_bitmap: LittleEndian::read_u32(&b[0x04..]),
            bg_inode_table: LittleEndian::read_u32(&b[0x08..]),
            bg_free_blocks_count: LittleEndian::read_u16(&b[0x0C..]),
            bg_free_inodes_count: LittleEndian::read_u16(&b[0x0E..]),
            bg_used_dirs_count: LittleEndian::read_u16(&b[0x10..]),
            bg_pad: LittleEndian::read_u16(&b[0x12..]),
            bg_reserved: read_u32_array::<3>(&b[0x14..]),
        })
    }

    /// Encode into the first 32 bytes of `b`
    pub fn write_to(&self, b: &mut [u8]) {
        LittleEndian::write_u32(&mut b[0x00..], self.bg_block_bitmap);
        LittleEndian::write_u32(&mut b[0x04..], self.bg_inode_bitmap);
        LittleEndian::write_u32(&mut b[0x08..], self.bg_inode_table);
        LittleEndian::write_u16(&mut b[0x0C..], self.bg_free_blocks_count);
        LittleEndian::write_u16(&mut b[0x0E..], self.bg_free_inodes_count);
        LittleEndian::write_u16(&mut b[0x10..], self.bg_used_dirs_count);
        LittleEndian::write_u16(&mut b[0x12..], self.bg_pad);
        write_u32_array(&mut b[0x14..], &self.bg_reserved);
    }
}

/// ext2 inode record (the 128-byte base; larger inode sizes only pad)
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ext2Inode {
    /* 0x00 */ pub i_mode: u16,
    /* 0x02 */ pub i_uid: u16,
    /* 0x04 */ pub i_size: u32,
    /* 0x08 */ pub i_atime: u32,
    /* 0x0C */ pub i_ctime: u32,
    /* 0x10 */ pub i_mtime: u32,
    /* 0x14 */ pub i_dtime: u32,
    /* 0x18 */ pub i_gid: u16,
    /* 0x1A */ pub i_links_count: u16,
    /* 0x1C */ pub i_blocks: u32,                // In 512-byte sectors
    /* 0x20 */ pub i_flags: u32,
    /* 0x24 */ pub i_osd1: u32,
    /* 0x28 */ pub i_block: [u32; EXT2_N_BLOCKS],
    /* 0x64 */ pub i_generation: u32,
    /* 0x68 */ pub i_file_acl: u32,
    /* 0x6C */ pub i_dir_acl: u32,               // High 32 bits of size for regular files
    /* 0x70 */ pub i_faddr: u32,
    /* 0x74 */ pub i_frag: u8,
    /* 0x75 */ pub i_fsize: u8,
    /* 0x76 */ pub i_pad1: u16,
    /* 0x78 */ pub i_uid_high: u16,
    /* 0x7A */ pub i_gid_high: u16,
    /* 0x7C */ pub i_reserved2: u32,
}

assert_eq_size!(Ext2Inode, [u8; EXT2_INODE_RECORD_SIZE]);

impl Ext2Inode {
    pub fn from_bytes(b: &[u8]) -> Ext2Result<Self> {
        check_len("inode", b, EXT2_INODE_RECORD_SIZE)?;
        Ok(Self {
            i_mode: LittleEndian::read_u16(&b[0x00..]),
            i_uid: LittleEndian::read_u16(&b[0x02..]),
            i_size: LittleEndian::read_u32(&b[0x04..]),
            i_atime: LittleEndian::read_u32(&b[0x08..]),
            i_ctime: LittleEndian::read_u32(&b[0x0C..]),
            i_mtime: LittleEndian::read_u32(&b[0x10..]),
            i_dtime: LittleEndian::read_u32(&b[0x14..]),
            i_gid: LittleEndian::read_u16(&b[0x18..]),
            i_links_count: LittleEndian::read_u16(&b[0x1A..]),
            i_blocks: LittleEndian::read_u32(&b[0x1C..]),
            i_flags: LittleEndian::read_u32(&b[0x20..]),
            i_osd1: LittleEndian::read_u32(&b[0x24..]),
            i_block: read_u32_array::<EXT2_N_BLOCKS>(&b[0x28..]),
            i_generation: LittleEndian::read_u32(&b[0x64..]),
            i_file_acl: LittleEndian::read_u32(&b[0x68..]),
            i_dir_acl: LittleEndian::read_u32(&b[0x6C..]),
            i_faddr: LittleEndian::read_u32(&b[0x70..]),
            i_frag: b[0x74],
            i_fsize: b[0x75],
            i_pad1: LittleEndian::read_u16(&b[0x76..]),
            i_uid_high: LittleEndian::read_u16(&b[0x78..]),
            i_gid_high: LittleEndian::read_u16(&b[0x7A..]),
            i_reserved2: LittleEndian::read_u32(&b[0x7C..]),
        })
    }

    /// Encode into the first 128 bytes of `b`; bytes past that are left alone
    pub fn write_to(&self, b: &mut [u8]) {
        LittleEndian::write_u16(&mut b[0x00..], self.i_mode);
        LittleEndian::write_u16(&mut b[0x02..], self.i_uid);
        LittleEndian::write_u32(&mut b[0x04..], self.i_size);
        LittleEndian::write_u32(&mut b[0x08..], self.i_atime);
        LittleEndian::write_u32(&mut b[0x0C..], self.i_ctime);
        LittleEndian::write_u32(&mut b[0x10..], self.i_mtime);
        LittleEndian::write_u32(&mut b[0x14..], self.i_dtime);
        LittleEndian::write_u16(&mut b[0x18..], self.i_gid);
        LittleEndian::write_u16(&mut b[0x1A..], self.i_links_count);
        LittleEndian::write_u32(&mut b[0x1C..], self.i_blocks);
        LittleEndian::write_u32(&mut b[0x20..], self.i_flags);
        LittleEndian::write_u32(&mut b[0x24..], self.i_osd1);
        write_u32_array(&mut b[0x28..], &self.i_block);
        LittleEndian::write_u32(&mut b[0x64..], self.i_generation);
        LittleEndian::write_u32(&mut b[0x68..], self.i_file_acl);
        LittleEndian::write_u32(&mut b[0x6C..], self.i_dir_acl);
        LittleEndian::write_u32(&mut b[0x70..], self.i_faddr);
        b[0x74] = self.i_frag;
        b[0x75] = self.i_fsize;
        LittleEndian::write_u16(&mut b[0x76..], self.i_pad1);
        LittleEndian::write_u16(&mut b[0x78..], self.i_uid_high);
        LittleEndian::write_u16(&mut b[0x7A..], self.i_gid_high);
        LittleEndian::write_u32(&mut b[0x7C..], self.i_reserved2);
    }

    pub fn file_type(&self) -> FileType {
        FileType::from_mode(self.i_mode)
    }

    pub fn uid(&self) -> u32 {
        self.i_uid as u32 | ((self.i_uid_high as u32) << 16)
    }

    pub fn gid(&self) -> u32 {
        self.i_gid as u32 | ((self.i_gid_high as u32) << 16)
    }

    pub fn set_uid(&mut self, uid: u32) {
        self.i_uid = uid as u16;
        self.i_uid_high = (uid >> 16) as u16;
    }

    pub fn set_gid(&mut self, gid: u32) {
        self.i_gid = gid as u16;
        self.i_gid_high = (gid >> 16) as u16;
    }

    /// Full file size; the high half lives in i_dir_acl for regular files only
    pub fn size(&self) -> u64 {
        let mut size = self.i_size as u64;
        if self.file_type() == FileType::Regular {
            size |= (self.i_dir_acl as u64) << 32;
        }
        size
    }

    pub fn set_size(&mut self, size: u64) {
        self.i_size = size as u32;
        if self.file_type() == FileType::Regular {
            self.i_dir_acl = (size >> 32) as u32;
        }
    }
}

/// On-disk form of a directory record length; 65536 is stored as 0xFFFF
pub fn encode_rec_len(len: u32) -> u16 {
    if len >= EXT2_MAX_BLOCK_SIZE {
        u16::MAX
    } else {
        len as u16
    }
}

pub fn decode_rec_len(raw: u16) -> u32 {
    if raw == u16::MAX {
        EXT2_MAX_BLOCK_SIZE
    } else {
        raw as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn superblock_fields_land_at_fixed_offsets() {
        let mut sb = Ext2Superblock::default();
        sb.s_magic = EXT2_SUPER_MAGIC;
        sb.s_inode_size = 256;
        sb.s_first_meta_bg = 0xDEAD_BEEF;
        sb.s_volume_name[..4].copy_from_slice(b"data");

        let raw = sb.to_bytes();
        assert_eq!(&raw[0x38..0x3A], &[0x53, 0xEF]);
        assert_eq!(LittleEndian::read_u16(&raw[0x58..]), 256);
        assert_eq!(LittleEndian::read_u32(&raw[0x104..]), 0xDEAD_BEEF);

        let back = Ext2Superblock::from_bytes(&raw).unwrap();
        assert_eq!(back, sb);
        assert_eq!(back.volume_name(), "data");
    }

    #[test]
    fn group_desc_counts_are_16_bit() {
        let desc = Ext2GroupDesc {
            bg_block_bitmap: 3,
            bg_inode_bitmap: 4,
            bg_inode_table: 5,
            bg_free_blocks_count: 0x1234,
            bg_free_inodes_count: 7,
            bg_used_dirs_count: 2,
            ..Default::default()
        };
        let mut raw = [0u8; GROUP_DESC_SIZE];
        desc.write_to(&mut raw);
        assert_eq!(&raw[0x0C..0x0E], &[0x34, 0x12]);
        assert_eq!(Ext2GroupDesc::from_bytes(&raw).unwrap(), desc);
    }

    #[test]
    fn large_file_size_uses_dir_acl_for_regular_files_only() {
        let mut inode = Ext2Inode {
            i_mode: S_IFREG | 0o644,
            ..Default::default()
        };
        inode.set_size(5 << 32 | 17);
        assert_eq!(inode.i_size, 17);
        assert_eq!(inode.i_dir_acl, 5);
        assert_eq!(inode.size(), 5 << 32 | 17);

        let mut dir = Ext2Inode {
            i_mode: S_IFDIR | 0o755,
            ..Default::default()
        };
        dir.i_dir_acl = 9;
        dir.i_size = 1024;
        assert_eq!(dir.size(), 1024);
    }

    #[test]
    fn inode_block_pointers_start_at_0x28() {
        let mut inode = Ext2Inode::default();
        inode.i_block[0] = 0x0102_0304;
        inode.i_block[EXT2_TIND_BLOCK] = 99;
        inode.set_uid(0x0001_0002);
        let mut raw = [0u8; 256];
        inode.write_to(&mut raw);
        assert_eq!(&raw[0x28..0x2C], &[4, 3, 2, 1]);
        assert_eq!(LittleEndian::read_u32(&raw[0x28 + 14 * 4..]), 99);
        assert_eq!(LittleEndian::read_u16(&raw[0x78..]), 1);
        assert!(raw[128..].iter().all(|b| *b == 0));

        let back = Ext2Inode::from_bytes(&raw).unwrap();
        assert_eq!(back.uid(), 0x0001_0002);
        assert_eq!(back, inode);
    }

    #[test]
    fn rec_len_of_64k_block_survives_16_bits() {
        assert_eq!(encode_rec_len(12), 12);
        assert_eq!(decode_rec_len(encode_rec_len(65536)), 65536);
        assert_eq!(decode_rec_len(65532), 65532);
    }

    #[test]
    fn truncated_buffers_are_rejected() {
        assert!(Ext2Inode::from_bytes(&[0u8; 64]).unwrap_err().is_io());
        assert!(Ext2Superblock::from_bytes(&[0u8; 512]).is_err());
    }
}
