// ext2 on-disk constants
// Values are fixed by the on-disk format and must not change

// Magic numbers
pub const EXT2_SUPER_MAGIC: u16 = 0xEF53;

// Superblock placement
pub const SUPERBLOCK_OFFSET: u64 = 1024;
pub const SUPERBLOCK_SIZE: usize = 1024;

// Block sizes
pub const EXT2_MIN_BLOCK_LOG_SIZE: u32 = 10;
pub const EXT2_MIN_BLOCK_SIZE: u32 = 1 << EXT2_MIN_BLOCK_LOG_SIZE;
pub const EXT2_MAX_BLOCK_LOG_SIZE: u32 = 16;
pub const EXT2_MAX_BLOCK_SIZE: u32 = 1 << EXT2_MAX_BLOCK_LOG_SIZE;

// Revision levels
pub const EXT2_GOOD_OLD_REV: u32 = 0;
pub const EXT2_DYNAMIC_REV: u32 = 1;
pub const EXT2_GOOD_OLD_INODE_SIZE: u16 = 128;
pub const EXT2_GOOD_OLD_FIRST_INO: u32 = 11;

// Special inode numbers
pub const EXT2_BAD_INO: u32 = 1;          // Bad blocks inode
pub const EXT2_ROOT_INO: u32 = 2;         // Root directory inode

// Block pointer layout inside the inode
pub const EXT2_NDIR_BLOCKS: usize = 12;
pub const EXT2_IND_BLOCK: usize = EXT2_NDIR_BLOCKS;
pub const EXT2_DIND_BLOCK: usize = EXT2_IND_BLOCK + 1;
pub const EXT2_TIND_BLOCK: usize = EXT2_DIND_BLOCK + 1;
pub const EXT2_N_BLOCKS: usize = EXT2_TIND_BLOCK + 1;

// On-disk record sizes
pub const GROUP_DESC_SIZE: usize = 32;
pub const EXT2_INODE_RECORD_SIZE: usize = 128;
pub const DIR_ENTRY_HEADER_LEN: usize = 8;
pub const EXT2_NAME_LEN: usize = 255;

// Feature flags - Compatible (recognised, not processed)
pub const EXT2_FEATURE_COMPAT_DIR_PREALLOC: u32 = 0x0001;
pub const EXT2_FEATURE_COMPAT_IMAGIC_INODES: u32 = 0x0002;
pub const EXT2_FEATURE_COMPAT_HAS_JOURNAL: u32 = 0x0004;
pub const EXT2_FEATURE_COMPAT_EXT_ATTR: u32 = 0x0008;
pub const EXT2_FEATURE_COMPAT_RESIZE_INODE: u32 = 0x0010;
pub const EXT2_FEATURE_COMPAT_DIR_INDEX: u32 = 0x0020;

// Feature flags - Incompatible
pub const EXT2_FEATURE_INCOMPAT_COMPRESSION: u32 = 0x0001;
pub const EXT2_FEATURE_INCOMPAT_FILETYPE: u32 = 0x0002;
pub const EXT2_FEATURE_INCOMPAT_RECOVER: u32 = 0x0004;
pub const EXT2_FEATURE_INCOMPAT_JOURNAL_DEV: u32 = 0x0008;
pub const EXT2_FEATURE_INCOMPAT_META_BG: u32 = 0x0010;
pub const EXT2_FEATURE_INCOMPAT_SUPP: u32 = EXT2_FEATURE_INCOMPAT_FILETYPE;

// Feature flags - Read-only compatible
pub const EXT2_FEATURE_RO_COMPAT_SPARSE_SUPER: u32 = 0x0001;
pub const EXT2_FEATURE_RO_COMPAT_LARGE_FILE: u32 = 0x0002;
pub const EXT2_FEATURE_RO_COMPAT_BTREE_DIR: u32 = 0x0004;
pub const EXT2_FEATURE_RO_COMPAT_SUPP: u32 = EXT2_FEATURE_RO_COMPAT_SPARSE_SUPER
    | EXT2_FEATURE_RO_COMPAT_LARGE_FILE
    | EXT2_FEATURE_RO_COMPAT_BTREE_DIR;

// Filesystem states
pub const EXT2_VALID_FS: u16 = 0x0001;    // Cleanly unmounted
pub const EXT2_ERROR_FS: u16 = 0x0002;    // Errors detected

// Error handling behaviours
pub const EXT2_ERRORS_CONTINUE: u16 = 1;
pub const EXT2_ERRORS_RO: u16 = 2;
pub const EXT2_ERRORS_PANIC: u16 = 3;

// Creator OS
pub const EXT2_OS_LINUX: u32 = 0;

// Inode flags
pub const EXT2_SECRM_FL: u32 = 0x0000_0001;
pub const EXT2_UNRM_FL: u32 = 0x0000_0002;
pub const EXT2_COMPR_FL: u32 = 0x0000_0004;
pub const EXT2_SYNC_FL: u32 = 0x0000_0008;
pub const EXT2_IMMUTABLE_FL: u32 = 0x0000_0010;
pub const EXT2_APPEND_FL: u32 = 0x0000_0020;
pub const EXT2_NODUMP_FL: u32 = 0x0000_0040;
pub const EXT2_NOATIME_FL: u32 = 0x0000_0080;
pub const EXT2_COMPRBLK_FL: u32 = 0x0000_0200;
pub const EXT2_NOCOMP_FL: u32 = 0x0000_0400;
pub const EXT2_BTREE_FL: u32 = 0x0000_1000;   // Hash-indexed directory
pub const EXT2_JOURNAL_DATA_FL: u32 = 0x0000_4000;
pub const EXT2_NOTAIL_FL: u32 = 0x0000_8000;
pub const EXT2_DIRSYNC_FL: u32 = 0x0001_0000;
pub const EXT2_TOPDIR_FL: u32 = 0x0002_0000;  // Top of directory hierarchy

/// Flags a new inode copies from its parent directory
pub const EXT2_FL_INHERITED: u32 = EXT2_SECRM_FL
    | EXT2_UNRM_FL
    | EXT2_COMPR_FL
    | EXT2_SYNC_FL
    | EXT2_NODUMP_FL
    | EXT2_NOATIME_FL
    | EXT2_COMPRBLK_FL
    | EXT2_NOCOMP_FL
    | EXT2_JOURNAL_DATA_FL
    | EXT2_NOTAIL_FL
    | EXT2_DIRSYNC_FL;

/// Flags that are meaningful on regular files
pub const EXT2_REG_FLMASK: u32 = !(EXT2_DIRSYNC_FL | EXT2_TOPDIR_FL);

/// Flags that are meaningful on neither files nor directories
pub const EXT2_OTHER_FLMASK: u32 = EXT2_NODUMP_FL | EXT2_NOATIME_FL;

// File mode bits
pub const S_IFMT: u16 = 0o170000;
pub const S_IFSOCK: u16 = 0o140000;
pub const S_IFLNK: u16 = 0o120000;
pub const S_IFREG: u16 = 0o100000;
pub const S_IFBLK: u16 = 0o060000;
pub const S_IFDIR: u16 = 0o040000;
pub const S_IFCHR: u16 = 0o020000;
pub const S_IFIFO: u16 = 0o010000;
pub const S_ISGID: u16 = 0o002000;

// Directory entry file types
pub const EXT2_FT_UNKNOWN: u8 = 0;
pub const EXT2_FT_REG_FILE: u8 = 1;
pub const EXT2_FT_DIR: u8 = 2;
pub const EXT2_FT_CHRDEV: u8 = 3;
pub const EXT2_FT_BLKDEV: u8 = 4;
pub const EXT2_FT_FIFO: u8 = 5;
pub const EXT2_FT_SOCK: u8 = 6;
pub const EXT2_FT_SYMLINK: u8 = 7;

// Link count ceiling
pub const EXT2_LINK_MAX: u16 = 32000;

// Orlov tuning
pub const ORLOV_INODE_COST: u32 = 64;
pub const ORLOV_BLOCK_COST: u32 = 256;
pub const ORLOV_MAX_DEBT: u32 = 255;

// Largest file size representable in the 32-bit size field alone
pub const EXT2_SMALL_FILE_MAX: u64 = 0x7FFF_FFFF;
