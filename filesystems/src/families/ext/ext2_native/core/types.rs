// Common types used throughout the ext2 implementation

use super::constants::*;
pub use strata_core::StrataError;

/// Result type for ext2 operations
pub type Ext2Result<T> = Result<T, StrataError>;

/// Block number type (32-bit on disk for ext2)
pub type BlockNumber = u32;

/// Inode number type
pub type InodeNumber = u32;

/// Group number type
pub type GroupNumber = u32;

/// Build the error used for corrupt or inconsistent on-disk structures
pub(crate) fn corrupted(msg: impl Into<String>) -> StrataError {
    StrataError::Io(msg.into())
}

/// Current time in seconds, truncated to the 32-bit on-disk field
pub(crate) fn now_secs() -> u32 {
    chrono::Utc::now().timestamp().max(0) as u32
}

/// File kind derived from the mode bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Unknown,
    Regular,
    Directory,
    CharDevice,
    BlockDevice,
    Fifo,
    Socket,
    Symlink,
}

impl FileType {
    pub fn from_mode(mode: u16) -> Self {
        match mode & S_IFMT {
            S_IFREG => FileType::Regular,
            S_IFDIR => FileType::Directory,
            S_IFCHR => FileType::CharDevice,
            S_IFBLK => FileType::BlockDevice,
            S_IFIFO => FileType::Fifo,
            S_IFSOCK => FileType::Socket,
            S_IFLNK => FileType::Symlink,
            _ => FileType::Unknown,
        }
    }

    /// Tag stored in a directory record's file_type byte
    pub fn dirent_tag(self) -> u8 {
        match self {
            FileType::Unknown => EXT2_FT_UNKNOWN,
            FileType::Regular => EXT2_FT_REG_FILE,
            FileType::Directory => EXT2_FT_DIR,
            FileType::CharDevice => EXT2_FT_CHRDEV,
            FileType::BlockDevice => EXT2_FT_BLKDEV,
            FileType::Fifo => EXT2_FT_FIFO,
            FileType::Socket => EXT2_FT_SOCK,
            FileType::Symlink => EXT2_FT_SYMLINK,
        }
    }

    pub fn from_dirent_tag(tag: u8) -> Self {
        match tag {
            EXT2_FT_REG_FILE => FileType::Regular,
            EXT2_FT_DIR => FileType::Directory,
            EXT2_FT_CHRDEV => FileType::CharDevice,
            EXT2_FT_BLKDEV => FileType::BlockDevice,
            EXT2_FT_FIFO => FileType::Fifo,
            EXT2_FT_SOCK => FileType::Socket,
            EXT2_FT_SYMLINK => FileType::Symlink,
            _ => FileType::Unknown,
        }
    }

    pub fn is_dir(self) -> bool {
        self == FileType::Directory
    }
}

/// Identity and privilege of the caller, as supplied by the host
pub trait HostCredentials: Send + Sync {
    /// Caller may dip into the reserved block pool
    fn has_resource_override(&self) -> bool;
    fn fsuid(&self) -> u32;
    fn fsgid(&self) -> u32;
    /// Caller is a member of `gid` (primary or supplementary)
    fn in_group(&self, gid: u32) -> bool;
}

/// Plain credentials value for hosts without their own credential objects
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
    pub groups: Vec<u32>,
    pub resource_override: bool,
}

impl Credentials {
    pub fn root() -> Self {
        Self {
            uid: 0,
            gid: 0,
            groups: Vec::new(),
            resource_override: true,
        }
    }

    pub fn user(uid: u32, gid: u32) -> Self {
        Self {
            uid,
            gid,
            groups: Vec::new(),
            resource_override: false,
        }
    }
}

impl HostCredentials for Credentials {
    fn has_resource_override(&self) -> bool {
        self.resource_override
    }

    fn fsuid(&self) -> u32 {
        self.uid
    }

    fn fsgid(&self) -> u32 {
        self.gid
    }

    fn in_group(&self, gid: u32) -> bool {
        self.gid == gid || self.groups.contains(&gid)
    }
}
