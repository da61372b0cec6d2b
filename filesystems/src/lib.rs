// Filesystem families organization
pub mod families;

#[cfg(test)]
pub mod test_helpers;

// Native ext2 engine
pub use families::ext::ext2_native::{
    format_device, BlockMapping, Credentials, DirEntry, Ext2Fs, Ext2Result, FileType,
    FilesystemLayout, FilesystemParams, FsStats, HostCredentials, Volume,
};
pub use strata_core::{BlockDevice, FileDevice, MemoryDevice, MountOptions, StrataError};
