// Native ext2 implementation
// Block-group volume engine: allocators, indirect block mapping and linear directories

pub mod core;
pub mod writer;

pub use self::core::{
    format_device, Credentials, Ext2Result, FileType, FilesystemLayout, FilesystemParams,
    HostCredentials, Volume,
};
pub use writer::{BlockMapping, DirEntry, Ext2Fs, FsStats};
