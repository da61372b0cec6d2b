// Core ext2 implementation modules

pub mod bitmap;
pub mod block_allocator;
pub mod block_cache;
pub mod constants;
pub mod formatter;
pub mod inode;
pub mod inode_allocator;
pub mod structures;
pub mod types;
pub mod volume;

#[cfg(test)]
pub mod tests;

// Re-export commonly used items
pub use block_allocator::BlockAllocator;
pub use block_cache::{BlockCache, BlockRef};
pub use constants::*;
pub use formatter::{format_device, FilesystemLayout, FilesystemParams};
pub use inode::{Ext2InodeInfo, InodeCache, InodeState};
pub use inode_allocator::InodeAllocator;
pub use types::*;
pub use volume::{is_group_sparse, Volume, VolumeGeometry};
