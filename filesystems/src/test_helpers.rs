// Test helpers for filesystem testing

use std::sync::Arc;
use strata_core::{BlockDevice, MemoryDevice, MountOptions};

use crate::families::ext::ext2_native::core::{format_device, FilesystemParams};
use crate::families::ext::ext2_native::Ext2Fs;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// 8 MiB, 1 KiB blocks: a single 8192-block group
pub fn small_params() -> FilesystemParams {
    FilesystemParams {
        size_bytes: 8 * 1024 * 1024,
        ..Default::default()
    }
}

/// 16 MiB in groups of 1024 blocks
pub fn multi_group_params() -> FilesystemParams {
    FilesystemParams {
        size_bytes: 16 * 1024 * 1024,
        blocks_per_group: Some(1024),
        inodes_per_group: Some(128),
        ..Default::default()
    }
}

/// Format an in-memory device
pub fn formatted_device(params: &FilesystemParams) -> Arc<MemoryDevice> {
    init_logging();
    let device = Arc::new(MemoryDevice::new(params.size_bytes));
    format_device(device.as_ref(), params).unwrap();
    device
}

/// Format an in-memory device and mount it with a fixed seed
pub fn mount_fresh(params: &FilesystemParams, mut options: MountOptions) -> Ext2Fs {
    if options.random_seed.is_none() {
        options.random_seed = Some(0x5eed);
    }
    let device: Arc<dyn BlockDevice> = formatted_device(params);
    Ext2Fs::mount(device, options).unwrap()
}
