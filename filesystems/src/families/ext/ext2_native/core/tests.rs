// Scenario tests for the ext2 allocators and volume metadata

use std::collections::HashSet;
use std::sync::Arc;
use strata_core::{BlockDevice, MountOptions};

use super::*;
use crate::families::ext::ext2_native::Ext2Fs;
use crate::test_helpers::{formatted_device, mount_fresh, multi_group_params, small_params};

fn open(params: &FilesystemParams, options: MountOptions) -> Arc<Volume> {
    let device: Arc<dyn BlockDevice> = formatted_device(params);
    Volume::open(device, options).unwrap()
}

fn seeded() -> MountOptions {
    MountOptions {
        random_seed: Some(42),
        ..Default::default()
    }
}

#[test]
fn four_block_run_inside_group_zero() {
    let volume = open(&small_params(), seeded());
    assert_eq!(volume.geometry().blocks_per_group, 8192);
    let allocator = BlockAllocator::new(Arc::clone(&volume));

    let free_before = volume.free_blocks_count();
    let desc_before = volume.group_desc(0).unwrap().bg_free_blocks_count;
    let goal = volume.geometry().group_first_block(0) + 1000;

    let (block, count) = allocator.allocate(12, goal, 4, &Credentials::root()).unwrap();
    assert_eq!((block, count), (goal, 4));

    let bitmap = volume.read_block_bitmap(0).unwrap();
    let first_bit = block - volume.geometry().first_data_block;
    for bit in first_bit..first_bit + 4 {
        assert!(bitmap.is_set(bit));
    }
    assert!(!bitmap.is_set(first_bit + 4));
    assert!(bitmap.block().is_dirty());
    assert_eq!(volume.free_blocks_count(), free_before - 4);
    assert_eq!(volume.group_desc(0).unwrap().bg_free_blocks_count, desc_before - 4);
}

#[test]
fn run_stops_at_used_block_and_group_end() {
    let volume = open(&small_params(), seeded());
    let allocator = BlockAllocator::new(Arc::clone(&volume));
    let root = Credentials::root();
    let g = volume.geometry().clone();

    let goal = g.group_first_block(0) + 2000;
    allocator.allocate(12, goal + 2, 1, &root).unwrap();
    let (block, count) = allocator.allocate(12, goal, 8, &root).unwrap();
    assert_eq!((block, count), (goal, 2));

    // the scan never goes back to the start of the group
    let last = g.group_last_block(0);
    assert_eq!(allocator.allocate(12, last, 4, &root).unwrap(), (last, 1));
    let free_before = volume.free_blocks_count();
    let err = allocator.allocate(12, last, 1, &root).unwrap_err();
    assert!(matches!(err, StrataError::NoSpace(_)));
    assert_eq!(volume.free_blocks_count(), free_before);
    assert_eq!(volume.count_free_blocks().unwrap(), free_before);
}

#[test]
fn freed_blocks_return_to_the_pool() {
    let volume = open(&small_params(), seeded());
    let allocator = BlockAllocator::new(Arc::clone(&volume));
    let free_before = volume.free_blocks_count();

    let (block, count) = allocator
        .allocate(12, volume.geometry().group_first_block(0) + 3000, 16, &Credentials::root())
        .unwrap();
    allocator.free_blocks(block, count).unwrap();
    assert_eq!(volume.free_blocks_count(), free_before);

    // a second free of the same range changes nothing
    allocator.free_blocks(block, count).unwrap();
    assert_eq!(volume.free_blocks_count(), free_before);
    assert_eq!(volume.count_free_blocks().unwrap(), free_before);

    // metadata is never handed back
    let table = volume.group_desc(0).unwrap().bg_inode_table;
    assert!(allocator.free_blocks(table, 1).unwrap_err().is_io());
    assert!(allocator.free_blocks(0, 1).unwrap_err().is_io());
}

#[test]
fn system_zone_hits_are_refused() {
    let volume = open(&small_params(), seeded());
    let allocator = BlockAllocator::new(Arc::clone(&volume));
    let desc = volume.group_desc(0).unwrap();

    // a bitmap that forgot about the inode table
    let bitmap = volume.read_block_bitmap(0).unwrap();
    let bit = desc.bg_inode_table - volume.geometry().first_data_block;
    assert!(bitmap.test_and_clear(bit));

    let free_before = volume.free_blocks_count();
    let err = allocator
        .allocate(12, desc.bg_inode_table, 1, &Credentials::root())
        .unwrap_err();
    assert!(matches!(err, StrataError::NoSpace(_)));
    assert_eq!(volume.free_blocks_count(), free_before);
}

#[test]
fn bitmap_missing_metadata_is_corruption_on_first_load() {
    let params = small_params();
    let device = formatted_device(&params);
    let layout = FilesystemLayout::from_params(&params).unwrap();

    // clear the inode-table bits in group 0's block bitmap
    let bs = layout.block_size as u64;
    let bitmap_at = layout.block_bitmap(0) as u64 * bs;
    let first_bit = (layout.inode_table(0) - layout.first_data_block) as u64;
    let byte = bitmap_at + first_bit / 8 + 1;
    device.write_at(byte, &[0u8; 4]).unwrap();

    let volume = Volume::open(device, seeded()).unwrap();
    let err = volume.read_block_bitmap(0).unwrap_err();
    assert!(err.is_io());
}

#[test]
fn reserved_blocks_need_privilege() {
    let volume = open(&small_params(), seeded());
    let allocator = BlockAllocator::new(Arc::clone(&volume));
    let reserved = volume.superblock().s_r_blocks_count as u64;
    assert!(reserved > 0);

    volume.sub_free_blocks(volume.free_blocks_count() - reserved);
    let goal = volume.geometry().group_first_block(0) + 4000;
    let user = Credentials::user(1000, 1000);
    let err = allocator.allocate(12, goal, 1, &user).unwrap_err();
    assert!(matches!(err, StrataError::NoSpace(_)));
    assert!(allocator.allocate(12, goal, 1, &Credentials::root()).is_ok());

    let options = MountOptions {
        resuid: Some(1000),
        ..seeded()
    };
    let volume = open(&small_params(), options);
    let allocator = BlockAllocator::new(Arc::clone(&volume));
    volume.sub_free_blocks(volume.free_blocks_count() - reserved);
    assert!(allocator.allocate(12, goal, 1, &user).is_ok());
}

#[test]
fn counters_match_descriptor_sums() {
    let volume = open(&multi_group_params(), seeded());
    assert!(volume.groups_count() > 1);
    assert_eq!(volume.free_blocks_count(), volume.count_free_blocks().unwrap());
    assert_eq!(volume.free_inodes_count(), volume.count_free_inodes().unwrap());
    assert_eq!(volume.dirs_count(), 1);
    for group in 0..volume.groups_count() {
        let bitmap = volume.read_block_bitmap(group).unwrap();
        let desc = volume.group_desc(group).unwrap();
        let limit = volume.geometry().blocks_in_group(group);
        assert_eq!(bitmap.count_free(limit), desc.bg_free_blocks_count as u32);
    }
}

#[test]
fn first_inode_follows_reserved_range() {
    let fs = mount_fresh(&small_params(), seeded());
    let root = fs.root().unwrap();
    let volume = fs.volume();
    let free_before = volume.free_inodes_count();

    let inode = fs
        .inode_allocator()
        .allocate(&root, S_IFREG | 0o644, &Credentials::user(1000, 100))
        .unwrap();
    assert_eq!(inode.ino(), EXT2_GOOD_OLD_FIRST_INO);
    assert_eq!(inode.state(), InodeState::New);
    assert_eq!(inode.to_disk().uid(), 1000);
    assert_eq!(inode.gid(), 100);
    assert_eq!(volume.free_inodes_count(), free_before - 1);

    fs.inode_allocator().free(inode.ino(), false).unwrap();
    assert_eq!(volume.free_inodes_count(), free_before);
    assert!(fs.inode_allocator().free(inode.ino(), false).unwrap_err().is_io());
    assert!(fs.inode_allocator().free(5, false).unwrap_err().is_io());
}

#[test]
fn setgid_directories_pass_on_their_group() {
    let fs = mount_fresh(&small_params(), seeded());
    let root = fs.root().unwrap();
    let shared = fs.mkdir(&root, "shared", 0o775).unwrap();
    shared.update(|raw| {
        raw.i_mode |= S_ISGID;
        raw.set_gid(500);
    });

    let creds = Credentials::user(1000, 100);
    let file = fs.inode_allocator().allocate(&shared, S_IFREG | 0o644, &creds).unwrap();
    assert_eq!(file.gid(), 500);
    assert_eq!(file.mode() & S_ISGID, 0);

    let dir = fs.inode_allocator().allocate(&shared, S_IFDIR | 0o755, &creds).unwrap();
    assert_eq!(dir.gid(), 500);
    assert_ne!(dir.mode() & S_ISGID, 0);

    let plain = fs.inode_allocator().allocate(&root, S_IFREG | 0o644, &creds).unwrap();
    assert_eq!(plain.gid(), 100);
}

#[test]
fn orlov_spreads_top_level_directories() {
    let fs = mount_fresh(&multi_group_params(), seeded());
    let root = fs.root().unwrap();

    let dirs: Vec<_> = (0..8)
        .map(|i| fs.mkdir(&root, &format!("top{}", i), 0o755).unwrap())
        .collect();
    let groups: HashSet<GroupNumber> = dirs.iter().map(|d| d.block_group()).collect();
    assert!(groups.len() >= 6, "top-level directories landed in {:?}", groups);

    // below the top level, children stay with their parent
    let parent = &dirs[0];
    let child = fs.mkdir(parent, "child", 0o755).unwrap();
    assert_eq!(child.block_group(), parent.block_group());
    let file = fs.create(parent, "file", 0o644).unwrap();
    assert_eq!(file.block_group(), parent.block_group());

    // a directory's first block lives in its own group
    let blk = fs.bmap(&child, 0).unwrap().unwrap();
    assert_eq!(fs.volume().geometry().block_group(blk), child.block_group());
}

#[test]
fn old_alloc_prefers_most_free_blocks() {
    let options = MountOptions {
        old_alloc: true,
        ..seeded()
    };
    let fs = mount_fresh(&multi_group_params(), options);
    let root = fs.root().unwrap();
    let dir = fs.mkdir(&root, "d", 0o755).unwrap();

    let volume = fs.volume();
    let chosen = volume.group_desc(dir.block_group()).unwrap().bg_free_blocks_count;
    // one block went to the new directory itself
    for group in 0..volume.groups_count() {
        assert!(volume.group_desc(group).unwrap().bg_free_blocks_count <= chosen + 1);
    }
}

#[test]
fn directory_debt_rises_and_falls() {
    let fs = mount_fresh(&small_params(), seeded());
    let root = fs.root().unwrap();
    let volume = fs.volume();
    assert_eq!(volume.debt(0), 0);

    fs.mkdir(&root, "a", 0o755).unwrap();
    fs.mkdir(&root, "b", 0o755).unwrap();
    assert_eq!(volume.debt(0), 2);
    fs.create(&root, "f", 0o644).unwrap();
    assert_eq!(volume.debt(0), 1);
    assert_eq!(volume.dirs_count(), 3);
    assert_eq!(volume.group_desc(0).unwrap().bg_used_dirs_count, 3);
}

#[test]
fn inode_table_survives_remount() {
    let params = small_params();
    let device = formatted_device(&params);
    let dyn_device: Arc<dyn BlockDevice> = device.clone();
    let fs = Ext2Fs::mount(Arc::clone(&dyn_device), seeded()).unwrap();
    let root = fs.root().unwrap();
    let file = fs.create(&root, "kept", 0o600).unwrap();
    fs.write_at(&file, 0, b"persistent").unwrap();
    let ino = file.ino();
    fs.unmount().unwrap();

    let fs = Ext2Fs::mount(dyn_device, seeded()).unwrap();
    assert!(fs.volume().superblock().s_mnt_count >= 2);
    let root = fs.root().unwrap();
    let file = fs.lookup(&root, "kept").unwrap();
    assert_eq!(file.ino(), ino);
    assert_eq!(file.mode() & 0o7777, 0o600);
    let mut buf = [0u8; 10];
    fs.read_at(&file, 0, &mut buf).unwrap();
    assert_eq!(&buf, b"persistent");
}
