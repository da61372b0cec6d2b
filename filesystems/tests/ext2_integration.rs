// Integration tests for the ext2 engine
// Whole-volume scenarios against memory, file-backed and fault-injecting devices

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use strata_core::test_utils::FaultyDevice;
use strata_core::{BlockDevice, FileDevice, MemoryDevice, MountOptions, StrataError};
use strata_filesystems::families::ext::ext2_native::core::EXT2_FEATURE_RO_COMPAT_LARGE_FILE;
use strata_filesystems::{format_device, Credentials, Ext2Fs, FileType, FilesystemLayout, FilesystemParams};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn params(size_mb: u64) -> FilesystemParams {
    FilesystemParams {
        size_bytes: size_mb * 1024 * 1024,
        ..Default::default()
    }
}

fn options() -> MountOptions {
    MountOptions {
        random_seed: Some(1234),
        ..Default::default()
    }
}

fn fresh(size_mb: u64) -> Ext2Fs {
    init_logging();
    let p = params(size_mb);
    let device = Arc::new(MemoryDevice::new(p.size_bytes));
    format_device(device.as_ref(), &p).unwrap();
    Ext2Fs::mount(device, options()).unwrap()
}

#[cfg(test)]
mod namespace_tests {
    use super::*;

    #[test]
    fn test_tree_building_and_listing() {
        let fs = fresh(8);
        let root = fs.root().unwrap();
        let docs = fs.mkdir(&root, "docs", 0o755).unwrap();
        fs.create(&docs, "readme.txt", 0o644).unwrap();
        fs.create(&docs, "notes.txt", 0o644).unwrap();
        fs.mkdir(&docs, "drafts", 0o700).unwrap();

        let mut names: Vec<_> = fs
            .read_dir(&docs)
            .unwrap()
            .into_iter()
            .map(|e| (e.name, e.file_type))
            .collect();
        names.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            names,
            vec![
                (".".to_string(), FileType::Directory),
                ("..".to_string(), FileType::Directory),
                ("drafts".to_string(), FileType::Directory),
                ("notes.txt".to_string(), FileType::Regular),
                ("readme.txt".to_string(), FileType::Regular),
            ]
        );
        assert_eq!(docs.links_count(), 3);
        assert_eq!(root.links_count(), 3);
    }

    #[test]
    fn test_duplicate_and_bad_names() {
        let fs = fresh(8);
        let root = fs.root().unwrap();
        fs.create(&root, "a", 0o644).unwrap();

        assert!(matches!(fs.create(&root, "a", 0o644), Err(StrataError::AlreadyExists(_))));
        assert!(matches!(fs.mkdir(&root, "a", 0o755), Err(StrataError::AlreadyExists(_))));
        assert!(matches!(fs.create(&root, "", 0o644), Err(StrataError::InvalidArgument(_))));
        assert!(matches!(fs.create(&root, "x/y", 0o644), Err(StrataError::InvalidArgument(_))));
        let long = "n".repeat(256);
        assert!(matches!(fs.create(&root, &long, 0o644), Err(StrataError::NameTooLong(_))));
        let max = "m".repeat(255);
        assert!(fs.create(&root, &max, 0o644).is_ok());
        assert!(matches!(fs.lookup(&root, "missing"), Err(StrataError::NotFound(_))));
    }

    #[test]
    fn test_hard_links_and_unlink() {
        let fs = fresh(8);
        let root = fs.root().unwrap();
        let dir = fs.mkdir(&root, "d", 0o755).unwrap();
        let file = fs.create(&root, "orig", 0o644).unwrap();
        fs.write_at(&file, 0, b"shared data").unwrap();

        fs.link(&file, &dir, "alias").unwrap();
        assert_eq!(file.links_count(), 2);
        let alias = fs.lookup(&dir, "alias").unwrap();
        assert_eq!(alias.ino(), file.ino());

        fs.unlink(&root, "orig").unwrap();
        assert_eq!(file.links_count(), 1);
        assert!(fs.lookup(&root, "orig").is_err());
        let mut buf = [0u8; 11];
        fs.read_at(&alias, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"shared data");

        assert!(matches!(fs.unlink(&root, "d"), Err(StrataError::InvalidArgument(_))));
        assert!(matches!(fs.link(&dir, &root, "dirlink"), Err(StrataError::InvalidArgument(_))));
    }

    #[test]
    fn test_rename_replaces_target() {
        let fs = fresh(8);
        let root = fs.root().unwrap();
        let a = fs.create(&root, "a", 0o644).unwrap();
        let b = fs.create(&root, "b", 0o644).unwrap();

        fs.rename(&root, "a", &root, "b").unwrap();
        assert_eq!(fs.lookup(&root, "b").unwrap().ino(), a.ino());
        assert!(fs.lookup(&root, "a").is_err());
        assert_eq!(b.links_count(), 0);

        let d1 = fs.mkdir(&root, "d1", 0o755).unwrap();
        let d2 = fs.mkdir(&root, "d2", 0o755).unwrap();
        fs.create(&d2, "keep", 0o644).unwrap();
        // a non-empty directory cannot be replaced
        assert!(matches!(fs.rename(&root, "d1", &root, "d2"), Err(StrataError::NotEmpty(_))));
        // nor can a directory move below itself
        assert!(matches!(fs.rename(&root, "d2", &d2, "inner"), Err(StrataError::InvalidArgument(_))));
        assert_eq!(fs.lookup(&root, "d1").unwrap().ino(), d1.ino());
    }

    #[test]
    fn test_rmdir_only_empty() {
        let fs = fresh(8);
        let root = fs.root().unwrap();
        let dir = fs.mkdir(&root, "d", 0o755).unwrap();
        fs.create(&dir, "f", 0o644).unwrap();
        assert!(matches!(fs.rmdir(&root, "d"), Err(StrataError::NotEmpty(_))));

        fs.unlink(&dir, "f").unwrap();
        let dirs_before = fs.volume().dirs_count();
        fs.rmdir(&root, "d").unwrap();
        assert_eq!(dir.links_count(), 0);
        assert_eq!(root.links_count(), 2);
        assert!(fs.lookup(&root, "d").is_err());
        // the inode is only released when the host drops its last reference
        assert_eq!(fs.volume().dirs_count(), dirs_before);
    }

    #[test]
    fn test_directory_spills_into_more_blocks() {
        let fs = fresh(8);
        let root = fs.root().unwrap();
        let dir = fs.mkdir(&root, "big", 0o755).unwrap();
        for i in 0..300 {
            fs.create(&dir, &format!("entry-{:04}", i), 0o644).unwrap();
        }
        assert!(dir.size() > 1024 * 4);
        assert_eq!(dir.size() % 1024, 0);
        let listed = fs.read_dir(&dir).unwrap();
        assert_eq!(listed.len(), 302);
        for i in (0..300).step_by(37) {
            assert!(fs.lookup(&dir, &format!("entry-{:04}", i)).is_ok());
        }
    }
}

#[cfg(test)]
mod data_tests {
    use super::*;

    #[test]
    fn test_write_spanning_indirect_levels() {
        let fs = fresh(8);
        let root = fs.root().unwrap();
        let file = fs.create(&root, "spread", 0o644).unwrap();

        // 1 KiB blocks: 12 direct, 256 single indirect, then double indirect
        let offsets = [0u64, 11 * 1024 + 1000, 100 * 1024, 268 * 1024 + 3, 600 * 1024];
        for (i, &off) in offsets.iter().enumerate() {
            let payload = format!("chunk number {}", i);
            fs.write_at(&file, off, payload.as_bytes()).unwrap();
        }
        for (i, &off) in offsets.iter().enumerate() {
            let payload = format!("chunk number {}", i);
            let mut buf = vec![0u8; payload.len()];
            fs.read_at(&file, off, &mut buf).unwrap();
            assert_eq!(buf, payload.as_bytes());
        }

        let mut hole = vec![0xffu8; 512];
        fs.read_at(&file, 50 * 1024, &mut hole).unwrap();
        assert!(hole.iter().all(|&b| b == 0));
        assert!(fs.bmap(&file, 50).unwrap().is_none());
        assert!(fs.bmap(&file, 268).unwrap().is_some());
    }

    #[test]
    fn test_large_file_feature_set_past_2gib() {
        let fs = fresh(8);
        let root = fs.root().unwrap();
        let file = fs.create(&root, "huge", 0o644).unwrap();
        assert!(!fs.volume().has_ro_compat(EXT2_FEATURE_RO_COMPAT_LARGE_FILE));

        fs.write_at(&file, 1u64 << 31, b"tail").unwrap();
        assert_eq!(file.size(), (1u64 << 31) + 4);
        assert!(fs.volume().has_ro_compat(EXT2_FEATURE_RO_COMPAT_LARGE_FILE));

        let mut buf = [0u8; 4];
        fs.read_at(&file, 1u64 << 31, &mut buf).unwrap();
        assert_eq!(&buf, b"tail");
    }

    #[test]
    fn test_write_beyond_mapping_range_rejected() {
        let fs = fresh(8);
        let root = fs.root().unwrap();
        let file = fs.create(&root, "f", 0o644).unwrap();
        // 12 + 256 + 256^2 + 256^3 blocks of 1 KiB
        let limit = (12u64 + 256 + 65536 + 16_777_216) * 1024;
        assert!(matches!(
            fs.write_at(&file, limit, b"x"),
            Err(StrataError::InvalidArgument(_))
        ));
        assert!(fs.write_at(&file, limit - 1, b"x").is_ok());
    }

    #[test]
    fn test_volume_fills_up() {
        let fs = fresh(2);
        let root = fs.root().unwrap();
        let file = fs.create(&root, "filler", 0o644).unwrap();
        let chunk = vec![0xabu8; 64 * 1024];
        let mut offset = 0u64;
        let err = loop {
            match fs.write_at(&file, offset, &chunk) {
                Ok(n) => offset += n as u64,
                Err(e) => break e,
            }
        };
        assert!(matches!(err, StrataError::NoSpace(_)));
        assert!(offset > 0);
        let volume = fs.volume();
        assert_eq!(volume.free_blocks_count(), volume.count_free_blocks().unwrap());
    }

    #[test]
    fn test_unprivileged_mount_respects_reserve() {
        init_logging();
        let p = params(2);
        let device = Arc::new(MemoryDevice::new(p.size_bytes));
        format_device(device.as_ref(), &p).unwrap();
        let fs = Ext2Fs::mount_with_credentials(device, options(), Arc::new(Credentials::user(1000, 1000)))
            .unwrap();
        let root = fs.root().unwrap();
        let file = fs.create(&root, "user-file", 0o644).unwrap();
        let chunk = vec![1u8; 64 * 1024];
        let mut offset = 0u64;
        while fs.write_at(&file, offset, &chunk).is_ok() {
            offset += chunk.len() as u64;
        }
        // the floor is checked once per allocation, so the last run may dip below it
        let stats = fs.statfs();
        let reserved = fs.volume().superblock().s_r_blocks_count as u64;
        assert!(stats.free_blocks > 0);
        assert!(stats.free_blocks + 64 >= reserved);
        assert_eq!(file.to_disk().uid(), 1000);
    }
}

#[cfg(test)]
mod device_tests {
    use super::*;

    #[test]
    fn test_file_backed_volume_survives_remount() {
        init_logging();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("volume.img");
        let p = params(8);
        {
            let device = FileDevice::create(&path, p.size_bytes).unwrap();
            format_device(&device, &p).unwrap();
            let fs = Ext2Fs::mount(Arc::new(device), options()).unwrap();
            let root = fs.root().unwrap();
            let etc = fs.mkdir(&root, "etc", 0o755).unwrap();
            let hosts = fs.create(&etc, "hosts", 0o644).unwrap();
            fs.write_at(&hosts, 0, b"127.0.0.1 localhost\n").unwrap();
            fs.unmount().unwrap();
        }

        let device = FileDevice::open(&path).unwrap();
        let fs = Ext2Fs::mount(Arc::new(device), options()).unwrap();
        let root = fs.root().unwrap();
        let etc = fs.lookup(&root, "etc").unwrap();
        assert!(etc.is_dir());
        let hosts = fs.lookup(&etc, "hosts").unwrap();
        let mut buf = vec![0u8; hosts.size() as usize];
        fs.read_at(&hosts, 0, &mut buf).unwrap();
        assert_eq!(buf, b"127.0.0.1 localhost\n");

        let volume = fs.volume();
        assert_eq!(volume.free_blocks_count(), volume.count_free_blocks().unwrap());
        assert_eq!(volume.free_inodes_count(), volume.count_free_inodes().unwrap());
        assert_eq!(volume.dirs_count(), 2);
    }

    #[test]
    fn test_read_failure_surfaces_as_io() {
        init_logging();
        let p = params(8);
        let device = Arc::new(FaultyDevice::new(p.size_bytes, 1024));
        let layout: FilesystemLayout = format_device(device.as_ref(), &p).unwrap();

        let dyn_device: Arc<dyn BlockDevice> = device.clone();
        let fs = Ext2Fs::mount(dyn_device, options()).unwrap();
        let root = fs.root().unwrap();

        device.fail_reads_of(layout.inode_bitmap(0) as u64);
        let err = fs.create(&root, "doomed", 0o644).unwrap_err();
        assert!(err.is_io());
        assert!(fs.lookup(&root, "doomed").is_err());

        device.heal();
        assert!(fs.create(&root, "fine", 0o644).is_ok());
    }

    #[test]
    fn test_sync_writes_through() {
        init_logging();
        let p = params(8);
        let device = Arc::new(FaultyDevice::new(p.size_bytes, 1024));
        format_device(device.as_ref(), &p).unwrap();
        let sync_opts = MountOptions {
            sync: true,
            ..options()
        };
        let dyn_device: Arc<dyn BlockDevice> = device.clone();
        let fs = Ext2Fs::mount(dyn_device, sync_opts).unwrap();
        let root = fs.root().unwrap();
        let file = fs.create(&root, "f", 0o644).unwrap();

        let writes = device.write_count();
        fs.write_at(&file, 0, b"durable").unwrap();
        assert!(device.write_count() > writes);
    }

    #[test]
    fn test_mount_options_from_json() {
        let opts = MountOptions::from_json(r#"{ "grpid": true, "old_alloc": true, "random_seed": 9 }"#).unwrap();
        assert!(opts.grpid && opts.old_alloc);
        assert!(matches!(
            MountOptions::from_json(r#"{ "cache_capacity": 0 }"#),
            Err(StrataError::Configuration(_))
        ));

        let fs = {
            let p = params(8);
            let device = Arc::new(MemoryDevice::new(p.size_bytes));
            format_device(device.as_ref(), &p).unwrap();
            Ext2Fs::mount(device, opts).unwrap()
        };
        let root = fs.root().unwrap();
        assert!(fs.mkdir(&root, "d", 0o755).is_ok());
    }

    #[test]
    fn test_mount_rejects_garbage() {
        init_logging();
        let device: Arc<dyn BlockDevice> = Arc::new(MemoryDevice::new(4 * 1024 * 1024));
        assert!(Ext2Fs::mount(device, options()).is_err());
    }
}

#[cfg(test)]
mod concurrency_tests {
    use super::*;

    #[test]
    fn test_parallel_creates_in_separate_directories() {
        let fs = Arc::new(fresh(16));
        let root = fs.root().unwrap();
        let free_inodes = fs.volume().free_inodes_count();

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let fs = Arc::clone(&fs);
                let root = Arc::clone(&root);
                thread::spawn(move || {
                    let dir = fs.mkdir(&root, &format!("worker{}", t), 0o755).unwrap();
                    for i in 0..25 {
                        let file = fs.create(&dir, &format!("file{}", i), 0o644).unwrap();
                        let data = vec![t as u8; 3000];
                        fs.write_at(&file, 0, &data).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(fs.volume().free_inodes_count(), free_inodes - 104);
        for t in 0..4u8 {
            let dir = fs.lookup(&root, &format!("worker{}", t)).unwrap();
            assert_eq!(fs.read_dir(&dir).unwrap().len(), 27);
            let file = fs.lookup(&dir, "file7").unwrap();
            let mut buf = vec![0u8; 3000];
            fs.read_at(&file, 0, &mut buf).unwrap();
            assert!(buf.iter().all(|&b| b == t));
        }
        let volume = fs.volume();
        assert_eq!(volume.free_blocks_count(), volume.count_free_blocks().unwrap());
    }

    #[test]
    fn test_parallel_creates_in_one_directory() {
        let fs = Arc::new(fresh(8));
        let root = fs.root().unwrap();
        let shared = fs.mkdir(&root, "shared", 0o755).unwrap();

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let fs = Arc::clone(&fs);
                let shared = Arc::clone(&shared);
                thread::spawn(move || {
                    for i in 0..40 {
                        fs.create(&shared, &format!("t{}-{}", t, i), 0o644).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let entries = fs.read_dir(&shared).unwrap();
        assert_eq!(entries.len(), 162);
        let mut inos: Vec<_> = entries.iter().map(|e| e.ino).collect();
        inos.sort_unstable();
        inos.dedup();
        // "." and ".." point at distinct inodes; every file has its own
        assert_eq!(inos.len(), 162);
    }

    #[test]
    fn test_rmdir_and_rename_lock_in_the_same_order() {
        let fs = Arc::new(fresh(8));
        let root = fs.root().unwrap();
        let a = fs.mkdir(&root, "a", 0o755).unwrap();
        let b = fs.mkdir(&root, "b", 0o755).unwrap();
        // the child ends up with a lower inode number than its parent
        let (child, parent) = if a.ino() < b.ino() { (a, b) } else { (b, a) };
        let child_name = fs.read_dir(&root).unwrap().into_iter().find(|e| e.ino == child.ino()).unwrap().name;
        fs.rename(&root, &child_name, &parent, "c").unwrap();
        fs.create(&child, "keep", 0o644).unwrap();
        fs.create(&child, "f", 0o644).unwrap();

        let (done_tx, done_rx) = mpsc::channel();
        let remover = {
            let fs = Arc::clone(&fs);
            let parent = Arc::clone(&parent);
            let done = done_tx.clone();
            thread::spawn(move || {
                for _ in 0..500 {
                    assert!(matches!(fs.rmdir(&parent, "c"), Err(StrataError::NotEmpty(_))));
                }
                done.send(()).unwrap();
            })
        };
        let mover = {
            let fs = Arc::clone(&fs);
            let parent = Arc::clone(&parent);
            let child = Arc::clone(&child);
            thread::spawn(move || {
                for _ in 0..250 {
                    fs.rename(&child, "f", &parent, "f").unwrap();
                    fs.rename(&parent, "f", &child, "f").unwrap();
                }
                done_tx.send(()).unwrap();
            })
        };
        for _ in 0..2 {
            done_rx
                .recv_timeout(Duration::from_secs(30))
                .expect("rmdir and rename stopped making progress");
        }
        remover.join().unwrap();
        mover.join().unwrap();

        assert_eq!(fs.lookup(&parent, "c").unwrap().ino(), child.ino());
        assert!(fs.lookup(&child, "f").is_ok());
        assert!(fs.lookup(&parent, "f").is_err());
        assert_eq!(child.links_count(), 2);
    }
}
