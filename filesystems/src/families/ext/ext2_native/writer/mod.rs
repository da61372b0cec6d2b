// ext2 Writer - mounted filesystem facade
// Namespace operations, file data through the block mapper, sync and unmount

mod directory;
mod disk_io;
mod indirect_blocks;

pub use directory::{check_name, dir_rec_len, DirEntry, DirIter, DirSlot};
pub use indirect_blocks::{block_to_path, BlockMapping, BlockPath};

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, MutexGuard};
use strata_core::{BlockDevice, MountOptions};

use crate::families::ext::ext2_native::core::{
    block_allocator::BlockAllocator,
    constants::*,
    inode::{Ext2InodeInfo, InodeCache},
    inode_allocator::InodeAllocator,
    types::*,
    volume::Volume,
};

/// Volume usage as reported to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsStats {
    pub block_size: u32,
    /// Blocks usable for data, metadata overhead excluded
    pub blocks: u64,
    pub free_blocks: u64,
    /// Free blocks outside the reserved pool
    pub available_blocks: u64,
    pub inodes: u64,
    pub free_inodes: u64,
    pub name_max: u32,
}

/// A mounted ext2 volume
pub struct Ext2Fs {
    volume: Arc<Volume>,
    block_allocator: BlockAllocator,
    inode_allocator: InodeAllocator,
    inodes: InodeCache,
    creds: Arc<dyn HostCredentials>,
}

impl Ext2Fs {
    /// Mount with full privileges
    pub fn mount(device: Arc<dyn BlockDevice>, options: MountOptions) -> Ext2Result<Self> {
        Self::mount_with_credentials(device, options, Arc::new(Credentials::root()))
    }

    /// Mount, acting as `creds` for ownership and reserved-space checks
    pub fn mount_with_credentials(
        device: Arc<dyn BlockDevice>,
        options: MountOptions,
        creds: Arc<dyn HostCredentials>,
    ) -> Ext2Result<Self> {
        let volume = Volume::open(device, options)?;
        let fs = Self {
            block_allocator: BlockAllocator::new(Arc::clone(&volume)),
            inode_allocator: InodeAllocator::new(Arc::clone(&volume)),
            volume,
            inodes: InodeCache::new(),
            creds,
        };

        let root = fs.root()?;
        if !root.is_dir() || root.size() == 0 {
            error!("corrupt root inode, run a filesystem check");
            return Err(StrataError::InvalidArgument("corrupt root inode".to_string()));
        }
        Ok(fs)
    }

    pub fn volume(&self) -> &Arc<Volume> {
        &self.volume
    }

    pub fn block_allocator(&self) -> &BlockAllocator {
        &self.block_allocator
    }

    pub fn inode_allocator(&self) -> &InodeAllocator {
        &self.inode_allocator
    }

    pub fn credentials(&self) -> &dyn HostCredentials {
        self.creds.as_ref()
    }

    pub fn root(&self) -> Ext2Result<Arc<Ext2InodeInfo>> {
        self.iget(EXT2_ROOT_INO)
    }

    /// Get the live inode object for `ino`, loading it on first use
    pub fn iget(&self, ino: InodeNumber) -> Ext2Result<Arc<Ext2InodeInfo>> {
        let (inode, _) = self.inodes.lookup_or_create(ino, || {
            let raw = self.read_inode(ino)?;
            if raw.i_links_count == 0 && (raw.i_mode == 0 || raw.i_dtime != 0) {
                debug!("inode {} is deleted", ino);
                return Err(StrataError::NotFound(format!("inode {}", ino)));
            }
            let group = self.volume.geometry().inode_group(ino);
            Ok(Ext2InodeInfo::from_disk(ino, group, raw))
        })?;
        Ok(inode)
    }

    fn require_dir(dir: &Ext2InodeInfo) -> Ext2Result<()> {
        if !dir.is_dir() {
            return Err(StrataError::InvalidArgument(format!("inode {} is not a directory", dir.ino())));
        }
        Ok(())
    }

    /// Resolve `name` inside `dir`
    pub fn lookup(&self, dir: &Ext2InodeInfo, name: &str) -> Ext2Result<Arc<Ext2InodeInfo>> {
        Self::require_dir(dir)?;
        if name.len() > EXT2_NAME_LEN {
            return Err(StrataError::NameTooLong(name.len()));
        }
        match self.inode_by_name(dir, name)? {
            Some(ino) => self.iget(ino),
            None => Err(StrataError::NotFound(name.to_string())),
        }
    }

    // Allocate and register a new inode; the number is handed back if
    // registration fails
    fn new_inode(&self, dir: &Ext2InodeInfo, mode: u16) -> Ext2Result<Arc<Ext2InodeInfo>> {
        let inode = self.inode_allocator.allocate(dir, mode, self.creds.as_ref())?;
        let ino = inode.ino();
        let is_dir = inode.is_dir();
        match self.inodes.insert_new(inode) {
            Ok(inode) => Ok(inode),
            Err(e) => {
                if let Err(free_err) = self.inode_allocator.free(ino, is_dir) {
                    error!("releasing inode {} failed: {}", ino, free_err);
                }
                Err(e)
            }
        }
    }

    // Undo a new inode whose directory entry could not be written
    fn discard_inode(&self, inode: &Ext2InodeInfo) {
        for i in 0..EXT2_NDIR_BLOCKS {
            let blk = inode.block_ptr(i);
            if blk != 0 {
                if let Err(e) = self.block_allocator.free_blocks(blk, 1) {
                    error!("inode {}: releasing block {} failed: {}", inode.ino(), blk, e);
                }
            }
        }
        self.inodes.evict(inode.ino());
        if let Err(e) = self.inode_allocator.free(inode.ino(), inode.is_dir()) {
            error!("releasing inode {} failed: {}", inode.ino(), e);
        }
    }

    // An inode that lost its last name is written back and leaves the cache;
    // its number and blocks stay allocated until the host releases them
    fn forget_if_unlinked(&self, inode: &Ext2InodeInfo) -> Ext2Result<()> {
        if inode.links_count() > 0 {
            return Ok(());
        }
        self.write_inode(inode, self.volume.options().sync)?;
        self.inodes.evict(inode.ino());
        debug!("inode {} has no links left, dropped from the inode cache", inode.ino());
        Ok(())
    }

    fn ensure_absent(&self, dir: &Ext2InodeInfo, name: &str) -> Ext2Result<()> {
        if self.find_entry(dir, name)?.is_some() {
            return Err(StrataError::AlreadyExists(name.to_string()));
        }
        Ok(())
    }

    fn finish_new(&self, inode: &Ext2InodeInfo) -> Ext2Result<()> {
        inode.clear_new();
        if self.volume.options().sync {
            self.write_inode(inode, true)?;
        }
        Ok(())
    }

    /// Create an empty regular file
    pub fn create(&self, dir: &Ext2InodeInfo, name: &str, perm: u16) -> Ext2Result<Arc<Ext2InodeInfo>> {
        check_name(name)?;
        Self::require_dir(dir)?;
        let _guard = dir.lock_dir();
        self.ensure_absent(dir, name)?;

        let inode = self.new_inode(dir, S_IFREG | (perm & 0o7777))?;
        inode.update(|raw| raw.i_links_count = 1);
        if let Err(e) = self.add_link(dir, name, &inode) {
            self.discard_inode(&inode);
            return Err(e);
        }
        self.finish_new(&inode)?;
        debug!("created {:?} as inode {} in {}", name, inode.ino(), dir.ino());
        Ok(inode)
    }

    /// Create a directory holding "." and ".."
    pub fn mkdir(&self, dir: &Ext2InodeInfo, name: &str, perm: u16) -> Ext2Result<Arc<Ext2InodeInfo>> {
        check_name(name)?;
        Self::require_dir(dir)?;
        let _guard = dir.lock_dir();
        if dir.links_count() >= EXT2_LINK_MAX {
            return Err(StrataError::InvalidArgument(format!("too many links in directory {}", dir.ino())));
        }
        self.ensure_absent(dir, name)?;

        let inode = self.new_inode(dir, S_IFDIR | (perm & 0o7777))?;
        inode.update(|raw| raw.i_links_count = 2);
        let linked = self
            .make_empty(&inode, dir)
            .and_then(|_| self.add_link(dir, name, &inode));
        if let Err(e) = linked {
            self.discard_inode(&inode);
            return Err(e);
        }
        dir.update(|raw| raw.i_links_count += 1);
        self.finish_new(&inode)?;
        debug!("created directory {:?} as inode {} in {}", name, inode.ino(), dir.ino());
        Ok(inode)
    }

    /// Add another name for a non-directory inode
    pub fn link(&self, inode: &Ext2InodeInfo, dir: &Ext2InodeInfo, name: &str) -> Ext2Result<()> {
        check_name(name)?;
        Self::require_dir(dir)?;
        if inode.is_dir() {
            return Err(StrataError::InvalidArgument("hard links to directories are not allowed".to_string()));
        }
        if inode.links_count() >= EXT2_LINK_MAX {
            return Err(StrataError::InvalidArgument(format!("too many links to inode {}", inode.ino())));
        }
        let _guard = dir.lock_dir();
        self.ensure_absent(dir, name)?;
        self.add_link(dir, name, inode)?;
        let now = now_secs();
        inode.update(|raw| {
            raw.i_links_count += 1;
            raw.i_ctime = now;
        });
        Ok(())
    }

    /// Remove a name of a non-directory. The inode itself stays allocated.
    pub fn unlink(&self, dir: &Ext2InodeInfo, name: &str) -> Ext2Result<()> {
        Self::require_dir(dir)?;
        let _guard = dir.lock_dir();
        let slot = self
            .find_entry(dir, name)?
            .ok_or_else(|| StrataError::NotFound(name.to_string()))?;
        let inode = self.iget(slot.ino)?;
        if inode.is_dir() {
            return Err(StrataError::InvalidArgument(format!("{:?} is a directory", name)));
        }
        self.delete_entry(dir, &slot)?;
        let now = now_secs();
        inode.update(|raw| {
            raw.i_links_count = raw.i_links_count.saturating_sub(1);
            raw.i_ctime = now;
        });
        self.forget_if_unlinked(&inode)
    }

    /// Remove an empty directory
    pub fn rmdir(&self, dir: &Ext2InodeInfo, name: &str) -> Ext2Result<()> {
        Self::require_dir(dir)?;
        if name == "." || name == ".." {
            return Err(StrataError::InvalidArgument(format!("cannot remove {:?}", name)));
        }
        // Parent and child are locked in inode order like rename does, so the
        // entry is looked up first and checked again once both are held
        loop {
            let seen = self
                .find_entry(dir, name)?
                .ok_or_else(|| StrataError::NotFound(name.to_string()))?;
            let inode = self.iget(seen.ino)?;
            Self::require_dir(&inode)?;
            let _guards = Self::lock_pair(dir, &inode);
            match self.find_entry(dir, name)? {
                Some(slot) if slot.ino == inode.ino() => {
                    return self.remove_empty_dir(dir, name, &slot, &inode);
                }
                Some(_) => debug!("{:?} in {} changed while locking, retrying", name, dir.ino()),
                None => return Err(StrataError::NotFound(name.to_string())),
            }
        }
    }

    // Drop the entry of an empty directory; caller holds both directory locks
    fn remove_empty_dir(
        &self,
        dir: &Ext2InodeInfo,
        name: &str,
        slot: &DirSlot,
        inode: &Ext2InodeInfo,
    ) -> Ext2Result<()> {
        if !self.is_empty_dir(inode)? {
            return Err(StrataError::NotEmpty(name.to_string()));
        }
        self.delete_entry(dir, slot)?;
        let now = now_secs();
        inode.update(|raw| {
            raw.i_links_count = 0;
            raw.i_ctime = now;
        });
        dir.update(|raw| raw.i_links_count = raw.i_links_count.saturating_sub(1));
        self.forget_if_unlinked(inode)
    }

    // Lock one or two directories, lower inode number first
    fn lock_pair<'a>(
        a: &'a Ext2InodeInfo,
        b: &'a Ext2InodeInfo,
    ) -> (MutexGuard<'a, ()>, Option<MutexGuard<'a, ()>>) {
        if a.ino() == b.ino() {
            (a.lock_dir(), None)
        } else if a.ino() < b.ino() {
            let first = a.lock_dir();
            (first, Some(b.lock_dir()))
        } else {
            let first = b.lock_dir();
            (first, Some(a.lock_dir()))
        }
    }

    // Whether `dir` is `ancestor` or lies below it
    fn is_within(&self, dir: &Ext2InodeInfo, ancestor: InodeNumber) -> Ext2Result<bool> {
        let mut ino = dir.ino();
        for _ in 0..self.volume.geometry().inodes_count {
            if ino == ancestor {
                return Ok(true);
            }
            if ino == EXT2_ROOT_INO {
                return Ok(false);
            }
            ino = self.dotdot(&*self.iget(ino)?)?.ino;
        }
        Err(corrupted("directory parent chain does not reach the root"))
    }

    /// Move `old_name` in `old_dir` to `new_name` in `new_dir`, replacing a
    /// compatible target
    pub fn rename(
        &self,
        old_dir: &Ext2InodeInfo,
        old_name: &str,
        new_dir: &Ext2InodeInfo,
        new_name: &str,
    ) -> Ext2Result<()> {
        check_name(new_name)?;
        Self::require_dir(old_dir)?;
        Self::require_dir(new_dir)?;
        if [old_name, new_name].iter().any(|n| *n == "." || *n == "..") {
            return Err(StrataError::InvalidArgument("cannot rename '.' or '..'".to_string()));
        }
        let _guards = Self::lock_pair(old_dir, new_dir);

        let old_slot = self
            .find_entry(old_dir, old_name)?
            .ok_or_else(|| StrataError::NotFound(old_name.to_string()))?;
        let old_inode = self.iget(old_slot.ino)?;
        let dir_slot = if old_inode.is_dir() {
            if old_dir.ino() != new_dir.ino() && self.is_within(new_dir, old_inode.ino())? {
                return Err(StrataError::InvalidArgument(format!(
                    "cannot move {:?} below itself",
                    old_name
                )));
            }
            Some(self.dotdot(&old_inode)?)
        } else {
            None
        };

        let now = now_secs();
        match self.find_entry(new_dir, new_name)? {
            Some(new_slot) => {
                if new_slot.ino == old_inode.ino() {
                    return Ok(());
                }
                let new_inode = self.iget(new_slot.ino)?;
                if dir_slot.is_some() {
                    Self::require_dir(&new_inode)?;
                    if !self.is_empty_dir(&new_inode)? {
                        return Err(StrataError::NotEmpty(new_name.to_string()));
                    }
                } else if new_inode.is_dir() {
                    return Err(StrataError::InvalidArgument(format!("{:?} is a directory", new_name)));
                }
                self.set_link(new_dir, &new_slot, &old_inode, true)?;
                let was_dir = dir_slot.is_some();
                new_inode.update(|raw| {
                    raw.i_ctime = now;
                    raw.i_links_count = if was_dir {
                        0
                    } else {
                        raw.i_links_count.saturating_sub(1)
                    };
                });
                if let Err(e) = self.forget_if_unlinked(&new_inode) {
                    error!("writing back replaced inode {} failed: {}", new_inode.ino(), e);
                }
            }
            None => {
                if dir_slot.is_some() && new_dir.links_count() >= EXT2_LINK_MAX {
                    return Err(StrataError::InvalidArgument(format!(
                        "too many links in directory {}",
                        new_dir.ino()
                    )));
                }
                self.add_link(new_dir, new_name, &old_inode)?;
                if dir_slot.is_some() {
                    new_dir.update(|raw| raw.i_links_count += 1);
                }
            }
        }

        old_inode.update(|raw| raw.i_ctime = now);
        self.delete_entry(old_dir, &old_slot)?;

        if let Some(dir_slot) = dir_slot {
            if old_dir.ino() != new_dir.ino() {
                self.set_link(&old_inode, &dir_slot, new_dir, false)?;
            }
            old_dir.update(|raw| raw.i_links_count = raw.i_links_count.saturating_sub(1));
        }
        debug!(
            "renamed {:?} in {} to {:?} in {}",
            old_name,
            old_dir.ino(),
            new_name,
            new_dir.ino()
        );
        Ok(())
    }

    /// Every live record of `dir`, including "." and ".."
    pub fn read_dir(&self, dir: &Arc<Ext2InodeInfo>) -> Ext2Result<Vec<DirEntry>> {
        Self::require_dir(dir)?;
        self.dir_iter(dir, 0).collect()
    }

    fn file_sync(&self, inode: &Ext2InodeInfo) -> bool {
        self.volume.options().sync || inode.flags() & EXT2_SYNC_FL != 0
    }

    /// Write `data` at byte `offset`, allocating blocks as needed
    pub fn write_at(&self, inode: &Ext2InodeInfo, offset: u64, data: &[u8]) -> Ext2Result<usize> {
        if inode.is_dir() {
            return Err(StrataError::InvalidArgument("cannot write to a directory".to_string()));
        }
        if data.is_empty() {
            return Ok(0);
        }
        let bs = self.volume.block_size() as u64;
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| StrataError::InvalidArgument("write past the largest offset".to_string()))?;
        if block_to_path(self.volume.geometry().addr_per_block_bits, (end - 1) / bs).is_err() {
            return Err(StrataError::InvalidArgument(format!("file too large: {} bytes", end)));
        }

        let sync = self.file_sync(inode);
        let mut pos = offset;
        let mut written = 0usize;
        while written < data.len() {
            let iblock = pos / bs;
            let want = ((pos % bs + (data.len() - written) as u64 + bs - 1) / bs).min(u32::MAX as u64) as u32;
            let mapping = self
                .get_blocks(inode, iblock, want, true)?
                .ok_or_else(|| corrupted("block allocation returned nothing"))?;

            for i in 0..mapping.count {
                if written >= data.len() {
                    break;
                }
                let in_block = (pos % bs) as usize;
                let chunk = (bs as usize - in_block).min(data.len() - written);
                let physical = mapping.physical + i;
                let bh = if mapping.new || chunk == bs as usize {
                    self.volume.cache().getblk(physical)
                } else {
                    self.volume.cache().bread(physical)?
                };
                {
                    let mut block = bh.write();
                    if mapping.new && chunk < bs as usize {
                        block.fill(0);
                    }
                    block[in_block..in_block + chunk].copy_from_slice(&data[written..written + chunk]);
                }
                self.volume.dirty_buffer(&bh, sync)?;
                written += chunk;
                pos += chunk as u64;
            }
        }

        let now = now_secs();
        let is_regular = inode.file_type() == FileType::Regular;
        inode.update(|raw| {
            if end > raw.size() {
                raw.set_size(end);
            }
            raw.i_mtime = now;
            raw.i_ctime = now;
        });
        if is_regular
            && end > EXT2_SMALL_FILE_MAX
            && !self.volume.has_ro_compat(EXT2_FEATURE_RO_COMPAT_LARGE_FILE)
        {
            info!("first file over 2 GiB, enabling large_file feature");
            self.volume.set_ro_compat(EXT2_FEATURE_RO_COMPAT_LARGE_FILE)?;
        }
        if sync {
            self.write_inode(inode, true)?;
        }
        Ok(data.len())
    }

    /// Read up to `buf.len()` bytes at `offset`; holes read as zeros
    pub fn read_at(&self, inode: &Ext2InodeInfo, offset: u64, buf: &mut [u8]) -> Ext2Result<usize> {
        let size = inode.size();
        if offset >= size || buf.is_empty() {
            return Ok(0);
        }
        let len = (size - offset).min(buf.len() as u64) as usize;
        let bs = self.volume.block_size() as u64;

        let mut pos = offset;
        let mut done = 0usize;
        while done < len {
            let iblock = pos / bs;
            let want = ((pos % bs + (len - done) as u64 + bs - 1) / bs).min(u32::MAX as u64) as u32;
            match self.get_blocks(inode, iblock, want, false)? {
                None => {
                    let chunk = (bs - pos % bs).min((len - done) as u64) as usize;
                    buf[done..done + chunk].fill(0);
                    done += chunk;
                    pos += chunk as u64;
                }
                Some(mapping) => {
                    for i in 0..mapping.count {
                        if done >= len {
                            break;
                        }
                        let in_block = (pos % bs) as usize;
                        let chunk = (bs as usize - in_block).min(len - done);
                        let bh = self.volume.cache().bread(mapping.physical + i)?;
                        buf[done..done + chunk].copy_from_slice(&bh.read()[in_block..in_block + chunk]);
                        done += chunk;
                        pos += chunk as u64;
                    }
                }
            }
        }
        Ok(len)
    }

    pub fn statfs(&self) -> FsStats {
        let g = self.volume.geometry();
        let overhead: u64 = g.first_data_block as u64
            + (0..g.groups_count)
                .map(|group| {
                    let backup = if self.volume.has_bg_super(group) {
                        1 + g.db_count as u64
                    } else {
                        0
                    };
                    backup + 2 + g.itb_per_group as u64
                })
                .sum::<u64>();
        let free_blocks = self.volume.free_blocks_count();
        let reserved = self.volume.superblock().s_r_blocks_count as u64;
        FsStats {
            block_size: g.block_size,
            blocks: (g.blocks_count as u64).saturating_sub(overhead),
            free_blocks,
            available_blocks: free_blocks.saturating_sub(reserved),
            inodes: g.inodes_count as u64,
            free_inodes: self.volume.free_inodes_count(),
            name_max: EXT2_NAME_LEN as u32,
        }
    }

    /// Write back dirty inodes, dirty buffers and the superblock
    pub fn sync(&self) -> Ext2Result<()> {
        self.write_dirty_inodes()?;
        self.volume.sync()
    }

    /// Flush everything and mark the volume clean
    pub fn unmount(self) -> Ext2Result<()> {
        self.write_dirty_inodes()?;
        let pinned = self.volume.cache().pinned();
        if pinned > self.volume.geometry().db_count as usize {
            warn!("unmounting with {} pinned buffers", pinned);
        }
        self.volume.put_super()
    }
}

impl fmt::Debug for Ext2Fs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ext2Fs")
            .field("volume", &self.volume)
            .field("cached_inodes", &self.inodes.len())
            .finish()
    }
}
