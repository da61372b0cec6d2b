// In-memory inodes
// The on-disk record plus the per-inode locks and allocation state the engine needs

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::constants::*;
use super::structures::Ext2Inode;
use super::types::*;

/// Lifecycle state of an in-memory inode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeState {
    /// Just allocated; data blocks hold nothing valid yet
    New,
    /// In-memory copy differs from the inode table
    Dirty,
    Clean,
}

/// Where the last block of this inode was allocated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockAllocInfo {
    pub last_alloc_logical: u64,
    pub last_alloc_physical: BlockNumber,
}

/// Mirror of one inode
pub struct Ext2InodeInfo {
    ino: InodeNumber,
    block_group: GroupNumber,
    /// Block pointer array; slots are read lock-free and written under `truncate_mutex`
    i_data: [AtomicU32; EXT2_N_BLOCKS],
    /// Readers of the pointer chain take the read side; truncation would take the write side
    meta_lock: RwLock<()>,
    /// Serializes branch allocation on this inode
    truncate_mutex: Mutex<()>,
    /// Serializes directory entry changes (the host's directory lock)
    dir_mutex: Mutex<()>,
    raw: Mutex<Ext2Inode>,
    alloc_info: Mutex<Option<BlockAllocInfo>>,
    dir_start_lookup: AtomicU32,
    new: AtomicBool,
    dirty: AtomicBool,
}

impl Ext2InodeInfo {
    /// Build the mirror of an inode read from the inode table
    pub fn from_disk(ino: InodeNumber, block_group: GroupNumber, raw: Ext2Inode) -> Self {
        let info = Self::blank(ino, block_group, raw);
        for (slot, value) in info.i_data.iter().zip(raw.i_block.iter()) {
            slot.store(*value, Ordering::Release);
        }
        info
    }

    /// Build a freshly allocated inode; its pointer array starts zeroed
    pub fn new_inode(ino: InodeNumber, block_group: GroupNumber, mut raw: Ext2Inode) -> Self {
        raw.i_block = [0; EXT2_N_BLOCKS];
        let info = Self::blank(ino, block_group, raw);
        info.new.store(true, Ordering::Release);
        info.dirty.store(true, Ordering::Release);
        info
    }

    fn blank(ino: InodeNumber, block_group: GroupNumber, raw: Ext2Inode) -> Self {
        Self {
            ino,
            block_group,
            i_data: Default::default(),
            meta_lock: RwLock::new(()),
            truncate_mutex: Mutex::new(()),
            dir_mutex: Mutex::new(()),
            raw: Mutex::new(raw),
            alloc_info: Mutex::new(None),
            dir_start_lookup: AtomicU32::new(0),
            new: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn ino(&self) -> InodeNumber {
        self.ino
    }

    pub fn block_group(&self) -> GroupNumber {
        self.block_group
    }

    pub fn state(&self) -> InodeState {
        if self.new.load(Ordering::Acquire) {
            InodeState::New
        } else if self.dirty.load(Ordering::Acquire) {
            InodeState::Dirty
        } else {
            InodeState::Clean
        }
    }

    /// Drop the "new" marker once the host has finished setting the inode up
    pub fn clear_new(&self) {
        self.new.store(false, Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub(crate) fn mark_clean(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    pub fn data_slot(&self, index: usize) -> &AtomicU32 {
        &self.i_data[index]
    }

    pub fn block_ptr(&self, index: usize) -> BlockNumber {
        self.i_data[index].load(Ordering::Acquire)
    }

    pub fn read_meta(&self) -> RwLockReadGuard<'_, ()> {
        self.meta_lock.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Exclusive access to the pointer chain, for truncation
    pub fn write_meta(&self) -> RwLockWriteGuard<'_, ()> {
        self.meta_lock.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn lock_alloc(&self) -> MutexGuard<'_, ()> {
        self.truncate_mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn lock_dir(&self) -> MutexGuard<'_, ()> {
        self.dir_mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of the on-disk record, with the live pointer array folded in
    pub fn to_disk(&self) -> Ext2Inode {
        let mut raw = *self.raw.lock().unwrap_or_else(PoisonError::into_inner);
        for (dst, slot) in raw.i_block.iter_mut().zip(self.i_data.iter()) {
            *dst = slot.load(Ordering::Acquire);
        }
        raw
    }

    /// Change fields of the record and mark the inode dirty
    pub fn update<R>(&self, f: impl FnOnce(&mut Ext2Inode) -> R) -> R {
        let result = f(&mut self.raw.lock().unwrap_or_else(PoisonError::into_inner));
        self.mark_dirty();
        result
    }

    fn with_raw<R>(&self, f: impl FnOnce(&Ext2Inode) -> R) -> R {
        f(&self.raw.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn mode(&self) -> u16 {
        self.with_raw(|raw| raw.i_mode)
    }

    pub fn file_type(&self) -> FileType {
        FileType::from_mode(self.mode())
    }

    pub fn is_dir(&self) -> bool {
        self.file_type().is_dir()
    }

    pub fn flags(&self) -> u32 {
        self.with_raw(|raw| raw.i_flags)
    }

    pub fn size(&self) -> u64 {
        self.with_raw(|raw| raw.size())
    }

    pub fn links_count(&self) -> u16 {
        self.with_raw(|raw| raw.i_links_count)
    }

    pub fn gid(&self) -> u32 {
        self.with_raw(|raw| raw.gid())
    }

    pub fn alloc_info(&self) -> Option<BlockAllocInfo> {
        *self.alloc_info.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_alloc_info(&self, info: BlockAllocInfo) {
        *self.alloc_info.lock().unwrap_or_else(PoisonError::into_inner) = Some(info);
    }

    pub fn dir_start_lookup(&self) -> u32 {
        self.dir_start_lookup.load(Ordering::Relaxed)
    }

    pub(crate) fn set_dir_start_lookup(&self, block: u32) {
        self.dir_start_lookup.store(block, Ordering::Relaxed);
    }
}

impl fmt::Debug for Ext2InodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ext2InodeInfo")
            .field("ino", &self.ino)
            .field("block_group", &self.block_group)
            .field("state", &self.state())
            .finish()
    }
}

/// Live inode objects of one mount, keyed by inode number
#[derive(Default)]
pub struct InodeCache {
    inodes: Mutex<HashMap<InodeNumber, Arc<Ext2InodeInfo>>>,
}

impl InodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, ino: InodeNumber) -> Option<Arc<Ext2InodeInfo>> {
        self.inodes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&ino)
            .cloned()
    }

    /// Return the cached inode, or build and insert one.
    ///
    /// `create` runs without the cache lock held, so loads of different inodes
    /// proceed in parallel. When two callers race on the same number the first
    /// insert wins and the other copy is dropped. The flag is true when the
    /// returned inode is the one `create` built.
    pub fn lookup_or_create(
        &self,
        ino: InodeNumber,
        create: impl FnOnce() -> Ext2Result<Ext2InodeInfo>,
    ) -> Ext2Result<(Arc<Ext2InodeInfo>, bool)> {
        if let Some(inode) = self.get(ino) {
            return Ok((inode, false));
        }
        let built = Arc::new(create()?);
        let mut inodes = self.inodes.lock().unwrap_or_else(PoisonError::into_inner);
        match inodes.entry(ino) {
            Entry::Occupied(entry) => Ok((Arc::clone(entry.get()), false)),
            Entry::Vacant(entry) => Ok((Arc::clone(entry.insert(built)), true)),
        }
    }

    /// Register a freshly allocated inode; a live entry with the same number is corruption
    pub fn insert_new(&self, inode: Ext2InodeInfo) -> Ext2Result<Arc<Ext2InodeInfo>> {
        let mut inodes = self.inodes.lock().unwrap_or_else(PoisonError::into_inner);
        let ino = inode.ino();
        if inodes.contains_key(&ino) {
            return Err(corrupted(format!("inode number {} already in use", ino)));
        }
        let inode = Arc::new(inode);
        inodes.insert(ino, Arc::clone(&inode));
        Ok(inode)
    }

    pub fn evict(&self, ino: InodeNumber) -> Option<Arc<Ext2InodeInfo>> {
        self.inodes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&ino)
    }

    pub fn dirty_inodes(&self) -> Vec<Arc<Ext2InodeInfo>> {
        self.inodes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|inode| inode.is_dirty())
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inodes.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
