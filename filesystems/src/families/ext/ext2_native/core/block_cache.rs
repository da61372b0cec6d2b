// Block cache
// Reference-counted block buffers shared by every allocator and walker on a volume

use log::{debug, error, trace};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use strata_core::BlockDevice;

use super::types::*;

/// One cached block
pub struct BufferHead {
    blocknr: BlockNumber,
    data: RwLock<Vec<u8>>,
    uptodate: AtomicBool,
    dirty: AtomicBool,
}

/// Handle on a cached block. The buffer stays pinned while any handle is alive.
#[derive(Clone)]
pub struct BlockRef(Arc<BufferHead>);

impl BlockRef {
    pub fn blocknr(&self) -> BlockNumber {
        self.0.blocknr
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.0.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.0.data.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn mark_dirty(&self) {
        self.0.dirty.store(true, Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.0.dirty.load(Ordering::Acquire)
    }

    /// Little-endian u32 at entry `index` (block pointers, bitmaps words)
    pub fn read_u32(&self, index: usize) -> u32 {
        let data = self.read();
        let off = index * 4;
        u32::from_le_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]])
    }

    pub fn write_u32(&self, index: usize, value: u32) {
        let mut data = self.write();
        let off = index * 4;
        data[off..off + 4].copy_from_slice(&value.to_le_bytes());
    }
}

impl fmt::Debug for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockRef")
            .field("blocknr", &self.0.blocknr)
            .field("dirty", &self.is_dirty())
            .finish()
    }
}

/// Write-back cache of fixed-size blocks over a device
pub struct BlockCache {
    device: Arc<dyn BlockDevice>,
    block_size: u32,
    capacity: usize,
    buffers: Mutex<HashMap<BlockNumber, Arc<BufferHead>>>,
}

impl BlockCache {
    pub fn new(device: Arc<dyn BlockDevice>, block_size: u32, capacity: usize) -> Self {
        Self {
            device,
            block_size,
            capacity: capacity.max(1),
            buffers: Mutex::new(HashMap::new()),
        }
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    fn lookup_or_insert(&self, blocknr: BlockNumber) -> Arc<BufferHead> {
        let mut buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(bh) = buffers.get(&blocknr) {
            return Arc::clone(bh);
        }
        if buffers.len() >= self.capacity {
            Self::evict_clean(&mut buffers);
        }
        let bh = Arc::new(BufferHead {
            blocknr,
            data: RwLock::new(vec![0u8; self.block_size as usize]),
            uptodate: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
        });
        buffers.insert(blocknr, Arc::clone(&bh));
        bh
    }

    // Drops buffers nobody holds and that have nothing to write back
    fn evict_clean(buffers: &mut HashMap<BlockNumber, Arc<BufferHead>>) {
        let before = buffers.len();
        buffers.retain(|_, bh| Arc::strong_count(bh) > 1 || bh.dirty.load(Ordering::Acquire));
        trace!("block cache evicted {} buffers", before - buffers.len());
    }

    /// Read a block, going to the device only on a miss
    pub fn bread(&self, blocknr: BlockNumber) -> Ext2Result<BlockRef> {
        let bh = self.lookup_or_insert(blocknr);
        if !bh.uptodate.load(Ordering::Acquire) {
            let mut data = bh.data.write().unwrap_or_else(PoisonError::into_inner);
            if !bh.uptodate.load(Ordering::Acquire) {
                let offset = blocknr as u64 * self.block_size as u64;
                if let Err(e) = self.device.read_at(offset, &mut data) {
                    error!("read of block {} failed: {}", blocknr, e);
                    return Err(e.into());
                }
                bh.uptodate.store(true, Ordering::Release);
            }
        }
        Ok(BlockRef(bh))
    }

    /// Get a block that is about to be completely overwritten.
    /// An uncached block comes back zero-filled without touching the device.
    pub fn getblk(&self, blocknr: BlockNumber) -> BlockRef {
        let bh = self.lookup_or_insert(blocknr);
        if !bh.uptodate.load(Ordering::Acquire) {
            let _data = bh.data.write().unwrap_or_else(PoisonError::into_inner);
            bh.uptodate.store(true, Ordering::Release);
        }
        BlockRef(bh)
    }

    /// Write one buffer through to the device now
    pub fn sync_dirty_buffer(&self, block: &BlockRef) -> Ext2Result<()> {
        if !block.0.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let offset = block.blocknr() as u64 * self.block_size as u64;
        let data = block.read();
        if let Err(e) = self.device.write_at(offset, &data) {
            block.mark_dirty();
            error!("write of block {} failed: {}", block.blocknr(), e);
            return Err(e.into());
        }
        Ok(())
    }

    /// Write every dirty buffer and flush the device
    pub fn sync_all(&self) -> Ext2Result<()> {
        let dirty: Vec<BlockRef> = {
            let buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
            buffers
                .values()
                .filter(|bh| bh.dirty.load(Ordering::Acquire))
                .map(|bh| BlockRef(Arc::clone(bh)))
                .collect()
        };
        debug!("syncing {} dirty buffers", dirty.len());
        for block in &dirty {
            self.sync_dirty_buffer(block)?;
        }
        self.device.flush()?;
        Ok(())
    }

    /// Number of buffers with outstanding handles
    pub fn pinned(&self) -> usize {
        let buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        buffers.values().filter(|bh| Arc::strong_count(bh) > 1).count()
    }

    pub fn cached(&self) -> usize {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl fmt::Debug for BlockCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockCache")
            .field("block_size", &self.block_size)
            .field("capacity", &self.capacity)
            .field("cached", &self.cached())
            .finish()
    }
}
