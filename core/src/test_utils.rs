/// Test utilities and fault-injecting devices
use crate::device::{BlockDevice, MemoryDevice};
use std::collections::HashSet;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use tracing::warn;

/// In-memory device that can be told to fail reads of particular blocks.
///
/// Block numbers are interpreted against `block_size`, so the device must be
/// configured with the same block size the volume uses.
pub struct FaultyDevice {
    inner: MemoryDevice,
    block_size: u64,
    failing_reads: Mutex<HashSet<u64>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
    flushes: AtomicUsize,
}

impl FaultyDevice {
    pub fn new(size: u64, block_size: u64) -> Self {
        Self {
            inner: MemoryDevice::new(size),
            block_size,
            failing_reads: Mutex::new(HashSet::new()),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            flushes: AtomicUsize::new(0),
        }
    }

    /// Make every later read touching `block` fail
    pub fn fail_reads_of(&self, block: u64) {
        self.failing_reads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(block);
    }

    pub fn heal(&self) {
        self.failing_reads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for FaultyDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaultyDevice")
            .field("size", &self.inner.size())
            .field("block_size", &self.block_size)
            .finish()
    }
}

impl BlockDevice for FaultyDevice {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let first = offset / self.block_size;
        let last = (offset + buf.len().max(1) as u64 - 1) / self.block_size;
        let failing = self
            .failing_reads
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(block) = (first..=last).find(|b| failing.contains(b)) {
            warn!("injected read failure on block {}", block);
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("injected read failure on block {}", block),
            ));
        }
        drop(failing);
        self.inner.read_at(offset, buf)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.inner.write_at(offset, buf)
    }

    fn flush(&self) -> io::Result<()> {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.inner.flush()
    }

    fn size(&self) -> u64 {
        self.inner.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injected_failure_only_hits_marked_block() {
        let dev = FaultyDevice::new(8 * 1024, 1024);
        dev.fail_reads_of(3);

        let mut buf = [0u8; 1024];
        assert!(dev.read_at(2 * 1024, &mut buf).is_ok());
        assert!(dev.read_at(3 * 1024, &mut buf).is_err());
        // straddling read also fails
        assert!(dev.read_at(2 * 1024 + 512, &mut buf).is_err());

        dev.heal();
        assert!(dev.read_at(3 * 1024, &mut buf).is_ok());
        assert_eq!(dev.read_count(), 4);
    }
}
