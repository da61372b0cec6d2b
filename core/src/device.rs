use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, RwLock};

use tracing::{debug, trace};

/// Byte-addressed storage that a volume lives on.
///
/// Implementations must be usable from several threads at once; the block
/// cache above them does its own serialisation per buffer.
pub trait BlockDevice: Send + Sync + fmt::Debug {
    /// Fill `buf` from `offset`. Short reads are errors.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Write all of `buf` at `offset`.
    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()>;

    /// Push any buffered writes to stable storage.
    fn flush(&self) -> io::Result<()>;

    /// Size of the device in bytes.
    fn size(&self) -> u64;
}

fn out_of_range(offset: u64, len: usize, size: u64) -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("access at {}+{} beyond device size {}", offset, len, size),
    )
}

/// RAM-backed device, zero-filled on creation
pub struct MemoryDevice {
    data: RwLock<Vec<u8>>,
}

impl MemoryDevice {
    pub fn new(size: u64) -> Self {
        Self {
            data: RwLock::new(vec![0u8; size as usize]),
        }
    }

    /// Copy of the full contents, mostly useful for comparing images in tests
    pub fn snapshot(&self) -> Vec<u8> {
        self.data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl fmt::Debug for MemoryDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryDevice")
            .field("size", &self.size())
            .finish()
    }
}

impl BlockDevice for MemoryDevice {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        let start = offset as usize;
        let end = start
            .checked_add(buf.len())
            .filter(|end| *end <= data.len())
            .ok_or_else(|| out_of_range(offset, buf.len(), data.len() as u64))?;
        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        let size = data.len() as u64;
        let start = offset as usize;
        let end = start
            .checked_add(buf.len())
            .filter(|end| *end <= data.len())
            .ok_or_else(|| out_of_range(offset, buf.len(), size))?;
        data[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&self) -> io::Result<()> {
        Ok(())
    }

    fn size(&self) -> u64 {
        self.data.read().unwrap_or_else(PoisonError::into_inner).len() as u64
    }
}

/// Device backed by a regular file or a raw device node
pub struct FileDevice {
    path: PathBuf,
    file: Mutex<File>,
    size: u64,
}

impl FileDevice {
    /// Open an existing image read-write
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let size = file.metadata()?.len();
        debug!("opened device {:?} ({} bytes)", path, size);
        Ok(Self {
            path,
            file: Mutex::new(file),
            size,
        })
    }

    /// Create (or truncate) an image file of `size` bytes
    pub fn create(path: impl AsRef<Path>, size: u64) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(size)?;
        debug!("created image {:?} ({} bytes)", path, size);
        Ok(Self {
            path,
            file: Mutex::new(file),
            size,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Debug for FileDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileDevice")
            .field("path", &self.path)
            .field("size", &self.size)
            .finish()
    }
}

impl BlockDevice for FileDevice {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        if offset + buf.len() as u64 > self.size {
            return Err(out_of_range(offset, buf.len(), self.size));
        }
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        trace!("read {} bytes at {}", buf.len(), offset);
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        if offset + buf.len() as u64 > self.size {
            return Err(out_of_range(offset, buf.len(), self.size));
        }
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;
        trace!("wrote {} bytes at {}", buf.len(), offset);
        Ok(())
    }

    fn flush(&self) -> io::Result<()> {
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.flush()?;
        file.sync_data()
    }

    fn size(&self) -> u64 {
        self.size
    }
}
