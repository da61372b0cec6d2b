// ext2 Directory Entry Management
// Linear directories: variable-length records packed into whole blocks

use byteorder::{ByteOrder, LittleEndian};
use log::{error, trace};
use std::sync::Arc;

use super::Ext2Fs;
use crate::families::ext::ext2_native::core::{
    block_cache::BlockRef,
    constants::*,
    inode::Ext2InodeInfo,
    structures::{decode_rec_len, encode_rec_len},
    types::*,
};

/// Smallest record that can hold a `name_len`-byte name
pub const fn dir_rec_len(name_len: usize) -> usize {
    (name_len + DIR_ENTRY_HEADER_LEN + 3) & !3
}

/// A live directory record as seen by iteration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub ino: InodeNumber,
    pub name: String,
    pub file_type: FileType,
    /// Cursor of this record
    pub offset: u64,
    /// Cursor to resume iteration after this record
    pub next: u64,
}

/// Position of a live record. Only meaningful while the directory lock is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirSlot {
    /// Logical block of the directory
    pub block: u64,
    /// Byte offset inside that block
    pub offset: usize,
    pub ino: InodeNumber,
}

#[derive(Debug, Clone, Copy)]
struct RawDirent {
    inode: u32,
    rec_len: usize,
    name_len: usize,
    file_type: u8,
}

fn read_dirent(data: &[u8], off: usize) -> RawDirent {
    RawDirent {
        inode: LittleEndian::read_u32(&data[off..]),
        rec_len: decode_rec_len(LittleEndian::read_u16(&data[off + 4..])) as usize,
        name_len: data[off + 6] as usize,
        file_type: data[off + 7],
    }
}

fn write_dirent(data: &mut [u8], off: usize, inode: u32, rec_len: usize, name: &[u8], file_type: u8) {
    LittleEndian::write_u32(&mut data[off..], inode);
    LittleEndian::write_u16(&mut data[off + 4..], encode_rec_len(rec_len as u32));
    data[off + 6] = name.len() as u8;
    data[off + 7] = file_type;
    data[off + DIR_ENTRY_HEADER_LEN..off + DIR_ENTRY_HEADER_LEN + name.len()].copy_from_slice(name);
}

fn set_rec_len(data: &mut [u8], off: usize, rec_len: usize) {
    LittleEndian::write_u16(&mut data[off + 4..], encode_rec_len(rec_len as u32));
}

fn dirent_name<'a>(data: &'a [u8], off: usize, de: &RawDirent) -> &'a [u8] {
    &data[off + DIR_ENTRY_HEADER_LEN..off + DIR_ENTRY_HEADER_LEN + de.name_len]
}

fn matches(data: &[u8], off: usize, de: &RawDirent, name: &[u8]) -> bool {
    de.inode != 0 && de.name_len == name.len() && dirent_name(data, off, de) == name
}

// First record boundary at or after `offset`
fn realign(data: &[u8], offset: usize) -> usize {
    let mut p = 0;
    while p < offset {
        let rec_len = read_dirent(data, p).rec_len;
        if rec_len == 0 {
            break;
        }
        p += rec_len;
    }
    p
}

/// Validate a name for a new directory record
pub fn check_name(name: &str) -> Ext2Result<&[u8]> {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.contains(&b'/') || bytes.contains(&0) {
        return Err(StrataError::InvalidArgument(format!("invalid name {:?}", name)));
    }
    if bytes.len() > EXT2_NAME_LEN {
        return Err(StrataError::NameTooLong(bytes.len()));
    }
    Ok(bytes)
}

impl Ext2Fs {
    fn dir_block_count(&self, dir: &Ext2InodeInfo) -> Ext2Result<u64> {
        let bs = self.volume.block_size() as u64;
        let size = dir.size();
        if size % bs != 0 {
            error!("directory #{}: size {} is not a multiple of the block size", dir.ino(), size);
            return Err(corrupted(format!("directory {} has a partial block", dir.ino())));
        }
        Ok(size / bs)
    }

    /// Read and validate logical block `n` of a directory
    fn dir_block(&self, dir: &Ext2InodeInfo, n: u64) -> Ext2Result<BlockRef> {
        let physical = self.bmap(dir, n)?.ok_or_else(|| {
            error!("directory #{}: hole at block {}", dir.ino(), n);
            corrupted(format!("hole in directory {} at block {}", dir.ino(), n))
        })?;
        let bh = self.volume.cache().bread(physical)?;
        self.check_dir_block(dir, n, &bh.read())?;
        Ok(bh)
    }

    // Every record must be aligned, hold its name, stay inside the block and
    // name a plausible inode; the records must tile the block exactly
    fn check_dir_block(&self, dir: &Ext2InodeInfo, n: u64, data: &[u8]) -> Ext2Result<()> {
        let limit = data.len();
        let max_ino = self.volume.geometry().inodes_count;
        let bad = |offs: usize, what: &str, de: Option<RawDirent>| {
            let (inode, rec_len, name_len) = de.map_or((0, 0, 0), |d| (d.inode, d.rec_len, d.name_len));
            error!(
                "bad entry in directory #{}: {} - offset={}, inode={}, rec_len={}, name_len={}",
                dir.ino(),
                what,
                n * limit as u64 + offs as u64,
                inode,
                rec_len,
                name_len
            );
            Err(corrupted(format!("directory {} block {}: {}", dir.ino(), n, what)))
        };

        let mut offs = 0;
        while offs + dir_rec_len(1) <= limit {
            let de = read_dirent(data, offs);
            if de.rec_len < dir_rec_len(1) {
                return bad(offs, "rec_len is smaller than minimal", Some(de));
            }
            if de.rec_len % 4 != 0 {
                return bad(offs, "unaligned directory entry", Some(de));
            }
            if de.rec_len < dir_rec_len(de.name_len) {
                return bad(offs, "rec_len is too small for name_len", Some(de));
            }
            if offs + de.rec_len > limit {
                return bad(offs, "directory entry across blocks", Some(de));
            }
            if de.inode > max_ino {
                return bad(offs, "inode out of bounds", Some(de));
            }
            offs += de.rec_len;
        }
        if offs != limit {
            return bad(offs, "entry does not end at block boundary", None);
        }
        Ok(())
    }

    fn dirent_type(&self, inode: &Ext2InodeInfo) -> u8 {
        if self.volume.has_filetype() {
            inode.file_type().dirent_tag()
        } else {
            EXT2_FT_UNKNOWN
        }
    }

    // Write back a changed directory block, growing the directory if the
    // change reached past its end
    fn commit_dir_block(&self, dir: &Ext2InodeInfo, bh: &BlockRef, end: u64) -> Ext2Result<()> {
        let dirsync = self.is_dirsync(dir);
        self.volume.dirty_buffer(bh, dirsync)?;
        let now = now_secs();
        dir.update(|raw| {
            if end > raw.size() {
                raw.set_size(end);
            }
            raw.i_mtime = now;
            raw.i_ctime = now;
            raw.i_flags &= !EXT2_BTREE_FL;
        });
        if dirsync {
            self.write_inode(dir, true)?;
        }
        Ok(())
    }

    /// Find the live record called `name`.
    ///
    /// The scan starts at the block of the previous hit and wraps around.
    pub fn find_entry(&self, dir: &Ext2InodeInfo, name: &str) -> Ext2Result<Option<DirSlot>> {
        let name = name.as_bytes();
        let nblocks = self.dir_block_count(dir)?;
        if nblocks == 0 || name.len() > EXT2_NAME_LEN {
            return Ok(None);
        }
        let reclen = dir_rec_len(name.len());
        let bs = self.volume.block_size() as usize;

        let start = match dir.dir_start_lookup() as u64 {
            s if s >= nblocks => 0,
            s => s,
        };
        let mut n = start;
        loop {
            let bh = self.dir_block(dir, n)?;
            let data = bh.read();
            let mut off = 0;
            while off + reclen <= bs {
                let de = read_dirent(&data, off);
                if de.rec_len == 0 {
                    error!("directory #{}: zero-length directory entry", dir.ino());
                    return Err(corrupted("zero-length directory entry"));
                }
                if matches(&data, off, &de, name) {
                    dir.set_dir_start_lookup(n as u32);
                    return Ok(Some(DirSlot {
                        block: n,
                        offset: off,
                        ino: de.inode,
                    }));
                }
                off += de.rec_len;
            }
            n += 1;
            if n >= nblocks {
                n = 0;
            }
            if n == start {
                return Ok(None);
            }
        }
    }

    /// Inode number recorded under `name`, if any
    pub fn inode_by_name(&self, dir: &Ext2InodeInfo, name: &str) -> Ext2Result<Option<InodeNumber>> {
        Ok(self.find_entry(dir, name)?.map(|slot| slot.ino))
    }

    /// Insert a record for `inode` under `name`.
    ///
    /// Reuses a free record or splits the slack off a live one; when no block
    /// has room a new block is added at the end of the directory. The caller
    /// holds the directory lock.
    pub fn add_link(&self, dir: &Ext2InodeInfo, name: &str, inode: &Ext2InodeInfo) -> Ext2Result<()> {
        let name = check_name(name)?;
        let reclen = dir_rec_len(name.len());
        let bs = self.volume.block_size() as usize;
        let nblocks = self.dir_block_count(dir)?;
        let file_type = self.dirent_type(inode);

        for n in 0..=nblocks {
            let bh = if n < nblocks {
                self.dir_block(dir, n)?
            } else {
                // past the end: one free record spanning a fresh block
                let mapping = self
                    .get_blocks(dir, n, 1, true)?
                    .ok_or_else(|| corrupted("directory block allocation returned nothing"))?;
                let bh = self.volume.cache().getblk(mapping.physical);
                {
                    let mut data = bh.write();
                    data.fill(0);
                    write_dirent(&mut data, 0, 0, bs, &[], 0);
                }
                trace!("directory #{}: added block {} at {}", dir.ino(), n, mapping.physical);
                bh
            };

            let end = {
                let mut data = bh.write();
                let mut found = None;
                let mut off = 0;
                while off + reclen <= bs {
                    let de = read_dirent(&data, off);
                    if de.rec_len == 0 {
                        error!("directory #{}: zero-length directory entry", dir.ino());
                        return Err(corrupted("zero-length directory entry"));
                    }
                    if matches(&data, off, &de, name) {
                        return Err(StrataError::AlreadyExists(String::from_utf8_lossy(name).into_owned()));
                    }
                    let used = dir_rec_len(de.name_len);
                    if (de.inode == 0 && de.rec_len >= reclen) || de.rec_len >= used + reclen {
                        found = Some((off, de));
                        break;
                    }
                    off += de.rec_len;
                }
                match found {
                    None => None,
                    Some((off, de)) => {
                        let (off, rec_len) = if de.inode != 0 {
                            let used = dir_rec_len(de.name_len);
                            set_rec_len(&mut data, off, used);
                            (off + used, de.rec_len - used)
                        } else {
                            (off, de.rec_len)
                        };
                        write_dirent(&mut data, off, inode.ino(), rec_len, name, file_type);
                        Some(n * bs as u64 + (off + rec_len) as u64)
                    }
                }
            };
            if let Some(end) = end {
                self.commit_dir_block(dir, &bh, end)?;
                trace!(
                    "directory #{}: linked {:?} -> {}",
                    dir.ino(),
                    String::from_utf8_lossy(name),
                    inode.ino()
                );
                return Ok(());
            }
        }
        // the fresh block always has room
        Err(corrupted(format!("no room for a record in directory {}", dir.ino())))
    }

    /// Remove the record at `slot`. Its space is folded into the preceding
    /// record when that one is free; otherwise it stays as a free record.
    pub fn delete_entry(&self, dir: &Ext2InodeInfo, slot: &DirSlot) -> Ext2Result<()> {
        let bh = self.dir_block(dir, slot.block)?;
        let bs = self.volume.block_size() as u64;
        {
            let mut data = bh.write();
            let de = read_dirent(&data, slot.offset);
            if de.inode != slot.ino {
                error!("directory #{}: entry at {} changed under us", dir.ino(), slot.offset);
                return Err(corrupted("directory entry moved"));
            }

            let mut prev = None;
            let mut p = 0;
            while p < slot.offset {
                let rec_len = read_dirent(&data, p).rec_len;
                if rec_len == 0 {
                    error!("directory #{}: zero-length directory entry", dir.ino());
                    return Err(corrupted("zero-length directory entry"));
                }
                prev = Some(p);
                p += rec_len;
            }

            LittleEndian::write_u32(&mut data[slot.offset..], 0);
            if let Some(p) = prev {
                if read_dirent(&data, p).inode == 0 {
                    set_rec_len(&mut data, p, slot.offset + de.rec_len - p);
                }
            }
        }
        self.commit_dir_block(dir, &bh, slot.block * bs)
    }

    /// Point the record at `slot` to `inode`
    pub fn set_link(
        &self,
        dir: &Ext2InodeInfo,
        slot: &DirSlot,
        inode: &Ext2InodeInfo,
        update_times: bool,
    ) -> Ext2Result<()> {
        let bh = self.dir_block(dir, slot.block)?;
        let file_type = self.dirent_type(inode);
        {
            let mut data = bh.write();
            LittleEndian::write_u32(&mut data[slot.offset..], inode.ino());
            data[slot.offset + 7] = file_type;
        }
        if update_times {
            return self.commit_dir_block(dir, &bh, 0);
        }
        self.volume.dirty_buffer(&bh, self.is_dirsync(dir))?;
        dir.update(|raw| raw.i_flags &= !EXT2_BTREE_FL);
        Ok(())
    }

    /// True when the only live records are "." (naming the directory itself) and ".."
    pub fn is_empty_dir(&self, dir: &Ext2InodeInfo) -> Ext2Result<bool> {
        let bs = self.volume.block_size() as usize;
        for n in 0..self.dir_block_count(dir)? {
            let bh = self.dir_block(dir, n)?;
            let data = bh.read();
            let mut off = 0;
            while off + dir_rec_len(1) <= bs {
                let de = read_dirent(&data, off);
                if de.rec_len == 0 {
                    error!("directory #{}: zero-length directory entry", dir.ino());
                    return Ok(false);
                }
                if de.inode != 0 {
                    let name = dirent_name(&data, off, &de);
                    let ok = match name {
                        b"." => de.inode == dir.ino(),
                        b".." => true,
                        _ => false,
                    };
                    if !ok {
                        return Ok(false);
                    }
                }
                off += de.rec_len;
            }
        }
        Ok(true)
    }

    /// Write the first block of a new directory: "." then ".." over the rest
    pub fn make_empty(&self, inode: &Ext2InodeInfo, parent: &Ext2InodeInfo) -> Ext2Result<()> {
        let bs = self.volume.block_size() as usize;
        let mapping = self
            .get_blocks(inode, 0, 1, true)?
            .ok_or_else(|| corrupted("directory block allocation returned nothing"))?;
        let bh = self.volume.cache().getblk(mapping.physical);
        let file_type = self.dirent_type(inode);
        {
            let mut data = bh.write();
            data.fill(0);
            write_dirent(&mut data, 0, inode.ino(), dir_rec_len(1), b".", file_type);
            write_dirent(&mut data, dir_rec_len(1), parent.ino(), bs - dir_rec_len(1), b"..", file_type);
        }
        self.commit_dir_block(inode, &bh, bs as u64)
    }

    /// The ".." record of a directory
    pub fn dotdot(&self, dir: &Ext2InodeInfo) -> Ext2Result<DirSlot> {
        let bh = self.dir_block(dir, 0)?;
        let data = bh.read();
        let first = read_dirent(&data, 0);
        let off = first.rec_len;
        if off + dir_rec_len(2) > data.len() {
            return Err(corrupted(format!("directory {} has no '..' record", dir.ino())));
        }
        let de = read_dirent(&data, off);
        if dirent_name(&data, off, &de) != b".." {
            error!("directory #{}: second record is not '..'", dir.ino());
            return Err(corrupted(format!("directory {} has no '..' record", dir.ino())));
        }
        Ok(DirSlot {
            block: 0,
            offset: off,
            ino: de.inode,
        })
    }

    /// Lazily iterate the live records of `dir` from `cursor`.
    ///
    /// Cursors come from [`DirEntry::next`] (or 0); a cursor that no longer
    /// falls on a record boundary resumes at the next record.
    pub fn dir_iter(&self, dir: &Arc<Ext2InodeInfo>, cursor: u64) -> DirIter<'_> {
        DirIter {
            fs: self,
            dir: Arc::clone(dir),
            pos: cursor,
            done: false,
        }
    }
}

/// Iterator over the live records of a directory
pub struct DirIter<'a> {
    fs: &'a Ext2Fs,
    dir: Arc<Ext2InodeInfo>,
    pos: u64,
    done: bool,
}

impl DirIter<'_> {
    /// Cursor the next call resumes from
    pub fn cursor(&self) -> u64 {
        self.pos
    }

    fn advance(&mut self) -> Ext2Result<Option<DirEntry>> {
        let bs = self.fs.volume.block_size() as u64;
        let size = self.dir.size();
        while self.pos < size {
            let n = self.pos / bs;
            let bh = self.fs.dir_block(&self.dir, n)?;
            let data = bh.read();
            let mut off = realign(&data, (self.pos % bs) as usize);
            while off + dir_rec_len(1) <= bs as usize {
                let de = read_dirent(&data, off);
                if de.rec_len == 0 {
                    return Err(corrupted("zero-length directory entry"));
                }
                let rec_off = off;
                off += de.rec_len;
                self.pos = n * bs + off as u64;
                if de.inode != 0 {
                    let name = dirent_name(&data, rec_off, &de);
                    return Ok(Some(DirEntry {
                        ino: de.inode,
                        name: String::from_utf8_lossy(name).into_owned(),
                        file_type: FileType::from_dirent_tag(de.file_type),
                        offset: n * bs + rec_off as u64,
                        next: self.pos,
                    }));
                }
            }
            self.pos = (n + 1) * bs;
        }
        Ok(None)
    }
}

impl Iterator for DirIter<'_> {
    type Item = Ext2Result<DirEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.advance() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
