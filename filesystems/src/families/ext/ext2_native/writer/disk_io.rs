// Inode table I/O for the ext2 writer

use log::trace;

use super::Ext2Fs;
use crate::families::ext::ext2_native::core::{
    constants::*,
    inode::Ext2InodeInfo,
    structures::Ext2Inode,
    types::*,
};

impl Ext2Fs {
    /// Read an inode record from its inode table block
    pub(super) fn read_inode(&self, ino: InodeNumber) -> Ext2Result<Ext2Inode> {
        let (block, offset) = self.volume.inode_location(ino)?;
        let bh = self.volume.cache().bread(block)?;
        let data = bh.read();
        Ext2Inode::from_bytes(&data[offset..offset + EXT2_INODE_RECORD_SIZE])
    }

    /// Copy the in-memory inode into its table block.
    /// Bytes past the 128-byte base record are left alone.
    pub(super) fn write_inode(&self, inode: &Ext2InodeInfo, sync: bool) -> Ext2Result<()> {
        let (block, offset) = self.volume.inode_location(inode.ino())?;
        let bh = self.volume.cache().bread(block)?;
        // Clear first so a change racing with the copy stays dirty
        inode.mark_clean();
        let raw = inode.to_disk();
        {
            let mut data = bh.write();
            raw.write_to(&mut data[offset..offset + EXT2_INODE_RECORD_SIZE]);
        }
        if let Err(e) = self.volume.dirty_buffer(&bh, sync) {
            inode.mark_dirty();
            return Err(e);
        }
        trace!("inode {} written to block {} offset {}", inode.ino(), block, offset);
        Ok(())
    }

    /// Write every dirty cached inode back to the inode tables
    pub(super) fn write_dirty_inodes(&self) -> Ext2Result<()> {
        for inode in self.inodes.dirty_inodes() {
            self.write_inode(&inode, false)?;
        }
        Ok(())
    }
}
