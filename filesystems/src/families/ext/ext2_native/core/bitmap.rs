// Bitmap management for ext2 block and inode allocation
// Bit n lives in byte n / 8 at position n % 8; a set bit means "in use"

use super::block_cache::BlockRef;

/// Bitmap view over a cached bitmap block covering `size_bits` entries.
///
/// Every mutating operation runs under the buffer's write lock, so two
/// threads racing for the same bit see exactly one winner.
#[derive(Debug, Clone)]
pub struct Bitmap {
    block: BlockRef,
    size_bits: u32,
}

impl Bitmap {
    pub fn new(block: BlockRef, size_bits: u32) -> Self {
        Self { block, size_bits }
    }

    pub fn block(&self) -> &BlockRef {
        &self.block
    }

    pub fn size_bits(&self) -> u32 {
        self.size_bits
    }

    /// Set a bit, returning its previous state
    pub fn test_and_set(&self, index: u32) -> bool {
        if index >= self.size_bits {
            return true;
        }
        let mut data = self.block.write();
        let byte = (index / 8) as usize;
        let mask = 1u8 << (index % 8);
        let was_set = data[byte] & mask != 0;
        data[byte] |= mask;
        was_set
    }

    /// Clear a bit, returning its previous state
    pub fn test_and_clear(&self, index: u32) -> bool {
        if index >= self.size_bits {
            return false;
        }
        let mut data = self.block.write();
        let byte = (index / 8) as usize;
        let mask = 1u8 << (index % 8);
        let was_set = data[byte] & mask != 0;
        data[byte] &= !mask;
        was_set
    }

    pub fn is_set(&self, index: u32) -> bool {
        if index >= self.size_bits {
            return false;
        }
        let data = self.block.read();
        data[(index / 8) as usize] & (1 << (index % 8)) != 0
    }

    /// First clear bit in `[start, limit)`, where `limit` is clamped to the bitmap size
    pub fn find_next_zero(&self, start: u32, limit: u32) -> Option<u32> {
        let limit = limit.min(self.size_bits);
        let data = self.block.read();
        let mut index = start;
        while index < limit {
            let byte = data[(index / 8) as usize];
            // whole byte in use: jump to the next byte boundary
            if index % 8 == 0 && byte == 0xFF {
                index += 8;
                continue;
            }
            if byte & (1 << (index % 8)) == 0 {
                return Some(index);
            }
            index += 1;
        }
        None
    }

    /// Number of clear bits in `[0, limit)`
    pub fn count_free(&self, limit: u32) -> u32 {
        let limit = limit.min(self.size_bits);
        let data = self.block.read();
        let full_bytes = (limit / 8) as usize;
        let mut used: u32 = data[..full_bytes].iter().map(|b| b.count_ones()).sum();
        for index in (full_bytes as u32 * 8)..limit {
            if data[(index / 8) as usize] & (1 << (index % 8)) != 0 {
                used += 1;
            }
        }
        limit - used
    }

    /// Mark every bit from `start` to the end of the block as used.
    /// Used to pad the tail of a short last group.
    pub fn mark_end(&self, start: u32) {
        let mut data = self.block.write();
        let total = data.len() as u32 * 8;
        for index in start..total {
            data[(index / 8) as usize] |= 1 << (index % 8);
        }
    }
}
