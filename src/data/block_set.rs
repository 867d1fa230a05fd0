use crate::data::bitmask::Bitmask;

/// Tracks which blocks of a single piece have been fully written.
#[derive(Debug, Clone)]
pub struct BlockSet {
    chunk_size: u32,
    block_size: u32,
    present: Bitmask,
}

impl BlockSet {
    pub fn new(chunk_size: u32, block_size: u32) -> Self {
        assert!(block_size > 0);
        BlockSet {
            chunk_size,
            block_size,
            present: Bitmask::new(),
        }
    }

    pub fn block_count(&self) -> usize {
        self.chunk_size.div_ceil(self.block_size) as usize
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn block_offset(&self, block: usize) -> u32 {
        block as u32 * self.block_size
    }

    // the last block may be shorter
    pub fn block_length(&self, block: usize) -> u32 {
        let offset = self.block_offset(block);
        self.block_size.min(self.chunk_size - offset)
    }

    /// Marks every block whose byte range lies entirely within `[offset, offset + length)`.
    pub fn mark_available(&mut self, offset: u32, length: u32) {
        let end = (offset as u64 + length as u64).min(self.chunk_size as u64);
        let first = offset.div_ceil(self.block_size) as usize;
        for block in first..self.block_count() {
            let block_end = self.block_offset(block) as u64 + self.block_length(block) as u64;
            if block_end > end {
                break;
            }
            self.present.set(block);
        }
    }

    #[cfg(test)]
    pub fn is_present(&self, block: usize) -> bool {
        self.present.get(block)
    }

    pub fn present_count(&self) -> usize {
        self.present.cardinality()
    }

    pub fn is_complete(&self) -> bool {
        self.present.cardinality() == self.block_count()
    }

    pub fn missing_blocks(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.block_count()).filter(|b| !self.present.get(*b))
    }

    pub fn clear(&mut self) {
        self.present.clear_all();
    }
}
