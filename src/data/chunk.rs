use std::collections::BTreeMap;

use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::data::block_set::BlockSet;

#[derive(Debug, Error, PartialEq)]
pub enum BlockError {
    #[error("block offset {0} is not aligned to a block boundary")]
    Misaligned(u32),
    #[error("block at offset {offset} has length {len}, expected {expected}")]
    WrongLength { offset: u32, len: usize, expected: u32 },
}

/// Working buffer assembling the blocks of one piece.
#[derive(Debug)]
pub struct Chunk {
    index: u32,
    checksum: [u8; 20],
    blocks: BTreeMap<u32, Vec<u8>>, // offset -> data
    block_set: BlockSet,
}

impl Chunk {
    pub fn new(index: u32, length: u32, block_size: u32, checksum: [u8; 20]) -> Self {
        Chunk {
            index,
            checksum,
            blocks: BTreeMap::new(),
            block_set: BlockSet::new(length, block_size),
        }
    }

    #[cfg(test)]
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn block_set(&self) -> &BlockSet {
        &self.block_set
    }

    pub fn write_block(&mut self, offset: u32, data: Vec<u8>) -> Result<(), BlockError> {
        let block_size = self.block_set.block_size();
        if offset % block_size != 0 || offset as usize / block_size as usize >= self.block_set.block_count() {
            return Err(BlockError::Misaligned(offset));
        }
        let expected = self.block_set.block_length((offset / block_size) as usize);
        if data.len() != expected as usize {
            return Err(BlockError::WrongLength {
                offset,
                len: data.len(),
                expected,
            });
        }
        self.block_set.mark_available(offset, expected);
        self.blocks.insert(offset, data);
        Ok(())
    }

    pub fn has_block(&self, offset: u32) -> bool {
        self.blocks.contains_key(&offset)
    }

    pub fn is_complete(&self) -> bool {
        self.block_set.is_complete()
    }

    /// Blocks concatenated in offset order.
    pub fn bytes(&self) -> Vec<u8> {
        self.blocks.values().flatten().copied().collect()
    }

    pub fn verify(&self) -> bool {
        if !self.is_complete() {
            return false;
        }
        let mut hasher = Sha1::new();
        for data in self.blocks.values() {
            hasher.update(data);
        }
        let digest: [u8; 20] = hasher.finalize().into();
        digest == self.checksum
    }

    pub fn reset(&mut self) {
        log::trace!("piece {}: dropping {} blocks", self.index, self.blocks.len());
        self.blocks.clear();
        self.block_set.clear();
    }
}
