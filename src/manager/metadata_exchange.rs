use sha1::{Digest, Sha1};

use crate::torrent_protocol::extension::{
    metadata_block_count, MAX_METADATA_SIZE, METADATA_BLOCK_SIZE,
};

#[derive(Debug)]
enum State {
    Unsent,
    Partial {
        total_size: usize,
        blocks: Vec<Option<Vec<u8>>>,
    },
    Complete,
}

#[derive(Debug, PartialEq)]
pub enum Progress {
    Ignored,
    Progress,
    Complete(Vec<u8>),
    Mismatch,
}

/// Assembles the info dictionary from ut_metadata blocks, shared by every connection of a transfer.
#[derive(Debug)]
pub struct MetadataExchange {
    info_hash: [u8; 20],
    state: State,
    generation: u64, // bumped on every restart
}

impl MetadataExchange {
    pub fn new(info_hash: [u8; 20]) -> Self {
        MetadataExchange {
            info_hash,
            state: State::Unsent,
            generation: 0,
        }
    }

    /// An exchange that has nothing left to fetch, for transfers started from a .torrent file.
    pub fn complete(info_hash: [u8; 20]) -> Self {
        MetadataExchange {
            info_hash,
            state: State::Complete,
            generation: 0,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.state, State::Complete)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// (received, total) blocks, total is unknown until the first block arrives.
    pub fn blocks(&self) -> (usize, Option<usize>) {
        match &self.state {
            State::Unsent => (0, None),
            State::Partial { blocks, .. } => {
                (blocks.iter().filter(|b| b.is_some()).count(), Some(blocks.len()))
            }
            State::Complete => (0, Some(0)),
        }
    }

    /// Blocks to ask for: only the first one while the size is unknown.
    pub fn missing_blocks(&self) -> Vec<u32> {
        match &self.state {
            State::Unsent => vec![0],
            State::Partial { blocks, .. } => blocks
                .iter()
                .enumerate()
                .filter(|(_, b)| b.is_none())
                .map(|(i, _)| i as u32)
                .collect(),
            State::Complete => Vec::new(),
        }
    }

    pub fn receive(&mut self, piece: u32, total_size: usize, data: Vec<u8>) -> Progress {
        if let State::Unsent = self.state {
            if total_size == 0 || total_size > MAX_METADATA_SIZE {
                log::debug!("ignoring metadata block with total size {total_size}");
                return Progress::Ignored;
            }
            self.state = State::Partial {
                total_size,
                blocks: vec![None; metadata_block_count(total_size)],
            };
        }

        let State::Partial {
            total_size: expected_size,
            blocks,
        } = &mut self.state
        else {
            return Progress::Ignored;
        };
        if total_size != *expected_size {
            log::debug!("ignoring metadata block: total size {total_size} instead of {expected_size}");
            return Progress::Ignored;
        }
        let index = piece as usize;
        let start = index * METADATA_BLOCK_SIZE;
        if index >= blocks.len() || blocks[index].is_some() {
            return Progress::Ignored;
        }
        if data.len() != METADATA_BLOCK_SIZE.min(*expected_size - start) {
            log::debug!("ignoring metadata block {piece} of length {}", data.len());
            return Progress::Ignored;
        }
        blocks[index] = Some(data);
        if blocks.iter().any(Option::is_none) {
            return Progress::Progress;
        }

        let metadata: Vec<u8> = blocks.iter().flatten().flatten().copied().collect();
        let digest: [u8; 20] = Sha1::digest(&metadata).into();
        if digest == self.info_hash {
            self.state = State::Complete;
            Progress::Complete(metadata)
        } else {
            log::warn!("received metadata does not match the info hash, starting over");
            self.restart();
            Progress::Mismatch
        }
    }

    pub fn restart(&mut self) {
        self.state = State::Unsent;
        self.generation += 1;
    }
}
