use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use crate::{
    config::MAX_SERVED_BLOCK_SIZE,
    data::{
        bitmask::Bitmask, chunk::Chunk, data_bitfield::DataBitfield,
        piece_statistics::PieceStatistics,
    },
    persistence::{
        storage::{Storage, StorageError},
        torrent::Torrent,
    },
    torrent_protocol::wire_protocol::BlockRequest,
};

#[derive(Debug, Clone, PartialEq)]
pub struct Skeleton {
    pub length: u32,
    pub block_size: u32,
    pub checksum: [u8; 20],
}

pub enum Completion {
    Incomplete,
    Corrupted,
    Ready(VerifiedChunk),
}

/// A piece that passed verification in memory and still has to reach the backing store.
pub struct VerifiedChunk {
    pub piece: u32,
    data: Vec<u8>,
    checksum: [u8; 20],
    storage: Arc<dyn Storage>,
}

impl VerifiedChunk {
    /// Writes the piece and checks it back. Meant to run without the storage lock held.
    pub fn persist(&self) -> Result<bool, StorageError> {
        self.storage.store_block(self.piece, &[self.data.as_slice()])?;
        self.storage.verify_block(self.piece, &self.checksum)
    }
}

#[cfg(test)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    Incomplete,
    Verified,
    Corrupted,
}

/// Owner of the verified truth of a transfer: piece layout, working chunks and the backing store.
pub struct DataStorage {
    torrent: Torrent,
    metadata: Vec<u8>,
    skeletons: Vec<Skeleton>,
    bitfield: DataBitfield,
    chunks: HashMap<u32, Chunk>,
    persisting: HashSet<u32>,
    storage: Arc<dyn Storage>,
}

impl DataStorage {
    pub fn initialize(
        torrent: Torrent,
        metadata: Vec<u8>,
        storage: Box<dyn Storage>,
        block_size: u32,
        selected_files: Option<&[usize]>,
    ) -> Result<Self, StorageError> {
        let pieces_total = torrent.pieces_total();
        let skeletons = (0..pieces_total)
            .map(|piece| Skeleton {
                length: torrent.chunk_length(piece),
                block_size,
                checksum: torrent.hashes[piece],
            })
            .collect();

        let mut bitfield = match storage.load_bitfield()? {
            None => DataBitfield::new(pieces_total),
            Some(snapshot) => match DataBitfield::decode(&snapshot, pieces_total) {
                Ok(bitfield) => bitfield,
                Err(e) => {
                    log::warn!("ignoring unusable verified pieces snapshot: {e}");
                    DataBitfield::new(pieces_total)
                }
            },
        };
        if let Some(selected_files) = selected_files {
            for piece in torrent.unselected_pieces(selected_files).iter_ones() {
                bitfield.skip(piece);
            }
        }
        log::debug!(
            "storage initialized: {} pieces verified out of {}, {} remaining",
            bitfield.verified_count(),
            pieces_total,
            bitfield.pieces_remaining()
        );

        Ok(DataStorage {
            torrent,
            metadata,
            skeletons,
            bitfield,
            chunks: HashMap::new(),
            persisting: HashSet::new(),
            storage: Arc::from(storage),
        })
    }

    pub fn torrent(&self) -> &Torrent {
        &self.torrent
    }

    /// Raw info dictionary, served to peers through ut_metadata.
    pub fn metadata(&self) -> &[u8] {
        &self.metadata
    }

    pub fn bitfield(&self) -> &DataBitfield {
        &self.bitfield
    }

    pub fn skeleton(&self, piece: u32) -> Option<&Skeleton> {
        self.skeletons.get(piece as usize)
    }

    /// Pieces excluded by file selection, not counted in availability.
    pub fn skipped(&self) -> Bitmask {
        let mut skipped = Bitmask::new();
        (0..self.bitfield.pieces_total())
            .filter(|p| self.bitfield.is_skipped(*p))
            .for_each(|p| skipped.set(p));
        skipped
    }

    pub fn chunk(&mut self, piece: u32) -> Result<&mut Chunk, StorageError> {
        let skeleton = self
            .skeletons
            .get(piece as usize)
            .ok_or(StorageError::PieceOutOfRange(piece))?;
        Ok(self.chunks.entry(piece).or_insert_with(|| {
            Chunk::new(piece, skeleton.length, skeleton.block_size, skeleton.checksum)
        }))
    }

    /// Bytes of pieces still to be verified, skipped pieces excluded.
    pub fn bytes_left(&self) -> u64 {
        self.skeletons
            .iter()
            .enumerate()
            .filter(|(p, _)| !self.bitfield.is_verified(*p) && !self.bitfield.is_skipped(*p))
            .map(|(_, s)| s.length as u64)
            .sum()
    }

    #[cfg(test)]
    pub fn cached_chunks(&self) -> usize {
        self.chunks.len()
    }

    /// Whether a verified copy of the piece is on its way to the backing store.
    pub fn is_persisting(&self, piece: u32) -> bool {
        self.persisting.contains(&piece)
    }

    /// Verifies a complete chunk in memory and hands it out for persisting.
    /// A corrupted chunk is reset so its blocks can be requested again.
    pub fn complete_chunk(&mut self, piece: u32) -> Completion {
        let Some(chunk) = self.chunks.get_mut(&piece) else {
            return Completion::Incomplete;
        };
        if !chunk.is_complete() {
            return Completion::Incomplete;
        }
        if !chunk.verify() {
            chunk.reset();
            return Completion::Corrupted;
        }
        let data = chunk.bytes();
        self.chunks.remove(&piece);
        self.persisting.insert(piece);
        Completion::Ready(VerifiedChunk {
            piece,
            data,
            checksum: self.skeletons[piece as usize].checksum,
            storage: self.storage.clone(),
        })
    }

    /// Records the outcome of `VerifiedChunk::persist`. Returns whether the piece is now verified;
    /// otherwise its blocks have to be fetched again.
    pub fn finish_chunk(
        &mut self,
        chunk: VerifiedChunk,
        stored: Result<bool, StorageError>,
    ) -> Result<bool, StorageError> {
        let piece = chunk.piece;
        self.persisting.remove(&piece);
        match stored {
            Ok(true) => {}
            Ok(false) | Err(_) => {
                if let Err(e) = self.storage.delete_block(piece) {
                    log::error!("could not delete piece {piece} after a failed store: {e}");
                }
                return stored.map(|_| false);
            }
        }

        self.bitfield.mark_verified(piece as usize);
        if let Err(e) = self.storage.store_bitfield(&self.bitfield.encode()) {
            log::error!("could not persist the verified pieces snapshot: {e}");
        }
        Ok(true)
    }

    #[cfg(test)]
    pub fn store_chunk(&mut self, piece: u32) -> Result<ChunkStatus, StorageError> {
        match self.complete_chunk(piece) {
            Completion::Incomplete => Ok(ChunkStatus::Incomplete),
            Completion::Corrupted => Ok(ChunkStatus::Corrupted),
            Completion::Ready(chunk) => {
                let stored = chunk.persist();
                Ok(match self.finish_chunk(chunk, stored)? {
                    true => ChunkStatus::Verified,
                    false => ChunkStatus::Corrupted,
                })
            }
        }
    }

    /// Incomplete, non skipped pieces available from some peer, rarest first.
    pub fn next_pieces(&self, statistics: &PieceStatistics) -> Vec<u32> {
        statistics
            .rarest_first()
            .into_iter()
            .filter(|p| {
                !self.bitfield.is_verified(*p as usize)
                    && !self.bitfield.is_skipped(*p as usize)
                    && !self.persisting.contains(p)
            })
            .collect()
    }

    pub fn read_block(&self, request: &BlockRequest) -> Result<Vec<u8>, StorageError> {
        let skeleton = self
            .skeleton(request.piece_idx)
            .ok_or(StorageError::PieceOutOfRange(request.piece_idx))?;
        if !self.bitfield.is_verified(request.piece_idx as usize) {
            return Err(StorageError::NotAvailable(request.piece_idx));
        }
        if request.data_len == 0
            || request.data_len > MAX_SERVED_BLOCK_SIZE
            || request.block_begin as u64 + request.data_len as u64 > skeleton.length as u64
        {
            return Err(StorageError::OutOfBounds {
                piece: request.piece_idx,
                offset: request.block_begin,
                length: request.data_len,
            });
        }
        self.storage
            .read_block(request.piece_idx, request.block_begin, Some(request.data_len))
    }
}
