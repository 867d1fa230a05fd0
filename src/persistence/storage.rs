use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};
#[cfg(test)]
use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::util::pretty_info_hash;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("piece {0} is out of range")]
    PieceOutOfRange(u32),
    #[error("range {offset}+{length} is outside piece {piece}")]
    OutOfBounds { piece: u32, offset: u32, length: u32 },
    #[error("piece {0} is not available")]
    NotAvailable(u32),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Byte store keyed by piece index, plus the verified pieces snapshot.
/// Shared between the storage lock holder and the tasks persisting verified pieces.
pub trait Storage: Send + Sync {
    /// Reads `length` bytes at `offset` of a stored piece, or up to its end when `length` is None.
    fn read_block(&self, piece: u32, offset: u32, length: Option<u32>) -> Result<Vec<u8>, StorageError>;
    /// Stores a whole piece given as its blocks in offset order.
    fn store_block(&self, piece: u32, blocks: &[&[u8]]) -> Result<(), StorageError>;
    fn verify_block(&self, piece: u32, checksum: &[u8; 20]) -> Result<bool, StorageError>;
    fn delete_block(&self, piece: u32) -> Result<(), StorageError>;
    fn load_bitfield(&self) -> Result<Option<Vec<u8>>, StorageError>;
    fn store_bitfield(&self, bitfield: &[u8]) -> Result<(), StorageError>;
}

pub type StorageFactory = Box<dyn Fn([u8; 20]) -> Box<dyn Storage> + Send + Sync>;

fn slice_block(piece: u32, data: &[u8], offset: u32, length: Option<u32>) -> Result<Vec<u8>, StorageError> {
    let start = offset as usize;
    let end = match length {
        Some(length) => start + length as usize,
        None => data.len(),
    };
    if start > data.len() || end > data.len() || start > end {
        return Err(StorageError::OutOfBounds {
            piece,
            offset,
            length: length.unwrap_or(0),
        });
    }
    Ok(data[start..end].to_vec())
}

/// One file per stored piece and a `bitfield` snapshot under `<base>/<hex info hash>/`.
pub struct DirectoryStorage {
    dir: PathBuf,
}

impl DirectoryStorage {
    pub fn new(base_path: &Path, info_hash: [u8; 20]) -> Self {
        DirectoryStorage {
            dir: base_path.join(pretty_info_hash(info_hash)),
        }
    }

    fn piece_path(&self, piece: u32) -> PathBuf {
        self.dir.join("pieces").join(piece.to_string())
    }

    fn bitfield_path(&self) -> PathBuf {
        self.dir.join("bitfield")
    }

    fn read_piece(&self, piece: u32) -> Result<Vec<u8>, StorageError> {
        match fs::read(self.piece_path(piece)) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StorageError::NotAvailable(piece)),
            Err(e) => Err(e.into()),
        }
    }
}

impl Storage for DirectoryStorage {
    fn read_block(&self, piece: u32, offset: u32, length: Option<u32>) -> Result<Vec<u8>, StorageError> {
        slice_block(piece, &self.read_piece(piece)?, offset, length)
    }

    fn store_block(&self, piece: u32, blocks: &[&[u8]]) -> Result<(), StorageError> {
        let path = self.piece_path(piece);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        // a piece file only appears once fully written
        let tmp = path.with_extension("part");
        fs::write(&tmp, blocks.concat())?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn verify_block(&self, piece: u32, checksum: &[u8; 20]) -> Result<bool, StorageError> {
        match self.read_piece(piece) {
            Ok(data) => Ok(Sha1::digest(&data).as_slice() == checksum),
            Err(StorageError::NotAvailable(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn delete_block(&self, piece: u32) -> Result<(), StorageError> {
        match fs::remove_file(self.piece_path(piece)) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn load_bitfield(&self) -> Result<Option<Vec<u8>>, StorageError> {
        match fs::read(self.bitfield_path()) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn store_bitfield(&self, bitfield: &[u8]) -> Result<(), StorageError> {
        fs::create_dir_all(&self.dir)?;
        let tmp = self.bitfield_path().with_extension("part");
        fs::write(&tmp, bitfield)?;
        fs::rename(&tmp, self.bitfield_path())?;
        Ok(())
    }
}

/// Pieces kept in memory, for tests.
#[cfg(test)]
#[derive(Default, Debug)]
pub struct MemoryStorage {
    pieces: Mutex<HashMap<u32, Vec<u8>>>,
    bitfield: Mutex<Option<Vec<u8>>>,
}

#[cfg(test)]
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .expect("another user panicked while holding the lock")
}

#[cfg(test)]
impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Holds every piece of `data` and a snapshot marking them all verified.
    pub fn seeded(data: &[u8], chunk_size: u32) -> Self {
        let pieces: HashMap<u32, Vec<u8>> = data
            .chunks(chunk_size as usize)
            .enumerate()
            .map(|(i, c)| (i as u32, c.to_vec()))
            .collect();
        let mut bitfield = vec![0u8; pieces.len().div_ceil(8)];
        for i in 0..pieces.len() {
            bitfield[i / 8] |= 0b10000000 >> (i % 8);
        }
        MemoryStorage {
            pieces: Mutex::new(pieces),
            bitfield: Mutex::new(Some(bitfield)),
        }
    }
}

#[cfg(test)]
impl Storage for MemoryStorage {
    fn read_block(&self, piece: u32, offset: u32, length: Option<u32>) -> Result<Vec<u8>, StorageError> {
        let pieces = lock(&self.pieces);
        let data = pieces.get(&piece).ok_or(StorageError::NotAvailable(piece))?;
        slice_block(piece, data, offset, length)
    }

    fn store_block(&self, piece: u32, blocks: &[&[u8]]) -> Result<(), StorageError> {
        lock(&self.pieces).insert(piece, blocks.concat());
        Ok(())
    }

    fn verify_block(&self, piece: u32, checksum: &[u8; 20]) -> Result<bool, StorageError> {
        Ok(lock(&self.pieces)
            .get(&piece)
            .is_some_and(|data| Sha1::digest(data).as_slice() == checksum))
    }

    fn delete_block(&self, piece: u32) -> Result<(), StorageError> {
        lock(&self.pieces).remove(&piece);
        Ok(())
    }

    fn load_bitfield(&self) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(lock(&self.bitfield).clone())
    }

    fn store_bitfield(&self, bitfield: &[u8]) -> Result<(), StorageError> {
        *lock(&self.bitfield) = Some(bitfield.to_vec());
        Ok(())
    }
}
