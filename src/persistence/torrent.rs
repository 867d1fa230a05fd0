use std::{collections::HashMap, fmt, ops::Range, str};

use anyhow::{bail, Context, Result};
use sha1::{Digest, Sha1};
use size::{Size, Style};

use crate::{bencoding::Value, data::bitmask::Bitmask};

#[derive(PartialEq, Debug, Clone)]
pub struct TorrentFile {
    pub path: Vec<String>, // path elements, the last one being the file name
    pub length: u64,
    pub offset: u64,        // position of the first byte in the whole transfer
    pub pieces: Range<u32>, // pieces holding at least one byte of the file
}

impl TorrentFile {
    pub fn display_path(&self) -> String {
        self.path.join("/")
    }
}

/// Immutable description of a transfer, built from its info dictionary.
#[derive(PartialEq, Debug, Clone)]
pub struct Torrent {
    pub name: String,
    pub total_size: u64,
    pub chunk_size: u32,
    pub files: Vec<TorrentFile>,
    pub hashes: Vec<[u8; 20]>, // 20-byte SHA1 of each piece
    pub private: bool,
    chunk_files: Vec<Vec<usize>>, // piece -> indexes in files
}

impl fmt::Display for Torrent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let files = self
            .files
            .iter()
            .map(|f| format!("    - {} ({})", f.display_path(), Size::from_bytes(f.length)))
            .collect::<Vec<String>>()
            .join("\n");
        write!(
            f,
            "name: {}\nsize: {}\npiece length: {}\nn. pieces: {}\nprivate: {}\nfiles:\n{}",
            self.name,
            Size::from_bytes(self.total_size),
            Size::from_bytes(self.chunk_size)
                .format()
                .with_style(Style::Abbreviated),
            self.hashes.len(),
            self.private,
            files
        )
    }
}

impl Torrent {
    /// Parses a raw info dictionary, as exchanged through ut_metadata.
    pub fn from_metadata(metadata: &[u8]) -> Result<Self> {
        let value = Value::new(metadata).context("metadata is not valid bencoding")?;
        match value {
            Value::Dict(info_dict, _, _) => Self::from_info_dict(&info_dict),
            _ => bail!("metadata is not a dictionary"),
        }
    }

    /// Parses a .torrent file, returning the torrent, its info hash and the raw info dictionary bytes.
    pub fn from_torrent_file(source: &[u8]) -> Result<(Self, [u8; 20], Vec<u8>)> {
        let value = Value::new(source).context("the .torrent file is not valid bencoding")?;
        let metadata = match value.get(b"info") {
            Some(Value::Dict(_, start, end)) => source[*start..*end].to_vec(),
            _ => bail!("The .torrent file does not contain a valid \"info\""),
        };
        let info_hash: [u8; 20] = Sha1::digest(&metadata).into();
        let torrent = Self::from_metadata(&metadata)?;
        Ok((torrent, info_hash, metadata))
    }

    fn from_info_dict(info_dict: &HashMap<Vec<u8>, Value>) -> Result<Self> {
        let name = match info_dict.get(b"name".as_slice()) {
            Some(Value::Str(name)) => match str::from_utf8(name) {
                Ok(a) => a.to_string(),
                _ => bail!("\"info.name\" is not an UTF8 string"),
            },
            _ => bail!("missing a valid \"info.name\""),
        };

        let chunk_size = match info_dict.get(b"piece length".as_slice()) {
            Some(Value::Int(a)) if *a > 0 && *a <= u32::MAX as i64 => *a as u32,
            _ => bail!("missing a valid \"info.piece length\""),
        };

        let hashes = match info_dict.get(b"pieces".as_slice()) {
            Some(Value::Str(pieces)) if pieces.len() % 20 == 0 => pieces
                .chunks_exact(20)
                .map(|p| {
                    let mut piece = [0u8; 20];
                    piece.copy_from_slice(p);
                    piece
                })
                .collect::<Vec<_>>(),
            _ => bail!("\"info.pieces\" is not a string of length divisible by 20"),
        };
        if hashes.is_empty() {
            bail!("\"info.pieces\" is empty");
        }

        let private = matches!(info_dict.get(b"private".as_slice()), Some(Value::Int(1)));

        // (path, length) for either layout
        let mut file_list = Vec::new();
        if let Some(Value::Int(length)) = info_dict.get(b"length".as_slice()) {
            if *length < 0 {
                bail!("\"info.length\" cannot be < 0");
            }
            file_list.push((vec![name.clone()], *length as u64));
        } else if let Some(Value::List(files)) = info_dict.get(b"files".as_slice()) {
            for entry in files {
                let length = match entry.get(b"length") {
                    Some(Value::Int(a)) if *a >= 0 => *a as u64,
                    _ => bail!("\"info.files\" has an entry without a valid \"length\""),
                };
                let path = match entry.get(b"path") {
                    Some(Value::List(elements)) if !elements.is_empty() => elements
                        .iter()
                        .map(|e| match e {
                            Value::Str(a) => str::from_utf8(a)
                                .map(|s| s.to_string())
                                .context("\"info.files\" has a path element that is not UTF8"),
                            _ => bail!("\"info.files\" has a path element that is not a string"),
                        })
                        .collect::<Result<Vec<_>>>()?,
                    _ => bail!("\"info.files\" has an entry without a valid \"path\""),
                };
                if path.iter().any(|p| p.is_empty() || p == ".." || p.contains('/')) {
                    bail!("\"info.files\" has an unsafe path {:?}", path);
                }
                file_list.push((path, length));
            }
        } else {
            bail!("missing either a valid \"info.length\" or \"info.files\"");
        }

        let total_size: u64 = file_list.iter().map(|(_, l)| l).sum();
        let max_size = chunk_size as u64 * hashes.len() as u64;
        if total_size > max_size || total_size <= max_size - chunk_size as u64 {
            bail!(
                "total size {total_size} does not match {} pieces of {chunk_size} bytes",
                hashes.len()
            );
        }

        let mut chunk_files = vec![Vec::new(); hashes.len()];
        let mut files = Vec::new();
        let mut offset = 0;
        for (i, (path, length)) in file_list.into_iter().enumerate() {
            let pieces = if length == 0 {
                0..0
            } else {
                let first = (offset / chunk_size as u64) as u32;
                let last = ((offset + length - 1) / chunk_size as u64) as u32;
                first..last + 1
            };
            for piece in pieces.clone() {
                chunk_files[piece as usize].push(i);
            }
            files.push(TorrentFile {
                path,
                length,
                offset,
                pieces,
            });
            offset += length;
        }

        Ok(Torrent {
            name,
            total_size,
            chunk_size,
            files,
            hashes,
            private,
            chunk_files,
        })
    }

    pub fn pieces_total(&self) -> usize {
        self.hashes.len()
    }

    // the last piece may be shorter
    pub fn chunk_length(&self, piece: usize) -> u32 {
        let offset = piece as u64 * self.chunk_size as u64;
        (self.total_size - offset).min(self.chunk_size as u64) as u32
    }

    pub fn files_of_chunk(&self, piece: usize) -> &[usize] {
        &self.chunk_files[piece]
    }

    /// Pieces that hold no byte of any selected file.
    pub fn unselected_pieces(&self, selected_files: &[usize]) -> Bitmask {
        let mut skipped = Bitmask::new();
        for piece in 0..self.pieces_total() {
            if !self.files_of_chunk(piece).iter().any(|f| selected_files.contains(f)) {
                skipped.set(piece);
            }
        }
        skipped
    }

    /// Info dictionary of a single file transfer holding `data`.
    #[cfg(test)]
    pub fn single_file_metadata(name: &str, data: &[u8], piece_length: u32, private: bool) -> Vec<u8> {
        let pieces: Vec<u8> = data
            .chunks(piece_length as usize)
            .flat_map(|c| <[u8; 20]>::from(Sha1::digest(c)))
            .collect();
        let mut d = HashMap::from([
            (b"name".to_vec(), Value::Str(name.as_bytes().to_vec())),
            (b"piece length".to_vec(), Value::Int(piece_length as i64)),
            (b"pieces".to_vec(), Value::Str(pieces)),
            (b"length".to_vec(), Value::Int(data.len() as i64)),
        ]);
        if private {
            d.insert(b"private".to_vec(), Value::Int(1));
        }
        Value::dict(d).encode()
    }
}
