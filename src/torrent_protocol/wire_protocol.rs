use std::fmt;

use anyhow::Result;
use thiserror::Error;

use crate::torrent_protocol::extension::{ExtendedHandshake, ExtensionTable, MetadataMessage};

pub const PROTOCOL_STRING: &[u8; 19] = b"BitTorrent protocol";
pub const EXTENSION_PROTOCOL_ID: u8 = 20;

#[derive(Eq, PartialEq, Hash, Clone, Copy, Debug)]
pub struct BlockRequest {
    pub piece_idx: u32,
    pub block_begin: u32,
    pub data_len: u32,
}

impl BlockRequest {
    pub fn new(piece_idx: u32, block_begin: u32, data_len: u32) -> Self {
        BlockRequest {
            piece_idx,
            block_begin,
            data_len,
        }
    }

    /// Identifies a request/cancel/piece triple on a connection: piece index in the high half, block offset in the low half.
    pub fn key(&self) -> u64 {
        request_key(self.piece_idx, self.block_begin)
    }
}

pub fn request_key(piece_idx: u32, block_begin: u32) -> u64 {
    ((piece_idx as u64) << 32) | block_begin as u64
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),         // piece index
    Bitfield(Vec<u8>), // packed, the high bit in the first byte corresponds to piece index 0
    Request(BlockRequest),
    Piece(u32, u32, Vec<u8>), // index, begin, block of data
    Cancel(BlockRequest),
    Port(u16),
    ExtendedHandshake(ExtendedHandshake),
    Metadata(MetadataMessage), // ut_metadata
}

/// Message discriminant, used to route received messages to their consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have,
    Bitfield,
    Request,
    Piece,
    Cancel,
    Port,
    ExtendedHandshake,
    Metadata,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::KeepAlive => MessageKind::KeepAlive,
            Message::Choke => MessageKind::Choke,
            Message::Unchoke => MessageKind::Unchoke,
            Message::Interested => MessageKind::Interested,
            Message::NotInterested => MessageKind::NotInterested,
            Message::Have(_) => MessageKind::Have,
            Message::Bitfield(_) => MessageKind::Bitfield,
            Message::Request(_) => MessageKind::Request,
            Message::Piece(_, _, _) => MessageKind::Piece,
            Message::Cancel(_) => MessageKind::Cancel,
            Message::Port(_) => MessageKind::Port,
            Message::ExtendedHandshake(_) => MessageKind::ExtendedHandshake,
            Message::Metadata(_) => MessageKind::Metadata,
        }
    }

    // choke state changes and cancels must not wait behind bulk piece traffic
    pub fn is_urgent(&self) -> bool {
        matches!(self, Message::Choke | Message::Unchoke | Message::Cancel(_))
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Message::KeepAlive => write!(f, "keep-alive"),
            Message::Choke => write!(f, "choke"),
            Message::Unchoke => write!(f, "unchoke"),
            Message::Interested => write!(f, "interested"),
            Message::NotInterested => write!(f, "not interested"),
            Message::Have(piece_idx) => write!(f, "have piece id {piece_idx}"),
            Message::Bitfield(bitfield) => {
                let total_have: u32 = bitfield.iter().map(|b| b.count_ones()).sum();
                write!(
                    f,
                    "bitfield have {total_have} in {} bytes",
                    bitfield.len()
                )
            }
            Message::Request(block_request) => write!(
                f,
                "request: piece idx: {}, begin: {}, length: {}",
                block_request.piece_idx, block_request.block_begin, block_request.data_len
            ),
            Message::Piece(piece_idx, begin, data) => write!(
                f,
                "piece: piece idx: {piece_idx}, begin: {begin}, data len: {}",
                data.len()
            ),
            Message::Cancel(block_request) => write!(
                f,
                "cancel: piece idx: {}, begin: {}, length: {}",
                block_request.piece_idx, block_request.block_begin, block_request.data_len
            ),
            Message::Port(p) => write!(f, "port {p}"),
            Message::ExtendedHandshake(handshake) => {
                write!(f, "extended handshake: {handshake}")
            }
            Message::Metadata(metadata_message) => {
                write!(f, "ut_metadata: {metadata_message}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn supports_extension_protocol(&self) -> bool {
        self.reserved[5] & 0x10 != 0
    }
}

#[trait_variant::make(Send)]
pub trait Protocol {
    async fn handshake(&mut self, info_hash: [u8; 20], peer_id: [u8; 20]) -> Result<Handshake>;
}

#[trait_variant::make(Send)]
pub trait ProtocolReadHalf {
    async fn receive(&mut self) -> Result<Message>;
}

#[trait_variant::make(Send)]
pub trait ProtocolWriteHalf {
    // extension messages are encoded with the ids the peer advertised in `extensions`
    async fn send(&mut self, message: Message, extensions: &ExtensionTable) -> Result<()>;
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unexpected protocol string in handshake: {0}")]
    InvalidHandshake(String),
    #[error("frame length {0} exceeds the maximum allowed")]
    FrameTooLarge(usize),
    #[error("message id {id} has invalid payload length {len}")]
    InvalidLength { id: u8, len: usize },
    #[error("could not parse message type id: {0}")]
    UnknownMessage(u8),
    #[error("unknown extended message id: {0}")]
    UnknownExtension(u8),
    #[error("malformed extension message: {0}")]
    MalformedExtension(String),
    #[error("extension {0} was not advertised by the peer")]
    ExtensionNotSupported(&'static str),
}
