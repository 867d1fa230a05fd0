use anyhow::{bail, Result};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    join,
};

use crate::{
    bencoding::Value,
    torrent_protocol::{
        extension::{
            ExtendedHandshake, ExtensionTable, MetadataMessage, LOCAL_UT_METADATA_ID, UT_METADATA,
        },
        wire_protocol::{
            BlockRequest, Handshake, Message, Protocol, ProtocolError, ProtocolReadHalf,
            ProtocolWriteHalf, EXTENSION_PROTOCOL_ID, PROTOCOL_STRING,
        },
    },
    util::force_string,
};

// bigger than any block or bitfield a sane peer sends
pub const MAX_FRAME_LENGTH: usize = 2 * 1024 * 1024;

const HANDSHAKE_LENGTH: usize = 68;

impl<T> Protocol for T
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn handshake(&mut self, info_hash: [u8; 20], peer_id: [u8; 20]) -> Result<Handshake> {
        let (mut read, mut write) = tokio::io::split(self);

        let (write_result, read_result) = join!(
            // send
            async {
                let mut buf = [0u8; HANDSHAKE_LENGTH];
                buf[0] = PROTOCOL_STRING.len() as u8;
                buf[1..20].copy_from_slice(PROTOCOL_STRING);
                buf[25] = 0x10; // support for Extension Protocol
                buf[28..48].copy_from_slice(&info_hash);
                buf[48..68].copy_from_slice(&peer_id);
                write.write_all(&buf).await?;
                log::trace!("full handshake sent");
                Ok::<(), std::io::Error>(())
            },
            // receive
            async {
                let mut pstr_len_buf = [0u8; 1];
                read.read_exact(&mut pstr_len_buf).await?;
                let mut pstr_buf = vec![0; pstr_len_buf[0].into()];
                read.read_exact(&mut pstr_buf).await?;
                let mut rest = [0u8; 48];
                read.read_exact(&mut rest).await?;
                log::trace!("full handshake received");
                Ok::<(Vec<u8>, [u8; 48]), std::io::Error>((pstr_buf, rest))
            }
        );

        write_result?;
        let (pstr, rest) = read_result?;
        if pstr != PROTOCOL_STRING {
            bail!(ProtocolError::InvalidHandshake(force_string(&pstr)));
        }
        let mut handshake = Handshake {
            reserved: [0; 8],
            info_hash: [0; 20],
            peer_id: [0; 20],
        };
        handshake.reserved.copy_from_slice(&rest[0..8]);
        handshake.info_hash.copy_from_slice(&rest[8..28]);
        handshake.peer_id.copy_from_slice(&rest[28..48]);
        Ok(handshake)
    }
}

impl<T> ProtocolWriteHalf for T
where
    T: AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, message: Message, extensions: &ExtensionTable) -> Result<()> {
        let buf = encode_message(&message, extensions)?;
        self.write_all(&buf).await?;
        Ok(())
    }
}

impl<T> ProtocolReadHalf for T
where
    T: AsyncRead + Unpin + Send,
{
    async fn receive(&mut self) -> Result<Message> {
        // get size of message
        let mut size_message_buf = [0u8; 4];
        self.read_exact(&mut size_message_buf).await?;
        let size_message = u32::from_be_bytes(size_message_buf) as usize;
        if size_message == 0 {
            return Ok(Message::KeepAlive);
        }
        if size_message > MAX_FRAME_LENGTH {
            bail!(ProtocolError::FrameTooLarge(size_message));
        }
        let mut frame = vec![0; size_message];
        self.read_exact(&mut frame).await?;
        Ok(decode_message(&frame)?)
    }
}

/// Encodes a full frame, length prefix included.
pub fn encode_message(message: &Message, extensions: &ExtensionTable) -> Result<Vec<u8>, ProtocolError> {
    let (id, payload): (u8, Vec<u8>) = match message {
        Message::KeepAlive => return Ok(vec![0; 4]),
        Message::Choke => (0, Vec::new()),
        Message::Unchoke => (1, Vec::new()),
        Message::Interested => (2, Vec::new()),
        Message::NotInterested => (3, Vec::new()),
        Message::Have(piece_idx) => (4, piece_idx.to_be_bytes().to_vec()),
        Message::Bitfield(bitfield) => (5, bitfield.clone()),
        Message::Request(block_request) => (6, encode_block_request(block_request)),
        Message::Piece(index, begin, block) => {
            let mut payload = Vec::with_capacity(8 + block.len());
            payload.extend_from_slice(&index.to_be_bytes());
            payload.extend_from_slice(&begin.to_be_bytes());
            payload.extend_from_slice(block);
            (7, payload)
        }
        Message::Cancel(block_request) => (8, encode_block_request(block_request)),
        Message::Port(port) => (9, port.to_be_bytes().to_vec()),
        Message::ExtendedHandshake(handshake) => {
            let mut payload = vec![0]; // extended handshake id
            payload.extend_from_slice(&handshake.to_value().encode());
            (EXTENSION_PROTOCOL_ID, payload)
        }
        Message::Metadata(metadata_message) => {
            let mut payload = vec![extensions.require(UT_METADATA)?];
            payload.extend_from_slice(&metadata_message.encode());
            (EXTENSION_PROTOCOL_ID, payload)
        }
    };
    let mut buf = Vec::with_capacity(5 + payload.len());
    buf.extend_from_slice(&(1 + payload.len() as u32).to_be_bytes());
    buf.push(id);
    buf.extend_from_slice(&payload);
    Ok(buf)
}

fn encode_block_request(block_request: &BlockRequest) -> Vec<u8> {
    let mut payload = Vec::with_capacity(12);
    payload.extend_from_slice(&block_request.piece_idx.to_be_bytes());
    payload.extend_from_slice(&block_request.block_begin.to_be_bytes());
    payload.extend_from_slice(&block_request.data_len.to_be_bytes());
    payload
}

/// Decodes a frame without its length prefix: message id followed by the payload.
pub fn decode_message(frame: &[u8]) -> Result<Message, ProtocolError> {
    let Some((&id, payload)) = frame.split_first() else {
        return Ok(Message::KeepAlive);
    };
    let expect_len = |len: usize| {
        if payload.len() == len {
            Ok(())
        } else {
            Err(ProtocolError::InvalidLength {
                id,
                len: payload.len(),
            })
        }
    };
    match id {
        0 => expect_len(0).map(|_| Message::Choke),
        1 => expect_len(0).map(|_| Message::Unchoke),
        2 => expect_len(0).map(|_| Message::Interested),
        3 => expect_len(0).map(|_| Message::NotInterested),
        4 => {
            expect_len(4)?;
            Ok(Message::Have(read_u32(payload, 0)))
        }
        5 => Ok(Message::Bitfield(payload.to_vec())),
        6 => {
            expect_len(12)?;
            Ok(Message::Request(decode_block_request(payload)))
        }
        7 => {
            if payload.len() < 8 {
                return Err(ProtocolError::InvalidLength {
                    id,
                    len: payload.len(),
                });
            }
            Ok(Message::Piece(
                read_u32(payload, 0),
                read_u32(payload, 4),
                payload[8..].to_vec(),
            ))
        }
        8 => {
            expect_len(12)?;
            Ok(Message::Cancel(decode_block_request(payload)))
        }
        9 => {
            expect_len(2)?;
            Ok(Message::Port(u16::from_be_bytes([payload[0], payload[1]])))
        }
        EXTENSION_PROTOCOL_ID => {
            let Some((&extended_id, extended_payload)) = payload.split_first() else {
                return Err(ProtocolError::InvalidLength { id, len: 0 });
            };
            // peers address us with the ids we advertised
            match extended_id {
                0 => {
                    let value = Value::new(extended_payload)
                        .map_err(|e| ProtocolError::MalformedExtension(e.to_string()))?;
                    Ok(Message::ExtendedHandshake(ExtendedHandshake::from_value(
                        &value,
                    )?))
                }
                LOCAL_UT_METADATA_ID => Ok(Message::Metadata(MetadataMessage::decode(
                    extended_payload,
                )?)),
                unknown => Err(ProtocolError::UnknownExtension(unknown)),
            }
        }
        unknown => Err(ProtocolError::UnknownMessage(unknown)),
    }
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn decode_block_request(payload: &[u8]) -> BlockRequest {
    BlockRequest::new(
        read_u32(payload, 0),
        read_u32(payload, 4),
        read_u32(payload, 8),
    )
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;
    use tokio::io::{duplex, AsyncWriteExt};

    use super::*;

    #[test]
    fn encode_fixed_layouts() {
        let table = ExtensionTable::default();
        assert_eq!(
            encode_message(&Message::KeepAlive, &table).unwrap(),
            vec![0, 0, 0, 0]
        );
        assert_eq!(
            encode_message(&Message::Unchoke, &table).unwrap(),
            vec![0, 0, 0, 1, 1]
        );
        assert_eq!(
            encode_message(&Message::Have(258), &table).unwrap(),
            vec![0, 0, 0, 5, 4, 0, 0, 1, 2]
        );
        assert_eq!(
            encode_message(&Message::Request(BlockRequest::new(1, 16384, 16384)), &table).unwrap(),
            vec![0, 0, 0, 13, 6, 0, 0, 0, 1, 0, 0, 64, 0, 0, 0, 64, 0]
        );
        assert_eq!(
            encode_message(&Message::Bitfield(vec![0b10000001, 0b00001100]), &table).unwrap(),
            vec![
                0, 0, 0, 3, // len
                5, // type
                0b10000001, 0b00001100 // bitfield bytes
            ]
        );
        assert_eq!(
            encode_message(&Message::Piece(2, 0, vec![9, 9, 9]), &table).unwrap(),
            vec![0, 0, 0, 12, 7, 0, 0, 0, 2, 0, 0, 0, 0, 9, 9, 9]
        );
    }

    #[test]
    fn decode_rejects_bad_frames() {
        assert_matches!(decode_message(&[42]), Err(ProtocolError::UnknownMessage(42)));
        assert_matches!(
            decode_message(&[4, 0, 0]),
            Err(ProtocolError::InvalidLength { id: 4, len: 2 })
        );
        assert_matches!(
            decode_message(&[6, 0, 0, 0, 1]),
            Err(ProtocolError::InvalidLength { id: 6, len: 4 })
        );
        assert_matches!(
            decode_message(&[7, 0, 0, 0]),
            Err(ProtocolError::InvalidLength { id: 7, len: 3 })
        );
        assert_matches!(decode_message(&[1, 0]), Err(ProtocolError::InvalidLength { .. }));
        assert_matches!(
            decode_message(&[20, 9, b'd', b'e']),
            Err(ProtocolError::UnknownExtension(9))
        );
        assert_matches!(
            decode_message(&[20, 0, b'd']),
            Err(ProtocolError::MalformedExtension(_))
        );
    }

    #[test]
    fn metadata_uses_peer_advertised_id() {
        let mut table = ExtensionTable::default();
        let message = Message::Metadata(MetadataMessage::Request(0));
        assert_matches!(
            encode_message(&message, &table),
            Err(ProtocolError::ExtensionNotSupported(UT_METADATA))
        );

        table.update(&HashMap::from([(UT_METADATA.to_string(), 5)]));
        let buf = encode_message(&message, &table).unwrap();
        assert_eq!(buf[4], EXTENSION_PROTOCOL_ID);
        assert_eq!(buf[5], 5);
        assert_eq!(&buf[6..], b"d8:msg_typei0e5:piecei0ee");
    }

    #[test]
    fn decode_metadata_with_local_id() {
        let mut frame = vec![EXTENSION_PROTOCOL_ID, LOCAL_UT_METADATA_ID];
        frame.extend_from_slice(&MetadataMessage::Data(0, 5, b"hello".to_vec()).encode());
        assert_eq!(
            decode_message(&frame).unwrap(),
            Message::Metadata(MetadataMessage::Data(0, 5, b"hello".to_vec()))
        );
    }

    #[tokio::test]
    async fn handshake_over_duplex() {
        let (mut a, mut b) = duplex(1024);
        let (ra, rb) = tokio::join!(a.handshake([1; 20], [2; 20]), b.handshake([1; 20], [3; 20]));
        let (ra, rb) = (ra.unwrap(), rb.unwrap());
        assert_eq!(ra.peer_id, [3; 20]);
        assert_eq!(rb.peer_id, [2; 20]);
        assert_eq!(ra.info_hash, [1; 20]);
        assert!(ra.supports_extension_protocol());
    }

    #[tokio::test]
    async fn handshake_rejects_other_protocols() {
        let (mut a, mut b) = duplex(1024);
        let mut bogus = vec![3];
        bogus.extend_from_slice(b"FOO");
        bogus.extend_from_slice(&[0; 48]);
        let (ra, _) = tokio::join!(a.handshake([1; 20], [2; 20]), b.write_all(&bogus));
        assert!(ra.is_err());
    }

    #[tokio::test]
    async fn send_and_receive_frames() {
        let (a, b) = duplex(4096);
        let (_, mut a_write) = tokio::io::split(a);
        let (mut b_read, _) = tokio::io::split(b);
        let table = ExtensionTable::default();

        a_write.send(Message::KeepAlive, &table).await.unwrap();
        a_write
            .send(Message::Cancel(BlockRequest::new(1, 2, 3)), &table)
            .await
            .unwrap();
        a_write.send(Message::Port(6881), &table).await.unwrap();

        assert_eq!(b_read.receive().await.unwrap(), Message::KeepAlive);
        assert_eq!(
            b_read.receive().await.unwrap(),
            Message::Cancel(BlockRequest::new(1, 2, 3))
        );
        assert_eq!(b_read.receive().await.unwrap(), Message::Port(6881));
    }

    #[tokio::test]
    async fn receive_refuses_oversized_frames() {
        let (mut a, mut b) = duplex(64);
        a.write_all(&((MAX_FRAME_LENGTH as u32 + 1).to_be_bytes()))
            .await
            .unwrap();
        let err = b.receive().await.unwrap_err();
        assert_matches!(
            err.downcast_ref::<ProtocolError>(),
            Some(ProtocolError::FrameTooLarge(_))
        );
    }

    #[tokio::test]
    async fn receive_truncated_frame_fails() {
        let (mut a, mut b) = duplex(64);
        a.write_all(&[0, 0, 0, 5, 4, 0]).await.unwrap();
        drop(a);
        assert!(b.receive().await.is_err());
    }
}
