use std::{collections::HashMap, fmt};

use crate::{
    bencoding::Value,
    torrent_protocol::wire_protocol::ProtocolError,
    util::force_string,
};

pub const UT_METADATA: &str = "ut_metadata";

// ids we ask peers to use when sending extension messages to us, 0 is the extended handshake
pub const LOCAL_UT_METADATA_ID: u8 = 1;

pub const METADATA_BLOCK_SIZE: usize = 16384;
pub const MAX_METADATA_SIZE: usize = 16 * 1024 * 1024;

/// Names to ids table advertised by a peer through its extended handshakes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtensionTable {
    ids: HashMap<String, u8>,
}

impl ExtensionTable {
    // handshakes may be re-sent carrying only the changes, id 0 disables an extension
    pub fn update(&mut self, advertised: &HashMap<String, u8>) {
        for (name, id) in advertised {
            if *id == 0 {
                self.ids.remove(name);
            } else {
                self.ids.insert(name.clone(), *id);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<u8> {
        self.ids.get(name).copied()
    }

    pub fn require(&self, name: &'static str) -> Result<u8, ProtocolError> {
        self.get(name)
            .ok_or(ProtocolError::ExtensionNotSupported(name))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtendedHandshake {
    pub extensions: HashMap<String, u8>, // "m"
    pub listen_port: Option<u16>,        // "p"
    pub client: Option<String>,          // "v"
    pub metadata_size: Option<usize>,
    pub encryption: Option<bool>, // "e"
    pub reqq: Option<u32>,
}

impl fmt::Display for ExtendedHandshake {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut names: Vec<String> = self
            .extensions
            .iter()
            .map(|(name, id)| format!("{name}:{id}"))
            .collect();
        names.sort();
        write!(
            f,
            "m: [{}], client: {}, metadata size: {}",
            names.join(", "),
            self.client.as_deref().unwrap_or("-"),
            self.metadata_size
                .map(|s| s.to_string())
                .unwrap_or("-".to_string())
        )
    }
}

impl ExtendedHandshake {
    pub fn to_value(&self) -> Value {
        let mut d = HashMap::new();
        d.insert(
            b"m".to_vec(),
            Value::dict(
                self.extensions
                    .iter()
                    .map(|(name, id)| (name.as_bytes().to_vec(), Value::Int(*id as i64)))
                    .collect(),
            ),
        );
        if let Some(port) = self.listen_port {
            d.insert(b"p".to_vec(), Value::Int(port as i64));
        }
        if let Some(client) = &self.client {
            d.insert(b"v".to_vec(), Value::Str(client.as_bytes().to_vec()));
        }
        if let Some(metadata_size) = self.metadata_size {
            d.insert(b"metadata_size".to_vec(), Value::Int(metadata_size as i64));
        }
        if let Some(encryption) = self.encryption {
            d.insert(b"e".to_vec(), Value::Int(encryption as i64));
        }
        if let Some(reqq) = self.reqq {
            d.insert(b"reqq".to_vec(), Value::Int(reqq as i64));
        }
        Value::dict(d)
    }

    pub fn from_value(value: &Value) -> Result<Self, ProtocolError> {
        let Value::Dict(d, _, _) = value else {
            return Err(ProtocolError::MalformedExtension(
                "extended handshake is not a dictionary".to_string(),
            ));
        };

        let mut extensions = HashMap::new();
        match d.get(b"m".as_slice()) {
            None => {}
            Some(Value::Dict(m, _, _)) => {
                for (name, id) in m {
                    let id = id
                        .as_int()
                        .and_then(|i| u8::try_from(i).ok())
                        .ok_or_else(|| {
                            ProtocolError::MalformedExtension(format!(
                                "invalid id for extension {}",
                                force_string(name)
                            ))
                        })?;
                    extensions.insert(force_string(name), id);
                }
            }
            Some(_) => {
                return Err(ProtocolError::MalformedExtension(
                    "\"m\" is not a dictionary".to_string(),
                ))
            }
        }

        let metadata_size = match d.get(b"metadata_size".as_slice()) {
            None => None,
            Some(v) => Some(
                v.as_int()
                    .and_then(|i| usize::try_from(i).ok())
                    .filter(|s| *s > 0 && *s <= MAX_METADATA_SIZE)
                    .ok_or_else(|| {
                        ProtocolError::MalformedExtension(format!("invalid metadata_size {v}"))
                    })?,
            ),
        };

        Ok(ExtendedHandshake {
            extensions,
            listen_port: d
                .get(b"p".as_slice())
                .and_then(Value::as_int)
                .and_then(|p| u16::try_from(p).ok()),
            client: d
                .get(b"v".as_slice())
                .and_then(Value::as_bytes)
                .map(force_string),
            metadata_size,
            encryption: d
                .get(b"e".as_slice())
                .and_then(Value::as_int)
                .map(|e| e != 0),
            reqq: d
                .get(b"reqq".as_slice())
                .and_then(Value::as_int)
                .and_then(|r| u32::try_from(r).ok()),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MetadataMessage {
    Request(u32),                 // piece
    Data(u32, usize, Vec<u8>),    // piece, total size, block
    Reject(u32),                  // piece
}

impl fmt::Display for MetadataMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MetadataMessage::Request(piece) => write!(f, "request piece {piece}"),
            MetadataMessage::Data(piece, total_size, data) => write!(
                f,
                "data piece {piece}, total size {total_size}, data len {}",
                data.len()
            ),
            MetadataMessage::Reject(piece) => write!(f, "reject piece {piece}"),
        }
    }
}

impl MetadataMessage {
    pub fn encode(&self) -> Vec<u8> {
        let (msg_type, piece) = match self {
            MetadataMessage::Request(piece) => (0, piece),
            MetadataMessage::Data(piece, _, _) => (1, piece),
            MetadataMessage::Reject(piece) => (2, piece),
        };
        let mut d = HashMap::from([
            (b"msg_type".to_vec(), Value::Int(msg_type)),
            (b"piece".to_vec(), Value::Int(*piece as i64)),
        ]);
        if let MetadataMessage::Data(_, total_size, _) = self {
            d.insert(b"total_size".to_vec(), Value::Int(*total_size as i64));
        }
        let mut buf = Value::dict(d).encode();
        if let MetadataMessage::Data(_, _, data) = self {
            buf.extend_from_slice(data);
        }
        buf
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let (value, dict_size) = Value::new_with_size(payload)
            .map_err(|e| ProtocolError::MalformedExtension(e.to_string()))?;
        let malformed = |what: &str| ProtocolError::MalformedExtension(format!("ut_metadata {what}"));

        let msg_type = value
            .get(b"msg_type")
            .and_then(Value::as_int)
            .ok_or_else(|| malformed("without msg_type"))?;
        let piece = value
            .get(b"piece")
            .and_then(Value::as_int)
            .and_then(|p| u32::try_from(p).ok())
            .ok_or_else(|| malformed("without valid piece"))?;

        match msg_type {
            0 => Ok(MetadataMessage::Request(piece)),
            1 => {
                let total_size = value
                    .get(b"total_size")
                    .and_then(Value::as_int)
                    .and_then(|s| usize::try_from(s).ok())
                    .filter(|s| *s > 0 && *s <= MAX_METADATA_SIZE)
                    .ok_or_else(|| malformed("data without valid total_size"))?;
                let data = payload[dict_size..].to_vec();
                if data.len() > METADATA_BLOCK_SIZE {
                    return Err(malformed("data block too large"));
                }
                Ok(MetadataMessage::Data(piece, total_size, data))
            }
            2 => Ok(MetadataMessage::Reject(piece)),
            other => Err(malformed(&format!("with unknown msg_type {other}"))),
        }
    }
}

/// Number of ut_metadata blocks needed to carry `metadata_size` bytes.
pub fn metadata_block_count(metadata_size: usize) -> usize {
    metadata_size.div_ceil(METADATA_BLOCK_SIZE)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn table_update_and_removal() {
        let mut table = ExtensionTable::default();
        assert_matches!(
            table.require(UT_METADATA),
            Err(ProtocolError::ExtensionNotSupported("ut_metadata"))
        );

        table.update(&HashMap::from([
            ("ut_metadata".to_string(), 3),
            ("ut_pex".to_string(), 1),
        ]));
        assert_eq!(table.require(UT_METADATA).unwrap(), 3);
        assert_eq!(table.get("ut_pex"), Some(1));

        // delta handshake: pex disabled, metadata id changed
        table.update(&HashMap::from([
            ("ut_metadata".to_string(), 7),
            ("ut_pex".to_string(), 0),
        ]));
        assert_eq!(table.require(UT_METADATA).unwrap(), 7);
        assert_eq!(table.get("ut_pex"), None);
    }

    #[test]
    fn extended_handshake_round_trip() {
        let handshake = ExtendedHandshake {
            extensions: HashMap::from([(UT_METADATA.to_string(), LOCAL_UT_METADATA_ID)]),
            listen_port: Some(8000),
            client: Some("peerwire test".to_string()),
            metadata_size: Some(40000),
            encryption: Some(false),
            reqq: Some(128),
        };
        let value = handshake.to_value();
        let encoded = value.encode();
        let decoded = ExtendedHandshake::from_value(&Value::new(&encoded).unwrap()).unwrap();
        assert_eq!(decoded, handshake);
    }

    #[test]
    fn extended_handshake_malformed() {
        let value = Value::new(b"d1:md11:ut_metadatai300eee").unwrap();
        assert_matches!(
            ExtendedHandshake::from_value(&value),
            Err(ProtocolError::MalformedExtension(_))
        );
        let value = Value::new(b"li1ee").unwrap();
        assert_matches!(
            ExtendedHandshake::from_value(&value),
            Err(ProtocolError::MalformedExtension(_))
        );
    }

    #[test]
    fn metadata_data_message() {
        let message = MetadataMessage::Data(1, 20000, vec![7; 3616]);
        let encoded = message.encode();
        assert!(encoded.starts_with(b"d8:msg_typei1e5:piecei1e10:total_sizei20000ee"));
        assert_eq!(MetadataMessage::decode(&encoded).unwrap(), message);
    }

    #[test]
    fn metadata_request_and_reject() {
        assert_eq!(
            MetadataMessage::decode(b"d8:msg_typei0e5:piecei0ee").unwrap(),
            MetadataMessage::Request(0)
        );
        assert_eq!(
            MetadataMessage::decode(b"d8:msg_typei2e5:piecei4ee").unwrap(),
            MetadataMessage::Reject(4)
        );
        assert_matches!(
            MetadataMessage::decode(b"d8:msg_typei9e5:piecei0ee"),
            Err(ProtocolError::MalformedExtension(_))
        );
        assert_matches!(
            MetadataMessage::decode(b"d5:piecei0ee"),
            Err(ProtocolError::MalformedExtension(_))
        );
    }

    #[test]
    fn block_count() {
        assert_eq!(metadata_block_count(1), 1);
        assert_eq!(metadata_block_count(METADATA_BLOCK_SIZE), 1);
        assert_eq!(metadata_block_count(METADATA_BLOCK_SIZE * 2 + 1), 3);
    }
}
