use core::str;
use std::ascii;

use rand::Rng;

pub fn force_string(v: &[u8]) -> String {
    match str::from_utf8(v) {
        Ok(s) => s.to_string(),
        Err(_) => format!(
            "<non_utf-8>{}",
            v.iter()
                .flat_map(|b| ascii::escape_default(*b))
                .map(char::from)
                .collect::<String>()
        ),
    }
}

pub fn pretty_info_hash(info_hash: [u8; 20]) -> String {
    hex::encode(info_hash)
}

pub fn parse_info_hash(s: &str) -> anyhow::Result<[u8; 20]> {
    let bytes = hex::decode(s)?;
    bytes
        .try_into()
        .map_err(|v: Vec<u8>| anyhow::anyhow!("info hash must be 20 bytes, got {}", v.len()))
}

pub fn generate_peer_id() -> [u8; 20] {
    const CLIENT_PREFIX: &[u8; 8] = b"-PW0001-";
    let mut peer_id = [0u8; 20];
    peer_id[..8].copy_from_slice(CLIENT_PREFIX);
    let mut rng = rand::rng();
    for b in peer_id[8..].iter_mut() {
        *b = b'0' + rng.random_range(0..10);
    }
    peer_id
}
