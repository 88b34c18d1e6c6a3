//! Block-locator serialization: varint count followed by 32-byte hashes,
//! hex-encoded where a locator is stored as text (checkpoint and lock blobs).

use chaindex_primitives::encoding::{Decoder, Encoder};
use chaindex_primitives::hash::{bytes_from_hex, bytes_to_hex};
use chaindex_primitives::Hash256;

const MAX_LOCATOR_HASHES: u64 = 2000;

pub fn locator_to_bytes(locator: &[Hash256]) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_varint(locator.len() as u64);
    for hash in locator {
        encoder.write_hash_le(hash);
    }
    encoder.into_inner()
}

pub fn locator_from_bytes(bytes: &[u8]) -> Option<Vec<Hash256>> {
    let mut decoder = Decoder::new(bytes);
    let count = decoder.read_varint().ok()?;
    if count > MAX_LOCATOR_HASHES {
        return None;
    }
    let mut locator = Vec::with_capacity(count as usize);
    for _ in 0..count {
        locator.push(decoder.read_hash().ok()?);
    }
    if !decoder.is_empty() {
        return None;
    }
    Some(locator)
}

pub fn locator_to_hex(locator: &[Hash256]) -> String {
    bytes_to_hex(&locator_to_bytes(locator))
}

pub fn locator_from_hex(hex: &str) -> Option<Vec<Hash256>> {
    locator_from_bytes(&bytes_from_hex(hex)?)
}
