//! Bitcoin wire-protocol peer: message framing, handshake and the payload
//! builders/parsers the listener and block fetch path need.

use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use chaindex_primitives::encoding::{Decoder, Encoder};
use chaindex_primitives::hash::sha256d;
use chaindex_primitives::{BlockHeader, Hash256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const MAX_PAYLOAD_SIZE: usize = 4 * 1024 * 1024;
const MAX_HEADERS_RESULTS: usize = 2000;
const MAX_INV_RESULTS: usize = 50_000;
const NODE_NETWORK: u64 = 1;

pub const PROTOCOL_VERSION: i32 = 70015;
pub const MSG_TX: u32 = 1;
pub const MSG_BLOCK: u32 = 2;

pub const USER_AGENT: &str = "/chaindexd:0.1.0/";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PeerState {
    Connecting,
    Handshaked,
    HeadersSynced,
    Streaming,
    Disconnected,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct InventoryVector {
    pub inv_type: u32,
    pub hash: Hash256,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RejectMessage {
    pub message: String,
    pub code: u8,
    pub reason: String,
    pub hash: Option<Hash256>,
}

pub struct Peer {
    stream: TcpStream,
    magic: [u8; 4],
    state: PeerState,
    remote_height: i32,
    remote_version: i32,
    remote_user_agent: String,
    addr: SocketAddr,
}

impl Peer {
    pub async fn connect(addr: SocketAddr, magic: [u8; 4]) -> Result<Self, String> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|err| err.to_string())?;
        Ok(Self {
            stream,
            magic,
            state: PeerState::Connecting,
            remote_height: -1,
            remote_version: 0,
            remote_user_agent: String::new(),
            addr,
        })
    }

    pub async fn send_message(&mut self, command: &str, payload: &[u8]) -> Result<(), String> {
        let name = command.as_bytes();
        if name.len() > 12 {
            return Err("command too long".to_string());
        }
        let mut padded = [0u8; 12];
        padded[..name.len()].copy_from_slice(name);

        let checksum = sha256d(payload);
        let mut frame = Encoder::new();
        frame.write_bytes(&self.magic);
        frame.write_bytes(&padded);
        frame.write_u32_le(payload.len() as u32);
        frame.write_bytes(&checksum[..4]);
        frame.write_bytes(payload);
        self.stream
            .write_all(&frame.into_inner())
            .await
            .map_err(|err| err.to_string())
    }

    pub async fn read_message(&mut self) -> Result<(String, Vec<u8>), String> {
        let mut header = [0u8; 24];
        self.stream
            .read_exact(&mut header)
            .await
            .map_err(|err| err.to_string())?;

        let mut decoder = Decoder::new(&header);
        let magic = decoder.read_fixed::<4>().map_err(|err| err.to_string())?;
        if magic != self.magic {
            return Err("invalid magic".to_string());
        }
        let name = decoder.read_fixed::<12>().map_err(|err| err.to_string())?;
        let command = name
            .iter()
            .take_while(|byte| **byte != 0)
            .map(|byte| *byte as char)
            .collect::<String>();
        let length = decoder.read_u32_le().map_err(|err| err.to_string())? as usize;
        if length > MAX_PAYLOAD_SIZE {
            return Err("payload too large".to_string());
        }
        let checksum = decoder.read_fixed::<4>().map_err(|err| err.to_string())?;

        let mut payload = vec![0u8; length];
        self.stream
            .read_exact(&mut payload)
            .await
            .map_err(|err| err.to_string())?;
        let calc = sha256d(&payload);
        if checksum != calc[..4] {
            return Err("invalid payload checksum".to_string());
        }
        Ok((command, payload))
    }

    pub async fn handshake(&mut self, start_height: i32) -> Result<(), String> {
        self.send_message("version", &build_version_payload(start_height))
            .await?;

        let mut seen_version = false;
        let mut seen_verack = false;
        while !(seen_version && seen_verack) {
            let (command, payload) = self.read_message().await?;
            match command.as_str() {
                "version" => {
                    seen_version = true;
                    let info = parse_version(&payload)?;
                    self.remote_height = info.start_height;
                    self.remote_version = info.version;
                    self.remote_user_agent = info.user_agent;
                    self.send_message("verack", &[]).await?;
                }
                "verack" => seen_verack = true,
                "ping" => self.send_message("pong", &payload).await?,
                _ => {}
            }
        }
        self.state = PeerState::Handshaked;
        Ok(())
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn set_state(&mut self, state: PeerState) {
        self.state = state;
    }

    pub fn remote_height(&self) -> i32 {
        self.remote_height
    }

    pub fn remote_version(&self) -> i32 {
        self.remote_version
    }

    pub fn remote_user_agent(&self) -> &str {
        &self.remote_user_agent
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn send_getheaders(&mut self, locator: &[Hash256]) -> Result<(), String> {
        let payload = build_getheaders_payload(locator);
        self.send_message("getheaders", &payload).await
    }

    pub async fn send_getdata_blocks(&mut self, hashes: &[Hash256]) -> Result<(), String> {
        let payload = build_inv_payload(MSG_BLOCK, hashes);
        self.send_message("getdata", &payload).await
    }

    pub async fn send_getdata_txs(&mut self, hashes: &[Hash256]) -> Result<(), String> {
        let payload = build_inv_payload(MSG_TX, hashes);
        self.send_message("getdata", &payload).await
    }

    pub async fn send_inv_tx(&mut self, txids: &[Hash256]) -> Result<(), String> {
        let payload = build_inv_payload(MSG_TX, txids);
        self.send_message("inv", &payload).await
    }

    pub async fn send_tx(&mut self, raw: &[u8]) -> Result<(), String> {
        self.send_message("tx", raw).await
    }
}

pub fn parse_headers(payload: &[u8]) -> Result<Vec<BlockHeader>, String> {
    let mut decoder = Decoder::new(payload);
    let count = decoder.read_varint().map_err(|err| err.to_string())?;
    let count = usize::try_from(count).map_err(|_| "header count too large".to_string())?;
    if count > MAX_HEADERS_RESULTS {
        return Err("header count too large".to_string());
    }
    let mut headers = Vec::with_capacity(count);
    for _ in 0..count {
        let header =
            BlockHeader::consensus_decode_from(&mut decoder).map_err(|err| err.to_string())?;
        let _tx_count = decoder.read_varint().map_err(|err| err.to_string())?;
        headers.push(header);
    }
    Ok(headers)
}

pub fn parse_inv(payload: &[u8]) -> Result<Vec<InventoryVector>, String> {
    let mut decoder = Decoder::new(payload);
    let count = decoder.read_varint().map_err(|err| err.to_string())?;
    let count = usize::try_from(count).map_err(|_| "inv count too large".to_string())?;
    if count > MAX_INV_RESULTS {
        return Err("inv count too large".to_string());
    }
    let mut vectors = Vec::with_capacity(count);
    for _ in 0..count {
        let inv_type = decoder.read_u32_le().map_err(|err| err.to_string())?;
        let hash = decoder.read_hash().map_err(|err| err.to_string())?;
        vectors.push(InventoryVector { inv_type, hash });
    }
    Ok(vectors)
}

pub fn build_inv_payload(inv_type: u32, hashes: &[Hash256]) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_varint(hashes.len() as u64);
    for hash in hashes {
        encoder.write_u32_le(inv_type);
        encoder.write_hash_le(hash);
    }
    encoder.into_inner()
}

pub fn parse_reject(payload: &[u8]) -> Result<RejectMessage, String> {
    let mut decoder = Decoder::new(payload);
    let message = decoder.read_var_str().map_err(|err| err.to_string())?;
    let code = decoder.read_u8().map_err(|err| err.to_string())?;
    let reason = decoder.read_var_str().map_err(|err| err.to_string())?;
    let hash = if decoder.remaining() >= 32 {
        Some(decoder.read_hash().map_err(|err| err.to_string())?)
    } else {
        None
    };
    Ok(RejectMessage {
        message,
        code,
        reason,
        hash,
    })
}

pub fn build_reject_payload(message: &str, code: u8, reason: &str, hash: Option<&Hash256>) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_var_str(message);
    encoder.write_u8(code);
    encoder.write_var_str(reason);
    if let Some(hash) = hash {
        encoder.write_hash_le(hash);
    }
    encoder.into_inner()
}

fn build_version_payload(start_height: i32) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_i32_le(PROTOCOL_VERSION);
    encoder.write_u64_le(NODE_NETWORK);
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or(0);
    encoder.write_i64_le(timestamp);
    write_net_addr(&mut encoder, NODE_NETWORK, [0u8; 16], 0);
    write_net_addr(&mut encoder, NODE_NETWORK, [0u8; 16], 0);
    encoder.write_u64_le(rand::random());
    encoder.write_var_str(USER_AGENT);
    encoder.write_i32_le(start_height);
    encoder.write_u8(1);
    encoder.into_inner()
}

fn build_getheaders_payload(locator: &[Hash256]) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_i32_le(PROTOCOL_VERSION);
    encoder.write_varint(locator.len() as u64);
    for hash in locator {
        encoder.write_hash_le(hash);
    }
    encoder.write_hash_le(&[0u8; 32]);
    encoder.into_inner()
}

fn write_net_addr(encoder: &mut Encoder, services: u64, ip: [u8; 16], port: u16) {
    encoder.write_u64_le(services);
    encoder.write_bytes(&ip);
    encoder.write_bytes(&port.to_be_bytes());
}

struct VersionInfo {
    version: i32,
    user_agent: String,
    start_height: i32,
}

fn parse_version(payload: &[u8]) -> Result<VersionInfo, String> {
    let mut decoder = Decoder::new(payload);
    let version = decoder.read_i32_le().map_err(|err| err.to_string())?;
    let _services = decoder.read_u64_le().map_err(|err| err.to_string())?;
    let _timestamp = decoder.read_i64_le().map_err(|err| err.to_string())?;
    read_net_addr(&mut decoder)?;
    read_net_addr(&mut decoder)?;
    let _nonce = decoder.read_u64_le().map_err(|err| err.to_string())?;
    let user_agent = decoder.read_var_str().map_err(|err| err.to_string())?;
    let start_height = decoder.read_i32_le().map_err(|err| err.to_string())?;
    Ok(VersionInfo {
        version,
        user_agent,
        start_height,
    })
}

fn read_net_addr(decoder: &mut Decoder<'_>) -> Result<(), String> {
    let _services = decoder.read_u64_le().map_err(|err| err.to_string())?;
    let _ip = decoder.read_fixed::<16>().map_err(|err| err.to_string())?;
    let _port = decoder.read_bytes(2).map_err(|err| err.to_string())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inv_payload_roundtrip() {
        let hashes = [[0x11u8; 32], [0x22u8; 32]];
        let payload = build_inv_payload(MSG_TX, &hashes);
        let vectors = parse_inv(&payload).expect("parse");
        assert_eq!(vectors.len(), 2);
        assert!(vectors
            .iter()
            .zip(hashes.iter())
            .all(|(vector, hash)| vector.inv_type == MSG_TX && vector.hash == *hash));
    }

    #[test]
    fn reject_payload_roundtrip() {
        let txid = [0x33u8; 32];
        let payload = build_reject_payload("tx", 0x40, "non-final", Some(&txid));
        let reject = parse_reject(&payload).expect("parse");
        assert_eq!(reject.message, "tx");
        assert_eq!(reject.code, 0x40);
        assert_eq!(reject.reason, "non-final");
        assert_eq!(reject.hash, Some(txid));
    }

    #[test]
    fn reject_without_hash_parses() {
        let payload = build_reject_payload("version", 0x11, "obsolete", None);
        let reject = parse_reject(&payload).expect("parse");
        assert_eq!(reject.hash, None);
    }
}
