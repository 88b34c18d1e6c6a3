//! Per-network constants: wire magic, default port, genesis header.

use chaindex_primitives::{BlockHeader, Hash256};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    pub fn as_str(self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Regtest => "regtest",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "mainnet" => Some(Network::Mainnet),
            "testnet" => Some(Network::Testnet),
            "regtest" => Some(Network::Regtest),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    pub magic: [u8; 4],
    pub default_port: u16,
    pub genesis: BlockHeader,
}

impl ChainParams {
    pub fn genesis_hash(&self) -> Hash256 {
        self.genesis.hash()
    }
}

// Genesis merkle root in internal byte order, shared by all three networks.
const GENESIS_MERKLE_ROOT: Hash256 = [
    0x3b, 0xa3, 0xed, 0xfd, 0x7a, 0x7b, 0x12, 0xb2, 0x7a, 0xc7, 0x2c, 0x3e, 0x67, 0x76, 0x8f,
    0x61, 0x7f, 0xc8, 0x1b, 0xc3, 0x88, 0x8a, 0x51, 0x32, 0x3a, 0x9f, 0xb8, 0xaa, 0x4b, 0x1e,
    0x5e, 0x4a,
];

pub fn chain_params(network: Network) -> ChainParams {
    match network {
        Network::Mainnet => ChainParams {
            network,
            magic: [0xf9, 0xbe, 0xb4, 0xd9],
            default_port: 8333,
            genesis: BlockHeader {
                version: 1,
                prev_block: [0u8; 32],
                merkle_root: GENESIS_MERKLE_ROOT,
                time: 1_231_006_505,
                bits: 0x1d00ffff,
                nonce: 2_083_236_893,
            },
        },
        Network::Testnet => ChainParams {
            network,
            magic: [0x0b, 0x11, 0x09, 0x07],
            default_port: 18333,
            genesis: BlockHeader {
                version: 1,
                prev_block: [0u8; 32],
                merkle_root: GENESIS_MERKLE_ROOT,
                time: 1_296_688_602,
                bits: 0x1d00ffff,
                nonce: 414_098_458,
            },
        },
        Network::Regtest => ChainParams {
            network,
            magic: [0xfa, 0xbf, 0xb5, 0xda],
            default_port: 18444,
            genesis: BlockHeader {
                version: 1,
                prev_block: [0u8; 32],
                merkle_root: GENESIS_MERKLE_ROOT,
                time: 1_296_688_602,
                bits: 0x207fffff,
                nonce: 2,
            },
        },
    }
}
