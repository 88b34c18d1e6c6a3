#![allow(dead_code)]

use std::sync::Arc;

use chaindex_chain::{chain_params, HeaderChain, Network, SharedHeaderChain};
use chaindex_index::repository::StoreBlockRepository;
use chaindex_primitives::hash::sha256d;
use chaindex_primitives::{Block, BlockHeader, Hash256, OutPoint, Transaction, TxIn, TxOut};
use chaindex_storage::memory::MemoryStore;
use chaindex_storage::KvBlobStore;

pub type Blobs = Arc<KvBlobStore<Arc<MemoryStore>>>;
pub type Repository = Arc<StoreBlockRepository<Blobs>>;

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub blobs: Blobs,
    pub chain: SharedHeaderChain,
    pub repository: Repository,
    pub blocks: Vec<Block>,
}

pub fn coinbase(height: u32) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig: height.to_le_bytes().to_vec(),
            sequence: u32::MAX,
        }],
        outputs: vec![TxOut {
            value: 50_0000_0000,
            script_pubkey: miner_script(height),
        }],
        lock_time: 0,
    }
}

pub fn miner_script(height: u32) -> Vec<u8> {
    vec![0x76, (height % 5) as u8]
}

fn filler_tx(height: u32, position: u32) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxIn {
            // Synthetic funding reference; intentionally unresolvable.
            previous_output: OutPoint {
                hash: sha256d(&[height as u8, position as u8, 0xfe]),
                index: 0,
            },
            script_sig: Vec::new(),
            sequence: u32::MAX,
        }],
        outputs: vec![TxOut {
            value: 1000 + position as i64,
            script_pubkey: vec![0x51, (position % 7) as u8],
        }],
        lock_time: 0,
    }
}

pub fn build_block(prev_block: Hash256, height: u32, extra_txs: u32) -> Block {
    build_block_with(prev_block, height, {
        let mut transactions = vec![coinbase(height)];
        for position in 0..extra_txs {
            transactions.push(filler_tx(height, position));
        }
        transactions
    })
}

pub fn build_block_with(prev_block: Hash256, height: u32, transactions: Vec<Transaction>) -> Block {
    let mut root_input = Vec::new();
    for transaction in &transactions {
        root_input.extend_from_slice(&transaction.txid());
    }
    root_input.extend_from_slice(&height.to_le_bytes());
    Block {
        header: BlockHeader {
            version: 4,
            prev_block,
            merkle_root: sha256d(&root_input),
            time: 1_600_000_000 + height,
            bits: 0x207fffff,
            nonce: 0,
        },
        transactions,
    }
}

/// Chain of `blocks` mined blocks on top of regtest genesis, every block
/// carrying a coinbase plus `extra_txs` filler transactions, all bodies cached
/// in the blob-backed repository.
pub fn harness(blocks: u32, extra_txs: u32) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let blobs: Blobs = Arc::new(KvBlobStore::new(Arc::clone(&store)));
    let repository: Repository = Arc::new(StoreBlockRepository::new(Arc::clone(&blobs)));

    let params = chain_params(Network::Regtest);
    let mut chain = HeaderChain::new(params.genesis);
    let genesis_block = Block {
        header: params.genesis,
        transactions: Vec::new(),
    };
    repository.put_block(&genesis_block).expect("cache genesis");

    let mut bodies = vec![genesis_block];
    let mut headers = Vec::new();
    let mut prev = chain.genesis().hash;
    for height in 1..=blocks {
        let block = build_block(prev, height, extra_txs);
        prev = block.hash();
        headers.push(block.header);
        repository.put_block(&block).expect("cache block");
        bodies.push(block);
    }
    chain.connect(&headers).expect("connect");

    Harness {
        store,
        blobs,
        chain: SharedHeaderChain::new(chain),
        repository,
        blocks: bodies,
    }
}

impl Harness {
    pub fn append_block(&mut self, block: Block) {
        self.chain
            .write()
            .connect(&[block.header])
            .expect("connect appended block");
        self.repository.put_block(&block).expect("cache block");
        self.blocks.push(block);
    }

    pub fn fetcher(&self, from: u32, to: u32) -> chaindex_index::BlockFetcher<Repository> {
        chaindex_index::BlockFetcher::new(
            Arc::clone(&self.repository),
            self.chain.clone(),
            from,
            to,
        )
    }
}
