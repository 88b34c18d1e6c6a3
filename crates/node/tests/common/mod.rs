#![allow(dead_code)]

use std::sync::Arc;

use chaindex_chain::{chain_params, HeaderChain, Network, SharedHeaderChain};
use chaindex_index::checkpoint::CheckpointStore;
use chaindex_index::repository::StoreBlockRepository;
use chaindex_node::broadcast::BroadcastTable;
use chaindex_node::bulk::{BulkIndexer, BulkOptions};
use chaindex_node::events::EventBus;
use chaindex_node::listener::ListenerCore;
use chaindex_node::stats::Stats;
use chaindex_primitives::hash::sha256d;
use chaindex_primitives::{Block, BlockHeader, Hash256, OutPoint, Transaction, TxIn, TxOut};
use chaindex_storage::memory::MemoryStore;
use chaindex_storage::{Column, KvBlobStore, KvQueue};

pub type Store = Arc<MemoryStore>;
pub type Blobs = Arc<KvBlobStore<Store>>;
pub type Queue = Arc<KvQueue<Store>>;
pub type Repository = Arc<StoreBlockRepository<Blobs>>;

pub struct NodeHarness {
    pub store: Store,
    pub blobs: Blobs,
    pub chain: SharedHeaderChain,
    pub repository: Repository,
    pub work_queue: Queue,
    pub broadcast_queue: Queue,
    pub stats: Arc<Stats>,
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
            script_pubkey: vec![0x76, (height % 5) as u8],
        }],
        lock_time: 0,
    }
}

fn filler_tx(height: u32, position: u32) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxIn {
            previous_output: OutPoint {
                hash: sha256d(&[height as u8, (height >> 8) as u8, position as u8]),
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

pub fn build_block(prev_block: Hash256, height: u32, tx_count: u32) -> Block {
    let mut transactions = vec![coinbase(height)];
    for position in 1..tx_count {
        transactions.push(filler_tx(height, position));
    }
    build_block_with(prev_block, height, transactions)
}

/// Regtest chain with `blocks` mined blocks, each carrying `txs_per_block`
/// transactions, bodies cached in the blob repository, queues empty.
pub fn harness(blocks: u32, txs_per_block: u32) -> NodeHarness {
    let store: Store = Arc::new(MemoryStore::new());
    let blobs: Blobs = Arc::new(KvBlobStore::new(Arc::clone(&store)));
    let repository: Repository = Arc::new(StoreBlockRepository::new(Arc::clone(&blobs)));
    let work_queue: Queue =
        Arc::new(KvQueue::open(Arc::clone(&store), Column::WorkQueue).expect("open work queue"));
    let broadcast_queue: Queue = Arc::new(
        KvQueue::open(Arc::clone(&store), Column::BroadcastQueue).expect("open broadcast queue"),
    );

    let params = chain_params(Network::Regtest);
    let mut chain = HeaderChain::new(params.genesis);
    // The cached genesis body carries its coinbase so sampling sees a
    // transaction count at height zero.
    let genesis_block = Block {
        header: params.genesis,
        transactions: vec![coinbase(0)],
    };
    repository.put_block(&genesis_block).expect("cache genesis");

    let mut bodies = vec![genesis_block];
    let mut headers = Vec::new();
    let mut prev = chain.genesis().hash;
    for height in 1..=blocks {
        let block = build_block(prev, height, txs_per_block.max(1));
        prev = block.hash();
        headers.push(block.header);
        repository.put_block(&block).expect("cache block");
        bodies.push(block);
    }
    chain.connect(&headers).expect("connect");

    NodeHarness {
        store,
        blobs,
        chain: SharedHeaderChain::new(chain),
        repository,
        work_queue,
        broadcast_queue,
        stats: Arc::new(Stats::new()),
        blocks: bodies,
    }
}

impl NodeHarness {
    pub fn bulk(&self, options: BulkOptions) -> BulkIndexer<Store, Blobs, Queue, Repository> {
        BulkIndexer::new(
            Arc::clone(&self.store),
            Arc::clone(&self.blobs),
            Arc::clone(&self.work_queue),
            Arc::clone(&self.repository),
            self.chain.clone(),
            options,
        )
    }

    pub fn checkpoints(&self) -> CheckpointStore<Blobs> {
        CheckpointStore::new(Arc::clone(&self.blobs))
    }

    pub fn listener_core(&self) -> Arc<ListenerCore<Store, Blobs>> {
        Arc::new(ListenerCore::new(
            Arc::clone(&self.store),
            self.chain.clone(),
            Arc::clone(&self.blobs),
            EventBus::new(),
            Arc::new(BroadcastTable::default()),
            Arc::clone(&self.stats),
        ))
    }

    pub fn append_block(&mut self, block: Block) {
        self.chain
            .write()
            .connect(&[block.header])
            .expect("connect appended block");
        self.repository.put_block(&block).expect("cache block");
        self.blocks.push(block);
    }
}
