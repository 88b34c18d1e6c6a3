//! The four index processors. Each consumes a block fetcher and writes
//! denormalized rows; row keys derive from block and transaction hashes, so a
//! redelivered range overwrites its own partial output.

use std::collections::HashMap;

use chaindex_primitives::{Block, Hash256};
use chaindex_storage::{KeyValueStore, WriteBatch};

use crate::address_index::{script_hash, write_balance_delta};
use crate::blockindex::write_block;
use crate::fetcher::BlockFetcher;
use crate::repository::BlockRepository;
use crate::txindex::{write_transaction, TxIndex};
use crate::wallet_index::{write_wallet_delta, RuleSnapshot};
use crate::IndexError;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TaskKind {
    Blocks,
    Transactions,
    Balances,
    Wallets,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct IndexStats {
    pub blocks: usize,
    pub rows: usize,
}

#[derive(Clone, Debug)]
pub struct IndexTask {
    kind: TaskKind,
    wallet_rules: RuleSnapshot,
    save_progress: bool,
}

impl IndexTask {
    pub fn blocks() -> Self {
        Self::with_kind(TaskKind::Blocks)
    }

    pub fn transactions() -> Self {
        Self::with_kind(TaskKind::Transactions)
    }

    pub fn balances() -> Self {
        Self::with_kind(TaskKind::Balances)
    }

    pub fn wallets(rules: RuleSnapshot) -> Self {
        Self {
            kind: TaskKind::Wallets,
            wallet_rules: rules,
            save_progress: true,
        }
    }

    fn with_kind(kind: TaskKind) -> Self {
        Self {
            kind,
            wallet_rules: RuleSnapshot::default(),
            save_progress: true,
        }
    }

    /// Bulk runs disable per-task progress; the bulk indexer owns checkpoint
    /// advancement there.
    pub fn with_save_progress(mut self, enabled: bool) -> Self {
        self.save_progress = enabled;
        self
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn save_progress_enabled(&self) -> bool {
        self.save_progress
    }

    pub fn checkpoint_name(&self) -> &'static str {
        match self.kind {
            TaskKind::Blocks => crate::checkpoint::CHECKPOINT_BLOCKS,
            TaskKind::Transactions => crate::checkpoint::CHECKPOINT_TRANSACTIONS,
            TaskKind::Balances => crate::checkpoint::CHECKPOINT_BALANCES,
            TaskKind::Wallets => crate::checkpoint::CHECKPOINT_WALLETS,
        }
    }

    pub fn for_target(target: &str, rules: RuleSnapshot) -> Option<Self> {
        match target {
            crate::checkpoint::CHECKPOINT_BLOCKS => Some(Self::blocks()),
            crate::checkpoint::CHECKPOINT_TRANSACTIONS => Some(Self::transactions()),
            crate::checkpoint::CHECKPOINT_BALANCES => Some(Self::balances()),
            crate::checkpoint::CHECKPOINT_WALLETS => Some(Self::wallets(rules)),
            _ => None,
        }
    }

    pub fn index<S, R>(&self, store: &S, fetcher: BlockFetcher<R>) -> Result<IndexStats, IndexError>
    where
        S: KeyValueStore,
        R: BlockRepository,
    {
        let mut stats = IndexStats::default();
        for item in fetcher {
            let (height, block) = item?;
            let mut batch = WriteBatch::new();
            match self.kind {
                TaskKind::Blocks => self.index_block_row(&mut batch, height, &block),
                TaskKind::Transactions => self.index_transactions(&mut batch, height, &block),
                TaskKind::Balances => self.index_balances(store, &mut batch, height, &block)?,
                TaskKind::Wallets => self.index_wallets(store, &mut batch, height, &block)?,
            }
            stats.blocks += 1;
            stats.rows += batch.len();
            if !batch.is_empty() {
                store.write_batch(&batch)?;
            }
        }
        Ok(stats)
    }

    /// Indexes one block outside a range run (the live path).
    pub fn index_single<S: KeyValueStore>(
        &self,
        store: &S,
        height: u32,
        block: &Block,
    ) -> Result<usize, IndexError> {
        let mut batch = WriteBatch::new();
        match self.kind {
            TaskKind::Blocks => self.index_block_row(&mut batch, height, block),
            TaskKind::Transactions => self.index_transactions(&mut batch, height, block),
            TaskKind::Balances => self.index_balances(store, &mut batch, height, block)?,
            TaskKind::Wallets => self.index_wallets(store, &mut batch, height, block)?,
        }
        let rows = batch.len();
        if !batch.is_empty() {
            store.write_batch(&batch)?;
        }
        Ok(rows)
    }

    fn index_block_row(&self, batch: &mut WriteBatch, height: u32, block: &Block) {
        write_block(batch, height, block);
    }

    fn index_transactions(&self, batch: &mut WriteBatch, height: u32, block: &Block) {
        let block_hash = block.hash();
        for (position, transaction) in block.transactions.iter().enumerate() {
            write_transaction(batch, &block_hash, height, position as u32, transaction);
        }
    }

    fn index_balances<S: KeyValueStore>(
        &self,
        store: &S,
        batch: &mut WriteBatch,
        height: u32,
        block: &Block,
    ) -> Result<(), IndexError> {
        for (txid, deltas) in script_deltas(store, block)? {
            for (script, delta) in deltas {
                write_balance_delta(batch, &script, height, &txid, delta);
            }
        }
        Ok(())
    }

    fn index_wallets<S: KeyValueStore>(
        &self,
        store: &S,
        batch: &mut WriteBatch,
        height: u32,
        block: &Block,
    ) -> Result<(), IndexError> {
        if self.wallet_rules.is_empty() {
            return Ok(());
        }
        for (txid, deltas) in script_deltas(store, block)? {
            let mut per_wallet: HashMap<&str, i64> = HashMap::new();
            for (script, delta) in &deltas {
                for wallet in self.wallet_rules.wallets_for(script) {
                    *per_wallet.entry(wallet.as_str()).or_insert(0) += *delta;
                }
            }
            for (wallet, delta) in per_wallet {
                write_wallet_delta(batch, wallet, height, &txid, delta);
            }
        }
        Ok(())
    }
}

/// Net per-script movement of every transaction in the block. Credits come
/// from the outputs; debits resolve through the transaction index and are
/// skipped when the funding transaction has not been indexed yet.
fn script_deltas<S: KeyValueStore>(
    store: &S,
    block: &Block,
) -> Result<Vec<(Hash256, HashMap<Hash256, i64>)>, IndexError> {
    let tx_index = TxIndex::new(store);
    let mut per_tx = Vec::with_capacity(block.transactions.len());
    for transaction in &block.transactions {
        let txid = transaction.txid();
        let mut deltas: HashMap<Hash256, i64> = HashMap::new();
        for output in &transaction.outputs {
            *deltas.entry(script_hash(&output.script_pubkey)).or_insert(0) += output.value;
        }
        if !transaction.is_coinbase() {
            for input in &transaction.inputs {
                if let Some((script, value)) = tx_index.output_of(&input.previous_output)? {
                    *deltas.entry(script_hash(&script)).or_insert(0) -= value;
                }
            }
        }
        per_tx.push((txid, deltas));
    }
    Ok(per_tx)
}
