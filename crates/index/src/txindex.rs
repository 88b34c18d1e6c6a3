//! Per-transaction records: confirmation point plus the raw body.

use chaindex_primitives::{Hash256, OutPoint, Transaction};
use chaindex_storage::{Column, KeyValueStore, WriteBatch};

use crate::IndexError;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxRow {
    pub block_hash: Hash256,
    pub height: u32,
    pub position: u32,
    pub raw: Vec<u8>,
}

pub fn tx_row_value(block_hash: &Hash256, height: u32, position: u32, raw: &[u8]) -> Vec<u8> {
    let mut value = Vec::with_capacity(32 + 4 + 4 + raw.len());
    value.extend_from_slice(block_hash);
    value.extend_from_slice(&height.to_le_bytes());
    value.extend_from_slice(&position.to_le_bytes());
    value.extend_from_slice(raw);
    value
}

pub fn write_transaction(
    batch: &mut WriteBatch,
    block_hash: &Hash256,
    height: u32,
    position: u32,
    transaction: &Transaction,
) {
    let raw = transaction.consensus_encode();
    batch.put(
        Column::Transactions,
        transaction.txid(),
        tx_row_value(block_hash, height, position, &raw),
    );
}

pub struct TxIndex<S> {
    store: S,
}

impl<S> TxIndex<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: KeyValueStore> TxIndex<S> {
    pub fn get(&self, txid: &Hash256) -> Result<Option<TxRow>, IndexError> {
        let Some(value) = self.store.get(Column::Transactions, txid)? else {
            return Ok(None);
        };
        if value.len() < 40 {
            return Err(IndexError::CorruptRow("transaction row too short"));
        }
        let block_hash: Hash256 = value[0..32].try_into().unwrap_or_default();
        let height = u32::from_le_bytes(value[32..36].try_into().unwrap_or_default());
        let position = u32::from_le_bytes(value[36..40].try_into().unwrap_or_default());
        Ok(Some(TxRow {
            block_hash,
            height,
            position,
            raw: value[40..].to_vec(),
        }))
    }

    pub fn contains(&self, txid: &Hash256) -> Result<bool, IndexError> {
        Ok(self.store.get(Column::Transactions, txid)?.is_some())
    }

    /// Script and value of an indexed output, when its funding transaction is
    /// already present.
    pub fn output_of(&self, outpoint: &OutPoint) -> Result<Option<(Vec<u8>, i64)>, IndexError> {
        let Some(row) = self.get(&outpoint.hash)? else {
            return Ok(None);
        };
        let transaction = Transaction::consensus_decode(&row.raw)?;
        Ok(transaction
            .outputs
            .get(outpoint.index as usize)
            .map(|output| (output.script_pubkey.clone(), output.value)))
    }
}
