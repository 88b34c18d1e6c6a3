//! Script (address) balance movements backed by the storage trait.
//!
//! One row per (script, height, transaction) carrying the net satoshi delta
//! that transaction applied to the script. Keys embed the height big-endian
//! so a prefix scan walks movements in chain order.

use chaindex_primitives::hash::sha256;
use chaindex_primitives::Hash256;
use chaindex_storage::{Column, KeyValueStore, WriteBatch};

use crate::IndexError;

const SCRIPT_HASH_LEN: usize = 32;
const DELTA_KEY_LEN: usize = SCRIPT_HASH_LEN + 4 + 32;

pub fn script_hash(script_pubkey: &[u8]) -> Hash256 {
    sha256(script_pubkey)
}

pub fn balance_delta_key(script_hash: &Hash256, height: u32, txid: &Hash256) -> Vec<u8> {
    let mut key = Vec::with_capacity(DELTA_KEY_LEN);
    key.extend_from_slice(script_hash);
    key.extend_from_slice(&height.to_be_bytes());
    key.extend_from_slice(txid);
    key
}

pub fn write_balance_delta(
    batch: &mut WriteBatch,
    script_hash: &Hash256,
    height: u32,
    txid: &Hash256,
    delta: i64,
) {
    batch.put(
        Column::BalanceDeltas,
        balance_delta_key(script_hash, height, txid),
        delta.to_le_bytes().to_vec(),
    );
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BalanceDelta {
    pub height: u32,
    pub txid: Hash256,
    pub delta: i64,
}

pub struct BalanceIndex<S> {
    store: S,
}

impl<S> BalanceIndex<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: KeyValueStore> BalanceIndex<S> {
    pub fn scan(&self, script_pubkey: &[u8]) -> Result<Vec<BalanceDelta>, IndexError> {
        let prefix = script_hash(script_pubkey);
        let entries = self.store.scan_prefix(Column::BalanceDeltas, &prefix)?;
        let mut deltas = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            deltas.push(delta_from_row(&key, &value)?);
        }
        Ok(deltas)
    }

    pub fn balance(&self, script_pubkey: &[u8]) -> Result<i64, IndexError> {
        Ok(self
            .scan(script_pubkey)?
            .iter()
            .map(|delta| delta.delta)
            .sum())
    }
}

fn delta_from_row(key: &[u8], value: &[u8]) -> Result<BalanceDelta, IndexError> {
    if key.len() != DELTA_KEY_LEN || value.len() != 8 {
        return Err(IndexError::CorruptRow("balance delta row malformed"));
    }
    let height_start = SCRIPT_HASH_LEN;
    let txid_start = height_start + 4;
    let height = u32::from_be_bytes(key[height_start..txid_start].try_into().unwrap_or_default());
    let txid: Hash256 = key[txid_start..].try_into().unwrap_or_default();
    let delta = i64::from_le_bytes(value.try_into().unwrap_or_default());
    Ok(BalanceDelta {
        height,
        txid,
        delta,
    })
}
