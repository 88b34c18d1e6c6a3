//! Wallets: labeled groups of scripts, and their aggregated movements.
//!
//! A wallet rule binds one script to a wallet label. The Wallets task runs
//! against a snapshot of all rules taken when the task is constructed, so a
//! rule added mid-run applies from the next run onward.

use std::collections::HashMap;

use chaindex_primitives::hash::sha256;
use chaindex_primitives::Hash256;
use chaindex_storage::{Column, KeyValueStore, WriteBatch};
use serde::{Deserialize, Serialize};

use crate::address_index::script_hash;
use crate::IndexError;

const WALLET_KEY_LEN: usize = 32;
const DELTA_KEY_LEN: usize = WALLET_KEY_LEN + 4 + 32;

pub fn wallet_key(wallet_id: &str) -> Hash256 {
    sha256(wallet_id.as_bytes())
}

fn rule_key(wallet: &Hash256, script: &Hash256) -> Vec<u8> {
    let mut key = Vec::with_capacity(64);
    key.extend_from_slice(wallet);
    key.extend_from_slice(script);
    key
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct WalletRule {
    pub wallet: String,
    pub script_hex: String,
}

/// Script-hash to wallet-label mapping frozen at construction time.
#[derive(Clone, Debug, Default)]
pub struct RuleSnapshot {
    by_script: HashMap<Hash256, Vec<String>>,
}

impl RuleSnapshot {
    pub fn wallets_for(&self, script: &Hash256) -> &[String] {
        self.by_script
            .get(script)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.by_script.is_empty()
    }

    pub fn len(&self) -> usize {
        self.by_script.values().map(Vec::len).sum()
    }
}

pub struct WalletRules<S> {
    store: S,
}

impl<S> WalletRules<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: KeyValueStore> WalletRules<S> {
    pub fn add(&self, wallet_id: &str, script_pubkey: &[u8]) -> Result<(), IndexError> {
        let rule = WalletRule {
            wallet: wallet_id.to_string(),
            script_hex: chaindex_primitives::hash::bytes_to_hex(script_pubkey),
        };
        let value = serde_json::to_vec(&rule)
            .map_err(|err| IndexError::TaskFailed(format!("encode wallet rule: {err}")))?;
        self.store.put(
            Column::WalletRules,
            &rule_key(&wallet_key(wallet_id), &script_hash(script_pubkey)),
            &value,
        )?;
        Ok(())
    }

    pub fn snapshot(&self) -> Result<RuleSnapshot, IndexError> {
        let entries = self.store.scan_prefix(Column::WalletRules, &[])?;
        let mut by_script: HashMap<Hash256, Vec<String>> = HashMap::new();
        for (_, value) in entries {
            let rule: WalletRule = serde_json::from_slice(&value)
                .map_err(|_| IndexError::CorruptRow("wallet rule row malformed"))?;
            let script = chaindex_primitives::hash::bytes_from_hex(&rule.script_hex)
                .ok_or(IndexError::CorruptRow("wallet rule script not hex"))?;
            by_script
                .entry(script_hash(&script))
                .or_default()
                .push(rule.wallet);
        }
        Ok(RuleSnapshot { by_script })
    }
}

pub fn wallet_delta_key(wallet: &Hash256, height: u32, txid: &Hash256) -> Vec<u8> {
    let mut key = Vec::with_capacity(DELTA_KEY_LEN);
    key.extend_from_slice(wallet);
    key.extend_from_slice(&height.to_be_bytes());
    key.extend_from_slice(txid);
    key
}

pub fn write_wallet_delta(
    batch: &mut WriteBatch,
    wallet_id: &str,
    height: u32,
    txid: &Hash256,
    delta: i64,
) {
    batch.put(
        Column::WalletDeltas,
        wallet_delta_key(&wallet_key(wallet_id), height, txid),
        delta.to_le_bytes().to_vec(),
    );
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WalletDelta {
    pub height: u32,
    pub txid: Hash256,
    pub delta: i64,
}

pub struct WalletIndex<S> {
    store: S,
}

impl<S> WalletIndex<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: KeyValueStore> WalletIndex<S> {
    pub fn scan(&self, wallet_id: &str) -> Result<Vec<WalletDelta>, IndexError> {
        let prefix = wallet_key(wallet_id);
        let entries = self.store.scan_prefix(Column::WalletDeltas, &prefix)?;
        let mut deltas = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            if key.len() != DELTA_KEY_LEN || value.len() != 8 {
                return Err(IndexError::CorruptRow("wallet delta row malformed"));
            }
            let height =
                u32::from_be_bytes(key[WALLET_KEY_LEN..WALLET_KEY_LEN + 4].try_into().unwrap_or_default());
            let txid: Hash256 = key[WALLET_KEY_LEN + 4..].try_into().unwrap_or_default();
            deltas.push(WalletDelta {
                height,
                txid,
                delta: i64::from_le_bytes(value.try_into().unwrap_or_default()),
            });
        }
        Ok(deltas)
    }

    pub fn balance(&self, wallet_id: &str) -> Result<i64, IndexError> {
        Ok(self.scan(wallet_id)?.iter().map(|delta| delta.delta).sum())
    }
}
