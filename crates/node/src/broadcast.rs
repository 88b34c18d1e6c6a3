//! Outbound transaction broadcasting.
//!
//! Submitted transactions sit on a persistent scheduled queue. Each delivery
//! either short-circuits (already rejected, already confirmed on the active
//! chain), or announces the transaction to every connected peer and climbs
//! the retry ladder. Mempool arrival is detected by the listener when a peer
//! echoes the `inv` back, which evicts the entry from the broadcasting table.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chaindex_chain::SharedHeaderChain;
use chaindex_index::rejects::RejectTable;
use chaindex_index::txindex::TxIndex;
use chaindex_index::IndexError;
use chaindex_primitives::hash::{bytes_from_hex, bytes_to_hex, hash256_to_hex, sha256d};
use chaindex_primitives::Hash256;
use chaindex_storage::{KeyValueStore, QueueMessage, ScheduledQueue, StoreError};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::group::NodesGroup;
use crate::stats::Stats;

pub const BROADCAST_TABLE_CAP: usize = 1000;
pub const MAX_BROADCAST_ATTEMPTS: u8 = 5;

const RETRY_DELAYS_SECS: [u64; 5] = [300, 600, 3600, 21_600, 86_400];
const PEER_WAIT_BACKOFF_MS: [u64; 9] = [50, 100, 200, 300, 1000, 2000, 3000, 6000, 12_000];
const MIN_BROADCAST_PEERS: usize = 2;
const RECEIVE_VISIBILITY_SECS: u64 = 60;
const EMPTY_POLL_DELAY_MS: u64 = 1000;

/// Delay before the next attempt, given the attempt counter after this send.
/// `None` once the ladder is exhausted: the message dies.
pub fn next_broadcast_delay(tried: u8) -> Option<Duration> {
    if tried == 0 || tried > MAX_BROADCAST_ATTEMPTS {
        return None;
    }
    Some(Duration::from_secs(RETRY_DELAYS_SECS[(tried - 1) as usize]))
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct BroadcastEntry {
    pub tx_hex: String,
    pub tried: u8,
}

impl BroadcastEntry {
    pub fn new(raw: &[u8]) -> Self {
        Self {
            tx_hex: bytes_to_hex(raw),
            tried: 0,
        }
    }

    pub fn raw(&self) -> Option<Vec<u8>> {
        bytes_from_hex(&self.tx_hex)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }
}

/// Transactions we have announced and not yet seen in a mempool. Bounded;
/// overflowing clears the whole table. The entries are a heuristic, the
/// reject table and inv echo recover what a clear loses.
#[derive(Default)]
pub struct BroadcastTable {
    entries: Mutex<HashMap<Hash256, Vec<u8>>>,
}

impl BroadcastTable {
    pub fn insert(&self, txid: Hash256, raw: Vec<u8>) {
        if let Ok(mut entries) = self.entries.lock() {
            if entries.len() >= BROADCAST_TABLE_CAP {
                entries.clear();
            }
            entries.insert(txid, raw);
        }
    }

    pub fn remove(&self, txid: &Hash256) -> Option<Vec<u8>> {
        self.entries.lock().ok()?.remove(txid)
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.entries
            .lock()
            .map(|entries| entries.contains_key(txid))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn submit<Q: ScheduledQueue>(queue: &Q, raw: &[u8]) -> Result<(), StoreError> {
    queue.send(&BroadcastEntry::new(raw).to_bytes())
}

pub struct Broadcaster<S, Q> {
    store: S,
    chain: SharedHeaderChain,
    queue: Q,
    group: Arc<NodesGroup>,
    table: Arc<BroadcastTable>,
    stats: Arc<Stats>,
}

impl<S, Q> Broadcaster<S, Q>
where
    S: KeyValueStore,
    Q: ScheduledQueue,
{
    pub fn new(
        store: S,
        chain: SharedHeaderChain,
        queue: Q,
        group: Arc<NodesGroup>,
        table: Arc<BroadcastTable>,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            store,
            chain,
            queue,
            group,
            table,
            stats,
        }
    }

    /// False when the transaction must not go out again: a peer rejected it
    /// with a terminal code, or it is already confirmed on the active chain.
    pub fn should_broadcast(&self, txid: &Hash256) -> Result<bool, IndexError> {
        if RejectTable::new(&self.store).contains(txid)? {
            return Ok(false);
        }
        if let Some(row) = TxIndex::new(&self.store).get(txid)? {
            if self.chain.read().is_active(&row.block_hash) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Announces and computes the next step for one due message. The caller
    /// has already passed the peer gate. `Ok(Some(delay))` reschedules the
    /// message (payload updated with the bumped counter), `Ok(None)` completes
    /// it.
    pub fn handle_message(
        &self,
        message: &mut QueueMessage,
    ) -> Result<Option<Duration>, IndexError> {
        let Some(mut entry) = BroadcastEntry::from_bytes(&message.payload) else {
            log::warn!("dropping undecodable broadcast message {}", message.id);
            return Ok(None);
        };
        let Some(raw) = entry.raw() else {
            log::warn!("dropping broadcast message {} with bad tx hex", message.id);
            return Ok(None);
        };
        let txid = sha256d(&raw);

        if !self.should_broadcast(&txid)? {
            log::debug!("not broadcasting {}", hash256_to_hex(&txid));
            return Ok(None);
        }

        self.table.insert(txid, raw);
        let peers = self.group.broadcast_inv(txid);
        Stats::bump(&self.stats.broadcasts_sent);
        entry.tried = entry.tried.saturating_add(1);
        log::info!(
            "announced {} to {peers} peer(s), attempt {}",
            hash256_to_hex(&txid),
            entry.tried
        );

        match next_broadcast_delay(entry.tried) {
            Some(delay) => {
                message.payload = entry.to_bytes();
                Ok(Some(delay))
            }
            None => {
                log::info!(
                    "giving up on {} after {} attempts",
                    hash256_to_hex(&txid),
                    entry.tried
                );
                Ok(None)
            }
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), String> {
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            let received = self
                .queue
                .receive(Duration::from_secs(RECEIVE_VISIBILITY_SECS))
                .map_err(|err| err.to_string())?;
            let Some(mut message) = received else {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(EMPTY_POLL_DELAY_MS)) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            };

            let announce = match BroadcastEntry::from_bytes(&message.payload)
                .and_then(|entry| entry.raw())
            {
                Some(raw) => self
                    .should_broadcast(&sha256d(&raw))
                    .map_err(|err| err.to_string())?,
                // Undecodable payloads are cleaned up by handle_message.
                None => false,
            };
            if announce && !self.wait_for_peers(&mut shutdown).await {
                // Shutting down; the message stays queued for the next run.
                return Ok(());
            }

            match self.handle_message(&mut message).map_err(|err| err.to_string())? {
                Some(delay) => self
                    .queue
                    .reschedule_in(&message, delay)
                    .map_err(|err| err.to_string())?,
                None => self
                    .queue
                    .complete(&message)
                    .map_err(|err| err.to_string())?,
            }
        }
    }

    /// Blocks until enough peers are connected, stepping up the clamped
    /// backoff sequence. False when shutdown interrupts the wait.
    async fn wait_for_peers(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let mut backoff = 0usize;
        while self.group.count() < MIN_BROADCAST_PEERS {
            if *shutdown.borrow() {
                return false;
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(PEER_WAIT_BACKOFF_MS[backoff])) => {}
                _ = shutdown.changed() => {}
            }
            if backoff + 1 < PEER_WAIT_BACKOFF_MS.len() {
                backoff += 1;
            }
        }
        true
    }
}
