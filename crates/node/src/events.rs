//! Fire-and-forget event topics published by the live listener.

use chaindex_primitives::Hash256;
use tokio::sync::broadcast;

const EVENT_QUEUE: usize = 4096;

/// `NeedIndexNewTransaction` / `NeedIndexNewBlock` topics. Publication is
/// best-effort: with no subscriber the event is dropped.
#[derive(Clone)]
pub struct EventBus {
    new_transaction: broadcast::Sender<Hash256>,
    new_block: broadcast::Sender<Hash256>,
}

impl EventBus {
    pub fn new() -> Self {
        let (new_transaction, _) = broadcast::channel(EVENT_QUEUE);
        let (new_block, _) = broadcast::channel(EVENT_QUEUE);
        Self {
            new_transaction,
            new_block,
        }
    }

    pub fn publish_new_transaction(&self, txid: Hash256) {
        let _ = self.new_transaction.send(txid);
    }

    pub fn publish_new_block(&self, hash: Hash256) {
        let _ = self.new_block.send(hash);
    }

    pub fn subscribe_new_transactions(&self) -> broadcast::Receiver<Hash256> {
        self.new_transaction.subscribe()
    }

    pub fn subscribe_new_blocks(&self) -> broadcast::Receiver<Hash256> {
        self.new_block.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
