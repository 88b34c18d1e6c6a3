//! Durable per-index resume points, stored as hex-encoded block locators.
//!
//! A checkpoint only ever moves forward: a write whose fork point against the
//! current chain is below the stored one is dropped unless the caller holds
//! the blob lease, which is how a deliberate rewind is expressed.

use std::time::Duration;

use chaindex_chain::locator::{locator_from_hex, locator_to_hex};
use chaindex_chain::HeaderChain;
use chaindex_primitives::Hash256;
use chaindex_storage::{BlobStore, Lease};

use crate::IndexError;

pub const CHECKPOINT_BLOCKS: &str = "blocks";
pub const CHECKPOINT_TRANSACTIONS: &str = "transactions";
pub const CHECKPOINT_BALANCES: &str = "balances";
pub const CHECKPOINT_WALLETS: &str = "wallets";

pub const CHECKPOINT_NAMES: [&str; 4] = [
    CHECKPOINT_BLOCKS,
    CHECKPOINT_TRANSACTIONS,
    CHECKPOINT_BALANCES,
    CHECKPOINT_WALLETS,
];

pub struct CheckpointStore<B> {
    blobs: B,
}

impl<B> CheckpointStore<B> {
    pub fn new(blobs: B) -> Self {
        Self { blobs }
    }

    fn blob_name(name: &str) -> String {
        format!("checkpoints/{name}")
    }
}

impl<B: BlobStore> CheckpointStore<B> {
    /// Stored locator for one index; `None` before first use.
    pub fn get(&self, name: &str) -> Result<Option<Vec<Hash256>>, IndexError> {
        let Some(body) = self.blobs.get(&Self::blob_name(name))? else {
            return Ok(None);
        };
        let text = String::from_utf8(body)
            .map_err(|_| IndexError::CorruptRow("checkpoint body is not utf8"))?;
        locator_from_hex(&text)
            .map(Some)
            .ok_or(IndexError::CorruptRow("checkpoint body is not a locator"))
    }

    /// Fork-point height of the stored locator against the chain; 0 before
    /// first use (everything starts at genesis).
    pub fn fork_height(&self, name: &str, chain: &HeaderChain) -> Result<u32, IndexError> {
        match self.get(name)? {
            Some(locator) => Ok(chain.find_fork(&locator).height),
            None => Ok(0),
        }
    }

    /// Writes a new locator if it advances the checkpoint. Returns whether the
    /// write happened; a rewind is only written under the lease.
    pub fn save_progress(
        &self,
        name: &str,
        locator: &[Hash256],
        chain: &HeaderChain,
        lease: Option<&Lease>,
    ) -> Result<bool, IndexError> {
        let new_height = chain.find_fork(locator).height;
        let advances = match self.get(name)? {
            Some(stored) => new_height > chain.find_fork(&stored).height,
            None => true,
        };
        if !advances && lease.is_none() {
            log::debug!("checkpoint {name}: write at fork height {new_height} is not an advance");
            return Ok(false);
        }
        self.blobs.put(
            &Self::blob_name(name),
            locator_to_hex(locator).as_bytes(),
            lease,
        )?;
        Ok(true)
    }

    pub fn lease(&self, name: &str, ttl: Duration) -> Result<Lease, IndexError> {
        Ok(self.blobs.lease(&Self::blob_name(name), ttl)?)
    }

    pub fn release(&self, lease: &Lease) -> Result<(), IndexError> {
        Ok(self.blobs.release(lease)?)
    }
}
