//! Arena-backed header chain.
//!
//! Records are append-only; the active chain is the `active` vector mapping
//! height to record index. A reorg rewrites the suffix of that vector, so
//! height-keyed lookups stay internally consistent at every point.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chaindex_primitives::hash::hash256_to_hex;
use chaindex_primitives::{BlockHeader, Hash256};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChainError {
    UnknownHash(Hash256),
    OrphanHeader(Hash256),
    CorruptIndex(&'static str),
}

impl fmt::Display for ChainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainError::UnknownHash(hash) => {
                write!(f, "unknown block hash {}", hash256_to_hex(hash))
            }
            ChainError::OrphanHeader(prev) => {
                write!(f, "header parent {} not in chain", hash256_to_hex(prev))
            }
            ChainError::CorruptIndex(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for ChainError {}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HeaderEntry {
    pub hash: Hash256,
    pub height: u32,
    pub header: BlockHeader,
}

struct HeaderRecord {
    header: BlockHeader,
    hash: Hash256,
    height: u32,
    // Genesis points at itself.
    parent: usize,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ConnectOutcome {
    pub accepted: usize,
    pub reorged: bool,
    /// Height of the highest block shared with the previous active chain.
    /// Meaningful whenever a branch was adopted; the activated suffix is
    /// everything above it.
    pub fork_height: u32,
}

pub struct HeaderChain {
    records: Vec<HeaderRecord>,
    by_hash: HashMap<Hash256, usize>,
    active: Vec<usize>,
}

impl HeaderChain {
    pub fn new(genesis: BlockHeader) -> Self {
        let hash = genesis.hash();
        let record = HeaderRecord {
            header: genesis,
            hash,
            height: 0,
            parent: 0,
        };
        let mut by_hash = HashMap::new();
        by_hash.insert(hash, 0);
        Self {
            records: vec![record],
            by_hash,
            active: vec![0],
        }
    }

    pub fn genesis(&self) -> HeaderEntry {
        self.entry(self.active[0])
    }

    pub fn tip(&self) -> HeaderEntry {
        self.entry(self.active[self.active.len() - 1])
    }

    pub fn height(&self) -> u32 {
        (self.active.len() - 1) as u32
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.by_hash.contains_key(hash)
    }

    pub fn get_by_hash(&self, hash: &Hash256) -> Option<HeaderEntry> {
        self.by_hash.get(hash).map(|index| self.entry(*index))
    }

    pub fn get_by_height(&self, height: u32) -> Option<HeaderEntry> {
        self.active
            .get(height as usize)
            .map(|index| self.entry(*index))
    }

    pub fn is_active(&self, hash: &Hash256) -> bool {
        match self.by_hash.get(hash) {
            Some(index) => self.is_active_index(*index),
            None => false,
        }
    }

    /// Extends the chain with a contiguous batch of headers. Headers already
    /// known are skipped; a header whose parent is absent is an orphan and
    /// rejects the batch. The branch ending at the last header becomes the
    /// active chain when it is strictly longer than the current one.
    pub fn connect(&mut self, headers: &[BlockHeader]) -> Result<ConnectOutcome, ChainError> {
        let mut accepted = 0;
        let mut leaf = None;
        for header in headers {
            let hash = header.hash();
            if let Some(index) = self.by_hash.get(&hash) {
                leaf = Some(*index);
                continue;
            }
            let parent = *self
                .by_hash
                .get(&header.prev_block)
                .ok_or(ChainError::OrphanHeader(header.prev_block))?;
            let height = self.records[parent].height + 1;
            let index = self.records.len();
            self.records.push(HeaderRecord {
                header: *header,
                hash,
                height,
                parent,
            });
            self.by_hash.insert(hash, index);
            accepted += 1;
            leaf = Some(index);
        }

        let (reorged, fork_height) = match leaf {
            Some(leaf) => self.activate(leaf)?,
            None => (false, self.height()),
        };
        Ok(ConnectOutcome {
            accepted,
            reorged,
            fork_height,
        })
    }

    /// In-order active-chain successors of the given hash. A hash that was
    /// reorged away resolves to its highest active ancestor first.
    pub fn enumerate_after(&self, hash: &Hash256) -> Result<Vec<HeaderEntry>, ChainError> {
        let mut index = *self
            .by_hash
            .get(hash)
            .ok_or(ChainError::UnknownHash(*hash))?;
        while !self.is_active_index(index) {
            index = self.records[index].parent;
        }
        let start = self.records[index].height as usize + 1;
        Ok(self.active[start..]
            .iter()
            .map(|index| self.entry(*index))
            .collect())
    }

    /// Highest active entry referenced by the locator; genesis when nothing
    /// matches.
    pub fn find_fork(&self, locator: &[Hash256]) -> HeaderEntry {
        for hash in locator {
            if let Some(index) = self.by_hash.get(hash) {
                if self.is_active_index(*index) {
                    return self.entry(*index);
                }
            }
        }
        self.genesis()
    }

    /// Exponentially thinning ancestor list starting at `hash`, dense for the
    /// first ten entries, genesis-terminated.
    pub fn locator_of(&self, hash: &Hash256) -> Result<Vec<Hash256>, ChainError> {
        let mut index = *self
            .by_hash
            .get(hash)
            .ok_or(ChainError::UnknownHash(*hash))?;
        let mut locator = Vec::new();
        let mut step: u32 = 1;
        loop {
            let record = &self.records[index];
            locator.push(record.hash);
            if record.height == 0 {
                break;
            }
            let mut back = step;
            while back > 0 && self.records[index].height > 0 {
                index = self.records[index].parent;
                back -= 1;
            }
            if locator.len() > 10 {
                step = step.saturating_mul(2);
            }
        }

        let genesis = self.records[self.active[0]].hash;
        if locator.last() != Some(&genesis) {
            locator.push(genesis);
        }
        Ok(locator)
    }

    pub fn tip_locator(&self) -> Vec<Hash256> {
        let tip = self.tip().hash;
        // The tip is always present.
        self.locator_of(&tip).unwrap_or_else(|_| vec![tip])
    }

    fn entry(&self, index: usize) -> HeaderEntry {
        let record = &self.records[index];
        HeaderEntry {
            hash: record.hash,
            height: record.height,
            header: record.header,
        }
    }

    fn is_active_index(&self, index: usize) -> bool {
        let height = self.records[index].height as usize;
        self.active.get(height) == Some(&index)
    }

    fn activate(&mut self, leaf: usize) -> Result<(bool, u32), ChainError> {
        if self.is_active_index(leaf) {
            return Ok((false, self.records[leaf].height));
        }
        let leaf_height = self.records[leaf].height;
        if leaf_height <= self.height() {
            // Equal-length or shorter side branch: keep the current chain.
            return Ok((false, self.height()));
        }

        // Walk down to the fork point, collecting the new suffix.
        let mut suffix = Vec::new();
        let mut index = leaf;
        while !self.is_active_index(index) {
            suffix.push(index);
            let parent = self.records[index].parent;
            if parent == index && self.records[index].height != 0 {
                return Err(ChainError::CorruptIndex("non-genesis record without parent"));
            }
            index = parent;
        }
        let fork_height = self.records[index].height;
        let reorged = self.active.len() > fork_height as usize + 1;
        self.active.truncate(fork_height as usize + 1);
        self.active.extend(suffix.into_iter().rev());
        Ok((reorged, fork_height))
    }
}

/// Readers share the lock, the single mutator takes it exclusively.
#[derive(Clone)]
pub struct SharedHeaderChain {
    inner: Arc<RwLock<HeaderChain>>,
}

impl SharedHeaderChain {
    pub fn new(chain: HeaderChain) -> Self {
        Self {
            inner: Arc::new(RwLock::new(chain)),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, HeaderChain> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, HeaderChain> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}
