//! Secondary indexes over the chain: per-block, per-transaction, per-script
//! balance and per-wallet balance rows, plus the durable checkpoints that
//! track how far each index has been built.

pub mod address_index;
pub mod blockindex;
pub mod checkpoint;
pub mod fetcher;
pub mod range;
pub mod rejects;
pub mod repository;
pub mod task;
pub mod txindex;
pub mod wallet_index;

use std::fmt;

use chaindex_chain::ChainError;
use chaindex_primitives::encoding::DecodeError;
use chaindex_storage::StoreError;

pub use checkpoint::{CheckpointStore, CHECKPOINT_NAMES};
pub use fetcher::BlockFetcher;
pub use range::BlockRange;
pub use repository::{BlockRepository, StoreBlockRepository};
pub use task::{IndexStats, IndexTask, TaskKind};

#[derive(Debug)]
pub enum IndexError {
    Store(StoreError),
    Chain(ChainError),
    Decode(DecodeError),
    /// The chain no longer reaches the requested height; the range was
    /// invalidated by a reorg deeper than its start.
    ChainAdvancedPast(u32),
    CorruptRow(&'static str),
    TaskFailed(String),
}

impl fmt::Display for IndexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexError::Store(err) => write!(f, "{err}"),
            IndexError::Chain(err) => write!(f, "{err}"),
            IndexError::Decode(err) => write!(f, "{err}"),
            IndexError::ChainAdvancedPast(height) => {
                write!(f, "chain no longer reaches height {height}")
            }
            IndexError::CorruptRow(message) => write!(f, "{message}"),
            IndexError::TaskFailed(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for IndexError {}

impl From<StoreError> for IndexError {
    fn from(err: StoreError) -> Self {
        IndexError::Store(err)
    }
}

impl From<ChainError> for IndexError {
    fn from(err: ChainError) -> Self {
        IndexError::Chain(err)
    }
}

impl From<DecodeError> for IndexError {
    fn from(err: DecodeError) -> Self {
        IndexError::Decode(err)
    }
}
