//! Raw block sources. Implementations must return blocks in request order.

use chaindex_primitives::hash::hash256_to_hex;
use chaindex_primitives::{Block, Hash256};
use chaindex_storage::BlobStore;

use crate::IndexError;

pub trait BlockRepository: Send + Sync {
    fn get_blocks(&self, hashes: &[Hash256]) -> Result<Vec<Block>, IndexError>;
}

impl<T: BlockRepository + ?Sized> BlockRepository for std::sync::Arc<T> {
    fn get_blocks(&self, hashes: &[Hash256]) -> Result<Vec<Block>, IndexError> {
        self.as_ref().get_blocks(hashes)
    }
}

impl<T: BlockRepository + ?Sized> BlockRepository for &T {
    fn get_blocks(&self, hashes: &[Hash256]) -> Result<Vec<Block>, IndexError> {
        (**self).get_blocks(hashes)
    }
}

pub fn block_blob_name(hash: &Hash256) -> String {
    format!("blocks/{}", hash256_to_hex(hash))
}

/// Reads pre-serialized block bodies from the blob cache.
pub struct StoreBlockRepository<B> {
    blobs: B,
}

impl<B> StoreBlockRepository<B> {
    pub fn new(blobs: B) -> Self {
        Self { blobs }
    }
}

impl<B: BlobStore> StoreBlockRepository<B> {
    pub fn put_block(&self, block: &Block) -> Result<(), IndexError> {
        let name = block_blob_name(&block.hash());
        self.blobs.put(&name, &block.consensus_encode(), None)?;
        Ok(())
    }
}

impl<B: BlobStore> BlockRepository for StoreBlockRepository<B> {
    fn get_blocks(&self, hashes: &[Hash256]) -> Result<Vec<Block>, IndexError> {
        let mut blocks = Vec::with_capacity(hashes.len());
        for hash in hashes {
            let body = self.blobs.get(&block_blob_name(hash))?.ok_or_else(|| {
                IndexError::TaskFailed(format!("block {} not cached", hash256_to_hex(hash)))
            })?;
            let block = Block::consensus_decode(&body)?;
            if block.hash() != *hash {
                return Err(IndexError::CorruptRow("cached block body hash mismatch"));
            }
            blocks.push(block);
        }
        Ok(blocks)
    }
}
