//! Per-block records: one row per block hash.

use chaindex_primitives::block::HEADER_SIZE;
use chaindex_primitives::{Block, BlockHeader, Hash256};
use chaindex_storage::{Column, KeyValueStore, WriteBatch};

use crate::IndexError;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockRow {
    pub height: u32,
    pub header: BlockHeader,
    pub tx_count: u32,
}

pub fn block_row_value(height: u32, block: &Block) -> Vec<u8> {
    let mut value = Vec::with_capacity(4 + HEADER_SIZE + 4);
    value.extend_from_slice(&height.to_le_bytes());
    value.extend_from_slice(&block.header.consensus_encode());
    value.extend_from_slice(&(block.tx_count() as u32).to_le_bytes());
    value
}

pub fn write_block(batch: &mut WriteBatch, height: u32, block: &Block) {
    batch.put(Column::Blocks, block.hash(), block_row_value(height, block));
}

pub struct BlockIndex<S> {
    store: S,
}

impl<S> BlockIndex<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: KeyValueStore> BlockIndex<S> {
    pub fn get(&self, hash: &Hash256) -> Result<Option<BlockRow>, IndexError> {
        let Some(value) = self.store.get(Column::Blocks, hash)? else {
            return Ok(None);
        };
        if value.len() != 4 + HEADER_SIZE + 4 {
            return Err(IndexError::CorruptRow("block row has wrong length"));
        }
        let height = u32::from_le_bytes(value[0..4].try_into().unwrap_or_default());
        let header = BlockHeader::consensus_decode(&value[4..4 + HEADER_SIZE])?;
        let tx_count =
            u32::from_le_bytes(value[4 + HEADER_SIZE..].try_into().unwrap_or_default());
        Ok(Some(BlockRow {
            height,
            header,
            tx_count,
        }))
    }

    pub fn contains(&self, hash: &Hash256) -> Result<bool, IndexError> {
        Ok(self.store.get(Column::Blocks, hash)?.is_some())
    }
}
