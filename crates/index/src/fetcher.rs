//! Bounded, single-use block stream over one height range.
//!
//! Hashes are resolved against the live chain right before each fetch, so a
//! reorg during a long range surfaces as `ChainAdvancedPast` instead of
//! silently indexing a stale branch.

use chaindex_chain::SharedHeaderChain;
use chaindex_primitives::{Block, Hash256};

use crate::repository::BlockRepository;
use crate::IndexError;

const FETCH_CHUNK: u32 = 16;

pub struct BlockFetcher<R> {
    repository: R,
    chain: SharedHeaderChain,
    cursor: u32,
    to_height: u32,
    buffer: std::vec::IntoIter<(u32, Block)>,
    done: bool,
}

impl<R> BlockFetcher<R> {
    pub fn new(repository: R, chain: SharedHeaderChain, from_height: u32, to_height: u32) -> Self {
        Self {
            repository,
            chain,
            cursor: from_height,
            to_height,
            buffer: Vec::new().into_iter(),
            done: from_height > to_height,
        }
    }
}

impl<R: BlockRepository> BlockFetcher<R> {
    fn refill(&mut self) -> Result<(), IndexError> {
        let last = self.to_height.min(self.cursor.saturating_add(FETCH_CHUNK - 1));
        let hashes: Vec<Hash256> = {
            let chain = self.chain.read();
            let mut hashes = Vec::with_capacity((last - self.cursor + 1) as usize);
            for height in self.cursor..=last {
                let entry = chain
                    .get_by_height(height)
                    .ok_or(IndexError::ChainAdvancedPast(height))?;
                hashes.push(entry.hash);
            }
            hashes
        };

        let blocks = self.repository.get_blocks(&hashes)?;
        if blocks.len() != hashes.len() {
            return Err(IndexError::TaskFailed(format!(
                "repository returned {} blocks for {} hashes",
                blocks.len(),
                hashes.len()
            )));
        }
        let mut buffered = Vec::with_capacity(blocks.len());
        for (offset, block) in blocks.into_iter().enumerate() {
            if block.hash() != hashes[offset] {
                return Err(IndexError::CorruptRow("fetched block out of order"));
            }
            buffered.push((self.cursor + offset as u32, block));
        }
        self.cursor = last + 1;
        self.done = last >= self.to_height;
        self.buffer = buffered.into_iter();
        Ok(())
    }
}

impl<R: BlockRepository> Iterator for BlockFetcher<R> {
    type Item = Result<(u32, Block), IndexError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(item) = self.buffer.next() {
            return Some(Ok(item));
        }
        if self.done {
            return None;
        }
        if let Err(err) = self.refill() {
            self.done = true;
            return Some(Err(err));
        }
        self.buffer.next().map(Ok)
    }
}
