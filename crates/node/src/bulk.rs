//! Bulk backfill: partition the chain into transaction-weighted windows, fan
//! the resulting ranges out over the work queue, drain the queue, and advance
//! the checkpoints to the tip.
//!
//! The lock blob is the only cross-process coordination point. Whoever holds
//! its lease enqueues; everyone else goes straight to consuming. The blob body
//! doubles as the completion signal: `Enqueuing` while the walk runs, the
//! hex-encoded tip locator once every range is on the queue.

use std::thread;
use std::time::Duration;

use chaindex_chain::locator::{locator_from_hex, locator_to_hex};
use chaindex_chain::SharedHeaderChain;
use chaindex_index::checkpoint::{CheckpointStore, CHECKPOINT_NAMES};
use chaindex_index::wallet_index::WalletRules;
use chaindex_index::{BlockFetcher, BlockRange, BlockRepository, IndexError, IndexTask};
use chaindex_storage::{BlobStore, KeyValueStore, Lease, MessageQueue, StoreError};

pub const LOCK_BLOB: &str = "initialindexer/lock";

const LOCK_BODY_ENQUEUING: &[u8] = b"Enqueuing";
const ENQUEUE_LEASE_SECS: u64 = 3600;
const RECEIVE_VISIBILITY_SECS: u64 = 300;
const EMPTY_POLL_DELAY_MS: u64 = 1000;

#[derive(Clone, Copy, Debug)]
pub struct BulkOptions {
    pub block_granularity: u32,
    pub transactions_per_work: u64,
}

impl Default for BulkOptions {
    fn default() -> Self {
        Self {
            block_granularity: 100,
            transactions_per_work: 2_000_000,
        }
    }
}

pub struct BulkIndexer<S, B, Q, R> {
    store: S,
    blobs: B,
    queue: Q,
    repository: R,
    chain: SharedHeaderChain,
    options: BulkOptions,
}

impl<S, B, Q, R> BulkIndexer<S, B, Q, R>
where
    S: KeyValueStore,
    B: BlobStore + Clone,
    Q: MessageQueue,
    R: BlockRepository,
{
    pub fn new(
        store: S,
        blobs: B,
        queue: Q,
        repository: R,
        chain: SharedHeaderChain,
        options: BulkOptions,
    ) -> Self {
        Self {
            store,
            blobs,
            queue,
            repository,
            chain,
            options,
        }
    }

    /// Runs one bulk pass and returns the number of messages this instance
    /// processed. Exactly one concurrent caller enqueues; the rest consume.
    pub fn run(&self) -> Result<usize, IndexError> {
        let lease = match self
            .blobs
            .lease(LOCK_BLOB, Duration::from_secs(ENQUEUE_LEASE_SECS))
        {
            Ok(lease) => {
                let sent = self.enqueue(&lease)?;
                log::info!("enqueued {sent} range messages");
                Some(lease)
            }
            Err(StoreError::LeaseHeldElsewhere) => {
                log::info!("enqueue lease held elsewhere, consuming only");
                None
            }
            Err(err) => return Err(err.into()),
        };

        let processed = self.dequeue()?;
        // Held for the whole bulk job; on failure the TTL reclaims it.
        if let Some(lease) = &lease {
            let _ = self.blobs.release(lease);
        }
        Ok(processed)
    }

    fn enqueue(&self, lease: &Lease) -> Result<usize, IndexError> {
        self.blobs.put(LOCK_BLOB, LOCK_BODY_ENQUEUING, Some(lease))?;

        let checkpoints = CheckpointStore::new(self.blobs.clone());
        let (tip, fork_heights) = {
            let chain = self.chain.read();
            let tip = chain.tip();
            let mut fork_heights = Vec::with_capacity(CHECKPOINT_NAMES.len());
            for name in CHECKPOINT_NAMES {
                fork_heights.push((name, checkpoints.fork_height(name, &chain)?));
            }
            (tip, fork_heights)
        };

        let mut sent = 0;
        if tip.height > 0 {
            let granularity = self.options.block_granularity.max(1);
            let mut window_start: u32 = 0;
            let mut cumul: u64 = 0;
            let mut sample: u32 = 0;
            while sample <= tip.height {
                let hash = self
                    .chain
                    .read()
                    .get_by_height(sample)
                    .ok_or(IndexError::ChainAdvancedPast(sample))?
                    .hash;
                let block = self
                    .repository
                    .get_blocks(&[hash])?
                    .into_iter()
                    .next()
                    .ok_or_else(|| {
                        IndexError::TaskFailed(format!("no block for sample height {sample}"))
                    })?;
                // Each sample stands in for the next `granularity` blocks; the
                // estimate is coarse on purpose.
                cumul += block.tx_count() as u64 * granularity as u64;

                if cumul > self.options.transactions_per_work {
                    let window_end = sample.saturating_add(granularity - 1).min(tip.height);
                    sent += self.send_window(&fork_heights, window_start, window_end)?;
                    window_start = window_end + 1;
                    cumul = 0;
                }
                match sample.checked_add(granularity) {
                    Some(next) => sample = next,
                    None => break,
                }
            }
            if window_start <= tip.height {
                sent += self.send_window(&fork_heights, window_start, tip.height)?;
            }
        }

        let locator = self.chain.read().tip_locator();
        self.blobs
            .put(LOCK_BLOB, locator_to_hex(&locator).as_bytes(), Some(lease))?;
        Ok(sent)
    }

    fn send_window(
        &self,
        fork_heights: &[(&'static str, u32)],
        from: u32,
        last: u32,
    ) -> Result<usize, IndexError> {
        let count = last - from + 1;
        let mut sent = 0;
        for (name, fork_height) in fork_heights {
            if *fork_height > last {
                log::debug!("{name} already past {from}..={last}, not enqueuing");
                continue;
            }
            self.queue
                .send(&BlockRange::new(name, from, count).to_bytes())?;
            sent += 1;
        }
        Ok(sent)
    }

    fn dequeue(&self) -> Result<usize, IndexError> {
        let checkpoints = CheckpointStore::new(self.blobs.clone());
        let mut processed = 0;
        loop {
            match self
                .queue
                .receive(Duration::from_secs(RECEIVE_VISIBILITY_SECS))?
            {
                Some(message) => {
                    let Some(range) = BlockRange::from_bytes(&message.payload) else {
                        return Err(
                            StoreError::QueueFatal("undecodable work message".to_string()).into()
                        );
                    };
                    match self.process_range(&checkpoints, &range) {
                        Ok(()) => {
                            self.queue.complete(&message)?;
                            processed += 1;
                        }
                        Err(IndexError::ChainAdvancedPast(height)) => {
                            log::warn!(
                                "abandoning {} range {}..={}: chain no longer reaches height {height}",
                                range.target,
                                range.from,
                                range.last_height()
                            );
                            self.queue.complete(&message)?;
                            processed += 1;
                        }
                        Err(err) => return Err(err),
                    }
                }
                None => {
                    if let Some(locator) = self.enqueue_result()? {
                        let chain = self.chain.read();
                        for name in CHECKPOINT_NAMES {
                            checkpoints.save_progress(name, &locator, &chain, None)?;
                        }
                        return Ok(processed);
                    }
                    thread::sleep(Duration::from_millis(EMPTY_POLL_DELAY_MS));
                }
            }
        }
    }

    /// The tip locator once enqueueing has finished, `None` while it is still
    /// running (or has not started).
    fn enqueue_result(&self) -> Result<Option<Vec<chaindex_primitives::Hash256>>, IndexError> {
        let Some(body) = self.blobs.get(LOCK_BLOB)? else {
            return Ok(None);
        };
        if body == LOCK_BODY_ENQUEUING {
            return Ok(None);
        }
        let text = match String::from_utf8(body) {
            Ok(text) => text,
            Err(_) => return Ok(None),
        };
        Ok(locator_from_hex(&text))
    }

    fn process_range(
        &self,
        checkpoints: &CheckpointStore<B>,
        range: &BlockRange,
    ) -> Result<(), IndexError> {
        let rules = WalletRules::new(&self.store).snapshot()?;
        let task = IndexTask::for_target(&range.target, rules)
            .ok_or_else(|| IndexError::TaskFailed(format!("unknown index target {}", range.target)))?
            .with_save_progress(false);

        let to_height = range.last_height();
        let fetcher =
            BlockFetcher::new(&self.repository, self.chain.clone(), range.from, to_height);
        let stats = task.index(&self.store, fetcher)?;
        log::info!(
            "{}: indexed {} blocks ({} rows) for {}..={}",
            range.target,
            stats.blocks,
            stats.rows,
            range.from,
            to_height
        );

        // Completion moves this index's frontier; the advance-only rule makes
        // late redeliveries a no-op.
        let chain = self.chain.read();
        let entry = chain
            .get_by_height(to_height)
            .ok_or(IndexError::ChainAdvancedPast(to_height))?;
        let locator = chain.locator_of(&entry.hash)?;
        checkpoints.save_progress(task.checkpoint_name(), &locator, &chain, None)?;
        Ok(())
    }
}
