//! Live ingest: a p2p participant that keeps the header chain current,
//! indexes inbound blocks and loose transactions, and serves the broadcast
//! handshake.
//!
//! Handlers never block the receive loop. Header-chain mutation and chain
//! indexing go through one ordered job channel consumed by a single worker;
//! per-transaction indexing runs on the blocking pool.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chaindex_chain::{ChainError, ChainParams, ConnectOutcome, HeaderEntry, SharedHeaderChain};
use chaindex_index::blockindex::BlockIndex;
use chaindex_index::checkpoint::CheckpointStore;
use chaindex_index::rejects::{RejectTable, REJECT_DUPLICATE};
use chaindex_index::repository::block_blob_name;
use chaindex_index::txindex::tx_row_value;
use chaindex_index::wallet_index::WalletRules;
use chaindex_index::{IndexError, IndexTask};
use chaindex_primitives::hash::hash256_to_hex;
use chaindex_primitives::{Block, BlockHeader, Hash256, Transaction};
use chaindex_storage::{BlobStore, Column, KeyValueStore, WriteBatch};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;

use crate::broadcast::BroadcastTable;
use crate::events::EventBus;
use crate::group::{NodesGroup, PeerCommand, PeerHandle};
use crate::p2p::{self, InventoryVector, Peer, PeerState, RejectMessage, MSG_BLOCK, MSG_TX};
use crate::stats::Stats;

const KNOWN_INV_CAP: usize = 1000;
const RECONNECT_DELAY_SECS: u64 = 3;

/// Height recorded for transactions seen only in a mempool.
pub const MEMPOOL_HEIGHT: u32 = u32::MAX;

pub enum ChainJob {
    ConnectHeaders {
        headers: Vec<BlockHeader>,
        ack: Option<oneshot::Sender<Result<ConnectOutcome, String>>>,
    },
    IndexBlock(Block),
}

/// What became of an inbound block.
#[derive(Debug)]
pub enum BlockOutcome {
    /// Header did not attach; a later inv round re-delivers it.
    Dropped,
    /// Connected on a side branch; body cached, nothing indexed until the
    /// branch wins.
    Parked(HeaderEntry),
    /// Indexed on the active chain. `missing` lists activated blocks whose
    /// bodies were not in the cache and must be re-fetched.
    Indexed {
        entry: HeaderEntry,
        missing: Vec<Hash256>,
    },
}

/// Message handling detached from any socket, so every inbound case is
/// exercisable without a peer.
pub struct ListenerCore<S, B> {
    store: S,
    chain: SharedHeaderChain,
    blobs: B,
    checkpoints: CheckpointStore<B>,
    events: EventBus,
    broadcasting: Arc<BroadcastTable>,
    known_invs: Mutex<HashSet<Hash256>>,
    stats: Arc<Stats>,
    last_error: Mutex<Option<String>>,
}

impl<S, B> ListenerCore<S, B>
where
    S: KeyValueStore,
    B: BlobStore,
{
    pub fn new(
        store: S,
        chain: SharedHeaderChain,
        blobs: B,
        events: EventBus,
        broadcasting: Arc<BroadcastTable>,
        stats: Arc<Stats>,
    ) -> Self
    where
        B: Clone,
    {
        Self {
            store,
            chain,
            checkpoints: CheckpointStore::new(blobs.clone()),
            blobs,
            events,
            broadcasting,
            known_invs: Mutex::new(HashSet::new()),
            stats,
            last_error: Mutex::new(None),
        }
    }

    pub fn chain(&self) -> &SharedHeaderChain {
        &self.chain
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn broadcasting(&self) -> &BroadcastTable {
        &self.broadcasting
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    pub fn set_last_error(&self, error: &str) {
        if let Ok(mut last) = self.last_error.lock() {
            *last = Some(error.to_string());
        }
    }

    pub fn take_last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|mut last| last.take())
    }

    /// Inventory announcements. Broadcast echoes count as mempool arrival and
    /// evict; everything else unseen gets requested once.
    pub fn process_inv(&self, vectors: &[InventoryVector]) -> Vec<PeerCommand> {
        let mut want_txs = Vec::new();
        let mut want_blocks = Vec::new();
        for vector in vectors {
            if vector.inv_type == MSG_TX && self.broadcasting.remove(&vector.hash).is_some() {
                Stats::bump(&self.stats.mempool_arrivals);
                log::info!("{} arrived in mempool", hash256_to_hex(&vector.hash));
                continue;
            }
            if !self.touch_known_inv(vector.hash) {
                continue;
            }
            match vector.inv_type {
                MSG_TX => want_txs.push(vector.hash),
                MSG_BLOCK => want_blocks.push(vector.hash),
                _ => {}
            }
        }
        let mut commands = Vec::new();
        if !want_txs.is_empty() {
            commands.push(PeerCommand::GetDataTxs(want_txs));
        }
        if !want_blocks.is_empty() {
            commands.push(PeerCommand::GetDataBlocks(want_blocks));
        }
        commands
    }

    /// A loose transaction: indexed under the mempool sentinel height and
    /// published on the new-transaction topic.
    pub fn process_transaction(&self, raw: &[u8]) -> Result<Hash256, IndexError> {
        let transaction = Transaction::consensus_decode(raw)?;
        let txid = transaction.txid();
        let mut batch = WriteBatch::new();
        batch.put(
            Column::Transactions,
            txid,
            tx_row_value(&[0u8; 32], MEMPOOL_HEIGHT, 0, raw),
        );
        self.store.write_batch(&batch)?;
        Stats::bump(&self.stats.transactions_indexed);
        self.events.publish_new_transaction(txid);
        Ok(txid)
    }

    /// A full block. The header is connected (the chain may reorg) and the
    /// body goes to the block cache; only blocks on the active chain are
    /// indexed. A reorg re-indexes the suffix the chain just activated, using
    /// parked bodies from the cache and reporting the rest for re-fetch.
    pub fn process_block(&self, block: Block) -> Result<BlockOutcome, IndexError> {
        let hash = block.hash();
        self.cache_block_body(&block)?;

        let mut outcome = ConnectOutcome::default();
        {
            let mut chain = self.chain.write();
            if !chain.contains(&hash) {
                match chain.connect(std::slice::from_ref(&block.header)) {
                    Ok(connected) => {
                        Stats::add(&self.stats.headers_connected, connected.accepted as u64);
                        if connected.reorged {
                            Stats::bump(&self.stats.reorgs);
                        }
                        outcome = connected;
                    }
                    Err(ChainError::OrphanHeader(prev)) => {
                        log::info!(
                            "dropping block {}: parent {} not in chain",
                            hash256_to_hex(&hash),
                            hash256_to_hex(&prev)
                        );
                        return Ok(BlockOutcome::Dropped);
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        }
        let entry = self
            .chain
            .read()
            .get_by_hash(&hash)
            .ok_or(IndexError::Chain(ChainError::UnknownHash(hash)))?;

        if !self.chain.read().is_active(&hash) {
            log::info!(
                "parking side-branch block {} at height {}",
                hash256_to_hex(&hash),
                entry.height
            );
            return Ok(BlockOutcome::Parked(entry));
        }

        let missing = if outcome.reorged {
            // The new branch replaced previously-indexed heights; rebuild
            // everything above the fork, this block included.
            let (reindexed, missing) = self.reindex_activated(outcome.fork_height)?;
            log::info!(
                "reorg at height {}: re-indexed {reindexed} activated block(s)",
                outcome.fork_height
            );
            missing
        } else {
            self.index_active_block(entry.height, &block)?;
            Vec::new()
        };
        Ok(BlockOutcome::Indexed { entry, missing })
    }

    /// Indexes every active block above `fork_height` that is not in the
    /// block index yet, in height order, from cached bodies. Returns how many
    /// were indexed and the hashes whose bodies the cache does not have.
    pub fn reindex_activated(
        &self,
        fork_height: u32,
    ) -> Result<(usize, Vec<Hash256>), IndexError> {
        let block_index = BlockIndex::new(&self.store);
        let mut reindexed = 0;
        let mut missing = Vec::new();
        let mut height = fork_height;
        loop {
            height += 1;
            let Some(entry) = self.chain.read().get_by_height(height) else {
                break;
            };
            if block_index.contains(&entry.hash)? {
                continue;
            }
            match self.cached_block_body(&entry.hash)? {
                Some(block) => {
                    self.index_active_block(height, &block)?;
                    reindexed += 1;
                }
                None => missing.push(entry.hash),
            }
        }
        Ok((reindexed, missing))
    }

    /// All four indexes over one active block, live checkpoint advancement,
    /// and the new-block event.
    fn index_active_block(&self, height: u32, block: &Block) -> Result<(), IndexError> {
        let hash = block.hash();
        let rules = WalletRules::new(&self.store).snapshot()?;
        let tasks = vec![
            IndexTask::blocks(),
            IndexTask::transactions(),
            IndexTask::balances(),
            IndexTask::wallets(rules),
        ];
        for task in tasks {
            task.index_single(&self.store, height, block)?;
            if task.save_progress_enabled() {
                let chain = self.chain.read();
                if chain.is_active(&hash) {
                    let locator = chain.locator_of(&hash)?;
                    self.checkpoints
                        .save_progress(task.checkpoint_name(), &locator, &chain, None)?;
                }
            }
        }

        Stats::bump(&self.stats.blocks_indexed);
        self.events.publish_new_block(hash);
        Ok(())
    }

    fn cache_block_body(&self, block: &Block) -> Result<(), IndexError> {
        self.blobs.put(
            &block_blob_name(&block.hash()),
            &block.consensus_encode(),
            None,
        )?;
        Ok(())
    }

    fn cached_block_body(&self, hash: &Hash256) -> Result<Option<Block>, IndexError> {
        let Some(body) = self.blobs.get(&block_blob_name(hash))? else {
            return Ok(None);
        };
        Ok(Some(Block::consensus_decode(&body)?))
    }

    /// `getdata` for a transaction we are broadcasting: hand the body over and
    /// stop tracking it.
    pub fn process_getdata(&self, vectors: &[InventoryVector]) -> Vec<PeerCommand> {
        let mut commands = Vec::new();
        for vector in vectors {
            if vector.inv_type != MSG_TX {
                continue;
            }
            if let Some(raw) = self.broadcasting.remove(&vector.hash) {
                log::info!("serving broadcast tx {}", hash256_to_hex(&vector.hash));
                commands.push(PeerCommand::SendTx(raw));
            }
        }
        commands
    }

    /// Peer rejection: always evicts from the broadcasting table; any code
    /// but DUPLICATE is persisted and ends future broadcasts of that tx.
    pub fn process_reject(&self, reject: &RejectMessage) -> Result<(), IndexError> {
        let Some(txid) = reject.hash else {
            log::warn!(
                "peer reject ({}): code {:#04x} {}",
                reject.message,
                reject.code,
                reject.reason
            );
            return Ok(());
        };
        log::warn!(
            "peer rejected {}: code {:#04x} {}",
            hash256_to_hex(&txid),
            reject.code,
            reject.reason
        );
        self.broadcasting.remove(&txid);
        if reject.code != REJECT_DUPLICATE {
            RejectTable::new(&self.store).record(&txid, reject.code, &reject.reason)?;
            Stats::bump(&self.stats.rejects_recorded);
        }
        Ok(())
    }

    pub fn connect_headers(&self, headers: &[BlockHeader]) -> Result<ConnectOutcome, IndexError> {
        let outcome = self.chain.write().connect(headers)?;
        Stats::add(&self.stats.headers_connected, outcome.accepted as u64);
        if outcome.reorged {
            Stats::bump(&self.stats.reorgs);
        }
        Ok(outcome)
    }

    fn touch_known_inv(&self, hash: Hash256) -> bool {
        let Ok(mut known) = self.known_invs.lock() else {
            return false;
        };
        if known.len() >= KNOWN_INV_CAP {
            known.clear();
        }
        known.insert(hash)
    }
}

pub struct LiveListener<S, B> {
    core: Arc<ListenerCore<S, B>>,
    shutdown: watch::Sender<bool>,
    tasks: JoinSet<Result<(), String>>,
    chain_jobs: mpsc::UnboundedSender<ChainJob>,
}

impl<S, B> LiveListener<S, B>
where
    S: KeyValueStore + 'static,
    B: BlobStore + 'static,
{
    pub fn start(
        core: Arc<ListenerCore<S, B>>,
        group: Arc<NodesGroup>,
        params: &ChainParams,
        endpoints: &[SocketAddr],
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        let (chain_jobs, job_rx) = mpsc::unbounded_channel();
        let mut tasks = JoinSet::new();

        tasks.spawn(chain_worker(Arc::clone(&core), Arc::clone(&group), job_rx));
        for addr in endpoints {
            tasks.spawn(peer_supervisor(
                Arc::clone(&core),
                Arc::clone(&group),
                params.magic,
                *addr,
                chain_jobs.clone(),
                shutdown.subscribe(),
            ));
        }

        Self {
            core,
            shutdown,
            tasks,
            chain_jobs,
        }
    }

    /// Stops every task it spawned, joins them, and resolves with the first
    /// error observed while running.
    pub async fn shutdown(mut self) -> Result<(), String> {
        let _ = self.shutdown.send(true);
        drop(self.chain_jobs);

        let mut first_error = None;
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    first_error.get_or_insert(err);
                }
                Err(err) => {
                    first_error.get_or_insert(err.to_string());
                }
            }
        }
        if first_error.is_none() {
            first_error = self.core.take_last_error();
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

async fn chain_worker<S, B>(
    core: Arc<ListenerCore<S, B>>,
    group: Arc<NodesGroup>,
    mut jobs: mpsc::UnboundedReceiver<ChainJob>,
) -> Result<(), String>
where
    S: KeyValueStore + 'static,
    B: BlobStore + 'static,
{
    while let Some(job) = jobs.recv().await {
        match job {
            ChainJob::ConnectHeaders { headers, ack } => {
                let result = core
                    .connect_headers(&headers)
                    .map_err(|err| err.to_string());
                if let Ok(outcome) = &result {
                    if outcome.reorged {
                        reindex_after_reorg(&core, &group, outcome.fork_height);
                    }
                }
                match ack {
                    Some(ack) => {
                        let _ = ack.send(result);
                    }
                    None => {
                        if let Err(err) = result {
                            log::warn!("header connect failed: {err}");
                            core.set_last_error(&err);
                        }
                    }
                }
            }
            ChainJob::IndexBlock(block) => match core.process_block(block) {
                Ok(BlockOutcome::Indexed { entry, missing }) => {
                    log::info!(
                        "indexed block {} at height {}",
                        hash256_to_hex(&entry.hash),
                        entry.height
                    );
                    request_missing_bodies(&group, missing);
                }
                Ok(BlockOutcome::Parked(entry)) => {
                    log::info!("side-branch block parked at height {}", entry.height);
                }
                Ok(BlockOutcome::Dropped) => {}
                Err(err) => {
                    let err = err.to_string();
                    log::warn!("block indexing failed: {err}");
                    core.set_last_error(&err);
                }
            },
        }
    }
    Ok(())
}

fn reindex_after_reorg<S, B>(core: &Arc<ListenerCore<S, B>>, group: &Arc<NodesGroup>, fork: u32)
where
    S: KeyValueStore + 'static,
    B: BlobStore + 'static,
{
    match core.reindex_activated(fork) {
        Ok((reindexed, missing)) => {
            log::info!("reorg at height {fork}: re-indexed {reindexed} activated block(s)");
            request_missing_bodies(group, missing);
        }
        Err(err) => {
            let err = err.to_string();
            log::warn!("re-indexing after reorg failed: {err}");
            core.set_last_error(&err);
        }
    }
}

fn request_missing_bodies(group: &Arc<NodesGroup>, missing: Vec<Hash256>) {
    if missing.is_empty() {
        return;
    }
    log::info!("requesting {} activated block body(ies)", missing.len());
    group.broadcast_getdata_blocks(&missing);
}

async fn peer_supervisor<S, B>(
    core: Arc<ListenerCore<S, B>>,
    group: Arc<NodesGroup>,
    magic: [u8; 4],
    addr: SocketAddr,
    chain_jobs: mpsc::UnboundedSender<ChainJob>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), String>
where
    S: KeyValueStore + 'static,
    B: BlobStore + 'static,
{
    loop {
        if *shutdown.borrow() {
            return Ok(());
        }
        match peer_session(&core, &group, magic, addr, &chain_jobs, &mut shutdown).await {
            Ok(()) => return Ok(()),
            Err(err) => {
                log::warn!("peer {addr} session ended: {err}");
                core.set_last_error(&err);
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(RECONNECT_DELAY_SECS)) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }
}

async fn peer_session<S, B>(
    core: &Arc<ListenerCore<S, B>>,
    group: &Arc<NodesGroup>,
    magic: [u8; 4],
    addr: SocketAddr,
    chain_jobs: &mpsc::UnboundedSender<ChainJob>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), String>
where
    S: KeyValueStore + 'static,
    B: BlobStore + 'static,
{
    let mut peer = Peer::connect(addr, magic).await?;
    let start_height = core.chain().read().height() as i32;
    peer.handshake(start_height).await?;
    sync_headers(&mut peer, core, chain_jobs).await?;
    peer.set_state(PeerState::HeadersSynced);

    let (command_tx, mut command_rx) = mpsc::unbounded_channel();
    group.register(PeerHandle {
        addr,
        commands: command_tx,
    });
    peer.set_state(PeerState::Streaming);

    let result = stream(&mut peer, core, chain_jobs, &mut command_rx, shutdown).await;
    group.remove(addr);
    peer.set_state(PeerState::Disconnected);
    result
}

async fn sync_headers<S, B>(
    peer: &mut Peer,
    core: &Arc<ListenerCore<S, B>>,
    chain_jobs: &mpsc::UnboundedSender<ChainJob>,
) -> Result<(), String>
where
    S: KeyValueStore + 'static,
    B: BlobStore + 'static,
{
    loop {
        let locator = core.chain().read().tip_locator();
        peer.send_getheaders(&locator).await?;
        let headers = loop {
            let (command, payload) = peer.read_message().await?;
            match command.as_str() {
                "headers" => break p2p::parse_headers(&payload)?,
                "ping" => peer.send_message("pong", &payload).await?,
                _ => {}
            }
        };
        if headers.is_empty() {
            return Ok(());
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        chain_jobs
            .send(ChainJob::ConnectHeaders {
                headers,
                ack: Some(ack_tx),
            })
            .map_err(|_| "chain worker gone".to_string())?;
        let outcome = ack_rx
            .await
            .map_err(|_| "chain worker dropped ack".to_string())??;
        log::info!(
            "connected {} headers, tip at height {}",
            outcome.accepted,
            core.chain().read().height()
        );
    }
}

async fn stream<S, B>(
    peer: &mut Peer,
    core: &Arc<ListenerCore<S, B>>,
    chain_jobs: &mpsc::UnboundedSender<ChainJob>,
    command_rx: &mut mpsc::UnboundedReceiver<PeerCommand>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), String>
where
    S: KeyValueStore + 'static,
    B: BlobStore + 'static,
{
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(());
                }
            }
            command = command_rx.recv() => {
                match command {
                    Some(command) => apply_command(peer, command).await?,
                    None => return Ok(()),
                }
            }
            message = peer.read_message() => {
                let (command, payload) = message?;
                dispatch(peer, core, chain_jobs, &command, &payload).await?;
            }
        }
    }
}

async fn dispatch<S, B>(
    peer: &mut Peer,
    core: &Arc<ListenerCore<S, B>>,
    chain_jobs: &mpsc::UnboundedSender<ChainJob>,
    command: &str,
    payload: &[u8],
) -> Result<(), String>
where
    S: KeyValueStore + 'static,
    B: BlobStore + 'static,
{
    Stats::bump(&core.stats().messages_processed);
    match command {
        "inv" => {
            let vectors = p2p::parse_inv(payload)?;
            for command in core.process_inv(&vectors) {
                apply_command(peer, command).await?;
            }
        }
        "tx" => {
            let core = Arc::clone(core);
            let raw = payload.to_vec();
            tokio::task::spawn_blocking(move || {
                if let Err(err) = core.process_transaction(&raw) {
                    let err = err.to_string();
                    log::warn!("transaction indexing failed: {err}");
                    core.set_last_error(&err);
                }
            });
        }
        "block" => match Block::consensus_decode(payload) {
            Ok(block) => {
                // Re-anchor the header chain and index in parallel; the block
                // is dropped by the worker if its header never attaches.
                let locator = core.chain().read().tip_locator();
                peer.send_getheaders(&locator).await?;
                let _ = chain_jobs.send(ChainJob::IndexBlock(block));
            }
            Err(err) => log::warn!("undecodable block payload: {err}"),
        },
        "headers" => {
            let headers = p2p::parse_headers(payload)?;
            if !headers.is_empty() {
                let _ = chain_jobs.send(ChainJob::ConnectHeaders { headers, ack: None });
            }
        }
        "getdata" => {
            let vectors = p2p::parse_inv(payload)?;
            for command in core.process_getdata(&vectors) {
                apply_command(peer, command).await?;
            }
        }
        "reject" => match p2p::parse_reject(payload) {
            Ok(reject) => {
                if let Err(err) = core.process_reject(&reject) {
                    let err = err.to_string();
                    log::warn!("reject handling failed: {err}");
                    core.set_last_error(&err);
                }
            }
            Err(err) => log::warn!("undecodable reject payload: {err}"),
        },
        "ping" => peer.send_message("pong", payload).await?,
        _ => {}
    }
    Ok(())
}

async fn apply_command(peer: &mut Peer, command: PeerCommand) -> Result<(), String> {
    match command {
        PeerCommand::GetHeaders(locator) => peer.send_getheaders(&locator).await,
        PeerCommand::GetDataTxs(hashes) => peer.send_getdata_txs(&hashes).await,
        PeerCommand::GetDataBlocks(hashes) => peer.send_getdata_blocks(&hashes).await,
        PeerCommand::SendInvTx(txid) => peer.send_inv_tx(&[txid]).await,
        PeerCommand::SendTx(raw) => peer.send_tx(&raw).await,
        PeerCommand::Pong(payload) => peer.send_message("pong", &payload).await,
    }
}
