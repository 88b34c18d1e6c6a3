//! Node-backed block repository: `getdata` batches over a connected peer,
//! bridged to the synchronous fetch path, with read-through caching of block
//! bodies in the blob store.

use std::collections::{HashMap, HashSet};

use chaindex_index::repository::{block_blob_name, BlockRepository};
use chaindex_index::IndexError;
use chaindex_primitives::{Block, Hash256};
use chaindex_storage::BlobStore;
use tokio::sync::{mpsc, oneshot};

use crate::p2p::Peer;

const FETCH_QUEUE: usize = 4;

pub struct FetchRequest {
    hashes: Vec<Hash256>,
    reply: oneshot::Sender<Result<Vec<Block>, String>>,
}

#[derive(Clone)]
pub struct PeerBlockRepository {
    requests: mpsc::Sender<FetchRequest>,
}

impl PeerBlockRepository {
    pub fn new() -> (Self, mpsc::Receiver<FetchRequest>) {
        let (requests, receiver) = mpsc::channel(FETCH_QUEUE);
        (Self { requests }, receiver)
    }
}

impl BlockRepository for PeerBlockRepository {
    fn get_blocks(&self, hashes: &[Hash256]) -> Result<Vec<Block>, IndexError> {
        let (reply, receiver) = oneshot::channel();
        self.requests
            .blocking_send(FetchRequest {
                hashes: hashes.to_vec(),
                reply,
            })
            .map_err(|_| IndexError::TaskFailed("block fetch service gone".to_string()))?;
        receiver
            .blocking_recv()
            .map_err(|_| IndexError::TaskFailed("block fetch service dropped reply".to_string()))?
            .map_err(IndexError::TaskFailed)
    }
}

/// Services fetch requests over one connected peer. Cached bodies are served
/// locally; everything fetched goes through to the blob cache. Ends with the
/// peer: a failed fetch is reported to the requester and to the caller, who
/// owns reconnecting.
pub async fn serve_block_fetches<B: BlobStore>(
    mut peer: Peer,
    blobs: B,
    mut requests: mpsc::Receiver<FetchRequest>,
) -> Result<(), String> {
    while let Some(request) = requests.recv().await {
        let result = fetch_blocks(&mut peer, &blobs, &request.hashes).await;
        let error = result.as_ref().err().cloned();
        let _ = request.reply.send(result);
        if let Some(error) = error {
            return Err(error);
        }
    }
    Ok(())
}

async fn fetch_blocks<B: BlobStore>(
    peer: &mut Peer,
    blobs: &B,
    hashes: &[Hash256],
) -> Result<Vec<Block>, String> {
    let mut found: HashMap<Hash256, Block> = HashMap::new();
    let mut missing = Vec::new();
    for hash in hashes {
        match blobs
            .get(&block_blob_name(hash))
            .map_err(|err| err.to_string())?
        {
            Some(body) => {
                let block = Block::consensus_decode(&body).map_err(|err| err.to_string())?;
                found.insert(*hash, block);
            }
            None => missing.push(*hash),
        }
    }

    if !missing.is_empty() {
        peer.send_getdata_blocks(&missing).await?;
        let want: HashSet<Hash256> = missing.iter().copied().collect();
        let mut remaining = want.len();
        while remaining > 0 {
            let (command, payload) = peer.read_message().await?;
            match command.as_str() {
                "block" => {
                    let block = Block::consensus_decode(&payload).map_err(|err| err.to_string())?;
                    let hash = block.hash();
                    if want.contains(&hash) && !found.contains_key(&hash) {
                        blobs
                            .put(&block_blob_name(&hash), &payload, None)
                            .map_err(|err| err.to_string())?;
                        found.insert(hash, block);
                        remaining -= 1;
                    }
                }
                "notfound" => return Err("peer does not have a requested block".to_string()),
                "ping" => peer.send_message("pong", &payload).await?,
                _ => {}
            }
        }
    }

    // Responses are stitched back into request order.
    hashes
        .iter()
        .map(|hash| {
            found
                .remove(hash)
                .ok_or_else(|| "block missing from response".to_string())
        })
        .collect()
}
