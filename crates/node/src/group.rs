//! The connected-peers group. Peer sessions register an outbound command
//! handle here; the broadcaster fans `inv` announcements across every
//! registered session.

use std::net::SocketAddr;
use std::sync::Mutex;

use chaindex_primitives::Hash256;
use tokio::sync::mpsc;

#[derive(Clone, Debug)]
pub enum PeerCommand {
    GetHeaders(Vec<Hash256>),
    GetDataTxs(Vec<Hash256>),
    GetDataBlocks(Vec<Hash256>),
    SendInvTx(Hash256),
    SendTx(Vec<u8>),
    Pong(Vec<u8>),
}

#[derive(Clone, Debug)]
pub struct PeerHandle {
    pub addr: SocketAddr,
    pub commands: mpsc::UnboundedSender<PeerCommand>,
}

#[derive(Default)]
pub struct NodesGroup {
    peers: Mutex<Vec<PeerHandle>>,
}

impl NodesGroup {
    pub fn register(&self, handle: PeerHandle) {
        if let Ok(mut peers) = self.peers.lock() {
            peers.retain(|peer| peer.addr != handle.addr);
            peers.push(handle);
        }
    }

    pub fn remove(&self, addr: SocketAddr) {
        if let Ok(mut peers) = self.peers.lock() {
            peers.retain(|peer| peer.addr != addr);
        }
    }

    pub fn count(&self) -> usize {
        self.peers.lock().map(|peers| peers.len()).unwrap_or(0)
    }

    /// Announces a transaction to every connected peer. Sessions whose
    /// channel is gone are dropped from the group.
    pub fn broadcast_inv(&self, txid: Hash256) -> usize {
        let Ok(mut peers) = self.peers.lock() else {
            return 0;
        };
        peers.retain(|peer| peer.commands.send(PeerCommand::SendInvTx(txid)).is_ok());
        peers.len()
    }

    /// Asks every connected peer for the given block bodies.
    pub fn broadcast_getdata_blocks(&self, hashes: &[Hash256]) -> usize {
        let Ok(mut peers) = self.peers.lock() else {
            return 0;
        };
        peers.retain(|peer| {
            peer.commands
                .send(PeerCommand::GetDataBlocks(hashes.to_vec()))
                .is_ok()
        });
        peers.len()
    }
}
