//! Operator-visible counters for both ingest paths.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

#[derive(Debug)]
pub struct Stats {
    started: Instant,
    pub messages_processed: AtomicU64,
    pub blocks_indexed: AtomicU64,
    pub transactions_indexed: AtomicU64,
    pub broadcasts_sent: AtomicU64,
    pub mempool_arrivals: AtomicU64,
    pub rejects_recorded: AtomicU64,
    pub headers_connected: AtomicU64,
    pub reorgs: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            messages_processed: AtomicU64::new(0),
            blocks_indexed: AtomicU64::new(0),
            transactions_indexed: AtomicU64::new(0),
            broadcasts_sent: AtomicU64::new(0),
            mempool_arrivals: AtomicU64::new(0),
            rejects_recorded: AtomicU64::new(0),
            headers_connected: AtomicU64::new(0),
            reorgs: AtomicU64::new(0),
        }
    }

    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    pub fn snapshot(&self, tip_height: u32) -> StatsSnapshot {
        StatsSnapshot {
            uptime_secs: self.started.elapsed().as_secs(),
            tip_height,
            messages_processed: self.messages_processed.load(Ordering::Relaxed),
            blocks_indexed: self.blocks_indexed.load(Ordering::Relaxed),
            transactions_indexed: self.transactions_indexed.load(Ordering::Relaxed),
            broadcasts_sent: self.broadcasts_sent.load(Ordering::Relaxed),
            mempool_arrivals: self.mempool_arrivals.load(Ordering::Relaxed),
            rejects_recorded: self.rejects_recorded.load(Ordering::Relaxed),
            headers_connected: self.headers_connected.load(Ordering::Relaxed),
            reorgs: self.reorgs.load(Ordering::Relaxed),
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct StatsSnapshot {
    pub uptime_secs: u64,
    pub tip_height: u32,
    pub messages_processed: u64,
    pub blocks_indexed: u64,
    pub transactions_indexed: u64,
    pub broadcasts_sent: u64,
    pub mempool_arrivals: u64,
    pub rejects_recorded: u64,
    pub headers_connected: u64,
    pub reorgs: u64,
}

impl StatsSnapshot {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
