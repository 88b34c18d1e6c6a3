mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chaindex_index::txindex::tx_row_value;
use chaindex_node::broadcast::{
    self, next_broadcast_delay, BroadcastEntry, BroadcastTable, Broadcaster, BROADCAST_TABLE_CAP,
};
use chaindex_node::group::NodesGroup;
use chaindex_storage::{Column, KeyValueStore, MessageQueue};

use common::{coinbase, harness, NodeHarness};

fn broadcaster(harness: &NodeHarness) -> Broadcaster<common::Store, common::Queue> {
    Broadcaster::new(
        Arc::clone(&harness.store),
        harness.chain.clone(),
        Arc::clone(&harness.broadcast_queue),
        Arc::new(NodesGroup::default()),
        Arc::new(BroadcastTable::default()),
        Arc::clone(&harness.stats),
    )
}

#[test]
fn retry_ladder_matches_schedule() {
    assert_eq!(next_broadcast_delay(0), None);
    assert_eq!(next_broadcast_delay(1), Some(Duration::from_secs(5 * 60)));
    assert_eq!(next_broadcast_delay(2), Some(Duration::from_secs(10 * 60)));
    assert_eq!(next_broadcast_delay(3), Some(Duration::from_secs(60 * 60)));
    assert_eq!(next_broadcast_delay(4), Some(Duration::from_secs(6 * 60 * 60)));
    assert_eq!(next_broadcast_delay(5), Some(Duration::from_secs(24 * 60 * 60)));
    assert_eq!(next_broadcast_delay(6), None);
}

#[test]
fn each_attempt_bumps_counter_and_climbs_the_ladder() {
    let harness = harness(3, 1);
    let broadcaster = broadcaster(&harness);
    let raw = coinbase(21).consensus_encode();

    broadcast::submit(harness.broadcast_queue.as_ref(), &raw).expect("submit");
    let mut message = harness
        .broadcast_queue
        .receive(Duration::ZERO)
        .expect("receive")
        .expect("message");

    let delay = broadcaster
        .handle_message(&mut message)
        .expect("handle")
        .expect("rescheduled");
    assert_eq!(delay, Duration::from_secs(5 * 60));
    let entry = BroadcastEntry::from_bytes(&message.payload).expect("entry");
    assert_eq!(entry.tried, 1);
    assert_eq!(harness.stats.broadcasts_sent.load(Ordering::Relaxed), 1);
}

#[test]
fn message_dies_after_the_fifth_attempt() {
    let harness = harness(3, 1);
    let broadcaster = broadcaster(&harness);
    let raw = coinbase(22).consensus_encode();

    let mut entry = BroadcastEntry::new(&raw);
    entry.tried = 4;
    harness
        .broadcast_queue
        .send(&entry.to_bytes())
        .expect("send");
    let mut message = harness
        .broadcast_queue
        .receive(Duration::ZERO)
        .expect("receive")
        .expect("message");

    // Fifth attempt still reschedules with the last offset.
    let delay = broadcaster
        .handle_message(&mut message)
        .expect("handle")
        .expect("rescheduled");
    assert_eq!(delay, Duration::from_secs(24 * 60 * 60));

    // Sixth attempt exhausts the ladder.
    let next = broadcaster.handle_message(&mut message).expect("handle");
    assert!(next.is_none());
}

#[test]
fn confirmed_transaction_short_circuits() {
    let harness = harness(6, 1);
    let broadcaster = broadcaster(&harness);

    // The coinbase of block 4 is confirmed on the active chain.
    let confirmed = harness.blocks[4].transactions[0].clone();
    let raw = confirmed.consensus_encode();
    harness
        .store
        .put(
            Column::Transactions,
            &confirmed.txid(),
            &tx_row_value(&harness.blocks[4].hash(), 4, 0, &raw),
        )
        .expect("seed row");

    broadcast::submit(harness.broadcast_queue.as_ref(), &raw).expect("submit");
    let mut message = harness
        .broadcast_queue
        .receive(Duration::ZERO)
        .expect("receive")
        .expect("message");
    assert!(broadcaster.handle_message(&mut message).expect("handle").is_none());
    assert_eq!(harness.stats.broadcasts_sent.load(Ordering::Relaxed), 0);
}

#[test]
fn mempool_row_does_not_count_as_confirmed() {
    let harness = harness(4, 1);
    let broadcaster = broadcaster(&harness);

    let transaction = coinbase(23);
    let raw = transaction.consensus_encode();
    // Row from the live listener's mempool path: block hash all zero.
    harness
        .store
        .put(
            Column::Transactions,
            &transaction.txid(),
            &tx_row_value(&[0u8; 32], u32::MAX, 0, &raw),
        )
        .expect("seed row");

    assert!(broadcaster
        .should_broadcast(&transaction.txid())
        .expect("should"));
}

#[test]
fn broadcasting_table_clears_wholesale_at_capacity() {
    let table = BroadcastTable::default();
    for index in 0..BROADCAST_TABLE_CAP {
        let mut txid = [0u8; 32];
        txid[0..8].copy_from_slice(&(index as u64).to_le_bytes());
        table.insert(txid, vec![1]);
    }
    assert_eq!(table.len(), BROADCAST_TABLE_CAP);

    table.insert([0xab; 32], vec![2]);
    // Bulk eviction: only the newest entry survives.
    assert_eq!(table.len(), 1);
    assert!(table.contains(&[0xab; 32]));
}

#[test]
fn undecodable_payload_is_dropped() {
    let harness = harness(2, 1);
    let broadcaster = broadcaster(&harness);
    harness.broadcast_queue.send(b"not json").expect("send");
    let mut message = harness
        .broadcast_queue
        .receive(Duration::ZERO)
        .expect("receive")
        .expect("message");
    assert!(broadcaster.handle_message(&mut message).expect("handle").is_none());
}
