use std::sync::Arc;
use std::time::Duration;

use chaindex_storage::memory::MemoryStore;
use chaindex_storage::{Column, KvQueue, MessageQueue, ScheduledQueue};

#[test]
fn fifo_receive_and_complete() {
    let queue = KvQueue::open(MemoryStore::new(), Column::WorkQueue).expect("open");
    queue.send(b"first").expect("send");
    queue.send(b"second").expect("send");

    let message = queue
        .receive(Duration::from_secs(30))
        .expect("receive")
        .expect("message");
    assert_eq!(message.payload, b"first");
    queue.complete(&message).expect("complete");

    let message = queue
        .receive(Duration::from_secs(30))
        .expect("receive")
        .expect("message");
    assert_eq!(message.payload, b"second");
    queue.complete(&message).expect("complete");

    assert!(queue.receive(Duration::from_secs(30)).expect("receive").is_none());
    assert_eq!(queue.pending().expect("pending"), 0);
}

#[test]
fn uncompleted_message_reappears_after_visibility() {
    let queue = KvQueue::open(MemoryStore::new(), Column::WorkQueue).expect("open");
    queue.send(b"work").expect("send");

    // Zero visibility: the message is due again on the very next poll.
    let first = queue
        .receive(Duration::ZERO)
        .expect("receive")
        .expect("message");
    let second = queue
        .receive(Duration::ZERO)
        .expect("receive")
        .expect("redelivery");
    assert_eq!(first.id, second.id);
    assert_eq!(second.payload, b"work");

    queue.complete(&second).expect("complete");
    assert!(queue.receive(Duration::ZERO).expect("receive").is_none());
}

#[test]
fn received_message_is_invisible_within_window() {
    let queue = KvQueue::open(MemoryStore::new(), Column::WorkQueue).expect("open");
    queue.send(b"work").expect("send");

    let _held = queue
        .receive(Duration::from_secs(60))
        .expect("receive")
        .expect("message");
    assert!(queue.receive(Duration::from_secs(60)).expect("receive").is_none());
    // Still counted: invisible is not completed.
    assert_eq!(queue.pending().expect("pending"), 1);
}

#[test]
fn delayed_message_not_delivered_early() {
    let queue = KvQueue::open(MemoryStore::new(), Column::BroadcastQueue).expect("open");
    queue
        .send_in(b"later", Duration::from_secs(3600))
        .expect("send_in");
    assert!(queue.receive(Duration::ZERO).expect("receive").is_none());

    queue.send(b"now").expect("send");
    let message = queue
        .receive(Duration::from_secs(30))
        .expect("receive")
        .expect("message");
    assert_eq!(message.payload, b"now");
}

#[test]
fn reschedule_pushes_message_out() {
    let queue = KvQueue::open(MemoryStore::new(), Column::BroadcastQueue).expect("open");
    queue.send(b"tx").expect("send");
    let message = queue
        .receive(Duration::ZERO)
        .expect("receive")
        .expect("message");
    queue
        .reschedule_in(&message, Duration::from_secs(300))
        .expect("reschedule");
    assert!(queue.receive(Duration::ZERO).expect("receive").is_none());
    assert_eq!(queue.pending().expect("pending"), 1);
}

#[test]
fn reopen_continues_sequence() {
    let store = Arc::new(MemoryStore::new());
    {
        let queue = KvQueue::open(Arc::clone(&store), Column::WorkQueue).expect("open");
        queue.send(b"a").expect("send");
        queue.send(b"b").expect("send");
    }
    let queue = KvQueue::open(Arc::clone(&store), Column::WorkQueue).expect("reopen");
    queue.send(b"c").expect("send");

    let mut seen = Vec::new();
    while let Some(message) = queue.receive(Duration::from_secs(30)).expect("receive") {
        seen.push(message.payload.clone());
        queue.complete(&message).expect("complete");
    }
    assert_eq!(seen, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
}
