//! Persistent message queues layered over the key-value store.
//!
//! `MessageQueue` delivers at least once: a received message stays invisible
//! for the caller-provided visibility window and reappears if it is not
//! completed in time. `ScheduledQueue` adds delayed delivery and explicit
//! rescheduling for the broadcast retry ladder.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::blob::unix_time_ms;
use crate::{Column, KeyValueStore, StoreError};

#[derive(Clone, Debug)]
pub struct QueueMessage {
    pub id: u64,
    pub payload: Vec<u8>,
}

pub trait MessageQueue: Send + Sync {
    fn send(&self, payload: &[u8]) -> Result<(), StoreError>;
    fn receive(&self, visibility: Duration) -> Result<Option<QueueMessage>, StoreError>;
    fn complete(&self, message: &QueueMessage) -> Result<(), StoreError>;
    fn pending(&self) -> Result<usize, StoreError>;
}

pub trait ScheduledQueue: MessageQueue {
    fn send_in(&self, payload: &[u8], delay: Duration) -> Result<(), StoreError>;
    fn reschedule_in(&self, message: &QueueMessage, delay: Duration) -> Result<(), StoreError>;
}

impl<T: MessageQueue + ?Sized> MessageQueue for std::sync::Arc<T> {
    fn send(&self, payload: &[u8]) -> Result<(), StoreError> {
        self.as_ref().send(payload)
    }

    fn receive(&self, visibility: Duration) -> Result<Option<QueueMessage>, StoreError> {
        self.as_ref().receive(visibility)
    }

    fn complete(&self, message: &QueueMessage) -> Result<(), StoreError> {
        self.as_ref().complete(message)
    }

    fn pending(&self) -> Result<usize, StoreError> {
        self.as_ref().pending()
    }
}

impl<T: ScheduledQueue + ?Sized> ScheduledQueue for std::sync::Arc<T> {
    fn send_in(&self, payload: &[u8], delay: Duration) -> Result<(), StoreError> {
        self.as_ref().send_in(payload, delay)
    }

    fn reschedule_in(&self, message: &QueueMessage, delay: Duration) -> Result<(), StoreError> {
        self.as_ref().reschedule_in(message, delay)
    }
}

/// Queue rows live in one column: key = message id (big-endian), value =
/// visible-at timestamp followed by the payload bytes.
pub struct KvQueue<S> {
    store: S,
    column: Column,
    seq: AtomicU64,
    // receive is check-then-update; serialize it within the process.
    guard: Mutex<()>,
}

impl<S: KeyValueStore> KvQueue<S> {
    pub fn open(store: S, column: Column) -> Result<Self, StoreError> {
        let entries = store.scan_prefix(column, &[])?;
        let next = entries
            .last()
            .and_then(|(key, _)| decode_id(key))
            .map(|id| id + 1)
            .unwrap_or(0);
        Ok(Self {
            store,
            column,
            seq: AtomicU64::new(next),
            guard: Mutex::new(()),
        })
    }

    fn write_row(&self, id: u64, visible_at_ms: u64, payload: &[u8]) -> Result<(), StoreError> {
        let mut value = Vec::with_capacity(8 + payload.len());
        value.extend_from_slice(&visible_at_ms.to_be_bytes());
        value.extend_from_slice(payload);
        self.store.put(self.column, &id.to_be_bytes(), &value)
    }
}

impl<S: KeyValueStore> MessageQueue for KvQueue<S> {
    fn send(&self, payload: &[u8]) -> Result<(), StoreError> {
        self.send_in(payload, Duration::ZERO)
    }

    fn receive(&self, visibility: Duration) -> Result<Option<QueueMessage>, StoreError> {
        let _guard = lock(&self.guard)?;
        let now = unix_time_ms();
        let entries = self.store.scan_prefix(self.column, &[])?;
        for (key, value) in entries {
            let Some(id) = decode_id(&key) else {
                return Err(StoreError::QueueFatal(format!(
                    "corrupt queue key in {}",
                    self.column.as_str()
                )));
            };
            let Some((visible_at, payload)) = decode_row(&value) else {
                return Err(StoreError::QueueFatal(format!(
                    "corrupt queue row {id} in {}",
                    self.column.as_str()
                )));
            };
            if visible_at > now {
                continue;
            }
            let hidden_until = now.saturating_add(visibility.as_millis() as u64);
            self.write_row(id, hidden_until, payload)?;
            return Ok(Some(QueueMessage {
                id,
                payload: payload.to_vec(),
            }));
        }
        Ok(None)
    }

    fn complete(&self, message: &QueueMessage) -> Result<(), StoreError> {
        self.store.delete(self.column, &message.id.to_be_bytes())
    }

    fn pending(&self) -> Result<usize, StoreError> {
        Ok(self.store.scan_prefix(self.column, &[])?.len())
    }
}

impl<S: KeyValueStore> ScheduledQueue for KvQueue<S> {
    fn send_in(&self, payload: &[u8], delay: Duration) -> Result<(), StoreError> {
        let id = self.seq.fetch_add(1, Ordering::Relaxed);
        let visible_at = unix_time_ms().saturating_add(delay.as_millis() as u64);
        self.write_row(id, visible_at, payload)
    }

    fn reschedule_in(&self, message: &QueueMessage, delay: Duration) -> Result<(), StoreError> {
        let visible_at = unix_time_ms().saturating_add(delay.as_millis() as u64);
        self.write_row(message.id, visible_at, &message.payload)
    }
}

fn decode_id(key: &[u8]) -> Option<u64> {
    Some(u64::from_be_bytes(key.try_into().ok()?))
}

fn decode_row(value: &[u8]) -> Option<(u64, &[u8])> {
    if value.len() < 8 {
        return None;
    }
    let visible_at = u64::from_be_bytes(value[0..8].try_into().ok()?);
    Some((visible_at, &value[8..]))
}

fn lock<T>(mutex: &Mutex<T>) -> Result<std::sync::MutexGuard<'_, T>, StoreError> {
    mutex
        .lock()
        .map_err(|_| StoreError::Backend("queue lock poisoned".to_string()))
}
