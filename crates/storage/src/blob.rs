//! Named blobs with exclusive write leases, layered over the key-value store.
//!
//! Checkpoints, the bulk-indexing lock and cached block bodies all live here.
//! A lease grants exclusive write access to one blob until it expires or is
//! released; writes against a leased blob must present the lease.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::{Column, KeyValueStore, StoreError};

const BODY_PREFIX: u8 = b'b';
const LEASE_PREFIX: u8 = b'l';

#[derive(Clone, Debug)]
pub struct Lease {
    name: String,
    token: u64,
}

impl Lease {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn token(&self) -> u64 {
        self.token
    }
}

pub trait BlobStore: Send + Sync {
    fn get(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError>;
    /// Writes the body. If the blob is currently leased the matching lease
    /// must be presented, otherwise `LeaseHeldElsewhere`.
    fn put(&self, name: &str, body: &[u8], lease: Option<&Lease>) -> Result<(), StoreError>;
    fn lease(&self, name: &str, ttl: Duration) -> Result<Lease, StoreError>;
    fn release(&self, lease: &Lease) -> Result<(), StoreError>;
}

impl<T: BlobStore + ?Sized> BlobStore for std::sync::Arc<T> {
    fn get(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.as_ref().get(name)
    }

    fn put(&self, name: &str, body: &[u8], lease: Option<&Lease>) -> Result<(), StoreError> {
        self.as_ref().put(name, body, lease)
    }

    fn lease(&self, name: &str, ttl: Duration) -> Result<Lease, StoreError> {
        self.as_ref().lease(name, ttl)
    }

    fn release(&self, lease: &Lease) -> Result<(), StoreError> {
        self.as_ref().release(lease)
    }
}

pub struct KvBlobStore<S> {
    store: S,
    counter: AtomicU64,
    // Serializes lease check-then-write within this process.
    guard: Mutex<()>,
}

impl<S> KvBlobStore<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            counter: AtomicU64::new(1),
            guard: Mutex::new(()),
        }
    }
}

impl<S: KeyValueStore> KvBlobStore<S> {
    fn lease_state(&self, name: &str) -> Result<Option<(u64, u64)>, StoreError> {
        let record = self.store.get(Column::Blobs, &prefixed(LEASE_PREFIX, name))?;
        let Some(record) = record else {
            return Ok(None);
        };
        if record.len() != 16 {
            return Err(StoreError::Backend(format!("corrupt lease record {name}")));
        }
        let token = u64::from_be_bytes(record[0..8].try_into().unwrap_or_default());
        let expires_ms = u64::from_be_bytes(record[8..16].try_into().unwrap_or_default());
        Ok(Some((token, expires_ms)))
    }

    fn active_lease(&self, name: &str) -> Result<Option<u64>, StoreError> {
        match self.lease_state(name)? {
            Some((token, expires_ms)) if expires_ms > unix_time_ms() => Ok(Some(token)),
            _ => Ok(None),
        }
    }
}

impl<S: KeyValueStore> BlobStore for KvBlobStore<S> {
    fn get(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.store.get(Column::Blobs, &prefixed(BODY_PREFIX, name))
    }

    fn put(&self, name: &str, body: &[u8], lease: Option<&Lease>) -> Result<(), StoreError> {
        let _guard = lock(&self.guard)?;
        if let Some(holder) = self.active_lease(name)? {
            let presented = lease
                .filter(|lease| lease.name() == name)
                .map(Lease::token);
            if presented != Some(holder) {
                return Err(StoreError::LeaseHeldElsewhere);
            }
        }
        self.store
            .put(Column::Blobs, &prefixed(BODY_PREFIX, name), body)
    }

    fn lease(&self, name: &str, ttl: Duration) -> Result<Lease, StoreError> {
        let _guard = lock(&self.guard)?;
        if self.active_lease(name)?.is_some() {
            return Err(StoreError::LeaseHeldElsewhere);
        }
        let token = (unix_time_ms() << 16) | (self.counter.fetch_add(1, Ordering::Relaxed) & 0xffff);
        let expires_ms = unix_time_ms().saturating_add(ttl.as_millis() as u64);
        let mut record = Vec::with_capacity(16);
        record.extend_from_slice(&token.to_be_bytes());
        record.extend_from_slice(&expires_ms.to_be_bytes());
        self.store
            .put(Column::Blobs, &prefixed(LEASE_PREFIX, name), &record)?;
        Ok(Lease {
            name: name.to_string(),
            token,
        })
    }

    fn release(&self, lease: &Lease) -> Result<(), StoreError> {
        let _guard = lock(&self.guard)?;
        match self.lease_state(lease.name())? {
            Some((token, _)) if token == lease.token() => self
                .store
                .delete(Column::Blobs, &prefixed(LEASE_PREFIX, lease.name())),
            _ => Ok(()),
        }
    }
}

fn prefixed(prefix: u8, name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + name.len());
    key.push(prefix);
    key.extend_from_slice(name.as_bytes());
    key
}

fn lock<T>(mutex: &Mutex<T>) -> Result<std::sync::MutexGuard<'_, T>, StoreError> {
    mutex
        .lock()
        .map_err(|_| StoreError::Backend("blob store lock poisoned".to_string()))
}

pub(crate) fn unix_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}
