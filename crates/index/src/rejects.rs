//! Persistent rejection records. A transaction rejected by a peer with any
//! code other than DUPLICATE never gets rebroadcast.

use chaindex_primitives::Hash256;
use chaindex_storage::{Column, KeyValueStore};
use serde::{Deserialize, Serialize};

use crate::IndexError;

/// Wire code a peer sends for a transaction it already knows.
pub const REJECT_DUPLICATE: u8 = 0x12;

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RejectRecord {
    pub code: u8,
    pub reason: String,
}

pub struct RejectTable<S> {
    store: S,
}

impl<S> RejectTable<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: KeyValueStore> RejectTable<S> {
    pub fn record(&self, txid: &Hash256, code: u8, reason: &str) -> Result<(), IndexError> {
        let record = RejectRecord {
            code,
            reason: reason.to_string(),
        };
        let value = serde_json::to_vec(&record)
            .map_err(|err| IndexError::TaskFailed(format!("encode reject record: {err}")))?;
        self.store.put(Column::Rejects, txid, &value)?;
        Ok(())
    }

    pub fn get(&self, txid: &Hash256) -> Result<Option<RejectRecord>, IndexError> {
        let Some(value) = self.store.get(Column::Rejects, txid)? else {
            return Ok(None);
        };
        serde_json::from_slice(&value)
            .map(Some)
            .map_err(|_| IndexError::CorruptRow("reject row malformed"))
    }

    pub fn contains(&self, txid: &Hash256) -> Result<bool, IndexError> {
        Ok(self.store.get(Column::Rejects, txid)?.is_some())
    }
}
