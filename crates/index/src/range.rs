//! The unit of bulk work: one contiguous slice of heights for one index.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct BlockRange {
    pub target: String,
    pub from: u32,
    pub count: u32,
    pub processed: bool,
}

impl BlockRange {
    pub fn new(target: &str, from: u32, count: u32) -> Self {
        Self {
            target: target.to_string(),
            from,
            count,
            processed: false,
        }
    }

    pub fn last_height(&self) -> u32 {
        self.from + self.count - 1
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        // BlockRange is a closed struct of plain fields; serialization cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }
}
