//! In-memory header chain with fork detection and network parameters.

pub mod headers;
pub mod locator;
pub mod params;

pub use headers::{ChainError, ConnectOutcome, HeaderChain, HeaderEntry, SharedHeaderChain};
pub use locator::{locator_from_hex, locator_to_hex};
pub use params::{chain_params, ChainParams, Network};
