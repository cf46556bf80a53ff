//! Machine global state
//!
//! The triple `(batch, pos_in_batch, block_hash)` denotes the machine's
//! position in the sequencer input stream and its most recent block
//! commitment. The engine writes a start state before execution and reads
//! the end state after the machine halts; equality against the claimed
//! post-state is the entire fraud check.

use serde::{Deserialize, Serialize};

use crate::types::Hash;

/// Position in the sequencer stream plus the latest block commitment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GlobalState {
    /// Sequencer batch number the machine is positioned at.
    pub batch: u64,
    /// Message offset within that batch.
    pub pos_in_batch: u64,
    /// Hash of the most recently produced block.
    pub block_hash: Hash,
}

impl GlobalState {
    pub fn new(batch: u64, pos_in_batch: u64, block_hash: Hash) -> Self {
        Self {
            batch,
            pos_in_batch,
            block_hash,
        }
    }

    /// Canonical byte encoding: both counters little-endian, then the hash.
    ///
    /// This is the layout the machine persists inside its snapshots, so it
    /// must stay stable across releases.
    pub fn to_bytes(&self) -> [u8; 48] {
        let mut out = [0u8; 48];
        out[0..8].copy_from_slice(&self.batch.to_le_bytes());
        out[8..16].copy_from_slice(&self.pos_in_batch.to_le_bytes());
        out[16..48].copy_from_slice(self.block_hash.as_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8; 48]) -> Self {
        let batch = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
        let pos_in_batch = u64::from_le_bytes(bytes[8..16].try_into().unwrap());
        let block_hash = Hash::from_bytes(&bytes[16..48]);
        Self {
            batch,
            pos_in_batch,
            block_hash,
        }
    }
}

impl std::fmt::Display for GlobalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "batch {} pos {} hash {}",
            self.batch, self.pos_in_batch, self.block_hash
        )
    }
}
