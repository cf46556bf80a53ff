//! Block headers
//!
//! The engine consumes headers produced by the execution layer; it never
//! builds blocks itself. Only the fields the validation pipeline inspects
//! are modeled here.
//!
//! The `nonce` field carries the cumulative count of delayed (L1-originated)
//! messages consumed up to and including this block. A block read a delayed
//! message exactly when its nonce differs from its parent's, and the
//! message's sequence number is the parent's nonce.

use serde::{Deserialize, Serialize};

use lib_machine::Hash;

/// Header of a produced block, as claimed by the execution layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Protocol version
    pub version: u32,
    /// Canonical position of this block in the chain
    pub height: u64,
    /// UNIX timestamp (seconds) of block production
    pub timestamp: u64,
    /// Hash of the parent block
    pub previous_block_hash: Hash,
    /// Claimed hash of this block; the commitment the machine re-derives
    /// during validation
    pub block_hash: Hash,
    /// Cumulative delayed messages consumed through this block
    pub nonce: u64,
}

impl BlockHeader {
    /// The claimed block hash.
    pub fn hash(&self) -> Hash {
        self.block_hash
    }

    /// Whether producing this block consumed a delayed message.
    pub fn consumed_delayed_message(&self, parent: &BlockHeader) -> bool {
        self.nonce != parent.nonce
    }
}
