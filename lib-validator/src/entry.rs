//! Validation entries
//!
//! One entry per submitted block, keyed by the block's end position in the
//! sequencer stream. Lifecycle: pending → running → valid → reclaimed by
//! the progress tracker once every earlier position has been validated.
//!
//! The identity fields are immutable after construction; the mutable state
//! is confined to atomics and small mutex-guarded resource lists so the
//! dispatcher, the owning validation task and the progress tracker can
//! share the entry without a big lock.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use lib_machine::Hash;

use crate::preimages::PreimageCache;
use crate::types::BlockHeader;

/// A block queued for (or undergoing) validation.
pub struct ValidationEntry {
    /// Chain height of the block
    pub block_number: u64,
    /// Claimed block hash, which the machine must re-derive
    pub block_hash: Hash,
    /// Parent block hash, the machine's starting commitment
    pub prev_block_hash: Hash,
    /// Full header, kept for failure diagnostics
    pub header: BlockHeader,
    /// Whether producing this block consumed a delayed message
    pub has_delayed_msg: bool,
    /// Sequence number of that delayed message
    pub delayed_msg_nr: u64,
    /// End position of this block in the sequencer stream
    pub pos: u64,

    /// Sequencer batch the block starts in; set at dispatch
    seq_msg_nr: AtomicU64,
    running: AtomicBool,
    valid: AtomicBool,

    /// Handles into the preimage cache, surrendered on release
    preimage_handles: Mutex<Vec<Hash>>,
    /// Delayed-message buffers owned for the duration of this validation
    allocated_buffers: Mutex<Vec<Arc<[u8]>>>,
}

impl ValidationEntry {
    pub fn new(
        header: BlockHeader,
        has_delayed_msg: bool,
        delayed_msg_nr: u64,
        preimage_handles: Vec<Hash>,
        pos: u64,
    ) -> Self {
        Self {
            block_number: header.height,
            block_hash: header.hash(),
            prev_block_hash: header.previous_block_hash,
            header,
            has_delayed_msg,
            delayed_msg_nr,
            pos,
            seq_msg_nr: AtomicU64::new(0),
            running: AtomicBool::new(false),
            valid: AtomicBool::new(false),
            preimage_handles: Mutex::new(preimage_handles),
            allocated_buffers: Mutex::new(Vec::new()),
        }
    }

    /// Snapshot of the preimage handles for packing.
    pub fn preimage_handles(&self) -> Vec<Hash> {
        self.preimage_handles
            .lock()
            .expect("entry poisoned")
            .clone()
    }

    /// Record the batch this block's validation starts in.
    pub fn set_seq_msg_nr(&self, batch: u64) {
        self.seq_msg_nr.store(batch, Ordering::Release);
    }

    pub fn seq_msg_nr(&self) -> u64 {
        self.seq_msg_nr.load(Ordering::Acquire)
    }

    pub fn mark_running(&self) {
        self.running.store(true, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Mark validated. Only set after all resources were released, at which
    /// point the progress tracker may delete the entry at any time.
    pub fn mark_valid(&self) {
        self.valid.store(true, Ordering::Release);
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Take ownership of a delayed-message buffer for this validation.
    pub fn attach_buffer(&self, buffer: Arc<[u8]>) {
        self.allocated_buffers
            .lock()
            .expect("entry poisoned")
            .push(buffer);
    }

    /// Release everything this entry holds: preimage references and
    /// delayed-message buffers.
    ///
    /// Called on every validation exit path (success, cancellation,
    /// precondition abort, mismatch) so no path can leak buffers.
    /// Idempotent: a second call finds nothing left to release.
    pub fn release_resources(&self, preimage_cache: &PreimageCache) {
        let handles: Vec<Hash> = {
            let mut guard = self.preimage_handles.lock().expect("entry poisoned");
            std::mem::take(&mut *guard)
        };
        if !handles.is_empty() {
            preimage_cache.release(&handles);
        }
        self.allocated_buffers
            .lock()
            .expect("entry poisoned")
            .clear();
    }
}

impl std::fmt::Debug for ValidationEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidationEntry")
            .field("block_number", &self.block_number)
            .field("pos", &self.pos)
            .field("block_hash", &self.block_hash)
            .field("has_delayed_msg", &self.has_delayed_msg)
            .field("running", &self.is_running())
            .field("valid", &self.is_valid())
            .finish()
    }
}
