//! In-process collaborator doubles
//!
//! The engine's collaborators (machine, inbox tracker, streamer) are traits,
//! so the whole pipeline can be exercised without FFI or a chain. This
//! module provides:
//!
//! - [`ScriptedMachine`] / [`ScriptedMachineFactory`]: a deterministic
//!   machine whose end state is a pure BLAKE3 function of its inputs, with
//!   a configurable step budget so chunked execution, cancellation windows
//!   and the concurrency cap are all observable;
//! - [`StaticInbox`]: a `DelayedMessageReader` over a fixed map that
//!   records every read;
//! - [`NullStreamer`]: a registrar that ignores the callback;
//! - [`ChainBuilder`]: produces linked headers, batches and position
//!   records whose claimed hashes match what the scripted machine computes.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use lib_machine::{
    blake3_hash_multiple, GlobalState, Hash, Machine, MachineError, MachineFactory,
    MachineResult, PackedPreimages,
};

use crate::engine::{BlockValidator, BlockValidatorRegistrar, DelayedMessageReader};
use crate::types::{BlockHeader, PosInSequencer};

/// End state the scripted machine derives from its inputs: a BLAKE3 digest
/// of the start state, the sequencer batch, and the delayed message bytes.
///
/// Fixtures use the same function to compute claimed block hashes, so an
/// untampered fixture always validates and a tampered one never does.
pub fn scripted_end_hash(start: GlobalState, batch: &[u8], delayed: Option<&[u8]>) -> Hash {
    blake3_hash_multiple(&[&start.to_bytes(), batch, delayed.unwrap_or(&[])])
}

/// Tracks how many cloned machines are alive, and the high-water mark.
#[derive(Debug, Default)]
pub struct CloneTracker {
    live: AtomicUsize,
    peak: AtomicUsize,
}

impl CloneTracker {
    fn on_clone(&self) {
        let now = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn on_drop(&self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

const SNAPSHOT_MAGIC: &[u8; 12] = b"SCRIPTEDMACH";

/// Deterministic machine double.
///
/// Execution model: the machine "runs" for a fixed step budget, then halts
/// with `batch = start.batch + 1, pos_in_batch = 0` (it consumes its whole
/// starting batch) and a block hash given by [`scripted_end_hash`].
pub struct ScriptedMachine {
    program_hash: Hash,
    steps_per_block: u64,
    steps_done: u64,
    finished: bool,
    at_host_io: bool,
    start_state: GlobalState,
    state: GlobalState,
    sequencer_batches: BTreeMap<u64, Arc<[u8]>>,
    delayed_messages: BTreeMap<u64, Arc<[u8]>>,
    preimage_count: usize,
    host_io_invocations: Arc<AtomicUsize>,
    clones: Arc<CloneTracker>,
    is_clone: bool,
}

impl ScriptedMachine {
    fn transition(&mut self) -> MachineResult<()> {
        let Some(batch) = self.sequencer_batches.get(&self.start_state.batch) else {
            return Err(MachineError::Step(format!(
                "no sequencer batch {} attached",
                self.start_state.batch
            )));
        };
        let delayed: Vec<u8> = self
            .delayed_messages
            .values()
            .flat_map(|bytes| bytes.iter().copied())
            .collect();
        let delayed = (!delayed.is_empty()).then_some(delayed.as_slice());
        let block_hash = scripted_end_hash(self.start_state, batch, delayed);
        self.state = GlobalState::new(self.start_state.batch + 1, 0, block_hash);
        self.finished = true;
        Ok(())
    }
}

impl Machine for ScriptedMachine {
    fn clone_machine(&self) -> Box<dyn Machine> {
        self.clones.on_clone();
        Box::new(ScriptedMachine {
            program_hash: self.program_hash,
            steps_per_block: self.steps_per_block,
            steps_done: self.steps_done,
            finished: self.finished,
            at_host_io: self.at_host_io,
            start_state: self.start_state,
            state: self.state,
            sequencer_batches: self.sequencer_batches.clone(),
            delayed_messages: self.delayed_messages.clone(),
            preimage_count: self.preimage_count,
            host_io_invocations: Arc::clone(&self.host_io_invocations),
            clones: Arc::clone(&self.clones),
            is_clone: true,
        })
    }

    fn hash(&self) -> Hash {
        self.program_hash
    }

    fn set_global_state(&mut self, state: GlobalState) {
        self.start_state = state;
        self.state = state;
    }

    fn global_state(&self) -> GlobalState {
        self.state
    }

    fn add_sequencer_inbox_message(&mut self, batch: u64, data: Arc<[u8]>) {
        self.sequencer_batches.insert(batch, data);
    }

    fn add_delayed_inbox_message(&mut self, seq: u64, data: Arc<[u8]>) {
        self.delayed_messages.insert(seq, data);
    }

    fn add_preimages(&mut self, preimages: &PackedPreimages) {
        self.preimage_count += preimages.count();
    }

    fn step(&mut self, count: u64) -> MachineResult<()> {
        if self.finished {
            return Ok(());
        }
        self.steps_done = self.steps_done.saturating_add(count);
        if self.steps_done >= self.steps_per_block {
            self.transition()?;
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        !self.finished
    }

    fn step_until_host_io(&mut self) -> MachineResult<()> {
        self.host_io_invocations.fetch_add(1, Ordering::SeqCst);
        self.at_host_io = true;
        Ok(())
    }

    fn serialize_state(&self, path: &Path) -> MachineResult<()> {
        let mut bytes = Vec::with_capacity(SNAPSHOT_MAGIC.len() + 33);
        bytes.extend_from_slice(SNAPSHOT_MAGIC);
        bytes.extend_from_slice(self.program_hash.as_bytes());
        bytes.push(self.at_host_io as u8);
        std::fs::write(path, bytes)?;
        Ok(())
    }

    fn deserialize_and_replace_state(&mut self, path: &Path) -> MachineResult<()> {
        let bytes = std::fs::read(path)?;
        if bytes.len() != SNAPSHOT_MAGIC.len() + 33 || !bytes.starts_with(SNAPSHOT_MAGIC) {
            return Err(MachineError::Deserialize(format!(
                "malformed snapshot at {}",
                path.display()
            )));
        }
        if &bytes[SNAPSHOT_MAGIC.len()..SNAPSHOT_MAGIC.len() + 32] != self.program_hash.as_bytes() {
            return Err(MachineError::Deserialize(
                "snapshot is for a different program".into(),
            ));
        }
        // Only mutate after full validation: the contract promises no
        // partial state replacement on failure.
        self.at_host_io = bytes[SNAPSHOT_MAGIC.len() + 32] != 0;
        Ok(())
    }
}

impl Drop for ScriptedMachine {
    fn drop(&mut self) {
        if self.is_clone {
            self.clones.on_drop();
        }
    }
}

/// Factory producing [`ScriptedMachine`]s whose program hash is derived
/// from the binary and module paths it was asked to load.
pub struct ScriptedMachineFactory {
    steps_per_block: u64,
    /// How many times any produced machine ran `step_until_host_io`
    pub host_io_invocations: Arc<AtomicUsize>,
    /// Live/peak cloned-machine accounting across all produced machines
    pub clones: Arc<CloneTracker>,
}

impl ScriptedMachineFactory {
    pub fn new(steps_per_block: u64) -> Self {
        Self {
            steps_per_block,
            host_io_invocations: Arc::new(AtomicUsize::new(0)),
            clones: Arc::new(CloneTracker::default()),
        }
    }
}

impl MachineFactory for ScriptedMachineFactory {
    fn load(&self, binary: &Path, modules: &[PathBuf]) -> MachineResult<Box<dyn Machine>> {
        let mut segments: Vec<Vec<u8>> = vec![binary.display().to_string().into_bytes()];
        for module in modules {
            segments.push(module.display().to_string().into_bytes());
        }
        let parts: Vec<&[u8]> = segments.iter().map(|s| s.as_slice()).collect();
        let program_hash = blake3_hash_multiple(&parts);

        Ok(Box::new(ScriptedMachine {
            program_hash,
            steps_per_block: self.steps_per_block,
            steps_done: 0,
            finished: false,
            at_host_io: false,
            start_state: GlobalState::default(),
            state: GlobalState::default(),
            sequencer_batches: BTreeMap::new(),
            delayed_messages: BTreeMap::new(),
            preimage_count: 0,
            host_io_invocations: Arc::clone(&self.host_io_invocations),
            clones: Arc::clone(&self.clones),
            is_clone: false,
        }))
    }
}

/// Delayed-message reader over a fixed map; records every read.
pub struct StaticInbox {
    messages: HashMap<u64, Vec<u8>>,
    reads: Mutex<Vec<u64>>,
    validator: Mutex<Option<Arc<BlockValidator>>>,
}

impl StaticInbox {
    pub fn new(messages: HashMap<u64, Vec<u8>>) -> Arc<Self> {
        Arc::new(Self {
            messages,
            reads: Mutex::new(Vec::new()),
            validator: Mutex::new(None),
        })
    }

    pub fn empty() -> Arc<Self> {
        Self::new(HashMap::new())
    }

    /// Sequence numbers requested so far, in order.
    pub fn reads(&self) -> Vec<u64> {
        self.reads.lock().expect("inbox poisoned").clone()
    }
}

impl BlockValidatorRegistrar for StaticInbox {
    fn set_block_validator(&self, validator: Arc<BlockValidator>) {
        *self.validator.lock().expect("inbox poisoned") = Some(validator);
    }
}

#[async_trait]
impl DelayedMessageReader for StaticInbox {
    async fn delayed_message_bytes(&self, seq: u64) -> anyhow::Result<Vec<u8>> {
        self.reads.lock().expect("inbox poisoned").push(seq);
        self.messages
            .get(&seq)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no delayed message at sequence {}", seq))
    }
}

/// Streamer stand-in that discards the registration callback.
pub struct NullStreamer;

impl BlockValidatorRegistrar for NullStreamer {
    fn set_block_validator(&self, _validator: Arc<BlockValidator>) {}
}

/// One block's worth of submission data.
#[derive(Debug, Clone)]
pub struct BlockFixture {
    pub header: BlockHeader,
    pub prev_header: BlockHeader,
    pub batch_nr: u64,
    pub batch_bytes: Vec<u8>,
    pub positions: Vec<PosInSequencer>,
    /// Entry position (the block's end marker)
    pub pos: u64,
    pub preimages: HashMap<Hash, Vec<u8>>,
    pub delayed: Option<(u64, Vec<u8>)>,
}

impl BlockFixture {
    /// Register the block with the engine.
    pub fn submit_block(&self, validator: &BlockValidator) {
        validator.submit_block(
            self.header.clone(),
            &self.prev_header,
            self.preimages.clone(),
            self.pos,
        );
    }

    /// Deliver the block's batch bytes and position records.
    pub fn submit_positions(&self, validator: &BlockValidator) {
        validator.submit_positions(
            HashMap::from([(self.batch_nr, self.batch_bytes.clone())]),
            self.positions.clone(),
        );
    }
}

/// Builds a linked chain of fixtures consistent with [`ScriptedMachine`]:
/// one batch and one position record per block, claimed hashes computed by
/// [`scripted_end_hash`]. The batch blob may carry any number of app-level
/// messages; the engine only sequences whole blocks.
pub struct ChainBuilder {
    prev: BlockHeader,
    next_pos: u64,
    next_batch: u64,
}

impl ChainBuilder {
    pub fn new() -> Self {
        Self {
            prev: BlockHeader {
                version: 1,
                height: 0,
                timestamp: 1_700_000_000,
                previous_block_hash: Hash::ZERO,
                block_hash: lib_machine::blake3_hash(b"genesis"),
                nonce: 0,
            },
            next_pos: 0,
            next_batch: 0,
        }
    }

    /// Produce the next block. `delayed` marks the block as having consumed
    /// a delayed message (bumping the header nonce).
    pub fn next_block(&mut self, batch_bytes: Vec<u8>, delayed: Option<Vec<u8>>) -> BlockFixture {
        let batch_nr = self.next_batch;
        let start = GlobalState::new(batch_nr, 0, self.prev.block_hash);
        let end_hash = scripted_end_hash(start, &batch_bytes, delayed.as_deref());
        let delayed_nr = self.prev.nonce;

        let header = BlockHeader {
            version: 1,
            height: self.prev.height + 1,
            timestamp: self.prev.timestamp + 1,
            previous_block_hash: self.prev.block_hash,
            block_hash: end_hash,
            nonce: self.prev.nonce + u64::from(delayed.is_some()),
        };

        let positions = vec![PosInSequencer {
            pos: self.next_pos,
            batch: batch_nr,
            pos_in_batch: 0,
            batch_after: batch_nr + 1,
            pos_after: 0,
        }];

        let fixture = BlockFixture {
            header: header.clone(),
            prev_header: self.prev.clone(),
            batch_nr,
            batch_bytes,
            positions,
            pos: self.next_pos,
            preimages: HashMap::new(),
            delayed: delayed.map(|bytes| (delayed_nr, bytes)),
        };

        self.prev = header;
        self.next_pos += 1;
        self.next_batch += 1;
        fixture
    }
}

impl Default for ChainBuilder {
    fn default() -> Self {
        Self::new()
    }
}
