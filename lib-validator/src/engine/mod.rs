//! The block-validation engine
//!
//! A single owned value wiring together the preimage cache, the batch
//! store, the prewarmed base machine, and three kinds of concurrent
//! activity:
//!
//! - **submission**: external threads calling [`BlockValidator::submit_block`]
//!   and [`BlockValidator::submit_positions`];
//! - a single **dispatcher** task that starts validations strictly in
//!   position order, bounded by the concurrency limit;
//! - a single **progress tracker** task that publishes `blocks_validated`
//!   strictly in block order and reclaims resources behind it;
//! - up to `concurrent_runs_limit` **validation** tasks, each exclusively
//!   owning a cloned machine.
//!
//! Wake-up plumbing follows a level-triggered scheme: each consumer loop
//! owns a capacity-1 channel, producers signal with a non-blocking send,
//! and duplicate wakes are dropped. A lost signal is harmless because every
//! completing validation re-signals both loops.

mod dispatch;
mod progress;
mod validate;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, watch};

use lib_machine::{Hash, Machine, MachineFactory};

use crate::base_machine::BaseMachineCache;
use crate::batches::SequencerBatchStore;
use crate::config::BlockValidatorConfig;
use crate::entry::ValidationEntry;
use crate::preimages::PreimageCache;
use crate::types::{BlockHeader, PosInSequencer};
use crate::{ValidatorError, ValidatorResult};

/// Collaborators that need a handle back into the engine (the chain
/// streamer and the inbox tracker) implement this and receive the engine
/// at construction.
pub trait BlockValidatorRegistrar: Send + Sync {
    fn set_block_validator(&self, validator: Arc<BlockValidator>);
}

/// Source of delayed (L1-originated) message bytes, addressed by sequence
/// number. Implemented by the inbox tracker.
#[async_trait]
pub trait DelayedMessageReader: BlockValidatorRegistrar {
    async fn delayed_message_bytes(&self, seq: u64) -> anyhow::Result<Vec<u8>>;
}

/// Cheap observability snapshot of the engine.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationStatus {
    /// Highest block validated, in order and gap-free
    pub blocks_validated: u64,
    /// Sequencer batches fully consumed by validated blocks
    pub batches_validated: u64,
    /// Validation tasks currently holding a machine
    pub validations_running: usize,
    /// Position records waiting for dispatch
    pub queue_depth: usize,
    /// Validation entries not yet reclaimed
    pub entries_pending: usize,
    /// Distinct preimages still referenced by live entries
    pub preimages_cached: usize,
    /// Sequencer batch buffers currently held
    pub batches_held: usize,
}

/// Dispatcher-owned state: the pending position records and the next
/// position to hand out. Guarded by one mutex because the dispatcher is
/// the only mutator of both.
pub(super) struct DispatchState {
    pub(super) queue: Vec<PosInSequencer>,
    pub(super) pos_next_send: u64,
}

/// Progress-tracker-owned counters, serialized by their mutex.
pub(super) struct ProgressState {
    pub(super) pos_next: u64,
    pub(super) batch_validated: u64,
    pub(super) blocks_validated: u64,
}

/// The deterministic block-validation engine.
pub struct BlockValidator {
    pub(super) config: BlockValidatorConfig,
    launch_time: String,
    pub(super) concurrent_runs_limit: usize,

    pub(super) preimage_cache: PreimageCache,
    pub(super) batches: SequencerBatchStore,
    pub(super) entries: RwLock<HashMap<u64, Arc<ValidationEntry>>>,
    pub(super) base_machine: Mutex<Box<dyn Machine>>,
    pub(super) inbox: Arc<dyn DelayedMessageReader>,

    pub(super) dispatch: Mutex<DispatchState>,
    pub(super) progress: Mutex<ProgressState>,
    blocks_validated: AtomicU64,
    pub(super) validations_running: AtomicUsize,
    started: AtomicBool,

    wake_dispatch: mpsc::Sender<()>,
    wake_progress: mpsc::Sender<()>,
    dispatch_wake_rx: Mutex<Option<mpsc::Receiver<()>>>,
    progress_wake_rx: Mutex<Option<mpsc::Receiver<()>>>,
    pub(super) progress_events: watch::Sender<u64>,
    pub(super) shutdown: watch::Sender<bool>,
}

impl BlockValidator {
    /// Build the engine: load the base machine through `factory` and
    /// register the engine with its collaborators.
    ///
    /// The machine is loaded here but only fast-forwarded in
    /// [`BlockValidator::start`], so construction stays cheap enough for
    /// synchronous wiring.
    pub fn new(
        factory: &dyn MachineFactory,
        inbox: Arc<dyn DelayedMessageReader>,
        streamer: &dyn BlockValidatorRegistrar,
        config: BlockValidatorConfig,
    ) -> ValidatorResult<Arc<Self>> {
        let base_machine = factory.load(&config.prover_binary(), &config.module_list())?;

        let (wake_dispatch, dispatch_wake_rx) = mpsc::channel(1);
        let (wake_progress, progress_wake_rx) = mpsc::channel(1);
        let (progress_events, _) = watch::channel(0u64);
        let (shutdown, _) = watch::channel(false);

        let concurrent_runs_limit = config.effective_concurrency();
        let launch_time = chrono::Utc::now().format("%Y_%m_%d__%H_%M").to_string();

        let validator = Arc::new(Self {
            config,
            launch_time,
            concurrent_runs_limit,
            preimage_cache: PreimageCache::new(),
            batches: SequencerBatchStore::new(),
            entries: RwLock::new(HashMap::new()),
            base_machine: Mutex::new(base_machine),
            inbox: Arc::clone(&inbox),
            dispatch: Mutex::new(DispatchState {
                queue: Vec::new(),
                pos_next_send: 0,
            }),
            progress: Mutex::new(ProgressState {
                pos_next: 0,
                batch_validated: 0,
                blocks_validated: 0,
            }),
            blocks_validated: AtomicU64::new(0),
            validations_running: AtomicUsize::new(0),
            started: AtomicBool::new(false),
            wake_dispatch,
            wake_progress,
            dispatch_wake_rx: Mutex::new(Some(dispatch_wake_rx)),
            progress_wake_rx: Mutex::new(Some(progress_wake_rx)),
            progress_events,
            shutdown,
        });

        streamer.set_block_validator(Arc::clone(&validator));
        inbox.set_block_validator(Arc::clone(&validator));
        Ok(validator)
    }

    /// Prepare the base-machine snapshot cache, then launch the dispatcher
    /// and progress-tracker loops.
    pub fn start(self: &Arc<Self>) -> ValidatorResult<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(ValidatorError::AlreadyStarted);
        }

        {
            let mut machine = self.base_machine.lock().expect("base machine poisoned");
            BaseMachineCache::new(self.config.cache_dir()).prepare(machine.as_mut())?;
        }

        let dispatch_rx = self
            .dispatch_wake_rx
            .lock()
            .expect("engine poisoned")
            .take()
            .expect("dispatch loop receiver already taken");
        let progress_rx = self
            .progress_wake_rx
            .lock()
            .expect("engine poisoned")
            .take()
            .expect("progress loop receiver already taken");

        tokio::spawn(Arc::clone(self).dispatch_loop(dispatch_rx));
        tokio::spawn(Arc::clone(self).progress_loop(progress_rx));
        Ok(())
    }

    /// Signal shutdown. Loops exit at their next wake; running validations
    /// abandon their work at the next step-chunk boundary and release their
    /// resources. Nothing is awaited.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Register a produced block for validation.
    ///
    /// Absorbs the block's preimages, derives the delayed-message flag from
    /// the header nonces, and stores a validation entry at `pos`. A header
    /// that does not link to `prev_header` indicates a structural bug
    /// upstream: it is logged and dropped.
    pub fn submit_block(
        &self,
        header: BlockHeader,
        prev_header: &BlockHeader,
        preimages: HashMap<Hash, Vec<u8>>,
        pos: u64,
    ) {
        if header.previous_block_hash != prev_header.hash() {
            tracing::error!(
                "submit_block: header {} does not link to parent (parent_hash {}, prev {})",
                header.height,
                header.previous_block_hash,
                prev_header.hash()
            );
            return;
        }

        let has_delayed_msg = header.consumed_delayed_message(prev_header);
        let delayed_msg_nr = if has_delayed_msg { prev_header.nonce } else { 0 };

        let handles = self.preimage_cache.ingest(preimages);
        let entry = Arc::new(ValidationEntry::new(
            header,
            has_delayed_msg,
            delayed_msg_nr,
            handles,
            pos,
        ));

        let replaced = self
            .entries
            .write()
            .expect("entry table poisoned")
            .insert(pos, entry);
        if let Some(old) = replaced {
            // Positions are unique by contract; an overwrite is an upstream
            // bug. Release the displaced entry so its preimages don't leak.
            tracing::error!("duplicate validation entry at position {}", pos);
            old.release_resources(&self.preimage_cache);
        }

        self.wake_dispatcher();
    }

    /// Deliver sequencer batch bytes and the position records describing
    /// the messages inside them.
    pub fn submit_positions(
        &self,
        batches: HashMap<u64, Vec<u8>>,
        positions: Vec<PosInSequencer>,
    ) {
        for (batch_nr, bytes) in batches {
            self.batches.store(batch_nr, bytes);
        }
        {
            let mut dispatch = self.dispatch.lock().expect("dispatch state poisoned");
            dispatch.queue.extend(positions);
        }
        self.wake_dispatcher();
    }

    /// Highest block number validated so far (in order, gap-free).
    pub fn blocks_validated(&self) -> u64 {
        self.blocks_validated.load(Ordering::Acquire)
    }

    /// Wait until block `block_number` has been validated, or `timeout`
    /// elapses. Re-checks after the deadline fires so progress racing the
    /// timer is never misreported.
    pub async fn wait_for_block(&self, block_number: u64, timeout: Duration) -> bool {
        let mut events = self.progress_events.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.blocks_validated() >= block_number {
                return true;
            }
            match tokio::time::timeout_at(deadline, events.changed()).await {
                Ok(Ok(())) => {
                    if *events.borrow() >= block_number {
                        return true;
                    }
                }
                // Sender dropped or deadline hit: one final look either way.
                Ok(Err(_)) | Err(_) => return self.blocks_validated() >= block_number,
            }
        }
    }

    /// Observability snapshot.
    pub fn status(&self) -> ValidationStatus {
        let queue_depth = self
            .dispatch
            .lock()
            .expect("dispatch state poisoned")
            .queue
            .len();
        let batches_validated = self
            .progress
            .lock()
            .expect("progress state poisoned")
            .batch_validated;
        ValidationStatus {
            blocks_validated: self.blocks_validated(),
            batches_validated,
            validations_running: self.validations_running.load(Ordering::Acquire),
            queue_depth,
            entries_pending: self.entries.read().expect("entry table poisoned").len(),
            preimages_cached: self.preimage_cache.len(),
            batches_held: self.batches.len(),
        }
    }

    /// Artifact directory for this engine instance's lifetime.
    pub(super) fn launch_time(&self) -> &str {
        &self.launch_time
    }

    pub(super) fn wake_dispatcher(&self) {
        // Level-triggered: a full channel means a wake is already pending.
        let _ = self.wake_dispatch.try_send(());
    }

    pub(super) fn wake_progress_tracker(&self) {
        let _ = self.wake_progress.try_send(());
    }

    pub(super) fn record_blocks_validated(&self, blocks: u64) {
        self.blocks_validated.store(blocks, Ordering::Release);
    }

    pub(super) fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}

impl std::fmt::Debug for BlockValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockValidator")
            .field("blocks_validated", &self.blocks_validated())
            .field("concurrent_runs_limit", &self.concurrent_runs_limit)
            .finish()
    }
}
