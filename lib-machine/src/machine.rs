//! The sealed machine capability
//!
//! The engine treats the deterministic machine as an opaque external
//! capability: it clones a prepared base machine per validation, feeds it
//! inputs, steps it in bounded increments, and reads the resulting global
//! state. Everything behind these traits (WASM interpretation, native FFI,
//! snapshot encoding) belongs to the machine implementation.
//!
//! # Buffer ownership
//!
//! Inbox messages are handed over as `Arc<[u8]>` handles. The machine keeps
//! its clone of the handle for as long as it needs the bytes, so callers can
//! never free a buffer out from under a running machine, and a buffer is
//! reclaimed exactly when the last holder drops it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use crate::global_state::GlobalState;
use crate::preimages::PackedPreimages;
use crate::types::Hash;

/// Machine operation error.
#[derive(Debug, Error)]
pub enum MachineError {
    #[error("failed to load machine: {0}")]
    Load(String),

    #[error("machine step failed: {0}")]
    Step(String),

    #[error("failed to serialize machine state: {0}")]
    Serialize(String),

    #[error("failed to deserialize machine state: {0}")]
    Deserialize(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for machine operations.
pub type MachineResult<T> = Result<T, MachineError>;

/// A deterministic replay machine instance.
///
/// Given identical inputs, every implementation MUST produce identical end
/// states; the validation engine relies on this to treat any end-state
/// disagreement as fraud evidence rather than flakiness.
pub trait Machine: Send {
    /// Deep-copy this machine, inputs and position included.
    ///
    /// The base machine is never mutated after preparation; per-validation
    /// machines are produced exclusively through this call.
    fn clone_machine(&self) -> Box<dyn Machine>;

    /// Content hash of the loaded program (replay binary plus modules).
    ///
    /// Stable across processes for the same program; used to key the
    /// on-disk base-machine snapshot cache.
    fn hash(&self) -> Hash;

    fn set_global_state(&mut self, state: GlobalState);

    fn global_state(&self) -> GlobalState;

    /// Attach a sequencer batch as inbox input at `batch`.
    fn add_sequencer_inbox_message(&mut self, batch: u64, data: Arc<[u8]>);

    /// Attach a delayed (L1-originated) message at sequence number `seq`.
    fn add_delayed_inbox_message(&mut self, seq: u64, data: Arc<[u8]>);

    /// Register preimages for on-demand dereferencing during replay.
    fn add_preimages(&mut self, preimages: &PackedPreimages);

    /// Execute up to `count` instructions.
    ///
    /// Returning `Ok` with [`Machine::is_running`] still true means the
    /// budget was exhausted mid-execution; callers step again. An `Err` is
    /// a machine-level fault, never an input-dependent outcome.
    fn step(&mut self, count: u64) -> MachineResult<()>;

    fn is_running(&self) -> bool;

    /// Fast-forward a pristine machine to its first host-I/O suspension
    /// point. Used once to prepare the cached base machine.
    fn step_until_host_io(&mut self) -> MachineResult<()>;

    /// Persist the full machine state to `path`.
    fn serialize_state(&self, path: &Path) -> MachineResult<()>;

    /// Replace this machine's state with a previously serialized snapshot.
    ///
    /// Contract: on failure the machine is left unchanged, with no
    /// partial mutation. The engine depends on this to fall back to
    /// recomputation after a corrupt cache file.
    fn deserialize_and_replace_state(&mut self, path: &Path) -> MachineResult<()>;
}

/// Loader for pristine machines.
///
/// Dependency-injected into the engine so no process-global machine
/// registry is needed and multiple engines can coexist in one process.
pub trait MachineFactory: Send + Sync {
    /// Load the replay binary plus auxiliary modules into a fresh machine
    /// with empty global state and no preimages.
    fn load(&self, binary: &Path, modules: &[PathBuf]) -> MachineResult<Box<dyn Machine>>;
}
