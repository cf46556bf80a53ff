//! Block-Validation Engine
//!
//! Independent re-execution of rollup blocks inside a sandboxed
//! deterministic machine. For every block delivered by the chain streamer
//! the engine clones a prewarmed base machine, replays the block's
//! sequencer messages (and delayed message, if any), and compares the
//! machine's end state against the block's claimed post-state. A mismatch
//! is fraud evidence: the engine emits a self-contained reproduction
//! artifact and halts.
//!
//! The engine is an owned value with no process-global registry. Collaborators
//! (machine loader, inbox tracker, chain streamer) are dependency-injected
//! at construction.

pub mod artifact;
pub mod base_machine;
pub mod batches;
pub mod config;
pub mod engine;
pub mod entry;
pub mod preimages;
pub mod testing;
pub mod types;

pub use config::BlockValidatorConfig;
pub use engine::{
    BlockValidator, BlockValidatorRegistrar, DelayedMessageReader, ValidationStatus,
};
pub use entry::ValidationEntry;
pub use preimages::PreimageCache;
pub use types::{BlockHeader, PosInSequencer};

use lib_machine::{Hash, MachineError};

/// Result type alias for validator operations
pub type ValidatorResult<T> = Result<T, ValidatorError>;

/// Validator error types
#[derive(Debug, thiserror::Error)]
pub enum ValidatorError {
    #[error("machine error: {0}")]
    Machine(#[from] MachineError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("preimage not present in cache: {0}")]
    UnknownPreimage(Hash),

    #[error("validator already started")]
    AlreadyStarted,

    #[error("collaborator error: {0}")]
    Collaborator(#[from] anyhow::Error),
}
