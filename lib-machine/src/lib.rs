//! Deterministic Machine Interface
//!
//! The validation engine re-executes blocks inside a sandboxed deterministic
//! machine loaded from an opaque replay binary. This crate defines the sealed
//! capability the engine programs against: the [`Machine`] trait (clone,
//! feed inputs, step, inspect global state, snapshot to disk), the
//! [`MachineFactory`] loader, the [`GlobalState`] triple, and the
//! length-prefixed [`PackedPreimages`] framing the machine consumes.
//!
//! Nothing in this crate executes anything. Concrete machines live behind
//! FFI in their own crate; tests use the scripted double provided by the
//! engine crate.

pub mod global_state;
pub mod machine;
pub mod preimages;
pub mod types;

pub use global_state::GlobalState;
pub use machine::{Machine, MachineError, MachineFactory, MachineResult};
pub use preimages::PackedPreimages;
pub use types::{blake3_hash, blake3_hash_multiple, Hash};
