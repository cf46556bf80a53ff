//! Engine configuration

use std::path::{Path, PathBuf};

/// Configuration for the block validator
#[derive(Debug, Clone)]
pub struct BlockValidatorConfig {
    /// Root directory prepended to every other path
    pub root_path: PathBuf,
    /// Replay binary the machine executes, relative to `root_path`
    pub prover_bin_path: PathBuf,
    /// Auxiliary modules loaded alongside the replay binary, relative to `root_path`
    pub module_paths: Vec<PathBuf>,
    /// Directory for reproduction artifacts, relative to `root_path`
    pub output_path: PathBuf,
    /// Directory for the prewarmed base-machine snapshot, relative to `root_path`
    pub initial_machine_cache_path: PathBuf,
    /// Maximum concurrent machine instances (0 = available parallelism)
    pub concurrent_runs_limit: usize,
    /// Block numbers whose artifacts are emitted even when valid (kept sorted)
    pub blocks_to_record: Vec<u64>,
    /// Machine instructions executed per step chunk; cancellation is
    /// observed between chunks
    pub step_chunk: u64,
    /// Abort the process on an end-state mismatch (default). Disabling
    /// leaves the mismatching entry invalid so progress stalls observably
    /// instead of killing the host; intended for embedding in tests.
    pub fatal_on_mismatch: bool,
}

impl Default for BlockValidatorConfig {
    fn default() -> Self {
        Self {
            root_path: PathBuf::from("./machine/target/env"),
            prover_bin_path: PathBuf::from("lib/replay.wasm"),
            module_paths: vec![
                PathBuf::from("lib/wasi_stub.wasm"),
                PathBuf::from("lib/soft-float.wasm"),
                PathBuf::from("lib/go_stub.wasm"),
                PathBuf::from("lib/host_io.wasm"),
            ],
            output_path: PathBuf::from("output"),
            initial_machine_cache_path: PathBuf::from("initial-machine-cache"),
            concurrent_runs_limit: 0,
            blocks_to_record: Vec::new(),
            step_chunk: 100_000_000,
            fatal_on_mismatch: true,
        }
    }
}

impl BlockValidatorConfig {
    /// Absolute path of the replay binary.
    pub fn prover_binary(&self) -> PathBuf {
        self.root_path.join(&self.prover_bin_path)
    }

    /// Absolute paths of the auxiliary modules, in load order.
    pub fn module_list(&self) -> Vec<PathBuf> {
        self.module_paths
            .iter()
            .map(|m| self.root_path.join(m))
            .collect()
    }

    /// Directory holding the content-addressed base-machine snapshots.
    pub fn cache_dir(&self) -> PathBuf {
        self.root_path.join(&self.initial_machine_cache_path)
    }

    /// Directory under which reproduction artifacts are emitted.
    pub fn output_dir(&self) -> PathBuf {
        self.root_path.join(&self.output_path)
    }

    /// Concurrency limit with the 0 = processor-count default applied.
    pub fn effective_concurrency(&self) -> usize {
        if self.concurrent_runs_limit > 0 {
            self.concurrent_runs_limit
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }

    /// Whether `block_number` was explicitly requested for recording.
    ///
    /// Linear scan over the sorted list; the list is expected to stay tiny.
    pub fn should_record(&self, block_number: u64) -> bool {
        for nr in &self.blocks_to_record {
            if *nr > block_number {
                break;
            }
            if *nr == block_number {
                return true;
            }
        }
        false
    }

    /// Root path as a display-safe string for embedding into shell scripts.
    pub fn root_display(&self) -> String {
        Path::new(&self.root_path).display().to_string()
    }
}
