//! Reproduction artifacts
//!
//! When a validation fails, or when a block was explicitly requested for
//! recording, the engine emits a self-contained directory reproducing the
//! exact machine input: the raw sequencer batch, the packed preimages, the
//! delayed message (if any), and an executable `run-prover.sh` that invokes
//! the external prover with exactly the flags matching those inputs.
//!
//! Layout, under `<root>/<output>/<launch-time>/`:
//!
//! ```text
//! block_<n>/
//!   run-prover.sh            invokes the prover; supports -r <rootpath>
//!   sequencer_<seq>.bin      raw sequencer batch bytes
//!   preimages.bin            length-prefixed preimages, machine order
//!   delayed_<nr>.bin         raw delayed-message bytes (when present)
//! ```
//!
//! Artifact emission is best-effort: I/O failures are logged by the caller
//! and never change the validation outcome.

use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use lib_machine::{Hash, PackedPreimages};

use crate::config::BlockValidatorConfig;
use crate::types::PosInSequencer;

/// Everything needed to reproduce one validation run on disk.
pub struct ReproductionArtifact<'a> {
    pub block_number: u64,
    pub block_hash: Hash,
    pub prev_block_hash: Hash,
    /// Sequencer batch the block starts in
    pub seq_msg_nr: u64,
    /// Start record, naming the position within the first batch
    pub start: PosInSequencer,
    /// End record, naming the expected post-state position
    pub end: PosInSequencer,
    pub preimages: &'a PackedPreimages,
    pub sequencer_batch: &'a [u8],
    /// `(sequence number, bytes)` when the block consumed a delayed message
    pub delayed: Option<(u64, &'a [u8])>,
}

impl ReproductionArtifact<'_> {
    /// Write the artifact directory; returns its path.
    pub fn write(
        &self,
        config: &BlockValidatorConfig,
        launch_time: &str,
    ) -> std::io::Result<PathBuf> {
        let out_dir = config
            .output_dir()
            .join(launch_time)
            .join(format!("block_{}", self.block_number));
        fs::create_dir_all(&out_dir)?;

        let sequencer_file = format!("sequencer_{}.bin", self.seq_msg_nr);
        fs::write(out_dir.join(&sequencer_file), self.sequencer_batch)?;
        fs::write(out_dir.join("preimages.bin"), self.preimages.as_bytes())?;

        let mut delayed_args = String::new();
        if let Some((delayed_nr, delayed_bytes)) = self.delayed {
            let delayed_file = format!("delayed_{}.bin", delayed_nr);
            fs::write(out_dir.join(&delayed_file), delayed_bytes)?;
            delayed_args = format!(
                " --delayed-inbox-position {} --delayed-inbox {}",
                delayed_nr, delayed_file
            );
        }

        let mut module_args = String::new();
        for module in &config.module_paths {
            module_args.push_str(&format!(" -l ${{ROOTPATH}}/{}", module.display()));
        }

        let script = format!(
            "#!/bin/bash\n\
             # expected output: batch {batch_after}, position {pos_after}, hash {block_hash}\n\
             ROOTPATH=\"{root}\"\n\
             if (( $# > 1 )); then\n\
             \tif [[ $1 == \"-r\" ]]; then\n\
             \t\tROOTPATH=$2\n\
             \t\tshift\n\
             \t\tshift\n\
             \tfi\n\
             fi\n\
             ${{ROOTPATH}}/bin/prover ${{ROOTPATH}}/{prover_bin}{module_args} \
             --inbox-position {seq} --position-within-message {pos_in_batch} \
             --last-block-hash {prev_hash} --inbox {sequencer_file} \
             --preimages preimages.bin{delayed_args} \"$@\"\n",
            batch_after = self.end.batch_after,
            pos_after = self.end.pos_after,
            block_hash = self.block_hash,
            root = config.root_display(),
            prover_bin = config.prover_bin_path.display(),
            module_args = module_args,
            seq = self.seq_msg_nr,
            pos_in_batch = self.start.pos_in_batch,
            prev_hash = self.prev_block_hash,
            sequencer_file = sequencer_file,
            delayed_args = delayed_args,
        );

        let script_path = out_dir.join("run-prover.sh");
        let mut file = fs::File::create(&script_path)?;
        file.write_all(script.as_bytes())?;
        file.set_permissions(fs::Permissions::from_mode(0o777))?;

        Ok(out_dir)
    }
}
