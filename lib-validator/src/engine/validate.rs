//! Validation task: run one machine to completion and judge the result
//!
//! Each task exclusively owns a clone of the base machine. Execution is
//! chunked: between chunks the task observes the shutdown signal and yields
//! to the runtime, so cancellation latency is bounded by one chunk.
//!
//! Outcome handling:
//! - end state matches the claim: release resources, mark valid, re-signal
//!   the progress tracker and the dispatcher;
//! - end state mismatch: write the reproduction artifact, log the
//!   expected/actual tuples, then abort the process (fraud or machine
//!   nondeterminism; silent continuation would hide either). The abort is
//!   gated by `fatal_on_mismatch` for embedders that prefer a visible
//!   stall;
//! - machine step error: abort unconditionally. Replay is deterministic,
//!   so a step error is a real bug, not an input problem;
//! - cancellation: release resources and return without recording
//!   progress.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use lib_machine::GlobalState;

use crate::artifact::ReproductionArtifact;
use crate::entry::ValidationEntry;
use crate::types::PosInSequencer;

use super::BlockValidator;

impl BlockValidator {
    pub(super) async fn run_validation(
        self: Arc<Self>,
        entry: Arc<ValidationEntry>,
        start: PosInSequencer,
        end: PosInSequencer,
    ) {
        tracing::info!(
            "starting validation for block {} (pos {} to {})",
            entry.block_number,
            start.pos,
            end.pos
        );

        if entry.pos != end.pos {
            tracing::error!(
                "validation got inconsistent records: entry pos {}, end pos {}",
                entry.pos,
                end.pos
            );
            self.abandon(&entry);
            return;
        }

        let packed = match self.preimage_cache.pack(&entry.preimage_handles()) {
            Ok(packed) => packed,
            Err(err) => {
                tracing::error!("failed to pack preimages for block {}: {}", entry.block_number, err);
                self.abandon(&entry);
                return;
            }
        };

        entry.set_seq_msg_nr(start.batch);
        entry.mark_running();
        let gs_start = GlobalState::new(start.batch, start.pos_in_batch, entry.prev_block_hash);

        let Some(sequencer_batch) = self.batches.view(start.batch) else {
            // The progress tracker will stall at this position, surfacing
            // the missing batch as non-progress.
            tracing::error!(
                "sequencer batch {} missing for block {} (pos {})",
                start.batch,
                entry.block_number,
                start.pos
            );
            self.abandon(&entry);
            return;
        };

        let mut machine = {
            let base = self.base_machine.lock().expect("base machine poisoned");
            base.clone_machine()
        };
        machine.add_preimages(&packed);
        machine.set_global_state(gs_start);
        machine.add_sequencer_inbox_message(start.batch, Arc::clone(&sequencer_batch));

        let mut delayed: Option<(u64, Arc<[u8]>)> = None;
        if entry.has_delayed_msg {
            match self.inbox.delayed_message_bytes(entry.delayed_msg_nr).await {
                Ok(bytes) => {
                    let buffer: Arc<[u8]> = bytes.into();
                    entry.attach_buffer(Arc::clone(&buffer));
                    machine.add_delayed_inbox_message(entry.delayed_msg_nr, Arc::clone(&buffer));
                    delayed = Some((entry.delayed_msg_nr, buffer));
                }
                Err(err) => {
                    tracing::error!(
                        "failed to read delayed message {} for block {}: {}",
                        entry.delayed_msg_nr,
                        entry.block_number,
                        err
                    );
                    self.abandon(&entry);
                    return;
                }
            }
        }

        let mut steps = 0u64;
        while machine.is_running() {
            if self.is_shutting_down() {
                tracing::debug!(
                    "validation of block {} cancelled after {} steps",
                    entry.block_number,
                    steps
                );
                self.abandon(&entry);
                return;
            }
            if let Err(err) = machine.step(self.config.step_chunk) {
                tracing::error!(
                    "machine step failed while validating block {}: {}",
                    entry.block_number,
                    err
                );
                std::process::abort();
            }
            steps += self.config.step_chunk;
            tracing::debug!("block {} validation at {} steps", entry.block_number, steps);
            // Chunk boundary: the only suspension point during execution.
            tokio::task::yield_now().await;
        }

        let gs_end = machine.global_state();
        drop(machine);

        let result_valid = gs_end.batch == end.batch_after
            && gs_end.pos_in_batch == end.pos_after
            && gs_end.block_hash == entry.block_hash;

        let write_this_block = !result_valid || self.config.should_record(entry.block_number);
        if write_this_block {
            let artifact = ReproductionArtifact {
                block_number: entry.block_number,
                block_hash: entry.block_hash,
                prev_block_hash: entry.prev_block_hash,
                seq_msg_nr: entry.seq_msg_nr(),
                start,
                end,
                preimages: &packed,
                sequencer_batch: &sequencer_batch,
                delayed: delayed.as_ref().map(|(nr, bytes)| (*nr, bytes.as_ref())),
            };
            match artifact.write(&self.config, self.launch_time()) {
                Ok(dir) => {
                    tracing::info!(
                        "wrote reproduction artifact for block {} at {}",
                        entry.block_number,
                        dir.display()
                    );
                }
                Err(err) => {
                    // Best-effort: artifact failures never change the
                    // validation outcome.
                    tracing::error!(
                        "failed to write artifact for block {}: {}",
                        entry.block_number,
                        err
                    );
                }
            }
        }

        if !result_valid {
            tracing::error!(
                "validation failed for block {}: batch expected {} actual {}, pos expected {} actual {}, hash expected {} actual {}",
                entry.block_number,
                end.batch_after,
                gs_end.batch,
                end.pos_after,
                gs_end.pos_in_batch,
                entry.block_hash,
                gs_end.block_hash
            );
            tracing::error!(
                "validation failed for block {}: claimed header {:?}",
                entry.block_number,
                entry.header
            );
            entry.release_resources(&self.preimage_cache);
            if self.config.fatal_on_mismatch {
                tracing::error!("aborting: block validation mismatch is fraud evidence");
                std::process::abort();
            }
            // Leave the entry invalid: progress stalls at this position,
            // which is the observable signal in non-fatal mode.
            self.validations_running.fetch_sub(1, Ordering::AcqRel);
            self.wake_dispatcher();
            return;
        }

        entry.release_resources(&self.preimage_cache);
        self.validations_running.fetch_sub(1, Ordering::AcqRel);
        // Only now may the progress tracker reclaim the entry.
        entry.mark_valid();
        tracing::info!("validation succeeded for block {}", entry.block_number);
        self.wake_progress_tracker();
        self.wake_dispatcher();
    }

    /// Tear down a validation that cannot proceed: release the entry's
    /// resources and free the concurrency slot.
    fn abandon(&self, entry: &ValidationEntry) {
        entry.release_resources(&self.preimage_cache);
        self.validations_running.fetch_sub(1, Ordering::AcqRel);
        self.wake_dispatcher();
    }
}
