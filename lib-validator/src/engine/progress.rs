//! Progress tracker: publishes validated blocks in order, reclaims behind
//!
//! Single consumer of the progress wake channel, serialized by the
//! progress mutex. Validations may complete out of block order; this loop
//! is what turns them into a strictly increasing, gap-free
//! `blocks_validated` counter.
//!
//! For every entry consumed it also evicts the sequencer batches the chain
//! has fully moved past: batches in `[batch_validated, entry.seq_msg_nr)`
//! can no longer be referenced by any pending validation, because dispatch
//! is in position order and every earlier block has already completed.

use std::sync::Arc;

use tokio::sync::mpsc;

use super::BlockValidator;

impl BlockValidator {
    pub(super) async fn progress_loop(self: Arc<Self>, mut wake: mpsc::Receiver<()>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
                wakeup = wake.recv() => {
                    match wakeup {
                        Some(()) => self.advance_progress(),
                        None => return,
                    }
                }
            }
        }
    }

    /// Consume every contiguous valid entry starting at `pos_next`.
    pub(super) fn advance_progress(&self) {
        let mut progress = self.progress.lock().expect("progress state poisoned");
        loop {
            let entry = {
                let entries = self.entries.read().expect("entry table poisoned");
                entries.get(&progress.pos_next).cloned()
            };
            let Some(entry) = entry else {
                return;
            };
            if !entry.is_valid() {
                return;
            }
            // Positions and block numbers must advance in lockstep; a skew
            // means the streamer and the position feed disagree.
            if entry.block_number != progress.blocks_validated + 1 {
                tracing::error!(
                    "validation entry at pos {} has block number {}, expected {}",
                    progress.pos_next,
                    entry.block_number,
                    progress.blocks_validated + 1
                );
                return;
            }

            self.entries
                .write()
                .expect("entry table poisoned")
                .remove(&progress.pos_next);

            let seq_msg_nr = entry.seq_msg_nr();
            for batch in progress.batch_validated..seq_msg_nr {
                if !self.batches.evict(batch) {
                    tracing::warn!("sequencer batch {} already missing on eviction", batch);
                }
            }
            if seq_msg_nr > progress.batch_validated {
                progress.batch_validated = seq_msg_nr;
            }

            progress.pos_next = entry.pos + 1;
            progress.blocks_validated = entry.block_number;
            self.record_blocks_validated(progress.blocks_validated);
            // watch publish is non-blocking, latest-wins; slow readers only
            // ever miss intermediate values, never the newest.
            self.progress_events.send_replace(progress.blocks_validated);
        }
    }
}
