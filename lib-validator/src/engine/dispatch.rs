//! Dispatcher: starts validations strictly in position order
//!
//! Single consumer of the dispatch wake channel. On every wake it sorts the
//! pending position records, drops the ones already dispatched, and hands
//! out validations while three gates hold simultaneously:
//!
//! 1. fewer than `concurrent_runs_limit` validations are running,
//! 2. the queue head is exactly `pos_next_send` (no gaps skipped),
//! 3. the entry table has the block ending at `pos_next_send`.
//!
//! A block occupies a contiguous run of records starting at the queue
//! head; the record whose `pos` equals the entry's position is the block's
//! end marker. Both the start and end records travel to the validation
//! task, which needs the start for the machine's initial state and the end
//! for the expected post-state.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::types::pos::lower_bound;

use super::BlockValidator;

impl BlockValidator {
    pub(super) async fn dispatch_loop(self: Arc<Self>, mut wake: mpsc::Receiver<()>) {
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
                        Some(()) => self.send_validations(),
                        None => return,
                    }
                }
            }
        }
    }

    /// One dispatch pass. Holds the dispatch mutex throughout; the loop
    /// body only reads the entry table and counters, so the critical
    /// section stays short.
    pub(super) fn send_validations(self: &Arc<Self>) {
        let mut dispatch = self.dispatch.lock().expect("dispatch state poisoned");
        dispatch.queue.sort_by_key(|record| record.pos);

        // Records below pos_next_send belong to already-dispatched blocks.
        let stale = lower_bound(&dispatch.queue, dispatch.pos_next_send);
        dispatch.queue.drain(..stale);

        loop {
            if self.validations_running.load(Ordering::Acquire) >= self.concurrent_runs_limit {
                return;
            }
            let Some(start) = dispatch.queue.first().copied() else {
                return;
            };
            if start.pos != dispatch.pos_next_send {
                return;
            }
            let entry = {
                let entries = self.entries.read().expect("entry table poisoned");
                entries.get(&dispatch.pos_next_send).cloned()
            };
            let Some(entry) = entry else {
                return;
            };

            // Find the block's end marker: the record matching the entry's
            // own position.
            let end_idx = lower_bound(&dispatch.queue, entry.pos);
            if end_idx >= dispatch.queue.len() || dispatch.queue[end_idx].pos != entry.pos {
                return;
            }
            // Positions are unique across records by contract.
            debug_assert!(
                end_idx + 1 >= dispatch.queue.len()
                    || dispatch.queue[end_idx + 1].pos != entry.pos,
                "duplicate position record at {}",
                entry.pos
            );
            let end = dispatch.queue[end_idx];

            self.validations_running.fetch_add(1, Ordering::AcqRel);
            let validator = Arc::clone(self);
            tokio::spawn(async move {
                validator.run_validation(entry, start, end).await;
            });

            dispatch.pos_next_send = end.pos + 1;
            dispatch.queue.drain(..=end_idx);
        }
    }
}
