//! Sequencer batch buffer store
//!
//! Owns the raw bytes of every sequencer batch still referenced by a
//! pending or running validation. Bytes are copied in once on `store` and
//! handed out as `Arc<[u8]>` views, so a view can never outlive its buffer;
//! `evict` merely drops the store's handle and the allocation is freed when
//! the last machine holding it finishes.
//!
//! Eviction is performed only by the progress tracker, after every
//! validation whose block starts in the batch has completed.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Concurrent batch-number → owned-bytes store.
#[derive(Default)]
pub struct SequencerBatchStore {
    batches: RwLock<HashMap<u64, Arc<[u8]>>>,
}

impl SequencerBatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy `bytes` into stable storage under `batch`.
    ///
    /// Re-storing an existing batch replaces the buffer; in-flight views of
    /// the old buffer stay valid.
    pub fn store(&self, batch: u64, bytes: Vec<u8>) {
        let mut batches = self.batches.write().expect("batch store poisoned");
        if batches.insert(batch, bytes.into()).is_some() {
            tracing::warn!("sequencer batch {} stored twice", batch);
        }
    }

    /// Read-only view of a stored batch.
    pub fn view(&self, batch: u64) -> Option<Arc<[u8]>> {
        self.batches
            .read()
            .expect("batch store poisoned")
            .get(&batch)
            .cloned()
    }

    /// Drop the store's handle on `batch`. Returns false if it was absent.
    pub fn evict(&self, batch: u64) -> bool {
        self.batches
            .write()
            .expect("batch store poisoned")
            .remove(&batch)
            .is_some()
    }

    /// Number of batches currently held.
    pub fn len(&self) -> usize {
        self.batches.read().expect("batch store poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_and_view() {
        let store = SequencerBatchStore::new();
        store.store(3, vec![1, 2, 3]);

        let view = store.view(3).unwrap();
        assert_eq!(view.as_ref(), &[1, 2, 3]);
        assert!(store.view(4).is_none());
    }

    #[test]
    fn test_view_survives_eviction() {
        let store = SequencerBatchStore::new();
        store.store(0, vec![9; 16]);

        let view = store.view(0).unwrap();
        assert!(store.evict(0));
        assert!(store.view(0).is_none());
        // The held view still reads the stored bytes.
        assert_eq!(view.len(), 16);
        assert!(view.iter().all(|b| *b == 9));
    }

    #[test]
    fn test_evict_missing_reports_false() {
        let store = SequencerBatchStore::new();
        assert!(!store.evict(42));
    }
}
