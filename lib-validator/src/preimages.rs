//! Reference-counted preimage cache
//!
//! Blocks arrive with the preimages their replay will dereference. Many
//! in-flight validations can share the same preimage bytes, so the cache
//! stores one copy per hash and reference-counts it; an entry is evicted
//! when the last validation referencing it releases its handles.
//!
//! # Invariants
//!
//! - refcount > 0 while any live validation entry still lists the hash
//! - bytes are owned by the cache; packed buffers copy them out, so a pack
//!   never dangles after eviction

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use lib_machine::{Hash, PackedPreimages};

use crate::{ValidatorError, ValidatorResult};

struct PreimageRecord {
    bytes: Arc<[u8]>,
    refs: AtomicUsize,
}

/// Concurrent hash → bytes store with per-entry reference counts.
#[derive(Default)]
pub struct PreimageCache {
    entries: RwLock<HashMap<Hash, PreimageRecord>>,
}

impl PreimageCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Absorb a block's preimages: insert missing entries, take one
    /// reference on every supplied hash, and return the hashes in the
    /// order later used for packing.
    ///
    /// The returned order is sorted so that identical preimage sets always
    /// pack, and therefore reproduce in artifacts, identically.
    pub fn ingest(&self, preimages: HashMap<Hash, Vec<u8>>) -> Vec<Hash> {
        let mut hashes: Vec<Hash> = preimages.keys().copied().collect();
        hashes.sort();

        let mut entries = self.entries.write().expect("preimage cache poisoned");
        for (hash, bytes) in preimages {
            match entries.get(&hash) {
                Some(record) => {
                    record.refs.fetch_add(1, Ordering::AcqRel);
                }
                None => {
                    entries.insert(
                        hash,
                        PreimageRecord {
                            bytes: bytes.into(),
                            refs: AtomicUsize::new(1),
                        },
                    );
                }
            }
        }
        hashes
    }

    /// Build the machine-consumable packed buffer for `hashes`, in order.
    ///
    /// Fails if any hash is unknown: packing happens while the owning
    /// validation entry still holds its references, so a miss is a
    /// lifecycle bug, not a race.
    pub fn pack(&self, hashes: &[Hash]) -> ValidatorResult<PackedPreimages> {
        let entries = self.entries.read().expect("preimage cache poisoned");
        let mut parts: Vec<Arc<[u8]>> = Vec::with_capacity(hashes.len());
        for hash in hashes {
            let record = entries
                .get(hash)
                .ok_or(ValidatorError::UnknownPreimage(*hash))?;
            parts.push(Arc::clone(&record.bytes));
        }
        drop(entries);
        Ok(PackedPreimages::pack(parts.iter().map(|p| p.as_ref())))
    }

    /// Drop one reference per hash; entries reaching zero are evicted and
    /// their storage freed.
    ///
    /// A missing hash is reported and skipped; the remaining releases
    /// still proceed.
    pub fn release(&self, hashes: &[Hash]) {
        let mut entries = self.entries.write().expect("preimage cache poisoned");
        for hash in hashes {
            match entries.get(hash) {
                Some(record) => {
                    if record.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
                        entries.remove(hash);
                    }
                }
                None => {
                    tracing::error!("released preimage not present in cache: {}", hash);
                }
            }
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.read().expect("preimage cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current reference count for `hash`, if present.
    pub fn ref_count(&self, hash: &Hash) -> Option<usize> {
        self.entries
            .read()
            .expect("preimage cache poisoned")
            .get(hash)
            .map(|r| r.refs.load(Ordering::Acquire))
    }
}
