//! Sequencer position records

use serde::{Deserialize, Serialize};

/// Where a message sits in the sequencer stream, and where the stream
/// stands after executing it.
///
/// `pos` is the dense, monotonically increasing index over all L2 messages
/// and is the engine's primary sequencing key. A block occupies a
/// contiguous run of records; the record whose `pos` equals the block's
/// entry position is the block's end marker, and its `batch_after` /
/// `pos_after` name the expected stream position once the block has fully
/// executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PosInSequencer {
    /// Dense global message index
    pub pos: u64,
    /// Sequencer batch the message starts in
    pub batch: u64,
    /// Offset of the message within that batch
    pub pos_in_batch: u64,
    /// Batch number after executing this message
    pub batch_after: u64,
    /// Offset within `batch_after` after executing this message
    pub pos_after: u64,
}

/// Index of the first record with `pos >= target`.
///
/// Deliberately a linear scan: the queue is kept small and near-sorted, and
/// lookups target positions close to the head, so an ordered walk beats any
/// balanced structure at this size.
pub fn lower_bound(records: &[PosInSequencer], target: u64) -> usize {
    let mut idx = 0;
    while idx < records.len() && records[idx].pos < target {
        idx += 1;
    }
    idx
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(pos: u64) -> PosInSequencer {
        PosInSequencer {
            pos,
            batch: pos,
            pos_in_batch: 0,
            batch_after: pos + 1,
            pos_after: 0,
        }
    }

    #[test]
    fn test_lower_bound_finds_first_at_or_after() {
        let records = vec![rec(2), rec(3), rec(5)];
        assert_eq!(lower_bound(&records, 0), 0);
        assert_eq!(lower_bound(&records, 2), 0);
        assert_eq!(lower_bound(&records, 3), 1);
        assert_eq!(lower_bound(&records, 4), 2);
        assert_eq!(lower_bound(&records, 5), 2);
        assert_eq!(lower_bound(&records, 6), 3);
    }

    #[test]
    fn test_lower_bound_empty() {
        assert_eq!(lower_bound(&[], 10), 0);
    }
}
