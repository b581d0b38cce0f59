//! Version cursor — tracks a consumer's position in the ledger.

use serde::{Deserialize, Serialize};

use crate::error::IndexerError;
use crate::types::TransactionBatch;

/// The next version a consumer expects from its stream.
///
/// The cursor knows:
/// - Which version must come next (the consumer's checkpoint)
/// - How to drop transactions that were already committed (replays)
/// - That a batch starting beyond the expected version is a gap
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub consumer_name: String,
    pub next_version: u64,
}

impl Cursor {
    pub fn new(consumer_name: impl Into<String>, next_version: u64) -> Self {
        Self {
            consumer_name: consumer_name.into(),
            next_version,
        }
    }

    /// Fit an incoming batch to the cursor.
    ///
    /// Returns `None` when the whole batch is already behind the cursor, a
    /// trimmed batch when it overlaps, and `VersionGap` when it skips ahead.
    pub fn align(&self, mut batch: TransactionBatch) -> Result<Option<TransactionBatch>, IndexerError> {
        if batch.end_version < self.next_version {
            tracing::debug!(
                consumer = %self.consumer_name,
                start = batch.start_version,
                end = batch.end_version,
                next_version = self.next_version,
                "skipping already processed batch"
            );
            return Ok(None);
        }
        if batch.start_version > self.next_version {
            return Err(IndexerError::VersionGap {
                consumer: self.consumer_name.clone(),
                expected: self.next_version,
                actual: batch.start_version,
            });
        }
        if batch.start_version < self.next_version {
            let next = self.next_version;
            batch.transactions.retain(|t| t.version >= next);
            batch.start_version = next;
        }
        Ok(Some(batch))
    }

    /// Move the cursor after a committed batch.
    pub fn advance(&mut self, next_version: u64) -> Result<(), IndexerError> {
        crate::checkpoint::ensure_monotonic(&self.consumer_name, Some(self.next_version), next_version)?;
        self.next_version = next_version;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coprocessor::tests::ledger_batch;

    #[test]
    fn exact_batch_passes() {
        let cursor = Cursor::new("c", 10);
        let batch = cursor.align(ledger_batch(10, 19)).unwrap().unwrap();
        assert_eq!(batch.start_version, 10);
        assert_eq!(batch.len(), 10);
    }

    #[test]
    fn replayed_batch_is_dropped() {
        let cursor = Cursor::new("c", 50);
        assert!(cursor.align(ledger_batch(10, 49)).unwrap().is_none());
    }

    #[test]
    fn overlapping_batch_is_trimmed() {
        let cursor = Cursor::new("c", 15);
        let batch = cursor.align(ledger_batch(10, 19)).unwrap().unwrap();
        assert_eq!(batch.start_version, 15);
        assert_eq!(batch.transactions.first().map(|t| t.version), Some(15));
        assert_eq!(batch.end_version, 19);
    }

    #[test]
    fn gap_is_an_error() {
        let cursor = Cursor::new("c", 10);
        let err = cursor.align(ledger_batch(12, 19)).unwrap_err();
        assert!(matches!(
            err,
            IndexerError::VersionGap {
                expected: 10,
                actual: 12,
                ..
            }
        ));
    }

    #[test]
    fn advance_is_monotonic() {
        let mut cursor = Cursor::new("c", 10);
        cursor.advance(20).unwrap();
        assert_eq!(cursor.next_version, 20);
        assert!(cursor.advance(19).is_err());
    }
}
