//! Upstream transaction stream contract.
//!
//! A provider opens an ordered, unbounded sequence of batches starting at a
//! requested version. Retry and backoff inside the stream belong to the
//! provider; the pipeline only consumes it.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::IndexerError;
use crate::types::{Transaction, TransactionBatch};

/// An open stream of transaction batches.
#[async_trait]
pub trait TransactionStream: Send {
    /// The next batch, or `None` once the provider closes the stream.
    async fn next_batch(&mut self) -> Result<Option<TransactionBatch>, IndexerError>;
}

/// Opens streams at a given starting version.
#[async_trait]
pub trait StreamProvider: Send + Sync {
    async fn open(&self, starting_version: u64)
        -> Result<Box<dyn TransactionStream>, IndexerError>;
}

// ─── In-memory ledger ────────────────────────────────────────────────────────

/// A fixed, in-memory ledger served in contiguous batches.
///
/// The stream closes after the last transaction. Useful for tests and
/// replaying captured history.
#[derive(Clone)]
pub struct MemoryLedger {
    transactions: Arc<Vec<Transaction>>,
    batch_size: usize,
}

impl MemoryLedger {
    /// `transactions` must be sorted by version.
    pub fn new(transactions: Vec<Transaction>, batch_size: usize) -> Self {
        Self {
            transactions: Arc::new(transactions),
            batch_size: batch_size.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }
}

#[async_trait]
impl StreamProvider for MemoryLedger {
    async fn open(
        &self,
        starting_version: u64,
    ) -> Result<Box<dyn TransactionStream>, IndexerError> {
        let position = self
            .transactions
            .partition_point(|t| t.version < starting_version);
        Ok(Box::new(MemoryStream {
            transactions: self.transactions.clone(),
            position,
            batch_size: self.batch_size,
        }))
    }
}

struct MemoryStream {
    transactions: Arc<Vec<Transaction>>,
    position: usize,
    batch_size: usize,
}

#[async_trait]
impl TransactionStream for MemoryStream {
    async fn next_batch(&mut self) -> Result<Option<TransactionBatch>, IndexerError> {
        let end = (self.position + self.batch_size).min(self.transactions.len());
        let chunk = self.transactions[self.position..end].to_vec();
        self.position = end;
        Ok(TransactionBatch::from_transactions(chunk))
    }
}
