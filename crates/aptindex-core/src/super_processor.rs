//! Super processor — the one shared stream every synced coprocessor rides.
//!
//! For each batch the super processor keeps only user transactions, opens a
//! single storage transaction, runs every admitted coprocessor in a fixed
//! order, records its own checkpoint and commits. A failure anywhere in the
//! batch drops the transaction, so no coprocessor observes a partial batch.

use std::sync::Arc;

use crate::coprocessor::{process_batch, BatchOutcome, Coprocessor};
use crate::cursor::Cursor;
use crate::error::IndexerError;
use crate::processor::{next_version_after, ProcessContext};
use crate::store::{Storage, WriteTxn};
use crate::stream::TransactionStream;
use crate::types::TransactionBatch;

/// Checkpoint key of the super processor for `chain_id`.
pub fn super_processor_name(chain_id: u64) -> String {
    format!("{chain_id}_super_processor")
}

/// Why the super stream loop returned without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamExit {
    /// The provider closed the stream.
    Ended { next_version: u64 },
}

pub struct SuperProcessor {
    chain_id: u64,
    /// Super stream's next version when the pipeline started.
    ceiling_version: u64,
    coprocessors: Vec<Arc<dyn Coprocessor>>,
}

impl SuperProcessor {
    /// `coprocessors` must already be admitted by the sync coordinator; they
    /// run in the given order for every batch.
    pub fn new(
        chain_id: u64,
        ceiling_version: u64,
        coprocessors: Vec<Arc<dyn Coprocessor>>,
    ) -> Self {
        Self {
            chain_id,
            ceiling_version,
            coprocessors,
        }
    }

    pub fn name(&self) -> String {
        super_processor_name(self.chain_id)
    }

    pub fn coprocessor_names(&self) -> Vec<String> {
        self.coprocessors.iter().map(|c| c.name()).collect()
    }

    /// Process one batch inside `txn`; returns the super processor's new
    /// next version. The caller commits.
    pub async fn process(
        &self,
        batch: &TransactionBatch,
        txn: &mut dyn WriteTxn,
    ) -> Result<u64, IndexerError> {
        let user_only = user_transactions(batch);

        for coprocessor in &self.coprocessors {
            let ctx = ProcessContext::joined(
                self.chain_id,
                self.ceiling_version,
                coprocessor.genesis_version(),
            );
            match process_batch(coprocessor.as_ref(), &user_only, &ctx, txn).await? {
                BatchOutcome::Progressed { .. } => {}
                BatchOutcome::Synced => {
                    return Err(IndexerError::Invariant(format!(
                        "'{}' reported synced on the super stream",
                        coprocessor.name()
                    )))
                }
            }
        }

        let next_version = next_version_after(batch.end_version);
        txn.set_next_version(&self.name(), next_version).await?;
        Ok(next_version)
    }

    /// Consume `stream` from `next_version` until the provider closes it.
    pub async fn run<S: Storage + ?Sized>(
        &self,
        next_version: u64,
        stream: &mut dyn TransactionStream,
        store: &S,
    ) -> Result<StreamExit, IndexerError> {
        let mut cursor = Cursor::new(self.name(), next_version);
        tracing::info!(
            consumer = %self.name(),
            from = next_version,
            coprocessors = ?self.coprocessor_names(),
            "Super stream started"
        );

        while let Some(batch) = stream.next_batch().await? {
            let Some(batch) = cursor.align(batch)? else {
                continue;
            };
            let mut txn = store.begin().await?;
            let next = self.process(&batch, txn.as_mut()).await?;
            txn.commit().await?;
            cursor.advance(next)?;

            tracing::debug!(
                start = batch.start_version,
                end = batch.end_version,
                transactions = batch.len(),
                next_version = next,
                "Super batch committed"
            );
        }

        tracing::info!(at = cursor.next_version, "Super stream ended");
        Ok(StreamExit::Ended {
            next_version: cursor.next_version,
        })
    }
}

/// Same version span as `batch`, user transactions only.
fn user_transactions(batch: &TransactionBatch) -> TransactionBatch {
    TransactionBatch {
        transactions: batch
            .transactions
            .iter()
            .filter(|t| t.is_user())
            .cloned()
            .collect(),
        start_version: batch.start_version,
        end_version: batch.end_version,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointStore;
    use crate::coprocessor::tests::{ledger_batch, ledger_tx, Pinger};
    use crate::memory::InMemoryStorage;
    use crate::stream::{MemoryLedger, StreamProvider};

    async fn setup(coprocessors: &[Arc<dyn Coprocessor>]) -> InMemoryStorage {
        let store = InMemoryStorage::new();
        for c in coprocessors {
            store.migrate(&c.tables()).await.unwrap();
        }
        store
    }

    #[test]
    fn name_is_chain_scoped() {
        assert_eq!(super_processor_name(2), "2_super_processor");
    }

    #[test]
    fn filter_keeps_span() {
        let filtered = user_transactions(&ledger_batch(10, 20));
        assert_eq!((filtered.start_version, filtered.end_version), (10, 20));
        assert_eq!(filtered.len(), 9);
    }

    #[tokio::test]
    async fn one_batch_advances_every_checkpoint_together() {
        let a: Arc<dyn Coprocessor> = Arc::new(Pinger::new("a", 0));
        let store = setup(&[a.clone()]).await;
        let sp = SuperProcessor::new(0, 1, vec![a]);

        let mut txn = store.begin().await.unwrap();
        let next = sp.process(&ledger_batch(1, 12), txn.as_mut()).await.unwrap();
        txn.commit().await.unwrap();

        assert_eq!(next, 13);
        assert_eq!(store.next_version("0_super_processor").await.unwrap(), Some(13));
        assert_eq!(store.next_version("a").await.unwrap(), Some(13));
        assert_eq!(store.rows("pings").await.len(), 11);
    }

    #[tokio::test]
    async fn run_follows_the_stream_to_its_end() {
        let late: Arc<dyn Coprocessor> = Arc::new(Pinger::new("late", 25));
        let store = setup(&[late.clone()]).await;
        let ledger = MemoryLedger::new((1..=49).map(ledger_tx).collect(), 10);
        let sp = SuperProcessor::new(0, 1, vec![late]);

        let mut stream = ledger.open(1).await.unwrap();
        let exit = sp.run(1, stream.as_mut(), &store).await.unwrap();

        assert_eq!(exit, StreamExit::Ended { next_version: 50 });
        assert_eq!(store.next_version("late").await.unwrap(), Some(50));
        // only batches ending at or after genesis are dispatched: 21..=49
        let rows = store.rows("pings").await;
        assert!(rows.iter().all(|r| r.int("version").unwrap_or(0) >= 21));
        assert_eq!(rows.len(), 27);
    }
}
