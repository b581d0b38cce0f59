//! Catch-up worker — replays one coprocessor from its own checkpoint.
//!
//! The worker opens an independent stream at the coprocessor's next version
//! and feeds it batch by batch, one storage transaction per batch, until the
//! coprocessor reaches the super stream's ceiling.

use crate::coprocessor::{process_batch, BatchOutcome, Coprocessor};
use crate::cursor::Cursor;
use crate::error::IndexerError;
use crate::processor::{catch_up_position, CatchUpPosition, ProcessContext};
use crate::store::Storage;
use crate::stream::StreamProvider;

/// Final state of a finished catch-up run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatchUpReport {
    pub from_version: u64,
    /// Always equal to the ceiling.
    pub to_version: u64,
    pub batches: u64,
    pub handled: usize,
}

/// Drive `coprocessor` from `from_version` up to `ctx.ceiling_version`.
///
/// Each batch commits its rows and the coprocessor checkpoint together. A
/// failing batch leaves the checkpoint at the last committed batch.
pub async fn run_catch_up<C, S, P>(
    coprocessor: &C,
    from_version: u64,
    ctx: ProcessContext,
    store: &S,
    provider: &P,
) -> Result<CatchUpReport, IndexerError>
where
    C: Coprocessor + ?Sized,
    S: Storage + ?Sized,
    P: StreamProvider + ?Sized,
{
    let name = coprocessor.name();
    let mut cursor = Cursor::new(name.clone(), from_version);
    let mut report = CatchUpReport {
        from_version,
        to_version: ctx.ceiling_version,
        batches: 0,
        handled: 0,
    };

    tracing::info!(
        consumer = %name,
        from = from_version,
        ceiling = ctx.ceiling_version,
        "Starting catch-up"
    );

    let mut stream = provider.open(from_version).await?;
    loop {
        if catch_up_position(cursor.next_version, ctx.ceiling_version)? == CatchUpPosition::Synced {
            break;
        }

        let Some(batch) = stream.next_batch().await? else {
            return Err(IndexerError::Stream(format!(
                "stream closed at {} before '{name}' reached {}",
                cursor.next_version, ctx.ceiling_version
            )));
        };
        let Some(batch) = cursor.align(batch)? else {
            continue;
        };

        let mut txn = store.begin().await?;
        match process_batch(coprocessor, &batch, &ctx, txn.as_mut()).await? {
            BatchOutcome::Synced => {
                txn.rollback().await?;
                break;
            }
            BatchOutcome::Progressed {
                next_version,
                handled,
            } => {
                txn.commit().await?;
                cursor.advance(next_version)?;
                report.batches += 1;
                report.handled += handled;
            }
        }
    }

    tracing::info!(
        consumer = %name,
        batches = report.batches,
        handled = report.handled,
        at = cursor.next_version,
        "Catch-up complete"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointStore;
    use crate::coprocessor::tests::{ledger_batch, ledger_tx, Pinger};
    use crate::memory::InMemoryStorage;
    use crate::stream::{MemoryLedger, TransactionStream};
    use crate::types::TransactionBatch;
    use async_trait::async_trait;
    use std::sync::Mutex;

    async fn setup(pinger: &Pinger) -> InMemoryStorage {
        let store = InMemoryStorage::new();
        store.migrate(&pinger.tables()).await.unwrap();
        store
    }

    #[tokio::test]
    async fn stops_exactly_at_the_ceiling() {
        let pinger = Pinger::new("pinger", 0);
        let store = setup(&pinger).await;
        let ledger = MemoryLedger::new((0..300).map(ledger_tx).collect(), 7);

        let ctx = ProcessContext::catch_up(0, 100, 0);
        let report = run_catch_up(&pinger, 0, ctx, &store, &ledger).await.unwrap();

        assert_eq!(report.to_version, 100);
        assert_eq!(store.next_version("pinger").await.unwrap(), Some(100));
        // 100 versions, every tenth is block metadata
        assert_eq!(store.rows("pings").await.len(), 90);
        assert!(store
            .rows("pings")
            .await
            .iter()
            .all(|r| r.int("version").unwrap_or(i64::MAX) < 100));
    }

    #[tokio::test]
    async fn already_at_ceiling_does_nothing() {
        let pinger = Pinger::new("pinger", 0);
        let store = setup(&pinger).await;
        let ledger = MemoryLedger::new((0..50).map(ledger_tx).collect(), 10);

        let ctx = ProcessContext::catch_up(0, 20, 0);
        let report = run_catch_up(&pinger, 20, ctx, &store, &ledger).await.unwrap();
        assert_eq!(report.batches, 0);
        assert!(store.rows("pings").await.is_empty());
    }

    #[tokio::test]
    async fn early_close_is_a_stream_error() {
        let pinger = Pinger::new("pinger", 0);
        let store = setup(&pinger).await;
        let ledger = MemoryLedger::new((0..40).map(ledger_tx).collect(), 10);

        let ctx = ProcessContext::catch_up(0, 100, 0);
        let err = run_catch_up(&pinger, 0, ctx, &store, &ledger).await.unwrap_err();
        assert!(matches!(err, IndexerError::Stream(_)));
        // committed batches stay committed
        assert_eq!(store.next_version("pinger").await.unwrap(), Some(40));
    }

    /// Serves a fixed list of batches regardless of the requested start.
    struct Scripted(Mutex<Vec<TransactionBatch>>);

    struct ScriptedStream(Vec<TransactionBatch>);

    #[async_trait]
    impl TransactionStream for ScriptedStream {
        async fn next_batch(&mut self) -> Result<Option<TransactionBatch>, IndexerError> {
            Ok((!self.0.is_empty()).then(|| self.0.remove(0)))
        }
    }

    #[async_trait]
    impl StreamProvider for Scripted {
        async fn open(&self, _start: u64) -> Result<Box<dyn TransactionStream>, IndexerError> {
            let batches = std::mem::take(&mut *self.0.lock().unwrap());
            Ok(Box::new(ScriptedStream(batches)))
        }
    }

    #[tokio::test]
    async fn replayed_versions_are_not_written_twice() {
        let pinger = Pinger::new("pinger", 0);
        let store = setup(&pinger).await;
        let provider = Scripted(Mutex::new(vec![
            ledger_batch(1, 9),
            ledger_batch(5, 14),
            ledger_batch(15, 19),
        ]));

        let ctx = ProcessContext::catch_up(0, 20, 0);
        run_catch_up(&pinger, 1, ctx, &store, &provider).await.unwrap();

        // 1..=19 minus block metadata at 10
        assert_eq!(store.rows("pings").await.len(), 18);
        assert_eq!(store.next_version("pinger").await.unwrap(), Some(20));
    }

    #[tokio::test]
    async fn gap_fails_the_run() {
        let pinger = Pinger::new("pinger", 0);
        let store = setup(&pinger).await;
        let provider = Scripted(Mutex::new(vec![ledger_batch(1, 9), ledger_batch(12, 19)]));

        let ctx = ProcessContext::catch_up(0, 20, 0);
        let err = run_catch_up(&pinger, 1, ctx, &store, &provider).await.unwrap_err();
        assert!(matches!(err, IndexerError::VersionGap { expected: 10, actual: 12, .. }));
        assert_eq!(store.next_version("pinger").await.unwrap(), Some(10));
    }
}
