//! Coprocessors — independently checkpointed sub-indexers.
//!
//! A coprocessor declares its name, genesis version, relational models and
//! event handlers. [`process_batch`] is the single traversal shared by every
//! coprocessor: pre-process, dispatch each transaction's events through the
//! registry, then write the clipped checkpoint into the batch transaction.

use crate::error::IndexerError;
use crate::handler::HandlerRegistry;
use crate::processor::{next_version_after, post_process, pre_process, PreProcess, ProcessContext};
use crate::store::{TableSchema, WriteTxn};
use crate::types::TransactionBatch;

/// An independently checkpointed sub-indexer.
pub trait Coprocessor: Send + Sync {
    /// Checkpoint key. Must stay stable across restarts.
    fn name(&self) -> String;

    /// Earliest ledger version relevant to this coprocessor.
    ///
    /// Fixed per deployment: changing it after data has been written breaks
    /// the interpretation of the stored checkpoint.
    fn genesis_version(&self) -> u64;

    /// Relational models this coprocessor writes.
    fn tables(&self) -> Vec<TableSchema>;

    /// Event handlers of this coprocessor.
    fn registry(&self) -> &HandlerRegistry;
}

/// Result of feeding one batch to a coprocessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Catch-up run reached the super stream; nothing was written.
    Synced,
    /// Batch dispatched and checkpoint staged in the transaction.
    Progressed {
        next_version: u64,
        /// Events that reached a handler.
        handled: usize,
    },
}

/// Run one batch through `coprocessor` inside `txn`.
///
/// Handler errors propagate, so the caller drops the transaction and
/// nothing from this batch is persisted.
pub async fn process_batch<C: Coprocessor + ?Sized>(
    coprocessor: &C,
    batch: &TransactionBatch,
    ctx: &ProcessContext,
    txn: &mut dyn WriteTxn,
) -> Result<BatchOutcome, IndexerError> {
    let ready = match pre_process(batch, ctx)? {
        PreProcess::Synced => return Ok(BatchOutcome::Synced),
        PreProcess::Ready(ready) => ready,
    };

    let registry = coprocessor.registry();
    let mut handled = 0;
    if batch.end_version >= ctx.genesis_version {
        for transaction in &ready.transactions {
            let events = transaction.events()?;
            let tx_ctx = transaction.context(ctx.chain_id);
            handled += registry.dispatch_all(&tx_ctx, events, txn).await?;
        }
    } else {
        tracing::trace!(
            consumer = %coprocessor.name(),
            end = batch.end_version,
            genesis = ctx.genesis_version,
            "batch before genesis, skipping dispatch"
        );
    }

    let committed = post_process(batch.end_version, ready.ran_past_ceiling, ctx);
    let next_version = next_version_after(committed);
    txn.set_next_version(&coprocessor.name(), next_version).await?;

    tracing::debug!(
        consumer = %coprocessor.name(),
        phase = %ctx.phase,
        start = batch.start_version,
        end = batch.end_version,
        next_version,
        handled,
        "coprocessor batch processed"
    );
    Ok(BatchOutcome::Progressed {
        next_version,
        handled,
    })
}
