//! Transaction pre/post processing for coprocessors.
//!
//! A coprocessor sees a batch in one of two phases:
//!
//! - **Catch-up**: an independent replay from its own checkpoint. The batch
//!   still contains every transaction kind, and must be clipped at the super
//!   stream's ceiling so the coprocessor never runs ahead of it.
//! - **Joined**: the batch comes from the shared stream, already reduced to
//!   user transactions by the super processor.

use serde::{Deserialize, Serialize};

use crate::error::IndexerError;
use crate::types::{Transaction, TransactionBatch};

/// Which stream a coprocessor is currently consuming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    /// Independent run bounded by the super stream's checkpoint.
    CatchUp,
    /// Fan-out from the shared super stream.
    Joined,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CatchUp => write!(f, "catch-up"),
            Self::Joined => write!(f, "joined"),
        }
    }
}

/// Explicit context passed into every coprocessor call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessContext {
    pub phase: Phase,
    /// Super stream's next version at startup; the catch-up ceiling.
    pub ceiling_version: u64,
    /// Genesis of the coprocessor being driven.
    pub genesis_version: u64,
    pub chain_id: u64,
}

impl ProcessContext {
    pub fn catch_up(chain_id: u64, ceiling_version: u64, genesis_version: u64) -> Self {
        Self {
            phase: Phase::CatchUp,
            ceiling_version,
            genesis_version,
            chain_id,
        }
    }

    pub fn joined(chain_id: u64, ceiling_version: u64, genesis_version: u64) -> Self {
        Self {
            phase: Phase::Joined,
            ceiling_version,
            genesis_version,
            chain_id,
        }
    }
}

/// Where a catch-up cursor stands relative to the ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchUpPosition {
    Behind,
    /// The cursor reached the ceiling: the run is over.
    Synced,
}

/// Classify a catch-up cursor; a cursor past the ceiling is an invariant violation.
pub fn catch_up_position(
    next_version: u64,
    ceiling_version: u64,
) -> Result<CatchUpPosition, IndexerError> {
    use std::cmp::Ordering;
    match next_version.cmp(&ceiling_version) {
        Ordering::Less => Ok(CatchUpPosition::Behind),
        Ordering::Equal => Ok(CatchUpPosition::Synced),
        Ordering::Greater => Err(IndexerError::Invariant(format!(
            "catch-up batch starts at {next_version}, past the super stream ceiling {ceiling_version}"
        ))),
    }
}

/// Transactions a coprocessor should dispatch for one batch.
#[derive(Debug, PartialEq)]
pub struct PreProcessed<'a> {
    pub transactions: Vec<&'a Transaction>,
    /// The batch reached the ceiling and was cut short.
    pub ran_past_ceiling: bool,
}

/// Result of [`pre_process`].
#[derive(Debug, PartialEq)]
pub enum PreProcess<'a> {
    /// Terminal signal: the catch-up run has reached the super stream.
    Synced,
    Ready(PreProcessed<'a>),
}

/// Filter and clip a batch for one coprocessor.
pub fn pre_process<'a>(
    batch: &'a TransactionBatch,
    ctx: &ProcessContext,
) -> Result<PreProcess<'a>, IndexerError> {
    if ctx.phase == Phase::Joined {
        return Ok(PreProcess::Ready(PreProcessed {
            transactions: batch.transactions.iter().collect(),
            ran_past_ceiling: false,
        }));
    }

    if catch_up_position(batch.start_version, ctx.ceiling_version)? == CatchUpPosition::Synced {
        return Ok(PreProcess::Synced);
    }

    let mut transactions = Vec::with_capacity(batch.transactions.len());
    let mut ran_past_ceiling = false;
    for transaction in &batch.transactions {
        if transaction.version >= ctx.ceiling_version {
            // ordered, so nothing after this can be below the ceiling either
            ran_past_ceiling = true;
            break;
        }
        if transaction.is_user() {
            transactions.push(transaction);
        }
    }
    // a sparse batch may end past the ceiling without carrying that version
    ran_past_ceiling |= batch.end_version >= ctx.ceiling_version;
    Ok(PreProcess::Ready(PreProcessed {
        transactions,
        ran_past_ceiling,
    }))
}

/// The last version covered by this batch once clipping is applied.
pub fn post_process(end_version: u64, ran_past_ceiling: bool, ctx: &ProcessContext) -> u64 {
    if ran_past_ceiling {
        ctx.ceiling_version - 1
    } else {
        end_version
    }
}

/// The checkpoint to persist after committing up to `committed_end_version`.
pub fn next_version_after(committed_end_version: u64) -> u64 {
    committed_end_version + 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TransactionKind, UserTransaction};

    fn tx(version: u64, kind: TransactionKind) -> Transaction {
        Transaction {
            version,
            block_height: version,
            timestamp: chrono::DateTime::from_timestamp(version as i64, 0).unwrap_or_default(),
            kind,
            user: (kind == TransactionKind::User).then(UserTransaction::default),
        }
    }

    fn batch(start: u64, end: u64) -> TransactionBatch {
        let transactions = (start..=end)
            .map(|v| {
                let kind = if v % 5 == 0 {
                    TransactionKind::BlockMetadata
                } else {
                    TransactionKind::User
                };
                tx(v, kind)
            })
            .collect();
        TransactionBatch {
            transactions,
            start_version: start,
            end_version: end,
        }
    }

    fn versions(p: &PreProcess<'_>) -> Vec<u64> {
        match p {
            PreProcess::Ready(r) => r.transactions.iter().map(|t| t.version).collect(),
            PreProcess::Synced => vec![],
        }
    }

    #[test]
    fn joined_passes_batch_through() {
        let b = batch(10, 20);
        let ctx = ProcessContext::joined(0, 15, 0);
        let p = pre_process(&b, &ctx).unwrap();
        assert_eq!(versions(&p).len(), 11);
        assert!(matches!(p, PreProcess::Ready(PreProcessed { ran_past_ceiling: false, .. })));
    }

    #[test]
    fn catch_up_drops_non_user_transactions() {
        let b = batch(11, 19);
        let ctx = ProcessContext::catch_up(0, 100, 0);
        let p = pre_process(&b, &ctx).unwrap();
        assert_eq!(versions(&p), vec![11, 12, 13, 14, 16, 17, 18, 19]);
    }

    #[test]
    fn clip_at_ceiling_then_synced() {
        let ctx = ProcessContext::catch_up(0, 100, 0);

        let b = batch(90, 110);
        let p = pre_process(&b, &ctx).unwrap();
        let PreProcess::Ready(ready) = &p else {
            panic!("expected a ready batch");
        };
        assert!(ready.ran_past_ceiling);
        assert_eq!(ready.transactions.last().map(|t| t.version), Some(99));
        assert!(ready.transactions.iter().all(|t| t.version < 100));

        let committed = post_process(b.end_version, ready.ran_past_ceiling, &ctx);
        assert_eq!(committed, 99);
        assert_eq!(next_version_after(committed), 100);

        // next call starts exactly at the ceiling
        let next = batch(100, 120);
        assert_eq!(pre_process(&next, &ctx).unwrap(), PreProcess::Synced);
    }

    #[test]
    fn start_past_ceiling_is_an_invariant_violation() {
        let ctx = ProcessContext::catch_up(0, 100, 0);
        let err = pre_process(&batch(101, 120), &ctx).unwrap_err();
        assert!(matches!(err, IndexerError::Invariant(_)));
    }

    #[test]
    fn sparse_batch_ending_past_ceiling_is_clipped() {
        let ctx = ProcessContext::catch_up(0, 100, 0);
        let b = TransactionBatch {
            transactions: vec![tx(97, TransactionKind::User)],
            start_version: 96,
            end_version: 104,
        };
        let p = pre_process(&b, &ctx).unwrap();
        assert!(matches!(p, PreProcess::Ready(PreProcessed { ran_past_ceiling: true, .. })));
        assert_eq!(post_process(b.end_version, true, &ctx), 99);
    }

    #[test]
    fn unclipped_batch_commits_its_end() {
        let ctx = ProcessContext::catch_up(0, 100, 0);
        assert_eq!(post_process(80, false, &ctx), 80);
    }

    #[test]
    fn ceiling_on_non_user_transaction_still_clips() {
        // version 95 is block metadata; the cut must still happen there
        let ctx = ProcessContext::catch_up(0, 95, 0);
        let b = batch(91, 99);
        let p = pre_process(&b, &ctx).unwrap();
        assert_eq!(versions(&p), vec![91, 92, 93, 94]);
        assert!(matches!(p, PreProcess::Ready(PreProcessed { ran_past_ceiling: true, .. })));
    }
}
