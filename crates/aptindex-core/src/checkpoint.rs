//! Checkpoints — the next ledger version a named consumer has not processed.
//!
//! Every consumer (the super processor and each coprocessor) owns exactly one
//! row keyed by its name. The row is written inside the same [`WriteTxn`] as
//! the batch's data rows, so data and checkpoint commit or roll back together.
//! On restart a consumer resumes from its stored version, falling back to its
//! genesis version when nothing has been stored yet.
//!
//! [`WriteTxn`]: crate::store::WriteTxn

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::IndexerError;

/// Name of the relational table holding checkpoints.
pub const CHECKPOINT_TABLE: &str = "next_versions";

/// A persisted checkpoint for a consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Unique consumer name, e.g. `"2_coin_flip_processor"`.
    pub consumer_name: String,
    /// Next version this consumer has not yet processed.
    pub next_version: u64,
    /// Unix timestamp of when this checkpoint was saved.
    pub updated_at: i64,
}

/// Read side of the checkpoint table.
///
/// Writes always go through a batch transaction
/// ([`WriteTxn::set_next_version`](crate::store::WriteTxn::set_next_version)).
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Load the next version for a consumer; `None` means never processed.
    async fn next_version(&self, consumer_name: &str) -> Result<Option<u64>, IndexerError>;

    /// All stored checkpoints, ordered by consumer name.
    async fn checkpoints(&self) -> Result<Vec<Checkpoint>, IndexerError>;
}

/// Reject a checkpoint write that would move a consumer backwards.
///
/// Backends call this inside `set_next_version` with the currently stored value.
pub fn ensure_monotonic(
    consumer_name: &str,
    current: Option<u64>,
    next_version: u64,
) -> Result<(), IndexerError> {
    match current {
        Some(current) if next_version < current => Err(IndexerError::Invariant(format!(
            "checkpoint for '{consumer_name}' would regress from {current} to {next_version}"
        ))),
        _ => Ok(()),
    }
}

/// Consumer-scoped view over a [`CheckpointStore`].
pub struct CheckpointManager<S: ?Sized> {
    store: Arc<S>,
    consumer_name: String,
}

impl<S: CheckpointStore + ?Sized> CheckpointManager<S> {
    pub fn new(store: Arc<S>, consumer_name: impl Into<String>) -> Self {
        Self {
            store,
            consumer_name: consumer_name.into(),
        }
    }

    pub fn consumer_name(&self) -> &str {
        &self.consumer_name
    }

    /// Load the stored next version (returns `None` if none exists).
    pub async fn load(&self) -> Result<Option<u64>, IndexerError> {
        self.store.next_version(&self.consumer_name).await
    }

    /// Stored next version, or `genesis_version` for a fresh consumer.
    pub async fn resolve(&self, genesis_version: u64) -> Result<u64, IndexerError> {
        Ok(self.load().await?.unwrap_or(genesis_version))
    }
}
