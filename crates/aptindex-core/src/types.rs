//! Shared types for the indexing pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::IndexerError;

// ─── TransactionKind ─────────────────────────────────────────────────────────

/// Discriminator of a ledger transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Genesis,
    BlockMetadata,
    StateCheckpoint,
    User,
    Validator,
    BlockEpilogue,
}

impl std::fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Genesis => write!(f, "genesis"),
            Self::BlockMetadata => write!(f, "block_metadata"),
            Self::StateCheckpoint => write!(f, "state_checkpoint"),
            Self::User => write!(f, "user"),
            Self::Validator => write!(f, "validator"),
            Self::BlockEpilogue => write!(f, "block_epilogue"),
        }
    }
}

// ─── RawEvent ────────────────────────────────────────────────────────────────

/// An event as delivered by the upstream stream, before dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    /// Fully qualified Move type, e.g. `0x1::coin::DepositEvent`.
    pub type_str: String,
    pub sequence_number: u64,
    pub creation_number: u64,
    /// Account that owns the event handle.
    pub account_address: String,
    /// JSON-encoded event payload.
    pub data: String,
}

// ─── Transaction ─────────────────────────────────────────────────────────────

/// Payload carried only by user transactions.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UserTransaction {
    pub sender: String,
    pub events: Vec<RawEvent>,
}

/// A single ledger transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: u64,
    pub block_height: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: TransactionKind,
    /// Present for `TransactionKind::User` only.
    pub user: Option<UserTransaction>,
}

impl Transaction {
    pub fn is_user(&self) -> bool {
        self.kind == TransactionKind::User
    }

    /// Events of a user transaction.
    ///
    /// A user transaction without a payload is treated as corrupt upstream data
    /// and fails the whole batch. Other kinds carry no events.
    pub fn events(&self) -> Result<&[RawEvent], IndexerError> {
        match (&self.kind, &self.user) {
            (TransactionKind::User, Some(user)) => Ok(&user.events),
            (TransactionKind::User, None) => Err(IndexerError::MalformedTransaction {
                version: self.version,
                reason: "user transaction without payload".into(),
            }),
            _ => Ok(&[]),
        }
    }

    /// Context handed to event handlers for this transaction.
    pub fn context(&self, chain_id: u64) -> TransactionContext {
        TransactionContext {
            chain_id,
            version: self.version,
            block_height: self.block_height,
            timestamp: self.timestamp,
        }
    }
}

// ─── TransactionBatch ────────────────────────────────────────────────────────

/// A contiguous range of transactions `[start_version, end_version]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionBatch {
    pub transactions: Vec<Transaction>,
    pub start_version: u64,
    pub end_version: u64,
}

impl TransactionBatch {
    /// Build a batch spanning exactly the given transactions.
    ///
    /// Returns `None` for an empty list since the range would be undefined.
    pub fn from_transactions(transactions: Vec<Transaction>) -> Option<Self> {
        let start_version = transactions.first()?.version;
        let end_version = transactions.last()?.version;
        Some(Self {
            transactions,
            start_version,
            end_version,
        })
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }
}

// ─── TransactionContext ──────────────────────────────────────────────────────

/// Per-transaction context passed to event handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionContext {
    pub chain_id: u64,
    pub version: u64,
    pub block_height: u64,
    pub timestamp: DateTime<Utc>,
}

// ─── Tests ───────────────────────────────────────────────────────────────────
