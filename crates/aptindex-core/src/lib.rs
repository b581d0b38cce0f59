//! aptindex-core — synchronization and dispatch engine for Aptos coprocessors.
//!
//! # Architecture
//!
//! ```text
//! Supervisor → ProcessorManager
//!                  ├── SyncCoordinator   (admission matrix, catch-up runs)
//!                  │       └── run_catch_up (independent, ceiling-bounded stream)
//!                  ├── SuperProcessor    (single shared stream, fan-out)
//!                  │       └── Coprocessor → pre/post processor → HandlerRegistry
//!                  ├── Checkpoints       (one row per consumer, committed with data)
//!                  └── Storage backend   (memory / SQLite / Postgres)
//! ```

pub mod chain;
pub mod checkpoint;
pub mod config;
pub mod coprocessor;
pub mod cursor;
pub mod error;
pub mod event_id;
pub mod handler;
pub mod manager;
pub mod memory;
pub mod processor;
pub mod retry;
pub mod store;
pub mod stream;
pub mod super_processor;
pub mod supervisor;
pub mod sync;
pub mod types;
pub mod worker;

pub use chain::SupportedChain;
pub use checkpoint::{Checkpoint, CheckpointManager, CheckpointStore};
pub use config::{IndexerConfig, LogConfig};
pub use coprocessor::{process_batch, BatchOutcome, Coprocessor};
pub use cursor::Cursor;
pub use error::IndexerError;
pub use event_id::{AccountAddress, EventTypeId};
pub use handler::{AptosEvent, EventHandler, HandlerRegistry};
pub use manager::ProcessorManager;
pub use memory::InMemoryStorage;
pub use processor::{Phase, ProcessContext};
pub use retry::{RetryConfig, RetryPolicy};
pub use store::{Column, ColumnKind, Row, Storage, TableSchema, Value, WriteTxn};
pub use stream::{MemoryLedger, StreamProvider, TransactionStream};
pub use super_processor::{StreamExit, SuperProcessor};
pub use supervisor::{ErrorReporter, Pipeline, Supervisor, SupervisorState};
pub use sync::{Admission, Rejection, SyncCoordinator, SyncReport};
pub use types::{RawEvent, Transaction, TransactionBatch, TransactionContext, TransactionKind, UserTransaction};
