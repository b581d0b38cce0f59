//! In-memory storage backend.
//!
//! Stores model rows and checkpoints in RAM. A transaction holds the store's
//! lock for its whole lifetime and writes in place, recording an undo log
//! that is replayed if it is dropped without committing. Rows are indexed by
//! primary key, so a batch costs what it writes regardless of store size.
//! Useful for tests and short-lived runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::checkpoint::{ensure_monotonic, Checkpoint, CheckpointStore};
use crate::error::IndexerError;
use crate::store::{Row, Storage, TableSchema, WriteTxn};

/// Canonical form of a primary key. `Row` is ordered by column name, so
/// equal keys always render the same.
fn key_string(key: &Row) -> String {
    format!("{key:?}")
}

#[derive(Debug, Clone, Default)]
struct Table {
    /// Insertion order.
    rows: Vec<Row>,
    /// Primary key to position in `rows`; keyless tables are not indexed.
    index: HashMap<String, usize>,
}

#[derive(Debug, Clone, Default)]
struct Data {
    tables: HashMap<String, Table>,
    checkpoints: BTreeMap<String, Checkpoint>,
}

impl Data {
    fn table_mut(&mut self, name: &str) -> Result<&mut Table, IndexerError> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| IndexerError::Storage(format!("no such table: {name}")))
    }

    fn table(&self, name: &str) -> Result<&Table, IndexerError> {
        self.tables
            .get(name)
            .ok_or_else(|| IndexerError::Storage(format!("no such table: {name}")))
    }
}

/// One reversible write.
enum Undo {
    Pushed { table: String, key: Option<String> },
    Replaced { table: String, position: usize, previous: Row },
    Checkpoint { consumer: String, previous: Option<Checkpoint> },
}

/// In-memory indexer storage.
///
/// All data is lost when the process exits.
#[derive(Clone, Default)]
pub struct InMemoryStorage {
    data: Arc<Mutex<Data>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every committed row in `table` (empty if unknown).
    pub async fn rows(&self, table: &str) -> Vec<Row> {
        self.data
            .lock()
            .await
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryStorage {
    async fn next_version(&self, consumer_name: &str) -> Result<Option<u64>, IndexerError> {
        Ok(self
            .data
            .lock()
            .await
            .checkpoints
            .get(consumer_name)
            .map(|cp| cp.next_version))
    }

    async fn checkpoints(&self) -> Result<Vec<Checkpoint>, IndexerError> {
        Ok(self.data.lock().await.checkpoints.values().cloned().collect())
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn begin(&self) -> Result<Box<dyn WriteTxn>, IndexerError> {
        let guard = self.data.clone().lock_owned().await;
        Ok(Box::new(MemoryTxn {
            guard,
            undo: Vec::new(),
            committed: false,
        }))
    }

    async fn migrate(&self, tables: &[TableSchema]) -> Result<(), IndexerError> {
        let mut data = self.data.lock().await;
        for table in tables {
            data.tables.entry(table.name.clone()).or_default();
        }
        Ok(())
    }
}

/// Transaction over [`InMemoryStorage`].
struct MemoryTxn {
    guard: OwnedMutexGuard<Data>,
    undo: Vec<Undo>,
    committed: bool,
}

impl MemoryTxn {
    /// Position of the row with primary key `key`, if stored.
    fn position(&self, table: &TableSchema, key: &Row) -> Result<Option<usize>, IndexerError> {
        let stored = self.guard.table(&table.name)?;
        let indexed = !key.is_empty()
            && key.len() == table.primary_key().count()
            && table.primary_key().all(|c| key.get(&c.name).is_some());
        if indexed {
            Ok(stored.index.get(&key_string(key)).copied())
        } else {
            Ok(stored.rows.iter().position(|r| r.matches(key)))
        }
    }

    fn push(&mut self, table: &TableSchema, key: &Row, row: Row) -> Result<(), IndexerError> {
        let key = (!key.is_empty()).then(|| key_string(key));
        let stored = self.guard.table_mut(&table.name)?;
        if let Some(key) = &key {
            stored.index.insert(key.clone(), stored.rows.len());
        }
        stored.rows.push(row);
        self.undo.push(Undo::Pushed {
            table: table.name.clone(),
            key,
        });
        Ok(())
    }

    fn undo_all(&mut self) {
        let data = &mut *self.guard;
        while let Some(step) = self.undo.pop() {
            match step {
                Undo::Pushed { table, key } => {
                    if let Some(stored) = data.tables.get_mut(&table) {
                        stored.rows.pop();
                        if let Some(key) = key {
                            stored.index.remove(&key);
                        }
                    }
                }
                Undo::Replaced {
                    table,
                    position,
                    previous,
                } => {
                    if let Some(row) = data
                        .tables
                        .get_mut(&table)
                        .and_then(|t| t.rows.get_mut(position))
                    {
                        *row = previous;
                    }
                }
                Undo::Checkpoint { consumer, previous } => match previous {
                    Some(cp) => {
                        data.checkpoints.insert(consumer, cp);
                    }
                    None => {
                        data.checkpoints.remove(&consumer);
                    }
                },
            }
        }
    }
}

impl Drop for MemoryTxn {
    fn drop(&mut self) {
        if !self.committed {
            self.undo_all();
        }
    }
}

#[async_trait]
impl WriteTxn for MemoryTxn {
    async fn insert(&mut self, table: &TableSchema, rows: Vec<Row>) -> Result<(), IndexerError> {
        for row in rows {
            table.validate(&row)?;
            let key = table.key_of(&row)?;
            if !key.is_empty() && self.position(table, &key)?.is_some() {
                return Err(IndexerError::Storage(format!(
                    "duplicate primary key in '{}': {key:?}",
                    table.name
                )));
            }
            self.push(table, &key, row)?;
        }
        Ok(())
    }

    async fn upsert(&mut self, table: &TableSchema, row: Row) -> Result<(), IndexerError> {
        table.validate(&row)?;
        let key = table.key_of(&row)?;
        match self.position(table, &key)? {
            Some(position) => {
                let stored = self.guard.table_mut(&table.name)?;
                let previous = std::mem::replace(&mut stored.rows[position], row);
                self.undo.push(Undo::Replaced {
                    table: table.name.clone(),
                    position,
                    previous,
                });
                Ok(())
            }
            None => self.push(table, &key, row),
        }
    }

    async fn find(&mut self, table: &TableSchema, key: &Row) -> Result<Option<Row>, IndexerError> {
        let position = self.position(table, key)?;
        let stored = self.guard.table(&table.name)?;
        Ok(position.and_then(|p| stored.rows.get(p)).cloned())
    }

    async fn next_version(&mut self, consumer_name: &str) -> Result<Option<u64>, IndexerError> {
        Ok(self
            .guard
            .checkpoints
            .get(consumer_name)
            .map(|cp| cp.next_version))
    }

    async fn set_next_version(
        &mut self,
        consumer_name: &str,
        next_version: u64,
    ) -> Result<(), IndexerError> {
        let current = self
            .guard
            .checkpoints
            .get(consumer_name)
            .map(|cp| cp.next_version);
        ensure_monotonic(consumer_name, current, next_version)?;
        let previous = self.guard.checkpoints.insert(
            consumer_name.to_string(),
            Checkpoint {
                consumer_name: consumer_name.to_string(),
                next_version,
                updated_at: chrono::Utc::now().timestamp(),
            },
        );
        self.undo.push(Undo::Checkpoint {
            consumer: consumer_name.to_string(),
            previous,
        });
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<(), IndexerError> {
        self.committed = true;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), IndexerError> {
        // undone on drop
        Ok(())
    }
}
