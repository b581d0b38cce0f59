//! Relational write port shared by all storage backends.
//!
//! Coprocessors describe their models once as [`TableSchema`]s and write
//! dynamically typed [`Row`]s through a [`WriteTxn`]. Backends (memory,
//! SQLite, Postgres) translate these into their own dialect, so the same
//! coprocessor runs unchanged on every engine.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checkpoint::CheckpointStore;
use crate::error::IndexerError;

// ─── Schema ──────────────────────────────────────────────────────────────────

/// SQL type family of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnKind {
    Int,
    Float,
    Bool,
    Text,
    Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub kind: ColumnKind,
    pub primary_key: bool,
}

/// Description of one relational model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<Column>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
        }
    }

    /// Add a primary-key column.
    pub fn key(mut self, name: impl Into<String>, kind: ColumnKind) -> Self {
        self.columns.push(Column {
            name: name.into(),
            kind,
            primary_key: true,
        });
        self
    }

    /// Add a regular column.
    pub fn column(mut self, name: impl Into<String>, kind: ColumnKind) -> Self {
        self.columns.push(Column {
            name: name.into(),
            kind,
            primary_key: false,
        });
        self
    }

    pub fn primary_key(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(|c| c.primary_key)
    }

    pub fn column_named(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Check that every value in `row` names a known column of the right kind.
    pub fn validate(&self, row: &Row) -> Result<(), IndexerError> {
        for (name, value) in row.iter() {
            let column = self.column_named(name).ok_or_else(|| {
                IndexerError::Storage(format!("table '{}' has no column '{name}'", self.name))
            })?;
            if !value.fits(column.kind) {
                return Err(IndexerError::Storage(format!(
                    "column '{}.{name}' expects {:?}, got {value:?}",
                    self.name, column.kind
                )));
            }
        }
        Ok(())
    }

    /// Extract the primary-key columns of `row`, failing if one is missing.
    pub fn key_of(&self, row: &Row) -> Result<Row, IndexerError> {
        let mut key = Row::new();
        for column in self.primary_key() {
            let value = row.get(&column.name).ok_or_else(|| {
                IndexerError::Storage(format!(
                    "row for '{}' is missing key column '{}'",
                    self.name, column.name
                ))
            })?;
            key.insert(column.name.clone(), value.clone());
        }
        Ok(key)
    }
}

// ─── Values and rows ─────────────────────────────────────────────────────────

/// A dynamically typed column value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
    Timestamp(DateTime<Utc>),
}

impl Value {
    /// `Null` fits any column.
    pub fn fits(&self, kind: ColumnKind) -> bool {
        matches!(
            (self, kind),
            (Self::Null, _)
                | (Self::Int(_), ColumnKind::Int)
                | (Self::Float(_), ColumnKind::Float)
                | (Self::Bool(_), ColumnKind::Bool)
                | (Self::Text(_), ColumnKind::Text)
                | (Self::Timestamp(_), ColumnKind::Timestamp)
        )
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Timestamp(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

/// Versions and counters are stored as signed 64-bit integers; anything
/// above `i64::MAX` is refused rather than wrapped.
impl TryFrom<u64> for Value {
    type Error = std::num::TryFromIntError;

    fn try_from(v: u64) -> Result<Self, Self::Error> {
        i64::try_from(v).map(Self::Int)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Self::Timestamp(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

/// One relational row: column name → value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Row(BTreeMap<String, Value>);

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter.
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(column.into(), value.into());
        self
    }

    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(column.into(), value.into());
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    pub fn int(&self, column: &str) -> Option<i64> {
        self.get(column).and_then(Value::as_i64)
    }

    pub fn float(&self, column: &str) -> Option<f64> {
        self.get(column).and_then(Value::as_f64)
    }

    pub fn bool(&self, column: &str) -> Option<bool> {
        self.get(column).and_then(Value::as_bool)
    }

    pub fn text(&self, column: &str) -> Option<&str> {
        self.get(column).and_then(Value::as_str)
    }

    pub fn timestamp(&self, column: &str) -> Option<DateTime<Utc>> {
        self.get(column).and_then(Value::as_timestamp)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `true` if every column of `key` holds the same value in `self`.
    pub fn matches(&self, key: &Row) -> bool {
        key.iter().all(|(name, value)| self.get(name) == Some(value))
    }
}

// ─── Transactions ────────────────────────────────────────────────────────────

/// A batch-scoped relational transaction.
///
/// Dropping a transaction without calling [`commit`](WriteTxn::commit)
/// discards every write made through it, checkpoint included.
#[async_trait]
pub trait WriteTxn: Send {
    /// Batch insert; a duplicate primary key fails the transaction.
    async fn insert(&mut self, table: &TableSchema, rows: Vec<Row>) -> Result<(), IndexerError>;

    /// Insert or replace the row with the same primary key.
    async fn upsert(&mut self, table: &TableSchema, row: Row) -> Result<(), IndexerError>;

    /// Look up a row by its primary-key columns.
    async fn find(&mut self, table: &TableSchema, key: &Row) -> Result<Option<Row>, IndexerError>;

    /// Checkpoint as seen from inside this transaction.
    async fn next_version(&mut self, consumer_name: &str) -> Result<Option<u64>, IndexerError>;

    /// Upsert the checkpoint row; rejects a version lower than the stored one.
    async fn set_next_version(
        &mut self,
        consumer_name: &str,
        next_version: u64,
    ) -> Result<(), IndexerError>;

    async fn commit(self: Box<Self>) -> Result<(), IndexerError>;

    async fn rollback(self: Box<Self>) -> Result<(), IndexerError>;
}

/// A relational engine selected once per deployment.
#[async_trait]
pub trait Storage: CheckpointStore {
    /// Start a transaction scoped to one batch.
    async fn begin(&self) -> Result<Box<dyn WriteTxn>, IndexerError>;

    /// Create the checkpoint table and the given model tables if missing.
    async fn migrate(&self, tables: &[TableSchema]) -> Result<(), IndexerError>;
}
