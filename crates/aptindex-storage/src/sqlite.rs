//! SQLite storage backend for aptindex.
//!
//! Persists checkpoints and coprocessor models to a single SQLite file.
//! Uses `sqlx` with WAL mode for concurrent read performance.
//!
//! # Usage
//! ```rust,no_run
//! use aptindex_storage::sqlite::SqliteStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStorage::open("./index.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStorage::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqlitePoolOptions, SqliteRow};
use sqlx::{Row as _, Sqlite, SqlitePool};
use tracing::debug;

use aptindex_core::checkpoint::{ensure_monotonic, Checkpoint, CheckpointStore};
use aptindex_core::error::IndexerError;
use aptindex_core::store::{ColumnKind, Row, Storage, TableSchema, Value, WriteTxn};

use crate::sql::{self, Dialect};

const DIALECT: Dialect = Dialect::Sqlite;

type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

/// SQLite-backed storage for checkpoints and coprocessor models.
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./index.db"`) or a full
    /// SQLite URL (`"sqlite:./index.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, IndexerError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url)
            .await
            .map_err(|e| IndexerError::Storage(e.to_string()))?;

        // WAL mode for concurrent readers
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&pool)
            .await
            .map_err(|e| IndexerError::Storage(e.to_string()))?;

        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Open an in-memory SQLite database.
    ///
    /// Backed by a single connection that is never recycled, so every query
    /// sees the same database. All data is lost when the pool is dropped.
    pub async fn in_memory() -> Result<Self, IndexerError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| IndexerError::Storage(e.to_string()))?;

        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    async fn init_schema(&self) -> Result<(), IndexerError> {
        sqlx::query(&sql::create_checkpoint_table(DIALECT))
            .execute(&self.pool)
            .await
            .map_err(|e| IndexerError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Every row of `table`. For inspection and tests.
    pub async fn rows(&self, table: &TableSchema) -> Result<Vec<Row>, IndexerError> {
        let rows = sqlx::query(&sql::select_all(table))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| IndexerError::Storage(e.to_string()))?;
        rows.iter().map(|r| decode_row(r, table)).collect()
    }
}

// ─── Binding / decoding ──────────────────────────────────────────────────────

fn bind_value<'q>(query: SqliteQuery<'q>, value: &Value, kind: ColumnKind) -> SqliteQuery<'q> {
    match value {
        Value::Null => match kind {
            ColumnKind::Int => query.bind(None::<i64>),
            ColumnKind::Float => query.bind(None::<f64>),
            ColumnKind::Bool => query.bind(None::<bool>),
            ColumnKind::Text => query.bind(None::<String>),
            ColumnKind::Timestamp => query.bind(None::<DateTime<Utc>>),
        },
        Value::Int(v) => query.bind(*v),
        Value::Float(v) => query.bind(*v),
        Value::Bool(v) => query.bind(*v),
        Value::Text(v) => query.bind(v.clone()),
        Value::Timestamp(v) => query.bind(*v),
    }
}

fn bind_row<'q>(
    mut query: SqliteQuery<'q>,
    table: &TableSchema,
    row: &Row,
) -> Result<SqliteQuery<'q>, IndexerError> {
    for (name, value) in row.iter() {
        let column = table.column_named(name).ok_or_else(|| {
            IndexerError::Storage(format!("table '{}' has no column '{name}'", table.name))
        })?;
        query = bind_value(query, value, column.kind);
    }
    Ok(query)
}

fn decode_row(row: &SqliteRow, table: &TableSchema) -> Result<Row, IndexerError> {
    let mut out = Row::new();
    for column in &table.columns {
        let name = column.name.as_str();
        let value = match column.kind {
            ColumnKind::Int => row.try_get::<Option<i64>, _>(name).map(Value::from),
            ColumnKind::Float => row.try_get::<Option<f64>, _>(name).map(Value::from),
            ColumnKind::Bool => row.try_get::<Option<bool>, _>(name).map(Value::from),
            ColumnKind::Text => row.try_get::<Option<String>, _>(name).map(Value::from),
            ColumnKind::Timestamp => row.try_get::<Option<DateTime<Utc>>, _>(name).map(Value::from),
        }
        .map_err(|e| IndexerError::Storage(e.to_string()))?;
        out.insert(name, value);
    }
    Ok(out)
}

// ─── CheckpointStore / Storage impls ─────────────────────────────────────────

#[async_trait]
impl CheckpointStore for SqliteStorage {
    async fn next_version(&self, consumer_name: &str) -> Result<Option<u64>, IndexerError> {
        let row = sqlx::query(&sql::select_next_version(DIALECT))
            .bind(consumer_name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| IndexerError::Storage(e.to_string()))?;
        Ok(row.map(|r| r.get::<i64, _>("next_version") as u64))
    }

    async fn checkpoints(&self) -> Result<Vec<Checkpoint>, IndexerError> {
        let rows = sqlx::query(&sql::select_checkpoints())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| IndexerError::Storage(e.to_string()))?;
        Ok(rows
            .iter()
            .map(|r| Checkpoint {
                consumer_name: r.get("consumer_name"),
                next_version: r.get::<i64, _>("next_version") as u64,
                updated_at: r.get("updated_at"),
            })
            .collect())
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn begin(&self) -> Result<Box<dyn WriteTxn>, IndexerError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| IndexerError::Storage(e.to_string()))?;
        Ok(Box::new(SqliteTxn { tx }))
    }

    async fn migrate(&self, tables: &[TableSchema]) -> Result<(), IndexerError> {
        self.init_schema().await?;
        for table in tables {
            sqlx::query(&sql::create_table(DIALECT, table))
                .execute(&self.pool)
                .await
                .map_err(|e| IndexerError::Storage(e.to_string()))?;
            debug!(table = %table.name, "table ready");
        }
        Ok(())
    }
}

/// A batch transaction over [`SqliteStorage`]; rolls back when dropped.
pub struct SqliteTxn {
    tx: sqlx::Transaction<'static, Sqlite>,
}

#[async_trait]
impl WriteTxn for SqliteTxn {
    async fn insert(&mut self, table: &TableSchema, rows: Vec<Row>) -> Result<(), IndexerError> {
        for row in &rows {
            table.validate(row)?;
            let statement = sql::insert(DIALECT, table, &sql::columns_of(row));
            bind_row(sqlx::query(&statement), table, row)?
                .execute(&mut *self.tx)
                .await
                .map_err(|e| IndexerError::Storage(e.to_string()))?;
        }
        Ok(())
    }

    async fn upsert(&mut self, table: &TableSchema, row: Row) -> Result<(), IndexerError> {
        table.validate(&row)?;
        table.key_of(&row)?;
        let statement = sql::upsert(DIALECT, table, &sql::columns_of(&row));
        bind_row(sqlx::query(&statement), table, &row)?
            .execute(&mut *self.tx)
            .await
            .map_err(|e| IndexerError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn find(&mut self, table: &TableSchema, key: &Row) -> Result<Option<Row>, IndexerError> {
        table.validate(key)?;
        let statement = sql::select_by_key(DIALECT, table, &sql::columns_of(key));
        let found = bind_row(sqlx::query(&statement), table, key)?
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| IndexerError::Storage(e.to_string()))?;
        found.map(|r| decode_row(&r, table)).transpose()
    }

    async fn next_version(&mut self, consumer_name: &str) -> Result<Option<u64>, IndexerError> {
        let row = sqlx::query(&sql::select_next_version(DIALECT))
            .bind(consumer_name)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| IndexerError::Storage(e.to_string()))?;
        Ok(row.map(|r| r.get::<i64, _>("next_version") as u64))
    }

    async fn set_next_version(
        &mut self,
        consumer_name: &str,
        next_version: u64,
    ) -> Result<(), IndexerError> {
        let current = WriteTxn::next_version(self, consumer_name).await?;
        ensure_monotonic(consumer_name, current, next_version)?;
        let version = sql::version_param(consumer_name, next_version)?;

        sqlx::query(&sql::upsert_checkpoint(DIALECT))
            .bind(consumer_name)
            .bind(version)
            .bind(Utc::now().timestamp())
            .execute(&mut *self.tx)
            .await
            .map_err(|e| IndexerError::Storage(e.to_string()))?;

        debug!(consumer = consumer_name, next_version, "checkpoint staged");
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), IndexerError> {
        self.tx
            .commit()
            .await
            .map_err(|e| IndexerError::Storage(e.to_string()))
    }

    async fn rollback(self: Box<Self>) -> Result<(), IndexerError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| IndexerError::Storage(e.to_string()))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
