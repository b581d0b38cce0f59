//! SQL text shared by the relational backends.
//!
//! Only statement text lives here; binding values and decoding rows is done
//! by each backend with its own `sqlx` driver types.

use aptindex_core::checkpoint::CHECKPOINT_TABLE;
use aptindex_core::error::IndexerError;
use aptindex_core::store::{ColumnKind, Row, TableSchema};

/// SQL flavour of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
}

impl Dialect {
    /// Bind placeholder for the 1-based parameter `index`.
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Self::Sqlite => "?".to_string(),
            Self::Postgres => format!("${index}"),
        }
    }

    pub fn column_type(self, kind: ColumnKind) -> &'static str {
        match (self, kind) {
            (Self::Sqlite, ColumnKind::Int) => "INTEGER",
            (Self::Sqlite, ColumnKind::Float) => "REAL",
            (Self::Sqlite, ColumnKind::Bool) => "BOOLEAN",
            (Self::Sqlite, ColumnKind::Text) => "TEXT",
            (Self::Sqlite, ColumnKind::Timestamp) => "TEXT",
            (Self::Postgres, ColumnKind::Int) => "BIGINT",
            (Self::Postgres, ColumnKind::Float) => "DOUBLE PRECISION",
            (Self::Postgres, ColumnKind::Bool) => "BOOLEAN",
            (Self::Postgres, ColumnKind::Text) => "TEXT",
            (Self::Postgres, ColumnKind::Timestamp) => "TIMESTAMPTZ",
        }
    }
}

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn placeholders(dialect: Dialect, count: usize) -> String {
    (1..=count)
        .map(|i| dialect.placeholder(i))
        .collect::<Vec<_>>()
        .join(", ")
}

/// `CREATE TABLE IF NOT EXISTS` for a model table.
pub fn create_table(dialect: Dialect, table: &TableSchema) -> String {
    let mut parts: Vec<String> = table
        .columns
        .iter()
        .map(|c| {
            let not_null = if c.primary_key { " NOT NULL" } else { "" };
            format!("{} {}{not_null}", quote(&c.name), dialect.column_type(c.kind))
        })
        .collect();
    let key: Vec<String> = table.primary_key().map(|c| quote(&c.name)).collect();
    if !key.is_empty() {
        parts.push(format!("PRIMARY KEY ({})", key.join(", ")));
    }
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote(&table.name),
        parts.join(", ")
    )
}

/// Checkpoint table DDL.
pub fn create_checkpoint_table(dialect: Dialect) -> String {
    let int = dialect.column_type(ColumnKind::Int);
    format!(
        "CREATE TABLE IF NOT EXISTS {CHECKPOINT_TABLE} (
            consumer_name TEXT   NOT NULL PRIMARY KEY,
            next_version  {int} NOT NULL,
            updated_at    {int} NOT NULL
        )"
    )
}

/// Column names of `row` in bind order.
pub fn columns_of(row: &Row) -> Vec<&str> {
    row.iter().map(|(name, _)| name.as_str()).collect()
}

/// Single-row `INSERT` over the columns present in the row.
pub fn insert(dialect: Dialect, table: &TableSchema, columns: &[&str]) -> String {
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote(&table.name),
        columns.iter().map(|c| quote(c)).collect::<Vec<_>>().join(", "),
        placeholders(dialect, columns.len())
    )
}

/// Insert or update by primary key.
pub fn upsert(dialect: Dialect, table: &TableSchema, columns: &[&str]) -> String {
    let key: Vec<String> = table.primary_key().map(|c| quote(&c.name)).collect();
    let updates: Vec<String> = columns
        .iter()
        .filter(|c| table.column_named(c).map_or(false, |col| !col.primary_key))
        .map(|c| format!("{0} = excluded.{0}", quote(c)))
        .collect();
    let action = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };
    format!(
        "{} ON CONFLICT ({}) {action}",
        insert(dialect, table, columns),
        key.join(", ")
    )
}

/// `SELECT` every column of `table` where the key columns match.
pub fn select_by_key(dialect: Dialect, table: &TableSchema, key_columns: &[&str]) -> String {
    let columns: Vec<String> = table.columns.iter().map(|c| quote(&c.name)).collect();
    let filter: Vec<String> = key_columns
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{} = {}", quote(c), dialect.placeholder(i + 1)))
        .collect();
    format!(
        "SELECT {} FROM {} WHERE {} LIMIT 1",
        columns.join(", "),
        quote(&table.name),
        filter.join(" AND ")
    )
}

/// Every row of `table`, all columns.
pub fn select_all(table: &TableSchema) -> String {
    let columns: Vec<String> = table.columns.iter().map(|c| quote(&c.name)).collect();
    format!("SELECT {} FROM {}", columns.join(", "), quote(&table.name))
}

/// Latest checkpoint for one consumer.
pub fn select_next_version(dialect: Dialect) -> String {
    format!(
        "SELECT next_version FROM {CHECKPOINT_TABLE} WHERE consumer_name = {}
         ORDER BY next_version DESC LIMIT 1",
        dialect.placeholder(1)
    )
}

pub fn select_checkpoints() -> String {
    format!(
        "SELECT consumer_name, next_version, updated_at FROM {CHECKPOINT_TABLE}
         ORDER BY consumer_name"
    )
}

/// Upsert of a checkpoint row: `(consumer_name, next_version, updated_at)`.
pub fn upsert_checkpoint(dialect: Dialect) -> String {
    format!(
        "INSERT INTO {CHECKPOINT_TABLE} (consumer_name, next_version, updated_at)
         VALUES ({})
         ON CONFLICT (consumer_name) DO UPDATE
         SET next_version = excluded.next_version, updated_at = excluded.updated_at",
        placeholders(dialect, 3)
    )
}

/// Checkpoint versions are stored as `BIGINT`.
pub fn version_param(consumer_name: &str, next_version: u64) -> Result<i64, IndexerError> {
    i64::try_from(next_version).map_err(|_| {
        IndexerError::Invariant(format!(
            "{consumer_name}: version {next_version} does not fit a BIGINT column"
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_version_is_refused() {
        assert_eq!(version_param("c", 42).unwrap(), 42);
        let err = version_param("c", u64::MAX).unwrap_err();
        assert!(matches!(err, IndexerError::Invariant(_)));
    }

    fn stats() -> TableSchema {
        TableSchema::new("coin_flip_stats")
            .key("chain_id", ColumnKind::Int)
            .column("total_wins", ColumnKind::Int)
            .column("win_percentage", ColumnKind::Float)
            .column("last_updated", ColumnKind::Timestamp)
    }

    #[test]
    fn ddl_per_dialect() {
        let sqlite = create_table(Dialect::Sqlite, &stats());
        assert_eq!(
            sqlite,
            "CREATE TABLE IF NOT EXISTS \"coin_flip_stats\" (\"chain_id\" INTEGER NOT NULL, \
             \"total_wins\" INTEGER, \"win_percentage\" REAL, \"last_updated\" TEXT, \
             PRIMARY KEY (\"chain_id\"))"
        );
        let pg = create_table(Dialect::Postgres, &stats());
        assert!(pg.contains("\"win_percentage\" DOUBLE PRECISION"));
        assert!(pg.contains("\"last_updated\" TIMESTAMPTZ"));
    }

    #[test]
    fn upsert_updates_only_non_key_columns() {
        let sql = upsert(Dialect::Postgres, &stats(), &["chain_id", "total_wins"]);
        assert_eq!(
            sql,
            "INSERT INTO \"coin_flip_stats\" (\"chain_id\", \"total_wins\") VALUES ($1, $2) \
             ON CONFLICT (\"chain_id\") DO UPDATE SET \"total_wins\" = excluded.\"total_wins\""
        );
    }

    #[test]
    fn upsert_of_key_only_row_does_nothing_on_conflict() {
        let sql = upsert(Dialect::Sqlite, &stats(), &["chain_id"]);
        assert!(sql.ends_with("ON CONFLICT (\"chain_id\") DO NOTHING"));
    }

    #[test]
    fn select_by_key_binds_in_order() {
        let sql = select_by_key(Dialect::Postgres, &stats(), &["chain_id"]);
        assert!(sql.ends_with("WHERE \"chain_id\" = $1 LIMIT 1"));
    }

    #[test]
    fn identifiers_are_quoted() {
        assert_eq!(quote("we\"ird"), "\"we\"\"ird\"");
    }
}
