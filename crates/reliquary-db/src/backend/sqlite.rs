//! SQLite backend via rusqlite and r2d2.
//!
//! Pools are file-backed. The special path `:memory:` gets a uniquely named
//! shared-cache in-memory database instead, so every connection in one pool
//! sees the same data while separate pools stay isolated.

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use reliquary_core::config::{PoolConfig, SqliteConfig};
use reliquary_core::{Error, Result};
use rusqlite::types::{ToSql, ToSqlOutput, Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection, TransactionBehavior};
use std::path::Path;
use std::time::Duration;

use super::{insert_parts, update_parts, ColumnInfo, RowSet, UpsertOutcome};
use crate::dialect::Dialect;
use crate::value::Value;

/// Type alias for the SQLite connection pool.
pub type SqlitePool = Pool<SqliteConnectionManager>;

/// Type alias for a pooled SQLite connection.
pub type SqliteSession = r2d2::PooledConnection<SqliteConnectionManager>;

pub const MEMORY_PATH: &str = ":memory:";

/// Open a pool on the configured database file.
///
/// Creates the parent directory and the database file if they do not exist,
/// and sets WAL journaling plus a busy timeout on every new connection.
pub fn open_pool(config: &SqliteConfig, pool: &PoolConfig) -> Result<SqlitePool> {
    if config.path == Path::new(MEMORY_PATH) {
        return open_memory_pool(pool);
    }

    if let Some(parent) = config.path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::connection(format!(
                    "Failed to create database directory {}: {e}",
                    parent.display()
                ))
            })?;
        }
    }

    let busy_timeout = Duration::from_millis(pool.busy_timeout_ms);
    let manager = SqliteConnectionManager::file(&config.path).with_init(move |conn| {
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")
    });

    build(manager, pool)
}

/// Open a pool on a fresh in-memory database.
pub fn open_memory_pool(pool: &PoolConfig) -> Result<SqlitePool> {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let uri = format!("file:reliquary_mem_{}_{n}?mode=memory&cache=shared", std::process::id());

    let busy_timeout = Duration::from_millis(pool.busy_timeout_ms);
    let manager =
        SqliteConnectionManager::file(uri).with_init(move |conn| conn.busy_timeout(busy_timeout));

    build(manager, pool)
}

fn build(manager: SqliteConnectionManager, pool: &PoolConfig) -> Result<SqlitePool> {
    Pool::builder()
        .max_size(pool.max_size)
        .connection_timeout(Duration::from_secs(pool.connection_timeout_secs))
        .build(manager)
        .map_err(|e| Error::connection(format!("Failed to create connection pool: {e}")))
}

/// Check a connection out of the pool.
pub fn checkout(pool: &SqlitePool) -> Result<SqliteSession> {
    pool.get()
        .map_err(|e| Error::connection(format!("Failed to get connection from pool: {e}")))
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(SqlValue::Null),
            Value::Integer(i) => ToSqlOutput::Owned(SqlValue::Integer(*i)),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Value::Boolean(b) => ToSqlOutput::Owned(SqlValue::Integer(i64::from(*b))),
            Value::Real(f) => ToSqlOutput::Owned(SqlValue::Real(*f)),
            Value::Timestamp(t) => ToSqlOutput::Owned(SqlValue::Integer(t.timestamp_millis())),
            Value::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
            Value::Uuid(u) => ToSqlOutput::Owned(SqlValue::Text(u.to_string())),
        })
    }
}

fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Integer(i),
        ValueRef::Real(f) => Value::Real(f),
        ValueRef::Text(bytes) => Value::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::Blob(bytes.to_vec()),
    }
}

pub fn execute<P: ToSql>(conn: &Connection, sql: &str, params: &[P]) -> Result<usize> {
    conn.execute(sql, params_from_iter(params.iter()))
        .map_err(Error::database)
}

/// Run a query and collect every row.
///
/// The column list is read after stepping. A connection whose schema cache
/// predates an `ALTER TABLE` from another connection re-prepares on the first
/// step, and `SELECT *` then expands to the current columns.
pub fn query<P: ToSql>(conn: &Connection, sql: &str, params: &[P]) -> Result<RowSet> {
    let mut stmt = conn.prepare(sql).map_err(Error::database)?;

    let mut out = Vec::new();
    {
        let mut rows = stmt
            .query(params_from_iter(params.iter()))
            .map_err(Error::database)?;
        while let Some(row) = rows.next().map_err(Error::database)? {
            let width = row.as_ref().column_count();
            let mut values = Vec::with_capacity(width);
            for i in 0..width {
                values.push(from_sql(row.get_ref(i).map_err(Error::database)?));
            }
            out.push(values);
        }
    }

    let columns: Vec<String> = stmt
        .column_names()
        .into_iter()
        .map(String::from)
        .collect();
    Ok(RowSet::new(columns, out))
}

pub fn ddl(conn: &Connection, sql: &str) -> Result<()> {
    conn.execute_batch(sql)
        .map_err(|e| Error::schema(format!("{e} (statement: {sql})")))
}

pub fn table_columns(conn: &Connection, table: &str) -> Result<Vec<ColumnInfo>> {
    let sql = format!("PRAGMA table_info({})", Dialect::Sqlite.quote(table)?);
    let mut stmt = conn.prepare(&sql).map_err(Error::database)?;

    let columns = stmt
        .query_map([], |row| {
            Ok(ColumnInfo {
                name: row.get("name")?,
                declared_type: row.get("type")?,
            })
        })
        .map_err(Error::database)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(Error::database)?;

    Ok(columns)
}

/// Whether `table` has `column`; names compare case-insensitively.
pub fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    Ok(table_columns(conn, table)?
        .iter()
        .any(|c| c.name.eq_ignore_ascii_case(column)))
}

/// UPDATE-then-INSERT inside `BEGIN IMMEDIATE`.
///
/// The immediate transaction takes the write lock up front, so two
/// connections saving the same new identity queue behind each other instead
/// of both seeing zero affected rows.
pub fn upsert(
    conn: &mut Connection,
    table: &str,
    identity: (&str, &Value),
    columns: &[(String, Value)],
) -> Result<UpsertOutcome> {
    let dialect = Dialect::Sqlite;
    let (update_names, update_values) = update_parts(identity.1, columns);
    let update_sql = dialect.update(table, identity.0, &update_names)?;

    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(Error::database)?;

    let affected = execute(&tx, &update_sql, &update_values)?;
    let outcome = if affected == 0 {
        let (insert_names, insert_values) = insert_parts(identity, columns);
        let insert_sql = dialect.insert(table, &insert_names)?;
        execute(&tx, &insert_sql, &insert_values)?;
        UpsertOutcome::Inserted
    } else {
        UpsertOutcome::Updated
    };

    tx.commit().map_err(Error::database)?;
    Ok(outcome)
}
