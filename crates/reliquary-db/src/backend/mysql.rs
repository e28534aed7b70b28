//! MySQL backend via the `mysql` driver and `r2d2_mysql`.

use r2d2::Pool;
use r2d2_mysql::mysql::prelude::Queryable;
use r2d2_mysql::mysql::{Error as MysqlError, OptsBuilder, Params, TxOpts, Value as MyValue};
use r2d2_mysql::MySqlConnectionManager;
use reliquary_core::config::{MysqlConfig, PoolConfig};
use reliquary_core::{Error, Result};
use std::borrow::Borrow;
use std::time::Duration;

use super::{insert_parts, update_parts, ColumnInfo, RowSet, UpsertOutcome};
use crate::dialect::Dialect;
use crate::value::Value;

pub type MysqlPool = Pool<MySqlConnectionManager>;

pub type MysqlSession = r2d2::PooledConnection<MySqlConnectionManager>;

/// Character set number MySQL reports for binary columns.
const BINARY_CHARSET: u16 = 63;

pub fn open_pool(config: &MysqlConfig, pool: &PoolConfig) -> Result<MysqlPool> {
    let (host, port) = config.host_and_port()?;

    // Found rows, not changed rows: an UPDATE that rewrites identical values
    // must still count as a match for the upsert.
    let opts = OptsBuilder::new()
        .ip_or_hostname(Some(host))
        .tcp_port(port)
        .db_name(Some(config.database.clone()))
        .user(Some(config.username.clone()))
        .pass(Some(config.password.clone()))
        .client_found_rows(true);

    Pool::builder()
        .max_size(pool.max_size)
        .connection_timeout(Duration::from_secs(pool.connection_timeout_secs))
        .build(MySqlConnectionManager::new(opts))
        .map_err(|e| {
            Error::connection(format!(
                "Failed to connect to MySQL at {}: {e}",
                config.address
            ))
        })
}

pub fn checkout(pool: &MysqlPool) -> Result<MysqlSession> {
    pool.get()
        .map_err(|e| Error::connection(format!("Failed to get connection from pool: {e}")))
}

fn to_mysql(value: &Value) -> MyValue {
    match value {
        Value::Null => MyValue::NULL,
        Value::Integer(i) => MyValue::Int(*i),
        Value::Text(s) => MyValue::Bytes(s.clone().into_bytes()),
        Value::Boolean(b) => MyValue::Int(i64::from(*b)),
        Value::Real(f) => MyValue::Double(*f),
        Value::Timestamp(t) => MyValue::Int(t.timestamp_millis()),
        Value::Blob(b) => MyValue::Bytes(b.clone()),
        Value::Uuid(u) => MyValue::Bytes(u.to_string().into_bytes()),
    }
}

fn from_mysql(value: MyValue, binary: bool) -> Value {
    match value {
        MyValue::NULL => Value::Null,
        MyValue::Int(i) => Value::Integer(i),
        MyValue::UInt(u) => i64::try_from(u)
            .map(Value::Integer)
            .unwrap_or(Value::Real(u as f64)),
        MyValue::Float(f) => Value::Real(f64::from(f)),
        MyValue::Double(f) => Value::Real(f),
        MyValue::Bytes(bytes) if binary => Value::Blob(bytes),
        MyValue::Bytes(bytes) => match String::from_utf8(bytes) {
            Ok(s) => Value::Text(s),
            Err(e) => Value::Blob(e.into_bytes()),
        },
        MyValue::Date(year, month, day, hour, minute, second, micros) => {
            chrono::NaiveDate::from_ymd_opt(i32::from(year), u32::from(month), u32::from(day))
                .and_then(|d| {
                    d.and_hms_micro_opt(u32::from(hour), u32::from(minute), u32::from(second), micros)
                })
                .map(|t| Value::Timestamp(t.and_utc()))
                .unwrap_or(Value::Null)
        }
        other @ MyValue::Time(..) => Value::Text(other.as_sql(true)),
    }
}

fn params<V: Borrow<Value>>(values: &[V]) -> Params {
    if values.is_empty() {
        Params::Empty
    } else {
        Params::Positional(values.iter().map(|v| to_mysql(v.borrow())).collect())
    }
}

pub fn execute<V: Borrow<Value>>(conn: &mut MysqlSession, sql: &str, values: &[V]) -> Result<usize> {
    conn.exec_drop(sql, params(values)).map_err(Error::database)?;
    Ok(conn.affected_rows() as usize)
}

pub fn query<V: Borrow<Value>>(conn: &mut MysqlSession, sql: &str, values: &[V]) -> Result<RowSet> {
    let mut result = conn.exec_iter(sql, params(values)).map_err(Error::database)?;

    let (columns, binary): (Vec<String>, Vec<bool>) = result
        .columns()
        .as_ref()
        .iter()
        .map(|c| (c.name_str().into_owned(), c.character_set() == BINARY_CHARSET))
        .unzip();

    let mut rows = Vec::new();
    for row in result.by_ref() {
        let row = row.map_err(Error::database)?;
        let values = row
            .unwrap()
            .into_iter()
            .zip(binary.iter())
            .map(|(v, &is_binary)| from_mysql(v, is_binary))
            .collect();
        rows.push(values);
    }

    Ok(RowSet::new(columns, rows))
}

pub fn ddl(conn: &mut MysqlSession, sql: &str) -> Result<()> {
    conn.query_drop(sql)
        .map_err(|e| Error::schema(format!("{e} (statement: {sql})")))
}

pub fn table_columns(conn: &mut MysqlSession, table: &str) -> Result<Vec<ColumnInfo>> {
    let rows = query(
        conn,
        "SELECT COLUMN_NAME, COLUMN_TYPE FROM information_schema.columns \
         WHERE table_schema = DATABASE() AND table_name = ? ORDER BY ORDINAL_POSITION",
        &[Value::from(table)],
    )?;

    Ok((0..rows.len())
        .filter_map(|i| {
            let name = rows.get(i, "COLUMN_NAME")?.to_string();
            let declared_type = rows.get(i, "COLUMN_TYPE")?.to_string();
            Some(ColumnInfo {
                name,
                declared_type,
            })
        })
        .collect())
}

pub fn column_exists(conn: &mut MysqlSession, table: &str, column: &str) -> Result<bool> {
    let rows = query(
        conn,
        "SELECT 1 FROM information_schema.columns \
         WHERE table_schema = DATABASE() AND table_name = ? AND column_name = ?",
        &[Value::from(table), Value::from(column)],
    )?;
    Ok(!rows.is_empty())
}

/// Server errors that abort one upsert attempt but not the next: InnoDB
/// deadlock, and a duplicate key from losing the insert race. Two first
/// saves of one identity both gap-lock on the empty UPDATE, so one of them
/// is rolled back and retried, and its UPDATE then finds the row.
const RETRYABLE_CODES: [u16; 2] = [1213, 1062];
const UPSERT_ATTEMPTS: usize = 3;

/// UPDATE-then-INSERT in one transaction, retried on deadlock.
pub fn upsert(
    conn: &mut MysqlSession,
    table: &str,
    identity: (&str, &Value),
    columns: &[(String, Value)],
) -> Result<UpsertOutcome> {
    let dialect = Dialect::Mysql;
    let (update_names, update_values) = update_parts(identity.1, columns);
    let update_sql = dialect.update(table, identity.0, &update_names)?;
    let (insert_names, insert_values) = insert_parts(identity, columns);
    let insert_sql = dialect.insert(table, &insert_names)?;

    let mut attempt = 1;
    loop {
        let update = (update_sql.as_str(), update_values.as_slice());
        let insert = (insert_sql.as_str(), insert_values.as_slice());
        match try_upsert(conn, update, insert) {
            Err(e) if attempt < UPSERT_ATTEMPTS && is_retryable(&e) => {
                tracing::debug!(%table, attempt, "Retrying upsert: {e}");
                attempt += 1;
            }
            result => return result.map_err(Error::database),
        }
    }
}

fn try_upsert(
    conn: &mut MysqlSession,
    update: (&str, &[&Value]),
    insert: (&str, &[&Value]),
) -> std::result::Result<UpsertOutcome, MysqlError> {
    let mut tx = conn.start_transaction(TxOpts::default())?;

    tx.exec_drop(update.0, params(update.1))?;
    let outcome = if tx.affected_rows() == 0 {
        tx.exec_drop(insert.0, params(insert.1))?;
        UpsertOutcome::Inserted
    } else {
        UpsertOutcome::Updated
    };

    tx.commit()?;
    Ok(outcome)
}

fn is_retryable(error: &MysqlError) -> bool {
    matches!(error, MysqlError::MySqlError(server) if RETRYABLE_CODES.contains(&server.code))
}
