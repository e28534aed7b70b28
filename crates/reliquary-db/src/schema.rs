//! Schema evolution: tables and columns are created on first use.
//!
//! The engine keeps a per-table cache of the columns it has seen, keyed by
//! lowercased name. Cache hits never touch the backend. Misses take the DDL
//! lock, re-check against the backend, and only then alter the table, so a
//! column is added at most once per process even under concurrent writers.
//! Tables only ever gain columns.

use parking_lot::{Mutex, RwLock};
use reliquary_core::{Error, Result};
use std::collections::HashMap;

use crate::backend::Session;
use crate::dialect::validate_identifier;
use crate::entity::TableSchema;
use crate::value::{ColumnType, Value};

type Columns = HashMap<String, ColumnType>;

#[derive(Debug, Default)]
pub struct SchemaEngine {
    known: RwLock<HashMap<String, Columns>>,
    ddl: Mutex<()>,
}

impl SchemaEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create `schema.table` if needed and add any declared column it lacks.
    pub fn ensure_table(&self, session: &mut Session, schema: &TableSchema) -> Result<()> {
        let key = schema.table.to_ascii_lowercase();
        if self.known.read().contains_key(&key) {
            return Ok(());
        }

        let _ddl = self.ddl.lock();
        if self.known.read().contains_key(&key) {
            return Ok(());
        }

        session.create_table(schema)?;
        let mut columns = load_columns(session, &schema.table)?;

        for column in &schema.columns {
            let lower = column.name.to_ascii_lowercase();
            if !columns.contains_key(&lower) {
                session.add_column(&schema.table, &column.name, column.column_type)?;
                tracing::debug!(table = %schema.table, column = %column.name, "Added declared column");
                columns.insert(lower, column.column_type);
            }
        }

        // Declared types are more precise than what introspection reports.
        columns.insert(
            schema.identity.name.to_ascii_lowercase(),
            schema.identity.column_type,
        );
        for column in &schema.columns {
            columns.insert(column.name.to_ascii_lowercase(), column.column_type);
        }

        tracing::info!(table = %schema.table, columns = columns.len(), "Table ready");
        self.known.write().insert(key, columns);
        Ok(())
    }

    /// Re-read a table's columns from the backend.
    pub fn refresh(&self, session: &mut Session, table: &str) -> Result<()> {
        let _ddl = self.ddl.lock();
        self.refresh_locked(session, table)
    }

    fn refresh_locked(&self, session: &mut Session, table: &str) -> Result<()> {
        let fresh = load_columns(session, table)?;
        let mut known = self.known.write();
        let entry = known.entry(table.to_ascii_lowercase()).or_default();
        for (name, column_type) in fresh {
            // Keep richer declared types already cached.
            entry.entry(name).or_insert(column_type);
        }
        Ok(())
    }

    /// Make sure `table.column` exists, inferring its type from `sample`.
    ///
    /// Returns `true` when this call added the column. Existing columns are
    /// a no-op whatever the sample, so `Null` is only rejected for columns
    /// that would have to be created.
    pub fn ensure_column(
        &self,
        session: &mut Session,
        table: &str,
        column: &str,
        sample: &Value,
    ) -> Result<bool> {
        validate_identifier(table)?;
        validate_identifier(column)?;

        if self.column_type(table, column).is_some() {
            return Ok(false);
        }

        let _ddl = self.ddl.lock();
        if self.column_type(table, column).is_some() {
            return Ok(false);
        }

        // Another process may have added it since we last looked.
        if session.column_exists(table, column)? {
            self.refresh_locked(session, table)?;
            return Ok(false);
        }

        let column_type = ColumnType::infer(sample)?;
        if let Err(e) = session.add_column(table, column, column_type) {
            if session.column_exists(table, column).unwrap_or(false) {
                self.refresh_locked(session, table)?;
                return Ok(false);
            }
            return Err(e);
        }

        tracing::debug!(%table, %column, %column_type, "Added column");
        self.remember(table, column, column_type);
        Ok(true)
    }

    /// Whether `table.column` exists, consulting the backend on a cache miss.
    pub fn has_column(&self, session: &mut Session, table: &str, column: &str) -> Result<bool> {
        if self.column_type(table, column).is_some() {
            return Ok(true);
        }
        let exists = session.column_exists(table, column)?;
        if exists {
            self.refresh(session, table)?;
        }
        Ok(exists)
    }

    /// Record the columns of a result set as known.
    ///
    /// Columns added by another store or process since the cache warmed
    /// trigger one refresh, so their declared types are used from then on.
    pub fn observe(&self, session: &mut Session, table: &str, columns: &[String]) -> Result<()> {
        if columns
            .iter()
            .all(|column| self.column_type(table, column).is_some())
        {
            return Ok(());
        }
        tracing::debug!(%table, "Result has unknown columns, refreshing");
        self.refresh(session, table)
    }

    /// Cached type of a column, if the engine has seen it.
    pub fn column_type(&self, table: &str, column: &str) -> Option<ColumnType> {
        self.known
            .read()
            .get(&table.to_ascii_lowercase())?
            .get(&column.to_ascii_lowercase())
            .copied()
    }

    /// Forget everything; the next use of each table re-reads the backend.
    pub fn clear(&self) {
        self.known.write().clear();
    }

    fn remember(&self, table: &str, column: &str, column_type: ColumnType) {
        self.known
            .write()
            .entry(table.to_ascii_lowercase())
            .or_default()
            .insert(column.to_ascii_lowercase(), column_type);
    }
}

fn load_columns(session: &mut Session, table: &str) -> Result<Columns> {
    let columns = session.table_columns(table)?;
    if columns.is_empty() {
        return Err(Error::schema(format!("table '{table}' does not exist")));
    }
    Ok(columns
        .into_iter()
        .map(|c| {
            (
                c.name.to_ascii_lowercase(),
                ColumnType::from_declared(&c.declared_type),
            )
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sqlite;
    use crate::entity::ColumnDef;
    use reliquary_core::config::PoolConfig;

    fn session() -> (sqlite::SqlitePool, Session) {
        let pool = sqlite::open_memory_pool(&PoolConfig::default()).unwrap();
        let session = Session::Sqlite(sqlite::checkout(&pool).unwrap());
        (pool, session)
    }

    fn players() -> TableSchema {
        TableSchema {
            table: "players".into(),
            identity: ColumnDef::new("uuid", ColumnType::Text),
            columns: vec![ColumnDef::new("username", ColumnType::Text)],
        }
    }

    #[test]
    fn ensure_table_creates_and_caches() {
        let (_pool, mut session) = session();
        let engine = SchemaEngine::new();
        engine.ensure_table(&mut session, &players()).unwrap();

        assert!(session.column_exists("players", "username").unwrap());
        assert_eq!(engine.column_type("players", "uuid"), Some(ColumnType::Text));
        assert_eq!(engine.column_type("PLAYERS", "Username"), Some(ColumnType::Text));
    }

    #[test]
    fn ensure_table_adds_new_declared_columns() {
        let (_pool, mut session) = session();
        session
            .execute("CREATE TABLE players (uuid TEXT PRIMARY KEY)", &[])
            .unwrap();

        let engine = SchemaEngine::new();
        engine.ensure_table(&mut session, &players()).unwrap();
        assert!(session.column_exists("players", "username").unwrap());
    }

    #[test]
    fn ensure_column_adds_once() {
        let (_pool, mut session) = session();
        let engine = SchemaEngine::new();
        engine.ensure_table(&mut session, &players()).unwrap();

        let sample = Value::from(5);
        assert!(engine
            .ensure_column(&mut session, "players", "level", &sample)
            .unwrap());
        assert!(!engine
            .ensure_column(&mut session, "players", "level", &sample)
            .unwrap());
        assert!(!engine
            .ensure_column(&mut session, "players", "LEVEL", &Value::from("x"))
            .unwrap());

        assert!(session.column_exists("players", "level").unwrap());
        assert_eq!(engine.column_type("players", "level"), Some(ColumnType::Integer));
    }

    #[test]
    fn ensure_column_sees_columns_added_elsewhere() {
        let (_pool, mut session) = session();
        let engine = SchemaEngine::new();
        engine.ensure_table(&mut session, &players()).unwrap();

        session
            .add_column("players", "vip", ColumnType::Boolean)
            .unwrap();
        assert!(!engine
            .ensure_column(&mut session, "players", "vip", &Value::from(true))
            .unwrap());
        assert_eq!(engine.column_type("players", "vip"), Some(ColumnType::Boolean));
    }

    #[test]
    fn observe_learns_columns_added_elsewhere() {
        let (_pool, mut session) = session();
        let engine = SchemaEngine::new();
        engine.ensure_table(&mut session, &players()).unwrap();
        session
            .add_column("players", "vip", ColumnType::Boolean)
            .unwrap();

        let columns = vec!["uuid".to_string(), "username".to_string(), "vip".to_string()];
        engine.observe(&mut session, "players", &columns).unwrap();
        assert_eq!(engine.column_type("players", "vip"), Some(ColumnType::Boolean));
        assert_eq!(engine.column_type("players", "uuid"), Some(ColumnType::Text));
    }

    #[test]
    fn null_sample_is_unsupported_and_leaves_table_unchanged() {
        let (_pool, mut session) = session();
        let engine = SchemaEngine::new();
        engine.ensure_table(&mut session, &players()).unwrap();

        let err = engine
            .ensure_column(&mut session, "players", "nickname", &Value::Null)
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedType(_)));
        assert!(!session.column_exists("players", "nickname").unwrap());
        assert_eq!(session.table_columns("players").unwrap().len(), 2);
    }

    #[test]
    fn null_sample_for_existing_column_is_fine() {
        let (_pool, mut session) = session();
        let engine = SchemaEngine::new();
        engine.ensure_table(&mut session, &players()).unwrap();
        assert!(!engine
            .ensure_column(&mut session, "players", "username", &Value::Null)
            .unwrap());
    }

    #[test]
    fn invalid_column_name_is_rejected() {
        let (_pool, mut session) = session();
        let engine = SchemaEngine::new();
        engine.ensure_table(&mut session, &players()).unwrap();

        let err = engine
            .ensure_column(&mut session, "players", "x; DROP TABLE players", &Value::from(1))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidIdentifier(_)));
    }

    #[test]
    fn missing_table_is_schema_error() {
        let (_pool, mut session) = session();
        let engine = SchemaEngine::new();
        let err = engine
            .ensure_column(&mut session, "ghosts", "coins", &Value::from(1))
            .unwrap_err();
        assert!(matches!(err, Error::Schema(_)));
    }

    #[test]
    fn clear_forgets_cache() {
        let (_pool, mut session) = session();
        let engine = SchemaEngine::new();
        engine.ensure_table(&mut session, &players()).unwrap();
        engine.clear();
        assert_eq!(engine.column_type("players", "uuid"), None);
        assert!(engine.has_column(&mut session, "players", "uuid").unwrap());
        assert_eq!(engine.column_type("players", "uuid"), Some(ColumnType::Text));
    }
}
