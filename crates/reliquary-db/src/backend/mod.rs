//! Backend connections.
//!
//! A [`Session`] is one connection checked out of the pool for the length of
//! a single operation. It is returned to the pool when dropped, on every exit
//! path. The per-engine statement code lives in [`sqlite`] and `mysql`.

#[cfg(feature = "mysql")]
pub mod mysql;
pub mod sqlite;

use reliquary_core::Result;

use crate::dialect::Dialect;
use crate::entity::TableSchema;
use crate::value::{ColumnType, Value};

/// Result rows of a query, with column names in select order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowSet {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl RowSet {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self { columns, rows }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Value of `column` in row `index`, if both exist.
    pub fn get(&self, index: usize, column: &str) -> Option<&Value> {
        let position = self
            .columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column))?;
        self.rows.get(index).and_then(|row| row.get(position))
    }

    pub fn into_parts(self) -> (Vec<String>, Vec<Vec<Value>>) {
        (self.columns, self.rows)
    }
}

/// A column as reported by backend introspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    /// Type name exactly as the backend reports it.
    pub declared_type: String,
}

/// Which branch an upsert took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Updated,
    Inserted,
}

/// A pooled connection to one of the supported engines.
pub enum Session {
    Sqlite(sqlite::SqliteSession),
    #[cfg(feature = "mysql")]
    Mysql(mysql::MysqlSession),
}

impl Session {
    pub fn dialect(&self) -> Dialect {
        match self {
            Session::Sqlite(_) => Dialect::Sqlite,
            #[cfg(feature = "mysql")]
            Session::Mysql(_) => Dialect::Mysql,
        }
    }

    /// Run a statement and return the number of affected rows.
    pub fn execute(&mut self, sql: &str, params: &[Value]) -> Result<usize> {
        match self {
            Session::Sqlite(conn) => sqlite::execute(conn, sql, params),
            #[cfg(feature = "mysql")]
            Session::Mysql(conn) => mysql::execute(conn, sql, params),
        }
    }

    pub fn query(&mut self, sql: &str, params: &[Value]) -> Result<RowSet> {
        match self {
            Session::Sqlite(conn) => sqlite::query(conn, sql, params),
            #[cfg(feature = "mysql")]
            Session::Mysql(conn) => mysql::query(conn, sql, params),
        }
    }

    pub fn column_exists(&mut self, table: &str, column: &str) -> Result<bool> {
        match self {
            Session::Sqlite(conn) => sqlite::column_exists(conn, table, column),
            #[cfg(feature = "mysql")]
            Session::Mysql(conn) => mysql::column_exists(conn, table, column),
        }
    }

    pub fn table_columns(&mut self, table: &str) -> Result<Vec<ColumnInfo>> {
        match self {
            Session::Sqlite(conn) => sqlite::table_columns(conn, table),
            #[cfg(feature = "mysql")]
            Session::Mysql(conn) => mysql::table_columns(conn, table),
        }
    }

    pub fn create_table(&mut self, schema: &TableSchema) -> Result<()> {
        let sql = self.dialect().create_table(schema)?;
        self.ddl(&sql)
    }

    pub fn add_column(&mut self, table: &str, column: &str, column_type: ColumnType) -> Result<()> {
        let sql = self.dialect().add_column(table, column, column_type)?;
        self.ddl(&sql)
    }

    /// Update the row keyed by `identity`, inserting it when no row matched.
    ///
    /// Both statements share one transaction on this connection.
    pub fn upsert(
        &mut self,
        table: &str,
        identity: (&str, &Value),
        columns: &[(String, Value)],
    ) -> Result<UpsertOutcome> {
        match self {
            Session::Sqlite(conn) => sqlite::upsert(conn, table, identity, columns),
            #[cfg(feature = "mysql")]
            Session::Mysql(conn) => mysql::upsert(conn, table, identity, columns),
        }
    }

    fn ddl(&mut self, sql: &str) -> Result<()> {
        match self {
            Session::Sqlite(conn) => sqlite::ddl(conn, sql),
            #[cfg(feature = "mysql")]
            Session::Mysql(conn) => mysql::ddl(conn, sql),
        }
    }
}

/// Split upsert columns into the UPDATE statement's names and bound values.
pub(crate) fn update_parts<'a>(
    identity: &'a Value,
    columns: &'a [(String, Value)],
) -> (Vec<&'a str>, Vec<&'a Value>) {
    if columns.is_empty() {
        return (Vec::new(), vec![identity, identity]);
    }

    let names = columns.iter().map(|(name, _)| name.as_str()).collect();
    let mut values: Vec<&Value> = columns.iter().map(|(_, value)| value).collect();
    values.push(identity);
    (names, values)
}

/// Names and values for the INSERT branch: identity first.
pub(crate) fn insert_parts<'a>(
    identity: (&'a str, &'a Value),
    columns: &'a [(String, Value)],
) -> (Vec<&'a str>, Vec<&'a Value>) {
    let (identity_column, identity_value) = identity;
    let mut names = vec![identity_column];
    let mut values = vec![identity_value];
    for (name, value) in columns {
        names.push(name.as_str());
        values.push(value);
    }
    (names, values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rowset_lookup_is_case_insensitive() {
        let rows = RowSet::new(
            vec!["uuid".into(), "Coins".into()],
            vec![vec![Value::from("abc"), Value::from(100)]],
        );
        assert_eq!(rows.get(0, "coins"), Some(&Value::Integer(100)));
        assert_eq!(rows.get(1, "coins"), None);
        assert_eq!(rows.get(0, "missing"), None);
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn update_parts_binds_identity_last() {
        let id = Value::from("abc");
        let columns = vec![("coins".to_string(), Value::from(100))];
        let (names, values) = update_parts(&id, &columns);
        assert_eq!(names, vec!["coins"]);
        assert_eq!(values, vec![&Value::Integer(100), &id]);
    }

    #[test]
    fn update_parts_without_columns_binds_identity_twice() {
        let id = Value::from("abc");
        let (names, values) = update_parts(&id, &[]);
        assert!(names.is_empty());
        assert_eq!(values, vec![&id, &id]);
    }

    #[test]
    fn insert_parts_leads_with_identity() {
        let id = Value::from("abc");
        let columns = vec![("username".to_string(), Value::from("Bob"))];
        let (names, values) = insert_parts(("uuid", &id), &columns);
        assert_eq!(names, vec!["uuid", "username"]);
        assert_eq!(values, vec![&id, &Value::from("Bob")]);
    }
}
