//! SQL text generation per backend.
//!
//! Values always travel as bound parameters. The only things ever
//! interpolated into statement text are table and column names, and those
//! must pass [`validate_identifier`] first.

use reliquary_core::{BackendKind, Error, Result};

use crate::entity::TableSchema;
use crate::value::ColumnType;

/// Longest identifier accepted by both SQLite and MySQL.
pub const MAX_IDENTIFIER_LEN: usize = 64;

/// Reject anything that is not a plain `[A-Za-z_][A-Za-z0-9_]*` token.
pub fn validate_identifier(name: &str) -> Result<&str> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if valid_start && valid_rest && name.len() <= MAX_IDENTIFIER_LEN {
        Ok(name)
    } else {
        Err(Error::InvalidIdentifier(name.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Mysql,
}

impl From<BackendKind> for Dialect {
    fn from(kind: BackendKind) -> Self {
        match kind {
            BackendKind::Sqlite => Dialect::Sqlite,
            BackendKind::Mysql => Dialect::Mysql,
        }
    }
}

impl Dialect {
    /// Validate and quote an identifier.
    pub fn quote(&self, name: &str) -> Result<String> {
        let name = validate_identifier(name)?;
        Ok(match self {
            Dialect::Sqlite => format!("\"{name}\""),
            Dialect::Mysql => format!("`{name}`"),
        })
    }

    /// Column type used for attributes, including the default for new rows.
    pub fn column_definition(&self, column_type: ColumnType) -> &'static str {
        match (self, column_type) {
            (Dialect::Sqlite, ColumnType::Integer) => "INTEGER DEFAULT 0",
            (Dialect::Sqlite, ColumnType::Text) => "TEXT",
            (Dialect::Sqlite, ColumnType::Boolean) => "BOOLEAN DEFAULT FALSE",
            (Dialect::Sqlite, ColumnType::Real) => "REAL",
            (Dialect::Sqlite, ColumnType::Timestamp) => "INTEGER DEFAULT 0",
            (Dialect::Sqlite, ColumnType::Blob) => "BLOB",
            (Dialect::Sqlite, ColumnType::Uuid) => "TEXT",

            (Dialect::Mysql, ColumnType::Integer) => "BIGINT DEFAULT 0",
            (Dialect::Mysql, ColumnType::Text) => "TEXT",
            (Dialect::Mysql, ColumnType::Boolean) => "BOOLEAN DEFAULT FALSE",
            (Dialect::Mysql, ColumnType::Real) => "DOUBLE",
            (Dialect::Mysql, ColumnType::Timestamp) => "BIGINT DEFAULT 0",
            (Dialect::Mysql, ColumnType::Blob) => "LONGBLOB",
            (Dialect::Mysql, ColumnType::Uuid) => "VARCHAR(36)",
        }
    }

    /// Column type of the identity column. MySQL cannot key on unbounded TEXT.
    pub fn identity_definition(&self, column_type: ColumnType) -> String {
        let base = match (self, column_type) {
            (Dialect::Sqlite, ColumnType::Integer | ColumnType::Timestamp) => "INTEGER",
            (Dialect::Mysql, ColumnType::Integer | ColumnType::Timestamp) => "BIGINT",
            (Dialect::Mysql, ColumnType::Text) => "VARCHAR(255)",
            (Dialect::Mysql, ColumnType::Blob) => "VARBINARY(255)",
            (dialect, other) => dialect.column_definition(other),
        };
        format!("{base} PRIMARY KEY")
    }

    pub fn create_table(&self, schema: &TableSchema) -> Result<String> {
        let mut definitions = vec![format!(
            "{} {}",
            self.quote(&schema.identity.name)?,
            self.identity_definition(schema.identity.column_type)
        )];
        for column in &schema.columns {
            definitions.push(format!(
                "{} {}",
                self.quote(&column.name)?,
                self.column_definition(column.column_type)
            ));
        }

        Ok(format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            self.quote(&schema.table)?,
            definitions.join(", ")
        ))
    }

    pub fn add_column(&self, table: &str, column: &str, column_type: ColumnType) -> Result<String> {
        Ok(format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            self.quote(table)?,
            self.quote(column)?,
            self.column_definition(column_type)
        ))
    }

    /// `SELECT *`, optionally filtered on one column bound as `?`.
    pub fn select(&self, table: &str, filter: Option<&str>) -> Result<String> {
        let mut sql = format!("SELECT * FROM {}", self.quote(table)?);
        if let Some(column) = filter {
            sql.push_str(&format!(" WHERE {} = ?", self.quote(column)?));
        }
        Ok(sql)
    }

    /// `UPDATE` binding each column in order, then the identity.
    ///
    /// With no columns the identity is assigned to itself so the affected-row
    /// count still reports whether the row exists.
    pub fn update<S: AsRef<str>>(&self, table: &str, identity: &str, columns: &[S]) -> Result<String> {
        let identity = self.quote(identity)?;
        let assignments = if columns.is_empty() {
            format!("{identity} = ?")
        } else {
            columns
                .iter()
                .map(|c| Ok(format!("{} = ?", self.quote(c.as_ref())?)))
                .collect::<Result<Vec<_>>>()?
                .join(", ")
        };

        Ok(format!(
            "UPDATE {} SET {assignments} WHERE {identity} = ?",
            self.quote(table)?
        ))
    }

    pub fn insert<S: AsRef<str>>(&self, table: &str, columns: &[S]) -> Result<String> {
        let names = columns
            .iter()
            .map(|c| self.quote(c.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        let placeholders = vec!["?"; names.len()].join(", ");

        Ok(format!(
            "INSERT INTO {} ({}) VALUES ({placeholders})",
            self.quote(table)?,
            names.join(", ")
        ))
    }

    pub fn delete(&self, table: &str, identity: &str) -> Result<String> {
        Ok(format!(
            "DELETE FROM {} WHERE {} = ?",
            self.quote(table)?,
            self.quote(identity)?
        ))
    }
}
