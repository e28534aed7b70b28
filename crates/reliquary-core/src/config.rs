//! Storage configuration types.
//!
//! [`StorageConfig`] selects the backend once at startup and carries the
//! connection parameters for it. Every section defaults sensibly so an empty
//! `[storage]` table yields a file-backed SQLite store.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{Error, Result};

/// Which SQL engine backs the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Embedded, file-backed SQLite database.
    #[default]
    #[serde(alias = "embedded", alias = "SQLite")]
    Sqlite,
    /// Networked MySQL/MariaDB server.
    #[serde(alias = "networked", alias = "MySQL")]
    Mysql,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Sqlite => write!(f, "sqlite"),
            BackendKind::Mysql => write!(f, "mysql"),
        }
    }
}

/// Root storage configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(rename = "type", default)]
    pub backend: BackendKind,

    #[serde(default)]
    pub sqlite: SqliteConfig,

    #[serde(default)]
    pub mysql: MysqlConfig,

    #[serde(default)]
    pub pool: PoolConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SqliteConfig {
    /// Database file; created on first connect.
    #[serde(default = "default_sqlite_path")]
    pub path: PathBuf,
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("data").join("data.db")
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: default_sqlite_path(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MysqlConfig {
    /// `host` or `host:port`
    #[serde(default)]
    pub address: String,

    #[serde(default)]
    pub database: String,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,
}

impl MysqlConfig {
    /// Split `address` into host and port, defaulting the port to 3306.
    pub fn host_and_port(&self) -> Result<(String, u16)> {
        match self.address.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| {
                    Error::connection(format!("invalid port in address '{}'", self.address))
                })?;
                Ok((host.to_string(), port))
            }
            None => Ok((self.address.clone(), 3306)),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolConfig {
    /// Maximum number of pooled connections.
    #[serde(default = "default_max_size")]
    pub max_size: u32,

    /// How long a checkout may wait for a free connection.
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,

    /// SQLite only: how long a writer waits on a locked database.
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,
}

fn default_max_size() -> u32 {
    4
}
fn default_connection_timeout() -> u64 {
    30
}
fn default_busy_timeout() -> u64 {
    5000
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
            connection_timeout_secs: default_connection_timeout(),
            busy_timeout_ms: default_busy_timeout(),
        }
    }
}

impl StorageConfig {
    /// SQLite store at the given file path with default pool settings.
    pub fn sqlite(path: impl Into<PathBuf>) -> Self {
        Self {
            backend: BackendKind::Sqlite,
            sqlite: SqliteConfig { path: path.into() },
            ..Default::default()
        }
    }

    /// Check that the selected backend has everything it needs to connect.
    pub fn validate(&self) -> Result<()> {
        if self.pool.max_size == 0 {
            return Err(Error::configuration("storage.pool.max_size cannot be 0"));
        }

        match self.backend {
            BackendKind::Sqlite => {
                if self.sqlite.path.as_os_str().is_empty() {
                    return Err(Error::configuration("storage.sqlite.path is empty"));
                }
            }
            BackendKind::Mysql => {
                if self.mysql.address.is_empty() {
                    return Err(Error::configuration("storage.mysql.address is required"));
                }
                if self.mysql.database.is_empty() {
                    return Err(Error::configuration("storage.mysql.database is required"));
                }
                if self.mysql.username.is_empty() {
                    return Err(Error::configuration("storage.mysql.username is required"));
                }
                if self.mysql.password.is_empty() {
                    tracing::warn!("storage.mysql.password is empty");
                }
                self.mysql.host_and_port()?;
            }
        }

        Ok(())
    }
}
