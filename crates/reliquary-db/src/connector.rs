//! Backend connector: owns the connection pool and its lifecycle.
//!
//! State machine: `Disconnected -> Connecting -> Connected -> Disconnected`.
//! `Connecting` only exists inside [`Connector::connect`]; a failed attempt
//! falls back to `Disconnected`. Every operation checks a connection out of
//! the pool and returns it when the [`Session`] is dropped.

use parking_lot::{Mutex, RwLock};
use reliquary_core::{BackendKind, Error, Result, StorageConfig};

use crate::backend::{sqlite, ColumnInfo, RowSet, Session};
use crate::dialect::Dialect;
use crate::value::{ColumnType, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Clone)]
enum BackendPool {
    Sqlite(sqlite::SqlitePool),
    #[cfg(feature = "mysql")]
    Mysql(crate::backend::mysql::MysqlPool),
}

pub struct Connector {
    config: StorageConfig,
    pool: RwLock<Option<BackendPool>>,
    state: RwLock<ConnectionState>,
    // Serializes connect/disconnect so two callers never open two pools.
    transition: Mutex<()>,
}

impl Connector {
    /// Create a disconnected connector; nothing is opened until [`connect`].
    ///
    /// [`connect`]: Connector::connect
    pub fn new(config: StorageConfig) -> Self {
        Self {
            config,
            pool: RwLock::new(None),
            state: RwLock::new(ConnectionState::Disconnected),
            transition: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn dialect(&self) -> Dialect {
        Dialect::from(self.config.backend)
    }

    /// Open the pool. Returns immediately when already connected.
    ///
    /// For SQLite this creates the database file and its directory.
    pub fn connect(&self) -> Result<()> {
        let _guard = self.transition.lock();
        if self.pool.read().is_some() {
            return Ok(());
        }

        *self.state.write() = ConnectionState::Connecting;
        match self.open() {
            Ok(pool) => {
                *self.pool.write() = Some(pool);
                *self.state.write() = ConnectionState::Connected;
                tracing::info!(backend = %self.config.backend, "Connected to storage backend");
                Ok(())
            }
            Err(e) => {
                *self.state.write() = ConnectionState::Disconnected;
                tracing::warn!(backend = %self.config.backend, "Connection failed: {e}");
                Err(e)
            }
        }
    }

    fn open(&self) -> Result<BackendPool> {
        self.config
            .validate()
            .map_err(|e| Error::connection(e.to_string()))?;

        match self.config.backend {
            BackendKind::Sqlite => {
                let pool = sqlite::open_pool(&self.config.sqlite, &self.config.pool)?;
                // Surface unreadable files and bad paths now, not on first use.
                sqlite::checkout(&pool)?;
                Ok(BackendPool::Sqlite(pool))
            }
            #[cfg(feature = "mysql")]
            BackendKind::Mysql => {
                let pool = crate::backend::mysql::open_pool(&self.config.mysql, &self.config.pool)?;
                Ok(BackendPool::Mysql(pool))
            }
            #[cfg(not(feature = "mysql"))]
            BackendKind::Mysql => Err(Error::connection(
                "MySQL support is not compiled in; rebuild with the `mysql` feature",
            )),
        }
    }

    /// Drop the pool, closing idle connections. Safe to call repeatedly.
    ///
    /// Sessions already checked out stay valid until their operation ends.
    pub fn disconnect(&self) {
        let _guard = self.transition.lock();
        if self.pool.write().take().is_some() {
            tracing::info!(backend = %self.config.backend, "Disconnected from storage backend");
        }
        *self.state.write() = ConnectionState::Disconnected;
    }

    /// Check one connection out of the pool.
    pub fn checkout(&self) -> Result<Session> {
        // Clone the handle so a slow checkout never holds the lock.
        let pool = self
            .pool
            .read()
            .clone()
            .ok_or_else(|| Error::connection("storage is not connected"))?;

        match pool {
            BackendPool::Sqlite(pool) => sqlite::checkout(&pool).map(Session::Sqlite),
            #[cfg(feature = "mysql")]
            BackendPool::Mysql(pool) => crate::backend::mysql::checkout(&pool).map(Session::Mysql),
        }
    }

    pub fn execute(&self, sql: &str, params: &[Value]) -> Result<usize> {
        self.checkout()?.execute(sql, params)
    }

    pub fn query(&self, sql: &str, params: &[Value]) -> Result<RowSet> {
        self.checkout()?.query(sql, params)
    }

    pub fn column_exists(&self, table: &str, column: &str) -> Result<bool> {
        self.checkout()?.column_exists(table, column)
    }

    pub fn table_columns(&self, table: &str) -> Result<Vec<ColumnInfo>> {
        self.checkout()?.table_columns(table)
    }

    pub fn add_column(&self, table: &str, column: &str, column_type: ColumnType) -> Result<()> {
        self.checkout()?.add_column(table, column, column_type)
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("backend", &self.config.backend)
            .field("state", &self.state())
            .finish()
    }
}
