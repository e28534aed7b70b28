//! The store: asynchronous load, save and delete of entity records.
//!
//! A `Store` is cheap to clone; clones share one connector and one schema
//! cache. Methods that need an entity mapping return `Result<Pending<_>>`:
//! a broken mapping fails immediately, everything else completes the
//! [`Pending`].
//!
//! Saving is an upsert. The row is updated by identity and inserted when the
//! update matched nothing, with both statements in one transaction. There is
//! no separate create call, so a record needs its identity before its first
//! save.

use parking_lot::RwLock;
use reliquary_core::{Error, Result, StorageConfig};
use std::collections::HashMap;
use std::sync::Arc;

use crate::backend::{RowSet, Session, UpsertOutcome};
use crate::connector::{ConnectionState, Connector};
use crate::dialect::validate_identifier;
use crate::entity::{descriptor_of, Entity, EntityDescriptor, TableSchema};
use crate::record::Record;
use crate::schema::SchemaEngine;
use crate::task::{submit, Pending};
use crate::value::{ColumnType, Value};

#[derive(Clone)]
pub struct Store {
    inner: Arc<Inner>,
}

struct Inner {
    connector: Connector,
    schema: SchemaEngine,
    registered: RwLock<HashMap<String, TableSchema>>,
}

impl Store {
    pub fn new(config: StorageConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector: Connector::new(config),
                schema: SchemaEngine::new(),
                registered: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Register an entity type so its table is created on [`connect`].
    ///
    /// Unregistered types still work; their table is created on first use.
    ///
    /// [`connect`]: Store::connect
    pub fn register<E: Entity>(&self) -> Result<()> {
        let descriptor = descriptor_of::<E>()?;
        let schema = descriptor.schema().clone();
        self.inner
            .registered
            .write()
            .insert(schema.table.to_ascii_lowercase(), schema);
        Ok(())
    }

    /// Connect and create the tables of every registered entity type.
    ///
    /// Blocks the calling thread; call it during startup.
    pub fn connect(&self) -> Result<()> {
        self.inner.connector.connect()?;

        let schemas: Vec<TableSchema> = self.inner.registered.read().values().cloned().collect();
        if schemas.is_empty() {
            return Ok(());
        }

        let mut session = self.inner.connector.checkout()?;
        for schema in &schemas {
            self.inner.schema.ensure_table(&mut session, schema)?;
        }
        Ok(())
    }

    /// Close the pool and forget cached schema. Safe to call repeatedly.
    pub fn disconnect(&self) {
        self.inner.connector.disconnect();
        self.inner.schema.clear();
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.connector.state()
    }

    pub fn connector(&self) -> &Connector {
        &self.inner.connector
    }

    /// Cached type of `table.column`, if the store has seen that column.
    pub fn column_type(&self, table: &str, column: &str) -> Option<ColumnType> {
        self.inner.schema.column_type(table, column)
    }

    /// Wrap an entity in a record bound to this store. Nothing is written.
    pub fn new_record<E: Entity>(&self, entity: E) -> Result<Record<E>> {
        Ok(Record::new(entity, descriptor_of::<E>()?, self.clone()))
    }

    /// A fresh record with only its identity set, pending its first save.
    pub fn create<E: Entity>(&self, identity: impl Into<Value>) -> Result<Record<E>> {
        let descriptor = descriptor_of::<E>()?;
        let mut entity = E::default();
        descriptor.identity().write(&mut entity, identity.into())?;
        Ok(Record::new(entity, descriptor, self.clone()))
    }

    /// Load the record whose identity equals `identity`.
    ///
    /// Completes with `None`, not an error, when no row matches.
    pub fn load<E: Entity>(&self, identity: impl Into<Value>) -> Result<Pending<Option<Record<E>>>> {
        let descriptor = descriptor_of::<E>()?;
        let identity = identity
            .into()
            .coerce_or_keep(descriptor.identity().column_type());
        let store = self.clone();

        Ok(submit("load", move || {
            let column = descriptor.identity().column();
            let rows = store.select(&descriptor, Some((column, identity)))?;
            store.first(descriptor, rows)
        }))
    }

    /// Load the first record whose `column` equals `value`.
    ///
    /// A column the table has never had matches nothing.
    pub fn load_by<E: Entity>(
        &self,
        column: &str,
        value: impl Into<Value>,
    ) -> Result<Pending<Option<Record<E>>>> {
        let descriptor = descriptor_of::<E>()?;
        let column = column.to_string();
        let mut value = value.into();
        if let Some(field) = descriptor.field(&column) {
            value = value.coerce_or_keep(field.column_type());
        }
        let store = self.clone();

        Ok(submit("load_by", move || {
            validate_identifier(&column)?;
            let column = match descriptor.field(&column) {
                Some(field) => field.column().to_string(),
                None => column,
            };

            let mut session = store.session(&descriptor)?;
            if !store
                .inner
                .schema
                .has_column(&mut session, descriptor.table(), &column)?
            {
                return Ok(None);
            }
            drop(session);

            let rows = store.select(&descriptor, Some((column.as_str(), value)))?;
            store.first(descriptor, rows)
        }))
    }

    /// Load every record of `E`, in the backend's natural row order.
    pub fn load_all<E: Entity>(&self) -> Result<Pending<Vec<Record<E>>>> {
        let descriptor = descriptor_of::<E>()?;
        let store = self.clone();

        Ok(submit("load_all", move || {
            let rows = store.select(&descriptor, None)?;
            let (columns, rows) = rows.into_parts();
            rows.into_iter()
                .map(|row| Record::hydrate(descriptor.clone(), store.clone(), &columns, row))
                .collect()
        }))
    }

    /// Upsert `record` and hand it back.
    ///
    /// Fails with [`Error::MissingIdentity`] when the identity is unset.
    pub fn save<E: Entity>(&self, record: Record<E>) -> Pending<Record<E>> {
        let store = self.clone();

        submit("save", move || {
            let descriptor = record.descriptor();
            let (identity, columns) = record.columns();
            if identity.is_null() {
                return Err(Error::missing_identity(
                    descriptor.table(),
                    descriptor.identity().column(),
                ));
            }

            let mut session = store.connected_session()?;
            store
                .inner
                .schema
                .ensure_table(&mut session, descriptor.schema())?;
            let outcome = session.upsert(
                descriptor.table(),
                (descriptor.identity().column(), &identity),
                &columns,
            )?;

            tracing::debug!(
                table = descriptor.table(),
                identity = %identity,
                inserted = outcome == UpsertOutcome::Inserted,
                "Saved record"
            );
            Ok(record)
        })
    }

    /// Delete the row with `identity`. Completes with whether a row existed.
    pub fn delete<E: Entity>(&self, identity: impl Into<Value>) -> Result<Pending<bool>> {
        let descriptor = descriptor_of::<E>()?;
        let identity = identity
            .into()
            .coerce_or_keep(descriptor.identity().column_type());
        let store = self.clone();

        Ok(submit("delete", move || {
            let mut session = store.session(&descriptor)?;
            let sql = session
                .dialect()
                .delete(descriptor.table(), descriptor.identity().column())?;
            let deleted = session.execute(&sql, &[identity])? > 0;
            if deleted {
                tracing::debug!(table = descriptor.table(), "Deleted record");
            }
            Ok(deleted)
        }))
    }

    /// Make sure `table.column` exists, creating it from `sample`'s kind.
    ///
    /// Completes with `true` when the column was added by this call.
    pub fn ensure_column(&self, table: &str, column: &str, sample: Value) -> Pending<bool> {
        self.ensure_column_with(table.to_string(), self.registered(table), column, sample)
    }

    /// Like [`Store::ensure_column`], creating the entity's table first if needed.
    pub(crate) fn ensure_entity_column(
        &self,
        schema: &TableSchema,
        column: &str,
        sample: Value,
    ) -> Pending<bool> {
        self.ensure_column_with(schema.table.clone(), Some(schema.clone()), column, sample)
    }

    fn ensure_column_with(
        &self,
        table: String,
        schema: Option<TableSchema>,
        column: &str,
        sample: Value,
    ) -> Pending<bool> {
        let store = self.clone();
        let column = column.to_string();

        submit("ensure_column", move || {
            let mut session = store.connected_session()?;
            if let Some(schema) = &schema {
                store.inner.schema.ensure_table(&mut session, schema)?;
            }
            store
                .inner
                .schema
                .ensure_column(&mut session, &table, &column, &sample)
        })
    }

    /// Whether `table.column` exists in the backend.
    pub fn column_exists(&self, table: &str, column: &str) -> Pending<bool> {
        let store = self.clone();
        let table = table.to_string();
        let column = column.to_string();

        submit("column_exists", move || {
            validate_identifier(&table)?;
            validate_identifier(&column)?;
            store.connected_session()?.column_exists(&table, &column)
        })
    }

    fn registered(&self, table: &str) -> Option<TableSchema> {
        self.inner
            .registered
            .read()
            .get(&table.to_ascii_lowercase())
            .cloned()
    }

    fn connected_session(&self) -> Result<Session> {
        self.inner.connector.checkout()
    }

    /// A session on which the entity's table is known to exist.
    fn session<E: Entity>(&self, descriptor: &EntityDescriptor<E>) -> Result<Session> {
        let mut session = self.connected_session()?;
        self.inner
            .schema
            .ensure_table(&mut session, descriptor.schema())?;
        Ok(session)
    }

    fn select<E: Entity>(
        &self,
        descriptor: &EntityDescriptor<E>,
        filter: Option<(&str, Value)>,
    ) -> Result<RowSet> {
        let mut session = self.session(descriptor)?;
        let sql = session
            .dialect()
            .select(descriptor.table(), filter.as_ref().map(|(column, _)| *column))?;
        let params: Vec<Value> = filter.into_iter().map(|(_, value)| value).collect();
        let rows = session.query(&sql, &params)?;
        self.inner
            .schema
            .observe(&mut session, descriptor.table(), rows.columns())?;
        Ok(rows)
    }

    fn first<E: Entity>(
        &self,
        descriptor: Arc<EntityDescriptor<E>>,
        rows: RowSet,
    ) -> Result<Option<Record<E>>> {
        let (columns, rows) = rows.into_parts();
        rows.into_iter()
            .next()
            .map(|row| Record::hydrate(descriptor, self.clone(), &columns, row))
            .transpose()
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("connector", &self.inner.connector)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sqlite::MEMORY_PATH;
    use crate::entity::tests::Player;

    fn memory_store() -> Store {
        let store = Store::new(StorageConfig::sqlite(MEMORY_PATH));
        store.register::<Player>().unwrap();
        store.connect().unwrap();
        store
    }

    fn bob(store: &Store) -> Record<Player> {
        store
            .new_record(Player {
                uuid: Some("abc".into()),
                username: Some("Bob".into()),
            })
            .unwrap()
    }

    fn row_count(store: &Store, table: &str) -> i64 {
        let rows = store
            .connector()
            .query(&format!("SELECT COUNT(*) AS n FROM {table}"), &[])
            .unwrap();
        rows.get(0, "n").unwrap().decode().unwrap()
    }

    #[tokio::test]
    async fn connect_creates_registered_tables() {
        let store = memory_store();
        assert_eq!(store.state(), ConnectionState::Connected);
        assert!(store.column_exists("players", "uuid").await.unwrap());
        assert!(store.column_exists("players", "username").await.unwrap());
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let store = memory_store();
        let mut record = bob(&store);
        record.set("coins", 100).await.unwrap();
        record.set("vip", true).await.unwrap();
        record.set("ratio", 0.5).await.unwrap();
        store.save(record).await.unwrap();

        let loaded = store.load::<Player>("abc").unwrap().await.unwrap().unwrap();
        assert_eq!(loaded.username.as_deref(), Some("Bob"));
        assert_eq!(loaded.value("coins"), Some(Value::Integer(100)));
        assert_eq!(loaded.value("vip"), Some(Value::Boolean(true)));
        assert_eq!(loaded.value("ratio"), Some(Value::Real(0.5)));
        assert_eq!(loaded.attributes().len(), 3);
    }

    fn file_store(path: &std::path::Path, max_size: u32) -> Store {
        let mut config = StorageConfig::sqlite(path);
        config.pool.max_size = max_size;
        let store = Store::new(config);
        store.register::<Player>().unwrap();
        store.connect().unwrap();
        store
    }

    #[tokio::test]
    async fn every_pooled_connection_sees_new_columns() {
        let dir = tempfile::tempdir().unwrap();
        let store = file_store(&dir.path().join("data.db"), 2);
        let mut record = store.save(bob(&store)).await.unwrap();

        // Warm one connection's schema, then alter the table through the other.
        let mut warmed = store.connector().checkout().unwrap();
        warmed.query("SELECT * FROM players", &[]).unwrap();
        record.set("coins", 100).await.unwrap();
        store.save(record).await.unwrap();
        drop(warmed);

        let first = store.connector().checkout().unwrap();
        let second = store.connector().checkout().unwrap();

        drop(first);
        let loaded = store.load::<Player>("abc").unwrap().await.unwrap().unwrap();
        assert_eq!(loaded.get::<i64>("coins"), Some(100));

        let _first = store.connector().checkout().unwrap();
        drop(second);
        let loaded = store.load::<Player>("abc").unwrap().await.unwrap().unwrap();
        assert_eq!(loaded.get::<i64>("coins"), Some(100));
    }

    #[tokio::test]
    async fn load_learns_columns_added_by_another_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.db");
        let ours = file_store(&path, 1);
        ours.save(bob(&ours)).await.unwrap();
        let before = ours.load::<Player>("abc").unwrap().await.unwrap().unwrap();
        assert!(before.attributes().is_empty());

        let theirs = file_store(&path, 1);
        let mut record = theirs.load::<Player>("abc").unwrap().await.unwrap().unwrap();
        record.set("vip", true).await.unwrap();
        theirs.save(record).await.unwrap();

        assert_eq!(ours.column_type("players", "vip"), None);
        let after = ours.load::<Player>("abc").unwrap().await.unwrap().unwrap();
        assert_eq!(after.value("vip"), Some(Value::Boolean(true)));
        assert_eq!(ours.column_type("players", "vip"), Some(ColumnType::Boolean));
    }

    #[tokio::test]
    async fn save_twice_keeps_one_row() {
        let store = memory_store();
        let record = store.save(bob(&store)).await.unwrap();
        store.save(record).await.unwrap();
        assert_eq!(row_count(&store, "players"), 1);
    }

    #[tokio::test]
    async fn identity_only_record_saves_idempotently() {
        let store = memory_store();
        let record = store.create::<Player>("lonely").unwrap();
        let record = store.save(record).await.unwrap();
        store.save(record).await.unwrap();
        assert_eq!(row_count(&store, "players"), 1);
    }

    #[tokio::test]
    async fn load_missing_row_is_none() {
        let store = memory_store();
        let loaded = store.load::<Player>("nobody").unwrap().await.unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn save_without_identity_fails_async() {
        let store = memory_store();
        let record = store.new_record(Player::default()).unwrap();
        let err = store.save(record).await.unwrap_err();
        assert!(matches!(err, Error::MissingIdentity { .. }));
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn player_scenario() {
        let store = memory_store();
        store.save(bob(&store)).await.unwrap();

        let mut loaded = store.load::<Player>("abc").unwrap().await.unwrap().unwrap();
        loaded.set("coins", 100).await.unwrap();
        assert_eq!(store.column_type("players", "coins"), Some(ColumnType::Integer));
        store.save(loaded).await.unwrap();

        let other = store.load::<Player>("abc").unwrap().await.unwrap().unwrap();
        assert_eq!(other.get::<i64>("coins"), Some(100));

        // The new column defaults to 0 for rows that never set it.
        store.save(store.create::<Player>("def").unwrap()).await.unwrap();
        let fresh = store.load::<Player>("def").unwrap().await.unwrap().unwrap();
        assert_eq!(fresh.get::<i64>("coins"), Some(0));
    }

    #[tokio::test]
    async fn schema_is_monotonic() {
        let store = memory_store();
        assert!(store
            .ensure_column("players", "level", Value::from(5))
            .await
            .unwrap());
        assert!(!store
            .ensure_column("players", "level", Value::from(5))
            .await
            .unwrap());
        assert!(store.column_exists("players", "level").await.unwrap());
    }

    #[tokio::test]
    async fn unsupported_sample_leaves_table_unchanged() {
        let store = memory_store();
        let err = store
            .ensure_column("players", "nothing", Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedType(_)));
        assert!(!store.column_exists("players", "nothing").await.unwrap());
    }

    #[tokio::test]
    async fn load_all_returns_every_row() {
        let store = memory_store();
        for id in ["a", "b", "c"] {
            store.save(store.create::<Player>(id).unwrap()).await.unwrap();
        }
        let all = store.load_all::<Player>().unwrap().await.unwrap();
        let mut ids: Vec<String> = all.iter().filter_map(|r| r.uuid.clone()).collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn load_by_any_column() {
        let store = memory_store();
        let mut record = bob(&store);
        record.set("guild", "north").await.unwrap();
        store.save(record).await.unwrap();

        let by_name = store
            .load_by::<Player>("username", "Bob")
            .unwrap()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_name.identity(), Value::from("abc"));

        let by_guild = store
            .load_by::<Player>("guild", "north")
            .unwrap()
            .await
            .unwrap();
        assert!(by_guild.is_some());

        let unknown = store
            .load_by::<Player>("never_set", 1)
            .unwrap()
            .await
            .unwrap();
        assert!(unknown.is_none());
    }

    #[tokio::test]
    async fn delete_reports_existence() {
        let store = memory_store();
        store.save(bob(&store)).await.unwrap();

        assert!(store.delete::<Player>("abc").unwrap().await.unwrap());
        assert!(!store.delete::<Player>("abc").unwrap().await.unwrap());
        assert!(store.load::<Player>("abc").unwrap().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_after_concurrent_delete_reinserts() {
        let store = memory_store();
        let mut record = store.save(bob(&store)).await.unwrap();
        record.set("coins", 7).await.unwrap();

        store.delete::<Player>("abc").unwrap().await.unwrap();
        store.save(record).await.unwrap();

        let loaded = store.load::<Player>("abc").unwrap().await.unwrap().unwrap();
        assert_eq!(loaded.get::<i64>("coins"), Some(7));
        assert_eq!(row_count(&store, "players"), 1);
    }

    #[tokio::test]
    async fn operations_fail_when_disconnected() {
        let store = memory_store();
        store.disconnect();
        store.disconnect();
        let err = store.load::<Player>("abc").unwrap().await.unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
    }

    #[derive(Default)]
    struct Unmapped;

    impl Entity for Unmapped {
        fn descriptor() -> Result<EntityDescriptor<Self>> {
            EntityDescriptor::<Self>::builder("").build()
        }
    }

    #[tokio::test]
    async fn missing_mapping_fails_immediately() {
        let store = memory_store();
        assert!(matches!(store.load::<Unmapped>(1), Err(Error::Configuration(_))));
        assert!(matches!(store.load_all::<Unmapped>(), Err(Error::Configuration(_))));
        assert!(matches!(store.register::<Unmapped>(), Err(Error::Configuration(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_saves_of_one_identity_leave_one_row() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(StorageConfig::sqlite(dir.path().join("data.db")));
        store.register::<Player>().unwrap();
        store.connect().unwrap();

        let saves: Vec<_> = (0..16)
            .map(|i| {
                let record = store
                    .new_record(Player {
                        uuid: Some("race".into()),
                        username: Some(format!("p{i}")),
                    })
                    .unwrap();
                store.save(record)
            })
            .collect();
        for save in saves {
            save.await.unwrap();
        }

        assert_eq!(row_count(&store, "players"), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_new_attributes_add_each_column_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(StorageConfig::sqlite(dir.path().join("data.db")));
        store.register::<Player>().unwrap();
        store.connect().unwrap();

        let added: Vec<_> = (0..8)
            .map(|_| store.ensure_column("players", "score", Value::from(1)))
            .collect();
        let mut created = 0;
        for pending in added {
            if pending.await.unwrap() {
                created += 1;
            }
        }
        assert_eq!(created, 1);
    }
}
