//! Records: one row of an entity table, typed fields plus a dynamic bag.

use reliquary_core::{Error, Result};
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;

use crate::dialect::validate_identifier;
use crate::entity::{Entity, EntityDescriptor};
use crate::store::Store;
use crate::value::{FromValue, Value};

/// An entity together with the attributes that have no declared field.
///
/// Every key in the attribute bag names a column that exists in the backing
/// table: [`Record::set`] creates the column before it stores the key.
pub struct Record<E: Entity> {
    entity: E,
    attributes: HashMap<String, Value>,
    descriptor: Arc<EntityDescriptor<E>>,
    store: Store,
}

impl<E: Entity> Record<E> {
    pub(crate) fn new(entity: E, descriptor: Arc<EntityDescriptor<E>>, store: Store) -> Self {
        Self {
            entity,
            attributes: HashMap::new(),
            descriptor,
            store,
        }
    }

    /// Build a record from a result row.
    ///
    /// Declared fields are coerced to their declared types. Every other
    /// column goes into the bag, coerced to the column type the store knows.
    /// The store records the row's columns as known before hydrating.
    pub(crate) fn hydrate(
        descriptor: Arc<EntityDescriptor<E>>,
        store: Store,
        columns: &[String],
        row: Vec<Value>,
    ) -> Result<Self> {
        let mut record = Self::new(E::default(), descriptor, store);
        for (column, value) in columns.iter().zip(row) {
            match record.descriptor.field(column) {
                Some(field) => field.write(&mut record.entity, value)?,
                None => {
                    let value = match record.store.column_type(record.table(), column) {
                        Some(column_type) => value.coerce_or_keep(column_type),
                        None => value,
                    };
                    record.put(column, value);
                }
            }
        }
        Ok(record)
    }

    pub fn table(&self) -> &str {
        self.descriptor.table()
    }

    pub fn descriptor(&self) -> &EntityDescriptor<E> {
        &self.descriptor
    }

    /// Current identity value; `Null` until one is assigned.
    pub fn identity(&self) -> Value {
        self.descriptor.identity().read(&self.entity)
    }

    pub fn entity(&self) -> &E {
        &self.entity
    }

    pub fn into_entity(self) -> E {
        self.entity
    }

    /// Dynamic attributes only; declared fields live on the entity.
    pub fn attributes(&self) -> &HashMap<String, Value> {
        &self.attributes
    }

    /// Whether `key` is a declared field or a present dynamic attribute.
    pub fn contains(&self, key: &str) -> bool {
        self.descriptor.field(key).is_some() || self.bag_key(key).is_some()
    }

    /// Raw value of a declared field or dynamic attribute.
    pub fn value(&self, key: &str) -> Option<Value> {
        match self.descriptor.field(key) {
            Some(field) => Some(field.read(&self.entity)),
            None => self
                .bag_key(key)
                .and_then(|k| self.attributes.get(k))
                .cloned(),
        }
    }

    /// Typed read. `None` when the key is absent or cannot be read as `T`.
    pub fn get<T: FromValue>(&self, key: &str) -> Option<T> {
        self.value(key).and_then(|v| v.decode().ok())
    }

    /// Set a declared field or a dynamic attribute.
    ///
    /// A new dynamic attribute first gets its column, with the type inferred
    /// from `value`. An identity that already has a value cannot be changed.
    pub async fn set(&mut self, key: &str, value: impl Into<Value>) -> Result<()> {
        validate_identifier(key)?;
        let value = value.into();

        if let Some(field) = self.descriptor.field(key) {
            if std::ptr::eq(field, self.descriptor.identity()) {
                let current = field.read(&self.entity);
                let incoming = value.clone().coerce_or_keep(field.column_type());
                if !current.is_null() && current != incoming {
                    return Err(Error::ImmutableIdentity {
                        table: self.table().to_string(),
                    });
                }
            }
            return field.write(&mut self.entity, value);
        }

        self.store
            .ensure_entity_column(self.descriptor.schema(), key, value.clone())
            .await?;

        let value = match self.store.column_type(self.table(), key) {
            Some(column_type) => value.coerce_or_keep(column_type),
            None => value,
        };
        self.put(key, value);
        Ok(())
    }

    /// Persist this record; see [`Store::save`].
    pub fn save(self) -> crate::task::Pending<Self> {
        let store = self.store.clone();
        store.save(self)
    }

    /// Identity plus every other column to write, declared fields first.
    pub(crate) fn columns(&self) -> (Value, Vec<(String, Value)>) {
        let mut columns: Vec<(String, Value)> = self
            .descriptor
            .fields()
            .iter()
            .map(|f| (f.column().to_string(), f.read(&self.entity)))
            .collect();
        columns.extend(self.attributes.iter().map(|(k, v)| (k.clone(), v.clone())));
        (self.identity(), columns)
    }

    fn put(&mut self, key: &str, value: Value) {
        // Column names are case-insensitive; reuse the spelling already held.
        let key = self
            .bag_key(key)
            .map(str::to_string)
            .unwrap_or_else(|| key.to_string());
        self.attributes.insert(key, value);
    }

    fn bag_key(&self, key: &str) -> Option<&str> {
        self.attributes
            .keys()
            .find(|k| k.eq_ignore_ascii_case(key))
            .map(String::as_str)
    }
}

impl<E: Entity> Deref for Record<E> {
    type Target = E;

    fn deref(&self) -> &E {
        &self.entity
    }
}

impl<E: Entity> std::fmt::Debug for Record<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut fields: Vec<(&str, Value)> = self
            .descriptor
            .fields()
            .iter()
            .map(|d| (d.name(), d.read(&self.entity)))
            .collect();
        fields.sort_by(|a, b| a.0.cmp(b.0));

        f.debug_struct("Record")
            .field("table", &self.table())
            .field("identity", &self.identity())
            .field("fields", &fields)
            .field("attributes", &self.attributes)
            .finish()
    }
}
