//! Entity descriptors: the static table mapping of a persisted type.
//!
//! Each persisted type implements [`Entity`] and describes itself once with
//! an [`EntityDescriptor`]: table name, exactly one identity field, and any
//! number of declared fields. A field is a column name, a declared
//! [`ColumnType`], and a plain accessor/mutator pair, so nothing is
//! discovered at runtime.
//!
//! # Example
//!
//! ```
//! use reliquary_db::entity::{Entity, EntityDescriptor};
//! use reliquary_db::value::ColumnType;
//!
//! #[derive(Default)]
//! struct Player {
//!     uuid: String,
//!     username: Option<String>,
//! }
//!
//! impl Entity for Player {
//!     fn descriptor() -> reliquary_core::Result<EntityDescriptor<Self>> {
//!         EntityDescriptor::<Self>::builder("players")
//!             .identity("uuid", ColumnType::Text, |p| p.uuid.clone().into(), |p, v| {
//!                 p.uuid = v.decode()?;
//!                 Ok(())
//!             })
//!             .field("username", ColumnType::Text, |p| p.username.clone().into(), |p, v| {
//!                 p.username = v.decode()?;
//!                 Ok(())
//!             })
//!             .build()
//!     }
//! }
//!
//! let descriptor = reliquary_db::entity::descriptor_of::<Player>().unwrap();
//! assert_eq!(descriptor.table(), "players");
//! ```

use parking_lot::RwLock;
use reliquary_core::{Error, Result};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use crate::dialect::validate_identifier;
use crate::value::{ColumnType, Value};

/// Reads a field out of an entity.
pub type Getter<E> = fn(&E) -> Value;

/// Writes an already coerced value into an entity.
pub type Setter<E> = fn(&mut E, Value) -> Result<()>;

/// A persisted type with a static table mapping.
pub trait Entity: Default + Send + Sync + 'static {
    /// Build the mapping. Called once per process; see [`descriptor_of`].
    fn descriptor() -> Result<EntityDescriptor<Self>>;
}

/// One declared field of an entity.
pub struct FieldDescriptor<E> {
    name: &'static str,
    column: &'static str,
    column_type: ColumnType,
    get: Getter<E>,
    set: Setter<E>,
}

impl<E> FieldDescriptor<E> {
    /// Attribute name used by callers.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Storage column name.
    pub fn column(&self) -> &'static str {
        self.column
    }

    pub fn column_type(&self) -> ColumnType {
        self.column_type
    }

    /// Whether `key` addresses this field by attribute or column name.
    pub fn matches(&self, key: &str) -> bool {
        self.name.eq_ignore_ascii_case(key) || self.column.eq_ignore_ascii_case(key)
    }

    pub fn read(&self, entity: &E) -> Value {
        (self.get)(entity)
    }

    /// Coerce `value` to the declared type, then hand it to the mutator.
    pub fn write(&self, entity: &mut E, value: Value) -> Result<()> {
        let value = value.coerce(self.column_type).map_err(|e| {
            Error::conversion(format!("field '{}': {e}", self.name))
        })?;
        (self.set)(entity, value)
    }
}

/// Untyped column definition used for DDL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub column_type: ColumnType,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

/// The table an entity type maps to, without the typed accessors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub table: String,
    pub identity: ColumnDef,
    pub columns: Vec<ColumnDef>,
}

/// Static mapping of an entity type to its table.
pub struct EntityDescriptor<E> {
    identity: FieldDescriptor<E>,
    fields: Vec<FieldDescriptor<E>>,
    schema: TableSchema,
}

impl<E: Entity> EntityDescriptor<E> {
    pub fn builder(table: impl Into<String>) -> EntityDescriptorBuilder<E> {
        EntityDescriptorBuilder {
            table: table.into(),
            identities: Vec::new(),
            fields: Vec::new(),
        }
    }
}

impl<E> EntityDescriptor<E> {
    pub fn table(&self) -> &str {
        &self.schema.table
    }

    pub fn identity(&self) -> &FieldDescriptor<E> {
        &self.identity
    }

    /// Declared fields, excluding the identity.
    pub fn fields(&self) -> &[FieldDescriptor<E>] {
        &self.fields
    }

    /// Identity followed by every declared field.
    pub fn all_fields(&self) -> impl Iterator<Item = &FieldDescriptor<E>> {
        std::iter::once(&self.identity).chain(self.fields.iter())
    }

    /// Look up a declared field (or the identity) by attribute or column name.
    pub fn field(&self, key: &str) -> Option<&FieldDescriptor<E>> {
        self.all_fields().find(|f| f.matches(key))
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }
}

impl<E> std::fmt::Debug for EntityDescriptor<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityDescriptor")
            .field("schema", &self.schema)
            .finish()
    }
}

/// Builder for [`EntityDescriptor`].
pub struct EntityDescriptorBuilder<E> {
    table: String,
    identities: Vec<FieldDescriptor<E>>,
    fields: Vec<FieldDescriptor<E>>,
}

impl<E: Entity> EntityDescriptorBuilder<E> {
    /// Declare the identity field; its column becomes the primary key.
    pub fn identity(
        self,
        name: &'static str,
        column_type: ColumnType,
        get: Getter<E>,
        set: Setter<E>,
    ) -> Self {
        self.mapped_identity(name, name, column_type, get, set)
    }

    /// Declare the identity field stored under a different column name.
    pub fn mapped_identity(
        mut self,
        name: &'static str,
        column: &'static str,
        column_type: ColumnType,
        get: Getter<E>,
        set: Setter<E>,
    ) -> Self {
        self.identities.push(FieldDescriptor {
            name,
            column,
            column_type,
            get,
            set,
        });
        self
    }

    /// Declare a typed field stored under its own name.
    pub fn field(
        self,
        name: &'static str,
        column_type: ColumnType,
        get: Getter<E>,
        set: Setter<E>,
    ) -> Self {
        self.mapped_field(name, name, column_type, get, set)
    }

    /// Declare a typed field stored under a different column name.
    pub fn mapped_field(
        mut self,
        name: &'static str,
        column: &'static str,
        column_type: ColumnType,
        get: Getter<E>,
        set: Setter<E>,
    ) -> Self {
        self.fields.push(FieldDescriptor {
            name,
            column,
            column_type,
            get,
            set,
        });
        self
    }

    /// Validate the mapping.
    ///
    /// Fails with [`Error::Configuration`] when the table name is missing or
    /// malformed, when there is not exactly one identity, or when a name or
    /// column would resolve to two fields.
    pub fn build(mut self) -> Result<EntityDescriptor<E>> {
        let type_name = std::any::type_name::<E>();

        if self.table.is_empty() {
            return Err(Error::configuration(format!(
                "{type_name} has no table mapping"
            )));
        }
        validate_identifier(&self.table).map_err(|_| {
            Error::configuration(format!(
                "{type_name} maps to invalid table name '{}'",
                self.table
            ))
        })?;

        if self.identities.len() != 1 {
            return Err(Error::configuration(format!(
                "{type_name} must declare exactly one identity field, found {}",
                self.identities.len()
            )));
        }
        let identity = self.identities.remove(0);

        // Fields are looked up by attribute name or column, so no name may
        // resolve to two fields.
        let mut seen: Vec<(&str, &str)> = Vec::new();
        for field in std::iter::once(&identity).chain(self.fields.iter()) {
            validate_identifier(field.column).map_err(|_| {
                Error::configuration(format!(
                    "{type_name} field '{}' maps to invalid column '{}'",
                    field.name, field.column
                ))
            })?;
            if seen.iter().any(|(_, c)| c.eq_ignore_ascii_case(field.column)) {
                return Err(Error::configuration(format!(
                    "{type_name} maps column '{}' more than once",
                    field.column
                )));
            }
            if let Some((other, _)) = seen.iter().find(|(n, c)| {
                n.eq_ignore_ascii_case(field.column)
                    || n.eq_ignore_ascii_case(field.name)
                    || c.eq_ignore_ascii_case(field.name)
            }) {
                return Err(Error::configuration(format!(
                    "{type_name} field '{}' clashes with field '{other}'",
                    field.name
                )));
            }
            seen.push((field.name, field.column));
        }

        let schema = TableSchema {
            table: self.table,
            identity: ColumnDef::new(identity.column, identity.column_type),
            columns: self
                .fields
                .iter()
                .map(|f| ColumnDef::new(f.column, f.column_type))
                .collect(),
        };

        Ok(EntityDescriptor {
            identity,
            fields: self.fields,
            schema,
        })
    }
}

type Registry = RwLock<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>;

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(Default::default)
}

/// Resolve the descriptor of `E`, deriving it on first use.
///
/// Successful derivations are cached for the lifetime of the process and
/// shared across threads; failed ones are not cached.
pub fn descriptor_of<E: Entity>() -> Result<Arc<EntityDescriptor<E>>> {
    let key = TypeId::of::<E>();

    if let Some(cached) = registry().read().get(&key).cloned() {
        return downcast(cached);
    }

    // Derive under the write lock so concurrent first uses build it only once.
    let mut entries = registry().write();
    if let Some(cached) = entries.get(&key).cloned() {
        return downcast(cached);
    }
    let derived: Arc<dyn Any + Send + Sync> = Arc::new(E::descriptor()?);
    entries.insert(key, derived.clone());
    downcast(derived)
}

fn downcast<E: Entity>(entry: Arc<dyn Any + Send + Sync>) -> Result<Arc<EntityDescriptor<E>>> {
    entry.downcast::<EntityDescriptor<E>>().map_err(|_| {
        Error::internal(format!(
            "descriptor registry holds a foreign entry for {}",
            std::any::type_name::<E>()
        ))
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default, Clone, PartialEq)]
    pub(crate) struct Player {
        pub uuid: Option<String>,
        pub username: Option<String>,
    }

    impl Entity for Player {
        fn descriptor() -> Result<EntityDescriptor<Self>> {
            EntityDescriptor::<Self>::builder("players")
                .identity(
                    "uuid",
                    ColumnType::Text,
                    |p| p.uuid.clone().into(),
                    |p, v| {
                        p.uuid = v.decode()?;
                        Ok(())
                    },
                )
                .field(
                    "username",
                    ColumnType::Text,
                    |p| p.username.clone().into(),
                    |p, v| {
                        p.username = v.decode()?;
                        Ok(())
                    },
                )
                .build()
        }
    }

    static DERIVATIONS: AtomicUsize = AtomicUsize::new(0);

    #[derive(Default)]
    struct Counted {
        id: i64,
    }

    impl Entity for Counted {
        fn descriptor() -> Result<EntityDescriptor<Self>> {
            DERIVATIONS.fetch_add(1, Ordering::SeqCst);
            EntityDescriptor::<Self>::builder("counted")
                .identity(
                    "id",
                    ColumnType::Integer,
                    |c| c.id.into(),
                    |c, v| {
                        c.id = v.decode()?;
                        Ok(())
                    },
                )
                .build()
        }
    }

    #[derive(Default)]
    struct Unmapped;

    impl Entity for Unmapped {
        fn descriptor() -> Result<EntityDescriptor<Self>> {
            EntityDescriptor::<Self>::builder("").build()
        }
    }

    #[derive(Default)]
    struct NoIdentity {
        name: String,
    }

    impl Entity for NoIdentity {
        fn descriptor() -> Result<EntityDescriptor<Self>> {
            EntityDescriptor::<Self>::builder("nameless")
                .field(
                    "name",
                    ColumnType::Text,
                    |n| n.name.clone().into(),
                    |n, v| {
                        n.name = v.decode()?;
                        Ok(())
                    },
                )
                .build()
        }
    }

    #[derive(Default)]
    struct Duplicated {
        a: i64,
    }

    impl Entity for Duplicated {
        fn descriptor() -> Result<EntityDescriptor<Self>> {
            EntityDescriptor::<Self>::builder("duplicated")
                .identity("a", ColumnType::Integer, |d| d.a.into(), |_, _| Ok(()))
                .mapped_field("b", "A", ColumnType::Integer, |d| d.a.into(), |_, _| Ok(()))
                .build()
        }
    }

    #[derive(Default)]
    struct Clashing {
        id: i64,
    }

    impl Entity for Clashing {
        fn descriptor() -> Result<EntityDescriptor<Self>> {
            EntityDescriptor::<Self>::builder("clashing")
                .identity("id", ColumnType::Integer, |c| c.id.into(), |_, _| Ok(()))
                .mapped_field("nick", "handle", ColumnType::Text, |_| Value::Null, |_, _| Ok(()))
                .mapped_field("handle", "nickname", ColumnType::Text, |_| Value::Null, |_, _| Ok(()))
                .build()
        }
    }

    #[test]
    fn descriptor_exposes_mapping() {
        let descriptor = descriptor_of::<Player>().unwrap();
        assert_eq!(descriptor.table(), "players");
        assert_eq!(descriptor.identity().column(), "uuid");
        assert_eq!(descriptor.fields().len(), 1);
        assert_eq!(
            descriptor.schema().columns,
            vec![ColumnDef::new("username", ColumnType::Text)]
        );
    }

    #[test]
    fn descriptor_is_derived_once() {
        let first = descriptor_of::<Counted>().unwrap();
        let second = descriptor_of::<Counted>().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(DERIVATIONS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn missing_table_is_configuration_error() {
        let err = descriptor_of::<Unmapped>().unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(err.to_string().contains("no table mapping"));
    }

    #[test]
    fn missing_identity_is_configuration_error() {
        let err = descriptor_of::<NoIdentity>().unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(err.to_string().contains("exactly one identity"));
    }

    #[test]
    fn duplicate_column_is_configuration_error() {
        let err = descriptor_of::<Duplicated>().unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn name_matching_another_column_is_configuration_error() {
        let err = descriptor_of::<Clashing>().unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(err.to_string().contains("clashes with field 'nick'"));
    }

    #[test]
    fn field_lookup_by_name_or_column() {
        let descriptor = descriptor_of::<Player>().unwrap();
        assert!(descriptor.field("USERNAME").is_some());
        assert!(descriptor.field("uuid").is_some());
        assert!(descriptor.field("coins").is_none());
    }

    #[derive(Default)]
    struct Scored {
        score: i64,
    }

    impl Entity for Scored {
        fn descriptor() -> Result<EntityDescriptor<Self>> {
            EntityDescriptor::<Self>::builder("scores")
                .identity(
                    "score",
                    ColumnType::Integer,
                    |s| s.score.into(),
                    |s, v| {
                        s.score = v.decode()?;
                        Ok(())
                    },
                )
                .build()
        }
    }

    #[test]
    fn field_write_coerces_declared_type() {
        let descriptor = descriptor_of::<Scored>().unwrap();
        let mut scored = Scored::default();
        descriptor
            .identity()
            .write(&mut scored, Value::Text("42".into()))
            .unwrap();
        assert_eq!(scored.score, 42);

        let err = descriptor
            .identity()
            .write(&mut scored, Value::Text("forty".into()))
            .unwrap_err();
        assert!(matches!(err, Error::Conversion(_)));
    }
}
