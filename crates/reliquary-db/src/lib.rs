//! reliquary-db: entity persistence with on-the-fly schema evolution.
//!
//! Entity types describe their table once ([`entity`]). A [`Store`] loads
//! and saves them as [`Record`]s, which pair the typed entity with a bag of
//! dynamic attributes. Setting an attribute the table has never seen adds
//! the column first ([`schema`]). All CRUD work runs on the tokio blocking
//! pool against pooled SQLite or MySQL connections ([`backend`]).

pub mod backend;
pub mod connector;
pub mod dialect;
pub mod entity;
pub mod record;
pub mod schema;
pub mod store;
pub mod task;
pub mod value;

pub use connector::{ConnectionState, Connector};
pub use entity::{descriptor_of, Entity, EntityDescriptor};
pub use record::Record;
pub use store::Store;
pub use task::Pending;
pub use value::{ColumnType, FromValue, Value};
