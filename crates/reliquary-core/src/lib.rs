//! reliquary-core: shared error taxonomy and storage configuration.
//!
//! This crate is the foundational dependency for the other reliquary crates.
//! It carries no database code of its own; the engine in `reliquary-db`
//! funnels every failure into [`Error`] and is configured from
//! [`config::StorageConfig`].

pub mod config;
pub mod error;

// Re-export the most commonly used items at the crate root.
pub use config::{BackendKind, StorageConfig};
pub use error::{Error, Result};
