//! Unified error type for the reliquary persistence engine.
//!
//! Driver errors never cross the engine boundary as-is: every rusqlite, r2d2
//! or MySQL failure is wrapped into one of the variants below before it is
//! handed to the caller.

/// Error taxonomy covering every failure mode of the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The backend is unreachable, misconfigured, or not connected.
    #[error("Connection error: {0}")]
    Connection(String),

    /// An entity type lacks required mapping metadata.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A record was saved without an identity value.
    #[error("Missing identity: table '{table}' requires a value for '{column}'")]
    MissingIdentity {
        /// Table the record maps to.
        table: String,
        /// Name of the identity column.
        column: String,
    },

    /// Table or column creation was rejected by the backend.
    #[error("Schema error: {0}")]
    Schema(String),

    /// The value has no SQL type mapping.
    #[error("Unsupported type: {0}")]
    UnsupportedType(String),

    /// A table or column name is not a simple identifier token.
    #[error("Invalid identifier: '{0}'")]
    InvalidIdentifier(String),

    /// A stored value could not be read as the requested type.
    #[error("Conversion error: {0}")]
    Conversion(String),

    /// An already assigned identity was about to be overwritten.
    #[error("Identity of '{table}' is immutable once assigned")]
    ImmutableIdentity {
        /// Table the record maps to.
        table: String,
    },

    /// A statement failed for any other reason.
    #[error("Database error: {source}")]
    Database {
        /// The underlying driver error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A worker task failed or no runtime was available.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Convenience constructor for [`Error::Connection`].
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Convenience constructor for [`Error::Configuration`].
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Convenience constructor for [`Error::MissingIdentity`].
    pub fn missing_identity(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self::MissingIdentity {
            table: table.into(),
            column: column.into(),
        }
    }

    /// Convenience constructor for [`Error::Schema`].
    pub fn schema(msg: impl Into<String>) -> Self {
        Self::Schema(msg.into())
    }

    /// Convenience constructor for [`Error::UnsupportedType`].
    pub fn unsupported_type(msg: impl Into<String>) -> Self {
        Self::UnsupportedType(msg.into())
    }

    /// Convenience constructor for [`Error::Conversion`].
    pub fn conversion(msg: impl Into<String>) -> Self {
        Self::Conversion(msg.into())
    }

    /// Convenience constructor for [`Error::Database`].
    pub fn database(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Database {
            source: source.into(),
        }
    }

    /// Convenience constructor for [`Error::Internal`].
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the caller can recover by fixing the record and retrying.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::MissingIdentity { .. }
                | Error::UnsupportedType(_)
                | Error::Conversion(_)
                | Error::InvalidIdentifier(_)
        )
    }
}

/// Result alias using the crate-level [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
