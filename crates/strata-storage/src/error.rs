//! Error types for strata-storage
//!
//! Duplicate saves and deletes of absent events are outcomes, not errors;
//! see [`SaveOutcome`](crate::SaveOutcome) and [`DeleteOutcome`](crate::DeleteOutcome).

use thiserror::Error;

/// Errors that can occur in storage operations
#[derive(Debug, Error)]
pub enum StoreError {
    /// The key-value engine failed a read, write or commit
    #[error("Database error: {0}")]
    Database(String),

    /// I/O error outside the database (directories, config files)
    #[error("I/O error: {0}")]
    Io(String),

    /// A stored value failed structural checks
    #[error("Corrupt record: {0}")]
    Corrupt(String),

    /// Error during serialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Error during deserialization
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// The serial counter could not be read or advanced
    #[error("Serial allocation failed: {0}")]
    SerialAllocation(String),

    /// The filter cannot be planned
    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    /// Invalid or incompatible configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// A write kept conflicting after the given number of attempts
    #[error("Write conflict persisted after {0} attempts")]
    Conflict(u32),

    /// The caller cancelled the operation
    #[error("Operation cancelled")]
    Cancelled,

    /// The store was closed
    #[error("Store is closed")]
    Closed,

    /// A blocking or background task failed
    #[error("Task failed: {0}")]
    Task(String),

    /// One or more tiers of a tiered store failed
    #[error("{} tier(s) failed: {}", .0.len(), join_errors(.0))]
    Tiers(Vec<StoreError>),
}

fn join_errors(errors: &[StoreError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl StoreError {
    /// Create a new Corrupt error
    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::Corrupt(message.into())
    }

    /// Create a new Config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a new InvalidFilter error
    pub fn invalid_filter(message: impl Into<String>) -> Self {
        Self::InvalidFilter(message.into())
    }

    /// Create a new Serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization(message.into())
    }

    /// Create a new Database error
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database(message.into())
    }

    /// Whether the failure came from the key-value engine
    pub fn is_database(&self) -> bool {
        matches!(self, StoreError::Database(_))
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

/// Convert from postcard Error to StoreError
impl From<postcard::Error> for StoreError {
    fn from(err: postcard::Error) -> Self {
        StoreError::Deserialization(err.to_string())
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        StoreError::Task(err.to_string())
    }
}

impl From<toml::de::Error> for StoreError {
    fn from(err: toml::de::Error) -> Self {
        StoreError::Config(err.to_string())
    }
}

macro_rules! database_error {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for StoreError {
                fn from(err: $ty) -> Self {
                    StoreError::Database(err.to_string())
                }
            }
        )*
    };
}

database_error!(
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
);
