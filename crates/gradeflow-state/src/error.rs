//! Error types for gradeflow-state

use thiserror::Error;

/// Errors raised while connecting to or preparing the state database
#[derive(Error, Debug)]
pub enum StateError {
    /// Database connection error
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Database query error
    #[error("Database query failed: {0}")]
    Query(String),

    /// Schema setup error
    #[error("Schema setup failed: {0}")]
    SchemaSetup(String),
}

impl From<surrealdb::Error> for StateError {
    fn from(err: surrealdb::Error) -> Self {
        StateError::Query(err.to_string())
    }
}

/// Errors returned by [`crate::KvStore`] and [`crate::RecordStore`] operations
#[derive(Error, Debug)]
pub enum StorageError {
    /// Backend failure (query, connection, lock poisoning)
    #[error("storage backend error: {0}")]
    Backend(String),

    /// Value could not be encoded or decoded
    #[error("serialization failed for {key}: {reason}")]
    Serialization { key: String, reason: String },

    /// Stored record was written by an incompatible schema version
    #[error("record {key} has version {found}, expected {expected}")]
    VersionMismatch {
        key: String,
        found: u32,
        expected: u32,
    },
}

impl From<surrealdb::Error> for StorageError {
    fn from(err: surrealdb::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}

impl From<StateError> for StorageError {
    fn from(err: StateError) -> Self {
        StorageError::Backend(err.to_string())
    }
}
