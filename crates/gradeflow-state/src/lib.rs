//! Gradeflow-State: SurrealDB persistence for grading caches
//!
//! This crate provides the durable key-value cache shared by every
//! gradeflow process instance. Sandbox attempts are advanced by callbacks
//! that may land on a different instance than the one that started them,
//! so their state lives here rather than in process memory.
//!
//! ## Key Components
//!
//! - `KvStore`: revisioned key-value contract with compare-and-put
//! - `SurrealKvStore`: SurrealDB implementation (`mem://`, `surrealkv://`, cloud)
//! - `RecordStore`: versioned, namespaced typed records on top of a `KvStore`

mod error;
pub mod fakes;
mod handle;
mod migrations;
pub mod records;
pub mod storage_traits;

pub use error::{StateError, StorageError};
pub use handle::{CloudConfig, StoreLocation, SurrealKvStore};
pub use records::{RecordStore, Versioned, VersionedRecord};
pub use storage_traits::{KvEntry, KvStore, Revision, StorageResult};

/// Result type for gradeflow-state setup operations
pub type Result<T> = std::result::Result<T, StateError>;
