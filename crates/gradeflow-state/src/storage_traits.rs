//! Storage trait definitions for gradeflow
//!
//! `KvStore` is the only persistence seam the grading engine depends on. It
//! is shared across process instances, so writers never assume a
//! read-modify-write sequence is atomic: every entry carries a monotonically
//! increasing revision and `compare_and_put` only succeeds against the
//! revision the caller read.
//!
//! In-memory fakes are provided for testing via the `fakes` module.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Revision counter of a stored entry. The first write yields revision 1.
pub type Revision = u64;

/// A stored value with its revision and optional expiry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KvEntry {
    /// JSON-encoded value
    pub value: String,
    /// Revision of this value
    pub revision: Revision,
    /// When the entry stops being visible
    pub expires_at: Option<DateTime<Utc>>,
}

impl KvEntry {
    /// Whether the entry has expired at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Compute an absolute expiry from a relative TTL.
pub fn expiry_from_ttl(ttl: Option<Duration>) -> Option<DateTime<Utc>> {
    ttl.and_then(|ttl| chrono::Duration::from_std(ttl).ok())
        .map(|ttl| Utc::now() + ttl)
}

/// Durable key-value store with optimistic concurrency.
///
/// Guarantees:
/// - `get` never returns an expired entry.
/// - `put` always succeeds (create or overwrite) and bumps the revision.
/// - `compare_and_put` writes only if the stored revision equals `expected`;
///   it returns `false` (and writes nothing) otherwise, including when the
///   key is absent.
/// - `delete` is a no-op for absent keys.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read the live entry for `key`.
    async fn get(&self, key: &str) -> StorageResult<Option<KvEntry>>;

    /// Create or overwrite `key`, returning the new revision.
    async fn put(&self, key: &str, value: String, ttl: Option<Duration>)
        -> StorageResult<Revision>;

    /// Overwrite `key` only if its current revision is `expected`.
    async fn compare_and_put(
        &self,
        key: &str,
        expected: Revision,
        value: String,
        ttl: Option<Duration>,
    ) -> StorageResult<bool>;

    /// Remove `key`.
    async fn delete(&self, key: &str) -> StorageResult<()>;
}
