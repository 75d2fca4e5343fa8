//! Versioned, namespaced records on top of [`KvStore`].
//!
//! Each cache namespace (sandbox state, download cache, ...) defines one
//! struct implementing [`VersionedRecord`]. Values are stored as
//! `{"version": N, "data": {...}}` so a reader deployed with a different
//! schema version fails loudly with [`StorageError::VersionMismatch`]
//! instead of decoding a drifted shape.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::error::StorageError;
use crate::storage_traits::{KvStore, Revision, StorageResult};

/// A record type stored under its own key namespace.
pub trait VersionedRecord: Serialize + DeserializeOwned + Send + Sync {
    /// Key prefix, e.g. `test-runner` yields keys `test-runner:<id>`.
    const NAMESPACE: &'static str;
    /// Schema version written alongside every value.
    const VERSION: u32;
}

/// A decoded record with the revision it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<R> {
    pub record: R,
    pub revision: Revision,
}

#[derive(Serialize)]
struct EnvelopeOut<'a, R> {
    version: u32,
    data: &'a R,
}

#[derive(Deserialize)]
struct EnvelopeIn {
    version: u32,
    data: serde_json::Value,
}

/// Typed view of one namespace in a [`KvStore`].
pub struct RecordStore<R> {
    kv: Arc<dyn KvStore>,
    ttl: Option<Duration>,
    _record: PhantomData<fn() -> R>,
}

impl<R> Clone for RecordStore<R> {
    fn clone(&self) -> Self {
        Self {
            kv: Arc::clone(&self.kv),
            ttl: self.ttl,
            _record: PhantomData,
        }
    }
}

impl<R: VersionedRecord> RecordStore<R> {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            ttl: None,
            _record: PhantomData,
        }
    }

    /// Expire every record written through this store after `ttl`.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Full storage key for `id`.
    pub fn key(id: &str) -> String {
        format!("{}:{}", R::NAMESPACE, id)
    }

    fn encode(key: &str, record: &R) -> StorageResult<String> {
        serde_json::to_string(&EnvelopeOut {
            version: R::VERSION,
            data: record,
        })
        .map_err(|e| StorageError::Serialization {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    fn decode(key: &str, raw: &str) -> StorageResult<R> {
        let envelope: EnvelopeIn =
            serde_json::from_str(raw).map_err(|e| StorageError::Serialization {
                key: key.to_string(),
                reason: e.to_string(),
            })?;
        if envelope.version != R::VERSION {
            return Err(StorageError::VersionMismatch {
                key: key.to_string(),
                found: envelope.version,
                expected: R::VERSION,
            });
        }
        serde_json::from_value(envelope.data).map_err(|e| StorageError::Serialization {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    /// Load the record for `id`, if present and not expired.
    #[instrument(skip(self), fields(namespace = R::NAMESPACE))]
    pub async fn load(&self, id: &str) -> StorageResult<Option<Versioned<R>>> {
        let key = Self::key(id);
        match self.kv.get(&key).await? {
            Some(entry) => {
                let record = Self::decode(&key, &entry.value)?;
                Ok(Some(Versioned {
                    record,
                    revision: entry.revision,
                }))
            }
            None => Ok(None),
        }
    }

    /// Unconditionally write the record for `id`.
    #[instrument(skip(self, record), fields(namespace = R::NAMESPACE))]
    pub async fn save(&self, id: &str, record: &R) -> StorageResult<Revision> {
        let key = Self::key(id);
        let value = Self::encode(&key, record)?;
        let revision = self.kv.put(&key, value, self.ttl).await?;
        debug!(key = %key, revision, "record saved");
        Ok(revision)
    }

    /// Write the record for `id` only if it is still at `expected`.
    #[instrument(skip(self, record), fields(namespace = R::NAMESPACE))]
    pub async fn save_if(&self, id: &str, expected: Revision, record: &R) -> StorageResult<bool> {
        let key = Self::key(id);
        let value = Self::encode(&key, record)?;
        let written = self
            .kv
            .compare_and_put(&key, expected, value, self.ttl)
            .await?;
        debug!(key = %key, expected, written, "conditional record save");
        Ok(written)
    }

    /// Remove the record for `id`.
    pub async fn remove(&self, id: &str) -> StorageResult<()> {
        self.kv.delete(&Self::key(id)).await
    }
}
