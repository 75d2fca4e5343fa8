//! In-memory fakes for storage traits (testing only)
//!
//! Provides `MemoryKvStore`, which satisfies the `KvStore` contract without
//! any external dependencies.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::StorageError;
use crate::storage_traits::*;

/// In-memory key-value store backed by a `HashMap<key, KvEntry>`.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: Mutex<HashMap<String, KvEntry>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries (test helper).
    pub fn len(&self) -> usize {
        let now = Utc::now();
        self.entries
            .lock()
            .map(|entries| entries.values().filter(|e| !e.is_expired_at(now)).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> StorageError {
    StorageError::Backend("memory store lock poisoned".to_string())
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> StorageResult<Option<KvEntry>> {
        let entries = self.entries.lock().map_err(|_| poisoned())?;
        Ok(entries
            .get(key)
            .filter(|entry| !entry.is_expired_at(Utc::now()))
            .cloned())
    }

    async fn put(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> StorageResult<Revision> {
        let mut entries = self.entries.lock().map_err(|_| poisoned())?;
        let revision = entries.get(key).map(|e| e.revision).unwrap_or(0) + 1;
        entries.insert(
            key.to_string(),
            KvEntry {
                value,
                revision,
                expires_at: expiry_from_ttl(ttl),
            },
        );
        Ok(revision)
    }

    async fn compare_and_put(
        &self,
        key: &str,
        expected: Revision,
        value: String,
        ttl: Option<Duration>,
    ) -> StorageResult<bool> {
        let mut entries = self.entries.lock().map_err(|_| poisoned())?;
        let now = Utc::now();
        match entries.get_mut(key) {
            Some(entry) if !entry.is_expired_at(now) && entry.revision == expected => {
                entry.value = value;
                entry.revision += 1;
                entry.expires_at = expiry_from_ttl(ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let mut entries = self.entries.lock().map_err(|_| poisoned())?;
        entries.remove(key);
        Ok(())
    }
}
