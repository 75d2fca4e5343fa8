//! Request-scoped download cache.
//!
//! One cache entry per key (usually the assessment id) records the local
//! directory and the blob names already fetched into it. A later call with
//! an overlapping file set only downloads what is missing. Calls for the
//! same key are serialized; calls for different keys never share a
//! directory.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::stream::{self, StreamExt, TryStreamExt};
use gradeflow_state::{KvStore, RecordStore, VersionedRecord};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use super::blob::{create_temp_dir, remove_temp_dir, FileStore};
use super::{BundleError, BundleResult, BundlerConfig};
use crate::metrics::METRICS;

/// Persisted state of one cache entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadCacheRecord {
    pub cache_key: String,
    pub local_directory: PathBuf,
    pub downloaded_files: BTreeSet<String>,
}

impl VersionedRecord for DownloadCacheRecord {
    const NAMESPACE: &'static str = "pack-download";
    const VERSION: u32 = 1;
}

/// Local view of a cache entry after [`DownloadCache::ensure`].
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadCacheEntry {
    pub local_directory: PathBuf,
    pub downloaded_files: BTreeSet<String>,
}

pub struct DownloadCache {
    records: RecordStore<DownloadCacheRecord>,
    store: Arc<dyn FileStore>,
    config: BundlerConfig,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl DownloadCache {
    pub fn new(kv: Arc<dyn KvStore>, store: Arc<dyn FileStore>, config: BundlerConfig) -> Self {
        Self {
            records: RecordStore::new(kv).with_ttl(config.cache_ttl),
            store,
            config,
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn key_lock(&self, cache_key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(cache_key.to_string()).or_default())
    }

    /// Make every blob in `blobs` available under one local directory.
    ///
    /// Any download failure drops the whole entry, directory included.
    #[instrument(skip(self, blobs), fields(files = blobs.len()))]
    pub async fn ensure(
        &self,
        cache_key: &str,
        blobs: &BTreeSet<String>,
    ) -> BundleResult<DownloadCacheEntry> {
        let lock = self.key_lock(cache_key).await;
        let _guard = lock.lock().await;

        let existing = match self.records.load(cache_key).await? {
            Some(found) if found.record.local_directory.is_dir() => Some(found.record),
            Some(stale) => {
                debug!(cache_key = %cache_key, dir = %stale.record.local_directory.display(), "cached directory vanished");
                None
            }
            None => None,
        };
        let mut record = match existing {
            Some(record) => record,
            None => DownloadCacheRecord {
                cache_key: cache_key.to_string(),
                local_directory: create_temp_dir(&self.config.temp_root, "download").await?,
                downloaded_files: BTreeSet::new(),
            },
        };

        let missing: Vec<String> = blobs
            .difference(&record.downloaded_files)
            .cloned()
            .collect();
        debug!(cache_key = %cache_key, missing = missing.len(), cached = record.downloaded_files.len(), "resolving downloads");

        let dir = record.local_directory.clone();
        let fetched = stream::iter(missing.iter().map(|blob| {
            let dir = dir.clone();
            async move {
                self.store
                    .download_to_file(blob, &dir.join(blob.as_str()))
                    .await
                    .map_err(|e| BundleError::Download {
                        blob: blob.to_string(),
                        reason: e.to_string(),
                    })
            }
        }).collect::<Vec<_>>())
        .buffer_unordered(self.config.download_concurrency.max(1))
        .try_collect::<Vec<()>>()
        .await;

        if let Err(e) = fetched {
            self.drop_entry(cache_key, &record.local_directory).await;
            return Err(e);
        }

        METRICS.add_files_downloaded(missing.len() as u64);
        record.downloaded_files.extend(missing);
        if let Err(e) = self.records.save(cache_key, &record).await {
            self.drop_entry(cache_key, &record.local_directory).await;
            return Err(e.into());
        }

        Ok(DownloadCacheEntry {
            local_directory: record.local_directory,
            downloaded_files: record.downloaded_files,
        })
    }

    /// Remove the entry for `cache_key` and its directory.
    pub async fn invalidate(&self, cache_key: &str) -> BundleResult<()> {
        let lock = self.key_lock(cache_key).await;
        let _guard = lock.lock().await;
        if let Some(found) = self.records.load(cache_key).await? {
            remove_temp_dir(&found.record.local_directory).await?;
        }
        self.records.remove(cache_key).await?;
        self.locks.lock().await.remove(cache_key);
        Ok(())
    }

    async fn drop_entry(&self, cache_key: &str, dir: &Path) {
        if let Err(e) = remove_temp_dir(dir).await {
            warn!(cache_key = %cache_key, error = %e, "failed to remove download directory");
        }
        if let Err(e) = self.records.remove(cache_key).await {
            warn!(cache_key = %cache_key, error = %e, "failed to drop download cache entry");
        }
    }
}
