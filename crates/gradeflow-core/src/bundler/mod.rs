//! Submission bundler.
//!
//! Turns `(criterion, file refs)` pairs into deduplicated [`FileBundle`]s:
//!
//! 1. resolve every reference to a canonical blob name
//! 2. download the union of blobs once through the [`DownloadCache`]
//! 3. group criteria by their sorted, joined path set
//! 4. pack each group concurrently
//!
//! A download failure aborts the call. A pack failure only turns the
//! criteria of that group into [`BundleFailure`]s.

pub mod blob;
pub mod download_cache;
pub mod pack;

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use gradeflow_state::{KvStore, StorageError};
use sha2::{Digest, Sha256};
use tracing::{info, instrument};

use crate::metrics::METRICS;
use crate::obs;
use blob::FileStore;
use download_cache::DownloadCache;

/// Message attached to criteria whose group could not be packed.
pub const PACK_FAILED_MESSAGE: &str = "Cannot use files for grading";

#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    #[error("download of {blob} failed: {reason}")]
    Download { blob: String, reason: String },

    #[error("packing bundle {bundle_id} failed: {reason}")]
    Pack { bundle_id: String, reason: String },

    #[error("download cache error: {0}")]
    Cache(#[from] StorageError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type BundleResult<T> = std::result::Result<T, BundleError>;

#[derive(Debug, Clone)]
pub struct BundlerConfig {
    /// Parallel blob downloads per request.
    pub download_concurrency: usize,
    /// Parent of every temporary directory.
    pub temp_root: PathBuf,
    /// Expiry of download cache records.
    pub cache_ttl: Duration,
}

impl Default for BundlerConfig {
    fn default() -> Self {
        Self {
            download_concurrency: 8,
            temp_root: std::env::temp_dir(),
            cache_ttl: Duration::from_secs(60 * 60),
        }
    }
}

/// The files one criterion needs.
#[derive(Debug, Clone, PartialEq)]
pub struct BundleInput {
    pub criterion_name: String,
    pub file_refs: Vec<String>,
}

/// Packed content shared by every criterion with the same path set.
#[derive(Debug, Clone, PartialEq)]
pub struct FileBundle {
    pub bundle_id: String,
    pub criterion_names: Vec<String>,
    pub included_file_paths: Vec<String>,
    pub packed_content: String,
    pub total_size: usize,
}

/// Criteria that could not be bundled, with the reason.
#[derive(Debug, Clone, PartialEq)]
pub struct BundleFailure {
    pub criterion_names: Vec<String>,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BundleReport {
    pub bundles: Vec<FileBundle>,
    pub errors: Vec<BundleFailure>,
}

struct Group {
    key: String,
    paths: Vec<String>,
    criteria: Vec<String>,
}

/// Short content address of a path-set key.
pub fn bundle_id(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    hex::encode(&digest[..6])
}

pub struct Bundler {
    store: Arc<dyn FileStore>,
    cache: DownloadCache,
}

impl Bundler {
    pub fn new(kv: Arc<dyn KvStore>, store: Arc<dyn FileStore>, config: BundlerConfig) -> Self {
        Self {
            cache: DownloadCache::new(kv, Arc::clone(&store), config),
            store,
        }
    }

    /// Bundle `inputs`, downloading through the cache entry `cache_key`.
    ///
    /// Criteria with an unresolvable reference are reported as failures
    /// without affecting the others.
    #[instrument(skip(self, inputs), fields(criteria = inputs.len()))]
    pub async fn bundle(&self, cache_key: &str, inputs: &[BundleInput]) -> BundleResult<BundleReport> {
        let mut report = BundleReport::default();
        let mut groups: Vec<Group> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();

        for input in inputs {
            let resolved: Result<BTreeSet<String>, _> = input
                .file_refs
                .iter()
                .map(|r| self.store.blob_name(r))
                .collect();
            let paths = match resolved {
                Ok(paths) => paths,
                Err(e) => {
                    report.errors.push(BundleFailure {
                        criterion_names: vec![input.criterion_name.clone()],
                        error: e.to_string(),
                    });
                    continue;
                }
            };
            let paths: Vec<String> = paths.into_iter().collect();
            let key = paths.join("\n");
            match index.get(&key) {
                Some(&i) => groups[i].criteria.push(input.criterion_name.clone()),
                None => {
                    index.insert(key.clone(), groups.len());
                    groups.push(Group {
                        key,
                        paths,
                        criteria: vec![input.criterion_name.clone()],
                    });
                }
            }
        }

        if groups.is_empty() {
            return Ok(report);
        }

        let all_blobs: BTreeSet<String> = groups
            .iter()
            .flat_map(|g| g.paths.iter().cloned())
            .collect();
        let entry = self.cache.ensure(cache_key, &all_blobs).await?;

        let packed = join_all(groups.into_iter().map(|group| {
            let root = entry.local_directory.clone();
            async move {
                let id = bundle_id(&group.key);
                let result = pack::pack_files(&root, &group.paths).await;
                (id, group, result)
            }
        }))
        .await;

        for (id, group, result) in packed {
            match result {
                Ok(content) => {
                    METRICS.inc_bundles_packed();
                    obs::emit_bundle_packed(&id, group.criteria.len(), content.len());
                    report.bundles.push(FileBundle {
                        bundle_id: id,
                        criterion_names: group.criteria,
                        included_file_paths: group.paths,
                        total_size: content.len(),
                        packed_content: content,
                    });
                }
                Err(e) => {
                    let err = BundleError::Pack {
                        bundle_id: id.clone(),
                        reason: e.to_string(),
                    };
                    obs::emit_bundle_failed(&id, &err);
                    report.errors.push(BundleFailure {
                        criterion_names: group.criteria,
                        error: PACK_FAILED_MESSAGE.to_string(),
                    });
                }
            }
        }

        info!(
            cache_key = %cache_key,
            bundles = report.bundles.len(),
            failed = report.errors.len(),
            "bundling complete"
        );
        Ok(report)
    }

    /// Drop the download cache entry and its temporary directory.
    pub async fn release(&self, cache_key: &str) -> BundleResult<()> {
        self.cache.invalidate(cache_key).await
    }

    pub fn cache(&self) -> &DownloadCache {
        &self.cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundle_id_is_stable_and_short() {
        assert_eq!(bundle_id("a\nb"), bundle_id("a\nb"));
        assert_ne!(bundle_id("a\nb"), bundle_id("a\nc"));
        assert_eq!(bundle_id("x").len(), 12);
    }
}
