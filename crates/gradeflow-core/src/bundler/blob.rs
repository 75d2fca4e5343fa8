//! File store collaborator and path handling for submission files.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};

/// Prefix of every temporary directory this crate creates.
pub const TEMP_PREFIX: &str = "gradeflow-";

#[derive(Debug, thiserror::Error)]
pub enum FileStoreError {
    #[error("invalid file reference {reference}: {reason}")]
    InvalidReference { reference: String, reason: String },

    #[error("blob not found: {0}")]
    NotFound(String),

    #[error("blob store returned {status} for {blob}")]
    Status { blob: String, status: u16 },

    #[error("blob request failed: {0}")]
    Request(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type FileStoreResult<T> = std::result::Result<T, FileStoreError>;

/// Get/put file store holding submitted files.
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Container that file references point into.
    fn container(&self) -> &str;

    /// Canonical relative path for a file reference.
    fn blob_name(&self, file_ref: &str) -> FileStoreResult<String> {
        blob_name(file_ref, self.container())
    }

    /// Fetch `blob_name` into `local_path`, creating parent directories.
    async fn download_to_file(&self, blob_name: &str, local_path: &Path) -> FileStoreResult<()>;
}

/// Split of a blob name into its first segment and the remainder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobNameParts {
    pub root: String,
    pub rest: String,
}

/// The part of `file_ref` after `<container>/`, with any query stripped and
/// the result normalized. References without the container are taken whole.
pub fn blob_name(file_ref: &str, container: &str) -> FileStoreResult<String> {
    let without_query = file_ref
        .split(['?', '#'])
        .next()
        .unwrap_or_default();
    let marker = format!("{container}/");
    let name = match without_query.find(&marker) {
        Some(idx) => &without_query[idx + marker.len()..],
        None if without_query.contains("://") => {
            return Err(FileStoreError::InvalidReference {
                reference: file_ref.to_string(),
                reason: format!("not inside container {container}"),
            })
        }
        None => without_query,
    };
    normalize_relative_path(name).map_err(|reason| FileStoreError::InvalidReference {
        reference: file_ref.to_string(),
        reason,
    })
}

pub fn blob_name_parts(name: &str) -> BlobNameParts {
    match name.split_once('/') {
        Some((root, rest)) => BlobNameParts {
            root: root.to_string(),
            rest: rest.to_string(),
        },
        None => BlobNameParts {
            root: name.to_string(),
            rest: String::new(),
        },
    }
}

/// Collapse `.` and empty segments; reject absolute paths and `..`.
pub fn normalize_relative_path(path: &str) -> Result<String, String> {
    let path = path.replace('\\', "/");
    if path.starts_with('/') {
        return Err("absolute paths are not allowed".to_string());
    }
    if path.len() >= 2 && path.as_bytes()[1] == b':' {
        return Err("drive-qualified paths are not allowed".to_string());
    }
    let mut segments = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => return Err("parent directory segments are not allowed".to_string()),
            s => segments.push(s),
        }
    }
    if segments.is_empty() {
        return Err("empty path".to_string());
    }
    Ok(segments.join("/"))
}

/// Create `<root>/gradeflow-<tag>-<uuid>`.
pub async fn create_temp_dir(root: &Path, tag: &str) -> std::io::Result<PathBuf> {
    let dir = root.join(format!("{TEMP_PREFIX}{tag}-{}", uuid::Uuid::new_v4()));
    tokio::fs::create_dir_all(&dir).await?;
    Ok(dir)
}

/// Remove a directory made by [`create_temp_dir`]. Paths without the
/// `gradeflow-` prefix are refused; a missing directory is not an error.
pub async fn remove_temp_dir(dir: &Path) -> std::io::Result<()> {
    let owned = dir
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with(TEMP_PREFIX));
    if !owned {
        return Err(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            format!("refusing to remove {}", dir.display()),
        ));
    }
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Blob store reached over plain HTTP(S), optionally with a SAS query.
pub struct HttpBlobStore {
    http: reqwest::Client,
    endpoint: String,
    container: String,
    sas: Option<String>,
}

impl HttpBlobStore {
    pub fn new(endpoint: &str, container: &str, sas: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            container: container.to_string(),
            sas: sas.map(|s| s.trim_start_matches('?').to_string()),
        }
    }

    fn blob_url(&self, blob_name: &str) -> String {
        let mut url = format!("{}/{}/{}", self.endpoint, self.container, blob_name);
        if let Some(sas) = &self.sas {
            url.push('?');
            url.push_str(sas);
        }
        url
    }
}

#[async_trait]
impl FileStore for HttpBlobStore {
    fn container(&self) -> &str {
        &self.container
    }

    #[instrument(skip(self, local_path))]
    async fn download_to_file(&self, blob_name: &str, local_path: &Path) -> FileStoreResult<()> {
        let response = self
            .http
            .get(self.blob_url(blob_name))
            .send()
            .await
            .map_err(|e| FileStoreError::Request(e.to_string()))?;
        match response.status() {
            reqwest::StatusCode::NOT_FOUND => {
                return Err(FileStoreError::NotFound(blob_name.to_string()))
            }
            s if !s.is_success() => {
                return Err(FileStoreError::Status {
                    blob: blob_name.to_string(),
                    status: s.as_u16(),
                })
            }
            _ => {}
        }

        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(local_path).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0usize;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| FileStoreError::Request(e.to_string()))?;
            written += chunk.len();
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        debug!(blob = %blob_name, bytes = written, "blob downloaded");
        Ok(())
    }
}
