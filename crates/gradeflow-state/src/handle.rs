//! SurrealDB Handle - Connection and key-value operations
//!
//! Supports in-memory (`mem://`), local (`surrealkv://`), and cloud
//! (WebSocket) connections. All of them implement [`KvStore`].

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use surrealdb::engine::any::Any;
use surrealdb::opt::auth::{Database, Root};
use surrealdb::Surreal;
use tracing::{debug, info, instrument};

use crate::error::{StateError, StorageError};
use crate::migrations;
use crate::storage_traits::{expiry_from_ttl, KvEntry, KvStore, Revision, StorageResult};
use crate::Result;

const DEFAULT_NAMESPACE: &str = "gradeflow";
const DEFAULT_DATABASE: &str = "main";
const LOCAL_DB_PATH: &str = ".gradeflow/db";

/// Credentials for a hosted SurrealDB instance.
#[derive(Debug, Clone, PartialEq)]
pub struct CloudConfig {
    /// WebSocket endpoint, e.g. `wss://xxx.aws-use1.surrealdb.cloud`
    pub endpoint: String,
    pub username: String,
    pub password: String,
    pub namespace: String,
    pub database: String,
    /// Sign in as a root user instead of a database user.
    pub is_root: bool,
}

/// Where the attempt and download-cache state lives.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreLocation {
    Cloud(CloudConfig),
    /// Any URL SurrealDB accepts (`mem://`, `surrealkv://path`, `ws://host`).
    Url(String),
    /// Embedded store persisted under this directory.
    Local(PathBuf),
}

impl StoreLocation {
    /// Resolve from configuration variables.
    ///
    /// `SURREALDB_ENDPOINT` with `SURREALDB_USERNAME` and `SURREALDB_PASSWORD`
    /// selects a hosted instance (`SURREALDB_NAMESPACE`, `SURREALDB_DATABASE`
    /// and `SURREALDB_ROOT` are optional). Otherwise `SURREALDB_URL` is used
    /// as is, and without either the store persists under `.gradeflow/db`.
    pub fn resolve(var: impl Fn(&str) -> Option<String>) -> Self {
        let cloud = (|| {
            Some(CloudConfig {
                endpoint: var("SURREALDB_ENDPOINT")?,
                username: var("SURREALDB_USERNAME")?,
                password: var("SURREALDB_PASSWORD")?,
                namespace: var("SURREALDB_NAMESPACE")
                    .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
                database: var("SURREALDB_DATABASE")
                    .unwrap_or_else(|| DEFAULT_DATABASE.to_string()),
                is_root: var("SURREALDB_ROOT").is_some_and(|v| v.eq_ignore_ascii_case("true")),
            })
        })();
        match (cloud, var("SURREALDB_URL")) {
            (Some(config), _) => Self::Cloud(config),
            (None, Some(url)) => Self::Url(url),
            (None, None) => Self::Local(PathBuf::from(LOCAL_DB_PATH)),
        }
    }
}

/// SurrealDB-backed implementation of [`KvStore`].
#[derive(Clone)]
pub struct SurrealKvStore {
    db: Surreal<Any>,
}

#[derive(Debug, Deserialize)]
struct DbKvEntry {
    payload: String,
    revision: u64,
    expires_at: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct DbRevision {
    revision: u64,
}

fn to_millis(at: Option<DateTime<Utc>>) -> Option<i64> {
    at.map(|at| at.timestamp_millis())
}

fn from_millis(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}

impl SurrealKvStore {
    /// Connect to SurrealDB in-memory and set up schema
    #[instrument(skip_all)]
    pub async fn in_memory() -> Result<Self> {
        info!("Connecting to SurrealDB (in-memory)");
        Self::connect("mem://").await
    }

    /// Connect to any SurrealDB URL (`mem://`, `surrealkv://path`, `ws://host`)
    /// using the default namespace and database.
    #[instrument(skip_all, fields(url = %url))]
    pub async fn connect(url: &str) -> Result<Self> {
        let db = surrealdb::engine::any::connect(url)
            .await
            .map_err(|e| StateError::Connection(format!("Failed to connect to {}: {}", url, e)))?;

        db.use_ns(DEFAULT_NAMESPACE)
            .use_db(DEFAULT_DATABASE)
            .await
            .map_err(|e| StateError::Connection(e.to_string()))?;

        migrations::init_schema(&db).await?;
        info!("SurrealKvStore connected ({})", url);
        Ok(Self { db })
    }

    /// Connect to SurrealDB Cloud
    #[instrument(skip(config), fields(endpoint = %config.endpoint, namespace = %config.namespace, database = %config.database))]
    pub async fn setup_cloud(config: CloudConfig) -> Result<Self> {
        info!("Connecting to SurrealDB Cloud (root={})", config.is_root);

        let db = surrealdb::engine::any::connect(&config.endpoint)
            .await
            .map_err(|e| {
                StateError::Connection(format!("Failed to connect to {}: {}", config.endpoint, e))
            })?;

        if config.is_root {
            db.signin(Root {
                username: &config.username,
                password: &config.password,
            })
            .await
            .map_err(|e| StateError::Connection(format!("Root authentication failed: {}", e)))?;
        } else {
            db.signin(Database {
                namespace: &config.namespace,
                database: &config.database,
                username: &config.username,
                password: &config.password,
            })
            .await
            .map_err(|e| {
                StateError::Connection(format!("Database authentication failed: {}", e))
            })?;
        }

        db.use_ns(&config.namespace)
            .use_db(&config.database)
            .await
            .map_err(|e| {
                StateError::Connection(format!("Failed to select namespace/database: {}", e))
            })?;

        migrations::init_schema(&db).await?;
        info!("SurrealDB Cloud connected and schema initialized");
        Ok(Self { db })
    }

    /// Connect to the store named by the `SURREALDB_*` environment variables.
    pub async fn from_env() -> Result<Self> {
        Self::open(StoreLocation::resolve(|name| std::env::var(name).ok())).await
    }

    #[instrument(skip_all)]
    pub async fn open(location: StoreLocation) -> Result<Self> {
        match location {
            StoreLocation::Cloud(config) => Self::setup_cloud(config).await,
            StoreLocation::Url(url) => Self::connect(&url).await,
            StoreLocation::Local(dir) => {
                std::fs::create_dir_all(&dir).map_err(|e| {
                    StateError::Connection(format!(
                        "Failed to create database directory {}: {}",
                        dir.display(),
                        e
                    ))
                })?;
                Self::connect(&format!("surrealkv://{}", dir.display())).await
            }
        }
    }
}

#[async_trait]
impl KvStore for SurrealKvStore {
    async fn get(&self, key: &str) -> StorageResult<Option<KvEntry>> {
        let mut res = self
            .db
            .query("SELECT payload, revision, expires_at FROM type::thing('kv_entries', $key)")
            .bind(("key", key.to_string()))
            .await?;

        let rows: Vec<DbKvEntry> = res.take(0)?;
        let now = Utc::now();
        Ok(rows
            .into_iter()
            .next()
            .map(|row| KvEntry {
                value: row.payload,
                revision: row.revision,
                expires_at: from_millis(row.expires_at),
            })
            .filter(|entry| !entry.is_expired_at(now)))
    }

    async fn put(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> StorageResult<Revision> {
        let mut res = self
            .db
            .query(
                "UPSERT type::thing('kv_entries', $key) SET \
                    entry_key = $key, \
                    payload = $payload, \
                    revision = (revision OR 0) + 1, \
                    expires_at = $expires_at, \
                    updated_at = time::now() \
                 RETURN revision",
            )
            .bind(("key", key.to_string()))
            .bind(("payload", value))
            .bind(("expires_at", to_millis(expiry_from_ttl(ttl))))
            .await?;

        let rows: Vec<DbRevision> = res.take(0)?;
        let revision = rows
            .into_iter()
            .next()
            .map(|row| row.revision)
            .ok_or_else(|| StorageError::Backend(format!("upsert of {key} returned no row")))?;
        debug!(key = %key, revision, "kv entry written");
        Ok(revision)
    }

    async fn compare_and_put(
        &self,
        key: &str,
        expected: Revision,
        value: String,
        ttl: Option<Duration>,
    ) -> StorageResult<bool> {
        let mut res = self
            .db
            .query(
                "UPDATE type::thing('kv_entries', $key) SET \
                    payload = $payload, \
                    revision = revision + 1, \
                    expires_at = $expires_at, \
                    updated_at = time::now() \
                 WHERE revision = $expected AND (expires_at = NONE OR expires_at > $now) \
                 RETURN revision",
            )
            .bind(("key", key.to_string()))
            .bind(("payload", value))
            .bind(("expires_at", to_millis(expiry_from_ttl(ttl))))
            .bind(("expected", expected))
            .bind(("now", Utc::now().timestamp_millis()))
            .await?;

        let rows: Vec<DbRevision> = res.take(0)?;
        Ok(!rows.is_empty())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.db
            .query("DELETE type::thing('kv_entries', $key)")
            .bind(("key", key.to_string()))
            .await?
            .check()?;
        Ok(())
    }
}
