//! In-memory fakes for the core collaborator traits (testing only)
//!
//! - `MemoryTransport`: synchronous in-process pub/sub with failure injection
//! - `MemoryFileStore`: blob map with per-blob download counting
//! - `RecordingSandboxClient`: records submitted judge jobs
//! - `ScriptedGradingModel`, `ScriptedActionCaller`: canned plugin answers

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::bundler::blob::{FileStore, FileStoreError, FileStoreResult};
use crate::domain::{CriterionOutcome, ScoreBreakdown};
use crate::plugins::ai::{GradingModel, ModelGrade, ModelRequest};
use crate::plugins::remote::{ActionCaller, ActionRequest};
use crate::plugins::{PluginError, PluginResult};
use crate::sandbox::error::{SandboxError, SandboxResult};
use crate::sandbox::go_judge::{CallbackTarget, JudgeRequest, SandboxClient};
use crate::transport::{
    decode_envelope, encode_envelope, EventTransport, HandlerError, MessageHandler, TransportError,
    TransportResult,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// In-process transport. `publish` records the message, runs it through
/// the wire envelope and hands it to every subscriber before returning.
#[derive(Default)]
pub struct MemoryTransport {
    handlers: Mutex<HashMap<String, Vec<Arc<dyn MessageHandler>>>>,
    published: Mutex<Vec<(String, serde_json::Value)>>,
    rejected: Mutex<Vec<(String, String)>>,
    failing_publishes: AtomicU32,
    closed: AtomicBool,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` publishes with a publish error.
    pub fn fail_next_publishes(&self, n: u32) {
        self.failing_publishes.store(n, Ordering::SeqCst);
    }

    /// Every successfully published `(topic, payload)`, in order.
    pub fn published(&self) -> Vec<(String, serde_json::Value)> {
        lock(&self.published).clone()
    }

    pub fn published_on(&self, topic: &str) -> Vec<serde_json::Value> {
        lock(&self.published)
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    /// `(topic, error)` for every delivery a handler refused.
    pub fn rejected(&self) -> Vec<(String, String)> {
        lock(&self.rejected).clone()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        lock(&self.handlers).get(topic).map_or(0, Vec::len)
    }

    async fn deliver(&self, topic: &str, payload: &serde_json::Value) -> TransportResult<()> {
        let handlers = lock(&self.handlers).get(topic).cloned().unwrap_or_default();
        let wire = encode_envelope(payload)?;
        for handler in handlers {
            let message = decode_envelope(&wire)?;
            if let Err(HandlerError(reason)) = handler.handle(message).await {
                lock(&self.rejected).push((topic.to_string(), reason));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl EventTransport for MemoryTransport {
    async fn publish(&self, topic: &str, payload: &serde_json::Value) -> TransportResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let injected = self
            .failing_publishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(TransportError::Publish {
                topic: topic.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        lock(&self.published).push((topic.to_string(), payload.clone()));
        self.deliver(topic, payload).await
    }

    async fn subscribe(&self, topic: &str, handler: Arc<dyn MessageHandler>) -> TransportResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        lock(&self.handlers)
            .entry(topic.to_string())
            .or_default()
            .push(handler);
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        lock(&self.handlers).clear();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// File store
// ---------------------------------------------------------------------------

/// Blob map keyed by blob name.
pub struct MemoryFileStore {
    container: String,
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    failing: Mutex<HashSet<String>>,
    downloads: Mutex<Vec<String>>,
}

impl MemoryFileStore {
    pub fn new(container: &str) -> Self {
        Self {
            container: container.to_string(),
            blobs: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            downloads: Mutex::new(Vec::new()),
        }
    }

    pub fn insert(&self, blob_name: &str, content: impl Into<Vec<u8>>) {
        lock(&self.blobs).insert(blob_name.to_string(), content.into());
    }

    /// Make downloads of `blob_name` fail.
    pub fn fail_on(&self, blob_name: &str) {
        lock(&self.failing).insert(blob_name.to_string());
    }

    /// Blob names successfully downloaded, in order.
    pub fn downloads(&self) -> Vec<String> {
        lock(&self.downloads).clone()
    }

    pub fn download_count(&self, blob_name: &str) -> usize {
        lock(&self.downloads).iter().filter(|b| *b == blob_name).count()
    }
}

#[async_trait]
impl FileStore for MemoryFileStore {
    fn container(&self) -> &str {
        &self.container
    }

    async fn download_to_file(&self, blob_name: &str, local_path: &Path) -> FileStoreResult<()> {
        if lock(&self.failing).contains(blob_name) {
            return Err(FileStoreError::Request(format!("injected failure for {blob_name}")));
        }
        let content = lock(&self.blobs)
            .get(blob_name)
            .cloned()
            .ok_or_else(|| FileStoreError::NotFound(blob_name.to_string()))?;
        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(local_path, content).await?;
        lock(&self.downloads).push(blob_name.to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Sandbox
// ---------------------------------------------------------------------------

/// Records every submitted job instead of running it.
#[derive(Default)]
pub struct RecordingSandboxClient {
    submissions: Mutex<Vec<(JudgeRequest, CallbackTarget)>>,
    failing: AtomicBool,
}

impl RecordingSandboxClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_submissions(&self, fail: bool) {
        self.failing.store(fail, Ordering::SeqCst);
    }

    pub fn submissions(&self) -> Vec<(JudgeRequest, CallbackTarget)> {
        lock(&self.submissions).clone()
    }
}

#[async_trait]
impl SandboxClient for RecordingSandboxClient {
    async fn submit(&self, request: &JudgeRequest, target: &CallbackTarget) -> SandboxResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SandboxError::RemoteStatus {
                status: 503,
                body: "judge unavailable".to_string(),
            });
        }
        lock(&self.submissions).push((request.clone(), target.clone()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Plugins
// ---------------------------------------------------------------------------

/// Grades every rubric row at its highest level unless told otherwise.
#[derive(Default)]
pub struct ScriptedGradingModel {
    requests: Mutex<Vec<ModelRequest>>,
    failure: Mutex<Option<String>>,
    omitted: Mutex<HashSet<String>>,
}

impl ScriptedGradingModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_with(&self, message: &str) {
        *lock(&self.failure) = Some(message.to_string());
    }

    /// Leave `criterion_name` out of every response.
    pub fn omit(&self, criterion_name: &str) {
        lock(&self.omitted).insert(criterion_name.to_string());
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        lock(&self.requests).clone()
    }
}

#[async_trait]
impl GradingModel for ScriptedGradingModel {
    async fn grade(&self, request: &ModelRequest) -> PluginResult<Vec<ModelGrade>> {
        lock(&self.requests).push(request.clone());
        if let Some(message) = lock(&self.failure).clone() {
            return Err(PluginError::Invocation(message));
        }
        let omitted = lock(&self.omitted).clone();
        Ok(request
            .criteria
            .iter()
            .filter(|row| !omitted.contains(&row.criterion_name))
            .map(|row| ModelGrade {
                criterion_name: row.criterion_name.clone(),
                tag: row
                    .levels
                    .iter()
                    .max_by_key(|level| level.weight)
                    .map(|level| level.tag.clone())
                    .unwrap_or_default(),
                raw_score: None,
                summary: Some(format!("graded from bundle {}", request.bundle_id)),
                feedback_items: vec![],
            })
            .collect())
    }
}

/// Answers every remote action with a full-score outcome per criterion.
#[derive(Default)]
pub struct ScriptedActionCaller {
    calls: Mutex<Vec<(String, ActionRequest)>>,
    failure: Mutex<Option<String>>,
}

impl ScriptedActionCaller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_with(&self, message: &str) {
        *lock(&self.failure) = Some(message.to_string());
    }

    pub fn calls(&self) -> Vec<(String, ActionRequest)> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl ActionCaller for ScriptedActionCaller {
    async fn call(&self, plugin_id: &str, request: &ActionRequest) -> PluginResult<Vec<CriterionOutcome>> {
        lock(&self.calls).push((plugin_id.to_string(), request.clone()));
        if let Some(message) = lock(&self.failure).clone() {
            return Err(PluginError::Invocation(message));
        }
        Ok(request
            .criterion_data_list
            .iter()
            .map(|c| {
                CriterionOutcome::Graded(ScoreBreakdown {
                    criterion_name: c.criterion_name.clone(),
                    tag: c
                        .levels
                        .iter()
                        .max_by_key(|level| level.weight)
                        .map(|level| level.tag.clone())
                        .unwrap_or_default(),
                    raw_score: 100.0,
                    plugin: plugin_id.to_string(),
                    summary: None,
                    metadata: None,
                    feedback_items: vec![],
                })
            })
            .collect())
    }
}
