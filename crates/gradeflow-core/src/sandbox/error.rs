//! Error types for the sandbox layer.

/// Errors produced while driving a sandbox attempt.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("sandbox request failed: {0}")]
    Http(String),

    #[error("sandbox service returned {status}: {body}")]
    RemoteStatus { status: u16, body: String },

    #[error("sandbox call timed out after {elapsed_ms}ms (limit {limit_ms}ms)")]
    Timeout { elapsed_ms: u64, limit_ms: u64 },

    #[error("sandbox call failed after {attempts} attempt(s): {reason}")]
    ExecutionFailed { attempts: u32, reason: String },

    #[error(
        "circuit breaker open: {consecutive_failures} consecutive failures (threshold {threshold})"
    )]
    CircuitBreakerOpen {
        consecutive_failures: u32,
        threshold: u32,
    },

    #[error("sandbox state storage failed: {0}")]
    State(#[from] gradeflow_state::StorageError),

    #[error("concurrent updates to attempt {attempt_id} did not settle")]
    Contended { attempt_id: String },

    #[error("publishing the attempt result failed: {0}")]
    Publish(String),

    #[error("invalid sandbox configuration: {0}")]
    InvalidConfig(String),
}

impl SandboxError {
    /// Whether another submit could succeed: transport failures, timeouts,
    /// throttling and server-side errors.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(_) | Self::Timeout { .. } => true,
            Self::RemoteStatus { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// Result type for sandbox operations.
pub type SandboxResult<T> = std::result::Result<T, SandboxError>;
