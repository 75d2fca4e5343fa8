//! Event transport: publish/subscribe over a message broker.
//!
//! Every component that emits or consumes events holds an
//! `Arc<dyn EventTransport>` constructed once at process start. Two broker
//! bindings satisfy the same contract:
//!
//! - [`amqp::AmqpTransport`]: durable fanout exchange per topic, one durable
//!   queue per subscriber group.
//! - [`service_bus::ServiceBusTransport`]: cloud topic plus one subscription
//!   per subscriber group, via the REST API.
//!
//! Delivery is at-least-once. A handler returning `Ok` acknowledges the
//! message; `Err` rejects it and the broker dead-letters or redelivers it
//! according to its own policy.

pub mod amqp;
pub mod service_bus;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::domain::ServiceEvent;
use crate::metrics::METRICS;

/// Errors produced by a transport binding.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("broker connection failed: {0}")]
    Connect(String),

    #[error("broker did not answer within {secs}s")]
    ConnectTimeout { secs: u64 },

    #[error("failed to declare topology for {topic}: {reason}")]
    Topology { topic: String, reason: String },

    #[error("publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },

    #[error("subscribe to {topic} failed: {reason}")]
    Subscribe { topic: String, reason: String },

    #[error("message codec error: {0}")]
    Codec(String),

    #[error("transport is closed")]
    Closed,
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Failure reported by a message handler; the message is rejected.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl std::fmt::Display) -> Self {
        Self(message.to_string())
    }
}

/// Consumer side of a subscription.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, payload: serde_json::Value) -> Result<(), HandlerError>;
}

/// Publish/subscribe contract shared by every broker binding.
///
/// Topic declaration is idempotent. `subscribe` binds a durable,
/// group-scoped queue so independent subscriber groups each see every
/// message while instances of one group share the work.
#[async_trait]
pub trait EventTransport: Send + Sync {
    async fn publish(&self, topic: &str, payload: &serde_json::Value) -> TransportResult<()>;

    async fn subscribe(&self, topic: &str, handler: Arc<dyn MessageHandler>)
        -> TransportResult<()>;

    /// Stop consumers and release the broker connection.
    async fn close(&self) -> TransportResult<()>;
}

/// Startup probe limit; an unreachable broker is fatal.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Retry schedule for publishing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    /// Delay before retry `n` is `backoff_base_ms * 2^n`.
    pub backoff_base_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 1_000,
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_base_ms.saturating_mul(2u64.saturating_pow(attempt)))
    }
}

/// Wrap a payload in the `{"message": ...}` wire envelope.
pub fn encode_envelope(payload: &serde_json::Value) -> TransportResult<Vec<u8>> {
    serde_json::to_vec(&serde_json::json!({ "message": payload }))
        .map_err(|e| TransportError::Codec(e.to_string()))
}

/// Unwrap the wire envelope. Bare payloads are accepted as-is.
pub fn decode_envelope(bytes: &[u8]) -> TransportResult<serde_json::Value> {
    let value: serde_json::Value =
        serde_json::from_slice(bytes).map_err(|e| TransportError::Codec(e.to_string()))?;
    match value {
        serde_json::Value::Object(mut map) if map.contains_key("message") => {
            Ok(map.remove("message").unwrap_or(serde_json::Value::Null))
        }
        other => Ok(other),
    }
}

/// Publish `payload` on `topic`, retrying per `policy`.
pub async fn publish_with_retry(
    transport: &dyn EventTransport,
    topic: &str,
    payload: &serde_json::Value,
    policy: &RetryPolicy,
) -> TransportResult<()> {
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match transport.publish(topic, payload).await {
            Ok(()) => {
                METRICS.inc_events_published();
                return Ok(());
            }
            Err(TransportError::Closed) => return Err(TransportError::Closed),
            Err(e) if attempt < attempts => {
                let delay = policy.delay_for(attempt);
                warn!(topic = %topic, attempt, error = %e, delay_ms = delay.as_millis() as u64, "publish failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Publish a typed event on its own topic.
pub async fn publish_event<E: ServiceEvent>(
    transport: &dyn EventTransport,
    event: &E,
    policy: &RetryPolicy,
) -> TransportResult<()> {
    let payload = serde_json::to_value(event).map_err(|e| TransportError::Codec(e.to_string()))?;
    publish_with_retry(transport, E::NAME, &payload, policy).await
}

/// Queue/subscription name for a subscriber group on a topic.
pub fn group_queue_name(topic: &str, group: &str) -> String {
    format!("{topic}.{group}")
}
