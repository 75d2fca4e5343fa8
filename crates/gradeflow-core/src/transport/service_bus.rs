//! Cloud queue binding over the Azure Service Bus REST API.
//!
//! Topology per topic: one topic entity plus one subscription
//! `<topic>-<group>-sub` per subscriber group. Entities are created with
//! `PUT`; `409 Conflict` means the entity already exists. Messages are
//! received with peek-lock: success completes (deletes) the lock, failure
//! unlocks it so the entity's max delivery count eventually dead-letters it.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use hmac::{Hmac, Mac};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, LOCATION};
use reqwest::{Method, StatusCode};
use sha2::Sha256;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::{
    decode_envelope, encode_envelope, EventTransport, MessageHandler, TransportError,
    TransportResult, CONNECT_TIMEOUT,
};

const API_VERSION: &str = "2021-05";
/// Messages locked and in flight per subscription.
const MAX_IN_FLIGHT: usize = 10;
/// Long-poll window for one receive call.
const RECEIVE_TIMEOUT_SECS: u64 = 30;
const TOKEN_TTL_SECS: i64 = 3600;

const TOPIC_BODY: &str = r#"<entry xmlns="http://www.w3.org/2005/Atom"><content type="application/xml"><TopicDescription xmlns:i="http://www.w3.org/2001/XMLSchema-instance" xmlns="http://schemas.microsoft.com/netservices/2010/10/servicebus/connect"></TopicDescription></content></entry>"#;
const SUBSCRIPTION_BODY: &str = r#"<entry xmlns="http://www.w3.org/2005/Atom"><content type="application/xml"><SubscriptionDescription xmlns:i="http://www.w3.org/2001/XMLSchema-instance" xmlns="http://schemas.microsoft.com/netservices/2010/10/servicebus/connect"></SubscriptionDescription></content></entry>"#;

/// Parsed `Endpoint=sb://...;SharedAccessKeyName=...;SharedAccessKey=...`.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionString {
    /// HTTP(S) base URL of the namespace, always ending in `/`.
    pub endpoint: Url,
    pub key_name: String,
    pub key: String,
}

impl FromStr for ConnectionString {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut endpoint = None;
        let mut key_name = None;
        let mut key = None;
        let mut emulator = false;

        for part in s.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let Some((name, value)) = part.split_once('=') else {
                continue;
            };
            match name.to_ascii_lowercase().as_str() {
                "endpoint" => endpoint = Some(value.to_string()),
                "sharedaccesskeyname" => key_name = Some(value.to_string()),
                "sharedaccesskey" => key = Some(value.to_string()),
                "usedevelopmentemulator" => emulator = value.eq_ignore_ascii_case("true"),
                _ => {}
            }
        }

        let missing = |field: &str| TransportError::Connect(format!("connection string missing {field}"));
        let endpoint = endpoint.ok_or_else(|| missing("Endpoint"))?;
        let host = endpoint
            .strip_prefix("sb://")
            .or_else(|| endpoint.strip_prefix("https://"))
            .or_else(|| endpoint.strip_prefix("http://"))
            .unwrap_or(endpoint.as_str())
            .trim_end_matches('/');
        let scheme = if emulator { "http" } else { "https" };
        let endpoint = Url::parse(&format!("{scheme}://{host}/"))
            .map_err(|e| TransportError::Connect(format!("invalid endpoint: {e}")))?;

        Ok(Self {
            endpoint,
            key_name: key_name.ok_or_else(|| missing("SharedAccessKeyName"))?,
            key: key.ok_or_else(|| missing("SharedAccessKey"))?,
        })
    }
}

fn url_encode(s: &str) -> String {
    url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
}

/// Build a SAS token for `resource`, valid until `expiry` (unix seconds).
pub fn sas_token(resource: &str, key_name: &str, key: &str, expiry: i64) -> TransportResult<String> {
    let encoded_resource = url_encode(resource);
    let mut mac = Hmac::<Sha256>::new_from_slice(key.as_bytes())
        .map_err(|e| TransportError::Connect(format!("invalid shared access key: {e}")))?;
    mac.update(format!("{encoded_resource}\n{expiry}").as_bytes());
    let signature =
        base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());
    Ok(format!(
        "SharedAccessSignature sr={encoded_resource}&sig={}&se={expiry}&skn={key_name}",
        url_encode(&signature)
    ))
}

/// Subscription name for a subscriber group on a topic.
pub fn subscription_name(topic: &str, group: &str) -> String {
    format!("{topic}-{group}-sub")
}

/// A peek-locked message.
struct LockedMessage {
    body: Vec<u8>,
    lock_url: Option<Url>,
}

#[derive(Clone)]
struct RestClient {
    http: reqwest::Client,
    connection: ConnectionString,
}

impl RestClient {
    fn url(&self, path: &str) -> TransportResult<Url> {
        self.connection
            .endpoint
            .join(path)
            .map_err(|e| TransportError::Codec(format!("invalid entity path {path}: {e}")))
    }

    fn token(&self) -> TransportResult<String> {
        let expiry = chrono::Utc::now().timestamp() + TOKEN_TTL_SECS;
        sas_token(
            self.connection.endpoint.as_str(),
            &self.connection.key_name,
            &self.connection.key,
            expiry,
        )
    }

    fn request(&self, method: Method, url: Url) -> TransportResult<reqwest::RequestBuilder> {
        Ok(self
            .http
            .request(method, url)
            .header(AUTHORIZATION, self.token()?))
    }

    /// `PUT` an entity description; an existing entity is not an error.
    async fn ensure_entity(&self, path: &str, body: &'static str, topic: &str) -> TransportResult<()> {
        let mut url = self.url(path)?;
        url.query_pairs_mut().append_pair("api-version", API_VERSION);
        let topology_err = |reason: String| TransportError::Topology {
            topic: topic.to_string(),
            reason,
        };
        let response = self
            .request(Method::PUT, url)?
            .header(CONTENT_TYPE, "application/atom+xml;type=entry;charset=utf-8")
            .body(body)
            .send()
            .await
            .map_err(|e| topology_err(e.to_string()))?;
        match response.status() {
            s if s.is_success() => {
                debug!(path = %path, "entity created");
                Ok(())
            }
            StatusCode::CONFLICT => Ok(()),
            s => Err(topology_err(format!("unexpected status {s}"))),
        }
    }

    async fn send(&self, topic: &str, body: Vec<u8>) -> TransportResult<()> {
        let url = self.url(&format!("{topic}/messages"))?;
        let publish_err = |reason: String| TransportError::Publish {
            topic: topic.to_string(),
            reason,
        };
        let response = self
            .request(Method::POST, url)?
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| publish_err(e.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(publish_err(format!("unexpected status {}", response.status())))
        }
    }

    async fn receive(&self, topic: &str, subscription: &str) -> TransportResult<Option<LockedMessage>> {
        let mut url = self.url(&format!("{topic}/subscriptions/{subscription}/messages/head"))?;
        url.query_pairs_mut()
            .append_pair("timeout", &RECEIVE_TIMEOUT_SECS.to_string());
        let subscribe_err = |reason: String| TransportError::Subscribe {
            topic: topic.to_string(),
            reason,
        };
        let response = self
            .request(Method::POST, url)?
            .send()
            .await
            .map_err(|e| subscribe_err(e.to_string()))?;
        match response.status() {
            StatusCode::NO_CONTENT => Ok(None),
            s if s.is_success() => {
                let lock_url = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| Url::parse(v).ok());
                let body = response
                    .bytes()
                    .await
                    .map_err(|e| subscribe_err(e.to_string()))?;
                Ok(Some(LockedMessage {
                    body: body.to_vec(),
                    lock_url,
                }))
            }
            s => Err(subscribe_err(format!("unexpected status {s}"))),
        }
    }

    /// `DELETE` completes the message, `PUT` releases the lock.
    async fn settle(&self, lock_url: Url, complete: bool) -> TransportResult<()> {
        let method = if complete { Method::DELETE } else { Method::PUT };
        let response = self
            .request(method, lock_url)?
            .send()
            .await
            .map_err(|e| TransportError::Subscribe {
                topic: String::new(),
                reason: e.to_string(),
            })?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(TransportError::Subscribe {
                topic: String::new(),
                reason: format!("settle returned {}", response.status()),
            })
        }
    }
}

/// Service Bus-backed [`EventTransport`].
pub struct ServiceBusTransport {
    client: RestClient,
    group: String,
    declared: Mutex<HashSet<String>>,
    consumers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ServiceBusTransport {
    /// Parse `connection_string` and probe the namespace.
    ///
    /// Fails if the namespace does not answer within [`CONNECT_TIMEOUT`].
    #[instrument(skip(connection_string), fields(group = %group))]
    pub async fn connect(connection_string: &str, group: &str) -> TransportResult<Self> {
        let connection: ConnectionString = connection_string.parse()?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(RECEIVE_TIMEOUT_SECS + 30))
            .build()
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let client = RestClient { http, connection };

        let mut probe = client.url("$Resources/Topics")?;
        probe.query_pairs_mut().append_pair("api-version", API_VERSION);
        let response = tokio::time::timeout(CONNECT_TIMEOUT, client.request(Method::GET, probe)?.send())
            .await
            .map_err(|_| TransportError::ConnectTimeout {
                secs: CONNECT_TIMEOUT.as_secs(),
            })?
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        if !response.status().is_success() {
            return Err(TransportError::Connect(format!(
                "namespace probe returned {}",
                response.status()
            )));
        }

        info!(endpoint = %client.connection.endpoint, "connected to Service Bus namespace");
        Ok(Self {
            client,
            group: group.to_string(),
            declared: Mutex::new(HashSet::new()),
            consumers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    async fn declare_topic(&self, topic: &str) -> TransportResult<()> {
        let mut declared = self.declared.lock().await;
        if !declared.contains(topic) {
            self.client.ensure_entity(topic, TOPIC_BODY, topic).await?;
            declared.insert(topic.to_string());
        }
        Ok(())
    }

    fn check_open(&self) -> TransportResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

async fn process(
    client: RestClient,
    topic: String,
    message: LockedMessage,
    handler: Arc<dyn MessageHandler>,
) {
    let outcome = match decode_envelope(&message.body) {
        Ok(payload) => handler.handle(payload).await.map_err(|e| e.0),
        Err(e) => Err(e.to_string()),
    };
    if let Err(reason) = &outcome {
        warn!(topic = %topic, error = %reason, "handler rejected message");
    }
    let Some(lock_url) = message.lock_url else {
        warn!(topic = %topic, "received message without a lock location");
        return;
    };
    if let Err(e) = client.settle(lock_url, outcome.is_ok()).await {
        warn!(topic = %topic, error = %e, "failed to settle message");
    }
}

#[async_trait]
impl EventTransport for ServiceBusTransport {
    #[instrument(skip(self, payload))]
    async fn publish(&self, topic: &str, payload: &serde_json::Value) -> TransportResult<()> {
        self.check_open()?;
        self.declare_topic(topic).await?;
        self.client.send(topic, encode_envelope(payload)?).await
    }

    #[instrument(skip(self, handler))]
    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> TransportResult<()> {
        self.check_open()?;
        self.declare_topic(topic).await?;
        let subscription = subscription_name(topic, &self.group);
        self.client
            .ensure_entity(
                &format!("{topic}/subscriptions/{subscription}"),
                SUBSCRIPTION_BODY,
                topic,
            )
            .await?;

        let client = self.client.clone();
        let topic_name = topic.to_string();
        let sub_name = subscription.clone();
        let task = tokio::spawn(async move {
            let in_flight = Arc::new(Semaphore::new(MAX_IN_FLIGHT));
            loop {
                let Ok(permit) = Arc::clone(&in_flight).acquire_owned().await else {
                    break;
                };
                match client.receive(&topic_name, &sub_name).await {
                    Ok(Some(message)) => {
                        let client = client.clone();
                        let topic = topic_name.clone();
                        let handler = Arc::clone(&handler);
                        tokio::spawn(async move {
                            process(client, topic, message, handler).await;
                            drop(permit);
                        });
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(topic = %topic_name, error = %e, "receive failed");
                        drop(permit);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        self.consumers.lock().await.push(task);
        info!(topic = %topic, subscription = %subscription, "subscribed");
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        for task in self.consumers.lock().await.drain(..) {
            task.abort();
        }
        Ok(())
    }
}
