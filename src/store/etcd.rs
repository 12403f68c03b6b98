//! etcd v2 keys API client.
//!
//! # Responsibilities
//! - Read the service tree (`GET /v2/keys<root>?recursive=true`)
//! - Long-poll watches (`wait=true&waitIndex=N`) exposed as a stream
//! - Conditional writes (`prevExist`, `prevIndex`) for self-registration
//! - Fail over across configured endpoints on transport errors
//!
//! # Design Decisions
//! - Non-watch requests carry the configured request timeout; watches do not,
//!   they park until the next change
//! - The store index comes from the `X-Etcd-Index` header so a watch can
//!   resume exactly after a bulk read

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;

use crate::config::StoreConfig;
use crate::store::{
    Action, CoordinationStore, Node, SetCondition, StoreError, StoreResponse, StoreResult,
    WatchEvent, WatchStream,
};

const INDEX_HEADER: &str = "x-etcd-index";

// etcd v2 error codes
const KEY_NOT_FOUND: u32 = 100;
const TEST_FAILED: u32 = 101;
const NODE_EXIST: u32 = 105;
const EVENT_INDEX_CLEARED: u32 = 401;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EtcdNode {
    #[serde(default)]
    key: String,
    value: Option<String>,
    #[serde(default)]
    dir: bool,
    #[serde(default)]
    nodes: Vec<EtcdNode>,
    #[serde(default)]
    modified_index: u64,
}

impl From<EtcdNode> for Node {
    fn from(node: EtcdNode) -> Self {
        Node {
            key: node.key,
            value: node.value,
            dir: node.dir,
            modified_index: node.modified_index,
            nodes: node.nodes.into_iter().map(Node::from).collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct EtcdResponse {
    action: String,
    node: Option<EtcdNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EtcdErrorBody {
    error_code: u32,
    message: String,
    #[serde(default)]
    cause: Option<String>,
    #[serde(default)]
    index: u64,
}

fn map_error(key: &str, body: EtcdErrorBody) -> StoreError {
    match body.error_code {
        KEY_NOT_FOUND => StoreError::NotFound {
            key: key.into(),
            index: body.index,
        },
        TEST_FAILED | NODE_EXIST => StoreError::Conflict { key: key.into() },
        EVENT_INDEX_CLEARED => StoreError::Compacted { index: body.index },
        // 3xx: raft / leader problems on the server side
        300..=399 => StoreError::Unavailable(body.message),
        code => StoreError::Protocol(format!(
            "etcd error {code}: {}{}",
            body.message,
            body.cause.map(|c| format!(" ({c})")).unwrap_or_default()
        )),
    }
}

/// Decode an etcd answer. `Ok(None)` is an empty successful body, which a
/// long-poll returns when the server times the wait out.
fn decode(
    key: &str,
    status: StatusCode,
    header_index: Option<u64>,
    body: &[u8],
) -> StoreResult<Option<(u64, EtcdResponse)>> {
    if status.is_success() {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        let response: EtcdResponse = serde_json::from_slice(body)
            .map_err(|e| StoreError::Protocol(format!("invalid etcd response: {e}")))?;
        let index = header_index
            .or_else(|| response.node.as_ref().map(|n| n.modified_index))
            .unwrap_or_default();
        return Ok(Some((index, response)));
    }

    match serde_json::from_slice::<EtcdErrorBody>(body) {
        Ok(error) => Err(map_error(key, error)),
        Err(_) if status.is_server_error() => {
            Err(StoreError::Unavailable(format!("etcd answered HTTP {status}")))
        }
        Err(_) => Err(StoreError::Protocol(format!("etcd answered HTTP {status}"))),
    }
}

fn into_event(response: EtcdResponse) -> StoreResult<WatchEvent> {
    let node = response
        .node
        .ok_or_else(|| StoreError::Protocol("watch response without node".into()))?;
    Ok(WatchEvent {
        action: Action::parse(&response.action),
        key: node.key,
        value: node.value,
        dir: node.dir,
        index: node.modified_index,
    })
}

/// Coordination store backed by an etcd cluster speaking the v2 keys API.
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
    endpoints: Arc<[String]>,
    request_timeout: Duration,
}

impl EtcdStore {
    /// Create a client for the configured endpoints. No request is made yet.
    pub fn new(config: &StoreConfig) -> StoreResult<Self> {
        if config.endpoints.is_empty() {
            return Err(StoreError::Unavailable("no store endpoints configured".into()));
        }
        let client = Client::builder()
            .connect_timeout(config.request_timeout())
            .build()
            .map_err(|e| StoreError::Unavailable(format!("failed to build HTTP client: {e}")))?;

        let endpoints: Vec<String> = config
            .endpoints
            .iter()
            .map(|e| e.trim_end_matches('/').to_string())
            .collect();

        tracing::info!(endpoints = ?endpoints, "etcd client initialized");

        Ok(Self {
            client,
            endpoints: endpoints.into(),
            request_timeout: config.request_timeout(),
        })
    }

    fn keys_url(endpoint: &str, key: &str) -> String {
        format!("{endpoint}/v2/keys{key}")
    }

    /// Send a request to the first endpoint that answers.
    async fn execute<F>(&self, key: &str, build: F) -> StoreResult<Option<(u64, EtcdResponse)>>
    where
        F: Fn(&Client, String) -> RequestBuilder,
    {
        let mut last_error = String::from("no endpoint tried");
        for (i, endpoint) in self.endpoints.iter().enumerate() {
            let request = build(&self.client, Self::keys_url(endpoint, key));
            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    let index = response
                        .headers()
                        .get(INDEX_HEADER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse().ok());
                    let body = response
                        .bytes()
                        .await
                        .map_err(|e| StoreError::Unavailable(e.to_string()))?;
                    return decode(key, status, index, &body);
                }
                Err(e) => {
                    tracing::warn!(endpoint_idx = i, endpoint = %endpoint, error = %e, "Store request failed, trying next endpoint");
                    last_error = e.to_string();
                }
            }
        }
        Err(StoreError::Unavailable(last_error))
    }

    fn require(key: &str, answer: Option<(u64, EtcdResponse)>) -> StoreResult<(u64, EtcdResponse)> {
        answer.ok_or_else(|| StoreError::Protocol(format!("empty etcd response for {key}")))
    }

    /// Block until the next change at or after `from_index`.
    async fn poll_once(
        &self,
        path: &str,
        recursive: bool,
        from_index: Option<u64>,
    ) -> StoreResult<WatchEvent> {
        loop {
            let answer = self
                .execute(path, |client, url| {
                    let mut query = vec![
                        ("wait", "true".to_string()),
                        ("recursive", recursive.to_string()),
                    ];
                    if let Some(index) = from_index {
                        query.push(("waitIndex", index.to_string()));
                    }
                    client.get(url).query(&query)
                })
                .await?;

            match answer {
                Some((_, response)) => return into_event(response),
                None => tracing::trace!(path = %path, "Watch poll timed out, polling again"),
            }
        }
    }
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn get(&self, path: &str, recursive: bool) -> StoreResult<StoreResponse> {
        let timeout = self.request_timeout;
        let answer = self
            .execute(path, |client, url| {
                client
                    .get(url)
                    .query(&[("recursive", recursive.to_string()), ("sorted", "true".into())])
                    .timeout(timeout)
            })
            .await?;
        let (index, response) = Self::require(path, answer)?;
        let node = response
            .node
            .ok_or_else(|| StoreError::Protocol(format!("get {path} returned no node")))?;
        Ok(StoreResponse {
            index,
            node: node.into(),
        })
    }

    fn watch(&self, path: &str, recursive: bool, from_index: Option<u64>) -> WatchStream {
        let store = self.clone();
        let path = path.to_string();
        // Outer `None` marks a finished stream.
        stream::unfold(Some(from_index), move |cursor| {
            let store = store.clone();
            let path = path.clone();
            async move {
                let from = cursor?;
                match store.poll_once(&path, recursive, from).await {
                    Ok(event) => {
                        let next = Some(event.index + 1);
                        Some((Ok(event), Some(next)))
                    }
                    Err(e) => Some((Err(e), None)),
                }
            }
        })
        .boxed()
    }

    async fn set(&self, key: &str, value: &str, condition: SetCondition) -> StoreResult<u64> {
        let timeout = self.request_timeout;
        let answer = self
            .execute(key, |client, url| {
                let mut form = vec![("value", value.to_string())];
                match condition {
                    SetCondition::Any => {}
                    SetCondition::Absent => form.push(("prevExist", "false".into())),
                    SetCondition::Version(index) => form.push(("prevIndex", index.to_string())),
                }
                client.put(url).form(&form).timeout(timeout)
            })
            .await?;
        let (index, response) = Self::require(key, answer)?;
        Ok(response.node.map_or(index, |n| n.modified_index))
    }

    async fn delete(&self, key: &str) -> StoreResult<u64> {
        let timeout = self.request_timeout;
        let answer = self
            .execute(key, |client, url| {
                client
                    .delete(url)
                    .query(&[("recursive", "true")])
                    .timeout(timeout)
            })
            .await?;
        let (index, response) = Self::require(key, answer)?;
        Ok(response.node.map_or(index, |n| n.modified_index))
    }
}
