//! Minimal etcd client over the v3 JSON gateway.
//!
//! Covers what tests typically need against a throwaway instance: put, get
//! and delete of single keys. Keys and values travel base64-encoded, as the
//! gateway requires.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;

use crate::probe::{ProbeError, ReadinessProbe};

/// Key read by the readiness probe: the root of the keyspace.
pub const PROBE_KEY: &str = "/";

/// Errors returned by [`EtcdClient`].
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid endpoint {0:?}: expected an http:// URL")]
    InvalidEndpoint(String),

    #[error("failed building HTTP client")]
    Build(#[source] reqwest::Error),

    #[error("request to {url} failed")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned {status}: {body}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("malformed response from {url}: {message}")]
    Decode { url: String, message: String },
}

#[derive(Debug, Default, Deserialize)]
struct RangeResponse {
    #[serde(default)]
    kvs: Vec<KeyValue>,
}

#[derive(Debug, Deserialize)]
struct KeyValue {
    // The gateway omits empty values.
    #[serde(default)]
    value: String,
}

#[derive(Debug, Default, Deserialize)]
struct DeleteRangeResponse {
    // int64 fields are rendered as JSON strings by the gateway.
    #[serde(default)]
    deleted: Option<Value>,
}

/// Handle to one etcd instance. Cheap to clone; clones share a connection
/// pool.
#[derive(Debug, Clone)]
pub struct EtcdClient {
    http: reqwest::Client,
    endpoint: String,
}

impl EtcdClient {
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

    /// Client for `endpoint` (e.g. `http://127.0.0.1:2379`).
    pub fn new(endpoint: &str) -> Result<Self, ClientError> {
        Self::with_request_timeout(endpoint, Self::DEFAULT_REQUEST_TIMEOUT)
    }

    /// Plain HTTP only: the instance listens on loopback without TLS, and
    /// system proxy settings are ignored.
    pub fn with_request_timeout(endpoint: &str, timeout: Duration) -> Result<Self, ClientError> {
        if !endpoint.starts_with("http://") {
            return Err(ClientError::InvalidEndpoint(endpoint.to_owned()));
        }
        let http = reqwest::Client::builder()
            .no_proxy()
            .timeout(timeout)
            .build()
            .map_err(ClientError::Build)?;
        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_owned(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Set `key` to `value`.
    pub async fn put(&self, key: &str, value: &str) -> Result<(), ClientError> {
        self.call("kv/put", json!({ "key": B64.encode(key), "value": B64.encode(value) }))
            .await?;
        Ok(())
    }

    /// Value stored at `key`, or `None` if the key does not exist.
    pub async fn get(&self, key: &str) -> Result<Option<String>, ClientError> {
        let url = self.url("kv/range");
        let body = self.call("kv/range", json!({ "key": B64.encode(key) })).await?;
        decode_range(body).map_err(|message| ClientError::Decode { url, message })
    }

    /// Delete `key`, returning how many keys were removed (0 or 1).
    pub async fn delete(&self, key: &str) -> Result<u64, ClientError> {
        let url = self.url("kv/deleterange");
        let body = self
            .call("kv/deleterange", json!({ "key": B64.encode(key) }))
            .await?;
        decode_deleted(body).map_err(|message| ClientError::Decode { url, message })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v3/{path}", self.endpoint)
    }

    async fn call(&self, path: &str, request: Value) -> Result<Value, ClientError> {
        let url = self.url(path);
        let response = self
            .http
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|source| ClientError::Request {
                url: url.clone(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Status { url, status, body });
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| ClientError::Decode {
                url,
                message: e.to_string(),
            })
    }
}

#[async_trait]
impl ReadinessProbe for EtcdClient {
    async fn probe(&self) -> Result<(), ProbeError> {
        self.get(PROBE_KEY).await?;
        Ok(())
    }
}

fn decode_range(body: Value) -> Result<Option<String>, String> {
    let range: RangeResponse = serde_json::from_value(body).map_err(|e| e.to_string())?;
    let Some(kv) = range.kvs.into_iter().next() else {
        return Ok(None);
    };
    let bytes = B64
        .decode(kv.value.as_bytes())
        .map_err(|e| format!("value is not base64: {e}"))?;
    String::from_utf8(bytes)
        .map(Some)
        .map_err(|e| format!("value is not UTF-8: {e}"))
}

fn decode_deleted(body: Value) -> Result<u64, String> {
    let resp: DeleteRangeResponse = serde_json::from_value(body).map_err(|e| e.to_string())?;
    match resp.deleted {
        None => Ok(0),
        Some(Value::Number(n)) => n.as_u64().ok_or_else(|| format!("bad deleted count {n}")),
        Some(Value::String(s)) => s.parse().map_err(|_| format!("bad deleted count {s:?}")),
        Some(other) => Err(format!("bad deleted count {other}")),
    }
}
