//! Store adapter speaking the etcd v2 HTTP API.
//!
//! Reads hit `GET /v2/keys<path>`, directory creation uses
//! `PUT ...?dir=true&prevExist=false`, and watches are long-polling
//! `GET ...?wait=true&waitIndex=N` requests. Every successful response
//! carries the store's current change index in the `X-Etcd-Index` header,
//! which seeds the sync engine's watch cursor.
use std::time::Duration;

use async_trait::async_trait;
use eyre::{Context, Result};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use url::Url;

use crate::ports::store::{
    ConfigStore, Snapshot, StoreError, StoreNode, WatchAction, WatchEvent,
};

const KEYS_PREFIX: &str = "/v2/keys";
const INDEX_HEADER: &str = "x-etcd-index";

// etcd v2 wire error codes.
const CODE_KEY_NOT_FOUND: u32 = 100;
const CODE_NODE_EXISTS: u32 = 105;
const CODE_INDEX_CLEARED: u32 = 401;

/// etcd v2 client. Cloning is cheap; the underlying connection pool is
/// shared.
#[derive(Clone)]
pub struct EtcdClient {
    base: Url,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct KeysResponse {
    action: String,
    node: StoreNode,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    error_code: u32,
    #[serde(default)]
    message: String,
    #[serde(default)]
    cause: String,
}

impl EtcdClient {
    /// Create a client against a store endpoint such as
    /// `http://127.0.0.1:4001`.
    pub fn new(endpoint: &str) -> Result<Self> {
        let base = Url::parse(endpoint)
            .with_context(|| format!("invalid store endpoint: {endpoint}"))?;
        // No global request timeout: watches long-poll and the sync engine
        // bounds them with its own idle timer.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .context("failed to build store HTTP client")?;
        Ok(Self { base, client })
    }

    fn keys_url(&self, path: &str) -> Result<Url, StoreError> {
        self.base
            .join(&format!("{KEYS_PREFIX}{path}"))
            .map_err(|e| StoreError::Protocol(format!("bad key path {path}: {e}")))
    }

    /// Read the change index header; 0 when absent (fake stores in tests).
    fn index_of(response: &Response) -> u64 {
        response
            .headers()
            .get(INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    fn classify_error(status: StatusCode, body: &[u8]) -> StoreError {
        match serde_json::from_slice::<ErrorBody>(body) {
            Ok(err) => match err.error_code {
                CODE_KEY_NOT_FOUND => StoreError::KeyNotFound(err.cause),
                CODE_NODE_EXISTS => StoreError::AlreadyExists(err.cause),
                CODE_INDEX_CLEARED => StoreError::IndexCleared,
                code => StoreError::Protocol(format!(
                    "store error {code} ({status}): {}",
                    err.message
                )),
            },
            Err(_) => StoreError::Protocol(format!("unparseable {status} error response")),
        }
    }

    fn parse_action(action: &str) -> Result<WatchAction, StoreError> {
        match action {
            "create" => Ok(WatchAction::Create),
            "set" => Ok(WatchAction::Set),
            "update" | "compareAndSwap" => Ok(WatchAction::Update),
            "delete" | "compareAndDelete" => Ok(WatchAction::Delete),
            "expire" => Ok(WatchAction::Expire),
            other => Err(StoreError::Protocol(format!(
                "unknown watch action: {other}"
            ))),
        }
    }

    async fn read_keys_response(response: Response) -> Result<(KeysResponse, u64), StoreError> {
        let index = Self::index_of(&response);
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        if !status.is_success() {
            return Err(Self::classify_error(status, &body));
        }
        let parsed: KeysResponse = serde_json::from_slice(&body)
            .map_err(|e| StoreError::Protocol(format!("bad store body: {e}")))?;
        Ok((parsed, index))
    }
}

#[async_trait]
impl ConfigStore for EtcdClient {
    async fn get(&self, path: &str, recursive: bool) -> Result<Snapshot, StoreError> {
        let mut url = self.keys_url(path)?;
        if recursive {
            url.query_pairs_mut().append_pair("recursive", "true");
        }

        let response = self
            .client
            .get(url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let (parsed, index) = Self::read_keys_response(response).await?;
        Ok(Snapshot {
            node: parsed.node,
            index,
        })
    }

    async fn mkdir(&self, path: &str) -> Result<(), StoreError> {
        let mut url = self.keys_url(path)?;
        url.query_pairs_mut()
            .append_pair("dir", "true")
            .append_pair("prevExist", "false");

        let response = self
            .client
            .put(url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Err(Self::classify_error(status, &body))
    }

    async fn watch(
        &self,
        path: &str,
        after_index: u64,
        recursive: bool,
    ) -> Result<WatchEvent, StoreError> {
        let mut url = self.keys_url(path)?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("wait", "true");
            pairs.append_pair("waitIndex", &after_index.to_string());
            if recursive {
                pairs.append_pair("recursive", "true");
            }
        }

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let (parsed, header_index) = Self::read_keys_response(response).await?;
        let action = Self::parse_action(&parsed.action)?;
        let index = if parsed.node.modified_index > 0 {
            parsed.node.modified_index
        } else {
            header_index
        };
        Ok(WatchEvent {
            action,
            key: parsed.node.key,
            value: parsed.node.value,
            dir: parsed.node.dir,
            index,
        })
    }
}
