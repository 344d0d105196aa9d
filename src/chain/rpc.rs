//! HTTP transport shared by the chain clients: plain JSON GET/POST with
//! status mapping, and JSON-RPC 2.0 calls on top.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use super::ChainError;

/// JSON-RPC error codes that mean "slow down"
const LIMIT_EXCEEDED: i64 = -32005;
const INTERNAL_ERROR: i64 = -32603;

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Clone)]
pub struct RpcClient {
    client: Client,
    base_url: String,
    headers: Vec<(String, String)>,
    next_id: Arc<AtomicU64>,
}

impl RpcClient {
    pub fn new(base_url: &str) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            headers: Vec::new(),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Add a header sent with every request (API keys)
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        if path.is_empty() {
            self.base_url.clone()
        } else {
            format!("{}/{}", self.base_url, path.trim_start_matches('/'))
        }
    }

    fn decorate(&self, mut req: RequestBuilder) -> RequestBuilder {
        for (name, value) in &self.headers {
            req = req.header(name.as_str(), value.as_str());
        }
        req
    }

    /// GET returning `None` on 404
    pub async fn get_json(&self, path: &str) -> Result<Option<Value>, ChainError> {
        let resp = self.decorate(self.client.get(self.url(path))).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = check_status(resp).await?;
        Ok(Some(resp.json().await?))
    }

    pub async fn post_json(&self, path: &str, body: &Value) -> Result<Value, ChainError> {
        let resp = self
            .decorate(self.client.post(self.url(path)))
            .json(body)
            .send()
            .await?;
        let resp = check_status(resp).await?;
        Ok(resp.json().await?)
    }

    /// JSON-RPC 2.0 call against the base URL
    pub async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, ChainError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        let raw = self.post_json("", &body).await?;
        let resp: RpcResponse =
            serde_json::from_value(raw).map_err(|e| ChainError::Parse(format!("{}: {}", method, e)))?;

        if let Some(err) = resp.error {
            return Err(match err.code {
                LIMIT_EXCEEDED => ChainError::RateLimited,
                INTERNAL_ERROR => ChainError::Server {
                    status: 200,
                    body: err.message,
                },
                _ => ChainError::Rejected(format!("{} ({}): {}", method, err.code, err.message)),
            });
        }

        serde_json::from_value(resp.result.unwrap_or(Value::Null))
            .map_err(|e| ChainError::Parse(format!("{}: {}", method, e)))
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, ChainError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::TOO_MANY_REQUESTS => ChainError::RateLimited,
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ChainError::Timeout,
        s if s.is_server_error() => ChainError::Server {
            status: s.as_u16(),
            body,
        },
        _ => ChainError::Rejected(format!("{}: {}", status.as_u16(), body)),
    })
}

/// `0x`-prefixed hex quantity as u128
pub fn parse_quantity(value: &str) -> Result<u128, ChainError> {
    crate::types::parse_base_units(value)
        .ok_or_else(|| ChainError::Parse(format!("invalid quantity {:?}", value)))
}

/// Left-pad a hex string to a 32-byte ABI word
pub fn abi_word(hex_value: &str) -> String {
    format!("{:0>64}", hex_value.trim_start_matches("0x").to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_join() {
        let rpc = RpcClient::new("https://api.example.com/v2/");
        assert_eq!(rpc.url(""), "https://api.example.com/v2");
        assert_eq!(rpc.url("/wallet/getnowblock"), "https://api.example.com/v2/wallet/getnowblock");
    }

    #[test]
    fn test_parse_quantity_and_abi_word() {
        assert_eq!(parse_quantity("0x32").unwrap(), 50);
        assert!(parse_quantity("0xzz").is_err());
        assert_eq!(abi_word("0xABC").len(), 64);
        assert!(abi_word("0xabc").ends_with("0abc"));
    }

    #[tokio::test]
    async fn test_unreachable_node_is_transient() {
        let rpc = RpcClient::new("http://127.0.0.1:1");
        let err = rpc.call::<String>("eth_blockNumber", json!([])).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
