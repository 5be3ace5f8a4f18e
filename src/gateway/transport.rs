use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC error code geth uses for reverted calls.
const EXECUTION_REVERTED: i64 = 3;
const INVALID_PARAMS: i64 = -32602;
const METHOD_NOT_FOUND: i64 = -32601;

/// One logical connection able to answer chain JSON-RPC requests.
#[async_trait]
pub trait LedgerTransport: Send + Sync {
    /// Short name used in logs and metrics.
    fn label(&self) -> &str;

    async fn request(&self, method: &str, params: Value) -> Result<Value, TransportError>;
}

#[derive(Debug, Serialize)]
pub struct JsonRpcRequest<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    pub params: Value,
}

#[derive(Debug, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid RPC endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("ledger RPC JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("ledger RPC transport error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("ledger RPC transport error: HTTP status {0}")]
    HttpStatus(StatusCode),
    #[error("ledger RPC returned an empty response")]
    EmptyResponse,
    #[error("ledger RPC error [{code}]: {message}")]
    Rpc { code: i64, message: String },
    #[error("no ledger endpoint configured")]
    NoEndpoints,
    #[error("all {attempts} attempts across ledger endpoints failed; last error: {last}")]
    Exhausted {
        attempts: u32,
        last: Box<TransportError>,
    },
}

impl TransportError {
    /// Whether asking again (here or on another endpoint) can change the
    /// answer. Reverts and malformed requests fail the same way everywhere.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::InvalidEndpoint(_) | TransportError::NoEndpoints => false,
            TransportError::Rpc { code, .. } => {
                !matches!(*code, EXECUTION_REVERTED | INVALID_PARAMS | METHOD_NOT_FOUND)
            }
            TransportError::Exhausted { .. } => false,
            _ => true,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            TransportError::InvalidEndpoint(_) => "invalid_endpoint",
            TransportError::Json(_) => "json",
            TransportError::Http(_) => "http",
            TransportError::HttpStatus(_) => "http_status",
            TransportError::EmptyResponse => "empty",
            TransportError::Rpc { .. } => "rpc",
            TransportError::NoEndpoints => "no_endpoints",
            TransportError::Exhausted { .. } => "exhausted",
        }
    }
}

/// JSON-RPC over HTTP(S).
#[derive(Debug)]
pub struct HttpTransport {
    inner: Client,
    url: Url,
    label: String,
    next_id: AtomicU64,
}

impl HttpTransport {
    pub fn from_endpoint(endpoint: &str, timeout: Duration) -> Result<Self, TransportError> {
        let url = Url::parse(endpoint)
            .map_err(|err| TransportError::InvalidEndpoint(format!("{endpoint}: {err}")))?;
        Self::from_url(url, timeout)
    }

    pub fn from_url(url: Url, timeout: Duration) -> Result<Self, TransportError> {
        if !matches!(url.scheme(), "http" | "https") {
            return Err(TransportError::InvalidEndpoint(format!(
                "{url}: unsupported scheme `{}`",
                url.scheme()
            )));
        }
        let client = Client::builder().timeout(timeout).build()?;
        let label = url.host_str().unwrap_or("unknown").to_string();
        Ok(Self {
            inner: client,
            url,
            label,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl LedgerTransport for HttpTransport {
    fn label(&self) -> &str {
        &self.label
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, TransportError> {
        let payload = JsonRpcRequest {
            jsonrpc: JSONRPC_VERSION,
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };

        let response = self
            .inner
            .post(self.url.clone())
            .json(&payload)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(TransportError::HttpStatus(response.status()));
        }

        let response: JsonRpcResponse = response.json().await?;
        if let Some(error) = response.error {
            return Err(TransportError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        match response.result {
            Some(Value::Null) | None => Err(TransportError::EmptyResponse),
            Some(value) => Ok(value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_websocket_and_garbage_endpoints() {
        let timeout = Duration::from_secs(1);
        assert!(matches!(
            HttpTransport::from_endpoint("wss://example.org/ws", timeout),
            Err(TransportError::InvalidEndpoint(_))
        ));
        assert!(matches!(
            HttpTransport::from_endpoint("not a url", timeout),
            Err(TransportError::InvalidEndpoint(_))
        ));
        let transport =
            HttpTransport::from_endpoint("https://480.rpc.thirdweb.com", timeout).expect("http");
        assert_eq!(transport.label(), "480.rpc.thirdweb.com");
    }

    #[test]
    fn reverts_are_not_retried() {
        let revert = TransportError::Rpc {
            code: 3,
            message: "execution reverted".into(),
        };
        assert!(!revert.is_retryable());
        let limited = TransportError::Rpc {
            code: -32005,
            message: "rate limited".into(),
        };
        assert!(limited.is_retryable());
        assert!(TransportError::EmptyResponse.is_retryable());
        assert!(TransportError::HttpStatus(StatusCode::BAD_GATEWAY).is_retryable());
    }
}
