use async_trait::async_trait;
use serde_json::{Value, json};
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("upstream returned status {0}")]
    Status(reqwest::StatusCode),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("malformed RPC response: {0}")]
    MalformedResponse(String),
}

/// Wire-level access to one upstream JSON-RPC endpoint.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn send(&self, method: &str, params: Value) -> Result<Value, TransportError>;
}

/// JSON-RPC 2.0 over HTTP POST.
pub struct HttpRpcTransport {
    client: reqwest::Client,
    url: Url,
}

impl HttpRpcTransport {
    /// The timeout bounds the caller's hot path: a stuck upstream surfaces
    /// as a failed call, which the health ledger turns into a penalty.
    pub fn new(url: Url, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl RpcTransport for HttpRpcTransport {
    async fn send(&self, method: &str, params: Value) -> Result<Value, TransportError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let response = self.client.post(self.url.clone()).json(&body).send().await?;
        if !response.status().is_success() {
            return Err(TransportError::Status(response.status()));
        }

        let payload: Value = response.json().await?;
        if let Some(error) = payload.get("error") {
            return Err(TransportError::Rpc {
                code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string(),
            });
        }

        payload
            .get("result")
            .cloned()
            .ok_or_else(|| TransportError::MalformedResponse("missing result field".to_string()))
    }
}
