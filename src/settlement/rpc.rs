//! JSON-RPC 2.0 over HTTP, shared by the chain node and the remote signer.

use super::{classify_reqwest, SettlementError};
use backoff::future::retry;
use backoff::ExponentialBackoff;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct RpcClient {
    client: Client,
    url: String,
    retry_budget: Duration,
    next_id: Arc<AtomicU64>,
}

impl RpcClient {
    pub fn new(url: String, request_timeout: Duration, retry_budget: Duration) -> Self {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            url,
            retry_budget,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Call `method`, retrying transport failures, 429 and 5xx.
    ///
    /// A JSON-RPC `error` object is permanent and returned as
    /// [`SettlementError::RpcError`].
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T, SettlementError> {
        let backoff = ExponentialBackoff {
            max_elapsed_time: Some(self.retry_budget),
            ..Default::default()
        };
        let payload = serde_json::json!({
            "jsonrpc": "2.0",
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
            "method": method,
            "params": params,
        });
        debug!(method, "JSON-RPC call");

        let body = retry(backoff, || async {
            let response = self
                .client
                .post(&self.url)
                .json(&payload)
                .send()
                .await
                .map_err(|e| backoff::Error::transient(classify_reqwest(e)))?;

            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS {
                return Err(backoff::Error::transient(SettlementError::RateLimited));
            }
            if status.is_server_error() {
                return Err(backoff::Error::transient(SettlementError::HttpError {
                    status: status.as_u16(),
                    message: "Server error".to_string(),
                }));
            }
            if !status.is_success() {
                return Err(backoff::Error::permanent(SettlementError::HttpError {
                    status: status.as_u16(),
                    message: "Client error".to_string(),
                }));
            }

            response
                .json::<serde_json::Value>()
                .await
                .map_err(|e| backoff::Error::permanent(classify_reqwest(e)))
        })
        .await?;

        if let Some(error) = body.get("error").filter(|e| !e.is_null()) {
            return Err(SettlementError::RpcError {
                code: error.get("code").and_then(|c| c.as_i64()).unwrap_or(0),
                message: error
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("unknown error")
                    .to_string(),
            });
        }

        let result = body.get("result").cloned().unwrap_or(serde_json::Value::Null);
        serde_json::from_value(result)
            .map_err(|e| SettlementError::ParseError(format!("{} result: {}", method, e)))
    }
}
