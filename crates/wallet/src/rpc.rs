//! Minimal JSON-RPC client
//!
//! Shared by the node, the ERC-4337 bundler and the paymaster. All three
//! speak plain JSON-RPC 2.0 over HTTP POST.

use std::sync::atomic::{AtomicU64, Ordering};

use alloy_primitives::{Address, Bytes, B256};
use alloy_rpc_types::Log;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("No result in response")]
    MissingResult,

    #[error("Parse error: {0}")]
    ParseFailed(String),
}

impl RpcError {
    /// Transport failures and server-side hiccups are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::MissingResult => true,
            Self::Rpc { code, .. } => matches!(code, -32603 | -32005 | 429),
            Self::ParseFailed(_) => false,
        }
    }

    /// Server message, without the transport wrapping.
    pub fn message(&self) -> String {
        match self {
            Self::Rpc { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

pub struct JsonRpcClient {
    url: String,
    http: reqwest::Client,
    next_id: AtomicU64,
}

impl JsonRpcClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_client(url, reqwest::Client::new())
    }

    pub fn with_client(url: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            url: url.into(),
            http,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, RpcError> {
        let request = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
        });

        let response = self
            .http
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        let json: Value = response
            .json()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        if let Some(error) = json.get("error") {
            return Err(rpc_error(error));
        }

        let result = json.get("result").ok_or(RpcError::MissingResult)?;

        serde_json::from_value(result.clone()).map_err(|e| RpcError::ParseFailed(e.to_string()))
    }

    /// Get current block number via eth_blockNumber
    pub async fn block_number(&self) -> Result<u64, RpcError> {
        let result: String = self.call("eth_blockNumber", serde_json::json!([])).await?;
        parse_hex_u64(&result)
    }

    /// Logs of `contract` whose first topic is any of `topics`.
    pub async fn get_logs(
        &self,
        contract: Address,
        topics: &[B256],
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<Log>, RpcError> {
        let filter = serde_json::json!({
            "address": format!("{:?}", contract),
            "topics": [topics.iter().map(|t| format!("{:?}", t)).collect::<Vec<_>>()],
            "fromBlock": format!("0x{:x}", from_block),
            "toBlock": format!("0x{:x}", to_block),
        });

        self.call("eth_getLogs", serde_json::json!([filter])).await
    }

    pub async fn eth_call(&self, to: Address, data: Bytes) -> Result<Bytes, RpcError> {
        let call = serde_json::json!({
            "to": format!("{:?}", to),
            "data": data,
        });
        self.call("eth_call", serde_json::json!([call, "latest"])).await
    }
}

fn rpc_error(error: &Value) -> RpcError {
    let code = error.get("code").and_then(Value::as_i64).unwrap_or_default();
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| error.to_string());
    RpcError::Rpc { code, message }
}

/// Parse a hex quantity (e.g., "0x1234abc")
pub fn parse_hex_u64(value: &str) -> Result<u64, RpcError> {
    u64::from_str_radix(value.trim_start_matches("0x"), 16)
        .map_err(|e| RpcError::ParseFailed(format!("Invalid quantity {value}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_u64() {
        assert_eq!(parse_hex_u64("0x10").unwrap(), 16);
        assert_eq!(parse_hex_u64("0x0").unwrap(), 0);
        assert!(parse_hex_u64("0xzz").is_err());
    }

    #[test]
    fn test_rpc_error_keeps_server_message() {
        let err = rpc_error(&serde_json::json!({"code": -32000, "message": "execution reverted"}));
        assert!(matches!(err, RpcError::Rpc { code: -32000, .. }));
        assert_eq!(err.message(), "execution reverted");
        assert!(!err.is_retryable());
    }
}
