//! Network adapters behind the tracking traits

use std::time::Duration;

use alloy_primitives::B256;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::rpc::{parse_hex_u64, JsonRpcClient};
use crate::tracking::{IndexerHealth, IndexerStatus, ReceiptSource, TrackingError, TxReceipt};

const DEFAULT_RECEIPT_POLL: Duration = Duration::from_secs(2);

/// Polls `eth_getTransactionReceipt` until the transaction is mined.
pub struct RpcReceiptSource {
    rpc: JsonRpcClient,
    poll_interval: Duration,
}

impl RpcReceiptSource {
    pub fn new(rpc: JsonRpcClient) -> Self {
        Self {
            rpc,
            poll_interval: DEFAULT_RECEIPT_POLL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    async fn poll(&self, hash: B256) -> Result<TxReceipt, TrackingError> {
        loop {
            let receipt: Value = self
                .rpc
                .call("eth_getTransactionReceipt", json!([hash]))
                .await
                .map_err(|e| TrackingError::Receipt(e.to_string()))?;

            if !receipt.is_null() {
                return parse_receipt(&receipt);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

fn parse_receipt(receipt: &Value) -> Result<TxReceipt, TrackingError> {
    let field = |name: &str| {
        receipt
            .get(name)
            .and_then(Value::as_str)
            .ok_or_else(|| TrackingError::Receipt(format!("receipt missing {name}")))
    };
    let block_number =
        parse_hex_u64(field("blockNumber")?).map_err(|e| TrackingError::Receipt(e.to_string()))?;
    let status = parse_hex_u64(field("status")?).map_err(|e| TrackingError::Receipt(e.to_string()))?;

    Ok(TxReceipt {
        block_number,
        success: status == 1,
    })
}

#[async_trait]
impl ReceiptSource for RpcReceiptSource {
    async fn wait_for_receipt(&self, hash: B256, timeout: Duration) -> Result<TxReceipt, TrackingError> {
        tokio::time::timeout(timeout, self.poll(hash))
            .await
            .map_err(|_| TrackingError::ReceiptTimeout { hash, timeout })?
    }
}

/// `GET {indexer}/status`
pub struct HttpIndexerStatus {
    base_url: String,
    http: reqwest::Client,
}

impl HttpIndexerStatus {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusBody {
    latest_indexed_block: u64,
    #[serde(default = "default_healthy")]
    healthy: bool,
}

fn default_healthy() -> bool {
    true
}

#[async_trait]
impl IndexerStatus for HttpIndexerStatus {
    async fn status(&self) -> Result<IndexerHealth, TrackingError> {
        let url = format!("{}/status", self.base_url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| TrackingError::Indexer(e.to_string()))?;

        if !response.status().is_success() {
            return Err(TrackingError::Indexer(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }

        let body: StatusBody = response
            .json()
            .await
            .map_err(|e| TrackingError::Indexer(e.to_string()))?;
        Ok(IndexerHealth {
            latest_indexed_block: body.latest_indexed_block,
            healthy: body.healthy,
        })
    }
}
