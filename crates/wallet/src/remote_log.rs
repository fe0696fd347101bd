//! Read access to public pool data
//!
//! Events and state-tree leaves come straight from the node with
//! `eth_getLogs`; the approved set (ASP) root comes from the ASP service and
//! its label list from an IPFS gateway, addressed by content id.

use std::collections::HashMap;
use std::str::FromStr;

use alloy_primitives::{Address, U256};
use alloy_sol_types::SolEvent;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tidepool_core::abi::LeafInserted;
use tokio::sync::Mutex;

use crate::events::{parse_log, pool_event_topics, EventError, EventPage, PoolEvent};
use crate::rpc::{JsonRpcClient, RpcError};

#[derive(Debug, Error)]
pub enum RemoteLogError {
    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Malformed response: {0}")]
    Decode(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<EventError> for RemoteLogError {
    fn from(err: EventError) -> Self {
        Self::Decode(err.to_string())
    }
}

impl RemoteLogError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Rpc(e) => e.is_retryable(),
            Self::Http(_) => true,
            Self::Decode(_) | Self::NotFound(_) => false,
        }
    }
}

/// Approved-set root published for a scope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AspRoot {
    pub root: U256,
    pub cid: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LeafPage {
    pub leaves: Vec<U256>,
    pub has_more: bool,
}

#[async_trait]
pub trait RemoteLog: Send + Sync {
    /// Events after `cursor`, at most `limit` cursor steps at a time.
    async fn fetch_events(
        &self,
        pool: Address,
        cursor: u64,
        limit: u64,
    ) -> Result<EventPage, RemoteLogError>;

    /// State-tree leaves in insertion order.
    async fn state_leaves(
        &self,
        pool: Address,
        page: u64,
        limit: u64,
    ) -> Result<LeafPage, RemoteLogError>;

    async fn asp_root(&self, scope: U256) -> Result<AspRoot, RemoteLogError>;

    async fn asp_labels(&self, cid: &str) -> Result<Vec<U256>, RemoteLogError>;
}

/// Every leaf of the pool's state tree.
pub async fn all_state_leaves(
    log: &dyn RemoteLog,
    pool: Address,
    page_size: u64,
) -> Result<Vec<U256>, RemoteLogError> {
    let mut leaves = Vec::new();
    let mut page = 0;
    loop {
        let batch = log.state_leaves(pool, page, page_size).await?;
        leaves.extend(batch.leaves);
        if !batch.has_more {
            return Ok(leaves);
        }
        page += 1;
    }
}

#[derive(Default)]
struct LeafCache {
    next_block: u64,
    leaves: Vec<U256>,
}

/// `RemoteLog` over a node, the ASP service and an IPFS gateway.
pub struct RpcRemoteLog {
    rpc: JsonRpcClient,
    http: reqwest::Client,
    asp_url: String,
    ipfs_gateway: String,
    /// Batch size for log queries
    pub batch_size: u64,
    deployment_blocks: HashMap<Address, u64>,
    leaves: Mutex<HashMap<Address, LeafCache>>,
}

impl RpcRemoteLog {
    pub fn new(
        rpc_url: impl Into<String>,
        asp_url: impl Into<String>,
        ipfs_gateway: impl Into<String>,
    ) -> Self {
        Self {
            rpc: JsonRpcClient::new(rpc_url),
            http: reqwest::Client::new(),
            asp_url: asp_url.into().trim_end_matches('/').to_string(),
            ipfs_gateway: ipfs_gateway.into().trim_end_matches('/').to_string(),
            batch_size: 10_000,
            deployment_blocks: HashMap::new(),
            leaves: Mutex::new(HashMap::new()),
        }
    }

    /// Skip blocks before the pool existed when rebuilding its tree.
    pub fn with_pool(mut self, pool: Address, deployment_block: u64) -> Self {
        self.deployment_blocks.insert(pool, deployment_block);
        self
    }

    async fn sync_leaves(&self, pool: Address) -> Result<Vec<U256>, RemoteLogError> {
        let mut caches = self.leaves.lock().await;
        let cache = caches.entry(pool).or_insert_with(|| LeafCache {
            next_block: self.deployment_blocks.get(&pool).copied().unwrap_or(0),
            leaves: Vec::new(),
        });

        let latest = self.rpc.block_number().await?;
        let mut inserted = Vec::new();
        let mut current = cache.next_block;

        while current <= latest {
            let end = current.saturating_add(self.batch_size.max(1) - 1).min(latest);
            tracing::debug!("Syncing leaves from blocks {} to {}", current, end);

            let logs = self
                .rpc
                .get_logs(pool, &[LeafInserted::SIGNATURE_HASH], current, end)
                .await?;
            for log in &logs {
                if let Some(PoolEvent::LeafInserted(leaf)) = parse_log(log)? {
                    inserted.push((leaf.index, leaf.leaf));
                }
            }
            current = end + 1;
        }

        append_leaves(&mut cache.leaves, inserted)?;
        cache.next_block = current;

        Ok(cache.leaves.clone())
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, RemoteLogError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| RemoteLogError::Http(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(RemoteLogError::NotFound(url.to_string()));
        }
        if !response.status().is_success() {
            return Err(RemoteLogError::Http(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| RemoteLogError::Decode(e.to_string()))
    }
}

#[derive(Deserialize)]
struct AspRootBody {
    root: String,
    cid: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LabelsBody {
    List(Vec<String>),
    Wrapped { labels: Vec<String> },
}

fn parse_uint(raw: &str) -> Result<U256, RemoteLogError> {
    U256::from_str(raw).map_err(|e| RemoteLogError::Decode(format!("{raw}: {e}")))
}

#[async_trait]
impl RemoteLog for RpcRemoteLog {
    async fn fetch_events(
        &self,
        pool: Address,
        cursor: u64,
        limit: u64,
    ) -> Result<EventPage, RemoteLogError> {
        let latest = self.rpc.block_number().await?;
        if cursor > latest {
            return Ok(EventPage {
                events: Vec::new(),
                next_cursor: cursor,
                has_more: false,
            });
        }

        let to_block = cursor.saturating_add(limit.max(1) - 1).min(latest);
        tracing::info!("Syncing blocks {} to {}", cursor, to_block);

        let logs = self
            .rpc
            .get_logs(pool, &pool_event_topics(), cursor, to_block)
            .await?;

        let mut events = Vec::with_capacity(logs.len());
        for log in &logs {
            if let Some(event) = parse_log(log)? {
                events.push(event);
            }
        }
        events.sort_by_key(|e| (e.meta().block_number, e.meta().log_index));

        Ok(EventPage {
            events,
            next_cursor: to_block + 1,
            has_more: to_block < latest,
        })
    }

    async fn state_leaves(
        &self,
        pool: Address,
        page: u64,
        limit: u64,
    ) -> Result<LeafPage, RemoteLogError> {
        let leaves = self.sync_leaves(pool).await?;
        let limit = limit.max(1) as usize;
        let start = (page as usize).saturating_mul(limit).min(leaves.len());
        let end = start.saturating_add(limit).min(leaves.len());

        Ok(LeafPage {
            leaves: leaves[start..end].to_vec(),
            has_more: end < leaves.len(),
        })
    }

    async fn asp_root(&self, scope: U256) -> Result<AspRoot, RemoteLogError> {
        let body: AspRootBody = self
            .get_json(&format!("{}/asp/{}", self.asp_url, scope))
            .await?;
        Ok(AspRoot {
            root: parse_uint(&body.root)?,
            cid: body.cid,
        })
    }

    async fn asp_labels(&self, cid: &str) -> Result<Vec<U256>, RemoteLogError> {
        let body: LabelsBody = self
            .get_json(&format!("{}/ipfs/{}", self.ipfs_gateway, cid))
            .await?;
        let raw = match body {
            LabelsBody::List(labels) | LabelsBody::Wrapped { labels } => labels,
        };
        raw.iter().map(|label| parse_uint(label)).collect()
    }
}

/// Append newly inserted leaves in index order. Leaves must continue the
/// tree without a gap; on error `leaves` is left untouched.
fn append_leaves(
    leaves: &mut Vec<U256>,
    mut inserted: Vec<(u64, U256)>,
) -> Result<(), RemoteLogError> {
    inserted.sort_by_key(|(index, _)| *index);
    for (offset, (index, _)) in inserted.iter().enumerate() {
        let expected = (leaves.len() + offset) as u64;
        if *index != expected {
            return Err(RemoteLogError::Decode(format!(
                "gap in state tree: expected leaf {expected}, got {index}"
            )));
        }
    }
    leaves.extend(inserted.into_iter().map(|(_, leaf)| leaf));
    Ok(())
}
