//! Post-submission tracking
//!
//! ```text
//! idle ─> pending ──receipt ok──> waiting ──indexer caught up──> synced ─┐
//!            │                       │                                   │
//!            └──reverted/timeout─────┴──────────> failed ────────────────┴─> idle
//! ```
//!
//! One transaction is tracked at a time. Every `track_transaction` starts a
//! new generation; timers and polls of older generations find their
//! generation stale and stop without touching state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy_primitives::B256;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use crate::discovery::DiscoveryError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TrackingError {
    #[error("No receipt for {hash} within {timeout:?}")]
    ReceiptTimeout { hash: B256, timeout: Duration },

    #[error("Receipt source error: {0}")]
    Receipt(String),

    #[error("Indexer error: {0}")]
    Indexer(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackingStatus {
    Idle,
    Pending,
    Waiting,
    Synced,
    Failed,
}

impl TrackingStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Synced | Self::Failed)
    }

    fn can_advance_to(self, next: TrackingStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Waiting)
                | (Self::Pending, Self::Failed)
                | (Self::Waiting, Self::Synced)
                | (Self::Waiting, Self::Failed)
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedTransaction {
    pub hash: B256,
    pub chain_id: u64,
    pub block_number: Option<u64>,
    pub status: TrackingStatus,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TxReceipt {
    pub block_number: u64,
    pub success: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexerHealth {
    pub latest_indexed_block: u64,
    pub healthy: bool,
}

#[async_trait]
pub trait ReceiptSource: Send + Sync {
    /// Resolve once the transaction is mined, or fail after `timeout`.
    async fn wait_for_receipt(&self, hash: B256, timeout: Duration) -> Result<TxReceipt, TrackingError>;
}

#[async_trait]
pub trait IndexerStatus: Send + Sync {
    async fn status(&self) -> Result<IndexerHealth, TrackingError>;
}

/// Re-run note discovery after a tracked transaction lands.
#[async_trait]
pub trait LedgerRefresh: Send + Sync {
    async fn refresh(&self) -> Result<(), DiscoveryError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrackingTimeouts {
    pub receipt: Duration,
    pub poll_interval: Duration,
    /// Give up on a transaction stuck in pending or waiting.
    pub pending_timeout: Duration,
    pub terminal_clear_delay: Duration,
}

impl Default for TrackingTimeouts {
    fn default() -> Self {
        Self {
            receipt: Duration::from_secs(60),
            poll_interval: Duration::from_secs(5),
            pending_timeout: Duration::from_secs(300),
            terminal_clear_delay: Duration::from_secs(8),
        }
    }
}

struct Inner {
    receipts: Arc<dyn ReceiptSource>,
    indexer: Arc<dyn IndexerStatus>,
    ledger: Arc<dyn LedgerRefresh>,
    timeouts: TrackingTimeouts,
    generation: AtomicU64,
    token: Mutex<CancellationToken>,
    state: watch::Sender<Option<TrackedTransaction>>,
    synced: broadcast::Sender<TrackedTransaction>,
}

#[derive(Clone)]
pub struct TransactionTracker {
    inner: Arc<Inner>,
}

impl TransactionTracker {
    pub fn new(
        receipts: Arc<dyn ReceiptSource>,
        indexer: Arc<dyn IndexerStatus>,
        ledger: Arc<dyn LedgerRefresh>,
        timeouts: TrackingTimeouts,
    ) -> Self {
        let (state, _) = watch::channel(None);
        let (synced, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(Inner {
                receipts,
                indexer,
                ledger,
                timeouts,
                generation: AtomicU64::new(0),
                token: Mutex::new(CancellationToken::new()),
                state,
                synced,
            }),
        }
    }

    /// Start tracking `hash`, abandoning whatever was tracked before.
    pub fn track_transaction(&self, hash: B256, chain_id: u64) {
        let token = CancellationToken::new();
        let generation = {
            let mut current = self
                .inner
                .token
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            current.cancel();
            *current = token.clone();
            self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1
        };

        self.inner.state.send_replace(Some(TrackedTransaction {
            hash,
            chain_id,
            block_number: None,
            status: TrackingStatus::Pending,
        }));
        tracing::info!(%hash, chain_id, "Tracking transaction");

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = inner.run(generation, hash) => {}
            }
        });
    }

    /// Drop the tracked transaction and stop all its timers.
    pub fn clear_tracking(&self) {
        let mut current = self
            .inner
            .token
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        current.cancel();
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.state.send_replace(None);
    }

    pub fn current(&self) -> Option<TrackedTransaction> {
        self.inner.state.borrow().clone()
    }

    pub fn status(&self) -> TrackingStatus {
        self.current().map_or(TrackingStatus::Idle, |tx| tx.status)
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<TrackedTransaction>> {
        self.inner.state.subscribe()
    }

    /// One message per transaction that reaches `synced`.
    pub fn subscribe_synced(&self) -> broadcast::Receiver<TrackedTransaction> {
        self.inner.synced.subscribe()
    }
}

impl Inner {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// Apply a forward transition if `generation` still owns the state.
    fn advance(&self, generation: u64, next: TrackingStatus, block: Option<u64>) -> Option<TrackedTransaction> {
        let mut applied = None;
        self.state.send_if_modified(|slot| {
            if !self.is_current(generation) {
                return false;
            }
            match slot {
                Some(tx) if tx.status.can_advance_to(next) => {
                    tx.status = next;
                    if block.is_some() {
                        tx.block_number = block;
                    }
                    applied = Some(tx.clone());
                    true
                }
                _ => false,
            }
        });
        applied
    }

    fn clear_if_current(&self, generation: u64) {
        self.state.send_if_modified(|slot| {
            if self.is_current(generation) && slot.is_some() {
                *slot = None;
                true
            } else {
                false
            }
        });
    }

    async fn run(self: Arc<Self>, generation: u64, hash: B256) {
        let stuck_after = self.timeouts.pending_timeout;
        let settled = tokio::time::timeout(stuck_after, self.settle(generation, hash)).await;

        match settled {
            Err(_) => {
                tracing::warn!(%hash, "Transaction stuck, clearing");
                self.clear_if_current(generation);
            }
            Ok(()) => {
                tokio::time::sleep(self.timeouts.terminal_clear_delay).await;
                self.clear_if_current(generation);
            }
        }
    }

    /// Drive pending -> waiting -> synced, or to failed.
    async fn settle(self: &Arc<Self>, generation: u64, hash: B256) {
        let block = match self.receipts.wait_for_receipt(hash, self.timeouts.receipt).await {
            Ok(receipt) if receipt.success => receipt.block_number,
            Ok(_) => {
                tracing::warn!(%hash, "Transaction reverted");
                self.advance(generation, TrackingStatus::Failed, None);
                return;
            }
            Err(e) => {
                tracing::warn!(%hash, error = %e, "No usable receipt");
                self.advance(generation, TrackingStatus::Failed, None);
                return;
            }
        };

        if self
            .advance(generation, TrackingStatus::Waiting, Some(block))
            .is_none()
        {
            return;
        }
        tracing::debug!(%hash, block, "Mined, waiting for indexer");

        loop {
            match self.indexer.status().await {
                Ok(health) if health.latest_indexed_block >= block => break,
                Ok(health) => {
                    tracing::debug!(indexed = health.latest_indexed_block, block, "Indexer behind");
                }
                Err(e) => tracing::warn!(error = %e, "Indexer status failed"),
            }
            tokio::time::sleep(self.timeouts.poll_interval).await;
        }

        let Some(synced) = self.advance(generation, TrackingStatus::Synced, None) else {
            return;
        };
        tracing::info!(%hash, block, "Transaction indexed");

        let ledger = Arc::clone(&self.ledger);
        tokio::spawn(async move {
            if let Err(e) = ledger.refresh().await {
                tracing::warn!(error = %e, "Ledger refresh after sync failed");
            }
        });
        // no subscribers is fine
        let _ = self.synced.send(synced);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions_are_forward_only() {
        use TrackingStatus::*;
        assert!(Pending.can_advance_to(Waiting));
        assert!(Pending.can_advance_to(Failed));
        assert!(Waiting.can_advance_to(Synced));
        assert!(!Waiting.can_advance_to(Pending));
        assert!(!Synced.can_advance_to(Failed));
        assert!(!Failed.can_advance_to(Synced));
        assert!(!Pending.can_advance_to(Synced));
    }

    #[test]
    fn test_default_timeouts() {
        let t = TrackingTimeouts::default();
        assert_eq!(t.receipt, Duration::from_secs(60));
        assert_eq!(t.poll_interval, Duration::from_secs(5));
        assert_eq!(t.pending_timeout, Duration::from_secs(300));
        assert_eq!(t.terminal_clear_delay, Duration::from_secs(8));
    }
}
