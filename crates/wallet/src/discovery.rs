//! Note discovery
//!
//! Rebuilds every note chain an account owns in one pool from public events
//! alone. Deposits are found by deriving the precommitment of each deposit
//! index and looking it up among `Deposited` events; chains are followed
//! forward by looking up each tail's nullifier hash among withdrawals.
//!
//! The index scan stops after `gap_threshold` consecutive indices with no
//! deposit. Deposits made past such a gap are not found until the threshold
//! is raised; a cache written under a smaller threshold is then rescanned
//! from the pool's deployment block.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use alloy_primitives::{Address, U256};
use async_trait::async_trait;
use dashmap::DashMap;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tidepool_core::derivation::{change_secrets, deposit_secrets, note_secrets, refund_secrets};
use tidepool_core::utils::field_to_u256;
use tidepool_core::{MasterKeys, Note, NoteChain, NoteError, NoteKind, NoteStatus};
use tidepool_vault::{LocalStore, SessionError, SessionHandle, StoreError};
use tokio_util::sync::CancellationToken;

use crate::config::PoolConfig;
use crate::events::{DepositedEvent, EventIndex};
use crate::remote_log::{RemoteLog, RemoteLogError};
use crate::tracking::LedgerRefresh;

/// Consecutive unused deposit indices after which the scan stops.
pub const DEFAULT_GAP_THRESHOLD: u64 = 10;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Remote log error: {0}")]
    Remote(#[from] RemoteLogError),

    #[error("Discovery cache error: {0}")]
    Cache(#[from] StoreError),

    #[error("Inconsistent note chain: {0}")]
    Note(#[from] NoteError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Derivation worker failed: {0}")]
    Worker(String),

    #[error("Discovery run superseded")]
    Cancelled,
}

impl DiscoveryError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Remote(e) => e.is_retryable(),
            Self::Cache(_) | Self::Worker(_) => true,
            Self::Note(_) | Self::Session(_) | Self::Cancelled => false,
        }
    }
}

/// Everything discovery knows about one account in one pool.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryState {
    pub chains: Vec<NoteChain>,
    /// Highest deposit index with a discovered deposit.
    pub last_used_index: Option<u64>,
    pub last_sync_at: u64,
    /// Resume point for the event log.
    pub cursor: u64,
    /// Threshold the cached scan ran with.
    #[serde(default)]
    pub gap_threshold: u64,
}

impl DiscoveryState {
    pub fn available_notes(&self) -> impl Iterator<Item = &Note> {
        self.chains.iter().flat_map(|c| c.available_notes())
    }

    pub fn balance(&self) -> U256 {
        self.chains
            .iter()
            .fold(U256::ZERO, |acc, c| acc.saturating_add(c.balance()))
    }

    pub fn chain(&self, deposit_index: u64) -> Option<&NoteChain> {
        self.chains.iter().find(|c| c.deposit_index == deposit_index)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DiscoveryOutcome {
    Fresh(DiscoveryState),
    /// The refresh failed; this is the last cached result.
    Stale { state: DiscoveryState, reason: String },
    /// A newer run took over. Nothing was committed.
    Cancelled,
}

impl DiscoveryOutcome {
    pub fn state(&self) -> Option<&DiscoveryState> {
        match self {
            Self::Fresh(state) | Self::Stale { state, .. } => Some(state),
            Self::Cancelled => None,
        }
    }
}

/// Where discovery results persist between runs.
pub trait DiscoveryCache: Send + Sync {
    fn load(&self, public_key: &str, pool: Address) -> Result<Option<DiscoveryState>, StoreError>;

    fn store(&self, public_key: &str, pool: Address, state: &DiscoveryState) -> Result<(), StoreError>;
}

impl DiscoveryCache for LocalStore {
    fn load(&self, public_key: &str, pool: Address) -> Result<Option<DiscoveryState>, StoreError> {
        self.get_discovery(public_key, pool)
    }

    fn store(&self, public_key: &str, pool: Address, state: &DiscoveryState) -> Result<(), StoreError> {
        self.put_discovery(public_key, pool, state)
    }
}

struct RunSlot {
    id: u64,
    token: CancellationToken,
}

pub struct DiscoveryEngine {
    log: Arc<dyn RemoteLog>,
    cache: Arc<dyn DiscoveryCache>,
    gap_threshold: u64,
    page_size: u64,
    runs: DashMap<String, RunSlot>,
    next_run: AtomicU64,
}

impl DiscoveryEngine {
    pub fn new(
        log: Arc<dyn RemoteLog>,
        cache: Arc<dyn DiscoveryCache>,
        gap_threshold: u64,
        page_size: u64,
    ) -> Self {
        Self {
            log,
            cache,
            gap_threshold: gap_threshold.max(1),
            page_size: page_size.max(1),
            runs: DashMap::new(),
            next_run: AtomicU64::new(0),
        }
    }

    pub fn gap_threshold(&self) -> u64 {
        self.gap_threshold
    }

    /// Last committed result, without touching the network.
    pub async fn cached(
        &self,
        session: &SessionHandle,
        pool: &PoolConfig,
    ) -> Result<Option<DiscoveryState>, DiscoveryError> {
        let public_key = session.public_key().await?;
        Ok(self.cache.load(&public_key, pool.address)?)
    }

    /// Refresh the account's chains in `pool`.
    ///
    /// Supersedes any run already in flight for the same account. Results
    /// are committed only by the latest run.
    pub async fn discover(
        &self,
        session: &SessionHandle,
        pool: &PoolConfig,
    ) -> Result<DiscoveryOutcome, DiscoveryError> {
        let account = session.account_id().to_string();
        let public_key = session.public_key().await?;
        let master = session.master_keys().await?;

        let token = CancellationToken::new();
        let run_id = self.next_run.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(previous) = self.runs.insert(
            account.clone(),
            RunSlot {
                id: run_id,
                token: token.clone(),
            },
        ) {
            previous.token.cancel();
        }

        let cached = match self.cache.load(&public_key, pool.address) {
            Ok(cached) => cached,
            Err(e) => {
                tracing::warn!(pool = %pool.address, error = %e, "Discovery cache unreadable, rescanning");
                None
            }
        };

        let resume = cached.clone().filter(|state| {
            let widened = state.gap_threshold < self.gap_threshold;
            if widened {
                tracing::info!(
                    pool = %pool.address,
                    cached = state.gap_threshold,
                    configured = self.gap_threshold,
                    "Gap threshold raised, rescanning from deployment block"
                );
            }
            !widened
        });

        let result = tokio::select! {
            _ = token.cancelled() => Err(DiscoveryError::Cancelled),
            r = self.run(&master, pool, resume, &token) => r,
        };

        let outcome = match result {
            Ok(state) => self.commit(&account, run_id, &token, &public_key, pool, state),
            Err(DiscoveryError::Cancelled) => {
                tracing::debug!(run_id, "Discovery run superseded");
                Ok(DiscoveryOutcome::Cancelled)
            }
            Err(e) => match cached {
                Some(state) => {
                    tracing::warn!(pool = %pool.address, error = %e, "Discovery failed, serving cached notes");
                    Ok(DiscoveryOutcome::Stale {
                        state,
                        reason: e.to_string(),
                    })
                }
                None => Err(e),
            },
        };

        self.runs.remove_if(&account, |_, slot| slot.id == run_id);
        outcome
    }

    /// Cancel the account's in-flight run, if any.
    pub fn cancel(&self, account_id: &str) {
        if let Some((_, slot)) = self.runs.remove(account_id) {
            slot.token.cancel();
        }
    }

    /// Persist `state` if `run_id` is still the account's latest run. The
    /// run slot stays borrowed across the write, so a newer run cannot
    /// register between the check and the store.
    fn commit(
        &self,
        account: &str,
        run_id: u64,
        token: &CancellationToken,
        public_key: &str,
        pool: &PoolConfig,
        state: DiscoveryState,
    ) -> Result<DiscoveryOutcome, DiscoveryError> {
        let Some(slot) = self.runs.get(account).filter(|slot| slot.id == run_id) else {
            tracing::debug!(run_id, "Discovery run superseded");
            return Ok(DiscoveryOutcome::Cancelled);
        };
        if token.is_cancelled() {
            tracing::debug!(run_id, "Discovery run superseded");
            return Ok(DiscoveryOutcome::Cancelled);
        }

        self.cache.store(public_key, pool.address, &state)?;
        drop(slot);

        tracing::info!(
            pool = %pool.address,
            chains = state.chains.len(),
            last_used_index = ?state.last_used_index,
            "Discovery complete"
        );
        Ok(DiscoveryOutcome::Fresh(state))
    }

    async fn run(
        &self,
        master: &MasterKeys,
        pool: &PoolConfig,
        cached: Option<DiscoveryState>,
        token: &CancellationToken,
    ) -> Result<DiscoveryState, DiscoveryError> {
        let mut state = cached.unwrap_or_else(|| DiscoveryState {
            cursor: pool.deployment_block,
            ..DiscoveryState::default()
        });

        let mut index = EventIndex::default();
        let mut cursor = state.cursor;
        loop {
            let page = self
                .log
                .fetch_events(pool.address, cursor, self.page_size)
                .await?;
            index.extend(page.events);
            cursor = page.next_cursor;
            if !page.has_more {
                break;
            }
        }
        tracing::debug!(events = index.len(), cursor, "Fetched pool events");

        self.scan_deposits(master, pool, &index, &mut state, token)
            .await?;

        for chain in &mut state.chains {
            if token.is_cancelled() {
                return Err(DiscoveryError::Cancelled);
            }
            reconcile_chain(chain, master, pool.scope, &index)?;
            chain.validate()?;
        }

        state.cursor = cursor;
        state.gap_threshold = self.gap_threshold;
        state.last_sync_at = now_secs();
        Ok(state)
    }

    /// Walk deposit indices past the last used one until a full gap of
    /// misses.
    async fn scan_deposits(
        &self,
        master: &MasterKeys,
        pool: &PoolConfig,
        index: &EventIndex,
        state: &mut DiscoveryState,
        token: &CancellationToken,
    ) -> Result<(), DiscoveryError> {
        let mut next = state.last_used_index.map_or(0, |i| i + 1);
        let mut misses = 0;

        loop {
            if token.is_cancelled() {
                return Err(DiscoveryError::Cancelled);
            }

            let window =
                derive_precommitments(master.clone(), pool.scope, next, self.gap_threshold).await?;

            for (deposit_index, precommitment) in window {
                let Some(event) = index.deposit(precommitment) else {
                    misses += 1;
                    if misses >= self.gap_threshold {
                        return Ok(());
                    }
                    continue;
                };
                misses = 0;

                let Some(note) = deposit_note(master, pool, deposit_index, event, index) else {
                    continue;
                };
                tracing::debug!(deposit_index, commitment = %note.commitment, "Discovered deposit");
                if state.chain(deposit_index).is_none() {
                    state.chains.push(NoteChain::new(note)?);
                }
                state.last_used_index = Some(deposit_index);
            }

            next += self.gap_threshold;
        }
    }
}

/// Re-derive precommitments for `len` deposit indices from `start`.
async fn derive_precommitments(
    master: MasterKeys,
    scope: U256,
    start: u64,
    len: u64,
) -> Result<Vec<(u64, U256)>, DiscoveryError> {
    tokio::task::spawn_blocking(move || {
        (start..start + len)
            .into_par_iter()
            .map(|i| {
                let secrets = deposit_secrets(&master, scope, i);
                (i, field_to_u256(secrets.precommitment()))
            })
            .collect()
    })
    .await
    .map_err(|e| DiscoveryError::Worker(e.to_string()))
}

fn deposit_note(
    master: &MasterKeys,
    pool: &PoolConfig,
    deposit_index: u64,
    event: &DepositedEvent,
    index: &EventIndex,
) -> Option<Note> {
    let secrets = deposit_secrets(master, pool.scope, deposit_index);
    let expected = field_to_u256(secrets.commitment(event.value, event.label));
    if expected != event.commitment {
        tracing::warn!(
            deposit_index,
            "Deposit commitment does not match derived secrets, skipping"
        );
        return None;
    }

    Some(Note {
        pool_address: pool.address,
        deposit_index,
        change_index: 0,
        refund_index: None,
        kind: NoteKind::Deposit,
        amount: event.value,
        label: event.label,
        commitment: event.commitment,
        origin_chain_id: pool.chain_id,
        destination_chain_id: None,
        origin_tx_hash: event.meta.tx_hash,
        destination_tx_hash: None,
        block_number: event.meta.block_number,
        timestamp: None,
        status: NoteStatus::Unspent,
        active: index.has_leaf(event.commitment),
        refund_commitment: None,
    })
}

/// Bring one chain up to date with `index`: activate inserted notes, follow
/// withdrawals from the tail, pick up refunds and mark spent refunds.
fn reconcile_chain(
    chain: &mut NoteChain,
    master: &MasterKeys,
    scope: U256,
    index: &EventIndex,
) -> Result<(), NoteError> {
    for note in chain.notes_mut() {
        if !note.active && index.has_leaf(note.commitment) {
            note.active = true;
        }
    }

    extend_tail(chain, master, scope, index)?;

    let candidates: Vec<(u64, U256, U256, u64)> = chain
        .notes()
        .iter()
        .filter_map(|n| {
            n.refund_commitment
                .map(|rc| (n.change_index, n.label, rc, n.origin_chain_id))
        })
        .collect();

    for (change_index, label, refund_commitment, origin_chain_id) in candidates {
        let Some(event) = index.refund(refund_commitment) else {
            continue;
        };
        let secrets = refund_secrets(master, label, change_index);
        let commitment = field_to_u256(secrets.commitment(event.value, label));
        if commitment != refund_commitment {
            tracing::warn!(change_index, "Refund commitment does not match derived secrets");
            continue;
        }

        tracing::debug!(deposit_index = chain.deposit_index, change_index, "Recovered refund");
        chain.add_refund(Note {
            pool_address: chain.pool_address,
            deposit_index: chain.deposit_index,
            change_index,
            refund_index: Some(change_index),
            kind: NoteKind::Refund,
            amount: event.value,
            label,
            commitment,
            origin_chain_id,
            destination_chain_id: None,
            origin_tx_hash: event.meta.tx_hash,
            destination_tx_hash: None,
            block_number: event.meta.block_number,
            timestamp: None,
            status: NoteStatus::Unspent,
            active: index.has_leaf(commitment),
            refund_commitment: None,
        })?;
    }

    for refund in chain.refunds_mut() {
        if refund.status == NoteStatus::Spent {
            continue;
        }
        let secrets = note_secrets(master, scope, refund);
        if index
            .withdrawal(field_to_u256(secrets.nullifier_hash()))
            .is_some()
        {
            refund.status = NoteStatus::Spent;
        }
    }

    Ok(())
}

fn extend_tail(
    chain: &mut NoteChain,
    master: &MasterKeys,
    scope: U256,
    index: &EventIndex,
) -> Result<(), NoteError> {
    loop {
        let tail = chain.tail();
        if tail.status == NoteStatus::Spent {
            return Ok(());
        }

        let nullifier_hash = field_to_u256(note_secrets(master, scope, tail).nullifier_hash());
        let Some(withdrawal) = index.withdrawal(nullifier_hash) else {
            return Ok(());
        };

        let Some(remaining) = tail.amount.checked_sub(withdrawal.value) else {
            tracing::warn!(
                deposit_index = tail.deposit_index,
                change_index = tail.change_index,
                "Withdrawal exceeds note value"
            );
            chain.tail_mut().status = NoteStatus::Spent;
            return Ok(());
        };

        let commitment = field_to_u256(change_secrets(master, tail).commitment(remaining, tail.label));
        if commitment != withdrawal.new_commitment {
            tracing::warn!(
                deposit_index = tail.deposit_index,
                change_index = tail.change_index,
                "Change commitment does not match derived secrets"
            );
            chain.tail_mut().status = NoteStatus::Spent;
            return Ok(());
        }

        let change = Note {
            pool_address: tail.pool_address,
            deposit_index: tail.deposit_index,
            change_index: tail.change_index + 1,
            refund_index: None,
            kind: NoteKind::Change,
            amount: remaining,
            label: tail.label,
            commitment,
            origin_chain_id: tail.origin_chain_id,
            destination_chain_id: withdrawal.destination_chain_id,
            origin_tx_hash: withdrawal.meta.tx_hash,
            destination_tx_hash: None,
            block_number: withdrawal.meta.block_number,
            timestamp: None,
            status: NoteStatus::Unspent,
            active: index.has_leaf(commitment),
            refund_commitment: withdrawal.refund_commitment,
        };
        tracing::debug!(
            deposit_index = change.deposit_index,
            change_index = change.change_index,
            "Followed withdrawal"
        );
        chain.append_change(change)?;
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Re-runs discovery for every configured pool after a tracked
/// transaction settles.
pub struct SessionLedger {
    engine: Arc<DiscoveryEngine>,
    session: SessionHandle,
    pools: Vec<PoolConfig>,
}

impl SessionLedger {
    pub fn new(engine: Arc<DiscoveryEngine>, session: SessionHandle, pools: Vec<PoolConfig>) -> Self {
        Self {
            engine,
            session,
            pools,
        }
    }
}

#[async_trait]
impl LedgerRefresh for SessionLedger {
    async fn refresh(&self) -> Result<(), DiscoveryError> {
        for pool in &self.pools {
            self.engine.discover(&self.session, pool).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventMeta, LeafInsertedEvent, PoolEvent, WithdrawnEvent};
    use tidepool_core::AccountKey;

    fn master() -> MasterKeys {
        AccountKey::from_seed(b"discovery unit test").master_keys()
    }

    fn pool() -> PoolConfig {
        PoolConfig {
            address: Address::repeat_byte(0x77),
            chain_id: 1,
            scope: U256::from(4242u64),
            deployment_block: 0,
        }
    }

    fn deposit_event(master: &MasterKeys, index: u64, value: u64, label: u64) -> DepositedEvent {
        let secrets = deposit_secrets(master, pool().scope, index);
        let value = U256::from(value);
        let label = U256::from(label);
        DepositedEvent {
            depositor: Address::repeat_byte(0x01),
            commitment: field_to_u256(secrets.commitment(value, label)),
            label,
            value,
            precommitment: field_to_u256(secrets.precommitment()),
            meta: EventMeta::default(),
        }
    }

    fn leaf(commitment: U256) -> PoolEvent {
        PoolEvent::LeafInserted(LeafInsertedEvent {
            index: 0,
            leaf: commitment,
            root: U256::ZERO,
            meta: EventMeta::default(),
        })
    }

    #[tokio::test]
    async fn test_window_derivation_matches_sequential() {
        let master = master();
        let window = derive_precommitments(master.clone(), U256::from(9u64), 3, 4)
            .await
            .unwrap();

        assert_eq!(window.len(), 4);
        for (i, precommitment) in window {
            let expected = field_to_u256(deposit_secrets(&master, U256::from(9u64), i).precommitment());
            assert_eq!(precommitment, expected);
        }
    }

    #[test]
    fn test_deposit_note_rejects_foreign_commitment() {
        let master = master();
        let mut event = deposit_event(&master, 0, 100, 5);
        event.commitment = U256::from(1u64);

        assert!(deposit_note(&master, &pool(), 0, &event, &EventIndex::default()).is_none());
    }

    #[test]
    fn test_reconcile_follows_withdrawal_and_activates() {
        let master = master();
        let event = deposit_event(&master, 0, 100, 5);
        let mut index = EventIndex::default();
        let note = deposit_note(&master, &pool(), 0, &event, &index).unwrap();
        assert!(!note.active);
        let mut chain = NoteChain::new(note.clone()).unwrap();

        let spent = field_to_u256(note_secrets(&master, pool().scope, &note).nullifier_hash());
        let change = field_to_u256(change_secrets(&master, &note).commitment(U256::from(60u64), note.label));
        index.extend([
            leaf(event.commitment),
            leaf(change),
            PoolEvent::Withdrawn(WithdrawnEvent {
                processooor: Address::ZERO,
                value: U256::from(40u64),
                spent_nullifier: spent,
                new_commitment: change,
                refund_commitment: None,
                destination_chain_id: None,
                meta: EventMeta::default(),
            }),
        ]);

        reconcile_chain(&mut chain, &master, pool().scope, &index).unwrap();

        assert_eq!(chain.len(), 2);
        assert!(chain.notes()[0].active);
        assert_eq!(chain.notes()[0].status, NoteStatus::Spent);
        assert_eq!(chain.tail().amount, U256::from(60u64));
        assert!(chain.tail().active);
        chain.validate().unwrap();
    }

    #[test]
    fn test_mismatched_change_stops_chain() {
        let master = master();
        let event = deposit_event(&master, 0, 100, 5);
        let note = deposit_note(&master, &pool(), 0, &event, &EventIndex::default()).unwrap();
        let mut chain = NoteChain::new(note.clone()).unwrap();

        let spent = field_to_u256(note_secrets(&master, pool().scope, &note).nullifier_hash());
        let mut index = EventIndex::default();
        index.insert(PoolEvent::Withdrawn(WithdrawnEvent {
            processooor: Address::ZERO,
            value: U256::from(40u64),
            spent_nullifier: spent,
            new_commitment: U256::from(12345u64),
            refund_commitment: None,
            destination_chain_id: None,
            meta: EventMeta::default(),
        }));

        reconcile_chain(&mut chain, &master, pool().scope, &index).unwrap();

        assert_eq!(chain.len(), 1);
        assert_eq!(chain.tail().status, NoteStatus::Spent);
    }
}
