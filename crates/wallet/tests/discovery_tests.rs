mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::U256;
use common::{eth, pool, unlocked_session, MemoryLog};
use tidepool_core::{NoteKind, NoteStatus};
use tidepool_vault::{LocalStore, Vault};
use tidepool_wallet::{DiscoveryEngine, DiscoveryOutcome, DiscoveryState, DEFAULT_GAP_THRESHOLD};

const LABEL: u64 = 42;

fn engine(log: &Arc<MemoryLog>, vault: &Vault, gap_threshold: u64) -> DiscoveryEngine {
    DiscoveryEngine::new(log.clone(), vault.store().clone(), gap_threshold, 3)
}

fn fresh(outcome: DiscoveryOutcome) -> DiscoveryState {
    match outcome {
        DiscoveryOutcome::Fresh(state) => state,
        other => panic!("expected a fresh result, got {other:?}"),
    }
}

#[tokio::test]
async fn test_single_deposit_discovered() {
    let (vault, session) = unlocked_session(1).await;
    let (_, stranger) = unlocked_session(2).await;
    let master = session.master_keys().await.unwrap();
    let log = MemoryLog::new();

    log.deposit(&stranger.master_keys().await.unwrap(), 0, eth("5"), U256::from(7u64));
    let commitment = log.deposit(&master, 0, eth("1"), U256::from(LABEL));

    let state = fresh(engine(&log, &vault, DEFAULT_GAP_THRESHOLD).discover(&session, &pool()).await.unwrap());

    assert_eq!(state.chains.len(), 1);
    assert_eq!(state.last_used_index, Some(0));
    let deposit = &state.chain(0).unwrap().notes()[0];
    assert_eq!(deposit.kind, NoteKind::Deposit);
    assert_eq!(deposit.commitment, commitment);
    assert_eq!(deposit.amount, eth("1"));
    assert!(deposit.active);
    assert_eq!(state.balance(), eth("1"));
}

#[tokio::test]
async fn test_spend_extends_chain_incrementally() {
    let (vault, session) = unlocked_session(1).await;
    let master = session.master_keys().await.unwrap();
    let log = MemoryLog::new();
    let engine = engine(&log, &vault, DEFAULT_GAP_THRESHOLD);

    log.deposit(&master, 0, eth("1"), U256::from(LABEL));
    let first = fresh(engine.discover(&session, &pool()).await.unwrap());
    let deposit = first.chains[0].notes()[0].clone();

    log.withdraw(&master, &deposit, eth("0.4"));
    let served = log.served.load(Ordering::SeqCst);
    let second = fresh(engine.discover(&session, &pool()).await.unwrap());

    // only the withdrawal and its leaf are fetched again
    assert_eq!(log.served.load(Ordering::SeqCst) - served, 2);

    let chain = second.chain(0).unwrap();
    assert_eq!(chain.len(), 2);
    assert_eq!(chain.notes()[0].status, NoteStatus::Spent);
    let change = chain.tail();
    assert_eq!(change.kind, NoteKind::Change);
    assert_eq!(change.change_index, 1);
    assert_eq!(change.amount, eth("0.6"));
    assert!(change.active);
    assert_eq!(second.balance(), eth("0.6"));

    let change = change.clone();
    log.withdraw(&master, &change, eth("0.1"));
    let third = fresh(engine.discover(&session, &pool()).await.unwrap());
    let chain = third.chain(0).unwrap();
    assert_eq!(chain.len(), 3);
    assert_eq!(chain.tail().amount, eth("0.5"));
    assert_eq!(third.available_notes().count(), 1);
}

#[tokio::test]
async fn test_rediscovery_without_new_events_is_idempotent() {
    let (vault, session) = unlocked_session(1).await;
    let master = session.master_keys().await.unwrap();
    let log = MemoryLog::new();
    let engine = engine(&log, &vault, DEFAULT_GAP_THRESHOLD);

    log.deposit(&master, 0, eth("1"), U256::from(LABEL));
    log.deposit(&master, 1, eth("2"), U256::from(LABEL + 1));

    let first = fresh(engine.discover(&session, &pool()).await.unwrap());
    let second = fresh(engine.discover(&session, &pool()).await.unwrap());

    assert_eq!(first.chains, second.chains);
    assert_eq!(first.last_used_index, second.last_used_index);
    assert_eq!(first.cursor, second.cursor);
    assert_eq!(second.balance(), eth("3"));
}

#[tokio::test]
async fn test_gap_threshold_bounds_scan() {
    let (vault, session) = unlocked_session(1).await;
    let master = session.master_keys().await.unwrap();
    let log = MemoryLog::new();

    log.deposit(&master, 0, eth("1"), U256::from(LABEL));
    log.deposit(&master, 3, eth("1"), U256::from(LABEL + 3));
    log.deposit(&master, 16, eth("1"), U256::from(LABEL + 16));

    let state = fresh(engine(&log, &vault, 10).discover(&session, &pool()).await.unwrap());
    assert_eq!(state.chains.len(), 2);
    assert_eq!(state.last_used_index, Some(3));

    // a wider gap reaches the deposit past the first run of misses
    let wide = DiscoveryEngine::new(log.clone(), Arc::new(LocalStore::temporary().unwrap()), 20, 3);
    let state = fresh(wide.discover(&session, &pool()).await.unwrap());
    assert_eq!(state.chains.len(), 3);
    assert_eq!(state.last_used_index, Some(16));
}

#[tokio::test]
async fn test_raised_threshold_rescans_cached_pool() {
    let (vault, session) = unlocked_session(1).await;
    let master = session.master_keys().await.unwrap();
    let log = MemoryLog::new();

    log.deposit(&master, 0, eth("1"), U256::from(LABEL));
    log.deposit(&master, 5, eth("2"), U256::from(LABEL + 5));

    let narrow = fresh(engine(&log, &vault, 2).discover(&session, &pool()).await.unwrap());
    assert_eq!(narrow.chains.len(), 1);
    assert_eq!(narrow.gap_threshold, 2);

    // same store: the cached cursor already sits past both deposits
    let wide = engine(&log, &vault, 10);
    let state = fresh(wide.discover(&session, &pool()).await.unwrap());
    assert_eq!(state.chains.len(), 2);
    assert_eq!(state.last_used_index, Some(5));
    assert_eq!(state.gap_threshold, 10);
    assert_eq!(state.balance(), eth("3"));

    // back to incremental once the cache carries the wider threshold
    let served = log.served.load(Ordering::SeqCst);
    let again = fresh(wide.discover(&session, &pool()).await.unwrap());
    assert_eq!(log.served.load(Ordering::SeqCst), served);
    assert_eq!(again.chains, state.chains);
}

#[tokio::test]
async fn test_malformed_cache_is_rescanned() {
    let (vault, session) = unlocked_session(1).await;
    let master = session.master_keys().await.unwrap();
    let log = MemoryLog::new();
    let engine = engine(&log, &vault, DEFAULT_GAP_THRESHOLD);

    log.deposit(&master, 0, eth("1"), U256::from(LABEL));
    let committed = fresh(engine.discover(&session, &pool()).await.unwrap());

    let public_key = session.public_key().await.unwrap();
    let mut raw: serde_json::Value = vault
        .store()
        .get_discovery(&public_key, pool().address)
        .unwrap()
        .unwrap();
    raw["chains"][0]["notes"] = serde_json::json!([]);
    vault
        .store()
        .put_discovery(&public_key, pool().address, &raw)
        .unwrap();

    let state = fresh(engine.discover(&session, &pool()).await.unwrap());
    assert_eq!(state.chains, committed.chains);
    assert_eq!(state.balance(), eth("1"));
}

#[tokio::test]
async fn test_failure_serves_cached_state() {
    let (vault, session) = unlocked_session(1).await;
    let master = session.master_keys().await.unwrap();
    let log = MemoryLog::new();
    let engine = engine(&log, &vault, DEFAULT_GAP_THRESHOLD);

    log.deposit(&master, 0, eth("1"), U256::from(LABEL));
    let committed = fresh(engine.discover(&session, &pool()).await.unwrap());

    log.set_failing(true);
    match engine.discover(&session, &pool()).await.unwrap() {
        DiscoveryOutcome::Stale { state, reason } => {
            assert_eq!(state, committed);
            assert!(reason.contains("indexer unavailable"));
        }
        other => panic!("expected stale result, got {other:?}"),
    }
}

#[tokio::test]
async fn test_failure_without_cache_is_error() {
    let (vault, session) = unlocked_session(1).await;
    let log = MemoryLog::new();
    log.set_failing(true);

    let err = engine(&log, &vault, DEFAULT_GAP_THRESHOLD)
        .discover(&session, &pool())
        .await
        .unwrap_err();
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_pending_deposit_activates_once_inserted() {
    let (vault, session) = unlocked_session(1).await;
    let master = session.master_keys().await.unwrap();
    let log = MemoryLog::new();
    let engine = engine(&log, &vault, DEFAULT_GAP_THRESHOLD);

    let commitment = log.deposit_pending(&master, 0, eth("1"), U256::from(LABEL));
    let pending = fresh(engine.discover(&session, &pool()).await.unwrap());
    assert_eq!(pending.chains.len(), 1);
    assert!(!pending.chains[0].tail().active);
    assert_eq!(pending.balance(), U256::ZERO);

    log.insert_leaf(commitment);
    let inserted = fresh(engine.discover(&session, &pool()).await.unwrap());
    assert!(inserted.chains[0].tail().active);
    assert_eq!(inserted.balance(), eth("1"));
}

#[tokio::test]
async fn test_refund_recovered_after_failed_crosschain_leg() {
    let (vault, session) = unlocked_session(1).await;
    let master = session.master_keys().await.unwrap();
    let log = MemoryLog::new();
    let engine = engine(&log, &vault, DEFAULT_GAP_THRESHOLD);
    let label = U256::from(LABEL);

    log.deposit(&master, 0, eth("1"), label);
    let state = fresh(engine.discover(&session, &pool()).await.unwrap());
    let deposit = state.chains[0].notes()[0].clone();

    let refund_commitment = log.withdraw_crosschain(&master, &deposit, eth("0.3"), 10);
    let state = fresh(engine.discover(&session, &pool()).await.unwrap());
    let chain = state.chain(0).unwrap();
    assert_eq!(chain.tail().destination_chain_id, Some(10));
    assert_eq!(chain.tail().refund_commitment, Some(refund_commitment));
    assert!(chain.refunds().is_empty());
    assert_eq!(state.balance(), eth("0.7"));

    log.refund(refund_commitment, eth("0.3"), label);
    let state = fresh(engine.discover(&session, &pool()).await.unwrap());
    let chain = state.chain(0).unwrap();
    assert_eq!(chain.refunds().len(), 1);
    let refund = chain.refunds()[0].clone();
    assert_eq!(refund.kind, NoteKind::Refund);
    assert_eq!(refund.amount, eth("0.3"));
    assert_eq!(refund.refund_index, Some(1));
    assert!(refund.active);
    assert_eq!(state.balance(), eth("1"));

    log.spend_fully(&master, &refund);
    let state = fresh(engine.discover(&session, &pool()).await.unwrap());
    assert_eq!(state.chain(0).unwrap().refunds()[0].status, NoteStatus::Spent);
    assert_eq!(state.balance(), eth("0.7"));
}

#[tokio::test(start_paused = true)]
async fn test_newer_run_supersedes_older() {
    let (vault, session) = unlocked_session(1).await;
    let master = session.master_keys().await.unwrap();
    let log = MemoryLog::new();
    let engine = engine(&log, &vault, DEFAULT_GAP_THRESHOLD);

    log.deposit(&master, 0, eth("1"), U256::from(LABEL));
    *log.delay.lock().unwrap() = Some(Duration::from_millis(100));

    let first_pool = pool();
    let (older, newer) = tokio::join!(engine.discover(&session, &first_pool), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        engine.discover(&session, &pool()).await
    });

    assert_eq!(older.unwrap(), DiscoveryOutcome::Cancelled);
    let state = fresh(newer.unwrap());
    assert_eq!(engine.cached(&session, &pool()).await.unwrap(), Some(state));
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_run_commits_nothing() {
    let (vault, session) = unlocked_session(1).await;
    let master = session.master_keys().await.unwrap();
    let log = MemoryLog::new();
    let engine = engine(&log, &vault, DEFAULT_GAP_THRESHOLD);

    log.deposit(&master, 0, eth("1"), U256::from(LABEL));
    *log.delay.lock().unwrap() = Some(Duration::from_millis(100));

    let first_pool = pool();
    let (outcome, _) = tokio::join!(engine.discover(&session, &first_pool), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        engine.cancel(session.account_id());
    });

    assert_eq!(outcome.unwrap(), DiscoveryOutcome::Cancelled);
    assert_eq!(engine.cached(&session, &pool()).await.unwrap(), None);
}
