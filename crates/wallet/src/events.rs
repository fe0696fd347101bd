//! Pool events and the lookup index discovery runs against

use std::collections::HashMap;

use alloy_primitives::{Address, B256, U256};
use alloy_rpc_types::Log;
use alloy_sol_types::SolEvent;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tidepool_core::abi::{CrosschainWithdrawn, Deposited, LeafInserted, Refunded, Withdrawn};

#[derive(Debug, Error)]
pub enum EventError {
    #[error("Event parsing failed: {0}")]
    ParseFailed(String),
}

/// Where an event was emitted.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMeta {
    pub block_number: u64,
    pub tx_hash: B256,
    pub log_index: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositedEvent {
    pub depositor: Address,
    pub commitment: U256,
    pub label: U256,
    pub value: U256,
    pub precommitment: U256,
    pub meta: EventMeta,
}

/// Same-chain and cross-chain withdrawals. Only the latter carry a refund
/// commitment and a destination.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawnEvent {
    pub processooor: Address,
    pub value: U256,
    pub spent_nullifier: U256,
    pub new_commitment: U256,
    pub refund_commitment: Option<U256>,
    pub destination_chain_id: Option<u64>,
    pub meta: EventMeta,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundedEvent {
    pub refund_commitment: U256,
    pub value: U256,
    pub label: U256,
    pub meta: EventMeta,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeafInsertedEvent {
    pub index: u64,
    pub leaf: U256,
    pub root: U256,
    pub meta: EventMeta,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum PoolEvent {
    Deposited(DepositedEvent),
    Withdrawn(WithdrawnEvent),
    Refunded(RefundedEvent),
    LeafInserted(LeafInsertedEvent),
}

impl PoolEvent {
    pub fn meta(&self) -> &EventMeta {
        match self {
            Self::Deposited(e) => &e.meta,
            Self::Withdrawn(e) => &e.meta,
            Self::Refunded(e) => &e.meta,
            Self::LeafInserted(e) => &e.meta,
        }
    }
}

/// One page of the pool's event log.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPage {
    pub events: Vec<PoolEvent>,
    /// Cursor to resume from; opaque to callers.
    pub next_cursor: u64,
    pub has_more: bool,
}

/// First topics of every event the wallet cares about.
pub fn pool_event_topics() -> Vec<B256> {
    vec![
        Deposited::SIGNATURE_HASH,
        Withdrawn::SIGNATURE_HASH,
        CrosschainWithdrawn::SIGNATURE_HASH,
        Refunded::SIGNATURE_HASH,
        LeafInserted::SIGNATURE_HASH,
    ]
}

/// Decode a pool log. Logs with an unknown signature yield `None`.
pub fn parse_log(log: &Log) -> Result<Option<PoolEvent>, EventError> {
    let Some(topic) = log.topics().first().copied() else {
        return Ok(None);
    };
    let meta = EventMeta {
        block_number: log.block_number.unwrap_or(0),
        tx_hash: log.transaction_hash.unwrap_or_default(),
        log_index: log.log_index.unwrap_or(0),
    };
    let parse_err = |e: alloy_sol_types::Error| EventError::ParseFailed(e.to_string());

    let event = if topic == Deposited::SIGNATURE_HASH {
        let d = Deposited::decode_log_data(log.data()).map_err(parse_err)?;
        PoolEvent::Deposited(DepositedEvent {
            depositor: d._depositor,
            commitment: d._commitment,
            label: d._label,
            value: d._value,
            precommitment: d._precommitmentHash,
            meta,
        })
    } else if topic == Withdrawn::SIGNATURE_HASH {
        let w = Withdrawn::decode_log_data(log.data()).map_err(parse_err)?;
        PoolEvent::Withdrawn(WithdrawnEvent {
            processooor: w._processooor,
            value: w._value,
            spent_nullifier: w._spentNullifier,
            new_commitment: w._newCommitment,
            refund_commitment: None,
            destination_chain_id: None,
            meta,
        })
    } else if topic == CrosschainWithdrawn::SIGNATURE_HASH {
        let w = CrosschainWithdrawn::decode_log_data(log.data()).map_err(parse_err)?;
        PoolEvent::Withdrawn(WithdrawnEvent {
            processooor: w._processooor,
            value: w._value,
            spent_nullifier: w._spentNullifier,
            new_commitment: w._newCommitment,
            refund_commitment: Some(w._refundCommitment),
            destination_chain_id: Some(w._destinationChainId.saturating_to()),
            meta,
        })
    } else if topic == Refunded::SIGNATURE_HASH {
        let r = Refunded::decode_log_data(log.data()).map_err(parse_err)?;
        PoolEvent::Refunded(RefundedEvent {
            refund_commitment: r._refundCommitment,
            value: r._value,
            label: r._label,
            meta,
        })
    } else if topic == LeafInserted::SIGNATURE_HASH {
        let l = LeafInserted::decode_log_data(log.data()).map_err(parse_err)?;
        PoolEvent::LeafInserted(LeafInsertedEvent {
            index: l._index.saturating_to(),
            leaf: l._leaf,
            root: l._root,
            meta,
        })
    } else {
        return Ok(None);
    };

    Ok(Some(event))
}

/// Events keyed the way discovery looks them up.
#[derive(Clone, Debug, Default)]
pub struct EventIndex {
    deposits: HashMap<U256, DepositedEvent>,
    withdrawals: HashMap<U256, WithdrawnEvent>,
    refunds: HashMap<U256, RefundedEvent>,
    leaves: HashMap<U256, LeafInsertedEvent>,
}

impl EventIndex {
    pub fn insert(&mut self, event: PoolEvent) {
        match event {
            PoolEvent::Deposited(e) => {
                self.deposits.insert(e.precommitment, e);
            }
            PoolEvent::Withdrawn(e) => {
                self.withdrawals.insert(e.spent_nullifier, e);
            }
            PoolEvent::Refunded(e) => {
                self.refunds.insert(e.refund_commitment, e);
            }
            PoolEvent::LeafInserted(e) => {
                self.leaves.insert(e.leaf, e);
            }
        }
    }

    /// Deposit published with `precommitment`.
    pub fn deposit(&self, precommitment: U256) -> Option<&DepositedEvent> {
        self.deposits.get(&precommitment)
    }

    /// Withdrawal that spent the note with `nullifier_hash`.
    pub fn withdrawal(&self, nullifier_hash: U256) -> Option<&WithdrawnEvent> {
        self.withdrawals.get(&nullifier_hash)
    }

    pub fn refund(&self, refund_commitment: U256) -> Option<&RefundedEvent> {
        self.refunds.get(&refund_commitment)
    }

    pub fn has_leaf(&self, commitment: U256) -> bool {
        self.leaves.contains_key(&commitment)
    }

    pub fn len(&self) -> usize {
        self.deposits.len() + self.withdrawals.len() + self.refunds.len() + self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Extend<PoolEvent> for EventIndex {
    fn extend<I: IntoIterator<Item = PoolEvent>>(&mut self, iter: I) {
        for event in iter {
            self.insert(event);
        }
    }
}
