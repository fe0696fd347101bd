#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy_primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use tidepool_core::derivation::{change_secrets, deposit_secrets, note_secrets, refund_secrets};
use tidepool_core::poseidon::hash1;
use tidepool_core::utils::{field_to_u256, u256_to_field};
use tidepool_core::{MasterKeys, Note};
use tidepool_vault::{LocalStore, SessionHandle, Vault};
use tidepool_wallet::events::{
    DepositedEvent, EventMeta, EventPage, LeafInsertedEvent, PoolEvent, RefundedEvent,
    WithdrawnEvent,
};
use tidepool_wallet::prover::{Groth16Proof, ProofError, ProofGenerator, ProofResponse, WithdrawalProofInputs};
use tidepool_wallet::relay::{
    Call, OperationReceipt, Paymaster, PaymasterData, RelayError, RelayLayer, UserOperation,
};
use tidepool_wallet::remote_log::{AspRoot, LeafPage, RemoteLog, RemoteLogError};
use tidepool_wallet::PoolConfig;

pub const ASP_CID: &str = "bafyapproved";

pub fn pool() -> PoolConfig {
    PoolConfig {
        address: Address::repeat_byte(0x70),
        chain_id: 1,
        scope: U256::from(0x5c0e_u64),
        deployment_block: 0,
    }
}

pub fn eth(raw: &str) -> U256 {
    tidepool_core::parse_amount(raw).unwrap()
}

pub fn signature(byte: u8) -> Vec<u8> {
    let mut sig = vec![byte; 64];
    sig.push(27);
    sig
}

/// Vault on a throwaway database with an unlocked wallet account.
pub async fn unlocked_session(seed: u8) -> (Vault, SessionHandle) {
    let vault = Vault::new(Arc::new(LocalStore::temporary().unwrap()));
    let session = vault
        .create_wallet_account(Address::repeat_byte(seed), 1, &signature(seed))
        .await
        .unwrap();
    (vault, session)
}

/// In-memory pool event log. The cursor is a position in the event list.
#[derive(Default)]
pub struct MemoryLog {
    events: Mutex<Vec<PoolEvent>>,
    leaves: Mutex<Vec<U256>>,
    labels: Mutex<Vec<U256>>,
    pub failing: AtomicBool,
    pub fetches: AtomicUsize,
    /// Events returned by fetches, across all calls.
    pub served: AtomicUsize,
    pub delay: Mutex<Option<Duration>>,
}

impl MemoryLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, event: PoolEvent) {
        if let PoolEvent::LeafInserted(leaf) = &event {
            self.leaves.lock().unwrap().push(leaf.leaf);
        }
        self.events.lock().unwrap().push(event);
    }

    pub fn approve(&self, label: U256) {
        self.labels.lock().unwrap().push(label);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn meta(&self) -> EventMeta {
        let position = self.events.lock().unwrap().len() as u64;
        EventMeta {
            block_number: 100 + position,
            tx_hash: B256::with_last_byte(position as u8),
            log_index: 0,
        }
    }

    pub fn insert_leaf(&self, commitment: U256) {
        let index = self.leaves.lock().unwrap().len() as u64;
        let meta = self.meta();
        self.push(PoolEvent::LeafInserted(LeafInsertedEvent {
            index,
            leaf: commitment,
            root: U256::from(index + 1),
            meta,
        }));
    }

    /// Publish the deposit the account would make at `index`, without
    /// inserting its leaf.
    pub fn deposit_pending(&self, master: &MasterKeys, index: u64, value: U256, label: U256) -> U256 {
        let secrets = deposit_secrets(master, pool().scope, index);
        let commitment = field_to_u256(secrets.commitment(value, label));
        let meta = self.meta();
        self.push(PoolEvent::Deposited(DepositedEvent {
            depositor: Address::repeat_byte(0xde),
            commitment,
            label,
            value,
            precommitment: field_to_u256(secrets.precommitment()),
            meta,
        }));
        commitment
    }

    pub fn deposit(&self, master: &MasterKeys, index: u64, value: U256, label: U256) -> U256 {
        let commitment = self.deposit_pending(master, index, value, label);
        self.insert_leaf(commitment);
        commitment
    }

    /// Publish a same-chain withdrawal of `value` from `note`.
    pub fn withdraw(&self, master: &MasterKeys, note: &Note, value: U256) -> U256 {
        let spent = field_to_u256(note_secrets(master, pool().scope, note).nullifier_hash());
        let remaining = note.amount - value;
        let new_commitment = field_to_u256(change_secrets(master, note).commitment(remaining, note.label));
        let meta = self.meta();
        self.push(PoolEvent::Withdrawn(WithdrawnEvent {
            processooor: Address::repeat_byte(0xe0),
            value,
            spent_nullifier: spent,
            new_commitment,
            refund_commitment: None,
            destination_chain_id: None,
            meta,
        }));
        self.insert_leaf(new_commitment);
        new_commitment
    }

    /// Publish a cross-chain withdrawal; returns the refund commitment.
    pub fn withdraw_crosschain(
        &self,
        master: &MasterKeys,
        note: &Note,
        value: U256,
        destination_chain_id: u64,
    ) -> U256 {
        let spent = field_to_u256(note_secrets(master, pool().scope, note).nullifier_hash());
        let remaining = note.amount - value;
        let new_commitment = field_to_u256(change_secrets(master, note).commitment(remaining, note.label));
        let refund_commitment = field_to_u256(
            refund_secrets(master, note.label, note.change_index + 1).commitment(value, note.label),
        );
        let meta = self.meta();
        self.push(PoolEvent::Withdrawn(WithdrawnEvent {
            processooor: Address::repeat_byte(0xe0),
            value,
            spent_nullifier: spent,
            new_commitment,
            refund_commitment: Some(refund_commitment),
            destination_chain_id: Some(destination_chain_id),
            meta,
        }));
        self.insert_leaf(new_commitment);
        refund_commitment
    }

    pub fn refund(&self, refund_commitment: U256, value: U256, label: U256) {
        let meta = self.meta();
        self.push(PoolEvent::Refunded(RefundedEvent {
            refund_commitment,
            value,
            label,
            meta,
        }));
        self.insert_leaf(refund_commitment);
    }

    /// Publish a withdrawal that spends `note` in full, change-free.
    pub fn spend_fully(&self, master: &MasterKeys, note: &Note) {
        self.withdraw(master, note, note.amount);
    }
}

#[async_trait]
impl RemoteLog for MemoryLog {
    async fn fetch_events(
        &self,
        _pool: Address,
        cursor: u64,
        limit: u64,
    ) -> Result<EventPage, RemoteLogError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(RemoteLogError::Http("indexer unavailable".into()));
        }

        let events = self.events.lock().unwrap();
        let start = (cursor as usize).min(events.len());
        let end = (start + limit as usize).min(events.len());
        self.served.fetch_add(end - start, Ordering::SeqCst);
        Ok(EventPage {
            events: events[start..end].to_vec(),
            next_cursor: end as u64,
            has_more: end < events.len(),
        })
    }

    async fn state_leaves(
        &self,
        _pool: Address,
        page: u64,
        limit: u64,
    ) -> Result<LeafPage, RemoteLogError> {
        let leaves = self.leaves.lock().unwrap();
        let start = (page * limit) as usize;
        let start = start.min(leaves.len());
        let end = (start + limit as usize).min(leaves.len());
        Ok(LeafPage {
            leaves: leaves[start..end].to_vec(),
            has_more: end < leaves.len(),
        })
    }

    async fn asp_root(&self, _scope: U256) -> Result<AspRoot, RemoteLogError> {
        Ok(AspRoot {
            root: U256::from(0xa5u64),
            cid: ASP_CID.to_string(),
        })
    }

    async fn asp_labels(&self, cid: &str) -> Result<Vec<U256>, RemoteLogError> {
        if cid != ASP_CID {
            return Err(RemoteLogError::NotFound(cid.to_string()));
        }
        Ok(self.labels.lock().unwrap().clone())
    }
}

/// Prover that echoes the request back as public signals.
#[derive(Default)]
pub struct EchoProver {
    pub requests: Mutex<Vec<WithdrawalProofInputs>>,
    /// Fail this many calls before succeeding.
    pub failures: AtomicUsize,
    /// Drop the last public signal from every response.
    pub truncate: AtomicBool,
}

impl EchoProver {
    fn respond(&self, inputs: &WithdrawalProofInputs, cross_chain: bool) -> Result<ProofResponse, ProofError> {
        self.requests.lock().unwrap().push(inputs.clone());
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ProofError::Generator("witness generation failed".into()));
        }

        let nullifier: U256 = inputs.existing_nullifier.parse().unwrap();
        let nullifier_hash = field_to_u256(hash1(u256_to_field(nullifier))).to_string();

        let mut signals = vec!["777".to_string(), nullifier_hash];
        if cross_chain {
            signals.push("888".to_string());
        }
        signals.push(inputs.withdrawn_value.clone());
        signals.extend(["11", "32", "165", "32"].map(String::from));
        signals.push(inputs.context.clone());
        if self.truncate.load(Ordering::SeqCst) {
            signals.pop();
        }

        Ok(ProofResponse {
            proof: Groth16Proof {
                pi_a: vec!["1".into(), "2".into(), "1".into()],
                pi_b: vec![
                    vec!["3".into(), "4".into()],
                    vec!["5".into(), "6".into()],
                    vec!["1".into(), "0".into()],
                ],
                pi_c: vec!["7".into(), "8".into(), "1".into()],
            },
            public_signals: signals,
        })
    }
}

#[async_trait]
impl ProofGenerator for EchoProver {
    async fn generate_withdrawal_proof(
        &self,
        inputs: &WithdrawalProofInputs,
    ) -> Result<ProofResponse, ProofError> {
        self.respond(inputs, false)
    }

    async fn generate_crosschain_withdrawal_proof(
        &self,
        inputs: &WithdrawalProofInputs,
    ) -> Result<ProofResponse, ProofError> {
        self.respond(inputs, true)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RelayScript {
    Succeed,
    Reject,
    Revert,
    NetworkDown,
}

pub const OP_HASH: B256 = B256::repeat_byte(0x0e);
pub const TX_HASH: B256 = B256::repeat_byte(0x7a);

pub struct ScriptedRelay {
    pub script: Mutex<RelayScript>,
    pub sent: Mutex<Vec<UserOperation>>,
    pub calls: Mutex<Vec<Call>>,
}

impl ScriptedRelay {
    pub fn new(script: RelayScript) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            sent: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl RelayLayer for ScriptedRelay {
    async fn draft_operation(&self, call: &Call) -> Result<UserOperation, RelayError> {
        self.calls.lock().unwrap().push(call.clone());
        Ok(UserOperation {
            sender: Address::repeat_byte(0xac),
            call_data: call.data.clone(),
            ..UserOperation::default()
        })
    }

    async fn prepare_operation(
        &self,
        mut op: UserOperation,
        paymaster_stub: &PaymasterData,
    ) -> Result<UserOperation, RelayError> {
        op.apply_paymaster(paymaster_stub);
        op.call_gas_limit = U256::from(200_000u64);
        Ok(op)
    }

    async fn send_operation(&self, op: &UserOperation) -> Result<B256, RelayError> {
        let script = self.script.lock().unwrap().clone();
        match script {
            RelayScript::Reject => Err(RelayError::classify("User rejected the request.")),
            RelayScript::NetworkDown => Err(RelayError::Network("connection refused".into())),
            RelayScript::Succeed | RelayScript::Revert => {
                self.sent.lock().unwrap().push(op.clone());
                Ok(OP_HASH)
            }
        }
    }

    async fn wait_for_receipt(
        &self,
        op_hash: B256,
        _timeout: Duration,
    ) -> Result<OperationReceipt, RelayError> {
        let success = *self.script.lock().unwrap() != RelayScript::Revert;
        Ok(OperationReceipt {
            user_op_hash: op_hash,
            success,
            transaction_hash: TX_HASH,
            block_number: 4_200,
            reason: (!success).then(|| "execution reverted".to_string()),
        })
    }
}

pub struct StaticPaymaster;

#[async_trait]
impl Paymaster for StaticPaymaster {
    async fn stub_data(&self, _op: &UserOperation) -> Result<PaymasterData, RelayError> {
        Ok(PaymasterData {
            paymaster: Address::repeat_byte(0x50),
            paymaster_data: Bytes::from(vec![0x00]),
            paymaster_verification_gas_limit: Some(U256::from(60_000u64)),
            paymaster_post_op_gas_limit: None,
        })
    }

    async fn sponsorship_data(&self, _op: &UserOperation) -> Result<PaymasterData, RelayError> {
        Ok(PaymasterData {
            paymaster: Address::repeat_byte(0x50),
            paymaster_data: Bytes::from(vec![0x5e, 0x1f]),
            paymaster_verification_gas_limit: None,
            paymaster_post_op_gas_limit: None,
        })
    }
}

/// Count of values seen per key, for asserting "exactly once".
#[derive(Default)]
pub struct Tally(Mutex<HashMap<String, usize>>);

impl Tally {
    pub fn bump(&self, key: &str) {
        *self.0.lock().unwrap().entry(key.to_string()).or_default() += 1;
    }

    pub fn get(&self, key: &str) -> usize {
        self.0.lock().unwrap().get(key).copied().unwrap_or(0)
    }
}
