//! Withdrawal orchestration
//!
//! ```text
//! idle ─> validating ─┬─> invalid
//!                     └─> preparing-proof ─┬─> proof-failed ─> preparing-proof
//!                                          └─> ready ─> submitting ─┬─> submitted
//!                                                                   ├─> failed
//!                                                                   └─> cancelled
//! ```
//!
//! Same-chain and cross-chain withdrawals share the pipeline but differ in
//! relay payload, entrypoint function and public signal count.

use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, Bytes, B256, U256};
use alloy_sol_types::SolCall;
use serde::Serialize;
use thiserror::Error;
use tidepool_core::abi::{crosschainRelayCall, relayCall, Withdrawal};
use tidepool_core::context::{context_hash, cross_chain_withdrawal, same_chain_withdrawal};
use tidepool_core::derivation::{change_secrets, note_secrets, refund_secrets, NoteSecrets};
use tidepool_core::fees::FeeError;
use tidepool_core::utils::field_to_u256;
use tidepool_core::{
    FeeQuote, FeeSchedule, Note, NoteKind, NoteStatus, Route, CROSS_CHAIN_SIGNALS,
    SAME_CHAIN_SIGNALS,
};
use tidepool_vault::{SessionError, SessionHandle};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::{PoolConfig, WalletConfig};
use crate::prover::{ProofError, ProofGenerator, SolidityProof, WithdrawalProofInputs};
use crate::relay::{Call, OperationReceipt, Paymaster, RelayError, RelayLayer};
use crate::remote_log::{all_state_leaves, RemoteLog, RemoteLogError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum WithdrawalPhase {
    Idle,
    Validating,
    Invalid,
    PreparingProof,
    ProofFailed,
    Ready,
    Submitting,
    Submitted,
    Failed,
    Cancelled,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("No note selected")]
    NoteMissing,

    #[error("Amount must be positive")]
    ZeroAmount,

    #[error("Amount {amount} exceeds note balance {available}")]
    AmountExceedsNote { amount: U256, available: U256 },

    #[error("Invalid recipient address {0:?}")]
    InvalidRecipient(String),

    #[error("Account key unavailable; unlock the account first")]
    AccountKeyMissing,

    #[error("Note is already spent")]
    NoteSpent,

    #[error("Note is not yet in the state tree")]
    NoteInactive,

    #[error("Refund notes can only be withdrawn in full on their own chain")]
    PartialRefund,

    #[error("Destination chain id {0} does not fit the relay payload")]
    DestinationChain(u64),
}

#[derive(Debug, Error)]
pub enum WithdrawalError {
    #[error("Invalid withdrawal: {0}")]
    Invalid(#[from] ValidationError),

    #[error("Fee quote failed: {0}")]
    Fees(#[from] FeeError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Pool {0} is not configured")]
    UnknownPool(Address),

    #[error("Label {label} is not in the approved set")]
    NotApproved { label: U256 },

    #[error("Could not load pool state: {0}")]
    Remote(#[from] RemoteLogError),

    #[error("Proof generation failed for {amount} wei (cross-chain: {cross_chain})")]
    ProofGenerationFailed {
        amount: U256,
        cross_chain: bool,
        #[source]
        source: ProofError,
    },

    #[error("Submission failed for {amount} wei (cross-chain: {cross_chain})")]
    Submission {
        amount: U256,
        cross_chain: bool,
        #[source]
        source: RelayError,
    },

    #[error("Operation {op_hash} reverted: {}", .reason.as_deref().unwrap_or("no reason"))]
    Reverted {
        op_hash: B256,
        reason: Option<String>,
    },

    #[error("Withdrawal cancelled")]
    Cancelled,
}

impl WithdrawalError {
    /// Errors worth retrying with the same request.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Remote(e) => e.is_retryable(),
            Self::ProofGenerationFailed { .. } => true,
            Self::Submission { source, .. } => source.is_retryable(),
            _ => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WithdrawalRequest {
    pub note: Option<Note>,
    pub amount: U256,
    /// Hex address as typed; checksummed if mixed case.
    pub recipient: String,
    pub route: Route,
}

/// A request that passed validation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidatedWithdrawal {
    pub note: Note,
    pub amount: U256,
    pub recipient: Address,
    pub route: Route,
}

/// Check a request without touching keys or the network.
pub fn validate(
    request: &WithdrawalRequest,
    account_key_present: bool,
) -> Result<ValidatedWithdrawal, ValidationError> {
    let note = request.note.as_ref().ok_or(ValidationError::NoteMissing)?;
    if request.amount.is_zero() {
        return Err(ValidationError::ZeroAmount);
    }
    if request.amount > note.amount {
        return Err(ValidationError::AmountExceedsNote {
            amount: request.amount,
            available: note.amount,
        });
    }
    let recipient = parse_recipient(&request.recipient)?;
    if !account_key_present {
        return Err(ValidationError::AccountKeyMissing);
    }
    if note.status == NoteStatus::Spent {
        return Err(ValidationError::NoteSpent);
    }
    if !note.active {
        return Err(ValidationError::NoteInactive);
    }

    let route = request.route.resolve(note.origin_chain_id);
    if note.kind == NoteKind::Refund && (route.is_cross_chain() || request.amount != note.amount) {
        return Err(ValidationError::PartialRefund);
    }
    if let Route::CrossChain {
        destination_chain_id,
    } = route
    {
        if u32::try_from(destination_chain_id).is_err() {
            return Err(ValidationError::DestinationChain(destination_chain_id));
        }
    }

    Ok(ValidatedWithdrawal {
        note: note.clone(),
        amount: request.amount,
        recipient,
        route,
    })
}

/// Parse a `0x` address. Mixed case input must carry a valid EIP-55
/// checksum; the zero address is never a valid recipient.
pub fn parse_recipient(raw: &str) -> Result<Address, ValidationError> {
    let invalid = || ValidationError::InvalidRecipient(raw.to_string());
    let trimmed = raw.trim();
    let digits = trimmed.strip_prefix("0x").ok_or_else(invalid)?;
    if digits.len() != 40 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(invalid());
    }

    let mixed_case = digits.chars().any(|c| c.is_ascii_lowercase())
        && digits.chars().any(|c| c.is_ascii_uppercase());
    let address = if mixed_case {
        Address::parse_checksummed(trimmed, None).map_err(|_| invalid())?
    } else {
        trimmed.parse::<Address>().map_err(|_| invalid())?
    };

    if address == Address::ZERO {
        return Err(invalid());
    }
    Ok(address)
}

/// A proven withdrawal waiting to be submitted.
#[derive(Clone, Debug)]
pub struct PreparedWithdrawal {
    call: Call,
    quote: FeeQuote,
    note: Note,
    chain_id: u64,
    new_commitment: U256,
}

impl PreparedWithdrawal {
    pub fn call(&self) -> &Call {
        &self.call
    }

    pub fn quote(&self) -> &FeeQuote {
        &self.quote
    }

    pub fn note(&self) -> &Note {
        &self.note
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn is_cross_chain(&self) -> bool {
        self.quote.route.is_cross_chain()
    }

    /// Commitment of the change note the withdrawal creates.
    pub fn new_commitment(&self) -> U256 {
        self.new_commitment
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Submission {
    pub op_hash: B256,
    pub tx_hash: B256,
    pub block_number: u64,
    pub chain_id: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubmitOutcome {
    Submitted(Submission),
    /// The user declined; nothing to report.
    Cancelled,
}

pub struct WithdrawalOrchestrator {
    log: Arc<dyn RemoteLog>,
    prover: Arc<dyn ProofGenerator>,
    relay: Arc<dyn RelayLayer>,
    paymaster: Arc<dyn Paymaster>,
    pools: Vec<PoolConfig>,
    fees: FeeSchedule,
    entrypoint: Address,
    fee_recipient: Address,
    receipt_timeout: Duration,
    leaf_page_size: u64,
    phase: watch::Sender<WithdrawalPhase>,
}

impl WithdrawalOrchestrator {
    pub fn new(
        log: Arc<dyn RemoteLog>,
        prover: Arc<dyn ProofGenerator>,
        relay: Arc<dyn RelayLayer>,
        paymaster: Arc<dyn Paymaster>,
        config: &WalletConfig,
    ) -> Self {
        let (phase, _) = watch::channel(WithdrawalPhase::Idle);
        Self {
            log,
            prover,
            relay,
            paymaster,
            pools: config.pools.clone(),
            fees: config.fees,
            entrypoint: config.pool_entrypoint,
            fee_recipient: config.fee_recipient,
            receipt_timeout: config.receipt_timeout,
            leaf_page_size: config.page_size,
            phase,
        }
    }

    pub fn phase(&self) -> WithdrawalPhase {
        *self.phase.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<WithdrawalPhase> {
        self.phase.subscribe()
    }

    pub fn reset(&self) {
        self.set_phase(WithdrawalPhase::Idle);
    }

    fn set_phase(&self, phase: WithdrawalPhase) {
        self.phase.send_if_modified(|current| {
            if *current == phase {
                return false;
            }
            tracing::debug!(from = ?*current, to = ?phase, "Withdrawal phase");
            *current = phase;
            true
        });
    }

    fn pool(&self, address: Address) -> Result<&PoolConfig, WithdrawalError> {
        self.pools
            .iter()
            .find(|p| p.address == address)
            .ok_or(WithdrawalError::UnknownPool(address))
    }

    /// Fee breakdown for withdrawing `amount` from `pool`.
    pub fn quote(&self, pool: Address, amount: U256, route: Route) -> Result<FeeQuote, WithdrawalError> {
        let pool = self.pool(pool)?;
        Ok(self.fees.quote(amount, route, pool.chain_id)?)
    }

    /// Validate, derive secrets, fetch pool state and prove.
    pub async fn prepare(
        &self,
        session: &SessionHandle,
        request: &WithdrawalRequest,
        token: &CancellationToken,
    ) -> Result<PreparedWithdrawal, WithdrawalError> {
        self.set_phase(WithdrawalPhase::Validating);

        let master = session.master_keys().await.ok();
        let checked = validate(request, master.is_some())
            .map_err(WithdrawalError::from)
            .and_then(|v| {
                let pool = self.pool(v.note.pool_address)?.clone();
                let quote = self.fees.quote(v.amount, v.route, pool.chain_id)?;
                Ok((v, pool, quote))
            });
        let (valid, pool, quote, master) = match (checked, master) {
            (Ok((valid, pool, quote)), Some(master)) => (valid, pool, quote, master),
            (Err(e), _) => {
                self.set_phase(WithdrawalPhase::Invalid);
                return Err(e);
            }
            (Ok(_), None) => {
                self.set_phase(WithdrawalPhase::Invalid);
                return Err(ValidationError::AccountKeyMissing.into());
            }
        };

        self.set_phase(WithdrawalPhase::PreparingProof);
        let cross_chain = quote.route.is_cross_chain();
        let note = &valid.note;

        let existing = note_secrets(&master, pool.scope, note);
        let change = change_secrets(&master, note);
        let refund = cross_chain.then(|| refund_secrets(&master, note.label, note.change_index + 1));

        let withdrawal = self.withdrawal_payload(&valid)?;
        let context = field_to_u256(context_hash(&withdrawal, pool.scope));

        let state = tokio::select! {
            _ = token.cancelled() => None,
            r = self.pool_state(&pool) => Some(r),
        };
        let (leaves, labels) = match state {
            None => return Err(self.cancelled()),
            Some(Ok(state)) => state,
            Some(Err(e)) => {
                tracing::warn!(pool = %pool.address, error = %e, "Pool state unavailable");
                self.set_phase(WithdrawalPhase::ProofFailed);
                return Err(e.into());
            }
        };

        if !labels.contains(&note.label) {
            self.set_phase(WithdrawalPhase::ProofFailed);
            return Err(WithdrawalError::NotApproved { label: note.label });
        }

        let inputs = proof_inputs(
            note,
            &existing,
            &change,
            refund.as_ref(),
            valid.amount,
            context,
            &leaves,
            &labels,
        );

        let proof_failed = |source: ProofError| {
            self.set_phase(WithdrawalPhase::ProofFailed);
            tracing::warn!(amount = %valid.amount, cross_chain, error = %source, "Proof generation failed");
            WithdrawalError::ProofGenerationFailed {
                amount: valid.amount,
                cross_chain,
                source,
            }
        };

        let response = tokio::select! {
            _ = token.cancelled() => None,
            r = async {
                if cross_chain {
                    self.prover.generate_crosschain_withdrawal_proof(&inputs).await
                } else {
                    self.prover.generate_withdrawal_proof(&inputs).await
                }
            } => Some(r),
        };
        let response = match response {
            None => return Err(self.cancelled()),
            Some(r) => r.map_err(proof_failed)?,
        };

        let expected = if cross_chain {
            CROSS_CHAIN_SIGNALS
        } else {
            SAME_CHAIN_SIGNALS
        };
        let proof = SolidityProof::from_response(&response, expected).map_err(proof_failed)?;
        proof
            .check(
                field_to_u256(existing.nullifier_hash()),
                valid.amount,
                context,
            )
            .map_err(proof_failed)?;

        let data = if cross_chain {
            crosschainRelayCall {
                _withdrawal: withdrawal,
                _proof: proof.cross_chain().map_err(proof_failed)?,
                _scope: pool.scope,
            }
            .abi_encode()
        } else {
            relayCall {
                _withdrawal: withdrawal,
                _proof: proof.same_chain().map_err(proof_failed)?,
                _scope: pool.scope,
            }
            .abi_encode()
        };

        self.set_phase(WithdrawalPhase::Ready);
        tracing::info!(
            pool = %pool.address,
            deposit_index = note.deposit_index,
            change_index = note.change_index,
            cross_chain,
            "Withdrawal proven"
        );

        Ok(PreparedWithdrawal {
            call: Call {
                to: self.entrypoint,
                value: U256::ZERO,
                data: Bytes::from(data),
            },
            quote,
            note: valid.note.clone(),
            chain_id: pool.chain_id,
            new_commitment: proof.new_commitment(),
        })
    }

    /// Hand a prepared withdrawal to the relay layer and wait for inclusion.
    pub async fn submit(
        &self,
        prepared: PreparedWithdrawal,
        token: &CancellationToken,
    ) -> Result<SubmitOutcome, WithdrawalError> {
        self.set_phase(WithdrawalPhase::Submitting);
        let amount = prepared.quote.withdraw_amount;
        let cross_chain = prepared.is_cross_chain();

        let result = tokio::select! {
            _ = token.cancelled() => Err(RelayError::UserRejected("cancelled before submission".into())),
            r = self.relay_call(&prepared.call) => r,
        };

        match result {
            Ok(receipt) if receipt.success => {
                self.set_phase(WithdrawalPhase::Submitted);
                tracing::info!(op_hash = %receipt.user_op_hash, tx_hash = %receipt.transaction_hash, "Withdrawal submitted");
                Ok(SubmitOutcome::Submitted(Submission {
                    op_hash: receipt.user_op_hash,
                    tx_hash: receipt.transaction_hash,
                    block_number: receipt.block_number,
                    chain_id: prepared.chain_id,
                }))
            }
            Ok(receipt) => {
                self.set_phase(WithdrawalPhase::Failed);
                Err(WithdrawalError::Reverted {
                    op_hash: receipt.user_op_hash,
                    reason: receipt.reason,
                })
            }
            Err(e) if e.is_cancellation() => {
                self.set_phase(WithdrawalPhase::Cancelled);
                tracing::debug!("Withdrawal declined by user");
                Ok(SubmitOutcome::Cancelled)
            }
            Err(source) => {
                self.set_phase(WithdrawalPhase::Failed);
                Err(WithdrawalError::Submission {
                    amount,
                    cross_chain,
                    source,
                })
            }
        }
    }

    fn cancelled(&self) -> WithdrawalError {
        self.set_phase(WithdrawalPhase::Idle);
        tracing::debug!("Withdrawal preparation cancelled");
        WithdrawalError::Cancelled
    }

    fn withdrawal_payload(&self, valid: &ValidatedWithdrawal) -> Result<Withdrawal, WithdrawalError> {
        Ok(match valid.route {
            Route::SameChain => same_chain_withdrawal(
                self.entrypoint,
                valid.recipient,
                self.fee_recipient,
                self.fees.relay_fee_bps,
            ),
            Route::CrossChain {
                destination_chain_id,
            } => {
                let destination = u32::try_from(destination_chain_id)
                    .map_err(|_| ValidationError::DestinationChain(destination_chain_id))?;
                cross_chain_withdrawal(
                    self.entrypoint,
                    destination,
                    valid.recipient,
                    self.fee_recipient,
                    self.fees.relay_fee_bps,
                    self.fees.solver_fee_bps,
                )
            }
        })
    }

    /// State-tree leaves and approved labels, fetched together.
    async fn pool_state(&self, pool: &PoolConfig) -> Result<(Vec<U256>, Vec<U256>), RemoteLogError> {
        let leaves = all_state_leaves(self.log.as_ref(), pool.address, self.leaf_page_size);
        let labels = async {
            let root = self.log.asp_root(pool.scope).await?;
            self.log.asp_labels(&root.cid).await
        };
        tokio::try_join!(leaves, labels)
    }

    async fn relay_call(&self, call: &Call) -> Result<OperationReceipt, RelayError> {
        let draft = self.relay.draft_operation(call).await?;
        let stub = self.paymaster.stub_data(&draft).await?;
        let mut op = self.relay.prepare_operation(draft, &stub).await?;
        let sponsorship = self.paymaster.sponsorship_data(&op).await?;
        op.apply_paymaster(&sponsorship);

        let op_hash = self.relay.send_operation(&op).await?;
        tracing::debug!(%op_hash, "User operation sent");
        self.relay.wait_for_receipt(op_hash, self.receipt_timeout).await
    }
}

#[allow(clippy::too_many_arguments)]
fn proof_inputs(
    note: &Note,
    existing: &NoteSecrets,
    change: &NoteSecrets,
    refund: Option<&NoteSecrets>,
    amount: U256,
    context: U256,
    leaves: &[U256],
    labels: &[U256],
) -> WithdrawalProofInputs {
    let decimal = |f| field_to_u256(f).to_string();
    WithdrawalProofInputs {
        existing_commitment: note.commitment.to_string(),
        existing_value: note.amount.to_string(),
        existing_nullifier: decimal(existing.nullifier()),
        existing_secret: decimal(existing.secret()),
        withdrawn_value: amount.to_string(),
        context: context.to_string(),
        label: note.label.to_string(),
        new_nullifier: decimal(change.nullifier()),
        new_secret: decimal(change.secret()),
        refund_nullifier: refund.map(|r| decimal(r.nullifier())),
        refund_secret: refund.map(|r| decimal(r.secret())),
        state_tree_leaves: leaves.iter().map(U256::to_string).collect(),
        asp_labels: labels.iter().map(U256::to_string).collect(),
    }
}
