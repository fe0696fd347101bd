//! Gas-sponsored submission through ERC-4337
//!
//! A withdrawal is wrapped in a smart account `execute` call, estimated with
//! paymaster stub data, sponsored with real paymaster data, signed and sent
//! to a bundler.
//!
//! ```text
//! Call ─> draft_operation ─> stub_data ─> prepare_operation ─> sponsorship_data
//!                                                                   │
//!        wait_for_receipt <─ send_operation (signs) <───────────────┘
//! ```

use std::time::Duration;

use alloy_primitives::{Address, Bytes, B256, U256};
use alloy_sol_types::SolCall;
use async_trait::async_trait;
use k256::ecdsa::SigningKey;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tidepool_core::abi::{executeCall, getNonceCall};
use tidepool_core::utils::keccak256;

use crate::rpc::{parse_hex_u64, JsonRpcClient, RpcError};

const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("User rejected the request: {0}")]
    UserRejected(String),

    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("Operation reverted: {0}")]
    Reverted(String),

    #[error("Paymaster declined: {0}")]
    Paymaster(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("Malformed response: {0}")]
    Malformed(String),
}

impl RelayError {
    /// Sort an untyped failure message into a typed error.
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();
        if is_cancellation_text(&lower) {
            Self::UserRejected(message.to_string())
        } else if lower.contains("insufficient funds") || lower.contains("aa21") {
            Self::InsufficientFunds(message.to_string())
        } else if lower.contains("revert") || lower.contains("aa23") || lower.contains("aa24") {
            Self::Reverted(message.to_string())
        } else if lower.contains("paymaster") || lower.contains("aa3") {
            Self::Paymaster(message.to_string())
        } else {
            Self::Network(message.to_string())
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::UserRejected(_))
    }

    /// Only transport trouble is worth resending; everything else would fail
    /// the same way again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout(_))
    }
}

impl From<RpcError> for RelayError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Transport(msg) => Self::Network(msg),
            RpcError::MissingResult => Self::Network(err.to_string()),
            RpcError::ParseFailed(msg) => Self::Malformed(msg),
            RpcError::Rpc { ref message, .. } => Self::classify(message),
        }
    }
}

/// Phrases wallets and bundlers use for a user-declined prompt.
pub fn is_cancellation_text(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("user rejected") || lower.contains("user denied") || lower.contains("cancelled")
}

/// Contract call the smart account should execute.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Call {
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
}

/// ERC-4337 v0.7 user operation in its JSON-RPC form.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperation {
    pub sender: Address,
    pub nonce: U256,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factory: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factory_data: Option<Bytes>,
    pub call_data: Bytes,
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paymaster: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paymaster_verification_gas_limit: Option<U256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paymaster_post_op_gas_limit: Option<U256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paymaster_data: Option<Bytes>,
    pub signature: Bytes,
}

impl UserOperation {
    pub fn apply_paymaster(&mut self, data: &PaymasterData) {
        self.paymaster = Some(data.paymaster);
        self.paymaster_data = Some(data.paymaster_data.clone());
        if data.paymaster_verification_gas_limit.is_some() {
            self.paymaster_verification_gas_limit = data.paymaster_verification_gas_limit;
        }
        if data.paymaster_post_op_gas_limit.is_some() {
            self.paymaster_post_op_gas_limit = data.paymaster_post_op_gas_limit;
        }
    }

    /// Hash the entry point asks the account to sign.
    pub fn hash(&self, entry_point: Address, chain_id: u64) -> B256 {
        let init_code = match self.factory {
            Some(factory) => [
                factory.as_slice(),
                bytes_or_empty(&self.factory_data),
            ]
            .concat(),
            None => Vec::new(),
        };

        let paymaster_and_data = match self.paymaster {
            Some(paymaster) => {
                let mut bytes = paymaster.to_vec();
                bytes.extend_from_slice(&u128_bytes(self.paymaster_verification_gas_limit));
                bytes.extend_from_slice(&u128_bytes(self.paymaster_post_op_gas_limit));
                bytes.extend_from_slice(bytes_or_empty(&self.paymaster_data));
                bytes
            }
            None => Vec::new(),
        };

        let packed = [
            address_word(self.sender),
            self.nonce.to_be_bytes::<32>(),
            keccak256(&[init_code.as_slice()]),
            keccak256(&[self.call_data.as_ref()]),
            pack_u128_pair(self.verification_gas_limit, self.call_gas_limit),
            self.pre_verification_gas.to_be_bytes::<32>(),
            pack_u128_pair(self.max_priority_fee_per_gas, self.max_fee_per_gas),
            keccak256(&[paymaster_and_data.as_slice()]),
        ]
        .concat();

        let inner = keccak256(&[packed.as_slice()]);
        B256::from(keccak256(&[
            inner.as_slice(),
            address_word(entry_point).as_slice(),
            U256::from(chain_id).to_be_bytes::<32>().as_slice(),
        ]))
    }
}

fn bytes_or_empty(bytes: &Option<Bytes>) -> &[u8] {
    match bytes {
        Some(b) => b.as_ref(),
        None => &[],
    }
}

fn address_word(address: Address) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[12..].copy_from_slice(address.as_slice());
    word
}

fn u128_bytes(value: Option<U256>) -> [u8; 16] {
    let word = value.unwrap_or_default().to_be_bytes::<32>();
    let mut out = [0u8; 16];
    out.copy_from_slice(&word[16..]);
    out
}

fn pack_u128_pair(high: U256, low: U256) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[..16].copy_from_slice(&u128_bytes(Some(high)));
    word[16..].copy_from_slice(&u128_bytes(Some(low)));
    word
}

/// Paymaster fields to merge into an operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymasterData {
    pub paymaster: Address,
    pub paymaster_data: Bytes,
    #[serde(default)]
    pub paymaster_verification_gas_limit: Option<U256>,
    #[serde(default)]
    pub paymaster_post_op_gas_limit: Option<U256>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperationReceipt {
    pub user_op_hash: B256,
    pub success: bool,
    pub transaction_hash: B256,
    pub block_number: u64,
    pub reason: Option<String>,
}

#[async_trait]
pub trait Paymaster: Send + Sync {
    /// Placeholder data with realistic size, used only for gas estimation.
    async fn stub_data(&self, op: &UserOperation) -> Result<PaymasterData, RelayError>;

    /// Data that actually sponsors `op`; the gas fields must be final.
    async fn sponsorship_data(&self, op: &UserOperation) -> Result<PaymasterData, RelayError>;
}

#[async_trait]
pub trait RelayLayer: Send + Sync {
    /// Sender, nonce, call data and fee caps for `call`.
    async fn draft_operation(&self, call: &Call) -> Result<UserOperation, RelayError>;

    /// Apply the stub and fill in gas limits.
    async fn prepare_operation(
        &self,
        op: UserOperation,
        paymaster_stub: &PaymasterData,
    ) -> Result<UserOperation, RelayError>;

    /// Sign and send. Returns the user operation hash.
    async fn send_operation(&self, op: &UserOperation) -> Result<B256, RelayError>;

    async fn wait_for_receipt(
        &self,
        op_hash: B256,
        timeout: Duration,
    ) -> Result<OperationReceipt, RelayError>;
}

/// Owner key of the smart account. Signs the EIP-191 digest of the
/// operation hash.
pub struct LocalSigner {
    key: SigningKey,
}

impl LocalSigner {
    pub fn new(key: SigningKey) -> Self {
        Self { key }
    }

    pub fn sign_hash(&self, hash: B256) -> Result<Bytes, RelayError> {
        let digest = keccak256(&[b"\x19Ethereum Signed Message:\n32", hash.as_slice()]);
        let (signature, recovery_id) = self
            .key
            .sign_prehash_recoverable(&digest)
            .map_err(|e| RelayError::Signing(e.to_string()))?;

        let mut bytes = signature.to_bytes().to_vec();
        bytes.push(27 + recovery_id.to_byte());
        Ok(Bytes::from(bytes))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GasEstimate {
    pre_verification_gas: U256,
    verification_gas_limit: U256,
    call_gas_limit: U256,
    #[serde(default)]
    paymaster_verification_gas_limit: Option<U256>,
    #[serde(default)]
    paymaster_post_op_gas_limit: Option<U256>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceiptBody {
    user_op_hash: B256,
    success: bool,
    #[serde(default)]
    reason: Option<String>,
    receipt: InnerReceipt,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InnerReceipt {
    transaction_hash: B256,
    block_number: String,
}

/// `RelayLayer` talking to a bundler, with fee data from the node.
pub struct BundlerClient {
    node: JsonRpcClient,
    bundler: JsonRpcClient,
    entry_point: Address,
    chain_id: u64,
    sender: Address,
    signer: LocalSigner,
}

impl BundlerClient {
    pub fn new(
        node: JsonRpcClient,
        bundler: JsonRpcClient,
        entry_point: Address,
        chain_id: u64,
        sender: Address,
        signer: LocalSigner,
    ) -> Self {
        Self {
            node,
            bundler,
            entry_point,
            chain_id,
            sender,
            signer,
        }
    }

    async fn nonce(&self) -> Result<U256, RelayError> {
        let data = getNonceCall {
            sender: self.sender,
            key: Default::default(),
        }
        .abi_encode();
        let raw = self.node.eth_call(self.entry_point, data.into()).await?;
        let decoded = getNonceCall::abi_decode_returns(&raw)
            .map_err(|e| RelayError::Malformed(e.to_string()))?;
        Ok(decoded)
    }

    async fn fees(&self) -> Result<(U256, U256), RelayError> {
        let (gas_price, priority): (U256, U256) = tokio::try_join!(
            self.node.call::<U256>("eth_gasPrice", serde_json::json!([])),
            self.node.call::<U256>("eth_maxPriorityFeePerGas", serde_json::json!([])),
        )?;
        // headroom for one base fee doubling
        let max_fee = gas_price.saturating_mul(U256::from(2)).max(priority);
        Ok((max_fee, priority))
    }
}

#[async_trait]
impl RelayLayer for BundlerClient {
    async fn draft_operation(&self, call: &Call) -> Result<UserOperation, RelayError> {
        let (nonce, (max_fee, priority)) = tokio::try_join!(self.nonce(), self.fees())?;
        let call_data = executeCall {
            dest: call.to,
            value: call.value,
            func: call.data.clone(),
        }
        .abi_encode();

        Ok(UserOperation {
            sender: self.sender,
            nonce,
            call_data: call_data.into(),
            max_fee_per_gas: max_fee,
            max_priority_fee_per_gas: priority,
            ..Default::default()
        })
    }

    async fn prepare_operation(
        &self,
        mut op: UserOperation,
        paymaster_stub: &PaymasterData,
    ) -> Result<UserOperation, RelayError> {
        op.apply_paymaster(paymaster_stub);
        // estimation runs validation; give it a well-formed dummy signature
        op.signature = Bytes::from(vec![0xff; 65]);

        let estimate: GasEstimate = self
            .bundler
            .call(
                "eth_estimateUserOperationGas",
                serde_json::json!([op, self.entry_point]),
            )
            .await?;

        op.pre_verification_gas = estimate.pre_verification_gas;
        op.verification_gas_limit = estimate.verification_gas_limit;
        op.call_gas_limit = estimate.call_gas_limit;
        if estimate.paymaster_verification_gas_limit.is_some() {
            op.paymaster_verification_gas_limit = estimate.paymaster_verification_gas_limit;
        }
        if estimate.paymaster_post_op_gas_limit.is_some() {
            op.paymaster_post_op_gas_limit = estimate.paymaster_post_op_gas_limit;
        }
        op.signature = Bytes::new();
        Ok(op)
    }

    async fn send_operation(&self, op: &UserOperation) -> Result<B256, RelayError> {
        let mut signed = op.clone();
        signed.signature = self
            .signer
            .sign_hash(op.hash(self.entry_point, self.chain_id))?;

        let hash: B256 = self
            .bundler
            .call(
                "eth_sendUserOperation",
                serde_json::json!([signed, self.entry_point]),
            )
            .await?;
        tracing::info!(user_op_hash = %hash, "User operation sent");
        Ok(hash)
    }

    async fn wait_for_receipt(
        &self,
        op_hash: B256,
        timeout: Duration,
    ) -> Result<OperationReceipt, RelayError> {
        let poll = async {
            loop {
                let receipt: Option<ReceiptBody> = self
                    .bundler
                    .call("eth_getUserOperationReceipt", serde_json::json!([op_hash]))
                    .await?;
                if let Some(body) = receipt {
                    return Ok::<_, RelayError>(OperationReceipt {
                        user_op_hash: body.user_op_hash,
                        success: body.success,
                        transaction_hash: body.receipt.transaction_hash,
                        block_number: parse_hex_u64(&body.receipt.block_number)?,
                        reason: body.reason,
                    });
                }
                tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
            }
        };

        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| RelayError::Timeout(timeout))?
    }
}

/// ERC-7677 paymaster service.
pub struct PaymasterClient {
    rpc: JsonRpcClient,
    entry_point: Address,
    chain_id: u64,
}

impl PaymasterClient {
    pub fn new(rpc: JsonRpcClient, entry_point: Address, chain_id: u64) -> Self {
        Self {
            rpc,
            entry_point,
            chain_id,
        }
    }

    async fn request(&self, method: &str, op: &UserOperation) -> Result<PaymasterData, RelayError> {
        self.rpc
            .call(
                method,
                serde_json::json!([
                    op,
                    self.entry_point,
                    format!("0x{:x}", self.chain_id),
                    {}
                ]),
            )
            .await
            .map_err(|e| match RelayError::from(e) {
                RelayError::Network(msg) => RelayError::Network(msg),
                other => RelayError::Paymaster(other.to_string()),
            })
    }
}

#[async_trait]
impl Paymaster for PaymasterClient {
    async fn stub_data(&self, op: &UserOperation) -> Result<PaymasterData, RelayError> {
        self.request("pm_getPaymasterStubData", op).await
    }

    async fn sponsorship_data(&self, op: &UserOperation) -> Result<PaymasterData, RelayError> {
        self.request("pm_getPaymasterData", op).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_error_text() {
        assert!(RelayError::classify("User rejected the request.").is_cancellation());
        assert!(RelayError::classify("MetaMask: user denied transaction").is_cancellation());
        assert!(matches!(
            RelayError::classify("AA21 didn't pay prefund"),
            RelayError::InsufficientFunds(_)
        ));
        assert!(matches!(
            RelayError::classify("execution reverted: InvalidProof()"),
            RelayError::Reverted(_)
        ));
        assert!(RelayError::classify("connection reset").is_retryable());
    }

    #[test]
    fn test_rpc_transport_error_is_retryable() {
        let err = RelayError::from(RpcError::Transport("timeout".into()));
        assert!(err.is_retryable());
        assert!(!RelayError::Reverted("x".into()).is_retryable());
    }

    #[test]
    fn test_operation_hash_binds_chain_and_paymaster() {
        let mut op = UserOperation {
            sender: Address::repeat_byte(1),
            nonce: U256::from(3u64),
            call_data: Bytes::from(vec![1, 2, 3]),
            call_gas_limit: U256::from(100_000u64),
            verification_gas_limit: U256::from(200_000u64),
            pre_verification_gas: U256::from(50_000u64),
            max_fee_per_gas: U256::from(10u64),
            max_priority_fee_per_gas: U256::from(1u64),
            ..Default::default()
        };
        let entry_point = Address::repeat_byte(9);

        let base = op.hash(entry_point, 1);
        assert_eq!(base, op.hash(entry_point, 1));
        assert_ne!(base, op.hash(entry_point, 10));

        op.apply_paymaster(&PaymasterData {
            paymaster: Address::repeat_byte(7),
            paymaster_data: Bytes::from(vec![0xaa]),
            paymaster_verification_gas_limit: Some(U256::from(1u64)),
            paymaster_post_op_gas_limit: None,
        });
        assert_ne!(base, op.hash(entry_point, 1));
    }

    #[test]
    fn test_user_operation_json_shape() {
        let op = UserOperation {
            nonce: U256::from(1u64),
            ..Default::default()
        };
        let json = serde_json::to_value(&op).unwrap();

        assert_eq!(json["nonce"], "0x1");
        assert!(json.get("callData").is_some());
        assert!(json.get("paymaster").is_none());
    }

    #[test]
    fn test_signature_has_recovery_byte() {
        let signer = LocalSigner::new(SigningKey::from_slice(&[3u8; 32]).unwrap());
        let sig = signer.sign_hash(B256::repeat_byte(5)).unwrap();

        assert_eq!(sig.len(), 65);
        assert!(sig[64] == 27 || sig[64] == 28);
    }
}
