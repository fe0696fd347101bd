//! Withdrawal proofs
//!
//! Proving happens out of process; this module owns the request shape, the
//! snarkjs response shape, and its conversion to the entrypoint's calldata
//! types.
//!
//! Public signal layout (protocol fixed):
//!
//! | position | same-chain        | cross-chain       |
//! |----------|-------------------|-------------------|
//! | 0        | new commitment    | new commitment    |
//! | 1        | nullifier hash    | nullifier hash    |
//! | 2        | withdrawn value   | refund commitment |
//! | 3        | state root        | withdrawn value   |
//! | 4        | state depth       | state root        |
//! | 5        | ASP root          | state depth       |
//! | 6        | ASP depth         | ASP root          |
//! | 7        | context           | ASP depth         |
//! | 8        |                   | context           |

use std::str::FromStr;

use alloy_primitives::U256;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tidepool_core::abi::{CrosschainWithdrawProof, WithdrawProof};
use tidepool_core::{CROSS_CHAIN_SIGNALS, SAME_CHAIN_SIGNALS};
use zeroize::{Zeroize, ZeroizeOnDrop};

#[derive(Debug, Error)]
pub enum ProofError {
    #[error("Prover rejected the request: {0}")]
    Generator(String),

    #[error("Expected {expected} public signals, got {actual}")]
    SignalCount { expected: usize, actual: usize },

    #[error("Public signal {name} does not match the request")]
    SignalMismatch { name: &'static str },

    #[error("Malformed proof: {0}")]
    Malformed(String),

    #[error("HTTP error: {0}")]
    Http(String),
}

/// Circuit inputs, every field element as a decimal string.
///
/// Holds note secrets; wiped on drop.
#[derive(Clone, Default, Serialize, Zeroize, ZeroizeOnDrop)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawalProofInputs {
    pub existing_commitment: String,
    pub existing_value: String,
    pub existing_nullifier: String,
    pub existing_secret: String,
    pub withdrawn_value: String,
    pub context: String,
    pub label: String,
    pub new_nullifier: String,
    pub new_secret: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refund_nullifier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refund_secret: Option<String>,
    pub state_tree_leaves: Vec<String>,
    pub asp_labels: Vec<String>,
}

impl std::fmt::Debug for WithdrawalProofInputs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WithdrawalProofInputs")
            .field("existing_commitment", &self.existing_commitment)
            .field("withdrawn_value", &self.withdrawn_value)
            .field("leaves", &self.state_tree_leaves.len())
            .finish_non_exhaustive()
    }
}

/// snarkjs proof, affine coordinates as decimal strings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Groth16Proof {
    pub pi_a: Vec<String>,
    pub pi_b: Vec<Vec<String>>,
    pub pi_c: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofResponse {
    pub proof: Groth16Proof,
    #[serde(rename = "publicSignals", alias = "public_signals")]
    pub public_signals: Vec<String>,
}

#[async_trait]
pub trait ProofGenerator: Send + Sync {
    async fn generate_withdrawal_proof(
        &self,
        inputs: &WithdrawalProofInputs,
    ) -> Result<ProofResponse, ProofError>;

    async fn generate_crosschain_withdrawal_proof(
        &self,
        inputs: &WithdrawalProofInputs,
    ) -> Result<ProofResponse, ProofError>;
}

/// Proof points and signals as `uint256`, ready for calldata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SolidityProof {
    pub a: [U256; 2],
    pub b: [[U256; 2]; 2],
    pub c: [U256; 2],
    pub signals: Vec<U256>,
}

impl SolidityProof {
    pub fn from_response(response: &ProofResponse, expected_signals: usize) -> Result<Self, ProofError> {
        if response.public_signals.len() != expected_signals {
            return Err(ProofError::SignalCount {
                expected: expected_signals,
                actual: response.public_signals.len(),
            });
        }

        let proof = &response.proof;
        let a = point(&proof.pi_a, "pi_a")?;
        let c = point(&proof.pi_c, "pi_c")?;
        if proof.pi_b.len() < 2 {
            return Err(ProofError::Malformed("pi_b needs two coordinates".into()));
        }
        let bx = point(&proof.pi_b[0], "pi_b.x")?;
        let by = point(&proof.pi_b[1], "pi_b.y")?;

        let signals = response
            .public_signals
            .iter()
            .map(|s| decimal(s, "public signal"))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            a,
            // snarkjs soliditycalldata format for proof.B: [[x.c1, x.c0], [y.c1, y.c0]]
            b: [[bx[1], bx[0]], [by[1], by[0]]],
            c,
            signals,
        })
    }

    pub fn new_commitment(&self) -> U256 {
        self.signals[0]
    }

    pub fn nullifier_hash(&self) -> U256 {
        self.signals[1]
    }

    pub fn withdrawn_value(&self) -> U256 {
        if self.is_cross_chain() {
            self.signals[3]
        } else {
            self.signals[2]
        }
    }

    pub fn refund_commitment(&self) -> Option<U256> {
        self.is_cross_chain().then(|| self.signals[2])
    }

    pub fn context(&self) -> U256 {
        self.signals[self.signals.len() - 1]
    }

    fn is_cross_chain(&self) -> bool {
        self.signals.len() == CROSS_CHAIN_SIGNALS
    }

    /// Reject a proof for anything other than what was asked.
    pub fn check(&self, nullifier_hash: U256, withdrawn: U256, context: U256) -> Result<(), ProofError> {
        if self.nullifier_hash() != nullifier_hash {
            return Err(ProofError::SignalMismatch { name: "nullifier hash" });
        }
        if self.withdrawn_value() != withdrawn {
            return Err(ProofError::SignalMismatch { name: "withdrawn value" });
        }
        if self.context() != context {
            return Err(ProofError::SignalMismatch { name: "context" });
        }
        Ok(())
    }

    pub fn same_chain(&self) -> Result<WithdrawProof, ProofError> {
        let signals: [U256; SAME_CHAIN_SIGNALS] =
            self.signals.clone().try_into().map_err(|s: Vec<U256>| ProofError::SignalCount {
                expected: SAME_CHAIN_SIGNALS,
                actual: s.len(),
            })?;
        Ok(WithdrawProof {
            pA: self.a,
            pB: self.b,
            pC: self.c,
            pubSignals: signals,
        })
    }

    pub fn cross_chain(&self) -> Result<CrosschainWithdrawProof, ProofError> {
        let signals: [U256; CROSS_CHAIN_SIGNALS] =
            self.signals.clone().try_into().map_err(|s: Vec<U256>| ProofError::SignalCount {
                expected: CROSS_CHAIN_SIGNALS,
                actual: s.len(),
            })?;
        Ok(CrosschainWithdrawProof {
            pA: self.a,
            pB: self.b,
            pC: self.c,
            pubSignals: signals,
        })
    }
}

fn point(coords: &[String], name: &str) -> Result<[U256; 2], ProofError> {
    // snarkjs appends the projective z coordinate; only x and y matter
    if coords.len() < 2 {
        return Err(ProofError::Malformed(format!("{name} needs two coordinates")));
    }
    Ok([decimal(&coords[0], name)?, decimal(&coords[1], name)?])
}

fn decimal(raw: &str, name: &str) -> Result<U256, ProofError> {
    U256::from_str(raw).map_err(|e| ProofError::Malformed(format!("{name}: {e}")))
}

/// `ProofGenerator` backed by a remote proving service.
pub struct HttpProofGenerator {
    base_url: String,
    http: reqwest::Client,
}

impl HttpProofGenerator {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    async fn post(&self, path: &str, inputs: &WithdrawalProofInputs) -> Result<ProofResponse, ProofError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .post(&url)
            .json(inputs)
            .send()
            .await
            .map_err(|e| ProofError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProofError::Generator(format!("{status}: {body}")));
        }

        response
            .json()
            .await
            .map_err(|e| ProofError::Malformed(e.to_string()))
    }
}

#[async_trait]
impl ProofGenerator for HttpProofGenerator {
    async fn generate_withdrawal_proof(
        &self,
        inputs: &WithdrawalProofInputs,
    ) -> Result<ProofResponse, ProofError> {
        self.post("/withdraw", inputs).await
    }

    async fn generate_crosschain_withdrawal_proof(
        &self,
        inputs: &WithdrawalProofInputs,
    ) -> Result<ProofResponse, ProofError> {
        self.post("/withdraw/crosschain", inputs).await
    }
}
