use alloy_primitives::B256;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::error::VaultError;

#[derive(Debug, Error)]
pub enum PasskeyError {
    #[error("User cancelled the passkey prompt")]
    Cancelled,

    #[error("Authenticator rejected the assertion: {0}")]
    Rejected(String),

    #[error("Authenticator does not support the PRF extension")]
    PrfUnsupported,
}

impl From<PasskeyError> for VaultError {
    fn from(err: PasskeyError) -> Self {
        match err {
            PasskeyError::Cancelled => VaultError::Cancelled,
            other => VaultError::KeyDerivation(other.to_string()),
        }
    }
}

/// Platform authenticator evaluating the WebAuthn PRF extension.
///
/// Implementations prompt the user, so calls may take arbitrarily long or be
/// cancelled.
#[async_trait]
pub trait PasskeyAuthenticator: Send + Sync {
    async fn assert_prf(
        &self,
        credential_id: &[u8],
        salt: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, PasskeyError>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PasskeyMetadata {
    #[serde(with = "hex::serde")]
    pub credential_id: Vec<u8>,
    pub public_key_hash: B256,
    pub created_at: u64,
}

impl PasskeyMetadata {
    pub fn new(credential_id: &[u8], public_key: &[u8], created_at: u64) -> Self {
        Self {
            credential_id: credential_id.to_vec(),
            public_key_hash: B256::from_slice(&Keccak256::digest(public_key)),
            created_at,
        }
    }
}
