use rand::RngCore;
use serde::{Deserialize, Serialize};
use tidepool_core::keys::{generate_mnemonic, parse_mnemonic, signer_address, DerivedKeys};
use tidepool_core::utils::keccak256;
use tidepool_core::{AccountKey, MasterKeys};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use alloy_primitives::Address;
use k256::ecdsa::SigningKey;

use crate::error::VaultError;

const PAYLOAD_VERSION: u8 = 1;
const EPHEMERAL_SEED_BYTES: usize = 32;

/// Plaintext inside an encrypted record.
///
/// Accounts carry either a mnemonic or, for passkey-only accounts that never
/// showed a recovery phrase, a raw random seed.
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(rename_all = "camelCase")]
pub struct CredentialPayload {
    version: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mnemonic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    seed: Option<String>,
}

impl CredentialPayload {
    pub fn generate() -> Result<Self, VaultError> {
        let mnemonic = generate_mnemonic()?;
        Ok(Self::with_mnemonic(&mnemonic.to_string()))
    }

    pub fn with_mnemonic(phrase: &str) -> Self {
        Self {
            version: PAYLOAD_VERSION,
            mnemonic: Some(phrase.to_string()),
            seed: None,
        }
    }

    pub fn ephemeral() -> Self {
        let mut seed = Zeroizing::new([0u8; EPHEMERAL_SEED_BYTES]);
        rand::thread_rng().fill_bytes(seed.as_mut());
        Self {
            version: PAYLOAD_VERSION,
            mnemonic: None,
            seed: Some(hex::encode(seed.as_ref())),
        }
    }

    pub fn to_bytes(&self) -> Result<Zeroizing<Vec<u8>>, VaultError> {
        serde_json::to_vec(self)
            .map(Zeroizing::new)
            .map_err(|e| VaultError::Payload(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, VaultError> {
        let payload: Self =
            serde_json::from_slice(bytes).map_err(|e| VaultError::Payload(e.to_string()))?;
        if payload.version != PAYLOAD_VERSION {
            return Err(VaultError::Payload(format!(
                "unsupported payload version {}",
                payload.version
            )));
        }
        Ok(payload)
    }
}

/// Decrypted account material, alive only inside an unlocked session.
pub struct AccountCredential {
    mnemonic: Option<Zeroizing<String>>,
    keys: DerivedKeys,
}

impl AccountCredential {
    pub fn from_payload(payload: &CredentialPayload) -> Result<Self, VaultError> {
        match (&payload.mnemonic, &payload.seed) {
            (Some(phrase), _) => {
                let mnemonic = parse_mnemonic(phrase)?;
                Ok(Self {
                    keys: DerivedKeys::from_mnemonic(&mnemonic)?,
                    mnemonic: Some(Zeroizing::new(phrase.clone())),
                })
            }
            (None, Some(seed_hex)) => {
                let seed = Zeroizing::new(
                    hex::decode(seed_hex).map_err(|e| VaultError::Payload(e.to_string()))?,
                );
                Ok(Self {
                    keys: DerivedKeys::from_seed(&seed)?,
                    mnemonic: None,
                })
            }
            (None, None) => Err(VaultError::Payload("payload holds no key material".into())),
        }
    }

    pub fn mnemonic(&self) -> Option<&str> {
        self.mnemonic.as_ref().map(|m| m.as_str())
    }

    pub fn account_key(&self) -> &AccountKey {
        &self.keys.account_key
    }

    pub fn master_keys(&self) -> MasterKeys {
        self.keys.account_key.master_keys()
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.keys.signing_key
    }

    pub fn public_key(&self) -> String {
        self.keys.public_key_hex()
    }

    pub fn address(&self) -> Address {
        signer_address(&self.keys.signing_key)
    }

    /// Stable id for password and passkey accounts.
    pub fn local_account_id(&self) -> String {
        let digest = keccak256(&[self.public_key().as_bytes()]);
        format!("acct-{}", hex::encode(&digest[..8]))
    }
}
