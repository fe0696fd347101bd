use std::fmt;

use alloy_primitives::Address;
use bip39::{Language, Mnemonic};
use k256::ecdsa::SigningKey;
use rand::RngCore;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::poseidon::hash2;
use crate::utils::{keccak256, keccak_to_field};
use crate::Field;

const ACCOUNT_KEY_DOMAIN: &[u8] = b"tidepool/account";
const SIGNING_KEY_DOMAIN: &[u8] = b"tidepool/signing";

/// Entropy size for generated mnemonics (12 words)
pub const MNEMONIC_ENTROPY_BYTES: usize = 16;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("Invalid mnemonic: {0}")]
    InvalidMnemonic(String),

    #[error("Seed does not map to a valid secp256k1 scalar")]
    InvalidSigningKey,
}

/// Root scalar of every note derivation for one account.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct AccountKey(Field);

impl AccountKey {
    pub fn from_field(value: Field) -> Self {
        Self(value)
    }

    /// account_key = keccak256("tidepool/account" || seed) mod r
    pub fn from_seed(seed: &[u8]) -> Self {
        let mut preimage = Zeroizing::new(Vec::with_capacity(ACCOUNT_KEY_DOMAIN.len() + seed.len()));
        preimage.extend_from_slice(ACCOUNT_KEY_DOMAIN);
        preimage.extend_from_slice(seed);
        Self(keccak_to_field(&preimage))
    }

    pub fn as_field(&self) -> Field {
        self.0
    }

    /// Split into the two master keys:
    /// master_nullifier = Poseidon(key, 1), master_secret = Poseidon(key, 2)
    pub fn master_keys(&self) -> MasterKeys {
        MasterKeys {
            nullifier: hash2(self.0, Field::from(1u64)),
            secret: hash2(self.0, Field::from(2u64)),
        }
    }
}

impl fmt::Debug for AccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccountKey(<redacted>)")
    }
}

#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKeys {
    nullifier: Field,
    secret: Field,
}

impl MasterKeys {
    pub fn nullifier(&self) -> Field {
        self.nullifier
    }

    pub fn secret(&self) -> Field {
        self.secret
    }
}

impl fmt::Debug for MasterKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKeys(<redacted>)")
    }
}

/// Everything an account derives from its seed.
pub struct DerivedKeys {
    pub account_key: AccountKey,
    pub signing_key: SigningKey,
}

impl DerivedKeys {
    pub fn from_mnemonic(mnemonic: &Mnemonic) -> Result<Self, KeyError> {
        let seed = Zeroizing::new(mnemonic.to_seed(""));
        Self::from_seed(seed.as_slice())
    }

    pub fn from_seed(seed: &[u8]) -> Result<Self, KeyError> {
        let signing_bytes = Zeroizing::new(keccak256(&[SIGNING_KEY_DOMAIN, seed]));
        let signing_key = SigningKey::from_slice(signing_bytes.as_slice())
            .map_err(|_| KeyError::InvalidSigningKey)?;

        Ok(Self {
            account_key: AccountKey::from_seed(seed),
            signing_key,
        })
    }

    /// Compressed SEC1 public key, hex encoded. Used as the cache key for
    /// discovery results.
    pub fn public_key_hex(&self) -> String {
        public_key_hex(&self.signing_key)
    }
}

pub fn public_key_hex(signing_key: &SigningKey) -> String {
    let point = signing_key.verifying_key().to_encoded_point(true);
    hex::encode(point.as_bytes())
}

/// Ethereum address of a secp256k1 key.
pub fn signer_address(signing_key: &SigningKey) -> Address {
    let point = signing_key.verifying_key().to_encoded_point(false);
    let hash = keccak256(&[&point.as_bytes()[1..]]);
    Address::from_slice(&hash[12..])
}

pub fn generate_mnemonic() -> Result<Mnemonic, KeyError> {
    let mut entropy = Zeroizing::new([0u8; MNEMONIC_ENTROPY_BYTES]);
    rand::thread_rng().fill_bytes(entropy.as_mut());
    Mnemonic::from_entropy_in(Language::English, entropy.as_ref())
        .map_err(|e| KeyError::InvalidMnemonic(e.to_string()))
}

pub fn parse_mnemonic(phrase: &str) -> Result<Mnemonic, KeyError> {
    Mnemonic::parse_in_normalized(Language::English, phrase)
        .map_err(|e| KeyError::InvalidMnemonic(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_MNEMONIC: &str =
        "test test test test test test test test test test test junk";

    #[test]
    fn test_mnemonic_derivation_deterministic() {
        let mnemonic = parse_mnemonic(TEST_MNEMONIC).unwrap();
        let a = DerivedKeys::from_mnemonic(&mnemonic).unwrap();
        let b = DerivedKeys::from_mnemonic(&mnemonic).unwrap();

        assert_eq!(a.account_key, b.account_key);
        assert_eq!(a.public_key_hex(), b.public_key_hex());
    }

    #[test]
    fn test_master_keys_are_domain_separated() {
        let key = AccountKey::from_field(Field::from(99u64));
        let master = key.master_keys();

        assert_ne!(master.nullifier(), master.secret());
        assert_ne!(master.nullifier(), key.as_field());
    }

    #[test]
    fn test_account_and_signing_keys_differ_per_seed() {
        let a = DerivedKeys::from_seed(&[1u8; 32]).unwrap();
        let b = DerivedKeys::from_seed(&[2u8; 32]).unwrap();

        assert_ne!(a.account_key, b.account_key);
        assert_ne!(signer_address(&a.signing_key), signer_address(&b.signing_key));
    }

    #[test]
    fn test_generated_mnemonic_is_twelve_words() {
        let mnemonic = generate_mnemonic().unwrap();
        assert_eq!(mnemonic.word_count(), 12);
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let key = AccountKey::from_field(Field::from(5u64));
        assert_eq!(format!("{:?}", key), "AccountKey(<redacted>)");
    }

    #[test]
    fn test_invalid_mnemonic_rejected() {
        assert!(parse_mnemonic("not a real phrase").is_err());
    }
}
