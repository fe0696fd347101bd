//! Key derivation for the three unlock factors
//!
//! All derivations are deterministic, so any device holding the factor can
//! recover the record key without a server.

use std::fmt;

use alloy_primitives::Address;
use argon2::{Algorithm, Argon2, Params, Version};
use hkdf::Hkdf;
use k256::ecdsa::Signature;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::VaultError;

pub const KEY_LEN: usize = 32;

const PASSKEY_INFO: &[u8] = b"tidepool/vault/passkey/v1";
const WALLET_INFO: &[u8] = b"tidepool/vault/wallet/v1";

// OWASP baseline for Argon2id
const ARGON2_MEMORY_KIB: u32 = 19_456;
const ARGON2_ITERATIONS: u32 = 2;
const ARGON2_LANES: u32 = 1;

/// AES-256 key bound to one account. Wiped on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; KEY_LEN]);

impl SymmetricKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey(<redacted>)")
    }
}

pub enum Factor<'a> {
    /// PRF extension output of a passkey assertion, bound to its credential id.
    Passkey {
        credential_id: &'a [u8],
        prf_output: &'a [u8],
    },
    /// 65 byte `r || s || v` signature over the unlock message.
    WalletSignature {
        signature: &'a [u8],
        chain_id: u64,
        address: Address,
    },
    Password {
        password: &'a str,
        salt: &'a [u8],
    },
}

pub fn derive_key(factor: Factor<'_>) -> Result<SymmetricKey, VaultError> {
    match factor {
        Factor::Passkey {
            credential_id,
            prf_output,
        } => expand(prf_output, credential_id, PASSKEY_INFO),
        Factor::WalletSignature {
            signature,
            chain_id,
            address,
        } => {
            let canonical = canonical_signature(signature)?;
            let mut salt = Vec::with_capacity(8 + 20);
            salt.extend_from_slice(&chain_id.to_be_bytes());
            salt.extend_from_slice(address.as_slice());
            expand(canonical.as_slice(), &salt, WALLET_INFO)
        }
        Factor::Password { password, salt } => password_key(password, salt),
    }
}

fn expand(ikm: &[u8], salt: &[u8], info: &[u8]) -> Result<SymmetricKey, VaultError> {
    if ikm.is_empty() {
        return Err(VaultError::KeyDerivation("empty key material".into()));
    }
    let hkdf = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = [0u8; KEY_LEN];
    hkdf.expand(info, &mut okm)
        .map_err(|e| VaultError::KeyDerivation(e.to_string()))?;
    Ok(SymmetricKey(okm))
}

/// Parse `r || s [|| v]`, fold the high-s twin onto low-s and drop `v`.
///
/// Both `(r, s)` and `(r, n - s)` verify for the same message, so keying
/// off raw signature bytes would yield two different vault keys for one
/// wallet.
pub fn canonical_signature(signature: &[u8]) -> Result<Zeroizing<Vec<u8>>, VaultError> {
    if signature.len() != 64 && signature.len() != 65 {
        return Err(VaultError::KeyDerivation(format!(
            "signature must be 64 or 65 bytes, got {}",
            signature.len()
        )));
    }

    let parsed = Signature::from_slice(&signature[..64])
        .map_err(|e| VaultError::KeyDerivation(format!("malformed signature: {e}")))?;
    let normalized = parsed.normalize_s().unwrap_or(parsed);

    Ok(Zeroizing::new(normalized.to_bytes().to_vec()))
}

fn password_key(password: &str, salt: &[u8]) -> Result<SymmetricKey, VaultError> {
    if password.is_empty() {
        return Err(VaultError::KeyDerivation("empty password".into()));
    }

    let params = Params::new(
        ARGON2_MEMORY_KIB,
        ARGON2_ITERATIONS,
        ARGON2_LANES,
        Some(KEY_LEN),
    )
    .map_err(|e| VaultError::KeyDerivation(format!("argon2 params: {e}")))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut out = [0u8; KEY_LEN];
    argon2
        .hash_password_into(password.as_bytes(), salt, &mut out)
        .map_err(|e| VaultError::KeyDerivation(format!("argon2: {e}")))?;

    Ok(SymmetricKey(out))
}
