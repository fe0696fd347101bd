use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::VaultError;
use crate::kdf::SymmetricKey;

pub const IV_LEN: usize = 12;
pub const SALT_LEN: usize = 16;

/// Ciphertext at rest. The account id is authenticated as associated data,
/// so a record copied under another id will not open.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedRecord {
    #[serde(with = "hex::serde")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "hex::serde")]
    pub iv: [u8; IV_LEN],
    #[serde(with = "hex::serde")]
    pub salt: [u8; SALT_LEN],
}

pub fn random_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

pub fn encrypt(
    plaintext: &[u8],
    key: &SymmetricKey,
    account_id: &str,
    salt: [u8; SALT_LEN],
) -> Result<EncryptedRecord, VaultError> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| VaultError::Encryption(e.to_string()))?;

    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);

    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&iv),
            Payload {
                msg: plaintext,
                aad: account_id.as_bytes(),
            },
        )
        .map_err(|e| VaultError::Encryption(e.to_string()))?;

    Ok(EncryptedRecord {
        ciphertext,
        iv,
        salt,
    })
}

/// Fails closed: a wrong key, a tampered byte or a foreign account id all
/// yield `Decryption` and no plaintext.
pub fn decrypt(
    record: &EncryptedRecord,
    key: &SymmetricKey,
    account_id: &str,
) -> Result<Zeroizing<Vec<u8>>, VaultError> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| VaultError::Encryption(e.to_string()))?;

    cipher
        .decrypt(
            Nonce::from_slice(&record.iv),
            Payload {
                msg: &record.ciphertext,
                aad: account_id.as_bytes(),
            },
        )
        .map(Zeroizing::new)
        .map_err(|_| VaultError::Decryption {
            account_id: account_id.to_string(),
        })
}
