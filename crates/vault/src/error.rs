use thiserror::Error;
use tidepool_core::keys::KeyError;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Authentication cancelled by user")]
    Cancelled,

    #[error("Decryption failed for account {account_id}")]
    Decryption { account_id: String },

    #[error("Re-authentication required for account {account_id} after {failures} failed attempts")]
    ReauthenticationRequired { account_id: String, failures: u32 },

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("No record for account {0}")]
    AccountNotFound(String),

    #[error("Account {0} already exists")]
    AccountExists(String),

    #[error("No passkey registered for account {0}")]
    PasskeyNotRegistered(String),

    #[error("Invalid credential payload: {0}")]
    Payload(String),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl VaultError {
    /// Factor failures never invalidate stored records; the user can retry.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::KeyDerivation(_)
            | Self::Cancelled
            | Self::Decryption { .. }
            | Self::ReauthenticationRequired { .. }
            | Self::AccountNotFound(_)
            | Self::PasskeyNotRegistered(_) => true,
            Self::Session(SessionError::AlreadyActive { .. }) => true,
            Self::Session(_) => false,
            Self::AccountExists(_)
            | Self::Encryption(_)
            | Self::Payload(_)
            | Self::Key(_)
            | Self::Store(_) => false,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Session for {active} is active; log out before unlocking {requested}")]
    AlreadyActive { active: String, requested: String },

    #[error("Session has ended")]
    Expired,
}

pub type VaultResult<T> = Result<T, VaultError>;
