//! Credential vault for tidepool accounts
//!
//! ```text
//!  passkey PRF ─┐
//!  wallet sig  ─┼─> derive_key ─> SymmetricKey ─> AES-256-GCM ─> sled `records`
//!  password    ─┘                      │
//!                                      └─> SessionCell ─> SessionHandle
//! ```
//!
//! Secrets exist in plaintext only inside the active session and are wiped
//! on logout.

pub mod cipher;
pub mod credential;
pub mod error;
pub mod kdf;
pub mod passkey;
pub mod session;
pub mod store;
pub mod vault;

pub use cipher::EncryptedRecord;
pub use credential::{AccountCredential, CredentialPayload};
pub use error::{SessionError, VaultError, VaultResult};
pub use kdf::{derive_key, Factor, SymmetricKey};
pub use passkey::{PasskeyAuthenticator, PasskeyError, PasskeyMetadata};
pub use session::SessionHandle;
pub use store::{AuthMethod, LocalStore, ResumePointer, StoreError};
pub use vault::{wallet_account_id, Vault, MAX_DECRYPT_FAILURES, WALLET_UNLOCK_MESSAGE};
