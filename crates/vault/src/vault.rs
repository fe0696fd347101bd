use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use alloy_primitives::Address;
use dashmap::DashMap;
use zeroize::Zeroizing;

use crate::cipher::{self, random_salt, EncryptedRecord, SALT_LEN};
use crate::credential::{AccountCredential, CredentialPayload};
use crate::error::{VaultError, VaultResult};
use crate::kdf::{derive_key, Factor, SymmetricKey};
use crate::passkey::{PasskeyAuthenticator, PasskeyMetadata};
use crate::session::{ActiveSession, SessionCell, SessionHandle};
use crate::store::{AuthMethod, LocalStore, ResumePointer};

/// Consecutive decrypt failures before the caller must re-authenticate.
pub const MAX_DECRYPT_FAILURES: u32 = 3;

/// Message a wallet signs to unlock. Changing it changes every wallet key.
pub const WALLET_UNLOCK_MESSAGE: &str =
    "Unlock tidepool\n\nSigning this message derives your vault key. It does not send a transaction.";

/// Chain-bound id of a wallet-signature account.
pub fn wallet_account_id(address: Address, chain_id: u64) -> String {
    format!("{address:#x}:chain-{chain_id}")
}

/// Gatekeeper for every piece of key material.
///
/// Records are only ever written, never deleted: a failed unlock leaves the
/// stored ciphertext exactly as it was.
pub struct Vault {
    store: Arc<LocalStore>,
    session: Arc<SessionCell>,
    failures: DashMap<String, u32>,
}

impl Vault {
    pub fn new(store: Arc<LocalStore>) -> Self {
        Self {
            store,
            session: Arc::new(SessionCell::default()),
            failures: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    /// Where the last unlock came from, readable without any key.
    pub fn resume_pointer(&self) -> VaultResult<Option<ResumePointer>> {
        Ok(self.store.resume()?)
    }

    pub async fn current_session(&self) -> Option<SessionHandle> {
        self.session.current().await
    }

    pub async fn initialize_session(
        &self,
        account_id: &str,
        key: SymmetricKey,
        credential: AccountCredential,
    ) -> VaultResult<SessionHandle> {
        let handle = self
            .session
            .install(ActiveSession {
                account_id: account_id.to_string(),
                key,
                credential,
            })
            .await?;
        tracing::info!(account_id, "Session initialized");
        Ok(handle)
    }

    /// Tear down the active session. Outstanding handles expire.
    pub async fn logout(&self) {
        if let Some(account_id) = self.session.teardown().await {
            tracing::info!(%account_id, "Session closed");
        }
    }

    pub fn encrypt(
        &self,
        plaintext: &[u8],
        key: &SymmetricKey,
        account_id: &str,
        salt: [u8; SALT_LEN],
    ) -> VaultResult<EncryptedRecord> {
        cipher::encrypt(plaintext, key, account_id, salt)
    }

    /// Decrypt with failure accounting. The third consecutive failure for an
    /// account turns into `ReauthenticationRequired`; the record is untouched.
    pub fn decrypt(
        &self,
        record: &EncryptedRecord,
        key: &SymmetricKey,
        account_id: &str,
    ) -> VaultResult<Zeroizing<Vec<u8>>> {
        match cipher::decrypt(record, key, account_id) {
            Ok(plaintext) => {
                self.failures.remove(account_id);
                Ok(plaintext)
            }
            Err(err) => {
                let failures = {
                    let mut count = self.failures.entry(account_id.to_string()).or_insert(0);
                    *count += 1;
                    *count
                };
                tracing::warn!(account_id, failures, "Record decryption failed");
                if failures >= MAX_DECRYPT_FAILURES {
                    Err(VaultError::ReauthenticationRequired {
                        account_id: account_id.to_string(),
                        failures,
                    })
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Write a new wallet account and unlock it as one unit.
    ///
    /// The record goes to the staging tree first, then the session is
    /// installed, then the staged record is committed. A failure at any step
    /// rolls back the steps before it.
    pub async fn setup_wallet_account_transaction(
        &self,
        account_id: &str,
        key: SymmetricKey,
        payload: &CredentialPayload,
    ) -> VaultResult<SessionHandle> {
        self.setup_account(account_id, key, payload, random_salt(), AuthMethod::Wallet, None)
            .await
    }

    async fn setup_account(
        &self,
        account_id: &str,
        key: SymmetricKey,
        payload: &CredentialPayload,
        salt: [u8; SALT_LEN],
        method: AuthMethod,
        passkey: Option<&PasskeyMetadata>,
    ) -> VaultResult<SessionHandle> {
        let credential = AccountCredential::from_payload(payload)?;
        let plaintext = payload.to_bytes()?;
        let record = self.encrypt(&plaintext, &key, account_id, salt)?;

        self.store.stage_record(account_id, &record)?;

        let handle = match self.initialize_session(account_id, key, credential).await {
            Ok(handle) => handle,
            Err(err) => {
                self.discard_quietly(account_id);
                return Err(err);
            }
        };

        if let Err(err) = self.store.commit_staged(account_id, passkey) {
            self.session.teardown_if(&handle).await;
            self.discard_quietly(account_id);
            return Err(err.into());
        }

        self.record_resume(account_id, method);
        tracing::info!(account_id, ?method, "Account created");
        Ok(handle)
    }

    fn discard_quietly(&self, account_id: &str) {
        if let Err(err) = self.store.discard_staged(account_id) {
            tracing::warn!(account_id, %err, "Failed to discard staged record");
        }
    }

    fn record_resume(&self, account_id: &str, auth_method: AuthMethod) {
        let pointer = ResumePointer {
            account_id: account_id.to_string(),
            auth_method,
            last_auth_at: now_secs(),
        };
        if let Err(err) = self.store.set_resume(&pointer) {
            tracing::warn!(account_id, %err, "Failed to update resume pointer");
        }
    }

    async fn unlock(
        &self,
        account_id: &str,
        record: &EncryptedRecord,
        key: SymmetricKey,
        method: AuthMethod,
    ) -> VaultResult<SessionHandle> {
        let plaintext = self.decrypt(record, &key, account_id)?;
        let payload = CredentialPayload::from_bytes(&plaintext)?;
        let credential = AccountCredential::from_payload(&payload)?;
        let handle = self.initialize_session(account_id, key, credential).await?;
        self.record_resume(account_id, method);
        Ok(handle)
    }

    fn load_record(&self, account_id: &str) -> VaultResult<EncryptedRecord> {
        self.store
            .get_record(account_id)?
            .ok_or_else(|| VaultError::AccountNotFound(account_id.to_string()))
    }

    pub async fn create_password_account(&self, password: &str) -> VaultResult<SessionHandle> {
        let payload = CredentialPayload::generate()?;
        self.import_password_account(password, payload).await
    }

    pub async fn import_password_account(
        &self,
        password: &str,
        payload: CredentialPayload,
    ) -> VaultResult<SessionHandle> {
        let account_id = AccountCredential::from_payload(&payload)?.local_account_id();
        if self.store.has_record(&account_id)? {
            return Err(VaultError::AccountExists(account_id));
        }

        let salt = random_salt();
        let key = derive_key(Factor::Password {
            password,
            salt: &salt,
        })?;
        self.setup_account(&account_id, key, &payload, salt, AuthMethod::Password, None)
            .await
    }

    pub async fn unlock_with_password(
        &self,
        account_id: &str,
        password: &str,
    ) -> VaultResult<SessionHandle> {
        let record = self.load_record(account_id)?;
        let key = derive_key(Factor::Password {
            password,
            salt: &record.salt,
        })?;
        self.unlock(account_id, &record, key, AuthMethod::Password)
            .await
    }

    /// Passkey-only account without a recovery phrase.
    pub async fn create_passkey_account(
        &self,
        authenticator: &dyn PasskeyAuthenticator,
        credential_id: &[u8],
        public_key: &[u8],
    ) -> VaultResult<SessionHandle> {
        let payload = CredentialPayload::ephemeral();
        let account_id = AccountCredential::from_payload(&payload)?.local_account_id();

        let salt = random_salt();
        let prf_output = authenticator.assert_prf(credential_id, &salt).await?;
        let key = derive_key(Factor::Passkey {
            credential_id,
            prf_output: &prf_output,
        })?;

        let meta = PasskeyMetadata::new(credential_id, public_key, now_secs());
        self.setup_account(
            &account_id,
            key,
            &payload,
            salt,
            AuthMethod::Passkey,
            Some(&meta),
        )
        .await
    }

    /// Remember which credential unlocks `account_id`. Only metadata is
    /// stored; the public key is kept as a hash.
    pub fn register_passkey(
        &self,
        account_id: &str,
        credential_id: &[u8],
        public_key: &[u8],
    ) -> VaultResult<PasskeyMetadata> {
        let meta = PasskeyMetadata::new(credential_id, public_key, now_secs());
        self.store.put_passkey(account_id, &meta)?;
        tracing::debug!(account_id, "Passkey registered");
        Ok(meta)
    }

    pub async fn unlock_with_passkey(
        &self,
        account_id: &str,
        authenticator: &dyn PasskeyAuthenticator,
    ) -> VaultResult<SessionHandle> {
        let meta = self
            .store
            .get_passkey(account_id)?
            .ok_or_else(|| VaultError::PasskeyNotRegistered(account_id.to_string()))?;
        let record = self.load_record(account_id)?;

        let prf_output = authenticator
            .assert_prf(&meta.credential_id, &record.salt)
            .await?;
        let key = derive_key(Factor::Passkey {
            credential_id: &meta.credential_id,
            prf_output: &prf_output,
        })?;
        self.unlock(account_id, &record, key, AuthMethod::Passkey)
            .await
    }

    pub async fn create_wallet_account(
        &self,
        address: Address,
        chain_id: u64,
        signature: &[u8],
    ) -> VaultResult<SessionHandle> {
        let account_id = wallet_account_id(address, chain_id);
        if self.store.has_record(&account_id)? {
            return Err(VaultError::AccountExists(account_id));
        }

        let key = derive_key(Factor::WalletSignature {
            signature,
            chain_id,
            address,
        })?;
        let payload = CredentialPayload::generate()?;
        self.setup_wallet_account_transaction(&account_id, key, &payload)
            .await
    }

    pub async fn unlock_with_wallet(
        &self,
        address: Address,
        chain_id: u64,
        signature: &[u8],
    ) -> VaultResult<SessionHandle> {
        let account_id = wallet_account_id(address, chain_id);
        let record = self.load_record(&account_id)?;
        let key = derive_key(Factor::WalletSignature {
            signature,
            chain_id,
            address,
        })?;
        self.unlock(&account_id, &record, key, AuthMethod::Wallet)
            .await
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
