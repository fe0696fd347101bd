//! The single unlocked session of a process
//!
//! The vault owns one `SessionCell`. Consumers hold a `SessionHandle`, a
//! cheap clone stamped with the generation it was issued under. Teardown
//! clears the cell and bumps the generation under the write lock, so any
//! handle issued earlier fails with `SessionError::Expired` on its next use
//! instead of reading another account's keys.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use k256::ecdsa::SigningKey;
use tidepool_core::{AccountKey, MasterKeys};
use tokio::sync::RwLock;
use zeroize::Zeroizing;

use crate::cipher::{self, random_salt, EncryptedRecord};
use crate::credential::AccountCredential;
use crate::error::{SessionError, VaultError};
use crate::kdf::SymmetricKey;

pub(crate) struct ActiveSession {
    pub(crate) account_id: String,
    pub(crate) key: SymmetricKey,
    pub(crate) credential: AccountCredential,
}

#[derive(Default)]
pub(crate) struct SessionCell {
    generation: AtomicU64,
    active: RwLock<Option<ActiveSession>>,
}

impl SessionCell {
    /// Install a session, replacing one for the same account.
    pub(crate) async fn install(
        self: &Arc<Self>,
        session: ActiveSession,
    ) -> Result<SessionHandle, SessionError> {
        let mut slot = self.active.write().await;
        if let Some(current) = slot.as_ref() {
            if current.account_id != session.account_id {
                return Err(SessionError::AlreadyActive {
                    active: current.account_id.clone(),
                    requested: session.account_id,
                });
            }
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let account_id = session.account_id.clone();
        *slot = Some(session);

        Ok(SessionHandle {
            cell: Arc::clone(self),
            generation,
            account_id,
        })
    }

    /// Drop the active session. Key and credential wipe themselves on drop.
    pub(crate) async fn teardown(&self) -> Option<String> {
        let mut slot = self.active.write().await;
        self.generation.fetch_add(1, Ordering::SeqCst);
        slot.take().map(|s| s.account_id.clone())
    }

    /// Teardown only if the slot still holds the session `handle` refers to.
    pub(crate) async fn teardown_if(&self, handle: &SessionHandle) {
        let mut slot = self.active.write().await;
        if self.generation.load(Ordering::SeqCst) == handle.generation {
            self.generation.fetch_add(1, Ordering::SeqCst);
            slot.take();
        }
    }

    pub(crate) async fn current(self: &Arc<Self>) -> Option<SessionHandle> {
        let slot = self.active.read().await;
        slot.as_ref().map(|s| SessionHandle {
            cell: Arc::clone(self),
            generation: self.generation.load(Ordering::SeqCst),
            account_id: s.account_id.clone(),
        })
    }
}

/// Borrowed view of the unlocked session.
#[derive(Clone)]
pub struct SessionHandle {
    cell: Arc<SessionCell>,
    generation: u64,
    account_id: String,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("account_id", &self.account_id)
            .field("generation", &self.generation)
            .finish()
    }
}

impl SessionHandle {
    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub async fn is_valid(&self) -> bool {
        self.read(|_| ()).await.is_ok()
    }

    async fn read<T>(&self, f: impl FnOnce(&ActiveSession) -> T) -> Result<T, SessionError> {
        let slot = self.cell.active.read().await;
        if self.cell.generation.load(Ordering::SeqCst) != self.generation {
            return Err(SessionError::Expired);
        }
        slot.as_ref().map(f).ok_or(SessionError::Expired)
    }

    pub async fn account_key(&self) -> Result<AccountKey, SessionError> {
        self.read(|s| s.credential.account_key().clone()).await
    }

    pub async fn master_keys(&self) -> Result<MasterKeys, SessionError> {
        self.read(|s| s.credential.master_keys()).await
    }

    pub async fn public_key(&self) -> Result<String, SessionError> {
        self.read(|s| s.credential.public_key()).await
    }

    pub async fn signing_key(&self) -> Result<SigningKey, SessionError> {
        self.read(|s| s.credential.signing_key().clone()).await
    }

    /// Encrypt arbitrary data under the session key for this account.
    pub async fn seal(&self, plaintext: &[u8]) -> Result<EncryptedRecord, VaultError> {
        let key = self.read(|s| s.key.clone()).await?;
        cipher::encrypt(plaintext, &key, &self.account_id, random_salt())
    }

    pub async fn open(&self, record: &EncryptedRecord) -> Result<Zeroizing<Vec<u8>>, VaultError> {
        let key = self.read(|s| s.key.clone()).await?;
        cipher::decrypt(record, &key, &self.account_id)
    }
}
