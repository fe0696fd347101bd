//! Device-local persistence
//!
//! One sled database with a tree per concern:
//!
//! | tree        | key                               | value               |
//! |-------------|-----------------------------------|---------------------|
//! | `records`   | `record:{account_id}`             | `EncryptedRecord`   |
//! | `staging`   | `record:{account_id}`             | `EncryptedRecord`   |
//! | `passkeys`  | `passkey:{account_id}`            | `PasskeyMetadata`   |
//! | `meta`      | `resume`                          | `ResumePointer`     |
//! | `discovery` | `discovery:{public_key}:{pool}`   | cached scan result  |
//!
//! Only `records` holds secrets, and only as ciphertext.

use std::path::Path;

use alloy_primitives::Address;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionResult, TransactionError, Transactional};
use sled::{Db, Tree};
use thiserror::Error;

use crate::cipher::EncryptedRecord;
use crate::passkey::PasskeyMetadata;

const RESUME_KEY: &str = "resume";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Db(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Nothing staged for account {0}")]
    NothingStaged(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    Passkey,
    Wallet,
    Password,
}

/// Which unlock prompt to show on the next start. Lives outside the
/// encryption boundary on purpose: reading it must not require a key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumePointer {
    pub account_id: String,
    pub auth_method: AuthMethod,
    pub last_auth_at: u64,
}

pub struct LocalStore {
    db: Db,
    records: Tree,
    staging: Tree,
    passkeys: Tree,
    meta: Tree,
    discovery: Tree,
}

impl LocalStore {
    /// Open or create the store. Staged writes left by an interrupted setup
    /// are discarded: they were never committed.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let store = Self::from_db(sled::open(path)?)?;
        let stale = store.staging.len();
        if stale > 0 {
            tracing::warn!(stale, "Discarding uncommitted account setup");
            store.staging.clear()?;
            store.staging.flush()?;
        }
        Ok(store)
    }

    /// Throwaway store removed on drop.
    pub fn temporary() -> Result<Self, StoreError> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> Result<Self, StoreError> {
        Ok(Self {
            records: db.open_tree("records")?,
            staging: db.open_tree("staging")?,
            passkeys: db.open_tree("passkeys")?,
            meta: db.open_tree("meta")?,
            discovery: db.open_tree("discovery")?,
            db,
        })
    }

    pub fn put_record(&self, account_id: &str, record: &EncryptedRecord) -> Result<(), StoreError> {
        put_json(&self.records, &record_key(account_id), record)
    }

    pub fn get_record(&self, account_id: &str) -> Result<Option<EncryptedRecord>, StoreError> {
        get_json(&self.records, &record_key(account_id))
    }

    pub fn has_record(&self, account_id: &str) -> Result<bool, StoreError> {
        Ok(self.records.contains_key(record_key(account_id).as_bytes())?)
    }

    /// First half of an atomic account setup.
    pub fn stage_record(&self, account_id: &str, record: &EncryptedRecord) -> Result<(), StoreError> {
        put_json(&self.staging, &record_key(account_id), record)?;
        self.staging.flush()?;
        Ok(())
    }

    pub fn staged_record(&self, account_id: &str) -> Result<Option<EncryptedRecord>, StoreError> {
        get_json(&self.staging, &record_key(account_id))
    }

    /// Move the staged record into `records` in one transaction. A passkey
    /// that unlocks the account is registered in the same transaction, so a
    /// committed passkey account is never left without its metadata.
    pub fn commit_staged(
        &self,
        account_id: &str,
        passkey: Option<&PasskeyMetadata>,
    ) -> Result<(), StoreError> {
        let key = record_key(account_id);
        let passkey_entry = passkey
            .map(|meta| {
                serde_json::to_vec(meta)
                    .map(|bytes| (passkey_key(account_id), bytes))
                    .map_err(|e| StoreError::Serialization(e.to_string()))
            })
            .transpose()?;

        let moved = (&self.staging, &self.records, &self.passkeys)
            .transaction(
                |(staging, records, passkeys)| -> ConflictableTransactionResult<bool> {
                    let Some(bytes) = staging.remove(key.as_bytes())? else {
                        return Ok(false);
                    };
                    records.insert(key.as_bytes(), bytes)?;
                    if let Some((pk_key, meta)) = &passkey_entry {
                        passkeys.insert(pk_key.as_bytes(), meta.as_slice())?;
                    }
                    Ok(true)
                },
            )
            .map_err(|e| match e {
                TransactionError::Abort(()) => {
                    StoreError::Serialization("staging transaction aborted".into())
                }
                TransactionError::Storage(e) => StoreError::Db(e),
            })?;

        if !moved {
            return Err(StoreError::NothingStaged(account_id.to_string()));
        }
        self.db.flush()?;
        Ok(())
    }

    pub fn discard_staged(&self, account_id: &str) -> Result<(), StoreError> {
        self.staging.remove(record_key(account_id).as_bytes())?;
        Ok(())
    }

    pub fn put_passkey(&self, account_id: &str, meta: &PasskeyMetadata) -> Result<(), StoreError> {
        put_json(&self.passkeys, &passkey_key(account_id), meta)
    }

    pub fn get_passkey(&self, account_id: &str) -> Result<Option<PasskeyMetadata>, StoreError> {
        get_json(&self.passkeys, &passkey_key(account_id))
    }

    pub fn set_resume(&self, pointer: &ResumePointer) -> Result<(), StoreError> {
        put_json(&self.meta, RESUME_KEY, pointer)
    }

    pub fn resume(&self) -> Result<Option<ResumePointer>, StoreError> {
        get_json(&self.meta, RESUME_KEY)
    }

    pub fn put_discovery<T: Serialize>(
        &self,
        public_key: &str,
        pool: Address,
        value: &T,
    ) -> Result<(), StoreError> {
        put_json(&self.discovery, &discovery_key(public_key, pool), value)
    }

    pub fn get_discovery<T: DeserializeOwned>(
        &self,
        public_key: &str,
        pool: Address,
    ) -> Result<Option<T>, StoreError> {
        get_json(&self.discovery, &discovery_key(public_key, pool))
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

fn record_key(account_id: &str) -> String {
    format!("record:{account_id}")
}

fn passkey_key(account_id: &str) -> String {
    format!("passkey:{account_id}")
}

fn discovery_key(public_key: &str, pool: Address) -> String {
    format!("discovery:{public_key}:{pool:#x}")
}

fn put_json<T: Serialize>(tree: &Tree, key: &str, value: &T) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec(value).map_err(|e| StoreError::Serialization(e.to_string()))?;
    tree.insert(key.as_bytes(), bytes)?;
    Ok(())
}

fn get_json<T: DeserializeOwned>(tree: &Tree, key: &str) -> Result<Option<T>, StoreError> {
    match tree.get(key.as_bytes())? {
        Some(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError::Serialization(e.to_string())),
        None => Ok(None),
    }
}
