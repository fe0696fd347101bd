use alloy_primitives::{Address, B256, U256};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NoteError {
    #[error("Chain must start with a deposit note at change index 0")]
    InvalidHead,

    #[error("Note belongs to pool {pool} deposit {deposit_index}, not this chain")]
    ForeignNote { pool: Address, deposit_index: u64 },

    #[error("Expected change index {expected}, got {actual}")]
    IndexGap { expected: u64, actual: u64 },

    #[error("Only change notes can extend a chain, got {0:?}")]
    WrongKind(NoteKind),

    #[error("Note at change index {0} is unspent but not the chain tail")]
    UnspentInterior(u64),

    #[error("Refund note is missing its refund index")]
    MissingRefundIndex,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoteKind {
    Deposit,
    Change,
    Refund,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoteStatus {
    Unspent,
    Spent,
}

/// A single private note. Secrets are never stored here; they are
/// re-derived from the account's master keys and the indices below.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    pub pool_address: Address,
    pub deposit_index: u64,
    pub change_index: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refund_index: Option<u64>,
    pub kind: NoteKind,
    #[serde(with = "decimal")]
    pub amount: U256,
    pub label: U256,
    pub commitment: U256,
    pub origin_chain_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_chain_id: Option<u64>,
    pub origin_tx_hash: B256,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_tx_hash: Option<B256>,
    pub block_number: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    pub status: NoteStatus,
    /// False until the commitment has been inserted into the state tree.
    pub active: bool,
    /// Set on change notes produced by a cross-chain withdrawal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refund_commitment: Option<U256>,
}

impl Note {
    pub fn is_spendable(&self) -> bool {
        self.status == NoteStatus::Unspent && self.active && !self.amount.is_zero()
    }
}

/// Notes sharing `(pool_address, deposit_index)`, ordered by change index.
///
/// Append-only: notes are marked spent, never removed. Refund notes recovered
/// from failed cross-chain legs are independent leaves and live beside the
/// change sequence rather than inside it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "StoredChain")]
pub struct NoteChain {
    pub pool_address: Address,
    pub deposit_index: u64,
    notes: Vec<Note>,
    #[serde(default)]
    refunds: Vec<Note>,
}

/// Wire shape of a persisted chain, checked before it becomes a `NoteChain`.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredChain {
    pool_address: Address,
    deposit_index: u64,
    notes: Vec<Note>,
    #[serde(default)]
    refunds: Vec<Note>,
}

impl TryFrom<StoredChain> for NoteChain {
    type Error = NoteError;

    fn try_from(stored: StoredChain) -> Result<Self, Self::Error> {
        let chain = Self {
            pool_address: stored.pool_address,
            deposit_index: stored.deposit_index,
            notes: stored.notes,
            refunds: stored.refunds,
        };
        chain.validate()?;
        for refund in &chain.refunds {
            chain.check_membership(refund)?;
            if refund.kind != NoteKind::Refund {
                return Err(NoteError::WrongKind(refund.kind));
            }
        }
        Ok(chain)
    }
}

impl NoteChain {
    pub fn new(deposit: Note) -> Result<Self, NoteError> {
        if deposit.kind != NoteKind::Deposit || deposit.change_index != 0 {
            return Err(NoteError::InvalidHead);
        }
        Ok(Self {
            pool_address: deposit.pool_address,
            deposit_index: deposit.deposit_index,
            notes: vec![deposit],
            refunds: Vec::new(),
        })
    }

    pub fn notes(&self) -> &[Note] {
        &self.notes
    }

    pub fn refunds(&self) -> &[Note] {
        &self.refunds
    }

    pub fn len(&self) -> usize {
        self.notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }

    pub fn tail(&self) -> &Note {
        // `new` guarantees at least the deposit note
        &self.notes[self.notes.len() - 1]
    }

    pub fn tail_mut(&mut self) -> &mut Note {
        let last = self.notes.len() - 1;
        &mut self.notes[last]
    }

    pub fn refunds_mut(&mut self) -> impl Iterator<Item = &mut Note> {
        self.refunds.iter_mut()
    }

    pub fn notes_mut(&mut self) -> impl Iterator<Item = &mut Note> {
        self.notes.iter_mut().chain(self.refunds.iter_mut())
    }

    /// Mark the current tail spent and append its change note.
    pub fn append_change(&mut self, change: Note) -> Result<(), NoteError> {
        self.check_membership(&change)?;
        if change.kind != NoteKind::Change {
            return Err(NoteError::WrongKind(change.kind));
        }
        let expected = self.tail().change_index + 1;
        if change.change_index != expected {
            return Err(NoteError::IndexGap {
                expected,
                actual: change.change_index,
            });
        }

        self.tail_mut().status = NoteStatus::Spent;
        self.notes.push(change);
        Ok(())
    }

    pub fn add_refund(&mut self, refund: Note) -> Result<(), NoteError> {
        self.check_membership(&refund)?;
        if refund.kind != NoteKind::Refund {
            return Err(NoteError::WrongKind(refund.kind));
        }
        if refund.refund_index.is_none() {
            return Err(NoteError::MissingRefundIndex);
        }
        if self
            .refunds
            .iter()
            .any(|r| r.commitment == refund.commitment)
        {
            return Ok(());
        }
        self.refunds.push(refund);
        Ok(())
    }

    /// Full structural check, run before a chain is persisted.
    pub fn validate(&self) -> Result<(), NoteError> {
        let head = self.notes.first().ok_or(NoteError::InvalidHead)?;
        if head.kind != NoteKind::Deposit || head.change_index != 0 {
            return Err(NoteError::InvalidHead);
        }

        let last = self.notes.len() - 1;
        for (position, note) in self.notes.iter().enumerate() {
            self.check_membership(note)?;
            if note.change_index != position as u64 {
                return Err(NoteError::IndexGap {
                    expected: position as u64,
                    actual: note.change_index,
                });
            }
            if position > 0 && note.kind != NoteKind::Change {
                return Err(NoteError::WrongKind(note.kind));
            }
            if position < last && note.status != NoteStatus::Spent {
                return Err(NoteError::UnspentInterior(note.change_index));
            }
        }
        Ok(())
    }

    /// Notes a withdrawal may currently spend.
    pub fn available_notes(&self) -> impl Iterator<Item = &Note> {
        std::iter::once(self.tail())
            .chain(self.refunds.iter())
            .filter(|n| n.is_spendable())
    }

    pub fn balance(&self) -> U256 {
        self.available_notes()
            .fold(U256::ZERO, |acc, n| acc.saturating_add(n.amount))
    }

    fn check_membership(&self, note: &Note) -> Result<(), NoteError> {
        if note.pool_address != self.pool_address || note.deposit_index != self.deposit_index {
            return Err(NoteError::ForeignNote {
                pool: note.pool_address,
                deposit_index: note.deposit_index,
            });
        }
        Ok(())
    }
}

/// Arbitrary precision amounts travel as decimal strings.
pub mod decimal {
    use alloy_primitives::U256;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
        let raw = String::deserialize(deserializer)?;
        U256::from_str_radix(&raw, 10).map_err(serde::de::Error::custom)
    }
}
