//! Deterministic note secrets
//!
//! Every spendable note is fully determined by the account's master keys, a
//! public salt (the pool scope for deposits, the note label for everything
//! that follows) and an index:
//!
//! ```text
//! deposit i:     nullifier = P(master_nullifier, scope, i)
//!                secret    = P(master_secret,    scope, i)
//! change j:      nullifier = P(master_nullifier, label, j)
//!                secret    = P(master_secret,    label, j)
//! refund j:      nullifier = P(master_nullifier, label, j, REFUND_DOMAIN)
//!                secret    = P(master_secret,    label, j, REFUND_DOMAIN)
//!
//! precommitment  = P(nullifier, secret)
//! commitment     = P(value, label, precommitment)
//! nullifier hash = P(nullifier)
//! ```
//!
//! Nothing here touches the network, so discovery can re-derive any note an
//! account could own without server-side knowledge of ownership.

use std::fmt;

use alloy_primitives::U256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::keys::MasterKeys;
use crate::notes::{Note, NoteKind};
use crate::poseidon::{hash1, hash2, hash3, hash4};
use crate::utils::{field_to_u256, u256_to_field};
use crate::Field;

/// Fourth Poseidon input separating refund secrets from change secrets at
/// the same index.
pub const REFUND_DOMAIN: u64 = 0x5245_464e; // "REFN"

/// Domain for the change left behind when a refund note is withdrawn.
pub const REFUND_CHANGE_DOMAIN: u64 = 0x5246_4348; // "RFCH"

#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct NoteSecrets {
    nullifier: Field,
    secret: Field,
}

impl NoteSecrets {
    pub fn new(nullifier: Field, secret: Field) -> Self {
        Self { nullifier, secret }
    }

    pub fn nullifier(&self) -> Field {
        self.nullifier
    }

    pub fn secret(&self) -> Field {
        self.secret
    }

    pub fn precommitment(&self) -> Field {
        hash2(self.nullifier, self.secret)
    }

    pub fn nullifier_hash(&self) -> Field {
        hash1(self.nullifier)
    }

    pub fn commitment(&self, value: U256, label: U256) -> Field {
        commitment(value, label, self.precommitment())
    }
}

impl fmt::Debug for NoteSecrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("NoteSecrets(<redacted>)")
    }
}

pub fn deposit_secrets(master: &MasterKeys, scope: U256, index: u64) -> NoteSecrets {
    let scope = u256_to_field(scope);
    let index = Field::from(index);
    NoteSecrets {
        nullifier: hash3(master.nullifier(), scope, index),
        secret: hash3(master.secret(), scope, index),
    }
}

pub fn withdrawal_secrets(master: &MasterKeys, label: U256, index: u64) -> NoteSecrets {
    let label = u256_to_field(label);
    let index = Field::from(index);
    NoteSecrets {
        nullifier: hash3(master.nullifier(), label, index),
        secret: hash3(master.secret(), label, index),
    }
}

pub fn refund_secrets(master: &MasterKeys, label: U256, index: u64) -> NoteSecrets {
    domain_secrets(master, label, index, REFUND_DOMAIN)
}

pub fn refund_change_secrets(master: &MasterKeys, label: U256, index: u64) -> NoteSecrets {
    domain_secrets(master, label, index, REFUND_CHANGE_DOMAIN)
}

fn domain_secrets(master: &MasterKeys, label: U256, index: u64, domain: u64) -> NoteSecrets {
    let label = u256_to_field(label);
    let index = Field::from(index);
    let domain = Field::from(domain);
    NoteSecrets {
        nullifier: hash4(master.nullifier(), label, index, domain),
        secret: hash4(master.secret(), label, index, domain),
    }
}

/// Secrets of a note the account already owns.
pub fn note_secrets(master: &MasterKeys, scope: U256, note: &Note) -> NoteSecrets {
    match note.kind {
        NoteKind::Deposit => deposit_secrets(master, scope, note.deposit_index),
        NoteKind::Change => withdrawal_secrets(master, note.label, note.change_index),
        NoteKind::Refund => refund_secrets(
            master,
            note.label,
            note.refund_index.unwrap_or(note.change_index),
        ),
    }
}

/// Secrets of the change note left behind when `note` is spent.
pub fn change_secrets(master: &MasterKeys, note: &Note) -> NoteSecrets {
    match note.kind {
        NoteKind::Refund => refund_change_secrets(
            master,
            note.label,
            note.refund_index.unwrap_or(note.change_index),
        ),
        _ => withdrawal_secrets(master, note.label, note.change_index + 1),
    }
}

pub fn commitment(value: U256, label: U256, precommitment: Field) -> Field {
    hash3(u256_to_field(value), u256_to_field(label), precommitment)
}

/// Commitment as the `uint256` the contracts emit.
pub fn commitment_u256(value: U256, label: U256, precommitment: Field) -> U256 {
    field_to_u256(commitment(value, label, precommitment))
}
