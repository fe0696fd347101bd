//! Tidepool core: the deterministic half of the wallet.
//!
//! Everything in this crate is pure: Poseidon hashing over BN254, the
//! account and master key split, note secret derivation, the note chain
//! model, fee quotes and the withdrawal context hash. Networked and stateful
//! pieces live in `tidepool-vault` and `tidepool-wallet`.

pub mod abi;
pub mod context;
pub mod derivation;
pub mod fees;
pub mod keys;
pub mod notes;
pub mod poseidon;
pub mod units;
pub mod utils;

pub use derivation::NoteSecrets;
pub use fees::{FeeQuote, FeeSchedule, Route};
pub use keys::{AccountKey, DerivedKeys, MasterKeys};
pub use notes::{Note, NoteChain, NoteError, NoteKind, NoteStatus};
pub use units::{format_amount, parse_amount};

pub type Field = ark_bn254::Fr;

/// Public signal count of the same-chain withdrawal circuit.
pub const SAME_CHAIN_SIGNALS: usize = 8;

/// Public signal count of the cross-chain withdrawal circuit.
pub const CROSS_CHAIN_SIGNALS: usize = 9;
