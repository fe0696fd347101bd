//! Circom-compatible Poseidon over BN254
//!
//! Every commitment, precommitment and nullifier hash the pool contracts
//! verify is produced by the circomlibjs parameter set (x^5 S-box, 8 full
//! rounds, width dependent partial rounds). `light-poseidon` ships those
//! round constants, so this module only fixes the arities the protocol uses.

use light_poseidon::{Poseidon, PoseidonHasher};
use thiserror::Error;

use crate::Field;

/// Largest arity with published circom constants.
pub const MAX_INPUTS: usize = 12;

#[derive(Debug, Error)]
pub enum PoseidonError {
    #[error("Unsupported input count: {0} (expected 1..={MAX_INPUTS})")]
    InvalidInputCount(usize),

    #[error("Hasher rejected input: {0}")]
    Hasher(String),
}

/// Hash an arbitrary slice of 1..=12 field elements.
pub fn hash(inputs: &[Field]) -> Result<Field, PoseidonError> {
    if inputs.is_empty() || inputs.len() > MAX_INPUTS {
        return Err(PoseidonError::InvalidInputCount(inputs.len()));
    }

    let mut hasher = Poseidon::<Field>::new_circom(inputs.len())
        .map_err(|e| PoseidonError::Hasher(e.to_string()))?;

    hasher
        .hash(inputs)
        .map_err(|e| PoseidonError::Hasher(e.to_string()))
}

/// Single input hash, used for nullifier hashes.
pub fn hash1(a: Field) -> Field {
    hash(&[a]).expect("arity 1 has circom constants")
}

pub fn hash2(a: Field, b: Field) -> Field {
    hash(&[a, b]).expect("arity 2 has circom constants")
}

pub fn hash3(a: Field, b: Field, c: Field) -> Field {
    hash(&[a, b, c]).expect("arity 3 has circom constants")
}

pub fn hash4(a: Field, b: Field, c: Field, d: Field) -> Field {
    hash(&[a, b, c, d]).expect("arity 4 has circom constants")
}

#[cfg(test)]
mod tests {
    use super::*;
    use ark_ff::{BigInteger, PrimeField, Zero};

    #[test]
    fn test_circomlibjs_vector() {
        // poseidon([1, 2]) from circomlibjs
        let result = hash2(Field::from(1u64), Field::from(2u64));
        let encoded = format!("0x{}", hex::encode(result.into_bigint().to_bytes_be()));

        assert_eq!(
            encoded,
            "0x115cc0f5e7d690413df64c6b9662e9cf2a3617f2743245519e19607a4417189a"
        );
    }

    #[test]
    fn test_argument_order_matters() {
        let a = Field::from(7u64);
        let b = Field::from(9u64);

        assert_ne!(hash2(a, b), hash2(b, a));
        assert_ne!(hash3(a, b, Field::zero()), hash2(a, b));
    }

    #[test]
    fn test_rejects_bad_arity() {
        assert!(hash(&[]).is_err());

        let too_many: Vec<Field> = (0..13u64).map(Field::from).collect();
        assert!(matches!(
            hash(&too_many),
            Err(PoseidonError::InvalidInputCount(13))
        ));
    }

    #[test]
    fn test_all_protocol_widths() {
        let x = Field::from(42u64);
        assert!(!hash1(x).is_zero());
        assert!(!hash4(x, x, x, x).is_zero());
    }
}
