use alloy_primitives::{Address, U256};
use ark_ff::{BigInteger, PrimeField};
use once_cell::sync::Lazy;
use sha3::{Digest, Keccak256};

use crate::Field;

/// BN254 scalar field order, the modulus every public signal is reduced by.
pub static SNARK_SCALAR_FIELD: Lazy<U256> =
    Lazy::new(|| U256::from_be_slice(&Field::MODULUS.to_bytes_be()));

pub fn u256_to_field(value: U256) -> Field {
    Field::from_be_bytes_mod_order(&value.to_be_bytes::<32>())
}

pub fn field_to_u256(f: Field) -> U256 {
    U256::from_be_slice(&f.into_bigint().to_bytes_be())
}

pub fn address_to_field(addr: Address) -> Field {
    let mut bytes = [0u8; 32];
    bytes[12..32].copy_from_slice(addr.as_slice());
    Field::from_be_bytes_mod_order(&bytes)
}

/// `keccak256(data) mod r`, the reduction the contracts apply before a value
/// enters a circuit.
pub fn keccak_to_field(data: &[u8]) -> Field {
    let digest = Keccak256::digest(data);
    let reduced = U256::from_be_slice(&digest) % *SNARK_SCALAR_FIELD;
    u256_to_field(reduced)
}

pub fn keccak256(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_u256_roundtrip_below_modulus() {
        let value = U256::from(123_456_789u64);
        assert_eq!(field_to_u256(u256_to_field(value)), value);
    }

    #[test]
    fn test_u256_reduced_mod_r() {
        let over = *SNARK_SCALAR_FIELD + U256::from(5u64);
        assert_eq!(field_to_u256(u256_to_field(over)), U256::from(5u64));
    }

    #[test]
    fn test_keccak_to_field_is_reduced() {
        let f = keccak_to_field(b"tidepool");
        assert!(field_to_u256(f) < *SNARK_SCALAR_FIELD);
    }
}
