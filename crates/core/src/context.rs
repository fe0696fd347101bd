//! Withdrawal context binding
//!
//! The context scalar ties recipient and fee parameters to a pool scope. The
//! pool recomputes `keccak256(abi.encode(withdrawal, scope)) % r` on chain and
//! rejects any proof generated against a different value, so a relayer
//! cannot redirect funds after the proof exists.

use alloy_primitives::{Address, Bytes, U256};
use alloy_sol_types::SolValue;

use crate::abi::{CrosschainRelayData, RelayData, Withdrawal};
use crate::utils::keccak_to_field;
use crate::Field;

/// Bits reserved for the recipient in a packed cross-chain destination.
const ADDRESS_BITS: usize = 160;

/// `chain_id << 160 | recipient` as one word.
pub fn pack_destination(chain_id: u32, recipient: Address) -> U256 {
    (U256::from(chain_id) << ADDRESS_BITS) | U256::from_be_slice(recipient.as_slice())
}

pub fn unpack_destination(packed: U256) -> (u32, Address) {
    let chain_id = (packed >> ADDRESS_BITS).saturating_to::<u32>();
    let bytes = packed.to_be_bytes::<32>();
    (chain_id, Address::from_slice(&bytes[12..]))
}

pub fn same_chain_withdrawal(
    processooor: Address,
    recipient: Address,
    fee_recipient: Address,
    relay_fee_bps: u64,
) -> Withdrawal {
    let data = RelayData {
        recipient,
        feeRecipient: fee_recipient,
        relayFeeBPS: U256::from(relay_fee_bps),
    };
    Withdrawal {
        processooor,
        data: Bytes::from(data.abi_encode()),
    }
}

pub fn cross_chain_withdrawal(
    processooor: Address,
    destination_chain_id: u32,
    recipient: Address,
    fee_recipient: Address,
    relay_fee_bps: u64,
    solver_fee_bps: u64,
) -> Withdrawal {
    let data = CrosschainRelayData {
        destination: pack_destination(destination_chain_id, recipient),
        feeRecipient: fee_recipient,
        relayFeeBPS: U256::from(relay_fee_bps),
        solverFeeBPS: U256::from(solver_fee_bps),
    };
    Withdrawal {
        processooor,
        data: Bytes::from(data.abi_encode()),
    }
}

pub fn context_hash(withdrawal: &Withdrawal, scope: U256) -> Field {
    let encoded = (withdrawal.clone(), scope).abi_encode_params();
    keccak_to_field(&encoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::{field_to_u256, SNARK_SCALAR_FIELD};

    fn addr(byte: u8) -> Address {
        Address::repeat_byte(byte)
    }

    #[test]
    fn test_destination_packing() {
        let recipient = addr(0xab);
        let packed = pack_destination(10, recipient);

        assert_eq!(unpack_destination(packed), (10, recipient));
        assert_eq!(packed >> 160, U256::from(10u64));
    }

    #[test]
    fn test_context_binds_recipient() {
        let scope = U256::from(42u64);
        let a = same_chain_withdrawal(addr(1), addr(2), addr(3), 500);
        let b = same_chain_withdrawal(addr(1), addr(4), addr(3), 500);

        assert_ne!(context_hash(&a, scope), context_hash(&b, scope));
    }

    #[test]
    fn test_context_binds_scope() {
        let w = same_chain_withdrawal(addr(1), addr(2), addr(3), 500);
        assert_ne!(
            context_hash(&w, U256::from(1u64)),
            context_hash(&w, U256::from(2u64))
        );
    }

    #[test]
    fn test_context_is_reduced() {
        let w = cross_chain_withdrawal(addr(1), 8453, addr(2), addr(3), 500, 500);
        let ctx = field_to_u256(context_hash(&w, U256::MAX));
        assert!(ctx < *SNARK_SCALAR_FIELD);
    }

    #[test]
    fn test_routes_encode_different_payloads() {
        let same = same_chain_withdrawal(addr(1), addr(2), addr(3), 500);
        let cross = cross_chain_withdrawal(addr(1), 10, addr(2), addr(3), 500, 0);

        assert_ne!(same.data, cross.data);
        // RelayData is three static words, CrosschainRelayData four
        assert_eq!(same.data.len(), 96);
        assert_eq!(cross.data.len(), 128);
    }
}
