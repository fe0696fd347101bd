//! Pool and entrypoint ABI
//!
//! Types are shared by the context hash (which must match the contract's
//! `abi.encode` byte for byte), calldata assembly and event decoding.

use alloy_sol_types::sol;

sol! {
    /// Withdrawal as seen by the pool; `data` carries the relay payload.
    #[derive(Debug, PartialEq, Eq)]
    struct Withdrawal {
        address processooor;
        bytes data;
    }

    #[derive(Debug, PartialEq, Eq)]
    struct RelayData {
        address recipient;
        address feeRecipient;
        uint256 relayFeeBPS;
    }

    /// `destination` packs `chain_id << 160 | recipient`.
    #[derive(Debug, PartialEq, Eq)]
    struct CrosschainRelayData {
        uint256 destination;
        address feeRecipient;
        uint256 relayFeeBPS;
        uint256 solverFeeBPS;
    }

    #[derive(Debug, PartialEq, Eq)]
    struct WithdrawProof {
        uint256[2] pA;
        uint256[2][2] pB;
        uint256[2] pC;
        uint256[8] pubSignals;
    }

    #[derive(Debug, PartialEq, Eq)]
    struct CrosschainWithdrawProof {
        uint256[2] pA;
        uint256[2][2] pB;
        uint256[2] pC;
        uint256[9] pubSignals;
    }

    /// Entrypoint: same-chain relayed withdrawal
    function relay(
        Withdrawal calldata _withdrawal,
        WithdrawProof calldata _proof,
        uint256 _scope
    ) external;

    /// Entrypoint: cross-chain withdrawal through the solver network
    function crosschainRelay(
        Withdrawal calldata _withdrawal,
        CrosschainWithdrawProof calldata _proof,
        uint256 _scope
    ) external;

    /// Smart account call wrapper used for user operations
    function execute(address dest, uint256 value, bytes calldata func) external;

    /// ERC-4337 entry point nonce lookup
    function getNonce(address sender, uint192 key) external view returns (uint256 nonce);

    event Deposited(
        address indexed _depositor,
        uint256 _commitment,
        uint256 _label,
        uint256 _value,
        uint256 _precommitmentHash
    );

    event Withdrawn(
        address indexed _processooor,
        uint256 _value,
        uint256 _spentNullifier,
        uint256 _newCommitment
    );

    event CrosschainWithdrawn(
        address indexed _processooor,
        uint256 _value,
        uint256 _spentNullifier,
        uint256 _newCommitment,
        uint256 _refundCommitment,
        uint256 _destinationChainId
    );

    event Refunded(
        uint256 _refundCommitment,
        uint256 _value,
        uint256 _label
    );

    event LeafInserted(
        uint256 _index,
        uint256 _leaf,
        uint256 _root
    );
}
