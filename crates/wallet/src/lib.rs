//! Tidepool wallet engine
//!
//! Everything that needs the network or an unlocked session:
//!
//! ```text
//!            ┌──────────────┐
//!            │ Vault session │  master keys, signing key
//!            └──────────────┘
//!                   │
//!        ┌──────────┴───────────┐
//!        ▼                      ▼
//! ┌──────────────┐      ┌───────────────┐     ┌────────────┐
//! │  discovery   │◀─────│   withdraw    │────▶│   relay    │  bundler + paymaster
//! │ note chains  │      │ fees, proofs  │     └────────────┘
//! └──────────────┘      └───────────────┘            │
//!        ▲                                           ▼
//!        │              ┌───────────────┐     receipt, block
//!        └──────────────│   tracking    │◀───────────┘
//!          re-discover  │ indexer wait  │
//!                       └───────────────┘
//! ```
//!
//! # Key Components
//!
//! - [`discovery`] - Rebuilds note chains from pool events
//! - [`withdraw`] - Validation, proof request and calldata assembly
//! - [`tracking`] - Follows a submitted transaction until the indexer has it
//! - [`remote_log`] - Pool events, state-tree leaves and the approved set
//! - [`relay`] - ERC-4337 user operations and ERC-7677 sponsorship
//! - [`error`] - Wallet-level error taxonomy

pub mod chain;
pub mod config;
pub mod discovery;
pub mod error;
pub mod events;
pub mod prover;
pub mod relay;
pub mod remote_log;
pub mod reporter;
pub mod rpc;
pub mod tracking;
pub mod withdraw;

pub use chain::{HttpIndexerStatus, RpcReceiptSource};
pub use config::{PoolConfig, WalletConfig};
pub use discovery::{
    DiscoveryCache, DiscoveryEngine, DiscoveryError, DiscoveryOutcome, DiscoveryState,
    SessionLedger, DEFAULT_GAP_THRESHOLD,
};
pub use error::WalletError;
pub use events::{EventIndex, EventPage, PoolEvent};
pub use prover::{HttpProofGenerator, ProofError, ProofGenerator, WithdrawalProofInputs};
pub use relay::{BundlerClient, Paymaster, PaymasterClient, RelayError, RelayLayer};
pub use remote_log::{RemoteLog, RemoteLogError, RpcRemoteLog};
pub use reporter::ErrorReporter;
pub use rpc::{JsonRpcClient, RpcError};
pub use tracking::{
    IndexerStatus, LedgerRefresh, ReceiptSource, TrackedTransaction, TrackingError,
    TrackingStatus, TrackingTimeouts, TransactionTracker,
};
pub use withdraw::{
    validate, PreparedWithdrawal, SubmitOutcome, ValidationError, WithdrawalError,
    WithdrawalOrchestrator, WithdrawalPhase, WithdrawalRequest,
};
