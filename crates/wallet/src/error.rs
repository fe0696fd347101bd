//! Closed error taxonomy presented to callers
//!
//! Module errors stay precise where they are raised; at the wallet boundary
//! they are lifted into one of seven categories, each with a code, a message
//! and whether retrying can help.

use serde::Serialize;
use thiserror::Error;
use tidepool_vault::{SessionError, StoreError, VaultError};

use crate::discovery::DiscoveryError;
use crate::prover::ProofError;
use crate::relay::{is_cancellation_text, RelayError};
use crate::remote_log::RemoteLogError;
use crate::rpc::RpcError;
use crate::tracking::TrackingError;
use crate::withdraw::WithdrawalError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockchainCode {
    UserRejected,
    InsufficientFunds,
    Reverted,
    ReceiptTimeout,
    Rpc,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StorageCode {
    Database,
    Corrupt,
    Cache,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IndexerCode {
    Unavailable,
    Lagging,
    Malformed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NetworkCode {
    Timeout,
    Unreachable,
    Http,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WithdrawalCode {
    Invalid,
    ProofFailed,
    NotApproved,
    Submission,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DepositCode {
    NotFound,
    Mismatch,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthCode {
    Cancelled,
    Decryption,
    ReauthenticationRequired,
    SessionExpired,
    SessionConflict,
    KeyDerivation,
    AccountNotFound,
    AccountExists,
}

#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize)]
#[serde(tag = "category", rename_all = "camelCase")]
pub enum WalletError {
    #[error("{message}")]
    Blockchain {
        code: BlockchainCode,
        message: String,
        recoverable: bool,
    },

    #[error("{message}")]
    Storage {
        code: StorageCode,
        message: String,
        recoverable: bool,
    },

    #[error("{message}")]
    Indexer {
        code: IndexerCode,
        message: String,
        recoverable: bool,
    },

    #[error("{message}")]
    Network {
        code: NetworkCode,
        message: String,
        recoverable: bool,
    },

    #[error("{message}")]
    Withdrawal {
        code: WithdrawalCode,
        message: String,
        recoverable: bool,
    },

    #[error("{message}")]
    Deposit {
        code: DepositCode,
        message: String,
        recoverable: bool,
    },

    #[error("{message}")]
    Auth {
        code: AuthCode,
        message: String,
        recoverable: bool,
    },
}

impl WalletError {
    pub fn message(&self) -> &str {
        match self {
            Self::Blockchain { message, .. }
            | Self::Storage { message, .. }
            | Self::Indexer { message, .. }
            | Self::Network { message, .. }
            | Self::Withdrawal { message, .. }
            | Self::Deposit { message, .. }
            | Self::Auth { message, .. } => message,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Blockchain { recoverable, .. }
            | Self::Storage { recoverable, .. }
            | Self::Indexer { recoverable, .. }
            | Self::Network { recoverable, .. }
            | Self::Withdrawal { recoverable, .. }
            | Self::Deposit { recoverable, .. }
            | Self::Auth { recoverable, .. } => *recoverable,
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            Self::Blockchain {
                code: BlockchainCode::UserRejected,
                ..
            } | Self::Auth {
                code: AuthCode::Cancelled,
                ..
            }
        )
    }

    /// Whether the user should see this error. Infrastructure trouble is
    /// logged only; cancellations are never shown.
    pub fn is_user_visible(&self) -> bool {
        if self.is_cancellation() {
            return false;
        }
        match self {
            Self::Blockchain { .. } | Self::Withdrawal { .. } | Self::Deposit { .. } => true,
            Self::Auth { recoverable, .. } => !recoverable,
            Self::Storage { .. } | Self::Indexer { .. } | Self::Network { .. } => false,
        }
    }

    /// Best-effort categorization of an untyped failure message.
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();
        if is_cancellation_text(&lower) {
            return Self::Blockchain {
                code: BlockchainCode::UserRejected,
                message: message.to_string(),
                recoverable: true,
            };
        }
        if lower.contains("timeout") || lower.contains("timed out") {
            return Self::Network {
                code: NetworkCode::Timeout,
                message: message.to_string(),
                recoverable: true,
            };
        }
        match RelayError::classify(message) {
            RelayError::Network(_) => Self::Network {
                code: NetworkCode::Unreachable,
                message: message.to_string(),
                recoverable: true,
            },
            other => other.into(),
        }
    }

    fn auth(code: AuthCode, message: String, recoverable: bool) -> Self {
        Self::Auth {
            code,
            message,
            recoverable,
        }
    }
}

impl From<SessionError> for WalletError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::AlreadyActive { .. } => {
                Self::auth(AuthCode::SessionConflict, err.to_string(), true)
            }
            SessionError::Expired => Self::auth(AuthCode::SessionExpired, err.to_string(), false),
        }
    }
}

impl From<StoreError> for WalletError {
    fn from(err: StoreError) -> Self {
        let code = match err {
            StoreError::Serialization(_) => StorageCode::Corrupt,
            _ => StorageCode::Database,
        };
        Self::Storage {
            code,
            message: err.to_string(),
            recoverable: false,
        }
    }
}

impl From<VaultError> for WalletError {
    fn from(err: VaultError) -> Self {
        let recoverable = err.is_recoverable();
        let message = err.to_string();
        match err {
            VaultError::Cancelled => Self::auth(AuthCode::Cancelled, message, true),
            VaultError::Decryption { .. } => Self::auth(AuthCode::Decryption, message, recoverable),
            VaultError::ReauthenticationRequired { .. } => {
                Self::auth(AuthCode::ReauthenticationRequired, message, recoverable)
            }
            VaultError::KeyDerivation(_) | VaultError::PasskeyNotRegistered(_) => {
                Self::auth(AuthCode::KeyDerivation, message, recoverable)
            }
            VaultError::AccountNotFound(_) => {
                Self::auth(AuthCode::AccountNotFound, message, recoverable)
            }
            VaultError::AccountExists(_) => Self::auth(AuthCode::AccountExists, message, recoverable),
            VaultError::Session(e) => e.into(),
            VaultError::Store(e) => e.into(),
            VaultError::Encryption(_) | VaultError::Payload(_) | VaultError::Key(_) => {
                Self::Storage {
                    code: StorageCode::Corrupt,
                    message,
                    recoverable,
                }
            }
        }
    }
}

impl From<RpcError> for WalletError {
    fn from(err: RpcError) -> Self {
        let recoverable = err.is_retryable();
        match err {
            RpcError::Transport(_) => Self::Network {
                code: NetworkCode::Unreachable,
                message: err.to_string(),
                recoverable,
            },
            RpcError::Rpc { .. } | RpcError::MissingResult | RpcError::ParseFailed(_) => {
                Self::Blockchain {
                    code: BlockchainCode::Rpc,
                    message: err.to_string(),
                    recoverable,
                }
            }
        }
    }
}

impl From<RemoteLogError> for WalletError {
    fn from(err: RemoteLogError) -> Self {
        let recoverable = err.is_retryable();
        let message = err.to_string();
        match err {
            RemoteLogError::Rpc(e) => e.into(),
            RemoteLogError::Http(_) | RemoteLogError::NotFound(_) => Self::Indexer {
                code: IndexerCode::Unavailable,
                message,
                recoverable,
            },
            RemoteLogError::Decode(_) => Self::Indexer {
                code: IndexerCode::Malformed,
                message,
                recoverable,
            },
        }
    }
}

impl From<DiscoveryError> for WalletError {
    fn from(err: DiscoveryError) -> Self {
        let recoverable = err.is_retryable();
        let message = err.to_string();
        match err {
            DiscoveryError::Remote(e) => e.into(),
            DiscoveryError::Cache(_) => Self::Storage {
                code: StorageCode::Cache,
                message,
                recoverable,
            },
            DiscoveryError::Note(_) => Self::Deposit {
                code: DepositCode::Mismatch,
                message,
                recoverable,
            },
            DiscoveryError::Session(e) => e.into(),
            DiscoveryError::Worker(_) => Self::Storage {
                code: StorageCode::Cache,
                message,
                recoverable,
            },
            DiscoveryError::Cancelled => Self::auth(AuthCode::Cancelled, message, true),
        }
    }
}

impl From<ProofError> for WalletError {
    fn from(err: ProofError) -> Self {
        Self::Withdrawal {
            code: WithdrawalCode::ProofFailed,
            message: err.to_string(),
            recoverable: true,
        }
    }
}

impl From<RelayError> for WalletError {
    fn from(err: RelayError) -> Self {
        let recoverable = err.is_retryable() || err.is_cancellation();
        let message = err.to_string();
        match err {
            RelayError::UserRejected(_) => Self::Blockchain {
                code: BlockchainCode::UserRejected,
                message,
                recoverable,
            },
            RelayError::InsufficientFunds(_) => Self::Blockchain {
                code: BlockchainCode::InsufficientFunds,
                message,
                recoverable,
            },
            RelayError::Reverted(_) | RelayError::Paymaster(_) => Self::Blockchain {
                code: BlockchainCode::Reverted,
                message,
                recoverable,
            },
            RelayError::Timeout(_) => Self::Blockchain {
                code: BlockchainCode::ReceiptTimeout,
                message,
                recoverable,
            },
            RelayError::Network(_) | RelayError::Malformed(_) => Self::Network {
                code: NetworkCode::Http,
                message,
                recoverable,
            },
            RelayError::Signing(_) => Self::Withdrawal {
                code: WithdrawalCode::Submission,
                message,
                recoverable,
            },
        }
    }
}

impl From<TrackingError> for WalletError {
    fn from(err: TrackingError) -> Self {
        let message = err.to_string();
        match err {
            TrackingError::ReceiptTimeout { .. } => Self::Blockchain {
                code: BlockchainCode::ReceiptTimeout,
                message,
                recoverable: true,
            },
            TrackingError::Receipt(_) => Self::Blockchain {
                code: BlockchainCode::Rpc,
                message,
                recoverable: true,
            },
            TrackingError::Indexer(_) => Self::Indexer {
                code: IndexerCode::Lagging,
                message,
                recoverable: true,
            },
        }
    }
}

impl From<WithdrawalError> for WalletError {
    fn from(err: WithdrawalError) -> Self {
        let recoverable = err.is_retryable();
        let message = err.to_string();
        match err {
            WithdrawalError::Invalid(_) | WithdrawalError::Fees(_) | WithdrawalError::UnknownPool(_) => {
                Self::Withdrawal {
                    code: WithdrawalCode::Invalid,
                    message,
                    recoverable: false,
                }
            }
            WithdrawalError::Session(e) => e.into(),
            WithdrawalError::NotApproved { .. } => Self::Withdrawal {
                code: WithdrawalCode::NotApproved,
                message,
                recoverable: false,
            },
            WithdrawalError::Remote(e) => e.into(),
            WithdrawalError::ProofGenerationFailed { .. } => Self::Withdrawal {
                code: WithdrawalCode::ProofFailed,
                message,
                recoverable: true,
            },
            WithdrawalError::Submission { source, .. } => {
                let mut lifted: WalletError = source.into();
                // keep the amount context from the outer message
                match &mut lifted {
                    Self::Blockchain { message: m, .. }
                    | Self::Network { message: m, .. }
                    | Self::Withdrawal { message: m, .. } => *m = message,
                    _ => {}
                }
                lifted
            }
            WithdrawalError::Reverted { .. } => Self::Blockchain {
                code: BlockchainCode::Reverted,
                message,
                recoverable,
            },
            WithdrawalError::Cancelled => Self::Blockchain {
                code: BlockchainCode::UserRejected,
                message,
                recoverable: true,
            },
        }
    }
}
