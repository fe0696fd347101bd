use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use alloy_primitives::{Address, U256};
use thiserror::Error;
use tidepool_core::FeeSchedule;

use crate::discovery::DEFAULT_GAP_THRESHOLD;
use crate::tracking::TrackingTimeouts;

/// ERC-4337 v0.7 entry point, same address on every chain.
pub const ENTRY_POINT_V07: Address =
    alloy_primitives::address!("0000000071727De22E5E9d8BAf0edAc6f37da032");

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid pool entry {0:?}: expected address:chain_id:scope[:deployment_block]")]
    InvalidPool(String),
}

/// One privacy pool the wallet follows.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    pub address: Address,
    pub chain_id: u64,
    pub scope: U256,
    /// First block worth scanning.
    pub deployment_block: u64,
}

impl FromStr for PoolConfig {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidPool(raw.to_string());
        let parts: Vec<&str> = raw.trim().split(':').collect();
        if parts.len() != 3 && parts.len() != 4 {
            return Err(invalid());
        }

        Ok(Self {
            address: parts[0].parse().map_err(|_| invalid())?,
            chain_id: parts[1].parse().map_err(|_| invalid())?,
            scope: U256::from_str(parts[2]).map_err(|_| invalid())?,
            deployment_block: match parts.get(3) {
                Some(block) => block.parse().map_err(|_| invalid())?,
                None => 0,
            },
        })
    }
}

/// Wallet configuration
#[derive(Clone, Debug)]
pub struct WalletConfig {
    /// Node JSON-RPC endpoint
    pub rpc_url: String,

    /// ERC-4337 bundler endpoint
    pub bundler_url: String,

    /// ERC-7677 paymaster endpoint
    pub paymaster_url: String,

    /// Indexer base URL, used for indexing status
    pub indexer_url: String,

    /// Approved-set service base URL
    pub asp_url: String,

    /// IPFS gateway for approved-set label lists
    pub ipfs_gateway: String,

    /// Proof service base URL
    pub prover_url: String,

    /// Local database path for records and discovery cache
    pub db_path: PathBuf,

    /// Consecutive unused deposit indices before discovery stops
    pub gap_threshold: u64,

    /// Blocks per event page
    pub page_size: u64,

    pub fees: FeeSchedule,

    /// Privacy pool entrypoint that relays withdrawals
    pub pool_entrypoint: Address,

    /// ERC-4337 entry point
    pub entry_point: Address,

    /// Smart account that sends user operations
    pub account: Address,

    pub fee_recipient: Address,

    pub receipt_timeout: Duration,

    pub tracking: TrackingTimeouts,

    pub pools: Vec<PoolConfig>,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://127.0.0.1:8545".into(),
            bundler_url: "http://127.0.0.1:4337".into(),
            paymaster_url: "http://127.0.0.1:4338".into(),
            indexer_url: "http://127.0.0.1:4000".into(),
            asp_url: "http://127.0.0.1:4000".into(),
            ipfs_gateway: "https://ipfs.io".into(),
            prover_url: "http://127.0.0.1:3001".into(),
            db_path: PathBuf::from("./tidepool-data"),
            gap_threshold: DEFAULT_GAP_THRESHOLD,
            page_size: 5_000,
            fees: FeeSchedule {
                relay_fee_bps: 500,
                solver_fee_bps: 500,
            },
            pool_entrypoint: Address::ZERO,
            entry_point: ENTRY_POINT_V07,
            account: Address::ZERO,
            fee_recipient: Address::ZERO,
            receipt_timeout: Duration::from_secs(60),
            tracking: TrackingTimeouts::default(),
            pools: Vec::new(),
        }
    }
}

impl WalletConfig {
    /// Load configuration from environment variables
    ///
    /// Unparseable values keep their default. A malformed pool entry is an
    /// error since silently dropping a pool hides funds.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        let string = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());

        if let Some(val) = string("TIDEPOOL_RPC_URL") {
            config.rpc_url = val;
        }
        if let Some(val) = string("TIDEPOOL_BUNDLER_URL") {
            config.bundler_url = val;
        }
        if let Some(val) = string("TIDEPOOL_PAYMASTER_URL") {
            config.paymaster_url = val;
        }
        if let Some(val) = string("TIDEPOOL_INDEXER_URL") {
            config.indexer_url = val;
        }
        if let Some(val) = string("TIDEPOOL_ASP_URL") {
            config.asp_url = val;
        }
        if let Some(val) = string("TIDEPOOL_IPFS_GATEWAY") {
            config.ipfs_gateway = val;
        }
        if let Some(val) = string("TIDEPOOL_PROVER_URL") {
            config.prover_url = val;
        }
        if let Some(val) = string("TIDEPOOL_DB_PATH") {
            config.db_path = PathBuf::from(val);
        }

        if let Some(val) = string("TIDEPOOL_GAP_THRESHOLD") {
            if let Ok(gap) = val.parse::<u64>() {
                config.gap_threshold = gap.max(1);
            }
        }
        if let Some(val) = string("TIDEPOOL_PAGE_SIZE") {
            if let Ok(size) = val.parse::<u64>() {
                config.page_size = size.max(1);
            }
        }
        if let Some(val) = string("TIDEPOOL_RELAY_FEE_BPS") {
            if let Ok(bps) = val.parse() {
                config.fees.relay_fee_bps = bps;
            }
        }
        if let Some(val) = string("TIDEPOOL_SOLVER_FEE_BPS") {
            if let Ok(bps) = val.parse() {
                config.fees.solver_fee_bps = bps;
            }
        }

        for (name, slot) in [
            ("TIDEPOOL_POOL_ENTRYPOINT", &mut config.pool_entrypoint),
            ("TIDEPOOL_ENTRY_POINT", &mut config.entry_point),
            ("TIDEPOOL_ACCOUNT", &mut config.account),
            ("TIDEPOOL_FEE_RECIPIENT", &mut config.fee_recipient),
        ] {
            if let Some(val) = string(name) {
                if let Ok(addr) = val.parse() {
                    *slot = addr;
                }
            }
        }

        let seconds = |name: &str| {
            string(name)
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
        };
        if let Some(d) = seconds("TIDEPOOL_RECEIPT_TIMEOUT_SECS") {
            config.receipt_timeout = d;
            config.tracking.receipt = d;
        }
        if let Some(d) = seconds("TIDEPOOL_POLL_INTERVAL_SECS") {
            config.tracking.poll_interval = d;
        }
        if let Some(d) = seconds("TIDEPOOL_PENDING_TIMEOUT_SECS") {
            config.tracking.pending_timeout = d;
        }
        if let Some(d) = seconds("TIDEPOOL_TERMINAL_CLEAR_SECS") {
            config.tracking.terminal_clear_delay = d;
        }

        if let Some(val) = string("TIDEPOOL_POOLS") {
            config.pools = parse_pools(&val)?;
        }

        Ok(config)
    }

    pub fn pool(&self, address: Address) -> Option<&PoolConfig> {
        self.pools.iter().find(|p| p.address == address)
    }
}

/// Comma separated `address:chain_id:scope[:deployment_block]` entries.
pub fn parse_pools(raw: &str) -> Result<Vec<PoolConfig>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::parse)
        .collect()
}
