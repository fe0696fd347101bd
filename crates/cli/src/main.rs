//! Tidepool command line wallet
//!
//! Usage:
//!   tidepool <COMMAND> [OPTIONS]
//!
//! Example:
//!   TIDEPOOL_PASSWORD=hunter2 tidepool sync
//!   tidepool quote --amount 0.5 --cross-chain 10

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use alloy_primitives::Address;
use anyhow::{anyhow, bail, Context};
use tidepool_core::{format_amount, parse_amount, Note, Route};
use tidepool_vault::{LocalStore, SessionHandle, Vault};
use tidepool_wallet::relay::LocalSigner;
use tidepool_wallet::{
    BundlerClient, DiscoveryEngine, ErrorReporter, HttpIndexerStatus, HttpProofGenerator,
    JsonRpcClient, PaymasterClient, PoolConfig, RpcReceiptSource, RpcRemoteLog, SessionLedger,
    SubmitOutcome, TrackingStatus, TransactionTracker, WalletConfig, WalletError,
    WithdrawalOrchestrator, WithdrawalRequest,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Default)]
struct Args {
    command: String,
    db: Option<PathBuf>,
    account: Option<String>,
    pool: Option<Address>,
    amount: Option<String>,
    to: Option<String>,
    deposit_index: Option<u64>,
    cross_chain: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            env::var("RUST_LOG").unwrap_or_else(|_| "info,tidepool=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = parse_args(env::args().collect())?;
    let mut config = WalletConfig::from_env()?;
    if let Some(db) = &args.db {
        config.db_path = db.clone();
    }

    match args.command.as_str() {
        "init" => init(&config).await,
        "sync" => sync(&config, &args).await,
        "quote" => quote(&config, &args),
        "withdraw" => withdraw(&config, &args).await,
        _ => {
            print_help();
            Ok(())
        }
    }
}

fn parse_args(args: Vec<String>) -> anyhow::Result<Args> {
    let mut parsed = Args::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--db" | "-d" => {
                i += 1;
                parsed.db = args.get(i).map(PathBuf::from);
            }
            "--account" => {
                i += 1;
                parsed.account = args.get(i).cloned();
            }
            "--pool" | "-p" => {
                i += 1;
                let raw = args.get(i).map(String::as_str).unwrap_or_default();
                parsed.pool = Some(raw.parse().with_context(|| format!("invalid pool {raw}"))?);
            }
            "--amount" | "-a" => {
                i += 1;
                parsed.amount = args.get(i).cloned();
            }
            "--to" => {
                i += 1;
                parsed.to = args.get(i).cloned();
            }
            "--deposit-index" => {
                i += 1;
                parsed.deposit_index = args.get(i).and_then(|s| s.parse().ok());
            }
            "--cross-chain" => {
                i += 1;
                parsed.cross_chain = args.get(i).and_then(|s| s.parse().ok());
            }
            "--help" | "-h" => parsed.command = "help".into(),
            other if parsed.command.is_empty() && !other.starts_with('-') => {
                parsed.command = other.to_string();
            }
            other => tracing::warn!("Ignoring unknown argument {}", other),
        }
        i += 1;
    }

    Ok(parsed)
}

fn open_vault(config: &WalletConfig) -> anyhow::Result<Vault> {
    let store = LocalStore::open(&config.db_path)
        .with_context(|| format!("opening {}", config.db_path.display()))?;
    Ok(Vault::new(Arc::new(store)))
}

fn password() -> anyhow::Result<String> {
    env::var("TIDEPOOL_PASSWORD").map_err(|_| anyhow!("TIDEPOOL_PASSWORD is not set"))
}

async fn unlock(vault: &Vault, args: &Args) -> anyhow::Result<SessionHandle> {
    let account_id = match &args.account {
        Some(id) => id.clone(),
        None => vault
            .resume_pointer()?
            .map(|p| p.account_id)
            .ok_or_else(|| anyhow!("no account on this device; run `tidepool init` first"))?,
    };
    Ok(vault.unlock_with_password(&account_id, &password()?).await?)
}

fn select_pool<'a>(config: &'a WalletConfig, args: &Args) -> anyhow::Result<&'a PoolConfig> {
    match args.pool {
        Some(address) => config
            .pool(address)
            .ok_or_else(|| anyhow!("pool {address} is not in TIDEPOOL_POOLS")),
        None => config
            .pools
            .first()
            .ok_or_else(|| anyhow!("TIDEPOOL_POOLS is empty")),
    }
}

fn remote_log(config: &WalletConfig) -> Arc<RpcRemoteLog> {
    let log = config.pools.iter().fold(
        RpcRemoteLog::new(&config.rpc_url, &config.asp_url, &config.ipfs_gateway),
        |log, pool| log.with_pool(pool.address, pool.deployment_block),
    );
    Arc::new(log)
}

fn discovery(config: &WalletConfig, vault: &Vault, log: Arc<RpcRemoteLog>) -> Arc<DiscoveryEngine> {
    Arc::new(DiscoveryEngine::new(
        log,
        vault.store().clone(),
        config.gap_threshold,
        config.page_size,
    ))
}

async fn init(config: &WalletConfig) -> anyhow::Result<()> {
    let vault = open_vault(config)?;
    let session = vault.create_password_account(&password()?).await?;

    println!("Account:    {}", session.account_id());
    println!("Public key: {}", session.public_key().await?);
    Ok(())
}

async fn sync(config: &WalletConfig, args: &Args) -> anyhow::Result<()> {
    let vault = open_vault(config)?;
    let session = unlock(&vault, args).await?;
    let engine = discovery(config, &vault, remote_log(config));
    let reporter = ErrorReporter::default();

    let pools: Vec<&PoolConfig> = match args.pool {
        Some(_) => vec![select_pool(config, args)?],
        None => config.pools.iter().collect(),
    };

    for pool in pools {
        let outcome = match engine.discover(&session, pool).await {
            Ok(outcome) => outcome,
            Err(e) => {
                reporter.report("sync", &WalletError::from(e));
                continue;
            }
        };
        let Some(state) = outcome.state() else {
            continue;
        };

        println!("Pool {} (chain {})", pool.address, pool.chain_id);
        for chain in &state.chains {
            for note in chain.available_notes() {
                print_note(note);
            }
        }
        println!("  Balance: {} ETH", format_amount(state.balance()));
    }

    Ok(())
}

fn print_note(note: &Note) {
    println!(
        "  deposit {:>3}  change {:>3}  {:?}  {} ETH",
        note.deposit_index,
        note.change_index,
        note.kind,
        format_amount(note.amount)
    );
}

fn route(args: &Args) -> Route {
    match args.cross_chain {
        Some(destination_chain_id) => Route::CrossChain {
            destination_chain_id,
        },
        None => Route::SameChain,
    }
}

fn quote(config: &WalletConfig, args: &Args) -> anyhow::Result<()> {
    let pool = select_pool(config, args)?;
    let raw = args.amount.as_deref().ok_or_else(|| anyhow!("--amount is required"))?;
    let quote = config.fees.quote(parse_amount(raw)?, route(args), pool.chain_id)?;

    println!("Withdraw:      {} ETH", format_amount(quote.withdraw_amount));
    println!("Execution fee: {} ETH", format_amount(quote.execution_fee));
    println!("Solver fee:    {} ETH", format_amount(quote.solver_fee));
    println!("You receive:   {} ETH", format_amount(quote.you_receive));
    Ok(())
}

async fn withdraw(config: &WalletConfig, args: &Args) -> anyhow::Result<()> {
    let pool = select_pool(config, args)?.clone();
    let amount = parse_amount(args.amount.as_deref().ok_or_else(|| anyhow!("--amount is required"))?)?;
    let recipient = args.to.clone().ok_or_else(|| anyhow!("--to is required"))?;
    let deposit_index = args
        .deposit_index
        .ok_or_else(|| anyhow!("--deposit-index is required"))?;

    let vault = open_vault(config)?;
    let session = unlock(&vault, args).await?;
    let log = remote_log(config);
    let engine = discovery(config, &vault, log.clone());
    let reporter = ErrorReporter::default();

    let outcome = engine.discover(&session, &pool).await?;
    let note = outcome
        .state()
        .and_then(|s| s.chain(deposit_index))
        .and_then(|c| c.available_notes().next().cloned());

    let token = CancellationToken::new();
    let on_interrupt = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let signer = LocalSigner::new(session.signing_key().await?);
    let relay = BundlerClient::new(
        JsonRpcClient::new(&config.rpc_url),
        JsonRpcClient::new(&config.bundler_url),
        config.entry_point,
        pool.chain_id,
        config.account,
        signer,
    );
    let paymaster = PaymasterClient::new(
        JsonRpcClient::new(&config.paymaster_url),
        config.entry_point,
        pool.chain_id,
    );
    let orchestrator = WithdrawalOrchestrator::new(
        log,
        Arc::new(HttpProofGenerator::new(&config.prover_url)),
        Arc::new(relay),
        Arc::new(paymaster),
        config,
    );

    let request = WithdrawalRequest {
        note,
        amount,
        recipient,
        route: route(args),
    };
    let prepared = match orchestrator.prepare(&session, &request, &token).await {
        Ok(prepared) => prepared,
        Err(e) => {
            reporter.report("withdraw", &WalletError::from(e));
            bail!("withdrawal not prepared");
        }
    };
    println!("You receive {} ETH", format_amount(prepared.quote().you_receive));

    let submission = match orchestrator.submit(prepared, &token).await {
        Ok(SubmitOutcome::Submitted(submission)) => submission,
        Ok(SubmitOutcome::Cancelled) => {
            println!("Cancelled");
            return Ok(());
        }
        Err(e) => {
            reporter.report("withdraw", &WalletError::from(e));
            bail!("withdrawal not submitted");
        }
    };
    println!("Submitted {} in block {}", submission.tx_hash, submission.block_number);

    let tracker = TransactionTracker::new(
        Arc::new(RpcReceiptSource::new(JsonRpcClient::new(&config.rpc_url))),
        Arc::new(HttpIndexerStatus::new(&config.indexer_url)),
        Arc::new(SessionLedger::new(engine.clone(), session.clone(), vec![pool.clone()])),
        config.tracking,
    );
    let mut synced = tracker.subscribe_synced();
    let mut updates = tracker.subscribe();
    tracker.track_transaction(submission.tx_hash, submission.chain_id);

    let status = loop {
        let status = tracker.status();
        if status.is_terminal() || status == TrackingStatus::Idle {
            break status;
        }
        if updates.changed().await.is_err() {
            break tracker.status();
        }
    };
    println!("Transaction {status:?}");

    if status == TrackingStatus::Synced && synced.recv().await.is_ok() {
        if let Some(state) = engine.discover(&session, &pool).await?.state() {
            println!("Balance: {} ETH", format_amount(state.balance()));
        }
    }
    Ok(())
}

fn print_help() {
    println!(
        r#"Tidepool privacy pool wallet

USAGE:
    tidepool <COMMAND> [OPTIONS]

COMMANDS:
    init        Create a password account on this device
    sync        Discover notes and print balances
    quote       Show the fee breakdown for a withdrawal
    withdraw    Prove, submit and track a withdrawal
    help        Print help

OPTIONS:
    -d, --db <PATH>             Local database path
                                Default: $TIDEPOOL_DB_PATH or ./tidepool-data
        --account <ID>          Account to unlock
                                Default: the last account used on this device
    -p, --pool <ADDRESS>        Pool to act on
                                Default: first entry of TIDEPOOL_POOLS
    -a, --amount <ETH>          Amount, e.g. 0.5
        --to <ADDRESS>          Withdrawal recipient
        --deposit-index <N>     Note chain to withdraw from
        --cross-chain <ID>      Destination chain for a cross-chain withdrawal
    -h, --help                  Print help

ENVIRONMENT VARIABLES:
    TIDEPOOL_PASSWORD
        Account password for init and unlock
    TIDEPOOL_POOLS
        Comma separated address:chain_id:scope[:deployment_block]
    TIDEPOOL_RPC_URL, TIDEPOOL_BUNDLER_URL, TIDEPOOL_PAYMASTER_URL,
    TIDEPOOL_INDEXER_URL, TIDEPOOL_ASP_URL, TIDEPOOL_IPFS_GATEWAY,
    TIDEPOOL_PROVER_URL
        Service endpoints
    RUST_LOG
        Logging level (default: info,tidepool=debug)

EXAMPLE:
    # Fee breakdown for a cross-chain withdrawal of 0.5 ETH
    tidepool quote --amount 0.5 --cross-chain 10

    # Withdraw from deposit 0 to a fresh address
    tidepool withdraw --deposit-index 0 --amount 0.2 --to 0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed
"#
    );
}
