//! Vault Harness - multi-chain vault setup and governance tooling
//!
//! Drives the one-time vault setup of a validator network across its control
//! chain and the Polkadot, Bitcoin, Arbitrum and Solana vault chains, and
//! provides operator helpers for safe mode and test transfers.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::signal;
use tracing::{error, info};

mod chain;
mod config;
mod coordination;
mod deferred;
mod error;
mod events;
mod helpers;
mod localnet;
mod metrics;
mod tx;

use config::Settings;
use coordination::{rpc_asset_sender, Harness};
use error::{HarnessError, HarnessResult};
use helpers::{no_substrate_backend, safe_mode::build_update, set_safe_mode, Asset, SafeModeLevel};
use metrics::MetricsServer;

#[derive(Parser)]
#[clap(rename_all = "kebab-case", author, version, about)]
struct Args {
    /// Configuration file (defaults to $VAULT_HARNESS_CONFIG, then config/default.toml)
    #[clap(long, global = true)]
    config: Option<PathBuf>,

    /// Run the control and relay chains on an in-process localnet. Without
    /// it only `send` of BTC, ETH, USDC and FLIP over RPC backends works.
    #[clap(long, global = true)]
    localnet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the initial vault setup through to the first new epoch
    SetupVaults,
    /// Set the runtime safe mode through governance
    SafeMode {
        #[clap(value_enum)]
        level: SafeModeLevel,
        /// Amber feature flags, `<pallet>_<feature>`
        flags: Vec<String>,
    },
    /// Send an asset to an address
    Send {
        asset: String,
        address: String,
        /// Defaults to a per-asset test amount
        amount: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    let args = Args::parse();

    info!("Starting Vault Harness v{}", env!("CARGO_PKG_VERSION"));

    let settings = match Settings::load(args.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            error!("Configuration error: {:#}", e);
            return ExitCode::from(255);
        }
    };

    let metrics_handle = settings.metrics.enabled.then(|| {
        let server = MetricsServer::new(settings.metrics.port);
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        })
    });

    let outcome = run(args.command, args.localnet, &settings).await;

    if let Some(handle) = metrics_handle {
        handle.abort();
    }

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if e.is_malformed_input() {
                error!("Invalid input: {}", e);
            } else {
                error!("Vault harness failed: {}", e);
            }
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run(command: Command, localnet: bool, settings: &Settings) -> HarnessResult<()> {
    // Validate operator input before connecting to anything
    let request = match command {
        Command::SafeMode { level, flags } => Request::SafeMode(build_update(level, &flags)?),
        Command::Send {
            asset,
            address,
            amount,
        } => Request::Send(asset.parse::<Asset>()?, address, amount),
        Command::SetupVaults => Request::SetupVaults,
    };

    if !localnet {
        return match request {
            Request::Send(asset, address, amount) => {
                let sender = rpc_asset_sender(settings, asset).await?;
                tokio::select! {
                    result = sender.send(asset, &address, amount.as_deref()) => {
                        result.map(|reference| info!("Sent {} to {}: {}", asset, address, reference))
                    }
                    _ = shutdown_signal() => Err(HarnessError::Abandoned),
                }
            }
            _ => Err(no_substrate_backend()),
        };
    }

    let harness = Harness::start_localnet(settings).await?;
    harness
        .run_until_interrupted(execute(&harness, request, settings), shutdown_signal())
        .await
}

async fn execute(harness: &Harness, request: Request, settings: &Settings) -> HarnessResult<()> {
    match request {
        Request::SetupVaults => harness
            .vault_setup(settings)
            .run()
            .await
            .map(|report| info!("Vault setup finished at epoch {}", report.epoch)),
        Request::SafeMode(update) => set_safe_mode(&harness.observer, &harness.governance, update)
            .await
            .map(|event| info!("Safe mode updated in block {}", event.block_number)),
        Request::Send(asset, address, amount) => harness
            .asset_sender()
            .send(asset, &address, amount.as_deref())
            .await
            .map(|reference| info!("Sent {} to {}: {}", asset, address, reference)),
    }
}

enum Request {
    SetupVaults,
    SafeMode(tx::SafeModeUpdate),
    Send(Asset, String, Option<String>),
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,vault_harness=debug,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Interrupted"),
        _ = terminate => info!("Terminated"),
    }
}
