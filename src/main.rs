use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use income_wallet::clock::SystemClock;
use income_wallet::gateway::{
    Address, FallbackTransport, HttpTransport, LedgerTransport, RpcLedger,
};
use income_wallet::host::UnavailableHost;
use income_wallet::storage::FileStore;
use income_wallet::{IncomeSession, SessionDeps, SessionSnapshot, WalletConfig};

const DISPLAY_DECIMALS: u32 = 5;

#[derive(Parser)]
#[command(author, version, about = "Basic income claimable balance tracker")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Track the claimable income of an address until interrupted
    Watch {
        #[arg(short, long)]
        address: Address,
        #[arg(short, long, default_value = "config/income-wallet.toml")]
        config: PathBuf,
    },
    /// Generate a default configuration file
    GenerateConfig {
        #[arg(short, long, default_value = "config/income-wallet.toml")]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Watch { address, config } => watch(address, config).await?,
        Commands::GenerateConfig { path } => generate_config(path)?,
    }

    Ok(())
}

async fn watch(address: Address, config_path: PathBuf) -> Result<()> {
    let config = if config_path.exists() {
        WalletConfig::load(&config_path)?
    } else {
        WalletConfig::default()
    };

    let timeout = config.gateway.request_timeout();
    let endpoints = config
        .gateway
        .endpoints
        .iter()
        .map(|endpoint| {
            HttpTransport::from_endpoint(endpoint, timeout)
                .map(|transport| Arc::new(transport) as Arc<dyn LedgerTransport>)
                .with_context(|| format!("invalid gateway endpoint {endpoint}"))
        })
        .collect::<Result<Vec<_>>>()?;
    let transport = FallbackTransport::new(endpoints, config.gateway.retry_policy());
    let ledger = RpcLedger::new(Arc::new(transport))
        .with_log_poll_interval(config.gateway.log_poll_interval());
    let store = FileStore::open(&config.storage.mirror_path).with_context(|| {
        format!(
            "unable to open mirror at {}",
            config.storage.mirror_path.display()
        )
    })?;
    let host = Arc::new(UnavailableHost);

    let session = IncomeSession::start(
        config.session_settings(),
        SessionDeps {
            ledger: Arc::new(ledger),
            signer: host.clone(),
            receipts: host,
            store: Arc::new(store),
            clock: Arc::new(SystemClock),
        },
    );
    session.bind_address(address)?;
    info!(%address, "watching basic income");

    let mut updates = session.updates();
    let shutdown = signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown signal received");
                break;
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = updates.borrow_and_update().clone();
                log_snapshot(&snapshot);
            }
        }
    }

    session.shutdown().await?;
    Ok(())
}

fn log_snapshot(snapshot: &SessionSnapshot) {
    let render = |amount: Option<income_wallet::TokenAmount>| {
        amount
            .map(|amount| amount.format_fixed(DISPLAY_DECIMALS))
            .unwrap_or_else(|| "-".to_string())
    };
    info!(
        basic = %render(snapshot.basic.displayed),
        basic_phase = snapshot.basic.phase.as_str(),
        plus = %render(snapshot.plus.displayed),
        plus_phase = snapshot.plus.phase.as_str(),
        balance = %render(snapshot.token_balance),
        reward_count = ?snapshot.reward_count,
        "claimable income"
    );
}

fn generate_config(path: PathBuf) -> Result<()> {
    let config = WalletConfig::default();
    config.save(&path)?;
    info!(?path, "wrote default configuration");
    Ok(())
}
