//! Gauntlet - turn queue & settlement daemon
//!
//! Runs the sweep worker against the shared game store: expires overdue
//! turns, finishes interrupted settlements. The HTTP surface that feeds
//! player actions into the same store is a sibling service.

use anyhow::Result;
use clap::Parser;
use dotenv::dotenv;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gauntlet_backend::engine::{
    AddressResolver, GameStore, HubResolverClient, LogNotifier, Notifier, PaperAddressBook,
    PaperTransfer, PushNotifierClient, SettlementResolver, SweepWorker, SweepWorkerConfig,
    TokenTransfer, TreasuryClient, TurnEngine,
};
use gauntlet_backend::EngineConfig;

#[derive(Parser, Debug)]
#[command(name = "gauntletd", about = "Turn queue & settlement sweep daemon")]
struct Args {
    /// SQLite database path (overrides GAUNTLET_DB_PATH)
    #[arg(long)]
    db: Option<String>,

    /// Seconds between sweep passes
    #[arg(long)]
    sweep_interval: Option<u64>,

    /// Use paper collaborators instead of the HTTP hub/treasury
    #[arg(long)]
    paper: bool,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gauntlet_backend=info,gauntletd=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    init_tracing();

    let args = Args::parse();
    let mut config = EngineConfig::from_env();
    if let Some(db) = args.db {
        config.db_path = db;
    }
    if let Some(secs) = args.sweep_interval {
        config.sweep_interval_secs = secs;
    }
    if args.paper {
        config.paper = true;
    }

    info!(
        db = %config.db_path,
        sweep_interval_secs = config.sweep_interval_secs,
        paper = config.paper,
        "starting gauntletd"
    );

    let store = GameStore::new(&config.db_path)?;

    let addresses: Arc<dyn AddressResolver>;
    let transfers: Arc<dyn TokenTransfer>;
    let notifier: Arc<dyn Notifier>;
    if config.paper {
        addresses = Arc::new(PaperAddressBook);
        transfers = Arc::new(PaperTransfer::new());
        notifier = Arc::new(LogNotifier);
    } else {
        addresses = Arc::new(HubResolverClient::new(
            &config.hub_base_url,
            &config.hub_api_key,
        )?);
        transfers = Arc::new(TreasuryClient::new(
            &config.treasury_base_url,
            &config.treasury_api_key,
        )?);
        notifier = Arc::new(PushNotifierClient::new(
            &config.notify_base_url,
            &config.notify_api_key,
        )?);
    }

    let engine = TurnEngine::new(store.clone(), notifier.clone());
    let resolver = Arc::new(SettlementResolver::new(
        store.clone(),
        addresses,
        transfers,
        notifier,
    ));

    let worker = SweepWorker::new(
        store,
        engine,
        resolver,
        SweepWorkerConfig {
            interval_secs: config.sweep_interval_secs,
            batch: config.sweep_batch,
        },
    );
    tokio::spawn(worker.run());

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}
