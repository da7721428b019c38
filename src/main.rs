//! Subscription Gate Bot - Main Entry Point
//!
//! Supervises a fleet of Telegram worker bots, each gating promised
//! material behind proof of channel subscription.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use subgate_bot::config::{GateSettings, TelegramConfig};
use subgate_bot::gate::{ChannelVerifier, GateProtocol};
use subgate_bot::scheduler::{DeliveryScheduler, ReminderScheduler};
use subgate_bot::sessions::{SessionSupervisor, WorkerRegistry};
use subgate_bot::storage::{MemoryStore, RecordsFile, WorkerStore};
use subgate_bot::telegram::{GrammersConnector, MembershipOracle, MembershipTransport};

/// Telegram subscription-gate bot fleet.
#[derive(Parser, Debug)]
#[command(name = "subgate")]
#[command(about = "Gate Telegram materials behind channel subscriptions")]
#[command(version)]
struct Args {
    /// Path to the worker records JSON file.
    #[arg(short, long, default_value = "workers.json")]
    workers: String,

    /// Path to the .env file for environment variables.
    #[arg(long, default_value = ".env")]
    env_file: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Generate an example worker records file and exit.
    #[arg(long)]
    generate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args.log_level);

    // Handle example config generation
    if args.generate_config {
        return generate_example_config();
    }

    // Load environment variables
    if let Err(e) = dotenvy::from_filename(&args.env_file) {
        debug!("Could not load .env file ({}): {}", args.env_file, e);
    }

    // Load configurations
    let tg_config = TelegramConfig::from_env()
        .context("Failed to load Telegram configuration from environment")?;

    let settings = GateSettings::from_env_with_defaults();

    std::fs::create_dir_all(&tg_config.session_dir)
        .context("Failed to create session directory")?;

    // Load worker records
    let store = Arc::new(
        MemoryStore::load_from_file(&args.workers, settings.requirement_quota)
            .context("Failed to load worker records")?,
    );
    let enabled = store.active_workers().await?.len();
    info!("Loaded worker records from {} ({enabled} enabled)", args.workers);

    // Connect the membership oracle before any worker session starts;
    // until then every check fails closed.
    let connector = Arc::new(GrammersConnector::new(tg_config));
    let oracle = Arc::new(MembershipOracle::new());
    let oracle_session = Arc::new(
        connector
            .connect_oracle()
            .await
            .context("Failed to connect the membership oracle")?,
    );
    oracle
        .initialize(Arc::clone(&oracle_session) as Arc<dyn MembershipTransport>)
        .await;

    // Wire the core
    let dyn_store: Arc<dyn WorkerStore> = Arc::clone(&store) as _;
    let verifier = Arc::new(ChannelVerifier::new(
        Arc::clone(&dyn_store),
        Arc::clone(&oracle),
    ));
    let reminders = Arc::new(ReminderScheduler::new(
        Arc::clone(&verifier),
        Arc::clone(&dyn_store),
        settings.reminder_interval(),
    ));
    let deliveries = Arc::new(DeliveryScheduler::new(
        Arc::clone(&verifier),
        Arc::clone(&dyn_store),
    ));
    let protocol = Arc::new(GateProtocol::new(
        Arc::clone(&dyn_store),
        verifier,
        Arc::clone(&reminders),
        Arc::clone(&deliveries),
    ));
    let registry = Arc::new(WorkerRegistry::new(
        Arc::clone(&connector) as _,
        protocol,
        reminders,
        deliveries,
        settings.stop_timeout(),
        settings.start_pacing(),
    ));
    let supervisor = SessionSupervisor::new(
        registry,
        dyn_store,
        connector as _,
        settings.start_pacing(),
    );

    info!("Starting subscription gate fleet...");
    let started = supervisor.boot().await;
    info!("Fleet is running ({started} workers). Use Ctrl+C to stop.");

    // Wait for Ctrl+C
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }

    // Workers first, then the oracle session they verify through.
    info!("Shutting down...");
    supervisor.stop_all_workers().await;
    oracle_session.close();

    Ok(())
}

/// Initializes the logging subsystem.
fn init_logging(level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Generates an example worker records file.
fn generate_example_config() -> Result<()> {
    let example = RecordsFile::example();
    example.save("workers.example.json")?;

    println!("✓ Example worker records written to: workers.example.json");
    println!("\nTo use this bot:");
    println!("1. Copy workers.example.json to workers.json");
    println!("2. Fill in real bot tokens and channel requirements");
    println!("3. Create a .env file with TG_API_ID, TG_API_HASH and ORACLE_BOT_TOKEN");
    println!("4. Run: subgate");

    Ok(())
}
