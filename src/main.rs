use std::process;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use netorch::cli::{format_dry_run, Args};
use netorch::config::{load_config, Inventory};
use netorch::gc::{spawn_network_gc, InMemoryFreeNetworkWatch, NetworkGarbageCollector};
use netorch::guru::GuestNetworkGuru;
use netorch::registry::{ElementRegistry, GuruRegistry};
use netorch::repository::{InMemoryStore, Repositories};
use netorch::NetworkOrchestrator;

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    let filter = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    if let Err(e) = run(args).await {
        error!("{:#}", e);
        process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    // Overrides are read from the environment, so the .env file goes first
    if let Some(ref env_file) = args.env_file {
        dotenvy::from_path(env_file)
            .with_context(|| format!("Failed to load env file {}", env_file.display()))?;
    }

    let config = load_config(args.config.as_deref()).context("Failed to load config")?;

    let inventory = match args.inventory.as_deref() {
        Some(path) => Inventory::load(path)
            .with_context(|| format!("Failed to load inventory {}", path))?,
        None => {
            warn!("No inventory given, starting with an empty store");
            Inventory::default()
        }
    };

    // Dry-run mode: print what would run and exit
    if args.dry_run {
        println!("{}", format_dry_run(&config, &inventory));
        return Ok(());
    }

    let store = Arc::new(InMemoryStore::new());
    inventory.seed(&store);
    let repos = Repositories::in_memory(store);

    let gurus = GuruRegistry::new().with(Arc::new(GuestNetworkGuru::new(
        repos.zones.clone(),
        repos.nics.clone(),
    )));
    let orchestrator = Arc::new(NetworkOrchestrator::new(
        repos,
        gurus,
        ElementRegistry::new(),
        config.clone(),
    ));
    info!(
        "Orchestrator ready with gurus {:?}",
        orchestrator.gurus().names()
    );

    let gc = Arc::new(NetworkGarbageCollector::new(
        orchestrator,
        Arc::new(InMemoryFreeNetworkWatch::new()),
    ));
    let gc_shutdown = spawn_network_gc(gc, config.gc_interval());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("Shutting down");
    // The GC task may already be gone
    let _ = gc_shutdown.send(true);
    Ok(())
}
