//! Meshprov CLI - Main Entry Point
//!
//! Opens the peer store named by the config file and drives the
//! provisioning engine directly.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use meshprov_common::Caller;
use meshprov_provisioner::{ProvisionerConfig, ProvisioningEngine};
use std::path::PathBuf;

mod commands;
mod output;

use commands::{peer, reconcile, site};

/// Meshprov - edge device provisioning for WireGuard overlays
#[derive(Parser)]
#[command(name = "meshprov")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file (default: ~/.meshprov/config.toml)
    #[arg(short, long, env = "MESHPROV_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, value_enum, default_value = "table", global = true)]
    format: output::OutputFormat,

    /// Act as a tenant-scoped caller instead of admin
    #[arg(long, env = "MESHPROV_TENANT", global = true)]
    tenant: Option<String>,

    /// Restrict the caller to read-only operations (requires --tenant)
    #[arg(long, global = true)]
    read_only: bool,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage peers
    #[command(subcommand)]
    Peer(peer::PeerCommands),

    /// Manage sites
    #[command(subcommand)]
    Site(site::SiteCommands),

    /// Bring the live peer table in line with the store (admin only)
    Reconcile(reconcile::ReconcileArgs),

    /// Show version information
    Version,
}

fn init_logging(verbose: bool, json: bool) {
    let log_level = if verbose { "debug" } else { "warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn caller(cli: &Cli) -> anyhow::Result<Caller> {
    let subject = std::env::var("USER").unwrap_or_else(|_| "cli".to_string());
    match (&cli.tenant, cli.read_only) {
        (Some(tenant), true) => Ok(Caller::read_only(subject, tenant)),
        (Some(tenant), false) => Ok(Caller::tenant(subject, tenant)),
        (None, true) => bail!("--read-only requires --tenant"),
        (None, false) => Ok(Caller::admin(subject)),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_json);

    if let Err(e) = run(cli).await {
        match e.downcast_ref::<meshprov_common::Error>() {
            Some(err) => {
                eprintln!("❌ [{}] {:#}", err.kind(), e);
                if err.is_retryable() {
                    eprintln!("   Retry later or run `meshprov reconcile`.");
                }
            }
            None => eprintln!("❌ {:#}", e),
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    if let Commands::Version = cli.command {
        println!("meshprov v{}", meshprov_common::VERSION);
        return Ok(());
    }

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(meshprov_common::default_config_path);
    let config = ProvisionerConfig::load(&config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;
    let caller = caller(&cli)?;
    tracing::debug!("Loaded {} as {}", config_path.display(), caller.subject);

    let engine = ProvisioningEngine::from_config(&config).context("Failed to start provisioning engine")?;

    match cli.command {
        Commands::Peer(cmd) => peer::execute(cmd, &engine, &caller, cli.format).await?,
        Commands::Site(cmd) => site::execute(cmd, &engine, &caller, cli.format).await?,
        Commands::Reconcile(args) => reconcile::execute(args, &engine, &caller, cli.format).await?,
        Commands::Version => {}
    }

    Ok(())
}
