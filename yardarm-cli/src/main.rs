mod backend;
mod commands;
mod profiles;

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use yardarm_core::config::DeploymentPlan;
use yardarm_core::error::DeployError;

use backend::{DEFAULT_STATE_FILE, SimulatedBackend};
use commands::Context;

#[derive(Parser)]
#[command(name = "yardarm")]
#[command(about = "Preview versioned service deployments, rollbacks, and load balancer tasks", long_about = None)]
struct Cli {
    /// Deployment plan (default: discover yardarm.yaml from the current directory up)
    #[arg(long, global = true)]
    plan: Option<PathBuf>,

    /// Simulated backend state file
    #[arg(long, global = true, default_value = DEFAULT_STATE_FILE)]
    state: PathBuf,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List service types in deploy order
    Services,
    /// Stage and deploy services, printing each deploy pipeline
    Deploy {
        #[arg(required = true)]
        services: Vec<String>,
        /// Provision a new version even if one is running
        #[arg(long)]
        recreate: bool,
    },
    /// Show what is running for a service
    Status { service: String },
    /// Print the rollback pipeline for a service
    Rollback { service: String },
    /// Print the load balancer upsert task for a service
    UpsertLb { service: String },
    /// Tear down one version of a service
    DeleteVersion { service: String, version: u32 },
    /// Open a channel to the latest instance of a service
    Connect { service: String },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_writer(std::io::stderr)
        .init();
}

fn load_plan(path: Option<&PathBuf>) -> Result<DeploymentPlan> {
    match path {
        Some(path) => {
            DeploymentPlan::load(path).with_context(|| format!("failed to load plan {}", path.display()))
        }
        None => {
            let cwd = std::env::current_dir().context("failed to get current directory")?;
            let (path, plan) = DeploymentPlan::discover(&cwd)?;
            tracing::info!(plan = %path.display(), "loaded plan");
            Ok(plan)
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    if let Commands::Services = cli.command {
        commands::run_services();
        return Ok(());
    }

    let plan = load_plan(cli.plan.as_ref())?;
    let backend = SimulatedBackend::load(&cli.state)?;
    let ctx = Context::new(plan, backend);

    match cli.command {
        Commands::Services => Ok(()),
        Commands::Deploy { services, recreate } => commands::run_deploy(&ctx, &services, recreate).await,
        Commands::Status { service } => commands::run_status(&ctx, &service).await,
        Commands::Rollback { service } => commands::run_rollback(&ctx, &service).await,
        Commands::UpsertLb { service } => commands::run_upsert_lb(&ctx, &service),
        Commands::DeleteVersion { service, version } => {
            commands::run_delete_version(&ctx, &service, version).await
        }
        Commands::Connect { service } => commands::run_connect(&ctx, &service).await,
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli).await {
        match e.downcast_ref::<DeployError>() {
            Some(deploy) => eprintln!("Error ({}): {:#}", deploy.class().label(), e),
            None => eprintln!("Error: {:#}", e),
        }
        std::process::exit(1);
    }
}
