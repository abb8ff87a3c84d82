//! tierliftd — the tierlift operator binary.
//!
//! Reads and updates the upgrade state kept in a redb file, and runs a fleet
//! rollout simulation against an in-memory store and job queue.
//!
//! # Usage
//!
//! ```text
//! tierliftd status --data-dir /var/lib/tierlift
//! tierliftd set-version --data-dir /var/lib/tierlift 5.2
//! tierliftd add-application --data-dir /var/lib/tierlift tenant.app.default \
//!     --tier canary --region us-east-3 --version 5.1
//! tierliftd remove-application --data-dir /var/lib/tierlift tenant.app.default
//! tierliftd simulate --fleet fleet.toml --interval-ms 200
//! ```

mod simulate;

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use tierlift_core::{ApplicationId, Tier, TierliftConfig, Version, Zone};
use tierlift_rollout::ConfidenceEvaluator;
use tierlift_state::{ApplicationRecord, StateStore, epoch_secs};

use crate::simulate::{Fleet, Simulation};

#[derive(Parser)]
#[command(name = "tierliftd", about = "tierlift upgrade orchestrator")]
struct Cli {
    /// Emit logs as JSON.
    #[arg(long, global = true)]
    log_json: bool,

    /// Path to tierlift.toml; built-in defaults when absent.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the status of every platform version in use, as JSON.
    Status {
        /// Data directory holding the state store.
        #[arg(long, default_value = "/var/lib/tierlift")]
        data_dir: PathBuf,
    },

    /// Move the system version forward.
    SetVersion {
        #[arg(long, default_value = "/var/lib/tierlift")]
        data_dir: PathBuf,

        /// The new system version, e.g. `5.2`.
        version: Version,
    },

    /// Register an application as deployed in production.
    AddApplication {
        #[arg(long, default_value = "/var/lib/tierlift")]
        data_dir: PathBuf,

        /// Application id: `tenant.application.instance`.
        id: ApplicationId,

        #[arg(long, default_value = "default")]
        tier: Tier,

        /// Production region, in deployment order. Repeat for more regions.
        #[arg(long = "region", required = true)]
        regions: Vec<String>,

        /// Platform version the application currently runs.
        #[arg(long)]
        version: Version,
    },

    /// Forget an application that is no longer deployed.
    RemoveApplication {
        #[arg(long, default_value = "/var/lib/tierlift")]
        data_dir: PathBuf,

        id: ApplicationId,
    },

    /// Simulate rolling a list of releases out across a fleet.
    Simulate {
        /// Fleet description (TOML).
        #[arg(long)]
        fleet: PathBuf,

        /// Milliseconds between maintenance runs and job executor rounds.
        #[arg(long, default_value = "200")]
        interval_ms: u64,

        /// Executor rounds per release before it is reported as stalled.
        #[arg(long, default_value = "100")]
        max_rounds: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Status { data_dir } => status(&data_dir, &config),
        Command::SetVersion { data_dir, version } => set_version(&data_dir, &version),
        Command::AddApplication {
            data_dir,
            id,
            tier,
            regions,
            version,
        } => add_application(&data_dir, id, tier, regions, &version),
        Command::RemoveApplication { data_dir, id } => remove_application(&data_dir, &id),
        Command::Simulate {
            fleet,
            interval_ms,
            max_rounds,
        } => simulate(&fleet, config, interval_ms, max_rounds).await,
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tierlift=debug"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<TierliftConfig> {
    match path {
        Some(path) => {
            let config = TierliftConfig::from_file(path)?;
            info!(path = ?path, "configuration loaded");
            Ok(config)
        }
        None => Ok(TierliftConfig::default()),
    }
}

fn open_store(data_dir: &Path) -> anyhow::Result<StateStore> {
    std::fs::create_dir_all(data_dir)?;
    let db_path = data_dir.join("tierlift.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");
    Ok(store)
}

fn status(data_dir: &Path, config: &TierliftConfig) -> anyhow::Result<()> {
    let store = open_store(data_dir)?;
    let evaluator = ConfidenceEvaluator::new(config.confidence.clone());
    let status = tierlift_upgrader::version_status(&store, &evaluator)?;
    info!(
        system = ?status.system_version,
        oldest_in_use = ?status.oldest_in_use(),
        versions = status.versions.len(),
        "version status computed"
    );
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

fn set_version(data_dir: &Path, version: &Version) -> anyhow::Result<()> {
    let store = open_store(data_dir)?;
    let previous = store.system_version()?;
    store.set_system_version(version)?;
    match previous {
        Some(previous) => info!(%previous, %version, "system version updated"),
        None => info!(%version, "system version set"),
    }
    Ok(())
}

fn add_application(
    data_dir: &Path,
    id: ApplicationId,
    tier: Tier,
    regions: Vec<String>,
    version: &Version,
) -> anyhow::Result<()> {
    let store = open_store(data_dir)?;
    if store.get_application(&id)?.is_some() {
        anyhow::bail!("application {id} is already registered");
    }

    let now = epoch_secs();
    let mut record = ApplicationRecord::new(id, tier, regions, now);
    for region in record.production_regions.clone() {
        record.record_deployment(Zone::prod(&region), version.clone(), now);
    }
    store.put_application(&record)?;
    info!(application = %record.id, %tier, %version, "application registered");
    Ok(())
}

fn remove_application(data_dir: &Path, id: &ApplicationId) -> anyhow::Result<()> {
    let store = open_store(data_dir)?;
    if !store.delete_application(id)? {
        anyhow::bail!("application {id} is not registered");
    }
    info!(application = %id, "application removed");
    Ok(())
}

async fn simulate(
    fleet_path: &Path,
    config: TierliftConfig,
    interval_ms: u64,
    max_rounds: u32,
) -> anyhow::Result<()> {
    let fleet = Fleet::from_file(fleet_path)?;
    info!(
        applications = fleet.applications.len(),
        releases = fleet.releases.len(),
        "fleet loaded"
    );

    let simulation = Simulation::new(fleet, &config)?;
    let summaries = simulation
        .run(Duration::from_millis(interval_ms), max_rounds, async {
            // A failed signal handler leaves the simulation to run to its end.
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
        })
        .await?;

    println!("{}", serde_json::to_string_pretty(&summaries)?);
    eprint!("{}", simulation.metrics().render_prometheus());
    Ok(())
}
