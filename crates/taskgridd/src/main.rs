//! taskgridd: the TaskGrid daemon.
//!
//! Loads and validates `grid.toml`, opens the state store, recovers the
//! pool and runs its control loops until Ctrl-C:
//! - assignment cycle
//! - health sweep
//! - scaling evaluation and drain reaping
//! - metrics sampling
//!
//! # Usage
//!
//! ```text
//! taskgridd run --config grid.toml --data-dir /var/lib/taskgrid
//! taskgridd check-config --config grid.toml
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use taskgrid_coordinator::{Pool, run_loops};
use taskgrid_core::GridConfig;
use taskgrid_metrics::render_prometheus;
use taskgrid_state::{StateStore, epoch_ms};

const DEFAULT_FILTER: &str = "info,taskgrid=debug,taskgridd=debug";

#[derive(Parser)]
#[command(name = "taskgridd", about = "TaskGrid coordination daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a pool until interrupted.
    Run {
        /// Pool configuration. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/taskgrid")]
        data_dir: PathBuf,

        /// Emit logs as JSON lines.
        #[arg(long)]
        log_json: bool,
    },
    /// Validate a configuration file and print the effective settings.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            data_dir,
            log_json,
        } => {
            init_tracing(log_json);
            let config = load_config(config.as_deref())?;
            run(config, data_dir).await
        }
        Command::CheckConfig { config } => {
            init_tracing(false);
            let config = load_config(Some(&config))?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Read and validate the configuration. Invalid configuration is fatal.
fn load_config(path: Option<&Path>) -> anyhow::Result<GridConfig> {
    let config = match path {
        Some(path) => GridConfig::from_file(path)?,
        None => GridConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

async fn run(config: GridConfig, data_dir: PathBuf) -> anyhow::Result<()> {
    info!("TaskGrid daemon starting");

    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("taskgrid.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let pool = Arc::new(Pool::open(config, store, epoch_ms())?);
    let restored = pool.restored();
    info!(
        strategy = pool.strategy_name(),
        agents = restored.agents,
        tasks = restored.tasks,
        "pool opened"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let emissions = tokio::spawn(log_emissions(pool.metrics().subscribe(), shutdown_rx.clone()));
    let loops = tokio::spawn(run_loops(pool.clone(), shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    match loops.await {
        Ok(result) => result?,
        Err(e) => warn!(error = %e, "control loops did not stop cleanly"),
    }
    let _ = emissions.await;

    debug!(metrics = %render_prometheus(&pool.pool_metrics(epoch_ms())), "final metrics");
    info!("TaskGrid daemon stopped");
    Ok(())
}

/// Log every metrics emission as a JSON document until shutdown.
async fn log_emissions(
    mut rx: broadcast::Receiver<taskgrid_metrics::Emission>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Ok(emission) => match serde_json::to_string(&emission) {
                    Ok(json) => debug!(target: "taskgridd::emission", %json),
                    Err(e) => warn!(error = %e, "emission not serializable"),
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "emission log fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = shutdown.changed() => break,
        }
    }
}
