//! hmd: the health manager daemon.
//!
//! Keeps the number of running instances of every app equal to what the
//! platform wants: it listens to host heartbeats, polls desired state,
//! reconciles the two and publishes start/stop requests.
//!
//! # Usage
//!
//! ```text
//! hmd run --config /etc/hm/hm.toml --roles listener,analyzer,sender
//! hmd default-config > hm.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use hm_bus::LocalBus;
use hm_core::{Clock, HmConfig, SystemClock};
use hmd::{Daemon, Role, open_store};
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "hmd", about = "Health manager daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the health manager.
    ///
    /// Roles talk over an in-process bus, so heartbeats and credential
    /// replies only arrive once a networked `MessageBus` is wired in here.
    Run {
        /// Path to hm.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Roles to run, comma separated. All roles when omitted.
        #[arg(long, value_enum, value_delimiter = ',')]
        roles: Vec<Role>,
    },
    /// Print the default configuration as TOML.
    DefaultConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,hmd=debug,hm=debug")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run { config, roles } => {
            let code = run(config, roles).await?;
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        }
        Command::DefaultConfig => {
            print!("{}", HmConfig::default().to_toml_string()?);
            Ok(())
        }
    }
}

async fn run(config_path: Option<PathBuf>, roles: Vec<Role>) -> anyhow::Result<i32> {
    let config = match &config_path {
        Some(path) => HmConfig::from_file(path)?,
        None => HmConfig::default(),
    };
    let config = Arc::new(config);
    info!(config = ?config_path, heartbeat_period = config.heartbeat_period_secs, "configuration loaded");

    let roles = if roles.is_empty() {
        Role::ALL.to_vec()
    } else {
        roles
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = open_store(&config, clock.clone())?;
    warn!("no networked message bus configured; using the in-process bus");
    let daemon = Daemon::new(config, store, Arc::new(LocalBus::new()), clock);

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            // Keep the sender alive; a dropped sender reads as shutdown.
            std::future::pending::<()>().await;
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let exit = daemon.run(&roles, shutdown_rx).await?;
    info!(?exit, code = exit.code(), "health manager exiting");
    Ok(exit.code())
}
