//! netwatchdog - Internet uplink monitor with automatic power-cycle remediation.

mod config;
mod db;
mod health;
mod probe;
mod remediation;
mod scheduler;
mod shutdown;
mod web;

use config::ServerConfig;
use db::{HealthStore, Store};
use probe::Prober;
use remediation::{connect_device, RemediationController, RemediationOutcome, SystemClock};
use scheduler::Scheduler;
use shutdown::ShutdownSignals;
use web::Server;

use clap::{Parser, Subcommand};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser)]
#[command(name = "netwatchdog", version, about = "Internet uplink monitor and power-cycle remediator")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the probing loops and the JSON API (default).
    Serve,
    /// Perform one remediation run and print its report.
    Remediate {
        /// Reason recorded with the power-cycle event.
        #[arg(long)]
        reason: Option<String>,
        /// Ignore the cooldown window.
        #[arg(long = "override")]
        override_cooldown: bool,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode, BoxError> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("netwatchdog=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let signals = ShutdownSignals::install()?;

    // Load configuration
    let cfg = ServerConfig::load()?;
    tracing::info!("Using database at {}", cfg.db_path);

    let store: Arc<dyn HealthStore> = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    let device = connect_device(&cfg.device)?;
    let controller = RemediationController::new(
        device,
        store.clone(),
        Arc::new(SystemClock),
        cfg.remediation.clone(),
    );
    if controller.is_configured() {
        tracing::info!(
            "Power device: {} ({:?} at {:?})",
            cfg.device.name,
            cfg.device.kind,
            cfg.device.host
        );
    } else {
        tracing::warn!("No power device configured; remediation runs will fail");
    }

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            serve(cfg, store, controller, signals).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Remediate {
            reason,
            override_cooldown,
        } => {
            let reason = reason.unwrap_or_else(|| web::default_reason(override_cooldown).to_string());
            let report = controller
                .remediate_through_shutdown(&reason, override_cooldown, signals.requested())
                .await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(if report.outcome == RemediationOutcome::Failed {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            })
        }
    }
}

async fn serve(
    cfg: ServerConfig,
    store: Arc<dyn HealthStore>,
    controller: RemediationController,
    signals: ShutdownSignals,
) -> Result<(), BoxError> {
    tracing::info!("Starting netwatchdog on port {}...", cfg.http_port);

    let scheduler = Scheduler::new(Prober::icmp(), store.clone(), cfg.probe.clone());
    scheduler.start().await;

    let server = Server::new(cfg, store, controller.clone(), scheduler.badge());
    let served = server.start(signals.requested()).await;

    scheduler.stop().await;
    if controller.active_run().is_some() {
        tracing::info!("Waiting for the active remediation run to finish");
    }
    controller.wait_idle().await;

    served
}
