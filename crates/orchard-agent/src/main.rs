//! orchard-agent - device agent daemon for immutable-OS fleets.
//!
//! The agent enrolls the device once, then runs five concurrent loops:
//! policy pull/verify/enforce, state reporting, event flushing, login
//! auditing, and TPM boot attestation. SIGINT/SIGTERM cancel the shared
//! context; the process exits 0 on clean cancellation and 1 on any other
//! error so a supervising init system restarts it.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use orchard_agent::{Agent, AgentError};
use orchard_core::config::Config;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Orchard device agent.
#[derive(Parser, Debug)]
#[command(name = "orchard-agent")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the agent configuration file.
    #[arg(short, long, default_value = "/etc/orchard/agent.yaml")]
    config: PathBuf,
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(err) => {
            init_tracing("info");
            error!(error = %err, "failed to load config");
            return ExitCode::FAILURE;
        },
    };
    if let Err(err) = config.validate() {
        init_tracing("info");
        error!(error = %err, "invalid config");
        return ExitCode::FAILURE;
    }
    init_tracing(&config.logging.level);

    let agent = match Agent::new(config) {
        Ok(agent) => Arc::new(agent),
        Err(err) => {
            error!(error = %err, "failed to initialise agent");
            return ExitCode::FAILURE;
        },
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT");
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
        let _ = shutdown_tx.send(true);
    });

    match agent.run(shutdown_rx).await {
        Err(AgentError::Cancelled) => {
            info!("shutdown complete");
            ExitCode::SUCCESS
        },
        Err(err) => {
            error!(error = %err, "agent exited with error");
            ExitCode::FAILURE
        },
        Ok(()) => ExitCode::SUCCESS,
    }
}
