//! Aegis CLI entry point
//!
//! Loads configuration from the environment, wires up logging (console plus
//! the per-run detailed log file), runs the defender supervisor, and maps
//! failures to the documented exit codes: 0 clean shutdown, 1 fatal
//! configuration error, 2 unrecoverable journal/state I/O.

use std::path::PathBuf;
use std::sync::Mutex;

use aegis_runtime::{DefenderRuntime, RuntimeConfig};
use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(
    name = "aegis",
    version,
    about = "Autonomous network defender: IDS alerts in, remediation out"
)]
struct Cli {
    /// Env file loaded before reading configuration (default: ./.env).
    #[arg(long)]
    env_file: Option<PathBuf>,

    /// Override RUN_ID.
    #[arg(long)]
    run_id: Option<String>,

    /// Override DEFENDER_PORT.
    #[arg(long)]
    port: Option<u16>,
}

fn main() {
    let cli = Cli::parse();

    match &cli.env_file {
        Some(path) => {
            if let Err(err) = dotenvy::from_path(path) {
                eprintln!("aegis: cannot load env file {}: {err}", path.display());
                std::process::exit(1);
            }
        }
        None => {
            let _ = dotenvy::dotenv();
        }
    }
    if let Some(run_id) = &cli.run_id {
        std::env::set_var("RUN_ID", run_id);
    }
    if let Some(port) = cli.port {
        std::env::set_var("DEFENDER_PORT", port.to_string());
    }

    let config = match RuntimeConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("aegis: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = init_logging(&config) {
        eprintln!("aegis: cannot open detailed log: {err}");
        std::process::exit(2);
    }

    let runtime = tokio::runtime::Runtime::new().expect("failed to start tokio runtime");
    let exit_code = runtime.block_on(run(config));
    std::process::exit(exit_code);
}

async fn run(config: RuntimeConfig) -> i32 {
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("shutdown signal received, draining");
        let _ = shutdown_tx.send(true);
    });

    match DefenderRuntime::new(config).run(shutdown_rx).await {
        Ok(()) => {
            tracing::info!("clean shutdown");
            0
        }
        Err(err) => {
            tracing::error!(error = %err, "defender exited with error");
            match err.exit_code() {
                0 => 1,
                code => code,
            }
        }
    }
}

/// Console logging filtered by `RUST_LOG`, plus the full-detail per-run log
/// file. The file is a readable tee of salient events; the timeline journal
/// stays the authoritative record.
fn init_logging(config: &RuntimeConfig) -> std::io::Result<()> {
    let log_path = config.detailed_log_path();
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer().with_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            ),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(log_file)),
        )
        .init();
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(err) => {
            tracing::error!(error = %err, "cannot install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = tokio::signal::ctrl_c() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
