//! The `djr3x` binary: loads configuration, starts the kernel, feeds stdin
//! lines onto the event bus as `cli/command` events, prints `cli/response`
//! back to stdout, and shuts down cleanly on SIGINT/SIGTERM or a `quit`
//! command.
//!
//! Grounded on
//! `examples/tobert-hootenanny/crates/hootenanny/src/main.rs`'s overall
//! shape (`clap::Parser` CLI, `anyhow::Context`, dual-signal graceful
//! shutdown) with the axum-server teardown it drives replaced by
//! `Kernel::stop`'s reverse-order service teardown, and a third shutdown
//! trigger added: the `system/shutdown/requested` event the `quit` command
//! emits.

use anyhow::{Context, Result};
use clap::Parser;
use djr3x_kernel::config;
use djr3x_kernel::events::{from_payload, payloads::*, to_payload, topic};
use djr3x_kernel::kernel::Kernel;
use djr3x_kernel::telemetry;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Notify;
use tracing::info;

/// The DJ R3X service/event orchestration kernel.
///
/// Configuration is loaded from (in order, later wins):
/// 1. Compiled defaults
/// 2. `./djr3x.toml` (or `--config` path)
/// 3. Environment variables (`DJR3X_*`, plus `RUST_LOG`)
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to config file (overrides ./djr3x.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print loaded configuration and exit
    #[arg(long)]
    show_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => config::KernelConfig::load_from(path).context("failed to load configuration")?,
        None => config::KernelConfig::load().context("failed to load configuration")?,
    };

    if cli.show_config {
        println!("{}", toml::to_string_pretty(&config).context("failed to render configuration")?);
        return Ok(());
    }

    telemetry::init(&config.log_level).context("failed to initialize logging")?;

    info!("🤖 starting djr3x kernel");
    let kernel = Kernel::new(&config);
    kernel.start().await.context("failed to start kernel services")?;
    info!("✅ kernel running; type 'help' for a list of commands");

    let shutdown = Arc::new(Notify::new());
    let shutdown_for_handler = shutdown.clone();
    kernel.bus.on(
        topic::SYSTEM_SHUTDOWN_REQUESTED,
        "main",
        Arc::new(move |_payload| {
            let shutdown = shutdown_for_handler.clone();
            Box::pin(async move {
                shutdown.notify_one();
                Ok(())
            })
        }),
    );

    kernel.bus.on(
        topic::CLI_RESPONSE,
        "main",
        Arc::new(move |payload| {
            Box::pin(async move {
                if let Some(response) = from_payload::<CliResponsePayload>(&payload) {
                    if response.is_error {
                        eprintln!("! {}", response.message);
                    } else {
                        println!("{}", response.message);
                    }
                }
                Ok(())
            })
        }),
    );

    let stdin_bus = kernel.bus.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let command = CliCommandPayload {
                        command: line.split_whitespace().next().unwrap_or_default().to_string(),
                        args: line.split_whitespace().skip(1).map(str::to_string).collect(),
                        raw_input: line,
                        conversation_id: None,
                        timestamp: chrono::Utc::now(),
                    };
                    stdin_bus.emit(topic::CLI_COMMAND, to_payload(&command)).await;
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "stdin read failed");
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received SIGINT, shutting down");
        }
        _ = async {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
                sigterm.recv().await;
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {
            info!("received SIGTERM, shutting down");
        }
        _ = shutdown.notified() => {
            info!("shutdown requested via quit command");
        }
    }

    kernel.stop().await.context("failed to stop kernel services cleanly")?;
    info!("👋 kernel stopped");
    Ok(())
}
