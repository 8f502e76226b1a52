// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Triad CLI
//!
//! The `triad` binary runs the three-stage strategy pipeline.
//!
//! ## Architecture
//!
//! - **Default mode**: commands delegate to the daemon if running; `strategy run`
//!   falls back to in-process services
//! - **Daemon mode**: `triad --daemon` serves the HTTP API
//! - **Detection**: HTTP health check, then PID file
//!
//! ## Commands
//!
//! - `triad daemon start|stop|status` - Manage daemon lifecycle
//! - `triad strategy run|get|list|performance|providers` - Pipeline operations
//! - `triad memory search|export` - Captured learning memory
//! - `triad config show|validate|generate` - Configuration management

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use tracing::info;

use triad_core::domain::node_config::TriadConfigManifest;
use triad_orchestrator::commands::{
    self, ConfigCommand, DaemonCommand, MemoryCommand, StrategyCommand,
};
use triad_orchestrator::daemon::{self, DEFAULT_PORT};

/// Triad - three-stage LLM strategy orchestrator
#[derive(Parser)]
#[command(name = "triad")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Run as the daemon service
    #[arg(long, global = true)]
    daemon: bool,

    /// Path to configuration file (overrides discovery)
    #[arg(
        short,
        long,
        global = true,
        env = "TRIAD_CONFIG_PATH",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// HTTP API port (default: network.port from config, else 8000)
    #[arg(long, global = true, env = "TRIAD_PORT")]
    port: Option<u16>,

    /// HTTP API host used by client commands
    #[arg(long, global = true, env = "TRIAD_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "TRIAD_LOG_LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage daemon lifecycle
    #[command(name = "daemon")]
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },

    /// Run and inspect strategies
    #[command(name = "strategy")]
    Strategy {
        #[command(subcommand)]
        command: StrategyCommand,
    },

    /// Search and export captured memory
    #[command(name = "memory")]
    Memory {
        #[command(subcommand)]
        command: MemoryCommand,
    },

    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Missing .env is fine
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    if cli.daemon {
        let config = TriadConfigManifest::load_or_default(cli.config.clone())
            .context("Failed to load configuration")?;
        let logging = &config.spec.observability.logging;
        init_logging(
            cli.log_level.as_deref().unwrap_or(&logging.level),
            &logging.format,
        )?;
        info!("Starting Triad in daemon mode");
        return daemon::start_daemon(config, cli.port).await;
    }

    init_logging(cli.log_level.as_deref().unwrap_or("warn"), "text")?;
    let port = cli.port.unwrap_or(DEFAULT_PORT);

    match cli.command {
        Some(Commands::Daemon { command }) => {
            commands::daemon::handle_command(command, cli.config, &cli.host, cli.port).await
        }
        Some(Commands::Strategy { command }) => {
            commands::strategy::handle_command(command, cli.config, &cli.host, port).await
        }
        Some(Commands::Memory { command }) => {
            commands::memory::handle_command(command, &cli.host, port).await
        }
        Some(Commands::Config { command }) => {
            commands::config::handle_command(command, cli.config).await
        }
        None => {
            eprintln!("{}", "No command specified. Use --help for usage.".yellow());
            std::process::exit(1);
        }
    }
}

/// Initialize tracing. `format` is `text` or `json`; logs go to stderr.
fn init_logging(level: &str, format: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_file(false)
        .with_line_number(false);

    if format.eq_ignore_ascii_case("json") {
        builder.json().init();
    } else {
        builder.compact().init();
    }
    Ok(())
}
