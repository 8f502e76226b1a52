// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Daemon lifecycle management commands
//!
//! Commands: start, stop, status

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;
use tracing::{info, warn};

use crate::daemon::{check_daemon_running, stop_daemon, DaemonStatus, DEFAULT_PORT};
use triad_core::domain::node_config::TriadConfigManifest;
use triad_core::domain::strategy::Stage;
use triad_core::infrastructure::llm::AdapterRegistry;

#[derive(Subcommand)]
pub enum DaemonCommand {
    /// Start the daemon (if not already running)
    Start,

    /// Stop the daemon gracefully
    Stop {
        /// Force kill if daemon doesn't stop gracefully
        #[arg(short, long)]
        force: bool,

        /// Timeout in seconds (default: 30)
        #[arg(short, long, default_value = "30")]
        timeout: u64,
    },

    /// Check daemon status
    Status,
}

pub async fn handle_command(
    command: DaemonCommand,
    config_path: Option<PathBuf>,
    host: &str,
    port: Option<u16>,
) -> Result<()> {
    let client_port = port.unwrap_or(DEFAULT_PORT);
    match command {
        DaemonCommand::Start => start(config_path, host, port).await,
        DaemonCommand::Stop { force, timeout } => stop(host, client_port, force, timeout).await,
        DaemonCommand::Status => status(host, client_port).await,
    }
}

async fn start(config_path: Option<PathBuf>, host: &str, port: Option<u16>) -> Result<()> {
    // Fail here rather than in the detached process.
    let config = TriadConfigManifest::load_or_default(config_path.clone())
        .context("Failed to load configuration")?;
    config
        .validate()
        .context("Configuration validation failed")?;

    let registry = AdapterRegistry::from_config(&config)?;
    for stage in Stage::ALL {
        if let Some(e) = registry.binding(stage).configuration_error() {
            println!(
                "{}",
                format!("WARNING: {stage} is misconfigured and will fail every request: {e}")
                    .yellow()
                    .bold()
            );
        }
    }

    let port = port.unwrap_or(config.spec.network.port);
    match check_daemon_running(host, port).await {
        Ok(DaemonStatus::Running { pid, .. }) => {
            println!("{}", format!("✓ Daemon already running (PID: {})", pid).green());
            println!("Use 'triad daemon stop' to stop it first.");
            return Ok(());
        }
        Ok(DaemonStatus::Stopped) => {
            info!("Daemon not running, starting...");
        }
        Ok(DaemonStatus::Unhealthy { pid, error }) => {
            warn!("Daemon PID {} exists but unhealthy (error: {}), stopping...", pid, error);
            stop_daemon(false, 10).await?;
        }
        Err(e) => {
            warn!("Failed to check daemon status: {}", e);
        }
    }

    // Re-exec self with --daemon
    let current_exe = std::env::current_exe().context("Failed to get current executable path")?;
    let mut cmd = std::process::Command::new(current_exe);
    cmd.arg("--daemon").arg("--port").arg(port.to_string());
    if let Some(config) = config_path {
        cmd.arg("--config").arg(config);
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let (stdout_path, stderr_path) = log_paths();
    let stdout_file =
        std::fs::File::create(&stdout_path).context("Failed to create stdout log file")?;
    let stderr_file =
        std::fs::File::create(&stderr_path).context("Failed to create stderr log file")?;
    cmd.stdin(std::process::Stdio::null())
        .stdout(stdout_file)
        .stderr(stderr_file);

    println!("Redirecting logs to: {}", stdout_path.display());
    let child = cmd.spawn().context("Failed to spawn daemon process")?;

    println!("{}", format!("✓ Daemon starting (PID: {})", child.id()).green());
    println!("Check status with: triad daemon status");
    Ok(())
}

async fn stop(host: &str, port: u16, force: bool, timeout: u64) -> Result<()> {
    match check_daemon_running(host, port).await? {
        DaemonStatus::Stopped => {
            println!("{}", "ℹ Daemon not running".yellow());
        }
        DaemonStatus::Running { pid, .. } | DaemonStatus::Unhealthy { pid, .. } => {
            println!("Stopping daemon (PID: {})...", pid);
            stop_daemon(force, timeout).await?;
            println!("{}", "✓ Daemon stopped".green());
        }
    }
    Ok(())
}

async fn status(host: &str, port: u16) -> Result<()> {
    match check_daemon_running(host, port).await? {
        DaemonStatus::Running { pid, uptime } => {
            println!("{}", "✓ Daemon is running".green());
            println!("  PID: {}", pid);
            if let Some(uptime) = uptime {
                println!("  Uptime: {}", format_duration(uptime));
            }
        }
        DaemonStatus::Stopped => {
            println!("{}", "✗ Daemon is not running".red());
        }
        DaemonStatus::Unhealthy { pid, error } => {
            let (stdout_path, stderr_path) = log_paths();
            println!("{}", format!("⚠ Daemon unhealthy (PID: {})", pid).yellow());
            println!("  Process exists but HTTP API check failed: {}", error);
            println!(
                "  Check logs at {} and {}",
                stdout_path.display(),
                stderr_path.display()
            );
        }
    }
    Ok(())
}

fn log_paths() -> (PathBuf, PathBuf) {
    let temp_dir = std::env::temp_dir();
    (temp_dir.join("triad.out"), temp_dir.join("triad.err"))
}

fn format_duration(secs: u64) -> String {
    let days = secs / 86400;
    let hours = (secs % 86400) / 3600;
    let minutes = (secs % 3600) / 60;

    if days > 0 {
        format!("{}d {}h {}m", days, hours, minutes)
    } else if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else {
        format!("{}m", minutes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(59), "0m");
        assert_eq!(format_duration(3_660), "1h 1m");
        assert_eq!(format_duration(90_061), "1d 1h 1m");
    }
}
