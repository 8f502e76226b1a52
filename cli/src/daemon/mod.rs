// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Daemon mode
//!
//! Handles:
//! - PID file management
//! - HTTP health checks
//! - Graceful stop via SIGTERM

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
#[cfg(unix)]
use tracing::warn;

pub mod client;
pub mod server;

pub use client::DaemonClient;
pub use server::start_daemon;

/// API port when neither `--port` nor the configuration names one.
pub const DEFAULT_PORT: u16 = 8000;

#[cfg(unix)]
const PID_FILE: &str = "/var/run/triad/triad.pid";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonStatus {
    /// `pid` is 0 when the daemon answers but no local PID file exists.
    Running { pid: u32, uptime: Option<u64> },
    Stopped,
    Unhealthy { pid: u32, error: String },
}

pub fn base_url(host: &str, port: u16) -> String {
    if host.starts_with("http://") || host.starts_with("https://") {
        format!("{host}:{port}")
    } else {
        format!("http://{host}:{port}")
    }
}

/// Health endpoint first, PID file second.
pub async fn check_daemon_running(host: &str, port: u16) -> Result<DaemonStatus> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_millis(500))
        .build()?;
    let health_url = format!("{}/health", base_url(host, port));
    let pid_file = pid_file_path();
    let local_pid = read_pid(&pid_file);

    match client.get(&health_url).send().await {
        Ok(resp) if resp.status().is_success() => {
            let uptime = resp
                .json::<serde_json::Value>()
                .await
                .ok()
                .and_then(|v| v["uptime_seconds"].as_u64());
            Ok(DaemonStatus::Running {
                pid: local_pid.unwrap_or(0),
                uptime,
            })
        }
        Ok(resp) => Ok(DaemonStatus::Unhealthy {
            pid: local_pid.unwrap_or(0),
            error: format!("HTTP {}", resp.status()),
        }),
        Err(e) => match local_pid {
            Some(pid) if process_exists(pid) => Ok(DaemonStatus::Unhealthy {
                pid,
                error: e.to_string(),
            }),
            Some(_) => {
                // Stale
                let _ = std::fs::remove_file(&pid_file);
                Ok(DaemonStatus::Stopped)
            }
            None => Ok(DaemonStatus::Stopped),
        },
    }
}

/// Send SIGTERM and wait up to `timeout_secs` for the process to exit.
pub async fn stop_daemon(force: bool, timeout_secs: u64) -> Result<()> {
    let pid_file = pid_file_path();
    let pid = std::fs::read_to_string(&pid_file)
        .context("Failed to read PID file")?
        .trim()
        .parse::<u32>()
        .context("Invalid PID")?;

    #[cfg(unix)]
    {
        info!("Sending SIGTERM to process {}", pid);
        send_signal(pid, libc::SIGTERM)?;

        let mut stopped = false;
        for _ in 0..timeout_secs {
            if !process_exists(pid) {
                stopped = true;
                break;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        if !stopped {
            if !force {
                anyhow::bail!("Daemon did not stop within {timeout_secs}s");
            }
            warn!("Graceful shutdown timeout, sending SIGKILL");
            send_signal(pid, libc::SIGKILL)?;
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    #[cfg(windows)]
    {
        let _ = (force, timeout_secs);
        let output = std::process::Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/F"])
            .output()
            .context("Failed to execute taskkill")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.contains("not found") {
                anyhow::bail!("Failed to stop daemon: {}", stderr);
            }
        }
    }

    info!("Daemon stopped");
    let _ = std::fs::remove_file(&pid_file);
    Ok(())
}

pub fn pid_file_path() -> PathBuf {
    #[cfg(unix)]
    {
        // Root writes under /var/run, everyone else under the temp dir.
        if unsafe { libc::geteuid() } == 0 {
            PathBuf::from(PID_FILE)
        } else {
            std::env::temp_dir().join("triad.pid")
        }
    }

    #[cfg(windows)]
    {
        PathBuf::from("C:\\ProgramData\\Triad\\triad.pid")
    }
}

fn read_pid(path: &PathBuf) -> Option<u32> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|content| content.trim().parse().ok())
}

fn process_exists(pid: u32) -> bool {
    #[cfg(unix)]
    {
        unsafe { libc::kill(pid as i32, 0) == 0 }
    }

    #[cfg(windows)]
    {
        let _ = pid;
        true
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: i32) -> Result<()> {
    if unsafe { libc::kill(pid as i32, signal) } != 0 {
        anyhow::bail!("Failed to send signal {} to process {}", signal, pid);
    }
    Ok(())
}

pub fn write_pid_file(pid: u32) -> Result<()> {
    let pid_file = pid_file_path();
    if let Some(parent) = pid_file.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create PID directory {:?}", parent))?;
    }
    std::fs::write(&pid_file, pid.to_string())
        .with_context(|| format!("Failed to write PID file: {:?}", pid_file))?;
    info!("Wrote PID file: {:?}", pid_file);
    Ok(())
}

pub fn remove_pid_file() -> Result<()> {
    let pid_file = pid_file_path();
    if pid_file.exists() {
        std::fs::remove_file(&pid_file)
            .with_context(|| format!("Failed to remove PID file: {:?}", pid_file))?;
        info!("Removed PID file: {:?}", pid_file);
    }
    Ok(())
}
