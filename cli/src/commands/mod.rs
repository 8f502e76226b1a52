// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for the Triad CLI

use anyhow::Result;

use crate::daemon::{check_daemon_running, DaemonClient, DaemonStatus};

pub mod config;
pub mod daemon;
pub mod memory;
pub mod strategy;

pub use self::config::ConfigCommand;
pub use self::daemon::DaemonCommand;
pub use self::memory::MemoryCommand;
pub use self::strategy::StrategyCommand;

/// Client for commands that only make sense against a running daemon.
pub(crate) async fn connected_client(host: &str, port: u16) -> Result<DaemonClient> {
    match check_daemon_running(host, port).await? {
        DaemonStatus::Running { .. } => DaemonClient::new(host, port),
        _ => anyhow::bail!(
            "Daemon is not running. Start it with 'triad daemon start'; stored strategies and memory live in the daemon."
        ),
    }
}
