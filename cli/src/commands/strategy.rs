// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Strategy commands
//!
//! Commands: run, get, list, performance, providers

use anyhow::{Context, Result};
use clap::{Subcommand, ValueEnum};
use colored::Colorize;
use std::io::Write;
use std::path::PathBuf;
use tracing::info;

use triad_core::domain::events::PipelineEvent;
use triad_core::domain::node_config::TriadConfigManifest;
use triad_core::domain::strategy::{
    ConsolidatedStrategy, PipelineStatus, RequestId, Snapshot, StrategyRequest,
};
use triad_core::infrastructure::event_bus::EventBusError;

use super::connected_client;
use crate::daemon::client::StrategyOutcome;
use crate::daemon::{check_daemon_running, DaemonClient, DaemonStatus};
use crate::embedded::Services;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum StrategyCommand {
    /// Run the three-stage pipeline for a location
    Run {
        /// Full request as JSON (overrides the location flags)
        #[arg(long, value_name = "FILE", conflicts_with_all = ["latitude", "longitude", "locality"])]
        file: Option<PathBuf>,

        #[arg(long, allow_hyphen_values = true, required_unless_present = "file")]
        latitude: Option<f64>,

        #[arg(long, allow_hyphen_values = true, required_unless_present = "file")]
        longitude: Option<f64>,

        /// Human-readable locality, e.g. "Frisco, TX"
        #[arg(long, required_unless_present = "file")]
        locality: Option<String>,

        /// IANA timezone of the snapshot
        #[arg(long)]
        timezone: Option<String>,

        /// Free-form note from the driver
        #[arg(long, default_value = "")]
        signal: String,

        /// Print pipeline events as they happen
        #[arg(long)]
        stream: bool,

        #[arg(long, value_enum, default_value = "text")]
        output: OutputFormat,
    },

    /// Show a stored strategy
    Get {
        id: String,

        #[arg(long, value_enum, default_value = "text")]
        output: OutputFormat,
    },

    /// List recent strategies
    List {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Per-stage performance over a time window
    Performance {
        /// Window size in hours
        #[arg(long, default_value = "24")]
        hours: u32,
    },

    /// Health of every provider and stage binding
    Providers,
}

pub async fn handle_command(
    command: StrategyCommand,
    config_path: Option<PathBuf>,
    host: &str,
    port: u16,
) -> Result<()> {
    match command {
        StrategyCommand::Run {
            file,
            latitude,
            longitude,
            locality,
            timezone,
            signal,
            stream,
            output,
        } => {
            let request = match file {
                Some(path) => read_request(&path)?,
                None => StrategyRequest {
                    id: RequestId::new(),
                    snapshot: Snapshot {
                        id: uuid::Uuid::new_v4(),
                        latitude: latitude.context("--latitude is required")?,
                        longitude: longitude.context("--longitude is required")?,
                        locality: locality.context("--locality is required")?,
                        timestamp: chrono::Utc::now(),
                        timezone,
                        weather: None,
                        airport: None,
                    },
                    signal,
                },
            };
            run(request, config_path, host, port, stream, output).await
        }
        StrategyCommand::Get { id, output } => {
            let id = RequestId::from_string(&id).with_context(|| format!("Invalid id '{id}'"))?;
            let client = connected_client(host, port).await?;
            match client.get_strategy(id).await? {
                Some(strategy) => print_strategy(&strategy, output),
                None => {
                    println!("{}", format!("✗ Strategy {id} not found").red());
                    Ok(())
                }
            }
        }
        StrategyCommand::List { limit } => {
            let client = connected_client(host, port).await?;
            let strategies = client.list_strategies(limit).await?;
            if strategies.is_empty() {
                println!("{}", "No strategies yet".dimmed());
            }
            for strategy in strategies {
                println!(
                    "{}  {}  {:>7}ms  {}",
                    strategy.request_id,
                    status_label(strategy.status),
                    strategy.total_latency_ms,
                    strategy.completed_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
            Ok(())
        }
        StrategyCommand::Performance { hours } => {
            let client = connected_client(host, port).await?;
            let report = client.performance(hours).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        StrategyCommand::Providers => {
            let client = connected_client(host, port).await?;
            let health = client.provider_health().await?;
            println!("{}", serde_json::to_string_pretty(&health)?);
            Ok(())
        }
    }
}

fn read_request(path: &PathBuf) -> Result<StrategyRequest> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read request file {:?}", path))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid request in {:?}", path))
}

/// Delegate to the daemon when it is up, otherwise run in-process.
async fn run(
    request: StrategyRequest,
    config_path: Option<PathBuf>,
    host: &str,
    port: u16,
    stream: bool,
    output: OutputFormat,
) -> Result<()> {
    let outcome = match check_daemon_running(host, port).await {
        Ok(DaemonStatus::Running { .. }) => {
            info!("Submitting request {} to daemon", request.id);
            let client = DaemonClient::new(host, port)?;
            if stream {
                client.stream_strategy(&request, print_event).await?
            } else {
                client.run_strategy(&request).await?
            }
        }
        _ => {
            info!("Daemon not running, executing in embedded mode");
            let config = TriadConfigManifest::load_or_default(config_path)
                .context("Failed to load configuration")?;
            let services = Services::build(&config).await?;
            let outcome = {
                let mut events = services.pipeline.event_bus().subscribe_request(request.id);
                let mut listening = stream;
                let run = services.run(request);
                tokio::pin!(run);
                let outcome = loop {
                    tokio::select! {
                        biased;
                        received = events.recv(), if listening => match received {
                            Ok(event) => print_event(&event),
                            Err(EventBusError::Lagged(_)) => {}
                            Err(_) => listening = false,
                        },
                        outcome = &mut run => break outcome.map_err(Box::new),
                    }
                };
                if stream {
                    while let Ok(event) = events.try_recv() {
                        print_event(&event);
                    }
                }
                outcome
            };
            services.shutdown().await;
            outcome
        }
    };

    report_outcome(outcome, output)
}

fn report_outcome(outcome: StrategyOutcome, output: OutputFormat) -> Result<()> {
    match outcome {
        Ok(strategy) => print_strategy(&strategy, output),
        Err(failure) => {
            if output == OutputFormat::Json {
                println!("{}", serde_json::to_string_pretty(&failure)?);
            } else {
                print_strategy(&failure.strategy, output)?;
            }
            anyhow::bail!(
                "Pipeline failed at {}: {}",
                failure.stage,
                failure.failure
            )
        }
    }
}

fn print_event(event: &PipelineEvent) {
    match event {
        PipelineEvent::StageStarted {
            stage,
            attempt,
            provider,
            model,
            ..
        } => eprintln!(
            "{} {} attempt {} ({}/{})",
            "▶".cyan(),
            stage,
            attempt,
            provider,
            model
        ),
        PipelineEvent::StageChunk { delta, .. } => {
            eprint!("{delta}");
            let _ = std::io::stderr().flush();
        }
        PipelineEvent::AttemptFailed {
            stage,
            attempt,
            message,
            retryable,
            ..
        } => eprintln!(
            "\n{} {} attempt {} failed{}: {}",
            "⚠".yellow(),
            stage,
            attempt,
            if *retryable { " (retrying)" } else { "" },
            message
        ),
        PipelineEvent::StageCompleted {
            stage, latency_ms, ..
        } => eprintln!("\n{} {} done in {}ms", "✓".green(), stage, latency_ms),
        PipelineEvent::StageFailed { stage, failure, .. } => {
            eprintln!("\n{} {} failed: {}", "✗".red(), stage, failure)
        }
        _ => {}
    }
}

fn status_label(status: PipelineStatus) -> colored::ColoredString {
    match status {
        PipelineStatus::Complete => status.as_str().green(),
        PipelineStatus::Partial => status.as_str().yellow(),
        PipelineStatus::Failed => status.as_str().red(),
    }
}

fn print_strategy(strategy: &ConsolidatedStrategy, output: OutputFormat) -> Result<()> {
    if output == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(strategy)?);
        return Ok(());
    }

    println!("{}", format!("Strategy {}", strategy.request_id).bold());
    println!(
        "  Status: {}   Total: {}ms",
        status_label(strategy.status),
        strategy.total_latency_ms
    );
    for stage in &strategy.stages {
        let marker = if stage.success { "✓".green() } else { "✗".red() };
        print!(
            "  {} {:<13} {}/{}  {} attempt(s)  {}ms",
            marker, stage.stage.as_str(), stage.provider, stage.model, stage.attempts, stage.latency_ms
        );
        match &stage.failure {
            Some(failure) => println!("  {}", failure.to_string().red()),
            None => println!(),
        }
    }

    if let Some(recommendation) = &strategy.recommendation {
        println!();
        println!("{}", "Recommendation:".bold());
        println!("{}", recommendation.text);
        for violation in &recommendation.violations {
            println!("  {} {}", "⚠".yellow(), violation.yellow());
        }
    }
    Ok(())
}
