// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use triad_core::domain::node_config::TriadConfigManifest;
use triad_core::domain::strategy::Stage;
use triad_core::infrastructure::llm::AdapterRegistry;

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,
    },

    /// Validate configuration file and stage bindings
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Write the default configuration
    Generate {
        /// Output path (default: ./triad-config.yaml)
        #[arg(short, long, default_value = "./triad-config.yaml")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

pub async fn handle_command(
    command: ConfigCommand,
    config_override: Option<PathBuf>,
) -> Result<()> {
    match command {
        ConfigCommand::Show { paths } => show(config_override, paths),
        ConfigCommand::Validate { file } => validate(file.or(config_override)),
        ConfigCommand::Generate { output, force } => generate(output, force),
    }
}

fn show(config_override: Option<PathBuf>, show_paths: bool) -> Result<()> {
    let config = TriadConfigManifest::load_or_default(config_override.clone())
        .context("Failed to load configuration")?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        match &config_override {
            Some(path) => println!("  1. --config flag: {}", path.display()),
            None => println!("  1. --config flag: {}", "(not set)".dimmed()),
        }
        println!(
            "  2. TRIAD_CONFIG_PATH: {}",
            std::env::var("TRIAD_CONFIG_PATH")
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./triad-config.yaml");
        println!("  4. ~/.triad/config.yaml");
        println!("  5. /etc/triad/config.yaml");
        println!();
    }

    println!("{}", format!("Configuration: {}", config.metadata.name).bold());
    println!();

    println!("{}", "Providers:".bold());
    for provider in &config.spec.providers {
        println!(
            "  {} ({})  max {} concurrent",
            provider.name.bold(),
            provider.provider_type.as_str(),
            provider.max_concurrent_calls
        );
        println!(
            "    Endpoint: {}",
            provider.endpoint().unwrap_or_else(|| "(none)".to_string())
        );
    }
    println!();

    println!("{}", "Stages:".bold());
    for stage in Stage::ALL {
        let stage_config = config.spec.stages.get(stage);
        let parameters = match (stage_config.temperature, stage_config.reasoning_effort) {
            (Some(t), None) => format!("temperature {t}"),
            (None, Some(effort)) => format!("reasoning {}", effort.as_str()),
            (None, None) => "provider default".to_string(),
            (Some(t), Some(effort)) => format!("temperature {t} + reasoning {}", effort.as_str()),
        };
        println!(
            "  {:<13} {} → {}  {}  {} attempt(s), {}ms timeout{}",
            stage.as_str(),
            stage_config.provider,
            stage_config.model,
            parameters,
            stage_config.max_attempts,
            stage_config.timeout(stage).as_millis(),
            if stage_config.stream { ", streaming" } else { "" }
        );
    }
    println!();

    let retry = &config.spec.retry;
    println!("{}", "Retry:".bold());
    println!(
        "  {}ms initial, x{} per attempt, capped at {}ms",
        retry.initial_delay_ms, retry.multiplier, retry.max_delay_ms
    );
    println!();

    println!("{}", "Network:".bold());
    println!(
        "  {}:{}",
        config.spec.network.bind_address, config.spec.network.port
    );

    Ok(())
}

fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = TriadConfigManifest::load_or_default(config_path)
        .context("Failed to load configuration")?;
    config
        .validate()
        .context("Configuration validation failed")?;

    // Parameter and credential defects only show up once stages are bound.
    let registry = AdapterRegistry::from_config(&config)?;
    let mut defects = 0;
    for stage in Stage::ALL {
        if let Some(e) = registry.binding(stage).configuration_error() {
            defects += 1;
            println!("{}", format!("✗ {stage}: {e}").red());
        }
    }

    if defects > 0 {
        anyhow::bail!("{defects} stage(s) are misconfigured and will fail on every call");
    }
    println!("{}", "✓ Configuration is valid".green());
    Ok(())
}

fn generate(output: PathBuf, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!("{:?} already exists (use --force to overwrite)", output);
    }

    TriadConfigManifest::default()
        .to_yaml_file(&output)
        .with_context(|| format!("Failed to write config to {:?}", output))?;

    println!(
        "{}",
        format!("✓ Configuration generated: {}", output.display()).green()
    );
    println!("  API keys are read from ANTHROPIC_API_KEY, GEMINI_API_KEY and OPENAI_API_KEY.");
    Ok(())
}
