// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Learning memory commands
//!
//! Commands: search, export

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use triad_core::domain::strategy::Stage;

use super::connected_client;

#[derive(Subcommand)]
pub enum MemoryCommand {
    /// Semantic search over captured stage attempts
    Search {
        query: String,

        /// Number of results
        #[arg(short, default_value = "5")]
        k: usize,
    },

    /// Export successful attempts as JSON Lines
    Export {
        /// Only this stage (strategist, briefer, consolidator)
        #[arg(long)]
        stage: Option<Stage>,

        /// Only attempts recorded at or after this RFC 3339 time
        #[arg(long)]
        since: Option<DateTime<Utc>>,

        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

pub async fn handle_command(command: MemoryCommand, host: &str, port: u16) -> Result<()> {
    let client = connected_client(host, port).await?;

    match command {
        MemoryCommand::Search { query, k } => {
            let response = client.search_memory(&query, k).await?;
            let results = response["results"].as_array().cloned().unwrap_or_default();
            if results.is_empty() {
                println!("{}", "No matching memory".dimmed());
                return Ok(());
            }
            for hit in results {
                let event = &hit["event"];
                println!(
                    "{:.3}  {}  {} {}",
                    hit["similarity"].as_f64().unwrap_or_default(),
                    event["kind"].as_str().unwrap_or("?").bold(),
                    event["stage"].as_str().unwrap_or("-"),
                    event["request_id"].as_str().unwrap_or("")
                );
                if let Some(response) = event["response"].as_str() {
                    println!("       {}", preview(response, 120).dimmed());
                }
            }
            Ok(())
        }
        MemoryCommand::Export {
            stage,
            since,
            output,
        } => {
            let jsonl = client.export_memory(stage, since).await?;
            match output {
                Some(path) => {
                    std::fs::write(&path, &jsonl)
                        .with_context(|| format!("Failed to write export to {:?}", path))?;
                    println!(
                        "{}",
                        format!(
                            "✓ Exported {} examples to {}",
                            jsonl.lines().count(),
                            path.display()
                        )
                        .green()
                    );
                }
                None => print!("{jsonl}"),
            }
            Ok(())
        }
    }
}

fn preview(text: &str, max_chars: usize) -> String {
    let line = text.lines().next().unwrap_or_default();
    if line.chars().count() > max_chars {
        format!("{}…", line.chars().take(max_chars).collect::<String>())
    } else {
        line.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_truncates_first_line() {
        assert_eq!(preview("short\nsecond line", 10), "short");
        assert_eq!(preview("abcdefghijkl", 5), "abcde…");
    }
}
