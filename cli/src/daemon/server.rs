// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Daemon HTTP server

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

use triad_core::domain::node_config::{MetricsConfig, TriadConfigManifest};
use triad_core::presentation::api::app;

use super::{remove_pid_file, write_pid_file};
use crate::embedded::Services;

/// Serve the API until SIGINT/SIGTERM. `port` overrides `network.port`.
pub async fn start_daemon(config: TriadConfigManifest, port: Option<u16>) -> Result<()> {
    let pid = std::process::id();
    write_pid_file(pid)?;
    let _guard = PidFileGuard;

    info!(
        "Triad daemon starting (PID: {}, config: {})",
        pid, config.metadata.name
    );

    if config.spec.observability.metrics.enabled {
        install_metrics_exporter(&config.spec.observability.metrics)?;
    }

    let services = Services::build(&config).await?;
    let router = app(Arc::new(services.app_state()));

    let network = &config.spec.network;
    let addr = format!("{}:{}", network.bind_address, port.unwrap_or(network.port));
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!("Daemon listening on {}", addr);

    let shutdown = services.shutdown.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Aborts in-flight runs so open streams can finish.
            shutdown.cancel();
        })
        .await
        .context("HTTP server failed")?;

    info!("Daemon shutting down, draining learning capture");
    services.shutdown().await;
    info!("Daemon stopped");
    Ok(())
}

fn install_metrics_exporter(config: &MetricsConfig) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;
    info!("Prometheus metrics exposed on {}", addr);
    Ok(())
}

struct PidFileGuard;

impl Drop for PidFileGuard {
    fn drop(&mut self) {
        let _ = remove_pid_file();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
