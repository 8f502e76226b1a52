// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Service composition
//!
//! Builds the pipeline and its collaborators from a configuration manifest.
//! The daemon serves them over HTTP; CLI commands use them in-process when no
//! daemon is running.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use triad_core::{
    application::{BackoffSchedule, LearningCapture, PromptBuilder, RetryPolicy, StrategyPipeline},
    domain::{
        node_config::{
            resolve_secret, EmbedderKind, IndexConfig, StorageBackendKind, StorageConfig,
            TriadConfigManifest,
        },
        repository::{PostgresConfig, StorageBackend},
        strategy::{ConsolidatedStrategy, PipelineFailure, StrategyRequest},
    },
    infrastructure::{
        event_bus::EventBus,
        llm::AdapterRegistry,
        repositories::{create_repositories, Repositories},
    },
    presentation::api::AppState,
};
use triad_cortex::{Embedder, HashingEmbedder, HttpEmbedder, SemanticSearchIndex};

pub struct Services {
    pub pipeline: Arc<StrategyPipeline>,
    pub registry: Arc<AdapterRegistry>,
    pub index: Arc<SemanticSearchIndex>,
    /// Cancelled on shutdown; every request token is a child of it.
    pub shutdown: CancellationToken,
    capture_worker: Option<JoinHandle<()>>,
}

impl Services {
    pub async fn build(config: &TriadConfigManifest) -> Result<Self> {
        config
            .validate()
            .context("Configuration validation failed")?;

        let registry = Arc::new(
            AdapterRegistry::from_config(config).context("Failed to initialize LLM providers")?,
        );
        let event_bus = EventBus::with_default_capacity();

        let embedder = build_embedder(&config.spec.index)?;
        info!(
            embedder = embedder.name(),
            dimension = embedder.dimension(),
            "Semantic index configured"
        );
        let backend = storage_backend(&config.spec.storage)?;
        let repositories = create_repositories(&backend)
            .await
            .context("Failed to initialize storage")?;
        info!(backend = Repositories::backend_name(&backend), "Storage configured");

        let index = Arc::new(
            SemanticSearchIndex::new(repositories.memory.clone(), embedder)
                .with_publisher(Arc::new(event_bus.clone())),
        );

        let shutdown = CancellationToken::new();
        let capture_config = &config.spec.capture;
        let (capture, capture_worker) = if capture_config.enabled {
            let (capture, worker) = LearningCapture::new(
                index.clone(),
                capture_config.queue_capacity,
                capture_config.overflow_capacity,
                capture_config.index_concurrency,
                shutdown.clone(),
            );
            (capture, Some(tokio::spawn(worker.run())))
        } else {
            warn!("Learning capture disabled; stage attempts will not be indexed");
            (LearningCapture::disabled(), None)
        };

        let pipeline = Arc::new(StrategyPipeline::new(
            registry.bindings().clone(),
            RetryPolicy::new(BackoffSchedule::from_config(&config.spec.retry)),
            PromptBuilder::new()?,
            event_bus,
            capture,
            repositories.strategies,
        ));

        Ok(Self {
            pipeline,
            registry,
            index,
            shutdown,
            capture_worker,
        })
    }

    pub fn app_state(&self) -> AppState {
        AppState {
            pipeline: self.pipeline.clone(),
            registry: self.registry.clone(),
            index: self.index.clone(),
            shutdown: self.shutdown.clone(),
            start_time: std::time::Instant::now(),
        }
    }

    /// Run one request in-process.
    pub async fn run(
        &self,
        request: StrategyRequest,
    ) -> Result<ConsolidatedStrategy, PipelineFailure> {
        self.pipeline
            .run(request, self.shutdown.child_token())
            .await
    }

    /// Cancel in-flight runs and wait for queued captures to be indexed.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(worker) = self.capture_worker.take() {
            if let Err(e) = worker.await {
                error!(error = %e, "Learning capture worker failed");
            }
        }
    }
}

fn build_embedder(config: &IndexConfig) -> Result<Arc<dyn Embedder>> {
    match config.embedder {
        EmbedderKind::Hashing => Ok(Arc::new(HashingEmbedder::new(config.dimension))),
        EmbedderKind::Http => {
            let (Some(endpoint), Some(model)) = (&config.endpoint, &config.model) else {
                anyhow::bail!("index.endpoint and index.model are required for the http embedder");
            };
            let api_key = resolve_secret(&config.api_key).map_err(anyhow::Error::msg)?;
            let embedder = HttpEmbedder::new(endpoint.clone(), model.clone(), api_key, config.dimension)
                .context("Failed to create embedding client")?;
            Ok(Arc::new(embedder))
        }
    }
}

fn storage_backend(config: &StorageConfig) -> Result<StorageBackend> {
    match config.backend {
        StorageBackendKind::InMemory => Ok(StorageBackend::InMemory),
        StorageBackendKind::Postgres => {
            let connection_string = resolve_secret(&config.connection_string)
                .map_err(anyhow::Error::msg)?
                .context("storage.connection_string is required for the postgres backend")?;
            Ok(StorageBackend::PostgreSQL(PostgresConfig { connection_string }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_postgres_backend_requires_connection_string() {
        let config = StorageConfig {
            backend: StorageBackendKind::Postgres,
            connection_string: None,
        };
        assert!(storage_backend(&config).is_err());

        let config = StorageConfig {
            backend: StorageBackendKind::Postgres,
            connection_string: Some("postgres://triad@localhost/triad".to_string()),
        };
        match storage_backend(&config).unwrap() {
            StorageBackend::PostgreSQL(pg) => {
                assert_eq!(pg.connection_string, "postgres://triad@localhost/triad")
            }
            StorageBackend::InMemory => panic!("expected postgres backend"),
        }
    }

    #[test]
    fn test_http_embedder_needs_endpoint_and_model() {
        let config = IndexConfig {
            embedder: EmbedderKind::Http,
            endpoint: Some("http://localhost:11434/v1".to_string()),
            ..Default::default()
        };
        assert!(build_embedder(&config).is_err());
    }

    #[tokio::test]
    async fn test_postgres_backend_is_used_for_memory_too() {
        // Selecting postgres must reach the database for both stores rather
        // than quietly falling back to process memory.
        let mut config = TriadConfigManifest::default();
        config.spec.storage = StorageConfig {
            backend: StorageBackendKind::Postgres,
            connection_string: Some("not-a-postgres-url".to_string()),
        };
        let err = match Services::build(&config).await {
            Ok(_) => panic!("postgres backend without a database must not build"),
            Err(e) => e,
        };
        assert!(format!("{err:#}").contains("Failed to initialize storage"));
    }

    #[tokio::test]
    async fn test_default_manifest_builds_services() {
        // Stages without credentials stay bound as misconfigured.
        let config = TriadConfigManifest::default();
        let services = Services::build(&config).await.unwrap();
        assert_eq!(services.index.generation().number, 1);
        services.shutdown().await;
    }
}
