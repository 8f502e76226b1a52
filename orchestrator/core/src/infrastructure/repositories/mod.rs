// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Repository Implementations
//!
//! Infrastructure implementations of `StrategyRepository` from the domain
//! layer and of the cortex `MemoryRepository`, following the Repository
//! pattern from DDD.
//!
//! # Available Implementations
//!
//! - **InMemoryStrategyRepository** - `RwLock<HashMap>` storage for development and tests
//! - **PostgresStrategyRepository** - `strategies` table, JSONB document per run
//! - **PostgresMemoryRepository** - `memory_events` table, one row per captured interaction
//!
//! The backend is picked once at daemon startup by [`create_repositories`];
//! both stores share it, and with PostgreSQL they share one pool.

pub mod postgres_memory;
pub mod postgres_strategy;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::domain::repository::{RepositoryError, StorageBackend, StrategyRepository};
use crate::domain::strategy::{ConsolidatedStrategy, RequestId};
use crate::infrastructure::db::Database;
use triad_cortex::{InMemoryMemoryRepository, MemoryRepository};

pub use postgres_memory::PostgresMemoryRepository;
pub use postgres_strategy::PostgresStrategyRepository;

#[derive(Clone, Default)]
pub struct InMemoryStrategyRepository {
    strategies: Arc<RwLock<HashMap<RequestId, ConsolidatedStrategy>>>,
}

impl InMemoryStrategyRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StrategyRepository for InMemoryStrategyRepository {
    async fn save(&self, strategy: &ConsolidatedStrategy) -> Result<(), RepositoryError> {
        self.strategies
            .write()
            .await
            .insert(strategy.request_id, strategy.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: RequestId) -> Result<Option<ConsolidatedStrategy>, RepositoryError> {
        Ok(self.strategies.read().await.get(&id).cloned())
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<ConsolidatedStrategy>, RepositoryError> {
        let strategies = self.strategies.read().await;
        let mut all: Vec<ConsolidatedStrategy> = strategies.values().cloned().collect();
        all.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));
        all.truncate(limit);
        Ok(all)
    }
}

/// Strategy and memory stores on one backend.
#[derive(Clone)]
pub struct Repositories {
    pub strategies: Arc<dyn StrategyRepository>,
    pub memory: Arc<dyn MemoryRepository>,
}

impl Repositories {
    pub fn backend_name(backend: &StorageBackend) -> &'static str {
        match backend {
            StorageBackend::InMemory => "in_memory",
            StorageBackend::PostgreSQL(_) => "postgres",
        }
    }
}

/// Build both repositories for the configured backend, creating the
/// PostgreSQL tables on first use.
pub async fn create_repositories(backend: &StorageBackend) -> anyhow::Result<Repositories> {
    match backend {
        StorageBackend::InMemory => Ok(Repositories {
            strategies: Arc::new(InMemoryStrategyRepository::new()),
            memory: Arc::new(InMemoryMemoryRepository::new()),
        }),
        StorageBackend::PostgreSQL(config) => {
            let db = Database::new(&config.connection_string).await?;
            let strategies = PostgresStrategyRepository::new(db.get_pool().clone());
            strategies.migrate().await?;
            let memory = PostgresMemoryRepository::new(db.get_pool().clone());
            memory.migrate().await?;
            Ok(Repositories {
                strategies: Arc::new(strategies),
                memory: Arc::new(memory),
            })
        }
    }
}
