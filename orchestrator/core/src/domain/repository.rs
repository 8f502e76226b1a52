// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Domain Repository Interfaces
//!
//! Persistence contract for pipeline outcomes. The interface lives in the
//! domain layer and is implemented in `crate::infrastructure::repositories`.
//!
//! | Trait | Aggregate | Implementations |
//! |-------|-----------|----------------|
//! | `StrategyRepository` | `ConsolidatedStrategy` | `InMemoryStrategyRepository`, `PostgresStrategyRepository` |
//!
//! The backend is selected at daemon startup from `spec.storage` in
//! `triad-config.yaml`. The same backend holds memory events through the
//! cortex `MemoryRepository` trait.

use async_trait::async_trait;

use crate::domain::strategy::{ConsolidatedStrategy, RequestId};

/// Storage backend enum for pluggable persistence
#[derive(Debug, Clone)]
pub enum StorageBackend {
    InMemory,
    PostgreSQL(PostgresConfig),
}

#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub connection_string: String,
}

/// Repository interface for ConsolidatedStrategy records, including failed
/// runs with whatever stages resolved before the failure.
#[async_trait]
pub trait StrategyRepository: Send + Sync {
    /// Save strategy (create or replace)
    async fn save(&self, strategy: &ConsolidatedStrategy) -> Result<(), RepositoryError>;

    async fn find_by_id(&self, id: RequestId) -> Result<Option<ConsolidatedStrategy>, RepositoryError>;

    /// Most recently completed first
    async fn list_recent(&self, limit: usize) -> Result<Vec<ConsolidatedStrategy>, RepositoryError>;
}

/// Repository errors
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for RepositoryError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => RepositoryError::NotFound("Row not found".to_string()),
            _ => RepositoryError::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for RepositoryError {
    fn from(err: serde_json::Error) -> Self {
        RepositoryError::Serialization(err.to_string())
    }
}
