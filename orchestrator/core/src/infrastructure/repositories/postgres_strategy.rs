// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # PostgreSQL Strategy Repository
//!
//! `StrategyRepository` backed by the `strategies` table via `sqlx`. The full
//! `ConsolidatedStrategy` is stored as a JSONB document next to the columns
//! used for lookups and ordering.

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::Row;

use crate::domain::repository::{RepositoryError, StrategyRepository};
use crate::domain::strategy::{ConsolidatedStrategy, RequestId};

pub struct PostgresStrategyRepository {
    pool: PgPool,
}

impl PostgresStrategyRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the table if it does not exist yet.
    pub async fn migrate(&self) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS strategies (
                id UUID PRIMARY KEY,
                snapshot_id UUID NOT NULL,
                status TEXT NOT NULL,
                strategy_json JSONB NOT NULL,
                started_at TIMESTAMPTZ NOT NULL,
                completed_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS strategies_completed_at_idx ON strategies (completed_at DESC)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn decode(row: &sqlx::postgres::PgRow) -> Result<ConsolidatedStrategy, RepositoryError> {
        let json: serde_json::Value = row.get("strategy_json");
        serde_json::from_value(json).map_err(|e| {
            RepositoryError::Serialization(format!("Failed to deserialize strategy: {}", e))
        })
    }
}

#[async_trait]
impl StrategyRepository for PostgresStrategyRepository {
    async fn save(&self, strategy: &ConsolidatedStrategy) -> Result<(), RepositoryError> {
        let strategy_json = serde_json::to_value(strategy)?;

        sqlx::query(
            r#"
            INSERT INTO strategies (id, snapshot_id, status, strategy_json, started_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                strategy_json = EXCLUDED.strategy_json,
                completed_at = EXCLUDED.completed_at
            "#,
        )
        .bind(strategy.request_id.0)
        .bind(strategy.snapshot_id)
        .bind(strategy.status.as_str())
        .bind(strategy_json)
        .bind(strategy.started_at)
        .bind(strategy.completed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(format!("Failed to save strategy: {}", e)))?;

        Ok(())
    }

    async fn find_by_id(&self, id: RequestId) -> Result<Option<ConsolidatedStrategy>, RepositoryError> {
        let row = sqlx::query("SELECT strategy_json FROM strategies WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::decode).transpose()
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<ConsolidatedStrategy>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT strategy_json FROM strategies ORDER BY completed_at DESC LIMIT $1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::decode).collect()
    }
}
