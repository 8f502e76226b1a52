// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # PostgreSQL Memory Repository
//!
//! Cortex `MemoryRepository` backed by the `memory_events` table via `sqlx`,
//! so captured interactions survive restarts. The event content is stored as
//! a JSONB document; the embedding lives in its own `generation` and
//! `embedding REAL[]` columns so reindexing can swap it without rewriting the
//! document. Filter fields are mirrored into plain columns for lookups.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use triad_cortex::{
    CortexError, Embedding, Fingerprint, MemoryEvent, MemoryEventId, MemoryFilter, MemoryRepository,
};

const COLUMNS: &str = "id, generation, embedding, event_json";

fn storage_error(context: &str, error: impl std::fmt::Display) -> CortexError {
    CortexError::Storage(format!("{context}: {error}"))
}

pub struct PostgresMemoryRepository {
    pool: PgPool,
}

impl PostgresMemoryRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the table and its indexes if they do not exist yet.
    pub async fn migrate(&self) -> Result<(), CortexError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS memory_events (
                seq BIGSERIAL,
                id UUID PRIMARY KEY,
                fingerprint TEXT NOT NULL UNIQUE,
                kind TEXT NOT NULL,
                request_id UUID NOT NULL,
                stage TEXT,
                success BOOLEAN NOT NULL,
                recorded_at TIMESTAMPTZ NOT NULL,
                generation INTEGER NOT NULL,
                embedding REAL[] NOT NULL,
                event_json JSONB NOT NULL,
                indexed_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| storage_error("Failed to create memory_events", e))?;

        for statement in [
            "CREATE INDEX IF NOT EXISTS memory_events_seq_idx ON memory_events (seq)",
            "CREATE INDEX IF NOT EXISTS memory_events_request_idx ON memory_events (request_id)",
            "CREATE INDEX IF NOT EXISTS memory_events_generation_idx ON memory_events (generation)",
        ] {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| storage_error("Failed to index memory_events", e))?;
        }
        Ok(())
    }

    /// The event document without its embedding.
    fn encode(event: &MemoryEvent) -> Result<serde_json::Value, CortexError> {
        let mut document = serde_json::to_value(event)
            .map_err(|e| storage_error("Failed to serialize memory event", e))?;
        if let Some(fields) = document.as_object_mut() {
            fields.remove("embedding");
        }
        Ok(document)
    }

    fn decode(row: &PgRow) -> Result<MemoryEvent, CortexError> {
        let mut document: serde_json::Value = row
            .try_get("event_json")
            .map_err(|e| storage_error("Failed to read memory event", e))?;
        let generation: i32 = row
            .try_get("generation")
            .map_err(|e| storage_error("Failed to read generation", e))?;
        let vector: Vec<f32> = row
            .try_get("embedding")
            .map_err(|e| storage_error("Failed to read embedding", e))?;

        let embedding = Embedding {
            generation: generation as u32,
            vector,
        };
        if let Some(fields) = document.as_object_mut() {
            let embedding = serde_json::to_value(&embedding)
                .map_err(|e| storage_error("Failed to serialize embedding", e))?;
            fields.insert("embedding".to_string(), embedding);
        }
        serde_json::from_value(document)
            .map_err(|e| storage_error("Failed to deserialize memory event", e))
    }

    fn push_filter(sql: &mut QueryBuilder<'_, Postgres>, filter: &MemoryFilter) {
        if let Some(kind) = filter.kind {
            sql.push(" AND kind = ").push_bind(kind.as_str());
        }
        if let Some(stage) = &filter.stage {
            sql.push(" AND stage = ").push_bind(stage.clone());
        }
        if let Some(request_id) = filter.request_id {
            sql.push(" AND request_id = ").push_bind(request_id);
        }
        if let Some(success) = filter.success {
            sql.push(" AND success = ").push_bind(success);
        }
        if let Some(since) = filter.since {
            sql.push(" AND recorded_at >= ").push_bind(since);
        }
        if let Some(generation) = filter.generation {
            sql.push(" AND generation = ").push_bind(generation as i32);
        }
    }
}

#[async_trait]
impl MemoryRepository for PostgresMemoryRepository {
    async fn insert(&self, event: MemoryEvent) -> Result<MemoryEventId, CortexError> {
        let document = Self::encode(&event)?;
        let content = &event.content;

        let inserted = sqlx::query(
            r#"
            INSERT INTO memory_events (
                id, fingerprint, kind, request_id, stage, success, recorded_at,
                generation, embedding, event_json, indexed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (fingerprint) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(event.id.0)
        .bind(event.fingerprint.as_str())
        .bind(content.kind.as_str())
        .bind(content.request_id)
        .bind(content.stage.as_deref())
        .bind(content.success)
        .bind(content.recorded_at)
        .bind(event.embedding.generation as i32)
        .bind(&event.embedding.vector)
        .bind(document)
        .bind(event.indexed_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| storage_error("Failed to insert memory event", e))?;

        if inserted.is_some() {
            return Ok(event.id);
        }

        // Fingerprint already stored: hand back the original id.
        let row = sqlx::query("SELECT id FROM memory_events WHERE fingerprint = $1")
            .bind(event.fingerprint.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| storage_error("Failed to look up duplicate memory event", e))?;
        let id: uuid::Uuid = row
            .try_get("id")
            .map_err(|e| storage_error("Failed to read memory event id", e))?;
        Ok(MemoryEventId(id))
    }

    async fn query(&self, filter: &MemoryFilter) -> Result<Vec<MemoryEvent>, CortexError> {
        let mut sql = QueryBuilder::<Postgres>::new(format!(
            "SELECT {COLUMNS} FROM memory_events WHERE TRUE"
        ));
        Self::push_filter(&mut sql, filter);
        sql.push(" ORDER BY seq");
        if let Some(limit) = filter.limit {
            sql.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = sql
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| storage_error("Failed to query memory events", e))?;
        rows.iter().map(Self::decode).collect()
    }

    async fn find_by_id(&self, id: MemoryEventId) -> Result<Option<MemoryEvent>, CortexError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM memory_events WHERE id = $1"))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| storage_error("Failed to load memory event", e))?;
        row.as_ref().map(Self::decode).transpose()
    }

    async fn find_by_fingerprint(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<MemoryEvent>, CortexError> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM memory_events WHERE fingerprint = $1"
        ))
        .bind(fingerprint.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| storage_error("Failed to load memory event", e))?;
        row.as_ref().map(Self::decode).transpose()
    }

    async fn replace_embeddings(
        &self,
        embeddings: Vec<(MemoryEventId, Embedding)>,
    ) -> Result<(), CortexError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| storage_error("Failed to start reindex transaction", e))?;

        for (id, embedding) in &embeddings {
            let updated = sqlx::query(
                "UPDATE memory_events SET generation = $2, embedding = $3 WHERE id = $1",
            )
            .bind(id.0)
            .bind(embedding.generation as i32)
            .bind(&embedding.vector)
            .execute(&mut *tx)
            .await
            .map_err(|e| storage_error("Failed to replace embedding", e))?;

            // Dropping the transaction rolls back every earlier update.
            if updated.rows_affected() == 0 {
                return Err(CortexError::NotFound(*id));
            }
        }

        tx.commit()
            .await
            .map_err(|e| storage_error("Failed to commit reindex", e))
    }

    async fn count(&self) -> Result<usize, CortexError> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM memory_events")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| storage_error("Failed to count memory events", e))?;
        let count: i64 = row
            .try_get("count")
            .map_err(|e| storage_error("Failed to read count", e))?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use triad_cortex::{MemoryEventDraft, MemoryKind};
    use uuid::Uuid;

    fn event() -> MemoryEvent {
        let mut draft = MemoryEventDraft::stage_attempt(Uuid::nil(), "briefer", 2);
        draft.response = Some("Stadium lets out at 10pm".to_string());
        draft.success = true;
        MemoryEvent::new(
            draft,
            Embedding {
                generation: 3,
                vector: vec![0.5, -0.25],
            },
        )
    }

    #[test]
    fn test_document_omits_embedding() {
        let event = event();
        let document = PostgresMemoryRepository::encode(&event).unwrap();

        assert!(document.get("embedding").is_none());
        assert_eq!(document["fingerprint"], event.fingerprint.as_str());
        assert_eq!(document["stage"], "briefer");
        assert_eq!(document["kind"], MemoryKind::StageAttempt.as_str());
    }

    #[test]
    fn test_filters_become_bound_predicates() {
        let filter = MemoryFilter {
            kind: Some(MemoryKind::StageAttempt),
            stage: Some("briefer".to_string()),
            success: Some(true),
            generation: Some(1),
            ..MemoryFilter::default()
        };
        let mut sql = QueryBuilder::<Postgres>::new("SELECT id FROM memory_events WHERE TRUE");
        PostgresMemoryRepository::push_filter(&mut sql, &filter);

        assert_eq!(
            sql.sql(),
            "SELECT id FROM memory_events WHERE TRUE AND kind = $1 AND stage = $2 \
             AND success = $3 AND generation = $4"
        );
    }
}
