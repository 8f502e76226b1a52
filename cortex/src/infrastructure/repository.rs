// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Repository interfaces for Cortex bounded context
//! Defines the persistence contract for memory events

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{CortexError, Embedding, Fingerprint, MemoryEvent, MemoryEventId, MemoryKind};

/// Selection criteria for [`MemoryRepository::query`]. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct MemoryFilter {
    pub kind: Option<MemoryKind>,
    pub stage: Option<String>,
    pub request_id: Option<Uuid>,
    pub success: Option<bool>,
    pub since: Option<DateTime<Utc>>,
    /// Only events whose embedding belongs to this generation.
    pub generation: Option<u32>,
    pub limit: Option<usize>,
}

impl MemoryFilter {
    pub fn matches(&self, event: &MemoryEvent) -> bool {
        let content = &event.content;
        self.kind.is_none_or(|k| content.kind == k)
            && self
                .stage
                .as_deref()
                .is_none_or(|s| content.stage.as_deref() == Some(s))
            && self.request_id.is_none_or(|r| content.request_id == r)
            && self.success.is_none_or(|s| content.success == s)
            && self.since.is_none_or(|t| content.recorded_at >= t)
            && self.generation.is_none_or(|g| event.embedding.generation == g)
    }
}

/// Persistence collaborator for memory events.
///
/// Writes are at-least-once from the caller's point of view, so `insert` must
/// be idempotent on the fingerprint: inserting an event whose fingerprint is
/// already stored returns the existing id and stores nothing.
#[async_trait]
pub trait MemoryRepository: Send + Sync {
    async fn insert(&self, event: MemoryEvent) -> Result<MemoryEventId, CortexError>;

    /// Matching events in insertion order.
    async fn query(&self, filter: &MemoryFilter) -> Result<Vec<MemoryEvent>, CortexError>;

    async fn find_by_id(&self, id: MemoryEventId) -> Result<Option<MemoryEvent>, CortexError>;

    async fn find_by_fingerprint(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<MemoryEvent>, CortexError>;

    /// Swap the embeddings of stored events, all or nothing. Used only by
    /// reindexing: if any id is unknown or the write fails, no event changes.
    async fn replace_embeddings(
        &self,
        embeddings: Vec<(MemoryEventId, Embedding)>,
    ) -> Result<(), CortexError>;

    async fn count(&self) -> Result<usize, CortexError>;
}
