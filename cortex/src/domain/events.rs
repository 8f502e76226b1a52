// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Domain events for the Cortex bounded context

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::memory_event::{Fingerprint, MemoryEventId};

/// Cortex domain events
/// These events are published to the event bus for observability
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CortexEvent {
    /// A new memory event was embedded and stored
    MemoryIndexed {
        event_id: MemoryEventId,
        request_id: Uuid,
        fingerprint: Fingerprint,
        generation: u32,
        timestamp: DateTime<Utc>,
    },

    /// A redelivered record matched an existing fingerprint and was not stored again
    DuplicateSkipped {
        existing_id: MemoryEventId,
        fingerprint: Fingerprint,
        timestamp: DateTime<Utc>,
    },

    /// Every stored event was re-embedded into a new generation
    IndexRebuilt {
        generation: u32,
        dimension: usize,
        embedder: String,
        reindexed: usize,
        timestamp: DateTime<Utc>,
    },
}

impl CortexEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            CortexEvent::MemoryIndexed { .. } => "memory_indexed",
            CortexEvent::DuplicateSkipped { .. } => "duplicate_skipped",
            CortexEvent::IndexRebuilt { .. } => "index_rebuilt",
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            CortexEvent::MemoryIndexed { timestamp, .. }
            | CortexEvent::DuplicateSkipped { timestamp, .. }
            | CortexEvent::IndexRebuilt { timestamp, .. } => *timestamp,
        }
    }
}
