// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use thiserror::Error;

use super::memory_event::MemoryEventId;

#[derive(Debug, Error)]
pub enum CortexError {
    #[error("embedding dimension mismatch: index expects {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("memory event not found: {0}")]
    NotFound(MemoryEventId),

    #[error("storage error: {0}")]
    Storage(String),
}
