// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Application services for the Cortex bounded context

pub mod semantic_index;

pub use semantic_index::{
    cosine_similarity, CortexEventPublisher, IndexOutcome, SearchHit, SemanticSearchIndex,
};
