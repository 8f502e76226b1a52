// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Infrastructure layer for Cortex bounded context

pub mod embedding_client;
pub mod memory_store;
pub mod repository;

pub use embedding_client::{Embedder, HashingEmbedder, HttpEmbedder};
pub use memory_store::InMemoryMemoryRepository;
pub use repository::{MemoryFilter, MemoryRepository};
