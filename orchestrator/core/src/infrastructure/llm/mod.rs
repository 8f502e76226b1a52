// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// LLM Provider Infrastructure - Anti-Corruption Layer Implementations
//
// Each provider adapter translates between the domain call contract and one
// vendor API. Stage bindings in `registry` are what the pipeline calls.

pub mod anthropic;
pub mod gemini;
pub mod openai;
pub mod registry;
pub mod sse;
pub mod transport;

pub use registry::{AdapterRegistry, ProviderHandle, StageBinding, StageBindings};
pub use transport::ProviderPool;
