// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Triad orchestrator core
//!
//! Chains three LLM providers (strategist, briefer, consolidator) into one
//! strategy pipeline and records every interaction into semantic memory.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Domain model, pipeline, provider adapters and HTTP API

pub mod domain;
pub mod application;
pub mod infrastructure;
pub mod presentation;

pub use domain::*;
