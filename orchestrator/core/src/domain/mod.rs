// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Mod
//!
//! Domain model of the strategy pipeline.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Implements mod

pub mod events;
pub mod llm;
pub mod node_config;
pub mod provider;
pub mod repository;
pub mod strategy;
