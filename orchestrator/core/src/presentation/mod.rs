// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Presentation Layer (`triad-orchestrator-core`)
//!
//! HTTP surface that translates external requests into application calls.
//! **No business logic lives here**; the pipeline, the semantic index and the
//! adapter registry do the real work.
//!
//! | Module | Transport | Description |
//! |--------|-----------|-------------|
//! | [`api`] | HTTP/SSE (Axum) | Strategy endpoints, memory search/export, health |

pub mod api;
