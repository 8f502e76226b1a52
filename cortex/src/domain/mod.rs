// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Mod
//!
//! Memory event model for the Cortex bounded context.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Re-exports memory events, errors and domain events

pub mod error;
pub mod events;
pub mod memory_event;

pub use error::*;
pub use events::*;
pub use memory_event::*;
