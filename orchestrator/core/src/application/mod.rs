// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod learning_capture;
pub mod performance;
pub mod pipeline;
pub mod prompts;
pub mod retry;
pub mod training_export;

// Re-export use cases for convenience
pub use learning_capture::{CaptureItem, CaptureWorker, LearningCapture};
pub use performance::{performance_report, PerformanceReport};
pub use pipeline::StrategyPipeline;
pub use prompts::PromptBuilder;
pub use retry::{BackoffSchedule, RetryPolicy};
pub use training_export::{training_examples, TrainingExample};
