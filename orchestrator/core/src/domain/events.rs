// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::strategy::{PipelineStatus, RequestId, Stage, StageFailure};

/// Observable progress of one pipeline run.
///
/// For a given request these are published in causal order: every event of
/// the strategist precedes every event of the briefer, and so on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    PipelineStarted {
        request_id: RequestId,
        locality: String,
        started_at: DateTime<Utc>,
    },
    StageStarted {
        request_id: RequestId,
        stage: Stage,
        attempt: u32,
        provider: String,
        model: String,
        started_at: DateTime<Utc>,
    },
    StageChunk {
        request_id: RequestId,
        stage: Stage,
        attempt: u32,
        delta: String,
    },
    AttemptFailed {
        request_id: RequestId,
        stage: Stage,
        attempt: u32,
        error_code: String,
        message: String,
        retryable: bool,
        failed_at: DateTime<Utc>,
    },
    StageCompleted {
        request_id: RequestId,
        stage: Stage,
        attempts: u32,
        latency_ms: u64,
        completed_at: DateTime<Utc>,
    },
    StageFailed {
        request_id: RequestId,
        stage: Stage,
        failure: StageFailure,
        failed_at: DateTime<Utc>,
    },
    PipelineCompleted {
        request_id: RequestId,
        status: PipelineStatus,
        total_latency_ms: u64,
        /// Plan rules the recommendation broke.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        violations: Vec<String>,
        completed_at: DateTime<Utc>,
    },
    PipelineFailed {
        request_id: RequestId,
        stage: Stage,
        failure: StageFailure,
        failed_at: DateTime<Utc>,
    },
}

impl PipelineEvent {
    pub fn request_id(&self) -> RequestId {
        match self {
            PipelineEvent::PipelineStarted { request_id, .. }
            | PipelineEvent::StageStarted { request_id, .. }
            | PipelineEvent::StageChunk { request_id, .. }
            | PipelineEvent::AttemptFailed { request_id, .. }
            | PipelineEvent::StageCompleted { request_id, .. }
            | PipelineEvent::StageFailed { request_id, .. }
            | PipelineEvent::PipelineCompleted { request_id, .. }
            | PipelineEvent::PipelineFailed { request_id, .. } => *request_id,
        }
    }

    pub fn stage(&self) -> Option<Stage> {
        match self {
            PipelineEvent::StageStarted { stage, .. }
            | PipelineEvent::StageChunk { stage, .. }
            | PipelineEvent::AttemptFailed { stage, .. }
            | PipelineEvent::StageCompleted { stage, .. }
            | PipelineEvent::StageFailed { stage, .. }
            | PipelineEvent::PipelineFailed { stage, .. } => Some(*stage),
            PipelineEvent::PipelineStarted { .. } | PipelineEvent::PipelineCompleted { .. } => None,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            PipelineEvent::PipelineStarted { .. } => "pipeline_started",
            PipelineEvent::StageStarted { .. } => "stage_started",
            PipelineEvent::StageChunk { .. } => "stage_chunk",
            PipelineEvent::AttemptFailed { .. } => "attempt_failed",
            PipelineEvent::StageCompleted { .. } => "stage_completed",
            PipelineEvent::StageFailed { .. } => "stage_failed",
            PipelineEvent::PipelineCompleted { .. } => "pipeline_completed",
            PipelineEvent::PipelineFailed { .. } => "pipeline_failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineEvent::PipelineCompleted { .. } | PipelineEvent::PipelineFailed { .. }
        )
    }
}
