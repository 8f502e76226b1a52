// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Strategy
//!
//! Domain model for one pipeline run: the immutable [`StrategyRequest`], the
//! per-stage [`StageResult`]s and the final [`ConsolidatedStrategy`].
//!
//! Stage causality is a total order. The briefer never runs before the
//! strategist succeeds and the consolidator never runs before both precedents
//! have resolved; [`PipelineState`] encodes the legal transitions.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Requests, stage outcomes and pipeline status

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::llm::{FinishReason, LLMError, TokenUsage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_string(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Location/time context supplied by the snapshot collaborator.
/// Treated as opaque validated input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub latitude: f64,
    pub longitude: f64,
    /// Human-readable locality, e.g. "Frisco, TX".
    pub locality: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weather: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub airport: Option<serde_json::Value>,
}

/// Immutable pipeline input. Shared by reference for the whole run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyRequest {
    #[serde(default)]
    pub id: RequestId,
    pub snapshot: Snapshot,
    /// Free-form signal from the driver ("slow night, near the stadium").
    #[serde(default)]
    pub signal: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Strategist,
    Briefer,
    Consolidator,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Strategist, Stage::Briefer, Stage::Consolidator];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Strategist => "strategist",
            Stage::Briefer => "briefer",
            Stage::Consolidator => "consolidator",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "strategist" => Ok(Stage::Strategist),
            "briefer" => Ok(Stage::Briefer),
            "consolidator" => Ok(Stage::Consolidator),
            other => Err(format!("unknown stage '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    Fatal,
    RetryableExhausted,
    Cancelled,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Fatal => "fatal",
            FailureKind::RetryableExhausted => "retryable-exhausted",
            FailureKind::Cancelled => "cancelled",
        }
    }
}

/// Final classified error of a stage that did not produce output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFailure {
    pub kind: FailureKind,
    /// [`LLMError::code`] of the last error.
    pub error_code: String,
    pub message: String,
}

impl StageFailure {
    pub fn new(kind: FailureKind, error: &LLMError) -> Self {
        Self {
            kind,
            error_code: error.code().to_string(),
            message: error.to_string(),
        }
    }
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.kind.as_str())
    }
}

/// Accepted outcome of one stage: the last attempt plus how many came before it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: Stage,
    pub provider: String,
    pub model: String,
    pub success: bool,
    /// Normalized text; empty when the stage failed.
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<serde_json::Value>,
    /// Latency of the final attempt.
    pub latency_ms: u64,
    pub attempts: u32,
    pub prior_failures: u32,
    #[serde(default)]
    pub usage: TokenUsage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<StageFailure>,
}

/// One attempt as handed to learning capture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub request_id: RequestId,
    pub stage: Stage,
    pub attempt: u32,
    pub provider: String,
    pub model: String,
    pub prompt: String,
    pub response: Option<String>,
    pub error: Option<String>,
    pub success: bool,
    pub latency_ms: u64,
    pub usage: TokenUsage,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStatus {
    Complete,
    Partial,
    Failed,
}

impl PipelineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::Complete => "complete",
            PipelineStatus::Partial => "partial",
            PipelineStatus::Failed => "failed",
        }
    }
}

/// Per-request state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineState {
    Pending,
    Strategist,
    Briefer,
    Consolidator,
    Done,
    Failed,
}

impl PipelineState {
    /// FAILED is reachable from every non-terminal state; otherwise only forward.
    pub fn can_transition_to(&self, next: PipelineState) -> bool {
        use PipelineState::*;
        matches!(
            (self, next),
            (Pending, Strategist)
                | (Strategist, Briefer)
                | (Briefer, Consolidator)
                | (Consolidator, Done)
                | (Pending | Strategist | Briefer | Consolidator, Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Failed)
    }

    pub fn for_stage(stage: Stage) -> Self {
        match stage {
            Stage::Strategist => PipelineState::Strategist,
            Stage::Briefer => PipelineState::Briefer,
            Stage::Consolidator => PipelineState::Consolidator,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub text: String,
    /// JSON object pulled out of the consolidator's reply, if it contained one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured: Option<serde_json::Value>,
    /// Plan rules the reply broke. Advisory: the run keeps its status.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<String>,
}

/// Fewest venues a plan may list.
pub const MIN_VENUES: usize = 4;

/// Fields every venue in a plan must carry.
pub const VENUE_FIELDS: [&str; 6] = [
    "name",
    "address",
    "category",
    "distance_miles",
    "drive_time_minutes",
    "reasoning",
];

impl Recommendation {
    pub fn new(text: String, structured: Option<serde_json::Value>) -> Self {
        let violations = match &structured {
            Some(plan) => plan_violations(plan),
            None => vec!["reply carries no JSON plan".to_string()],
        };
        Self {
            text,
            structured,
            violations,
        }
    }

    pub fn is_sound(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Check a consolidator plan: at least [`MIN_VENUES`] venues, each with every
/// field in [`VENUE_FIELDS`], and a non-empty staging area.
pub fn plan_violations(plan: &serde_json::Value) -> Vec<String> {
    use serde_json::Value;

    let mut violations = Vec::new();
    let venues = plan
        .get("venues")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    if venues.len() < MIN_VENUES {
        violations.push(format!(
            "expected at least {MIN_VENUES} venues, got {}",
            venues.len()
        ));
    }
    for (i, venue) in venues.iter().enumerate() {
        let missing: Vec<&str> = VENUE_FIELDS
            .iter()
            .copied()
            .filter(|field| venue.get(field).is_none_or(Value::is_null))
            .collect();
        if !missing.is_empty() {
            violations.push(format!("venue {i} missing fields: {}", missing.join(", ")));
        }
    }

    let staged = match plan.get("staging_area") {
        None | Some(Value::Null) => false,
        Some(Value::Object(fields)) => !fields.is_empty(),
        Some(Value::String(name)) => !name.trim().is_empty(),
        Some(_) => true,
    };
    if !staged {
        violations.push("staging area required".to_string());
    }
    violations
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedStage {
    pub stage: Stage,
    pub failure: StageFailure,
}

/// Final output of a pipeline run. Failed runs keep the stages that did resolve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidatedStrategy {
    pub request_id: RequestId,
    pub snapshot_id: Uuid,
    pub status: PipelineStatus,
    /// Resolved stages in execution order.
    pub stages: Vec<StageResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<Recommendation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<FailedStage>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub total_latency_ms: u64,
}

impl ConsolidatedStrategy {
    pub fn stage(&self, stage: Stage) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.stage == stage)
    }
}

/// Structured failure naming the stage that stopped the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("pipeline failed at {stage}: {failure}")]
pub struct PipelineFailure {
    pub stage: Stage,
    pub failure: StageFailure,
    /// Everything that resolved before the failure, status `failed`.
    pub strategy: ConsolidatedStrategy,
}
