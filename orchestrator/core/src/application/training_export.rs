// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Training Export - successful stage attempts as prompt/response pairs
//
// One JSON object per line. Only successful attempts with both a prompt and a
// response are exported.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use triad_cortex::{CortexError, MemoryEvent, MemoryFilter, MemoryKind, MemoryRepository};

use crate::domain::strategy::Stage;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingExample {
    pub stage: String,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub prompt: String,
    pub response: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub latency_ms: u64,
    pub recorded_at: DateTime<Utc>,
}

impl TrainingExample {
    pub fn from_event(event: &MemoryEvent) -> Option<Self> {
        let content = &event.content;
        if content.kind != MemoryKind::StageAttempt || !content.success {
            return None;
        }
        Some(Self {
            stage: content.stage.clone()?,
            provider: content.provider.clone(),
            model: content.model.clone(),
            prompt: content.prompt.clone()?,
            response: content.response.clone()?,
            tokens_in: content.tokens_in,
            tokens_out: content.tokens_out,
            latency_ms: content.latency_ms,
            recorded_at: content.recorded_at,
        })
    }
}

pub async fn training_examples(
    repository: &dyn MemoryRepository,
    stage: Option<Stage>,
    since: Option<DateTime<Utc>>,
) -> Result<Vec<TrainingExample>, CortexError> {
    let filter = MemoryFilter {
        kind: Some(MemoryKind::StageAttempt),
        stage: stage.map(|s| s.as_str().to_string()),
        success: Some(true),
        since,
        ..Default::default()
    };
    let mut examples: Vec<_> = repository
        .query(&filter)
        .await?
        .iter()
        .filter_map(TrainingExample::from_event)
        .collect();
    examples.sort_by_key(|e| e.recorded_at);
    Ok(examples)
}

/// Serialize examples as JSON Lines.
pub fn to_jsonl(examples: &[TrainingExample]) -> Result<String, serde_json::Error> {
    let mut out = String::new();
    for example in examples {
        out.push_str(&serde_json::to_string(example)?);
        out.push('\n');
    }
    Ok(out)
}
