// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Performance Report
//!
//! Aggregates captured memory events into per-stage and per-pipeline
//! statistics over a time window.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use triad_cortex::{CortexError, MemoryEvent, MemoryFilter, MemoryKind, MemoryRepository};

use crate::domain::strategy::Stage;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AttemptStats {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    pub max_latency_ms: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

impl AttemptStats {
    fn add(&mut self, event: &MemoryEvent) {
        let content = &event.content;
        self.attempts += 1;
        if content.success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        // Running mean; avoids keeping a latency sum per stage.
        self.avg_latency_ms +=
            (content.latency_ms as f64 - self.avg_latency_ms) / self.attempts as f64;
        self.max_latency_ms = self.max_latency_ms.max(content.latency_ms);
        self.tokens_in += u64::from(content.tokens_in);
        self.tokens_out += u64::from(content.tokens_out);
        self.success_rate = self.successes as f64 / self.attempts as f64;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineStats {
    pub total: u64,
    pub complete: u64,
    pub partial: u64,
    pub failed: u64,
    pub avg_latency_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceReport {
    pub since: DateTime<Utc>,
    pub generated_at: DateTime<Utc>,
    pub pipelines: PipelineStats,
    /// Every stage attempt in the window.
    pub overall: AttemptStats,
    pub stages: BTreeMap<Stage, AttemptStats>,
    /// Keyed by `provider/model`.
    pub models: BTreeMap<String, AttemptStats>,
}

impl PerformanceReport {
    pub fn from_events<'a>(
        events: impl IntoIterator<Item = &'a MemoryEvent>,
        since: DateTime<Utc>,
    ) -> Self {
        let mut report = Self {
            since,
            generated_at: Utc::now(),
            pipelines: PipelineStats::default(),
            overall: AttemptStats::default(),
            stages: BTreeMap::new(),
            models: BTreeMap::new(),
        };

        for event in events {
            let content = &event.content;
            if content.recorded_at < since {
                continue;
            }

            match content.kind {
                MemoryKind::StageAttempt => {
                    report.overall.add(event);
                    if let Some(stage) = content.stage.as_deref().and_then(|s| s.parse::<Stage>().ok()) {
                        report.stages.entry(stage).or_default().add(event);
                    }
                    let model = format!(
                        "{}/{}",
                        content.provider.as_deref().unwrap_or("unknown"),
                        content.model.as_deref().unwrap_or("unknown")
                    );
                    report.models.entry(model).or_default().add(event);
                }
                MemoryKind::Consolidated => {
                    let pipelines = &mut report.pipelines;
                    pipelines.total += 1;
                    match content.payload.get("status").and_then(|s| s.as_str()) {
                        Some("complete") => pipelines.complete += 1,
                        Some("partial") => pipelines.partial += 1,
                        _ => pipelines.failed += 1,
                    }
                    pipelines.avg_latency_ms += (content.latency_ms as f64
                        - pipelines.avg_latency_ms)
                        / pipelines.total as f64;
                }
            }
        }

        report
    }
}

/// Report over the last `hours` hours of captured memory.
pub async fn performance_report(
    repository: &dyn MemoryRepository,
    hours: u32,
) -> Result<PerformanceReport, CortexError> {
    let since = Utc::now() - Duration::hours(i64::from(hours));
    let events = repository
        .query(&MemoryFilter {
            since: Some(since),
            ..Default::default()
        })
        .await?;
    Ok(PerformanceReport::from_events(&events, since))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use triad_cortex::{Embedding, MemoryEventDraft};
    use uuid::Uuid;

    fn attempt(stage: &str, success: bool, latency_ms: u64) -> MemoryEvent {
        let mut draft = MemoryEventDraft::stage_attempt(Uuid::new_v4(), stage, 1);
        draft.provider = Some("openai".into());
        draft.model = Some("gpt-5".into());
        draft.success = success;
        draft.latency_ms = latency_ms;
        draft.tokens_in = 100;
        draft.tokens_out = 50;
        MemoryEvent::new(draft, Embedding { generation: 1, vector: vec![1.0] })
    }

    fn pipeline(status: &str, latency_ms: u64) -> MemoryEvent {
        let mut draft = MemoryEventDraft::consolidated(Uuid::new_v4());
        draft.payload = json!({ "status": status });
        draft.latency_ms = latency_ms;
        MemoryEvent::new(draft, Embedding { generation: 1, vector: vec![1.0] })
    }

    #[test]
    fn test_report_aggregates_by_stage_and_model() {
        let events = vec![
            attempt("strategist", true, 1000),
            attempt("briefer", false, 45000),
            attempt("briefer", false, 45000),
            attempt("briefer", true, 3000),
            pipeline("partial", 50000),
            pipeline("complete", 10000),
        ];
        let since = Utc::now() - Duration::hours(1);
        let report = PerformanceReport::from_events(&events, since);

        assert_eq!(report.overall.attempts, 4);
        assert_eq!(report.overall.tokens_in, 400);

        let briefer = &report.stages[&Stage::Briefer];
        assert_eq!(briefer.attempts, 3);
        assert_eq!(briefer.failures, 2);
        assert!((briefer.success_rate - 1.0 / 3.0).abs() < 1e-9);
        assert!((briefer.avg_latency_ms - 31000.0).abs() < 1e-6);
        assert_eq!(briefer.max_latency_ms, 45000);

        assert_eq!(report.models["openai/gpt-5"].attempts, 4);
        assert_eq!(report.pipelines.total, 2);
        assert_eq!(report.pipelines.partial, 1);
        assert_eq!(report.pipelines.complete, 1);
        assert!((report.pipelines.avg_latency_ms - 30000.0).abs() < 1e-6);
    }

    #[test]
    fn test_events_before_window_are_ignored() {
        let mut old = attempt("strategist", true, 10);
        old.content.recorded_at = Utc::now() - Duration::hours(30);
        let report = PerformanceReport::from_events([&old], Utc::now() - Duration::hours(24));
        assert_eq!(report.overall.attempts, 0);
        assert!(report.stages.is_empty());
    }
}
