// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Learning Capture
//!
//! Fire-and-forget recording of stage attempts and final strategies into the
//! semantic index. [`LearningCapture::record`] never blocks and never fails:
//! items go into a bounded queue drained by [`CaptureWorker`], which embeds
//! and stores them with limited concurrency.
//!
//! When the queue is full the item goes to a bounded overflow buffer that the
//! worker also drains, so the caller still returns at once. Only when both are
//! full is an item dropped, and that is counted in
//! `triad_capture_dropped_total`. Once shutdown begins the queue and the
//! overflow buffer are closed, everything already accepted is indexed, and
//! later records are dropped with a warning.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Decouple the response path from memory indexing

use metrics::counter;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use triad_cortex::{IndexOutcome, MemoryEventDraft, SemanticSearchIndex};

use crate::domain::strategy::{ConsolidatedStrategy, PipelineStatus, StageRecord};

/// Anything the pipeline hands to capture.
#[derive(Debug, Clone)]
pub enum CaptureItem {
    Stage(StageRecord),
    Strategy(Box<ConsolidatedStrategy>),
}

impl From<StageRecord> for CaptureItem {
    fn from(record: StageRecord) -> Self {
        CaptureItem::Stage(record)
    }
}

impl From<ConsolidatedStrategy> for CaptureItem {
    fn from(strategy: ConsolidatedStrategy) -> Self {
        CaptureItem::Strategy(Box::new(strategy))
    }
}

impl CaptureItem {
    pub fn into_draft(self) -> MemoryEventDraft {
        match self {
            CaptureItem::Stage(record) => {
                let mut draft = MemoryEventDraft::stage_attempt(
                    record.request_id.0,
                    record.stage.as_str(),
                    record.attempt,
                );
                draft.provider = Some(record.provider);
                draft.model = Some(record.model);
                draft.prompt = Some(record.prompt);
                draft.response = record.response;
                draft.success = record.success;
                draft.error = record.error;
                draft.latency_ms = record.latency_ms;
                draft.tokens_in = record.usage.prompt_tokens;
                draft.tokens_out = record.usage.completion_tokens;
                draft.recorded_at = record.recorded_at;
                draft
            }
            CaptureItem::Strategy(strategy) => {
                let mut draft = MemoryEventDraft::consolidated(strategy.request_id.0);
                let final_stage = strategy.stages.last();

                draft.provider = final_stage.map(|s| s.provider.clone());
                draft.model = final_stage.map(|s| s.model.clone());
                draft.response = strategy.recommendation.as_ref().map(|r| r.text.clone());
                draft.success = strategy.status != PipelineStatus::Failed;
                draft.error = strategy
                    .failed_stage
                    .as_ref()
                    .map(|f| format!("{}: {}", f.stage, f.failure));
                draft.latency_ms = strategy.total_latency_ms;
                draft.tokens_in = strategy.stages.iter().map(|s| s.usage.prompt_tokens).sum();
                draft.tokens_out = strategy
                    .stages
                    .iter()
                    .map(|s| s.usage.completion_tokens)
                    .sum();
                draft.payload = json!({
                    "status": strategy.status,
                    "snapshot_id": strategy.snapshot_id,
                    "stages": strategy.stages.iter().map(|s| json!({
                        "stage": s.stage,
                        "success": s.success,
                        "attempts": s.attempts,
                        "failure": s.failure,
                    })).collect::<Vec<_>>(),
                    "structured": strategy.recommendation.as_ref().and_then(|r| r.structured.clone()),
                    "violations": strategy.recommendation.as_ref().map(|r| r.violations.clone()),
                    "failed_stage": strategy.failed_stage,
                });
                draft.recorded_at = strategy.completed_at;
                draft
            }
        }
    }
}

/// Items that did not fit in the queue, waiting for the worker.
struct Overflow {
    state: Mutex<OverflowState>,
    capacity: usize,
    ready: Notify,
}

#[derive(Default)]
struct OverflowState {
    items: VecDeque<CaptureItem>,
    closed: bool,
}

impl Overflow {
    fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(OverflowState::default()),
            capacity,
            ready: Notify::new(),
        }
    }

    /// Hands the item back when the buffer is closed or full.
    fn push(&self, item: CaptureItem) -> Result<(), CaptureItem> {
        {
            let mut state = self.state.lock();
            if state.closed || state.items.len() >= self.capacity {
                return Err(item);
            }
            state.items.push_back(item);
        }
        self.ready.notify_one();
        Ok(())
    }

    fn take(&self) -> VecDeque<CaptureItem> {
        std::mem::take(&mut self.state.lock().items)
    }

    fn close(&self) {
        self.state.lock().closed = true;
    }
}

/// Cloneable handle used by the pipeline.
#[derive(Clone)]
pub struct LearningCapture {
    inner: Option<(mpsc::Sender<CaptureItem>, Arc<Overflow>)>,
}

impl LearningCapture {
    /// Create the handle and its worker. The worker must be spawned by the
    /// caller; it stops when `shutdown` is cancelled and everything accepted
    /// has been indexed.
    pub fn new(
        index: Arc<SemanticSearchIndex>,
        queue_capacity: usize,
        overflow_capacity: usize,
        index_concurrency: usize,
        shutdown: CancellationToken,
    ) -> (Self, CaptureWorker) {
        let (sender, receiver) = mpsc::channel(queue_capacity.max(1));
        let overflow = Arc::new(Overflow::new(overflow_capacity));
        let worker = CaptureWorker {
            receiver,
            overflow: overflow.clone(),
            index,
            permits: Arc::new(Semaphore::new(index_concurrency.max(1))),
            shutdown,
        };
        (
            Self {
                inner: Some((sender, overflow)),
            },
            worker,
        )
    }

    /// A handle that discards everything (`capture.enabled: false`).
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Enqueue an item. Returns immediately.
    pub fn record(&self, item: impl Into<CaptureItem>) {
        let Some((sender, overflow)) = &self.inner else {
            return;
        };

        match sender.try_send(item.into()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(item)) => match overflow.push(item) {
                Ok(()) => {
                    counter!("triad_capture_overflow_total").increment(1);
                    debug!("Capture queue full, item parked in overflow buffer");
                }
                Err(_) => {
                    warn!("Capture queue and overflow buffer full, dropping item");
                    counter!("triad_capture_dropped_total").increment(1);
                }
            },
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("Learning capture is shut down, dropping item");
                counter!("triad_capture_dropped_total").increment(1);
            }
        }
    }
}

/// Background consumer of the capture queue and its overflow buffer.
pub struct CaptureWorker {
    receiver: mpsc::Receiver<CaptureItem>,
    overflow: Arc<Overflow>,
    index: Arc<SemanticSearchIndex>,
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl CaptureWorker {
    pub async fn run(self) {
        info!("Learning capture worker started");
        let CaptureWorker {
            mut receiver,
            overflow,
            index,
            permits,
            shutdown,
        } = self;
        let mut tasks = JoinSet::new();
        let mut draining = false;

        loop {
            tokio::select! {
                _ = shutdown.cancelled(), if !draining => {
                    info!("Learning capture draining queue");
                    receiver.close();
                    overflow.close();
                    draining = true;
                }
                item = receiver.recv() => {
                    let Some(item) = item else { break };
                    if !dispatch(&mut tasks, &permits, &index, item).await {
                        break;
                    }
                }
                _ = overflow.ready.notified() => {
                    for item in overflow.take() {
                        if !dispatch(&mut tasks, &permits, &index, item).await {
                            break;
                        }
                    }
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Capture task panicked");
                    }
                }
            }
        }

        // The queue is empty and closed; whatever is still parked was
        // accepted before shutdown and gets indexed too.
        overflow.close();
        for item in overflow.take() {
            if !dispatch(&mut tasks, &permits, &index, item).await {
                break;
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Capture task panicked");
            }
        }
        info!("Learning capture worker stopped");
    }
}

/// Spawn indexing for one item once a permit is free. `false` when the
/// permit pool is gone.
async fn dispatch(
    tasks: &mut JoinSet<()>,
    permits: &Arc<Semaphore>,
    index: &Arc<SemanticSearchIndex>,
    item: CaptureItem,
) -> bool {
    let permit = match permits.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => {
            error!("Capture semaphore closed");
            return false;
        }
    };
    let index = index.clone();
    tasks.spawn(async move {
        let _permit = permit;
        index_item(&index, item).await;
    });
    true
}

async fn index_item(index: &SemanticSearchIndex, item: CaptureItem) {
    let draft = item.into_draft();
    let request_id = draft.request_id;
    let kind = draft.kind.as_str();

    match index.index(draft).await {
        Ok(IndexOutcome::Stored(id)) => {
            debug!(request_id = %request_id, kind, memory_id = %id, "Memory event stored");
        }
        Ok(IndexOutcome::Duplicate(id)) => {
            debug!(request_id = %request_id, kind, memory_id = %id, "Duplicate memory event skipped");
        }
        Err(e) => {
            error!(request_id = %request_id, kind, error = %e, "Failed to index memory event");
            counter!("triad_capture_failed_total").increment(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::llm::TokenUsage;
    use crate::domain::strategy::{RequestId, Stage};
    use chrono::Utc;
    use std::time::Duration;
    use triad_cortex::{HashingEmbedder, InMemoryMemoryRepository, MemoryFilter, MemoryRepository};

    fn index() -> (Arc<SemanticSearchIndex>, Arc<InMemoryMemoryRepository>) {
        let repo = Arc::new(InMemoryMemoryRepository::new());
        let index = SemanticSearchIndex::new(repo.clone(), Arc::new(HashingEmbedder::new(64)));
        (Arc::new(index), repo)
    }

    fn record(request_id: RequestId, attempt: u32) -> StageRecord {
        StageRecord {
            request_id,
            stage: Stage::Strategist,
            attempt,
            provider: "anthropic".into(),
            model: "claude-sonnet-4-5".into(),
            prompt: "Frisco, TX at 6pm".into(),
            response: Some("Stage near the Star".into()),
            error: None,
            success: true,
            latency_ms: 1200,
            usage: TokenUsage::new(40, 12),
            recorded_at: Utc::now(),
        }
    }

    async fn wait_for_count(repo: &InMemoryMemoryRepository, expected: usize) {
        for _ in 0..200 {
            if repo.count().await.unwrap() >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {expected} stored events");
    }

    #[test]
    fn test_stage_record_conversion() {
        let request_id = RequestId::new();
        let draft = CaptureItem::from(record(request_id, 2)).into_draft();

        assert_eq!(draft.request_id, request_id.0);
        assert_eq!(draft.stage.as_deref(), Some("strategist"));
        assert_eq!(draft.attempt, Some(2));
        assert_eq!(draft.tokens_in, 40);
        assert_eq!(draft.tokens_out, 12);
        assert!(draft.success);
    }

    #[tokio::test]
    async fn test_records_are_indexed_and_deduplicated() {
        let (index, repo) = index();
        let shutdown = CancellationToken::new();
        let (capture, worker) = LearningCapture::new(index, 16, 16, 4, shutdown.clone());
        let worker = tokio::spawn(worker.run());

        let request_id = RequestId::new();
        let first = record(request_id, 1);
        capture.record(first.clone());
        // Redelivery with a different timestamp and latency collapses.
        capture.record(StageRecord {
            recorded_at: Utc::now(),
            latency_ms: 9999,
            ..first
        });
        capture.record(record(request_id, 2));

        wait_for_count(&repo, 2).await;
        shutdown.cancel();
        worker.await.unwrap();

        assert_eq!(repo.count().await.unwrap(), 2);
        let stored = repo
            .query(&MemoryFilter {
                request_id: Some(request_id.0),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(stored.len(), 2);
    }

    #[tokio::test]
    async fn test_full_queue_does_not_block_or_drop() {
        let (index, repo) = index();
        let shutdown = CancellationToken::new();
        let (capture, worker) = LearningCapture::new(index, 1, 8, 1, shutdown.clone());

        // Worker not running yet: everything past the first item overflows.
        let request_id = RequestId::new();
        for attempt in 1..=5 {
            capture.record(record(request_id, attempt));
        }

        let worker = tokio::spawn(worker.run());
        wait_for_count(&repo, 5).await;
        shutdown.cancel();
        worker.await.unwrap();
        assert_eq!(repo.count().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_shutdown_indexes_overflowed_items() {
        let (index, repo) = index();
        let shutdown = CancellationToken::new();
        let (capture, worker) = LearningCapture::new(index, 1, 8, 1, shutdown.clone());

        let request_id = RequestId::new();
        for attempt in 1..=5 {
            capture.record(record(request_id, attempt));
        }
        shutdown.cancel();
        worker.run().await;

        assert_eq!(repo.count().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_saturated_overflow_drops_instead_of_growing() {
        let (index, repo) = index();
        let shutdown = CancellationToken::new();
        let (capture, worker) = LearningCapture::new(index, 1, 2, 1, shutdown.clone());

        let request_id = RequestId::new();
        for attempt in 1..=5 {
            capture.record(record(request_id, attempt));
        }
        shutdown.cancel();
        worker.run().await;

        // One queued plus two parked; the rest were refused at record time.
        assert_eq!(repo.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_shutdown_drains_then_drops() {
        let (index, repo) = index();
        let shutdown = CancellationToken::new();
        let (capture, worker) = LearningCapture::new(index, 16, 16, 2, shutdown.clone());

        let request_id = RequestId::new();
        capture.record(record(request_id, 1));
        capture.record(record(request_id, 2));
        shutdown.cancel();

        // Buffered items are drained even though shutdown came first.
        worker.run().await;
        assert_eq!(repo.count().await.unwrap(), 2);

        capture.record(record(request_id, 3));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(repo.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_disabled_capture_is_a_no_op() {
        let capture = LearningCapture::disabled();
        assert!(!capture.is_enabled());
        capture.record(record(RequestId::new(), 1));
    }
}
