// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Strategy Pipeline
//!
//! Runs strategist -> briefer -> consolidator for one request. Each stage is
//! one retried adapter call; its output becomes context for the next.
//!
//! - Strategist failure ends the run with no further calls.
//! - Briefer failure degrades the run: the consolidator works from the
//!   strategist alone and the result is `partial`.
//! - Consolidator failure ends the run; earlier stages are still surfaced in
//!   the returned [`PipelineFailure`].
//!
//! Every attempt is handed to [`LearningCapture`] and published on the
//! [`EventBus`]. Neither is awaited for indexing, and neither can fail a run.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Orchestrates the per-request state machine

use chrono::Utc;
use metrics::{counter, histogram};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::application::learning_capture::LearningCapture;
use crate::application::prompts::{extract_json, PromptBuilder};
use crate::application::retry::{AttemptObserver, RetryFailure, RetryPolicy};
use crate::domain::events::PipelineEvent;
use crate::domain::llm::{ChunkSink, GenerationResponse, LLMError, TokenUsage};
use crate::domain::repository::{RepositoryError, StrategyRepository};
use crate::domain::strategy::{
    ConsolidatedStrategy, FailedStage, FailureKind, PipelineFailure, PipelineState,
    PipelineStatus, Recommendation, RequestId, Stage, StageFailure, StageRecord, StageResult,
    StrategyRequest,
};
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::llm::{StageBinding, StageBindings};

pub struct StrategyPipeline {
    bindings: StageBindings,
    retry: RetryPolicy,
    prompts: PromptBuilder,
    event_bus: EventBus,
    capture: LearningCapture,
    repository: Arc<dyn StrategyRepository>,
    in_flight: Arc<parking_lot::Mutex<HashSet<RequestId>>>,
}

#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("request {0} is already running")]
    InFlight(RequestId),

    #[error("request {0} already has a stored strategy")]
    AlreadyStored(RequestId),

    #[error(transparent)]
    Storage(#[from] RepositoryError),
}

/// Holds a request id reserved until dropped.
#[derive(Debug)]
pub struct Admission {
    id: RequestId,
    in_flight: Arc<parking_lot::Mutex<HashSet<RequestId>>>,
}

impl Drop for Admission {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.id);
    }
}

impl StrategyPipeline {
    pub fn new(
        bindings: StageBindings,
        retry: RetryPolicy,
        prompts: PromptBuilder,
        event_bus: EventBus,
        capture: LearningCapture,
        repository: Arc<dyn StrategyRepository>,
    ) -> Self {
        Self {
            bindings,
            retry,
            prompts,
            event_bus,
            capture,
            repository,
            in_flight: Arc::new(parking_lot::Mutex::new(HashSet::new())),
        }
    }

    /// Reserve `id` for one run. Ids are unique across running and stored
    /// strategies; hold the returned [`Admission`] until the run ends.
    pub async fn admit(&self, id: RequestId) -> Result<Admission, AdmissionError> {
        if !self.in_flight.lock().insert(id) {
            return Err(AdmissionError::InFlight(id));
        }
        let admission = Admission {
            id,
            in_flight: self.in_flight.clone(),
        };
        match self.repository.find_by_id(id).await? {
            None => Ok(admission),
            Some(_) => Err(AdmissionError::AlreadyStored(id)),
        }
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn repository(&self) -> Arc<dyn StrategyRepository> {
        self.repository.clone()
    }

    pub fn bindings(&self) -> &StageBindings {
        &self.bindings
    }

    /// Run the three stages for `request`.
    ///
    /// Cancelling `cancel` aborts the in-flight attempt and skips every later
    /// stage; the run then fails naming the stage that was interrupted.
    pub async fn run(
        &self,
        request: StrategyRequest,
        cancel: CancellationToken,
    ) -> Result<ConsolidatedStrategy, PipelineFailure> {
        let mut run = PipelineRun::start(&request);
        info!(
            request_id = %request.id,
            locality = %request.snapshot.locality,
            "Strategy pipeline started"
        );
        self.event_bus.publish_pipeline_event(PipelineEvent::PipelineStarted {
            request_id: request.id,
            locality: request.snapshot.locality.clone(),
            started_at: run.started_at,
        });

        // STRATEGIST
        run.advance(PipelineState::Strategist);
        let strategist = self
            .run_stage(&request, Stage::Strategist, self.prompts.strategist(&request), &cancel)
            .await;
        if !strategist.success {
            run.stages.push(strategist);
            return self.conclude(run.fail(&request, Stage::Strategist)).await;
        }
        let strategy_text = strategist.text.clone();
        run.stages.push(strategist);

        // BRIEFER
        run.advance(PipelineState::Briefer);
        let briefer = self
            .run_stage(
                &request,
                Stage::Briefer,
                self.prompts.briefer(&request, &strategy_text),
                &cancel,
            )
            .await;
        let briefing = if briefer.success {
            Some(briefer.text.clone())
        } else if briefer.failure.as_ref().map(|f| f.kind) == Some(FailureKind::Cancelled) {
            run.stages.push(briefer);
            return self.conclude(run.fail(&request, Stage::Briefer)).await;
        } else {
            warn!(
                request_id = %request.id,
                "Briefer unavailable, consolidating from strategist output only"
            );
            None
        };
        run.stages.push(briefer);

        // CONSOLIDATOR
        run.advance(PipelineState::Consolidator);
        let consolidator = self
            .run_stage(
                &request,
                Stage::Consolidator,
                self.prompts
                    .consolidator(&request, &strategy_text, briefing.as_deref()),
                &cancel,
            )
            .await;
        if !consolidator.success {
            run.stages.push(consolidator);
            return self.conclude(run.fail(&request, Stage::Consolidator)).await;
        }

        let recommendation =
            Recommendation::new(consolidator.text.clone(), consolidator.structured.clone());
        if !recommendation.is_sound() {
            warn!(
                request_id = %request.id,
                violations = ?recommendation.violations,
                "Recommendation breaks plan invariants"
            );
            counter!("triad_recommendation_violations_total")
                .increment(recommendation.violations.len() as u64);
        }
        run.stages.push(consolidator);

        run.advance(PipelineState::Done);
        let status = if briefing.is_some() {
            PipelineStatus::Complete
        } else {
            PipelineStatus::Partial
        };
        self.conclude(run.finish(&request, status, Some(recommendation), None))
            .await
    }

    /// One stage: retried calls, events, capture and metrics. Always yields a
    /// result; failures are carried in it.
    async fn run_stage(
        &self,
        request: &StrategyRequest,
        stage: Stage,
        prompt: anyhow::Result<String>,
        cancel: &CancellationToken,
    ) -> StageResult {
        let binding = self.bindings.get(stage);

        // A misconfigured binding is never attempted: no call, no capture.
        if let Some(defect) = binding.configuration_error() {
            let failure = RetryFailure {
                kind: FailureKind::Fatal,
                error: LLMError::Configuration(defect.clone()),
                attempts: 0,
                latency: Duration::ZERO,
            };
            return self.stage_failed(request.id, binding, failure);
        }

        let prompt = match prompt {
            Ok(prompt) => prompt,
            Err(e) => {
                error!(request_id = %request.id, stage = %stage, error = %e, "Prompt rendering failed");
                let failure = RetryFailure {
                    kind: FailureKind::Fatal,
                    error: LLMError::MalformedRequest(format!("{e:#}")),
                    attempts: 0,
                    latency: Duration::ZERO,
                };
                return self.stage_failed(request.id, binding, failure);
            }
        };
        let system = binding
            .system_prompt()
            .unwrap_or_else(|| PromptBuilder::system_prompt(stage))
            .to_string();

        let observer = StageObserver {
            event_bus: &self.event_bus,
            capture: &self.capture,
            request_id: request.id,
            binding,
            prompt: &prompt,
        };

        let outcome = self
            .retry
            .run(binding.max_attempts(), cancel, &observer, |attempt| {
                let system = system.clone();
                let prompt = prompt.clone();
                let bus = self.event_bus.clone();
                let request_id = request.id;
                async move {
                    let sink: &ChunkSink<'_> = &move |delta: &str| {
                        bus.publish_pipeline_event(PipelineEvent::StageChunk {
                            request_id,
                            stage,
                            attempt,
                            delta: delta.to_string(),
                        });
                    };
                    let response = binding.call(Some(system), prompt, Some(sink)).await?;
                    if response.text.trim().is_empty() {
                        return Err(LLMError::InvalidResponse(
                            "provider returned no text".to_string(),
                        ));
                    }
                    Ok(response)
                }
            })
            .await;

        match outcome {
            Ok(done) => {
                let latency_ms = done.latency.as_millis() as u64;
                let response = done.value;
                info!(
                    request_id = %request.id,
                    stage = %stage,
                    attempts = done.attempts,
                    latency_ms,
                    "Stage completed"
                );
                self.event_bus.publish_pipeline_event(PipelineEvent::StageCompleted {
                    request_id: request.id,
                    stage,
                    attempts: done.attempts,
                    latency_ms,
                    completed_at: Utc::now(),
                });

                StageResult {
                    stage,
                    provider: binding.provider().to_string(),
                    model: response.model,
                    success: true,
                    structured: extract_json(&response.text),
                    text: response.text,
                    raw: response.raw,
                    latency_ms,
                    attempts: done.attempts,
                    prior_failures: done.attempts.saturating_sub(1),
                    usage: response.usage,
                    finish_reason: Some(response.finish_reason),
                    failure: None,
                }
            }
            Err(failure) => self.stage_failed(request.id, binding, failure),
        }
    }

    fn stage_failed(
        &self,
        request_id: RequestId,
        binding: &StageBinding,
        failure: RetryFailure,
    ) -> StageResult {
        let stage = binding.stage();
        let stage_failure = StageFailure::new(failure.kind, &failure.error);

        if let LLMError::Configuration(defect) = &failure.error {
            error!(
                request_id = %request_id,
                stage = %stage,
                provider = %binding.provider(),
                model = %binding.model(),
                defect = %defect,
                "Stage is misconfigured"
            );
        } else {
            warn!(
                request_id = %request_id,
                stage = %stage,
                attempts = failure.attempts,
                kind = failure.kind.as_str(),
                error = %failure.error,
                "Stage failed"
            );
        }

        self.event_bus.publish_pipeline_event(PipelineEvent::StageFailed {
            request_id,
            stage,
            failure: stage_failure.clone(),
            failed_at: Utc::now(),
        });

        StageResult {
            stage,
            provider: binding.provider().to_string(),
            model: binding.model().to_string(),
            success: false,
            text: String::new(),
            structured: None,
            raw: None,
            latency_ms: failure.latency.as_millis() as u64,
            attempts: failure.attempts,
            prior_failures: failure.attempts.saturating_sub(1),
            usage: TokenUsage::default(),
            finish_reason: None,
            failure: Some(stage_failure),
        }
    }

    /// Persist, capture and announce the outcome. Storage errors are logged.
    async fn conclude(
        &self,
        strategy: ConsolidatedStrategy,
    ) -> Result<ConsolidatedStrategy, PipelineFailure> {
        if let Err(e) = self.repository.save(&strategy).await {
            error!(request_id = %strategy.request_id, error = %e, "Failed to store strategy");
        }
        self.capture.record(strategy.clone());
        counter!("triad_pipeline_total", "status" => strategy.status.as_str()).increment(1);

        match strategy.failed_stage.clone() {
            Some(FailedStage { stage, failure }) if strategy.status == PipelineStatus::Failed => {
                error!(
                    request_id = %strategy.request_id,
                    stage = %stage,
                    failure = %failure,
                    "Strategy pipeline failed"
                );
                self.event_bus.publish_pipeline_event(PipelineEvent::PipelineFailed {
                    request_id: strategy.request_id,
                    stage,
                    failure: failure.clone(),
                    failed_at: strategy.completed_at,
                });
                Err(PipelineFailure {
                    stage,
                    failure,
                    strategy,
                })
            }
            _ => {
                info!(
                    request_id = %strategy.request_id,
                    status = strategy.status.as_str(),
                    total_latency_ms = strategy.total_latency_ms,
                    "Strategy pipeline completed"
                );
                self.event_bus.publish_pipeline_event(PipelineEvent::PipelineCompleted {
                    request_id: strategy.request_id,
                    status: strategy.status,
                    total_latency_ms: strategy.total_latency_ms,
                    violations: strategy
                        .recommendation
                        .as_ref()
                        .map(|r| r.violations.clone())
                        .unwrap_or_default(),
                    completed_at: strategy.completed_at,
                });
                Ok(strategy)
            }
        }
    }
}

/// Mutable bookkeeping of one run.
struct PipelineRun {
    request_id: RequestId,
    state: PipelineState,
    stages: Vec<StageResult>,
    started_at: chrono::DateTime<Utc>,
    clock: Instant,
}

impl PipelineRun {
    fn start(request: &StrategyRequest) -> Self {
        Self {
            request_id: request.id,
            state: PipelineState::Pending,
            stages: Vec::with_capacity(Stage::ALL.len()),
            started_at: Utc::now(),
            clock: Instant::now(),
        }
    }

    fn advance(&mut self, next: PipelineState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {:?} -> {:?}",
            self.state,
            next
        );
        debug!(request_id = %self.request_id, from = ?self.state, to = ?next, "Pipeline transition");
        self.state = next;
    }

    /// The last pushed stage is the one that stopped the run.
    fn fail(mut self, request: &StrategyRequest, stage: Stage) -> ConsolidatedStrategy {
        self.advance(PipelineState::Failed);
        let failed_stage = self
            .stages
            .last()
            .and_then(|s| s.failure.clone())
            .map(|failure| FailedStage { stage, failure });
        self.finish(request, PipelineStatus::Failed, None, failed_stage)
    }

    fn finish(
        self,
        request: &StrategyRequest,
        status: PipelineStatus,
        recommendation: Option<Recommendation>,
        failed_stage: Option<FailedStage>,
    ) -> ConsolidatedStrategy {
        ConsolidatedStrategy {
            request_id: request.id,
            snapshot_id: request.snapshot.id,
            status,
            stages: self.stages,
            recommendation,
            failed_stage,
            started_at: self.started_at,
            completed_at: Utc::now(),
            total_latency_ms: self.clock.elapsed().as_millis() as u64,
        }
    }
}

/// Per-attempt reporting for one stage.
struct StageObserver<'a> {
    event_bus: &'a EventBus,
    capture: &'a LearningCapture,
    request_id: RequestId,
    binding: &'a StageBinding,
    prompt: &'a str,
}

impl StageObserver<'_> {
    fn record(
        &self,
        attempt: u32,
        response: Option<&GenerationResponse>,
        error: Option<&LLMError>,
        latency: Duration,
    ) {
        let stage = self.binding.stage();
        let outcome = if error.is_none() { "success" } else { "failure" };
        counter!(
            "triad_stage_attempts_total",
            "stage" => stage.as_str(),
            "outcome" => outcome
        )
        .increment(1);
        histogram!("triad_stage_latency_ms", "stage" => stage.as_str())
            .record(latency.as_secs_f64() * 1000.0);

        self.capture.record(StageRecord {
            request_id: self.request_id,
            stage,
            attempt,
            provider: self.binding.provider().to_string(),
            model: response
                .map(|r| r.model.clone())
                .unwrap_or_else(|| self.binding.model().to_string()),
            prompt: self.prompt.to_string(),
            response: response.map(|r| r.text.clone()),
            error: error.map(|e| e.to_string()),
            success: error.is_none(),
            latency_ms: latency.as_millis() as u64,
            usage: response.map(|r| r.usage).unwrap_or_default(),
            recorded_at: Utc::now(),
        });
    }
}

impl AttemptObserver<GenerationResponse> for StageObserver<'_> {
    fn attempt_started(&self, attempt: u32) {
        let stage = self.binding.stage();
        debug!(request_id = %self.request_id, stage = %stage, attempt, "Stage attempt started");
        self.event_bus.publish_pipeline_event(PipelineEvent::StageStarted {
            request_id: self.request_id,
            stage,
            attempt,
            provider: self.binding.provider().to_string(),
            model: self.binding.model().to_string(),
            started_at: Utc::now(),
        });
    }

    fn attempt_succeeded(&self, attempt: u32, value: &GenerationResponse, latency: Duration) {
        self.record(attempt, Some(value), None, latency);
    }

    fn attempt_failed(&self, attempt: u32, error: &LLMError, latency: Duration, will_retry: bool) {
        self.event_bus.publish_pipeline_event(PipelineEvent::AttemptFailed {
            request_id: self.request_id,
            stage: self.binding.stage(),
            attempt,
            error_code: error.code().to_string(),
            message: error.to_string(),
            retryable: will_retry,
            failed_at: Utc::now(),
        });
        // A cancelled attempt never reached a verdict; nothing to learn from it.
        if !matches!(error, LLMError::Cancelled) {
            self.record(attempt, None, Some(error), latency);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::llm::{FinishReason, GenerationRequest, LLMProvider};
    use crate::domain::provider::{
        ParameterSet, ProviderCallSpec, ProviderKind, ReasoningEffort,
    };
    use crate::domain::strategy::Snapshot;
    use crate::infrastructure::llm::{ProviderHandle, ProviderPool};
    use crate::infrastructure::repositories::InMemoryStrategyRepository;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use triad_cortex::{
        HashingEmbedder, InMemoryMemoryRepository, MemoryFilter, MemoryRepository, SemanticSearchIndex,
    };
    use uuid::Uuid;

    enum Step {
        Reply(&'static str),
        Fail(LLMError),
        Hang,
    }

    /// Replays scripted steps, then echoes the request's location line.
    struct ScriptedProvider {
        label: &'static str,
        steps: Mutex<VecDeque<Step>>,
        prompts: Mutex<Vec<String>>,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl ScriptedProvider {
        fn new(label: &'static str, steps: Vec<Step>, log: Arc<Mutex<Vec<&'static str>>>) -> Arc<Self> {
            Arc::new(Self {
                label,
                steps: Mutex::new(steps.into()),
                prompts: Mutex::new(Vec::new()),
                log,
            })
        }

        fn calls(&self) -> usize {
            self.prompts.lock().len()
        }

        fn prompt(&self, n: usize) -> String {
            self.prompts.lock()[n].clone()
        }
    }

    #[async_trait]
    impl LLMProvider for ScriptedProvider {
        fn kind(&self) -> ProviderKind {
            ProviderKind::OpenAI
        }

        async fn generate(
            &self,
            request: &GenerationRequest,
            on_chunk: Option<&ChunkSink<'_>>,
        ) -> Result<GenerationResponse, LLMError> {
            self.prompts.lock().push(request.prompt.clone());
            self.log.lock().push(self.label);
            let step = self.steps.lock().pop_front();

            let text = match step {
                Some(Step::Reply(text)) => text.to_string(),
                Some(Step::Fail(e)) => return Err(e),
                Some(Step::Hang) => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    return Err(LLMError::Network("unreachable".into()));
                }
                None => {
                    tokio::task::yield_now().await;
                    let location = request
                        .prompt
                        .lines()
                        .find(|l| l.contains("Location:"))
                        .unwrap_or_default()
                        .trim()
                        .to_string();
                    format!("{} says {}", self.label, location)
                }
            };

            if request.stream {
                if let Some(sink) = on_chunk {
                    for piece in text.split_inclusive(' ') {
                        sink(piece);
                    }
                }
            }

            Ok(GenerationResponse {
                text,
                usage: TokenUsage::new(120, 80),
                provider: "openai".into(),
                model: request.model.clone(),
                finish_reason: FinishReason::Stop,
                raw: None,
            })
        }

        async fn health_check(&self) -> Result<(), LLMError> {
            Ok(())
        }
    }

    fn timeout_for(stage: Stage) -> Duration {
        match stage {
            Stage::Strategist => Duration::from_secs(60),
            Stage::Briefer => Duration::from_secs(45),
            Stage::Consolidator => Duration::from_secs(90),
        }
    }

    fn bind(stage: Stage, provider: Arc<ScriptedProvider>, stream: bool) -> StageBinding {
        let spec = ProviderCallSpec {
            stage,
            provider: provider.label.to_string(),
            kind: ProviderKind::OpenAI,
            model: "gpt-4o".into(),
            parameters: ParameterSet::Sampling { temperature: 0.7 },
            max_tokens: 1024,
            max_attempts: 3,
            timeout: timeout_for(stage),
            stream,
        };
        StageBinding::new(
            spec,
            ProviderHandle {
                kind: ProviderKind::OpenAI,
                pool: Arc::new(ProviderPool::new(provider.label, 8).unwrap()),
                adapter: provider,
            },
        )
    }

    struct Harness {
        strategist: Arc<ScriptedProvider>,
        briefer: Arc<ScriptedProvider>,
        consolidator: Arc<ScriptedProvider>,
        log: Arc<Mutex<Vec<&'static str>>>,
        repository: Arc<InMemoryStrategyRepository>,
        event_bus: EventBus,
    }

    impl Harness {
        fn new(strategist: Vec<Step>, briefer: Vec<Step>, consolidator: Vec<Step>) -> Self {
            let log = Arc::new(Mutex::new(Vec::new()));
            Self {
                strategist: ScriptedProvider::new("strategist", strategist, log.clone()),
                briefer: ScriptedProvider::new("briefer", briefer, log.clone()),
                consolidator: ScriptedProvider::new("consolidator", consolidator, log.clone()),
                log,
                repository: Arc::new(InMemoryStrategyRepository::new()),
                event_bus: EventBus::new(512),
            }
        }

        fn bindings(&self) -> StageBindings {
            StageBindings {
                strategist: bind(Stage::Strategist, self.strategist.clone(), true),
                briefer: bind(Stage::Briefer, self.briefer.clone(), false),
                consolidator: bind(Stage::Consolidator, self.consolidator.clone(), false),
            }
        }

        fn pipeline_with(&self, bindings: StageBindings, capture: LearningCapture) -> StrategyPipeline {
            StrategyPipeline::new(
                bindings,
                RetryPolicy::default(),
                PromptBuilder::new().unwrap(),
                self.event_bus.clone(),
                capture,
                self.repository.clone(),
            )
        }

        fn pipeline(&self) -> StrategyPipeline {
            self.pipeline_with(self.bindings(), LearningCapture::disabled())
        }
    }

    fn request(locality: &str) -> StrategyRequest {
        StrategyRequest {
            id: RequestId::new(),
            snapshot: Snapshot {
                id: Uuid::new_v4(),
                latitude: 33.1507,
                longitude: -96.8236,
                locality: locality.to_string(),
                timestamp: Utc::now(),
                timezone: Some("America/Chicago".into()),
                weather: None,
                airport: None,
            },
            signal: String::new(),
        }
    }

    const PLAN: &str = "Stage at Legacy West.\n```json\n{\"staging_area\": {\"name\": \"Legacy West\"}, \"venues\": [{\"name\": \"Toyota Stadium\"}]}\n```";

    #[tokio::test]
    async fn test_stages_run_in_order_and_feed_each_other() {
        let harness = Harness::new(
            vec![Step::Reply("Demand builds near the stadium")],
            vec![Step::Reply("Game ends at 10pm")],
            vec![Step::Reply(PLAN)],
        );
        let pipeline = harness.pipeline();
        let request = request("Frisco, TX");
        let mut events = harness.event_bus.subscribe_request(request.id);

        let strategy = pipeline.run(request.clone(), CancellationToken::new()).await.unwrap();

        assert_eq!(*harness.log.lock(), vec!["strategist", "briefer", "consolidator"]);
        assert_eq!(strategy.status, PipelineStatus::Complete);
        assert_eq!(strategy.stages.len(), 3);
        assert!(harness.briefer.prompt(0).contains("Demand builds near the stadium"));
        let consolidator_prompt = harness.consolidator.prompt(0);
        assert!(consolidator_prompt.contains("Demand builds near the stadium"));
        assert!(consolidator_prompt.contains("Game ends at 10pm"));

        let recommendation = strategy.recommendation.as_ref().unwrap();
        assert_eq!(recommendation.structured.as_ref().unwrap()["staging_area"]["name"], "Legacy West");
        // One bare venue: too few, and it lacks every field but the name.
        assert_eq!(recommendation.violations.len(), 2);
        assert!(recommendation.violations[0].contains("at least 4 venues"));

        // Stage events arrive in causal order, ending with completion.
        let mut seen = Vec::new();
        let mut chunks = String::new();
        loop {
            let event = events.recv().await.unwrap();
            if let PipelineEvent::StageChunk { delta, .. } = &event {
                chunks.push_str(delta);
            }
            if let PipelineEvent::StageCompleted { stage, .. } = &event {
                seen.push(*stage);
            }
            if event.is_terminal() {
                let PipelineEvent::PipelineCompleted { violations, .. } = &event else {
                    panic!("expected completion, got {event:?}");
                };
                assert_eq!(violations, &recommendation.violations);
                break;
            }
        }
        assert_eq!(seen, Stage::ALL.to_vec());
        // Only the strategist streams.
        assert_eq!(chunks, "Demand builds near the stadium");

        let stored = harness.repository.find_by_id(request.id).await.unwrap().unwrap();
        assert_eq!(stored, strategy);
    }

    #[tokio::test]
    async fn test_strategist_failure_stops_the_pipeline() {
        let harness = Harness::new(
            vec![Step::Fail(LLMError::Authentication("bad key".into()))],
            vec![],
            vec![],
        );
        let request = request("Frisco, TX");

        let failure = harness
            .pipeline()
            .run(request.clone(), CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(failure.stage, Stage::Strategist);
        assert_eq!(failure.failure.kind, FailureKind::Fatal);
        assert_eq!(failure.failure.error_code, "authentication");
        assert_eq!(harness.strategist.calls(), 1);
        assert_eq!(harness.briefer.calls(), 0);
        assert_eq!(harness.consolidator.calls(), 0);
        assert_eq!(failure.strategy.status, PipelineStatus::Failed);
        assert!(failure.strategy.recommendation.is_none());

        let stored = harness.repository.find_by_id(request.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PipelineStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_frisco_briefer_timeouts_degrade_to_partial() {
        let harness = Harness::new(
            vec![Step::Reply("Concert traffic around Ford Center")],
            vec![Step::Hang, Step::Hang, Step::Hang],
            vec![Step::Reply(PLAN)],
        );

        let strategy = harness
            .pipeline()
            .run(request("Frisco, TX"), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(strategy.status, PipelineStatus::Partial);
        assert!(strategy.recommendation.is_some());
        assert_eq!(harness.briefer.calls(), 3);

        let briefer = strategy.stage(Stage::Briefer).unwrap();
        assert!(!briefer.success);
        assert_eq!(briefer.attempts, 3);
        assert_eq!(briefer.prior_failures, 2);
        let failure = briefer.failure.as_ref().unwrap();
        assert_eq!(failure.kind, FailureKind::RetryableExhausted);
        assert_eq!(failure.error_code, "timeout");

        let prompt = harness.consolidator.prompt(0);
        assert!(prompt.contains("Concert traffic around Ford Center"));
        assert!(prompt.contains("Unavailable."));
    }

    #[tokio::test]
    async fn test_conflicting_consolidator_parameters_fail_without_calls() {
        let harness = Harness::new(vec![], vec![], vec![]);
        let defect = ParameterSet::select(
            ProviderKind::OpenAI,
            "gpt-5",
            Some(0.2),
            Some(ReasoningEffort::High),
        )
        .unwrap_err();
        let mut bindings = harness.bindings();
        bindings.consolidator =
            StageBinding::misconfigured(Stage::Consolidator, "openai", "gpt-5", defect);

        let memory: Arc<dyn MemoryRepository> = Arc::new(InMemoryMemoryRepository::new());
        let index = Arc::new(SemanticSearchIndex::new(
            memory.clone(),
            Arc::new(HashingEmbedder::new(64)),
        ));
        let shutdown = CancellationToken::new();
        let (capture, worker) = LearningCapture::new(index, 16, 16, 1, shutdown.clone());
        let worker = tokio::spawn(worker.run());

        let failure = harness
            .pipeline_with(bindings, capture)
            .run(request("Frisco, TX"), CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(failure.stage, Stage::Consolidator);
        assert_eq!(failure.failure.kind, FailureKind::Fatal);
        assert_eq!(failure.failure.error_code, "configuration");
        assert_eq!(harness.consolidator.calls(), 0);

        // Earlier stages are still surfaced.
        let strategy = &failure.strategy;
        assert_eq!(strategy.status, PipelineStatus::Failed);
        assert!(strategy.stage(Stage::Strategist).unwrap().success);
        assert!(strategy.stage(Stage::Briefer).unwrap().success);
        assert_eq!(strategy.stage(Stage::Consolidator).unwrap().attempts, 0);
        assert_eq!(strategy.stage(Stage::Consolidator).unwrap().prior_failures, 0);

        shutdown.cancel();
        worker.await.unwrap();
        let consolidator_attempts = memory
            .query(&MemoryFilter {
                stage: Some("consolidator".into()),
                ..MemoryFilter::default()
            })
            .await
            .unwrap();
        assert!(consolidator_attempts.is_empty());
        // Strategist, briefer and the failed strategy.
        assert_eq!(memory.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_request_ids_are_admitted_once() {
        let harness = Harness::new(vec![], vec![], vec![]);
        let pipeline = harness.pipeline();
        let request = request("Frisco, TX");

        let admission = pipeline.admit(request.id).await.unwrap();
        assert!(matches!(
            pipeline.admit(request.id).await,
            Err(AdmissionError::InFlight(_))
        ));

        pipeline.run(request.clone(), CancellationToken::new()).await.unwrap();
        drop(admission);

        // Released from the in-flight set, but now stored.
        assert!(matches!(
            pipeline.admit(request.id).await,
            Err(AdmissionError::AlreadyStored(_))
        ));
        assert!(pipeline.admit(RequestId::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_requests_do_not_interleave() {
        let harness = Harness::new(vec![], vec![], vec![]);
        let pipeline = harness.pipeline();

        let (frisco, plano) = tokio::join!(
            pipeline.run(request("Frisco, TX"), CancellationToken::new()),
            pipeline.run(request("Plano, TX"), CancellationToken::new()),
        );
        let frisco = frisco.unwrap();
        let plano = plano.unwrap();

        for stage in &frisco.stages {
            assert!(stage.text.contains("Frisco, TX"), "{}", stage.text);
        }
        for stage in &plano.stages {
            assert!(stage.text.contains("Plano, TX"), "{}", stage.text);
        }
        assert_ne!(frisco.request_id, plano.request_id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_aborts_and_skips_later_stages() {
        let harness = Harness::new(vec![Step::Hang], vec![], vec![]);
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let failure = harness
            .pipeline()
            .run(request("Frisco, TX"), cancel)
            .await
            .unwrap_err();

        assert_eq!(failure.stage, Stage::Strategist);
        assert_eq!(failure.failure.kind, FailureKind::Cancelled);
        assert_eq!(harness.strategist.calls(), 1);
        assert_eq!(harness.briefer.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_attempt_and_result_is_captured() {
        let harness = Harness::new(
            vec![Step::Fail(LLMError::RateLimit("slow down".into())), Step::Reply("Go north")],
            vec![Step::Reply("Clear roads")],
            vec![Step::Reply(PLAN)],
        );
        let memory: Arc<dyn MemoryRepository> = Arc::new(InMemoryMemoryRepository::new());
        let index = Arc::new(SemanticSearchIndex::new(
            memory.clone(),
            Arc::new(HashingEmbedder::new(64)),
        ));
        let shutdown = CancellationToken::new();
        let (capture, worker) = LearningCapture::new(index, 64, 64, 2, shutdown.clone());
        let worker = tokio::spawn(worker.run());

        let pipeline = harness.pipeline_with(harness.bindings(), capture);
        let strategy = pipeline
            .run(request("Frisco, TX"), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(strategy.stage(Stage::Strategist).unwrap().prior_failures, 1);

        shutdown.cancel();
        worker.await.unwrap();

        // Two strategist attempts, one each for briefer and consolidator, plus
        // the consolidated strategy.
        assert_eq!(memory.count().await.unwrap(), 5);
    }
}
