// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! HTTP API
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/health` | Liveness and uptime |
//! | `GET` | `/api/health/providers` | Per-provider health and per-stage binding state |
//! | `POST` | `/api/strategy` | Run the pipeline, answer with the final strategy (`409` on a reused id) |
//! | `GET` | `/api/strategy` | Most recent strategies (`?limit=`) |
//! | `POST` | `/api/strategy/stream` | Run the pipeline, stream its events over SSE |
//! | `GET` | `/api/strategy/performance` | Performance report (`?hours=`) |
//! | `GET` | `/api/strategy/{id}` | One stored strategy |
//! | `GET` | `/api/memory/search` | Semantic search over captured memory (`?q=&k=`) |
//! | `GET` | `/api/memory/export` | Successful attempts as JSON Lines (`?stage=&since=`) |
//!
//! # Architecture
//!
//! - **Layer:** Presentation Layer
//! - **Purpose:** Translate HTTP requests into pipeline and index calls

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive},
        IntoResponse, Response, Sse,
    },
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures::stream::Stream;
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, warn};
use triad_cortex::SemanticSearchIndex;

use crate::application::performance::performance_report;
use crate::application::pipeline::{Admission, AdmissionError, StrategyPipeline};
use crate::application::training_export::{to_jsonl, training_examples};
use crate::domain::repository::StrategyRepository;
use crate::domain::strategy::{
    ConsolidatedStrategy, FailureKind, PipelineFailure, RequestId, Stage, StrategyRequest,
};
use crate::infrastructure::event_bus::EventBusError;
use crate::infrastructure::llm::AdapterRegistry;

const MAX_SEARCH_RESULTS: usize = 100;

pub struct AppState {
    pub pipeline: Arc<StrategyPipeline>,
    pub registry: Arc<AdapterRegistry>,
    pub index: Arc<SemanticSearchIndex>,
    /// Parent of every request's cancellation token.
    pub shutdown: CancellationToken,
    pub start_time: Instant,
}

pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/health/providers", get(provider_health))
        .route("/api/strategy", get(list_strategies).post(run_strategy))
        .route("/api/strategy/stream", post(stream_strategy))
        .route("/api/strategy/performance", get(performance))
        .route("/api/strategy/{id}", get(get_strategy))
        .route("/api/memory/search", get(search_memory))
        .route("/api/memory/export", get(export_memory))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Pipeline(Box<PipelineFailure>),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, json!({ "error": message })),
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, json!({ "error": message })),
            ApiError::Conflict(message) => (StatusCode::CONFLICT, json!({ "error": message })),
            ApiError::Internal(message) => {
                (StatusCode::INTERNAL_SERVER_ERROR, json!({ "error": message }))
            }
            ApiError::Pipeline(failure) => {
                let status = match failure.failure.kind {
                    FailureKind::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
                    FailureKind::Fatal | FailureKind::RetryableExhausted => StatusCode::BAD_GATEWAY,
                };
                (
                    status,
                    json!({
                        "error": failure.to_string(),
                        "stage": failure.stage,
                        "failure": failure.failure,
                        "strategy": failure.strategy,
                    }),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

fn validate(request: StrategyRequest) -> Result<StrategyRequest, ApiError> {
    let snapshot = &request.snapshot;
    if !(-90.0..=90.0).contains(&snapshot.latitude) {
        return Err(ApiError::BadRequest(format!(
            "latitude {} out of range",
            snapshot.latitude
        )));
    }
    if !(-180.0..=180.0).contains(&snapshot.longitude) {
        return Err(ApiError::BadRequest(format!(
            "longitude {} out of range",
            snapshot.longitude
        )));
    }
    if snapshot.locality.trim().is_empty() {
        return Err(ApiError::BadRequest("locality is required".to_string()));
    }
    Ok(request)
}

async fn admit(state: &AppState, request: &StrategyRequest) -> Result<Admission, ApiError> {
    state.pipeline.admit(request.id).await.map_err(|e| match e {
        AdmissionError::Storage(e) => ApiError::Internal(e.to_string()),
        duplicate => {
            warn!(request_id = %request.id, "Rejected duplicate request id");
            ApiError::Conflict(duplicate.to_string())
        }
    })
}

async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "uptime_seconds": state.start_time.elapsed().as_secs(),
    }))
}

async fn provider_health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let providers: Vec<_> = state
        .registry
        .health_check_all()
        .await
        .into_iter()
        .map(|(name, result)| {
            json!({
                "name": name,
                "healthy": result.is_ok(),
                "error": result.err().map(|e| e.to_string()),
            })
        })
        .collect();

    let bindings = state.pipeline.bindings();
    let stages: Vec<_> = Stage::ALL
        .iter()
        .map(|stage| {
            let binding = bindings.get(*stage);
            json!({
                "stage": stage,
                "provider": binding.provider(),
                "model": binding.model(),
                "configured": binding.configuration_error().is_none(),
                "error": binding.configuration_error().map(|e| e.to_string()),
            })
        })
        .collect();

    Json(json!({ "providers": providers, "stages": stages }))
}

async fn run_strategy(
    State(state): State<Arc<AppState>>,
    Json(request): Json<StrategyRequest>,
) -> Result<Json<ConsolidatedStrategy>, ApiError> {
    let request = validate(request)?;
    let _admission = admit(&state, &request).await?;
    let cancel = state.shutdown.child_token();
    // Dropping the handler (client went away) cancels the run.
    let _guard = cancel.clone().drop_guard();

    state
        .pipeline
        .run(request, cancel)
        .await
        .map(Json)
        .map_err(|failure| ApiError::Pipeline(Box::new(failure)))
}

fn sse_event(name: &str, data: &impl serde::Serialize) -> Event {
    Event::default()
        .event(name)
        .json_data(data)
        .unwrap_or_else(|e| Event::default().event("error").data(e.to_string()))
}

async fn stream_strategy(
    State(state): State<Arc<AppState>>,
    Json(request): Json<StrategyRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let request = validate(request)?;
    let admission = admit(&state, &request).await?;
    let request_id = request.id;
    let mut events = state.pipeline.event_bus().subscribe_request(request_id);
    let cancel = state.shutdown.child_token();
    let (tx, rx) = mpsc::channel::<Event>(64);

    let pipeline = state.pipeline.clone();
    let run_cancel = cancel.clone();
    let mut run = tokio::spawn(async move {
        let _admission = admission;
        pipeline.run(request, run_cancel).await
    });

    tokio::spawn(async move {
        let joined = loop {
            tokio::select! {
                biased;
                received = events.recv() => match received {
                    Ok(event) => {
                        if tx.send(sse_event(event.event_type(), &event)).await.is_err() {
                            debug!(request_id = %request_id, "Stream client went away, cancelling run");
                            cancel.cancel();
                            return;
                        }
                    }
                    Err(EventBusError::Lagged(_)) => continue,
                    Err(_) => break (&mut run).await,
                },
                joined = &mut run => break joined,
            }
        };

        // Everything the run published is already buffered.
        while let Ok(event) = events.try_recv() {
            if tx.send(sse_event(event.event_type(), &event)).await.is_err() {
                return;
            }
        }

        let result = match joined {
            Ok(Ok(strategy)) => sse_event("result", &strategy),
            Ok(Err(failure)) => sse_event("result", &failure),
            Err(e) => {
                error!(request_id = %request_id, error = %e, "Pipeline task panicked");
                Event::default().event("error").data("pipeline task failed")
            }
        };
        let _ = tx.send(result).await;
    });

    let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    20
}

async fn list_strategies(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<ConsolidatedStrategy>>, ApiError> {
    state
        .pipeline
        .repository()
        .list_recent(query.limit.min(MAX_SEARCH_RESULTS))
        .await
        .map(Json)
        .map_err(|e| ApiError::Internal(e.to_string()))
}

async fn get_strategy(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ConsolidatedStrategy>, ApiError> {
    let request_id = RequestId::from_string(&id)
        .map_err(|_| ApiError::BadRequest(format!("invalid strategy id '{id}'")))?;

    match state.pipeline.repository().find_by_id(request_id).await {
        Ok(Some(strategy)) => Ok(Json(strategy)),
        Ok(None) => Err(ApiError::NotFound(format!("strategy {request_id} not found"))),
        Err(e) => Err(ApiError::Internal(e.to_string())),
    }
}

#[derive(Debug, Deserialize)]
struct PerformanceQuery {
    #[serde(default = "default_hours")]
    hours: u32,
}

fn default_hours() -> u32 {
    24
}

async fn performance(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PerformanceQuery>,
) -> Result<Response, ApiError> {
    let repository = state.index.repository();
    let report = performance_report(repository.as_ref(), query.hours)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(report).into_response())
}

#[derive(Debug, Deserialize)]
struct SearchQuery {
    q: String,
    #[serde(default = "default_k")]
    k: usize,
}

fn default_k() -> usize {
    5
}

async fn search_memory(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if query.q.trim().is_empty() {
        return Err(ApiError::BadRequest("query text is required".to_string()));
    }
    let k = query.k.min(MAX_SEARCH_RESULTS);

    let hits = state.index.query(&query.q, k).await.map_err(|e| {
        warn!(error = %e, "Memory search failed");
        ApiError::Internal(e.to_string())
    })?;

    let results: Vec<_> = hits
        .iter()
        .map(|hit| {
            json!({
                "id": hit.event.id,
                "similarity": hit.similarity,
                "event": hit.event.content,
            })
        })
        .collect();
    Ok(Json(json!({ "query": query.q, "k": k, "results": results })))
}

#[derive(Debug, Deserialize)]
struct ExportQuery {
    stage: Option<Stage>,
    since: Option<DateTime<Utc>>,
}

async fn export_memory(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ExportQuery>,
) -> Result<Response, ApiError> {
    let repository = state.index.repository();
    let examples = training_examples(repository.as_ref(), query.stage, query.since)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let body = to_jsonl(&examples).map_err(|e| ApiError::Internal(e.to_string()))?;

    Ok(([(header::CONTENT_TYPE, "application/x-ndjson")], body).into_response())
}
