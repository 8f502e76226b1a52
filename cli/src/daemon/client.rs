// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! HTTP client for communicating with daemon API

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use reqwest::{Client, StatusCode};

use triad_core::domain::events::PipelineEvent;
use triad_core::domain::strategy::{
    ConsolidatedStrategy, PipelineFailure, RequestId, Stage, StrategyRequest,
};
use triad_core::infrastructure::llm::sse::SseDecoder;

use super::base_url;

/// A finished run: the strategy, or the failure carrying the partial one.
pub type StrategyOutcome = std::result::Result<ConsolidatedStrategy, Box<PipelineFailure>>;

#[derive(Debug, Clone)]
pub struct DaemonClient {
    client: Client,
    base_url: String,
}

impl DaemonClient {
    pub fn new(host: &str, port: u16) -> Result<Self> {
        // No global timeout: pipeline runs and streams are long-lived.
        let client = Client::builder()
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url(host, port),
        })
    }

    pub async fn run_strategy(&self, request: &StrategyRequest) -> Result<StrategyOutcome> {
        let response = self
            .client
            .post(format!("{}/api/strategy", self.base_url))
            .json(request)
            .send()
            .await
            .context("Failed to submit strategy request")?;

        match response.status() {
            status if status.is_success() => Ok(Ok(response
                .json()
                .await
                .context("Failed to parse strategy response")?)),
            StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE => {
                let failure: PipelineFailure = response
                    .json()
                    .await
                    .context("Failed to parse pipeline failure")?;
                Ok(Err(Box::new(failure)))
            }
            _ => Err(error_from(response, "Strategy request failed").await),
        }
    }

    /// Stream a run. `on_event` sees every pipeline event before the outcome
    /// is returned.
    pub async fn stream_strategy(
        &self,
        request: &StrategyRequest,
        mut on_event: impl FnMut(&PipelineEvent),
    ) -> Result<StrategyOutcome> {
        let response = self
            .client
            .post(format!("{}/api/strategy/stream", self.base_url))
            .json(request)
            .send()
            .await
            .context("Failed to submit strategy request")?;

        if !response.status().is_success() {
            return Err(error_from(response, "Strategy stream failed").await);
        }

        let mut decoder = SseDecoder::new();
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.context("Strategy stream interrupted")?;
            for event in decoder.push(&chunk) {
                match event.event.as_deref() {
                    Some("result") => return parse_outcome(&event.data),
                    Some("error") => anyhow::bail!("Daemon reported: {}", event.data),
                    _ => match serde_json::from_str::<PipelineEvent>(&event.data) {
                        Ok(pipeline_event) => on_event(&pipeline_event),
                        Err(e) => tracing::debug!(error = %e, "Skipping unrecognised stream event"),
                    },
                }
            }
        }

        match decoder.finish() {
            Some(event) if event.event.as_deref() == Some("result") => parse_outcome(&event.data),
            _ => anyhow::bail!("Strategy stream ended without a result"),
        }
    }

    pub async fn get_strategy(&self, id: RequestId) -> Result<Option<ConsolidatedStrategy>> {
        let response = self
            .client
            .get(format!("{}/api/strategy/{}", self.base_url, id))
            .send()
            .await
            .context("Failed to get strategy")?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(
                response.json().await.context("Failed to parse strategy")?,
            )),
            _ => Err(error_from(response, "Failed to get strategy").await),
        }
    }

    pub async fn list_strategies(&self, limit: usize) -> Result<Vec<ConsolidatedStrategy>> {
        let response = self
            .client
            .get(format!("{}/api/strategy", self.base_url))
            .query(&[("limit", limit)])
            .send()
            .await
            .context("Failed to list strategies")?;

        if !response.status().is_success() {
            return Err(error_from(response, "Failed to list strategies").await);
        }
        response.json().await.context("Failed to parse strategy list")
    }

    pub async fn performance(&self, hours: u32) -> Result<serde_json::Value> {
        self.get_json("/api/strategy/performance", &[("hours", hours.to_string())])
            .await
    }

    pub async fn provider_health(&self) -> Result<serde_json::Value> {
        self.get_json("/api/health/providers", &[]).await
    }

    pub async fn search_memory(&self, query: &str, k: usize) -> Result<serde_json::Value> {
        self.get_json(
            "/api/memory/search",
            &[("q", query.to_string()), ("k", k.to_string())],
        )
        .await
    }

    /// Training export as JSON Lines.
    pub async fn export_memory(
        &self,
        stage: Option<Stage>,
        since: Option<DateTime<Utc>>,
    ) -> Result<String> {
        let mut params = Vec::new();
        if let Some(stage) = stage {
            params.push(("stage", stage.to_string()));
        }
        if let Some(since) = since {
            params.push(("since", since.to_rfc3339()));
        }

        let response = self
            .client
            .get(format!("{}/api/memory/export", self.base_url))
            .query(&params)
            .send()
            .await
            .context("Failed to export memory")?;

        if !response.status().is_success() {
            return Err(error_from(response, "Failed to export memory").await);
        }
        response.text().await.context("Failed to read export")
    }

    async fn get_json(&self, path: &str, params: &[(&str, String)]) -> Result<serde_json::Value> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .query(params)
            .send()
            .await
            .with_context(|| format!("Failed to call {path}"))?;

        if !response.status().is_success() {
            return Err(error_from(response, &format!("{path} failed")).await);
        }
        response
            .json()
            .await
            .with_context(|| format!("Failed to parse {path} response"))
    }
}

fn parse_outcome(data: &str) -> Result<StrategyOutcome> {
    if let Ok(strategy) = serde_json::from_str::<ConsolidatedStrategy>(data) {
        return Ok(Ok(strategy));
    }
    let failure: PipelineFailure =
        serde_json::from_str(data).context("Failed to parse stream result")?;
    Ok(Err(Box::new(failure)))
}

async fn error_from(response: reqwest::Response, what: &str) -> anyhow::Error {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v["error"].as_str().map(str::to_string))
        .unwrap_or(body);
    anyhow::anyhow!("{what} (HTTP {status}): {message}")
}
