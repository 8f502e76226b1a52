// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Gemini LLM Provider Adapter
//
// Anti-Corruption Layer for the Gemini generateContent API. Streaming uses
// streamGenerateContent with `alt=sse`; every event is a full partial response.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::sse::{self, Flow};
use super::transport::{error_from_response, transport_error, ProviderPool};
use crate::domain::llm::{
    ChunkSink, FinishReason, GenerationRequest, GenerationResponse, LLMError, LLMProvider,
    TokenUsage,
};
use crate::domain::provider::{ParameterSet, ProviderKind};

pub struct GeminiAdapter {
    pool: Arc<ProviderPool>,
    endpoint: String,
    api_key: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest<'a> {
    contents: Vec<GeminiContent<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent<'a>>,
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct GeminiContent<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<GeminiPart<'a>>,
}

#[derive(Serialize)]
struct GeminiPart<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    max_output_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking_config: Option<ThinkingConfig>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ThinkingConfig {
    thinking_budget: u32,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    thought: bool,
}

#[derive(Deserialize, Clone, Copy)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
}

impl GeminiResponse {
    /// Answer text of the first candidate, thought summaries excluded.
    fn text(&self) -> String {
        self.candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|content| {
                content
                    .parts
                    .iter()
                    .filter(|p| !p.thought)
                    .filter_map(|p| p.text.as_deref())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn finish_reason(&self) -> Option<&str> {
        self.candidates
            .first()
            .and_then(|c| c.finish_reason.as_deref())
    }
}

fn finish_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("MAX_TOKENS") => FinishReason::Length,
        Some("SAFETY") | Some("RECITATION") | Some("PROHIBITED_CONTENT") | Some("BLOCKLIST") => {
            FinishReason::ContentFilter
        }
        _ => FinishReason::Stop,
    }
}

fn usage(metadata: Option<UsageMetadata>) -> TokenUsage {
    metadata
        .map(|u| TokenUsage::new(u.prompt_token_count, u.candidates_token_count))
        .unwrap_or_default()
}

impl GeminiAdapter {
    pub fn new(pool: Arc<ProviderPool>, endpoint: String, api_key: String) -> Self {
        Self {
            pool,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn build_request<'a>(&self, request: &'a GenerationRequest) -> GeminiRequest<'a> {
        let (temperature, thinking_config) = match request.parameters {
            ParameterSet::Sampling { temperature } => (Some(temperature), None),
            ParameterSet::Reasoning { effort } => (
                None,
                Some(ThinkingConfig {
                    thinking_budget: effort.thinking_budget().min(request.max_tokens),
                }),
            ),
        };

        GeminiRequest {
            contents: vec![GeminiContent {
                role: Some("user"),
                parts: vec![GeminiPart {
                    text: &request.prompt,
                }],
            }],
            system_instruction: request.system.as_deref().map(|system| GeminiContent {
                role: None,
                parts: vec![GeminiPart { text: system }],
            }),
            generation_config: GenerationConfig {
                max_output_tokens: request.max_tokens,
                temperature,
                thinking_config,
            },
        }
    }

    fn url(&self, model: &str, stream: bool) -> String {
        if stream {
            format!(
                "{}/models/{}:streamGenerateContent?alt=sse",
                self.endpoint, model
            )
        } else {
            format!("{}/models/{}:generateContent", self.endpoint, model)
        }
    }

    async fn read_single(
        &self,
        response: reqwest::Response,
        model: &str,
    ) -> Result<GenerationResponse, LLMError> {
        let raw: serde_json::Value = response.json().await.map_err(transport_error)?;
        let parsed: GeminiResponse = serde_json::from_value(raw.clone())
            .map_err(|e| LLMError::InvalidResponse(format!("Failed to parse response: {}", e)))?;

        if parsed.candidates.is_empty() {
            return Err(LLMError::InvalidResponse(
                "response contained no candidates".to_string(),
            ));
        }

        Ok(GenerationResponse {
            text: parsed.text(),
            usage: usage(parsed.usage_metadata),
            provider: ProviderKind::Gemini.as_str().to_string(),
            model: model.to_string(),
            finish_reason: finish_reason(parsed.finish_reason()),
            raw: Some(raw),
        })
    }

    async fn read_stream(
        &self,
        response: reqwest::Response,
        model: &str,
        on_chunk: Option<&ChunkSink<'_>>,
    ) -> Result<GenerationResponse, LLMError> {
        let mut text = String::new();
        let mut metadata = None;
        let mut reason = None;

        sse::consume(response, |event| {
            let chunk: GeminiResponse = serde_json::from_str(&event.data)
                .map_err(|e| LLMError::InvalidResponse(format!("Bad stream event: {}", e)))?;

            let delta = chunk.text();
            if !delta.is_empty() {
                if let Some(sink) = on_chunk {
                    sink(&delta);
                }
                text.push_str(&delta);
            }
            if let Some(r) = chunk.finish_reason() {
                reason = Some(r.to_string());
            }
            // Later chunks carry cumulative counts.
            if chunk.usage_metadata.is_some() {
                metadata = chunk.usage_metadata;
            }
            Ok(Flow::Continue)
        })
        .await?;

        Ok(GenerationResponse {
            text,
            usage: usage(metadata),
            provider: ProviderKind::Gemini.as_str().to_string(),
            model: model.to_string(),
            finish_reason: finish_reason(reason.as_deref()),
            raw: None,
        })
    }
}

#[async_trait]
impl LLMProvider for GeminiAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gemini
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
        on_chunk: Option<&ChunkSink<'_>>,
    ) -> Result<GenerationResponse, LLMError> {
        let body = self.build_request(request);
        let url = self.url(&request.model, request.stream);

        self.pool
            .run(|client| async move {
                let response = client
                    .post(&url)
                    .header("x-goog-api-key", &self.api_key)
                    .json(&body)
                    .send()
                    .await
                    .map_err(transport_error)?;

                if !response.status().is_success() {
                    return Err(error_from_response(response, &request.model).await);
                }

                if request.stream {
                    self.read_stream(response, &request.model, on_chunk).await
                } else {
                    self.read_single(response, &request.model).await
                }
            })
            .await
    }

    async fn health_check(&self) -> Result<(), LLMError> {
        let url = format!("{}/models", self.endpoint);

        self.pool
            .run(|client| async move {
                let response = client
                    .get(&url)
                    .header("x-goog-api-key", &self.api_key)
                    .send()
                    .await
                    .map_err(transport_error)?;

                if response.status().is_success() {
                    Ok(())
                } else {
                    Err(error_from_response(response, "").await)
                }
            })
            .await
    }
}
