// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Anthropic LLM Provider Adapter
//
// Anti-Corruption Layer for the Anthropic Messages API.
//
// Reasoning is expressed as an extended-thinking token budget. When thinking
// is enabled `temperature` must be omitted, and the budget must fit inside
// `max_tokens`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::sse::{self, Flow};
use super::transport::{error_from_response, transport_error, ProviderPool};
use crate::domain::llm::{
    ChunkSink, FinishReason, GenerationRequest, GenerationResponse, LLMError, LLMProvider,
    TokenUsage,
};
use crate::domain::provider::{ParameterSet, ProviderKind, ANTHROPIC_MIN_THINKING_BUDGET};

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicAdapter {
    pool: Arc<ProviderPool>,
    endpoint: String,
    api_key: String,
}

#[derive(Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: Vec<AnthropicMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking: Option<Thinking>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Serialize)]
struct AnthropicMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct Thinking {
    #[serde(rename = "type")]
    kind: &'static str,
    budget_tokens: u32,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContent>,
    usage: AnthropicUsage,
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct AnthropicContent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize, Default)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    MessageStart {
        message: StreamMessage,
    },
    ContentBlockDelta {
        delta: Delta,
    },
    MessageDelta {
        delta: MessageDeltaBody,
        #[serde(default)]
        usage: AnthropicUsage,
    },
    MessageStop,
    Error {
        error: StreamError,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct StreamMessage {
    #[serde(default)]
    usage: AnthropicUsage,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Delta {
    TextDelta {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct MessageDeltaBody {
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct StreamError {
    #[serde(rename = "type")]
    kind: String,
    message: String,
}

fn finish_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("max_tokens") => FinishReason::Length,
        Some("refusal") => FinishReason::ContentFilter,
        _ => FinishReason::Stop,
    }
}

fn stream_error(error: StreamError) -> LLMError {
    match error.kind.as_str() {
        "overloaded_error" => LLMError::Server {
            status: 529,
            message: error.message,
        },
        "rate_limit_error" => LLMError::RateLimit(error.message),
        "api_error" => LLMError::Server {
            status: 500,
            message: error.message,
        },
        "authentication_error" | "permission_error" => LLMError::Authentication(error.message),
        "invalid_request_error" => LLMError::MalformedRequest(error.message),
        _ => LLMError::InvalidResponse(format!("{}: {}", error.kind, error.message)),
    }
}

impl AnthropicAdapter {
    pub fn new(pool: Arc<ProviderPool>, endpoint: String, api_key: String) -> Self {
        Self {
            pool,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    /// Bindings reject `max_tokens` too small for a thinking budget, so the
    /// clamp below only ever shrinks the budget toward `max_tokens - 1`.
    fn build_request<'a>(&self, request: &'a GenerationRequest) -> AnthropicRequest<'a> {
        let (temperature, thinking) = match request.parameters {
            ParameterSet::Sampling { temperature } => (Some(temperature), None),
            ParameterSet::Reasoning { effort } => {
                // Budget must stay strictly below max_tokens.
                let budget = effort
                    .thinking_budget()
                    .min(request.max_tokens.saturating_sub(1))
                    .max(ANTHROPIC_MIN_THINKING_BUDGET);
                (
                    None,
                    Some(Thinking {
                        kind: "enabled",
                        budget_tokens: budget,
                    }),
                )
            }
        };

        AnthropicRequest {
            model: &request.model,
            max_tokens: request.max_tokens,
            system: request.system.as_deref(),
            messages: vec![AnthropicMessage {
                role: "user",
                content: &request.prompt,
            }],
            temperature,
            thinking,
            stream: request.stream,
        }
    }

    async fn read_single(
        &self,
        response: reqwest::Response,
        model: &str,
    ) -> Result<GenerationResponse, LLMError> {
        let raw: serde_json::Value = response.json().await.map_err(transport_error)?;
        let parsed: AnthropicResponse = serde_json::from_value(raw.clone())
            .map_err(|e| LLMError::InvalidResponse(format!("Failed to parse response: {}", e)))?;

        // Thinking blocks are internal; only text blocks are the answer.
        let text: String = parsed
            .content
            .into_iter()
            .filter(|c| c.kind == "text")
            .filter_map(|c| c.text)
            .collect();

        Ok(GenerationResponse {
            text,
            usage: TokenUsage::new(parsed.usage.input_tokens, parsed.usage.output_tokens),
            provider: ProviderKind::Anthropic.as_str().to_string(),
            model: model.to_string(),
            finish_reason: finish_reason(parsed.stop_reason.as_deref()),
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
        let mut input_tokens = 0;
        let mut output_tokens = 0;
        let mut reason = None;

        sse::consume(response, |event| {
            let parsed: StreamEvent = serde_json::from_str(&event.data)
                .map_err(|e| LLMError::InvalidResponse(format!("Bad stream event: {}", e)))?;

            match parsed {
                StreamEvent::MessageStart { message } => {
                    input_tokens = message.usage.input_tokens;
                }
                StreamEvent::ContentBlockDelta {
                    delta: Delta::TextDelta { text: delta },
                } => {
                    if let Some(sink) = on_chunk {
                        sink(&delta);
                    }
                    text.push_str(&delta);
                }
                StreamEvent::MessageDelta { delta, usage } => {
                    reason = delta.stop_reason;
                    output_tokens = usage.output_tokens;
                }
                StreamEvent::MessageStop => return Ok(Flow::Stop),
                StreamEvent::Error { error } => return Err(stream_error(error)),
                _ => {}
            }
            Ok(Flow::Continue)
        })
        .await?;

        Ok(GenerationResponse {
            text,
            usage: TokenUsage::new(input_tokens, output_tokens),
            provider: ProviderKind::Anthropic.as_str().to_string(),
            model: model.to_string(),
            finish_reason: finish_reason(reason.as_deref()),
            raw: None,
        })
    }
}

#[async_trait]
impl LLMProvider for AnthropicAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
        on_chunk: Option<&ChunkSink<'_>>,
    ) -> Result<GenerationResponse, LLMError> {
        let body = self.build_request(request);
        let url = format!("{}/v1/messages", self.endpoint);

        self.pool
            .run(|client| async move {
                let response = client
                    .post(&url)
                    .header("x-api-key", &self.api_key)
                    .header("anthropic-version", ANTHROPIC_VERSION)
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
        let url = format!("{}/v1/models", self.endpoint);

        self.pool
            .run(|client| async move {
                let response = client
                    .get(&url)
                    .header("x-api-key", &self.api_key)
                    .header("anthropic-version", ANTHROPIC_VERSION)
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::provider::ReasoningEffort;
    use mockito::Matcher;
    use parking_lot::Mutex;

    fn adapter(url: &str) -> AnthropicAdapter {
        let pool = Arc::new(ProviderPool::new("anthropic", 4).unwrap());
        AnthropicAdapter::new(pool, url.to_string(), "key-test".into())
    }

    fn request(parameters: ParameterSet, max_tokens: u32, stream: bool) -> GenerationRequest {
        GenerationRequest {
            model: "claude-sonnet-4-5".into(),
            system: Some("You are the strategist.".into()),
            prompt: "Frisco, TX at 6pm".into(),
            max_tokens,
            parameters,
            stream,
        }
    }

    #[tokio::test]
    async fn test_single_shot_request_and_response() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/messages")
            .match_header("x-api-key", "key-test")
            .match_header("anthropic-version", ANTHROPIC_VERSION)
            .match_body(Matcher::PartialJsonString(
                r#"{"model":"claude-sonnet-4-5","temperature":0.7,"system":"You are the strategist."}"#.into(),
            ))
            .with_status(200)
            .with_body(
                r#"{"content":[{"type":"thinking","thinking":"hmm"},{"type":"text","text":"Stage near the Star."}],
                    "usage":{"input_tokens":20,"output_tokens":5},"stop_reason":"end_turn"}"#,
            )
            .create_async()
            .await;

        let response = adapter(&server.url())
            .generate(&request(ParameterSet::Sampling { temperature: 0.7 }, 1024, false), None)
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(response.text, "Stage near the Star.");
        assert_eq!(response.usage, TokenUsage::new(20, 5));
        assert_eq!(response.provider, "anthropic");
    }

    #[test]
    fn test_thinking_budget_fits_max_tokens() {
        let adapter = adapter("http://unused");
        let req = request(
            ParameterSet::Reasoning {
                effort: ReasoningEffort::High,
            },
            4096,
            false,
        );
        let body = serde_json::to_value(adapter.build_request(&req)).unwrap();
        assert_eq!(body["thinking"]["budget_tokens"], 4095);
        assert!(body.get("temperature").is_none());
    }

    #[tokio::test]
    async fn test_streaming_events() {
        let mut server = mockito::Server::new_async().await;
        let body = concat!(
            "event: message_start\n",
            "data: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":12}}}\n\n",
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"thinking_delta\",\"thinking\":\"x\"}}\n\n",
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"index\":1,\"delta\":{\"type\":\"text_delta\",\"text\":\"Airport \"}}\n\n",
            "event: ping\n",
            "data: {\"type\":\"ping\"}\n\n",
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"index\":1,\"delta\":{\"type\":\"text_delta\",\"text\":\"queue.\"}}\n\n",
            "event: message_delta\n",
            "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"max_tokens\"},\"usage\":{\"output_tokens\":9}}\n\n",
            "event: message_stop\n",
            "data: {\"type\":\"message_stop\"}\n\n",
        );
        let _mock = server
            .mock("POST", "/v1/messages")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(body)
            .create_async()
            .await;

        let chunks = Mutex::new(Vec::new());
        let sink: &ChunkSink<'_> = &|delta: &str| chunks.lock().push(delta.to_string());
        let response = adapter(&server.url())
            .generate(&request(ParameterSet::Sampling { temperature: 0.5 }, 1024, true), Some(sink))
            .await
            .unwrap();

        assert_eq!(response.text, "Airport queue.");
        assert_eq!(chunks.lock().len(), 2);
        assert_eq!(response.usage, TokenUsage::new(12, 9));
        assert_eq!(response.finish_reason, FinishReason::Length);
    }

    #[tokio::test]
    async fn test_stream_error_event_is_retryable_when_overloaded() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/messages")
            .with_status(200)
            .with_body("event: error\ndata: {\"type\":\"error\",\"error\":{\"type\":\"overloaded_error\",\"message\":\"Overloaded\"}}\n\n")
            .create_async()
            .await;

        let err = adapter(&server.url())
            .generate(&request(ParameterSet::Sampling { temperature: 0.5 }, 1024, true), None)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_auth_failure_is_fatal() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/messages")
            .with_status(401)
            .with_body(r#"{"type":"error","error":{"type":"authentication_error"}}"#)
            .create_async()
            .await;

        let err = adapter(&server.url())
            .generate(&request(ParameterSet::Sampling { temperature: 0.5 }, 1024, false), None)
            .await
            .unwrap_err();
        assert!(matches!(err, LLMError::Authentication(_)));
        assert!(!err.is_retryable());
    }
}
