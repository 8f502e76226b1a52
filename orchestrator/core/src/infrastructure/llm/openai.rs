// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// OpenAI LLM Provider Adapter
//
// Anti-Corruption Layer for the OpenAI Chat Completions API.
// Also serves OpenAI-compatible APIs (LM Studio, vLLM, etc.).
//
// Reasoning models (o-series, gpt-5) reject `temperature` and `max_tokens`;
// they take `reasoning_effort` and `max_completion_tokens` instead.

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

pub struct OpenAIAdapter {
    pool: Arc<ProviderPool>,
    endpoint: String,
    api_key: Option<String>,
    kind: ProviderKind,
}

#[derive(Serialize)]
struct OpenAIRequest<'a> {
    model: &'a str,
    messages: Vec<OpenAIMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_completion_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning_effort: Option<&'static str>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Serialize)]
struct OpenAIMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
    #[serde(default)]
    usage: Option<OpenAIUsage>,
}

#[derive(Deserialize)]
struct OpenAIChoice {
    message: OpenAIResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct OpenAIResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct OpenAIUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Deserialize)]
struct OpenAIStreamChunk {
    #[serde(default)]
    choices: Vec<OpenAIStreamChoice>,
    #[serde(default)]
    usage: Option<OpenAIUsage>,
}

#[derive(Deserialize)]
struct OpenAIStreamChoice {
    #[serde(default)]
    delta: OpenAIDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct OpenAIDelta {
    #[serde(default)]
    content: Option<String>,
}

fn finish_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("length") => FinishReason::Length,
        Some("content_filter") => FinishReason::ContentFilter,
        _ => FinishReason::Stop,
    }
}

impl OpenAIAdapter {
    pub fn new(
        pool: Arc<ProviderPool>,
        endpoint: String,
        api_key: Option<String>,
        kind: ProviderKind,
    ) -> Self {
        Self {
            pool,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key,
            kind,
        }
    }

    fn build_request<'a>(&self, request: &'a GenerationRequest) -> OpenAIRequest<'a> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &request.system {
            messages.push(OpenAIMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(OpenAIMessage {
            role: "user",
            content: &request.prompt,
        });

        let (max_tokens, max_completion_tokens, temperature, reasoning_effort) =
            match request.parameters {
                ParameterSet::Sampling { temperature } => {
                    (Some(request.max_tokens), None, Some(temperature), None)
                }
                ParameterSet::Reasoning { effort } => {
                    (None, Some(request.max_tokens), None, Some(effort.as_str()))
                }
            };

        OpenAIRequest {
            model: &request.model,
            messages,
            max_tokens,
            max_completion_tokens,
            temperature,
            reasoning_effort,
            stream: request.stream,
            stream_options: request.stream.then_some(StreamOptions {
                include_usage: true,
            }),
        }
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    async fn read_single(
        &self,
        response: reqwest::Response,
        model: &str,
    ) -> Result<GenerationResponse, LLMError> {
        let raw: serde_json::Value = response.json().await.map_err(transport_error)?;
        let parsed: OpenAIResponse = serde_json::from_value(raw.clone())
            .map_err(|e| LLMError::InvalidResponse(format!("Failed to parse response: {}", e)))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LLMError::InvalidResponse("No response from model".into()))?;
        let usage = parsed
            .usage
            .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens))
            .unwrap_or_default();

        Ok(GenerationResponse {
            text: choice.message.content.unwrap_or_default(),
            usage,
            provider: self.kind.as_str().to_string(),
            model: model.to_string(),
            finish_reason: finish_reason(choice.finish_reason.as_deref()),
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
        let mut usage = TokenUsage::default();
        let mut reason = None;

        sse::consume(response, |event| {
            if event.data == "[DONE]" {
                return Ok(Flow::Stop);
            }
            let chunk: OpenAIStreamChunk = serde_json::from_str(&event.data)
                .map_err(|e| LLMError::InvalidResponse(format!("Bad stream chunk: {}", e)))?;

            for choice in chunk.choices {
                if let Some(delta) = choice.delta.content.filter(|d| !d.is_empty()) {
                    if let Some(sink) = on_chunk {
                        sink(&delta);
                    }
                    text.push_str(&delta);
                }
                if choice.finish_reason.is_some() {
                    reason = choice.finish_reason;
                }
            }
            if let Some(u) = chunk.usage {
                usage = TokenUsage::new(u.prompt_tokens, u.completion_tokens);
            }
            Ok(Flow::Continue)
        })
        .await?;

        Ok(GenerationResponse {
            text,
            usage,
            provider: self.kind.as_str().to_string(),
            model: model.to_string(),
            finish_reason: finish_reason(reason.as_deref()),
            raw: None,
        })
    }
}

#[async_trait]
impl LLMProvider for OpenAIAdapter {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
        on_chunk: Option<&ChunkSink<'_>>,
    ) -> Result<GenerationResponse, LLMError> {
        let body = self.build_request(request);
        let url = format!("{}/chat/completions", self.endpoint);

        self.pool
            .run(|client| async move {
                let response = self
                    .authorize(client.post(&url))
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
                let response = self
                    .authorize(client.get(&url))
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

    fn adapter(url: &str, kind: ProviderKind) -> OpenAIAdapter {
        let pool = Arc::new(ProviderPool::new("openai", 4).unwrap());
        OpenAIAdapter::new(pool, url.to_string(), Some("sk-test".into()), kind)
    }

    fn request(model: &str, parameters: ParameterSet, stream: bool) -> GenerationRequest {
        GenerationRequest {
            model: model.to_string(),
            system: Some("You consolidate.".into()),
            prompt: "Where to?".into(),
            max_tokens: 512,
            parameters,
            stream,
        }
    }

    #[tokio::test]
    async fn test_reasoning_request_shape() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .match_header("authorization", "Bearer sk-test")
            .match_body(Matcher::PartialJsonString(
                r#"{"model":"gpt-5","reasoning_effort":"high","max_completion_tokens":512}"#.into(),
            ))
            .with_status(200)
            .with_body(
                r#"{"choices":[{"message":{"role":"assistant","content":"Go north."},"finish_reason":"stop"}],
                    "usage":{"prompt_tokens":10,"completion_tokens":3,"total_tokens":13}}"#,
            )
            .create_async()
            .await;

        let response = adapter(&server.url(), ProviderKind::OpenAI)
            .generate(
                &request(
                    "gpt-5",
                    ParameterSet::Reasoning {
                        effort: ReasoningEffort::High,
                    },
                    false,
                ),
                None,
            )
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(response.text, "Go north.");
        assert_eq!(response.usage.total_tokens, 13);
        assert_eq!(response.finish_reason, FinishReason::Stop);
        assert!(response.raw.is_some());
    }

    #[test]
    fn test_request_never_mixes_parameter_families() {
        let adapter = adapter("http://unused", ProviderKind::OpenAI);
        let req = request(
            "o3",
            ParameterSet::Reasoning {
                effort: ReasoningEffort::Low,
            },
            false,
        );
        let body = serde_json::to_value(adapter.build_request(&req)).unwrap();
        assert!(body.get("temperature").is_none());
        assert!(body.get("max_tokens").is_none());
        assert_eq!(body["reasoning_effort"], "low");

        let req = request("gpt-4o", ParameterSet::Sampling { temperature: 0.2 }, false);
        let body = serde_json::to_value(adapter.build_request(&req)).unwrap();
        assert!(body.get("reasoning_effort").is_none());
        assert_eq!(body["max_tokens"], 512);
        assert_eq!(body["messages"][0]["role"], "system");
    }

    #[tokio::test]
    async fn test_streaming_coalesces_and_forwards_chunks() {
        let mut server = mockito::Server::new_async().await;
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Head \"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"to DFW.\"},\"finish_reason\":\"stop\"}]}\n\n",
            "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":7,\"completion_tokens\":4}}\n\n",
            "data: [DONE]\n\n",
        );
        let _mock = server
            .mock("POST", "/chat/completions")
            .match_body(Matcher::PartialJsonString(r#"{"stream":true}"#.into()))
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(body)
            .create_async()
            .await;

        let chunks = Mutex::new(Vec::new());
        let sink: &ChunkSink<'_> = &|delta: &str| chunks.lock().push(delta.to_string());
        let response = adapter(&server.url(), ProviderKind::OpenAI)
            .generate(&request("gpt-4o", ParameterSet::Sampling { temperature: 0.3 }, true), Some(sink))
            .await
            .unwrap();

        assert_eq!(response.text, "Head to DFW.");
        assert_eq!(*chunks.lock(), vec!["Head ".to_string(), "to DFW.".to_string()]);
        assert_eq!(response.usage.total_tokens, 11);
        assert!(response.raw.is_none());
    }

    #[tokio::test]
    async fn test_http_errors_are_classified() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/chat/completions")
            .with_status(503)
            .with_body("upstream unavailable")
            .create_async()
            .await;

        let err = adapter(&server.url(), ProviderKind::OpenAICompatible)
            .generate(&request("llama", ParameterSet::Sampling { temperature: 0.3 }, false), None)
            .await
            .unwrap_err();

        assert!(matches!(err, LLMError::Server { status: 503, .. }));
        assert!(err.is_retryable());
    }
}
