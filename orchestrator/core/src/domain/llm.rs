// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Llm
//!
//! Provider-neutral call contract shared by every adapter.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Implements llm

// LLM Provider Domain Interface (Anti-Corruption Layer)
//
// Adapters in infrastructure/llm/ translate GenerationRequest into each
// vendor's wire format and every vendor failure into an LLMError.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::provider::{ConfigurationError, ParameterSet, ProviderCallSpec, ProviderKind};

/// Receives streamed text deltas as they arrive.
pub type ChunkSink<'a> = dyn Fn(&str) + Send + Sync + 'a;

/// Domain interface for LLM providers
/// Anti-Corruption Layer that isolates business logic from vendor APIs
#[async_trait]
pub trait LLMProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// One outbound call. When `request.stream` is set, every text delta is
    /// passed to `on_chunk` before the coalesced response is returned.
    async fn generate(
        &self,
        request: &GenerationRequest,
        on_chunk: Option<&ChunkSink<'_>>,
    ) -> Result<GenerationResponse, LLMError>;

    /// Check if provider is healthy and accessible
    async fn health_check(&self) -> Result<(), LLMError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub prompt: String,
    pub max_tokens: u32,
    pub parameters: ParameterSet,
    #[serde(default)]
    pub stream: bool,
}

impl GenerationRequest {
    pub fn for_spec(spec: &ProviderCallSpec, system: Option<String>, prompt: String) -> Self {
        Self {
            model: spec.model.clone(),
            system,
            prompt,
            max_tokens: spec.max_tokens,
            parameters: spec.parameters,
            stream: spec.stream,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResponse {
    /// Generated text
    pub text: String,

    /// Token usage stats
    pub usage: TokenUsage,

    /// Provider type (e.g., "anthropic", "gemini")
    pub provider: String,

    /// Model used (e.g., "gpt-5", "claude-sonnet-4-5")
    pub model: String,

    /// Why generation stopped
    pub finish_reason: FinishReason,

    /// Raw provider body for single-shot calls.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Reason why generation stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Natural completion (model decided to stop)
    Stop,

    /// Hit max_tokens limit
    Length,

    /// Blocked by content filter
    ContentFilter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Transient; worth another attempt after backoff.
    Retryable,
    /// A defect that another attempt cannot fix.
    Fatal,
    /// The caller gave up; neither retried nor a provider fault.
    Cancelled,
}

/// Errors that can occur during LLM operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum LLMError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Provider error (HTTP {status}): {message}")]
    Server { status: u16, message: String },

    #[error("Cancelled")]
    Cancelled,
}

impl LLMError {
    pub fn class(&self) -> ErrorClass {
        match self {
            LLMError::Timeout(_)
            | LLMError::RateLimit(_)
            | LLMError::Network(_)
            | LLMError::Server { .. } => ErrorClass::Retryable,
            LLMError::Cancelled => ErrorClass::Cancelled,
            LLMError::Configuration(_)
            | LLMError::InvalidParameter(_)
            | LLMError::Authentication(_)
            | LLMError::MalformedRequest(_)
            | LLMError::ModelNotFound(_)
            | LLMError::InvalidResponse(_) => ErrorClass::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            LLMError::Configuration(_) => "configuration",
            LLMError::InvalidParameter(_) => "invalid_parameter",
            LLMError::Authentication(_) => "authentication",
            LLMError::MalformedRequest(_) => "malformed_request",
            LLMError::ModelNotFound(_) => "model_not_found",
            LLMError::InvalidResponse(_) => "invalid_response",
            LLMError::Timeout(_) => "timeout",
            LLMError::RateLimit(_) => "rate_limit",
            LLMError::Network(_) => "network",
            LLMError::Server { .. } => "server",
            LLMError::Cancelled => "cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert_eq!(LLMError::Timeout(Duration::from_secs(1)).class(), ErrorClass::Retryable);
        assert_eq!(LLMError::RateLimit("slow down".into()).class(), ErrorClass::Retryable);
        assert_eq!(
            LLMError::Server {
                status: 503,
                message: "unavailable".into()
            }
            .class(),
            ErrorClass::Retryable
        );
        assert_eq!(LLMError::Authentication("bad key".into()).class(), ErrorClass::Fatal);
        assert_eq!(LLMError::InvalidParameter("temperature".into()).class(), ErrorClass::Fatal);
        assert_eq!(
            LLMError::Configuration(ConfigurationError::UnknownProvider("x".into())).class(),
            ErrorClass::Fatal
        );
        assert_eq!(LLMError::Cancelled.class(), ErrorClass::Cancelled);
    }

    #[test]
    fn test_timeout_message() {
        let err = LLMError::Timeout(Duration::from_millis(1500));
        assert_eq!(err.to_string(), "Timed out after 1500ms");
        assert_eq!(err.code(), "timeout");
    }
}
