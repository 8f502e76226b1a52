// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Memory Events
//!
//! A memory event is the durable record of one captured LLM interaction: a
//! single stage attempt, or the consolidated outcome of a whole pipeline run.
//! Events are immutable once written. The only thing that may change after
//! insertion is the embedding, and only when the index moves to a new
//! generation.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Memory event value objects, fingerprints and embeddings

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemoryEventId(pub Uuid);

impl MemoryEventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MemoryEventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MemoryEventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hex-encoded SHA-256 over the identifying content of an interaction.
///
/// Two submissions of the same interaction (same request, stage, attempt and
/// content) always produce the same fingerprint regardless of when they were
/// recorded, which is what makes at-least-once capture safe.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Hash the given fields. A unit separator between fields keeps
    /// `("ab", "c")` and `("a", "bc")` apart.
    pub fn of<'a>(parts: impl IntoIterator<Item = &'a str>) -> Self {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part.as_bytes());
            hasher.update([0x1f]);
        }
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    /// One adapter call attempt for one stage.
    StageAttempt,
    /// The final outcome of a pipeline run.
    Consolidated,
}

impl MemoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryKind::StageAttempt => "stage_attempt",
            MemoryKind::Consolidated => "consolidated",
        }
    }
}

/// Content of a memory event before it has been fingerprinted and embedded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEventDraft {
    pub kind: MemoryKind,
    pub request_id: Uuid,
    /// `strategist`, `briefer`, `consolidator`; `None` for consolidated records.
    pub stage: Option<String>,
    /// 1-based attempt number within the stage.
    pub attempt: Option<u32>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub prompt: Option<String>,
    pub response: Option<String>,
    pub success: bool,
    /// Classified error for failed attempts.
    pub error: Option<String>,
    pub latency_ms: u64,
    pub tokens_in: u32,
    pub tokens_out: u32,
    /// Free-form structured payload (parsed recommendation, pipeline status).
    #[serde(default)]
    pub payload: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

impl MemoryEventDraft {
    pub fn stage_attempt(request_id: Uuid, stage: impl Into<String>, attempt: u32) -> Self {
        Self {
            kind: MemoryKind::StageAttempt,
            request_id,
            stage: Some(stage.into()),
            attempt: Some(attempt),
            provider: None,
            model: None,
            prompt: None,
            response: None,
            success: false,
            error: None,
            latency_ms: 0,
            tokens_in: 0,
            tokens_out: 0,
            payload: serde_json::Value::Null,
            recorded_at: Utc::now(),
        }
    }

    pub fn consolidated(request_id: Uuid) -> Self {
        Self {
            kind: MemoryKind::Consolidated,
            stage: None,
            attempt: None,
            ..Self::stage_attempt(request_id, "", 0)
        }
    }

    /// Fingerprint over everything that identifies the interaction.
    /// `recorded_at` and `latency_ms` are deliberately excluded so a
    /// redelivered record collapses onto the original.
    pub fn fingerprint(&self) -> Fingerprint {
        let request_id = self.request_id.to_string();
        let attempt = self.attempt.map(|a| a.to_string()).unwrap_or_default();
        let success = if self.success { "ok" } else { "failed" };
        let payload = if self.payload.is_null() {
            String::new()
        } else {
            self.payload.to_string()
        };

        Fingerprint::of([
            self.kind.as_str(),
            request_id.as_str(),
            self.stage.as_deref().unwrap_or_default(),
            attempt.as_str(),
            self.prompt.as_deref().unwrap_or_default(),
            self.response.as_deref().unwrap_or_default(),
            self.error.as_deref().unwrap_or_default(),
            success,
            payload.as_str(),
        ])
    }

    /// Text handed to the embedder. Prompt and response carry the semantics;
    /// the error string matters for failed attempts that have no response.
    pub fn embedding_text(&self) -> String {
        let mut text = String::new();
        if let Some(stage) = &self.stage {
            text.push_str(stage);
            text.push('\n');
        }
        for part in [&self.prompt, &self.response, &self.error].into_iter().flatten() {
            text.push_str(part);
            text.push('\n');
        }
        if text.trim().is_empty() && !self.payload.is_null() {
            text = self.payload.to_string();
        }
        text
    }
}

/// Vector embedding tagged with the index generation that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub generation: u32,
    pub vector: Vec<f32>,
}

impl Embedding {
    pub fn dimension(&self) -> usize {
        self.vector.len()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEvent {
    pub id: MemoryEventId,
    pub fingerprint: Fingerprint,
    #[serde(flatten)]
    pub content: MemoryEventDraft,
    pub embedding: Embedding,
    pub indexed_at: DateTime<Utc>,
}

impl MemoryEvent {
    pub fn new(content: MemoryEventDraft, embedding: Embedding) -> Self {
        Self {
            id: MemoryEventId::new(),
            fingerprint: content.fingerprint(),
            content,
            embedding,
            indexed_at: Utc::now(),
        }
    }
}

/// A period during which every stored embedding has the same dimensionality
/// and was produced by the same embedder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexGeneration {
    pub number: u32,
    pub dimension: usize,
    pub embedder: String,
}

impl IndexGeneration {
    pub fn first(embedder: impl Into<String>, dimension: usize) -> Self {
        Self {
            number: 1,
            dimension,
            embedder: embedder.into(),
        }
    }

    pub fn next(&self, embedder: impl Into<String>, dimension: usize) -> Self {
        Self {
            number: self.number + 1,
            dimension,
            embedder: embedder.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt(response: &str) -> MemoryEventDraft {
        let mut draft = MemoryEventDraft::stage_attempt(Uuid::nil(), "strategist", 1);
        draft.prompt = Some("where should I drive".to_string());
        draft.response = Some(response.to_string());
        draft.success = true;
        draft
    }

    #[test]
    fn test_fingerprint_ignores_timing() {
        let a = attempt("head to the airport");
        let mut b = a.clone();
        b.recorded_at = a.recorded_at + chrono::Duration::seconds(30);
        b.latency_ms = 999;

        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_fingerprint_distinguishes_content_and_attempt() {
        let a = attempt("head to the airport");
        let b = attempt("stay downtown");
        assert_ne!(a.fingerprint(), b.fingerprint());

        let mut retry = a.clone();
        retry.attempt = Some(2);
        assert_ne!(a.fingerprint(), retry.fingerprint());
    }

    #[test]
    fn test_fingerprint_field_boundaries() {
        assert_ne!(Fingerprint::of(["ab", "c"]), Fingerprint::of(["a", "bc"]));
        assert_eq!(Fingerprint::of(["x"]).as_str().len(), 64);
    }

    #[test]
    fn test_embedding_text_falls_back_to_payload() {
        let mut draft = MemoryEventDraft::consolidated(Uuid::nil());
        draft.payload = serde_json::json!({"status": "partial"});
        assert!(draft.embedding_text().contains("partial"));
    }
}
