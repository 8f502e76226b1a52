// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Provider
//!
//! Per-provider parameter quirks. Some models accept a sampling temperature,
//! some only accept a discrete reasoning-effort level, and some accept either
//! but never both in one request. [`ParameterSet`] makes "both" impossible to
//! represent, and [`ParameterSet::select`] is the single place where a stage's
//! configured options are checked against what the target model accepts.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Parameter legality and per-stage call specifications

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use super::strategy::Stage;

/// Closed set of upstream API dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    Anthropic,
    #[serde(rename = "openai")]
    OpenAI,
    Gemini,
    #[serde(rename = "openai-compatible")]
    OpenAICompatible,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::OpenAI => "openai",
            ProviderKind::Gemini => "gemini",
            ProviderKind::OpenAICompatible => "openai-compatible",
        }
    }

    /// Whether calls to this provider must carry an API key.
    pub fn requires_api_key(&self) -> bool {
        !matches!(self, ProviderKind::OpenAICompatible)
    }

    /// Which parameter family `model` accepts on this provider.
    pub fn parameter_support(&self, model: &str) -> ParameterSupport {
        let model = model.to_ascii_lowercase();
        match self {
            ProviderKind::OpenAI | ProviderKind::OpenAICompatible => {
                if ["o1", "o3", "o4", "gpt-5"]
                    .iter()
                    .any(|prefix| model.starts_with(prefix))
                {
                    ParameterSupport::ReasoningOnly
                } else {
                    ParameterSupport::SamplingOnly {
                        max_temperature: 2.0,
                    }
                }
            }
            ProviderKind::Anthropic => {
                let thinking = [
                    "claude-3-7",
                    "claude-sonnet-4",
                    "claude-opus-4",
                    "claude-haiku-4",
                    "claude-4",
                ]
                .iter()
                .any(|prefix| model.starts_with(prefix));
                if thinking {
                    ParameterSupport::Either {
                        max_temperature: 1.0,
                    }
                } else {
                    ParameterSupport::SamplingOnly {
                        max_temperature: 1.0,
                    }
                }
            }
            ProviderKind::Gemini => {
                if model.starts_with("gemini-2.5") || model.starts_with("gemini-3") {
                    ParameterSupport::Either {
                        max_temperature: 2.0,
                    }
                } else {
                    ParameterSupport::SamplingOnly {
                        max_temperature: 2.0,
                    }
                }
            }
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "anthropic" => Ok(ProviderKind::Anthropic),
            "openai" => Ok(ProviderKind::OpenAI),
            "gemini" => Ok(ProviderKind::Gemini),
            "openai-compatible" => Ok(ProviderKind::OpenAICompatible),
            other => Err(ConfigurationError::UnknownProviderType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
}

impl ReasoningEffort {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasoningEffort::Low => "low",
            ReasoningEffort::Medium => "medium",
            ReasoningEffort::High => "high",
        }
    }

    /// Extended-thinking token budget for providers that take a budget
    /// instead of a level.
    pub fn thinking_budget(&self) -> u32 {
        match self {
            ReasoningEffort::Low => 2048,
            ReasoningEffort::Medium => 8192,
            ReasoningEffort::High => 16384,
        }
    }
}

/// Smallest extended-thinking budget Anthropic accepts.
pub const ANTHROPIC_MIN_THINKING_BUDGET: u32 = 1024;

/// What a model accepts. `Either` still means one family per request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParameterSupport {
    SamplingOnly { max_temperature: f32 },
    ReasoningOnly,
    Either { max_temperature: f32 },
}

impl ParameterSupport {
    fn max_temperature(&self) -> Option<f32> {
        match self {
            ParameterSupport::SamplingOnly { max_temperature }
            | ParameterSupport::Either { max_temperature } => Some(*max_temperature),
            ParameterSupport::ReasoningOnly => None,
        }
    }

    fn accepts_reasoning(&self) -> bool {
        !matches!(self, ParameterSupport::SamplingOnly { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ParameterSet {
    Sampling { temperature: f32 },
    Reasoning { effort: ReasoningEffort },
}

impl ParameterSet {
    /// Pick the parameter family for `model` from a stage's configured options.
    ///
    /// Both options set is a conflict regardless of provider. Neither set falls
    /// back to the model's native family (temperature 0.7 or medium effort).
    pub fn select(
        kind: ProviderKind,
        model: &str,
        temperature: Option<f32>,
        effort: Option<ReasoningEffort>,
    ) -> Result<Self, ConfigurationError> {
        let support = kind.parameter_support(model);

        match (temperature, effort) {
            (Some(_), Some(_)) => Err(ConfigurationError::ConflictingParameters {
                provider: kind,
                model: model.to_string(),
            }),
            (Some(t), None) => {
                let set = ParameterSet::Sampling { temperature: t };
                set.check(kind, model)?;
                Ok(set)
            }
            (None, Some(effort)) => {
                let set = ParameterSet::Reasoning { effort };
                set.check(kind, model)?;
                Ok(set)
            }
            (None, None) => Ok(match support {
                ParameterSupport::ReasoningOnly => ParameterSet::Reasoning {
                    effort: ReasoningEffort::Medium,
                },
                _ => ParameterSet::Sampling { temperature: 0.7 },
            }),
        }
    }

    /// Verify `max_tokens` leaves room for the thinking budget this set
    /// implies on `kind`.
    pub fn check_max_tokens(&self, kind: ProviderKind, max_tokens: u32) -> Result<(), ConfigurationError> {
        match (self, kind) {
            (ParameterSet::Reasoning { .. }, ProviderKind::Anthropic)
                if max_tokens <= ANTHROPIC_MIN_THINKING_BUDGET =>
            {
                Err(ConfigurationError::ThinkingBudgetTooLarge {
                    max_tokens,
                    budget: ANTHROPIC_MIN_THINKING_BUDGET,
                })
            }
            _ => Ok(()),
        }
    }

    /// Verify this set is legal for `model` on `kind`.
    pub fn check(&self, kind: ProviderKind, model: &str) -> Result<(), ConfigurationError> {
        let support = kind.parameter_support(model);
        match self {
            ParameterSet::Sampling { temperature } => {
                let max = support.max_temperature().ok_or_else(|| {
                    ConfigurationError::UnsupportedParameter {
                        parameter: "temperature",
                        provider: kind,
                        model: model.to_string(),
                    }
                })?;
                if !temperature.is_finite() || *temperature < 0.0 || *temperature > max {
                    return Err(ConfigurationError::TemperatureOutOfRange {
                        value: *temperature,
                        max,
                        provider: kind,
                    });
                }
                Ok(())
            }
            ParameterSet::Reasoning { .. } => {
                if support.accepts_reasoning() {
                    Ok(())
                } else {
                    Err(ConfigurationError::UnsupportedParameter {
                        parameter: "reasoning_effort",
                        provider: kind,
                        model: model.to_string(),
                    })
                }
            }
        }
    }

    pub fn temperature(&self) -> Option<f32> {
        match self {
            ParameterSet::Sampling { temperature } => Some(*temperature),
            ParameterSet::Reasoning { .. } => None,
        }
    }

    pub fn effort(&self) -> Option<ReasoningEffort> {
        match self {
            ParameterSet::Reasoning { effort } => Some(*effort),
            ParameterSet::Sampling { .. } => None,
        }
    }
}

/// Validated, immutable call configuration for one stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderCallSpec {
    pub stage: Stage,
    /// Name of the provider pool in configuration.
    pub provider: String,
    pub kind: ProviderKind,
    pub model: String,
    pub parameters: ParameterSet,
    pub max_tokens: u32,
    pub max_attempts: u32,
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    pub stream: bool,
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

/// A defect in static configuration. Never retried.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigurationError {
    #[error("{provider} model '{model}' cannot take temperature and reasoning_effort together")]
    ConflictingParameters { provider: ProviderKind, model: String },

    #[error("{provider} model '{model}' does not support parameter '{parameter}'")]
    UnsupportedParameter {
        parameter: &'static str,
        provider: ProviderKind,
        model: String,
    },

    #[error("temperature {value} outside legal range 0..={max} for {provider}")]
    TemperatureOutOfRange {
        value: f32,
        max: f32,
        provider: ProviderKind,
    },

    #[error("max_tokens {max_tokens} leaves no room for a {budget}-token thinking budget")]
    ThinkingBudgetTooLarge { max_tokens: u32, budget: u32 },

    #[error("missing credential for provider '{provider}': {detail}")]
    MissingCredential { provider: String, detail: String },

    #[error("unknown provider '{0}'")]
    UnknownProvider(String),

    #[error("unknown provider type '{0}'")]
    UnknownProviderType(String),

    #[error("failed to initialise provider '{provider}': {detail}")]
    ProviderInit { provider: String, detail: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reasoning_models_reject_temperature() {
        let err = ParameterSet::select(ProviderKind::OpenAI, "gpt-5", Some(0.3), None).unwrap_err();
        assert!(matches!(
            err,
            ConfigurationError::UnsupportedParameter {
                parameter: "temperature",
                ..
            }
        ));

        let ok = ParameterSet::select(ProviderKind::OpenAI, "o3-mini", None, Some(ReasoningEffort::High))
            .unwrap();
        assert_eq!(ok.effort(), Some(ReasoningEffort::High));
    }

    #[test]
    fn test_both_parameters_conflict() {
        let err = ParameterSet::select(
            ProviderKind::Anthropic,
            "claude-sonnet-4-5",
            Some(0.5),
            Some(ReasoningEffort::Low),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigurationError::ConflictingParameters { .. }));
    }

    #[test]
    fn test_thinking_budget_needs_room_on_anthropic_only() {
        let reasoning = ParameterSet::Reasoning {
            effort: ReasoningEffort::Low,
        };
        assert!(matches!(
            reasoning.check_max_tokens(ProviderKind::Anthropic, 1024),
            Err(ConfigurationError::ThinkingBudgetTooLarge { .. })
        ));
        assert!(reasoning.check_max_tokens(ProviderKind::Anthropic, 1025).is_ok());
        assert!(reasoning.check_max_tokens(ProviderKind::Gemini, 100).is_ok());

        let sampling = ParameterSet::Sampling { temperature: 0.5 };
        assert!(sampling.check_max_tokens(ProviderKind::Anthropic, 100).is_ok());
    }

    #[test]
    fn test_temperature_ranges_per_provider() {
        assert!(ParameterSet::select(ProviderKind::Anthropic, "claude-3-5-haiku", Some(1.5), None).is_err());
        assert!(ParameterSet::select(ProviderKind::Gemini, "gemini-2.5-pro", Some(1.5), None).is_ok());
        assert!(ParameterSet::select(ProviderKind::OpenAI, "gpt-4o", Some(-0.1), None).is_err());
        assert!(ParameterSet::select(ProviderKind::OpenAI, "gpt-4o", Some(f32::NAN), None).is_err());
    }

    #[test]
    fn test_sampling_only_model_rejects_effort() {
        let err = ParameterSet::select(ProviderKind::OpenAI, "gpt-4o", None, Some(ReasoningEffort::Low))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigurationError::UnsupportedParameter {
                parameter: "reasoning_effort",
                ..
            }
        ));
    }

    #[test]
    fn test_defaults_follow_model_family() {
        assert_eq!(
            ParameterSet::select(ProviderKind::OpenAI, "gpt-5", None, None).unwrap(),
            ParameterSet::Reasoning {
                effort: ReasoningEffort::Medium
            }
        );
        assert_eq!(
            ParameterSet::select(ProviderKind::Gemini, "gemini-2.0-flash", None, None).unwrap(),
            ParameterSet::Sampling { temperature: 0.7 }
        );
    }

    #[test]
    fn test_provider_kind_parsing() {
        assert_eq!("openai-compatible".parse::<ProviderKind>().unwrap(), ProviderKind::OpenAICompatible);
        assert!("ollama".parse::<ProviderKind>().is_err());
        let yaml: ProviderKind = serde_yaml::from_str("openai").unwrap();
        assert_eq!(yaml, ProviderKind::OpenAI);
    }
}
