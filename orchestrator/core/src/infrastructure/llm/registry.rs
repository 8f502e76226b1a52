// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// LLM Adapter Registry - Provider Pools and Stage Bindings
//
// Builds one connection pool and adapter per configured provider, then binds
// each pipeline stage to its provider with a validated ProviderCallSpec.
//
// A stage whose configuration is illegal (conflicting parameters, unsupported
// parameter, missing credential) still gets a binding. The binding holds the
// ConfigurationError and every call through it fails fatally before any
// network I/O, so the defect surfaces on the stage that owns it.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info};

use super::anthropic::AnthropicAdapter;
use super::gemini::GeminiAdapter;
use super::openai::OpenAIAdapter;
use super::transport::ProviderPool;
use crate::domain::llm::{ChunkSink, GenerationRequest, GenerationResponse, LLMError, LLMProvider};
use crate::domain::node_config::{resolve_secret, ProviderConfig, TriadConfigManifest};
use crate::domain::provider::{ConfigurationError, ParameterSet, ProviderCallSpec, ProviderKind};
use crate::domain::strategy::Stage;

/// A live adapter plus the pool it draws connections from.
#[derive(Clone)]
pub struct ProviderHandle {
    pub kind: ProviderKind,
    pub pool: Arc<ProviderPool>,
    pub adapter: Arc<dyn LLMProvider>,
}

#[derive(Clone)]
struct BoundTarget {
    spec: ProviderCallSpec,
    handle: ProviderHandle,
}

/// One stage's route to a provider.
#[derive(Clone)]
pub struct StageBinding {
    stage: Stage,
    provider: String,
    model: String,
    system_prompt: Option<String>,
    target: Result<BoundTarget, ConfigurationError>,
}

impl StageBinding {
    pub fn new(spec: ProviderCallSpec, handle: ProviderHandle) -> Self {
        Self {
            stage: spec.stage,
            provider: spec.provider.clone(),
            model: spec.model.clone(),
            system_prompt: None,
            target: Ok(BoundTarget { spec, handle }),
        }
    }

    pub fn misconfigured(
        stage: Stage,
        provider: impl Into<String>,
        model: impl Into<String>,
        error: ConfigurationError,
    ) -> Self {
        Self {
            stage,
            provider: provider.into(),
            model: model.into(),
            system_prompt: None,
            target: Err(error),
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: Option<String>) -> Self {
        self.system_prompt = system_prompt;
        self
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Operator-supplied system prompt overriding the built-in one.
    pub fn system_prompt(&self) -> Option<&str> {
        self.system_prompt.as_deref()
    }

    pub fn spec(&self) -> Result<&ProviderCallSpec, &ConfigurationError> {
        self.target.as_ref().map(|t| &t.spec)
    }

    pub fn configuration_error(&self) -> Option<&ConfigurationError> {
        self.target.as_ref().err()
    }

    /// Attempt ceiling; a misconfigured binding is tried exactly once.
    pub fn max_attempts(&self) -> u32 {
        self.target
            .as_ref()
            .map(|t| t.spec.max_attempts.max(1))
            .unwrap_or(1)
    }

    /// One attempt, bounded by the stage timeout.
    ///
    /// On timeout the provider's pooled connections are discarded so the next
    /// attempt does not inherit a wedged connection.
    pub async fn call(
        &self,
        system: Option<String>,
        prompt: String,
        on_chunk: Option<&ChunkSink<'_>>,
    ) -> Result<GenerationResponse, LLMError> {
        let target = self
            .target
            .as_ref()
            .map_err(|e| LLMError::Configuration(e.clone()))?;

        let request = GenerationRequest::for_spec(&target.spec, system, prompt);
        let timeout = target.spec.timeout;

        match tokio::time::timeout(timeout, target.handle.adapter.generate(&request, on_chunk)).await
        {
            Ok(Err(LLMError::Timeout(elapsed))) if elapsed.is_zero() => {
                Err(LLMError::Timeout(timeout))
            }
            Ok(result) => result,
            Err(_) => {
                target.handle.pool.reset();
                Err(LLMError::Timeout(timeout))
            }
        }
    }
}

/// Bindings for the three stages.
#[derive(Clone)]
pub struct StageBindings {
    pub strategist: StageBinding,
    pub briefer: StageBinding,
    pub consolidator: StageBinding,
}

impl StageBindings {
    pub fn get(&self, stage: Stage) -> &StageBinding {
        match stage {
            Stage::Strategist => &self.strategist,
            Stage::Briefer => &self.briefer,
            Stage::Consolidator => &self.consolidator,
        }
    }
}

/// Registry of provider adapters and stage bindings
pub struct AdapterRegistry {
    providers: HashMap<String, Result<ProviderHandle, ConfigurationError>>,
    bindings: StageBindings,
}

impl AdapterRegistry {
    /// Build every provider pool and bind the stages.
    ///
    /// Only structural problems fail here (see `TriadConfigManifest::validate`).
    /// Per-provider and per-stage defects are logged and kept on the binding.
    pub fn from_config(config: &TriadConfigManifest) -> anyhow::Result<Self> {
        config.validate()?;
        info!("Initializing LLM adapter registry");

        let mut providers = HashMap::new();
        for provider_config in &config.spec.providers {
            let handle = Self::create_provider(provider_config);
            match &handle {
                Ok(h) => info!(
                    provider = %provider_config.name,
                    kind = %h.kind,
                    max_concurrent = h.pool.max_concurrent(),
                    "Provider initialized"
                ),
                Err(e) => error!(provider = %provider_config.name, error = %e, "Provider unavailable"),
            }
            providers.insert(provider_config.name.clone(), handle);
        }

        let bind = |stage: Stage| {
            let binding = Self::bind_stage(config, &providers, stage);
            match binding.configuration_error() {
                Some(e) => error!(
                    stage = %stage,
                    provider = %binding.provider(),
                    model = %binding.model(),
                    error = %e,
                    "Stage is misconfigured; calls will fail without retry"
                ),
                None => info!(
                    stage = %stage,
                    provider = %binding.provider(),
                    model = %binding.model(),
                    "Stage bound"
                ),
            }
            binding
        };

        let bindings = StageBindings {
            strategist: bind(Stage::Strategist),
            briefer: bind(Stage::Briefer),
            consolidator: bind(Stage::Consolidator),
        };

        Ok(Self {
            providers,
            bindings,
        })
    }

    /// Assemble a registry from prebuilt parts.
    pub fn from_parts(providers: HashMap<String, ProviderHandle>, bindings: StageBindings) -> Self {
        Self {
            providers: providers.into_iter().map(|(k, v)| (k, Ok(v))).collect(),
            bindings,
        }
    }

    fn create_provider(config: &ProviderConfig) -> Result<ProviderHandle, ConfigurationError> {
        let kind = config.provider_type;
        let endpoint = config
            .endpoint()
            .ok_or_else(|| ConfigurationError::ProviderInit {
                provider: config.name.clone(),
                detail: "endpoint is required".to_string(),
            })?;

        let api_key = resolve_secret(&config.api_key).map_err(|detail| {
            ConfigurationError::MissingCredential {
                provider: config.name.clone(),
                detail,
            }
        })?;
        let required_key = || {
            api_key.clone().ok_or_else(|| ConfigurationError::MissingCredential {
                provider: config.name.clone(),
                detail: "api_key is not configured".to_string(),
            })
        };

        let pool = Arc::new(ProviderPool::new(&config.name, config.max_concurrent_calls)?);
        let adapter: Arc<dyn LLMProvider> = match kind {
            ProviderKind::Anthropic => {
                Arc::new(AnthropicAdapter::new(pool.clone(), endpoint, required_key()?))
            }
            ProviderKind::Gemini => {
                Arc::new(GeminiAdapter::new(pool.clone(), endpoint, required_key()?))
            }
            ProviderKind::OpenAI => Arc::new(OpenAIAdapter::new(
                pool.clone(),
                endpoint,
                Some(required_key()?),
                kind,
            )),
            ProviderKind::OpenAICompatible => {
                Arc::new(OpenAIAdapter::new(pool.clone(), endpoint, api_key.clone(), kind))
            }
        };

        Ok(ProviderHandle {
            kind,
            pool,
            adapter,
        })
    }

    fn bind_stage(
        config: &TriadConfigManifest,
        providers: &HashMap<String, Result<ProviderHandle, ConfigurationError>>,
        stage: Stage,
    ) -> StageBinding {
        let stage_config = config.spec.stages.get(stage);

        let target = providers
            .get(&stage_config.provider)
            .ok_or_else(|| ConfigurationError::UnknownProvider(stage_config.provider.clone()))
            .and_then(|handle| handle.clone())
            .and_then(|handle| {
                let parameters = ParameterSet::select(
                    handle.kind,
                    &stage_config.model,
                    stage_config.temperature,
                    stage_config.reasoning_effort,
                )?;
                parameters.check_max_tokens(handle.kind, stage_config.max_tokens)?;
                let spec = ProviderCallSpec {
                    stage,
                    provider: stage_config.provider.clone(),
                    kind: handle.kind,
                    model: stage_config.model.clone(),
                    parameters,
                    max_tokens: stage_config.max_tokens,
                    max_attempts: stage_config.max_attempts,
                    timeout: stage_config.timeout(stage),
                    stream: stage_config.stream,
                };
                Ok(StageBinding::new(spec, handle))
            });

        let binding = match target {
            Ok(binding) => binding,
            Err(e) => StageBinding::misconfigured(
                stage,
                stage_config.provider.clone(),
                stage_config.model.clone(),
                e,
            ),
        };
        binding.with_system_prompt(stage_config.system_prompt.clone())
    }

    pub fn bindings(&self) -> &StageBindings {
        &self.bindings
    }

    pub fn binding(&self, stage: Stage) -> &StageBinding {
        self.bindings.get(stage)
    }

    /// Provider names in sorted order.
    pub fn provider_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Probe every provider. Misconfigured providers report their defect.
    pub async fn health_check_all(&self) -> Vec<(String, Result<(), LLMError>)> {
        let mut results = Vec::with_capacity(self.providers.len());
        for name in self.provider_names() {
            let result = match self.providers.get(&name) {
                Some(Ok(handle)) => handle.adapter.health_check().await,
                Some(Err(e)) => Err(LLMError::Configuration(e.clone())),
                None => continue,
            };
            results.push((name, result));
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::llm::{FinishReason, TokenUsage};
    use crate::domain::node_config::TriadConfigManifest;
    use crate::domain::provider::ReasoningEffort;
    use async_trait::async_trait;
    use std::time::Duration;

    struct SlowProvider;

    #[async_trait]
    impl LLMProvider for SlowProvider {
        fn kind(&self) -> ProviderKind {
            ProviderKind::OpenAI
        }

        async fn generate(
            &self,
            request: &GenerationRequest,
            _on_chunk: Option<&ChunkSink<'_>>,
        ) -> Result<GenerationResponse, LLMError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(GenerationResponse {
                text: String::new(),
                usage: TokenUsage::default(),
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

    fn manifest_with_keys() -> TriadConfigManifest {
        let mut config = TriadConfigManifest::default();
        for provider in &mut config.spec.providers {
            provider.api_key = Some(format!("literal-{}", provider.name));
        }
        config
    }

    #[test]
    fn test_default_config_binds_every_stage() {
        let registry = AdapterRegistry::from_config(&manifest_with_keys()).unwrap();
        for stage in Stage::ALL {
            let binding = registry.binding(stage);
            assert!(binding.configuration_error().is_none(), "{stage} should bind");
        }
        let consolidator = registry.binding(Stage::Consolidator).spec().unwrap();
        assert_eq!(
            consolidator.parameters,
            ParameterSet::Reasoning {
                effort: ReasoningEffort::High
            }
        );
        assert_eq!(registry.provider_names(), vec!["anthropic", "gemini", "openai"]);
    }

    #[tokio::test]
    async fn test_conflicting_parameters_fail_on_call() {
        let mut config = manifest_with_keys();
        config.spec.stages.consolidator.temperature = Some(0.2);

        let registry = AdapterRegistry::from_config(&config).unwrap();
        let binding = registry.binding(Stage::Consolidator);
        assert!(matches!(
            binding.configuration_error(),
            Some(ConfigurationError::ConflictingParameters { .. })
        ));
        assert_eq!(binding.max_attempts(), 1);
        assert_eq!(binding.model(), "gpt-5");

        let err = binding.call(None, "prompt".into(), None).await.unwrap_err();
        assert!(matches!(err, LLMError::Configuration(_)));
        assert!(!err.is_retryable());

        // Other stages are unaffected.
        assert!(registry.binding(Stage::Strategist).configuration_error().is_none());
    }

    #[tokio::test]
    async fn test_thinking_budget_is_checked_at_bind_time() {
        let mut config = manifest_with_keys();
        config.spec.stages.strategist.temperature = None;
        config.spec.stages.strategist.reasoning_effort = Some(ReasoningEffort::Low);
        config.spec.stages.strategist.max_tokens = 1000;

        let registry = AdapterRegistry::from_config(&config).unwrap();
        let binding = registry.binding(Stage::Strategist);
        assert!(matches!(
            binding.configuration_error(),
            Some(ConfigurationError::ThinkingBudgetTooLarge {
                max_tokens: 1000,
                budget: 1024
            })
        ));
        assert_eq!(binding.max_attempts(), 1);

        // Fails before any adapter is reached, so no endpoint is contacted.
        let err = binding.call(None, "prompt".into(), None).await.unwrap_err();
        assert!(matches!(err, LLMError::Configuration(_)));

        config.spec.stages.strategist.max_tokens = 4096;
        let registry = AdapterRegistry::from_config(&config).unwrap();
        assert!(registry.binding(Stage::Strategist).configuration_error().is_none());
    }

    #[test]
    fn test_unsupported_parameter_is_rejected_at_bind_time() {
        let mut config = manifest_with_keys();
        config.spec.stages.consolidator.reasoning_effort = None;
        config.spec.stages.consolidator.temperature = Some(0.5);
        config.spec.stages.briefer.model = "gemini-1.5-flash".into();
        config.spec.stages.briefer.temperature = None;
        config.spec.stages.briefer.reasoning_effort = Some(ReasoningEffort::High);

        let registry = AdapterRegistry::from_config(&config).unwrap();
        for stage in [Stage::Consolidator, Stage::Briefer] {
            assert!(matches!(
                registry.binding(stage).configuration_error(),
                Some(ConfigurationError::UnsupportedParameter { .. })
            ));
        }
    }

    #[test]
    fn test_missing_credential_is_kept_on_binding() {
        let mut config = manifest_with_keys();
        let anthropic = config
            .spec
            .providers
            .iter_mut()
            .find(|p| p.name == "anthropic")
            .unwrap();
        anthropic.api_key = Some("env:TRIAD_TEST_SURELY_UNSET_KEY".into());

        let registry = AdapterRegistry::from_config(&config).unwrap();
        assert!(matches!(
            registry.binding(Stage::Strategist).configuration_error(),
            Some(ConfigurationError::MissingCredential { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_times_out_per_attempt() {
        let pool = Arc::new(ProviderPool::new("slow", 1).unwrap());
        let spec = ProviderCallSpec {
            stage: Stage::Briefer,
            provider: "slow".into(),
            kind: ProviderKind::OpenAI,
            model: "gpt-4o".into(),
            parameters: ParameterSet::Sampling { temperature: 0.2 },
            max_tokens: 128,
            max_attempts: 3,
            timeout: Duration::from_secs(45),
            stream: false,
        };
        let binding = StageBinding::new(
            spec,
            ProviderHandle {
                kind: ProviderKind::OpenAI,
                pool,
                adapter: Arc::new(SlowProvider),
            },
        );

        let err = binding.call(None, "p".into(), None).await.unwrap_err();
        assert!(matches!(err, LLMError::Timeout(d) if d == Duration::from_secs(45)));
        assert!(err.is_retryable());
    }
}
