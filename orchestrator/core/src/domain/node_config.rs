// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Triad Configuration Types
//
// Defines the configuration schema for a Triad daemon:
// - Kubernetes-style manifest format (apiVersion/kind/metadata/spec)
// - Provider pools (one per upstream API, with a concurrency ceiling)
// - Per-stage call configuration (strategist / briefer / consolidator)
// - Retry, capture, index and storage settings
// - Network and observability settings
//
// Parameter legality (temperature vs reasoning_effort) is deliberately NOT
// checked here. It is checked when stages are bound to adapters so a bad stage
// fails at call time naming itself, while the rest of the daemon still runs.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::provider::{ProviderKind, ReasoningEffort};
use super::strategy::Stage;

pub const API_VERSION: &str = "triad/v1";
pub const KIND: &str = "TriadConfig";

/// Top-level Kubernetes-style configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriadConfigManifest {
    /// API version (must be "triad/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "TriadConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    pub spec: TriadConfigSpec,
}

/// Manifest metadata (Kubernetes-style)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriadConfigSpec {
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,

    pub stages: StagesConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub capture: CaptureConfig,

    #[serde(default)]
    pub index: IndexConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Unique pool name referenced by stages (e.g., "anthropic", "openai-prod")
    pub name: String,

    #[serde(rename = "type")]
    pub provider_type: ProviderKind,

    /// API base URL. Defaults to the vendor's public endpoint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// API key (supports "env:VAR_NAME" for environment variables)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Ceiling on in-flight calls through this pool across all requests
    #[serde(default = "default_max_concurrent_calls")]
    pub max_concurrent_calls: usize,
}

impl ProviderConfig {
    pub fn endpoint(&self) -> Option<String> {
        self.endpoint.clone().or_else(|| {
            match self.provider_type {
                ProviderKind::Anthropic => Some("https://api.anthropic.com"),
                ProviderKind::OpenAI => Some("https://api.openai.com/v1"),
                ProviderKind::Gemini => Some("https://generativelanguage.googleapis.com/v1beta"),
                ProviderKind::OpenAICompatible => None,
            }
            .map(str::to_string)
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagesConfig {
    pub strategist: StageConfig,
    pub briefer: StageConfig,
    pub consolidator: StageConfig,
}

impl StagesConfig {
    pub fn get(&self, stage: Stage) -> &StageConfig {
        match stage {
            Stage::Strategist => &self.strategist,
            Stage::Briefer => &self.briefer,
            Stage::Consolidator => &self.consolidator,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    /// Name of a configured provider pool
    pub provider: String,

    pub model: String,

    /// Sampling temperature. Mutually exclusive with reasoning_effort.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<ReasoningEffort>,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Per-attempt timeout. Defaults depend on the stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    #[serde(default)]
    pub stream: bool,

    /// Overrides the built-in system prompt for this stage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

impl StageConfig {
    pub fn timeout(&self, stage: Stage) -> Duration {
        Duration::from_millis(self.timeout_ms.unwrap_or_else(|| default_timeout_ms(stage)))
    }
}

pub fn default_timeout_ms(stage: Stage) -> u64 {
    match stage {
        Stage::Strategist => 60_000,
        Stage::Briefer => 45_000,
        Stage::Consolidator => 90_000,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Bounded queue between the pipeline and the capture worker
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Items parked when the queue is full; past this, records are dropped
    #[serde(default = "default_overflow_capacity")]
    pub overflow_capacity: usize,

    /// Concurrent index operations in the capture worker
    #[serde(default = "default_index_concurrency")]
    pub index_concurrency: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            queue_capacity: default_queue_capacity(),
            overflow_capacity: default_overflow_capacity(),
            index_concurrency: default_index_concurrency(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbedderKind {
    Hashing,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    #[serde(default = "default_embedder")]
    pub embedder: EmbedderKind,

    #[serde(default = "default_dimension")]
    pub dimension: usize,

    /// Embeddings API base (http embedder only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            embedder: default_embedder(),
            dimension: default_dimension(),
            endpoint: None,
            model: None,
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageBackendKind {
    InMemory,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_backend")]
    pub backend: StorageBackendKind,

    /// PostgreSQL connection string (supports "env:VAR_NAME")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_string: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            connection_string: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Network bind address (e.g. "0.0.0.0" or "127.0.0.1")
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// HTTP API port
    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_api_port(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (e.g., "info", "debug", "trace")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format ("json" or "text")
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable Prometheus exposition
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_max_concurrent_calls() -> usize {
    8
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> u64 {
    500
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay() -> u64 {
    8000
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_overflow_capacity() -> usize {
    4096
}

fn default_index_concurrency() -> usize {
    4
}

fn default_embedder() -> EmbedderKind {
    EmbedderKind::Hashing
}

fn default_dimension() -> usize {
    384
}

fn default_storage_backend() -> StorageBackendKind {
    StorageBackendKind::InMemory
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8000
}

impl Default for TriadConfigSpec {
    fn default() -> Self {
        let provider = |name: &str, kind: ProviderKind, env: &str| ProviderConfig {
            name: name.to_string(),
            provider_type: kind,
            endpoint: None,
            api_key: Some(format!("env:{env}")),
            max_concurrent_calls: default_max_concurrent_calls(),
        };
        let stage = |provider: &str, model: &str| StageConfig {
            provider: provider.to_string(),
            model: model.to_string(),
            temperature: None,
            reasoning_effort: None,
            max_tokens: default_max_tokens(),
            max_attempts: default_max_attempts(),
            timeout_ms: None,
            stream: false,
            system_prompt: None,
        };

        Self {
            providers: vec![
                provider("anthropic", ProviderKind::Anthropic, "ANTHROPIC_API_KEY"),
                provider("gemini", ProviderKind::Gemini, "GEMINI_API_KEY"),
                provider("openai", ProviderKind::OpenAI, "OPENAI_API_KEY"),
            ],
            stages: StagesConfig {
                strategist: StageConfig {
                    temperature: Some(0.7),
                    stream: true,
                    ..stage("anthropic", "claude-sonnet-4-5")
                },
                briefer: StageConfig {
                    temperature: Some(0.4),
                    ..stage("gemini", "gemini-2.5-pro")
                },
                consolidator: StageConfig {
                    reasoning_effort: Some(ReasoningEffort::High),
                    max_tokens: 16_000,
                    stream: true,
                    ..stage("openai", "gpt-5")
                },
            },
            retry: RetryConfig::default(),
            capture: CaptureConfig::default(),
            index: IndexConfig::default(),
            storage: StorageConfig::default(),
            network: NetworkConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl Default for TriadConfigManifest {
    fn default() -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "triad-node".to_string());

        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: hostname,
                version: Some("1.0.0".to_string()),
                labels: None,
            },
            spec: TriadConfigSpec::default(),
        }
    }
}

/// Resolve a secret that may be given as "env:VAR_NAME".
pub fn resolve_secret(value: &Option<String>) -> Result<Option<String>, String> {
    match value {
        Some(v) => match v.strip_prefix("env:") {
            Some(var_name) => std::env::var(var_name)
                .map(Some)
                .map_err(|_| format!("Environment variable not set: {var_name}")),
            None => Ok(Some(v.clone())),
        },
        None => Ok(None),
    }
}

impl TriadConfigManifest {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to YAML file
    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Parse configuration from YAML string
    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. TRIAD_CONFIG_PATH environment variable
    /// 2. ./triad-config.yaml (working directory)
    /// 3. ~/.triad/config.yaml (user home)
    /// 4. /etc/triad/config.yaml (system, Unix) or C:\ProgramData\Triad\config.yaml (Windows)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("TRIAD_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./triad-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".triad").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        #[cfg(unix)]
        let system_config = PathBuf::from("/etc/triad/config.yaml");
        #[cfg(windows)]
        let system_config = PathBuf::from("C:\\ProgramData\\Triad\\config.yaml");

        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        // Explicit CLI path (fail if missing/invalid)
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path).map_err(|e| {
                anyhow::anyhow!("Failed to load config at {:?}: {}", path, e)
            })?;
            config.apply_env_overrides();
            return Ok(config);
        }

        if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            let mut config = Self::from_yaml_file(config_path)?;
            config.apply_env_overrides();
            Ok(config)
        } else {
            tracing::warn!("No configuration file found in standard locations. Using defaults.");
            let mut config = Self::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Apply environment variable overrides to configuration
    /// This allows container deployments to override config via env vars
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("TRIAD_PORT") {
            match val.parse::<u16>() {
                Ok(port) => {
                    tracing::info!("Environment override: TRIAD_PORT={}", port);
                    self.spec.network.port = port;
                }
                Err(_) => {
                    tracing::warn!("Invalid value for TRIAD_PORT: '{}'. Ignoring.", val);
                }
            }
        }

        if let Ok(level) = std::env::var("TRIAD_LOG_LEVEL") {
            if !level.trim().is_empty() {
                tracing::info!("Environment override: TRIAD_LOG_LEVEL={}", level);
                self.spec.observability.logging.level = level;
            }
        }
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.spec.providers.iter().find(|p| p.name == name)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!(
                "Invalid apiVersion: '{}'. Must be '{}'",
                self.api_version,
                API_VERSION
            );
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        let mut names = HashSet::new();
        for provider in &self.spec.providers {
            if provider.name.is_empty() {
                anyhow::bail!("Provider name cannot be empty");
            }
            if !names.insert(provider.name.as_str()) {
                anyhow::bail!("Duplicate provider name: {}", provider.name);
            }
            if provider.endpoint().is_none() {
                anyhow::bail!("Provider endpoint is required for: {}", provider.name);
            }
            if provider.max_concurrent_calls == 0 {
                anyhow::bail!("max_concurrent_calls must be > 0 for: {}", provider.name);
            }
        }

        for stage in Stage::ALL {
            let config = self.spec.stages.get(stage);
            if !names.contains(config.provider.as_str()) {
                anyhow::bail!(
                    "Stage '{}' references unknown provider '{}'",
                    stage,
                    config.provider
                );
            }
            if config.model.is_empty() {
                anyhow::bail!("Stage '{}' has an empty model", stage);
            }
            if config.max_attempts == 0 {
                anyhow::bail!("Stage '{}' max_attempts must be > 0", stage);
            }
            if config.timeout_ms == Some(0) {
                anyhow::bail!("Stage '{}' timeout_ms must be > 0", stage);
            }
            if config.max_tokens == 0 {
                anyhow::bail!("Stage '{}' max_tokens must be > 0", stage);
            }
        }

        let retry = &self.spec.retry;
        if retry.multiplier < 1.0 || !retry.multiplier.is_finite() {
            anyhow::bail!("retry.multiplier must be >= 1.0");
        }
        if retry.max_delay_ms < retry.initial_delay_ms {
            anyhow::bail!("retry.max_delay_ms must be >= retry.initial_delay_ms");
        }

        if self.spec.capture.queue_capacity == 0 || self.spec.capture.index_concurrency == 0 {
            anyhow::bail!("capture.queue_capacity and capture.index_concurrency must be > 0");
        }

        if self.spec.index.dimension == 0 {
            anyhow::bail!("index.dimension must be > 0");
        }
        if self.spec.index.embedder == EmbedderKind::Http
            && (self.spec.index.endpoint.is_none() || self.spec.index.model.is_none())
        {
            anyhow::bail!("index.endpoint and index.model are required for the http embedder");
        }

        if self.spec.storage.backend == StorageBackendKind::Postgres
            && self.spec.storage.connection_string.is_none()
        {
            anyhow::bail!("storage.connection_string is required for the postgres backend");
        }

        Ok(())
    }
}
