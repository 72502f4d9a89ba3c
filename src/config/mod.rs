use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::chain::ChainDescriptor;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Chains to monitor. At least one is required.
    pub chains: Vec<ChainConfig>,
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub analyzer: AnalyzerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    /// Stable chain ID, e.g. "osmosis-1".
    pub chain_id: String,
    /// Human name used in notification subjects.
    pub name: String,
    /// REST endpoints, tried round-robin.
    pub endpoints: Vec<String>,
}

impl ChainConfig {
    pub fn descriptor(&self) -> ChainDescriptor {
        ChainDescriptor {
            chain_id: self.chain_id.clone(),
            name: self.name.clone(),
            endpoints: self.endpoints.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatcherConfig {
    /// Nominal poll interval in seconds. Jittered ±10% per tick.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Per-attempt request deadline in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnalyzerConfig {
    /// Providers in priority order. The first healthy provider wins.
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    /// Sampling temperature passed to every provider.
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Per-call deadline in seconds.
    #[serde(default = "default_llm_timeout_secs")]
    pub llm_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    /// Label used in logs and on stored analyses, e.g. "primary".
    pub name: String,
    /// OpenAI-compatible base URL, e.g. "https://api.openai.com/v1".
    pub base_url: String,
    /// Model identifier.
    pub model: String,
    /// Env var holding the API key; empty for unauthenticated local servers.
    #[serde(default)]
    pub api_key_env: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Analysis work queue capacity.
    #[serde(default = "default_analysis_queue")]
    pub analysis_queue: usize,
    /// Delivery work queue capacity.
    #[serde(default = "default_delivery_queue")]
    pub delivery_queue: usize,
    /// Max concurrent LLM calls.
    #[serde(default = "default_llm_concurrency")]
    pub llm_concurrency: usize,
    /// Max concurrent notifier sends.
    #[serde(default = "default_send_concurrency")]
    pub send_concurrency: usize,
    /// Grace period for draining the analysis queue on shutdown, seconds.
    #[serde(default = "default_analysis_grace_secs")]
    pub analysis_grace_secs: u64,
    /// Grace period for draining the delivery queue on shutdown, seconds.
    #[serde(default = "default_delivery_grace_secs")]
    pub delivery_grace_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Root directory for cursors, analyses, and delivery marks.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_poll_interval_secs() -> u64 {
    3600
}
fn default_request_timeout_secs() -> u64 {
    10
}
fn default_temperature() -> f32 {
    0.2
}
fn default_llm_timeout_secs() -> u64 {
    45
}
fn default_analysis_queue() -> usize {
    256
}
fn default_delivery_queue() -> usize {
    1024
}
fn default_llm_concurrency() -> usize {
    3
}
fn default_send_concurrency() -> usize {
    8
}
fn default_analysis_grace_secs() -> u64 {
    60
}
fn default_delivery_grace_secs() -> u64 {
    30
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            temperature: default_temperature(),
            llm_timeout_secs: default_llm_timeout_secs(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            analysis_queue: default_analysis_queue(),
            delivery_queue: default_delivery_queue(),
            llm_concurrency: default_llm_concurrency(),
            send_concurrency: default_send_concurrency(),
            analysis_grace_secs: default_analysis_grace_secs(),
            delivery_grace_secs: default_delivery_grace_secs(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Config {
    /// Load config from a TOML file and validate. Misconfiguration is fatal
    /// here, never at runtime.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chains.is_empty() {
            return Err(ConfigError::Invalid("no chains configured".into()));
        }
        for chain in &self.chains {
            if chain.chain_id.trim().is_empty() {
                return Err(ConfigError::Invalid("chain with empty chain_id".into()));
            }
            if chain.endpoints.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "chain {} has no endpoints",
                    chain.chain_id
                )));
            }
        }
        let mut seen = std::collections::HashSet::new();
        for chain in &self.chains {
            if !seen.insert(&chain.chain_id) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate chain_id {}",
                    chain.chain_id
                )));
            }
        }
        for provider in &self.analyzer.providers {
            if provider.base_url.trim().is_empty() || provider.model.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "provider {} missing base_url or model",
                    provider.name
                )));
            }
        }
        if !(0.0..=2.0).contains(&self.analyzer.temperature) {
            return Err(ConfigError::Invalid(format!(
                "temperature {} out of range",
                self.analyzer.temperature
            )));
        }
        if self.scheduler.llm_concurrency == 0 || self.scheduler.send_concurrency == 0 {
            return Err(ConfigError::Invalid("concurrency caps must be >= 1".into()));
        }
        Ok(())
    }

    /// Resolve a provider's API key from its configured env var.
    pub fn provider_api_key(provider: &ProviderConfig) -> Option<String> {
        if provider.api_key_env.is_empty() {
            return None;
        }
        std::env::var(&provider.api_key_env)
            .ok()
            .filter(|k| !k.is_empty())
    }
}
