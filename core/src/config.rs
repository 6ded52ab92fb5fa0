//! Relay configuration.
//!
//! Loaded once at startup from TOML. Every table rejects unknown fields and
//! `RelayConfig::validate` enforces the load-time invariants:
//! - `probability.voice_probability` lies within [0, 1]
//! - provider names are unique
//! - each provider defines its default preset and every mapped preset
//! - every platform named in a preset mapping has a route
//!
//! Env overrides:
//! - RELAY_CONFIG: path of the TOML file (default `configs/relay.toml`)

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::preset::{Preset, PresetResolver};
use crate::provider::DeliveryMode;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("voice_probability must be within [0, 1], got {0}")]
    InvalidProbability(f64),

    #[error("provider {provider}: default preset '{preset}' is not defined")]
    MissingDefaultPreset { provider: String, preset: String },

    #[error("provider {provider}: platform '{platform}' maps to undefined preset '{preset}'")]
    UnknownPreset {
        provider: String,
        platform: String,
        preset: String,
    },

    #[error("platform '{0}' has no route configured")]
    MissingRoute(String),

    #[error("route for platform '{0}' has an empty endpoint")]
    EmptyRoute(String),

    #[error("duplicate provider name '{0}'")]
    DuplicateProvider(String),

    #[error("provider {provider} cannot serve {mode} delivery")]
    UnsupportedMode {
        provider: String,
        mode: DeliveryMode,
    },

    #[error("provider {provider}: {reason}")]
    InvalidProvider { provider: String, reason: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub debug: DebugConfig,
    pub probability: ProbabilityConfig,
    #[serde(default)]
    pub tts: TtsConfig,
    /// platform -> destination endpoint
    pub routes: BTreeMap<String, String>,
    #[serde(default)]
    pub upstream: Option<UpstreamConfig>,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DebugConfig {
    #[serde(default = "default_logging_level")]
    pub logging_level: String,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            logging_level: default_logging_level(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProbabilityConfig {
    pub voice_probability: f64,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TtsConfig {
    #[serde(default)]
    pub stream_mode: bool,
}

impl TtsConfig {
    pub fn delivery_mode(&self) -> DeliveryMode {
        if self.stream_mode {
            DeliveryMode::Streaming
        } else {
            DeliveryMode::Batch
        }
    }
}

/// Where adapter-originated messages are forwarded (the bot core).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamConfig {
    pub url: String,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DispatchConfig {
    /// Bounded queue per destination; a full queue applies backpressure to the pipeline
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_dispatch_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            request_timeout_ms: default_dispatch_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub connection: ConnectionConfig,
    #[serde(default = "default_preset_name")]
    pub default_preset: String,
    /// platform -> preset name
    #[serde(default)]
    pub platform_presets: HashMap<String, String>,
    pub presets: HashMap<String, Preset>,
}

/// Backend-specific connection parameters, one table per provider kind.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionConfig {
    GptSovits(GptSovitsConfig),
    Doubao(DoubaoConfig),
    Omni(OmniConfig),
}

impl ConnectionConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            ConnectionConfig::GptSovits(_) => "gpt_sovits",
            ConnectionConfig::Doubao(_) => "doubao",
            ConnectionConfig::Omni(_) => "omni",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GptSovitsConfig {
    pub base_url: String,
    #[serde(default = "default_top_k")]
    pub top_k: u32,
    #[serde(default = "default_one")]
    pub top_p: f32,
    #[serde(default = "default_one")]
    pub temperature: f32,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default = "default_batch_threshold")]
    pub batch_threshold: f32,
    #[serde(default = "default_text_split_method")]
    pub text_split_method: String,
    #[serde(default = "default_repetition_penalty")]
    pub repetition_penalty: f32,
    #[serde(default = "default_sample_steps")]
    pub sample_steps: u32,
    #[serde(default)]
    pub super_sampling: bool,
    #[serde(default = "default_media_type")]
    pub media_type: String,
    #[serde(default = "default_provider_timeout_ms")]
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DoubaoConfig {
    #[serde(default = "default_doubao_url")]
    pub base_url: String,
    pub appid: String,
    pub token: String,
    pub cluster: String,
    pub voice_type: String,
    #[serde(default = "default_one")]
    pub speed_ratio: f32,
    #[serde(default = "default_one")]
    pub loudness_ratio: f32,
    #[serde(default)]
    pub explicit_language: Option<String>,
    #[serde(default)]
    pub context_language: Option<String>,
    /// Trailing silence in milliseconds; only sent when 0 < value < 30000
    #[serde(default)]
    pub silence_duration_ms: u32,
    #[serde(default = "default_provider_timeout_ms")]
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OmniConfig {
    #[serde(default = "default_omni_url")]
    pub base_url: String,
    /// Falls back to DASHSCOPE_API_KEY when unset
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_omni_model")]
    pub model: String,
    #[serde(default = "default_omni_voice")]
    pub voice: String,
    #[serde(default = "default_media_type")]
    pub audio_format: String,
    #[serde(default = "default_provider_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl RelayConfig {
    /// Path from RELAY_CONFIG or `configs/relay.toml`.
    pub fn default_path() -> PathBuf {
        std::env::var("RELAY_CONFIG")
            .ok()
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("configs/relay.toml"))
    }

    /// Read, parse and validate a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let cfg: RelayConfig = toml::from_str(raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let p = self.probability.voice_probability;
        if !p.is_finite() || !(0.0..=1.0).contains(&p) {
            return Err(ConfigError::InvalidProbability(p));
        }

        for (platform, endpoint) in &self.routes {
            if endpoint.trim().is_empty() {
                return Err(ConfigError::EmptyRoute(platform.clone()));
            }
        }

        if self.dispatch.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "dispatch.queue_capacity must be greater than 0".into(),
            ));
        }

        let mut seen = HashSet::new();
        for provider in &self.providers {
            if !seen.insert(provider.name.as_str()) {
                return Err(ConfigError::DuplicateProvider(provider.name.clone()));
            }
            PresetResolver::from_config(provider)?;

            for platform in provider.platform_presets.keys() {
                if !self.routes.contains_key(platform) {
                    return Err(ConfigError::MissingRoute(platform.clone()));
                }
            }
        }
        Ok(())
    }

    pub fn enabled_providers(&self) -> impl Iterator<Item = &ProviderConfig> {
        self.providers.iter().filter(|p| p.enabled)
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8090
}

fn default_logging_level() -> String {
    "info".to_string()
}

fn default_queue_capacity() -> usize {
    256
}

fn default_dispatch_timeout_ms() -> u64 {
    10_000
}

fn default_true() -> bool {
    true
}

fn default_preset_name() -> String {
    "default".to_string()
}

fn default_top_k() -> u32 {
    5
}

fn default_one() -> f32 {
    1.0
}

fn default_batch_size() -> u32 {
    1
}

fn default_batch_threshold() -> f32 {
    0.75
}

fn default_text_split_method() -> String {
    "cut5".to_string()
}

fn default_repetition_penalty() -> f32 {
    1.35
}

fn default_sample_steps() -> u32 {
    32
}

fn default_media_type() -> String {
    "wav".to_string()
}

fn default_provider_timeout_ms() -> u64 {
    60_000
}

fn default_doubao_url() -> String {
    "https://openspeech.bytedance.com/api/v1/tts".to_string()
}

fn default_omni_url() -> String {
    "https://dashscope.aliyuncs.com/compatible-mode/v1".to_string()
}

fn default_omni_model() -> String {
    "qwen-omni-turbo".to_string()
}

fn default_omni_voice() -> String {
    "Chelsie".to_string()
}
