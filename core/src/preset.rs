//! Voice presets and per-platform preset resolution.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{ConfigError, ProviderConfig};

/// A named bundle conditioning synthesis: reference audio, its transcript and language tags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Preset {
    /// Filled from the preset's table key
    #[serde(skip)]
    pub name: String,
    /// Reference audio locator (path or URL as understood by the backend)
    #[serde(default)]
    pub ref_audio: String,
    #[serde(default)]
    pub prompt_text: String,
    #[serde(default = "default_text_language")]
    pub text_language: String,
    #[serde(default = "default_prompt_language")]
    pub prompt_language: String,
    #[serde(default)]
    pub aux_ref_audio: Vec<String>,
    #[serde(default = "default_speed_factor")]
    pub speed_factor: f32,
    /// Backend voice identifier overriding the provider's default voice
    #[serde(default)]
    pub voice: Option<String>,
    #[serde(default)]
    pub gpt_weights: Option<String>,
    #[serde(default)]
    pub sovits_weights: Option<String>,
}

impl Preset {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ref_audio: String::new(),
            prompt_text: String::new(),
            text_language: default_text_language(),
            prompt_language: default_prompt_language(),
            aux_ref_audio: Vec::new(),
            speed_factor: default_speed_factor(),
            voice: None,
            gpt_weights: None,
            sovits_weights: None,
        }
    }
}

fn default_text_language() -> String {
    "auto".to_string()
}

fn default_prompt_language() -> String {
    "zh".to_string()
}

fn default_speed_factor() -> f32 {
    1.0
}

/// Resolves the preset a provider uses for a platform.
///
/// Construction checks that the default preset and every mapped preset exist,
/// so `resolve` never fails.
#[derive(Debug, Clone)]
pub struct PresetResolver {
    presets: HashMap<String, Arc<Preset>>,
    default_preset: String,
    // platform -> preset name
    platform_presets: HashMap<String, String>,
}

impl PresetResolver {
    pub fn new(
        provider: &str,
        presets: impl IntoIterator<Item = (String, Preset)>,
        default_preset: impl Into<String>,
        platform_presets: HashMap<String, String>,
    ) -> Result<Self, ConfigError> {
        let presets: HashMap<String, Arc<Preset>> = presets
            .into_iter()
            .map(|(name, mut preset)| {
                preset.name = name.clone();
                (name, Arc::new(preset))
            })
            .collect();
        let default_preset = default_preset.into();

        if !presets.contains_key(&default_preset) {
            return Err(ConfigError::MissingDefaultPreset {
                provider: provider.to_string(),
                preset: default_preset,
            });
        }
        for (platform, preset) in &platform_presets {
            if !presets.contains_key(preset) {
                return Err(ConfigError::UnknownPreset {
                    provider: provider.to_string(),
                    platform: platform.clone(),
                    preset: preset.clone(),
                });
            }
        }

        Ok(Self {
            presets,
            default_preset,
            platform_presets,
        })
    }

    pub fn from_config(cfg: &ProviderConfig) -> Result<Self, ConfigError> {
        Self::new(
            &cfg.name,
            cfg.presets.clone(),
            cfg.default_preset.clone(),
            cfg.platform_presets.clone(),
        )
    }

    /// Preset for `platform`, falling back to the default preset.
    pub fn resolve(&self, platform: &str) -> Arc<Preset> {
        let name = match self.platform_presets.get(platform) {
            Some(name) => name,
            None => {
                debug!(target: "preset", platform = %platform, preset = %self.default_preset, "No preset mapped for platform; using default");
                &self.default_preset
            }
        };
        // Both branches name a preset checked at construction
        match self.presets.get(name) {
            Some(preset) => Arc::clone(preset),
            None => Arc::clone(&self.presets[&self.default_preset]),
        }
    }

    pub fn default_preset(&self) -> &str {
        &self.default_preset
    }

    pub fn get(&self, name: &str) -> Option<Arc<Preset>> {
        self.presets.get(name).cloned()
    }

    pub fn presets(&self) -> impl Iterator<Item = &Preset> {
        self.presets.values().map(|p| p.as_ref())
    }
}
