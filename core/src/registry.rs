use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::config::ConfigError;
use crate::preset::PresetResolver;
use crate::provider::{DeliveryMode, ProviderAdapter};

#[derive(Error, Debug, Clone, PartialEq)]
#[error("provider not found: {0}")]
pub struct ProviderNotFound(pub String);

/// A provider instance plus its presets, as registered at startup.
pub struct RegisteredProvider {
    name: String,
    enabled: bool,
    mode: DeliveryMode,
    adapter: Arc<dyn ProviderAdapter>,
    presets: PresetResolver,
}

impl RegisteredProvider {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Mode this provider is driven in, fixed at registration.
    pub fn mode(&self) -> DeliveryMode {
        self.mode
    }

    pub fn adapter(&self) -> &Arc<dyn ProviderAdapter> {
        &self.adapter
    }

    pub fn presets(&self) -> &PresetResolver {
        &self.presets
    }
}

impl std::fmt::Debug for RegisteredProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredProvider")
            .field("name", &self.name)
            .field("kind", &self.adapter.kind())
            .field("enabled", &self.enabled)
            .field("mode", &self.mode)
            .finish()
    }
}

/// Registry of TTS backends in configured order.
///
/// Filled once at startup, then shared behind an `Arc` and only read.
pub struct ProviderRegistry {
    preferred: DeliveryMode,
    providers: Vec<Arc<RegisteredProvider>>,
}

impl ProviderRegistry {
    pub fn new(preferred: DeliveryMode) -> Self {
        Self {
            preferred,
            providers: Vec::new(),
        }
    }

    pub fn preferred_mode(&self) -> DeliveryMode {
        self.preferred
    }

    /// Register a provider. Fails on a duplicate name or when the provider
    /// cannot serve the preferred delivery mode nor fall back to batch.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        adapter: Arc<dyn ProviderAdapter>,
        presets: PresetResolver,
        enabled: bool,
    ) -> Result<(), ConfigError> {
        let name = name.into();
        if self.providers.iter().any(|p| p.name == name) {
            return Err(ConfigError::DuplicateProvider(name));
        }
        let mode = adapter
            .modes()
            .select(self.preferred)
            .ok_or_else(|| ConfigError::UnsupportedMode {
                provider: name.clone(),
                mode: self.preferred,
            })?;

        info!(target: "registry", provider = %name, kind = %adapter.kind(), %mode, enabled, "Registering TTS provider");
        self.providers.push(Arc::new(RegisteredProvider {
            name,
            enabled,
            mode,
            adapter,
            presets,
        }));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<RegisteredProvider>, ProviderNotFound> {
        self.providers
            .iter()
            .find(|p| p.name == name)
            .cloned()
            .ok_or_else(|| ProviderNotFound(name.to_string()))
    }

    pub fn enabled_providers(&self) -> impl Iterator<Item = &Arc<RegisteredProvider>> {
        self.providers.iter().filter(|p| p.enabled)
    }

    /// Exact-name match among enabled providers when hinted, else the first enabled one.
    pub fn select(&self, hint: Option<&str>) -> Option<Arc<RegisteredProvider>> {
        if let Some(hint) = hint {
            if let Some(hit) = self.enabled_providers().find(|p| p.name == hint) {
                return Some(Arc::clone(hit));
            }
            debug!(target: "registry", hint = %hint, "Provider hint did not match an enabled provider");
        }
        self.enabled_providers().next().cloned()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
