/// TTS backends and their construction from configuration
pub mod doubao;
pub mod gpt_sovits;
pub mod omni;

pub use doubao::DoubaoProvider;
pub use gpt_sovits::GptSovitsProvider;
pub use omni::OmniProvider;

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::{ConfigError, ConnectionConfig, ProviderConfig, RelayConfig};
use crate::preset::PresetResolver;
use crate::provider::ProviderAdapter;
use crate::registry::ProviderRegistry;

/// Instantiate the adapter for one `[[providers]]` entry.
pub fn build_provider(cfg: &ProviderConfig) -> Result<Arc<dyn ProviderAdapter>, ConfigError> {
    let adapter: Arc<dyn ProviderAdapter> = match &cfg.connection {
        ConnectionConfig::GptSovits(conn) => Arc::new(GptSovitsProvider::new(conn.clone())),
        ConnectionConfig::Doubao(conn) => Arc::new(DoubaoProvider::new(conn.clone())),
        ConnectionConfig::Omni(conn) => Arc::new(OmniProvider::new(&cfg.name, conn.clone())?),
    };
    Ok(adapter)
}

/// Register every configured provider, enabled or not, in configured order.
pub fn build_registry(cfg: &RelayConfig) -> Result<ProviderRegistry, ConfigError> {
    let mut registry = ProviderRegistry::new(cfg.tts.delivery_mode());
    for provider in &cfg.providers {
        let adapter = match build_provider(provider) {
            Ok(adapter) => adapter,
            Err(e) if !provider.enabled => {
                warn!(target: "registry", provider = %provider.name, error = %e, "Skipping disabled provider");
                continue;
            }
            Err(e) => return Err(e),
        };
        let presets = PresetResolver::from_config(provider)?;
        registry.register(provider.name.clone(), adapter, presets, provider.enabled)?;
    }
    info!(
        target: "registry",
        total = registry.len(),
        enabled = registry.enabled_providers().count(),
        mode = %registry.preferred_mode(),
        "Provider registry ready"
    );
    Ok(registry)
}

pub(crate) fn http_client(timeout_ms: u64) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_millis(timeout_ms))
        .user_agent(concat!("tts-relay/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// Read an error response body for diagnostics, bounded to keep logs readable.
pub(crate) async fn error_body(response: reqwest::Response) -> String {
    let mut body = response.text().await.unwrap_or_default();
    if body.len() > 512 {
        let mut cut = 512;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    body
}
