use relay_bridge::serve;
use relay_core::{init_tracing, RelayConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // .env is optional
    let _ = dotenvy::dotenv();

    // The subscriber needs the configured level, so load errors are only
    // reported through the returned error.
    let path = RelayConfig::default_path();
    let cfg = RelayConfig::load(&path)?;
    if let Err(e) = init_tracing(&cfg.debug.logging_level) {
        eprintln!("tracing already initialized: {}", e);
    }

    tracing::info!(
        target: "config",
        path = %path.display(),
        providers = cfg.providers.len(),
        enabled = cfg.enabled_providers().count(),
        routes = cfg.routes.len(),
        "Loaded relay config"
    );
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting TTS relay");

    serve(cfg).await?;
    Ok(())
}
