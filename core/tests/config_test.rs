use std::io::Write;

use relay_core::config::ConnectionConfig;
use relay_core::providers::build_registry;
use relay_core::{ConfigError, DeliveryMode, RelayConfig};

const BASE: &str = r#"
[server]
host = "0.0.0.0"
port = 9000

[probability]
voice_probability = 0.4

[tts]
stream_mode = true

[routes]
qq = "http://127.0.0.1:18002/messages"
discord = "http://127.0.0.1:18003/messages"

[[providers]]
name = "sovits"

[providers.connection.gpt_sovits]
base_url = "http://127.0.0.1:9880"
top_k = 10

[providers.platform_presets]
qq = "B"

[providers.presets.default]
ref_audio = "refs/default.wav"
prompt_text = "default prompt"

[providers.presets.B]
ref_audio = "refs/b.wav"
prompt_text = "b prompt"
text_language = "zh"

[[providers]]
name = "doubao"
enabled = false

[providers.connection.doubao]
appid = "app"
token = "tok"
cluster = "volcano_tts"
voice_type = "BV700_streaming"
silence_duration_ms = 300

[providers.presets.default]
"#;

fn with(extra: &str) -> String {
    format!("{}\n{}", BASE, extra)
}

#[test]
fn full_config_parses() {
    let cfg = RelayConfig::from_toml_str(BASE).unwrap();
    assert_eq!(cfg.server.port, 9000);
    assert_eq!(cfg.debug.logging_level, "info");
    assert_eq!(cfg.tts.delivery_mode(), DeliveryMode::Streaming);
    assert_eq!(cfg.dispatch.queue_capacity, 256);
    assert!(cfg.upstream.is_none());
    assert_eq!(cfg.providers.len(), 2);

    let sovits = &cfg.providers[0];
    assert!(sovits.enabled);
    assert_eq!(sovits.default_preset, "default");
    match &sovits.connection {
        ConnectionConfig::GptSovits(conn) => {
            assert_eq!(conn.top_k, 10);
            assert_eq!(conn.text_split_method, "cut5");
        }
        other => panic!("unexpected connection {:?}", other),
    }
    assert_eq!(cfg.enabled_providers().count(), 1);
}

#[test]
fn load_reads_file_from_disk() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(BASE.as_bytes()).unwrap();
    let cfg = RelayConfig::load(file.path()).unwrap();
    assert_eq!(cfg.routes.len(), 2);
}

#[test]
fn missing_file_is_a_read_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = RelayConfig::load(dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, ConfigError::Read { .. }));
}

#[test]
fn probability_out_of_range_is_rejected() {
    let raw = BASE.replace("voice_probability = 0.4", "voice_probability = 1.5");
    let err = RelayConfig::from_toml_str(&raw).unwrap_err();
    assert!(matches!(err, ConfigError::InvalidProbability(p) if p == 1.5));
}

#[test]
fn unknown_fields_are_rejected() {
    let raw = BASE.replace("port = 9000", "port = 9000\nworkers = 4");
    assert!(matches!(
        RelayConfig::from_toml_str(&raw).unwrap_err(),
        ConfigError::Parse(_)
    ));
}

#[test]
fn mapped_platform_without_route_is_rejected() {
    let raw = BASE.replace("qq = \"B\"", "qq = \"B\"\nwechat = \"B\"");
    let err = RelayConfig::from_toml_str(&raw).unwrap_err();
    assert!(matches!(err, ConfigError::MissingRoute(ref p) if p == "wechat"));
}

#[test]
fn mapping_to_undefined_preset_is_rejected() {
    let raw = BASE.replace("qq = \"B\"", "qq = \"C\"");
    let err = RelayConfig::from_toml_str(&raw).unwrap_err();
    assert!(matches!(err, ConfigError::UnknownPreset { ref preset, .. } if preset == "C"));
}

#[test]
fn missing_default_preset_is_rejected() {
    let raw = with(
        r#"
[[providers]]
name = "third"
default_preset = "narrator"

[providers.connection.gpt_sovits]
base_url = "http://127.0.0.1:9881"

[providers.presets.default]
ref_audio = "refs/x.wav"
"#,
    );
    let err = RelayConfig::from_toml_str(&raw).unwrap_err();
    assert!(matches!(err, ConfigError::MissingDefaultPreset { ref preset, .. } if preset == "narrator"));
}

#[test]
fn duplicate_provider_names_are_rejected() {
    let raw = with(
        r#"
[[providers]]
name = "sovits"

[providers.connection.gpt_sovits]
base_url = "http://127.0.0.1:9881"

[providers.presets.default]
"#,
    );
    let err = RelayConfig::from_toml_str(&raw).unwrap_err();
    assert!(matches!(err, ConfigError::DuplicateProvider(ref n) if n == "sovits"));
}

#[test]
fn empty_route_is_rejected() {
    let raw = BASE.replace(
        "discord = \"http://127.0.0.1:18003/messages\"",
        "discord = \" \"",
    );
    let err = RelayConfig::from_toml_str(&raw).unwrap_err();
    assert!(matches!(err, ConfigError::EmptyRoute(ref p) if p == "discord"));
}

#[test]
fn registry_built_from_config_falls_back_to_batch_for_batch_only_backends() {
    let cfg = RelayConfig::from_toml_str(BASE).unwrap();
    let registry = build_registry(&cfg).unwrap();
    assert_eq!(registry.len(), 2);
    assert_eq!(registry.get("sovits").unwrap().mode(), DeliveryMode::Streaming);
    assert_eq!(registry.get("doubao").unwrap().mode(), DeliveryMode::Batch);
    assert!(!registry.get("doubao").unwrap().is_enabled());
    assert_eq!(
        registry.get("sovits").unwrap().presets().resolve("qq").name,
        "B"
    );
}

#[test]
fn sample_config_builds_a_registry() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../configs/relay.toml");
    let cfg = RelayConfig::load(path).unwrap();
    assert!(cfg.upstream.is_some());

    // Disabled backends that cannot be constructed are skipped, not fatal
    let registry = build_registry(&cfg).unwrap();
    let enabled: Vec<&str> = registry.enabled_providers().map(|p| p.name()).collect();
    assert_eq!(enabled, vec!["gpt_sovits"]);
    assert_eq!(registry.select(None).unwrap().presets().resolve("qq").name, "default");
}
