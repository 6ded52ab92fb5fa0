//! Volcengine Doubao speech synthesis over the HTTP query API.
//!
//! Batch only: the response is JSON with a base64 `data` field, `code == 3000`
//! meaning success.

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::{error_body, http_client};
use crate::audio::decode_base64;
use crate::config::DoubaoConfig;
use crate::preset::Preset;
use crate::provider::{
    classify_http_error, classify_status, ModeSupport, ProviderAdapter, ProviderError,
    ProviderResult,
};
use crate::utils::gen_id;

const SUCCESS_CODE: i64 = 3000;
const MAX_SILENCE_MS: u32 = 30_000;

#[derive(Debug, Deserialize)]
struct QueryResponse {
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Option<String>,
}

pub struct DoubaoProvider {
    config: DoubaoConfig,
    http_client: reqwest::Client,
}

impl DoubaoProvider {
    pub fn new(config: DoubaoConfig) -> Self {
        let http_client = http_client(config.request_timeout_ms);
        Self {
            config,
            http_client,
        }
    }

    fn payload(&self, text: &str, preset: &Preset, request_id: &str) -> Value {
        let voice_type = preset.voice.as_deref().unwrap_or(&self.config.voice_type);
        let mut payload = json!({
            "app": {
                "appid": self.config.appid,
                "token": self.config.token,
                "cluster": self.config.cluster,
            },
            "user": { "uid": request_id },
            "audio": {
                "voice_type": voice_type,
                "encoding": "wav",
                "speed_ratio": self.config.speed_ratio,
                "loudness_ratio": self.config.loudness_ratio,
            },
            "request": {
                "reqid": request_id,
                "text": text,
                "operation": "query",
            },
        });

        if let Some(lang) = &self.config.explicit_language {
            payload["audio"]["explicit_language"] = json!(lang);
        }
        if let Some(lang) = &self.config.context_language {
            payload["audio"]["context_language"] = json!(lang);
        }
        let silence = self.config.silence_duration_ms;
        if silence > 0 && silence < MAX_SILENCE_MS {
            payload["request"]["silence_duration"] = json!(silence);
            payload["request"]["enable_trailing_silence_audio"] = json!(true);
        }
        payload
    }
}

fn decode_response(resp: QueryResponse) -> ProviderResult<Bytes> {
    if resp.code != SUCCESS_CODE {
        return Err(ProviderError::Rejected(format!(
            "code={} message={}",
            resp.code, resp.message
        )));
    }
    let data = resp
        .data
        .filter(|d| !d.is_empty())
        .ok_or_else(|| ProviderError::Rejected("response carried no audio".into()))?;
    decode_base64(&data)
        .map(Bytes::from)
        .map_err(|e| ProviderError::Rejected(format!("invalid base64 audio: {}", e)))
}

#[async_trait]
impl ProviderAdapter for DoubaoProvider {
    fn kind(&self) -> &str {
        "doubao"
    }

    fn modes(&self) -> ModeSupport {
        ModeSupport::BATCH_ONLY
    }

    async fn synthesize_batch(&self, text: &str, preset: &Preset) -> ProviderResult<Bytes> {
        let request_id = gen_id();
        debug!(target: "doubao", request_id = %request_id, chars = text.chars().count(), "Requesting synthesis");

        let response = self
            .http_client
            .post(&self.config.base_url)
            .header("Authorization", format!("Bearer;{}", self.config.token))
            .json(&self.payload(text, preset, &request_id))
            .send()
            .await
            .map_err(classify_http_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = error_body(response).await;
            return Err(classify_status(status, body));
        }
        let resp: QueryResponse = response.json().await.map_err(classify_http_error)?;
        decode_response(resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(extra: &str) -> DoubaoProvider {
        let raw = format!(
            r#"
            appid = "app"
            token = "secret"
            cluster = "volcano_tts"
            voice_type = "BV700_streaming"
            {extra}
            "#
        );
        DoubaoProvider::new(toml::from_str(&raw).unwrap())
    }

    #[test]
    fn silence_only_sent_within_range() {
        let inside = provider("silence_duration_ms = 500").payload("hi", &Preset::named("d"), "r1");
        assert_eq!(inside["request"]["silence_duration"], 500);
        assert_eq!(inside["request"]["enable_trailing_silence_audio"], true);

        let outside =
            provider("silence_duration_ms = 30000").payload("hi", &Preset::named("d"), "r1");
        assert!(outside["request"].get("silence_duration").is_none());
    }

    #[test]
    fn preset_voice_overrides_connection_voice() {
        let mut preset = Preset::named("d");
        preset.voice = Some("BV001".into());
        let payload = provider("").payload("hi", &preset, "r1");
        assert_eq!(payload["audio"]["voice_type"], "BV001");
        assert_eq!(payload["request"]["reqid"], "r1");
    }

    #[test]
    fn non_success_code_is_rejected() {
        let err = decode_response(QueryResponse {
            code: 3001,
            message: "invalid text".into(),
            data: None,
        })
        .unwrap_err();
        assert!(matches!(err, ProviderError::Rejected(m) if m.contains("invalid text")));

        let ok = decode_response(QueryResponse {
            code: 3000,
            message: String::new(),
            data: Some("UklGRg==".into()),
        })
        .unwrap();
        assert_eq!(&ok[..], b"RIFF");
    }
}
