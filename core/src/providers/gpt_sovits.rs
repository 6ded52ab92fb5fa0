//! GPT-SoVITS inference server (`api_v2`).
//!
//! `POST /tts` returns the audio body directly; with `streaming_mode` the body
//! is sent incrementally and forwarded chunk by chunk. Presets may name model
//! weights, which are switched through `/set_gpt_weights` and
//! `/set_sovits_weights` before synthesis when they differ from the loaded ones.
//!
//! The server holds one set of weights at a time. A request whose preset names
//! weights keeps them pinned (shared lock) until its audio has been read, so a
//! concurrent preset needing other weights waits instead of switching the model
//! mid-synthesis.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::{OwnedRwLockReadGuard, RwLock};
use tracing::{debug, info, warn};

use super::{error_body, http_client};
use crate::config::GptSovitsConfig;
use crate::preset::Preset;
use crate::provider::{
    classify_http_error, classify_status, AudioStream, ModeSupport, ProviderAdapter,
    ProviderError, ProviderResult,
};

#[derive(Debug, Serialize)]
struct TtsRequest<'a> {
    text: &'a str,
    text_lang: &'a str,
    ref_audio_path: &'a str,
    aux_ref_audio_paths: &'a [String],
    prompt_text: &'a str,
    prompt_lang: &'a str,
    top_k: u32,
    top_p: f32,
    temperature: f32,
    text_split_method: &'a str,
    batch_size: u32,
    batch_threshold: f32,
    speed_factor: f32,
    streaming_mode: bool,
    media_type: &'a str,
    repetition_penalty: f32,
    sample_steps: u32,
    super_sampling: bool,
}

#[derive(Debug, Default)]
struct LoadedWeights {
    gpt: Option<String>,
    sovits: Option<String>,
}

impl LoadedWeights {
    fn serves(&self, preset: &Preset) -> bool {
        let same = |wanted: &Option<String>, loaded: &Option<String>| {
            wanted.is_none() || wanted == loaded
        };
        same(&preset.gpt_weights, &self.gpt) && same(&preset.sovits_weights, &self.sovits)
    }
}

type WeightsGuard = OwnedRwLockReadGuard<LoadedWeights>;

pub struct GptSovitsProvider {
    config: GptSovitsConfig,
    http_client: reqwest::Client,
    loaded: Arc<RwLock<LoadedWeights>>,
}

impl GptSovitsProvider {
    pub fn new(config: GptSovitsConfig) -> Self {
        let http_client = http_client(config.request_timeout_ms);
        Self {
            config,
            http_client,
            loaded: Arc::new(RwLock::new(LoadedWeights::default())),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn build_request<'a>(
        &'a self,
        text: &'a str,
        preset: &'a Preset,
        streaming: bool,
    ) -> ProviderResult<TtsRequest<'a>> {
        if preset.ref_audio.is_empty() {
            return Err(ProviderError::Rejected(format!(
                "preset '{}' has no reference audio",
                preset.name
            )));
        }
        Ok(TtsRequest {
            text,
            text_lang: &preset.text_language,
            ref_audio_path: &preset.ref_audio,
            aux_ref_audio_paths: &preset.aux_ref_audio,
            prompt_text: &preset.prompt_text,
            prompt_lang: &preset.prompt_language,
            top_k: self.config.top_k,
            top_p: self.config.top_p,
            temperature: self.config.temperature,
            text_split_method: &self.config.text_split_method,
            batch_size: self.config.batch_size,
            batch_threshold: self.config.batch_threshold,
            speed_factor: preset.speed_factor,
            streaming_mode: streaming,
            media_type: &self.config.media_type,
            repetition_penalty: self.config.repetition_penalty,
            sample_steps: self.config.sample_steps,
            super_sampling: self.config.super_sampling,
        })
    }

    /// Make sure the weights named by `preset` are loaded and keep them loaded
    /// while the returned guard lives. Presets naming no weights need no guard.
    async fn pin_weights(&self, preset: &Preset) -> ProviderResult<Option<WeightsGuard>> {
        if preset.gpt_weights.is_none() && preset.sovits_weights.is_none() {
            return Ok(None);
        }

        let loaded = Arc::clone(&self.loaded).read_owned().await;
        if loaded.serves(preset) {
            return Ok(Some(loaded));
        }
        drop(loaded);

        let mut loaded = Arc::clone(&self.loaded).write_owned().await;
        if let Some(weights) = &preset.gpt_weights {
            if loaded.gpt.as_ref() != Some(weights) {
                self.set_weights("set_gpt_weights", weights).await?;
                loaded.gpt = Some(weights.clone());
            }
        }
        if let Some(weights) = &preset.sovits_weights {
            if loaded.sovits.as_ref() != Some(weights) {
                self.set_weights("set_sovits_weights", weights).await?;
                loaded.sovits = Some(weights.clone());
            }
        }
        Ok(Some(loaded.downgrade()))
    }

    async fn set_weights(&self, endpoint: &str, weights: &str) -> ProviderResult<()> {
        info!(target: "gpt_sovits", endpoint, weights, "Switching model weights");
        let response = self
            .http_client
            .get(self.url(endpoint))
            .query(&[("weights_path", weights)])
            .send()
            .await
            .map_err(classify_http_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = error_body(response).await;
            warn!(target: "gpt_sovits", endpoint, %status, "Weight switch failed");
            return Err(classify_status(status, body));
        }
        Ok(())
    }

    async fn post_tts(
        &self,
        text: &str,
        preset: &Preset,
        streaming: bool,
    ) -> ProviderResult<(reqwest::Response, Option<WeightsGuard>)> {
        let request = self.build_request(text, preset, streaming)?;
        let pinned = self.pin_weights(preset).await?;

        debug!(target: "gpt_sovits", preset = %preset.name, streaming, chars = text.chars().count(), "Requesting synthesis");
        let response = self
            .http_client
            .post(self.url("tts"))
            .json(&request)
            .send()
            .await
            .map_err(classify_http_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = error_body(response).await;
            return Err(classify_status(status, body));
        }
        Ok((response, pinned))
    }
}

#[async_trait]
impl ProviderAdapter for GptSovitsProvider {
    fn kind(&self) -> &str {
        "gpt_sovits"
    }

    fn modes(&self) -> ModeSupport {
        ModeSupport::BOTH
    }

    async fn synthesize_batch(&self, text: &str, preset: &Preset) -> ProviderResult<Bytes> {
        let (response, _pinned) = self.post_tts(text, preset, false).await?;
        response.bytes().await.map_err(classify_http_error)
    }

    async fn synthesize_stream(&self, text: &str, preset: &Preset) -> ProviderResult<AudioStream> {
        let (response, pinned) = self.post_tts(text, preset, true).await?;
        Ok(response
            .bytes_stream()
            .map(move |chunk| {
                // weights stay pinned until the stream is finished or dropped
                let _pinned = &pinned;
                chunk.map_err(classify_http_error)
            })
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> GptSovitsProvider {
        let config: GptSovitsConfig =
            toml::from_str(r#"base_url = "http://127.0.0.1:9880/""#).unwrap();
        GptSovitsProvider::new(config)
    }

    #[test]
    fn request_takes_voice_from_preset_and_sampling_from_connection() {
        let p = provider();
        let mut preset = Preset::named("calm");
        preset.ref_audio = "refs/calm.wav".into();
        preset.prompt_text = "hello there".into();
        preset.speed_factor = 1.2;

        let body = serde_json::to_value(p.build_request("hi", &preset, true).unwrap()).unwrap();
        assert_eq!(body["ref_audio_path"], "refs/calm.wav");
        assert_eq!(body["prompt_lang"], "zh");
        assert_eq!(body["top_k"], 5);
        assert_eq!(body["text_split_method"], "cut5");
        assert_eq!(body["streaming_mode"], true);
        assert_eq!(p.url("tts"), "http://127.0.0.1:9880/tts");
    }

    #[test]
    fn loaded_weights_serve_presets_naming_them_or_nothing() {
        let loaded = LoadedWeights {
            gpt: Some("A.ckpt".into()),
            sovits: None,
        };
        let mut preset = Preset::named("a");
        assert!(loaded.serves(&preset));
        preset.gpt_weights = Some("A.ckpt".into());
        assert!(loaded.serves(&preset));
        preset.sovits_weights = Some("A.pth".into());
        assert!(!loaded.serves(&preset));
    }

    #[test]
    fn preset_without_reference_audio_is_rejected() {
        let p = provider();
        let err = p.build_request("hi", &Preset::named("empty"), false).unwrap_err();
        assert!(matches!(err, ProviderError::Rejected(_)));
    }
}
