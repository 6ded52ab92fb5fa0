//! Omni-modal chat models (OpenAI-compatible API) used as a TTS backend.
//!
//! The model is asked to repeat the text verbatim with audio output enabled.
//! Audio arrives as base64 PCM16 deltas in the SSE stream; each delta becomes
//! one WAV chunk when streaming, and batch mode wraps all PCM in one WAV.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{error_body, http_client};
use crate::audio::{decode_base64, pcm16_to_wav, OMNI_SAMPLE_RATE};
use crate::config::{ConfigError, OmniConfig};
use crate::preset::Preset;
use crate::provider::{
    classify_http_error, classify_status, AudioStream, ModeSupport, ProviderAdapter,
    ProviderError, ProviderResult,
};

const API_KEY_ENV: &str = "DASHSCOPE_API_KEY";

#[derive(Debug, Default, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    audio: Option<AudioDelta>,
}

#[derive(Debug, Default, Deserialize)]
struct AudioDelta {
    #[serde(default)]
    data: Option<String>,
}

/// One parsed SSE `data:` line.
#[derive(Debug, PartialEq)]
enum SseEvent {
    /// Base64 PCM16 audio
    Audio(String),
    /// Event without audio (text delta, usage, ...)
    Other,
    Done,
}

/// Splits a byte stream into SSE lines, keeping partial lines between pushes.
#[derive(Debug, Default)]
struct SseLines {
    buf: Vec<u8>,
}

impl SseLines {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line).trim().to_string();
            if !line.is_empty() {
                lines.push(line);
            }
        }
        lines
    }
}

fn parse_sse_line(line: &str) -> ProviderResult<Option<SseEvent>> {
    let Some(payload) = line.strip_prefix("data:") else {
        // comments, event names, ids
        return Ok(None);
    };
    let payload = payload.trim();
    if payload == "[DONE]" {
        return Ok(Some(SseEvent::Done));
    }
    let chunk: ChatChunk = serde_json::from_str(payload)
        .map_err(|e| ProviderError::Unavailable(format!("malformed stream event: {}", e)))?;
    let audio = chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.audio)
        .and_then(|a| a.data)
        .filter(|d| !d.is_empty());
    Ok(Some(match audio {
        Some(data) => SseEvent::Audio(data),
        None => SseEvent::Other,
    }))
}

pub struct OmniProvider {
    config: OmniConfig,
    api_key: String,
    http_client: reqwest::Client,
}

impl OmniProvider {
    pub fn new(name: &str, config: OmniConfig) -> Result<Self, ConfigError> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .or_else(|| std::env::var(API_KEY_ENV).ok().filter(|k| !k.is_empty()))
            .ok_or_else(|| ConfigError::InvalidProvider {
                provider: name.to_string(),
                reason: format!("no api_key configured and {} is not set", API_KEY_ENV),
            })?;
        let http_client = http_client(config.request_timeout_ms);
        Ok(Self {
            config,
            api_key,
            http_client,
        })
    }

    fn prompt(text: &str) -> String {
        format!(
            "Repeat the following sentence exactly and output nothing else, no prefix or suffix: '{}'",
            text
        )
    }

    /// Start a completion and yield decoded PCM16 deltas in arrival order.
    async fn pcm_deltas(
        &self,
        text: &str,
        preset: &Preset,
    ) -> ProviderResult<BoxStream<'static, ProviderResult<Vec<u8>>>> {
        let voice = preset.voice.as_deref().unwrap_or(&self.config.voice);
        let body = json!({
            "model": self.config.model,
            "messages": [{ "role": "user", "content": Self::prompt(text) }],
            "modalities": ["text", "audio"],
            "audio": { "voice": voice, "format": self.config.audio_format },
            "stream": true,
            "stream_options": { "include_usage": true },
        });
        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );

        debug!(target: "omni", model = %self.config.model, voice = %voice, chars = text.chars().count(), "Requesting synthesis");
        let response = self
            .http_client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(classify_http_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = error_body(response).await;
            return Err(classify_status(status, body));
        }

        let mut body = Box::pin(response.bytes_stream());
        let stream = async_stream::try_stream! {
            let mut lines = SseLines::default();
            'read: while let Some(bytes) = body.next().await {
                let bytes = bytes.map_err(classify_http_error)?;
                for line in lines.push(&bytes) {
                    match parse_sse_line(&line)? {
                        Some(SseEvent::Audio(data)) => {
                            let pcm = decode_base64(&data).map_err(|e| {
                                ProviderError::Unavailable(format!("invalid base64 audio: {}", e))
                            })?;
                            yield pcm;
                        }
                        Some(SseEvent::Done) => break 'read,
                        Some(SseEvent::Other) | None => {}
                    }
                }
            }
        };
        Ok(stream.boxed())
    }
}

fn wav(pcm: &[u8]) -> ProviderResult<Bytes> {
    pcm16_to_wav(pcm, OMNI_SAMPLE_RATE)
        .map(Bytes::from)
        .map_err(|e| ProviderError::Rejected(format!("wav encoding failed: {}", e)))
}

#[async_trait]
impl ProviderAdapter for OmniProvider {
    fn kind(&self) -> &str {
        "omni"
    }

    fn modes(&self) -> ModeSupport {
        ModeSupport::BOTH
    }

    async fn synthesize_batch(&self, text: &str, preset: &Preset) -> ProviderResult<Bytes> {
        let mut deltas = self.pcm_deltas(text, preset).await?;
        let mut pcm = Vec::new();
        while let Some(delta) = deltas.next().await {
            pcm.extend_from_slice(&delta?);
        }
        if pcm.is_empty() {
            return Err(ProviderError::Rejected("model returned no audio".into()));
        }
        wav(&pcm)
    }

    async fn synthesize_stream(&self, text: &str, preset: &Preset) -> ProviderResult<AudioStream> {
        let deltas = self.pcm_deltas(text, preset).await?;
        Ok(deltas
            .map(|delta| delta.and_then(|pcm| wav(&pcm)))
            .boxed())
    }
}
