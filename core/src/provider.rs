use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::preset::Preset;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    /// Backend unreachable: connection refused, timeout, 5xx
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    /// Backend refused this input
    #[error("provider rejected request: {0}")]
    Rejected(String),

    #[error("{0} synthesis is not supported by this provider")]
    UnsupportedMode(DeliveryMode),
}

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Ordered, finite audio chunk stream. Exhaustion is the end-of-stream marker;
/// an `Err` item signals a mid-stream failure and nothing follows it.
pub type AudioStream = BoxStream<'static, ProviderResult<Bytes>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    Batch,
    Streaming,
}

impl DeliveryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryMode::Batch => "batch",
            DeliveryMode::Streaming => "streaming",
        }
    }
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Synthesis modes a provider implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeSupport {
    pub batch: bool,
    pub streaming: bool,
}

impl ModeSupport {
    pub const BATCH_ONLY: ModeSupport = ModeSupport {
        batch: true,
        streaming: false,
    };
    pub const STREAMING_ONLY: ModeSupport = ModeSupport {
        batch: false,
        streaming: true,
    };
    pub const BOTH: ModeSupport = ModeSupport {
        batch: true,
        streaming: true,
    };

    pub fn supports(&self, mode: DeliveryMode) -> bool {
        match mode {
            DeliveryMode::Batch => self.batch,
            DeliveryMode::Streaming => self.streaming,
        }
    }

    /// Mode used for a provider given the configured preference:
    /// streaming when preferred and supported, batch otherwise.
    /// `None` means the provider cannot be driven under this preference.
    pub fn select(&self, preferred: DeliveryMode) -> Option<DeliveryMode> {
        if preferred == DeliveryMode::Streaming && self.streaming {
            Some(DeliveryMode::Streaming)
        } else if self.batch {
            Some(DeliveryMode::Batch)
        } else {
            None
        }
    }
}

/// Uniform contract implemented by every TTS backend.
///
/// The wire format to the backend is private to each implementation; the
/// pipeline only sees bytes or an ordered chunk stream.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Backend kind, e.g. "gpt_sovits"
    fn kind(&self) -> &str;

    fn modes(&self) -> ModeSupport;

    /// Synthesize the complete audio payload.
    async fn synthesize_batch(&self, text: &str, preset: &Preset) -> ProviderResult<Bytes> {
        let _ = (text, preset);
        Err(ProviderError::UnsupportedMode(DeliveryMode::Batch))
    }

    /// Start an incremental synthesis. Errors returned here happen before any chunk.
    async fn synthesize_stream(&self, text: &str, preset: &Preset) -> ProviderResult<AudioStream> {
        let _ = (text, preset);
        Err(ProviderError::UnsupportedMode(DeliveryMode::Streaming))
    }
}

/// Map a transport error onto the provider taxonomy.
pub(crate) fn classify_http_error(err: reqwest::Error) -> ProviderError {
    if let Some(status) = err.status() {
        return classify_status(status, err.to_string());
    }
    ProviderError::Unavailable(err.to_string())
}

/// 4xx means the backend refused the input, anything else is an availability problem.
pub(crate) fn classify_status(status: reqwest::StatusCode, body: String) -> ProviderError {
    if status.is_client_error() {
        ProviderError::Rejected(format!("status={} body={}", status, body))
    } else {
        ProviderError::Unavailable(format!("status={} body={}", status, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_selection_prefers_streaming_when_supported() {
        assert_eq!(
            ModeSupport::BOTH.select(DeliveryMode::Streaming),
            Some(DeliveryMode::Streaming)
        );
        assert_eq!(
            ModeSupport::BATCH_ONLY.select(DeliveryMode::Streaming),
            Some(DeliveryMode::Batch)
        );
        assert_eq!(
            ModeSupport::BOTH.select(DeliveryMode::Batch),
            Some(DeliveryMode::Batch)
        );
        assert_eq!(ModeSupport::STREAMING_ONLY.select(DeliveryMode::Batch), None);
    }

    #[test]
    fn status_classification() {
        let rejected = classify_status(reqwest::StatusCode::BAD_REQUEST, "bad text".into());
        assert!(matches!(rejected, ProviderError::Rejected(_)));
        let down = classify_status(reqwest::StatusCode::BAD_GATEWAY, String::new());
        assert!(matches!(down, ProviderError::Unavailable(_)));
    }
}
