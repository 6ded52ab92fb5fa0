use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::audio::encode_audio;
use crate::utils::now_ms;

/// Segment type names used on the adapter wire format.
pub mod kinds {
    /// Plain text produced by the bot core
    pub const TEXT: &str = "text";
    /// Text explicitly marked for speech; bypasses the probability gate
    pub const TTS_TEXT: &str = "tts_text";
    /// Complete base64 audio payload
    pub const VOICE: &str = "voice";
    /// One base64 audio chunk of a streamed response
    pub const VOICE_STREAM: &str = "voice_stream";
    /// Terminal marker of a streamed response
    pub const VOICE_STREAM_END: &str = "voice_stream_end";
    /// Nested list of segments
    pub const SEGLIST: &str = "seglist";
}

/// Reserved metadata and additional_config keys.
pub mod keys {
    /// Metadata key naming the preferred provider for this message
    pub const PROVIDER_HINT: &str = "tts_provider";
    /// additional_config key carrying the synthesized text
    pub const ORIGINAL_TEXT: &str = "original_text";
}

/// Segment payload: nested segments, a string, or any other JSON value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SegmentData {
    List(Vec<Segment>),
    Text(String),
    Other(Value),
}

/// One node of a message's segment tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: SegmentData,
}

impl Segment {
    pub fn new(kind: impl Into<String>, data: SegmentData) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(kinds::TEXT, SegmentData::Text(text.into()))
    }

    pub fn tts_text(text: impl Into<String>) -> Self {
        Self::new(kinds::TTS_TEXT, SegmentData::Text(text.into()))
    }

    pub fn voice(base64_audio: String) -> Self {
        Self::new(kinds::VOICE, SegmentData::Text(base64_audio))
    }

    pub fn voice_stream(base64_chunk: String) -> Self {
        Self::new(kinds::VOICE_STREAM, SegmentData::Text(base64_chunk))
    }

    pub fn list(segments: Vec<Segment>) -> Self {
        Self::new(kinds::SEGLIST, SegmentData::List(segments))
    }

    pub fn is(&self, kind: &str) -> bool {
        self.kind == kind
    }

    /// Concatenate all `text` and `tts_text` data in tree order.
    pub fn collect_text(&self, out: &mut String) {
        match (&self.data, self.kind.as_str()) {
            (SegmentData::List(children), kinds::SEGLIST) => {
                for child in children {
                    child.collect_text(out);
                }
            }
            (SegmentData::Text(text), kinds::TEXT | kinds::TTS_TEXT) => out.push_str(text),
            _ => {}
        }
    }
}

/// Content negotiation lists carried with every message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FormatInfo {
    #[serde(default)]
    pub content_format: Vec<String>,
    #[serde(default)]
    pub accept_format: Vec<String>,
}

/// A chat message as exchanged with the adapter and the bot core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub platform: String,
    #[serde(default)]
    pub time_ms: Option<i64>,
    pub segment: Segment,
    #[serde(default)]
    pub format: FormatInfo,
    #[serde(default)]
    pub additional_config: Map<String, Value>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Message {
    pub fn new(id: impl Into<String>, platform: impl Into<String>, segment: Segment) -> Self {
        Self {
            id: id.into(),
            platform: platform.into(),
            time_ms: None,
            segment,
            format: FormatInfo::default(),
            additional_config: Map::new(),
            metadata: HashMap::new(),
        }
    }

    /// Text to synthesize, `None` when the message carries no text at all.
    pub fn text(&self) -> Option<String> {
        let mut out = String::new();
        self.segment.collect_text(&mut out);
        let trimmed = out.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }

    /// Messages whose top-level segment is `tts_text` are always synthesized.
    pub fn is_forced_tts(&self) -> bool {
        self.segment.is(kinds::TTS_TEXT)
    }

    pub fn provider_hint(&self) -> Option<&str> {
        self.metadata
            .get(keys::PROVIDER_HINT)
            .map(|s| s.as_str())
            .filter(|s| !s.is_empty())
    }

    /// Copy of this message carrying the complete synthesized audio.
    pub fn voice_reply(&self, audio: &[u8], text: &str) -> Message {
        self.audio_reply(Segment::voice(encode_audio(audio)), kinds::VOICE, text)
    }

    /// Copy of this message carrying one streamed audio chunk.
    pub fn voice_stream_reply(&self, chunk: &[u8], text: &str) -> Message {
        self.audio_reply(
            Segment::voice_stream(encode_audio(chunk)),
            kinds::VOICE_STREAM,
            text,
        )
    }

    /// Terminal marker so the consumer can tell a complete stream from a truncated one.
    pub fn voice_stream_end(&self, status: &str, chunks: u64, text: &str) -> Message {
        let data = serde_json::json!({ "status": status, "chunks": chunks });
        self.audio_reply(
            Segment::new(kinds::VOICE_STREAM_END, SegmentData::Other(data)),
            kinds::VOICE_STREAM,
            text,
        )
    }

    fn audio_reply(&self, segment: Segment, content_format: &str, text: &str) -> Message {
        let mut reply = self.clone();
        reply.segment = segment;
        reply.time_ms = Some(now_ms());
        reply.format.content_format = vec![content_format.to_string()];
        reply.additional_config.insert(
            keys::ORIGINAL_TEXT.to_string(),
            Value::String(text.to_string()),
        );
        reply
    }

    /// Tell the bot core it may answer with `tts_text` when the client accepts voice.
    /// Returns true if the accept list was extended.
    pub fn advertise_tts_capability(&mut self) -> bool {
        let accepts = &mut self.format.accept_format;
        if accepts.iter().any(|f| f == kinds::VOICE) && !accepts.iter().any(|f| f == kinds::TTS_TEXT)
        {
            accepts.push(kinds::TTS_TEXT.to_string());
            return true;
        }
        false
    }
}
