//! Audio payload helpers shared by providers and message packaging.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::io::Cursor;

/// Sample rate of the PCM16 audio emitted by omni models.
pub const OMNI_SAMPLE_RATE: u32 = 24_000;

/// Base64-encode an audio payload for a `voice`/`voice_stream` segment.
pub fn encode_audio(audio: &[u8]) -> String {
    STANDARD.encode(audio)
}

pub fn decode_base64(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(data.trim())
}

/// Wrap little-endian mono PCM16 samples in a WAV container.
/// A trailing odd byte is ignored.
pub fn pcm16_to_wav(pcm: &[u8], sample_rate: u32) -> Result<Vec<u8>, hound::Error> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::with_capacity(pcm.len() + 44));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        let mut samples = writer.get_i16_writer((pcm.len() / 2) as u32);
        for pair in pcm.chunks_exact(2) {
            samples.write_sample(i16::from_le_bytes([pair[0], pair[1]]));
        }
        samples.flush()?;
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}
