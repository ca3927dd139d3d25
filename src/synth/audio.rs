//! Audio blob utilities
//!
//! Base64 transport codec, container sniffing, size guards, and the
//! bitrate-based duration estimate carried in audio metadata. All
//! processing is in memory; audio never touches the filesystem.

use base64::Engine as _;

use crate::broker::{AudioFormat, AudioMetadata};
use crate::{Error, Result};

/// Blobs above this size are rejected before they reach the stream.
pub const MAX_AUDIO_BYTES: usize = 5 * 1024 * 1024;

/// Assumed MP3 bitrate for duration estimation: 64 kbps ≈ 8 KB/s.
const MP3_BYTES_PER_SECOND: f64 = 8000.0;

/// Encode an audio blob for transport in a text stream field.
#[must_use]
pub fn encode_base64(audio: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(audio)
}

/// Decode a transported blob back to bytes.
///
/// # Errors
///
/// Returns error if the input is not valid base64.
pub fn decode_base64(encoded: &str) -> Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| Error::Audio(format!("bad base64 audio: {e}")))
}

/// Validate a synthesized blob before it is shipped: non-empty, under
/// the size ceiling, and carrying a recognizable container header when
/// one is expected.
#[must_use]
pub fn validate_audio(audio: &[u8]) -> bool {
    if audio.is_empty() {
        tracing::warn!("audio blob is empty");
        return false;
    }
    if audio.len() > MAX_AUDIO_BYTES {
        tracing::warn!(size = audio.len(), max = MAX_AUDIO_BYTES, "audio blob too large");
        return false;
    }

    if sniff_format(audio).is_none() {
        // Engines occasionally emit raw frames without a header
        tracing::debug!("unknown audio container, assuming valid");
    }
    true
}

/// Detect the container from magic bytes.
#[must_use]
pub fn sniff_format(audio: &[u8]) -> Option<AudioFormat> {
    if audio.len() >= 3 && (&audio[..3] == b"ID3" || audio[..2] == [0xFF, 0xFB]) {
        return Some(AudioFormat::Mp3);
    }
    if audio.len() >= 12 && &audio[..4] == b"RIFF" && &audio[8..12] == b"WAVE" {
        return Some(AudioFormat::Wav);
    }
    None
}

/// Estimate playback duration in seconds.
///
/// MP3 uses the configured-bitrate approximation; WAV reads the byte
/// rate from its header. Returns `None` when no estimate is possible.
#[must_use]
pub fn estimate_duration(audio: &[u8], format: AudioFormat) -> Option<f64> {
    match format {
        AudioFormat::Mp3 => {
            let secs = audio.len() as f64 / MP3_BYTES_PER_SECOND;
            Some((secs * 100.0).round() / 100.0)
        }
        AudioFormat::Wav => {
            if audio.len() < 44 {
                return None;
            }
            let byte_rate =
                u32::from_le_bytes([audio[28], audio[29], audio[30], audio[31]]) as f64;
            if byte_rate <= 0.0 {
                return None;
            }
            let data_len = (audio.len() - 44) as f64;
            Some((data_len / byte_rate * 100.0).round() / 100.0)
        }
    }
}

/// Build the metadata record shipped alongside the blob.
#[must_use]
pub fn build_metadata(audio: &[u8], format: AudioFormat, engine: &str) -> AudioMetadata {
    AudioMetadata {
        format,
        size_bytes: audio.len() as u64,
        duration_s: estimate_duration(audio, format),
        engine: engine.to_string(),
    }
}

/// Collapse whitespace and enforce the synthesis length ceiling. Text
/// over the limit is truncated at a word boundary with an ellipsis so
/// the spoken reply trails off instead of cutting mid-word.
#[must_use]
pub fn clean_text(text: &str, max_chars: usize) -> Option<String> {
    let cleaned = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if cleaned.is_empty() {
        return None;
    }
    if cleaned.chars().count() <= max_chars {
        return Some(cleaned);
    }

    let head: String = cleaned.chars().take(max_chars).collect();
    let cut = head.rfind(' ').unwrap_or(head.len());
    Some(format!("{}…", &head[..cut]))
}
