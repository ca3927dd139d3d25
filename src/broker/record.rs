//! Pipeline record types and their stream encoding
//!
//! Every stream entry is a map of string fields. The canonical shape
//! puts the whole record under a single `payload` field as JSON; older
//! producers wrote flat string-field maps instead. [`decode_record`]
//! accepts both, [`encode_record`] emits only the canonical shape.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::wake::PatternKind;
use crate::{Error, Result};

/// Accept a string, number, or bool where a string id is expected.
/// Upstream producers have emitted numeric meeting ids.
fn loose_string<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<String, D::Error> {
    match Value::deserialize(d)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string-like value, got {other}"
        ))),
    }
}

/// Accept a number or a numeric string where an f64 is expected, as the
/// flat wire shape carries every field as a string.
fn loose_f64<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<f64, D::Error> {
    match Value::deserialize(d)? {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| serde::de::Error::custom("number out of f64 range")),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|e| serde::de::Error::custom(format!("bad number {s:?}: {e}"))),
        other => Err(serde::de::Error::custom(format!(
            "expected number, got {other}"
        ))),
    }
}

/// Recognizer transcript segment (`transcripts` stream).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    /// Recognized text
    pub text: String,
    /// Recognizer session identifier, the end-to-end correlation key
    pub session_uid: String,
    /// Meeting identifier
    #[serde(deserialize_with = "loose_string")]
    pub meeting_id: String,
    /// Segment start offset in seconds
    #[serde(default, deserialize_with = "loose_f64")]
    pub segment_start_s: f64,
    /// Segment end offset in seconds
    #[serde(default, deserialize_with = "loose_f64")]
    pub segment_end_s: f64,
    /// ISO-8601 UTC emission time
    pub timestamp: String,
}

/// Admitted wake command (`hey_raven_commands` stream).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    /// Question extracted after the wake phrase
    pub question: String,
    /// Propagated verbatim from the segment
    pub session_uid: String,
    /// Propagated from the segment
    #[serde(deserialize_with = "loose_string")]
    pub meeting_id: String,
    /// Short summary of segment timing for the prompt
    #[serde(default)]
    pub context: String,
    /// Confidence of the matched pattern kind
    #[serde(deserialize_with = "loose_f64")]
    pub confidence: f64,
    /// Which pattern kind matched
    pub pattern_kind: PatternKind,
    /// ISO-8601 UTC emission time
    pub timestamp: String,
}

/// LLM reply (`llm_responses` stream).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    /// Generated reply text
    pub response: String,
    /// Propagated verbatim from the command
    pub session_uid: String,
    /// Always serialized as a string regardless of source type
    #[serde(deserialize_with = "loose_string")]
    pub meeting_id: String,
    /// The question this reply answers
    pub original_question: String,
    /// Timestamp of the originating command
    #[serde(default)]
    pub original_timestamp: Option<String>,
    /// ISO-8601 UTC emission time
    pub timestamp: String,
    /// Fresh UUIDv4 minted by the responder, preserved downstream
    pub message_id: String,
}

/// Audio container format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Mp3,
    Wav,
}

impl AudioFormat {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Mp3 => "mp3",
            Self::Wav => "wav",
        }
    }
}

/// Descriptor attached to every audio record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioMetadata {
    /// Container format of the blob
    pub format: AudioFormat,
    /// Uncompressed blob size
    pub size_bytes: u64,
    /// Estimated playback duration, when derivable
    #[serde(default)]
    pub duration_s: Option<f64>,
    /// Engine that produced the blob
    pub engine: String,
}

/// Synthesized audio record (`tts_audio_queue` stream).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Audio {
    /// Base64-encoded audio blob
    pub audio_data: String,
    /// Blob descriptor
    pub audio_metadata: AudioMetadata,
    /// Propagated verbatim from the reply
    pub session_uid: String,
    /// Propagated from the reply
    #[serde(deserialize_with = "loose_string")]
    pub meeting_id: String,
    /// The question that started this exchange
    pub original_question: String,
    /// The reply text that was synthesized
    pub response_text: String,
    /// Preserved from the reply; the player tracks playback by it
    pub message_id: String,
    /// ISO-8601 UTC emission time
    pub timestamp: String,
}

/// Encode a record into the canonical single-`payload` field list.
///
/// # Errors
///
/// Returns error if the record fails to serialize.
pub fn encode_record<T: Serialize>(record: &T) -> Result<Vec<(String, String)>> {
    let payload = serde_json::to_string(record)?;
    Ok(vec![("payload".to_string(), payload)])
}

/// Decode a record from either wire shape: a `payload` field carrying a
/// JSON object, or flat string fields.
///
/// In the flat shape, values that parse as JSON objects or arrays (for
/// example an inlined `audio_metadata`) are kept structured; everything
/// else stays a string and the record types accept stringly numbers.
///
/// # Errors
///
/// Returns error if neither shape yields the expected record.
pub fn decode_record<T: DeserializeOwned>(fields: &HashMap<String, String>) -> Result<T> {
    if let Some(payload) = fields.get("payload") {
        return serde_json::from_str(payload)
            .map_err(|e| Error::Record(format!("bad payload JSON: {e}")));
    }

    let mut map = serde_json::Map::new();
    for (key, value) in fields {
        let parsed = serde_json::from_str::<Value>(value)
            .ok()
            .filter(|v| v.is_object() || v.is_array())
            .unwrap_or_else(|| Value::String(value.clone()));
        map.insert(key.clone(), parsed);
    }

    serde_json::from_value(Value::Object(map))
        .map_err(|e| Error::Record(format!("bad flat record: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_reply() -> Reply {
        Reply {
            response: "It is 3:30 PM.".to_string(),
            session_uid: "S1".to_string(),
            meeting_id: "M1".to_string(),
            original_question: "what time is it?".to_string(),
            original_timestamp: None,
            timestamp: "2025-01-01T00:00:00Z".to_string(),
            message_id: "R1".to_string(),
        }
    }

    #[test]
    fn payload_shape_round_trips() {
        let reply = sample_reply();
        let fields: HashMap<String, String> =
            encode_record(&reply).unwrap().into_iter().collect();
        assert!(fields.contains_key("payload"));

        let decoded: Reply = decode_record(&fields).unwrap();
        assert_eq!(decoded.response, reply.response);
        assert_eq!(decoded.message_id, reply.message_id);
    }

    #[test]
    fn flat_shape_is_accepted() {
        let mut fields = HashMap::new();
        fields.insert("text".to_string(), "hey raven what time is it?".to_string());
        fields.insert("session_uid".to_string(), "S1".to_string());
        fields.insert("meeting_id".to_string(), "M1".to_string());
        fields.insert("segment_start_s".to_string(), "12.5".to_string());
        fields.insert("segment_end_s".to_string(), "15.0".to_string());
        fields.insert("timestamp".to_string(), "2025-01-01T00:00:00Z".to_string());

        let segment: Segment = decode_record(&fields).unwrap();
        assert_eq!(segment.session_uid, "S1");
        assert!((segment.segment_start_s - 12.5).abs() < f64::EPSILON);
    }

    #[test]
    fn numeric_meeting_id_is_coerced_to_string() {
        let mut fields = HashMap::new();
        fields.insert(
            "payload".to_string(),
            r#"{"text":"hi","session_uid":"S1","meeting_id":42,"timestamp":"t"}"#.to_string(),
        );

        let segment: Segment = decode_record(&fields).unwrap();
        assert_eq!(segment.meeting_id, "42");
    }

    #[test]
    fn missing_required_field_is_an_error() {
        let mut fields = HashMap::new();
        fields.insert("payload".to_string(), r#"{"text":"hi"}"#.to_string());
        assert!(decode_record::<Segment>(&fields).is_err());
    }

    #[test]
    fn malformed_payload_is_an_error() {
        let mut fields = HashMap::new();
        fields.insert("payload".to_string(), "{not json".to_string());
        assert!(decode_record::<Reply>(&fields).is_err());
    }
}
