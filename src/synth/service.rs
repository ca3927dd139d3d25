//! Synthesizer stage service (llm_responses → tts_audio_queue)

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use super::audio::{build_metadata, clean_text, encode_base64};
use super::engine::TtsGateway;
use crate::broker::{
    decode_record, encode_record, Audio, Broker, Disposition, Reply, StageHandler, StreamEntry,
};
use crate::config::SynthConfig;
use crate::language::{self, Language, PREAMBLE_CONFIDENCE};
use crate::stats::StageStats;
use crate::Result;

/// Stage C handler: one reply in, at most one audio record out.
pub struct SynthService {
    broker: Arc<dyn Broker>,
    tts: Arc<TtsGateway>,
    config: SynthConfig,
    /// Bounds concurrent synthesis between the live consumer and the
    /// stale-claim task
    gate: Semaphore,
    stats: Arc<StageStats>,
}

impl SynthService {
    pub fn new(
        broker: Arc<dyn Broker>,
        tts: Arc<TtsGateway>,
        config: SynthConfig,
        worker_pool: usize,
        stats: Arc<StageStats>,
    ) -> Self {
        Self {
            broker,
            tts,
            config,
            gate: Semaphore::new(worker_pool),
            stats,
        }
    }

    /// Pick the synthesis language: confident detection on the reply
    /// text wins, otherwise the configured default.
    fn choose_language(&self, text: &str) -> Language {
        let (detected, confidence) = language::detect(text);
        if confidence >= PREAMBLE_CONFIDENCE && detected != Language::En {
            detected
        } else {
            Language::from_code(&self.config.default_language)
        }
    }
}

#[async_trait]
impl StageHandler for SynthService {
    async fn handle(&self, entry: &StreamEntry) -> Result<Disposition> {
        let reply: Reply = match decode_record(&entry.fields) {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(id = %entry.id, error = %e, "undecodable reply, skipping");
                self.stats.record_dropped();
                return Ok(Disposition::Ack);
            }
        };

        let Some(text) = clean_text(&reply.response, self.config.max_text_length) else {
            tracing::warn!(
                id = %entry.id,
                session_uid = %reply.session_uid,
                "reply text empty after cleaning, skipping"
            );
            self.stats.record_dropped();
            return Ok(Disposition::Ack);
        };

        let lang = self.choose_language(&text);
        tracing::info!(
            id = %entry.id,
            session_uid = %reply.session_uid,
            language = lang.code(),
            chars = text.len(),
            "synthesizing reply"
        );

        let synthesized = {
            let _permit = self.gate.acquire().await.expect("semaphore never closed");
            self.tts.synthesize(&text, lang).await
        };

        let output = match synthesized {
            Ok(output) => output,
            Err(e) => {
                // Both engines failed: graceful silence for this reply
                tracing::error!(
                    id = %entry.id,
                    session_uid = %reply.session_uid,
                    error = %e,
                    "all TTS engines failed, dropping reply"
                );
                self.stats.record_dropped();
                return Ok(Disposition::Ack);
            }
        };

        let audio = Audio {
            audio_data: encode_base64(&output.audio),
            audio_metadata: build_metadata(&output.audio, output.format, output.engine),
            session_uid: reply.session_uid.clone(),
            meeting_id: reply.meeting_id.clone(),
            original_question: reply.original_question.clone(),
            response_text: text,
            message_id: reply.message_id.clone(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        let fields = encode_record(&audio)?;
        match self.broker.append(&self.config.output_stream, &fields).await {
            Ok(audio_id) => {
                tracing::info!(
                    reply_id = %entry.id,
                    audio_id = %audio_id,
                    message_id = %audio.message_id,
                    engine = %audio.audio_metadata.engine,
                    bytes = audio.audio_metadata.size_bytes,
                    "audio emitted"
                );
                self.stats.record_produced();
                Ok(Disposition::Ack)
            }
            Err(e) => {
                tracing::error!(id = %entry.id, error = %e, "audio append failed");
                Ok(Disposition::Retry)
            }
        }
    }
}
