//! Responder stage service (hey_raven_commands → llm_responses)

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use super::history::ConversationHistory;
use super::ollama::{GenerateOptions, LlmError};
use super::prompt::build_prompt;
use super::LlmGateway;
use crate::broker::{
    decode_record, encode_record, Broker, Command, Disposition, Reply, StageHandler, StreamEntry,
};
use crate::config::ResponderConfig;
use crate::stats::StageStats;
use crate::Result;

/// Stage B handler: one command in, at most one reply out.
pub struct ResponderService {
    broker: Arc<dyn Broker>,
    llm: Arc<dyn LlmGateway>,
    history: ConversationHistory,
    config: ResponderConfig,
    /// Bounds concurrent generation calls between the live consumer and
    /// the stale-claim task
    gate: Semaphore,
    stats: Arc<StageStats>,
}

impl ResponderService {
    pub fn new(
        broker: Arc<dyn Broker>,
        llm: Arc<dyn LlmGateway>,
        config: ResponderConfig,
        worker_pool: usize,
        stats: Arc<StageStats>,
    ) -> Self {
        Self {
            broker,
            llm,
            history: ConversationHistory::new(config.history_turns),
            config,
            gate: Semaphore::new(worker_pool),
            stats,
        }
    }
}

#[async_trait]
impl StageHandler for ResponderService {
    async fn handle(&self, entry: &StreamEntry) -> Result<Disposition> {
        let command: Command = match decode_record(&entry.fields) {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!(id = %entry.id, error = %e, "undecodable command, skipping");
                self.stats.record_dropped();
                return Ok(Disposition::Ack);
            }
        };

        tracing::info!(
            id = %entry.id,
            session_uid = %command.session_uid,
            meeting_id = %command.meeting_id,
            question = %command.question,
            "processing wake command"
        );

        let turns = self.history.recent(&command.session_uid, self.config.history_turns);
        let (prompt, language) = build_prompt(
            &self.config.persona_prompt,
            &command.context,
            &turns,
            &command.question,
        );

        let options = GenerateOptions {
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            stop: Vec::new(),
        };

        let generated = {
            let _permit = self.gate.acquire().await.expect("semaphore never closed");
            self.llm.generate(&prompt, &options).await
        };

        let response = match generated {
            Ok(text) if text.is_empty() => {
                // The user still gets auditory feedback downstream
                tracing::warn!(id = %entry.id, "empty completion, using fallback reply");
                language.fallback_reply().to_string()
            }
            Ok(text) => text,
            Err(LlmError::Transient(detail)) => {
                tracing::warn!(id = %entry.id, detail = %detail, "generation failed, will retry");
                return Ok(Disposition::Retry);
            }
            Err(LlmError::Permanent(detail)) => {
                // No reply: the user hears nothing, the pipeline moves on
                tracing::error!(id = %entry.id, detail = %detail, "unprocessable command");
                self.stats.record_dropped();
                return Ok(Disposition::Ack);
            }
        };

        let reply = Reply {
            response: response.clone(),
            session_uid: command.session_uid.clone(),
            meeting_id: command.meeting_id.clone(),
            original_question: command.question.clone(),
            original_timestamp: Some(command.timestamp.clone()),
            timestamp: chrono::Utc::now().to_rfc3339(),
            message_id: uuid::Uuid::new_v4().to_string(),
        };

        let fields = encode_record(&reply)?;
        match self.broker.append(&self.config.output_stream, &fields).await {
            Ok(reply_id) => {
                self.history
                    .record(&command.session_uid, &command.question, &response);
                tracing::info!(
                    command_id = %entry.id,
                    reply_id = %reply_id,
                    message_id = %reply.message_id,
                    "reply emitted"
                );
                self.stats.record_produced();
                Ok(Disposition::Ack)
            }
            Err(e) => {
                tracing::error!(id = %entry.id, error = %e, "reply append failed");
                Ok(Disposition::Retry)
            }
        }
    }
}
