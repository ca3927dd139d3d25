//! End-to-end pipeline flow over the in-memory broker
//!
//! Drives segments through wake detection, reply generation (scripted
//! LLM), and synthesis (scripted TTS engine), and exercises the
//! at-least-once machinery: ack/pending, redelivery via claim, and
//! dead-lettering after the delivery budget.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use raven_pipeline::broker::{
    dead_letter_stream, decode_record, Audio, Broker, Command, Disposition, MemoryBroker,
    Reply, Segment, StageHandler, StageWorker, StreamEntry,
};
use raven_pipeline::broker::encode_record;
use raven_pipeline::config::BrokerConfig;
use raven_pipeline::responder::{GenerateOptions, LlmError, LlmGateway, ResponderService};
use raven_pipeline::synth::{SynthService, TtsGateway, TtsEngine, TtsOutput};
use raven_pipeline::wake::{patterns, WakeDetector, WakeService};
use raven_pipeline::{Language, Result, StageStats};

fn broker_config() -> BrokerConfig {
    BrokerConfig {
        url: String::new(),
        read_count: 10,
        block: Duration::from_millis(0),
        stale_idle: Duration::from_millis(0),
        claim_interval: Duration::from_millis(10),
        max_deliveries: 5,
    }
}

fn responder_config() -> raven_pipeline::config::ResponderConfig {
    raven_pipeline::config::ResponderConfig {
        ollama_url: "http://localhost:11434".to_string(),
        model: "mistral:7b".to_string(),
        api_timeout: Duration::from_secs(1),
        max_retries: 3,
        temperature: 0.7,
        max_tokens: 500,
        history_turns: 10,
        persona_prompt: "You are Raven.".to_string(),
        input_stream: "hey_raven_commands".to_string(),
        output_stream: "llm_responses".to_string(),
        group: "llm_processor_group".to_string(),
        http_port: 0,
    }
}

fn synth_config() -> raven_pipeline::config::SynthConfig {
    raven_pipeline::config::SynthConfig {
        preferred_engine: "scripted".to_string(),
        remote_url: String::new(),
        remote_api_key: None,
        remote_voice: "alloy".to_string(),
        default_language: "en".to_string(),
        timeout: Duration::from_secs(1),
        retry_attempts: 1,
        retry_delay: Duration::from_millis(0),
        max_text_length: 1000,
        input_stream: "llm_responses".to_string(),
        output_stream: "tts_audio_queue".to_string(),
        group: "tts_processor_group".to_string(),
        http_port: 0,
    }
}

/// LLM gateway that answers from a script.
struct ScriptedLlm {
    reply: String,
    failures_before_success: u32,
    calls: AtomicU32,
    permanent: bool,
}

impl ScriptedLlm {
    fn answering(reply: &str) -> Self {
        Self {
            reply: reply.to_string(),
            failures_before_success: 0,
            calls: AtomicU32::new(0),
            permanent: false,
        }
    }

    fn always_unavailable() -> Self {
        Self {
            reply: String::new(),
            failures_before_success: u32::MAX,
            calls: AtomicU32::new(0),
            permanent: false,
        }
    }

    fn rejecting() -> Self {
        Self {
            reply: String::new(),
            failures_before_success: 0,
            calls: AtomicU32::new(0),
            permanent: true,
        }
    }
}

#[async_trait]
impl LlmGateway for ScriptedLlm {
    async fn generate(
        &self,
        _prompt: &str,
        _options: &GenerateOptions,
    ) -> std::result::Result<String, LlmError> {
        if self.permanent {
            return Err(LlmError::Permanent("model not found".to_string()));
        }
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures_before_success {
            return Err(LlmError::Transient("HTTP 503".to_string()));
        }
        Ok(self.reply.clone())
    }

    async fn health(&self) -> bool {
        true
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        Ok(vec!["mistral:7b".to_string()])
    }
}

/// TTS engine that returns a fixed MP3-ish blob.
struct ScriptedTts;

#[async_trait]
impl TtsEngine for ScriptedTts {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn synthesize(&self, _text: &str, _language: Language) -> Result<TtsOutput> {
        Ok(TtsOutput {
            audio: b"ID3 scripted audio bytes".to_vec(),
            format: raven_pipeline::broker::AudioFormat::Mp3,
            engine: "scripted",
        })
    }
}

fn scripted_gateway() -> TtsGateway {
    TtsGateway::new(
        vec![Box::new(ScriptedTts)],
        "scripted",
        1,
        Duration::from_millis(0),
    )
}

async fn push_segment(broker: &MemoryBroker, text: &str, session_uid: &str) {
    let segment = Segment {
        text: text.to_string(),
        session_uid: session_uid.to_string(),
        meeting_id: "M1".to_string(),
        segment_start_s: 0.0,
        segment_end_s: 2.0,
        timestamp: "2025-06-01T10:00:00Z".to_string(),
    };
    broker
        .append("transcripts", &encode_record(&segment).unwrap())
        .await
        .unwrap();
}

/// Read one batch for a handler and process it, acking per disposition.
async fn pump(
    broker: &MemoryBroker,
    stream: &str,
    group: &str,
    handler: &dyn StageHandler,
) -> Vec<Disposition> {
    broker.ensure_group(stream, group).await.unwrap();
    let entries = broker.read_group(stream, group, "test", 100, 0).await.unwrap();

    let mut outcomes = Vec::new();
    for entry in entries {
        let disposition = handler.handle(&entry).await.unwrap();
        if disposition == Disposition::Ack {
            broker.ack(stream, group, &entry.id).await.unwrap();
        }
        outcomes.push(disposition);
    }
    outcomes
}

async fn read_all<T: serde::de::DeserializeOwned>(
    broker: &MemoryBroker,
    stream: &str,
) -> Vec<T> {
    broker.ensure_group(stream, "reader").await.unwrap();
    broker
        .read_group(stream, "reader", "reader", 100, 0)
        .await
        .unwrap()
        .iter()
        .map(|e| decode_record(&e.fields).unwrap())
        .collect()
}

#[tokio::test]
async fn segment_flows_to_audio_with_correlation_preserved() {
    let broker = Arc::new(MemoryBroker::new());

    let wake = WakeService::new(
        Arc::clone(&broker) as Arc<dyn Broker>,
        WakeDetector::new(patterns::shared(None)),
        "hey_raven_commands",
        Arc::new(StageStats::new()),
    );
    let responder = ResponderService::new(
        Arc::clone(&broker) as Arc<dyn Broker>,
        Arc::new(ScriptedLlm::answering("It is 3:30 PM.")),
        responder_config(),
        2,
        Arc::new(StageStats::new()),
    );
    let synth = SynthService::new(
        Arc::clone(&broker) as Arc<dyn Broker>,
        Arc::new(scripted_gateway()),
        synth_config(),
        2,
        Arc::new(StageStats::new()),
    );

    push_segment(&broker, "hey raven what time is it?", "S1").await;

    pump(&broker, "transcripts", "wake_detector_group", &wake).await;
    pump(&broker, "hey_raven_commands", "llm_processor_group", &responder).await;
    pump(&broker, "llm_responses", "tts_processor_group", &synth).await;

    let commands: Vec<Command> = read_all(&broker, "hey_raven_commands").await;
    let replies: Vec<Reply> = read_all(&broker, "llm_responses").await;
    let audios: Vec<Audio> = read_all(&broker, "tts_audio_queue").await;

    assert_eq!(commands.len(), 1);
    assert_eq!(replies.len(), 1);
    assert_eq!(audios.len(), 1);

    // The session uid is propagated verbatim through every stage
    assert_eq!(commands[0].session_uid, "S1");
    assert_eq!(replies[0].session_uid, "S1");
    assert_eq!(audios[0].session_uid, "S1");

    // The message id is minted by the responder and preserved
    assert!(!replies[0].message_id.is_empty());
    assert_eq!(audios[0].message_id, replies[0].message_id);

    assert_eq!(replies[0].response, "It is 3:30 PM.");
    assert_eq!(audios[0].response_text, "It is 3:30 PM.");
    assert_eq!(audios[0].original_question, "what time is it?");
    assert!(!audios[0].audio_data.is_empty());
}

#[tokio::test]
async fn acked_entry_leaves_no_pending() {
    let broker = MemoryBroker::new();
    broker.ensure_group("hey_raven_commands", "g").await.unwrap();

    let command = Command {
        question: "what time is it?".to_string(),
        session_uid: "S1".to_string(),
        meeting_id: "M1".to_string(),
        context: String::new(),
        confidence: 0.9,
        pattern_kind: raven_pipeline::wake::PatternKind::Primary,
        timestamp: "t".to_string(),
    };
    let id = broker
        .append("hey_raven_commands", &encode_record(&command).unwrap())
        .await
        .unwrap();

    let read = broker
        .read_group("hey_raven_commands", "g", "c", 10, 0)
        .await
        .unwrap();
    assert_eq!(read.len(), 1);

    broker.ack("hey_raven_commands", "g", &id).await.unwrap();
    let pending = broker.pending("hey_raven_commands", "g", 10).await.unwrap();
    assert!(pending.is_empty());
}

#[tokio::test]
async fn empty_completion_emits_fallback_reply() {
    let broker = Arc::new(MemoryBroker::new());
    let responder = ResponderService::new(
        Arc::clone(&broker) as Arc<dyn Broker>,
        Arc::new(ScriptedLlm::answering("")),
        responder_config(),
        2,
        Arc::new(StageStats::new()),
    );

    let command = Command {
        question: "what time is it?".to_string(),
        session_uid: "S1".to_string(),
        meeting_id: "M1".to_string(),
        context: String::new(),
        confidence: 0.9,
        pattern_kind: raven_pipeline::wake::PatternKind::Primary,
        timestamp: "t".to_string(),
    };
    broker
        .append("hey_raven_commands", &encode_record(&command).unwrap())
        .await
        .unwrap();

    pump(&broker, "hey_raven_commands", "llm_processor_group", &responder).await;

    let replies: Vec<Reply> = read_all(&broker, "llm_responses").await;
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].response, "I don't have an answer for that right now.");
}

#[tokio::test]
async fn permanent_failure_acks_without_reply() {
    let broker = Arc::new(MemoryBroker::new());
    let responder = ResponderService::new(
        Arc::clone(&broker) as Arc<dyn Broker>,
        Arc::new(ScriptedLlm::rejecting()),
        responder_config(),
        2,
        Arc::new(StageStats::new()),
    );

    let command = Command {
        question: "what?".to_string(),
        session_uid: "S1".to_string(),
        meeting_id: "M1".to_string(),
        context: String::new(),
        confidence: 0.9,
        pattern_kind: raven_pipeline::wake::PatternKind::Primary,
        timestamp: "t".to_string(),
    };
    broker
        .append("hey_raven_commands", &encode_record(&command).unwrap())
        .await
        .unwrap();

    let outcomes = pump(&broker, "hey_raven_commands", "llm_processor_group", &responder).await;
    assert_eq!(outcomes, vec![Disposition::Ack]);

    let info = broker.stream_info("llm_responses").await.unwrap();
    assert_eq!(info.length, 0);
}

#[tokio::test]
async fn unavailable_llm_dead_letters_after_max_deliveries() {
    let broker = Arc::new(MemoryBroker::new());
    let stats = Arc::new(StageStats::new());
    let config = broker_config();

    let responder: Arc<dyn StageHandler> = Arc::new(ResponderService::new(
        Arc::clone(&broker) as Arc<dyn Broker>,
        Arc::new(ScriptedLlm::always_unavailable()),
        responder_config(),
        2,
        Arc::clone(&stats),
    ));

    let (_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let worker = StageWorker::new(
        Arc::clone(&broker) as Arc<dyn Broker>,
        "hey_raven_commands",
        "llm_processor_group",
        "llm-test",
        config.clone(),
        stats,
        shutdown_rx,
    );
    worker.bootstrap().await.unwrap();

    let command = Command {
        question: "what time is it?".to_string(),
        session_uid: "S1".to_string(),
        meeting_id: "M1".to_string(),
        context: String::new(),
        confidence: 0.9,
        pattern_kind: raven_pipeline::wake::PatternKind::Primary,
        timestamp: "t".to_string(),
    };
    broker
        .append("hey_raven_commands", &encode_record(&command).unwrap())
        .await
        .unwrap();

    // First delivery through the normal read path
    let entries = broker
        .read_group("hey_raven_commands", "llm_processor_group", "llm-test", 10, 0)
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(
        responder.handle(&entries[0]).await.unwrap(),
        Disposition::Retry
    );

    // Claim sweeps redeliver until the budget is spent, then divert
    for _ in 0..config.max_deliveries {
        worker.claim_stale(responder.as_ref()).await.unwrap();
    }

    let dlq: Vec<StreamEntry> = {
        let dlq_stream = dead_letter_stream("hey_raven_commands");
        broker.ensure_group(&dlq_stream, "probe").await.unwrap();
        broker
            .read_group(&dlq_stream, "probe", "probe", 10, 0)
            .await
            .unwrap()
    };
    assert_eq!(dlq.len(), 1);
    assert_eq!(
        dlq[0].fields.get("dlq_reason").map(String::as_str),
        Some("max deliveries exceeded")
    );

    // The source entry is gone from pending and no reply was emitted
    let pending = broker
        .pending("hey_raven_commands", "llm_processor_group", 10)
        .await
        .unwrap();
    assert!(pending.is_empty());
    let info = broker.stream_info("llm_responses").await.unwrap();
    assert_eq!(info.length, 0);
}

#[tokio::test]
async fn conversation_history_feeds_following_prompts() {
    let broker = Arc::new(MemoryBroker::new());
    let responder = ResponderService::new(
        Arc::clone(&broker) as Arc<dyn Broker>,
        Arc::new(ScriptedLlm::answering("Noted.")),
        responder_config(),
        2,
        Arc::new(StageStats::new()),
    );

    for question in ["remember the budget", "what did I ask before?"] {
        let command = Command {
            question: question.to_string(),
            session_uid: "S1".to_string(),
            meeting_id: "M1".to_string(),
            context: String::new(),
            confidence: 0.9,
            pattern_kind: raven_pipeline::wake::PatternKind::Primary,
            timestamp: "t".to_string(),
        };
        broker
            .append("hey_raven_commands", &encode_record(&command).unwrap())
            .await
            .unwrap();
    }

    pump(&broker, "hey_raven_commands", "llm_processor_group", &responder).await;

    let replies: Vec<Reply> = read_all(&broker, "llm_responses").await;
    assert_eq!(replies.len(), 2);
    // Each reply gets its own message id
    assert_ne!(replies[0].message_id, replies[1].message_id);
}
