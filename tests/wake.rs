//! Wake detector integration tests
//!
//! Exercises detection, question extraction, and rate limiting over the
//! in-memory broker, without a recognizer or Redis server.

use std::collections::HashMap;
use std::sync::Arc;

use raven_pipeline::broker::{
    decode_record, encode_record, Broker, Command, MemoryBroker, Segment, StreamEntry,
};
use raven_pipeline::broker::{Disposition, StageHandler};
use raven_pipeline::wake::{patterns, PatternKind, WakeDetector, WakeService};
use raven_pipeline::StageStats;

fn segment(text: &str, session_uid: &str) -> Segment {
    Segment {
        text: text.to_string(),
        session_uid: session_uid.to_string(),
        meeting_id: "M1".to_string(),
        segment_start_s: 12.5,
        segment_end_s: 15.0,
        timestamp: "2025-06-01T10:00:00Z".to_string(),
    }
}

fn entry(segment: &Segment) -> StreamEntry {
    StreamEntry {
        id: "1-0".to_string(),
        fields: encode_record(segment).unwrap().into_iter().collect(),
    }
}

fn service(broker: Arc<MemoryBroker>) -> WakeService {
    WakeService::new(
        broker,
        WakeDetector::new(patterns::shared(None)),
        "hey_raven_commands",
        Arc::new(StageStats::new()),
    )
}

async fn emitted_commands(broker: &MemoryBroker) -> Vec<Command> {
    broker.ensure_group("hey_raven_commands", "probe").await.unwrap();
    broker
        .read_group("hey_raven_commands", "probe", "probe", 100, 0)
        .await
        .unwrap()
        .iter()
        .map(|e| decode_record(&e.fields).unwrap())
        .collect()
}

#[tokio::test]
async fn segment_with_wake_phrase_becomes_a_command() {
    let broker = Arc::new(MemoryBroker::new());
    let service = service(Arc::clone(&broker));

    let s = segment("hey raven what time is it?", "S1");
    assert_eq!(service.handle(&entry(&s)).await.unwrap(), Disposition::Ack);

    let commands = emitted_commands(&broker).await;
    assert_eq!(commands.len(), 1);

    let command = &commands[0];
    assert_eq!(command.question, "what time is it?");
    assert_eq!(command.session_uid, "S1");
    assert_eq!(command.meeting_id, "M1");
    assert_eq!(command.pattern_kind, PatternKind::Primary);
    assert!((command.confidence - 0.9).abs() < f64::EPSILON);
    assert!(command.context.contains("12.5s-15.0s"));
}

#[tokio::test]
async fn fuzzy_phrase_is_detected_only_when_enabled() {
    let broker = Arc::new(MemoryBroker::new());
    let service = service(Arc::clone(&broker));

    let s = segment("hey haven can you help", "S1");
    service.handle(&entry(&s)).await.unwrap();

    let commands = emitted_commands(&broker).await;
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].pattern_kind, PatternKind::Fuzzy);

    // Same phrase with fuzzy disabled produces nothing
    let strict = {
        let mut p = raven_pipeline::wake::WakePatterns::default();
        p.fuzzy.enabled = false;
        WakeService::new(
            Arc::clone(&broker) as Arc<dyn Broker>,
            WakeDetector::new(Arc::new(std::sync::RwLock::new(p))),
            "strict_commands",
            Arc::new(StageStats::new()),
        )
    };
    let s2 = segment("hey haven can you help", "S9");
    strict.handle(&entry(&s2)).await.unwrap();

    let info = broker.stream_info("strict_commands").await.unwrap();
    assert_eq!(info.length, 0);
}

#[tokio::test]
async fn cooldown_admits_only_the_first_of_two_close_segments() {
    let broker = Arc::new(MemoryBroker::new());
    let service = service(Arc::clone(&broker));

    // Two matching segments for the same session, back to back,
    // inside the 3 s cooldown
    let s1 = segment("hey raven what time is it?", "S1");
    let s2 = segment("hey raven what day is it?", "S1");
    service.handle(&entry(&s1)).await.unwrap();
    service.handle(&entry(&s2)).await.unwrap();

    let commands = emitted_commands(&broker).await;
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].question, "what time is it?");
}

#[tokio::test]
async fn cooldown_is_per_session() {
    let broker = Arc::new(MemoryBroker::new());
    let service = service(Arc::clone(&broker));

    for session in ["S1", "S2", "S3"] {
        let s = segment("hey raven what time is it?", session);
        service.handle(&entry(&s)).await.unwrap();
    }

    assert_eq!(emitted_commands(&broker).await.len(), 3);
}

#[tokio::test]
async fn boundary_segments_produce_no_commands() {
    let broker = Arc::new(MemoryBroker::new());
    let service = service(Arc::clone(&broker));

    for text in ["", "   ", "hey raven", "no wake phrase here at all"] {
        let s = segment(text, "S-bound");
        assert_eq!(service.handle(&entry(&s)).await.unwrap(), Disposition::Ack);
    }

    let info = broker.stream_info("hey_raven_commands").await.unwrap();
    assert_eq!(info.length, 0);
}

#[tokio::test]
async fn flat_shape_segments_are_accepted() {
    let broker = Arc::new(MemoryBroker::new());
    let service = service(Arc::clone(&broker));

    let mut fields = HashMap::new();
    fields.insert("text".to_string(), "hey raven what time is it?".to_string());
    fields.insert("session_uid".to_string(), "S1".to_string());
    fields.insert("meeting_id".to_string(), "M1".to_string());
    fields.insert("timestamp".to_string(), "2025-06-01T10:00:00Z".to_string());

    let entry = StreamEntry {
        id: "1-0".to_string(),
        fields,
    };
    assert_eq!(service.handle(&entry).await.unwrap(), Disposition::Ack);

    let commands = emitted_commands(&broker).await;
    assert_eq!(commands.len(), 1);
    // Emitted shape is canonical regardless of input shape
    assert_eq!(commands[0].session_uid, "S1");
}
