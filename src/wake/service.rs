//! Wake detector stage service (transcripts → hey_raven_commands)

use std::sync::Arc;

use async_trait::async_trait;

use super::detector::WakeDetector;
use crate::broker::{
    decode_record, encode_record, Broker, Command, Disposition, Segment, StageHandler,
    StreamEntry,
};
use crate::stats::StageStats;
use crate::Result;

/// Stage A handler: one segment in, at most one command out.
pub struct WakeService {
    broker: Arc<dyn Broker>,
    detector: WakeDetector,
    output_stream: String,
    stats: Arc<StageStats>,
}

impl WakeService {
    pub fn new(
        broker: Arc<dyn Broker>,
        detector: WakeDetector,
        output_stream: impl Into<String>,
        stats: Arc<StageStats>,
    ) -> Self {
        Self {
            broker,
            detector,
            output_stream: output_stream.into(),
            stats,
        }
    }
}

#[async_trait]
impl StageHandler for WakeService {
    async fn handle(&self, entry: &StreamEntry) -> Result<Disposition> {
        let segment: Segment = match decode_record(&entry.fields) {
            Ok(segment) => segment,
            Err(e) => {
                // Bad data; acknowledge so it never loops
                tracing::warn!(id = %entry.id, error = %e, "undecodable segment, skipping");
                self.stats.record_dropped();
                return Ok(Disposition::Ack);
            }
        };

        let Some(detection) = self
            .detector
            .detect_and_extract(&segment.text, &segment.session_uid)
        else {
            return Ok(Disposition::Ack);
        };

        let command = Command {
            question: detection.question,
            session_uid: segment.session_uid.clone(),
            meeting_id: segment.meeting_id.clone(),
            context: format!(
                "segment {:.1}s-{:.1}s of meeting {}",
                segment.segment_start_s, segment.segment_end_s, segment.meeting_id
            ),
            confidence: detection.confidence,
            pattern_kind: detection.kind,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        let fields = encode_record(&command)?;
        match self.broker.append(&self.output_stream, &fields).await {
            Ok(command_id) => {
                tracing::info!(
                    segment_id = %entry.id,
                    command_id = %command_id,
                    session_uid = %command.session_uid,
                    "command emitted"
                );
                self.stats.record_produced();
                Ok(Disposition::Ack)
            }
            Err(e) => {
                // Command already admitted by the rate limiter; losing
                // it here would silence the user, so retry the segment.
                tracing::error!(id = %entry.id, error = %e, "command append failed");
                Ok(Disposition::Retry)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::wake::patterns;

    fn segment_fields(text: &str, session: &str) -> Vec<(String, String)> {
        let segment = Segment {
            text: text.to_string(),
            session_uid: session.to_string(),
            meeting_id: "M1".to_string(),
            segment_start_s: 12.5,
            segment_end_s: 15.0,
            timestamp: "2025-01-01T00:00:00Z".to_string(),
        };
        encode_record(&segment).unwrap()
    }

    async fn run_one(service: &WakeService, broker: &MemoryBroker, text: &str) -> Disposition {
        let id = broker.append("transcripts", &segment_fields(text, "S1")).await.unwrap();
        let entry = StreamEntry {
            id,
            fields: segment_fields(text, "S1").into_iter().collect(),
        };
        service.handle(&entry).await.unwrap()
    }

    #[tokio::test]
    async fn matching_segment_emits_one_command() {
        let broker = Arc::new(MemoryBroker::new());
        let service = WakeService::new(
            Arc::clone(&broker) as Arc<dyn Broker>,
            WakeDetector::new(patterns::shared(None)),
            "hey_raven_commands",
            Arc::new(StageStats::new()),
        );

        let disposition = run_one(&service, &broker, "hey raven what time is it?").await;
        assert_eq!(disposition, Disposition::Ack);

        let info = broker.stream_info("hey_raven_commands").await.unwrap();
        assert_eq!(info.length, 1);
    }

    #[tokio::test]
    async fn non_matching_segment_emits_nothing() {
        let broker = Arc::new(MemoryBroker::new());
        let service = WakeService::new(
            Arc::clone(&broker) as Arc<dyn Broker>,
            WakeDetector::new(patterns::shared(None)),
            "hey_raven_commands",
            Arc::new(StageStats::new()),
        );

        let disposition = run_one(&service, &broker, "just chatting about lunch").await;
        assert_eq!(disposition, Disposition::Ack);

        let info = broker.stream_info("hey_raven_commands").await.unwrap();
        assert_eq!(info.length, 0);
    }

    #[tokio::test]
    async fn undecodable_segment_is_acked() {
        let broker = Arc::new(MemoryBroker::new());
        let service = WakeService::new(
            Arc::clone(&broker) as Arc<dyn Broker>,
            WakeDetector::new(patterns::shared(None)),
            "hey_raven_commands",
            Arc::new(StageStats::new()),
        );

        let entry = StreamEntry {
            id: "1-0".to_string(),
            fields: [("payload".to_string(), "{broken".to_string())].into_iter().collect(),
        };
        assert_eq!(service.handle(&entry).await.unwrap(), Disposition::Ack);
    }
}
