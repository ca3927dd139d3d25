//! Bot player integration tests
//!
//! Runs the full player task against a recording bridge: session
//! gating, FIFO playback with mic coordination, duplicate suppression,
//! and drain-on-shutdown.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use raven_pipeline::bot::{
    AudioGateHandler, BotService, BridgeEvent, PlaybackBridge, QueuedAudio, SessionBinding,
};
use raven_pipeline::broker::{
    encode_record, Audio, AudioFormat, AudioMetadata, Disposition, StageHandler, StreamEntry,
};
use raven_pipeline::config::BotConfig;
use raven_pipeline::synth::audio::encode_base64;
use raven_pipeline::{Result, StageStats};
use tokio::sync::{mpsc, watch};

#[derive(Debug, Default)]
struct RecordingBridge {
    calls: Mutex<Vec<String>>,
}

impl RecordingBridge {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn plays(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with("play:"))
            .collect()
    }
}

#[async_trait]
impl PlaybackBridge for RecordingBridge {
    async fn play_audio(&self, _audio: &[u8], message_id: &str) -> Result<()> {
        self.calls.lock().unwrap().push(format!("play:{message_id}"));
        Ok(())
    }

    async fn set_mic_muted(&self, muted: bool) -> Result<()> {
        self.calls.lock().unwrap().push(format!("mic:{muted}"));
        Ok(())
    }
}

fn bot_config() -> BotConfig {
    BotConfig {
        connection_id: "C1".to_string(),
        meeting_id: "M1".to_string(),
        meeting_url: None,
        manager_url: None,
        audio_stream: "tts_audio_queue".to_string(),
        dedupe_window: Duration::from_secs(300),
        fallback_cap: Duration::from_secs(30),
        playback_grace: Duration::from_secs(2),
        drain_timeout: Duration::from_millis(500),
        http_port: 0,
    }
}

struct Harness {
    bridge: Arc<RecordingBridge>,
    binding: Arc<SessionBinding>,
    audio_tx: mpsc::Sender<QueuedAudio>,
    events_tx: mpsc::Sender<BridgeEvent>,
    shutdown_tx: watch::Sender<bool>,
    run: tokio::task::JoinHandle<()>,
}

fn harness() -> Harness {
    let bridge = Arc::new(RecordingBridge::default());
    let binding = Arc::new(SessionBinding::new("C1", "M1"));
    let (events_tx, events_rx) = mpsc::channel(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (service, audio_tx) = BotService::new(
        Arc::clone(&binding),
        Arc::clone(&bridge) as Arc<dyn PlaybackBridge>,
        events_rx,
        &bot_config(),
        shutdown_rx,
    );
    let run = tokio::spawn(service.run());

    Harness {
        bridge,
        binding,
        audio_tx,
        events_tx,
        shutdown_tx,
        run,
    }
}

fn item(id: &str) -> QueuedAudio {
    QueuedAudio {
        message_id: id.to_string(),
        audio: vec![1, 2, 3],
        duration_s: Some(1.0),
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn plays_in_fifo_order_with_mic_gating() {
    let h = harness();

    h.audio_tx.send(item("R1")).await.unwrap();
    h.audio_tx.send(item("R2")).await.unwrap();
    settle().await;

    h.events_tx
        .send(BridgeEvent::PlaybackComplete {
            message_id: "R1".to_string(),
        })
        .await
        .unwrap();
    settle().await;

    h.events_tx
        .send(BridgeEvent::PlaybackComplete {
            message_id: "R2".to_string(),
        })
        .await
        .unwrap();
    settle().await;

    assert_eq!(h.bridge.plays(), vec!["play:R1", "play:R2"]);
    assert_eq!(
        h.bridge.calls(),
        vec![
            "mic:true", "play:R1", "mic:false", "mic:true", "play:R2", "mic:false"
        ]
    );

    h.shutdown_tx.send(true).unwrap();
    h.run.await.unwrap();
}

#[tokio::test]
async fn duplicate_delivery_plays_at_most_once() {
    let h = harness();

    h.audio_tx.send(item("R1")).await.unwrap();
    h.audio_tx.send(item("R1")).await.unwrap();
    settle().await;

    h.events_tx
        .send(BridgeEvent::PlaybackComplete {
            message_id: "R1".to_string(),
        })
        .await
        .unwrap();
    settle().await;

    assert_eq!(h.bridge.plays(), vec!["play:R1"]);

    h.shutdown_tx.send(true).unwrap();
    h.run.await.unwrap();
}

#[tokio::test]
async fn session_uid_update_rebinds_gating() {
    let h = harness();

    h.events_tx
        .send(BridgeEvent::SessionUidUpdate {
            uid: "S1".to_string(),
        })
        .await
        .unwrap();
    settle().await;

    assert_eq!(h.binding.session_uid().as_deref(), Some("S1"));

    h.shutdown_tx.send(true).unwrap();
    h.run.await.unwrap();
}

#[tokio::test]
async fn shutdown_during_playback_drains_and_stops() {
    let h = harness();

    h.audio_tx.send(item("R1")).await.unwrap();
    h.audio_tx.send(item("R2")).await.unwrap();
    settle().await;

    // Shutdown arrives while R1 is playing; R2 is discarded
    h.shutdown_tx.send(true).unwrap();
    settle().await;

    h.events_tx
        .send(BridgeEvent::PlaybackComplete {
            message_id: "R1".to_string(),
        })
        .await
        .unwrap();

    h.run.await.unwrap();
    assert_eq!(h.bridge.plays(), vec!["play:R1"]);
    // Mic was released at the end of the drained playback
    assert_eq!(h.bridge.calls().last().map(String::as_str), Some("mic:false"));
}

#[tokio::test]
async fn drain_hard_timeout_gives_up_on_hung_playback() {
    let h = harness();

    h.audio_tx.send(item("R1")).await.unwrap();
    settle().await;

    // No completion ever arrives; the drain hard-cap (500 ms) fires
    h.shutdown_tx.send(true).unwrap();
    let started = std::time::Instant::now();
    h.run.await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
}

// Gate handler wiring against full audio records

fn audio_record(session_uid: &str, message_id: &str) -> Audio {
    Audio {
        audio_data: encode_base64(b"ID3blob"),
        audio_metadata: AudioMetadata {
            format: AudioFormat::Mp3,
            size_bytes: 7,
            duration_s: Some(0.5),
            engine: "remote".to_string(),
        },
        session_uid: session_uid.to_string(),
        meeting_id: "M1".to_string(),
        original_question: "q".to_string(),
        response_text: "r".to_string(),
        message_id: message_id.to_string(),
        timestamp: "t".to_string(),
    }
}

fn entry_for(audio: &Audio) -> StreamEntry {
    StreamEntry {
        id: "1-0".to_string(),
        fields: encode_record(audio).unwrap().into_iter().collect(),
    }
}

#[tokio::test]
async fn audio_for_another_session_never_reaches_the_bridge() {
    let h = harness();
    h.events_tx
        .send(BridgeEvent::SessionUidUpdate {
            uid: "S1".to_string(),
        })
        .await
        .unwrap();
    settle().await;

    let gate = AudioGateHandler::new(
        Arc::clone(&h.binding),
        h.audio_tx.clone(),
        Arc::new(StageStats::new()),
    );

    // S2 audio at a bot bound to S1: dropped with a diagnostic, acked
    let foreign = gate.handle(&entry_for(&audio_record("S2", "R9"))).await.unwrap();
    assert_eq!(foreign, Disposition::Ack);

    let own = gate.handle(&entry_for(&audio_record("S1", "R1"))).await.unwrap();
    assert_eq!(own, Disposition::Ack);
    settle().await;

    // Only the bound session's audio played; the mic was never touched
    // for the foreign record
    assert_eq!(h.bridge.plays(), vec!["play:R1"]);

    h.shutdown_tx.send(true).unwrap();
    h.events_tx
        .send(BridgeEvent::PlaybackComplete {
            message_id: "R1".to_string(),
        })
        .await
        .unwrap();
    h.run.await.unwrap();
}
