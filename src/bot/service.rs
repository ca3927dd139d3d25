//! Bot stage service (tts_audio_queue → in-meeting playback)
//!
//! Two cooperating tasks: the broker consumer decodes, validates, and
//! gates audio records, handing admitted blobs to the player task; the
//! player task owns the state machine and the browser bridge. The bot
//! context is explicit and owned top-down: service owns the session
//! binding and the player, the player owns the queue, the queue owns
//! the blobs. Callbacks refer to entries by message id only.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use super::bridge::{BridgeEvent, PlaybackBridge};
use super::player::{AudioPlayer, QueuedAudio};
use super::session::{GateDecision, SessionBinding};
use crate::broker::{decode_record, Audio, Disposition, StageHandler, StreamEntry};
use crate::config::BotConfig;
use crate::stats::StageStats;
use crate::synth::audio::decode_base64;
use crate::Result;

/// Bound on admitted-but-unplayed blobs between consumer and player.
const PLAYER_QUEUE_BUFFER: usize = 32;

/// Broker-side handler: validates and gates audio records, forwarding
/// admitted blobs to the player task.
pub struct AudioGateHandler {
    binding: Arc<SessionBinding>,
    player_tx: mpsc::Sender<QueuedAudio>,
    stats: Arc<StageStats>,
}

impl AudioGateHandler {
    pub fn new(
        binding: Arc<SessionBinding>,
        player_tx: mpsc::Sender<QueuedAudio>,
        stats: Arc<StageStats>,
    ) -> Self {
        Self {
            binding,
            player_tx,
            stats,
        }
    }
}

#[async_trait]
impl StageHandler for AudioGateHandler {
    async fn handle(&self, entry: &StreamEntry) -> Result<Disposition> {
        let audio: Audio = match decode_record(&entry.fields) {
            Ok(audio) => audio,
            Err(e) => {
                tracing::warn!(id = %entry.id, error = %e, "undecodable audio record, skipping");
                self.stats.record_dropped();
                return Ok(Disposition::Ack);
            }
        };

        // A record without payload or correlation id can never play
        if audio.audio_data.is_empty() || audio.message_id.is_empty() {
            tracing::warn!(
                id = %entry.id,
                session_uid = %audio.session_uid,
                has_audio = !audio.audio_data.is_empty(),
                has_message_id = !audio.message_id.is_empty(),
                "invalid audio record, dropping"
            );
            self.stats.record_dropped();
            return Ok(Disposition::Ack);
        }

        match self.binding.gate(&audio.session_uid) {
            GateDecision::Match => {}
            GateDecision::DegradedMatch => {
                tracing::warn!(
                    id = %entry.id,
                    connection_id = %self.binding.connection_id(),
                    audio_session_uid = %audio.session_uid,
                    "audio matched on connection id only (degraded)"
                );
            }
            GateDecision::Mismatch { bot_session_uid } => {
                tracing::info!(
                    id = %entry.id,
                    audio_session_uid = %audio.session_uid,
                    bot_session_uid = ?bot_session_uid,
                    connection_id = %self.binding.connection_id(),
                    "audio for another session, dropping"
                );
                self.stats.record_dropped();
                return Ok(Disposition::Ack);
            }
        }

        let blob = match decode_base64(&audio.audio_data) {
            Ok(blob) => blob,
            Err(e) => {
                tracing::warn!(id = %entry.id, error = %e, "audio blob undecodable, dropping");
                self.stats.record_dropped();
                return Ok(Disposition::Ack);
            }
        };

        let item = QueuedAudio {
            message_id: audio.message_id.clone(),
            audio: blob,
            duration_s: audio.audio_metadata.duration_s,
        };

        // A full queue means the player is behind; redelivery will
        // bring the record back
        match self.player_tx.try_send(item) {
            Ok(()) => {
                self.stats.record_produced();
                Ok(Disposition::Ack)
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(id = %entry.id, "player queue full, leaving for redelivery");
                Ok(Disposition::Retry)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!(id = %entry.id, "player stopped, leaving for redelivery");
                Ok(Disposition::Retry)
            }
        }
    }
}

/// The player task: owns the state machine, reacts to admitted audio,
/// bridge events, playback deadlines, and the shutdown signal.
pub struct BotService {
    binding: Arc<SessionBinding>,
    player: AudioPlayer,
    audio_rx: mpsc::Receiver<QueuedAudio>,
    events_rx: mpsc::Receiver<BridgeEvent>,
    shutdown: watch::Receiver<bool>,
    drain_timeout: std::time::Duration,
}

impl BotService {
    /// Wire the player task and hand back the sender side for the
    /// [`AudioGateHandler`].
    pub fn new(
        binding: Arc<SessionBinding>,
        bridge: Arc<dyn PlaybackBridge>,
        events_rx: mpsc::Receiver<BridgeEvent>,
        config: &BotConfig,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, mpsc::Sender<QueuedAudio>) {
        let (audio_tx, audio_rx) = mpsc::channel(PLAYER_QUEUE_BUFFER);
        let player = AudioPlayer::new(
            bridge,
            config.dedupe_window,
            config.fallback_cap,
            config.playback_grace,
        );

        (
            Self {
                binding,
                player,
                audio_rx,
                events_rx,
                shutdown,
                drain_timeout: config.drain_timeout,
            },
            audio_tx,
        )
    }

    /// Run until shutdown, then drain and return.
    pub async fn run(mut self) {
        tracing::info!(
            connection_id = %self.binding.connection_id(),
            meeting_id = %self.binding.meeting_id(),
            "player task started"
        );

        loop {
            let deadline = self.player.playback_deadline();

            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                item = self.audio_rx.recv() => {
                    match item {
                        Some(item) => {
                            self.player.enqueue(item).await;
                        }
                        None => break,
                    }
                }
                event = self.events_rx.recv() => {
                    match event {
                        Some(event) => self.handle_event(event).await,
                        None => {
                            // Browser went away; playback can no longer
                            // complete, stop cleanly
                            tracing::warn!("bridge event stream closed");
                            break;
                        }
                    }
                }
                () = maybe_sleep_until(deadline) => {
                    self.player.on_playback_timeout().await;
                }
            }
        }

        self.drain().await;
    }

    async fn handle_event(&mut self, event: BridgeEvent) {
        match event {
            BridgeEvent::PlaybackComplete { message_id } => {
                self.player.on_playback_complete(&message_id).await;
            }
            BridgeEvent::SessionUidUpdate { uid } => {
                self.binding.update_session_uid(uid);
            }
        }
    }

    /// Finish the current playback (bounded) and stop.
    async fn drain(&mut self) {
        self.player.begin_drain();
        if self.player.drained() {
            tracing::info!("drain complete, nothing was playing");
            return;
        }

        let hard_stop = tokio::time::Instant::now() + self.drain_timeout;
        loop {
            tokio::select! {
                event = self.events_rx.recv() => {
                    match event {
                        Some(event) => {
                            self.handle_event(event).await;
                            if self.player.drained() {
                                tracing::info!("drain complete");
                                return;
                            }
                        }
                        None => break,
                    }
                }
                () = maybe_sleep_until(self.player.playback_deadline()) => {
                    self.player.on_playback_timeout().await;
                    if self.player.drained() {
                        return;
                    }
                }
                () = tokio::time::sleep_until(hard_stop) => {
                    tracing::warn!("drain hard timeout, abandoning current playback");
                    return;
                }
            }
        }
    }
}

/// Sleep until the instant, or forever when there is none.
async fn maybe_sleep_until(deadline: Option<std::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{encode_record, AudioFormat, AudioMetadata};
    use crate::synth::audio::encode_base64;

    fn audio_record(session_uid: &str, message_id: &str) -> Audio {
        Audio {
            audio_data: encode_base64(b"ID3blob"),
            audio_metadata: AudioMetadata {
                format: AudioFormat::Mp3,
                size_bytes: 7,
                duration_s: Some(1.0),
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

    fn handler(
        binding: Arc<SessionBinding>,
    ) -> (AudioGateHandler, mpsc::Receiver<QueuedAudio>) {
        let (tx, rx) = mpsc::channel(4);
        (
            AudioGateHandler::new(binding, tx, Arc::new(StageStats::new())),
            rx,
        )
    }

    #[tokio::test]
    async fn matching_audio_reaches_the_player() {
        let binding = Arc::new(SessionBinding::new("C1", "M1"));
        binding.update_session_uid("S1");
        let (h, mut rx) = handler(binding);

        let disposition = h.handle(&entry_for(&audio_record("S1", "R1"))).await.unwrap();
        assert_eq!(disposition, Disposition::Ack);

        let item = rx.try_recv().unwrap();
        assert_eq!(item.message_id, "R1");
        assert_eq!(item.audio, b"ID3blob");
    }

    #[tokio::test]
    async fn foreign_session_audio_is_dropped() {
        let binding = Arc::new(SessionBinding::new("C1", "M1"));
        binding.update_session_uid("S1");
        let (h, mut rx) = handler(binding);

        let disposition = h.handle(&entry_for(&audio_record("S2", "R1"))).await.unwrap();
        assert_eq!(disposition, Disposition::Ack);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn empty_payload_or_message_id_is_dropped() {
        let binding = Arc::new(SessionBinding::new("C1", "M1"));
        binding.update_session_uid("S1");
        let (h, mut rx) = handler(binding);

        let mut no_audio = audio_record("S1", "R1");
        no_audio.audio_data = String::new();
        assert_eq!(
            h.handle(&entry_for(&no_audio)).await.unwrap(),
            Disposition::Ack
        );

        let mut no_id = audio_record("S1", "");
        no_id.message_id = String::new();
        assert_eq!(
            h.handle(&entry_for(&no_id)).await.unwrap(),
            Disposition::Ack
        );

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_player_queue_defers_to_redelivery() {
        let binding = Arc::new(SessionBinding::new("C1", "M1"));
        binding.update_session_uid("S1");

        let (tx, _rx) = mpsc::channel(1);
        let h = AudioGateHandler::new(binding, tx, Arc::new(StageStats::new()));

        assert_eq!(
            h.handle(&entry_for(&audio_record("S1", "R1"))).await.unwrap(),
            Disposition::Ack
        );
        assert_eq!(
            h.handle(&entry_for(&audio_record("S1", "R2"))).await.unwrap(),
            Disposition::Retry
        );
    }
}
