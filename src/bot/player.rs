//! Playback state machine and FIFO audio queue
//!
//! One player per bot process. Strict FIFO within the session, no
//! concurrent playback, and the microphone is muted for the entire
//! play interval. A duration-derived timeout guarantees a hung
//! playback cannot wedge the queue.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::bridge::PlaybackBridge;

/// Player lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    /// Nothing queued or playing
    Idle,
    /// A blob is playing; the mic is muted
    Playing,
    /// Shutting down: no new audio, current playback may finish
    Draining,
}

/// One admitted audio blob awaiting playback.
#[derive(Debug, Clone)]
pub struct QueuedAudio {
    pub message_id: String,
    pub audio: Vec<u8>,
    /// Estimated duration from the audio metadata
    pub duration_s: Option<f64>,
}

#[derive(Debug)]
struct CurrentPlayback {
    message_id: String,
    deadline: Instant,
}

/// FIFO audio player driving the browser bridge.
pub struct AudioPlayer {
    bridge: Arc<dyn PlaybackBridge>,
    state: PlaybackState,
    queue: VecDeque<QueuedAudio>,
    current: Option<CurrentPlayback>,
    /// Message ids seen recently, for duplicate suppression
    seen: HashMap<String, Instant>,
    dedupe_window: Duration,
    fallback_cap: Duration,
    grace: Duration,
}

impl AudioPlayer {
    #[must_use]
    pub fn new(
        bridge: Arc<dyn PlaybackBridge>,
        dedupe_window: Duration,
        fallback_cap: Duration,
        grace: Duration,
    ) -> Self {
        Self {
            bridge,
            state: PlaybackState::Idle,
            queue: VecDeque::new(),
            current: None,
            seen: HashMap::new(),
            dedupe_window,
            fallback_cap,
            grace,
        }
    }

    #[must_use]
    pub const fn state(&self) -> PlaybackState {
        self.state
    }

    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Message id of the blob currently playing.
    #[must_use]
    pub fn now_playing(&self) -> Option<&str> {
        self.current.as_ref().map(|c| c.message_id.as_str())
    }

    /// Deadline after which the current playback is considered hung.
    #[must_use]
    pub fn playback_deadline(&self) -> Option<Instant> {
        self.current.as_ref().map(|c| c.deadline)
    }

    /// Admit a blob to the queue. Returns `false` when draining or when
    /// the message id was already seen inside the dedupe window, so a
    /// redelivered record plays at most once more.
    pub async fn enqueue(&mut self, item: QueuedAudio) -> bool {
        if self.state == PlaybackState::Draining {
            tracing::info!(message_id = %item.message_id, "draining, rejecting new audio");
            return false;
        }

        let now = Instant::now();
        self.seen.retain(|_, at| now.duration_since(*at) < self.dedupe_window);
        if self.seen.contains_key(&item.message_id) {
            tracing::info!(message_id = %item.message_id, "duplicate audio suppressed");
            return false;
        }
        self.seen.insert(item.message_id.clone(), now);

        tracing::debug!(
            message_id = %item.message_id,
            queued = self.queue.len(),
            "audio queued"
        );
        self.queue.push_back(item);

        if self.state == PlaybackState::Idle {
            self.start_next().await;
        }
        true
    }

    /// Browser reported playback finished for `message_id`.
    pub async fn on_playback_complete(&mut self, message_id: &str) {
        let matches = self
            .current
            .as_ref()
            .is_some_and(|c| c.message_id == message_id);
        if !matches {
            tracing::debug!(message_id, "stale playback-complete ignored");
            return;
        }

        tracing::info!(message_id, "playback complete");
        self.finish_current().await;
    }

    /// Enforce the hung-playback timeout. Call when the deadline from
    /// [`Self::playback_deadline`] elapses.
    pub async fn on_playback_timeout(&mut self) {
        let Some(current) = &self.current else {
            return;
        };
        if current.deadline > Instant::now() {
            return;
        }

        tracing::warn!(
            message_id = %current.message_id,
            "playback timed out, recovering"
        );
        self.finish_current().await;
    }

    /// Enter draining: reject new audio and discard the backlog; the
    /// current playback may finish (bounded by its own timeout).
    pub fn begin_drain(&mut self) {
        if self.state != PlaybackState::Draining {
            tracing::info!(
                discarded = self.queue.len(),
                playing = self.current.is_some(),
                "entering drain"
            );
        }
        self.state = PlaybackState::Draining;
        self.queue.clear();
    }

    /// True once draining has nothing left to wait for.
    #[must_use]
    pub fn drained(&self) -> bool {
        self.state == PlaybackState::Draining && self.current.is_none()
    }

    async fn finish_current(&mut self) {
        self.current = None;
        if let Err(e) = self.bridge.set_mic_muted(false).await {
            tracing::error!(error = %e, "failed to unmute microphone");
        }

        if self.state == PlaybackState::Draining {
            return;
        }
        self.start_next().await;
    }

    /// Pop and start the next queued blob. Failed starts unmute and
    /// move on; an empty queue returns the player to idle.
    async fn start_next(&mut self) {
        while let Some(item) = self.queue.pop_front() {
            if let Err(e) = self.bridge.set_mic_muted(true).await {
                tracing::error!(error = %e, "failed to mute microphone");
            }

            match self.bridge.play_audio(&item.audio, &item.message_id).await {
                Ok(()) => {
                    let timeout = self.playback_timeout(item.duration_s);
                    self.current = Some(CurrentPlayback {
                        message_id: item.message_id.clone(),
                        deadline: Instant::now() + timeout,
                    });
                    self.state = PlaybackState::Playing;
                    tracing::info!(
                        message_id = %item.message_id,
                        timeout_s = timeout.as_secs_f64(),
                        "playback started"
                    );
                    return;
                }
                Err(e) => {
                    tracing::error!(
                        message_id = %item.message_id,
                        error = %e,
                        "playback start failed, skipping"
                    );
                    if let Err(e) = self.bridge.set_mic_muted(false).await {
                        tracing::error!(error = %e, "failed to unmute microphone");
                    }
                }
            }
        }

        if self.state != PlaybackState::Draining {
            self.state = PlaybackState::Idle;
        }
        self.current = None;
    }

    /// Timeout: `max(duration, fallback_cap) + grace`.
    fn playback_timeout(&self, duration_s: Option<f64>) -> Duration {
        let duration = duration_s
            .filter(|d| d.is_finite() && *d > 0.0)
            .map_or(Duration::ZERO, Duration::from_secs_f64);
        duration.max(self.fallback_cap) + self.grace
    }
}
