//! Host ↔ browser function bridge
//!
//! The playback path crosses into the meeting browser: the host asks
//! the page to play a blob or toggle the microphone track, and the page
//! notifies the host when playback completes or when the recognizer
//! WebSocket learns its session uid. The channel is deliberately
//! narrow: two outbound calls, two inbound event kinds, all JSON.

use async_trait::async_trait;
use base64::Engine as _;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;
use chromiumoxide::cdp::js_protocol::runtime::{AddBindingParams, EventBindingCalled};
use chromiumoxide::Page;
use futures::StreamExt as _;
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::{Error, Result};

/// Name of the CDP binding the page calls to reach the host.
const HOST_BINDING: &str = "ravenHostEvent";

/// Buffered bridge events before backpressure.
const EVENT_BUFFER: usize = 64;

/// Script installed on every new document: playback and microphone
/// helpers on `window.__raven`, reporting back through the binding.
const PAGE_HELPERS_JS: &str = r#"
(() => {
  const notify = (msg) => {
    if (window.ravenHostEvent) { window.ravenHostEvent(JSON.stringify(msg)); }
  };
  window.__raven = {
    playAudio(b64, messageId) {
      const audio = new Audio('data:audio/mpeg;base64,' + b64);
      audio.onended = () => notify({ kind: 'playback_complete', message_id: messageId });
      audio.onerror = () => notify({ kind: 'playback_complete', message_id: messageId });
      return audio.play().catch(() => {
        notify({ kind: 'playback_complete', message_id: messageId });
      });
    },
    setMicMuted(muted) {
      const tracks = window.__ravenMicStream ? window.__ravenMicStream.getAudioTracks() : [];
      for (const track of tracks) { track.enabled = !muted; }
      return tracks.length;
    },
    updateSessionUid(uid) {
      notify({ kind: 'session_uid_update', uid: uid });
    },
  };
})();
"#;

/// Notification from the browser side of the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    /// The blob for `message_id` finished (or failed) playing
    PlaybackComplete { message_id: String },
    /// The recognizer WebSocket reported its server-assigned uid
    SessionUidUpdate { uid: String },
}

#[derive(Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum WireEvent {
    PlaybackComplete { message_id: String },
    SessionUidUpdate { uid: String },
}

/// Outbound half of the bridge: host-initiated browser calls.
#[async_trait]
pub trait PlaybackBridge: Send + Sync {
    /// Decode and play the blob through the meeting's audio output.
    async fn play_audio(&self, audio: &[u8], message_id: &str) -> Result<()>;

    /// Mute or unmute the bot's microphone input track.
    async fn set_mic_muted(&self, muted: bool) -> Result<()>;
}

/// Launch the meeting browser and open the meeting page.
///
/// The CDP handler task runs for the life of the browser; dropping the
/// returned [`chromiumoxide::Browser`] tears everything down.
///
/// # Errors
///
/// Returns error if Chrome fails to launch or the page cannot open.
pub async fn launch_meeting_browser(meeting_url: &str) -> Result<(Browser, Page)> {
    let config = BrowserConfig::builder()
        .arg("--headless=new")
        .arg("--disable-gpu")
        .arg("--no-sandbox")
        .arg("--disable-dev-shm-usage")
        .arg("--use-fake-ui-for-media-stream")
        .arg("--autoplay-policy=no-user-gesture-required")
        .build()
        .map_err(|e| Error::Browser(format!("browser config: {e}")))?;

    let (browser, mut handler) = Browser::launch(config)
        .await
        .map_err(|e| Error::Browser(format!("browser launch failed: {e}")))?;

    tokio::spawn(async move {
        while handler.next().await.is_some() {}
    });

    let page = browser
        .new_page(meeting_url)
        .await
        .map_err(|e| Error::Browser(format!("cannot open meeting page: {e}")))?;
    page.wait_for_navigation()
        .await
        .map_err(|e| Error::Browser(format!("meeting page navigation failed: {e}")))?;

    tracing::info!(meeting_url, "meeting browser ready");
    Ok((browser, page))
}

/// Production bridge over the Chrome DevTools Protocol.
pub struct CdpBridge {
    page: Page,
}

impl CdpBridge {
    /// Install the binding and page helpers, returning the bridge and
    /// the inbound event stream.
    ///
    /// # Errors
    ///
    /// Returns error if the binding or helper script cannot be
    /// installed.
    pub async fn attach(page: Page) -> Result<(Self, mpsc::Receiver<BridgeEvent>)> {
        let binding = AddBindingParams::builder()
            .name(HOST_BINDING)
            .build()
            .map_err(Error::Browser)?;
        page.execute(binding)
            .await
            .map_err(|e| Error::Browser(format!("addBinding failed: {e}")))?;

        let helpers = AddScriptToEvaluateOnNewDocumentParams::builder()
            .source(PAGE_HELPERS_JS)
            .build()
            .map_err(Error::Browser)?;
        page.execute(helpers)
            .await
            .map_err(|e| Error::Browser(format!("helper install failed: {e}")))?;
        // The page may already be loaded; install helpers there too
        page.evaluate(PAGE_HELPERS_JS)
            .await
            .map_err(|e| Error::Browser(format!("helper eval failed: {e}")))?;

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let mut events = page
            .event_listener::<EventBindingCalled>()
            .await
            .map_err(|e| Error::Browser(format!("event listener failed: {e}")))?;

        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if event.name != HOST_BINDING {
                    continue;
                }
                match serde_json::from_str::<WireEvent>(&event.payload) {
                    Ok(WireEvent::PlaybackComplete { message_id }) => {
                        let _ = tx.send(BridgeEvent::PlaybackComplete { message_id }).await;
                    }
                    Ok(WireEvent::SessionUidUpdate { uid }) => {
                        let _ = tx.send(BridgeEvent::SessionUidUpdate { uid }).await;
                    }
                    Err(e) => {
                        tracing::warn!(payload = %event.payload, error = %e, "bad bridge payload");
                    }
                }
            }
            tracing::debug!("bridge event stream closed");
        });

        Ok((Self { page }, rx))
    }
}

#[async_trait]
impl PlaybackBridge for CdpBridge {
    async fn play_audio(&self, audio: &[u8], message_id: &str) -> Result<()> {
        let b64 = base64::engine::general_purpose::STANDARD.encode(audio);
        let id_literal = serde_json::to_string(message_id)?;
        let call = format!("window.__raven.playAudio(\"{b64}\", {id_literal})");

        self.page
            .evaluate(call)
            .await
            .map_err(|e| Error::Browser(format!("playAudio failed: {e}")))?;
        Ok(())
    }

    async fn set_mic_muted(&self, muted: bool) -> Result<()> {
        self.page
            .evaluate(format!("window.__raven.setMicMuted({muted})"))
            .await
            .map_err(|e| Error::Browser(format!("setMicMuted failed: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_events_parse_both_kinds() {
        let complete: WireEvent =
            serde_json::from_str(r#"{"kind":"playback_complete","message_id":"R1"}"#).unwrap();
        assert!(matches!(
            complete,
            WireEvent::PlaybackComplete { message_id } if message_id == "R1"
        ));

        let update: WireEvent =
            serde_json::from_str(r#"{"kind":"session_uid_update","uid":"S1"}"#).unwrap();
        assert!(matches!(update, WireEvent::SessionUidUpdate { uid } if uid == "S1"));
    }

    #[test]
    fn unknown_kind_is_rejected() {
        assert!(serde_json::from_str::<WireEvent>(r#"{"kind":"reboot"}"#).is_err());
    }
}
