//! Session identity binding and audio admission
//!
//! The bot is dispatched with a manager-assigned connection id; the
//! recognizer session uid is only learned at runtime, when the
//! in-browser recognizer client opens its WebSocket and reports the
//! server-assigned identifier through the bridge.

use std::sync::RwLock;

/// Outcome of gating one audio record against the bot's identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// Session uid matches the bot's recognizer session
    Match,
    /// Fell back to the connection id; logged as degraded
    DegradedMatch,
    /// Neither id space matched; the record is dropped
    Mismatch {
        /// The bot's current recognizer session, if learned yet
        bot_session_uid: Option<String>,
    },
}

/// The bot's identity across the three id spaces it straddles.
#[derive(Debug)]
pub struct SessionBinding {
    connection_id: String,
    meeting_id: String,
    recognizer_session_uid: RwLock<Option<String>>,
}

impl SessionBinding {
    #[must_use]
    pub fn new(connection_id: impl Into<String>, meeting_id: impl Into<String>) -> Self {
        Self {
            connection_id: connection_id.into(),
            meeting_id: meeting_id.into(),
            recognizer_session_uid: RwLock::new(None),
        }
    }

    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    #[must_use]
    pub fn meeting_id(&self) -> &str {
        &self.meeting_id
    }

    /// The recognizer session uid, once learned.
    #[must_use]
    pub fn session_uid(&self) -> Option<String> {
        self.recognizer_session_uid
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Record the recognizer session uid reported by the browser.
    pub fn update_session_uid(&self, uid: impl Into<String>) {
        let uid = uid.into();
        let mut slot = self
            .recognizer_session_uid
            .write()
            .unwrap_or_else(|e| e.into_inner());
        if slot.as_deref() != Some(uid.as_str()) {
            tracing::info!(
                connection_id = %self.connection_id,
                session_uid = %uid,
                previous = ?slot,
                "recognizer session uid updated"
            );
            *slot = Some(uid);
        }
    }

    /// Admit an audio record iff its session uid matches the bot's
    /// recognizer session; a connection-id match is allowed as a
    /// degraded backward-compatibility path.
    #[must_use]
    pub fn gate(&self, audio_session_uid: &str) -> GateDecision {
        let bot_session = self.session_uid();

        if bot_session.as_deref() == Some(audio_session_uid) {
            return GateDecision::Match;
        }
        if audio_session_uid == self.connection_id {
            return GateDecision::DegradedMatch;
        }

        GateDecision::Mismatch {
            bot_session_uid: bot_session,
        }
    }
}
