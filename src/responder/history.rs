//! Per-session conversation history
//!
//! A bounded ring of (question, response) turns per session uid, held
//! in process memory. History does not survive a responder restart.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Sessions idle this long are dropped during cleanup.
const SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Session count that triggers opportunistic cleanup.
const CLEANUP_THRESHOLD: usize = 1024;

/// One remembered exchange.
#[derive(Debug, Clone)]
pub struct ConversationTurn {
    pub timestamp: String,
    pub question: String,
    pub response: String,
}

#[derive(Debug)]
struct SessionHistory {
    turns: VecDeque<ConversationTurn>,
    last_activity: Instant,
}

/// Bounded per-session conversation memory.
#[derive(Debug)]
pub struct ConversationHistory {
    max_turns: usize,
    sessions: Mutex<HashMap<String, SessionHistory>>,
}

impl ConversationHistory {
    #[must_use]
    pub fn new(max_turns: usize) -> Self {
        Self {
            max_turns,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Record a completed exchange for the session.
    pub fn record(&self, session_uid: &str, question: &str, response: &str) {
        let turn = ConversationTurn {
            timestamp: chrono::Utc::now().to_rfc3339(),
            question: question.to_string(),
            response: response.to_string(),
        };

        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());

        if sessions.len() >= CLEANUP_THRESHOLD {
            sessions.retain(|_, s| s.last_activity.elapsed() < SESSION_TTL);
        }

        let session = sessions
            .entry(session_uid.to_string())
            .or_insert_with(|| SessionHistory {
                turns: VecDeque::with_capacity(self.max_turns),
                last_activity: Instant::now(),
            });

        session.turns.push_back(turn);
        while session.turns.len() > self.max_turns {
            session.turns.pop_front();
        }
        session.last_activity = Instant::now();
    }

    /// The most recent `count` turns, oldest first.
    #[must_use]
    pub fn recent(&self, session_uid: &str, count: usize) -> Vec<ConversationTurn> {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.get(session_uid).map_or_else(Vec::new, |s| {
            s.turns
                .iter()
                .rev()
                .take(count)
                .rev()
                .cloned()
                .collect()
        })
    }

    /// Number of turns remembered for the session.
    #[must_use]
    pub fn len(&self, session_uid: &str) -> usize {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.get(session_uid).map_or(0, |s| s.turns.len())
    }

    #[must_use]
    pub fn is_empty(&self, session_uid: &str) -> bool {
        self.len(session_uid) == 0
    }
}
